//! Provider adapter contracts + per-jurisdiction source implementations.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use permx_core::normalize::{attr_date, attr_str, encode_identifier, extract_case_numbers, value_to_cell};
use permx_core::{CanonicalPermit, DatePolicy, Jurisdiction};
use permx_storage::{FetchError, HttpFetcher, RequestProfile, SnapshotError, SnapshotStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub mod enrich;

pub use enrich::{
    ApiDetailEnricher, DetailEnricher, DetailMode, HttpPageRenderer, PageDetailEnricher, PageLayout,
    PageRenderer, TableStrategy,
};

pub const CRATE_NAME: &str = "permx-adapters";

pub const DEFAULT_DETAIL_TEMPLATE: &str = "https://permitsearch.mybuildingpermit.com/PermitDetails/{permit}/{city}";
pub const DEFAULT_PAGE_SIZE: usize = 2000;
pub const DEFAULT_MAX_PAGES: usize = 500;

const BELLEVUE_SERVICE_URL: &str = "https://gis-web.bellevuewa.gov/gisext/rest/services/Enterprise/Permits/MapServer";
const BOTHELL_LAYER_URL: &str =
    "https://services1.arcgis.com/yWC3RwGqrp7oLKhO/arcgis/rest/services/PW_CD_CombinedProjects_view/FeatureServer/33/query";
const KIRKLAND_FEED_URL: &str = "https://kirklandactivitymap.connect.socrata.com/api/tickets/details.json?categories=5:886,893-894,896,898,900,905-907,909,911-912,914-917%7C6:852-857,864-866,869,877,883-885%7C8:918-919&lat1=47.72995711800415&lat2=47.681241110257716&lng1=-122.06381086885607&lng2=-122.3085188430582&search_field=&search_value=&shape_group_id=2xwv-rz4w&shape_ids=&statusFilter=&zoom=12";
const BURIEN_SNAPSHOT_FILE: &str = "BurienPermit.json";
const BURIEN_REFRESH_URL: &str = "https://gis.burienwa.gov/server/rest/services/cwpll/cwpll_caseactivity/MapServer/1/query";

/// Inclusive epoch-ms window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl DateWindow {
    pub fn contains(&self, ms: i64) -> bool {
        self.start_ms <= ms && ms <= self.end_ms
    }
}

/// Where a jurisdiction's raw records come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Every layer of an ArcGIS MapServer, enumerated through `?f=pjson`.
    ArcgisService { url: String },
    /// A single ArcGIS layer `query` endpoint.
    ArcgisLayer {
        url: String,
        #[serde(default)]
        window_field: Option<String>,
    },
    /// One JSON document with records under `api_data.records`.
    TicketFeed { url: String },
    /// A flat JSON array in the downloads directory.
    Snapshot {
        file: String,
        #[serde(default)]
        refresh_url: Option<String>,
    },
    /// Offline fallback: a fixed list of permit numbers.
    StaticList { permits: Vec<String> },
}

impl SourceSpec {
    pub fn default_for(jurisdiction: Jurisdiction) -> Self {
        match jurisdiction {
            Jurisdiction::Bellevue => SourceSpec::ArcgisService {
                url: BELLEVUE_SERVICE_URL.to_string(),
            },
            Jurisdiction::Bothell => SourceSpec::ArcgisLayer {
                url: BOTHELL_LAYER_URL.to_string(),
                window_field: None,
            },
            Jurisdiction::Kirkland => SourceSpec::TicketFeed {
                url: KIRKLAND_FEED_URL.to_string(),
            },
            Jurisdiction::Burien => SourceSpec::Snapshot {
                file: BURIEN_SNAPSHOT_FILE.to_string(),
                refresh_url: Some(BURIEN_REFRESH_URL.to_string()),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceSpec::ArcgisService { .. } => "arcgis_service",
            SourceSpec::ArcgisLayer { .. } => "arcgis_layer",
            SourceSpec::TicketFeed { .. } => "ticket_feed",
            SourceSpec::Snapshot { .. } => "snapshot",
            SourceSpec::StaticList { .. } => "static_list",
        }
    }
}

/// A provider record with any `{ "attributes": ... }` wrapper removed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub source_layer: String,
    pub attributes: JsonValue,
}

impl RawRecord {
    pub fn from_value(value: JsonValue, source_layer: &str) -> Self {
        let attributes = match value {
            JsonValue::Object(mut map) if map.get("attributes").is_some_and(JsonValue::is_object) => {
                map.remove("attributes").unwrap_or(JsonValue::Null)
            }
            other => other,
        };
        Self {
            source_layer: source_layer.to_string(),
            attributes,
        }
    }

    /// Shape written to snapshot files, matching what ArcGIS returns.
    pub fn to_snapshot_value(&self) -> JsonValue {
        json!({ "attributes": self.attributes })
    }
}

#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub http: HttpFetcher,
    pub snapshots: SnapshotStore,
    pub window: Option<DateWindow>,
    pub profile: RequestProfile,
    pub page_size: usize,
    pub max_pages: usize,
}

impl ProviderContext {
    pub fn new(http: HttpFetcher, snapshots: SnapshotStore) -> Self {
        Self {
            http,
            snapshots,
            window: None,
            profile: RequestProfile::provider(),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_window(mut self, window: Option<DateWindow>) -> Self {
        self.window = window;
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{jurisdiction} provider unavailable: {reason}")]
    Unavailable { jurisdiction: Jurisdiction, reason: String },
    #[error("no {jurisdiction} snapshot at {}; refresh the snapshot first", path.display())]
    NoSnapshot { jurisdiction: Jurisdiction, path: PathBuf },
}

impl ProviderError {
    fn unavailable(jurisdiction: Jurisdiction, reason: impl ToString) -> Self {
        ProviderError::Unavailable {
            jurisdiction,
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn jurisdiction(&self) -> Jurisdiction;
    fn source(&self) -> &SourceSpec;

    fn date_policy(&self) -> DatePolicy {
        match self.source() {
            SourceSpec::StaticList { .. } => DatePolicy::CityMatchOnly,
            _ => self.jurisdiction().date_policy(),
        }
    }

    async fn fetch_raw(&self, ctx: &ProviderContext) -> Result<Vec<RawRecord>, ProviderError>;

    /// Maps raw records to canonical permits. Never fails; absent fields stay empty.
    fn normalize(&self, raw: &[RawRecord]) -> Vec<CanonicalPermit>;

    fn detail_url(&self, permit: &CanonicalPermit) -> String;

    /// Whether permits the provider left without a detail URL get one from
    /// `detail_url`.
    fn fills_missing_detail_urls(&self) -> bool {
        true
    }
}

/// The single adapter type: behaviour is selected by jurisdiction (mapping)
/// and source kind (fetch).
#[derive(Debug, Clone)]
pub struct JurisdictionAdapter {
    jurisdiction: Jurisdiction,
    source: SourceSpec,
    detail_template: String,
}

impl JurisdictionAdapter {
    pub fn new(jurisdiction: Jurisdiction, source: SourceSpec) -> Self {
        Self {
            jurisdiction,
            source,
            detail_template: DEFAULT_DETAIL_TEMPLATE.to_string(),
        }
    }

    pub fn with_detail_template(mut self, template: impl Into<String>) -> Self {
        self.detail_template = template.into();
        self
    }

    pub fn snapshot_file(&self) -> Option<&str> {
        match &self.source {
            SourceSpec::Snapshot { file, .. } => Some(file),
            _ => None,
        }
    }

    /// Pulls a fresh copy of a snapshot source from its upstream layer.
    pub async fn fetch_refresh_records(&self, ctx: &ProviderContext) -> Result<Vec<RawRecord>, ProviderError> {
        match &self.source {
            SourceSpec::Snapshot {
                refresh_url: Some(url),
                ..
            } => page_arcgis_layer(self.jurisdiction, ctx, url, "1=1", "").await,
            SourceSpec::Snapshot { refresh_url: None, .. } => Err(ProviderError::unavailable(
                self.jurisdiction,
                "snapshot source has no refresh_url configured",
            )),
            _ => Err(ProviderError::unavailable(
                self.jurisdiction,
                format!("{} sources are fetched live and have no snapshot", self.source.kind()),
            )),
        }
    }
}

#[async_trait]
impl ProviderAdapter for JurisdictionAdapter {
    fn jurisdiction(&self) -> Jurisdiction {
        self.jurisdiction
    }

    fn source(&self) -> &SourceSpec {
        &self.source
    }

    async fn fetch_raw(&self, ctx: &ProviderContext) -> Result<Vec<RawRecord>, ProviderError> {
        let j = self.jurisdiction;
        match &self.source {
            SourceSpec::ArcgisService { url } => fetch_arcgis_service(j, ctx, url).await,
            SourceSpec::ArcgisLayer { url, window_field } => {
                let where_clause = match (window_field, ctx.window) {
                    (Some(field), Some(window)) => window_where_clause(field, window),
                    _ => "1=1".to_string(),
                };
                page_arcgis_layer(j, ctx, url, &where_clause, "").await
            }
            SourceSpec::TicketFeed { url } => fetch_ticket_feed(j, ctx, url).await,
            SourceSpec::Snapshot { file, .. } => match ctx.snapshots.load(file).await {
                Ok(values) => Ok(values
                    .into_iter()
                    .map(|v| RawRecord::from_value(v, file))
                    .collect()),
                Err(SnapshotError::Missing { path }) => Err(ProviderError::NoSnapshot { jurisdiction: j, path }),
                Err(err) => Err(ProviderError::unavailable(j, err)),
            },
            SourceSpec::StaticList { permits } => Ok(permits
                .iter()
                .map(|p| RawRecord {
                    source_layer: "static_list".to_string(),
                    attributes: json!({ "PermitNumber": p }),
                })
                .collect()),
        }
    }

    fn normalize(&self, raw: &[RawRecord]) -> Vec<CanonicalPermit> {
        if let SourceSpec::StaticList { .. } = self.source {
            return raw
                .iter()
                .map(|r| {
                    let mut permit = CanonicalPermit::new(self.jurisdiction, attr_str(&r.attributes, &["PermitNumber"]));
                    permit.city = self.jurisdiction.display_name().to_string();
                    permit.source_layer = r.source_layer.clone();
                    permit
                })
                .collect();
        }
        raw.iter()
            .flat_map(|record| map_record(self.jurisdiction, record))
            .collect()
    }

    fn detail_url(&self, permit: &CanonicalPermit) -> String {
        self.detail_template
            .replace("{permit}", &encode_identifier(&permit.permit_number))
            .replace("{city}", self.jurisdiction.display_name())
    }

    /// Ticket feeds link their own detail pages; a ticket without one has none.
    fn fills_missing_detail_urls(&self) -> bool {
        !matches!(self.source, SourceSpec::TicketFeed { .. })
    }
}

/// Fetch, map, and fill in detail URLs the provider did not supply.
pub async fn fetch_provider_records(
    adapter: &dyn ProviderAdapter,
    ctx: &ProviderContext,
) -> Result<Vec<CanonicalPermit>, ProviderError> {
    let span = info_span!("fetch_provider_records", jurisdiction = %adapter.jurisdiction(), source = adapter.source().kind());
    async {
        let raw = adapter.fetch_raw(ctx).await?;
        let mut permits = adapter.normalize(&raw);
        if adapter.fills_missing_detail_urls() {
            for permit in &mut permits {
                if permit.detail_url.is_empty() && !permit.permit_number.is_empty() {
                    permit.detail_url = adapter.detail_url(permit);
                }
            }
        }
        info!(raw = raw.len(), permits = permits.len(), "provider records normalized");
        Ok(permits)
    }
    .instrument(span)
    .await
}

/// Per-jurisdiction attribute mapping. One raw record may yield several
/// permits (Bothell packs multiple case numbers into one field).
pub fn map_record(jurisdiction: Jurisdiction, record: &RawRecord) -> Vec<CanonicalPermit> {
    let a = &record.attributes;
    match jurisdiction {
        Jurisdiction::Bellevue => {
            let permit_number = {
                let primary = attr_str(a, &["PERMITNUMBER"]);
                if primary.chars().count() >= 5 {
                    primary
                } else {
                    attr_str(a, &["CaseNumber"])
                }
            };
            let mut p = CanonicalPermit::new(jurisdiction, permit_number);
            p.city = attr_str(a, &["CITY"]);
            p.status = attr_str(a, &["PERMITSTATUS"]);
            p.category = attr_str(a, &["PermitCategory"]);
            p.permit_type = attr_str(a, &["PERMITTYPE", "PERMITTYPECODE"]);
            p.address = attr_str(a, &["SITEADDRESS", "ADDRESS"]);
            p.parcel = attr_str(a, &["PARCELNUMBER", "SiteParcelNumber"]);
            p.applied_date = attr_date(a, &["APPLIEDDATE"]);
            p.issued_date = attr_date(a, &["ISSUEDDATE"]);
            p.detail_url = attr_str(a, &["DETAIL_PAGE_URL", "MBPSTATUSSITE", "moreinfo"]);
            p.source_layer = record.source_layer.clone();
            vec![p]
        }
        Jurisdiction::Bothell => {
            let raw_cases = attr_str(a, &["CaseNumber"]);
            let city = {
                let c = attr_str(a, &["City", "CITY"]);
                if c.is_empty() {
                    jurisdiction.display_name().to_string()
                } else {
                    c
                }
            };
            extract_case_numbers(&raw_cases)
                .into_iter()
                .map(|case| {
                    let mut p = CanonicalPermit::new(jurisdiction, case);
                    p.city = city.clone();
                    p.status = attr_str(a, &["Status"]);
                    p.category = attr_str(a, &["ProjectType"]);
                    p.super_category = attr_str(a, &["ProjectName"]);
                    p.address = attr_str(a, &["Address"]);
                    p.parcel = attr_str(a, &["ParcelNumber"]);
                    p.applied_date = attr_date(a, &["AppliedDate"]);
                    p.issued_date = attr_date(a, &["IssuedDate"]);
                    p.source_layer = record.source_layer.clone();
                    p
                })
                .collect()
        }
        Jurisdiction::Kirkland => {
            let mut p = CanonicalPermit::new(jurisdiction, attr_str(a, &["ticket_id"]));
            p.city = jurisdiction.display_name().to_string();
            p.status = attr_str(a, &["ticket_status"]);
            p.category = attr_str(a, &["category"]);
            p.super_category = attr_str(a, &["super_category"]);
            p.permit_type = p.category.clone();
            p.address = attr_str(a, &["ticket_detail_entry7"]);
            p.applied_date = attr_date(a, &["ticket_created_at"]);
            p.detail_url = attr_str(a, &["ticket_detail_entry8"]);
            p.source_layer = record.source_layer.clone();
            vec![p]
        }
        Jurisdiction::Burien => {
            let mut p = CanonicalPermit::new(jurisdiction, attr_str(a, &["CaseNumber"]));
            p.city = jurisdiction.display_name().to_string();
            p.status = attr_str(a, &["CaseStatus"]);
            p.category = attr_str(a, &["CaseType"]);
            p.super_category = attr_str(a, &["Description"]);
            p.permit_type = p.category.clone();
            p.address = attr_str(a, &["CaseAddress"]);
            p.parcel = attr_str(a, &["SiteParcelNumber"]);
            p.applied_date = attr_date(a, &["AppliedDate"]);
            p.issued_date = attr_date(a, &["IssuedDate"]);
            p.source_layer = record.source_layer.clone();
            vec![p]
        }
    }
}

/// ArcGIS `where` clause selecting `field` within the window.
pub fn window_where_clause(field: &str, window: DateWindow) -> String {
    let fmt = |ms: i64| {
        Utc.timestamp_millis_opt(ms)
            .single()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "1970-01-01 00:00:00".to_string())
    };
    format!(
        "{field} >= TIMESTAMP '{}' AND {field} <= TIMESTAMP '{}'",
        fmt(window.start_ms),
        fmt(window.end_ms)
    )
}

fn arcgis_page_check(body: &JsonValue) -> Result<(), String> {
    if let Some(err) = body.get("error") {
        return Err(format!("arcgis error: {}", value_to_cell(err)));
    }
    if !body.get("features").is_some_and(JsonValue::is_array) {
        return Err("response has no features array".to_string());
    }
    Ok(())
}

fn require_body(jurisdiction: Jurisdiction, url: &str, result: Result<Option<JsonValue>, FetchError>) -> Result<JsonValue, ProviderError> {
    match result {
        Ok(Some(body)) => Ok(body),
        Ok(None) => Err(ProviderError::unavailable(jurisdiction, format!("{url} returned 404"))),
        Err(err) => Err(ProviderError::unavailable(jurisdiction, err)),
    }
}

/// Pages one layer until an empty page comes back.
pub async fn page_arcgis_layer(
    jurisdiction: Jurisdiction,
    ctx: &ProviderContext,
    query_url: &str,
    where_clause: &str,
    layer_name: &str,
) -> Result<Vec<RawRecord>, ProviderError> {
    let mut records = Vec::new();
    for page in 0..ctx.max_pages {
        // Servers cap pages at their own maxRecordCount, so advance by what arrived.
        let offset = records.len();
        let query = [
            ("where", where_clause.to_string()),
            ("outFields", "*".to_string()),
            ("f", "json".to_string()),
            ("returnGeometry", "false".to_string()),
            ("resultOffset", offset.to_string()),
            ("resultRecordCount", ctx.page_size.to_string()),
        ];
        let result = ctx
            .http
            .fetch_json_checked(query_url, &query, &ctx.profile, arcgis_page_check)
            .await;
        let mut body = require_body(jurisdiction, query_url, result)?;
        let features = match body.get_mut("features").map(JsonValue::take) {
            Some(JsonValue::Array(features)) => features,
            _ => Vec::new(),
        };
        if features.is_empty() {
            debug!(layer = layer_name, pages = page, records = records.len(), "layer exhausted");
            return Ok(records);
        }
        records.extend(features.into_iter().map(|f| RawRecord::from_value(f, layer_name)));
    }
    Err(ProviderError::unavailable(
        jurisdiction,
        format!("{query_url} still returning rows after {} pages", ctx.max_pages),
    ))
}

async fn fetch_arcgis_service(
    jurisdiction: Jurisdiction,
    ctx: &ProviderContext,
    service_url: &str,
) -> Result<Vec<RawRecord>, ProviderError> {
    let service_url = service_url.trim_end_matches('/');
    let result = ctx
        .http
        .fetch_json_checked(service_url, &[("f", "pjson".to_string())], &ctx.profile, |body| {
            if body.get("layers").is_some_and(JsonValue::is_array) {
                Ok(())
            } else {
                Err("service description has no layers".to_string())
            }
        })
        .await;
    let info = require_body(jurisdiction, service_url, result)?;
    let layers: Vec<(i64, String)> = info
        .get("layers")
        .and_then(JsonValue::as_array)
        .map(|layers| {
            layers
                .iter()
                .filter_map(|l| Some((l.get("id")?.as_i64()?, attr_str(l, &["name"]))))
                .collect()
        })
        .unwrap_or_default();

    let mut records = Vec::new();
    let mut failed = 0usize;
    for (id, name) in &layers {
        let query_url = format!("{service_url}/{id}/query");
        match page_arcgis_layer(jurisdiction, ctx, &query_url, "1=1", name).await {
            Ok(mut layer_records) => {
                debug!(layer = %name, records = layer_records.len(), "layer fetched");
                records.append(&mut layer_records);
            }
            Err(err) => {
                warn!(layer = %name, error = %err, "layer fetch failed; skipping");
                failed += 1;
            }
        }
    }
    if !layers.is_empty() && failed == layers.len() {
        return Err(ProviderError::unavailable(
            jurisdiction,
            format!("all {failed} layers of {service_url} failed"),
        ));
    }
    Ok(records)
}

async fn fetch_ticket_feed(
    jurisdiction: Jurisdiction,
    ctx: &ProviderContext,
    url: &str,
) -> Result<Vec<RawRecord>, ProviderError> {
    let result = ctx
        .http
        .fetch_json_checked(url, &[], &ctx.profile, |body| {
            if body.pointer("/api_data/records").is_some_and(JsonValue::is_array) {
                Ok(())
            } else {
                Err("feed has no api_data.records array".to_string())
            }
        })
        .await;
    let mut body = require_body(jurisdiction, url, result)?;
    let records = match body.pointer_mut("/api_data/records").map(JsonValue::take) {
        Some(JsonValue::Array(records)) => records,
        _ => Vec::new(),
    };
    Ok(records
        .into_iter()
        .map(|r| RawRecord::from_value(r, "tickets"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::extract::{Query, State};
    use axum::{routing::get, Json, Router};
    use permx_storage::{BackoffPolicy, HttpClientConfig};
    use tempfile::tempdir;

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_ctx(root: &std::path::Path) -> ProviderContext {
        let mut ctx = ProviderContext::new(
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
            SnapshotStore::new(root),
        );
        ctx.profile = RequestProfile {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            },
        };
        ctx.page_size = 2;
        ctx
    }

    fn record(attrs: JsonValue) -> RawRecord {
        RawRecord::from_value(json!({ "attributes": attrs }), "layer")
    }

    #[test]
    fn unwraps_attribute_envelopes() {
        let wrapped = RawRecord::from_value(json!({"attributes": {"CaseNumber": "PLN24-0001"}, "geometry": null}), "x");
        assert_eq!(wrapped.attributes, json!({"CaseNumber": "PLN24-0001"}));
        let bare = RawRecord::from_value(json!({"ticket_id": 7}), "x");
        assert_eq!(bare.attributes, json!({"ticket_id": 7}));
        assert_eq!(wrapped.to_snapshot_value(), json!({"attributes": {"CaseNumber": "PLN24-0001"}}));
    }

    #[test]
    fn bellevue_mapping_falls_back_on_short_permit_numbers() {
        let permits = map_record(
            Jurisdiction::Bellevue,
            &record(json!({
                "PERMITNUMBER": " 24 ",
                "CaseNumber": "24-123456-BE",
                "CITY": "BELLEVUE",
                "PERMITTYPECODE": "BE",
                "ADDRESS": "450 110TH AVE NE",
                "APPLIEDDATE": 1710460800000i64,
                "ISSUEDDATE": null,
                "MBPSTATUSSITE": "https://example.test/detail"
            })),
        );
        assert_eq!(permits.len(), 1);
        let p = &permits[0];
        assert_eq!(p.permit_number, "24-123456-BE");
        assert_eq!(p.permit_type, "BE");
        assert_eq!(p.address, "450 110TH AVE NE");
        assert_eq!(p.applied_date, 1_710_460_800_000);
        assert_eq!(p.issued_date, 0);
        assert_eq!(p.detail_url, "https://example.test/detail");
        assert_eq!(p.source_layer, "layer");
    }

    #[test]
    fn bothell_case_numbers_are_exploded() {
        let permits = map_record(
            Jurisdiction::Bothell,
            &record(json!({
                "CaseNumber": "BLD2024-0101, PLN2024-0007 (ENG2024-12); n/a; BLD2024-0101",
                "ProjectName": "Canyon Park Lofts",
                "Status": "In Review"
            })),
        );
        let numbers: Vec<_> = permits.iter().map(|p| p.permit_number.as_str()).collect();
        assert_eq!(numbers, vec!["BLD2024-0101", "PLN2024-0007", "ENG2024-12"]);
        assert!(permits.iter().all(|p| p.city == "Bothell"));
        assert!(permits.iter().all(|p| p.super_category == "Canyon Park Lofts"));
    }

    #[test]
    fn kirkland_and_burien_mappings() {
        let k = map_record(
            Jurisdiction::Kirkland,
            &record(json!({
                "ticket_id": 88123,
                "ticket_status": "Open",
                "category": "Tree Removal",
                "super_category": "Permits",
                "ticket_detail_entry7": "123 Market St",
                "ticket_created_at": "2024-03-15T10:00:00Z",
                "ticket_detail_entry8": "https://example.test/k/88123"
            })),
        );
        assert_eq!(k[0].permit_number, "88123");
        assert_eq!(k[0].permit_type, "Tree Removal");
        assert_eq!(k[0].applied_date, 1_710_496_800_000);

        let b = map_record(
            Jurisdiction::Burien,
            &record(json!({
                "CaseNumber": "PLN24-0042",
                "CaseStatus": "Issued",
                "CaseType": "Building",
                "AppliedDate": "03/15/2024",
                "SiteParcelNumber": "0123456789"
            })),
        );
        assert_eq!(b[0].permit_number, "PLN24-0042");
        assert_eq!(b[0].status, "Issued");
        assert_eq!(b[0].applied_date, 1_710_460_800_000);
        assert_eq!(b[0].parcel, "0123456789");
        assert_eq!(b[0].city, "Burien");
        assert!(b[0].detail_url.is_empty());
    }

    #[test]
    fn detail_url_template_encodes_permit_number() {
        let adapter = JurisdictionAdapter::new(Jurisdiction::Burien, SourceSpec::default_for(Jurisdiction::Burien));
        let permit = CanonicalPermit::new(Jurisdiction::Burien, "PLN24 0042/A");
        assert_eq!(
            adapter.detail_url(&permit),
            "https://permitsearch.mybuildingpermit.com/PermitDetails/PLN24%200042%2FA/Burien"
        );
    }

    #[test]
    fn where_clause_covers_the_window() {
        let clause = window_where_clause(
            "AppliedDate",
            DateWindow {
                start_ms: 1_704_067_200_000,
                end_ms: 1_735_689_599_999,
            },
        );
        assert_eq!(
            clause,
            "AppliedDate >= TIMESTAMP '2024-01-01 00:00:00' AND AppliedDate <= TIMESTAMP '2024-12-31 23:59:59'"
        );
    }

    #[tokio::test]
    async fn missing_snapshot_is_no_snapshot() {
        let dir = tempdir().unwrap();
        let adapter = JurisdictionAdapter::new(Jurisdiction::Burien, SourceSpec::default_for(Jurisdiction::Burien));
        let err = fetch_provider_records(&adapter, &test_ctx(dir.path())).await.unwrap_err();
        assert!(matches!(err, ProviderError::NoSnapshot { .. }));
    }

    #[tokio::test]
    async fn snapshot_records_get_template_detail_urls() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("BurienPermit.json"),
            r#"[{"attributes": {"CaseNumber": "PLN24-0042", "AppliedDate": "03/15/2024"}}]"#,
        )
        .unwrap();
        let adapter = JurisdictionAdapter::new(Jurisdiction::Burien, SourceSpec::default_for(Jurisdiction::Burien));
        let permits = fetch_provider_records(&adapter, &test_ctx(dir.path())).await.unwrap();
        assert_eq!(permits.len(), 1);
        assert_eq!(
            permits[0].detail_url,
            "https://permitsearch.mybuildingpermit.com/PermitDetails/PLN24-0042/Burien"
        );
    }

    #[tokio::test]
    async fn static_list_is_city_match_only() {
        let dir = tempdir().unwrap();
        let adapter = JurisdictionAdapter::new(
            Jurisdiction::Kirkland,
            SourceSpec::StaticList {
                permits: vec!["BLD92-01219".into(), "ADU12-01212".into()],
            },
        );
        assert_eq!(adapter.date_policy(), DatePolicy::CityMatchOnly);
        let permits = fetch_provider_records(&adapter, &test_ctx(dir.path())).await.unwrap();
        assert_eq!(permits.len(), 2);
        assert_eq!(permits[1].permit_number, "ADU12-01212");
        assert_eq!(permits[0].city, "Kirkland");
    }

    async fn paged_layer(State(total): State<usize>, Query(q): Query<HashMap<String, String>>) -> Json<JsonValue> {
        let offset: usize = q.get("resultOffset").and_then(|v| v.parse().ok()).unwrap_or(0);
        let count: usize = q.get("resultRecordCount").and_then(|v| v.parse().ok()).unwrap_or(0);
        let features: Vec<JsonValue> = (offset..(offset + count).min(total))
            .map(|i| json!({"attributes": {"CaseNumber": format!("PLN24-{i:04}")}}))
            .collect();
        Json(json!({ "features": features }))
    }

    #[tokio::test]
    async fn layer_paging_accumulates_until_empty_page() {
        let router = Router::new().route("/layer/query", get(paged_layer)).with_state(5usize);
        let base = spawn_server(router).await;
        let dir = tempdir().unwrap();
        let adapter = JurisdictionAdapter::new(
            Jurisdiction::Burien,
            SourceSpec::ArcgisLayer {
                url: format!("{base}/layer/query"),
                window_field: None,
            },
        );
        let permits = fetch_provider_records(&adapter, &test_ctx(dir.path())).await.unwrap();
        assert_eq!(permits.len(), 5);
        assert_eq!(permits[4].permit_number, "PLN24-0004");
    }

    /// Honours `resultOffset` but never returns more than `cap` rows.
    async fn capped_layer(
        State((total, cap)): State<(usize, usize)>,
        Query(q): Query<HashMap<String, String>>,
    ) -> Json<JsonValue> {
        let offset: usize = q.get("resultOffset").and_then(|v| v.parse().ok()).unwrap_or(0);
        let features: Vec<JsonValue> = (offset..(offset + cap).min(total))
            .map(|i| json!({"attributes": {"CaseNumber": format!("PLN24-{i:04}")}}))
            .collect();
        Json(json!({ "features": features }))
    }

    #[tokio::test]
    async fn short_pages_advance_by_rows_received() {
        let router = Router::new()
            .route("/layer/query", get(capped_layer))
            .with_state((4usize, 1usize));
        let base = spawn_server(router).await;
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        assert_eq!(ctx.page_size, 2);
        let records = page_arcgis_layer(Jurisdiction::Burien, &ctx, &format!("{base}/layer/query"), "1=1", "")
            .await
            .unwrap();
        let numbers: Vec<_> = records
            .iter()
            .map(|r| attr_str(&r.attributes, &["CaseNumber"]))
            .collect();
        assert_eq!(numbers, vec!["PLN24-0000", "PLN24-0001", "PLN24-0002", "PLN24-0003"]);
    }

    #[tokio::test]
    async fn paging_past_max_pages_is_unavailable() {
        let router = Router::new().route("/layer/query", get(paged_layer)).with_state(100usize);
        let base = spawn_server(router).await;
        let dir = tempdir().unwrap();
        let mut ctx = test_ctx(dir.path());
        ctx.max_pages = 3;
        let err = page_arcgis_layer(Jurisdiction::Burien, &ctx, &format!("{base}/layer/query"), "1=1", "")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn arcgis_error_bodies_are_retried_then_unavailable() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/layer/query",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"error": {"code": 400, "message": "Invalid query"}}))
                }),
            )
            .with_state(hits.clone());
        let base = spawn_server(router).await;
        let dir = tempdir().unwrap();
        let adapter = JurisdictionAdapter::new(
            Jurisdiction::Bothell,
            SourceSpec::ArcgisLayer {
                url: format!("{base}/layer/query"),
                window_field: None,
            },
        );
        let err = fetch_provider_records(&adapter, &test_ctx(dir.path())).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { jurisdiction: Jurisdiction::Bothell, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn service_layers_are_enumerated_and_tagged() {
        let router = Router::new()
            .route(
                "/MapServer",
                get(|| async { Json(json!({"layers": [{"id": 0, "name": "Building"}, {"id": 1, "name": "Land Use"}]})) }),
            )
            .route(
                "/MapServer/{id}/query",
                get(
                    |axum::extract::Path(id): axum::extract::Path<u32>, Query(q): Query<HashMap<String, String>>| async move {
                        if q.get("resultOffset").map(String::as_str) != Some("0") {
                            return Json(json!({"features": []}));
                        }
                        Json(json!({"features": [{"attributes": {"PERMITNUMBER": format!("BLD24-0000{id}")}}]}))
                    },
                ),
            );
        let base = spawn_server(router).await;
        let dir = tempdir().unwrap();
        let adapter = JurisdictionAdapter::new(
            Jurisdiction::Bellevue,
            SourceSpec::ArcgisService {
                url: format!("{base}/MapServer"),
            },
        );
        let permits = fetch_provider_records(&adapter, &test_ctx(dir.path())).await.unwrap();
        let layers: Vec<_> = permits.iter().map(|p| p.source_layer.as_str()).collect();
        assert_eq!(layers, vec!["Building", "Land Use"]);
        assert_eq!(permits[1].permit_number, "BLD24-00001");
    }

    #[tokio::test]
    async fn ticket_feed_reads_nested_records() {
        let router = Router::new().route(
            "/tickets",
            get(|| async {
                Json(json!({"api_data": {"records": [
                    {"ticket_id": "T-1", "ticket_created_at": "2024-05-01"},
                    {"ticket_id": "T-2", "ticket_detail_entry8": "https://permits.example.test/T-2"}
                ]}}))
            }),
        );
        let base = spawn_server(router).await;
        let dir = tempdir().unwrap();
        let adapter = JurisdictionAdapter::new(
            Jurisdiction::Kirkland,
            SourceSpec::TicketFeed {
                url: format!("{base}/tickets"),
            },
        );
        let permits = fetch_provider_records(&adapter, &test_ctx(dir.path())).await.unwrap();
        assert_eq!(permits.len(), 2);
        assert_eq!(permits[0].permit_number, "T-1");
        assert_eq!(permits[0].applied_date, 1_714_521_600_000);
        // No feed-supplied page means no page; the permit template does not apply.
        assert!(permits[0].detail_url.is_empty());
        assert_eq!(permits[1].detail_url, "https://permits.example.test/T-2");
    }

    #[test]
    fn source_specs_deserialize_from_yaml_shape() {
        let spec: SourceSpec = serde_json::from_value(json!({"kind": "snapshot", "file": "BurienPermit.json"})).unwrap();
        assert_eq!(
            spec,
            SourceSpec::Snapshot {
                file: "BurienPermit.json".into(),
                refresh_url: None
            }
        );
        assert_eq!(spec.kind(), "snapshot");
    }
}
