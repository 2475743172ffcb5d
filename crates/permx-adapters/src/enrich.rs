//! Per-permit detail enrichment: JSON sub-resource mode and rendered-page mode.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use permx_core::normalize::{encode_identifier, strip_markup, value_to_cell};
use permx_core::{CanonicalPermit, DetailBundle, Jurisdiction, PermitRef, Row, SubTableKind};
use permx_storage::{FetchError, HttpFetcher, RequestProfile};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_DETAIL_API_BASE: &str = "https://permitsearch.mybuildingpermit.com/PermitDetails";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailMode {
    Api,
    Page,
}

impl DetailMode {
    pub fn default_for(jurisdiction: Jurisdiction) -> Self {
        match jurisdiction {
            Jurisdiction::Kirkland => DetailMode::Page,
            _ => DetailMode::Api,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error("detail page {url} not found")]
    NotFound { url: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Turns one permit into its detail bundle. Implementations contain every
/// failure: a broken permit comes back as `DetailBundle::failed`.
#[async_trait]
pub trait DetailEnricher: Send + Sync {
    async fn enrich(&self, permit: &CanonicalPermit) -> DetailBundle;
}

/// Numeric city id used by the permit-detail endpoints.
pub fn endpoint_id(jurisdiction: Jurisdiction) -> u32 {
    match jurisdiction {
        Jurisdiction::Bellevue => 1,
        Jurisdiction::Bothell => 2,
        Jurisdiction::Kirkland => 5,
        Jurisdiction::Burien => 11,
    }
}

enum TabOutcome {
    Rows(Vec<Row>),
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ApiDetailEnricher {
    http: HttpFetcher,
    base_url: String,
    endpoint_id: u32,
    profile: RequestProfile,
}

impl ApiDetailEnricher {
    pub fn new(http: HttpFetcher, jurisdiction: Jurisdiction) -> Self {
        Self {
            http,
            base_url: DEFAULT_DETAIL_API_BASE.to_string(),
            endpoint_id: endpoint_id(jurisdiction),
            profile: RequestProfile::sub_resource(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_profile(mut self, profile: RequestProfile) -> Self {
        self.profile = profile;
        self
    }

    fn tab_url(&self, kind: SubTableKind, permit: &CanonicalPermit) -> Option<String> {
        match kind {
            SubTableKind::RelatedPermits => {
                let parcel = permit.parcel.trim();
                if parcel.is_empty() {
                    return None;
                }
                Some(format!(
                    "{}/{}/{}/{}",
                    self.base_url,
                    kind.api_tab(),
                    self.endpoint_id,
                    encode_identifier(parcel)
                ))
            }
            _ => Some(format!(
                "{}/{}/{}/{}",
                self.base_url,
                kind.api_tab(),
                encode_identifier(&permit.permit_number),
                self.endpoint_id
            )),
        }
    }

    async fn fetch_tab(&self, kind: SubTableKind, permit: &CanonicalPermit) -> TabOutcome {
        let Some(url) = self.tab_url(kind, permit) else {
            return TabOutcome::Skipped;
        };
        match self.http.fetch_json(&url, &[], &self.profile).await {
            Ok(Some(payload)) => TabOutcome::Rows(rows_from_payload(payload)),
            Ok(None) => TabOutcome::Rows(Vec::new()),
            Err(err) => {
                debug!(permit = %permit.permit_number, tab = kind.api_tab(), error = %err, "sub-resource failed");
                TabOutcome::Failed(err.to_string())
            }
        }
    }
}

#[async_trait]
impl DetailEnricher for ApiDetailEnricher {
    async fn enrich(&self, permit: &CanonicalPermit) -> DetailBundle {
        let outcomes = join_all(
            SubTableKind::ALL
                .iter()
                .map(|&kind| async move { (kind, self.fetch_tab(kind, permit).await) }),
        )
        .await;

        let mut bundle = DetailBundle::empty(permit.permit_ref());
        let mut attempted = 0usize;
        let mut failures = Vec::new();
        for (kind, outcome) in outcomes {
            match outcome {
                TabOutcome::Rows(rows) => {
                    attempted += 1;
                    *bundle.table_mut(kind) = rows;
                }
                TabOutcome::Skipped => {}
                TabOutcome::Failed(reason) => {
                    attempted += 1;
                    failures.push(format!("{}: {reason}", kind.api_tab()));
                }
            }
        }
        if attempted > 0 && failures.len() == attempted {
            warn!(permit = %permit.permit_number, "every sub-resource failed");
            bundle.error = Some(format!("all sub-resources failed ({})", failures.join("; ")));
        }
        bundle
    }
}

/// Coerces a sub-resource payload to rows. A bare object is one row.
pub fn rows_from_payload(payload: JsonValue) -> Vec<Row> {
    match payload {
        JsonValue::Array(items) => items.iter().filter_map(row_from_item).collect(),
        other => row_from_item(&other).into_iter().collect(),
    }
}

fn row_from_item(item: &JsonValue) -> Option<Row> {
    match item {
        JsonValue::Null => None,
        JsonValue::Object(map) => Some(
            map.iter()
                .map(|(k, v)| (k.clone(), strip_markup(&value_to_cell(v))))
                .collect(),
        ),
        scalar => Some(Row::from_iter([("value", strip_markup(&value_to_cell(scalar)))])),
    }
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Returns the page's HTML once it has finished rendering.
    async fn render(&self, url: &str) -> Result<String, EnrichError>;
}

fn compile(css: &str) -> Result<Selector, EnrichError> {
    Selector::parse(css).map_err(|e| EnrichError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

/// Polls a detail page until the readiness selector shows up or the idle
/// budget runs out, then hands back whatever was last fetched.
#[derive(Debug, Clone)]
pub struct HttpPageRenderer {
    http: HttpFetcher,
    profile: RequestProfile,
    ready_selector: Option<Selector>,
    idle_budget: Duration,
    poll_interval: Duration,
}

impl HttpPageRenderer {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            profile: RequestProfile::page(),
            ready_selector: None,
            idle_budget: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_ready_selector(mut self, css: &str) -> Result<Self, EnrichError> {
        self.ready_selector = if css.trim().is_empty() { None } else { Some(compile(css)?) };
        Ok(self)
    }

    pub fn with_idle_wait(mut self, budget: Duration, poll_interval: Duration) -> Self {
        self.idle_budget = budget;
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_profile(mut self, profile: RequestProfile) -> Self {
        self.profile = profile;
        self
    }
}

fn page_is_ready(html: &str, ready: &Selector) -> bool {
    Html::parse_document(html).select(ready).next().is_some()
}

#[async_trait]
impl PageRenderer for HttpPageRenderer {
    async fn render(&self, url: &str) -> Result<String, EnrichError> {
        let started = Instant::now();
        loop {
            let html = self
                .http
                .fetch_text(url, &self.profile)
                .await?
                .ok_or_else(|| EnrichError::NotFound { url: url.to_string() })?;
            let Some(ready) = &self.ready_selector else {
                return Ok(html);
            };
            if page_is_ready(&html, ready) {
                return Ok(html);
            }
            if started.elapsed() >= self.idle_budget {
                debug!(url, "idle budget spent before page became ready");
                return Ok(html);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Table-rendering conventions, tried in order until one yields rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum TableStrategy {
    NativeTable { table: String },
    GridWidget { header: String, row: String, cell: String },
    ItemList { item: String, label: String, value: String },
}

impl TableStrategy {
    pub fn defaults() -> Vec<TableStrategy> {
        vec![
            TableStrategy::NativeTable {
                table: "table".to_string(),
            },
            TableStrategy::GridWidget {
                header: ".k-grid-header th, [role='columnheader']".to_string(),
                row: ".k-grid-content tr, .k-grid-content [role='row']".to_string(),
                cell: "td, [role='gridcell']".to_string(),
            },
            TableStrategy::ItemList {
                item: ".item, .list-group-item".to_string(),
                label: ".item-label, .label, dt".to_string(),
                value: ".item-value, .value, dd".to_string(),
            },
        ]
    }
}

/// Selector configuration for a rendered permit details page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageLayout {
    pub ready_selector: String,
    pub summary_left: String,
    pub summary_right: String,
    pub summary_cell: String,
    pub description: String,
    /// Section container selector; `{tab}` is replaced by the tab name.
    pub section: String,
    pub strategies: Vec<TableStrategy>,
}

impl Default for PageLayout {
    fn default() -> Self {
        Self {
            ready_selector: "#permitDetails, .permit-details".to_string(),
            summary_left: ".permit-summary .left tr, .permit-summary .col-left .row".to_string(),
            summary_right: ".permit-summary .right tr, .permit-summary .col-right .row".to_string(),
            summary_cell: "th, td, .label, .value".to_string(),
            description: ".permit-description, #Description".to_string(),
            section: "#{tab}, [data-tab='{tab}']".to_string(),
            strategies: TableStrategy::defaults(),
        }
    }
}

enum CompiledStrategy {
    NativeTable {
        table: Selector,
        head_cells: Selector,
        rows: Selector,
        header_cells: Selector,
        cells: Selector,
    },
    GridWidget {
        header: Selector,
        row: Selector,
        cell: Selector,
    },
    ItemList {
        item: Selector,
        label: Selector,
        value: Selector,
    },
}

impl CompiledStrategy {
    fn compile(strategy: &TableStrategy) -> Result<Self, EnrichError> {
        Ok(match strategy {
            TableStrategy::NativeTable { table } => CompiledStrategy::NativeTable {
                table: compile(table)?,
                head_cells: compile("thead th")?,
                rows: compile("tr")?,
                header_cells: compile("th")?,
                cells: compile("td")?,
            },
            TableStrategy::GridWidget { header, row, cell } => CompiledStrategy::GridWidget {
                header: compile(header)?,
                row: compile(row)?,
                cell: compile(cell)?,
            },
            TableStrategy::ItemList { item, label, value } => CompiledStrategy::ItemList {
                item: compile(item)?,
                label: compile(label)?,
                value: compile(value)?,
            },
        })
    }

    fn extract(&self, section: ElementRef<'_>) -> Vec<Row> {
        match self {
            CompiledStrategy::NativeTable {
                table,
                head_cells,
                rows,
                header_cells,
                cells,
            } => {
                for table in section.select(table) {
                    let mut headers: Vec<String> = table.select(head_cells).map(element_text).collect();
                    let mut out = Vec::new();
                    for tr in table.select(rows) {
                        let values: Vec<String> = tr.select(cells).map(element_text).collect();
                        if values.is_empty() {
                            if headers.is_empty() {
                                headers = tr.select(header_cells).map(element_text).collect();
                            }
                            continue;
                        }
                        if let Some(row) = row_from_cells(&headers, values) {
                            out.push(row);
                        }
                    }
                    if !out.is_empty() {
                        return out;
                    }
                }
                Vec::new()
            }
            CompiledStrategy::GridWidget { header, row, cell } => {
                let headers: Vec<String> = section.select(header).map(element_text).collect();
                section
                    .select(row)
                    .filter_map(|tr| row_from_cells(&headers, tr.select(cell).map(element_text).collect()))
                    .collect()
            }
            CompiledStrategy::ItemList { item, label, value } => section
                .select(item)
                .filter_map(|el| {
                    let labels: Vec<String> = el.select(label).map(|l| trim_label(&element_text(l))).collect();
                    if labels.is_empty() {
                        let text = element_text(el);
                        return (!text.is_empty()).then(|| Row::from_iter([("text", text)]));
                    }
                    let values: Vec<String> = el.select(value).map(element_text).collect();
                    let row: Row = labels
                        .into_iter()
                        .enumerate()
                        .map(|(i, l)| {
                            let key = if l.is_empty() { format!("field_{}", i + 1) } else { l };
                            (key, values.get(i).cloned().unwrap_or_default())
                        })
                        .collect();
                    (!row.is_empty()).then_some(row)
                })
                .collect(),
        }
    }
}

/// A `PageLayout` with every selector parsed up front.
pub struct CompiledLayout {
    summary_left: Selector,
    summary_right: Selector,
    summary_cell: Selector,
    description: Selector,
    sections: Vec<(SubTableKind, Selector)>,
    strategies: Vec<CompiledStrategy>,
}

impl CompiledLayout {
    pub fn compile(layout: &PageLayout) -> Result<Self, EnrichError> {
        let sections = SubTableKind::ALL
            .iter()
            .map(|&kind| compile(&layout.section.replace("{tab}", kind.api_tab())).map(|sel| (kind, sel)))
            .collect::<Result<Vec<_>, _>>()?;
        let strategies = layout
            .strategies
            .iter()
            .map(CompiledStrategy::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            summary_left: compile(&layout.summary_left)?,
            summary_right: compile(&layout.summary_right)?,
            summary_cell: compile(&layout.summary_cell)?,
            description: compile(&layout.description)?,
            sections,
            strategies,
        })
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    strip_markup(&el.text().collect::<Vec<_>>().join(" "))
}

fn trim_label(label: &str) -> String {
    label.trim().trim_end_matches(':').trim().to_string()
}

fn row_from_cells(headers: &[String], values: Vec<String>) -> Option<Row> {
    if values.iter().all(String::is_empty) {
        return None;
    }
    Some(
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                let key = headers
                    .get(i)
                    .filter(|h| !h.is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("column_{}", i + 1));
                (key, v)
            })
            .collect(),
    )
}

fn extract_summary_column(document: &Html, rows: &Selector, cell: &Selector) -> Row {
    let mut column = Row::new();
    for (n, el) in document.select(rows).enumerate() {
        let positional = format!("field_{}", n + 1);
        let cells: Vec<String> = el.select(cell).map(element_text).collect();
        match cells.as_slice() {
            [] => {
                let text = element_text(el);
                if !text.is_empty() {
                    column.insert(positional, text);
                }
            }
            [only] => {
                column.insert(positional, only.clone());
            }
            [label, rest @ ..] => {
                let value = rest
                    .iter()
                    .filter(|v| !v.is_empty())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" ");
                let label = trim_label(label);
                let key = if label.is_empty() { positional } else { label };
                column.insert(key, value);
            }
        }
    }
    column
}

/// Extracts a detail bundle from rendered page HTML.
pub fn extract_page(html: &str, layout: &CompiledLayout, owner: PermitRef) -> DetailBundle {
    let document = Html::parse_document(html);
    let mut bundle = DetailBundle::empty(owner);
    bundle.summary.left = extract_summary_column(&document, &layout.summary_left, &layout.summary_cell);
    bundle.summary.right = extract_summary_column(&document, &layout.summary_right, &layout.summary_cell);
    if let Some(desc) = document.select(&layout.description).next() {
        bundle.set_description(&element_text(desc));
    }
    for (kind, container) in &layout.sections {
        let Some(section) = document.select(container).next() else {
            continue;
        };
        let rows = layout
            .strategies
            .iter()
            .map(|strategy| strategy.extract(section))
            .find(|rows| !rows.is_empty())
            .unwrap_or_default();
        *bundle.table_mut(*kind) = rows;
    }
    bundle
}

pub struct PageDetailEnricher {
    renderer: Arc<dyn PageRenderer>,
    layout: CompiledLayout,
}

impl PageDetailEnricher {
    pub fn new(renderer: Arc<dyn PageRenderer>, layout: &PageLayout) -> Result<Self, EnrichError> {
        Ok(Self {
            renderer,
            layout: CompiledLayout::compile(layout)?,
        })
    }
}

#[async_trait]
impl DetailEnricher for PageDetailEnricher {
    async fn enrich(&self, permit: &CanonicalPermit) -> DetailBundle {
        let owner = permit.permit_ref();
        if permit.detail_url.trim().is_empty() {
            return DetailBundle::failed(owner, "permit has no detail page url");
        }
        match self.renderer.render(&permit.detail_url).await {
            Ok(html) => extract_page(&html, &self.layout, owner),
            Err(err) => {
                warn!(permit = %permit.permit_number, error = %err, "detail page render failed");
                DetailBundle::failed(owner, err.to_string())
            }
        }
    }
}

/// Builds the enricher configured for a jurisdiction.
pub fn build_enricher(
    mode: DetailMode,
    jurisdiction: Jurisdiction,
    http: &HttpFetcher,
    layout: &PageLayout,
) -> Result<Arc<dyn DetailEnricher>, EnrichError> {
    Ok(match mode {
        DetailMode::Api => Arc::new(ApiDetailEnricher::new(http.clone(), jurisdiction)),
        DetailMode::Page => {
            let renderer = HttpPageRenderer::new(http.clone()).with_ready_selector(&layout.ready_selector)?;
            Arc::new(PageDetailEnricher::new(Arc::new(renderer), layout)?)
        }
    })
}
