//! Search pipeline orchestration: jurisdiction registry, filtering, batched
//! enrichment, workbook export and snapshot refresh.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use permx_adapters::enrich::build_enricher;
use permx_adapters::{
    fetch_provider_records, DetailEnricher, DetailMode, JurisdictionAdapter, PageLayout, ProviderAdapter,
    ProviderContext, ProviderError, RawRecord, SourceSpec,
};
use permx_core::{CanonicalPermit, DatePolicy, Jurisdiction};
use permx_storage::{HttpClientConfig, HttpFetcher, SnapshotStore, StoredSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};

pub mod batch;
pub mod export;
pub mod filter;
pub mod progress;

pub use batch::{run_batch, BatchOptions, BatchReport};
pub use export::{build_workbook, plan_workbook, render_workbook, workbook_file_name, ExportError, XLSX_CONTENT_TYPE};
pub use filter::{filter_by_window, filter_with_policy, FilterCriteria};
pub use progress::{ProgressHandle, ProgressSnapshot, ProgressStatus};

pub const CRATE_NAME: &str = "permx-sync";
pub const REGISTRY_FILE: &str = "jurisdictions.yaml";

#[derive(Debug, Clone)]
pub struct PermxConfig {
    pub workspace_root: PathBuf,
    pub downloads_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub concurrency: usize,
    pub chunk_size: usize,
    pub dispatch_delay_ms: u64,
    pub refresh_enabled: bool,
    pub refresh_cron: String,
    pub web_port: u16,
}

impl Default for PermxConfig {
    fn default() -> Self {
        Self::for_workspace(PathBuf::from("."))
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl PermxConfig {
    pub fn for_workspace(workspace_root: PathBuf) -> Self {
        Self {
            downloads_dir: workspace_root.join("downloads"),
            workspace_root,
            user_agent: "permx/0.1".to_string(),
            http_timeout_secs: 70,
            concurrency: batch::default_concurrency(),
            chunk_size: 200,
            dispatch_delay_ms: 300,
            refresh_enabled: false,
            refresh_cron: "0 0 5 * * *".to_string(),
            web_port: 3000,
        }
    }

    pub fn from_env() -> Self {
        let workspace_root = std::env::var("PERMX_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let defaults = Self::for_workspace(workspace_root);
        Self {
            downloads_dir: std::env::var("PERMX_DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.downloads_dir),
            user_agent: std::env::var("PERMX_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("PERMX_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            concurrency: env_parse("PERMX_CONCURRENCY").unwrap_or(defaults.concurrency),
            chunk_size: env_parse("PERMX_CHUNK_SIZE").unwrap_or(defaults.chunk_size),
            dispatch_delay_ms: env_parse("PERMX_DISPATCH_DELAY_MS").unwrap_or(defaults.dispatch_delay_ms),
            refresh_enabled: std::env::var("PERMX_REFRESH_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.refresh_enabled),
            refresh_cron: std::env::var("PERMX_REFRESH_CRON").unwrap_or(defaults.refresh_cron),
            web_port: env_parse("PERMX_WEB_PORT").unwrap_or(defaults.web_port),
            workspace_root: defaults.workspace_root,
        }
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            concurrency: self.concurrency.max(1),
            chunk_size: self.chunk_size.max(1),
            permit_timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            dispatch_delay: Duration::from_millis(self.dispatch_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JurisdictionConfig {
    pub jurisdiction: Jurisdiction,
    pub source: SourceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_mode: Option<DetailMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_template: Option<String>,
    /// Summary label re-checked against the window after enrichment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_date_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_layout: Option<PageLayout>,
}

impl JurisdictionConfig {
    pub fn default_for(jurisdiction: Jurisdiction) -> Self {
        Self {
            jurisdiction,
            source: SourceSpec::default_for(jurisdiction),
            detail_mode: None,
            detail_template: None,
            summary_date_label: (jurisdiction == Jurisdiction::Bothell).then(|| "Applied Date".to_string()),
            page_layout: None,
        }
    }

    pub fn detail_mode(&self) -> DetailMode {
        self.detail_mode
            .unwrap_or_else(|| DetailMode::default_for(self.jurisdiction))
    }

    pub fn adapter(&self) -> JurisdictionAdapter {
        let adapter = JurisdictionAdapter::new(self.jurisdiction, self.source.clone());
        match &self.detail_template {
            Some(template) => adapter.with_detail_template(template.clone()),
            None => adapter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JurisdictionRegistry {
    pub jurisdictions: Vec<JurisdictionConfig>,
}

impl JurisdictionRegistry {
    pub fn defaults() -> Self {
        Self {
            jurisdictions: Jurisdiction::ALL
                .into_iter()
                .map(JurisdictionConfig::default_for)
                .collect(),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing jurisdiction registry")?;
        for (i, entry) in registry.jurisdictions.iter().enumerate() {
            if registry.jurisdictions[..i]
                .iter()
                .any(|other| other.jurisdiction == entry.jurisdiction)
            {
                anyhow::bail!("{} is configured more than once", entry.jurisdiction);
            }
        }
        Ok(registry)
    }

    /// Reads `jurisdictions.yaml` under `workspace_root`, or the compiled
    /// defaults when the file does not exist.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(REGISTRY_FILE);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Self::defaults());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn get(&self, jurisdiction: Jurisdiction) -> Option<&JurisdictionConfig> {
        self.jurisdictions.iter().find(|c| c.jurisdiction == jurisdiction)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Input(String),
    #[error("{0}")]
    ProviderUnavailable(String),
    #[error("{0}")]
    NoSnapshot(String),
    #[error("{0}")]
    NoMatches(String),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ProviderError> for PipelineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable { .. } => PipelineError::ProviderUnavailable(err.to_string()),
            ProviderError::NoSnapshot { .. } => PipelineError::NoSnapshot(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "type")]
    pub permit_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl SearchRequest {
    pub fn validate(&self, now_ms: i64) -> Result<(Jurisdiction, FilterCriteria), PipelineError> {
        if self.city.trim().is_empty() {
            return Err(PipelineError::Input("city is required".to_string()));
        }
        let jurisdiction = Jurisdiction::parse(&self.city)
            .ok_or_else(|| PipelineError::Input(format!("unsupported city `{}`", self.city.trim())))?;
        let window = filter::resolve_window(self.start_date.as_deref(), self.end_date.as_deref(), now_ms)
            .map_err(PipelineError::Input)?;
        let criteria = FilterCriteria::new(window).with_attributes(
            self.status.as_deref(),
            self.category.as_deref(),
            self.permit_type.as_deref(),
        );
        Ok((jurisdiction, criteria))
    }
}

#[derive(Debug, Clone)]
pub struct ExportedWorkbook {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub permits: usize,
    pub failed: usize,
}

pub struct SearchPipeline {
    config: PermxConfig,
    registry: JurisdictionRegistry,
    http: HttpFetcher,
    snapshots: SnapshotStore,
    enricher: Option<Arc<dyn DetailEnricher>>,
}

impl SearchPipeline {
    pub fn new(config: PermxConfig, registry: JurisdictionRegistry) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let snapshots = SnapshotStore::new(config.downloads_dir.clone());
        Ok(Self {
            config,
            registry,
            http,
            snapshots,
            enricher: None,
        })
    }

    pub async fn from_env() -> Result<Self> {
        let config = PermxConfig::from_env();
        let registry = JurisdictionRegistry::load(&config.workspace_root).await?;
        Self::new(config, registry)
    }

    /// Uses `enricher` for every jurisdiction instead of the configured ones.
    pub fn with_enricher(mut self, enricher: Arc<dyn DetailEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn config(&self) -> &PermxConfig {
        &self.config
    }

    pub fn registry(&self) -> &JurisdictionRegistry {
        &self.registry
    }

    fn provider_context(&self, window: Option<permx_adapters::DateWindow>) -> ProviderContext {
        ProviderContext::new(self.http.clone(), self.snapshots.clone()).with_window(window)
    }

    fn config_for(&self, jurisdiction: Jurisdiction) -> Result<&JurisdictionConfig, PipelineError> {
        self.registry
            .get(jurisdiction)
            .ok_or_else(|| PipelineError::Input(format!("{jurisdiction} is not configured")))
    }

    fn enricher_for(&self, config: &JurisdictionConfig) -> Result<Arc<dyn DetailEnricher>, PipelineError> {
        if let Some(enricher) = &self.enricher {
            return Ok(Arc::clone(enricher));
        }
        let layout = config.page_layout.clone().unwrap_or_default();
        build_enricher(config.detail_mode(), config.jurisdiction, &self.http, &layout)
            .map_err(|e| PipelineError::Internal(anyhow::anyhow!("building detail enricher: {e}")))
    }

    /// Fetch, filter and enrich; no export.
    pub async fn search_results(
        &self,
        request: &SearchRequest,
        progress: &ProgressHandle,
    ) -> Result<(Jurisdiction, BatchReport), PipelineError> {
        let (jurisdiction, criteria) = request.validate(filter::now_ms())?;
        let config = self.config_for(jurisdiction)?;
        let adapter = config.adapter();

        let span = info_span!("search", %jurisdiction, source = adapter.source().kind());
        async {
            progress.set_status(ProgressStatus::Fetching);
            let permits = fetch_provider_records(&adapter, &self.provider_context(Some(criteria.window))).await?;

            progress.set_status(ProgressStatus::Filtering);
            let policy = adapter.date_policy();
            let fetched = permits.len();
            let matched: Vec<CanonicalPermit> = filter_with_policy(permits, &criteria, jurisdiction, policy)
                .into_iter()
                .filter(CanonicalPermit::is_enrichable)
                .collect();
            info!(fetched, matched = matched.len(), "filter applied");
            if matched.is_empty() {
                return Err(PipelineError::NoMatches(format!(
                    "No {jurisdiction} permits match the given filters."
                )));
            }

            let enricher = self.enricher_for(config)?;
            let mut report = run_batch(matched, enricher, &self.config.batch_options(), progress).await;
            if policy == DatePolicy::CityMatchOnly {
                if let Some(label) = &config.summary_date_label {
                    filter::retain_summary_window(&mut report.results, label, criteria.window);
                    if report.results.is_empty() {
                        return Err(PipelineError::NoMatches(format!(
                            "No matched {jurisdiction} records found for selected filters."
                        )));
                    }
                }
            }
            info!(
                enriched = report.results.len(),
                failed = report.failed_indices.len(),
                "enrichment finished"
            );
            Ok::<_, PipelineError>((jurisdiction, report))
        }
        .instrument(span)
        .await
    }

    /// Full request: results plus the serialized workbook. Progress ends in
    /// `done` or `failed`.
    pub async fn search(&self, request: &SearchRequest, progress: &ProgressHandle) -> Result<ExportedWorkbook, PipelineError> {
        progress.start_run();
        let outcome: Result<ExportedWorkbook, PipelineError> = async {
            let (jurisdiction, report) = self.search_results(request, progress).await?;
            progress.set_status(ProgressStatus::Exporting);
            let bytes = build_workbook(&report.results)?;
            Ok(ExportedWorkbook {
                file_name: workbook_file_name(jurisdiction),
                bytes,
                permits: report.results.len(),
                failed: report.failed_indices.len(),
            })
        }
        .await;
        match &outcome {
            Ok(_) => progress.finish(),
            Err(err) => {
                warn!(error = %err, "search failed");
                progress.fail();
            }
        }
        outcome
    }

    /// Rebuilds a snapshot-backed jurisdiction's file from its upstream layer.
    /// An upstream returning nothing never overwrites the existing file.
    pub async fn refresh_snapshot(&self, jurisdiction: Jurisdiction) -> Result<StoredSnapshot, PipelineError> {
        let config = self.config_for(jurisdiction)?;
        let adapter = config.adapter();
        let Some(file) = adapter.snapshot_file() else {
            return Err(PipelineError::Input(format!(
                "{jurisdiction} uses a {} source; only snapshot sources can be refreshed",
                config.source.kind()
            )));
        };
        let records = adapter.fetch_refresh_records(&self.provider_context(None)).await?;
        if records.is_empty() {
            return Err(PipelineError::ProviderUnavailable(format!(
                "{jurisdiction} upstream returned zero records; existing snapshot kept"
            )));
        }
        let values: Vec<_> = records.iter().map(RawRecord::to_snapshot_value).collect();
        let stored = self.snapshots.store(file, &values).await?;
        info!(
            %jurisdiction,
            path = %stored.path.display(),
            records = stored.record_count,
            sha256 = %stored.content_hash,
            "snapshot refreshed"
        );
        Ok(stored)
    }

    /// Refreshes every snapshot source that has an upstream; returns how many succeeded.
    pub async fn refresh_all_snapshots(&self) -> usize {
        let mut refreshed = 0;
        for config in &self.registry.jurisdictions {
            if !matches!(config.source, SourceSpec::Snapshot { refresh_url: Some(_), .. }) {
                continue;
            }
            match self.refresh_snapshot(config.jurisdiction).await {
                Ok(_) => refreshed += 1,
                Err(err) => warn!(jurisdiction = %config.jurisdiction, error = %err, "snapshot refresh failed"),
            }
        }
        refreshed
    }

    pub async fn maybe_build_refresh_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.refresh_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.refresh_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let refreshed = pipeline.refresh_all_snapshots().await;
                info!(refreshed, "scheduled snapshot refresh finished");
            })
        })
        .with_context(|| format!("creating refresh job for cron {cron}"))?;
        sched.add(job).await.context("adding refresh job")?;
        Ok(Some(sched))
    }
}
