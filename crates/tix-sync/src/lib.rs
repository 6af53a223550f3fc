//! Sync pipeline orchestration: sources in, canonical incidents persisted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tix_adapters::TransformerKind;
use tix_core::{
    BoundingBox, CoordinateValidator, GeometryExtractor, IdentityAssigner, IngestObserver,
    SyncResult, TracingObserver, DEFAULT_NAMESPACE,
};
use tix_storage::{
    HttpClientConfig, HttpFetcher, ImporterStore, IncidentStore, RawFetcher, SqliteIncidentStore,
    UpsertStats,
};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod orchestrator;
pub mod persist;
pub mod tiling;

pub use orchestrator::{failure_line, SourceAggregate, SourceReport, SyncOrchestrator};
pub use persist::{BatchPersister, PersistReport, PersistenceBatchError, DEFAULT_BATCH_SIZE};
pub use tiling::TilingConfig;

pub const CRATE_NAME: &str = "tix-sync";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        for source in &registry.sources {
            anyhow::ensure!(!source.name.trim().is_empty(), "source with empty name");
            anyhow::ensure!(
                !source.url.trim().is_empty(),
                "source {} has an empty url",
                source.name
            );
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(self) -> Vec<SourceConfig> {
        self.sources.into_iter().filter(|s| s.enabled).collect()
    }
}

/// One configured upstream feed.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SourceConfig {
    pub name: String,
    pub transformer: TransformerKind,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tiling: Option<TilingConfig>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub importer_url: Option<String>,
    pub sources_file: PathBuf,
    pub batch_size: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub tile_concurrency: usize,
    pub uuid_namespace: Uuid,
    pub bounds: BoundingBox,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://tix.db?mode=rwc".to_string(),
            importer_url: None,
            sources_file: PathBuf::from("sources.yaml"),
            batch_size: DEFAULT_BATCH_SIZE,
            http_timeout_secs: 20,
            user_agent: "tix-sync/0.1".to_string(),
            tile_concurrency: orchestrator::DEFAULT_TILE_CONCURRENCY,
            uuid_namespace: DEFAULT_NAMESPACE,
            bounds: BoundingBox::CONTINENTAL_US,
            scheduler_enabled: false,
            sync_cron_1: "0 6 * * *".to_string(),
            sync_cron_2: "0 18 * * *".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let uuid_namespace = match std::env::var("TIX_UUID_NAMESPACE") {
            Ok(raw) => Uuid::parse_str(raw.trim())
                .with_context(|| format!("TIX_UUID_NAMESPACE is not a uuid: {raw}"))?,
            Err(_) => defaults.uuid_namespace,
        };
        let bounds = match std::env::var("TIX_BBOX") {
            Ok(raw) => BoundingBox::parse_lon_lat(&raw).with_context(|| {
                format!("TIX_BBOX must be min_lon,min_lat,max_lon,max_lat, got {raw}")
            })?,
            Err(_) => defaults.bounds,
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            importer_url: std::env::var("TIX_IMPORTER_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            sources_file: std::env::var("TIX_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            batch_size: env_parse("TIX_BATCH_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.batch_size),
            http_timeout_secs: env_parse("TIX_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("TIX_USER_AGENT").unwrap_or(defaults.user_agent),
            tile_concurrency: env_parse("TIX_TILE_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.tile_concurrency),
            uuid_namespace,
            bounds,
            scheduler_enabled: std::env::var("TIX_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or(defaults.sync_cron_1),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or(defaults.sync_cron_2),
        })
    }
    /// Tiles of one source share a per-source semaphore, so both limits
    /// follow the tile concurrency.
    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.tile_concurrency,
            per_source_concurrency: self.tile_concurrency,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Persist,
    /// Fetch and transform only.
    DryRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub incidents: usize,
    pub committed: usize,
    pub stats: UpsertStats,
    pub result: SyncResult,
}

/// Folds per-source failures and the persistence outcome into one result.
/// Partial success stays a success with the failures embedded.
pub fn compose_sync_result(
    source_errors: &[String],
    sources_succeeded: usize,
    persist: &PersistReport,
) -> SyncResult {
    let persisted = persist.sync_result();
    if source_errors.is_empty() {
        if persisted.success && persist.attempted == 0 {
            return SyncResult::ok("Sync complete. No new incidents found from any source.");
        }
        return persisted;
    }

    let errors = source_errors.join("; ");
    if !persisted.success {
        return SyncResult::failed(format!(
            "Sync failed. Fetch Errors: {errors} | Persistence error: {}",
            persisted.message
        ));
    }
    if sources_succeeded == 0 {
        return SyncResult::failed(format!("Sync failed. Fetch Errors: {errors}"));
    }
    SyncResult::ok(format!(
        "Partial Sync: {}. Fetch Errors: {errors}",
        persisted.message.trim_end_matches('.')
    ))
}

pub struct SyncPipeline {
    config: SyncConfig,
    orchestrator: SyncOrchestrator,
    persister: BatchPersister,
}

impl SyncPipeline {
    /// Wires the HTTP fetcher and the configured store: the remote importer
    /// when `importer_url` is set, the SQLite database otherwise.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;

        let store: Arc<dyn IncidentStore> = match &config.importer_url {
            Some(url) => {
                info!(%url, "persisting through remote importer");
                Arc::new(ImporterStore::new(fetcher.client().clone(), url.clone()))
            }
            None => {
                let store = SqliteIncidentStore::connect(&config.database_url)
                    .await
                    .with_context(|| format!("connecting to {}", config.database_url))?;
                store.migrate().await.context("creating incidents schema")?;
                Arc::new(store)
            }
        };

        Ok(Self::with_parts(
            config,
            Arc::new(fetcher),
            store,
            Arc::new(TracingObserver),
        ))
    }

    pub fn with_parts(
        config: SyncConfig,
        fetcher: Arc<dyn RawFetcher>,
        store: Arc<dyn IncidentStore>,
        observer: Arc<dyn IngestObserver>,
    ) -> Self {
        let extractor = GeometryExtractor::new(CoordinateValidator::new(config.bounds));
        let identity = IdentityAssigner::new(config.uuid_namespace);
        let orchestrator = SyncOrchestrator::new(fetcher, extractor, identity, observer)
            .with_tile_concurrency(config.tile_concurrency);
        let persister = BatchPersister::new(store, config.batch_size);
        Self {
            config,
            orchestrator,
            persister,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run(RunMode::Persist).await
    }

    pub async fn run(&self, mode: RunMode) -> Result<SyncRunSummary> {
        let sources = SourceRegistry::load(&self.config.sources_file).await?.enabled();
        Ok(self.run_sources(&sources, mode).await)
    }

    /// Never fails: every problem ends up in the summary's `result`.
    pub async fn run_sources(&self, sources: &[SourceConfig], mode: RunMode) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, sources = sources.len());
        async {
            let started_at = Utc::now();
            info!(?mode, "sync started");

            let aggregate = self.orchestrator.sync(sources, started_at).await;
            let incidents = aggregate.incidents.len();

            let (result, committed, stats) = match mode {
                RunMode::Persist => {
                    let report = self.persister.persist(&aggregate.incidents).await;
                    let result = compose_sync_result(
                        &aggregate.source_errors,
                        aggregate.succeeded_sources(),
                        &report,
                    );
                    (result, report.committed, report.stats)
                }
                RunMode::DryRun => {
                    let mut message =
                        format!("Dry run: {incidents} incidents transformed, nothing persisted.");
                    if !aggregate.source_errors.is_empty() {
                        message.push_str(" Fetch Errors: ");
                        message.push_str(&aggregate.source_errors.join("; "));
                    }
                    (SyncResult::ok(message), 0, UpsertStats::default())
                }
            };

            if result.success {
                info!(incidents, committed, message = %result.message, "sync finished");
            } else {
                warn!(incidents, committed, message = %result.message, "sync failed");
            }

            SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                sources: aggregate.reports,
                incidents,
                committed,
                stats,
                result,
            }
        }
        .instrument(span)
        .await
    }

    /// Cron-driven runs, one job per configured expression. `None` when the
    /// scheduler is disabled.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(&self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            success = summary.result.success,
                            "scheduled sync finished"
                        ),
                        Err(err) => {
                            let err = format!("{err:#}");
                            error!(error = %err, "scheduled sync could not start");
                        }
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once().await
}
