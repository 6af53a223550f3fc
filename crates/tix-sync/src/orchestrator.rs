use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tix_adapters::{merge_payloads, SourceTransformer, TransformContext};
use tix_core::{GeometryExtractor, IdentityAssigner, IncidentPayload, IngestObserver};
use tix_storage::{FetchError, RawFetcher};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::SourceConfig;

pub const DEFAULT_TILE_CONCURRENCY: usize = 16;

/// What one source contributed to a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceReport {
    pub name: String,
    pub fetched_records: usize,
    pub transformed: usize,
    pub dropped: usize,
    /// `(succeeded, attempted)` for tiled sources.
    pub tiles: Option<(usize, usize)>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct SourceAggregate {
    pub incidents: Vec<IncidentPayload>,
    pub source_errors: Vec<String>,
    pub reports: Vec<SourceReport>,
}

impl SourceAggregate {
    pub fn succeeded_sources(&self) -> usize {
        self.reports.iter().filter(|r| r.error.is_none()).count()
    }
}

/// `[NAME] Failed: reason`, with the operator hint appended when one applies.
pub fn failure_line(source_name: &str, err: &FetchError) -> String {
    match err.hint() {
        Some(hint) => format!("[{source_name}] Failed: {err} {hint}"),
        None => format!("[{source_name}] Failed: {err}"),
    }
}

struct FetchedPayload {
    payload: JsonValue,
    tiles: Option<(usize, usize)>,
}

/// Fans out over configured sources, fetches and transforms each one
/// independently, and gathers the survivors.
pub struct SyncOrchestrator {
    fetcher: Arc<dyn RawFetcher>,
    extractor: GeometryExtractor,
    identity: IdentityAssigner,
    observer: Arc<dyn IngestObserver>,
    tile_concurrency: usize,
}

impl SyncOrchestrator {
    pub fn new(
        fetcher: Arc<dyn RawFetcher>,
        extractor: GeometryExtractor,
        identity: IdentityAssigner,
        observer: Arc<dyn IngestObserver>,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            identity,
            observer,
            tile_concurrency: DEFAULT_TILE_CONCURRENCY,
        }
    }

    pub fn with_tile_concurrency(mut self, tile_concurrency: usize) -> Self {
        self.tile_concurrency = tile_concurrency.max(1);
        self
    }

    /// Waits for every source to settle. A failing source never affects its
    /// siblings; it contributes one line to `source_errors`.
    pub async fn sync(&self, sources: &[SourceConfig], now: DateTime<Utc>) -> SourceAggregate {
        let tasks = sources.iter().map(|source| {
            let span = info_span!("sync_source", source = %source.name);
            self.sync_source(source, now).instrument(span)
        });
        let outcomes = join_all(tasks).await;

        let mut aggregate = SourceAggregate::default();
        for (report, incidents) in outcomes {
            if let Some(line) = &report.error {
                aggregate.source_errors.push(line.clone());
            }
            aggregate.incidents.extend(incidents);
            aggregate.reports.push(report);
        }
        aggregate
    }

    async fn sync_source(
        &self,
        source: &SourceConfig,
        now: DateTime<Utc>,
    ) -> (SourceReport, Vec<IncidentPayload>) {
        let mut report = SourceReport {
            name: source.name.clone(),
            ..SourceReport::default()
        };
        let transformer = source.transformer.transformer();

        let fetched = match &source.tiling {
            Some(_) => Ok(self.fetch_tiled(source, transformer.as_ref()).await),
            None => self
                .fetcher
                .fetch_json(&source.name, &source.url)
                .await
                .map(|payload| FetchedPayload {
                    payload,
                    tiles: None,
                }),
        };
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(err) => {
                let line = failure_line(&source.name, &err);
                warn!(error = %err, "source fetch failed");
                report.error = Some(line);
                return (report, Vec::new());
            }
        };

        let ctx = TransformContext {
            extractor: &self.extractor,
            identity: &self.identity,
            observer: self.observer.as_ref(),
            now,
        };
        let output = transformer.transform(&fetched.payload, &ctx);
        report.fetched_records = output.input_records;
        report.transformed = output.incidents.len();
        report.dropped = output.dropped;
        report.tiles = fetched.tiles;
        (report, output.incidents)
    }

    /// Tile failures are tolerated. Zero successful tiles is an empty result,
    /// not a source failure.
    async fn fetch_tiled(
        &self,
        source: &SourceConfig,
        transformer: &dyn SourceTransformer,
    ) -> FetchedPayload {
        let urls = source
            .tiling
            .as_ref()
            .map(|tiling| tiling.tile_urls(&source.url))
            .unwrap_or_default();
        let attempted = urls.len();
        info!(tiles = attempted, "fetching tiled source");

        let results = stream::iter(urls)
            .map(|url| async move {
                let result = self.fetcher.fetch_json(&source.name, &url).await;
                (url, result)
            })
            .buffer_unordered(self.tile_concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut payloads = Vec::new();
        for (url, result) in results {
            match result {
                Ok(payload) => payloads.push(payload),
                // The provider answers 400 for tiles with nothing in coverage.
                Err(err) if err.status() == Some(400) => {
                    debug!(%url, "tile rejected with 400");
                }
                Err(err) => warn!(%url, error = %err, "tile fetch failed"),
            }
        }

        let succeeded = payloads.len();
        info!(succeeded, attempted, "tiled fetch finished");
        if succeeded == 0 {
            warn!("no tiles returned data; continuing with an empty result");
        }
        FetchedPayload {
            payload: merge_payloads(transformer, &payloads),
            tiles: Some((succeeded, attempted)),
        }
    }
}
