use std::sync::Arc;

use thiserror::Error;
use tix_core::{IncidentPayload, SyncResult};
use tix_storage::{IncidentStore, StoreError, UpsertStats};
use tracing::{info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 150;

/// A chunk commit failed. Earlier chunks stay committed.
#[derive(Debug, Error)]
#[error("Sync failed on batch {batch}/{total_batches} after {committed} incidents were committed. Reason: {source}")]
pub struct PersistenceBatchError {
    pub batch: usize,
    pub total_batches: usize,
    pub committed: usize,
    #[source]
    pub source: StoreError,
}

impl PersistenceBatchError {
    /// Transport failures and 413s usually mean the batch was too large.
    fn payload_hint(&self) -> Option<&'static str> {
        match &self.source {
            StoreError::Transport(_) | StoreError::Importer { status: 413, .. } => Some(
                "This can happen if the batch payload is too large for the store; check its request size limit or lower TIX_BATCH_SIZE.",
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PersistReport {
    pub attempted: usize,
    pub committed: usize,
    pub batches_committed: usize,
    pub total_batches: usize,
    pub stats: UpsertStats,
    pub failure: Option<PersistenceBatchError>,
}

impl PersistReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn sync_result(&self) -> SyncResult {
        if let Some(failure) = &self.failure {
            return match failure.payload_hint() {
                Some(hint) => SyncResult::failed(format!("{failure} {hint}")),
                None => SyncResult::failed(failure.to_string()),
            };
        }
        if self.attempted == 0 {
            return SyncResult::ok("Sync complete. No new data to import.");
        }
        SyncResult::ok(format!(
            "Sync complete. Successfully processed {} incidents across {} batches ({} inserted, {} updated)",
            self.committed, self.total_batches, self.stats.inserted, self.stats.updated
        ))
    }
}

impl From<PersistReport> for SyncResult {
    fn from(report: PersistReport) -> Self {
        report.sync_result()
    }
}

/// Commits incidents in fixed-size chunks, one after another, stopping at
/// the first failed chunk.
#[derive(Clone)]
pub struct BatchPersister {
    store: Arc<dyn IncidentStore>,
    batch_size: usize,
}

impl BatchPersister {
    pub fn new(store: Arc<dyn IncidentStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn persist(&self, incidents: &[IncidentPayload]) -> PersistReport {
        let total_batches = incidents.len().div_ceil(self.batch_size);
        let mut report = PersistReport {
            attempted: incidents.len(),
            total_batches,
            ..PersistReport::default()
        };
        if incidents.is_empty() {
            return report;
        }
        info!(
            incidents = incidents.len(),
            batches = total_batches,
            batch_size = self.batch_size,
            "persisting incidents"
        );

        for (index, chunk) in incidents.chunks(self.batch_size).enumerate() {
            let batch = index + 1;
            match self.store.upsert_batch(chunk).await {
                Ok(stats) => {
                    info!(
                        batch,
                        total_batches,
                        size = chunk.len(),
                        inserted = stats.inserted,
                        updated = stats.updated,
                        "batch committed"
                    );
                    report.committed += chunk.len();
                    report.batches_committed += 1;
                    report.stats.absorb(stats);
                }
                Err(source) => {
                    warn!(batch, total_batches, error = %source, "batch failed; stopping");
                    report.failure = Some(PersistenceBatchError {
                        batch,
                        total_batches,
                        committed: report.committed,
                        source,
                    });
                    break;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use tix_core::{ClosureStatus, SeverityFlag};
    use tix_storage::MemoryIncidentStore;

    use super::*;

    fn incident(n: usize) -> IncidentPayload {
        IncidentPayload {
            uuid: format!("00000000-0000-0000-0000-{n:012}"),
            source_system: "TEST".into(),
            source_event_id: n.to_string(),
            state: None,
            county: None,
            route: None,
            direction: None,
            milepost: None,
            latitude: 40.0,
            longitude: -83.0,
            reported_time: None,
            updated_time: Utc::now(),
            cleared_time: None,
            is_active: true,
            event_type: None,
            lanes_affected: None,
            closure_status: ClosureStatus::Unknown,
            severity_flag: SeverityFlag::Low,
            severity_score: None,
            units_involved: None,
        }
    }

    /// Records chunk sizes and fails the configured call.
    struct FlakyStore {
        inner: MemoryIncidentStore,
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
        sizes: std::sync::Mutex<Vec<usize>>,
    }

    impl FlakyStore {
        fn new(fail_on_call: Option<usize>) -> Self {
            Self {
                inner: MemoryIncidentStore::new(),
                calls: AtomicUsize::new(0),
                fail_on_call,
                sizes: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl IncidentStore for FlakyStore {
        async fn upsert_batch(&self, batch: &[IncidentPayload]) -> Result<UpsertStats, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.sizes.lock().unwrap().push(batch.len());
            if Some(call) == self.fail_on_call {
                return Err(StoreError::Rejected("disk full".into()));
            }
            self.inner.upsert_batch(batch).await
        }
    }

    #[tokio::test]
    async fn chunks_are_committed_in_order() {
        let store = Arc::new(FlakyStore::new(None));
        let persister = BatchPersister::new(store.clone(), 150);
        let incidents = (0..320).map(incident).collect::<Vec<_>>();

        let report = persister.persist(&incidents).await;

        assert!(report.is_success());
        assert_eq!(*store.sizes.lock().unwrap(), vec![150, 150, 20]);
        assert_eq!(report.committed, 320);
        assert_eq!(report.stats.inserted, 320);
        assert_eq!(store.inner.len().await, 320);
        let result = report.sync_result();
        assert!(result.success);
        assert!(result.message.contains("320 incidents across 3 batches"));
    }

    #[tokio::test]
    async fn failure_on_second_chunk_keeps_the_first() {
        let store = Arc::new(FlakyStore::new(Some(2)));
        let persister = BatchPersister::new(store.clone(), 150);
        let incidents = (0..320).map(incident).collect::<Vec<_>>();

        let report = persister.persist(&incidents).await;

        assert_eq!(*store.sizes.lock().unwrap(), vec![150, 150]);
        assert_eq!(report.committed, 150);
        assert_eq!(store.inner.len().await, 150);
        let failure = report.failure.as_ref().unwrap();
        assert_eq!((failure.batch, failure.total_batches), (2, 3));
        let result = SyncResult::from(report);
        assert!(!result.success);
        assert!(result.message.contains("batch 2/3 after 150 incidents were committed"));
        assert!(result.message.contains("disk full"));
    }

    #[tokio::test]
    async fn empty_input_is_a_successful_no_op() {
        let store = Arc::new(FlakyStore::new(Some(1)));
        let report = BatchPersister::new(store.clone(), 150).persist(&[]).await;

        assert!(report.is_success());
        assert!(store.sizes.lock().unwrap().is_empty());
        assert_eq!(report.sync_result().message, "Sync complete. No new data to import.");
    }

    #[test]
    fn oversized_payload_failures_carry_a_hint() {
        let report = PersistReport {
            attempted: 10,
            total_batches: 1,
            failure: Some(PersistenceBatchError {
                batch: 1,
                total_batches: 1,
                committed: 0,
                source: StoreError::Importer {
                    status: 413,
                    message: "payload too large".into(),
                },
            }),
            ..PersistReport::default()
        };
        assert!(report.sync_result().message.contains("request size limit"));
    }
}
