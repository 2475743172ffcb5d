//! Bounded-concurrency, chunked enrichment of filtered permits.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use permx_adapters::DetailEnricher;
use permx_core::{CanonicalPermit, SearchResult};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

use crate::progress::ProgressHandle;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Permits enriched at once across the whole batch.
    pub concurrency: usize,
    pub chunk_size: usize,
    pub permit_timeout: Duration,
    /// Stagger applied when a task takes its slot.
    pub dispatch_delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            chunk_size: 200,
            permit_timeout: Duration::from_secs(70),
            dispatch_delay: Duration::from_millis(300),
        }
    }
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(2)
        .clamp(2, 8)
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Successful results, sorted by `index`.
    pub results: Vec<SearchResult>,
    pub failed_indices: Vec<usize>,
}

enum TaskOutcome {
    Enriched(SearchResult),
    Failed { index: usize, reason: String },
}

async fn enrich_one(
    index: usize,
    permit: CanonicalPermit,
    enricher: Arc<dyn DetailEnricher>,
    semaphore: Arc<Semaphore>,
    options: BatchOptions,
) -> TaskOutcome {
    let Ok(_slot) = semaphore.acquire_owned().await else {
        return TaskOutcome::Failed {
            index,
            reason: "scheduler closed".to_string(),
        };
    };
    if !options.dispatch_delay.is_zero() {
        tokio::time::sleep(options.dispatch_delay).await;
    }
    let guarded = AssertUnwindSafe(enricher.enrich(&permit)).catch_unwind();
    match tokio::time::timeout(options.permit_timeout, guarded).await {
        Ok(Ok(bundle)) => match &bundle.error {
            None => TaskOutcome::Enriched(SearchResult::new(index, permit, bundle)),
            Some(reason) => TaskOutcome::Failed {
                index,
                reason: reason.clone(),
            },
        },
        Ok(Err(_panic)) => TaskOutcome::Failed {
            index,
            reason: "enricher panicked".to_string(),
        },
        Err(_elapsed) => TaskOutcome::Failed {
            index,
            reason: format!("timed out after {:?}", options.permit_timeout),
        },
    }
}

/// Enriches `permits` in chunks under a global concurrency cap.
///
/// Permits without a permit number are dropped before indexing. Every settled
/// permit advances `progress`; failed ones contribute no result.
pub async fn run_batch(
    permits: Vec<CanonicalPermit>,
    enricher: Arc<dyn DetailEnricher>,
    options: &BatchOptions,
    progress: &ProgressHandle,
) -> BatchReport {
    let indexed: Vec<(usize, CanonicalPermit)> = permits
        .into_iter()
        .filter(CanonicalPermit::is_enrichable)
        .enumerate()
        .collect();
    let total = indexed.len();
    progress.begin(total);

    let span = info_span!("run_batch", total, concurrency = options.concurrency, chunk_size = options.chunk_size);
    async {
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let mut report = BatchReport {
            results: Vec::with_capacity(total),
            failed_indices: Vec::new(),
        };

        for (chunk_no, chunk) in indexed.chunks(options.chunk_size.max(1)).enumerate() {
            let mut tasks = JoinSet::new();
            for (index, permit) in chunk.iter().cloned() {
                tasks.spawn(enrich_one(
                    index,
                    permit,
                    Arc::clone(&enricher),
                    Arc::clone(&semaphore),
                    options.clone(),
                ));
            }
            while let Some(joined) = tasks.join_next().await {
                progress.record_completion();
                match joined {
                    Ok(TaskOutcome::Enriched(result)) => report.results.push(result),
                    Ok(TaskOutcome::Failed { index, reason }) => {
                        warn!(index, %reason, "permit enrichment failed; dropping");
                        report.failed_indices.push(index);
                    }
                    Err(err) => warn!(error = %err, "enrichment task aborted"),
                }
            }
            info!(chunk = chunk_no, settled = progress.snapshot().current, "chunk complete");
        }

        report.results.sort_by_key(|r| r.index);
        report.failed_indices.sort_unstable();
        report
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use permx_core::{DetailBundle, Jurisdiction, Row};

    use crate::progress::ProgressStatus;

    /// Delays vary per permit so completion order differs from input order.
    struct ScriptedEnricher {
        fail: Vec<String>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedEnricher {
        fn failing(fail: &[&str]) -> Self {
            Self {
                fail: fail.iter().map(|s| s.to_string()).collect(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DetailEnricher for ScriptedEnricher {
        async fn enrich(&self, permit: &CanonicalPermit) -> DetailBundle {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let n: u64 = permit.permit_number.trim_start_matches('P').parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis((n * 7) % 11 + 1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if permit.permit_number == "P99" {
                panic!("scripted panic");
            }
            if self.fail.contains(&permit.permit_number) {
                return DetailBundle::failed(permit.permit_ref(), "scripted failure");
            }
            let mut bundle = DetailBundle::empty(permit.permit_ref());
            bundle.fees.push(Row::from_iter([("Fee", permit.permit_number.as_str())]));
            bundle
        }
    }

    struct StuckEnricher;

    #[async_trait]
    impl DetailEnricher for StuckEnricher {
        async fn enrich(&self, permit: &CanonicalPermit) -> DetailBundle {
            tokio::time::sleep(Duration::from_secs(30)).await;
            DetailBundle::empty(permit.permit_ref())
        }
    }

    fn permits(n: usize) -> Vec<CanonicalPermit> {
        (0..n)
            .map(|i| CanonicalPermit::new(Jurisdiction::Burien, format!("P{i}")))
            .collect()
    }

    fn options(concurrency: usize, chunk_size: usize) -> BatchOptions {
        BatchOptions {
            concurrency,
            chunk_size,
            permit_timeout: Duration::from_secs(5),
            dispatch_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn failed_permits_are_dropped_and_order_is_restored() {
        let enricher = Arc::new(ScriptedEnricher::failing(&["P3", "P7"]));
        let progress = ProgressHandle::new();
        let report = run_batch(permits(10), enricher, &options(4, 3), &progress).await;

        let indices: Vec<_> = report.results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 4, 5, 6, 8, 9]);
        assert_eq!(report.failed_indices, vec![3, 7]);
        assert_eq!(report.results[3].permit_number, "P4");

        let snap = progress.snapshot();
        assert_eq!((snap.current, snap.total), (10, 10));
        assert_eq!(snap.status, ProgressStatus::Enriching);
    }

    #[tokio::test]
    async fn concurrency_cap_bounds_in_flight_permits() {
        let enricher = Arc::new(ScriptedEnricher::failing(&[]));
        let progress = ProgressHandle::new();
        let report = run_batch(permits(24), enricher.clone(), &options(3, 100), &progress).await;
        assert_eq!(report.results.len(), 24);
        assert!(enricher.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn blank_permit_numbers_never_reach_the_enricher() {
        let enricher = Arc::new(ScriptedEnricher::failing(&[]));
        let mut input = permits(3);
        input.insert(1, CanonicalPermit::new(Jurisdiction::Burien, "  "));
        let progress = ProgressHandle::new();
        let report = run_batch(input, enricher, &options(2, 2), &progress).await;
        assert_eq!(report.results.len(), 3);
        assert_eq!(progress.snapshot().total, 3);
        assert_eq!(report.results[1].permit_number, "P1");
    }

    #[tokio::test]
    async fn panics_are_contained_per_permit() {
        let enricher = Arc::new(ScriptedEnricher::failing(&[]));
        let mut input = permits(3);
        input.push(CanonicalPermit::new(Jurisdiction::Burien, "P99"));
        let progress = ProgressHandle::new();
        let report = run_batch(input, enricher, &options(2, 10), &progress).await;
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.failed_indices, vec![3]);
        assert_eq!(progress.snapshot().current, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_permits_time_out() {
        let progress = ProgressHandle::new();
        let mut opts = options(2, 10);
        opts.permit_timeout = Duration::from_secs(1);
        let report = run_batch(permits(2), Arc::new(StuckEnricher), &opts, &progress).await;
        assert!(report.results.is_empty());
        assert_eq!(report.failed_indices, vec![0, 1]);
        assert_eq!(progress.snapshot().current, 2);
    }

    #[test]
    fn default_concurrency_is_clamped() {
        let c = default_concurrency();
        assert!((2..=8).contains(&c));
    }
}
