//! Batch dispatch and result aggregation
//!
//! A batch is de-duplicated, then drained by a bounded pool of workers fed
//! through a channel. Each worker runs the validator and stores the verdict
//! in a shared report. The pool lives for exactly one batch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::validator::AddressValidator;
use crate::EngineConfig;

/// Shared address → verdict map filled in by the workers of one batch.
pub struct VerdictReport {
    inner: Mutex<HashMap<String, String>>,
}

impl VerdictReport {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    pub fn add(&self, email: String, verdict: String) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(email, verdict);
    }

    fn into_map(self) -> HashMap<String, String> {
        self.inner.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> HashMap<String, String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.clone()
    }
}

/// Runs batches of addresses through a bounded worker pool.
pub struct BatchEngine {
    validator: Arc<AddressValidator>,
    workers: usize,
    buffer_size: usize,
    verbose: bool,
    verdict_duration: bool,
}

impl BatchEngine {
    pub fn new(validator: Arc<AddressValidator>, config: &EngineConfig) -> Self {
        Self {
            validator,
            workers: config.workers.max(1),
            buffer_size: config.buffer_size.max(1),
            verbose: config.verbose,
            verdict_duration: config.verdict_duration,
        }
    }

    /// Verify every distinct address in `emails` and return one verdict per
    /// distinct input, keyed as received. Result ordering is unspecified.
    pub async fn run(&self, emails: Vec<String>) -> HashMap<String, String> {
        let mut seen = HashSet::new();
        let distinct: Vec<String> = emails
            .into_iter()
            .filter(|email| seen.insert(email.clone()))
            .collect();
        drop(seen);

        let count = distinct.len();
        if count == 0 {
            return HashMap::new();
        }

        let workers = self.workers.min(count);
        let buffer = if count < self.workers {
            1
        } else {
            self.buffer_size
        };
        debug!(count, workers, buffer, "dispatching batch");

        let (tx, rx) = mpsc::channel::<String>(buffer);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let report = Arc::new(VerdictReport::with_capacity(count));

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let rx = rx.clone();
            let report = report.clone();
            let validator = self.validator.clone();
            let verbose = self.verbose;
            let verdict_duration = self.verdict_duration;
            pool.spawn(async move {
                loop {
                    // take the lock only long enough to claim one address
                    let email = rx.lock().await.recv().await;
                    let Some(email) = email else { break };

                    let started = Instant::now();
                    let mut verdict = validator.verify(&email).await;
                    let elapsed = started.elapsed();
                    if verdict_duration {
                        verdict.push_str(&format!(" [took {elapsed:?}]"));
                    }
                    report.add(email.clone(), verdict);
                    if verbose {
                        info!(worker, email = %email, ?elapsed, "address verified");
                    } else {
                        debug!(worker, email = %email, ?elapsed, "address verified");
                    }
                }
            });
        }

        for email in distinct {
            if tx.send(email).await.is_err() {
                break;
            }
        }
        drop(tx);
        while pool.join_next().await.is_some() {}

        match Arc::try_unwrap(report) {
            Ok(report) => report.into_map(),
            Err(report) => report.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{MxRecord, MxResolver, ResolverError};
    use crate::smtp::{ProbeOutcome, SmtpProber};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SingleMxResolver;

    #[async_trait]
    impl MxResolver for SingleMxResolver {
        async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, ResolverError> {
            Ok(vec![MxRecord {
                host: format!("mx.{domain}."),
                priority: 10,
            }])
        }
    }

    struct EmptyMxResolver;

    #[async_trait]
    impl MxResolver for EmptyMxResolver {
        async fn resolve_mx(&self, _domain: &str) -> Result<Vec<MxRecord>, ResolverError> {
            Ok(Vec::new())
        }
    }

    /// Accepts everything while recording how many probes overlap.
    struct ConcurrencyProber {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ConcurrencyProber {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn peak_concurrency(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SmtpProber for ConcurrencyProber {
        async fn probe(&self, _host: &str, _domain: &str, _from: &str, _to: &str) -> ProbeOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            ProbeOutcome::Delivered
        }
    }

    fn engine_with(
        resolver: Arc<dyn MxResolver>,
        prober: Arc<dyn SmtpProber>,
        mutate: impl FnOnce(&mut EngineConfig),
    ) -> BatchEngine {
        let mut config = EngineConfig::default();
        mutate(&mut config);
        let validator = AddressValidator::new(&config, resolver, prober, None, None);
        BatchEngine::new(Arc::new(validator), &config)
    }

    #[tokio::test]
    async fn test_empty_batch_returns_empty_map() {
        let engine = engine_with(
            Arc::new(SingleMxResolver),
            Arc::new(ConcurrencyProber::new()),
            |_| {},
        );
        let verdicts = engine.run(Vec::new()).await;
        assert!(verdicts.is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_collapse_to_one_entry() {
        let engine = engine_with(
            Arc::new(EmptyMxResolver),
            Arc::new(ConcurrencyProber::new()),
            |_| {},
        );
        let verdicts = engine
            .run(vec![
                "a@x.test".to_string(),
                "a@x.test".to_string(),
                "b@x.test".to_string(),
            ])
            .await;
        assert_eq!(verdicts.len(), 2);
        assert_eq!(
            verdicts.get("a@x.test"),
            Some(&"no mx record found".to_string())
        );
        assert_eq!(
            verdicts.get("b@x.test"),
            Some(&"no mx record found".to_string())
        );
    }

    #[tokio::test]
    async fn test_one_verdict_per_distinct_address() {
        let engine = engine_with(
            Arc::new(SingleMxResolver),
            Arc::new(ConcurrencyProber::new()),
            |c| c.workers = 4,
        );
        let emails: Vec<String> = (0..200).map(|i| format!("user{i}@d{}.test", i % 7)).collect();
        let expected = emails.iter().collect::<HashSet<_>>().len();
        let verdicts = engine.run(emails).await;
        assert_eq!(verdicts.len(), expected);
        assert!(verdicts.values().all(|v| v == "OK"));
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let prober = Arc::new(ConcurrencyProber::new());
        let engine = engine_with(Arc::new(SingleMxResolver), prober.clone(), |c| {
            c.workers = 4;
        });
        let emails: Vec<String> = (0..64).map(|i| format!("user{i}@d{i}.test")).collect();
        let verdicts = engine.run(emails).await;
        assert_eq!(verdicts.len(), 64);
        assert!(prober.peak_concurrency() <= 4);
        assert!(prober.peak_concurrency() >= 1);
    }

    #[tokio::test]
    async fn test_small_batch_spawns_at_most_distinct_workers() {
        let prober = Arc::new(ConcurrencyProber::new());
        let engine = engine_with(Arc::new(SingleMxResolver), prober.clone(), |c| {
            c.workers = 32;
        });
        let verdicts = engine
            .run(vec!["a@x.test".to_string(), "b@y.test".to_string()])
            .await;
        assert_eq!(verdicts.len(), 2);
        assert!(prober.peak_concurrency() <= 2);
    }

    #[tokio::test]
    async fn test_verdict_duration_suffix() {
        let engine = engine_with(
            Arc::new(EmptyMxResolver),
            Arc::new(ConcurrencyProber::new()),
            |c| c.verdict_duration = true,
        );
        let verdicts = engine.run(vec!["a@x.test".to_string()]).await;
        let verdict = verdicts.get("a@x.test").unwrap();
        assert!(verdict.starts_with("no mx record found [took "));
        assert!(verdict.ends_with(']'));
    }
}
