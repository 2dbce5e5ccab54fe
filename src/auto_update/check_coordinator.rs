// Check Coordinator
// Debounces, caches and retries remote version checks so that any number of
// concurrent requests cost at most one engine call

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::auto_update::config::UpdateConfig;
use crate::auto_update::engine::UpdateDeliveryEngine;
use crate::auto_update::logger::UpdateJournal;
use crate::auto_update::metrics::MetricsCollector;
use crate::auto_update::types::{UpdateError, UpdateResult};

pub type CheckOutcome = Result<Option<UpdateResult>, UpdateError>;

struct CachedResult {
    result: UpdateResult,
    fetched_at: Instant,
}

#[derive(Default)]
struct CheckState {
    /// Bumped by every request; only the timer armed last may fire
    generation: u64,
    waiters: Vec<oneshot::Sender<CheckOutcome>>,
    is_checking: bool,
    cached: Option<CachedResult>,
}

struct Inner {
    engine: Arc<dyn UpdateDeliveryEngine>,
    metrics: Arc<MetricsCollector>,
    journal: UpdateJournal,
    debounce: Duration,
    cache_ttl: Duration,
    attempt_timeout: Duration,
    max_attempts: u32,
    config: UpdateConfig,
    state: Mutex<CheckState>,
}

/// Single-flight front door for version checks
#[derive(Clone)]
pub struct CheckCoordinator {
    inner: Arc<Inner>,
}

impl CheckCoordinator {
    pub fn new(
        config: &UpdateConfig,
        engine: Arc<dyn UpdateDeliveryEngine>,
        metrics: Arc<MetricsCollector>,
        journal: UpdateJournal,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                metrics,
                journal,
                debounce: config.debounce(),
                cache_ttl: config.cache_ttl(),
                attempt_timeout: config.check_timeout(),
                max_attempts: config.max_check_attempts.max(1),
                config: config.clone(),
                state: Mutex::new(CheckState::default()),
            }),
        }
    }

    /// Request a check. A fresh cached result is returned at once; otherwise
    /// the caller joins the current debounce batch and receives its outcome.
    /// Must be called from within a tokio runtime.
    pub async fn request_check(&self) -> CheckOutcome {
        let receiver = {
            let mut state = self.inner.state.lock();

            if let Some(cached) = &state.cached {
                if cached.fetched_at.elapsed() < self.inner.cache_ttl {
                    let result = cached.result.clone();
                    drop(state);
                    log::debug!("[CheckCoordinator] Cache hit for {}", result.version);
                    self.inner.metrics.record_check(0, true);
                    return Ok(Some(result));
                }
            }

            state.generation += 1;
            let generation = state.generation;
            let (sender, receiver) = oneshot::channel();
            state.waiters.push(sender);

            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(inner.debounce).await;
                inner.fire(generation).await;
            });

            receiver
        };

        receiver.await.unwrap_or_else(|_| {
            Err(UpdateError::UnexpectedCheck(
                "check was dropped before completing".to_string(),
            ))
        })
    }

    /// Forget the cached result when the engine reports a different version
    pub fn observe_version(&self, version: &str) {
        let mut state = self.inner.state.lock();
        let stale = state
            .cached
            .as_ref()
            .is_some_and(|cached| cached.result.version != version);
        if stale {
            log::info!(
                "[CheckCoordinator] Version {} observed, invalidating cached result",
                version
            );
            state.cached = None;
        }
    }

    pub fn invalidate_cache(&self) {
        self.inner.state.lock().cached = None;
    }

    pub fn cached_result(&self) -> Option<UpdateResult> {
        let state = self.inner.state.lock();
        state
            .cached
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < self.inner.cache_ttl)
            .map(|cached| cached.result.clone())
    }

    pub fn is_checking(&self) -> bool {
        self.inner.state.lock().is_checking
    }
}

impl Inner {
    async fn fire(&self, generation: u64) {
        let waiters = {
            let mut state = self.state.lock();
            if state.generation != generation {
                // A later request re-armed the timer
                return;
            }
            let waiters = std::mem::take(&mut state.waiters);
            if state.is_checking {
                drop(state);
                log::info!(
                    "[CheckCoordinator] Check already running, answering {} caller(s) with no result",
                    waiters.len()
                );
                for waiter in waiters {
                    let _ = waiter.send(Ok(None));
                }
                return;
            }
            state.is_checking = true;
            waiters
        };

        log::info!(
            "[CheckCoordinator] Running check for {} caller(s)",
            waiters.len()
        );
        let outcome = self.check_with_retry().await;

        {
            let mut state = self.state.lock();
            state.is_checking = false;
            if let Ok(Some(result)) = &outcome {
                state.cached = Some(CachedResult {
                    result: result.clone(),
                    fetched_at: Instant::now(),
                });
            }
        }

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn check_with_retry(&self) -> CheckOutcome {
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            let failure = match tokio::time::timeout(
                self.attempt_timeout,
                self.engine.check_for_updates(),
            )
            .await
            {
                Ok(Ok(Some(info))) => {
                    self.finish(started);
                    log::info!("[CheckCoordinator] Update {} available", info.version);
                    self.journal
                        .info("check", &format!("Update {} available", info.version));
                    return Ok(Some(UpdateResult::new(info)));
                }
                Ok(Ok(None)) => {
                    self.finish(started);
                    log::info!("[CheckCoordinator] No update available");
                    return Ok(None);
                }
                Ok(Err(error)) if error.is_terminal() => {
                    self.finish(started);
                    log::info!("[CheckCoordinator] No update available: {}", error);
                    return Ok(None);
                }
                Ok(Err(error)) if error.is_network() => error.to_string(),
                Ok(Err(error)) => {
                    self.finish(started);
                    log::error!("[CheckCoordinator] Check failed: {}", error);
                    return Err(UpdateError::UnexpectedCheck(error.to_string()));
                }
                Err(_) => {
                    self.metrics.record_timeout();
                    format!(
                        "check timed out after {}ms",
                        self.attempt_timeout.as_millis()
                    )
                }
            };

            if attempt >= self.max_attempts {
                self.finish(started);
                log::error!(
                    "[CheckCoordinator] Check failed after {} attempts: {}",
                    attempt,
                    failure
                );
                self.journal.warn(
                    "check",
                    &format!("Giving up after {} attempts: {}", attempt, failure),
                );
                return Err(UpdateError::UnexpectedCheck(format!(
                    "{} (after {} attempts)",
                    failure, attempt
                )));
            }

            let delay = self.config.backoff_for_attempt(attempt);
            log::warn!(
                "[CheckCoordinator] Attempt {}/{} failed: {}. Retrying in {:?}",
                attempt,
                self.max_attempts,
                failure,
                delay
            );
            self.metrics.record_retry();
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn finish(&self, started: Instant) {
        self.metrics
            .record_check(started.elapsed().as_millis() as u64, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto_update::engine::fake::{CheckStep, FakeEngine};
    use crate::auto_update::engine::EngineError;
    use crate::auto_update::types::UpdateInfo;
    use futures_util::future::join_all;

    fn coordinator() -> (CheckCoordinator, Arc<FakeEngine>, Arc<MetricsCollector>) {
        let engine = Arc::new(FakeEngine::new());
        let metrics = Arc::new(MetricsCollector::new());
        let checks = CheckCoordinator::new(
            &UpdateConfig::default(),
            engine.clone(),
            metrics.clone(),
            UpdateJournal::disabled(),
        );
        (checks, engine, metrics)
    }

    fn found(version: &str) -> CheckStep {
        CheckStep::Found(UpdateInfo::new(version))
    }

    fn version_of(outcome: &CheckOutcome) -> Option<String> {
        match outcome {
            Ok(Some(result)) => Some(result.version.clone()),
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_check() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (checks, engine, _) = coordinator();
        engine.push_check(found("2.0.0"));

        let outcomes = join_all((0..5).map(|_| checks.request_check())).await;

        assert_eq!(engine.checks(), 1);
        for outcome in &outcomes {
            assert_eq!(version_of(outcome).as_deref(), Some("2.0.0"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_request_resets_the_debounce() {
        let (checks, engine, _) = coordinator();
        engine.push_check(found("2.0.0"));
        let start = Instant::now();

        let first = {
            let checks = checks.clone();
            tokio::spawn(async move { checks.request_check().await })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let second = checks.request_check().await;
        let first = first.await.unwrap();

        assert_eq!(engine.checks(), 1);
        assert!(start.elapsed() >= Duration::from_millis(3500));
        assert_eq!(version_of(&first), version_of(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let (checks, engine, metrics) = coordinator();
        engine.push_check(found("2.0.0"));
        engine.push_check(found("2.0.0"));

        checks.request_check().await.unwrap();
        assert_eq!(engine.checks(), 1);

        tokio::time::advance(Duration::from_secs(15 * 60) - Duration::from_millis(1)).await;
        let cached = checks.request_check().await;
        assert_eq!(version_of(&cached).as_deref(), Some("2.0.0"));
        assert_eq!(engine.checks(), 1);
        assert_eq!(metrics.snapshot().cache_hit_count, 1);

        tokio::time::advance(Duration::from_millis(2)).await;
        checks.request_check().await.unwrap();
        assert_eq!(engine.checks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observed_version_invalidates_cache() {
        let (checks, engine, _) = coordinator();
        engine.push_check(found("2.0.0"));
        engine.push_check(found("2.1.0"));

        checks.request_check().await.unwrap();
        checks.observe_version("2.0.0");
        assert!(checks.cached_result().is_some());

        checks.observe_version("2.1.0");
        assert!(checks.cached_result().is_none());
        let outcome = checks.request_check().await;
        assert_eq!(version_of(&outcome).as_deref(), Some("2.1.0"));
        assert_eq!(engine.checks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_are_retried_with_linear_backoff() {
        let (checks, engine, metrics) = coordinator();
        engine.push_check(CheckStep::Fail(EngineError::with_code(
            "getaddrinfo failed",
            "ENOTFOUND",
        )));
        engine.push_check(CheckStep::Fail(EngineError::new("connect ECONNREFUSED")));
        engine.push_check(found("2.0.0"));
        let start = Instant::now();

        let outcome = checks.request_check().await;

        assert_eq!(version_of(&outcome).as_deref(), Some("2.0.0"));
        assert_eq!(engine.checks(), 3);
        assert_eq!(metrics.snapshot().retry_count, 2);

        // Each gap is one 50ms engine round trip plus the backoff delay
        let gaps = engine.check_gaps();
        assert_eq!(gaps.len(), 2);
        let first_backoff = gaps[0] - Duration::from_millis(50);
        let second_backoff = gaps[1] - Duration::from_millis(50);
        assert!(
            first_backoff >= Duration::from_millis(2_000)
                && first_backoff < Duration::from_millis(2_010),
            "{:?}",
            first_backoff
        );
        assert!(
            second_backoff >= Duration::from_millis(4_000)
                && second_backoff < Duration::from_millis(4_010),
            "{:?}",
            second_backoff
        );

        // 2s debounce + 2s + 4s backoff + three 50ms engine round trips
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(8_150), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(9_000), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_message_means_no_update() {
        let (checks, engine, _) = coordinator();
        engine.push_check(CheckStep::Fail(EngineError::new(
            "No published versions on GitHub",
        )));

        assert_eq!(checks.request_check().await, Ok(None));
        assert_eq!(engine.checks(), 1);
        assert!(checks.cached_result().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_error_is_not_retried() {
        let (checks, engine, metrics) = coordinator();
        engine.push_check(CheckStep::Fail(EngineError::new("HTTP 500 Internal Server Error")));

        let outcome = checks.request_check().await;
        assert!(matches!(outcome, Err(UpdateError::UnexpectedCheck(_))));
        assert_eq!(engine.checks(), 1);
        assert_eq!(metrics.snapshot().retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_timeouts_propagate() {
        let (checks, engine, metrics) = coordinator();
        for _ in 0..3 {
            engine.push_check(CheckStep::Hang);
        }

        let outcome = checks.request_check().await;

        match outcome {
            Err(UpdateError::UnexpectedCheck(message)) => {
                assert!(message.contains("timed out"), "{}", message);
                assert!(message.contains("after 3 attempts"), "{}", message);
            }
            other => panic!("Expected exhausted check, got {:?}", other),
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.timeout_count, 3);
        assert_eq!(snapshot.retry_count, 2);
        assert_eq!(snapshot.check_count, 1);
        assert!(!checks.is_checking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_firing_during_running_check_gets_none() {
        let (checks, engine, _) = coordinator();
        engine.push_check(CheckStep::Hang);
        engine.push_check(found("2.0.0"));

        let running = {
            let checks = checks.clone();
            tokio::spawn(async move { checks.request_check().await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(checks.is_checking());

        assert_eq!(checks.request_check().await, Ok(None));

        let outcome = running.await.unwrap();
        assert_eq!(version_of(&outcome).as_deref(), Some("2.0.0"));
        assert_eq!(engine.checks(), 2);
    }
}
