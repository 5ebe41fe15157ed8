use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, warn};
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::core::proxy_pool::{ProxyLease, ProxyPool};
use crate::core::retry::{Decision, RetryPolicy};
use crate::core::{AttemptResult, InfraErrorKind, SolveOutcome, SolveReport, SolveRequest};
use crate::error::PoolError;
use crate::modules::executor::{Attempt, AttemptExecutor};
use crate::{NullSink, SinkRef};

/// Stand-in for "no deadline" when a configured duration does not fit in an
/// `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn instant_after(base: Instant, duration: Duration) -> Instant {
    base.checked_add(duration).unwrap_or_else(|| base + FAR_FUTURE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Upper bound for a single attempt, clipped to what is left of the
    /// request deadline.
    pub attempt_timeout: Duration,
    /// Wait between pool polls while no proxy is eligible.
    pub poll_interval: Duration,
    /// Extra time an executor gets past its deadline before it is dropped.
    pub abort_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            abort_grace: Duration::from_secs(5),
        }
    }
}

/// What one attempt did, as handed to the event sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub request_id: u64,
    pub number: u32,
    pub proxy: String,
    pub result: AttemptResult,
    pub elapsed: Duration,
}

/// Retry loop driving one request to a terminal outcome.
///
/// Each round:
/// 1. Leases the least recently used eligible proxy, polling while the pool
///    has none
/// 2. Runs one attempt with a deadline clipped to the request deadline
/// 3. Releases the proxy with the attempt's outcome (always, before deciding)
/// 4. Asks the retry policy whether to stop, retry now, or back off
pub struct SolveOrchestrator {
    pool: Arc<ProxyPool>,
    executor: Arc<dyn AttemptExecutor>,
    policy: RetryPolicy,
    config: OrchestratorConfig,
    sink: SinkRef,
}

impl SolveOrchestrator {
    pub fn new(
        pool: Arc<ProxyPool>,
        executor: Arc<dyn AttemptExecutor>,
        policy: RetryPolicy,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            executor,
            policy,
            config,
            sink: NullSink::new_ref(),
        }
    }

    pub fn with_sink(mut self, sink: SinkRef) -> Self {
        self.sink = sink;
        self
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn sink(&self) -> &SinkRef {
        &self.sink
    }

    /// Runs `request` until it is solved, exhausted, out of time, or starved
    /// of proxies. The deadline starts now.
    pub async fn run(&self, request_id: u64, request: &SolveRequest) -> SolveReport {
        let started = Instant::now();
        let deadline = instant_after(started, request.timeout);
        let mut attempts: u32 = 0;

        let outcome = loop {
            if attempts > 0 && Instant::now() >= deadline {
                break SolveOutcome::TimedOut;
            }

            let Some(lease) = self.acquire_proxy(request_id, deadline).await else {
                break SolveOutcome::NoProxyAvailable;
            };
            attempts += 1;

            let attempt = Attempt {
                request_id,
                number: attempts,
                page_url: request.page_url.clone(),
                site_key: request.site_key.clone(),
                proxy: lease.address().to_string(),
                deadline: deadline.min(instant_after(Instant::now(), self.config.attempt_timeout)),
            };
            debug!("request #{} attempt {} via {}", request_id, attempts, attempt.proxy);

            let attempt_started = Instant::now();
            let result = self.run_attempt(&attempt).await;
            lease.release(&result);

            self.sink.on_attempt(&AttemptReport {
                request_id,
                number: attempts,
                proxy: attempt.proxy,
                result: result.clone(),
                elapsed: attempt_started.elapsed(),
            });

            let decision = self.policy.decide(&result, attempts, started.elapsed(), request.timeout);
            match (decision, result) {
                (Decision::StopSuccess, AttemptResult::Success { code }) => {
                    break SolveOutcome::Solved { code };
                }
                (Decision::StopTimedOut, _) => break SolveOutcome::TimedOut,
                (Decision::StopExhausted, _) | (Decision::StopSuccess, _) => break SolveOutcome::Exhausted,
                (Decision::Retry { after }, _) => {
                    if !after.is_zero() {
                        sleep_until(deadline.min(instant_after(Instant::now(), after))).await;
                    }
                }
            }
        };

        SolveReport {
            request_id,
            outcome,
            attempts,
            elapsed: started.elapsed(),
        }
    }

    /// Leases a proxy, polling until `deadline` while none is eligible.
    async fn acquire_proxy(&self, request_id: u64, deadline: Instant) -> Option<ProxyLease> {
        let mut waiting = false;
        loop {
            match self.pool.lease() {
                Ok(lease) => return Some(lease),
                Err(PoolError::NoProxyAvailable) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if !waiting {
                debug!("request #{} waiting for a free proxy", request_id);
                waiting = true;
            }
            sleep_until(deadline.min(instant_after(now, self.config.poll_interval))).await;
        }
    }

    /// Runs the executor and folds every way it can end into an `AttemptResult`.
    async fn run_attempt(&self, attempt: &Attempt) -> AttemptResult {
        let hard_stop = instant_after(attempt.deadline, self.config.abort_grace);
        let run = AssertUnwindSafe(self.executor.run(attempt)).catch_unwind();

        match timeout_at(hard_stop, run).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => {
                warn!(
                    "request #{} attempt {} via {} failed: {}",
                    attempt.request_id, attempt.number, attempt.proxy, e
                );
                AttemptResult::InfraError { kind: e.kind() }
            }
            Ok(Err(_panic)) => {
                warn!(
                    "request #{} attempt {} via {}: executor panicked",
                    attempt.request_id, attempt.number, attempt.proxy
                );
                AttemptResult::InfraError { kind: InfraErrorKind::Crash }
            }
            Err(_) => {
                warn!(
                    "request #{} attempt {} via {} overran its deadline, abandoning",
                    attempt.request_id, attempt.number, attempt.proxy
                );
                AttemptResult::TimedOut
            }
        }
    }
}
