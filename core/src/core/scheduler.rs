use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::core::gate::ConcurrencyGate;
use crate::core::orchestrator::SolveOrchestrator;
use crate::core::proxy_pool::ProxyPool;
use crate::core::{SolveOutcome, SolveReport, SolveRequest};
use crate::modules::executor::AttemptExecutor;
use crate::{SinkRef, SolverConfig};

/// Entry point for solve requests.
///
/// Every request waits for a gate slot, then runs the orchestrator under its
/// own deadline. Time spent queued at the gate does not count against that
/// deadline; `queue_timeout` optionally bounds it separately.
pub struct RequestScheduler {
    gate: ConcurrencyGate,
    orchestrator: SolveOrchestrator,
    queue_timeout: Option<Duration>,
    next_id: AtomicU64,
    sink: SinkRef,
}

impl RequestScheduler {
    pub fn new(orchestrator: SolveOrchestrator, gate: ConcurrencyGate) -> Self {
        let sink = Arc::clone(orchestrator.sink());
        Self {
            gate,
            orchestrator,
            queue_timeout: None,
            next_id: AtomicU64::new(0),
            sink,
        }
    }

    /// Wires pool, executor, policy and gate from one config.
    pub fn from_config(
        pool: Arc<ProxyPool>,
        executor: Arc<dyn AttemptExecutor>,
        config: &SolverConfig,
        sink: SinkRef,
    ) -> Self {
        let orchestrator =
            SolveOrchestrator::new(pool, executor, config.retry_policy(), config.orchestrator_config())
                .with_sink(sink);
        Self::new(orchestrator, ConcurrencyGate::new(config.concurrency))
            .with_queue_timeout(config.queue_timeout.map(Duration::from_secs))
    }

    pub fn with_queue_timeout(mut self, queue_timeout: Option<Duration>) -> Self {
        self.queue_timeout = queue_timeout;
        self
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        self.orchestrator.pool()
    }

    pub async fn solve(&self, request: SolveRequest) -> SolveOutcome {
        self.solve_report(request).await.outcome
    }

    pub async fn solve_report(&self, request: SolveRequest) -> SolveReport {
        let request_id = self.next_id.fetch_add(1, SeqCst) + 1;
        let queued_at = Instant::now();

        let permit = match self.queue_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.gate.acquire()).await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("request #{} gave up after {:?} waiting for a solver slot", request_id, limit);
                    let report = SolveReport {
                        request_id,
                        outcome: SolveOutcome::TimedOut,
                        attempts: 0,
                        elapsed: queued_at.elapsed(),
                    };
                    self.sink.on_outcome(&report);
                    return report;
                }
            },
            None => self.gate.acquire().await,
        };
        debug!(
            "request #{} admitted after {:?} ({} of {} slots busy)",
            request_id,
            queued_at.elapsed(),
            self.gate.active(),
            self.gate.capacity()
        );

        let report = self.orchestrator.run(request_id, &request).await;
        drop(permit);

        info!(
            "request #{} finished: {} after {} attempt(s) in {:.1?}",
            request_id, report.outcome, report.attempts, report.elapsed
        );
        self.sink.on_outcome(&report);
        report
    }

    /// Solves a batch concurrently; the gate still bounds how many run at once.
    /// Reports come back in request order.
    pub async fn solve_all(&self, requests: Vec<SolveRequest>) -> Vec<SolveReport> {
        join_all(requests.into_iter().map(|request| self.solve_report(request))).await
    }
}
