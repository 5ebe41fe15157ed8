//! System-wide bound on concurrently running solve loops.
//!
//! A thin wrapper over a tokio semaphore whose permits carry their own release:
//! dropping a `GatePermit` frees the slot on every exit path, including panics
//! and cancelled futures. Active and peak counts are tracked for reporting.

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_CAPACITY: usize = 10;

#[derive(Debug, Default)]
struct GateCounters {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<GateCounters>,
}

impl ConcurrencyGate {
    /// A capacity of zero is raised to one; a gate that admits nobody would
    /// hang every request.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(GateCounters::default()),
        }
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> GatePermit {
        // The semaphore is private and never closed.
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("gate semaphore closed unexpectedly");

        let active = self.counters.active.fetch_add(1, SeqCst) + 1;
        self.counters.peak.fetch_max(active, SeqCst);

        GatePermit {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn active(&self) -> usize {
        self.counters.active.load(SeqCst)
    }

    /// Highest number of slots held at once since the gate was created.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(SeqCst)
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<GateCounters>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, SeqCst);
    }
}
