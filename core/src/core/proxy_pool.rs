//! Proxy lifecycle pool.
//!
//! Owns every known proxy identity and hands them out one caller at a time.
//! Selection and marking happen under a single mutex, so two concurrent
//! `acquire` calls can never receive the same address. Among eligible proxies
//! the least recently used one wins; ties go to the lexically smaller address.
//!
//! Lifecycle: `add` inserts/revives (Alive) and retires (Dead), `acquire` marks
//! Active, `release` returns the proxy to Alive or, when the target detected
//! it, to Banned until the cooldown has elapsed. Records are never deleted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use log::debug;
use mockable::{Clock, DefaultClock};
use serde::{Deserialize, Serialize};

use crate::core::{AttemptResult, InfraErrorKind};
use crate::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    Alive,
    Dead,
    Active,
    Banned,
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyState::Alive => write!(f, "alive"),
            ProxyState::Dead => write!(f, "dead"),
            ProxyState::Active => write!(f, "active"),
            ProxyState::Banned => write!(f, "banned"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub address: String,
    pub state: ProxyState,
    pub last_used_at: DateTime<Utc>,
    pub last_banned_at: Option<DateTime<Utc>>,
    /// Present in the most recent source load.
    pub listed: bool,
}

impl Proxy {
    fn fresh(address: String) -> Self {
        Self {
            address,
            state: ProxyState::Alive,
            last_used_at: DateTime::<Utc>::UNIX_EPOCH,
            last_banned_at: None,
            listed: true,
        }
    }

    /// A cooldown too long to represent never ends.
    fn cooling_down(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        let Some(banned_at) = self.last_banned_at else {
            return false;
        };
        match TimeDelta::from_std(cooldown).ok().and_then(|d| banned_at.checked_add_signed(d)) {
            Some(until) => now < until,
            None => true,
        }
    }

    fn is_eligible(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        matches!(self.state, ProxyState::Alive | ProxyState::Banned)
            && self.listed
            && !self.cooling_down(now, cooldown)
    }
}

/// Counts produced by one `add` reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub revived: usize,
    pub retired: usize,
    pub listed: usize,
}

/// Point-in-time breakdown of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub alive: usize,
    pub dead: usize,
    pub active: usize,
    pub banned: usize,
    /// Banned proxies whose cooldown has not elapsed yet.
    pub cooling: usize,
    /// Proxies `acquire` could hand out right now.
    pub eligible: usize,
}

pub struct ProxyPool {
    records: Mutex<HashMap<String, Proxy>>,
    ban_cooldown: Duration,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl std::fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPool")
            .field("proxies", &self.len())
            .field("ban_cooldown", &self.ban_cooldown)
            .finish_non_exhaustive()
    }
}

impl ProxyPool {
    pub fn new(ban_cooldown: Duration) -> Self {
        Self::with_clock(ban_cooldown, Arc::new(DefaultClock))
    }

    pub fn with_clock(ban_cooldown: Duration, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ban_cooldown,
            clock,
        }
    }

    pub fn ban_cooldown(&self) -> Duration {
        self.ban_cooldown
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Proxy>> {
        // No mutation here can leave a record half-written.
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reconciles the pool against a freshly loaded proxy list.
    pub fn add<I, S>(&self, addresses: I) -> ReconcileReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let incoming: HashSet<String> = addresses
            .into_iter()
            .map(|a| a.as_ref().trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        let mut report = ReconcileReport {
            listed: incoming.len(),
            ..Default::default()
        };
        let mut records = self.lock();

        for (address, proxy) in records.iter_mut() {
            if incoming.contains(address) {
                proxy.listed = true;
                if proxy.state == ProxyState::Dead {
                    proxy.state = ProxyState::Alive;
                    report.revived += 1;
                }
            } else {
                if proxy.listed {
                    report.retired += 1;
                }
                proxy.listed = false;
                // An in-flight attempt keeps its proxy; release retires it.
                if proxy.state != ProxyState::Active {
                    proxy.state = ProxyState::Dead;
                }
            }
        }

        for address in incoming {
            if !records.contains_key(&address) {
                records.insert(address.clone(), Proxy::fresh(address));
                report.inserted += 1;
            }
        }

        debug!(
            "proxy pool reconciled: {} listed, {} new, {} revived, {} retired",
            report.listed, report.inserted, report.revived, report.retired
        );
        report
    }

    /// Selects the least recently used eligible proxy and marks it Active.
    pub fn acquire(&self) -> Result<Proxy, PoolError> {
        let now = self.clock.utc();
        let mut records = self.lock();

        let chosen = records
            .values_mut()
            .filter(|p| p.is_eligible(now, self.ban_cooldown))
            .min_by(|a, b| {
                a.last_used_at
                    .cmp(&b.last_used_at)
                    .then_with(|| a.address.cmp(&b.address))
            })
            .ok_or(PoolError::NoProxyAvailable)?;

        chosen.state = ProxyState::Active;
        Ok(chosen.clone())
    }

    /// `acquire` wrapped in a guard that releases the proxy when dropped.
    pub fn lease(self: &Arc<Self>) -> Result<ProxyLease, PoolError> {
        let proxy = self.acquire()?;
        Ok(ProxyLease {
            pool: Arc::clone(self),
            proxy,
            released: false,
        })
    }

    /// Returns an Active proxy to the pool with the outcome of its attempt.
    ///
    /// Returns `false` (and changes nothing) for unknown addresses and for
    /// proxies that are not currently Active.
    pub fn release(&self, address: &str, outcome: &AttemptResult) -> bool {
        let now = self.clock.utc();
        let mut records = self.lock();

        let Some(proxy) = records.get_mut(address) else {
            debug!("release of unknown proxy {} ignored", address);
            return false;
        };
        if proxy.state != ProxyState::Active {
            debug!("release of {} proxy {} ignored", proxy.state, address);
            return false;
        }

        match outcome {
            AttemptResult::Detected => {
                proxy.state = ProxyState::Banned;
                proxy.last_banned_at = Some(now);
            }
            _ => {
                proxy.state = ProxyState::Alive;
                proxy.last_used_at = now;
            }
        }
        if !proxy.listed {
            proxy.state = ProxyState::Dead;
        }
        true
    }

    pub fn get(&self, address: &str) -> Option<Proxy> {
        self.lock().get(address).cloned()
    }

    /// Every record, sorted by address.
    pub fn snapshot(&self) -> Vec<Proxy> {
        let mut proxies: Vec<Proxy> = self.lock().values().cloned().collect();
        proxies.sort_by(|a, b| a.address.cmp(&b.address));
        proxies
    }

    pub fn stats(&self) -> PoolStats {
        let now = self.clock.utc();
        let records = self.lock();
        let mut stats = PoolStats {
            total: records.len(),
            ..Default::default()
        };

        for proxy in records.values() {
            match proxy.state {
                ProxyState::Alive => stats.alive += 1,
                ProxyState::Dead => stats.dead += 1,
                ProxyState::Active => stats.active += 1,
                ProxyState::Banned => {
                    stats.banned += 1;
                    if proxy.cooling_down(now, self.ban_cooldown) {
                        stats.cooling += 1;
                    }
                }
            }
            if proxy.is_eligible(now, self.ban_cooldown) {
                stats.eligible += 1;
            }
        }
        stats
    }

    /// Imports persisted records. Nothing survives a restart in flight, so
    /// records saved as Active come back Alive (or Dead when unlisted).
    /// Records already in the pool are left untouched.
    pub fn restore(&self, proxies: Vec<Proxy>) -> usize {
        let mut records = self.lock();
        let mut restored = 0;

        for mut proxy in proxies {
            if records.contains_key(&proxy.address) {
                continue;
            }
            if proxy.state == ProxyState::Active {
                proxy.state = if proxy.listed { ProxyState::Alive } else { ProxyState::Dead };
            }
            records.insert(proxy.address.clone(), proxy);
            restored += 1;
        }
        restored
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Scoped ownership of one Active proxy.
///
/// Call `release` with the attempt outcome. A lease dropped without an explicit
/// release (panic, cancelled future) is released as a cancelled infra error so
/// the proxy never stays Active forever.
#[derive(Debug)]
pub struct ProxyLease {
    pool: Arc<ProxyPool>,
    proxy: Proxy,
    released: bool,
}

impl ProxyLease {
    pub fn address(&self) -> &str {
        &self.proxy.address
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn release(mut self, outcome: &AttemptResult) -> bool {
        self.released = true;
        self.pool.release(&self.proxy.address, outcome)
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        if !self.released {
            debug!("lease on {} dropped without release", self.proxy.address);
            self.pool.release(
                &self.proxy.address,
                &AttemptResult::InfraError { kind: InfraErrorKind::Cancelled },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::MutableClock;

    fn pool_with_clock(cooldown_secs: u64) -> (Arc<ProxyPool>, Arc<MutableClock>) {
        let clock = Arc::new(MutableClock::new(Utc::now()));
        let pool = Arc::new(ProxyPool::with_clock(
            Duration::from_secs(cooldown_secs),
            clock.clone(),
        ));
        (pool, clock)
    }

    fn success() -> AttemptResult {
        AttemptResult::Success { code: "ok".to_string() }
    }

    #[test]
    fn test_acquire_empty_pool() {
        let pool = ProxyPool::new(Duration::from_secs(60));
        assert_eq!(pool.acquire(), Err(PoolError::NoProxyAvailable));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_ban_rotates_to_next_proxy() {
        let (pool, _clock) = pool_with_clock(60);
        pool.add(["A", "B"]);

        let first = pool.acquire().unwrap();
        assert_eq!(first.address, "A");
        assert!(pool.release("A", &AttemptResult::Detected));

        let second = pool.acquire().unwrap();
        assert_eq!(second.address, "B");
        assert!(pool.release("B", &success()));

        // A is still cooling down, so B comes back even though it was just used.
        let third = pool.acquire().unwrap();
        assert_eq!(third.address, "B");
        assert_eq!(pool.get("A").unwrap().state, ProxyState::Banned);
    }

    #[test]
    fn test_cooldown_boundary() {
        let (pool, clock) = pool_with_clock(60);
        pool.add(["A"]);

        pool.acquire().unwrap();
        pool.release("A", &AttemptResult::Detected);

        clock.advance(Duration::from_secs(59));
        assert_eq!(pool.acquire(), Err(PoolError::NoProxyAvailable));
        assert_eq!(pool.stats().cooling, 1);

        clock.advance(Duration::from_secs(1));
        let proxy = pool.acquire().unwrap();
        assert_eq!(proxy.address, "A");
        assert_eq!(proxy.state, ProxyState::Active);

        pool.release("A", &success());
        assert_eq!(pool.get("A").unwrap().state, ProxyState::Alive);
    }

    #[test]
    fn test_least_recently_used_first() {
        let (pool, clock) = pool_with_clock(60);
        pool.add(["C", "A", "B"]);

        for address in ["A", "B", "C"] {
            assert_eq!(pool.acquire().unwrap().address, address);
        }
        clock.advance(Duration::from_secs(1));
        pool.release("B", &success());
        clock.advance(Duration::from_secs(1));
        pool.release("A", &success());
        clock.advance(Duration::from_secs(1));
        pool.release("C", &AttemptResult::TryAgain);

        assert_eq!(pool.acquire().unwrap().address, "B");
        assert_eq!(pool.acquire().unwrap().address, "A");
        assert_eq!(pool.acquire().unwrap().address, "C");
        assert_eq!(pool.acquire(), Err(PoolError::NoProxyAvailable));
    }

    #[test]
    fn test_release_updates_usage_history() {
        let (pool, clock) = pool_with_clock(60);
        pool.add(["A"]);
        pool.acquire().unwrap();
        clock.advance(Duration::from_secs(30));
        pool.release("A", &AttemptResult::InfraError { kind: InfraErrorKind::PageLoad });

        let proxy = pool.get("A").unwrap();
        assert_eq!(proxy.state, ProxyState::Alive);
        assert_eq!(proxy.last_used_at, clock.utc());
        assert!(proxy.last_banned_at.is_none());
    }

    #[test]
    fn test_release_is_tolerant() {
        let (pool, _clock) = pool_with_clock(60);
        pool.add(["A"]);

        assert!(!pool.release("missing", &success()));
        // Not Active, so nothing to release.
        assert!(!pool.release("A", &AttemptResult::Detected));
        assert_eq!(pool.get("A").unwrap().state, ProxyState::Alive);

        pool.acquire().unwrap();
        assert!(pool.release("A", &success()));
        assert!(!pool.release("A", &success()));
    }

    #[test]
    fn test_reconcile_marks_dead_and_revives() {
        let (pool, clock) = pool_with_clock(60);
        let report = pool.add(["A", "B", " ", "B"]);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.listed, 2);

        pool.acquire().unwrap();
        clock.advance(Duration::from_secs(5));
        pool.release("A", &success());
        let used_at = pool.get("A").unwrap().last_used_at;

        let report = pool.add(["B", "C"]);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.retired, 1);
        assert_eq!(pool.get("A").unwrap().state, ProxyState::Dead);
        assert_eq!(pool.len(), 3);

        let report = pool.add(["A", "B", "C"]);
        assert_eq!(report.revived, 1);
        let revived = pool.get("A").unwrap();
        assert_eq!(revived.state, ProxyState::Alive);
        assert_eq!(revived.last_used_at, used_at);

        // Same list again changes nothing.
        assert_eq!(pool.add(["A", "B", "C"]), ReconcileReport { listed: 3, ..Default::default() });
    }

    #[test]
    fn test_dead_proxy_never_acquired() {
        let (pool, _clock) = pool_with_clock(60);
        pool.add(["A"]);
        pool.add(Vec::<String>::new());
        assert_eq!(pool.acquire(), Err(PoolError::NoProxyAvailable));
        assert_eq!(pool.stats().dead, 1);
    }

    #[test]
    fn test_reconcile_keeps_active_until_released() {
        let (pool, _clock) = pool_with_clock(60);
        pool.add(["A", "B"]);
        let held = pool.acquire().unwrap();
        assert_eq!(held.address, "A");

        pool.add(["B"]);
        assert_eq!(pool.get("A").unwrap().state, ProxyState::Active);

        assert!(pool.release("A", &success()));
        assert_eq!(pool.get("A").unwrap().state, ProxyState::Dead);
        assert_eq!(pool.acquire().unwrap().address, "B");
    }

    #[test]
    fn test_banned_proxy_revived_keeps_cooldown() {
        let (pool, clock) = pool_with_clock(60);
        pool.add(["A"]);
        pool.acquire().unwrap();
        pool.release("A", &AttemptResult::Detected);

        pool.add(Vec::<String>::new());
        pool.add(["A"]);
        assert_eq!(pool.get("A").unwrap().state, ProxyState::Alive);
        assert_eq!(pool.acquire(), Err(PoolError::NoProxyAvailable));

        clock.advance(Duration::from_secs(60));
        assert_eq!(pool.acquire().unwrap().address, "A");
    }

    #[test]
    fn test_lease_released_on_drop() {
        let (pool, _clock) = pool_with_clock(60);
        pool.add(["A"]);
        {
            let lease = pool.lease().unwrap();
            assert_eq!(lease.address(), "A");
            assert_eq!(pool.get("A").unwrap().state, ProxyState::Active);
        }
        assert_eq!(pool.get("A").unwrap().state, ProxyState::Alive);

        let lease = pool.lease().unwrap();
        assert!(lease.release(&AttemptResult::Detected));
        assert_eq!(pool.get("A").unwrap().state, ProxyState::Banned);
    }

    #[test]
    fn test_stats_breakdown() {
        let (pool, _clock) = pool_with_clock(60);
        pool.add(["A", "B", "C", "D"]);
        pool.acquire().unwrap();
        pool.release("A", &AttemptResult::Detected);
        pool.acquire().unwrap();
        pool.add(["A", "B", "C"]);

        let stats = pool.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.banned, 1);
        assert_eq!(stats.cooling, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.alive, 1);
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.eligible, 1);
    }

    #[test]
    fn test_unbounded_cooldown_bans_for_good() {
        let pool = ProxyPool::new(Duration::from_secs(u64::MAX));
        pool.add(["A", "B"]);
        assert_eq!(pool.acquire().unwrap().address, "A");
        assert!(pool.release("A", &AttemptResult::Detected));

        assert_eq!(pool.acquire().unwrap().address, "B");
        let stats = pool.stats();
        assert_eq!(stats.cooling, 1);
        assert_eq!(stats.eligible, 0);
    }

    #[test]
    fn test_restore_clears_active() {
        let (pool, _clock) = pool_with_clock(60);
        pool.add(["A", "B"]);
        pool.acquire().unwrap();
        let saved = pool.snapshot();

        let (restored, _clock) = pool_with_clock(60);
        restored.add(["B"]);
        assert_eq!(restored.restore(saved), 1);
        assert_eq!(restored.get("A").unwrap().state, ProxyState::Alive);
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn test_concurrent_acquire_is_exclusive() {
        let (pool, _clock) = pool_with_clock(60);
        let addresses: Vec<String> = (0..50).map(|i| format!("10.0.0.{}:8080", i)).collect();
        pool.add(&addresses);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Ok(proxy) = pool.acquire() {
                        got.push(proxy.address);
                    }
                    got
                })
            })
            .collect();

        let mut all: Vec<String> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 50);
        assert_eq!(all.len(), 50);
    }
}
