//! Proxy pool persistence across restarts.
//!
//! Saves every proxy record, usage and ban history included, to a JSON file.
//! Uses atomic write (tmp + rename) so a process killed mid-flush leaves the
//! previous snapshot intact.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::proxy_pool::{Proxy, ProxyPool};

const STATE_FILE: &str = ".solvepool-state.json";

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolState {
    pub proxies: Vec<Proxy>,
    pub saved_at: DateTime<Utc>,
}

impl PoolState {
    pub fn capture(pool: &ProxyPool) -> Self {
        Self {
            proxies: pool.snapshot(),
            saved_at: Utc::now(),
        }
    }

    pub fn default_path() -> &'static str {
        STATE_FILE
    }

    /// Atomic write: serialize to .tmp, then rename over the real file.
    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        let tmp = format!("{}.tmp", path);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &str) -> Option<Self> {
        let data = fs::read_to_string(path).ok()?;
        serde_json::from_str(&data).ok()
    }

    /// Hands the saved records to `pool`; returns how many were imported.
    pub fn restore_into(self, pool: &ProxyPool) -> usize {
        pool.restore(self.proxies)
    }

    pub fn exists(path: &str) -> bool {
        Path::new(path).exists()
    }
}
