pub mod core;
pub mod error;
pub mod modules;
pub mod utils;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use crate::core::clock::MutableClock;
pub use crate::core::gate::{ConcurrencyGate, GatePermit};
pub use crate::core::orchestrator::{AttemptReport, OrchestratorConfig, SolveOrchestrator};
pub use crate::core::proxy_pool::{PoolStats, Proxy, ProxyLease, ProxyPool, ProxyState, ReconcileReport};
pub use crate::core::retry::{Backoff, Decision, RetryPolicy};
pub use crate::core::scheduler::RequestScheduler;
pub use crate::core::state::PoolState;
pub use crate::core::{AttemptResult, InfraErrorKind, SolveOutcome, SolveReport, SolveRequest};
pub use crate::error::{ExecutorError, PoolError, RequestError, SourceError};
pub use crate::modules::executor::{Attempt, AttemptExecutor, CommandExecutor, ProxyAuth};
pub use crate::modules::proxy_source::{ProxySource, ReloadHandle};

/// Shared solver configuration. Durations are whole seconds unless the field
/// name says otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SolverConfig {
    pub concurrency: usize,
    pub solve_timeout: u64,
    pub attempt_timeout: u64,
    pub abort_grace_ms: u64,
    pub ban_cooldown: u64,
    pub poll_interval_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub max_attempts: Option<u32>,
    pub queue_timeout: Option<u64>,
    pub proxy_source: String,
    pub reload_interval: u64,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub solver_command: String,
    pub solver_args: Vec<String>,
    pub verbose: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            solve_timeout: 180,
            attempt_timeout: 60,
            abort_grace_ms: 5000,
            ban_cooldown: 45 * 60,
            poll_interval_ms: 1000,
            backoff_initial_ms: 1000,
            backoff_max_ms: 8000,
            max_attempts: None,
            queue_timeout: None,
            proxy_source: String::new(),
            reload_interval: 10 * 60,
            proxy_username: None,
            proxy_password: None,
            solver_command: "solver".to_string(),
            solver_args: Vec::new(),
            verbose: false,
        }
    }
}

impl SolverConfig {
    /// Reads a JSON config; missing fields keep their defaults.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let initial = Duration::from_millis(self.backoff_initial_ms);
        let max = Duration::from_millis(self.backoff_max_ms.max(self.backoff_initial_ms));
        let backoff = if initial == max {
            Backoff::Fixed(initial)
        } else {
            Backoff::Exponential { initial, max }
        };
        RetryPolicy::new(backoff).with_max_attempts(self.max_attempts)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            attempt_timeout: Duration::from_secs(self.attempt_timeout),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            abort_grace: Duration::from_millis(self.abort_grace_ms),
        }
    }

    pub fn solve_timeout(&self) -> Duration {
        Duration::from_secs(self.solve_timeout)
    }

    pub fn ban_cooldown(&self) -> Duration {
        Duration::from_secs(self.ban_cooldown)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval.max(1))
    }

    /// Credentials applied to every proxy, when both halves are set.
    pub fn proxy_auth(&self) -> Option<ProxyAuth> {
        match (&self.proxy_username, &self.proxy_password) {
            (Some(username), Some(password)) => Some(ProxyAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn source_ref(&self) -> Option<&str> {
        if self.proxy_source.is_empty() { None } else { Some(&self.proxy_source) }
    }
}

/// Output abstraction for solve progress.
/// The CLI implements this with colored terminal output; library users can
/// forward it anywhere.
pub trait SolveEventSink: Send + Sync {
    fn on_log(&self, level: &str, message: &str);
    fn on_attempt(&self, report: &AttemptReport);
    fn on_outcome(&self, report: &SolveReport);
}

pub type SinkRef = Arc<dyn SolveEventSink>;

/// Discards every event.
pub struct NullSink;

impl NullSink {
    pub fn new_ref() -> SinkRef {
        Arc::new(Self)
    }
}

impl SolveEventSink for NullSink {
    fn on_log(&self, _level: &str, _message: &str) {}
    fn on_attempt(&self, _report: &AttemptReport) {}
    fn on_outcome(&self, _report: &SolveReport) {}
}

/// Terminal output sink for CLI usage.
pub struct ConsoleSink {
    verbose: bool,
}

impl ConsoleSink {
    pub fn new_ref(verbose: bool) -> SinkRef {
        Arc::new(Self { verbose })
    }
}

/// Paints a log line by level. Unknown levels pass through unstyled.
fn style_log_line(level: &str, message: &str) -> colored::ColoredString {
    use colored::Colorize;
    match level {
        "error" => message.bright_red(),
        "warn" => message.yellow(),
        "phase" => message.cyan().bold(),
        "info" => message.normal(),
        "debug" => message.dimmed(),
        _ => message.normal(),
    }
}

impl SolveEventSink for ConsoleSink {
    fn on_log(&self, level: &str, message: &str) {
        use std::io::Write;
        if level == "debug" && !self.verbose {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        write!(stdout, "{}\r\n", style_log_line(level, message)).ok();
        stdout.flush().ok();
    }

    fn on_attempt(&self, report: &AttemptReport) {
        use colored::*;
        use std::io::Write;
        if !self.verbose {
            return;
        }
        let label = match &report.result {
            AttemptResult::Success { .. } => report.result.to_string().green(),
            AttemptResult::Detected => report.result.to_string().red(),
            _ => report.result.to_string().yellow(),
        };
        print!(
            "{}\r\n",
            format!(
                "    #{} attempt {} via {} → {} ({}ms)",
                report.request_id,
                report.number,
                report.proxy.white(),
                label,
                report.elapsed.as_millis().to_string().dimmed()
            )
        );
        std::io::stdout().flush().ok();
    }

    fn on_outcome(&self, report: &SolveReport) {
        use colored::*;
        use std::io::Write;
        let line = match &report.outcome {
            SolveOutcome::Solved { code } => format!(
                "{} #{} solved in {} attempt(s): {}",
                "[+]".green().bold(),
                report.request_id,
                report.attempts,
                code.bright_yellow()
            ),
            other => format!(
                "{} #{} {} after {} attempt(s)",
                "[!]".red().bold(),
                report.request_id,
                other.to_string().red(),
                report.attempts
            ),
        };
        print!("{}\r\n", line);
        std::io::stdout().flush().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SolverConfig::default();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.solve_timeout(), Duration::from_secs(180));
        assert_eq!(config.ban_cooldown(), Duration::from_secs(2700));
        assert!(config.proxy_auth().is_none());
        assert!(config.source_ref().is_none());
    }

    #[test]
    fn test_config_partial_json() {
        let config: SolverConfig =
            serde_json::from_str(r#"{"concurrency": 3, "maxAttempts": 5, "proxySource": "proxies.txt"}"#).unwrap();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.max_attempts, Some(5));
        assert_eq!(config.source_ref(), Some("proxies.txt"));
        assert_eq!(config.attempt_timeout, 60);
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solver.json");
        std::fs::write(&path, r#"{"solveTimeout": 30, "proxyUsername": "u", "proxyPassword": "p"}"#).unwrap();

        let config = SolverConfig::from_file(&path.to_string_lossy()).unwrap();
        assert_eq!(config.solve_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.proxy_auth(),
            Some(ProxyAuth { username: "u".to_string(), password: "p".to_string() })
        );
        assert!(SolverConfig::from_file("/no/such/config.json").is_err());
    }

    #[test]
    fn test_log_line_styles() {
        colored::control::set_override(false);
        assert_eq!(style_log_line("warn", "[!] slow").to_string(), "[!] slow");
        assert_eq!(style_log_line("nonsense", "plain").to_string(), "plain");
        colored::control::unset_override();

        assert_eq!(style_log_line("error", "x").fgcolor(), Some(colored::Color::BrightRed));
        assert_eq!(style_log_line("phase", "x").fgcolor(), Some(colored::Color::Cyan));
        assert_eq!(style_log_line("info", "x").fgcolor(), None);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let mut config = SolverConfig {
            max_attempts: Some(2),
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts(), Some(2));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(8));

        config.backoff_max_ms = config.backoff_initial_ms;
        assert_eq!(config.retry_policy().backoff_for(10), Duration::from_secs(1));
    }
}
