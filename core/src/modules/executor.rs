//! Attempt execution: the boundary between orchestration and the actual solver.
//!
//! The orchestrator only sees [`AttemptExecutor`]. [`CommandExecutor`] is the
//! stock implementation, driving an external solver program once per attempt
//! and reading its verdict from stdout as JSON lines:
//!
//! ```text
//! {"status": "success", "code": "03AGdBq24..."}
//! {"status": "detected"}
//! {"status": "error", "kind": "page_load"}
//! ```

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, timeout_at, Instant};

use crate::core::{AttemptResult, InfraErrorKind};
use crate::error::ExecutorError;
use crate::utils;

/// How long a solver may keep running after it has printed its verdict.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// One execution of the solve operation against one proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub request_id: u64,
    /// 1-based attempt number within the request.
    pub number: u32,
    pub page_url: String,
    pub site_key: String,
    pub proxy: String,
    pub deadline: Instant,
}

impl Attempt {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Runs a single attempt and classifies it.
///
/// Implementations must stop working by `attempt.deadline` and must abort
/// when the returned future is dropped. They must not retry internally.
#[async_trait]
pub trait AttemptExecutor: Send + Sync {
    async fn run(&self, attempt: &Attempt) -> Result<AttemptResult, ExecutorError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Spawns an external solver for every attempt.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    proxy_auth: Option<ProxyAuth>,
}

impl CommandExecutor {
    pub fn new(program: &str) -> Result<Self, ExecutorError> {
        let program = utils::get_binary_path(program)
            .ok_or_else(|| ExecutorError::NotFound(program.to_string()))?;
        Ok(Self {
            program,
            args: Vec::new(),
            proxy_auth: None,
        })
    }

    /// Arguments placed before the per-attempt flags.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_proxy_auth(mut self, auth: Option<ProxyAuth>) -> Self {
        self.proxy_auth = auth;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn build_args(&self, attempt: &Attempt) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "--pageurl".to_string(),
            attempt.page_url.clone(),
            "--sitekey".to_string(),
            attempt.site_key.clone(),
            "--proxy".to_string(),
            attempt.proxy.clone(),
            "--timeout".to_string(),
            attempt.remaining().as_secs().max(1).to_string(),
        ]);
        if let Some(ref auth) = self.proxy_auth {
            args.extend([
                "--proxy-user".to_string(),
                auth.username.clone(),
                "--proxy-pass".to_string(),
                auth.password.clone(),
            ]);
        }
        args
    }
}

#[async_trait]
impl AttemptExecutor for CommandExecutor {
    async fn run(&self, attempt: &Attempt) -> Result<AttemptResult, ExecutorError> {
        let mut child = Command::new(&self.program)
            .args(self.build_args(attempt))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecutorError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::NoResult("stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let verdict = async {
            while let Some(line) = lines.next_line().await? {
                if let Some(result) = parse_status_line(&line)? {
                    return Ok::<_, ExecutorError>(Some(result));
                }
            }
            Ok(None)
        };

        match timeout_at(attempt.deadline, verdict).await {
            Ok(Ok(Some(result))) => {
                if timeout(EXIT_GRACE, child.wait()).await.is_err() {
                    child.start_kill().ok();
                }
                Ok(result)
            }
            Ok(Ok(None)) => {
                let exited = timeout_at(attempt.deadline, child.wait()).await;
                match exited {
                    Ok(status) => Err(ExecutorError::NoResult(status?.to_string())),
                    Err(_) => {
                        debug!(
                            "solver for request #{} attempt {} closed stdout but kept running past its deadline",
                            attempt.request_id, attempt.number
                        );
                        child.start_kill().ok();
                        Ok(AttemptResult::TimedOut)
                    }
                }
            }
            Ok(Err(e)) => {
                child.start_kill().ok();
                Err(e)
            }
            Err(_) => {
                debug!("solver for request #{} attempt {} hit its deadline", attempt.request_id, attempt.number);
                child.start_kill().ok();
                Ok(AttemptResult::TimedOut)
            }
        }
    }
}

/// Extracts a verdict from one line of solver output.
///
/// Returns `Ok(None)` for lines that are not JSON objects with a `status`
/// field, so the solver is free to print progress.
pub fn parse_status_line(line: &str) -> Result<Option<AttemptResult>, ExecutorError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let Some(status) = value.get("status").and_then(|s| s.as_str()) else {
        return Ok(None);
    };

    let result = match status.to_ascii_lowercase().as_str() {
        "success" => {
            let code = value
                .get("code")
                .and_then(|c| c.as_str())
                .map(str::trim)
                .unwrap_or("");
            if code.is_empty() {
                return Err(ExecutorError::NoResult("success reported without a code".to_string()));
            }
            AttemptResult::Success { code: code.to_string() }
        }
        "detected" => AttemptResult::Detected,
        "tryagain" | "try_again" | "retry" => AttemptResult::TryAgain,
        "timeout" | "timedout" | "timed_out" => AttemptResult::TimedOut,
        "error" | "infra_error" => {
            let kind = value
                .get("kind")
                .and_then(|k| k.as_str())
                .map(InfraErrorKind::from_label)
                .unwrap_or(InfraErrorKind::Other);
            AttemptResult::InfraError { kind }
        }
        other => return Err(ExecutorError::UnknownStatus(other.to_string())),
    };
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(deadline: Duration) -> Attempt {
        Attempt {
            request_id: 1,
            number: 1,
            page_url: "https://example.com/login".to_string(),
            site_key: "6Le-wvkSAAAAAPBMRTvw0Q4Muexq9bi0DJwx_mJ-".to_string(),
            proxy: "10.0.0.1:3128".to_string(),
            deadline: Instant::now() + deadline,
        }
    }

    fn shell(script: &str) -> CommandExecutor {
        CommandExecutor::new("sh")
            .unwrap()
            .with_args(vec!["-c".to_string(), script.to_string(), "solver".to_string()])
    }

    #[test]
    fn test_parse_status_lines() {
        assert_eq!(
            parse_status_line(r#"{"status":"success","code":"OK123"}"#).unwrap(),
            Some(AttemptResult::Success { code: "OK123".to_string() })
        );
        assert_eq!(parse_status_line(r#"{"status":"Detected"}"#).unwrap(), Some(AttemptResult::Detected));
        assert_eq!(parse_status_line(r#"{"status":"try_again"}"#).unwrap(), Some(AttemptResult::TryAgain));
        assert_eq!(parse_status_line(r#"{"status":"timeout"}"#).unwrap(), Some(AttemptResult::TimedOut));
        assert_eq!(
            parse_status_line(r#"{"status":"error","kind":"page_load"}"#).unwrap(),
            Some(AttemptResult::InfraError { kind: InfraErrorKind::PageLoad })
        );
        assert_eq!(
            parse_status_line(r#"{"status":"error"}"#).unwrap(),
            Some(AttemptResult::InfraError { kind: InfraErrorKind::Other })
        );
    }

    #[test]
    fn test_parse_ignores_chatter() {
        assert_eq!(parse_status_line("").unwrap(), None);
        assert_eq!(parse_status_line("Loading page...").unwrap(), None);
        assert_eq!(parse_status_line(r#"{"progress": 40}"#).unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_bad_verdicts() {
        assert!(matches!(
            parse_status_line(r#"{"status":"success"}"#),
            Err(ExecutorError::NoResult(_))
        ));
        assert!(matches!(
            parse_status_line(r#"{"status":"maybe"}"#),
            Err(ExecutorError::UnknownStatus(s)) if s == "maybe"
        ));
    }

    #[test]
    fn test_build_args_includes_attempt_and_auth() {
        let executor = CommandExecutor::new("sh")
            .unwrap()
            .with_args(vec!["solve.py".to_string()])
            .with_proxy_auth(Some(ProxyAuth {
                username: "user".to_string(),
                password: "pass".to_string(),
            }));
        let args = executor.build_args(&attempt(Duration::from_secs(30)));

        assert_eq!(args[0], "solve.py");
        let pos = args.iter().position(|a| a == "--proxy").unwrap();
        assert_eq!(args[pos + 1], "10.0.0.1:3128");
        assert!(args.windows(2).any(|w| w[0] == "--proxy-user" && w[1] == "user"));
        assert!(args.windows(2).any(|w| w[0] == "--proxy-pass" && w[1] == "pass"));
        assert!(args.contains(&"--timeout".to_string()));
    }

    #[test]
    fn test_missing_binary() {
        assert!(matches!(
            CommandExecutor::new("definitely-not-a-solver-binary"),
            Err(ExecutorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_command_reports_success() {
        let executor = shell(r#"echo "warming up"; echo '{"status":"success","code":"OK123"}'"#);
        let result = executor.run(&attempt(Duration::from_secs(10))).await.unwrap();
        assert_eq!(result, AttemptResult::Success { code: "OK123".to_string() });
    }

    #[tokio::test]
    async fn test_command_reports_detection() {
        let executor = shell(r#"echo '{"status":"detected"}'"#);
        let result = executor.run(&attempt(Duration::from_secs(10))).await.unwrap();
        assert_eq!(result, AttemptResult::Detected);
    }

    #[tokio::test]
    async fn test_command_without_verdict() {
        let executor = shell("echo nothing useful; exit 3");
        let err = executor.run(&attempt(Duration::from_secs(10))).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NoResult(_)));
        assert_eq!(err.kind(), InfraErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_command_deadline_times_out() {
        let executor = shell("sleep 30");
        let started = std::time::Instant::now();
        let result = executor.run(&attempt(Duration::from_millis(300))).await.unwrap();
        assert_eq!(result, AttemptResult::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_closed_stdout_still_bounded_by_deadline() {
        let executor = shell("exec 1>&-; sleep 30");
        let started = std::time::Instant::now();

        let result = executor.run(&attempt(Duration::from_millis(300))).await.unwrap();

        assert_eq!(result, AttemptResult::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
