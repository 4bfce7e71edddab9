//! Layered runtime configuration for the orchestrator binary.
//!
//! Mirrors the teacher's `ExecutionLimits::from_env` layering style: start
//! from safe defaults, let environment variables override them, and offer
//! a couple of named presets for common deployment shapes.

use std::time::Duration;

/// Hard per-task attempt cap from spec ss4.6 policy 6. Not configurable --
/// the Oracle is expected to escalate well before this bound, so it exists
/// purely as a backstop.
pub const MAX_ATTEMPTS_PER_TASK: u32 = 10;

/// Grace window between SIGTERM and SIGKILL when cancelling an invocation
/// or escalation (spec ss4.3).
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one JSON file per plan (`<plan_id>.json`).
    pub state_dir: std::path::PathBuf,
    /// Directory holding one lock file per plan (`<plan_id>.lock`).
    pub lock_dir: std::path::PathBuf,
    /// Path to the coding-agent CLI binary (the Workspace Invoker's target).
    pub workspace_binary: String,
    /// Path to the small LLM CLI used as the Interpretation Oracle.
    pub oracle_binary: String,
    /// Default model identifier passed to the coding agent.
    pub default_model: String,
    /// Wall-clock cap per coding-agent invocation.
    pub invocation_timeout: Duration,
    /// Wall-clock cap per oracle subprocess call.
    pub oracle_timeout: Duration,
    /// Oracle subprocess retry budget (spec ss4.4: "up to 3 attempts").
    pub oracle_max_retries: u32,
    /// Hard turn-count backstop passed to the coding agent as `max_turns`.
    pub max_turns: u32,
    /// Tool names the coding agent is allowed to use.
    pub allowed_tools: Vec<String>,
    /// Optional webhook for out-of-band escalation notifications.
    pub escalation_webhook: Option<String>,
    /// OTLP collector endpoint; `None` disables trace export.
    pub otel_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_data_dir().join("state"),
            lock_dir: default_data_dir().join("locks"),
            workspace_binary: "claude".to_string(),
            oracle_binary: "claude".to_string(),
            default_model: "sonnet".to_string(),
            invocation_timeout: Duration::from_secs(20 * 60),
            oracle_timeout: Duration::from_secs(30),
            oracle_max_retries: 3,
            max_turns: 50,
            allowed_tools: vec![
                "Read".to_string(),
                "Write".to_string(),
                "Edit".to_string(),
                "Bash".to_string(),
                "Glob".to_string(),
                "Grep".to_string(),
            ],
            escalation_webhook: None,
            otel_endpoint: None,
        }
    }
}

fn default_data_dir() -> std::path::PathBuf {
    std::env::var_os("ORCH_DATA_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from(".orchestrator"))
}

impl Config {
    /// Build configuration from environment variables, falling back to
    /// [`Config::default`] for anything unset.
    ///
    /// Supported variables:
    /// - `ORCH_STATE_DIR`, `ORCH_LOCK_DIR`
    /// - `ORCH_WORKSPACE_BIN`, `ORCH_ORACLE_BIN`
    /// - `ORCH_MODEL`
    /// - `ORCH_INVOCATION_TIMEOUT_SECS`, `ORCH_ORACLE_TIMEOUT_SECS`
    /// - `ORCH_ORACLE_MAX_RETRIES`, `ORCH_MAX_TURNS`
    /// - `ORCH_ESCALATION_WEBHOOK`
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("ORCH_STATE_DIR") {
            config.state_dir = dir.into();
        }
        if let Ok(dir) = std::env::var("ORCH_LOCK_DIR") {
            config.lock_dir = dir.into();
        }
        if let Ok(bin) = std::env::var("ORCH_WORKSPACE_BIN") {
            config.workspace_binary = bin;
        }
        if let Ok(bin) = std::env::var("ORCH_ORACLE_BIN") {
            config.oracle_binary = bin;
        }
        if let Ok(model) = std::env::var("ORCH_MODEL") {
            config.default_model = model;
        }
        if let Ok(val) = std::env::var("ORCH_INVOCATION_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                config.invocation_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(val) = std::env::var("ORCH_ORACLE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                config.oracle_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(val) = std::env::var("ORCH_ORACLE_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                config.oracle_max_retries = n;
            }
        }
        if let Ok(val) = std::env::var("ORCH_MAX_TURNS") {
            if let Ok(n) = val.parse() {
                config.max_turns = n;
            }
        }
        if let Ok(url) = std::env::var("ORCH_ESCALATION_WEBHOOK") {
            config.escalation_webhook = Some(url);
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otel_endpoint = Some(endpoint);
        }

        config
    }

    /// Tight timeout budget for CI-like environments: short invocation and
    /// oracle timeouts, fewer oracle retries. Named the way the teacher
    /// names its `strict`/`relaxed` limit presets.
    pub fn strict() -> Self {
        Self {
            invocation_timeout: Duration::from_secs(5 * 60),
            oracle_timeout: Duration::from_secs(10),
            oracle_max_retries: 2,
            ..Self::default()
        }
    }

    /// Generous timeout budget for long-running, human-supervised sessions.
    pub fn relaxed() -> Self {
        Self {
            invocation_timeout: Duration::from_secs(60 * 60),
            oracle_timeout: Duration::from_secs(60),
            oracle_max_retries: 5,
            ..Self::default()
        }
    }
}
