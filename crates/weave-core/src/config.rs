use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeaveError};
use crate::failure::{ErrorCode, Severity};

/// Top-level Weave configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeaveConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub error_router: ErrorRouterConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Event queue and worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Number of worker loops pulling from the queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Upper bound for one hook invocation.
    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,
    /// Per-agent invocation timeout (0 = none).
    #[serde(default)]
    pub agent_timeout_ms: u64,
    /// Successor events beyond this many routing hops are dropped.
    #[serde(default = "default_max_route_hops")]
    pub max_route_hops: u32,
    /// Terminated sessions remembered at once; the oldest is forgotten first.
    #[serde(default = "default_max_terminated_sessions")]
    pub max_terminated_sessions: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            workers: default_workers(),
            callback_timeout_ms: default_callback_timeout_ms(),
            agent_timeout_ms: 0,
            max_route_hops: default_max_route_hops(),
            max_terminated_sessions: default_max_terminated_sessions(),
        }
    }
}

impl RunnerConfig {
    pub fn agent_timeout(&self) -> Option<Duration> {
        (self.agent_timeout_ms > 0).then(|| Duration::from_millis(self.agent_timeout_ms))
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }
}

fn default_queue_size() -> usize { 100 }
fn default_workers() -> usize { 1 }
fn default_callback_timeout_ms() -> u64 { 5_000 }
fn default_max_route_hops() -> u32 { 50 }
fn default_max_terminated_sessions() -> usize { 10_000 }

/// Execution topology applied to the registered agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationMode {
    /// Dispatch to the handler named by the event's `route` metadata.
    #[default]
    Route,
    Sequential,
    #[serde(alias = "parallel", alias = "collaborate")]
    Collaborative,
    Loop,
    Mixed,
}

impl OrchestrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationMode::Route => "route",
            OrchestrationMode::Sequential => "sequential",
            OrchestrationMode::Collaborative => "collaborative",
            OrchestrationMode::Loop => "loop",
            OrchestrationMode::Mixed => "mixed",
        }
    }
}

impl fmt::Display for OrchestrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrchestrationMode {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "route" | "routing" => Ok(OrchestrationMode::Route),
            "sequential" | "pipeline" => Ok(OrchestrationMode::Sequential),
            "collaborative" | "collaborate" | "parallel" => Ok(OrchestrationMode::Collaborative),
            "loop" => Ok(OrchestrationMode::Loop),
            "mixed" => Ok(OrchestrationMode::Mixed),
            other => Err(WeaveError::Config(format!("unknown orchestration mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default)]
    pub mode: OrchestrationMode,
    /// Upper bound for a whole collaborative fan-out.
    #[serde(default = "default_orchestration_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Failure ratio above which a partially failed fan-out counts as failed.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    /// Ordered agents for sequential mode (and the sequential phase of mixed).
    #[serde(default)]
    pub sequence: Vec<String>,
    /// Agents for collaborative mode (and the parallel phase of mixed).
    #[serde(default)]
    pub collaborators: Vec<String>,
    #[serde(default)]
    pub loop_agent: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            mode: OrchestrationMode::default(),
            timeout_ms: default_orchestration_timeout_ms(),
            max_concurrency: default_max_concurrency(),
            failure_threshold: default_failure_threshold(),
            sequence: vec![],
            collaborators: vec![],
            loop_agent: None,
            max_iterations: default_max_iterations(),
        }
    }
}

impl OrchestrationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_orchestration_timeout_ms() -> u64 { 30_000 }
fn default_max_concurrency() -> usize { 10 }
fn default_failure_threshold() -> f64 { 0.5 }
fn default_max_iterations() -> u32 { 5 }

/// Exponential backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<ErrorCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
            retryable_errors: default_retryable_errors(),
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 1_000 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_jitter() -> bool { true }
fn default_retryable_errors() -> Vec<ErrorCode> {
    vec![ErrorCode::Timeout, ErrorCode::Network, ErrorCode::Llm]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures in Closed before the breaker opens.
    #[serde(default = "default_failure_threshold_count")]
    pub failure_threshold: u32,
    /// Half-open successes before the breaker closes again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// How long the breaker stays open before allowing trial calls.
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold_count(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_breaker_timeout_ms(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_failure_threshold_count() -> u32 { 5 }
fn default_success_threshold() -> u32 { 3 }
fn default_breaker_timeout_ms() -> u64 { 30_000 }
fn default_max_concurrent_calls() -> u32 { 2 }

/// Where classified failures are sent.
///
/// Handler maps are keyed by wire names: `category_handlers` by error code
/// (`TIMEOUT_ERROR`), `severity_handlers` by severity (`critical`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRouterConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before a retry requested by a recovery handler is resubmitted.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub enable_circuit_breaker: bool,
    /// Retry retryable failures in place before routing them.
    #[serde(default = "default_true")]
    pub enable_retries: bool,
    #[serde(default = "default_error_handler_name")]
    pub error_handler_name: String,
    #[serde(default = "default_category_handlers")]
    pub category_handlers: HashMap<String, String>,
    #[serde(default = "default_severity_handlers")]
    pub severity_handlers: HashMap<String, String>,
}

impl Default for ErrorRouterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            enable_circuit_breaker: true,
            enable_retries: true,
            error_handler_name: default_error_handler_name(),
            category_handlers: default_category_handlers(),
            severity_handlers: default_severity_handlers(),
        }
    }
}

impl ErrorRouterConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn category_handler(&self, code: ErrorCode) -> Option<&str> {
        self.category_handlers
            .get(code.as_str())
            .map(String::as_str)
            .filter(|h| !h.is_empty())
    }

    pub fn severity_handler(&self, severity: Severity) -> Option<&str> {
        self.severity_handlers
            .get(severity.as_str())
            .map(String::as_str)
            .filter(|h| !h.is_empty())
    }

    /// Every handler name this config can route to.
    pub fn handler_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .category_handlers
            .values()
            .chain(self.severity_handlers.values())
            .map(String::as_str)
            .chain(std::iter::once(self.error_handler_name.as_str()))
            .filter(|h| !h.is_empty())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

fn default_true() -> bool { true }
fn default_retry_delay_ms() -> u64 { 1_000 }
fn default_error_handler_name() -> String { "error-handler".to_string() }

fn default_category_handlers() -> HashMap<String, String> {
    [
        (ErrorCode::Validation, "validation-error-handler"),
        (ErrorCode::Timeout, "timeout-error-handler"),
        (ErrorCode::Llm, "llm-error-handler"),
        (ErrorCode::Network, "network-error-handler"),
        (ErrorCode::Auth, "auth-error-handler"),
    ]
    .into_iter()
    .map(|(code, handler)| (code.as_str().to_string(), handler.to_string()))
    .collect()
}

fn default_severity_handlers() -> HashMap<String, String> {
    [
        (Severity::Critical, "critical-error-handler"),
        (Severity::High, "high-priority-error-handler"),
    ]
    .into_iter()
    .map(|(sev, handler)| (sev.as_str().to_string(), handler.to_string()))
    .collect()
}

/// Tracing subscriber settings for the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            with_target: false,
        }
    }
}

fn default_log_filter() -> String { "weave=info,warn".to_string() }

impl WeaveConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeaveError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| WeaveError::Config(e.to_string()))
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.runner.queue_size == 0 {
            problems.push("runner.queue_size must be at least 1".to_string());
        }
        if self.runner.workers == 0 {
            problems.push("runner.workers must be at least 1".to_string());
        }
        if self.runner.max_terminated_sessions == 0 {
            problems.push("runner.max_terminated_sessions must be at least 1".to_string());
        }
        if self.retry.backoff_factor < 1.0 {
            problems.push(format!(
                "retry.backoff_factor must be >= 1.0 (got {})",
                self.retry.backoff_factor
            ));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            problems.push("retry.max_delay_ms must be >= retry.initial_delay_ms".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.success_threshold == 0
        {
            problems.push("circuit_breaker thresholds must be at least 1".to_string());
        }
        if self.circuit_breaker.max_concurrent_calls == 0 {
            problems.push("circuit_breaker.max_concurrent_calls must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.orchestration.failure_threshold) {
            problems.push(format!(
                "orchestration.failure_threshold must be within 0..=1 (got {})",
                self.orchestration.failure_threshold
            ));
        }
        if self.orchestration.max_concurrency == 0 {
            problems.push("orchestration.max_concurrency must be at least 1".to_string());
        }
        if self.orchestration.mode == OrchestrationMode::Loop
            && self.orchestration.loop_agent.as_deref().map_or(true, str::is_empty)
        {
            problems.push("orchestration.loop_agent is required in loop mode".to_string());
        }
        if self.error_router.error_handler_name.is_empty() {
            problems.push("error_router.error_handler_name must not be empty".to_string());
        }
        for key in self.error_router.category_handlers.keys() {
            if key.parse::<ErrorCode>().is_err() {
                problems.push(format!("error_router.category_handlers: unknown code {}", key));
            }
        }
        for key in self.error_router.severity_handlers.keys() {
            if key.parse::<Severity>().is_err() {
                problems.push(format!("error_router.severity_handlers: unknown severity {}", key));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(WeaveError::Config(problems.join("; ")))
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
