use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeaveError {
    // Runner lifecycle errors
    #[error("Runner is not started")]
    NotStarted,

    #[error("Runner is already started")]
    AlreadyStarted,

    #[error("Event queue is full (capacity {0})")]
    QueueFull(usize),

    // Registry errors
    #[error("Agent name must not be empty")]
    EmptyAgentName,

    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("No handler registered for agent: {0}")]
    AgentNotFound(String),

    #[error("No route specified in event metadata")]
    MissingRoute,

    // Agent errors
    /// Hard failure raised by a handler. The message is rendered verbatim so
    /// the error router classifies on the handler's own wording.
    #[error("{0}")]
    Agent(String),

    #[error("{stage} agent {agent} failed: {source}")]
    StageFailed {
        stage: &'static str,
        agent: String,
        #[source]
        source: Box<WeaveError>,
    },

    #[error("Operation timeout after {0}ms")]
    Timeout(u64),

    /// `source` was the last failure after `attempts` local attempts.
    /// Renders as `source` so classification sees the handler's wording.
    #[error("{source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<WeaveError>,
    },

    #[error("context canceled")]
    Cancelled,

    #[error(transparent)]
    Multi(#[from] MultiError),

    // Resilience errors
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("circuit breaker is half-open and at max concurrent calls")]
    CircuitHalfOpenSaturated,

    // Callback errors
    #[error("Callback error: {hook}: {message}")]
    Callback { hook: String, message: String },

    #[error("Callback already registered: {hook}: {id}")]
    DuplicateCallback { hook: String, id: String },

    // Validation errors
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeaveError {
    /// Shorthand for a handler-raised failure.
    pub fn agent(message: impl Into<String>) -> Self {
        Self::Agent(message.into())
    }

    /// Wrap an error raised while running `agent` inside a composite stage.
    pub fn stage(stage: &'static str, agent: impl Into<String>, source: WeaveError) -> Self {
        Self::StageFailed {
            stage,
            agent: agent.into(),
            source: Box::new(source),
        }
    }

    /// Record that `source` survived `attempts` local attempts.
    ///
    /// A single attempt is not worth recording and returns `source` as is.
    pub fn exhausted(attempts: u32, source: WeaveError) -> Self {
        if attempts <= 1 {
            return source;
        }
        Self::RetriesExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    /// Retries already spent on this failure before it surfaced.
    pub fn local_retries(&self) -> u32 {
        match self {
            Self::RetriesExhausted { attempts, .. } => attempts.saturating_sub(1),
            Self::StageFailed { source, .. } => source.local_retries(),
            _ => 0,
        }
    }
}

/// Aggregation of independent failures from concurrent branches.
///
/// Every contained error is kept; rendering lists each one with its index.
#[derive(Debug, Default, Error)]
pub struct MultiError {
    errors: Vec<WeaveError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: WeaveError) {
        self.errors.push(error);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[WeaveError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<WeaveError> {
        self.errors
    }
}

impl From<Vec<WeaveError>> for MultiError {
    fn from(errors: Vec<WeaveError>) -> Self {
        Self { errors }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "1 error occurred: [0] {}", self.errors[0]),
            n => {
                write!(f, "{} errors occurred:", n)?;
                for (i, e) in self.errors.iter().enumerate() {
                    write!(f, " [{}] {}", i, e)?;
                    if i + 1 < n {
                        write!(f, ";")?;
                    }
                }
                Ok(())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, WeaveError>;
