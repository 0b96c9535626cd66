use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to every agent and callback.
///
/// Cancelling the runner cancels every context derived from it; a handler
/// should return promptly once `is_cancelled` turns true.
#[derive(Debug, Clone)]
pub struct RunContext {
    session_id: String,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(session_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            session_id: session_id.into(),
            cancel,
        }
    }

    /// Detached context with a fresh token, mostly for tests and one-off calls.
    pub fn background(session_id: impl Into<String>) -> Self {
        Self::new(session_id, CancellationToken::new())
    }

    /// A context whose token is cancelled with this one but can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            session_id: self.session_id.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
