//! String-pattern failure classification.
//!
//! Handlers raise arbitrary errors, so classification works on the rendered
//! message alone. Patterns are matched case-insensitively in a fixed order;
//! the first family that matches wins.

use weave_core::failure::{ErrorCode, RecoveryAction, Severity};

const PATTERNS: &[(ErrorCode, Severity, &[&str])] = &[
    (
        ErrorCode::Validation,
        Severity::Medium,
        &["validation", "invalid", "required", "missing"],
    ),
    (
        ErrorCode::Timeout,
        Severity::High,
        &["timeout", "deadline", "context canceled"],
    ),
    (
        ErrorCode::Llm,
        Severity::Medium,
        &["llm", "openai", "azure", "model", "completion"],
    ),
    (
        ErrorCode::Network,
        Severity::High,
        &["network", "connection", "dial", "http"],
    ),
    (
        ErrorCode::Auth,
        Severity::Critical,
        &["auth", "unauthorized", "forbidden", "token"],
    ),
    (
        ErrorCode::Resource,
        Severity::Critical,
        &["memory", "resource", "limit", "quota"],
    ),
];

/// Map an error message to its code and severity.
pub fn classify(message: &str) -> (ErrorCode, Severity) {
    let lower = message.to_lowercase();
    PATTERNS
        .iter()
        .find(|(_, _, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(code, severity, _)| (*code, *severity))
        .unwrap_or((ErrorCode::Unknown, Severity::Medium))
}

/// Decide how a failure with `code` should be recovered after `retry_count`
/// earlier attempts.
pub fn recovery_action(code: ErrorCode, retry_count: u32, max_retries: u32) -> RecoveryAction {
    match code {
        ErrorCode::Auth | ErrorCode::Resource => RecoveryAction::Escalate,
        ErrorCode::Validation => RecoveryAction::Terminate,
        ErrorCode::Timeout | ErrorCode::Network | ErrorCode::Llm => {
            if retry_count < max_retries {
                RecoveryAction::Retry
            } else {
                RecoveryAction::Fallback
            }
        }
        ErrorCode::Unknown => {
            if retry_count < max_retries {
                RecoveryAction::Retry
            } else {
                RecoveryAction::Escalate
            }
        }
    }
}
