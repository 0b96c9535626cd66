use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{keys, Event, EventData};

/// Coarse failure class assigned by the error classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
    #[serde(rename = "LLM_ERROR")]
    Llm,
    #[serde(rename = "NETWORK_ERROR")]
    Network,
    #[serde(rename = "AUTH_ERROR")]
    Auth,
    #[serde(rename = "RESOURCE_ERROR")]
    Resource,
    #[serde(rename = "UNKNOWN_ERROR")]
    Unknown,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 7] = [
        ErrorCode::Validation,
        ErrorCode::Timeout,
        ErrorCode::Llm,
        ErrorCode::Network,
        ErrorCode::Auth,
        ErrorCode::Resource,
        ErrorCode::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION_ERROR",
            ErrorCode::Timeout => "TIMEOUT_ERROR",
            ErrorCode::Llm => "LLM_ERROR",
            ErrorCode::Network => "NETWORK_ERROR",
            ErrorCode::Auth => "AUTH_ERROR",
            ErrorCode::Resource => "RESOURCE_ERROR",
            ErrorCode::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Human-readable category mirroring the code.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Llm => "llm",
            ErrorCode::Network => "network",
            ErrorCode::Auth => "auth",
            ErrorCode::Resource => "resource",
            ErrorCode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown error code: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Policy decision attached to a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Retry,
    Fallback,
    Escalate,
    Terminate,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Fallback => "fallback",
            RecoveryAction::Escalate => "escalate",
            RecoveryAction::Terminate => "terminate",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(RecoveryAction::Retry),
            "fallback" => Ok(RecoveryAction::Fallback),
            "escalate" => Ok(RecoveryAction::Escalate),
            "terminate" => Ok(RecoveryAction::Terminate),
            other => Err(format!("unknown recovery action: {}", other)),
        }
    }
}

/// Payload key holding the serialized [`ErrorEventData`].
pub const ERROR_DATA_KEY: &str = "error_data";

/// Full description of one failure, created once by the error router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEventData {
    pub original_event: Event,
    pub failed_agent: String,
    pub error_message: String,
    pub error_code: ErrorCode,
    pub severity: Severity,
    pub error_category: String,
    pub recovery_action: RecoveryAction,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
}

impl ErrorEventData {
    /// Flatten into an event payload.
    pub fn to_payload(&self) -> EventData {
        let mut data = EventData::new();
        data.insert(
            ERROR_DATA_KEY.to_string(),
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        );
        data.insert(
            "original_event_id".to_string(),
            self.original_event.id().into(),
        );
        data.insert("error".to_string(), self.error_message.clone().into());
        data.insert("failed_agent".to_string(), self.failed_agent.clone().into());
        data.insert("retry_count".to_string(), self.retry_count.into());
        data.insert(keys::ERROR_CODE.to_string(), self.error_code.as_str().into());
        data.insert(keys::SEVERITY.to_string(), self.severity.as_str().into());
        data.insert(
            keys::RECOVERY_ACTION.to_string(),
            self.recovery_action.as_str().into(),
        );
        data
    }

    /// Recover the error data carried by an error event, if it is one.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.get_meta(keys::STATUS) != Some(keys::STATUS_ERROR) {
            return None;
        }
        let raw = event.get(ERROR_DATA_KEY)?;
        serde_json::from_value(raw.clone()).ok()
    }
}
