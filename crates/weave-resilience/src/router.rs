use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;

use weave_core::config::ErrorRouterConfig;
use weave_core::error::WeaveError;
use weave_core::failure::{ErrorCode, ErrorEventData, RecoveryAction, Severity};
use weave_core::types::{keys, Event};

use crate::classify::{classify, recovery_action};

/// Turns agent failures into error events addressed to recovery handlers.
///
/// Stateless: every method is a pure function of its inputs and the config.
#[derive(Debug, Clone, Default)]
pub struct ErrorRouter {
    config: ErrorRouterConfig,
}

impl ErrorRouter {
    pub fn new(config: ErrorRouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ErrorRouterConfig {
        &self.config
    }

    pub fn classify(&self, message: &str) -> (ErrorCode, Severity) {
        classify(message)
    }

    /// Handler for a classified failure: severity mapping first, then the
    /// category mapping, then the default error handler.
    pub fn select_handler(&self, severity: Severity, code: ErrorCode) -> String {
        self.config
            .severity_handler(severity)
            .or_else(|| self.config.category_handler(code))
            .unwrap_or(&self.config.error_handler_name)
            .to_string()
    }

    /// Describe the failure of `agent_id` while handling `original`.
    pub fn build_error_data(
        &self,
        original: &Event,
        agent_id: &str,
        err: &WeaveError,
    ) -> ErrorEventData {
        let message = err.to_string();
        let (code, severity) = self.classify(&message);
        // Local retries spent inside the dispatcher count against the same budget.
        let retry_count = retry_count(original).saturating_add(err.local_retries());
        let action = recovery_action(code, retry_count, self.config.max_retries);
        let session_id = original
            .session_id()
            .map(String::from)
            .unwrap_or_else(|| original.id().to_string());

        ErrorEventData {
            original_event: original.clone(),
            failed_agent: agent_id.to_string(),
            error_message: message,
            error_code: code,
            severity,
            error_category: code.category().to_string(),
            recovery_action: action,
            retry_count,
            timestamp: Utc::now(),
            session_id,
        }
    }

    /// Build the error event for `err` and address it to the selected handler.
    pub fn create_enhanced_error_event(
        &self,
        original: &Event,
        agent_id: &str,
        err: &WeaveError,
    ) -> Event {
        let data = self.build_error_data(original, agent_id, err);
        let handler = self.select_handler(data.severity, data.error_code);
        self.error_event(&data, &handler)
    }

    /// Wrap already-built error data into an event addressed to `handler`.
    pub fn error_event(&self, data: &ErrorEventData, handler: &str) -> Event {
        let mut meta = HashMap::new();
        meta.insert(keys::SESSION_ID.to_string(), data.session_id.clone());
        meta.insert(keys::ROUTE.to_string(), handler.to_string());
        meta.insert(keys::STATUS.to_string(), keys::STATUS_ERROR.to_string());
        meta.insert(keys::ERROR_CODE.to_string(), data.error_code.to_string());
        meta.insert(keys::SEVERITY.to_string(), data.severity.to_string());
        meta.insert(
            keys::RECOVERY_ACTION.to_string(),
            data.recovery_action.to_string(),
        );
        if !data.failed_agent.is_empty() && data.failed_agent != "unknown" {
            meta.insert(keys::FAILED_AGENT_ID.to_string(), data.failed_agent.clone());
        }

        debug!(
            handler = %handler,
            failed_agent = %data.failed_agent,
            error_code = %data.error_code,
            severity = %data.severity,
            recovery_action = %data.recovery_action,
            "Built error event"
        );

        Event::new(handler, data.to_payload(), meta).with_source(data.failed_agent.clone())
    }

    /// Only `Retry` decisions are retryable.
    pub fn is_retryable_error(&self, data: &ErrorEventData) -> bool {
        data.recovery_action == RecoveryAction::Retry
    }

    /// Resubmission of `event` with `retry_count` bumped by one.
    ///
    /// The new event keeps the original target, payload, and source.
    pub fn increment_retry_count(&self, event: &Event) -> Event {
        let mut meta = event.metadata().clone();
        let next = retry_count(event).saturating_add(1);
        meta.insert(keys::RETRY_COUNT.to_string(), next.to_string());
        Event::new(event.target_agent_id(), event.data().clone(), meta)
            .with_source(event.source_agent_id())
    }

    /// Resubmission of the event that failed in `data`, counting every retry
    /// already spent on it, local ones included.
    pub fn resubmit(&self, data: &ErrorEventData) -> Event {
        let spent = data
            .original_event
            .clone()
            .with_meta(keys::RETRY_COUNT, data.retry_count.to_string());
        self.increment_retry_count(&spent)
    }
}

/// `retry_count` metadata of `event`; missing or malformed counts as zero.
pub fn retry_count(event: &Event) -> u32 {
    event
        .get_meta(keys::RETRY_COUNT)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}
