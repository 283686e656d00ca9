use crate::errors::StreamError;
use crate::model::{StreamState, TelemetryId};
use crate::progress::Progress;

/// Read-only view of the controller's current session, published after every
/// buffer update.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct RenderSnapshot {
    /// `None` while idle.
    pub telemetry_id: Option<TelemetryId>,
    pub state: StreamState,
    /// Buffer content, already capped.
    pub content: String,
    pub progress: Progress,
    /// Set once the session ends in `Errored`.
    pub error: Option<StreamError>,
}

/// Final result of one `stream()` call.
///
/// Expected failures are carried in `error` rather than returned as `Err`;
/// `content` always holds what was rendered before the session ended.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct StreamOutcome {
    pub content: String,
    pub telemetry_id: TelemetryId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamError>,
    /// Session ended because of `cancel()`, `reset()` or a newer `stream()`.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
}

impl StreamOutcome {
    /// True when the stream ran to completion.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.aborted
    }

    /// Human-readable error text, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serialization_omits_inapplicable_fields() {
        let outcome = StreamOutcome {
            content: "Hello".into(),
            telemetry_id: TelemetryId::from("t-1"),
            error: None,
            aborted: false,
        };
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(value, serde_json::json!({"content":"Hello","telemetry_id":"t-1"}));
        assert!(outcome.is_success());
    }

    #[test]
    fn outcome_serialization_includes_error_and_abort() {
        let outcome = StreamOutcome {
            content: String::new(),
            telemetry_id: TelemetryId::from("t-2"),
            error: Some(StreamError::NoResponseBody),
            aborted: true,
        };
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(value["aborted"], true);
        assert_eq!(value["error"]["kind"], "no_response_body");
        assert_eq!(outcome.error_message().as_deref(), Some("no response body"));
        assert!(!outcome.is_success());
    }
}
