use std::fmt;

/// Opaque per-session correlation id, sent with the request body and shown to
/// the user on error.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TelemetryId(pub String);

impl TelemetryId {
    /// Generates a fresh id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TelemetryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TelemetryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of the controller's current session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    #[default]
    Idle,
    Streaming,
    Completed,
    Cancelled,
    Errored,
}

impl StreamState {
    /// True for `Completed`, `Cancelled` and `Errored`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Errored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(TelemetryId::generate(), TelemetryId::generate());
    }

    #[test]
    fn only_finished_states_are_terminal() {
        assert!(!StreamState::Idle.is_terminal());
        assert!(!StreamState::Streaming.is_terminal());
        assert!(StreamState::Completed.is_terminal());
        assert!(StreamState::Cancelled.is_terminal());
        assert!(StreamState::Errored.is_terminal());
    }
}
