use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal failures of the connect-and-join sequence.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionError {
    #[error("Socket did not connect within {timeout_ms} ms")]
    ConnectTimeout { timeout_ms: u64 },
    #[error("Socket connection failed: {reason}")]
    ConnectFailed { reason: String },
    #[error("Joining room {room_id} was rejected: {reason}")]
    JoinRejected { room_id: String, reason: String },
    #[error("Room could not be loaded: {reason}")]
    Other { reason: String },
}

/// What the UI offers the user to get out of a fatal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryAction {
    /// Re-run the whole connect-and-join sequence.
    Reconnect,
    /// The socket is fine, only the room join needs another attempt.
    Rejoin,
    /// Full reload of the page.
    Reload,
}

impl SessionError {
    pub fn recovery(&self) -> RecoveryAction {
        match self {
            SessionError::ConnectTimeout { .. } | SessionError::ConnectFailed { .. } => {
                RecoveryAction::Reconnect
            }
            SessionError::JoinRejected { .. } => RecoveryAction::Rejoin,
            SessionError::Other { .. } => RecoveryAction::Reload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_session_error_has_a_recovery() {
        let timeout = SessionError::ConnectTimeout { timeout_ms: 8000 };
        assert_eq!(timeout.recovery(), RecoveryAction::Reconnect);

        let rejected = SessionError::JoinRejected {
            room_id: "r1".to_string(),
            reason: "forbidden".to_string(),
        };
        assert_eq!(rejected.recovery(), RecoveryAction::Rejoin);
        assert!(rejected.to_string().contains("r1"));

        let other = SessionError::Other {
            reason: "boom".to_string(),
        };
        assert_eq!(other.recovery(), RecoveryAction::Reload);
    }
}
