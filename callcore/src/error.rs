//! Errors surfaced to the UI through `last_error`.

use serde::Serialize;
use thiserror::Error;

/// A user-facing failure of a call-session operation.
///
/// Operations never return these; they are recorded on the controller and
/// broadcast so the UI can show a dismissible message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CallError {
    #[error("no access token available")]
    MissingToken,

    #[error("camera/microphone unavailable: {reason}")]
    MediaUnavailable { reason: String },

    #[error("match request failed with status {status}")]
    MatchRequestFailed {
        status: u16,
        message: Option<String>,
    },

    #[error("matching service unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("match request timed out")]
    Timeout,

    #[error("unexpected response from matching service: {reason}")]
    InvalidResponse { reason: String },

    #[error("signaling channel unavailable")]
    SignalingUnavailable,

    #[error("call negotiation failed: {reason}")]
    NegotiationFailed { reason: String },
}

impl CallError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::MatchRequestFailed { .. }
                | Self::Unreachable { .. }
                | Self::Timeout
                | Self::SignalingUnavailable
        )
    }
}
