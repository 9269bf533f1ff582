//! Domain-specific error types for the capture pipeline.
//!
//! Structural failures surface as a session transition to `Failed`;
//! per-frame and per-packet failures are absorbed by the stage that hit
//! them and only show up in the metrics. Nothing in here panics.

use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// The canonical error type for castline.
#[derive(Debug, Error)]
pub enum CastError {
    // ── Capture ──────────────────────────────────────────────────
    /// The platform capture API is unavailable.
    #[error("source enumeration failed: {0}")]
    SourceEnumeration(String),

    /// The captured monitor or window went away mid-session.
    #[error("capture source lost: {0}")]
    SourceLost(String),

    /// No source with this id exists in the current enumeration.
    #[error("unknown capture source: {0}")]
    UnknownSource(String),

    // ── Encoding ─────────────────────────────────────────────────
    /// The H.264 encoder could not be created.
    #[error("encoder initialisation failed: {0}")]
    EncoderInit(String),

    /// A single frame failed to encode; the frame is skipped.
    #[error("frame encode failed: {0}")]
    EncodeFrame(String),

    /// The captured frame cannot be converted to planar 4:2:0.
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),

    // ── RTP / network ────────────────────────────────────────────
    /// A UDP send failed; the packet is dropped.
    #[error("send failed: {0}")]
    Send(String),

    /// Malformed RTP or H.264 payload.
    #[error("packetization error: {0}")]
    Packetization(&'static str),

    /// The underlying socket reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    // ── Session ──────────────────────────────────────────────────
    /// The requested operation is not valid in the current state.
    #[error("cannot {action} while session is {state}")]
    InvalidTransition {
        state: SessionState,
        action: &'static str,
    },

    /// The handle does not refer to the current or last session.
    #[error("unknown session handle: {0}")]
    UnknownSession(u64),

    /// A stage thread could not be spawned.
    #[error("failed to spawn {stage} thread: {source}")]
    Spawn {
        stage: &'static str,
        source: std::io::Error,
    },

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for CastError {
    fn from(s: String) -> Self {
        CastError::Other(s)
    }
}

impl From<&str> for CastError {
    fn from(s: &str) -> Self {
        CastError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = CastError::InvalidTransition {
            state: SessionState::Stopped,
            action: "stop",
        };
        assert_eq!(e.to_string(), "cannot stop while session is Stopped");

        let e = CastError::SourceLost("window closed".into());
        assert!(e.to_string().contains("window closed"));
    }

    #[test]
    fn from_string() {
        let e: CastError = "something broke".into();
        assert!(matches!(e, CastError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let e: CastError = io_err.into();
        assert!(matches!(e, CastError::Io(_)));
    }
}
