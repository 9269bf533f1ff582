//! Session lifecycle state machine.
//!
//! Transitions are validated and return `Result` instead of panicking;
//! a rejected transition leaves the state untouched.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CastError;

/// Lifecycle of one capture session.
///
/// ```text
///  Starting ──► Running ◄──► Degraded
///     │            │             │
///     ├────────────┴──────┬──────┤
///     ▼                   ▼      ▼
///   Failed            Stopping ──► Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Stages are being spawned; no frame has reached the encoder yet.
    Starting,
    /// Frames are flowing.
    Running,
    /// Frames are flowing but the sender is falling behind.
    Degraded,
    /// `stop_capture` was called; teardown in progress.
    Stopping,
    /// Torn down on request. Terminal.
    Stopped,
    /// Torn down after a fatal error. Terminal.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Degraded => "Degraded",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

impl SessionState {
    /// Whether the pipeline is live (a new session may not start).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Degraded)
    }

    /// Whether the session has fully torn down.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether frames are being encoded and sent.
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Running | Self::Degraded)
    }

    // ── Transitions ──────────────────────────────────────────────

    fn reject(self, action: &'static str) -> CastError {
        CastError::InvalidTransition {
            state: self,
            action,
        }
    }

    /// Transition to `Running`.
    ///
    /// Valid from: `Starting` (first frame accepted), `Degraded` (recovered).
    pub fn mark_running(&mut self) -> Result<(), CastError> {
        match self {
            Self::Starting | Self::Degraded => {
                *self = Self::Running;
                Ok(())
            }
            other => Err(other.reject("resume")),
        }
    }

    /// Transition to `Degraded`.
    ///
    /// Valid from: `Running`.
    pub fn mark_degraded(&mut self) -> Result<(), CastError> {
        match self {
            Self::Running => {
                *self = Self::Degraded;
                Ok(())
            }
            other => Err(other.reject("degrade")),
        }
    }

    /// Transition to `Stopping`.
    ///
    /// Valid from: `Starting`, `Running`, `Degraded`.
    pub fn begin_stop(&mut self) -> Result<(), CastError> {
        if self.is_active() {
            *self = Self::Stopping;
            Ok(())
        } else {
            Err(self.reject("stop"))
        }
    }

    /// Transition to `Stopped`.
    ///
    /// Valid from: `Stopping`.
    pub fn finish_stop(&mut self) -> Result<(), CastError> {
        match self {
            Self::Stopping => {
                *self = Self::Stopped;
                Ok(())
            }
            other => Err(other.reject("finish stopping")),
        }
    }

    /// Transition to `Failed`.
    ///
    /// Valid from: `Starting`, `Running`, `Degraded`.
    pub fn fail(&mut self) -> Result<(), CastError> {
        if self.is_active() {
            *self = Self::Failed;
            Ok(())
        } else {
            Err(self.reject("fail"))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut s = SessionState::Starting;
        s.mark_running().unwrap();
        s.mark_degraded().unwrap();
        s.mark_running().unwrap();
        s.begin_stop().unwrap();
        s.finish_stop().unwrap();
        assert_eq!(s, SessionState::Stopped);
        assert!(s.is_terminal());
    }

    #[test]
    fn stop_rejected_when_terminal() {
        for terminal in [SessionState::Stopped, SessionState::Failed] {
            let mut s = terminal;
            let err = s.begin_stop().unwrap_err();
            assert!(matches!(
                err,
                CastError::InvalidTransition { action: "stop", .. }
            ));
            assert_eq!(s, terminal, "state unchanged");
        }
    }

    #[test]
    fn fail_from_any_active_state() {
        for active in [
            SessionState::Starting,
            SessionState::Running,
            SessionState::Degraded,
        ] {
            let mut s = active;
            s.fail().unwrap();
            assert_eq!(s, SessionState::Failed);
        }
        let mut s = SessionState::Stopping;
        assert!(s.fail().is_err());
    }

    #[test]
    fn degrade_only_from_running() {
        let mut s = SessionState::Starting;
        assert!(s.mark_degraded().is_err());
        assert_eq!(s, SessionState::Starting);
    }

    #[test]
    fn display() {
        assert_eq!(SessionState::Degraded.to_string(), "Degraded");
    }
}
