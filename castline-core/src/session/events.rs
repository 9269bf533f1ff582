//! Events published to the application and between pipeline stages.

use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSnapshot;
use crate::session::state::SessionState;
use crate::session::SessionHandle;

/// Published on the [`CaptureService`](crate::CaptureService) broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session changed state. `reason` is set for `Failed` and
    /// `Degraded`.
    StateChanged {
        session: SessionHandle,
        state: SessionState,
        reason: Option<String>,
    },
    /// Periodic metrics while the session is streaming.
    Telemetry {
        session: SessionHandle,
        metrics: MetricsSnapshot,
    },
}

impl SessionEvent {
    pub fn session(&self) -> SessionHandle {
        match self {
            Self::StateChanged { session, .. } | Self::Telemetry { session, .. } => *session,
        }
    }
}

/// Reports from stage threads to the session supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StageEvent {
    /// The exchange accepted its first frame.
    FirstFrame,
    /// The capture backend lost its source.
    SourceLost(String),
    /// The encode thread could not create its encoder.
    EncoderInitFailed(String),
    /// A stage thread returned or unwound.
    StageExited {
        stage: &'static str,
        panicked: bool,
    },
}
