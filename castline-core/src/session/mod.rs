//! The capture service and session lifecycle.
//!
//! A [`CaptureService`] owns at most one live session. Starting a session
//! spawns the capture, encode and send stages plus a supervisor thread;
//! the supervisor drives the [`SessionState`] machine and publishes
//! [`SessionEvent`]s on a broadcast channel.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::capture::{platform_backend, CaptureBackend, SourceList};
use crate::config::{SessionConfig, SessionParams};
use crate::encode::{EncoderFactory, OpenH264Factory};
use crate::error::CastError;
use crate::metrics::MetricsSnapshot;

pub mod events;
mod pipeline;
pub mod state;

pub use events::SessionEvent;
pub use state::SessionState;

use pipeline::{LaunchSpec, SessionShared};

/// Broadcast capacity; slow subscribers see `Lagged` rather than blocking
/// the pipeline.
const EVENT_CAPACITY: usize = 64;

// ── Handles and snapshots ────────────────────────────────────────

/// Opaque identifier of one session, unique per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A session's state and, once failed, why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: SessionState,
    pub error_reason: Option<String>,
}

// ── CaptureService ───────────────────────────────────────────────

struct ActiveSession {
    shared: Arc<SessionShared>,
    supervisor: Option<JoinHandle<()>>,
    stop: Sender<()>,
}

/// Entry point for enumerating sources and running capture sessions.
///
/// All methods take `&self`; the service can be shared across threads
/// behind an `Arc`.
pub struct CaptureService {
    backend: Arc<dyn CaptureBackend>,
    encoders: Arc<dyn EncoderFactory>,
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
    next_id: AtomicU64,
    current: Mutex<Option<ActiveSession>>,
}

impl CaptureService {
    /// A service over an explicit backend and encoder factory.
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        encoders: Arc<dyn EncoderFactory>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            encoders,
            config: config.sanitized(),
            events,
            next_id: AtomicU64::new(1),
            current: Mutex::new(None),
        }
    }

    /// A service using this platform's capture backend and OpenH264.
    pub fn native(config: SessionConfig) -> Self {
        Self::new(platform_backend(), Arc::new(OpenH264Factory), config)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn current(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, handle: SessionHandle) -> Result<Arc<SessionShared>, CastError> {
        self.current()
            .as_ref()
            .filter(|s| s.shared.handle == handle)
            .map(|s| Arc::clone(&s.shared))
            .ok_or(CastError::UnknownSession(handle.0))
    }

    /// List capturable monitors and windows.
    pub fn enumerate_sources(&self) -> Result<SourceList, CastError> {
        self.backend.enumerate()
    }

    /// Start streaming `source_id` to `peer`.
    ///
    /// Returns once every stage is running; the session reports
    /// `Running` after the first frame is accepted. Fails with
    /// `InvalidTransition` while another session is active and with
    /// `UnknownSource` if the id is not currently enumerable.
    pub fn start_capture(
        &self,
        source_id: &str,
        peer: SocketAddr,
        bitrate_kbps: u32,
        fps_cap: u32,
    ) -> Result<SessionHandle, CastError> {
        let mut current = self.current();
        if let Some(active) = current.as_ref() {
            let state = active.shared.state();
            if !state.is_terminal() {
                return Err(CastError::InvalidTransition {
                    state,
                    action: "start",
                });
            }
        }
        // Reap the previous session's supervisor before replacing it.
        if let Some(mut previous) = current.take() {
            if let Some(supervisor) = previous.supervisor.take() {
                let _ = supervisor.join();
            }
        }

        let sources = self.backend.enumerate()?;
        let source = sources
            .find(source_id)
            .ok_or_else(|| CastError::UnknownSource(source_id.to_string()))?;
        let params = SessionParams::new(peer, bitrate_kbps, fps_cap);

        let handle = SessionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(SessionShared::new(handle, self.events.clone()));

        let launched = pipeline::launch(LaunchSpec {
            shared: Arc::clone(&shared),
            backend: self.backend.as_ref(),
            encoders: Arc::clone(&self.encoders),
            source,
            params: &params,
            config: &self.config,
        });
        match launched {
            Ok(running) => {
                *current = Some(ActiveSession {
                    shared,
                    supervisor: Some(running.supervisor),
                    stop: running.stop,
                });
                Ok(handle)
            }
            Err(e) => {
                let _ = shared.transition(SessionState::fail, Some(e.to_string()));
                warn!(session = %handle, source = source_id, "start failed: {e}");
                *current = Some(ActiveSession {
                    shared,
                    supervisor: None,
                    stop: crossbeam_channel::bounded(1).0,
                });
                Err(e)
            }
        }
    }

    /// Stop the session and wait for teardown.
    ///
    /// On return every thread, socket and encoder of the session has been
    /// released and the state is `Stopped`.
    pub fn stop_capture(&self, handle: SessionHandle) -> Result<(), CastError> {
        let supervisor = {
            let mut current = self.current();
            let active = current
                .as_mut()
                .filter(|s| s.shared.handle == handle)
                .ok_or(CastError::UnknownSession(handle.0))?;
            active.shared.transition(SessionState::begin_stop, None)?;
            let _ = active.stop.try_send(());
            active.supervisor.take()
        };
        // Join outside the lock so state queries stay responsive.
        if let Some(supervisor) = supervisor {
            if supervisor.join().is_err() {
                warn!(session = %handle, "supervisor panicked");
            }
        }
        info!(session = %handle, "capture stopped");
        Ok(())
    }

    pub fn state(&self, handle: SessionHandle) -> Result<StateSnapshot, CastError> {
        let (state, error_reason) = self.session(handle)?.snapshot();
        Ok(StateSnapshot {
            state,
            error_reason: error_reason.filter(|_| state == SessionState::Failed),
        })
    }

    pub fn metrics(&self, handle: SessionHandle) -> Result<MetricsSnapshot, CastError> {
        Ok(self.session(handle)?.metrics.snapshot())
    }

    /// Ask the encoder for an IDR on its next picture.
    pub fn request_keyframe(&self, handle: SessionHandle) -> Result<(), CastError> {
        let shared = self.session(handle)?;
        let state = shared.state();
        if !state.is_active() {
            return Err(CastError::InvalidTransition {
                state,
                action: "request keyframe",
            });
        }
        shared.keyframe_request.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Receive state changes and telemetry for every session.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Threads, sockets, encoders and captures the session still holds.
    pub fn open_resources(&self, handle: SessionHandle) -> Result<usize, CastError> {
        Ok(self.session(handle)?.gauge.open())
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        let handle = self
            .current()
            .as_ref()
            .filter(|s| s.shared.state().is_active())
            .map(|s| s.shared.handle);
        if let Some(handle) = handle {
            let _ = self.stop_capture(handle);
        }
        // Reap a supervisor that already finished on its own.
        if let Some(mut active) = self.current().take() {
            if let Some(supervisor) = active.supervisor.take() {
                let _ = supervisor.join();
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
