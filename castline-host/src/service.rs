//! Host service: runs one capture session until shutdown.
//!
//! Owns the process-wide `CaptureService`, relays its events to the log
//! (or stdout as JSON lines) and stops the session cleanly on Ctrl-C or
//! when the session ends on its own.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use castline_core::{
    platform_backend, CaptureBackend, CaptureService, CastError, OpenH264Factory, SessionEvent,
    SessionState, SourceList, SyntheticBackend, SyntheticConfig,
};

use crate::config::HostConfig;

/// Frame size of the `--synthetic` test pattern.
const SYNTHETIC_SIZE: (u32, u32) = (1280, 720);

/// What to stream and where.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: String,
    pub peer: SocketAddr,
    pub bitrate_kbps: u32,
    pub fps: u32,
}

// ── HostService ──────────────────────────────────────────────────

/// The host's single capture service plus event reporting.
pub struct HostService {
    capture: Arc<CaptureService>,
    telemetry_json: bool,
}

impl HostService {
    /// Build from config, using the native backend or the synthetic
    /// test pattern.
    pub fn new(config: &HostConfig, synthetic: bool) -> Self {
        let backend: Arc<dyn CaptureBackend> = if synthetic {
            let (width, height) = SYNTHETIC_SIZE;
            Arc::new(SyntheticBackend::new(SyntheticConfig {
                width,
                height,
                fps: config.capture.fps,
                ..SyntheticConfig::default()
            }))
        } else {
            platform_backend()
        };
        let capture = CaptureService::new(
            backend,
            Arc::new(OpenH264Factory),
            config.to_session_config(),
        );
        Self::with_service(capture, config.logging.telemetry_json)
    }

    /// Wrap an already configured service.
    pub fn with_service(capture: CaptureService, telemetry_json: bool) -> Self {
        Self {
            capture: Arc::new(capture),
            telemetry_json,
        }
    }

    pub fn list_sources(&self) -> Result<SourceList, CastError> {
        self.capture.enumerate_sources()
    }

    /// Stream until `shutdown` resolves or the session ends by itself.
    ///
    /// Returns the session's terminal state.
    pub async fn run(
        &self,
        request: RunRequest,
        shutdown: impl Future<Output = ()>,
    ) -> Result<SessionState, CastError> {
        let mut events = self.capture.subscribe();
        // Backend start-up blocks on the platform readiness handshake.
        let capture = Arc::clone(&self.capture);
        let start = request.clone();
        let handle = tokio::task::spawn_blocking(move || {
            capture.start_capture(&start.source, start.peer, start.bitrate_kbps, start.fps)
        })
        .await
        .map_err(|e| CastError::Other(format!("start task failed: {e}")))??;
        info!(
            session = %handle,
            source = %request.source,
            peer = %request.peer,
            "streaming"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) if event.session() == handle => {
                        self.report(&event);
                        if let SessionEvent::StateChanged { state, .. } = event {
                            if state.is_terminal() {
                                return Ok(state);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("event subscriber lagged by {n}"),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        // Teardown joins threads; keep it off the runtime workers.
        let capture = Arc::clone(&self.capture);
        let stopped = tokio::task::spawn_blocking(move || capture.stop_capture(handle))
            .await
            .map_err(|e| CastError::Other(format!("stop task failed: {e}")))?;
        match stopped {
            // Already terminal: it ended on its own before the stop landed.
            Ok(()) | Err(CastError::InvalidTransition { .. }) => {
                Ok(self.capture.state(handle)?.state)
            }
            Err(e) => Err(e),
        }
    }

    fn report(&self, event: &SessionEvent) {
        if self.telemetry_json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("event not serialisable: {e}"),
            }
            return;
        }
        match event {
            SessionEvent::StateChanged {
                session,
                state,
                reason: Some(reason),
            } => info!(%session, %state, "{reason}"),
            SessionEvent::StateChanged { session, state, .. } => info!(%session, %state),
            SessionEvent::Telemetry { session, metrics } => info!(
                %session,
                capture_fps = metrics.capture_fps,
                encode_fps = metrics.encode_fps,
                queue = metrics.queue_depth,
                dropped = metrics.dropped_frames,
                send_errors = metrics.send_errors,
                "telemetry"
            ),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use std::time::Instant;

    use castline_core::{CaptureHandle, CaptureSource, FrameSink, SessionConfig};

    /// Synthetic backend whose start blocks like a platform handshake.
    struct SlowStart(SyntheticBackend);

    impl CaptureBackend for SlowStart {
        fn enumerate(&self) -> Result<SourceList, CastError> {
            self.0.enumerate()
        }

        fn start(
            &self,
            source: &CaptureSource,
            max_fps: u32,
            sink: Arc<dyn FrameSink>,
        ) -> Result<Box<dyn CaptureHandle>, CastError> {
            std::thread::sleep(Duration::from_millis(300));
            self.0.start(source, max_fps, sink)
        }
    }

    fn synthetic_host() -> HostService {
        let capture = CaptureService::new(
            Arc::new(SyntheticBackend::default()),
            Arc::new(OpenH264Factory),
            SessionConfig::default(),
        );
        HostService::with_service(capture, false)
    }

    #[test]
    fn lists_synthetic_sources() {
        let host = synthetic_host();
        let sources = host.list_sources().unwrap();
        assert_eq!(sources.monitors.len(), 1);
        assert!(sources.find("window:1000").is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_stops_on_shutdown() {
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let host = synthetic_host();
        let request = RunRequest {
            source: "monitor:0".into(),
            peer: receiver.local_addr().unwrap(),
            bitrate_kbps: 500,
            fps: 15,
        };
        let state = host
            .run(request, tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap();
        assert_eq!(state, SessionState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_source_is_an_error() {
        let host = synthetic_host();
        let request = RunRequest {
            source: "monitor:5".into(),
            peer: "127.0.0.1:5004".parse().unwrap(),
            bitrate_kbps: 500,
            fps: 15,
        };
        let err = host.run(request, std::future::pending()).await.unwrap_err();
        assert!(matches!(err, CastError::UnknownSource(_)));
    }

    #[tokio::test]
    async fn blocking_start_leaves_runtime_responsive() {
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let capture = CaptureService::new(
            Arc::new(SlowStart(SyntheticBackend::default())),
            Arc::new(OpenH264Factory),
            SessionConfig::default(),
        );
        let host = HostService::with_service(capture, false);
        let request = RunRequest {
            source: "monitor:0".into(),
            peer: receiver.local_addr().unwrap(),
            bitrate_kbps: 500,
            fps: 15,
        };

        // Single-threaded runtime: the timer only fires on time if the
        // start-up wait runs elsewhere.
        let began = Instant::now();
        let timer = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            began.elapsed()
        };
        let (state, fired_after) = tokio::join!(
            host.run(request, tokio::time::sleep(Duration::from_millis(500))),
            timer
        );
        assert_eq!(state.unwrap(), SessionState::Stopped);
        assert!(fired_after < Duration::from_millis(250), "timer delayed {fired_after:?}");
    }
}
