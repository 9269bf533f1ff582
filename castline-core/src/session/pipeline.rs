//! Stage wiring and supervision for one session.
//!
//! ```text
//!  backend thread ──► PipelineSink ──► FrameExchange ──► encode thread
//!                                                             │ bounded channel
//!                                                             ▼
//!                          supervisor ◄── StageEvent ──  send thread ──► UDP
//! ```
//!
//! [`launch`] spawns the send and encode threads, starts the backend and
//! hands everything to a supervisor thread. The supervisor reacts to
//! stage events, runs the health and telemetry ticks, and performs the
//! ordered teardown before publishing the terminal state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver, Sender};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureBackend, CaptureHandle, CaptureSource, FrameSink};
use crate::config::{SessionConfig, SessionParams};
use crate::encode::{EncodeStage, EncoderFactory, EncoderSettings};
use crate::error::CastError;
use crate::exchange::FrameExchange;
use crate::frame::RawFrame;
use crate::metrics::{RateMeter, ResourceGauge, ResourceGuard, ResourceKind, SessionMetrics};
use crate::rtp::packetizer::Packetizer;
use crate::rtp::sender::{RtpSocket, SendStage};
use crate::session::events::{SessionEvent, StageEvent};
use crate::session::state::SessionState;
use crate::session::SessionHandle;

// ── Shared session record ────────────────────────────────────────

#[derive(Debug)]
struct Record {
    state: SessionState,
    reason: Option<String>,
}

/// State, counters and signals shared between the service and the
/// session's threads.
pub(crate) struct SessionShared {
    pub handle: SessionHandle,
    pub metrics: Arc<SessionMetrics>,
    pub gauge: ResourceGauge,
    pub keyframe_request: Arc<AtomicBool>,
    record: Mutex<Record>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionShared {
    /// A new session in `Starting`, announced on `events`.
    pub fn new(handle: SessionHandle, events: broadcast::Sender<SessionEvent>) -> Self {
        let shared = Self {
            handle,
            metrics: Arc::new(SessionMetrics::new()),
            gauge: ResourceGauge::new(),
            keyframe_request: Arc::new(AtomicBool::new(false)),
            record: Mutex::new(Record {
                state: SessionState::Starting,
                reason: None,
            }),
            events,
        };
        shared.announce(SessionState::Starting, None);
        shared
    }

    fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.record().state
    }

    pub fn snapshot(&self) -> (SessionState, Option<String>) {
        let rec = self.record();
        (rec.state, rec.reason.clone())
    }

    /// Apply `step` and publish the new state while still holding the lock,
    /// so events leave in transition order.
    pub fn transition(
        &self,
        step: impl FnOnce(&mut SessionState) -> Result<(), CastError>,
        reason: Option<String>,
    ) -> Result<SessionState, CastError> {
        let mut rec = self.record();
        step(&mut rec.state)?;
        rec.reason = reason.clone();
        let state = rec.state;
        self.announce(state, reason);
        Ok(state)
    }

    fn announce(&self, state: SessionState, reason: Option<String>) {
        match &reason {
            Some(why) if state == SessionState::Failed => {
                warn!(session = %self.handle, %state, "session failed: {why}");
            }
            Some(why) => info!(session = %self.handle, %state, "state changed: {why}"),
            None => info!(session = %self.handle, %state, "state changed"),
        }
        // No subscribers is fine.
        let _ = self.events.send(SessionEvent::StateChanged {
            session: self.handle,
            state,
            reason,
        });
    }

    fn publish_telemetry(&self) {
        let metrics = self.metrics.snapshot();
        debug!(
            session = %self.handle,
            capture_fps = metrics.capture_fps,
            encode_fps = metrics.encode_fps,
            queue_depth = metrics.queue_depth,
            dropped = metrics.dropped_frames,
            send_errors = metrics.send_errors,
            "telemetry"
        );
        let _ = self.events.send(SessionEvent::Telemetry {
            session: self.handle,
            metrics,
        });
    }
}

// ── Sink adapter ─────────────────────────────────────────────────

/// The [`FrameSink`] every backend delivers into.
///
/// Enforces the rate cap on the platform timestamps, publishes into the
/// exchange and reports the first accepted frame and source loss.
struct PipelineSink {
    exchange: Arc<FrameExchange>,
    metrics: Arc<SessionMetrics>,
    events: Sender<StageEvent>,
    /// Minimum spacing between accepted frames, in nanoseconds.
    min_spacing: u64,
    /// Timestamp of the last accepted frame; `u64::MAX` before the first.
    last_accepted: AtomicU64,
    lost: AtomicBool,
}

impl PipelineSink {
    fn new(
        exchange: Arc<FrameExchange>,
        metrics: Arc<SessionMetrics>,
        events: Sender<StageEvent>,
        fps_cap: u32,
    ) -> Self {
        // Frames up to 10 % early still pass.
        let interval = 1_000_000_000 / fps_cap.max(1) as u64;
        Self {
            exchange,
            metrics,
            events,
            min_spacing: interval * 9 / 10,
            last_accepted: AtomicU64::new(u64::MAX),
            lost: AtomicBool::new(false),
        }
    }
}

impl FrameSink for PipelineSink {
    fn on_frame(&self, frame: RawFrame) {
        if self.lost.load(Ordering::Relaxed) {
            return;
        }
        let ts = frame.timestamp.as_nanos() as u64;
        let last = self.last_accepted.load(Ordering::Relaxed);
        let first = last == u64::MAX;
        if !first && ts.saturating_sub(last) < self.min_spacing {
            SessionMetrics::incr(&self.metrics.frames_dropped);
            return;
        }
        self.last_accepted.store(ts, Ordering::Relaxed);
        SessionMetrics::incr(&self.metrics.frames_captured);

        if self.exchange.publish(frame) {
            // The encoder never saw the frame that was replaced.
            SessionMetrics::incr(&self.metrics.frames_dropped);
        }
        if first {
            let _ = self.events.send(StageEvent::FirstFrame);
        }
    }

    fn on_source_lost(&self, reason: String) {
        if !self.lost.swap(true, Ordering::Relaxed) {
            let _ = self.events.send(StageEvent::SourceLost(reason));
        }
    }
}

// ── Stage threads ────────────────────────────────────────────────

/// Reports the owning thread's exit, including unwinding, to the supervisor.
struct ExitReporter {
    stage: &'static str,
    events: Sender<StageEvent>,
    _thread: ResourceGuard,
}

impl Drop for ExitReporter {
    fn drop(&mut self) {
        let panicked = thread::panicking();
        if panicked {
            error!(stage = self.stage, "stage thread panicked");
        }
        let _ = self.events.send(StageEvent::StageExited {
            stage: self.stage,
            panicked,
        });
    }
}

fn spawn_stage<F>(
    stage: &'static str,
    events: &Sender<StageEvent>,
    gauge: &ResourceGauge,
    body: F,
) -> Result<JoinHandle<()>, CastError>
where
    F: FnOnce() + Send + 'static,
{
    let reporter = ExitReporter {
        stage,
        events: events.clone(),
        _thread: gauge.acquire(ResourceKind::Thread),
    };
    thread::Builder::new()
        .name(format!("castline-{stage}"))
        .spawn(move || {
            let _reporter = reporter;
            body();
        })
        .map_err(|source| CastError::Spawn { stage, source })
}

/// A capture handle counted as a session resource.
struct CountedCapture {
    handle: Box<dyn CaptureHandle>,
    _guard: ResourceGuard,
}

/// The live parts of a pipeline, torn down in dependency order.
struct Stages {
    shutdown: Arc<AtomicBool>,
    exchange: Arc<FrameExchange>,
    capture: Option<CountedCapture>,
    encoder: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
}

impl Stages {
    /// Stop capture, close the exchange, join the encoder, then the sender.
    ///
    /// The socket closes when the send thread drops it.
    fn teardown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(capture) = self.capture.take() {
            capture.handle.stop();
        }
        self.exchange.close();
        for (name, thread) in [("encode", self.encoder.take()), ("send", self.sender.take())] {
            if let Some(thread) = thread {
                if thread.join().is_err() {
                    debug!(stage = name, "joined panicked stage");
                }
            }
        }
    }
}

impl Drop for Stages {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ── Launch ───────────────────────────────────────────────────────

/// What the service keeps for a live session.
pub(crate) struct RunningPipeline {
    pub supervisor: JoinHandle<()>,
    pub stop: Sender<()>,
}

/// Inputs to [`launch`].
pub(crate) struct LaunchSpec<'a> {
    pub shared: Arc<SessionShared>,
    pub backend: &'a dyn CaptureBackend,
    pub encoders: Arc<dyn EncoderFactory>,
    pub source: &'a CaptureSource,
    pub params: &'a SessionParams,
    pub config: &'a SessionConfig,
}

/// Spawn all stages and the supervisor. On error everything started so
/// far is torn down before returning.
pub(crate) fn launch(request: LaunchSpec<'_>) -> Result<RunningPipeline, CastError> {
    let LaunchSpec {
        shared,
        backend,
        encoders,
        source,
        params,
        config,
    } = request;

    let (stage_tx, stage_rx) = crossbeam_channel::unbounded();
    let (unit_tx, unit_rx) = crossbeam_channel::bounded(config.channel_capacity);
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);

    let mut stages = Stages {
        shutdown: Arc::new(AtomicBool::new(false)),
        exchange: Arc::new(FrameExchange::new()),
        capture: None,
        encoder: None,
        sender: None,
    };

    let socket = RtpSocket::bind(params.peer, &shared.gauge)?;
    let send_stage = SendStage {
        input: unit_rx,
        socket,
        packetizer: Packetizer::from_config(config),
        metrics: Arc::clone(&shared.metrics),
    };
    stages.sender = Some(spawn_stage("send", &stage_tx, &shared.gauge, move || {
        send_stage.run()
    })?);

    let encode_stage = EncodeStage {
        exchange: Arc::clone(&stages.exchange),
        factory: encoders,
        settings: EncoderSettings {
            bitrate_bps: params.bitrate_bps(),
            max_fps: params.fps_cap,
        },
        output: unit_tx,
        keyframe_request: Arc::clone(&shared.keyframe_request),
        shutdown: Arc::clone(&stages.shutdown),
        metrics: Arc::clone(&shared.metrics),
        events: stage_tx.clone(),
        gauge: shared.gauge.clone(),
        backpressure_timeout: config.backpressure_timeout,
        idr_interval: config.idr_interval,
    };
    stages.encoder = Some(spawn_stage("encode", &stage_tx, &shared.gauge, move || {
        encode_stage.run()
    })?);

    let sink = Arc::new(PipelineSink::new(
        Arc::clone(&stages.exchange),
        Arc::clone(&shared.metrics),
        stage_tx.clone(),
        params.fps_cap,
    ));
    let handle = backend.start(source, params.fps_cap, sink)?;
    stages.capture = Some(CountedCapture {
        handle,
        _guard: shared.gauge.acquire(ResourceKind::Capture),
    });
    info!(
        session = %shared.handle,
        source = %source.id,
        peer = %params.peer,
        bitrate_kbps = params.bitrate_kbps,
        fps = params.fps_cap,
        "pipeline started"
    );

    let supervisor = Supervisor {
        shared: Arc::clone(&shared),
        stages,
        stage_rx,
        stop_rx,
        health_interval: config.health_interval,
        telemetry_interval: config.telemetry_interval,
        degraded_queue_depth: config.degraded_queue_depth,
        _thread: shared.gauge.acquire(ResourceKind::Thread),
    };
    drop(stage_tx);
    let supervisor = thread::Builder::new()
        .name("castline-supervisor".into())
        .spawn(move || supervisor.run())
        .map_err(|source| CastError::Spawn {
            stage: "supervisor",
            source,
        })?;

    Ok(RunningPipeline {
        supervisor,
        stop: stop_tx,
    })
}

// ── Supervisor ───────────────────────────────────────────────────

enum Outcome {
    Stopped,
    Failed(String),
}

struct Supervisor {
    shared: Arc<SessionShared>,
    stages: Stages,
    stage_rx: Receiver<StageEvent>,
    stop_rx: Receiver<()>,
    health_interval: Duration,
    telemetry_interval: Duration,
    degraded_queue_depth: usize,
    _thread: ResourceGuard,
}

impl Supervisor {
    fn run(mut self) {
        let outcome = self.watch();
        if let Outcome::Failed(reason) = &outcome {
            debug!(session = %self.shared.handle, "tearing down after failure: {reason}");
        }
        self.stages.teardown();

        let Self {
            shared,
            _thread: thread_guard,
            ..
        } = self;
        drop(thread_guard);

        let result = match outcome {
            Outcome::Failed(reason) if shared.state() != SessionState::Stopping => {
                shared.transition(SessionState::fail, Some(reason))
            }
            _ => {
                if shared.state().is_active() {
                    // Stop channel hung up without a stop request.
                    let _ = shared.transition(SessionState::begin_stop, None);
                }
                shared.transition(SessionState::finish_stop, None)
            }
        };
        if let Err(e) = result {
            // A concurrent stop request owns the final transition.
            if shared.state() == SessionState::Stopping {
                let _ = shared.transition(SessionState::finish_stop, None);
            } else {
                warn!(session = %shared.handle, "final transition rejected: {e}");
            }
        }
    }

    /// Block until a stop request or a fatal stage event.
    fn watch(&self) -> Outcome {
        let health = tick(self.health_interval);
        let telemetry = tick(self.telemetry_interval);
        let mut capture_rate = RateMeter::new();
        let mut encode_rate = RateMeter::new();
        let mut seen_backlog = 0u64;

        loop {
            select! {
                recv(self.stop_rx) -> _ => return Outcome::Stopped,
                recv(self.stage_rx) -> event => match event {
                    Ok(StageEvent::FirstFrame) => {
                        let _ = self.shared.transition(SessionState::mark_running, None);
                    }
                    Ok(StageEvent::SourceLost(reason)) => {
                        return Outcome::Failed(CastError::SourceLost(reason).to_string());
                    }
                    Ok(StageEvent::EncoderInitFailed(reason)) => return Outcome::Failed(reason),
                    Ok(StageEvent::StageExited { stage, panicked }) => {
                        if panicked {
                            return Outcome::Failed(format!("{stage} thread panicked"));
                        }
                        if !self.stages.shutdown.load(Ordering::SeqCst) {
                            return Outcome::Failed(format!("{stage} stage exited unexpectedly"));
                        }
                    }
                    Err(_) => return Outcome::Failed("all stages disconnected".into()),
                },
                recv(health) -> _ => {
                    let metrics = &self.shared.metrics;
                    capture_rate.record(metrics.frames_captured.load(Ordering::Relaxed));
                    encode_rate.record(metrics.frames_encoded.load(Ordering::Relaxed));
                    metrics.set_rates(capture_rate.rate(), encode_rate.rate());

                    let backlog = metrics.backlog_events.load(Ordering::Relaxed);
                    let depth = metrics.queue_depth.load(Ordering::Relaxed);
                    let backlogged = backlog > seen_backlog;
                    seen_backlog = backlog;
                    self.check_health(backlogged, depth);
                },
                recv(telemetry) -> _ => {
                    if self.shared.state().is_streaming() {
                        self.shared.publish_telemetry();
                    }
                },
            }
        }
    }

    /// Move between Running and Degraded on the last interval's signals.
    fn check_health(&self, backlogged: bool, depth: usize) {
        let congested = backlogged || depth >= self.degraded_queue_depth;
        match (self.shared.state(), congested) {
            (SessionState::Running, true) => {
                let reason = if backlogged {
                    "encoder backpressure".to_string()
                } else {
                    format!("send queue depth {depth}")
                };
                let _ = self
                    .shared
                    .transition(SessionState::mark_degraded, Some(reason));
            }
            (SessionState::Degraded, false) => {
                let _ = self.shared.transition(SessionState::mark_running, None);
            }
            _ => {}
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
