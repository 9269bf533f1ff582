//! H.264 encode stage.
//!
//! The stage owns the encoder for the life of a session. Each cycle it
//! takes the newest frame from the [`FrameExchange`], converts it to
//! I420, encodes it and hands the resulting [`AccessUnit`] to the sender
//! over a bounded channel.
//!
//! Keyframes are produced for the first picture, on request through the
//! session's keyframe flag, and optionally on a fixed interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{SendTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::error::CastError;
use crate::exchange::FrameExchange;
use crate::frame::PlanarFrame;
use crate::metrics::{ResourceGauge, ResourceKind, SessionMetrics};
use crate::session::events::StageEvent;

pub mod convert;
pub mod h264;

pub use h264::{OpenH264Encoder, OpenH264Factory};

// ── Encoder seam ─────────────────────────────────────────────────

/// Rate settings handed to an encoder at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub bitrate_bps: u32,
    pub max_fps: u32,
}

/// One encoded picture.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// NAL units in decoding order, without start codes.
    pub nals: Vec<Bytes>,
    /// Whether the picture is an IDR.
    pub keyframe: bool,
}

/// A low-latency H.264 encoder.
///
/// Implementations must emit Annex-B conformant NAL units, no B-frames
/// and SPS/PPS ahead of every IDR.
pub trait VideoEncoder {
    /// Encode one picture. `Ok(None)` means rate control skipped it.
    fn encode(
        &mut self,
        picture: &PlanarFrame,
        force_keyframe: bool,
    ) -> Result<Option<EncodedFrame>, CastError>;
}

/// Builds encoders on the encode thread.
pub trait EncoderFactory: Send + Sync {
    fn create(&self, settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>, CastError>;
}

// ── AccessUnit ───────────────────────────────────────────────────

/// The NAL units of one picture plus its presentation time.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub nals: Vec<Bytes>,
    pub keyframe: bool,
    /// Capture time relative to the session's first encoded frame.
    pub pts: Duration,
}

impl AccessUnit {
    /// Total NAL bytes, excluding any framing.
    pub fn payload_len(&self) -> usize {
        self.nals.iter().map(Bytes::len).sum()
    }
}

// ── EncodeStage ──────────────────────────────────────────────────

/// Everything the encode thread needs for one session.
pub(crate) struct EncodeStage {
    pub exchange: Arc<FrameExchange>,
    pub factory: Arc<dyn EncoderFactory>,
    pub settings: EncoderSettings,
    pub output: Sender<AccessUnit>,
    pub keyframe_request: Arc<AtomicBool>,
    pub shutdown: Arc<AtomicBool>,
    pub metrics: Arc<SessionMetrics>,
    pub events: Sender<StageEvent>,
    pub gauge: ResourceGauge,
    pub backpressure_timeout: Duration,
    pub idr_interval: Option<Duration>,
}

impl EncodeStage {
    /// Run until the exchange closes, the sender hangs up or init fails.
    pub(crate) fn run(self) {
        let mut encoder = match self.factory.create(&self.settings) {
            Ok(e) => e,
            Err(e) => {
                warn!("encoder init failed: {e}");
                let _ = self.events.send(StageEvent::EncoderInitFailed(e.to_string()));
                return;
            }
        };
        let _encoder_guard = self.gauge.acquire(ResourceKind::Encoder);

        let mut picture = PlanarFrame::default();
        let mut first_timestamp: Option<Duration> = None;
        let mut need_idr = true;
        let mut last_idr = Instant::now();

        while let Some(frame) = self.exchange.take() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = convert::to_i420(&frame, &mut picture) {
                SessionMetrics::incr(&self.metrics.encode_errors);
                debug!("frame skipped: {e}");
                continue;
            }

            let periodic = self
                .idr_interval
                .is_some_and(|every| last_idr.elapsed() >= every);
            let requested = self.keyframe_request.swap(false, Ordering::SeqCst);
            let force = need_idr || requested || periodic;

            let encoded = match encoder.encode(&picture, force) {
                Ok(Some(encoded)) => encoded,
                Ok(None) => {
                    need_idr |= force;
                    continue;
                }
                Err(e) => {
                    SessionMetrics::incr(&self.metrics.encode_errors);
                    debug!("encode failed: {e}");
                    need_idr |= force;
                    continue;
                }
            };

            // A forced picture that did not come out as IDR is retried next cycle.
            need_idr = force && !encoded.keyframe;
            SessionMetrics::incr(&self.metrics.frames_encoded);
            if encoded.keyframe {
                SessionMetrics::incr(&self.metrics.keyframes);
                last_idr = Instant::now();
            }

            let base = match first_timestamp {
                Some(base) => base,
                None => {
                    info!(
                        width = picture.width(),
                        height = picture.height(),
                        keyframe = encoded.keyframe,
                        "first frame encoded"
                    );
                    first_timestamp = Some(frame.timestamp);
                    frame.timestamp
                }
            };

            let unit = AccessUnit {
                nals: encoded.nals,
                keyframe: encoded.keyframe,
                pts: frame.timestamp.saturating_sub(base),
            };
            if !self.forward(unit) {
                break;
            }
        }
        debug!("encode stage exited");
    }

    /// Push `unit` to the sender, counting every timeout as a backlog
    /// event. Returns `false` when the stage should stop.
    fn forward(&self, mut unit: AccessUnit) -> bool {
        loop {
            match self.output.send_timeout(unit, self.backpressure_timeout) {
                Ok(()) => {
                    self.metrics
                        .queue_depth
                        .store(self.output.len(), Ordering::Relaxed);
                    return true;
                }
                Err(SendTimeoutError::Timeout(back)) => {
                    SessionMetrics::incr(&self.metrics.backlog_events);
                    self.metrics
                        .queue_depth
                        .store(self.output.len(), Ordering::Relaxed);
                    if self.shutdown.load(Ordering::SeqCst) {
                        return false;
                    }
                    unit = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
