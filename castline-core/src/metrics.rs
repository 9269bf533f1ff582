//! Per-session counters, rate estimation and resource accounting.
//!
//! Every session owns a fresh [`SessionMetrics`]; stages bump its atomic
//! counters, the supervisor turns counter deltas into frame rates with a
//! [`RateMeter`], and [`SessionMetrics::snapshot`] produces the value the
//! application sees.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

// ── SessionMetrics ───────────────────────────────────────────────

/// Live counters shared by reference with every stage of one session.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_encoded: AtomicU64,
    pub keyframes: AtomicU64,
    pub encode_errors: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    /// Times the encoder waited longer than the backpressure timeout.
    pub backlog_events: AtomicU64,
    /// Access units waiting in the encoder → sender channel.
    pub queue_depth: AtomicUsize,
    capture_fps_bits: AtomicU64,
    encode_fps_bits: AtomicU64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_rates(&self, capture_fps: f64, encode_fps: f64) {
        self.capture_fps_bits
            .store(capture_fps.to_bits(), Ordering::Relaxed);
        self.encode_fps_bits
            .store(encode_fps.to_bits(), Ordering::Relaxed);
    }

    pub fn capture_fps(&self) -> f64 {
        f64::from_bits(self.capture_fps_bits.load(Ordering::Relaxed))
    }

    pub fn encode_fps(&self) -> f64 {
        f64::from_bits(self.encode_fps_bits.load(Ordering::Relaxed))
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            capture_fps: self.capture_fps(),
            encode_fps: self.encode_fps(),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            dropped_frames: self.frames_dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            keyframes: self.keyframes.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Serializable metrics as reported to the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub capture_fps: f64,
    pub encode_fps: f64,
    pub queue_depth: usize,
    pub dropped_frames: u64,
    pub send_errors: u64,
    pub encode_errors: u64,
    pub frames_captured: u64,
    pub frames_encoded: u64,
    pub keyframes: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

// ── RateMeter ────────────────────────────────────────────────────

/// Rolling-window rate estimator over a monotonically growing counter.
///
/// Records `(timestamp, total)` samples and derives events per second
/// over the most recent `window`.
pub struct RateMeter {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl RateMeter {
    /// Create a meter with a 2-second rolling window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(2))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(16),
            window,
        }
    }

    /// Record the counter's current total.
    pub fn record(&mut self, total: u64) {
        self.record_at(Instant::now(), total);
    }

    /// Record with an explicit timestamp (useful for testing).
    pub fn record_at(&mut self, when: Instant, total: u64) {
        self.samples.push_back((when, total));
        while let Some(&(ts, _)) = self.samples.front() {
            // Keep one sample at or beyond the window edge as the baseline.
            if self.samples.len() > 2 && when.duration_since(ts) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Events per second between the oldest and newest sample.
    pub fn rate(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(&(t0, c0)), Some(&(t1, c1))) if t1 > t0 => {
                c1.saturating_sub(c0) as f64 / t1.duration_since(t0).as_secs_f64()
            }
            _ => 0.0,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ── Resource accounting ──────────────────────────────────────────

/// Kinds of session-scoped resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Socket,
    Encoder,
    Capture,
    Thread,
}

impl ResourceKind {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        match self {
            ResourceKind::Socket => 0,
            ResourceKind::Encoder => 1,
            ResourceKind::Capture => 2,
            ResourceKind::Thread => 3,
        }
    }
}

/// Counts live session resources so teardown can be verified.
#[derive(Debug, Clone, Default)]
pub struct ResourceGauge {
    counts: Arc<[AtomicUsize; ResourceKind::COUNT]>,
}

impl ResourceGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live resource; it is released when the guard drops.
    pub fn acquire(&self, kind: ResourceKind) -> ResourceGuard {
        self.counts[kind.index()].fetch_add(1, Ordering::SeqCst);
        ResourceGuard {
            gauge: self.clone(),
            kind,
        }
    }

    /// Live resources of one kind.
    pub fn open_of(&self, kind: ResourceKind) -> usize {
        self.counts[kind.index()].load(Ordering::SeqCst)
    }

    /// Total live resources.
    pub fn open(&self) -> usize {
        self.counts.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }
}

/// Drop guard paired with [`ResourceGauge::acquire`].
#[derive(Debug)]
pub struct ResourceGuard {
    gauge: ResourceGauge,
    kind: ResourceKind,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.gauge.counts[self.kind.index()].fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Tests ────────────────────────────────────────────────────────
