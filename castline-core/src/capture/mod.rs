//! Frame sources.
//!
//! A [`CaptureBackend`] enumerates monitors and windows and starts a
//! delivery thread for one of them. Frames are pushed into a
//! [`FrameSink`], the small capability interface the pipeline hands to
//! every backend, so downstream stages never see the platform API.
//!
//! | Backend              | Platform | Sources            |
//! |----------------------|----------|--------------------|
//! | `WindowsBackend`     | Windows  | DXGI monitors, GDI windows |
//! | [`SyntheticBackend`] | any      | generated test pattern |

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::CastError;
use crate::frame::RawFrame;

pub mod synthetic;

#[cfg(target_os = "windows")]
pub mod dxgi;
#[cfg(target_os = "windows")]
pub mod window;
#[cfg(target_os = "windows")]
mod win32;

pub use synthetic::{SyntheticBackend, SyntheticConfig};
#[cfg(target_os = "windows")]
pub use win32::WindowsBackend;

// ── Sources ──────────────────────────────────────────────────────

/// What a capture source points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Monitor,
    Window,
}

/// One capturable monitor or window, as seen in a single enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSource {
    /// Stable id within the snapshot, e.g. `monitor:0` or `window:65554`.
    pub id: String,
    /// Human-readable name (device name or window title).
    pub name: String,
    pub kind: SourceKind,
    /// Whether this is the primary monitor. Always `false` for windows.
    pub primary: bool,
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let star = if self.primary { " *" } else { "" };
        write!(f, "{} \"{}\"{star}", self.id, self.name)
    }
}

/// Result of [`CaptureBackend::enumerate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceList {
    pub monitors: Vec<CaptureSource>,
    pub windows: Vec<CaptureSource>,
}

impl SourceList {
    /// Look up a source by id.
    pub fn find(&self, id: &str) -> Option<&CaptureSource> {
        self.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CaptureSource> {
        self.monitors.iter().chain(self.windows.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty() && self.windows.is_empty()
    }
}

// ── Capability interfaces ────────────────────────────────────────

/// Receiver of captured frames.
///
/// Called on the backend's delivery thread. Implementations must return
/// promptly and never block.
pub trait FrameSink: Send + Sync {
    /// A new frame is available.
    fn on_frame(&self, frame: RawFrame);

    /// The source disappeared. No further frames follow.
    fn on_source_lost(&self, reason: String);
}

/// A running capture started by [`CaptureBackend::start`].
pub trait CaptureHandle: Send {
    /// Stop delivery and release the platform capture objects.
    ///
    /// Returns once the delivery thread has exited.
    fn stop(self: Box<Self>);
}

/// A platform capture implementation.
pub trait CaptureBackend: Send + Sync {
    /// List capturable monitors and windows.
    ///
    /// Empty lists are a valid answer; an error means the platform API
    /// itself is unavailable.
    fn enumerate(&self) -> Result<SourceList, CastError>;

    /// Begin delivering frames of `source` into `sink`, at most `max_fps`
    /// per second.
    fn start(
        &self,
        source: &CaptureSource,
        max_fps: u32,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Box<dyn CaptureHandle>, CastError>;
}

/// The native backend for this platform.
#[cfg(target_os = "windows")]
pub fn platform_backend() -> Arc<dyn CaptureBackend> {
    Arc::new(WindowsBackend::new())
}

/// The native backend for this platform.
#[cfg(not(target_os = "windows"))]
pub fn platform_backend() -> Arc<dyn CaptureBackend> {
    Arc::new(UnsupportedBackend)
}

/// Stand-in on platforms without a native backend.
#[cfg(not(target_os = "windows"))]
pub struct UnsupportedBackend;

#[cfg(not(target_os = "windows"))]
impl CaptureBackend for UnsupportedBackend {
    fn enumerate(&self) -> Result<SourceList, CastError> {
        Err(CastError::SourceEnumeration(
            "native capture is only available on Windows".into(),
        ))
    }

    fn start(
        &self,
        source: &CaptureSource,
        _max_fps: u32,
        _sink: Arc<dyn FrameSink>,
    ) -> Result<Box<dyn CaptureHandle>, CastError> {
        Err(CastError::UnknownSource(source.id.clone()))
    }
}

// ── Threaded delivery ────────────────────────────────────────────

/// A delivery thread with a cooperative stop flag.
///
/// Backends run their capture loop inside [`ThreadedCapture::spawn`];
/// the loop polls the flag between frames.
pub struct ThreadedCapture {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadedCapture {
    pub fn spawn<F>(name: &str, body: F) -> Result<Self, CastError>
    where
        F: FnOnce(&AtomicBool) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag.as_ref()))
            .map_err(|source| CastError::Spawn {
                stage: "capture",
                source,
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("capture delivery thread panicked");
            }
        }
    }
}

impl CaptureHandle for ThreadedCapture {
    fn stop(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl Drop for ThreadedCapture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleep for the remainder of the frame interval.
pub(crate) fn pace(loop_start: Instant, interval: Duration) {
    let elapsed = loop_start.elapsed();
    if elapsed < interval {
        std::thread::sleep(interval - elapsed);
    }
}

/// Frame interval for a rate cap.
pub(crate) fn frame_interval(max_fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / max_fps.max(1) as f64)
}

// ── Tests ────────────────────────────────────────────────────────
