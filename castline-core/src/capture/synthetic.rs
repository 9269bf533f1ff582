//! Generated test-pattern source.
//!
//! Behaves like a platform backend (own delivery thread, cooperative
//! stop, platform-style timestamps) but renders frames in software. The
//! timestamps come from a synthetic clock advancing exactly one frame
//! interval per frame, which keeps RTP timestamp spacing exact.
//!
//! It can be scripted to fail enumeration or to lose its source after a
//! fixed number of frames, which is how the failure paths are exercised.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::capture::{
    frame_interval, pace, CaptureBackend, CaptureHandle, CaptureSource, FrameSink, SourceKind,
    SourceList, ThreadedCapture,
};
use crate::error::CastError;
use crate::frame::{PixelFormat, RawFrame};

/// Behaviour of a [`SyntheticBackend`].
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Rate at which the "platform" offers frames.
    pub fps: u32,
    /// Deliver at `min(fps, max_fps)`; when `false` the cap is left to the sink.
    pub honor_cap: bool,
    pub format: PixelFormat,
    /// Number of monitors to report.
    pub monitors: usize,
    /// Window titles to report.
    pub windows: Vec<String>,
    /// Fire `on_source_lost` after this many frames.
    pub lose_after: Option<u64>,
    /// Make `enumerate` fail as if the platform API were missing.
    pub fail_enumeration: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 30,
            honor_cap: true,
            format: PixelFormat::Bgra8,
            monitors: 1,
            windows: vec!["Synthetic Window".into()],
            lose_after: None,
            fail_enumeration: false,
        }
    }
}

/// Software capture backend.
pub struct SyntheticBackend {
    config: SyntheticConfig,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }

    fn sources(&self) -> SourceList {
        let monitors = (0..self.config.monitors)
            .map(|i| CaptureSource {
                id: format!("monitor:{i}"),
                name: format!("Synthetic Display {}", i + 1),
                kind: SourceKind::Monitor,
                primary: i == 0,
            })
            .collect();
        let windows = self
            .config
            .windows
            .iter()
            .enumerate()
            .map(|(i, title)| CaptureSource {
                id: format!("window:{}", 1000 + i),
                name: title.clone(),
                kind: SourceKind::Window,
                primary: false,
            })
            .collect();
        SourceList { monitors, windows }
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(SyntheticConfig::default())
    }
}

impl CaptureBackend for SyntheticBackend {
    fn enumerate(&self) -> Result<SourceList, CastError> {
        if self.config.fail_enumeration {
            return Err(CastError::SourceEnumeration(
                "synthetic platform API unavailable".into(),
            ));
        }
        Ok(self.sources())
    }

    fn start(
        &self,
        source: &CaptureSource,
        max_fps: u32,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Box<dyn CaptureHandle>, CastError> {
        if self.sources().find(&source.id).is_none() {
            return Err(CastError::UnknownSource(source.id.clone()));
        }

        let cfg = self.config.clone();
        let rate = if cfg.honor_cap {
            cfg.fps.min(max_fps)
        } else {
            cfg.fps
        };
        let interval = frame_interval(rate);
        info!(source = %source.id, rate, "synthetic capture started");

        let handle = ThreadedCapture::spawn("castline-capture", move |stop| {
            let mut index: u64 = 0;
            while !stop.load(Ordering::SeqCst) {
                let loop_start = Instant::now();
                if cfg.lose_after.is_some_and(|limit| index >= limit) {
                    debug!(frames = index, "synthetic source closing");
                    sink.on_source_lost("synthetic source closed".into());
                    return;
                }
                sink.on_frame(render(&cfg, index, interval));
                index += 1;
                pace(loop_start, interval);
            }
        })?;
        Ok(Box::new(handle))
    }
}

/// Render frame `index` of a scrolling gradient.
fn render(cfg: &SyntheticConfig, index: u64, interval: Duration) -> RawFrame {
    let bpp = cfg.format.bytes_per_pixel();
    let stride = cfg.width as usize * bpp;
    let mut data = vec![0u8; stride * cfg.height as usize];
    let shift = (index * 4) as usize;
    for (y, row) in data.chunks_exact_mut(stride).enumerate() {
        for (x, px) in row.chunks_exact_mut(bpp).enumerate() {
            let (r, g, b) = (((x + shift) & 0xFF) as u8, (y & 0xFF) as u8, ((x ^ y) & 0xFF) as u8);
            match cfg.format {
                PixelFormat::Bgra8 => px.copy_from_slice(&[b, g, r, 0xFF]),
                PixelFormat::Rgba8 => px.copy_from_slice(&[r, g, b, 0xFF]),
            }
        }
    }
    RawFrame {
        width: cfg.width,
        height: cfg.height,
        stride: stride as u32,
        format: cfg.format,
        data,
        timestamp: interval * index as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<RawFrame>>,
        lost: Mutex<Option<String>>,
    }

    impl FrameSink for Collect {
        fn on_frame(&self, frame: RawFrame) {
            self.frames.lock().unwrap().push(frame);
        }

        fn on_source_lost(&self, reason: String) {
            *self.lost.lock().unwrap() = Some(reason);
        }
    }

    #[test]
    fn enumerates_monitors_and_windows() {
        let list = SyntheticBackend::default().enumerate().unwrap();
        assert_eq!(list.monitors.len(), 1);
        assert!(list.monitors[0].primary);
        assert_eq!(list.windows[0].id, "window:1000");
    }

    #[test]
    fn enumeration_failure() {
        let backend = SyntheticBackend::new(SyntheticConfig {
            fail_enumeration: true,
            ..Default::default()
        });
        assert!(matches!(
            backend.enumerate(),
            Err(CastError::SourceEnumeration(_))
        ));
    }

    #[test]
    fn empty_enumeration_is_not_an_error() {
        let backend = SyntheticBackend::new(SyntheticConfig {
            monitors: 0,
            windows: Vec::new(),
            ..Default::default()
        });
        assert!(backend.enumerate().unwrap().is_empty());
    }

    #[test]
    fn source_lost_after_limit() {
        let backend = SyntheticBackend::new(SyntheticConfig {
            fps: 200,
            lose_after: Some(3),
            ..Default::default()
        });
        let source = backend.enumerate().unwrap().monitors[0].clone();
        let sink = Arc::new(Collect::default());
        let handle = backend.start(&source, 200, sink.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        handle.stop();

        assert_eq!(sink.frames.lock().unwrap().len(), 3);
        assert!(sink.lost.lock().unwrap().is_some());
    }

    #[test]
    fn timestamps_advance_one_interval_per_frame() {
        let cfg = SyntheticConfig::default();
        let interval = frame_interval(30);
        let a = render(&cfg, 4, interval);
        let b = render(&cfg, 5, interval);
        assert_eq!(b.timestamp - a.timestamp, interval);
        assert!(a.is_well_formed());
    }

    #[test]
    fn unknown_source_rejected() {
        let backend = SyntheticBackend::default();
        let bogus = CaptureSource {
            id: "monitor:9".into(),
            name: String::new(),
            kind: SourceKind::Monitor,
            primary: false,
        };
        let sink = Arc::new(Collect::default());
        assert!(matches!(
            backend.start(&bogus, 30, sink),
            Err(CastError::UnknownSource(_))
        ));
    }
}
