//! Native Windows backend: DXGI monitors plus GDI windows.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;
use windows::Win32::Foundation::{BOOL, HWND, LPARAM, TRUE};
use windows::Win32::System::Performance::{QueryPerformanceCounter, QueryPerformanceFrequency};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetWindowTextLengthW, GetWindowTextW, IsWindowVisible,
};

use crate::capture::{
    dxgi, window, CaptureBackend, CaptureHandle, CaptureSource, FrameSink, SourceKind,
    SourceList, ThreadedCapture,
};
use crate::error::CastError;

/// How long `start` waits for the delivery thread to initialise.
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

// ── QPC clock ────────────────────────────────────────────────────

fn qpc_frequency() -> i64 {
    static FREQ: OnceLock<i64> = OnceLock::new();
    *FREQ.get_or_init(|| {
        let mut freq = 0i64;
        // Cannot fail on XP and later.
        let _ = unsafe { QueryPerformanceFrequency(&mut freq) };
        freq.max(1)
    })
}

/// Current QPC tick count.
pub(crate) fn qpc_now() -> i64 {
    let mut ticks = 0i64;
    let _ = unsafe { QueryPerformanceCounter(&mut ticks) };
    ticks
}

/// Convert QPC ticks to a duration on the same monotonic clock.
pub(crate) fn qpc_to_duration(ticks: i64) -> Duration {
    let freq = qpc_frequency() as u128;
    let ticks = ticks.max(0) as u128;
    Duration::from_nanos((ticks * 1_000_000_000 / freq) as u64)
}

// ── Backend ──────────────────────────────────────────────────────

/// DXGI Desktop Duplication for monitors, GDI for individual windows.
#[derive(Default)]
pub struct WindowsBackend;

impl WindowsBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for WindowsBackend {
    fn enumerate(&self) -> Result<SourceList, CastError> {
        let monitors = dxgi::enumerate_monitors()?;
        let windows = enumerate_windows()?;
        debug!(monitors = monitors.len(), windows = windows.len(), "enumerated sources");
        Ok(SourceList { monitors, windows })
    }

    fn start(
        &self,
        source: &CaptureSource,
        max_fps: u32,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Box<dyn CaptureHandle>, CastError> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let handle = match source.kind {
            SourceKind::Monitor => {
                let index = dxgi::monitor_index(source)?;
                ThreadedCapture::spawn("castline-capture", move |stop| {
                    dxgi::run(index, max_fps, sink, ready_tx, stop)
                })?
            }
            SourceKind::Window => {
                let hwnd = window::window_handle(source)?;
                ThreadedCapture::spawn("castline-capture", move |stop| {
                    window::run(hwnd, max_fps, sink, ready_tx, stop)
                })?
            }
        };

        match ready_rx.recv_timeout(INIT_TIMEOUT) {
            Ok(Ok(())) => Ok(Box::new(handle)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CastError::Timeout(INIT_TIMEOUT)),
        }
    }
}

// ── Window enumeration ───────────────────────────────────────────

fn enumerate_windows() -> Result<Vec<CaptureSource>, CastError> {
    let mut found: Vec<CaptureSource> = Vec::new();
    unsafe {
        EnumWindows(
            Some(collect_window),
            LPARAM(&mut found as *mut Vec<CaptureSource> as isize),
        )
        .map_err(|e| CastError::SourceEnumeration(format!("EnumWindows failed: {e}")))?;
    }
    Ok(found)
}

unsafe extern "system" fn collect_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
    // SAFETY: `lparam` is the `&mut Vec` passed by `enumerate_windows`,
    // which outlives the synchronous EnumWindows call.
    let found = unsafe { &mut *(lparam.0 as *mut Vec<CaptureSource>) };
    if !unsafe { IsWindowVisible(hwnd) }.as_bool() {
        return TRUE;
    }
    let len = unsafe { GetWindowTextLengthW(hwnd) };
    if len <= 0 {
        return TRUE;
    }
    let mut buf = vec![0u16; len as usize + 1];
    let copied = unsafe { GetWindowTextW(hwnd, &mut buf) };
    if copied <= 0 {
        return TRUE;
    }
    found.push(CaptureSource {
        id: format!("window:{}", hwnd.0 as usize),
        name: String::from_utf16_lossy(&buf[..copied as usize]),
        kind: SourceKind::Window,
        primary: false,
    });
    TRUE
}
