//! GDI capture of a single top-level window.
//!
//! Copies the client area with `BitBlt` into a memory DC and reads it
//! back as top-down 32-bit BGRA with `GetDIBits`. The window is polled at
//! the frame rate cap; when it is destroyed the sink receives
//! `on_source_lost`.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};
use windows::Win32::Foundation::{HWND, RECT};
use windows::Win32::Graphics::Gdi::{
    BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC, GetDIBits,
    ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS, SRCCOPY,
};
use windows::Win32::UI::WindowsAndMessaging::{GetClientRect, IsWindow};

use crate::capture::{frame_interval, pace, CaptureSource, FrameSink};
use crate::error::CastError;
use crate::frame::{PixelFormat, RawFrame};

use super::win32::{qpc_now, qpc_to_duration};

/// Resolve a `window:HWND` id.
pub fn window_handle(source: &CaptureSource) -> Result<usize, CastError> {
    let raw: usize = source
        .id
        .strip_prefix("window:")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| CastError::UnknownSource(source.id.clone()))?;
    if !unsafe { IsWindow(HWND(raw as *mut c_void)) }.as_bool() {
        return Err(CastError::UnknownSource(source.id.clone()));
    }
    Ok(raw)
}

/// Poll `hwnd` until `stop` is set or the window is destroyed.
pub(crate) fn run(
    raw_hwnd: usize,
    max_fps: u32,
    sink: Arc<dyn FrameSink>,
    ready: crossbeam_channel::Sender<Result<(), CastError>>,
    stop: &AtomicBool,
) {
    let hwnd = HWND(raw_hwnd as *mut c_void);
    let _ = ready.send(Ok(()));
    info!(hwnd = raw_hwnd, "GDI window capture started");

    let interval = frame_interval(max_fps);
    while !stop.load(Ordering::SeqCst) {
        let loop_start = Instant::now();
        if !unsafe { IsWindow(hwnd) }.as_bool() {
            sink.on_source_lost(format!("window {raw_hwnd:#x} closed"));
            return;
        }
        match grab(hwnd) {
            Ok(Some(frame)) => sink.on_frame(frame),
            // Minimised windows have an empty client rect.
            Ok(None) => {}
            Err(e) => debug!(hwnd = raw_hwnd, "window grab failed: {e}"),
        }
        pace(loop_start, interval);
    }
    debug!(hwnd = raw_hwnd, "window capture loop exited");
}

/// Copy the client area of `hwnd` into a new frame.
fn grab(hwnd: HWND) -> Result<Option<RawFrame>, CastError> {
    let mut rect = RECT::default();
    unsafe {
        GetClientRect(hwnd, &mut rect)
            .map_err(|e| CastError::Other(format!("GetClientRect failed: {e}")))?;
    }
    let width = (rect.right - rect.left).max(0);
    let height = (rect.bottom - rect.top).max(0);
    if width == 0 || height == 0 {
        return Ok(None);
    }

    let stride = width as usize * 4;
    let mut data = vec![0u8; stride * height as usize];
    let timestamp = qpc_to_duration(qpc_now());

    unsafe {
        let window_dc = GetDC(hwnd);
        let mem_dc = CreateCompatibleDC(window_dc);
        let bitmap = CreateCompatibleBitmap(window_dc, width, height);
        let previous = SelectObject(mem_dc, bitmap);

        let blit = BitBlt(mem_dc, 0, 0, width, height, window_dc, 0, 0, SRCCOPY);

        let mut info = BITMAPINFO {
            bmiHeader: BITMAPINFOHEADER {
                biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                biWidth: width,
                // Negative height selects a top-down DIB.
                biHeight: -height,
                biPlanes: 1,
                biBitCount: 32,
                biCompression: BI_RGB.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let lines = if blit.is_ok() {
            GetDIBits(
                mem_dc,
                bitmap,
                0,
                height as u32,
                Some(data.as_mut_ptr() as *mut c_void),
                &mut info,
                DIB_RGB_COLORS,
            )
        } else {
            0
        };

        SelectObject(mem_dc, previous);
        let _ = DeleteObject(bitmap);
        let _ = DeleteDC(mem_dc);
        ReleaseDC(hwnd, window_dc);

        blit.map_err(|e| CastError::Other(format!("BitBlt failed: {e}")))?;
        if lines != height {
            return Err(CastError::Other(format!(
                "GetDIBits copied {lines} of {height} lines"
            )));
        }
    }

    Ok(Some(RawFrame {
        width: width as u32,
        height: height as u32,
        stride: stride as u32,
        format: PixelFormat::Bgra8,
        data,
        timestamp,
    }))
}
