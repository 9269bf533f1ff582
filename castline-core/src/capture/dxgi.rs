//! DXGI Desktop Duplication monitor capture.
//!
//! Uses the Direct3D 11 Desktop Duplication API to obtain GPU-backed
//! desktop frames:
//!
//! 1. Create a D3D11 device and walk Device → Adapter → Output.
//! 2. Duplicate the output and create a CPU-readable staging texture.
//! 3. Per frame: `AcquireNextFrame`, copy to staging, release the DXGI
//!    frame, map, copy rows into a `Vec<u8>`, unmap.
//!
//! All COM objects are created and used on the delivery thread only.
//! Frame timestamps are the compositor's `LastPresentTime` (QPC ticks).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use windows::core::Interface;
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;

use crate::capture::{frame_interval, pace, CaptureSource, FrameSink, SourceKind};
use crate::error::CastError;
use crate::frame::{PixelFormat, RawFrame};

use super::win32::qpc_to_duration;

/// How often an unchanged desktop is re-sent so keyframe requests and
/// late joiners are served.
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

// ── Enumeration ──────────────────────────────────────────────────

/// List the outputs attached to the default hardware adapter.
pub fn enumerate_monitors() -> Result<Vec<CaptureSource>, CastError> {
    let (device, _context) = create_device()
        .map_err(|e| CastError::SourceEnumeration(e.to_string()))?;
    let adapter = adapter_of(&device).map_err(|e| CastError::SourceEnumeration(e.to_string()))?;

    let mut monitors = Vec::new();
    let mut index = 0u32;
    // EnumOutputs fails with DXGI_ERROR_NOT_FOUND past the last output.
    while let Ok(output) = unsafe { adapter.EnumOutputs(index) } {
        if let Ok(desc) = unsafe { output.GetDesc() } {
            if desc.AttachedToDesktop.as_bool() {
                let name = String::from_utf16_lossy(&desc.DeviceName)
                    .trim_end_matches('\0')
                    .to_string();
                let origin = desc.DesktopCoordinates;
                monitors.push(CaptureSource {
                    id: format!("monitor:{index}"),
                    name,
                    kind: SourceKind::Monitor,
                    primary: origin.left == 0 && origin.top == 0,
                });
            }
        }
        index += 1;
    }
    Ok(monitors)
}

/// Parse a `monitor:N` id.
pub fn monitor_index(source: &CaptureSource) -> Result<u32, CastError> {
    source
        .id
        .strip_prefix("monitor:")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| CastError::UnknownSource(source.id.clone()))
}

// ── Delivery loop ────────────────────────────────────────────────

/// Run the capture loop for `monitor` until `stop` is set or the
/// output disappears. `ready` receives the initialisation result.
pub(crate) fn run(
    monitor: u32,
    max_fps: u32,
    sink: Arc<dyn FrameSink>,
    ready: crossbeam_channel::Sender<Result<(), CastError>>,
    stop: &AtomicBool,
) {
    let mut dup = match Duplicator::new(monitor) {
        Ok(d) => {
            let _ = ready.send(Ok(()));
            d
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    info!(monitor, width = dup.width, height = dup.height, "DXGI duplication started");

    let interval = frame_interval(max_fps);
    let timeout_ms = interval.as_millis().clamp(1, 100) as u32;
    let mut last_delivery: Option<Instant> = None;

    while !stop.load(Ordering::SeqCst) {
        let loop_start = Instant::now();
        match dup.acquire(timeout_ms) {
            Ok(Some(frame)) => {
                sink.on_frame(frame);
                last_delivery = Some(Instant::now());
            }
            Ok(None) => {
                // Static desktop: re-send the staging contents periodically.
                if last_delivery.is_some_and(|t| t.elapsed() >= REFRESH_INTERVAL) {
                    match dup.read_staging(None) {
                        Ok(frame) => {
                            sink.on_frame(frame);
                            last_delivery = Some(Instant::now());
                        }
                        Err(e) => debug!("staging refresh failed: {e}"),
                    }
                }
                continue;
            }
            Err(AcquireError::AccessLost) => {
                warn!(monitor, "desktop duplication access lost; re-duplicating");
                match Duplicator::new(monitor) {
                    Ok(d) => dup = d,
                    Err(e) => {
                        sink.on_source_lost(format!("monitor {monitor} unavailable: {e}"));
                        return;
                    }
                }
                continue;
            }
            Err(AcquireError::Fatal(reason)) => {
                sink.on_source_lost(reason);
                return;
            }
        }
        pace(loop_start, interval);
    }
    debug!(monitor, "DXGI capture loop exited");
}

// ── Duplicator ───────────────────────────────────────────────────

enum AcquireError {
    AccessLost,
    Fatal(String),
}

/// Owns the D3D11 device, the output duplication and the staging texture.
struct Duplicator {
    width: u32,
    height: u32,
    context: ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
    staging_texture: ID3D11Texture2D,
    _device: ID3D11Device,
}

impl Duplicator {
    fn new(monitor_index: u32) -> Result<Self, CastError> {
        let (device, context) = create_device()?;
        let adapter = adapter_of(&device)?;

        let output: IDXGIOutput = unsafe {
            adapter.EnumOutputs(monitor_index).map_err(|e| {
                CastError::SourceLost(format!("EnumOutputs({monitor_index}) failed: {e}"))
            })?
        };
        let output1: IDXGIOutput1 = output
            .cast()
            .map_err(|e| CastError::Other(format!("Cast to IDXGIOutput1 failed: {e}")))?;
        let duplication = unsafe {
            output1
                .DuplicateOutput(&device)
                .map_err(|e| CastError::Other(format!("DuplicateOutput failed: {e}")))?
        };

        let dup_desc = unsafe { duplication.GetDesc() };
        let width = dup_desc.ModeDesc.Width;
        let height = dup_desc.ModeDesc.Height;

        let staging_desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };
        let mut staging_texture = None;
        unsafe {
            device
                .CreateTexture2D(&staging_desc, None, Some(&mut staging_texture))
                .map_err(|e| CastError::Other(format!("CreateTexture2D (staging) failed: {e}")))?;
        }
        let staging_texture =
            staging_texture.ok_or_else(|| CastError::Other("staging texture is None".into()))?;

        Ok(Self {
            width,
            height,
            context,
            duplication,
            staging_texture,
            _device: device,
        })
    }

    /// Acquire the next composed frame. `Ok(None)` on timeout or when only
    /// the pointer moved.
    fn acquire(&mut self, timeout_ms: u32) -> Result<Option<RawFrame>, AcquireError> {
        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource = None;

        match unsafe {
            self.duplication
                .AcquireNextFrame(timeout_ms, &mut frame_info, &mut resource)
        } {
            Ok(()) => {}
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(None),
            Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST => return Err(AcquireError::AccessLost),
            Err(e) => return Err(AcquireError::Fatal(format!("AcquireNextFrame failed: {e}"))),
        }

        if frame_info.LastPresentTime == 0 {
            let _ = unsafe { self.duplication.ReleaseFrame() };
            return Ok(None);
        }

        let Some(resource) = resource else {
            let _ = unsafe { self.duplication.ReleaseFrame() };
            return Ok(None);
        };
        let texture: ID3D11Texture2D = match resource.cast() {
            Ok(t) => t,
            Err(e) => {
                let _ = unsafe { self.duplication.ReleaseFrame() };
                return Err(AcquireError::Fatal(format!(
                    "Cast to ID3D11Texture2D failed: {e}"
                )));
            }
        };

        unsafe { self.context.CopyResource(&self.staging_texture, &texture) };
        // Release the DXGI frame as early as possible.
        let _ = unsafe { self.duplication.ReleaseFrame() };

        self.read_staging(Some(frame_info.LastPresentTime))
            .map(Some)
            .map_err(|e| AcquireError::Fatal(e.to_string()))
    }

    /// Map the staging texture and copy it out. `present_qpc` is the
    /// compositor timestamp; `None` stamps the frame with the current QPC.
    fn read_staging(&self, present_qpc: Option<i64>) -> Result<RawFrame, CastError> {
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.context
                .Map(&self.staging_texture, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| CastError::Other(format!("Map failed: {e}")))?;
        }

        let stride = mapped.RowPitch;
        let total_bytes = stride as usize * self.height as usize;
        let src = unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, total_bytes) };
        let data = src.to_vec();
        unsafe { self.context.Unmap(&self.staging_texture, 0) };

        let ticks = match present_qpc {
            Some(t) => t,
            None => super::win32::qpc_now(),
        };
        Ok(RawFrame {
            width: self.width,
            height: self.height,
            stride,
            format: PixelFormat::Bgra8,
            data,
            timestamp: qpc_to_duration(ticks),
        })
    }
}

fn create_device() -> Result<(ID3D11Device, ID3D11DeviceContext), CastError> {
    let mut device = None;
    let mut context = None;
    unsafe {
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
        .map_err(|e| CastError::Other(format!("D3D11CreateDevice failed: {e}")))?;
    }
    let device = device.ok_or_else(|| CastError::Other("D3D11 device is None".into()))?;
    let context = context.ok_or_else(|| CastError::Other("D3D11 context is None".into()))?;
    Ok((device, context))
}

fn adapter_of(device: &ID3D11Device) -> Result<IDXGIAdapter, CastError> {
    let dxgi_device: IDXGIDevice = device
        .cast()
        .map_err(|e| CastError::Other(format!("Cast to IDXGIDevice failed: {e}")))?;
    unsafe {
        dxgi_device
            .GetAdapter()
            .map_err(|e| CastError::Other(format!("GetAdapter failed: {e}")))
    }
}
