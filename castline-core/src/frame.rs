//! Frame types shared between pipeline stages.
//!
//! A [`RawFrame`] is produced by a capture backend and consumed exactly
//! once by the encode stage. A [`PlanarFrame`] is the encode thread's
//! private I420 scratch buffer, reused across cycles.

use std::time::Duration;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha (DXGI and GDI default).
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
        }
    }
}

// ── RawFrame ─────────────────────────────────────────────────────

/// A raw, uncompressed frame as delivered by the platform.
///
/// The `data` buffer holds `height` rows of `stride` bytes each.
/// `stride` may be larger than `width * bytes_per_pixel` when the
/// platform pads rows.
#[derive(Debug)]
pub struct RawFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in **bytes**.
    pub stride: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Raw pixel data, `stride * height` bytes.
    pub data: Vec<u8>,
    /// Platform delivery time on the backend's monotonic clock.
    pub timestamp: Duration,
}

impl RawFrame {
    /// Total byte size the raw bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Returns a row slice (including possible padding bytes).
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        let end = start + self.stride as usize;
        &self.data[start..end]
    }

    /// Whether the buffer is large enough for the declared geometry.
    pub fn is_well_formed(&self) -> bool {
        self.stride as usize >= self.width as usize * self.format.bytes_per_pixel()
            && self.data.len() >= self.byte_len()
    }
}

// ── PlanarFrame ──────────────────────────────────────────────────

/// I420 (YUV 4:2:0 planar) buffer with explicit strides.
///
/// Dimensions are always even. Planes are allocated once and only
/// reallocated when the source resolution changes.
#[derive(Debug, Default)]
pub struct PlanarFrame {
    width: u32,
    height: u32,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
    y_stride: usize,
    uv_stride: usize,
}

impl PlanarFrame {
    /// Allocate planes for a `width × height` picture (rounded down to even).
    pub fn new(width: u32, height: u32) -> Self {
        let mut frame = Self::default();
        frame.resize(width, height);
        frame
    }

    /// Reallocate the planes if the (even-cropped) size changed.
    ///
    /// Returns `true` when a reallocation happened.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        let width = width & !1;
        let height = height & !1;
        if width == self.width && height == self.height && !self.y.is_empty() {
            return false;
        }
        let y_stride = width as usize;
        let uv_stride = y_stride / 2;
        self.width = width;
        self.height = height;
        self.y_stride = y_stride;
        self.uv_stride = uv_stride;
        self.y = vec![0; y_stride * height as usize];
        self.u = vec![128; uv_stride * height as usize / 2];
        self.v = vec![128; uv_stride * height as usize / 2];
        true
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(y, u, v)` strides in bytes.
    pub fn strides(&self) -> (usize, usize, usize) {
        (self.y_stride, self.uv_stride, self.uv_stride)
    }

    /// Read-only view of the three planes.
    pub fn planes(&self) -> (&[u8], &[u8], &[u8]) {
        (&self.y, &self.u, &self.v)
    }

    /// Mutable view of the three planes for the converter.
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        (&mut self.y, &mut self.u, &mut self.v)
    }

    /// Base address of the luma plane; stable while the size is unchanged.
    pub fn luma_ptr(&self) -> *const u8 {
        self.y.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planar_sizes_are_even() {
        let frame = PlanarFrame::new(641, 481);
        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 480);
        let (y, u, v) = frame.planes();
        assert_eq!(y.len(), 640 * 480);
        assert_eq!(u.len(), 320 * 240);
        assert_eq!(v.len(), 320 * 240);
        assert_eq!(frame.strides(), (640, 320, 320));
    }

    #[test]
    fn resize_reuses_buffers_for_same_size() {
        let mut frame = PlanarFrame::new(64, 64);
        let before = frame.luma_ptr();
        assert!(!frame.resize(64, 64));
        assert!(!frame.resize(65, 65));
        assert_eq!(frame.luma_ptr(), before);
        assert!(frame.resize(128, 64));
    }

    #[test]
    fn raw_frame_geometry() {
        let frame = RawFrame {
            width: 4,
            height: 2,
            stride: 20,
            format: PixelFormat::Bgra8,
            data: vec![0; 40],
            timestamp: Duration::ZERO,
        };
        assert!(frame.is_well_formed());
        assert_eq!(frame.row(1).len(), 20);

        let short = RawFrame {
            data: vec![0; 39],
            ..frame
        };
        assert!(!short.is_well_formed());
    }
}
