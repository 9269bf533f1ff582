//! Packed 32-bit RGB to I420 conversion.
//!
//! BT.601 limited range with integer coefficients:
//!
//! ```text
//! Y = ((  66 R + 129 G +  25 B + 128) >> 8) +  16
//! U = (( -38 R -  74 G + 112 B + 128) >> 8) + 128
//! V = (( 112 R -  94 G -  18 B + 128) >> 8) + 128
//! ```
//!
//! Chroma is computed from the average of each 2×2 block. Luma rows go
//! through an SSE2 path eight pixels at a time on x86_64; the scalar path
//! handles the tail and other targets and produces identical bytes.

use crate::error::CastError;
use crate::frame::{PixelFormat, PlanarFrame, RawFrame};

/// Byte offsets of R, G and B within one pixel.
#[derive(Debug, Clone, Copy)]
struct Channels {
    r: usize,
    g: usize,
    b: usize,
}

impl Channels {
    fn of(format: PixelFormat) -> Self {
        match format {
            PixelFormat::Bgra8 => Self { r: 2, g: 1, b: 0 },
            PixelFormat::Rgba8 => Self { r: 0, g: 1, b: 2 },
        }
    }

    /// Luma weights in byte order, for the SIMD path.
    #[cfg(target_arch = "x86_64")]
    fn luma_weights(self) -> [i16; 3] {
        let mut w = [0i16; 3];
        w[self.r] = 66;
        w[self.g] = 129;
        w[self.b] = 25;
        w
    }
}

/// Convert `frame` into `out`, resizing `out` if the resolution changed.
///
/// Odd dimensions are cropped to even; the last row or column is dropped.
pub fn to_i420(frame: &RawFrame, out: &mut PlanarFrame) -> Result<(), CastError> {
    if frame.width < 2 || frame.height < 2 {
        return Err(CastError::UnsupportedFrame(format!(
            "{}x{} is below the 2x2 minimum",
            frame.width, frame.height
        )));
    }
    if !frame.is_well_formed() {
        return Err(CastError::UnsupportedFrame(format!(
            "{} bytes cannot hold {}x{} at stride {}",
            frame.data.len(),
            frame.width,
            frame.height,
            frame.stride
        )));
    }

    out.resize(frame.width, frame.height);
    let width = out.width() as usize;
    let height = out.height() as usize;
    let (y_stride, u_stride, v_stride) = out.strides();
    let channels = Channels::of(frame.format);
    let (y_plane, u_plane, v_plane) = out.planes_mut();

    for row in 0..height {
        let src = &frame.row(row as u32)[..width * 4];
        let dst = &mut y_plane[row * y_stride..row * y_stride + width];
        luma_row(src, dst, channels);
    }

    for row in 0..height / 2 {
        let top = frame.row((row * 2) as u32);
        let bottom = frame.row((row * 2 + 1) as u32);
        let u_row = &mut u_plane[row * u_stride..row * u_stride + width / 2];
        let v_row = &mut v_plane[row * v_stride..row * v_stride + width / 2];
        chroma_row(top, bottom, u_row, v_row, channels);
    }
    Ok(())
}

// ── Luma ─────────────────────────────────────────────────────────

fn luma_row(src: &[u8], dst: &mut [u8], channels: Channels) {
    #[cfg(target_arch = "x86_64")]
    {
        let simd_pixels = dst.len() & !7;
        // SAFETY: SSE2 is part of the x86_64 baseline; both slices cover
        // `simd_pixels` pixels.
        unsafe {
            luma_row_sse2(
                &src[..simd_pixels * 4],
                &mut dst[..simd_pixels],
                channels.luma_weights(),
            )
        };
        luma_row_scalar(&src[simd_pixels * 4..], &mut dst[simd_pixels..], channels);
    }
    #[cfg(not(target_arch = "x86_64"))]
    luma_row_scalar(src, dst, channels);
}

fn luma_row_scalar(src: &[u8], dst: &mut [u8], channels: Channels) {
    for (px, y) in src.chunks_exact(4).zip(dst.iter_mut()) {
        let (r, g, b) = (
            px[channels.r] as i32,
            px[channels.g] as i32,
            px[channels.b] as i32,
        );
        *y = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8;
    }
}

/// Eight pixels per iteration: widen to i16, multiply-add against the
/// weights, fold the pairwise sums, then narrow back to bytes.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn luma_row_sse2(src: &[u8], dst: &mut [u8], weights: [i16; 3]) {
    use std::arch::x86_64::*;

    debug_assert_eq!(src.len(), dst.len() * 4);
    debug_assert_eq!(dst.len() % 8, 0);

    unsafe {
        let zero = _mm_setzero_si128();
        let coeffs = _mm_setr_epi16(
            weights[0], weights[1], weights[2], 0, weights[0], weights[1], weights[2], 0,
        );
        let round = _mm_set1_epi32(128);
        let offset = _mm_set1_epi32(16);

        // Luma of the four pixels in `px` as four i32 lanes.
        let four = |px: __m128i| -> __m128i {
            let lo = _mm_madd_epi16(_mm_unpacklo_epi8(px, zero), coeffs);
            let hi = _mm_madd_epi16(_mm_unpackhi_epi8(px, zero), coeffs);
            // [a0, a1, b0, b1] -> [a, a, b, b]
            let lo = _mm_add_epi32(lo, _mm_shuffle_epi32(lo, 0b1011_0001));
            let hi = _mm_add_epi32(hi, _mm_shuffle_epi32(hi, 0b1011_0001));
            // Gather lanes 0 and 2 of each half.
            let lo = _mm_shuffle_epi32(lo, 0b0000_1000);
            let hi = _mm_shuffle_epi32(hi, 0b0000_1000);
            let sum = _mm_unpacklo_epi64(lo, hi);
            _mm_add_epi32(_mm_srli_epi32(_mm_add_epi32(sum, round), 8), offset)
        };

        for (chunk, out) in src.chunks_exact(32).zip(dst.chunks_exact_mut(8)) {
            let a = _mm_loadu_si128(chunk.as_ptr() as *const __m128i);
            let b = _mm_loadu_si128(chunk.as_ptr().add(16) as *const __m128i);
            let words = _mm_packs_epi32(four(a), four(b));
            let bytes = _mm_packus_epi16(words, zero);
            _mm_storel_epi64(out.as_mut_ptr() as *mut __m128i, bytes);
        }
    }
}

// ── Chroma ───────────────────────────────────────────────────────

fn chroma_row(top: &[u8], bottom: &[u8], u_row: &mut [u8], v_row: &mut [u8], channels: Channels) {
    for (i, (u, v)) in u_row.iter_mut().zip(v_row.iter_mut()).enumerate() {
        let at = i * 8;
        let sum = |c: usize| {
            top[at + c] as i32 + top[at + 4 + c] as i32 + bottom[at + c] as i32
                + bottom[at + 4 + c] as i32
        };
        let r = (sum(channels.r) + 2) >> 2;
        let g = (sum(channels.g) + 2) >> 2;
        let b = (sum(channels.b) + 2) >> 2;
        *u = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8;
        *v = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8;
    }
}

// ── Tests ────────────────────────────────────────────────────────
