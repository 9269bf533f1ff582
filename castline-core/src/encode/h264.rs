//! OpenH264 software encoder.
//!
//! OpenH264 emits Constrained Baseline with one slice per picture and no
//! B-frames, so every access unit can be sent as soon as it is encoded.
//! The picture size is taken from the first frame and the encoder
//! reinitialises itself when it changes.

use bytes::Bytes;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, FrameType, RateControlMode};
use openh264::formats::YUVSlices;
use openh264::OpenH264API;
use tracing::{debug, info};

use crate::encode::{EncodedFrame, EncoderFactory, EncoderSettings, VideoEncoder};
use crate::error::CastError;
use crate::frame::PlanarFrame;
use crate::rtp::split_annex_b;

/// Creates [`OpenH264Encoder`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenH264Factory;

impl EncoderFactory for OpenH264Factory {
    fn create(&self, settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>, CastError> {
        Ok(Box::new(OpenH264Encoder::new(settings)?))
    }
}

/// Real-time H.264 encoder backed by the bundled OpenH264 build.
pub struct OpenH264Encoder {
    encoder: Encoder,
}

impl OpenH264Encoder {
    pub fn new(settings: &EncoderSettings) -> Result<Self, CastError> {
        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(settings.bitrate_bps))
            .max_frame_rate(FrameRate::from_hz(settings.max_fps as f32))
            .rate_control_mode(RateControlMode::Bitrate);

        let api = OpenH264API::from_source();
        let encoder = Encoder::with_api_config(api, config)
            .map_err(|e| CastError::EncoderInit(e.to_string()))?;

        info!(
            bitrate_bps = settings.bitrate_bps,
            max_fps = settings.max_fps,
            "H.264 encoder created"
        );
        Ok(Self { encoder })
    }
}

impl VideoEncoder for OpenH264Encoder {
    fn encode(
        &mut self,
        picture: &PlanarFrame,
        force_keyframe: bool,
    ) -> Result<Option<EncodedFrame>, CastError> {
        if force_keyframe {
            self.encoder.force_intra_frame();
        }

        let (y, u, v) = picture.planes();
        let dims = (picture.width() as usize, picture.height() as usize);
        let yuv = YUVSlices::new((y, u, v), dims, picture.strides());

        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| CastError::EncodeFrame(e.to_string()))?;

        let frame_type = bitstream.frame_type();
        if matches!(frame_type, FrameType::Skip | FrameType::Invalid) {
            debug!("encoder skipped picture");
            return Ok(None);
        }

        let annex_b = bitstream.to_vec();
        let nals: Vec<Bytes> = split_annex_b(&annex_b)
            .into_iter()
            .map(Bytes::copy_from_slice)
            .collect();
        if nals.is_empty() {
            return Ok(None);
        }

        Ok(Some(EncodedFrame {
            nals,
            keyframe: matches!(frame_type, FrameType::IDR),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::convert::to_i420;
    use crate::frame::{PixelFormat, RawFrame};
    use std::time::Duration;

    fn picture(shade: u8) -> PlanarFrame {
        let frame = RawFrame {
            width: 160,
            height: 120,
            stride: 160 * 4,
            format: PixelFormat::Bgra8,
            data: [shade, 100, 50, 255].repeat(160 * 120),
            timestamp: Duration::ZERO,
        };
        let mut out = PlanarFrame::default();
        to_i420(&frame, &mut out).unwrap();
        out
    }

    fn settings() -> EncoderSettings {
        EncoderSettings {
            bitrate_bps: 500_000,
            max_fps: 30,
        }
    }

    /// NAL unit type of the first byte.
    fn nal_type(nal: &[u8]) -> u8 {
        nal[0] & 0x1F
    }

    #[test]
    fn first_picture_is_idr_with_parameter_sets() {
        let mut encoder = OpenH264Encoder::new(&settings()).unwrap();
        let out = encoder.encode(&picture(10), true).unwrap().unwrap();
        assert!(out.keyframe);

        let types: Vec<u8> = out.nals.iter().map(|n| nal_type(n)).collect();
        assert!(types.contains(&7), "SPS present: {types:?}");
        assert!(types.contains(&8), "PPS present: {types:?}");
        assert!(types.contains(&5), "IDR slice present: {types:?}");
    }

    #[test]
    fn forced_keyframe_after_p_frames() {
        let mut encoder = OpenH264Encoder::new(&settings()).unwrap();
        for i in 0..5u8 {
            encoder.encode(&picture(i * 40), i == 0).unwrap();
        }
        let out = encoder.encode(&picture(250), true).unwrap().unwrap();
        assert!(out.keyframe);
    }

    #[test]
    fn nal_units_have_no_start_codes() {
        let mut encoder = OpenH264Encoder::new(&settings()).unwrap();
        let out = encoder.encode(&picture(0), true).unwrap().unwrap();
        for nal in &out.nals {
            assert!(!nal.starts_with(&[0, 0, 1]));
            assert_eq!(nal[0] & 0x80, 0, "forbidden bit clear");
        }
    }
}
