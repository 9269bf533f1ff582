//! Session configuration.
//!
//! [`SessionConfig`] holds the tunables that stay fixed for the life of
//! a [`CaptureService`](crate::CaptureService); [`SessionParams`] carries
//! the per-call values passed to `start_capture`.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default RTP payload size limit in bytes.
pub const DEFAULT_MTU: usize = 1200;
/// Default dynamic payload type for H.264.
pub const DEFAULT_PAYLOAD_TYPE: u8 = 102;
/// Default target bitrate (4 Mbps at 1080p60).
pub const DEFAULT_BITRATE_KBPS: u32 = 4000;
/// Default frame rate cap.
pub const DEFAULT_FPS: u32 = 60;

/// Service-wide pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum RTP payload size in bytes.
    pub mtu: usize,
    /// RTP payload type agreed with the SFU.
    pub payload_type: u8,
    /// RTP SSRC agreed with the SFU.
    pub ssrc: u32,
    /// First RTP sequence number; random when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_sequence: Option<u16>,
    /// RTP timestamp of the first access unit; random when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_timestamp: Option<u32>,
    /// Capacity of the encoder → sender channel, in access units.
    pub channel_capacity: usize,
    /// How long the encoder waits on a full channel before flagging backlog.
    #[serde(with = "millis")]
    pub backpressure_timeout: Duration,
    /// Interval between telemetry events.
    #[serde(with = "millis")]
    pub telemetry_interval: Duration,
    /// Interval between health checks (rates, Degraded transitions).
    #[serde(with = "millis")]
    pub health_interval: Duration,
    /// Queue depth at or above which the session is Degraded.
    pub degraded_queue_depth: usize,
    /// Periodic IDR interval; `None` means keyframes only on request.
    #[serde(with = "opt_millis")]
    pub idr_interval: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            payload_type: DEFAULT_PAYLOAD_TYPE,
            ssrc: 0x1234_5678,
            initial_sequence: None,
            initial_timestamp: None,
            channel_capacity: 4,
            backpressure_timeout: Duration::from_millis(50),
            telemetry_interval: Duration::from_secs(2),
            health_interval: Duration::from_millis(500),
            degraded_queue_depth: 4,
            idr_interval: None,
        }
    }
}

impl SessionConfig {
    /// Clamp values that would break the pipeline.
    pub fn sanitized(mut self) -> Self {
        // FU-A needs room for its two header bytes plus one payload byte.
        self.mtu = self.mtu.clamp(3, 65_000);
        self.payload_type &= 0x7F;
        self.channel_capacity = self.channel_capacity.max(1);
        self.degraded_queue_depth = self.degraded_queue_depth.clamp(1, self.channel_capacity);
        if self.health_interval.is_zero() {
            self.health_interval = Duration::from_millis(500);
        }
        if self.telemetry_interval.is_zero() {
            self.telemetry_interval = Duration::from_secs(2);
        }
        self
    }
}

/// Values supplied by the application for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub peer: SocketAddr,
    pub bitrate_kbps: u32,
    pub fps_cap: u32,
}

impl SessionParams {
    pub fn new(peer: SocketAddr, bitrate_kbps: u32, fps_cap: u32) -> Self {
        Self {
            peer,
            bitrate_kbps: if bitrate_kbps == 0 {
                DEFAULT_BITRATE_KBPS
            } else {
                bitrate_kbps
            },
            fps_cap: fps_cap.clamp(1, 240),
        }
    }

    pub fn bitrate_bps(&self) -> u32 {
        self.bitrate_kbps.saturating_mul(1000)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        // Zero stands for "off" so the value survives formats without null.
        s.serialize_u64(d.map_or(0, |d| d.as_millis() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok((ms > 0).then(|| Duration::from_millis(ms)))
    }
}
