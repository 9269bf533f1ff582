//! Configuration for the castline host.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use castline_core::config::{DEFAULT_BITRATE_KBPS, DEFAULT_FPS, DEFAULT_MTU, DEFAULT_PAYLOAD_TYPE};
use castline_core::SessionConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Where the stream goes.
    pub network: NetworkConfig,
    /// What is captured.
    pub capture: CaptureConfig,
    /// H.264 rate settings.
    pub encoder: EncoderConfig,
    /// RTP and pipeline tuning.
    pub rtp: RtpConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// SFU ingest address (`ip:port`) negotiated out of band.
    pub peer: String,
}

/// Capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Source id as printed by `castline-host list`.
    pub source: String,
    /// Frame-rate cap.
    pub fps: u32,
}

/// Encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Target bitrate in kbit/s.
    pub bitrate_kbps: u32,
    /// Periodic IDR interval in milliseconds; 0 disables.
    pub idr_interval_ms: u64,
}

/// RTP and pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpConfig {
    /// Maximum RTP payload size in bytes.
    pub mtu: usize,
    /// Dynamic payload type agreed with the SFU.
    pub payload_type: u8,
    /// SSRC agreed with the SFU.
    pub ssrc: u32,
    /// Encoder → sender queue capacity in access units.
    pub channel_capacity: usize,
    /// Encoder wait on a full queue before counting backlog.
    pub backpressure_timeout_ms: u64,
    /// Queue depth that marks the session Degraded.
    pub degraded_queue_depth: usize,
    /// Interval between telemetry events.
    pub telemetry_interval_ms: u64,
    /// Interval between health checks.
    pub health_interval_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Print telemetry events as JSON lines on stdout.
    pub telemetry_json: bool,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            peer: "127.0.0.1:5004".into(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: "monitor:0".into(),
            fps: DEFAULT_FPS,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            idr_interval_ms: 0,
        }
    }
}

impl Default for RtpConfig {
    fn default() -> Self {
        let core = SessionConfig::default();
        Self {
            mtu: DEFAULT_MTU,
            payload_type: DEFAULT_PAYLOAD_TYPE,
            ssrc: core.ssrc,
            channel_capacity: core.channel_capacity,
            backpressure_timeout_ms: core.backpressure_timeout.as_millis() as u64,
            degraded_queue_depth: core.degraded_queue_depth,
            telemetry_interval_ms: core.telemetry_interval.as_millis() as u64,
            health_interval_ms: core.health_interval.as_millis() as u64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            telemetry_json: false,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Convert the RTP and encoder sections into a core `SessionConfig`.
    ///
    /// Out-of-range values are clamped by `SessionConfig::sanitized`.
    pub fn to_session_config(&self) -> SessionConfig {
        let rtp = &self.rtp;
        SessionConfig {
            mtu: rtp.mtu.clamp(200, 1452),
            payload_type: rtp.payload_type.clamp(96, 127),
            ssrc: rtp.ssrc,
            initial_sequence: None,
            initial_timestamp: None,
            channel_capacity: rtp.channel_capacity.clamp(1, 64),
            backpressure_timeout: Duration::from_millis(rtp.backpressure_timeout_ms.max(1)),
            telemetry_interval: Duration::from_millis(rtp.telemetry_interval_ms.max(50)),
            health_interval: Duration::from_millis(rtp.health_interval_ms.max(10)),
            degraded_queue_depth: rtp.degraded_queue_depth,
            idr_interval: (self.encoder.idr_interval_ms > 0)
                .then(|| Duration::from_millis(self.encoder.idr_interval_ms)),
        }
        .sanitized()
    }
}

// ── Tests ────────────────────────────────────────────────────────
