//! # castline-core
//!
//! Low-latency desktop streaming pipeline: capture a monitor or window,
//! encode it to H.264 and send it as RFC 6184 RTP over UDP to a media
//! server.
//!
//! This crate contains:
//! - **Capture**: `CaptureBackend` with DXGI duplication and GDI window capture on
//!   Windows, plus a `SyntheticBackend` for tests and headless hosts
//! - **Exchange**: `FrameExchange`, a latest-frame-wins slot between capture and encode
//! - **Encode**: I420 conversion and the OpenH264 encoder stage
//! - **RTP**: header codec, `Packetizer` (Single NAL / FU-A), `Depacketizer`, UDP sender
//! - **Session**: `CaptureService`, the `SessionState` machine and `SessionEvent`s
//! - **Metrics**: lock-free counters, rate meters and resource accounting
//! - **Error**: `CastError`, a `thiserror`-based error hierarchy

pub mod capture;
pub mod config;
pub mod encode;
pub mod error;
pub mod exchange;
pub mod frame;
pub mod metrics;
pub mod rtp;
pub mod session;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{
    CaptureBackend, CaptureHandle, CaptureSource, FrameSink, SourceKind, SourceList,
    SyntheticBackend, SyntheticConfig, platform_backend,
};
pub use config::{SessionConfig, SessionParams};
pub use encode::{
    AccessUnit, EncodedFrame, EncoderFactory, EncoderSettings, OpenH264Factory, VideoEncoder,
};
pub use error::CastError;
pub use exchange::FrameExchange;
pub use frame::{PixelFormat, PlanarFrame, RawFrame};
pub use metrics::{MetricsSnapshot, ResourceKind};
pub use rtp::{Depacketizer, Packetizer, RtpHeader, RtpPacket};
pub use session::{
    CaptureService, SessionEvent, SessionHandle, SessionState, StateSnapshot,
};
