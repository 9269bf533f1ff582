//! # castline-host
//!
//! Thin host process around `castline-core`: loads a TOML config,
//! lists capture sources and streams one source as H.264 over RTP/UDP
//! to a pre-negotiated media server until Ctrl-C.
//!
//! ## Modes
//!
//! - **list**: print capturable monitors and windows.
//! - **run**: stream a source; state changes and telemetry are logged.
//! - **--synthetic**: use a generated test pattern instead of the desktop.

pub mod config;
pub mod service;
