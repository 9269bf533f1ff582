//! RTP transport for H.264 (RFC 3550 / RFC 6184).
//!
//! | Module           | Role                                   |
//! |------------------|----------------------------------------|
//! | [`packet`]       | 12-byte fixed header codec             |
//! | [`packetizer`]   | NAL units → Single NAL / FU-A packets  |
//! | [`depacketizer`] | packets → NAL units (verification)     |
//! | [`sender`]       | UDP socket and send stage              |

pub mod depacketizer;
pub mod packet;
pub mod packetizer;
pub mod sender;

pub use depacketizer::Depacketizer;
pub use packet::{RtpHeader, RtpPacket};
pub use packetizer::{split_annex_b, FuFlags, Packetizer, CLOCK_RATE};
pub use sender::RtpSocket;
