//! H.264 RTP packetizer (RFC 6184, packetization-mode 1).
//!
//! Each NAL unit of an access unit becomes either one Single NAL Unit
//! packet or, when it exceeds the MTU, a run of FU-A fragments:
//!
//! ```text
//! FU indicator  |F|NRI| 28 |     copied from the NAL header, type = 28
//! FU header     |S|E|R|type|     S on the first fragment, E on the last
//! fragment      NAL bytes after the header, ≤ MTU − 2 per packet
//! ```
//!
//! All packets of an access unit share one RTP timestamp and the marker
//! bit is set only on the very last packet.

use std::time::Duration;

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::config::SessionConfig;
use crate::encode::AccessUnit;
use crate::error::CastError;
use crate::rtp::packet::{RtpHeader, RtpPacket};

/// RTP clock rate for video.
pub const CLOCK_RATE: u64 = 90_000;

/// NAL unit type of an FU-A fragment.
pub const NAL_TYPE_FU_A: u8 = 28;
/// NAL unit type of a STAP-A aggregate.
pub const NAL_TYPE_STAP_A: u8 = 24;

bitflags! {
    /// Start/end bits of the FU header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FuFlags: u8 {
        const START = 0x80;
        const END = 0x40;
    }
}

// ── Annex B ──────────────────────────────────────────────────────

/// Split an Annex B byte stream into NAL units without start codes.
///
/// Both 3- and 4-byte start codes are recognised; bytes before the first
/// start code and trailing zero bytes are discarded.
pub fn split_annex_b(stream: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0;

    while i + 3 <= stream.len() {
        if stream[i] == 0 && stream[i + 1] == 0 && stream[i + 2] == 1 {
            if let Some(s) = start {
                push_trimmed(&mut nals, &stream[s..i]);
            }
            i += 3;
            start = Some(i);
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        push_trimmed(&mut nals, &stream[s..]);
    }
    nals
}

fn push_trimmed<'a>(nals: &mut Vec<&'a [u8]>, nal: &'a [u8]) {
    let end = nal.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    if end > 0 {
        nals.push(&nal[..end]);
    }
}

// ── Packetizer ───────────────────────────────────────────────────

/// Stateful packetizer for one RTP stream.
#[derive(Debug, Clone)]
pub struct Packetizer {
    mtu: usize,
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp_base: u32,
}

impl Packetizer {
    /// `mtu` is the maximum RTP payload size and must leave room for the
    /// two FU-A header bytes plus at least one fragment byte.
    pub fn new(
        mtu: usize,
        payload_type: u8,
        ssrc: u32,
        initial_sequence: u16,
        timestamp_base: u32,
    ) -> Self {
        Self {
            mtu: mtu.max(3),
            payload_type: payload_type & 0x7F,
            ssrc,
            sequence: initial_sequence,
            timestamp_base,
        }
    }

    /// Build from session config, drawing unset initial values at random.
    pub fn from_config(config: &SessionConfig) -> Self {
        let mut rng = rand::thread_rng();
        Self::new(
            config.mtu,
            config.payload_type,
            config.ssrc,
            config.initial_sequence.unwrap_or_else(|| rng.r#gen()),
            config.initial_timestamp.unwrap_or_else(|| rng.r#gen()),
        )
    }

    /// Sequence number the next packet will carry.
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    /// RTP timestamp for a presentation time, rounded to the nearest tick.
    pub fn rtp_timestamp(&self, pts: Duration) -> u32 {
        let nanos = pts.as_nanos();
        let ticks = (nanos * CLOCK_RATE as u128 + 500_000_000) / 1_000_000_000;
        self.timestamp_base.wrapping_add(ticks as u32)
    }

    /// Packetize one access unit.
    pub fn packetize(&mut self, unit: &AccessUnit) -> Result<Vec<RtpPacket>, CastError> {
        self.packetize_nals(&unit.nals, unit.pts)
    }

    /// Packetize the NAL units of one access unit presented at `pts`.
    pub fn packetize_nals(
        &mut self,
        nals: &[Bytes],
        pts: Duration,
    ) -> Result<Vec<RtpPacket>, CastError> {
        let nals: Vec<&Bytes> = nals.iter().filter(|n| !n.is_empty()).collect();
        if nals.is_empty() {
            return Err(CastError::Packetization("access unit has no NAL units"));
        }

        let timestamp = self.rtp_timestamp(pts);
        let mut packets = Vec::with_capacity(nals.len());
        for nal in nals {
            if nal.len() <= self.mtu {
                packets.push(self.packet(timestamp, nal.clone()));
            } else {
                self.fragment(nal, timestamp, &mut packets);
            }
        }

        if let Some(last) = packets.last_mut() {
            last.header.marker = true;
        }
        Ok(packets)
    }

    /// Split one oversized NAL unit into FU-A packets.
    fn fragment(&mut self, nal: &Bytes, timestamp: u32, out: &mut Vec<RtpPacket>) {
        let header = nal[0];
        let indicator = (header & 0xE0) | NAL_TYPE_FU_A;
        let nal_type = header & 0x1F;
        let body = nal.slice(1..);
        let chunk = self.mtu - 2;

        let count = body.len().div_ceil(chunk);
        for (i, piece) in body.chunks(chunk).enumerate() {
            let mut flags = FuFlags::empty();
            flags.set(FuFlags::START, i == 0);
            flags.set(FuFlags::END, i + 1 == count);

            let mut payload = BytesMut::with_capacity(piece.len() + 2);
            payload.put_u8(indicator);
            payload.put_u8(flags.bits() | nal_type);
            payload.put_slice(piece);
            let packet = self.packet(timestamp, payload.freeze());
            out.push(packet);
        }
    }

    fn packet(&mut self, timestamp: u32, payload: Bytes) -> RtpPacket {
        let header = RtpHeader {
            marker: false,
            payload_type: self.payload_type,
            sequence: self.sequence,
            timestamp,
            ssrc: self.ssrc,
        };
        self.sequence = self.sequence.wrapping_add(1);
        RtpPacket { header, payload }
    }
}

// ── Tests ────────────────────────────────────────────────────────
