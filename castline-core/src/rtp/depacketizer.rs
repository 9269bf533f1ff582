//! H.264 RTP depacketizer.
//!
//! Reassembles NAL units from Single NAL Unit, STAP-A and FU-A payloads.
//! The pipeline never receives RTP; this is the receiving half used to
//! verify what the packetizer put on the wire.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::CastError;
use crate::rtp::packet::RtpPacket;
use crate::rtp::packetizer::{FuFlags, NAL_TYPE_FU_A, NAL_TYPE_STAP_A};

/// Reassembly state for one RTP stream.
#[derive(Debug, Default)]
pub struct Depacketizer {
    fragment: Option<BytesMut>,
    last_sequence: Option<u16>,
}

impl Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet; returns the NAL units it completed.
    ///
    /// A sequence gap inside a fragmented NAL unit discards the partial
    /// unit and reports an error.
    pub fn push(&mut self, packet: &RtpPacket) -> Result<Vec<Bytes>, CastError> {
        let sequence = packet.header.sequence;
        let contiguous = self
            .last_sequence
            .is_none_or(|last| last.wrapping_add(1) == sequence);
        self.last_sequence = Some(sequence);

        if !contiguous && self.fragment.take().is_some() {
            return Err(CastError::Packetization("sequence gap inside FU-A"));
        }

        let payload = &packet.payload;
        if payload.is_empty() {
            return Err(CastError::Packetization("empty RTP payload"));
        }

        match payload[0] & 0x1F {
            1..=23 => {
                if self.fragment.take().is_some() {
                    return Err(CastError::Packetization("FU-A interrupted by single NAL"));
                }
                Ok(vec![payload.clone()])
            }
            NAL_TYPE_STAP_A => {
                if self.fragment.take().is_some() {
                    return Err(CastError::Packetization("FU-A interrupted by STAP-A"));
                }
                unpack_stap_a(payload.slice(1..))
            }
            NAL_TYPE_FU_A => self.push_fragment(payload),
            _ => Err(CastError::Packetization("unsupported NAL unit type")),
        }
    }

    fn push_fragment(&mut self, payload: &Bytes) -> Result<Vec<Bytes>, CastError> {
        if payload.len() < 3 {
            return Err(CastError::Packetization("FU-A payload too short"));
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let flags = FuFlags::from_bits_truncate(fu_header);
        let piece = &payload[2..];

        if flags.contains(FuFlags::START) {
            if self.fragment.is_some() {
                self.fragment = None;
                return Err(CastError::Packetization("FU-A start before previous end"));
            }
            let mut nal = BytesMut::with_capacity(piece.len() * 4 + 1);
            nal.extend_from_slice(&[(indicator & 0xE0) | (fu_header & 0x1F)]);
            nal.extend_from_slice(piece);
            self.fragment = Some(nal);
        } else {
            let Some(nal) = self.fragment.as_mut() else {
                return Err(CastError::Packetization("FU-A continuation without start"));
            };
            nal.extend_from_slice(piece);
        }

        if flags.contains(FuFlags::END) {
            match self.fragment.take() {
                Some(nal) => Ok(vec![nal.freeze()]),
                None => Err(CastError::Packetization("FU-A end without start")),
            }
        } else {
            Ok(Vec::new())
        }
    }

    /// Whether a fragmented NAL unit is partially assembled.
    pub fn in_fragment(&self) -> bool {
        self.fragment.is_some()
    }
}

/// Split a STAP-A body into its length-prefixed NAL units.
fn unpack_stap_a(mut body: Bytes) -> Result<Vec<Bytes>, CastError> {
    let mut nals = Vec::new();
    while body.has_remaining() {
        if body.remaining() < 2 {
            return Err(CastError::Packetization("truncated STAP-A size"));
        }
        let len = body.get_u16() as usize;
        if len == 0 || body.remaining() < len {
            return Err(CastError::Packetization("truncated STAP-A unit"));
        }
        nals.push(body.split_to(len));
    }
    Ok(nals)
}

// ── Tests ────────────────────────────────────────────────────────
