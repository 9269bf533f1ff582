//! RTP fixed header (RFC 3550 §5.1).
//!
//! ## Wire format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! |                           timestamp                           |
//! |                             SSRC                              |
//! ```
//!
//! Packets produced here never carry padding, extensions or CSRCs.
//! Parsing accepts them and skips over them.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CastError;

/// RTP protocol version.
pub const RTP_VERSION: u8 = 2;

// ── RtpHeader ────────────────────────────────────────────────────

/// The fields of the fixed header this pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 12;

    /// Serialize to bytes (network byte order).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = RTP_VERSION << 6;
        buf[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf
    }

    /// Deserialize from bytes, returning the header and the payload offset.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), CastError> {
        if data.len() < Self::SIZE {
            return Err(CastError::Packetization("RTP packet shorter than header"));
        }
        if data[0] >> 6 != RTP_VERSION {
            return Err(CastError::Packetization("RTP version is not 2"));
        }
        let csrc_count = (data[0] & 0x0F) as usize;
        let mut offset = Self::SIZE + csrc_count * 4;

        if data[0] & 0x10 != 0 {
            // Extension: 16-bit profile, 16-bit length in 32-bit words.
            if data.len() < offset + 4 {
                return Err(CastError::Packetization("truncated RTP extension"));
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }
        if data.len() < offset {
            return Err(CastError::Packetization("truncated RTP header"));
        }

        let header = Self {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        };
        Ok((header, offset))
    }
}

// ── RtpPacket ────────────────────────────────────────────────────

/// One RTP packet: header plus H.264 payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Bytes this packet occupies in a datagram.
    pub fn wire_len(&self) -> usize {
        RtpHeader::SIZE + self.payload.len()
    }

    /// Serialize header and payload into one buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a received datagram. Trailing padding is stripped.
    pub fn parse(data: &[u8]) -> Result<Self, CastError> {
        let (header, offset) = RtpHeader::decode(data)?;
        let mut end = data.len();
        if data[0] & 0x20 != 0 {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(CastError::Packetization("invalid RTP padding"));
            }
            end -= pad;
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&data[offset..end]),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
