//! UDP send stage.
//!
//! Blocks on the access-unit channel, packetizes each unit inline and
//! writes every packet once to a non-blocking socket. A failed write is
//! counted and the packet dropped; nothing is retried, since the SFU
//! recovers through keyframe requests.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::{debug, info, trace, warn};

use crate::encode::AccessUnit;
use crate::error::CastError;
use crate::metrics::{ResourceGauge, ResourceGuard, ResourceKind, SessionMetrics};
use crate::rtp::packetizer::Packetizer;

// ── RtpSocket ────────────────────────────────────────────────────

/// A UDP socket aimed at one peer, counted as a session resource.
pub struct RtpSocket {
    socket: UdpSocket,
    peer: SocketAddr,
    _guard: ResourceGuard,
}

impl RtpSocket {
    /// Bind an ephemeral port of the peer's address family.
    pub fn bind(peer: SocketAddr, gauge: &ResourceGauge) -> io::Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        info!(local = %socket.local_addr()?, %peer, "RTP socket bound");
        Ok(Self {
            socket,
            peer,
            _guard: gauge.acquire(ResourceKind::Socket),
        })
    }

    pub fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        self.socket.send_to(datagram, self.peer)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

// ── SendStage ────────────────────────────────────────────────────

/// Everything the sender thread needs for one session.
pub(crate) struct SendStage {
    pub input: Receiver<AccessUnit>,
    pub socket: RtpSocket,
    pub packetizer: Packetizer,
    pub metrics: Arc<SessionMetrics>,
}

impl SendStage {
    /// Run until the encode stage drops its end of the channel.
    pub(crate) fn run(mut self) {
        while let Ok(unit) = self.input.recv() {
            self.metrics
                .queue_depth
                .store(self.input.len(), Ordering::Relaxed);

            let packets = match self.packetizer.packetize(&unit) {
                Ok(p) => p,
                Err(e) => {
                    warn!("access unit dropped: {e}");
                    continue;
                }
            };
            trace!(
                packets = packets.len(),
                bytes = unit.payload_len(),
                keyframe = unit.keyframe,
                "sending access unit"
            );

            for packet in &packets {
                let datagram = packet.to_bytes();
                match self.socket.send(&datagram) {
                    Ok(n) => {
                        SessionMetrics::incr(&self.metrics.packets_sent);
                        self.metrics
                            .bytes_sent
                            .fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        SessionMetrics::incr(&self.metrics.send_errors);
                        let would_block = e.kind() == io::ErrorKind::WouldBlock;
                        let err = CastError::Send(e.to_string());
                        if would_block {
                            debug!(seq = packet.header.sequence, "{err}; socket buffer full");
                        } else {
                            warn!(seq = packet.header.sequence, "{err}");
                        }
                    }
                }
            }
            // The encoder may have sampled a stale length while this unit
            // was in flight.
            self.metrics
                .queue_depth
                .store(self.input.len(), Ordering::Relaxed);
        }
        debug!(peer = %self.socket.peer(), "send stage exited");
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::packet::RtpPacket;
    use bytes::Bytes;
    use crossbeam_channel::bounded;
    use std::thread;
    use std::time::Duration;

    fn unit(ms: u64) -> AccessUnit {
        AccessUnit {
            nals: vec![Bytes::from_static(&[0x65, 1, 2, 3])],
            keyframe: true,
            pts: Duration::from_millis(ms),
        }
    }

    #[test]
    fn sends_packets_until_channel_closes() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let peer = receiver.local_addr().unwrap();

        let gauge = ResourceGauge::new();
        let metrics = Arc::new(SessionMetrics::new());
        let (tx, rx) = bounded(4);
        let stage = SendStage {
            input: rx,
            socket: RtpSocket::bind(peer, &gauge).unwrap(),
            packetizer: Packetizer::new(1200, 102, 9, 500, 0),
            metrics: Arc::clone(&metrics),
        };
        assert_eq!(gauge.open_of(ResourceKind::Socket), 1);
        let handle = thread::spawn(move || stage.run());

        tx.send(unit(0)).unwrap();
        tx.send(unit(1000)).unwrap();
        drop(tx);
        handle.join().unwrap();

        let mut buf = [0u8; 1500];
        let mut got = Vec::new();
        for _ in 0..2 {
            let n = receiver.recv(&mut buf).unwrap();
            got.push(RtpPacket::parse(&buf[..n]).unwrap());
        }
        assert_eq!(got[0].header.sequence, 500);
        assert_eq!(got[1].header.sequence, 501);
        assert_eq!(
            got[1].header.timestamp.wrapping_sub(got[0].header.timestamp),
            90_000
        );
        assert!(got.iter().all(|p| p.header.marker && p.header.ssrc == 9));

        assert_eq!(metrics.packets_sent.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.bytes_sent.load(Ordering::Relaxed), 32);
        assert_eq!(gauge.open(), 0, "socket released on exit");
    }

    #[test]
    fn failed_writes_are_counted_and_dropped() {
        // Broadcast without SO_BROADCAST is refused by the OS.
        let peer: SocketAddr = "255.255.255.255:5004".parse().unwrap();
        let gauge = ResourceGauge::new();
        let metrics = Arc::new(SessionMetrics::new());
        let (tx, rx) = bounded(4);
        let stage = SendStage {
            input: rx,
            socket: RtpSocket::bind(peer, &gauge).unwrap(),
            packetizer: Packetizer::new(1200, 102, 9, 0, 0),
            metrics: Arc::clone(&metrics),
        };
        let handle = thread::spawn(move || stage.run());

        tx.send(unit(0)).unwrap();
        tx.send(unit(40)).unwrap();
        drop(tx);
        handle.join().unwrap();

        assert_eq!(metrics.send_errors.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.packets_sent.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.queue_depth.load(Ordering::Relaxed), 0);
        assert_eq!(gauge.open(), 0);
    }
}
