//! Integration tests: full session lifecycle over a real UDP socket on
//! localhost, driven by the synthetic backend and a scripted encoder.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use castline_core::{
    CaptureService, CastError, Depacketizer, EncodedFrame, EncoderFactory, EncoderSettings,
    PlanarFrame, RtpPacket, SessionConfig, SessionEvent, SessionState, SyntheticBackend,
    SyntheticConfig, VideoEncoder,
};
use tokio::sync::broadcast::{self, error::TryRecvError};

// ── Helpers ──────────────────────────────────────────────────────

const WAIT: Duration = Duration::from_secs(5);

/// Emits SPS, PPS and a 2500-byte IDR when forced, otherwise one P slice
/// whose size cycles through single-packet and fragmented sizes.
struct ScriptedEncoder {
    frame: usize,
}

fn nal(header: u8, len: usize) -> Bytes {
    let mut data = vec![header];
    data.extend((1..len).map(|i| (i % 251) as u8));
    Bytes::from(data)
}

impl VideoEncoder for ScriptedEncoder {
    fn encode(
        &mut self,
        _picture: &PlanarFrame,
        force_keyframe: bool,
    ) -> Result<Option<EncodedFrame>, CastError> {
        self.frame += 1;
        let frame = if force_keyframe {
            EncodedFrame {
                nals: vec![nal(0x67, 12), nal(0x68, 4), nal(0x65, 2500)],
                keyframe: true,
            }
        } else {
            EncodedFrame {
                nals: vec![nal(0x41, 600 + (self.frame % 3) * 900)],
                keyframe: false,
            }
        };
        Ok(Some(frame))
    }
}

struct ScriptedFactory {
    fail: bool,
}

impl EncoderFactory for ScriptedFactory {
    fn create(&self, _settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>, CastError> {
        if self.fail {
            return Err(CastError::EncoderInit("no encoder on this machine".into()));
        }
        Ok(Box::new(ScriptedEncoder { frame: 0 }))
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        initial_sequence: Some(65_530),
        initial_timestamp: Some(u32::MAX - 5_000),
        telemetry_interval: Duration::from_millis(100),
        health_interval: Duration::from_millis(50),
        ..SessionConfig::default()
    }
}

fn service_with(synthetic: SyntheticConfig, fail_encoder: bool) -> CaptureService {
    CaptureService::new(
        Arc::new(SyntheticBackend::new(synthetic)),
        Arc::new(ScriptedFactory { fail: fail_encoder }),
        test_config(),
    )
}

fn service() -> CaptureService {
    service_with(SyntheticConfig::default(), false)
}

/// Collects RTP packets on a localhost socket until dropped.
struct Peer {
    addr: SocketAddr,
    done: Arc<AtomicBool>,
    thread: JoinHandle<Vec<RtpPacket>>,
}

impl Peer {
    fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let thread = thread::spawn(move || {
            let mut packets = Vec::new();
            let mut buf = [0u8; 2048];
            loop {
                match socket.recv(&mut buf) {
                    Ok(n) => packets.push(RtpPacket::parse(&buf[..n]).unwrap()),
                    Err(_) if flag.load(Ordering::SeqCst) => return packets,
                    Err(_) => {}
                }
            }
        });
        Self { addr, done, thread }
    }

    /// Drain what is still in flight and return everything received.
    fn finish(self) -> Vec<RtpPacket> {
        self.done.store(true, Ordering::SeqCst);
        self.thread.join().unwrap()
    }
}

/// Read events until `pred` matches; returns everything read.
fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => {
                let done = pred(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty) => {
                assert!(Instant::now() < deadline, "event not seen; got {seen:?}");
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Closed) => panic!("event channel closed"),
        }
    }
}

fn is_state(event: &SessionEvent, want: SessionState) -> bool {
    matches!(event, SessionEvent::StateChanged { state, .. } if *state == want)
}

fn states(events: &[SessionEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

// ── Lifecycle ────────────────────────────────────────────────────

#[test]
fn streams_rtp_and_stops_cleanly() {
    let svc = service();
    let mut events = svc.subscribe();
    let peer = Peer::bind();

    let handle = svc.start_capture("monitor:0", peer.addr, 2000, 30).unwrap();
    let mut log = wait_for(&mut events, |e| is_state(e, SessionState::Running));
    thread::sleep(Duration::from_millis(600));

    svc.stop_capture(handle).unwrap();
    log.extend(wait_for(&mut events, |e| is_state(e, SessionState::Stopped)));
    let packets = peer.finish();

    // Lifecycle events in order.
    let seen = states(&log);
    assert_eq!(&seen[..2], &[SessionState::Starting, SessionState::Running]);
    assert_eq!(
        &seen[seen.len() - 2..],
        &[SessionState::Stopping, SessionState::Stopped]
    );
    assert!(log.iter().all(|e| e.session() == handle));

    let snap = svc.state(handle).unwrap();
    assert_eq!(snap.state, SessionState::Stopped);
    assert_eq!(snap.error_reason, None);
    assert_eq!(svc.open_resources(handle).unwrap(), 0);

    // Wire format.
    let metrics = svc.metrics(handle).unwrap();
    assert!(packets.len() > 10, "only {} packets", packets.len());
    assert_eq!(metrics.packets_sent, packets.len() as u64);
    assert_eq!(metrics.send_errors, 0);

    let first = &packets[0].header;
    assert_eq!(first.sequence, 65_530);
    assert_eq!(first.timestamp, u32::MAX - 5_000);
    for pair in packets.windows(2) {
        assert_eq!(
            pair[1].header.sequence,
            pair[0].header.sequence.wrapping_add(1),
            "sequence numbers are contiguous across the wrap"
        );
    }
    for p in &packets {
        assert_eq!(p.header.payload_type, 102);
        assert_eq!(p.header.ssrc, 0x1234_5678);
        assert!(p.payload.len() <= 1200);
    }

    // Consecutive access units at 30 fps are exactly 90000 / 30 ticks apart.
    let mut unit_timestamps: Vec<u32> = packets.iter().map(|p| p.header.timestamp).collect();
    unit_timestamps.dedup();
    assert!(unit_timestamps.len() > 5);
    for pair in unit_timestamps.windows(2) {
        assert_eq!(pair[1].wrapping_sub(pair[0]), 3_000);
    }

    // One marker per access unit, on its last packet.
    for (i, p) in packets.iter().enumerate() {
        let last_of_unit = packets
            .get(i + 1)
            .is_none_or(|next| next.header.timestamp != p.header.timestamp);
        assert_eq!(p.header.marker, last_of_unit, "packet {i}");
    }

    // The stream opens with SPS, PPS and IDR and reassembles cleanly.
    let mut depacketizer = Depacketizer::new();
    let mut nals = Vec::new();
    for p in &packets {
        nals.extend(depacketizer.push(p).unwrap());
    }
    let types: Vec<u8> = nals.iter().take(3).map(|n| n[0] & 0x1F).collect();
    assert_eq!(types, vec![7, 8, 5]);
    assert_eq!(nals[2].len(), 2500);
}

#[test]
fn double_start_and_double_stop_rejected() {
    let svc = service();
    let mut events = svc.subscribe();
    let peer = Peer::bind();

    let handle = svc.start_capture("monitor:0", peer.addr, 2000, 30).unwrap();
    wait_for(&mut events, |e| is_state(e, SessionState::Running));

    let err = svc
        .start_capture("window:1000", peer.addr, 2000, 30)
        .unwrap_err();
    assert!(matches!(
        err,
        CastError::InvalidTransition { action: "start", .. }
    ));

    svc.stop_capture(handle).unwrap();
    let err = svc.stop_capture(handle).unwrap_err();
    assert!(matches!(
        err,
        CastError::InvalidTransition {
            state: SessionState::Stopped,
            action: "stop"
        }
    ));
    assert!(matches!(
        svc.request_keyframe(handle),
        Err(CastError::InvalidTransition { .. })
    ));

    // A new session may start once the old one is terminal.
    let next = svc.start_capture("window:1000", peer.addr, 2000, 30).unwrap();
    assert_ne!(next, handle);
    assert!(matches!(
        svc.state(handle),
        Err(CastError::UnknownSession(_))
    ));
    svc.stop_capture(next).unwrap();
    assert_eq!(svc.open_resources(next).unwrap(), 0);
    peer.finish();
}

#[test]
fn stop_before_first_frame_is_clean() {
    let svc = service_with(
        SyntheticConfig {
            fps: 1,
            ..SyntheticConfig::default()
        },
        false,
    );
    let peer = Peer::bind();
    let handle = svc.start_capture("monitor:0", peer.addr, 2000, 1).unwrap();
    svc.stop_capture(handle).unwrap();
    assert_eq!(svc.state(handle).unwrap().state, SessionState::Stopped);
    assert_eq!(svc.open_resources(handle).unwrap(), 0);
    peer.finish();
}

// ── Failures ─────────────────────────────────────────────────────

#[test]
fn source_loss_fails_session_and_releases_resources() {
    let svc = service_with(
        SyntheticConfig {
            lose_after: Some(5),
            ..SyntheticConfig::default()
        },
        false,
    );
    let mut events = svc.subscribe();
    let peer = Peer::bind();

    let handle = svc.start_capture("monitor:0", peer.addr, 2000, 30).unwrap();
    let log = wait_for(&mut events, |e| is_state(e, SessionState::Failed));

    // Counters freeze once the pipeline is torn down.
    let frozen = svc.metrics(handle).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(svc.metrics(handle).unwrap(), frozen);

    let reason = log.iter().find_map(|e| match e {
        SessionEvent::StateChanged {
            state: SessionState::Failed,
            reason,
            ..
        } => reason.clone(),
        _ => None,
    });
    assert!(reason.is_some_and(|r| r.contains("source lost")));

    let snap = svc.state(handle).unwrap();
    assert_eq!(snap.state, SessionState::Failed);
    assert!(snap.error_reason.is_some());
    assert_eq!(svc.open_resources(handle).unwrap(), 0);
    assert!(matches!(
        svc.stop_capture(handle),
        Err(CastError::InvalidTransition {
            state: SessionState::Failed,
            ..
        })
    ));
    peer.finish();
}

#[test]
fn encoder_init_failure_fails_session() {
    let svc = service_with(SyntheticConfig::default(), true);
    let mut events = svc.subscribe();
    let peer = Peer::bind();

    let handle = svc.start_capture("monitor:0", peer.addr, 2000, 30).unwrap();
    wait_for(&mut events, |e| is_state(e, SessionState::Failed));

    let snap = svc.state(handle).unwrap();
    assert!(
        snap.error_reason
            .is_some_and(|r| r.contains("no encoder on this machine"))
    );
    assert_eq!(svc.open_resources(handle).unwrap(), 0);
    assert!(peer.finish().is_empty());
}

#[test]
fn enumeration_failure_surfaces() {
    let svc = service_with(
        SyntheticConfig {
            fail_enumeration: true,
            ..SyntheticConfig::default()
        },
        false,
    );
    assert!(matches!(
        svc.enumerate_sources(),
        Err(CastError::SourceEnumeration(_))
    ));
    let peer: SocketAddr = "127.0.0.1:5004".parse().unwrap();
    assert!(matches!(
        svc.start_capture("monitor:0", peer, 2000, 30),
        Err(CastError::SourceEnumeration(_))
    ));
}

#[test]
fn unknown_source_rejected() {
    let svc = service();
    let peer: SocketAddr = "127.0.0.1:5004".parse().unwrap();
    let err = svc.start_capture("window:9", peer, 2000, 30).unwrap_err();
    assert!(matches!(err, CastError::UnknownSource(ref id) if id == "window:9"));
}

// ── Health ───────────────────────────────────────────────────────

/// Emits one oversized slice per picture for the first `burst` pictures,
/// then lets rate control skip everything.
struct BurstEncoder {
    slice: Bytes,
    burst: usize,
}

impl VideoEncoder for BurstEncoder {
    fn encode(
        &mut self,
        _picture: &PlanarFrame,
        force_keyframe: bool,
    ) -> Result<Option<EncodedFrame>, CastError> {
        if self.burst == 0 {
            return Ok(None);
        }
        self.burst -= 1;
        Ok(Some(EncodedFrame {
            nals: vec![self.slice.clone()],
            keyframe: force_keyframe,
        }))
    }
}

struct BurstFactory {
    slice_len: usize,
    burst: usize,
}

impl EncoderFactory for BurstFactory {
    fn create(&self, _settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>, CastError> {
        Ok(Box::new(BurstEncoder {
            slice: nal(0x41, self.slice_len),
            burst: self.burst,
        }))
    }
}

#[test]
fn backlog_degrades_then_recovers() {
    let svc = CaptureService::new(
        Arc::new(SyntheticBackend::new(SyntheticConfig {
            fps: 240,
            ..SyntheticConfig::default()
        })),
        Arc::new(BurstFactory {
            slice_len: 5_000_000,
            burst: 30,
        }),
        SessionConfig {
            channel_capacity: 1,
            backpressure_timeout: Duration::from_millis(2),
            health_interval: Duration::from_millis(20),
            ..SessionConfig::default()
        },
    );
    let mut events = svc.subscribe();
    // Never read: the kernel discards what does not fit.
    let sink = UdpSocket::bind("127.0.0.1:0").unwrap();

    let handle = svc
        .start_capture("monitor:0", sink.local_addr().unwrap(), 2000, 240)
        .unwrap();
    let mut log = wait_for(&mut events, |e| is_state(e, SessionState::Degraded));
    log.extend(wait_for(&mut events, |e| is_state(e, SessionState::Running)));

    let seen = states(&log);
    let degraded_at = seen
        .iter()
        .position(|s| *s == SessionState::Degraded)
        .unwrap();
    assert_eq!(seen[degraded_at - 1], SessionState::Running);
    assert_eq!(seen.last(), Some(&SessionState::Running));

    let reason = log.iter().find_map(|e| match e {
        SessionEvent::StateChanged {
            state: SessionState::Degraded,
            reason,
            ..
        } => reason.clone(),
        _ => None,
    });
    assert!(reason.is_some(), "degraded carries a reason");

    // Once the burst is spent and the queue drains, the session settles.
    let deadline = Instant::now() + WAIT;
    loop {
        let metrics = svc.metrics(handle).unwrap();
        if metrics.frames_encoded == 30 && metrics.queue_depth == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "burst never drained: {metrics:?}");
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(100));
    assert_eq!(svc.state(handle).unwrap().state, SessionState::Running);
    assert_eq!(svc.metrics(handle).unwrap().frames_encoded, 30);

    svc.stop_capture(handle).unwrap();
    assert_eq!(svc.state(handle).unwrap().state, SessionState::Stopped);
    assert_eq!(svc.open_resources(handle).unwrap(), 0);
}

// ── Telemetry and control ────────────────────────────────────────

#[test]
fn telemetry_published_while_streaming() {
    let svc = service();
    let mut events = svc.subscribe();
    let peer = Peer::bind();

    let handle = svc.start_capture("monitor:0", peer.addr, 2000, 30).unwrap();
    let log = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Telemetry { metrics, .. } if metrics.frames_encoded > 0)
    });
    let Some(SessionEvent::Telemetry { session, metrics }) = log.last() else {
        panic!("expected telemetry");
    };
    assert_eq!(*session, handle);
    assert!(metrics.frames_captured >= metrics.frames_encoded);
    assert!(metrics.bytes_sent > 0);

    svc.stop_capture(handle).unwrap();
    peer.finish();
}

#[test]
fn keyframe_request_produces_idr() {
    let svc = service();
    let mut events = svc.subscribe();
    let peer = Peer::bind();

    let handle = svc.start_capture("monitor:0", peer.addr, 2000, 30).unwrap();
    wait_for(&mut events, |e| is_state(e, SessionState::Running));
    let deadline = Instant::now() + WAIT;
    while svc.metrics(handle).unwrap().keyframes < 1 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(10));
    }

    svc.request_keyframe(handle).unwrap();
    while svc.metrics(handle).unwrap().keyframes < 2 {
        assert!(Instant::now() < deadline, "requested IDR never arrived");
        thread::sleep(Duration::from_millis(10));
    }

    svc.stop_capture(handle).unwrap();
    let packets = peer.finish();
    let idrs = packets
        .iter()
        .filter(|p| p.payload[0] & 0x1F == 5 || (p.payload[0] & 0x1F == 28 && p.payload[1] == 0x85))
        .count();
    assert!(idrs >= 2, "two IDR starts on the wire");
}

#[test]
fn dropping_service_stops_session() {
    let peer = Peer::bind();
    let svc = service();
    let mut events = svc.subscribe();
    let handle = svc.start_capture("monitor:0", peer.addr, 2000, 30).unwrap();
    wait_for(&mut events, |e| is_state(e, SessionState::Running));

    drop(svc);
    let log = wait_for(&mut events, |e| is_state(e, SessionState::Stopped));
    assert!(log.iter().all(|e| e.session() == handle));
    peer.finish();
}
