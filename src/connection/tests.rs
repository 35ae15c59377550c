use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::*;
use crate::clock::{MockClock, MockHelper};
use crate::crypto::{AeadDecrypter, AeadEncrypter, AeadKey, KEY_SIZE};
use crate::error::Error;
use crate::types::{supported_versions, FecSendPolicy, MAX_PACKET_SIZE};
use crate::wire::{
    process_packet, AckFrame, ConnectionCloseFrame, FecData, FramerVisitor, PublicHeader,
    PublicResetPacket, StreamFrame, VersionNegotiationPacket,
};
use crate::writer::WriteResult;

const CONNECTION_ID: ConnectionId = 42;
const DATA_STREAM: StreamId = 5;

/// Log to the test output when `RUST_LOG` is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn self_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 443))
}

fn peer_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4433))
}

#[derive(Default)]
struct WriterState {
    packets: Vec<Vec<u8>>,
    /// Block on the next write.
    block_writes: bool,
    blocked: bool,
    buffered: bool,
}

struct RecordingWriter(Rc<RefCell<WriterState>>);

impl PacketWriter for RecordingWriter {
    fn write_packet(&mut self, packet: &[u8], _self_ip: IpAddr, _peer: SocketAddr) -> WriteResult {
        let mut state = self.0.borrow_mut();
        if state.blocked || state.block_writes {
            state.blocked = true;
            return WriteResult::blocked();
        }
        state.packets.push(packet.to_vec());
        WriteResult::ok(packet.len())
    }

    fn is_write_blocked(&self) -> bool {
        self.0.borrow().blocked
    }

    fn is_write_blocked_data_buffered(&self) -> bool {
        self.0.borrow().buffered
    }

    fn set_writable(&mut self) {
        self.0.borrow_mut().blocked = false;
    }

    fn max_packet_size(&self, _peer: SocketAddr) -> ByteCount {
        MAX_PACKET_SIZE
    }
}

#[derive(Default)]
struct VisitorState {
    stream_frames: Vec<StreamFrame>,
    closes: Vec<(ErrorCode, bool)>,
    negotiated_versions: Vec<QuicVersion>,
    migrations: Vec<PeerAddressChangeType>,
    write_blocked: usize,
    go_aways: usize,
    pending_handshake: bool,
}

struct RecordingVisitor(Rc<RefCell<VisitorState>>);

impl ConnectionVisitor for RecordingVisitor {
    fn on_stream_frame(&mut self, frame: &StreamFrame) {
        self.0.borrow_mut().stream_frames.push(frame.clone());
    }

    fn on_rst_stream(&mut self, _frame: &RstStreamFrame) {}

    fn on_go_away(&mut self, _frame: &GoAwayFrame) {
        self.0.borrow_mut().go_aways += 1;
    }

    fn on_window_update_frame(&mut self, _frame: &WindowUpdateFrame) {}

    fn on_blocked_frame(&mut self, _frame: &BlockedFrame) {}

    fn on_can_write(&mut self) {}

    fn on_write_blocked(&mut self) {
        self.0.borrow_mut().write_blocked += 1;
    }

    fn on_connection_closed(&mut self, error: ErrorCode, from_peer: bool) {
        self.0.borrow_mut().closes.push((error, from_peer));
    }

    fn on_successful_version_negotiation(&mut self, version: QuicVersion) {
        self.0.borrow_mut().negotiated_versions.push(version);
    }

    fn on_connection_migration(&mut self, change_type: PeerAddressChangeType) {
        self.0.borrow_mut().migrations.push(change_type);
    }

    fn on_congestion_window_change(&mut self, _now: Instant) {}

    fn has_pending_handshake(&self) -> bool {
        self.0.borrow().pending_handshake
    }

    fn has_open_dynamic_streams(&self) -> bool {
        false
    }

    fn willing_and_able_to_write(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct DebugState {
    packets_sent: usize,
    duplicates: Vec<PacketNumber>,
}

struct RecordingDebugVisitor(Rc<RefCell<DebugState>>);

impl DebugVisitor for RecordingDebugVisitor {
    fn on_packet_sent(
        &mut self,
        _packet: &SerializedPacket,
        _original_packet_number: Option<PacketNumber>,
        _transmission_type: TransmissionType,
        _sent_time: Instant,
    ) {
        self.0.borrow_mut().packets_sent += 1;
    }

    fn on_duplicate_packet(&mut self, packet_number: PacketNumber) {
        self.0.borrow_mut().duplicates.push(packet_number);
    }
}

/// Parses what the connection writes, from the other end's point of view.
struct Sink {
    framer: Framer,
    received: ReceivedPacketManager,
    last_header: PacketHeader,
    last_size: ByteCount,
    packet_numbers: Vec<PacketNumber>,
    packets: Vec<Vec<Frame>>,
}

impl Sink {
    fn current(&mut self) -> &mut Vec<Frame> {
        if self.packets.is_empty() {
            self.packets.push(Vec::new());
        }
        let last = self.packets.len() - 1;
        &mut self.packets[last]
    }
}

impl FramerVisitor for Sink {
    fn framer(&self) -> &Framer {
        &self.framer
    }

    fn framer_mut(&mut self) -> &mut Framer {
        &mut self.framer
    }

    fn on_error(&mut self, error: &Error) {
        panic!("peer failed to parse connection output: {}", error);
    }

    fn on_packet(&mut self) {}

    fn on_public_reset_packet(&mut self, _packet: &PublicResetPacket) {}

    fn on_version_negotiation_packet(&mut self, _packet: &VersionNegotiationPacket) {}

    fn on_protocol_version_mismatch(&mut self, _received_version: QuicVersion) -> bool {
        true
    }

    fn on_unauthenticated_public_header(&mut self, _header: &PublicHeader) -> bool {
        true
    }

    fn on_unauthenticated_header(&mut self, _header: &PacketHeader) -> bool {
        true
    }

    fn on_decrypted_packet(&mut self, _level: EncryptionLevel) {}

    fn on_packet_header(&mut self, header: &PacketHeader) -> bool {
        self.last_header = header.clone();
        self.packet_numbers.push(header.packet_number);
        self.packets.push(Vec::new());
        true
    }

    fn on_revived_packet(&mut self) {}

    fn on_fec_protected_payload(&mut self, _payload: &[u8]) {}

    fn on_stream_frame(&mut self, frame: &StreamFrame) -> bool {
        self.current().push(Frame::Stream(frame.clone()));
        true
    }

    fn on_ack_frame(&mut self, frame: &AckFrame) -> bool {
        self.current().push(Frame::Ack(frame.clone()));
        true
    }

    fn on_stop_waiting_frame(&mut self, frame: &StopWaitingFrame) -> bool {
        self.current().push(Frame::StopWaiting(*frame));
        true
    }

    fn on_ping_frame(&mut self) -> bool {
        self.current().push(Frame::Ping);
        true
    }

    fn on_rst_stream_frame(&mut self, frame: &RstStreamFrame) -> bool {
        self.current().push(Frame::RstStream(frame.clone()));
        true
    }

    fn on_connection_close_frame(&mut self, frame: &ConnectionCloseFrame) -> bool {
        self.current().push(Frame::ConnectionClose(frame.clone()));
        true
    }

    fn on_go_away_frame(&mut self, frame: &GoAwayFrame) -> bool {
        self.current().push(Frame::GoAway(frame.clone()));
        true
    }

    fn on_window_update_frame(&mut self, frame: &WindowUpdateFrame) -> bool {
        self.current().push(Frame::WindowUpdate(*frame));
        true
    }

    fn on_blocked_frame(&mut self, frame: &BlockedFrame) -> bool {
        self.current().push(Frame::Blocked(*frame));
        true
    }

    fn on_fec_data(&mut self, _fec: &FecData) {}

    fn on_packet_complete(&mut self) {
        self.received
            .record_packet_received(self.last_size, &self.last_header, Instant::now());
    }
}

/// The other end: builds packets for the connection and parses its output.
struct Peer {
    generator: PacketGenerator,
    sink: Sink,
}

impl Peer {
    fn new(perspective: Perspective) -> Self {
        let mut rng = StdRng::seed_from_u64(7);
        Self {
            generator: PacketGenerator::new(
                CONNECTION_ID,
                perspective,
                QuicVersion::V30,
                DEFAULT_MAX_PACKET_SIZE,
                &mut rng,
            ),
            sink: Sink {
                framer: Framer::new(supported_versions(), perspective),
                received: ReceivedPacketManager::new(),
                last_header: PacketHeader::default(),
                last_size: 0,
                packet_numbers: Vec::new(),
                packets: Vec::new(),
            },
        }
    }

    fn forward_secure(&mut self, key: &AeadKey) {
        self.generator.set_encrypter(
            EncryptionLevel::ForwardSecure,
            Box::new(AeadEncrypter::new(key, [0, 0, 0, 1])),
        );
        self.generator
            .set_encryption_level(EncryptionLevel::ForwardSecure);
    }

    fn take_single(&mut self) -> Vec<u8> {
        let mut packets = self.generator.take_packets();
        assert_eq!(packets.len(), 1);
        packets.remove(0).packet.to_vec()
    }

    fn ping(&mut self) -> Vec<u8> {
        self.generator.add_control_frame(Frame::Ping).unwrap();
        self.take_single()
    }

    fn stream(&mut self, data: &[u8], offset: StreamOffset, fec: FecProtection) -> Vec<Vec<u8>> {
        self.generator
            .consume_data(DATA_STREAM, data, offset, false, fec)
            .unwrap();
        self.generator
            .take_packets()
            .into_iter()
            .map(|packet| packet.packet.to_vec())
            .collect()
    }

    fn ack(&mut self, ack: AckFrame) -> Vec<u8> {
        self.generator.queue_ack(ack, None).unwrap();
        self.take_single()
    }

    fn receive(&mut self, packet: &[u8]) {
        self.sink.last_size = packet.len() as u64;
        assert!(process_packet(&mut self.sink, packet));
    }

    fn acks(&self) -> Vec<&AckFrame> {
        self.sink
            .packets
            .iter()
            .flatten()
            .filter_map(|frame| match frame {
                Frame::Ack(ack) => Some(ack),
                _ => None,
            })
            .collect()
    }
}

struct Harness {
    connection: Connection,
    clock: Rc<MockClock>,
    writer: Rc<RefCell<WriterState>>,
    visitor: Rc<RefCell<VisitorState>>,
    peer: Peer,
    delivered_to_peer: usize,
}

impl Harness {
    fn new(perspective: Perspective) -> Self {
        Self::with_versions(perspective, supported_versions())
    }

    fn with_versions(perspective: Perspective, versions: Vec<QuicVersion>) -> Self {
        init_tracing();
        let mut helper = MockHelper::new(1);
        let writer = Rc::new(RefCell::new(WriterState::default()));
        let visitor = Rc::new(RefCell::new(VisitorState::default()));
        let connection = Connection::new(
            CONNECTION_ID,
            peer_address(),
            &mut helper,
            Box::new(RecordingWriter(writer.clone())),
            Box::new(RecordingVisitor(visitor.clone())),
            perspective,
            versions,
        );
        let peer_perspective = match perspective {
            Perspective::Server => Perspective::Client,
            Perspective::Client => Perspective::Server,
        };
        Self {
            connection,
            clock: helper.mock_clock(),
            writer,
            visitor,
            peer: Peer::new(peer_perspective),
            delivered_to_peer: 0,
        }
    }

    fn deliver(&mut self, packet: &[u8]) {
        self.connection
            .process_udp_packet(self_address(), peer_address(), packet);
    }

    fn written(&self) -> usize {
        self.writer.borrow().packets.len()
    }

    /// Hand everything written so far to the peer.
    fn sync_peer(&mut self) {
        let packets: Vec<Vec<u8>> = self.writer.borrow().packets[self.delivered_to_peer..].to_vec();
        self.delivered_to_peer += packets.len();
        for packet in packets {
            self.peer.receive(&packet);
        }
    }

    fn closes(&self) -> Vec<(ErrorCode, bool)> {
        self.visitor.borrow().closes.clone()
    }
}

#[test]
fn test_acked_pings_and_decreasing_largest_observed() {
    let mut h = Harness::new(Perspective::Server);
    for _ in 0..3 {
        h.connection.send_ping();
    }
    assert_eq!(h.written(), 3);
    h.sync_peer();

    let ack = h.peer.sink.received.ack_frame(Instant::now());
    assert_eq!(ack.largest_observed, 3);
    let packet = h.peer.ack(ack);
    h.deliver(&packet);
    assert!(h.connection.connected());
    assert_eq!(h.connection.sent_packet_manager().largest_observed(), 3);
    assert!(!h.connection.sent_packet_manager().has_unacked_packets());

    let stale = AckFrame {
        largest_observed: 2,
        ..AckFrame::default()
    };
    let packet = h.peer.ack(stale);
    h.deliver(&packet);
    assert!(!h.connection.connected());
    assert_eq!(h.closes(), vec![(ErrorCode::InvalidAckData, false)]);
}

#[test]
fn test_ack_of_unsent_packet_closes() {
    let mut h = Harness::new(Perspective::Server);
    let packet = h.peer.ack(AckFrame {
        largest_observed: 10,
        ..AckFrame::default()
    });
    h.deliver(&packet);
    assert_eq!(h.closes(), vec![(ErrorCode::InvalidAckData, false)]);

    // The close frame went out with the reason.
    h.sync_peer();
    let last = h.peer.sink.packets.last().unwrap();
    assert!(last.iter().any(|frame| matches!(
        frame,
        Frame::ConnectionClose(close) if close.error_code == ErrorCode::InvalidAckData
    )));
    assert_eq!(h.connection.termination_packets().len(), 1);
}

#[test]
fn test_close_is_idempotent() {
    let mut h = Harness::new(Perspective::Server);
    assert!(h.connection.is_alarm_set(AlarmKind::Timeout));

    h.connection.close_connection(ErrorCode::PeerGoingAway, true);
    h.connection.close_connection(ErrorCode::InternalError, false);
    h.connection
        .send_connection_close_with_details(ErrorCode::InternalError, "again");

    assert_eq!(h.closes(), vec![(ErrorCode::PeerGoingAway, true)]);
    assert!(h.connection.next_alarm_deadline().is_none());
    assert_eq!(h.written(), 0);

    // Everything is a no-op once closed.
    h.connection.send_ping();
    h.connection.on_alarm(AlarmKind::Timeout);
    let packet = h.peer.ping();
    h.deliver(&packet);
    assert_eq!(h.written(), 0);
    assert_eq!(h.closes().len(), 1);
}

#[test]
fn test_fec_revives_lost_packet() {
    let mut h = Harness::new(Perspective::Server);
    let key = AeadKey::from_bytes([9u8; KEY_SIZE]);
    h.peer.forward_secure(&key);
    h.peer.generator.set_fec_policy(FecSendPolicy::AnyTrigger, 3);
    h.connection.set_decrypter(
        EncryptionLevel::ForwardSecure,
        Box::new(AeadDecrypter::new(&key, [0, 0, 0, 1])),
    );

    let mut packets = Vec::new();
    for (i, data) in [b"aaa", b"bbb", b"ccc"].iter().enumerate() {
        packets.extend(h.peer.stream(*data, 3 * i as u64, FecProtection::MustFecProtect));
    }
    // Three protected packets and the redundancy.
    assert_eq!(packets.len(), 4);

    h.deliver(&packets[0]);
    h.deliver(&packets[2]);
    h.deliver(&packets[3]);

    {
        let visitor = h.visitor.borrow();
        assert_eq!(visitor.stream_frames.len(), 3);
        assert_eq!(&visitor.stream_frames[2].data[..], b"bbb");
        assert_eq!(visitor.stream_frames[2].offset, 3);
    }
    assert_eq!(h.connection.stats().packets_revived, 1);
    assert!(h.connection.fec_groups.is_empty());

    h.sync_peer();
    let acks = h.peer.acks();
    let last = acks.last().unwrap();
    assert_eq!(last.latest_revived_packet, 2);
    assert!(last.missing_packets.contains(&2));
    assert_eq!(last.largest_observed, 4);
}

#[test]
fn test_fec_group_eviction() {
    let mut h = Harness::new(Perspective::Server);
    assert_eq!(h.connection.config.max_fec_groups, 2);
    assert!(h.connection.fec_group(0).is_none());
    assert!(h.connection.fec_group(10).is_some());
    assert!(h.connection.fec_group(20).is_some());
    assert!(h.connection.fec_group(30).is_some());

    let groups: Vec<FecGroupNumber> = h.connection.fec_groups.keys().copied().collect();
    assert_eq!(groups, vec![20, 30]);
    assert!(h.connection.fec_group(5).is_none());
    assert!(h.connection.fec_group(15).is_none());
    assert!(h.connection.fec_group(20).is_some());
}

#[test]
fn test_client_switches_version_on_negotiation_packet() {
    let mut h = Harness::with_versions(
        Perspective::Client,
        vec![QuicVersion::V30, QuicVersion::V29, QuicVersion::V28],
    );
    let consumed = h.connection.send_stream_data(
        CRYPTO_STREAM_ID,
        b"client hello",
        0,
        false,
        FecProtection::MayNotFecProtect,
    );
    assert_eq!(consumed, ConsumedData::new(12, false));
    assert_eq!(h.written(), 1);
    assert_eq!(&h.writer.borrow().packets[0][9..13], &QuicVersion::V30.tag().to_be_bytes());

    let negotiation = Framer::build_version_negotiation_packet(
        CONNECTION_ID,
        &[QuicVersion::V29, QuicVersion::V28, QuicVersion::V25],
    );
    h.deliver(&negotiation);

    assert!(h.connection.connected());
    assert_eq!(h.connection.version(), QuicVersion::V29);
    assert_eq!(
        h.connection.version_negotiation_state(),
        VersionNegotiationState::NegotiationInProgress
    );
    assert_eq!(
        h.connection.server_supported_versions(),
        &[QuicVersion::V29, QuicVersion::V28, QuicVersion::V25]
    );
    // The hello went out again under the new version.
    assert_eq!(h.written(), 2);
    let writer = h.writer.borrow();
    assert_eq!(&writer.packets[1][9..13], &QuicVersion::V29.tag().to_be_bytes());
}

#[test]
fn test_negotiation_packet_listing_our_version_closes() {
    let mut h = Harness::new(Perspective::Client);
    let negotiation =
        Framer::build_version_negotiation_packet(CONNECTION_ID, &[QuicVersion::V30, QuicVersion::V29]);
    h.deliver(&negotiation);
    assert_eq!(
        h.closes(),
        vec![(ErrorCode::InvalidVersionNegotiationPacket, false)]
    );
}

#[test]
fn test_negotiation_without_common_version_closes() {
    let mut h = Harness::with_versions(Perspective::Client, vec![QuicVersion::V30, QuicVersion::V29]);
    let negotiation = Framer::build_version_negotiation_packet(CONNECTION_ID, &[QuicVersion::V25]);
    h.deliver(&negotiation);
    assert_eq!(h.closes(), vec![(ErrorCode::InvalidVersion, false)]);
}

#[test]
fn test_server_answers_unknown_version() {
    let mut h = Harness::with_versions(Perspective::Server, vec![QuicVersion::V30, QuicVersion::V29]);
    h.peer.generator.set_version(QuicVersion::from_number(99));
    let packet = h.peer.ping();
    h.deliver(&packet);

    assert!(h.connection.connected());
    assert_eq!(h.written(), 1);
    let expected = Framer::build_version_negotiation_packet(
        CONNECTION_ID,
        &[QuicVersion::V30, QuicVersion::V29],
    );
    assert_eq!(h.writer.borrow().packets[0], expected.to_vec());
    assert_eq!(
        h.connection.version_negotiation_state(),
        VersionNegotiationState::NegotiationInProgress
    );

    h.peer.generator.set_version(QuicVersion::V29);
    let packet = h.peer.ping();
    h.deliver(&packet);
    assert_eq!(h.connection.version(), QuicVersion::V29);
    assert_eq!(
        h.connection.version_negotiation_state(),
        VersionNegotiationState::NegotiatedVersion
    );
    assert_eq!(h.visitor.borrow().negotiated_versions, vec![QuicVersion::V29]);
}

#[test]
fn test_blocked_writer_keeps_packet_order() {
    let mut h = Harness::new(Perspective::Client);
    h.writer.borrow_mut().block_writes = true;

    // Too much for one packet; the first write blocks and the rest queue
    // behind it.
    let hello = vec![0x5a; 3000];
    let consumed = h.connection.send_stream_data(
        CRYPTO_STREAM_ID,
        &hello,
        0,
        false,
        FecProtection::MayNotFecProtect,
    );
    assert_eq!(consumed.bytes_consumed, hello.len());
    let queued = h.connection.num_queued_packets();
    assert!(queued >= 3);
    assert_eq!(h.written(), 0);
    assert!(h.visitor.borrow().write_blocked > 0);

    // Nothing new is generated while blocked.
    h.connection.send_ping();
    assert_eq!(h.connection.num_queued_packets(), queued);
    assert!(h.connection.has_queued_data());

    {
        let mut writer = h.writer.borrow_mut();
        writer.block_writes = false;
        writer.blocked = false;
    }
    h.connection.on_can_write();
    assert_eq!(h.connection.num_queued_packets(), 0);
    assert_eq!(h.written(), queued + 1);

    h.sync_peer();
    let expected: Vec<PacketNumber> = (1..=queued as u64 + 1).collect();
    assert_eq!(h.peer.sink.packet_numbers, expected);
    assert!(matches!(h.peer.sink.packets[queued][..], [Frame::Ping]));
}

#[test]
fn test_new_gap_is_acked_after_delay() {
    let mut h = Harness::new(Perspective::Server);
    let delay = h.connection.sent_packet_manager().delayed_ack_time();

    let first = h.peer.ping();
    h.deliver(&first);
    assert_eq!(h.written(), 0);
    assert!(h.connection.is_alarm_set(AlarmKind::Ack));

    // The second instigating packet sends the ack at once.
    let second = h.peer.ping();
    h.deliver(&second);
    assert_eq!(h.written(), 1);

    let third = h.peer.ping();
    h.deliver(&third);
    assert_eq!(h.written(), 1);
    h.clock.advance(delay);
    h.connection.fire_expired_alarms();
    assert_eq!(h.written(), 2);

    let _lost = h.peer.ping();
    let fifth = h.peer.ping();
    h.deliver(&fifth);
    assert_eq!(h.written(), 2);
    assert!(h.connection.is_alarm_set(AlarmKind::Ack));

    h.clock.advance(delay);
    h.connection.fire_expired_alarms();
    assert_eq!(h.written(), 3);

    h.sync_peer();
    let acks = h.peer.acks();
    assert_eq!(acks.len(), 3);
    let last = acks[2];
    assert_eq!(last.largest_observed, 5);
    assert_eq!(last.missing_packets.iter().copied().collect::<Vec<_>>(), vec![4]);
}

#[test]
fn test_filling_a_gap_acks_immediately() {
    let mut h = Harness::new(Perspective::Server);
    let first = h.peer.ping();
    let second = h.peer.ping();
    h.deliver(&second);
    let written = h.written();
    h.deliver(&first);
    assert_eq!(h.written(), written + 1);
    assert!(!h.connection.is_alarm_set(AlarmKind::Ack));
}

#[test]
fn test_undecryptable_packets_overflow_closes() {
    let mut h = Harness::new(Perspective::Server);
    h.peer.forward_secure(&AeadKey::from_bytes([5u8; KEY_SIZE]));

    for i in 0..10u64 {
        let packets = h.peer.stream(b"early", 5 * i, FecProtection::MayNotFecProtect);
        h.deliver(&packets[0]);
    }
    assert!(h.connection.connected());
    assert_eq!(h.connection.undecryptable_packets.len(), 10);

    let packets = h.peer.stream(b"early", 50, FecProtection::MayNotFecProtect);
    h.deliver(&packets[0]);
    assert_eq!(
        h.closes(),
        vec![(ErrorCode::TooManyUndecryptablePackets, false)]
    );
}

#[test]
fn test_undecryptable_packets_retried_with_new_keys() {
    let mut h = Harness::new(Perspective::Server);
    let key = AeadKey::from_bytes([5u8; KEY_SIZE]);
    h.peer.forward_secure(&key);

    for i in 0..3u64 {
        let packets = h.peer.stream(b"early", 5 * i, FecProtection::MayNotFecProtect);
        h.deliver(&packets[0]);
    }
    assert_eq!(h.connection.undecryptable_packets.len(), 3);
    assert!(h.visitor.borrow().stream_frames.is_empty());

    h.connection.set_decrypter(
        EncryptionLevel::ForwardSecure,
        Box::new(AeadDecrypter::new(&key, [0, 0, 0, 1])),
    );
    h.connection.set_encrypter(
        EncryptionLevel::ForwardSecure,
        Box::new(AeadEncrypter::new(&key, [0, 0, 0, 2])),
    );
    h.connection
        .set_default_encryption_level(EncryptionLevel::ForwardSecure);

    let packets = h.peer.stream(b"later", 15, FecProtection::MayNotFecProtect);
    h.deliver(&packets[0]);

    assert!(h.connection.connected());
    assert!(h.connection.undecryptable_packets.is_empty());
    let offsets: Vec<StreamOffset> = h
        .visitor
        .borrow()
        .stream_frames
        .iter()
        .map(|frame| frame.offset)
        .collect();
    assert_eq!(offsets, vec![15, 0, 5, 10]);
    assert_eq!(h.connection.stats().packets_processed, 4);
}

#[test]
fn test_idle_timeout_closes() {
    let mut h = Harness::new(Perspective::Server);
    // Servers add slack to the five second handshake idle timeout.
    h.clock.advance(Duration::from_secs(7));
    h.connection.fire_expired_alarms();
    assert!(h.connection.connected());

    h.clock.advance(Duration::from_secs(1));
    h.connection.fire_expired_alarms();
    assert_eq!(h.closes(), vec![(ErrorCode::ConnectionTimedOut, false)]);
    h.sync_peer();
    assert!(h
        .peer
        .sink
        .packets
        .iter()
        .flatten()
        .any(|frame| matches!(frame, Frame::ConnectionClose(_))));
}

#[test]
fn test_silent_close_on_idle_timeout() {
    let mut h = Harness::new(Perspective::Client);
    let config = ConnectionConfig {
        negotiated: true,
        silent_close: true,
        idle_connection_state_lifetime: Duration::from_secs(10),
        ..ConnectionConfig::default()
    };
    h.connection.set_from_config(&config);
    let start = h.clock.now();
    // Clients give up a second early.
    assert_eq!(
        h.connection.alarm_deadline(AlarmKind::Timeout),
        Some(start + Duration::from_secs(9))
    );

    h.clock.advance(Duration::from_secs(9));
    h.connection.fire_expired_alarms();
    assert_eq!(h.closes(), vec![(ErrorCode::ConnectionTimedOut, false)]);
    assert_eq!(h.written(), 0);
}

#[test]
fn test_client_timeouts_before_handshake() {
    let h = Harness::new(Perspective::Client);
    let start = h.clock.now();
    assert_eq!(
        h.connection.alarm_deadline(AlarmKind::Timeout),
        Some(start + Duration::from_secs(4))
    );
}

#[test]
fn test_duplicate_packet_is_dropped() {
    let mut h = Harness::new(Perspective::Server);
    let debug = Rc::new(RefCell::new(DebugState::default()));
    h.connection
        .set_debug_visitor(Box::new(RecordingDebugVisitor(debug.clone())));

    let packet = h.peer.ping();
    h.deliver(&packet);
    h.deliver(&packet);

    assert_eq!(debug.borrow().duplicates, vec![1]);
    let stats = h.connection.stats();
    assert_eq!(stats.packets_received, 2);
    assert_eq!(stats.packets_dropped, 1);
}

#[test]
fn test_packet_for_other_connection_is_dropped() {
    let mut h = Harness::new(Perspective::Server);
    let mut rng = StdRng::seed_from_u64(3);
    let mut stranger = PacketGenerator::new(
        CONNECTION_ID + 1,
        Perspective::Client,
        QuicVersion::V30,
        DEFAULT_MAX_PACKET_SIZE,
        &mut rng,
    );
    stranger.add_control_frame(Frame::Ping).unwrap();
    let packet = stranger.take_packets().remove(0);
    h.deliver(&packet.packet);

    assert!(h.connection.connected());
    assert_eq!(h.connection.stats().packets_dropped, 1);
    assert_eq!(h.connection.received_packet_manager().largest_observed(), 0);
}

#[test]
fn test_bundles_pending_ack_with_control_frame() {
    let mut h = Harness::new(Perspective::Server);
    let packet = h.peer.ping();
    h.deliver(&packet);
    assert!(h.connection.is_alarm_set(AlarmKind::Ack));

    h.connection.send_window_update(DATA_STREAM, 4096);
    assert_eq!(h.written(), 1);
    assert!(!h.connection.is_alarm_set(AlarmKind::Ack));

    h.sync_peer();
    let frames = &h.peer.sink.packets[0];
    assert!(frames.iter().any(|frame| matches!(frame, Frame::Ack(_))));
    assert!(frames.iter().any(|frame| matches!(frame, Frame::StopWaiting(_))));
    assert!(frames
        .iter()
        .any(|frame| matches!(frame, Frame::WindowUpdate(w) if w.byte_offset == 4096)));
}

#[test]
fn test_goaway_sent_once() {
    let mut h = Harness::new(Perspective::Server);
    h.connection.send_goaway(ErrorCode::PeerGoingAway, 3, "restart");
    h.connection.send_goaway(ErrorCode::PeerGoingAway, 3, "restart");
    assert!(h.connection.goaway_sent());
    assert_eq!(h.written(), 1);
}

#[test]
fn test_peer_goaway_is_reported() {
    let mut h = Harness::new(Perspective::Server);
    h.peer
        .generator
        .add_control_frame(Frame::GoAway(GoAwayFrame {
            error_code: ErrorCode::PeerGoingAway,
            last_good_stream_id: 0,
            reason_phrase: "bye".to_string(),
        }))
        .unwrap();
    let packet = h.peer.take_single();
    h.deliver(&packet);
    assert!(h.connection.goaway_received());
    assert_eq!(h.visitor.borrow().go_aways, 1);
}

#[test]
fn test_unencrypted_stream_data_closes() {
    let mut h = Harness::new(Perspective::Server);
    let packets = h.peer.stream(b"plain", 0, FecProtection::MayNotFecProtect);
    h.deliver(&packets[0]);
    assert_eq!(h.closes(), vec![(ErrorCode::UnencryptedStreamData, false)]);
    assert!(h.visitor.borrow().stream_frames.is_empty());
}

#[test]
fn test_refuses_to_send_unencrypted_stream_data() {
    let mut h = Harness::new(Perspective::Client);
    let consumed = h.connection.send_stream_data(
        DATA_STREAM,
        b"secret",
        0,
        false,
        FecProtection::MayNotFecProtect,
    );
    assert_eq!(consumed, ConsumedData::new(0, false));
    assert_eq!(h.closes(), vec![(ErrorCode::UnencryptedStreamData, false)]);
}

#[test]
fn test_empty_stream_data_without_fin_is_rejected() {
    let mut h = Harness::new(Perspective::Client);
    let consumed =
        h.connection
            .send_stream_data(CRYPTO_STREAM_ID, b"", 0, false, FecProtection::MayNotFecProtect);
    assert_eq!(consumed, ConsumedData::new(0, false));
    assert_eq!(h.written(), 0);
    assert!(h.connection.connected());
}

#[test]
fn test_peer_port_rebinding_migrates() {
    let mut h = Harness::new(Perspective::Server);
    let packet = h.peer.ping();
    let rebound = SocketAddr::from(([127, 0, 0, 1], 5555));
    h.connection
        .process_udp_packet(self_address(), rebound, &packet);

    assert!(h.connection.connected());
    assert_eq!(h.connection.peer_address(), rebound);
    assert_eq!(
        h.visitor.borrow().migrations,
        vec![PeerAddressChangeType::NatPortRebinding]
    );
}

#[test]
fn test_non_nat_migration_rejected_when_disabled() {
    let mut h = Harness::new(Perspective::Server);
    let config = ConnectionConfig {
        disable_non_nat_address_migration: true,
        ..ConnectionConfig::default()
    };
    h.connection.set_from_config(&config);
    let packet = h.peer.ping();
    let moved = SocketAddr::from(([10, 1, 2, 3], 4433));
    h.connection.process_udp_packet(self_address(), moved, &packet);

    assert_eq!(h.closes(), vec![(ErrorCode::ErrorMigratingAddress, false)]);
    assert_eq!(h.connection.peer_address(), peer_address());
}

#[test]
fn test_self_address_change_closes() {
    let mut h = Harness::new(Perspective::Server);
    let packet = h.peer.ping();
    h.deliver(&packet);
    let packet = h.peer.ping();
    let other_self = SocketAddr::from(([127, 0, 0, 2], 443));
    h.connection
        .process_udp_packet(other_self, peer_address(), &packet);
    assert_eq!(h.closes(), vec![(ErrorCode::ErrorMigratingAddress, false)]);
}

#[test]
fn test_public_reset_closes_from_peer() {
    let mut h = Harness::new(Perspective::Client);
    let reset = Framer::build_public_reset_packet(&PublicResetPacket {
        public_header: PublicHeader {
            connection_id: CONNECTION_ID,
            reset_flag: true,
            ..PublicHeader::default()
        },
        nonce_proof: 1,
        rejected_packet_number: 1,
    });
    h.deliver(&reset);
    assert_eq!(h.closes(), vec![(ErrorCode::PublicReset, true)]);
}

#[test]
fn test_mtu_probe_is_padded_to_target() {
    let mut h = Harness::new(Perspective::Server);
    h.connection.set_mtu_discovery_target(1450);
    h.connection.on_alarm(AlarmKind::MtuDiscovery);

    assert_eq!(h.written(), 1);
    assert_eq!(h.writer.borrow().packets[0].len(), 1450);
    assert_eq!(h.connection.mtu_probe_count, 1);
    assert_eq!(h.connection.max_packet_length(), DEFAULT_SERVER_MAX_PACKET_SIZE);
}

#[test]
fn test_retransmission_alarm_armed_once_per_burst() {
    let mut h = Harness::new(Perspective::Server);
    {
        let mut scheduler = RetransmissionScheduler::new(&mut h.connection);
        scheduler.send_ping();
        scheduler.send_ping();
        assert!(!scheduler.is_alarm_set(AlarmKind::Retransmission));
        assert!(scheduler.pending_retransmission_alarm);
    }
    assert!(h.connection.is_alarm_set(AlarmKind::Retransmission));
    assert!(!h.connection.pending_retransmission_alarm);
    assert_eq!(h.written(), 2);
}

#[test]
fn test_bundler_batches_frames_into_one_packet() {
    let mut h = Harness::new(Perspective::Server);
    {
        let mut bundler = PacketBundler::new(&mut h.connection, AckBundling::NoAck);
        bundler.send_window_update(DATA_STREAM, 100);
        bundler.send_blocked(DATA_STREAM);
        bundler.send_ping();
        assert!(h.writer.borrow().packets.is_empty());
    }
    assert_eq!(h.written(), 1);
    h.sync_peer();
    assert_eq!(h.peer.sink.packets[0].len(), 3);
}

#[test]
fn test_debug_visitor_sees_sent_packets() {
    let mut h = Harness::new(Perspective::Server);
    let debug = Rc::new(RefCell::new(DebugState::default()));
    h.connection
        .set_debug_visitor(Box::new(RecordingDebugVisitor(debug.clone())));
    h.connection.send_ping();
    h.connection.send_ping();
    assert_eq!(debug.borrow().packets_sent, 2);
}

#[test]
fn test_stats_report_estimates() {
    let mut h = Harness::new(Perspective::Server);
    h.connection.send_ping();
    let stats = h.connection.stats();
    assert_eq!(stats.packets_sent, 1);
    assert!(stats.bytes_sent > 0);
    assert_eq!(stats.max_packet_size, DEFAULT_SERVER_MAX_PACKET_SIZE);
    assert!(!stats.srtt.is_zero());

    let packet = h.peer.ping();
    h.deliver(&packet);
    assert_eq!(h.connection.stats().bytes_processed, packet.len() as u64);
}

/// Send `count` pings and hand them to the peer.
fn send_pings(h: &mut Harness, count: usize) {
    for _ in 0..count {
        h.connection.send_ping();
    }
    h.sync_peer();
}

#[test]
fn test_ack_missing_above_largest_observed_closes() {
    let mut h = Harness::new(Perspective::Server);
    send_pings(&mut h, 3);

    let packet = h.peer.ack(AckFrame {
        largest_observed: 2,
        missing_packets: [3].into_iter().collect(),
        ..AckFrame::default()
    });
    h.deliver(&packet);
    assert_eq!(h.closes(), vec![(ErrorCode::InvalidAckData, false)]);
}

#[test]
fn test_ack_missing_below_least_awaited_closes() {
    let mut h = Harness::new(Perspective::Server);
    send_pings(&mut h, 3);
    let ack = h.peer.sink.received.ack_frame(Instant::now());
    let packet = h.peer.ack(ack);
    h.deliver(&packet);
    assert!(h.connection.connected());
    assert_eq!(h.connection.sent_packet_manager().least_packet_awaited_by_peer(), 4);

    send_pings(&mut h, 2);
    let packet = h.peer.ack(AckFrame {
        largest_observed: 5,
        missing_packets: [2].into_iter().collect(),
        ..AckFrame::default()
    });
    h.deliver(&packet);
    assert_eq!(h.closes(), vec![(ErrorCode::InvalidAckData, false)]);
}

#[test]
fn test_ack_with_wrong_entropy_closes() {
    let mut h = Harness::new(Perspective::Server);
    send_pings(&mut h, 3);
    let mut ack = h.peer.sink.received.ack_frame(Instant::now());
    ack.entropy_hash ^= 1;
    let packet = h.peer.ack(ack);
    h.deliver(&packet);
    assert_eq!(h.closes(), vec![(ErrorCode::InvalidAckData, false)]);
    assert!(h.connection.sent_packet_manager().has_unacked_packets());
}

fn stop_waiting_packet(peer: &mut Peer, least_unacked: PacketNumber) -> Vec<u8> {
    peer.generator
        .add_control_frame(Frame::StopWaiting(StopWaitingFrame {
            entropy_hash: 0,
            least_unacked,
        }))
        .unwrap();
    peer.take_single()
}

#[test]
fn test_decreasing_stop_waiting_closes() {
    let mut h = Harness::new(Perspective::Server);
    for _ in 0..2 {
        let packet = h.peer.ping();
        h.deliver(&packet);
    }
    let packet = stop_waiting_packet(&mut h.peer, 3);
    h.deliver(&packet);
    assert!(h.connection.connected());
    assert_eq!(h.connection.received_packet_manager().peer_least_packet_awaiting_ack(), 3);

    let packet = stop_waiting_packet(&mut h.peer, 2);
    h.deliver(&packet);
    assert_eq!(h.closes(), vec![(ErrorCode::InvalidStopWaitingData, false)]);
}

#[test]
fn test_stop_waiting_prunes_fec_groups() {
    let mut h = Harness::new(Perspective::Server);
    assert!(h.connection.fec_group(1).unwrap().update(EncryptionLevel::None, 1, b"old"));
    assert!(h.connection.fec_group(10).unwrap().update(EncryptionLevel::None, 10, b"new"));

    let packet = h.peer.ping();
    h.deliver(&packet);
    let packet = stop_waiting_packet(&mut h.peer, 2);
    h.deliver(&packet);

    assert!(h.connection.connected());
    let groups: Vec<FecGroupNumber> = h.connection.fec_groups.keys().copied().collect();
    assert_eq!(groups, vec![10]);
}

#[test]
fn test_packet_number_out_of_bounds_closes() {
    let mut h = Harness::new(Perspective::Server);
    h.connection.config.max_packet_gap = 2;
    let packet = h.peer.ping();
    h.deliver(&packet);
    for _ in 0..3 {
        h.peer.ping();
    }
    let packet = h.peer.ping();
    h.deliver(&packet);
    assert_eq!(h.closes(), vec![(ErrorCode::InvalidPacketHeader, false)]);
    assert_eq!(h.connection.received_packet_manager().largest_observed(), 1);
}

#[test]
fn test_overall_timeout_closes() {
    let mut h = Harness::new(Perspective::Server);
    h.connection
        .set_network_timeouts(Some(Duration::from_secs(2)), Duration::from_secs(10));
    let start = h.clock.now();
    assert_eq!(
        h.connection.alarm_deadline(AlarmKind::Timeout),
        Some(start + Duration::from_secs(2))
    );

    h.clock.advance(Duration::from_secs(2));
    h.connection.fire_expired_alarms();
    assert_eq!(h.closes(), vec![(ErrorCode::ConnectionOverallTimedOut, false)]);
}

#[test]
fn test_retransmission_alarm_resends_and_rearms() {
    let mut h = Harness::new(Perspective::Server);
    h.connection.send_ping();
    let first = h.connection.alarm_deadline(AlarmKind::Retransmission).unwrap();

    let now = h.clock.now();
    h.clock.advance(first - now);
    h.connection.fire_expired_alarms();

    assert_eq!(h.written(), 2);
    h.sync_peer();
    assert_eq!(h.peer.sink.packet_numbers, vec![1, 2]);
    assert!(matches!(h.peer.sink.packets[1][..], [Frame::Ping]));
    let next = h.connection.alarm_deadline(AlarmKind::Retransmission).unwrap();
    assert!(next > first);
}

#[test]
fn test_close_while_blocked_is_kept_as_termination_packet() {
    let mut h = Harness::new(Perspective::Server);
    h.writer.borrow_mut().blocked = true;
    h.connection
        .send_connection_close_with_details(ErrorCode::InternalError, "shutting down");

    assert_eq!(h.closes(), vec![(ErrorCode::InternalError, false)]);
    assert_eq!(h.connection.termination_packets().len(), 1);
    assert_eq!(h.written(), 0);
}

#[test]
fn test_queued_retransmission_of_acked_packet_is_discarded() {
    let mut h = Harness::new(Perspective::Server);
    send_pings(&mut h, 1);

    // The retransmission blocks the writer and waits in the queue.
    h.writer.borrow_mut().block_writes = true;
    h.connection
        .retransmit_unacked_packets(TransmissionType::AllUnackedRetransmission);
    assert_eq!(h.connection.num_queued_packets(), 1);

    let ack = h.peer.sink.received.ack_frame(Instant::now());
    let packet = h.peer.ack(ack);
    h.deliver(&packet);
    assert!(h.connection.connected());

    {
        let mut writer = h.writer.borrow_mut();
        writer.block_writes = false;
        writer.blocked = false;
    }
    h.connection.on_can_write();
    assert_eq!(h.connection.num_queued_packets(), 0);
    assert_eq!(h.written(), 1);
    assert_eq!(h.connection.stats().packets_discarded, 1);
}

#[test]
fn test_too_many_outstanding_sent_packets_closes() {
    let mut h = Harness::new(Perspective::Server);
    h.connection.config.max_tracked_packets = 2;
    for _ in 0..4 {
        h.connection.send_ping();
    }
    // The peer never gets packet 1.
    let written: Vec<Vec<u8>> = h.writer.borrow().packets.clone();
    for packet in &written[1..] {
        h.peer.receive(packet);
    }
    let ack = h.peer.sink.received.ack_frame(Instant::now());
    assert_eq!(ack.missing_packets.iter().copied().collect::<Vec<_>>(), vec![1]);
    let packet = h.peer.ack(ack);
    h.deliver(&packet);
    assert_eq!(
        h.closes(),
        vec![(ErrorCode::TooManyOutstandingSentPackets, false)]
    );
}

#[test]
fn test_too_many_outstanding_received_packets_closes() {
    let mut h = Harness::new(Perspective::Server);
    h.connection.config.max_tracked_packets = 2;
    let _lost = h.peer.ping();
    for _ in 0..3 {
        let packet = h.peer.ping();
        h.deliver(&packet);
    }
    assert_eq!(
        h.closes(),
        vec![(ErrorCode::TooManyOutstandingReceivedPackets, false)]
    );
}

#[test]
fn test_can_write_stream_data() {
    let mut h = Harness::new(Perspective::Client);
    assert!(h.connection.can_write_stream_data());

    h.writer.borrow_mut().blocked = true;
    assert!(!h.connection.can_write_stream_data());
    // Handshake data goes out regardless of the writer.
    h.visitor.borrow_mut().pending_handshake = true;
    assert!(h.connection.can_write_stream_data());

    {
        let mut writer = h.writer.borrow_mut();
        writer.blocked = false;
        writer.block_writes = true;
    }
    let hello = vec![0x5a; 100];
    h.connection.send_stream_data(
        CRYPTO_STREAM_ID,
        &hello,
        0,
        false,
        FecProtection::MayNotFecProtect,
    );
    assert_eq!(h.connection.num_queued_packets(), 1);
    assert!(!h.connection.can_write_stream_data());
}

#[test]
fn test_unauthenticated_packet_does_not_fix_self_address() {
    let mut h = Harness::new(Perspective::Server);
    let packet = h.peer.ping();
    let mut forged = packet.clone();
    let last = forged.len() - 1;
    forged[last] ^= 0xff;
    let other_self = SocketAddr::from(([127, 0, 0, 2], 443));
    h.connection
        .process_udp_packet(other_self, peer_address(), &forged);
    assert!(h.connection.self_address().is_none());

    h.deliver(&packet);
    assert!(h.connection.connected());
    assert_eq!(h.connection.self_address(), Some(self_address()));
    assert!(h.closes().is_empty());
}
