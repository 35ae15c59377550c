//! Outgoing packet assembly.
//!
//! The generator turns frames into sealed packets. Frames are gathered into
//! an open packet until it is full or the generator is flushed; in batch mode
//! flushing waits until the batch ends so that acks and control frames ride
//! along with stream data.
//!
//! ```text
//!  queue_ack ─┐
//!  add_control_frame ─┼─► open packet ─► seal ─► outbox ─► take_packets()
//!  consume_data ─┘             │
//!                              └─► FecEncoder ─► FEC packet (group full / alarm)
//! ```
//!
//! Packets are numbered when sealed, so the outbox is always in packet
//! number order.

use std::collections::VecDeque;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::trace;

use crate::crypto::{Encrypter, NullEncrypter};
use crate::error::{Error, Result};
use crate::fec::FecEncoder;
use crate::types::{
    packet_entropy_hash, ByteCount, ConnectionId, ConsumedData, EncryptionLevel, EntropyHash,
    FecGroupNumber, FecProtection, FecSendPolicy, IsHandshake, PacketNumber, Perspective, QuicVersion,
    StreamId, StreamOffset, MAX_PACKET_SIZE,
};
use crate::wire::frames::{
    ACK_FRAME_OVERHEAD, MAX_ACK_MISSING_PACKETS, STOP_WAITING_FRAME_SIZE, STREAM_FRAME_OVERHEAD,
};
use crate::wire::header::{private_header_size, public_header_size};
use crate::wire::{
    AckFrame, Frame, Framer, PacketHeader, PublicHeader, RetransmittableFrames, StopWaitingFrame,
    StreamFrame,
};

/// A sealed packet ready to be written.
#[derive(Debug, Clone)]
pub struct SerializedPacket {
    /// Packet number
    pub packet_number: PacketNumber,
    /// Wire bytes
    pub packet: Bytes,
    /// Level the packet was sealed at
    pub encryption_level: EncryptionLevel,
    /// Entropy bit of this packet
    pub entropy_hash: EntropyHash,
    /// Frames to resend if the packet is lost
    pub retransmittable_frames: Option<RetransmittableFrames>,
    /// Carries FEC redundancy
    pub is_fec_packet: bool,
    /// Group the packet belongs to
    pub fec_group: Option<FecGroupNumber>,
    /// Padded MTU probe
    pub is_mtu_probe: bool,
    /// Carries an ack frame
    pub has_ack: bool,
    /// Carries a stop waiting frame
    pub has_stop_waiting: bool,
}

impl SerializedPacket {
    /// A packet with no frames attached.
    pub fn new(packet_number: PacketNumber, encryption_level: EncryptionLevel, packet: Bytes) -> Self {
        Self {
            packet_number,
            packet,
            encryption_level,
            entropy_hash: 0,
            retransmittable_frames: None,
            is_fec_packet: false,
            fec_group: None,
            is_mtu_probe: false,
            has_ack: false,
            has_stop_waiting: false,
        }
    }

    /// Length on the wire.
    pub fn len(&self) -> usize {
        self.packet.len()
    }

    /// Whether the packet is empty.
    pub fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }

    /// Whether the frames include a connection close.
    pub fn has_connection_close(&self) -> bool {
        self.retransmittable_frames
            .as_ref()
            .is_some_and(RetransmittableFrames::has_connection_close)
    }
}

#[derive(Default)]
struct OpenPacket {
    frames: Vec<Frame>,
    retransmittable: Option<RetransmittableFrames>,
    bytes: usize,
    fec_protected: bool,
    has_ack: bool,
    has_stop_waiting: bool,
}

impl OpenPacket {
    fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Builds and seals outgoing packets.
pub struct PacketGenerator {
    connection_id: ConnectionId,
    perspective: Perspective,
    version: QuicVersion,
    send_version_in_packet: bool,
    max_packet_length: ByteCount,
    encryption_level: EncryptionLevel,
    encrypters: [Option<Box<dyn Encrypter>>; EncryptionLevel::COUNT],
    packet_number: PacketNumber,
    rng: StdRng,
    batch_mode: bool,
    pending_ack: Option<AckFrame>,
    pending_stop_waiting: Option<StopWaitingFrame>,
    queued_control_frames: Vec<Frame>,
    open: OpenPacket,
    fec_encoder: FecEncoder,
    fec_send_policy: FecSendPolicy,
    max_packets_per_fec_group: usize,
    outbox: VecDeque<SerializedPacket>,
}

impl PacketGenerator {
    /// Generator for `connection_id`, seeded from `rng`.
    ///
    /// Clients include the version in their packets until negotiation ends.
    pub fn new(
        connection_id: ConnectionId,
        perspective: Perspective,
        version: QuicVersion,
        max_packet_length: ByteCount,
        rng: &mut dyn RngCore,
    ) -> Self {
        Self {
            connection_id,
            perspective,
            version,
            send_version_in_packet: perspective == Perspective::Client,
            max_packet_length: max_packet_length.min(MAX_PACKET_SIZE),
            encryption_level: EncryptionLevel::None,
            encrypters: [Some(Box::new(NullEncrypter)), None, None],
            packet_number: 0,
            rng: StdRng::seed_from_u64(rng.next_u64()),
            batch_mode: false,
            pending_ack: None,
            pending_stop_waiting: None,
            queued_control_frames: Vec::new(),
            open: OpenPacket::default(),
            fec_encoder: FecEncoder::new(),
            fec_send_policy: FecSendPolicy::AnyTrigger,
            max_packets_per_fec_group: 10,
            outbox: VecDeque::new(),
        }
    }

    /// Install the encrypter for `level`.
    pub fn set_encrypter(&mut self, level: EncryptionLevel, encrypter: Box<dyn Encrypter>) {
        self.encrypters[level.index()] = Some(encrypter);
    }

    /// Whether an encrypter is installed for `level`.
    pub fn has_encrypter(&self, level: EncryptionLevel) -> bool {
        self.encrypters[level.index()].is_some()
    }

    /// Level new packets are sealed at.
    pub fn encryption_level(&self) -> EncryptionLevel {
        self.encryption_level
    }

    /// Change the level new packets are sealed at.
    pub fn set_encryption_level(&mut self, level: EncryptionLevel) {
        self.encryption_level = level;
    }

    /// Version written into client packets.
    pub fn version(&self) -> QuicVersion {
        self.version
    }

    /// Change the version.
    pub fn set_version(&mut self, version: QuicVersion) {
        self.version = version;
    }

    /// Whether packets carry the version.
    pub fn send_version_in_packet(&self) -> bool {
        self.send_version_in_packet
    }

    /// Stop (or resume) sending the version.
    pub fn set_send_version_in_packet(&mut self, send: bool) {
        self.send_version_in_packet = send && self.perspective == Perspective::Client;
    }

    /// Largest packet built.
    pub fn max_packet_length(&self) -> ByteCount {
        self.max_packet_length
    }

    /// Change the largest packet built.
    pub fn set_max_packet_length(&mut self, length: ByteCount) {
        self.max_packet_length = length.min(MAX_PACKET_SIZE);
    }

    /// Number of the last sealed packet.
    pub fn packet_number(&self) -> PacketNumber {
        self.packet_number
    }

    /// Configure outgoing FEC groups.
    pub fn set_fec_policy(&mut self, policy: FecSendPolicy, max_packets_per_group: usize) {
        self.fec_send_policy = policy;
        self.max_packets_per_fec_group = max_packets_per_group.max(1);
    }

    /// Whether an FEC group is open.
    pub fn fec_group_open(&self) -> bool {
        self.fec_encoder.is_open()
    }

    /// Protected packets sealed in the open group.
    pub fn packets_in_fec_group(&self) -> usize {
        self.fec_encoder.num_packets()
    }

    /// Defer flushing until [`finish_batch_operations`](Self::finish_batch_operations).
    pub fn start_batch_operations(&mut self) {
        self.batch_mode = true;
    }

    /// End batch mode. Queued frames stay queued until the next [`flush`](Self::flush),
    /// so the caller can hold them back while it cannot write.
    pub fn finish_batch_operations(&mut self) {
        self.batch_mode = false;
    }

    /// Whether flushing is deferred.
    pub fn in_batch_mode(&self) -> bool {
        self.batch_mode
    }

    /// Whether frames are waiting to be sealed.
    pub fn has_queued_frames(&self) -> bool {
        !self.open.is_empty()
            || self.pending_ack.is_some()
            || self.pending_stop_waiting.is_some()
            || !self.queued_control_frames.is_empty()
    }

    /// Whether an ack is waiting to be sent.
    pub fn has_pending_ack(&self) -> bool {
        self.pending_ack.is_some()
    }

    /// Whether queued frames include any that must be retransmitted on loss.
    pub fn has_queued_retransmittable_frames(&self) -> bool {
        self.open.retransmittable.is_some() || !self.queued_control_frames.is_empty()
    }

    /// Whether the open packet carries crypto stream data.
    pub fn has_queued_handshake_frames(&self) -> bool {
        self.open
            .retransmittable
            .as_ref()
            .is_some_and(|f| f.has_crypto_handshake() == IsHandshake::Yes)
    }

    /// Number of the open FEC group.
    pub fn fec_group_number(&self) -> Option<FecGroupNumber> {
        self.fec_encoder.group_number()
    }

    /// Most missing packets an ack can report and still fit in a packet
    /// next to a stop waiting frame.
    pub fn max_ack_missing_packets(&self) -> usize {
        let space = self.frame_space(self.encryption_level, false).unwrap_or(0);
        let available = space.saturating_sub(ACK_FRAME_OVERHEAD + STOP_WAITING_FRAME_SIZE);
        (available / 8).min(MAX_ACK_MISSING_PACKETS)
    }

    /// Queue an ack, and optionally a stop waiting frame, for the next packet.
    /// Replaces any ack queued earlier.
    pub fn queue_ack(&mut self, ack: AckFrame, stop_waiting: Option<StopWaitingFrame>) -> Result<()> {
        self.pending_ack = Some(ack);
        if stop_waiting.is_some() {
            self.pending_stop_waiting = stop_waiting;
        }
        if self.batch_mode {
            return Ok(());
        }
        self.flush()
    }

    /// Queue a control frame.
    pub fn add_control_frame(&mut self, frame: Frame) -> Result<()> {
        self.queued_control_frames.push(frame);
        if self.batch_mode {
            return Ok(());
        }
        self.flush()
    }

    /// Split `data` into stream frames and seal them.
    ///
    /// Everything offered is consumed; the caller checks congestion first.
    pub fn consume_data(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        offset: StreamOffset,
        fin: bool,
        fec_protection: FecProtection,
    ) -> Result<ConsumedData> {
        debug_assert!(!data.is_empty() || fin, "empty write without fin");
        let protect = fec_protection == FecProtection::MustFecProtect
            && self.encryption_level > EncryptionLevel::None;
        self.add_pending_frames()?;
        if !self.open.is_empty() && self.open.fec_protected != protect {
            self.seal_open_packet()?;
        }
        self.open.fec_protected = protect;

        let mut consumed = 0;
        loop {
            let space = self.frame_space(self.encryption_level, protect)?;
            let mut available = space.saturating_sub(self.open.bytes);
            if available <= STREAM_FRAME_OVERHEAD {
                self.seal_open_packet()?;
                self.open.fec_protected = protect;
                available = space;
            }
            let remaining = data.len() - consumed;
            let chunk = remaining.min(available - STREAM_FRAME_OVERHEAD);
            let last = consumed + chunk == data.len();
            let frame = StreamFrame::new(
                stream_id,
                fin && last,
                offset + consumed as u64,
                Bytes::copy_from_slice(&data[consumed..consumed + chunk]),
            );
            self.push_frame(Frame::Stream(frame));
            consumed += chunk;
            if last {
                break;
            }
            self.seal_open_packet()?;
            self.open.fec_protected = protect;
        }

        if !self.batch_mode {
            self.seal_open_packet()?;
        }
        Ok(ConsumedData::new(consumed, fin))
    }

    /// Seal everything queued.
    pub fn flush(&mut self) -> Result<()> {
        self.add_pending_frames()?;
        self.seal_open_packet()
    }

    /// Seal the frames of a lost packet under a fresh packet number, at
    /// their original encryption level and without FEC.
    pub fn reserialize_all_frames(&mut self, frames: &RetransmittableFrames) -> Result<SerializedPacket> {
        self.flush()?;
        let level = frames.encryption_level();
        let payload: Vec<Frame> = frames.frames().to_vec();
        let mut retransmittable = RetransmittableFrames::new(level);
        for frame in &payload {
            retransmittable.add_frame(frame.clone());
        }
        let mut packet = self.seal(level, &payload, false)?;
        packet.retransmittable_frames = Some(retransmittable);
        Ok(packet)
    }

    /// Build a ping padded out to `target_length` bytes.
    pub fn generate_mtu_discovery_packet(&mut self, target_length: ByteCount) -> Result<()> {
        self.flush()?;
        let level = self.encryption_level;
        let current = std::mem::replace(&mut self.max_packet_length, target_length.min(MAX_PACKET_SIZE));
        let result = match self.frame_space(level, false) {
            Ok(space) => {
                let frames = [Frame::MtuDiscovery, Frame::Padding(space.saturating_sub(1))];
                self.seal(level, &frames, false)
            }
            Err(e) => Err(e),
        };
        self.max_packet_length = current;
        let mut packet = result?;
        packet.is_mtu_probe = true;
        self.outbox.push_back(packet);
        Ok(())
    }

    /// Close the open FEC group. With `force` the redundancy is always
    /// emitted; otherwise the group closes only once full.
    ///
    /// Returns whether an FEC packet was sealed.
    pub fn maybe_send_fec_packet(&mut self, force: bool) -> Result<bool> {
        if !self.fec_encoder.is_open() {
            return Ok(false);
        }
        if !self.open.is_empty() && self.open.fec_protected {
            self.seal_open_packet()?;
        }
        let full = self.fec_encoder.num_packets() >= self.max_packets_per_fec_group;
        if !force && !full {
            return Ok(false);
        }
        if !force && self.fec_send_policy == FecSendPolicy::AlarmTrigger {
            trace!("resetting full FEC group");
            self.fec_encoder.reset();
            return Ok(false);
        }
        let Some((group, redundancy)) = self.fec_encoder.finish() else {
            return Ok(false);
        };
        let packet_number = self.packet_number + 1;
        let header = self.header(packet_number, false, Some(group), true);
        let (public, body) = Framer::build_fec_packet(&header, &redundancy);
        let mut packet = self.encrypt(header, self.encryption_level, &public, &body)?;
        packet.is_fec_packet = true;
        packet.fec_group = Some(group);
        trace!("sealed FEC packet {} for group {}", packet_number, group);
        self.outbox.push_back(packet);
        Ok(true)
    }

    /// Drop the open FEC group without emitting redundancy.
    pub fn reset_fec_group(&mut self) {
        self.fec_encoder.reset();
    }

    /// Take the sealed packets, lowest number first.
    pub fn take_packets(&mut self) -> Vec<SerializedPacket> {
        self.outbox.drain(..).collect()
    }

    /// Discard queued frames and sealed packets.
    pub fn discard_pending(&mut self) {
        self.open = OpenPacket::default();
        self.pending_ack = None;
        self.pending_stop_waiting = None;
        self.queued_control_frames.clear();
        self.outbox.clear();
    }

    fn frame_space(&self, level: EncryptionLevel, fec_protected: bool) -> Result<usize> {
        let encrypter = self.encrypters[level.index()]
            .as_ref()
            .ok_or(Error::MissingEncrypter(level))?;
        let header = public_header_size(self.send_version_in_packet);
        let sealed = (self.max_packet_length as usize).saturating_sub(header);
        Ok(encrypter
            .max_plaintext_size(sealed)
            .saturating_sub(private_header_size(fec_protected)))
    }

    fn add_pending_frames(&mut self) -> Result<()> {
        if let Some(ack) = self.pending_ack.take() {
            self.add_frame(Frame::Ack(ack))?;
            self.open.has_ack = true;
        }
        if let Some(stop_waiting) = self.pending_stop_waiting.take() {
            self.add_frame(Frame::StopWaiting(stop_waiting))?;
            self.open.has_stop_waiting = true;
        }
        for frame in std::mem::take(&mut self.queued_control_frames) {
            self.add_frame(frame)?;
        }
        Ok(())
    }

    fn add_frame(&mut self, frame: Frame) -> Result<()> {
        let space = self.frame_space(self.encryption_level, self.open.fec_protected)?;
        if self.open.bytes + frame.encoded_len() > space {
            self.seal_open_packet()?;
        }
        self.push_frame(frame);
        Ok(())
    }

    fn push_frame(&mut self, frame: Frame) {
        let level = self.encryption_level;
        self.open.bytes += frame.encoded_len();
        if frame.is_retransmittable() {
            self.open
                .retransmittable
                .get_or_insert_with(|| RetransmittableFrames::new(level))
                .add_frame(frame.clone());
        }
        self.open.frames.push(frame);
    }

    fn seal_open_packet(&mut self) -> Result<()> {
        if self.open.is_empty() {
            return Ok(());
        }
        let open = std::mem::take(&mut self.open);
        let mut packet = self.seal(self.encryption_level, &open.frames, open.fec_protected)?;
        packet.retransmittable_frames = open.retransmittable;
        packet.has_ack = open.has_ack;
        packet.has_stop_waiting = open.has_stop_waiting;
        self.outbox.push_back(packet);
        if open.fec_protected {
            self.maybe_send_fec_packet(false)?;
        }
        Ok(())
    }

    fn seal(&mut self, level: EncryptionLevel, frames: &[Frame], fec_protected: bool) -> Result<SerializedPacket> {
        let packet_number = self.packet_number + 1;
        let fec_group = if fec_protected {
            self.fec_encoder.open(packet_number);
            self.fec_encoder.group_number()
        } else {
            None
        };
        let entropy_flag = self.rng.gen::<bool>();
        let header = self.header(packet_number, entropy_flag, fec_group, false);
        let (public, body) = Framer::build_data_packet(&header, frames)?;
        if fec_protected {
            self.fec_encoder.add_packet(&body[private_header_size(true)..]);
        }
        let mut packet = self.encrypt(header, level, &public, &body)?;
        packet.fec_group = fec_group;
        Ok(packet)
    }

    fn header(
        &self,
        packet_number: PacketNumber,
        entropy_flag: bool,
        fec_group: Option<FecGroupNumber>,
        fec_flag: bool,
    ) -> PacketHeader {
        PacketHeader {
            public_header: PublicHeader {
                connection_id: self.connection_id,
                reset_flag: false,
                version_flag: self.send_version_in_packet,
                versions: if self.send_version_in_packet {
                    vec![self.version]
                } else {
                    Vec::new()
                },
            },
            packet_number,
            entropy_flag,
            entropy_hash: packet_entropy_hash(entropy_flag, packet_number),
            fec_flag,
            is_in_fec_group: fec_group.is_some(),
            fec_group: fec_group.unwrap_or(0),
        }
    }

    fn encrypt(
        &mut self,
        header: PacketHeader,
        level: EncryptionLevel,
        public: &[u8],
        body: &[u8],
    ) -> Result<SerializedPacket> {
        let encrypter = self.encrypters[level.index()]
            .as_ref()
            .ok_or(Error::MissingEncrypter(level))?;
        let sealed = encrypter.encrypt_packet(header.packet_number, public, body)?;
        let mut wire = Vec::with_capacity(public.len() + sealed.len());
        wire.extend_from_slice(public);
        wire.extend_from_slice(&sealed);
        self.packet_number = header.packet_number;

        let mut packet = SerializedPacket::new(header.packet_number, level, Bytes::from(wire));
        packet.entropy_hash = header.entropy_hash;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AeadEncrypter, AeadKey, KEY_SIZE};
    use crate::types::{DEFAULT_MAX_PACKET_SIZE, QuicVersion};

    fn generator() -> PacketGenerator {
        let mut rng = StdRng::seed_from_u64(1);
        PacketGenerator::new(
            42,
            Perspective::Server,
            QuicVersion::V30,
            DEFAULT_MAX_PACKET_SIZE,
            &mut rng,
        )
    }

    fn forward_secure(generator: &mut PacketGenerator) {
        let key = AeadKey::from_bytes([3u8; KEY_SIZE]);
        generator.set_encrypter(
            EncryptionLevel::ForwardSecure,
            Box::new(AeadEncrypter::new(&key, [0, 0, 0, 1])),
        );
        generator.set_encryption_level(EncryptionLevel::ForwardSecure);
    }

    #[test]
    fn test_consume_data_splits_into_packets() {
        let mut generator = generator();
        let data = vec![7u8; 3000];
        let consumed = generator
            .consume_data(5, &data, 0, true, FecProtection::MayNotFecProtect)
            .unwrap();
        assert_eq!(consumed, ConsumedData::new(3000, true));

        let packets = generator.take_packets();
        assert_eq!(packets.len(), 3);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet.packet_number, i as u64 + 1);
            assert!(packet.len() as u64 <= DEFAULT_MAX_PACKET_SIZE);
            assert!(packet.retransmittable_frames.is_some());
        }
        match &packets[2].retransmittable_frames.as_ref().unwrap().frames()[0] {
            Frame::Stream(frame) => assert!(frame.fin),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_batch_mode_bundles_ack_with_data() {
        let mut generator = generator();
        generator.start_batch_operations();
        generator
            .queue_ack(
                AckFrame {
                    largest_observed: 3,
                    ..AckFrame::default()
                },
                Some(StopWaitingFrame {
                    entropy_hash: 0,
                    least_unacked: 1,
                }),
            )
            .unwrap();
        generator
            .consume_data(5, b"hello", 0, false, FecProtection::MayNotFecProtect)
            .unwrap();
        assert!(generator.take_packets().is_empty());
        assert!(generator.has_queued_retransmittable_frames());

        generator.finish_batch_operations();
        assert!(generator.take_packets().is_empty());
        generator.flush().unwrap();
        let packets = generator.take_packets();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].has_ack);
        assert!(packets[0].has_stop_waiting);
        assert_eq!(packets[0].retransmittable_frames.as_ref().unwrap().frames().len(), 1);
    }

    #[test]
    fn test_ack_only_packet_is_not_retransmittable() {
        let mut generator = generator();
        generator.queue_ack(AckFrame::default(), None).unwrap();
        let packets = generator.take_packets();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].retransmittable_frames.is_none());
    }

    #[test]
    fn test_fec_group_closes_when_full() {
        let mut generator = generator();
        forward_secure(&mut generator);
        generator.set_fec_policy(FecSendPolicy::AnyTrigger, 2);

        generator
            .consume_data(5, b"one", 0, false, FecProtection::MustFecProtect)
            .unwrap();
        assert!(generator.fec_group_open());
        generator
            .consume_data(5, b"two", 3, false, FecProtection::MustFecProtect)
            .unwrap();
        assert!(!generator.fec_group_open());

        let packets = generator.take_packets();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].fec_group, Some(1));
        assert!(packets[2].is_fec_packet);
        assert_eq!(packets[2].fec_group, Some(1));
        assert!(packets[2].retransmittable_frames.is_none());
    }

    #[test]
    fn test_alarm_trigger_policy_resets_full_group() {
        let mut generator = generator();
        forward_secure(&mut generator);
        generator.set_fec_policy(FecSendPolicy::AlarmTrigger, 1);
        generator
            .consume_data(5, b"one", 0, false, FecProtection::MustFecProtect)
            .unwrap();
        assert!(!generator.fec_group_open());
        assert_eq!(generator.take_packets().len(), 1);

        generator.set_fec_policy(FecSendPolicy::AlarmTrigger, 10);
        generator
            .consume_data(5, b"two", 3, false, FecProtection::MustFecProtect)
            .unwrap();
        assert!(generator.fec_group_open());
        assert!(generator.maybe_send_fec_packet(true).unwrap());
        let packets = generator.take_packets();
        assert_eq!(packets.len(), 2);
        assert!(packets[1].is_fec_packet);
    }

    #[test]
    fn test_unencrypted_data_is_never_fec_protected() {
        let mut generator = generator();
        generator
            .consume_data(5, b"one", 0, false, FecProtection::MustFecProtect)
            .unwrap();
        assert!(!generator.fec_group_open());
        assert_eq!(generator.take_packets()[0].fec_group, None);
    }

    #[test]
    fn test_reserialize_keeps_original_level() {
        let mut generator = generator();
        generator
            .consume_data(5, b"hello", 0, false, FecProtection::MayNotFecProtect)
            .unwrap();
        let original = generator.take_packets().remove(0);
        forward_secure(&mut generator);

        let frames = original.retransmittable_frames.unwrap();
        let packet = generator.reserialize_all_frames(&frames).unwrap();
        assert_eq!(packet.packet_number, 2);
        assert_eq!(packet.encryption_level, EncryptionLevel::None);
        assert_eq!(packet.retransmittable_frames.unwrap(), frames);
    }

    #[test]
    fn test_mtu_probe_is_padded_to_target() {
        let mut generator = generator();
        generator.generate_mtu_discovery_packet(1430).unwrap();
        let packet = generator.take_packets().remove(0);
        assert!(packet.is_mtu_probe);
        assert_eq!(packet.len(), 1430);
        assert!(packet.retransmittable_frames.is_none());
        assert_eq!(generator.max_packet_length(), DEFAULT_MAX_PACKET_SIZE);
    }

    #[test]
    fn test_missing_encrypter() {
        let mut generator = generator();
        generator.set_encryption_level(EncryptionLevel::Initial);
        let err = generator.add_control_frame(Frame::Ping).unwrap_err();
        assert!(matches!(err, Error::MissingEncrypter(EncryptionLevel::Initial)));
    }

    #[test]
    fn test_client_sends_version_until_told_otherwise() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut generator = PacketGenerator::new(
            9,
            Perspective::Client,
            QuicVersion::V29,
            DEFAULT_MAX_PACKET_SIZE,
            &mut rng,
        );
        generator.add_control_frame(Frame::Ping).unwrap();
        let with_version = generator.take_packets().remove(0);
        assert_eq!(&with_version.packet[9..13], b"Q029");

        generator.set_send_version_in_packet(false);
        generator.add_control_frame(Frame::Ping).unwrap();
        let without = generator.take_packets().remove(0);
        assert_eq!(without.len() + 4, with_version.len());
    }
}
