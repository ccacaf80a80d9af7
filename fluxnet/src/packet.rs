//! `Packet`: a growable byte buffer with an independent read cursor, and
//! `ProtocolPacket`: the header-aware wrapper around it that the rest of the
//! transport reads and writes (spec.md §3 Packet/ProtocolPacket, §4.1).
//!
//! The teacher's `net::frame` module parses headers directly out of byte
//! slices with `byteorder::ReadBytesExt`/`WriteBytesExt` rather than going
//! through a generic `Serialize` trait; `Packet` keeps that same manual,
//! cursor-based style instead of reaching for a streaming `Buffer`/`Chunk`
//! pool, since a `ProtocolPacket` is always one in-memory datagram rather
//! than an open-ended byte stream.

use byteorder::{BigEndian, ByteOrder};

use crate::compressor::Compressor;
use crate::error::{FragmentError, PacketError};
use crate::header::{self, Flags, HeaderView, HEADER_SIZE};
use crate::identity::Identity;

/// A growable byte buffer with append operations at the tail and sequential
/// reads from an internal cursor. Mirrors the teacher's manual
/// read/deserialize style (`Header::deserialize`) but generalized into a
/// reusable type instead of one-off free functions per struct.
///
/// A failed read (short buffer, as opposed to a logic bug) clears `valid`
/// rather than panicking; callers check [`Packet::is_valid`] once after a
/// batch of reads (spec.md §4.1 "a malformed read invalidates the packet").
#[derive(Debug, Clone, Default)]
pub struct Packet {
    data: Vec<u8>,
    cursor: usize,
    valid: bool,
}

impl Packet {
    pub fn new() -> Packet {
        Packet {
            data: Vec::new(),
            cursor: 0,
            valid: true,
        }
    }

    pub fn with_capacity(capacity: usize) -> Packet {
        Packet {
            data: Vec::with_capacity(capacity),
            cursor: 0,
            valid: true,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Packet {
        Packet {
            data,
            cursor: 0,
            valid: true,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.cursor)
    }

    /// Appends raw bytes at the tail.
    pub fn append(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn pack_u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    pub fn pack_u16(&mut self, value: u16) -> &mut Self {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.append(&buf)
    }

    pub fn pack_u32(&mut self, value: u32) -> &mut Self {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.append(&buf)
    }

    /// Overwrites `HEADER_SIZE..HEADER_SIZE+bytes.len()` in place, used to
    /// stamp the fragment-meta block right after the header (spec.md §6.3).
    pub fn pack_at(&mut self, offset: usize, bytes: &[u8]) -> &mut Self {
        if self.data.len() < offset + bytes.len() {
            self.data.resize(offset + bytes.len(), 0);
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// Drops `count` bytes from the tail, used to undo an over-large
    /// append (spec.md §4.1 `shrink`).
    pub fn shrink(&mut self, count: usize) {
        let new_len = self.data.len().saturating_sub(count);
        self.data.truncate(new_len);
        if self.cursor > new_len {
            self.cursor = new_len;
        }
    }

    fn take(&mut self, count: usize) -> Option<&[u8]> {
        if !self.valid || self.remaining() < count {
            self.valid = false;
            return None;
        }
        let slice = &self.data[self.cursor..self.cursor + count];
        self.cursor += count;
        Some(slice)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.take(2).map(BigEndian::read_u16)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.take(4).map(BigEndian::read_u32)
    }

    pub fn read_exact(&mut self, count: usize) -> Option<&[u8]> {
        self.take(count)
    }

    /// Remaining unread bytes, without consuming the cursor.
    pub fn peek_remaining(&self) -> &[u8] {
        &self.data[self.cursor.min(self.data.len())..]
    }

    pub fn skip(&mut self, count: usize) {
        self.cursor = (self.cursor + count).min(self.data.len());
    }
}

/// Pending header options that get serialized right before the packet goes
/// out (spec.md §4.1 `applyOptions`): the per-peer correction-latency value
/// and the piggy-backed return-packet timestamp. Both are optional because
/// not every packet carries them.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingOptions {
    pub correction_latency: Option<u16>,
    pub timestamp: Option<u16>,
}

/// A single reliable-transport packet: header fields plus payload, with the
/// bookkeeping flags the engine needs while the packet is in flight
/// (spec.md §3 ProtocolPacket).
#[derive(Debug, Clone)]
pub struct ProtocolPacket {
    packet: Packet,
    header: HeaderView,
    pending_options: PendingOptions,
    /// Wall-clock receipt time in milliseconds (16-bit, spec.md §9), set on
    /// reception only.
    pub timestamp: u16,
    /// Set once this packet has passed through the reorderer out of its
    /// natural order (spec.md §4.3).
    pub locally_reordered: bool,
    /// Set once this packet has been placed in the retransmit cache
    /// (spec.md §4.5).
    pub cached: bool,
    /// Set by `mark_for_encryption`; consulted by the DTLS collaborator
    /// before the datagram is handed to the socket (spec.md §9.7).
    pub marked_for_encryption: bool,
    /// Peer that sent this packet; `Identity::none()` for locally built
    /// outbound packets that haven't been addressed yet.
    pub peer: Identity,
}

impl ProtocolPacket {
    /// Builds a fresh outbound packet with the given internal/application
    /// identifier, realm and counter, and an empty payload.
    pub fn new(identifier: u16, realm: u8, counter: u16) -> ProtocolPacket {
        let header = HeaderView {
            identifier,
            flags: Flags::empty(),
            realm,
            counter,
            reordered_counter: counter,
        };
        let mut packet = Packet::with_capacity(HEADER_SIZE + 32);
        packet.append(&[0u8; HEADER_SIZE]);
        ProtocolPacket {
            packet,
            header,
            pending_options: PendingOptions::default(),
            timestamp: 0,
            locally_reordered: false,
            cached: false,
            marked_for_encryption: false,
            peer: Identity::none(),
        }
    }

    /// Rebuilds a packet from an already-parsed header plus payload bytes,
    /// bypassing wire parsing entirely. Used by
    /// [`crate::fragment::Defragmenter::retrieve`] once a fragment group's
    /// carriers have been concatenated and the embedded source header
    /// parsed back out.
    pub(crate) fn from_header(header: HeaderView, payload: &[u8], peer: Identity, timestamp: u16) -> ProtocolPacket {
        let mut packet = Packet::with_capacity(HEADER_SIZE + payload.len());
        packet.append(&[0u8; HEADER_SIZE]);
        packet.append(payload);
        packet.skip(HEADER_SIZE);
        ProtocolPacket {
            packet,
            header,
            pending_options: PendingOptions::default(),
            timestamp,
            locally_reordered: false,
            cached: false,
            marked_for_encryption: false,
            peer,
        }
    }

    /// Parses a received datagram: header plus whatever payload follows.
    /// The read cursor is left positioned right after the header so callers
    /// read the application payload with `read_*`/`payload`.
    pub fn from_received(data: &[u8], peer: Identity, timestamp: u16) -> Result<ProtocolPacket, PacketError> {
        let header = HeaderView::parse(data).ok_or(PacketError::Truncated)?;
        let mut packet = Packet::from_vec(data.to_vec());
        packet.skip(HEADER_SIZE);
        Ok(ProtocolPacket {
            packet,
            header,
            pending_options: PendingOptions::default(),
            timestamp,
            locally_reordered: false,
            cached: false,
            marked_for_encryption: false,
            peer,
        })
    }

    #[inline]
    pub fn retrieve_identifier(&self) -> u16 {
        self.header.identifier
    }

    #[inline]
    pub fn retrieve_flags(&self) -> Flags {
        self.header.flags
    }

    #[inline]
    pub fn retrieve_realm(&self) -> u8 {
        self.header.realm
    }

    #[inline]
    pub fn retrieve_counter(&self) -> u16 {
        self.header.counter
    }

    #[inline]
    pub fn retrieve_reordered_counter(&self) -> u16 {
        self.header.reordered_counter
    }

    pub fn set_reordered_counter(&mut self, value: u16) {
        self.header.reordered_counter = value;
    }

    pub fn set_realm(&mut self, realm: u8) {
        self.header.realm = realm;
    }

    pub fn set_counter(&mut self, counter: u16) {
        self.header.counter = counter;
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.packet.is_valid()
    }

    /// Payload bytes after the header (and after any pending-options block
    /// that a received packet already has baked in).
    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.packet.peek_remaining()
    }

    pub fn append_payload(&mut self, bytes: &[u8]) -> &mut Self {
        self.packet.append(bytes);
        self
    }

    fn add_flags(&mut self, flags: Flags) -> &mut Self {
        self.header.flags.insert(flags);
        self
    }

    pub fn do_not_discard(&mut self) -> &mut Self {
        self.add_flags(Flags::DO_NOT_DISCARD)
    }

    pub fn do_not_reorder(&mut self) -> &mut Self {
        self.add_flags(Flags::DO_NOT_REORDER)
    }

    pub fn do_not_fragment(&mut self) -> &mut Self {
        self.add_flags(Flags::DO_NOT_FRAGMENT)
    }

    pub fn mark_for_encryption(&mut self) -> &mut Self {
        self.marked_for_encryption = true;
        self
    }

    pub fn mark_as_cached(&mut self) -> &mut Self {
        self.cached = true;
        self
    }

    pub fn mark_as_locally_reordered(&mut self) -> &mut Self {
        self.locally_reordered = true;
        self
    }

    pub fn is_marked_for_encryption(&self) -> bool {
        self.marked_for_encryption
    }

    pub fn set_correction_latency(&mut self, latency_ms: u16) -> &mut Self {
        self.pending_options.correction_latency = Some(latency_ms);
        self
    }

    pub fn set_return_timestamp(&mut self, timestamp: u16) -> &mut Self {
        self.pending_options.timestamp = Some(timestamp);
        self
    }

    /// Bakes the pending options into the payload prefix and writes the
    /// final header, producing the bytes ready for the socket collaborator
    /// (spec.md §4.1 `applyOptions`). `have_client` mirrors the original's
    /// requirement that a correction-latency option only makes sense once a
    /// `Client` exists for the peer.
    pub fn apply_options(&mut self, have_client: bool) -> Result<(), PacketError> {
        if self.pending_options.correction_latency.is_some() && !have_client {
            return Err(PacketError::MissingClient);
        }
        if let Some(latency) = self.pending_options.correction_latency {
            self.packet.pack_u16(latency);
        }
        if let Some(ts) = self.pending_options.timestamp {
            self.packet.pack_u16(ts);
        }
        self.header.write(&mut self.packet.data_mut()[..HEADER_SIZE]);
        Ok(())
    }

    /// Full wire bytes (header + payload), valid only after `apply_options`
    /// for outbound packets, or always for received ones.
    pub fn as_wire_bytes(&self) -> &[u8] {
        self.packet.as_slice()
    }

    /// Compresses the payload in place with the given collaborator and sets
    /// the `COMPRESSED` flag (spec.md §4.1 `compress`).
    pub fn compress(&mut self, compressor: &dyn Compressor) -> Result<(), PacketError> {
        let compressed = compressor
            .compress(self.payload())
            .map_err(|_| PacketError::Compression)?;
        let header_len = self.packet.cursor.min(HEADER_SIZE);
        let mut rebuilt = Vec::with_capacity(header_len + compressed.len());
        rebuilt.extend_from_slice(&self.packet.data[..header_len]);
        rebuilt.extend_from_slice(&compressed);
        self.packet = Packet::from_vec(rebuilt);
        self.packet.skip(header_len);
        self.add_flags(Flags::COMPRESSED);
        Ok(())
    }

    /// Reverses [`ProtocolPacket::compress`]. Fails if the `COMPRESSED`
    /// flag isn't set or the collaborator rejects the payload.
    pub fn decompress(&mut self, compressor: &dyn Compressor) -> Result<(), PacketError> {
        if !self.header.flags.contains(Flags::COMPRESSED) {
            return Ok(());
        }
        let decompressed = compressor
            .decompress(self.payload())
            .map_err(|_| PacketError::Compression)?;
        let header_len = self.packet.cursor.min(HEADER_SIZE);
        let mut rebuilt = Vec::with_capacity(header_len + decompressed.len());
        rebuilt.extend_from_slice(&self.packet.data[..header_len]);
        rebuilt.extend_from_slice(&decompressed);
        self.packet = Packet::from_vec(rebuilt);
        self.packet.skip(header_len);
        self.header.flags.remove(Flags::COMPRESSED);
        Ok(())
    }

    /// Splits an oversized packet into MTU-sized fragment carriers (spec.md
    /// §4.1 `fragment`, §6.3 fragment meta), grounded in the original's
    /// `ProtocolPacket::fragment` (`C_protocol.cpp`): the carriers slice the
    /// *whole* source packet, header included, not just its payload, so the
    /// receiving side's defragmenter can restore the original
    /// identifier/flags/realm/counter/reordered-counter once every carrier
    /// has arrived rather than losing them.
    ///
    /// The carrier's own `realm` byte holds the *low 8 bits* of this
    /// packet's 16-bit counter as the fragment-group id (see DESIGN.md "Open
    /// Question Resolutions" for why this truncates instead of widening the
    /// wire header); the carrier's `counter` holds the fragment index. This
    /// is unrelated to the source header embedded in the carrier payloads.
    pub fn fragment(&self, mtu: u16) -> Result<Vec<ProtocolPacket>, FragmentError> {
        const FRAGMENT_META_SIZE: usize = 2; // u16 fragment_total
        let usable_mtu = mtu as usize;
        if usable_mtu <= HEADER_SIZE + FRAGMENT_META_SIZE {
            return Err(FragmentError::MtuTooSmall);
        }
        let max_fragment_payload = usable_mtu - HEADER_SIZE - FRAGMENT_META_SIZE;

        let mut source_header = [0u8; HEADER_SIZE];
        self.header.write(&mut source_header);
        let mut source = Vec::with_capacity(HEADER_SIZE + self.payload().len());
        source.extend_from_slice(&source_header);
        source.extend_from_slice(self.payload());

        let fragment_count = (source.len() + max_fragment_payload - 1) / max_fragment_payload;
        if fragment_count > u16::MAX as usize {
            return Err(FragmentError::MtuTooSmall);
        }

        let fragment_group = self.header.counter as u8;
        let mut fragments = Vec::with_capacity(fragment_count);
        for i in 0..fragment_count {
            let start = i * max_fragment_payload;
            let end = (start + max_fragment_payload).min(source.len());

            let mut carrier = ProtocolPacket::new(
                header::InternalId::FragmentedPacket.as_id(),
                fragment_group,
                i as u16,
            );
            carrier.packet.pack_u16(fragment_count as u16);
            carrier.append_payload(&source[start..end]);
            carrier.do_not_fragment();
            carrier.do_not_reorder();
            if self.marked_for_encryption {
                carrier.mark_for_encryption();
            }
            fragments.push(carrier);
        }
        Ok(fragments)
    }

    /// Reads the `fragment_total` meta field off a carrier produced by
    /// [`ProtocolPacket::fragment`]. Consumes the two meta bytes so the
    /// remaining payload is exactly the fragment's share of data.
    pub fn take_fragment_total(&mut self) -> Option<u16> {
        self.packet.read_u16()
    }
}

impl Packet {
    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::IdentityCompressor;

    #[test]
    fn pack_and_read_round_trip() {
        let mut p = Packet::new();
        p.pack_u8(7).pack_u16(1000).pack_u32(99999);
        assert_eq!(p.read_u8(), Some(7));
        assert_eq!(p.read_u16(), Some(1000));
        assert_eq!(p.read_u32(), Some(99999));
        assert!(p.is_valid());
    }

    #[test]
    fn short_read_invalidates_packet() {
        let mut p = Packet::new();
        p.pack_u8(1);
        assert_eq!(p.read_u16(), None);
        assert!(!p.is_valid());
    }

    #[test]
    fn protocol_packet_round_trips_through_wire_bytes() {
        let mut pkt = ProtocolPacket::new(42, 3, 1000);
        pkt.append_payload(b"hello world");
        pkt.apply_options(false).unwrap();

        let wire = pkt.as_wire_bytes().to_vec();
        let parsed = ProtocolPacket::from_received(&wire, Identity::none(), 0).unwrap();
        assert_eq!(parsed.retrieve_identifier(), 42);
        assert_eq!(parsed.retrieve_realm(), 3);
        assert_eq!(parsed.retrieve_counter(), 1000);
        assert_eq!(parsed.payload(), b"hello world");
    }

    #[test]
    fn apply_options_requires_client_for_correction_latency() {
        let mut pkt = ProtocolPacket::new(1, 0, 0);
        pkt.set_correction_latency(50);
        assert!(matches!(
            pkt.apply_options(false),
            Err(PacketError::MissingClient)
        ));
        assert!(pkt.apply_options(true).is_ok());
    }

    #[test]
    fn compress_then_decompress_restores_payload() {
        let mut pkt = ProtocolPacket::new(1, 0, 0);
        pkt.append_payload(b"payload data to round trip");
        let codec = IdentityCompressor;
        pkt.compress(&codec).unwrap();
        assert!(pkt.retrieve_flags().contains(Flags::COMPRESSED));
        pkt.decompress(&codec).unwrap();
        assert!(!pkt.retrieve_flags().contains(Flags::COMPRESSED));
        assert_eq!(pkt.payload(), b"payload data to round trip");
    }

    #[test]
    fn fragment_splits_payload_and_marks_carriers() {
        let mut pkt = ProtocolPacket::new(1, 0, 1000);
        pkt.mark_for_encryption();
        pkt.do_not_discard();
        let payload = vec![7u8; 100];
        pkt.append_payload(&payload);

        let fragments = pkt.fragment(32).unwrap();
        assert!(fragments.len() > 1);
        for f in &fragments {
            assert_eq!(f.retrieve_realm(), 1000u16 as u8);
            assert!(f.retrieve_flags().contains(Flags::DO_NOT_FRAGMENT));
            assert!(f.retrieve_flags().contains(Flags::DO_NOT_REORDER));
            assert!(f.is_marked_for_encryption());
        }

        let mut source = Vec::new();
        for mut f in fragments {
            let total = f.take_fragment_total().unwrap();
            assert!(total as usize > 0);
            source.extend_from_slice(f.payload());
        }

        // The carriers' concatenated payloads are the source packet's own
        // header followed by its payload, not just the payload.
        let restored = HeaderView::parse(&source[..HEADER_SIZE]).unwrap();
        assert_eq!(restored.identifier, 1);
        assert_eq!(restored.realm, 0);
        assert_eq!(restored.counter, 1000);
        assert!(restored.flags.contains(Flags::DO_NOT_DISCARD));
        assert_eq!(&source[HEADER_SIZE..], payload.as_slice());
    }

    #[test]
    fn mtu_too_small_is_rejected() {
        let pkt = ProtocolPacket::new(1, 0, 0);
        assert!(matches!(
            pkt.fragment(HEADER_SIZE as u16),
            Err(FragmentError::MtuTooSmall)
        ));
    }
}
