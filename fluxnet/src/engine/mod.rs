//! Shared reception/transmission engine plumbing (spec.md §4.9, §5),
//! grounded in the original source's `ServerUdp`/`ClientSideNetUdp`
//! (`C_server.cpp`, `C_netClient.cpp`). [`server`] and [`client`] each spin
//! up the same two-thread shape over the pipeline defined here; what
//! differs is only how a peer's [`Client`] is found — a lookup in the
//! server's [`crate::flux::ClientTable`] versus the single peer a
//! client-side engine owns outright.

pub mod client;
pub mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::cache::Label;
use crate::client::{Client, NetworkStatus, Target};
use crate::compressor::Compressor;
use crate::dtls::{DtlsSession, Role};
use crate::error::{NetError, PacketError};
use crate::header::{Flags, InternalId};
use crate::identity::Identity;
use crate::packet::ProtocolPacket;
use crate::returnpacket::{apply_latency_block, build_latency_block, read_acknowledged_labels, read_latency_block, ReturnPacketBuilder};
use crate::socket::NetSocket;
use crate::time::now_ms;

/// Fixed magic prefix every handshake body must start with (spec.md §4.6,
/// §6.2 `FGE_HANDSHAKE`). Picking a project-specific string the way the
/// original hardcodes its own; there is nothing secret about it.
pub const HANDSHAKE_MAGIC: &[u8] = b"FLUXNET1";

fn build_handshake_payload(versioning: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(HANDSHAKE_MAGIC.len() + 2 + versioning.len());
    body.extend_from_slice(HANDSHAKE_MAGIC);
    body.extend_from_slice(&(versioning.len() as u16).to_be_bytes());
    body.extend_from_slice(versioning.as_bytes());
    body
}

fn parse_handshake_versioning(payload: &[u8]) -> Option<&str> {
    let rest = payload.strip_prefix(HANDSHAKE_MAGIC)?;
    if rest.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    let body = rest.get(2..2 + len)?;
    std::str::from_utf8(body).ok()
}

/// Result of feeding one control-plane packet (handshake / MTU probe /
/// crypt handshake) through [`handle_control_packet`].
pub enum ControlOutcome {
    /// Not a control packet at all; hand it to the normal receive pipeline.
    NotControl,
    /// Handled; optionally queue the returned packet(s) for transmission.
    Handled(Vec<ProtocolPacket>),
    /// The handshake failed (bad magic or version mismatch); drop silently.
    Rejected,
}

/// Drives the handshake / MTU-discovery / DTLS-handshake sub-protocol
/// shared by both engines (spec.md §4.6). `is_server` distinguishes the two
/// asymmetries the state machine has: who validates the handshake body
/// (server) and who creates DTLS state on entering `mtu-discovered`
/// (server; the client already started its DTLS session at `acknowledged`).
#[allow(clippy::too_many_arguments)]
pub fn handle_control_packet(
    identifier: u16,
    payload: &[u8],
    client: &mut Client,
    dtls_context: &openssl::ssl::SslContext,
    local_mtu: u16,
    versioning: &str,
    is_server: bool,
) -> ControlOutcome {
    if identifier == InternalId::Handshake.as_id() {
        if !is_server {
            // The client only ever receives the server's ack echo; nothing
            // further to validate beyond "we got it".
            client.status.set_network_status(NetworkStatus::Acknowledged);
            return ControlOutcome::Handled(Vec::new());
        }
        return match parse_handshake_versioning(payload) {
            Some(peer_versioning) if peer_versioning == versioning => {
                client.status.set_network_status(NetworkStatus::Acknowledged);
                let mut ack = ProtocolPacket::new(InternalId::Handshake.as_id(), 0, 0);
                ack.append_payload(HANDSHAKE_MAGIC);
                ack.do_not_reorder();
                ack.do_not_discard();
                ControlOutcome::Handled(vec![ack])
            }
            _ => ControlOutcome::Rejected,
        };
    }

    if identifier == InternalId::MtuAsk.as_id() {
        let mut response = ProtocolPacket::new(InternalId::MtuAskResponse.as_id(), 0, 0);
        response.append_payload(&local_mtu.to_be_bytes());
        response.do_not_reorder();
        response.do_not_discard();
        return ControlOutcome::Handled(vec![response]);
    }

    if identifier == InternalId::MtuAskResponse.as_id() {
        if payload.len() >= 2 {
            let peer_mtu = u16::from_be_bytes([payload[0], payload[1]]);
            let candidate = peer_mtu.min(local_mtu);
            client.mtu = if client.mtu == 0 { candidate } else { client.mtu.min(candidate) };
        }
        return ControlOutcome::Handled(Vec::new());
    }

    if identifier == InternalId::MtuTest.as_id() {
        let mut response = ProtocolPacket::new(InternalId::MtuTestResponse.as_id(), 0, 0);
        response.append_payload(&(payload.len() as u16).to_be_bytes());
        response.do_not_reorder();
        response.do_not_discard();
        return ControlOutcome::Handled(vec![response]);
    }

    if identifier == InternalId::MtuTestResponse.as_id() {
        if payload.len() >= 2 {
            let confirmed = u16::from_be_bytes([payload[0], payload[1]]);
            client.mtu = client.mtu.max(confirmed);
        }
        return ControlOutcome::Handled(Vec::new());
    }

    if identifier == InternalId::MtuFinal.as_id() {
        client.status.set_network_status(NetworkStatus::MtuDiscovered);
        if is_server && client.dtls.is_none() {
            if let Ok(session) = DtlsSession::new(dtls_context, Role::Server) {
                client.dtls = Some(session);
            }
        }
        return ControlOutcome::Handled(Vec::new());
    }

    if identifier == InternalId::CryptHandshake.as_id() {
        let Some(dtls) = client.dtls.as_mut() else {
            return ControlOutcome::Handled(Vec::new());
        };
        if dtls.feed_inbound(payload).is_err() {
            return ControlOutcome::Rejected;
        }
        let outbound = dtls.take_outbound();
        let mut packets = Vec::new();
        if !outbound.is_empty() {
            let mut record = ProtocolPacket::new(InternalId::CryptHandshake.as_id(), 0, 0);
            record.append_payload(&outbound);
            record.do_not_reorder();
            record.do_not_discard();
            packets.push(record);
        }
        if dtls.is_established() {
            client.status.set_network_status(NetworkStatus::Connected);
            client.reset_all_counters();
        }
        return ControlOutcome::Handled(packets);
    }

    ControlOutcome::NotControl
}

/// Builds the client-driven handshake request (spec.md §4.6 "Client sends
/// identifier NET_INTERNAL_ID_FGE_HANDSHAKE").
pub fn build_handshake_request(versioning: &str) -> ProtocolPacket {
    let mut request = ProtocolPacket::new(InternalId::Handshake.as_id(), 0, 0);
    request.append_payload(&build_handshake_payload(versioning));
    request.do_not_reorder();
    request.do_not_discard();
    request
}

/// Builds the client's `MtuAsk` probe (spec.md §4.6 MTU probe).
pub fn build_mtu_ask() -> ProtocolPacket {
    let mut ask = ProtocolPacket::new(InternalId::MtuAsk.as_id(), 0, 0);
    ask.do_not_reorder();
    ask.do_not_discard();
    ask
}

/// Builds an oversize `MtuTest` probe of `size` bytes of padding (spec.md
/// §4.6: "oversize test packets whose acknowledgement confirms a candidate
/// MTU").
pub fn build_mtu_test(size: u16) -> ProtocolPacket {
    let mut test = ProtocolPacket::new(InternalId::MtuTest.as_id(), 0, 0);
    test.append_payload(&vec![0u8; size as usize]);
    test.do_not_reorder();
    test
}

/// Builds the `MtuFinal` packet that locks in the negotiated MTU on both
/// sides (spec.md §4.6).
pub fn build_mtu_final() -> ProtocolPacket {
    let mut pkt = ProtocolPacket::new(InternalId::MtuFinal.as_id(), 0, 0);
    pkt.do_not_reorder();
    pkt.do_not_discard();
    pkt
}

/// Builds the disconnect notice sent once before the local side transitions
/// to `disconnected` (spec.md §4.6).
pub fn build_disconnect_packet() -> ProtocolPacket {
    let mut pkt = ProtocolPacket::new(InternalId::Disconnect.as_id(), 0, 0);
    pkt.do_not_reorder();
    pkt.do_not_discard();
    pkt
}

/// Cooperative shutdown flag shared by an engine's reception and
/// transmission threads (spec.md §4.9 "loop while running").
#[derive(Clone)]
pub struct Running(Arc<AtomicBool>);

impl Running {
    pub fn new() -> Running {
        Running(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Running {
    fn default() -> Self {
        Self::new()
    }
}

/// Condvar-based wakeup for the transmission thread (spec.md §5: "woken by
/// notifyTransmission() or timed out for pacing").
pub struct Notifier {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl Notifier {
    pub fn new() -> Notifier {
        Notifier {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        self.condvar.notify_all();
    }

    pub fn wait_timeout(&self, timeout: Duration) {
        let guard = self.lock.lock().expect("notifier mutex poisoned");
        let _ = self.condvar.wait_timeout(guard, timeout);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of decoding and routing one received datagram through a peer's
/// client state (spec.md §4.9 reception-thread body).
pub enum Delivered {
    /// Nothing for the application yet — buffered in the reorderer or
    /// defragmenter, or fully handled internally (an ack-only return
    /// packet, a disconnect).
    Internal,
    /// One or more packets ready to be pushed into a flux.
    Packets(Vec<ProtocolPacket>),
}

/// Parses the wire header off `raw` (already DTLS-decrypted by the caller
/// if the peer is in an encrypted state), strips compression, and feeds the
/// result through the peer's ack bookkeeping plus reorderer or defragmenter
/// — the body shared by the server's per-flux reception step and the
/// client-side engine's reception thread (spec.md §4.9).
///
/// `ignore_realm` is threaded straight into the reorderer the way the
/// handshake/MTU fast path does (spec.md §4.3): before a realm has been
/// negotiated, counter contiguity alone decides retrievability.
///
/// `is_server` tells a received return packet's latency block which leg it
/// just measured (spec.md §4.4: the server measures STOC, the client CTOS).
#[allow(clippy::too_many_arguments)]
pub fn receive_into_client(
    raw: &[u8],
    peer: Identity,
    client: &mut Client,
    compressor: &dyn Compressor,
    ignore_realm: bool,
    is_server: bool,
    logger: &slog::Logger,
) -> Result<Delivered, NetError> {
    let timestamp = now_ms();
    let mut packet = ProtocolPacket::from_received(raw, peer, timestamp)?;
    if !packet.is_valid() {
        return Err(NetError::Packet(PacketError::Invalid));
    }

    if packet.retrieve_flags().contains(Flags::COMPRESSED) {
        packet.decompress(compressor)?;
    }

    client.latency.reset_last_packet_time();

    if packet.retrieve_identifier() == InternalId::FragmentedPacket.as_id() {
        let group_id = packet.retrieve_realm();
        let fragment_index = packet.retrieve_counter();
        let fragment_total = packet.take_fragment_total().unwrap_or(0);
        return match client
            .defragmenter
            .process(group_id, fragment_index, fragment_total, packet)
        {
            Ok(crate::fragment::Progress::Retrievable) => {
                match client.defragmenter.retrieve(group_id, peer, timestamp) {
                    Some(reassembled) => Ok(Delivered::Packets(vec![reassembled])),
                    None => Ok(Delivered::Internal),
                }
            }
            Ok(_) => Ok(Delivered::Internal),
            // A forged or corrupted fragment count discards the group
            // rather than propagating an error up the reception loop
            // (spec.md §4.2: malformed fragments are dropped, not fatal).
            Err(_) => Ok(Delivered::Internal),
        };
    }

    if packet.retrieve_identifier() == InternalId::ReturnPacket.as_id() {
        apply_return_packet(client, &packet, is_server);
        return Ok(Delivered::Internal);
    }

    if packet.retrieve_identifier() == InternalId::Disconnect.as_id() {
        client.status.set_network_status(NetworkStatus::Disconnected);
        client.status.reset_timeout();
        return Ok(Delivered::Internal);
    }

    client.acknowledge_reception(&packet);

    if packet.retrieve_flags().contains(Flags::DO_NOT_REORDER) {
        let counter = packet.retrieve_counter();
        if counter.wrapping_sub(client.counter(Target::Peer)) < u16::MAX / 2 {
            client.set_counter(Target::Peer, counter);
        }
        packet.mark_as_locally_reordered();
        return Ok(Delivered::Packets(vec![packet]));
    }

    client.reorderer.push(packet);
    let progress = client.peer_progress();
    let outcome = client.reorderer.process(progress, ignore_realm);
    for _ in 0..outcome.lost {
        let (count, crossed) = client.advance_lost_packet_count();
        if crossed {
            slog::warn!(logger, "lost packet threshold crossed"; "peer" => %peer, "lost" => count);
        }
    }
    for delivered in &outcome.delivered {
        client.set_counter(Target::Peer, delivered.retrieve_counter());
        client.set_reordered_counter(Target::Peer, delivered.retrieve_reordered_counter());
    }

    if outcome.delivered.is_empty() {
        Ok(Delivered::Internal)
    } else {
        Ok(Delivered::Packets(outcome.delivered))
    }
}

/// Reads a received return packet's events, latency block, and
/// acknowledgement labels, feeding the labels into the ack cache and the
/// latency block into the peer's [`crate::latency::LatencyPlanner`]
/// (spec.md §4.8, §4.4 receiver side).
fn apply_return_packet(client: &mut Client, packet: &ProtocolPacket, is_server: bool) {
    let payload = packet.payload();
    if payload.len() < 2 {
        return;
    }
    let event_count = u16::from_be_bytes([payload[0], payload[1]]);
    let mut cursor = 2usize;
    for _ in 0..event_count {
        if payload.len() < cursor + 4 {
            return;
        }
        let body_len = u16::from_be_bytes([payload[cursor + 2], payload[cursor + 3]]) as usize;
        cursor += 4 + body_len;
    }

    let Some((block, consumed)) = read_latency_block(&payload[cursor.min(payload.len())..]) else {
        return;
    };
    apply_latency_block(&mut client.latency, &block, is_server);
    cursor += consumed;

    if let Some(labels) = read_acknowledged_labels(&payload[cursor.min(payload.len())..]) {
        client.cache.acknowledge(&labels);
    }
}

/// One pass of the transmission thread's per-client body (spec.md §4.9):
/// drain the ack cache's due retransmits, then — if the pacing interval has
/// elapsed and there's something pending — apply options, compress,
/// fragment, cache, encrypt and hand the datagram to `send`.
///
/// `pacing` is the peer's current CTOS/STOC latency estimate, used both as
/// the leaky-bucket send interval and (scaled by `cache_delay_factor`,
/// floored at `cache_min_latency`) as the ack cache's retransmit delay
/// (spec.md §6.6). `send` is the raw datagram sink (`NetSocket::send`/
/// `send_to`), kept generic so both engines share this body without
/// depending on which overload they call.
pub fn service_transmission(
    client: &mut Client,
    compressor: &dyn Compressor,
    pacing: Duration,
    cache_delay_factor: f32,
    cache_min_latency: Duration,
    logger: &slog::Logger,
    mut send: impl FnMut(&[u8]) -> Result<(), NetError>,
) -> Result<(), NetError> {
    let rtt = client
        .latency
        .round_trip_time_ms()
        .map(|ms| Duration::from_millis(ms as u64))
        .unwrap_or(pacing);
    let retransmit_delay = rtt.mul_f32(cache_delay_factor).max(cache_min_latency);

    for action in client.cache.process(retransmit_delay) {
        match action {
            crate::cache::Retransmit::Resend(packet) => client.push_forced_front(packet),
            crate::cache::Retransmit::GivenUp => {
                let (count, crossed) = client.advance_lost_packet_count();
                if crossed {
                    slog::warn!(logger, "lost packet threshold crossed"; "lost" => count);
                }
            }
        }
    }

    // spec.md §4.5: `allowMorePendingPackets(!alarm)` — the application is
    // only allowed to queue more once the ack cache has drained back under
    // capacity.
    client.allow_more_pending(!client.cache.is_alarmed());

    if client.is_pending_empty() || client.last_send_elapsed() < pacing {
        return Ok(());
    }

    let mut packet = client.pop_packet().expect("checked non-empty above");
    if !packet.cached {
        packet.apply_options(true)?;
        if client.status.is_connected() {
            packet.compress(compressor)?;
        }
        if !packet.retrieve_flags().contains(Flags::DO_NOT_DISCARD) {
            packet.mark_as_cached();
            client.cache.push(packet.clone());
        }
    }

    if !packet.retrieve_flags().contains(Flags::DO_NOT_FRAGMENT) && client.mtu != 0 {
        if let Ok(mut fragments) = packet.fragment(client.mtu) {
            if fragments.len() > 1 {
                // Fragments go out as a burst: the first is dispatched now,
                // the rest are pushed to the front so they leave before
                // whatever else was queued behind the original packet.
                let first = fragments.remove(0);
                for carrier in fragments.into_iter().rev() {
                    client.push_forced_front(carrier);
                }
                return dispatch(client, first, &mut send);
            }
        }
    }

    dispatch(client, packet, &mut send)
}

fn dispatch(
    client: &mut Client,
    packet: ProtocolPacket,
    send: &mut impl FnMut(&[u8]) -> Result<(), NetError>,
) -> Result<(), NetError> {
    if packet.marked_for_encryption {
        if let Some(dtls) = client.dtls.as_mut() {
            let cipher = dtls.encrypt(packet.as_wire_bytes()).map_err(|_| NetError::Crypto)?;
            send(&cipher)?;
            client.reset_last_send_ts();
            return Ok(());
        }
    }
    send(packet.as_wire_bytes())?;
    client.reset_last_send_ts();
    Ok(())
}

/// Builds the due return packet for one client, if its return-packet cadence
/// has elapsed: every piggy-backed acknowledgement label, the latency
/// ping-pong block, plus any queued out-of-band events (spec.md §4.8, §4.4).
/// Returns `None` before the tick is due.
pub fn build_return_packet(client: &mut Client, realm: u8, counter: u16) -> Option<ProtocolPacket> {
    let builder = ReturnPacketBuilder::new();
    let labels: Vec<Label> = client.drain_acknowledged();
    if labels.is_empty() {
        return None;
    }
    let latency_block = build_latency_block(&mut client.latency);
    builder.finalize(realm, counter, &labels, latency_block).ok()
}
