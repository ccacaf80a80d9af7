//! Per-peer connection state (spec.md §3 Client, §4.6), grounded in the
//! original source's `Client`/`ClientStatus` (`C_client.cpp`).
//!
//! Unlike the original, which guards almost every field behind its own
//! `std::mutex`, a `Client` here is always reached through the single
//! per-peer `Mutex` the flux's client table already holds (spec.md §4.9
//! concurrency model) — so the fields below are plain, and the mutual
//! exclusion lives one layer up, the way the teacher's engine locks a
//! whole connection's state rather than individual members.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::cache::{Cache, Label};
use crate::command::Completion;
use crate::dtls::DtlsSession;
use crate::error::NetError;
use crate::fragment::Defragmenter;
use crate::header::Flags;
use crate::latency::LatencyPlanner;
use crate::packet::ProtocolPacket;
use crate::reorder::{PeerProgress, Reorderer};

/// Connection lifecycle (spec.md §4.6): handshake, MTU discovery, DTLS
/// handshake, connected, and the terminal states.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NetworkStatus {
    Disconnected,
    Acknowledged,
    MtuDiscovered,
    Authenticated,
    Connected,
    Timeout,
}

/// Status plus the timeout clock that drives transitions out of it
/// (spec.md §4.6, `C_client.cpp`'s `ClientStatus`).
#[derive(Debug)]
pub struct ClientStatus {
    network_status: NetworkStatus,
    timeout: Duration,
    timeout_started_at: Instant,
}

impl ClientStatus {
    pub fn new(network_status: NetworkStatus, timeout: Duration) -> ClientStatus {
        ClientStatus {
            network_status,
            timeout,
            timeout_started_at: Instant::now(),
        }
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.network_status
    }

    pub fn set_network_status(&mut self, status: NetworkStatus) {
        self.network_status = status;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.timeout_started_at = Instant::now();
    }

    pub fn reset_timeout(&mut self) {
        self.timeout_started_at = Instant::now();
    }

    pub fn is_timeout(&self) -> bool {
        self.timeout_started_at.elapsed() >= self.timeout
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self.network_status, NetworkStatus::Disconnected | NetworkStatus::Timeout)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.network_status, NetworkStatus::Connected | NetworkStatus::Authenticated)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self.network_status,
            NetworkStatus::Acknowledged | NetworkStatus::MtuDiscovered
        )
    }

    pub fn is_in_encrypted_state(&self) -> bool {
        matches!(self.network_status, NetworkStatus::Authenticated | NetworkStatus::Connected)
    }
}

/// Which side's counters an operation addresses: packets this host sends,
/// or packets it has received from the peer (spec.md §4.6 `Targets`).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Target {
    Host,
    Peer,
}

/// Per-peer connection state: counters, realm, the reorderer/cache/
/// defragmenter instances scoped to this peer, and the pending outbound
/// queue (spec.md §3 Client).
pub struct Client {
    pub status: ClientStatus,
    pub latency: LatencyPlanner,
    pub reorderer: Reorderer,
    pub cache: Cache,
    pub defragmenter: Defragmenter,
    /// DTLS handshake/record state for this peer, created once the
    /// connection enters `mtu-discovered` (spec.md §4.6, §9.7). `None`
    /// before then and for peers that never reach that state.
    pub dtls: Option<DtlsSession>,

    current_realm: u8,
    host_counter: u16,
    peer_counter: u16,
    host_reordered_counter: u16,
    peer_reordered_counter: u16,
    last_realm_change_at: Instant,
    last_send_at: Instant,

    lost_packet_count: u32,
    lost_packet_threshold: u32,

    acknowledged: HashSet<Label>,
    pending_transmit: VecDeque<ProtocolPacket>,
    allow_more_pending: bool,

    /// The completion a `connect()` call is waiting on, plus when it was
    /// dispatched, so it can be resolved once the handshake reaches a
    /// terminal state instead of at dispatch time (spec.md §4.6/§4.7,
    /// `C_netClient.cpp`'s `NetConnectCommand`).
    pending_connect: Option<(Completion<Result<(), NetError>>, Instant)>,

    pub mtu: u16,
    pub packet_return_rate: Duration,
}

impl Client {
    pub fn new(
        reorderer_capacity: usize,
        cache_capacity: usize,
        cache_retry_limit: u32,
        defragmenter_max_groups: usize,
        offset_window: usize,
        status_timeout: Duration,
        packet_return_rate: Duration,
    ) -> Client {
        Client {
            status: ClientStatus::new(NetworkStatus::Disconnected, status_timeout),
            latency: LatencyPlanner::new(offset_window),
            reorderer: Reorderer::new(reorderer_capacity),
            cache: Cache::new(cache_capacity, cache_retry_limit),
            defragmenter: Defragmenter::new(defragmenter_max_groups),
            dtls: None,
            current_realm: 0,
            host_counter: 0,
            peer_counter: 0,
            host_reordered_counter: 0,
            peer_reordered_counter: 0,
            last_realm_change_at: Instant::now(),
            last_send_at: Instant::now(),
            lost_packet_count: 0,
            lost_packet_threshold: 10,
            acknowledged: HashSet::new(),
            pending_transmit: VecDeque::new(),
            allow_more_pending: true,
            pending_connect: None,
            mtu: 0,
            packet_return_rate,
        }
    }

    pub fn current_realm(&self) -> u8 {
        self.current_realm
    }

    pub fn set_current_realm(&mut self, realm: u8) {
        if self.current_realm != realm {
            self.host_counter = 0;
            self.peer_counter = 0;
            self.last_realm_change_at = Instant::now();
            self.current_realm = realm;
        }
    }

    pub fn advance_current_realm(&mut self) -> u8 {
        self.host_counter = 0;
        self.peer_counter = 0;
        self.last_realm_change_at = Instant::now();
        self.current_realm = self.current_realm.wrapping_add(1);
        self.current_realm
    }

    pub fn last_realm_change_elapsed(&self) -> Duration {
        self.last_realm_change_at.elapsed()
    }

    pub fn counter(&self, target: Target) -> u16 {
        match target {
            Target::Host => self.host_counter,
            Target::Peer => self.peer_counter,
        }
    }

    pub fn advance_counter(&mut self, target: Target) -> u16 {
        match target {
            Target::Host => {
                self.host_counter = self.host_counter.wrapping_add(1);
                self.host_counter
            }
            Target::Peer => {
                self.peer_counter = self.peer_counter.wrapping_add(1);
                self.peer_counter
            }
        }
    }

    pub fn set_counter(&mut self, target: Target, value: u16) {
        match target {
            Target::Host => self.host_counter = value,
            Target::Peer => self.peer_counter = value,
        }
    }

    pub fn reordered_counter(&self, target: Target) -> u16 {
        match target {
            Target::Host => self.host_reordered_counter,
            Target::Peer => self.peer_reordered_counter,
        }
    }

    pub fn advance_reordered_counter(&mut self, target: Target) -> u16 {
        match target {
            Target::Host => {
                self.host_reordered_counter = self.host_reordered_counter.wrapping_add(1);
                self.host_reordered_counter
            }
            Target::Peer => {
                self.peer_reordered_counter = self.peer_reordered_counter.wrapping_add(1);
                self.peer_reordered_counter
            }
        }
    }

    pub fn set_reordered_counter(&mut self, target: Target, value: u16) {
        match target {
            Target::Host => self.host_reordered_counter = value,
            Target::Peer => self.peer_reordered_counter = value,
        }
    }

    /// Elapsed time since the transmission thread last dispatched a packet
    /// to this peer, used for CTOS/STOC pacing (spec.md §4.9 leaky bucket).
    pub fn last_send_elapsed(&self) -> Duration {
        self.last_send_at.elapsed()
    }

    pub fn reset_last_send_ts(&mut self) {
        self.last_send_at = Instant::now();
    }

    pub fn peer_progress(&self) -> PeerProgress {
        PeerProgress {
            counter: self.peer_counter,
            reordered_counter: self.peer_reordered_counter,
            realm: self.current_realm,
        }
    }

    /// Records one lost packet and reports whether the loss threshold was
    /// just crossed (spec.md §10 supplemented feature; `C_client.cpp`'s
    /// `advanceLostPacketCount`/`_onThresholdLostPacket`).
    pub fn advance_lost_packet_count(&mut self) -> (u32, bool) {
        self.lost_packet_count = self.lost_packet_count.wrapping_add(1);
        let crossed = self.lost_packet_count != 0 && self.lost_packet_count % self.lost_packet_threshold == 0;
        (self.lost_packet_count, crossed)
    }

    pub fn set_lost_packet_threshold(&mut self, threshold: u32) {
        if threshold != 0 {
            self.lost_packet_threshold = threshold;
        }
    }

    pub fn lost_packet_count(&self) -> u32 {
        self.lost_packet_count
    }

    /// Records that a packet arrived, for the peer's next piggy-backed ack
    /// batch (spec.md §6.5).
    pub fn acknowledge_reception(&mut self, packet: &ProtocolPacket) {
        self.acknowledged.insert(Label {
            counter: packet.retrieve_counter(),
            realm: packet.retrieve_realm(),
        });
    }

    pub fn drain_acknowledged(&mut self) -> Vec<Label> {
        self.acknowledged.drain().collect()
    }

    /// Stamps realm/counter/reordered-counter on an outbound packet and
    /// queues it (spec.md §4.6 `pushPacket`). Packets are dropped silently
    /// once the connection is disconnected, matching the original.
    pub fn push_packet(&mut self, mut packet: ProtocolPacket) {
        if self.status.is_disconnected() {
            return;
        }
        packet.set_realm(self.current_realm);
        let counter = self.advance_counter(Target::Host);
        packet.set_counter(counter);
        if !packet.retrieve_flags().contains(Flags::DO_NOT_REORDER) {
            let reordered = self.advance_reordered_counter(Target::Host);
            packet.set_reordered_counter(reordered);
        }
        if self.status.is_in_encrypted_state() {
            packet.mark_for_encryption();
        }
        self.pending_transmit.push_back(packet);
    }

    /// Queues a packet ahead of everything else, used by the ack cache's
    /// retransmit path (spec.md §4.5).
    pub fn push_forced_front(&mut self, packet: ProtocolPacket) {
        self.pending_transmit.push_front(packet);
    }

    pub fn pop_packet(&mut self) -> Option<ProtocolPacket> {
        self.pending_transmit.pop_front()
    }

    pub fn is_pending_empty(&self) -> bool {
        self.pending_transmit.is_empty()
    }

    pub fn clear_pending(&mut self) {
        self.pending_transmit.clear();
    }

    pub fn is_ready_for_more_pending(&self) -> bool {
        self.allow_more_pending && self.pending_transmit.is_empty()
    }

    pub fn allow_more_pending(&mut self, allow: bool) {
        self.allow_more_pending = allow;
    }

    /// Stashes the completion a `connect()` call is waiting on, replacing
    /// whatever was there before (a second `connect()` supersedes the
    /// first, matching the original's one-command-at-a-time queue).
    pub fn set_pending_connect(&mut self, completion: Completion<Result<(), NetError>>) {
        self.pending_connect = Some((completion, Instant::now()));
    }

    /// Resolves and clears the pending `connect()` completion, if any.
    /// Called from the control-packet path on a terminal result (handshake
    /// rejected, or the DTLS handshake establishing the connection).
    pub fn resolve_pending_connect(&mut self, result: Result<(), NetError>) {
        if let Some((completion, _)) = self.pending_connect.take() {
            completion.complete(result);
        }
    }

    /// Resolves `connect()` as successful if the connection has just
    /// reached `Connected`; a no-op otherwise. Called from the reception
    /// thread right after a control packet is handled, since that is where
    /// the DTLS handshake completing (and thus the status transition) is
    /// observed.
    pub fn resolve_pending_connect_if_established(&mut self) {
        if self.status.is_connected() {
            self.resolve_pending_connect(Ok(()));
        }
    }

    /// Polled once per command tick: resolves a still-pending `connect()`
    /// as timed out once `timeout` has elapsed since it was dispatched
    /// without reaching a terminal state. Success is handled by
    /// [`Client::resolve_pending_connect_if_established`] as soon as it
    /// happens, so this only needs to watch for the failure case.
    pub fn poll_pending_connect_timeout(&mut self, timeout: Duration) {
        self.resolve_pending_connect_if_established();
        if let Some((_, started_at)) = &self.pending_connect {
            if started_at.elapsed() >= timeout {
                self.resolve_pending_connect(Err(NetError::Timeout));
            }
        }
    }

    pub fn disconnect(&mut self, status_timeout: Duration, push_disconnect_packet: Option<ProtocolPacket>) {
        self.status.set_network_status(NetworkStatus::Disconnected);
        self.status.set_timeout(status_timeout);
        if let Some(packet) = push_disconnect_packet {
            self.push_packet(packet);
        }
    }

    pub fn reset_all_counters(&mut self) {
        self.host_counter = 0;
        self.peer_counter = 0;
        self.host_reordered_counter = 0;
        self.peer_reordered_counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::header::InternalId;

    fn client() -> Client {
        let cfg = NetConfig::default();
        Client::new(
            cfg.reorderer_capacity(),
            cfg.cache_max(),
            cfg.cache_retry_limit(),
            cfg.defragmenter_max_groups(),
            8,
            cfg.status_timeout(),
            cfg.packet_return_rate(),
        )
    }

    #[test]
    fn push_packet_stamps_realm_and_advances_counters() {
        let mut c = client();
        c.status.set_network_status(NetworkStatus::Connected);
        c.set_current_realm(5);

        let packet = ProtocolPacket::new(InternalId::Handshake.as_id(), 0, 0);
        c.push_packet(packet);

        let queued = c.pop_packet().unwrap();
        assert_eq!(queued.retrieve_realm(), 5);
        assert_eq!(queued.retrieve_counter(), 1);
        assert_eq!(queued.retrieve_reordered_counter(), 1);
        assert!(queued.is_marked_for_encryption());
    }

    #[test]
    fn disconnected_client_drops_pushed_packets() {
        let mut c = client();
        c.push_packet(ProtocolPacket::new(InternalId::Handshake.as_id(), 0, 0));
        assert!(c.is_pending_empty());
    }

    #[test]
    fn realm_change_resets_counters() {
        let mut c = client();
        c.set_counter(Target::Peer, 42);
        c.set_current_realm(1);
        assert_eq!(c.counter(Target::Peer), 0);
        assert_eq!(c.current_realm(), 1);
    }

    #[test]
    fn lost_packet_threshold_is_reported_once_crossed() {
        let mut c = client();
        c.set_lost_packet_threshold(2);
        assert_eq!(c.advance_lost_packet_count(), (1, false));
        assert_eq!(c.advance_lost_packet_count(), (2, true));
    }

    #[test]
    fn pending_connect_resolves_once_connected() {
        let mut c = client();
        let completion = crate::command::Completion::new();
        c.set_pending_connect(completion.clone());

        c.poll_pending_connect_timeout(Duration::from_secs(60));
        c.status.set_network_status(NetworkStatus::Connected);
        c.resolve_pending_connect_if_established();

        assert_eq!(completion.wait(), Ok(()));
    }

    #[test]
    fn pending_connect_times_out_without_a_terminal_status() {
        let mut c = client();
        let completion = crate::command::Completion::new();
        c.set_pending_connect(completion.clone());

        c.poll_pending_connect_timeout(Duration::from_millis(0));

        assert_eq!(completion.wait(), Err(crate::error::NetError::Timeout));
    }

    #[test]
    fn allow_more_pending_gates_is_ready_for_more_pending() {
        let mut c = client();
        assert!(c.is_ready_for_more_pending());
        c.allow_more_pending(false);
        assert!(!c.is_ready_for_more_pending());
    }
}
