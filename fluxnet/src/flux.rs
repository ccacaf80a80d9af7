//! Bounded inbound packet queue plus per-peer client table (spec.md §3
//! Flux), grounded in the original source's `ServerFluxUdp`/`ClientList`
//! (`C_server.hpp`).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::Client;
use crate::config::NetConfig;
use crate::identity::Identity;
use crate::packet::ProtocolPacket;

/// A received packet paired with the peer it arrived from, as it sits in
/// the flux's inbound queue (spec.md §3 `FluxPacket`).
pub struct FluxPacket {
    pub packet: ProtocolPacket,
    pub peer: Identity,
}

/// A bounded FIFO of received packets shared between the reception thread
/// (producer) and the application (consumer), grounded in
/// `ServerFluxUdp::pushPacket`/`popNextPacket`.
pub struct Flux {
    queue: Mutex<VecDeque<FluxPacket>>,
    max_packets: usize,
}

impl Flux {
    pub fn new(max_packets: usize) -> Flux {
        Flux {
            queue: Mutex::new(VecDeque::new()),
            max_packets,
        }
    }

    /// Appends a packet, refusing it once the queue is at capacity so a
    /// slow consumer can't grow memory unbounded (spec.md §4.9).
    pub fn push_packet(&self, flux_packet: FluxPacket) -> bool {
        let mut queue = self.queue.lock().expect("flux queue mutex poisoned");
        if queue.len() >= self.max_packets {
            return false;
        }
        queue.push_back(flux_packet);
        true
    }

    /// Appends a packet unconditionally, bypassing the capacity check —
    /// used by the reorderer to put back packets it just released in
    /// delivery order (spec.md §4.3 `forcePushPacketFront`).
    pub fn force_push_front(&self, flux_packet: FluxPacket) {
        let mut queue = self.queue.lock().expect("flux queue mutex poisoned");
        queue.push_front(flux_packet);
    }

    pub fn pop_packet(&self) -> Option<FluxPacket> {
        self.queue.lock().expect("flux queue mutex poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("flux queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.queue.lock().expect("flux queue mutex poisoned").clear();
    }

    pub fn set_max_packets(&mut self, max_packets: usize) {
        self.max_packets = max_packets;
    }
}

/// Per-peer client table: every connected (or connecting) remote identity
/// maps to its own mutex-guarded [`Client`] state, plus a shared
/// [`Flux`] for inbound packets (spec.md §3 `ClientList`).
pub struct ClientTable {
    clients: Mutex<HashMap<Identity, Arc<Mutex<Client>>>>,
    config: NetConfig,
}

impl ClientTable {
    pub fn new(config: NetConfig) -> ClientTable {
        ClientTable {
            clients: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Returns the existing client for `peer`, or creates and inserts a
    /// fresh one (spec.md §4.6: a new peer starts in `Disconnected`, ready
    /// to progress through the handshake).
    pub fn get_or_insert(&self, peer: Identity, offset_window: usize) -> Arc<Mutex<Client>> {
        let mut clients = self.clients.lock().expect("client table mutex poisoned");
        clients
            .entry(peer)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Client::new(
                    self.config.reorderer_capacity(),
                    self.config.cache_max(),
                    self.config.cache_retry_limit(),
                    self.config.defragmenter_max_groups(),
                    offset_window,
                    self.config.status_timeout(),
                    self.config.packet_return_rate(),
                )))
            })
            .clone()
    }

    pub fn get(&self, peer: &Identity) -> Option<Arc<Mutex<Client>>> {
        self.clients.lock().expect("client table mutex poisoned").get(peer).cloned()
    }

    pub fn remove(&self, peer: &Identity) {
        self.clients.lock().expect("client table mutex poisoned").remove(peer);
    }

    pub fn peers(&self) -> Vec<Identity> {
        self.clients
            .lock()
            .expect("client table mutex poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn client_gc_delay(&self) -> Duration {
        self.config.client_gc_delay()
    }

    /// Drops every client whose [`Client::status`] reports disconnected
    /// and whose timeout has elapsed (spec.md §4.6 GC sweep).
    pub fn reap_disconnected(&self) {
        let mut clients = self.clients.lock().expect("client table mutex poisoned");
        clients.retain(|_, client| {
            let guard = client.lock().expect("client mutex poisoned");
            !(guard.status.is_disconnected() && guard.status.is_timeout())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::InternalId;
    use crate::identity::IpAddr;

    fn peer(n: u16) -> Identity {
        Identity::new(IpAddr::V4(1), n)
    }

    #[test]
    fn flux_rejects_push_past_capacity() {
        let flux = Flux::new(1);
        let pk = FluxPacket {
            packet: ProtocolPacket::new(InternalId::Handshake.as_id(), 0, 0),
            peer: peer(1),
        };
        assert!(flux.push_packet(pk));
        let pk2 = FluxPacket {
            packet: ProtocolPacket::new(InternalId::Handshake.as_id(), 0, 0),
            peer: peer(1),
        };
        assert!(!flux.push_packet(pk2));
    }

    #[test]
    fn client_table_reuses_existing_entry() {
        let table = ClientTable::new(NetConfig::default());
        let a = table.get_or_insert(peer(1), 8);
        let b = table.get_or_insert(peer(1), 8);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn client_table_keeps_separate_peers_distinct() {
        let table = ClientTable::new(NetConfig::default());
        table.get_or_insert(peer(1), 8);
        table.get_or_insert(peer(2), 8);
        assert_eq!(table.peers().len(), 2);
    }
}
