//! Bounded out-of-order packet reorderer (spec.md §4.3), grounded in the
//! original source's `PacketReorderer` (`C_protocol.cpp`): a capacity-bounded
//! min-heap keyed by `(realm, reordered_counter)` that releases packets in
//! order, and falls back to releasing whatever is oldest ("forced" mode)
//! once it's full rather than stalling forever on a lost packet.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::header::Flags;
use crate::packet::ProtocolPacket;

/// What the caller already knows about a peer's delivery progress, used to
/// decide whether the packet at the head of the reorderer can be released.
#[derive(Debug, Clone, Copy)]
pub struct PeerProgress {
    pub counter: u16,
    pub reordered_counter: u16,
    pub realm: u8,
}

/// Classification of a candidate packet against a peer's current progress
/// (spec.md §4.3; `C_protocol.cpp`'s `PacketReorderer::checkStat`).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Stat {
    OldRealm,
    WaitingNextRealm,
    OldCounter,
    WaitingNextCounter,
    Retrievable,
}

fn check_stat(
    realm: u8,
    counter: u16,
    reordered_counter: u16,
    do_not_reorder: bool,
    peer: &PeerProgress,
    ignore_realm: bool,
) -> Stat {
    // When `ignore_realm` is set (the MTU/handshake fast path, spec.md
    // §4.3), the packet's own realm stands in for the peer's, so the realm
    // checks below always pass and only counter contiguity matters.
    let current_realm = if ignore_realm { realm } else { peer.realm };

    if realm < current_realm && current_realm.wrapping_add(1) != 0 {
        return Stat::OldRealm;
    }
    if realm != current_realm && counter != 0 {
        return Stat::WaitingNextRealm;
    }
    if do_not_reorder {
        return if counter < peer.counter {
            Stat::OldCounter
        } else {
            Stat::Retrievable
        };
    }
    if reordered_counter == peer.reordered_counter.wrapping_add(1) {
        return Stat::Retrievable;
    }
    if reordered_counter < peer.reordered_counter {
        return Stat::OldCounter;
    }
    Stat::WaitingNextCounter
}

/// Heap entry, ordered so the packet with the lowest `(realm,
/// reordered_counter)` sits at the top of a min-heap (via `Reverse`).
struct Entry {
    realm: u8,
    reordered_counter: u16,
    packet: ProtocolPacket,
}

impl Entry {
    fn key(&self) -> (u8, u16) {
        (self.realm, self.reordered_counter)
    }
}

impl Eq for Entry {}
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) behaves as a min-heap.
        other.key().cmp(&self.key())
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome of one [`Reorderer::process`] call.
#[derive(Debug, Default)]
pub struct ReorderOutcome {
    /// Packets released in delivery order, each one contiguous with the one
    /// before it (or with the peer's last known progress for the first).
    pub delivered: Vec<ProtocolPacket>,
    /// Packets dropped because they were older than the peer's current
    /// progress (spec.md §4.3: feeds `Client::advance_lost_packet_count`).
    pub lost: u32,
}

/// Bounded reordering buffer for one peer (spec.md §4.3).
pub struct Reorderer {
    heap: BinaryHeap<Entry>,
    capacity: usize,
    forced: bool,
}

impl Reorderer {
    pub fn new(capacity: usize) -> Reorderer {
        Reorderer {
            heap: BinaryHeap::with_capacity(capacity),
            capacity,
            forced: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.forced = false;
    }

    /// Buffers a received packet. Packets carrying `DO_NOT_REORDER` never
    /// enter the reorderer at all — the caller is expected to process them
    /// immediately instead (spec.md §4.3).
    pub fn push(&mut self, mut packet: ProtocolPacket) {
        if packet.retrieve_flags().contains(Flags::DO_NOT_REORDER) {
            return;
        }
        packet.mark_as_locally_reordered();
        self.heap.push(Entry {
            realm: packet.retrieve_realm(),
            reordered_counter: packet.retrieve_reordered_counter(),
            packet,
        });
        if self.heap.len() >= self.capacity {
            self.forced = true;
        }
    }

    /// Releases as many packets as can currently be delivered in order,
    /// starting from `peer`'s last known progress. Stale packets (older
    /// than `peer`) are dropped and counted; once the buffer is full the
    /// reorderer gives up waiting for a missing packet and releases
    /// whatever is at the head regardless of contiguity (spec.md §4.3
    /// "forced" mode).
    pub fn process(&mut self, peer: PeerProgress, ignore_realm: bool) -> ReorderOutcome {
        let mut outcome = ReorderOutcome::default();
        let mut rolling = peer;

        loop {
            let Some(top) = self.heap.peek() else { break };
            let do_not_reorder = top.packet.retrieve_flags().contains(Flags::DO_NOT_REORDER);
            let stat = check_stat(
                top.realm,
                top.packet.retrieve_counter(),
                top.reordered_counter,
                do_not_reorder,
                &rolling,
                ignore_realm,
            );

            match stat {
                Stat::OldRealm | Stat::OldCounter => {
                    self.heap.pop();
                    outcome.lost += 1;
                }
                Stat::Retrievable => {
                    let entry = self.heap.pop().expect("just peeked");
                    rolling = PeerProgress {
                        counter: entry.packet.retrieve_counter(),
                        reordered_counter: entry.reordered_counter,
                        realm: entry.realm,
                    };
                    outcome.delivered.push(entry.packet);
                }
                Stat::WaitingNextRealm | Stat::WaitingNextCounter => {
                    if self.forced {
                        let entry = self.heap.pop().expect("just peeked");
                        rolling = PeerProgress {
                            counter: entry.packet.retrieve_counter(),
                            reordered_counter: entry.reordered_counter,
                            realm: entry.realm,
                        };
                        outcome.delivered.push(entry.packet);
                    } else {
                        break;
                    }
                }
            }
        }

        if self.heap.is_empty() {
            self.forced = false;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::InternalId;

    fn packet(realm: u8, counter: u16, reordered_counter: u16) -> ProtocolPacket {
        let mut p = ProtocolPacket::new(InternalId::Handshake.as_id(), realm, counter);
        p.set_reordered_counter(reordered_counter);
        p
    }

    #[test]
    fn delivers_in_order_when_contiguous() {
        let mut r = Reorderer::new(8);
        r.push(packet(0, 2, 2));
        r.push(packet(0, 1, 1));
        r.push(packet(0, 3, 3));

        let peer = PeerProgress {
            counter: 0,
            reordered_counter: 0,
            realm: 0,
        };
        let outcome = r.process(peer, false);
        let counters: Vec<u16> = outcome
            .delivered
            .iter()
            .map(|p| p.retrieve_reordered_counter())
            .collect();
        assert_eq!(counters, vec![1, 2, 3]);
        assert_eq!(outcome.lost, 0);
    }

    #[test]
    fn stalls_on_gap_until_forced() {
        let mut r = Reorderer::new(2);
        r.push(packet(0, 2, 2));
        let peer = PeerProgress {
            counter: 0,
            reordered_counter: 0,
            realm: 0,
        };
        let outcome = r.process(peer, false);
        assert!(outcome.delivered.is_empty());
        assert!(!r.is_forced());

        // filling to capacity trips forced mode
        r.push(packet(0, 3, 3));
        assert!(r.is_forced());
        let outcome = r.process(peer, false);
        assert_eq!(outcome.delivered.len(), 2);
    }

    #[test]
    fn do_not_reorder_packets_bypass_the_heap() {
        let mut r = Reorderer::new(8);
        let mut p = packet(0, 5, 5);
        p.do_not_reorder();
        r.push(p);
        assert!(r.is_empty());
    }

    #[test]
    fn old_counter_is_dropped_and_counted() {
        let mut r = Reorderer::new(8);
        r.push(packet(0, 0, 0));
        let peer = PeerProgress {
            counter: 5,
            reordered_counter: 5,
            realm: 0,
        };
        let outcome = r.process(peer, false);
        assert!(outcome.delivered.is_empty());
        assert_eq!(outcome.lost, 1);
    }
}
