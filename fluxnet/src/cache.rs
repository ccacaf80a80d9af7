//! Ack-and-retransmit cache (spec.md §4.5), grounded in the original
//! source's `PacketCache` (`C_protocol.cpp`): every packet sent with
//! `DO_NOT_DISCARD` unset is held here until the peer acknowledges it by
//! label, and is retransmitted on an escalating timer up to a fixed retry
//! limit before being given up on.

use std::time::{Duration, Instant};

use crate::packet::ProtocolPacket;

/// Identifies a cached packet the same way the peer's return-packet
/// acknowledgements do: by `(counter, realm)` (spec.md §4.5, §6.5).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Label {
    pub counter: u16,
    pub realm: u8,
}

struct Entry {
    packet: ProtocolPacket,
    label: Label,
    sent_at: Instant,
    try_count: u32,
}

/// What [`Cache::process`] wants the caller to do with a packet that missed
/// its acknowledgement window.
pub enum Retransmit {
    /// Resend this packet; it has been re-stamped with a fresh send time.
    Resend(ProtocolPacket),
    /// The retry limit was reached; the packet is gone and the caller
    /// should count it as lost (spec.md §4.5 "après N tentatives").
    GivenUp,
}

/// Per-peer retransmission cache.
pub struct Cache {
    entries: Vec<Entry>,
    capacity: usize,
    retry_limit: u32,
    enabled: bool,
    alarm: bool,
}

impl Cache {
    pub fn new(capacity: usize, retry_limit: u32) -> Cache {
        Cache {
            entries: Vec::with_capacity(capacity),
            capacity,
            retry_limit,
            enabled: true,
            alarm: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_alarmed(&self) -> bool {
        self.alarm
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.alarm = false;
    }

    /// Stores a copy of `packet` for retransmission bookkeeping. No-op if
    /// the cache is disabled (e.g. during the handshake, before ordering is
    /// meaningful).
    pub fn push(&mut self, packet: ProtocolPacket) {
        if !self.enabled {
            return;
        }
        let label = Label {
            counter: packet.retrieve_counter(),
            realm: packet.retrieve_realm(),
        };
        self.entries.push(Entry {
            packet,
            label,
            sent_at: Instant::now(),
            try_count: 0,
        });
        if self.entries.len() >= self.capacity {
            self.alarm = true;
        }
    }

    /// Drops every cached packet whose label appears in `labels`, as
    /// reported by the peer's piggy-backed acknowledgements (spec.md §6.5).
    pub fn acknowledge(&mut self, labels: &[Label]) {
        if self.entries.is_empty() {
            self.alarm = false;
            return;
        }
        self.entries.retain(|e| !labels.contains(&e.label));
        if self.entries.is_empty() {
            self.alarm = false;
        }
    }

    /// Scans for entries that have exceeded `delay` since their last send,
    /// returning a [`Retransmit`] action for each one. Entries that reach
    /// the retry limit are removed; everything else is re-stamped with the
    /// current time so the next scan measures from now.
    pub fn process(&mut self, delay: Duration) -> Vec<Retransmit> {
        let now = Instant::now();
        let mut actions = Vec::new();
        let mut needs_alarm = false;

        self.entries.retain_mut(|entry| {
            if now.duration_since(entry.sent_at) >= delay {
                if entry.try_count >= self.retry_limit {
                    actions.push(Retransmit::GivenUp);
                    return false;
                }
                entry.try_count += 1;
                entry.sent_at = now;
                actions.push(Retransmit::Resend(entry.packet.clone()));
                needs_alarm = true;
            } else if entry.try_count > 0 {
                needs_alarm = true;
            }
            true
        });

        // The capacity alarm persists until the cache actually drains back
        // under capacity (spec.md §4.5); a tick where nothing happened to
        // be due for retransmit yet must not clear an alarm `push` raised.
        self.alarm = needs_alarm || self.entries.len() >= self.capacity;
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::InternalId;
    use std::thread::sleep;

    fn packet(counter: u16, realm: u8) -> ProtocolPacket {
        ProtocolPacket::new(InternalId::Handshake.as_id(), realm, counter)
    }

    #[test]
    fn push_then_acknowledge_clears_entry() {
        let mut cache = Cache::new(512, 3);
        cache.push(packet(1, 0));
        assert!(!cache.is_empty());
        cache.acknowledge(&[Label { counter: 1, realm: 0 }]);
        assert!(cache.is_empty());
    }

    #[test]
    fn process_resends_after_delay_elapses() {
        let mut cache = Cache::new(512, 3);
        cache.push(packet(1, 0));
        sleep(Duration::from_millis(5));
        let actions = cache.process(Duration::from_millis(1));
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Retransmit::Resend(_)));
    }

    #[test]
    fn process_leaves_fresh_entries_alone() {
        let mut cache = Cache::new(512, 3);
        cache.push(packet(1, 0));
        let actions = cache.process(Duration::from_secs(60));
        assert!(actions.is_empty());
        assert!(!cache.is_empty());
    }

    #[test]
    fn alarm_raised_when_capacity_reached() {
        let mut cache = Cache::new(1, 3);
        cache.push(packet(1, 0));
        assert!(cache.is_alarmed());
    }

    #[test]
    fn alarm_persists_across_process_while_still_over_capacity() {
        let mut cache = Cache::new(1, 3);
        cache.push(packet(1, 0));
        assert!(cache.is_alarmed());

        // Nothing is due for retransmit yet, but the cache is still over
        // capacity; the alarm must not be cleared.
        let actions = cache.process(Duration::from_secs(60));
        assert!(actions.is_empty());
        assert!(cache.is_alarmed());
    }
}
