//! Return-packet scheduler (spec.md §4.8, §6.5): the periodic piggy-backed
//! packet each side sends the other carrying acknowledgement labels, the
//! one-way latency ping-pong, and a handful of small out-of-band events.
//! Grounded in the original source's `ClientSideNetUdp::resetReturnPacket`/
//! `startReturnEvent`/`endReturnEvent` (`C_netClient.cpp`) and
//! `OneWayLatencyPlanner` for the latency block.

use crate::cache::Label;
use crate::config::BAD_LATENCY;
use crate::error::ReturnPacketError;
use crate::header::InternalId;
use crate::latency::LatencyPlanner;
use crate::packet::ProtocolPacket;
use crate::time::{now_full_ms, now_ms};

/// Opaque scene-object identifier carried by `REVT_OBJECT` events (spec.md
/// §6.5). This transport has no scene-object model of its own, so it is
/// passed through as a plain integer handle rather than modeled further.
pub type ObjectSid = u32;

/// Kinds of out-of-band event a return packet can carry (spec.md §6.5).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u16)]
pub enum ReturnEvent {
    Simple = 0,
    Object = 1,
    AskFullUpdate = 2,
    Custom = 3,
}

/// `sync-stat` flag: set when a return packet's latency block is echoing
/// back a timestamp the peer asked us to (spec.md §6.5, §4.4).
const HAVE_ECHOED_TS: u8 = 0b0000_0001;

/// The latency block every return packet carries (spec.md §6.5, §4.4): a
/// timestamp ping-pong used to measure one-way latency without relying on
/// synchronized clocks, plus a full 64-bit timestamp for clock-offset
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyBlock {
    pub our_ts: u16,
    pub corrector: u16,
    pub our_latency: u16,
    pub full_ts: u64,
    pub sync_stat: u8,
    pub echoed_ts: Option<u16>,
}

impl LatencyBlock {
    fn write(&self, packet: &mut ProtocolPacket) {
        packet.append_payload(&self.our_ts.to_be_bytes());
        packet.append_payload(&self.corrector.to_be_bytes());
        packet.append_payload(&self.our_latency.to_be_bytes());
        packet.append_payload(&self.full_ts.to_be_bytes());
        packet.append_payload(&[self.sync_stat]);
        if self.sync_stat & HAVE_ECHOED_TS != 0 {
            packet.append_payload(&self.echoed_ts.unwrap_or(0).to_be_bytes());
        }
    }

    fn read(payload: &[u8]) -> Option<(LatencyBlock, usize)> {
        if payload.len() < 15 {
            return None;
        }
        let our_ts = u16::from_be_bytes([payload[0], payload[1]]);
        let corrector = u16::from_be_bytes([payload[2], payload[3]]);
        let our_latency = u16::from_be_bytes([payload[4], payload[5]]);
        let full_ts = u64::from_be_bytes(payload[6..14].try_into().ok()?);
        let sync_stat = payload[14];
        let mut consumed = 15;

        let echoed_ts = if sync_stat & HAVE_ECHOED_TS != 0 {
            if payload.len() < consumed + 2 {
                return None;
            }
            let ts = u16::from_be_bytes([payload[consumed], payload[consumed + 1]]);
            consumed += 2;
            Some(ts)
        } else {
            None
        };

        Some((
            LatencyBlock { our_ts, corrector, our_latency, full_ts, sync_stat, echoed_ts },
            consumed,
        ))
    }
}

/// Builds the latency block for an outgoing return packet: stamps the
/// current timestamp as a fresh corrector request, echoes back whatever
/// timestamp the peer last asked us to, and reports the freshest
/// round-trip estimate this side has measured (spec.md §4.4).
pub fn build_latency_block(latency: &mut LatencyPlanner) -> LatencyBlock {
    let our_ts = now_ms();
    let full_ts = now_full_ms();

    let echoed_ts = latency.take_pending_echo();
    let mut sync_stat = 0u8;
    if echoed_ts.is_some() {
        sync_stat |= HAVE_ECHOED_TS;
    }

    // Ask the peer to echo `our_ts` back; the round trip is measured once
    // it comes back through `apply_latency_block` on this side.
    latency.set_corrector_timestamp(our_ts);

    let our_latency = latency.round_trip_time_ms().map(|rtt| rtt / 2).unwrap_or(BAD_LATENCY);
    let corrector = latency.smoothed_offset_ms().map(|offset| offset as u16).unwrap_or(0);

    LatencyBlock { our_ts, corrector, our_latency, full_ts, sync_stat, echoed_ts }
}

/// Applies a received return packet's latency block to `latency`: remembers
/// the peer's timestamp so it gets echoed back on the next cycle, and — if
/// the peer just echoed one of ours back — measures the round trip and
/// records it as the leg `is_server` says this side measured (spec.md §4.4:
/// each side measures its own leg rather than trusting a peer-reported
/// number).
pub fn apply_latency_block(latency: &mut LatencyPlanner, block: &LatencyBlock, is_server: bool) {
    latency.note_peer_timestamp(block.our_ts);
    if block.sync_stat & HAVE_ECHOED_TS != 0 {
        if let Some(measured) = latency.take_corrector_latency_ms(now_ms()) {
            if is_server {
                latency.set_stoc_latency_ms(measured);
            } else {
                latency.set_ctos_latency_ms(measured);
            }
        }
    }
}

/// Accumulates events and acknowledgement labels for one return-packet
/// cycle, then bakes them into a `ProtocolPacket` (spec.md §4.8).
pub struct ReturnPacketBuilder {
    event_count: u16,
    body: Vec<u8>,
    asking_full_update: bool,
}

impl ReturnPacketBuilder {
    pub fn new() -> ReturnPacketBuilder {
        ReturnPacketBuilder {
            event_count: 0,
            body: Vec::new(),
            asking_full_update: false,
        }
    }

    fn push_event(&mut self, kind: ReturnEvent, payload: &[u8]) -> Result<(), ReturnPacketError> {
        if self.event_count == u16::MAX {
            return Err(ReturnPacketError::TooManyEvents);
        }
        self.event_count += 1;
        self.body.extend_from_slice(&(kind as u16).to_be_bytes());
        self.body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        self.body.extend_from_slice(payload);
        Ok(())
    }

    pub fn simple_event(&mut self, id: u16) -> Result<(), ReturnPacketError> {
        self.push_event(ReturnEvent::Simple, &id.to_be_bytes())
    }

    /// Reports an event bound to a scene object (spec.md §6.5 `REVT_OBJECT`).
    pub fn object_event(
        &mut self,
        command_index: u16,
        parent: ObjectSid,
        target: ObjectSid,
        body: &[u8],
    ) -> Result<(), ReturnPacketError> {
        let mut payload = Vec::with_capacity(2 + 4 + 4 + body.len());
        payload.extend_from_slice(&command_index.to_be_bytes());
        payload.extend_from_slice(&parent.to_be_bytes());
        payload.extend_from_slice(&target.to_be_bytes());
        payload.extend_from_slice(body);
        self.push_event(ReturnEvent::Object, &payload)
    }

    /// Reports an opaque application-defined event (spec.md §6.5
    /// `REVT_CUSTOM`).
    pub fn custom_event(&mut self, body: &[u8]) -> Result<(), ReturnPacketError> {
        self.push_event(ReturnEvent::Custom, body)
    }

    /// Requests a full state resync from the peer. Idempotent within one
    /// cycle, matching the original's `g_isAskingFullUpdate` latch.
    pub fn ask_full_update(&mut self) -> Result<bool, ReturnPacketError> {
        if self.asking_full_update {
            return Ok(false);
        }
        self.asking_full_update = true;
        self.push_event(ReturnEvent::AskFullUpdate, &[])?;
        Ok(true)
    }

    /// Bakes the accumulated events, the latency block, and the peer's
    /// acknowledgement labels into a return packet (spec.md §6.5 wire
    /// layout: event count, events, latency block, then ack-label count and
    /// labels).
    pub fn finalize(
        self,
        realm: u8,
        counter: u16,
        acknowledged: &[Label],
        latency: LatencyBlock,
    ) -> Result<ProtocolPacket, ReturnPacketError> {
        if acknowledged.len() > u32::MAX as usize {
            return Err(ReturnPacketError::TooManyEvents);
        }

        let mut packet = ProtocolPacket::new(InternalId::ReturnPacket.as_id(), realm, counter);
        packet.append_payload(&self.event_count.to_be_bytes());
        packet.append_payload(&self.body);
        latency.write(&mut packet);
        packet.append_payload(&(acknowledged.len() as u32).to_be_bytes());
        for label in acknowledged {
            packet.append_payload(&label.counter.to_be_bytes());
            packet.append_payload(&[label.realm]);
        }
        Ok(packet)
    }
}

impl Default for ReturnPacketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the latency block back out of a received return packet's payload,
/// after the event section has already been parsed and skipped by the
/// caller. Returns the block and how many bytes it consumed.
pub fn read_latency_block(payload: &[u8]) -> Option<(LatencyBlock, usize)> {
    LatencyBlock::read(payload)
}

/// Reads the acknowledgement labels back out of a received return packet's
/// payload, after the event section and latency block have already been
/// parsed and skipped by the caller.
pub fn read_acknowledged_labels(mut payload: &[u8]) -> Option<Vec<Label>> {
    if payload.len() < 4 {
        return None;
    }
    let count = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    payload = &payload[4..];

    let mut labels = Vec::with_capacity(count);
    for _ in 0..count {
        if payload.len() < 3 {
            return None;
        }
        let counter = u16::from_be_bytes([payload[0], payload[1]]);
        let realm = payload[2];
        labels.push(Label { counter, realm });
        payload = &payload[3..];
    }
    Some(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_latency_block() -> LatencyBlock {
        LatencyBlock {
            our_ts: 1000,
            corrector: 0,
            our_latency: BAD_LATENCY,
            full_ts: 1_700_000_000_000,
            sync_stat: 0,
            echoed_ts: None,
        }
    }

    #[test]
    fn finalize_round_trips_ack_labels() {
        let mut builder = ReturnPacketBuilder::new();
        builder.simple_event(42).unwrap();
        let labels = vec![Label { counter: 1, realm: 0 }, Label { counter: 2, realm: 0 }];
        let packet = builder.finalize(0, 0, &labels, test_latency_block()).unwrap();

        let event_count = u16::from_be_bytes([packet.payload()[0], packet.payload()[1]]);
        assert_eq!(event_count, 1);

        // skip event-count(2) + event(kind 2 + len 2 + payload 2) = 2 + 6
        let after_events = &packet.payload()[8..];
        let (block, consumed) = read_latency_block(after_events).unwrap();
        assert_eq!(block, test_latency_block());

        let parsed = read_acknowledged_labels(&after_events[consumed..]).unwrap();
        assert_eq!(parsed, labels);
    }

    #[test]
    fn finalize_writes_echoed_timestamp_when_present() {
        let builder = ReturnPacketBuilder::new();
        let mut block = test_latency_block();
        block.sync_stat = HAVE_ECHOED_TS;
        block.echoed_ts = Some(777);
        let packet = builder.finalize(0, 0, &[], block).unwrap();

        // skip event-count(2), no events
        let after_events = &packet.payload()[2..];
        let (parsed, consumed) = read_latency_block(after_events).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(consumed, 17); // 15 base bytes + 2 for echoed-ts
    }

    #[test]
    fn ask_full_update_is_idempotent_per_cycle() {
        let mut builder = ReturnPacketBuilder::new();
        assert!(builder.ask_full_update().unwrap());
        assert!(!builder.ask_full_update().unwrap());
    }

    #[test]
    fn object_and_custom_events_round_trip_through_the_wire_cursor() {
        let mut builder = ReturnPacketBuilder::new();
        builder.object_event(5, 10, 20, b"obj").unwrap();
        builder.custom_event(b"custom").unwrap();
        let packet = builder.finalize(0, 0, &[], test_latency_block()).unwrap();

        let event_count = u16::from_be_bytes([packet.payload()[0], packet.payload()[1]]);
        assert_eq!(event_count, 2);
    }
}
