//! Defragmentation side of spec.md §4.1/§4.2, grounded in the original
//! source's `PacketDefragmentation` (`C_protocol.cpp`). The fragmenting
//! side lives on [`crate::packet::ProtocolPacket::fragment`] directly,
//! mirroring the original's `ProtocolPacket::fragment` member; this module
//! is the receiving counterpart, reassembling carriers keyed by the
//! fragment-group id carried in their `realm` byte (see DESIGN.md "Open
//! Question Resolutions").

use crate::error::FragmentError;
use crate::header::{HeaderView, HEADER_SIZE};
use crate::identity::Identity;
use crate::packet::ProtocolPacket;

enum Slot {
    Missing,
    Present(ProtocolPacket),
}

struct Group {
    id: u8,
    fragments: Vec<Slot>,
    received: usize,
}

/// Outcome of feeding one carrier into the [`Defragmenter`].
#[derive(Debug, Eq, PartialEq)]
pub enum Progress {
    /// Still waiting on more fragments for this group.
    Waiting,
    /// Every fragment for this group has arrived; call
    /// [`Defragmenter::retrieve`] to reassemble it.
    Retrievable,
    /// The group was dropped — either a duplicate/out-of-range fragment
    /// arrived (spec.md §4.2, a defensive measure against forged fragment
    /// counts) or the per-peer group cap evicted it.
    Discarded,
}

/// Per-peer fragment reassembly buffer (spec.md §4.2).
pub struct Defragmenter {
    groups: Vec<Group>,
    max_groups: usize,
}

impl Defragmenter {
    pub fn new(max_groups: usize) -> Defragmenter {
        Defragmenter {
            groups: Vec::new(),
            max_groups,
        }
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }

    /// Feeds one fragment carrier into the reassembly buffer. `carrier`
    /// must have already had its fragment-total meta consumed via
    /// [`ProtocolPacket::take_fragment_total`]; `fragment_total` and
    /// `fragment_index` come from the carrier's header/meta.
    pub fn process(
        &mut self,
        group_id: u8,
        fragment_index: u16,
        fragment_total: u16,
        carrier: ProtocolPacket,
    ) -> Result<Progress, FragmentError> {
        if let Some(pos) = self.groups.iter().position(|g| g.id == group_id) {
            let group = &mut self.groups[pos];
            let index = fragment_index as usize;
            if index >= group.fragments.len() {
                self.groups.remove(pos);
                return Err(FragmentError::GroupDiscarded);
            }
            if matches!(group.fragments[index], Slot::Present(_)) {
                // Duplicate fragment: the whole group is discarded rather
                // than silently overwritten, since a legitimate sender
                // never retransmits an individual fragment carrier (the
                // carrier itself goes through the normal ack/retransmit
                // cache as a whole).
                self.groups.remove(pos);
                return Err(FragmentError::GroupDiscarded);
            }
            group.fragments[index] = Slot::Present(carrier);
            group.received += 1;
            if group.received == group.fragments.len() {
                return Ok(Progress::Retrievable);
            }
            return Ok(Progress::Waiting);
        }

        if fragment_total == 0 {
            return Err(FragmentError::GroupDiscarded);
        }

        if self.groups.len() >= self.max_groups {
            // spec.md §9 resolved open question: the original has no
            // explicit eviction policy ("TODO: remove the oldest data if
            // the cache is full"); we evict the oldest group by insertion
            // order.
            self.groups.remove(0);
        }

        let mut fragments = Vec::with_capacity(fragment_total as usize);
        fragments.resize_with(fragment_total as usize, || Slot::Missing);
        let index = fragment_index as usize;
        if index >= fragments.len() {
            return Err(FragmentError::GroupDiscarded);
        }
        fragments[index] = Slot::Present(carrier);
        self.groups.push(Group {
            id: group_id,
            fragments,
            received: 1,
        });
        Ok(Progress::Waiting)
    }

    /// Reassembles and removes a group that [`Defragmenter::process`]
    /// reported as [`Progress::Retrievable`]. The carriers' concatenated
    /// payloads are the source packet's own header followed by its payload
    /// (see [`crate::packet::ProtocolPacket::fragment`]), so the original
    /// identifier/flags/realm/counter/reordered-counter come back exactly
    /// as they went in rather than being synthesized from the fragment
    /// carrier's own (unrelated) header.
    pub fn retrieve(&mut self, group_id: u8, peer: Identity, timestamp: u16) -> Option<ProtocolPacket> {
        let pos = self.groups.iter().position(|g| g.id == group_id)?;
        let group = self.groups.remove(pos);

        let mut source = Vec::new();
        for slot in &group.fragments {
            match slot {
                Slot::Present(p) => source.extend_from_slice(p.payload()),
                Slot::Missing => return None,
            }
        }

        if source.len() < HEADER_SIZE {
            return None;
        }
        let header = HeaderView::parse(&source[..HEADER_SIZE])?;
        Some(ProtocolPacket::from_header(header, &source[HEADER_SIZE..], peer, timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IpAddr;

    fn carrier_with(payload: &[u8]) -> ProtocolPacket {
        let mut p = ProtocolPacket::new(6, 0, 0);
        p.append_payload(payload);
        p
    }

    #[test]
    fn reassembles_once_all_fragments_arrive() {
        let mut d = Defragmenter::new(16);
        let peer = Identity::new(IpAddr::V4(1), 100);

        let mut original = ProtocolPacket::new(55, 0, 7);
        original.append_payload(b"hello world");
        let group_id = original.retrieve_counter() as u8;
        let fragments = original.fragment(12).unwrap();
        assert!(fragments.len() > 1);

        let mut outcome = Progress::Waiting;
        for (i, mut carrier) in fragments.into_iter().enumerate() {
            let total = carrier.take_fragment_total().unwrap();
            outcome = d.process(group_id, i as u16, total, carrier).unwrap();
        }
        assert_eq!(outcome, Progress::Retrievable);

        let reassembled = d.retrieve(group_id, peer, 123).unwrap();
        assert_eq!(reassembled.payload(), b"hello world");
        assert_eq!(reassembled.retrieve_identifier(), 55);
        assert_eq!(reassembled.retrieve_counter(), 7);
        assert_eq!(reassembled.peer, peer);
    }

    #[test]
    fn duplicate_fragment_discards_whole_group() {
        let mut d = Defragmenter::new(16);
        d.process(1, 0, 2, carrier_with(b"a")).unwrap();
        let result = d.process(1, 0, 2, carrier_with(b"a-again"));
        assert!(matches!(result, Err(FragmentError::GroupDiscarded)));
        assert!(d.retrieve(1, Identity::none(), 0).is_none());
    }

    #[test]
    fn out_of_range_index_discards_the_group() {
        let mut d = Defragmenter::new(16);
        d.process(1, 0, 2, carrier_with(b"a")).unwrap();
        let result = d.process(1, 5, 2, carrier_with(b"b"));
        assert!(matches!(result, Err(FragmentError::GroupDiscarded)));
    }

    #[test]
    fn evicts_oldest_group_once_over_capacity() {
        let mut d = Defragmenter::new(1);
        d.process(1, 0, 2, carrier_with(b"a")).unwrap();
        d.process(2, 0, 2, carrier_with(b"b")).unwrap();
        // Group 1 was evicted to make room for group 2.
        assert!(d.retrieve(1, Identity::none(), 0).is_none());
    }
}
