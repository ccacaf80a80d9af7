//! Bit-exact wire header (spec.md §6.1) and in-place flag/field access.
//!
//! ```text
//! offset 0 : u16  header-id   (low 10 bits = identifier, high 6 bits = flags)
//! offset 2 : u8   realm
//! offset 3 : u16  counter
//! offset 5 : u16  reordered-counter
//! ```
//!
//! All multi-byte fields are big-endian (spec.md §6.4). This mirrors the
//! teacher's `net::frame` module, which parses its own (different) header
//! directly out of a byte slice with `byteorder`, rather than deriving a
//! serde-based wire format.

use byteorder::{BigEndian, ByteOrder};

/// Total header size on the wire.
pub const HEADER_SIZE: usize = 7;

pub type IdentifierType = u16;
pub type RealmType = u8;
pub type CounterType = u16;

/// Low 10 bits of the header-id: up to 1024 internal/application identifiers.
pub const ID_MASK: u16 = 0x03FF;
/// High 6 bits of the header-id: flag bits.
pub const FLAGS_MASK: u16 = !ID_MASK;

/// A tiny hand-rolled bitflags macro. The teacher's `net` module doesn't
/// pull in the `bitflags` crate for its one flag byte either, so this keeps
/// the same "plain `u16` plus named masks" idiom instead of adding a new
/// dependency for six bits.
macro_rules! bitflags_like {
    (pub struct $name:ident: $repr:ty { $(const $variant:ident = $value:expr;)* }) => {
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
        pub struct $name(pub $repr);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            #[inline]
            pub const fn empty() -> Self {
                $name(0)
            }

            #[inline]
            pub const fn bits(self) -> $repr {
                self.0
            }

            #[inline]
            pub const fn contains(self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            #[inline]
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like! {
    pub struct Flags: u16 {
        const DO_NOT_REORDER  = 1 << 10;
        const DO_NOT_DISCARD  = 1 << 11;
        const DO_NOT_FRAGMENT = 1 << 12;
        const COMPRESSED      = 1 << 13;
        const FRAGMENTED      = 1 << 14;
        const RESERVED        = 1 << 15;
    }
}

/// Known internal packet identifiers (spec.md §6.2). Application identifiers
/// use the remaining values of the 10-bit id space (0..1024).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u16)]
pub enum InternalId {
    Handshake = 0,
    MtuTest = 1,
    MtuTestResponse = 2,
    MtuAsk = 3,
    MtuAskResponse = 4,
    MtuFinal = 5,
    FragmentedPacket = 6,
    CryptHandshake = 7,
    ReturnPacket = 8,
    Disconnect = 9,
}

impl InternalId {
    pub const fn as_id(self) -> IdentifierType {
        self as u16
    }
}

/// A parsed, read-only view of the header fields, extracted without
/// consuming any read cursor (spec.md §4.1 `retrieve*`).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HeaderView {
    pub identifier: IdentifierType,
    pub flags: Flags,
    pub realm: RealmType,
    pub counter: CounterType,
    pub reordered_counter: CounterType,
}

impl HeaderView {
    /// Parses the first [`HEADER_SIZE`] bytes of `data`. Fails if the
    /// buffer is shorter than the header (spec.md §4.1).
    pub fn parse(data: &[u8]) -> Option<HeaderView> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let header_id = BigEndian::read_u16(&data[0..2]);
        Some(HeaderView {
            identifier: header_id & ID_MASK,
            flags: Flags(header_id & FLAGS_MASK),
            realm: data[2],
            counter: BigEndian::read_u16(&data[3..5]),
            reordered_counter: BigEndian::read_u16(&data[5..7]),
        })
    }

    /// Serializes the header fields into `out[0..HEADER_SIZE]`.
    pub fn write(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= HEADER_SIZE);
        let header_id = (self.identifier & ID_MASK) | (self.flags.bits() & FLAGS_MASK);
        BigEndian::write_u16(&mut out[0..2], header_id);
        out[2] = self.realm;
        BigEndian::write_u16(&mut out[3..5], self.counter);
        BigEndian::write_u16(&mut out[5..7], self.reordered_counter);
    }
}

/// In-place flag mutation on a raw header-id field, used by
/// `ProtocolPacket::add_flags`/`remove_flags` without a full parse/rewrite.
#[inline]
pub fn add_flags_in_place(data: &mut [u8], flags: Flags) {
    let mut header_id = BigEndian::read_u16(&data[0..2]);
    header_id |= flags.bits() & FLAGS_MASK;
    BigEndian::write_u16(&mut data[0..2], header_id);
}

#[inline]
pub fn remove_flags_in_place(data: &mut [u8], flags: Flags) {
    let mut header_id = BigEndian::read_u16(&data[0..2]);
    header_id &= !(flags.bits() & FLAGS_MASK);
    BigEndian::write_u16(&mut data[0..2], header_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let view = HeaderView {
            identifier: 42,
            flags: Flags::COMPRESSED | Flags::DO_NOT_DISCARD,
            realm: 3,
            counter: 1000,
            reordered_counter: 999,
        };
        let mut buf = [0u8; HEADER_SIZE];
        view.write(&mut buf);
        let parsed = HeaderView::parse(&buf).unwrap();
        assert_eq!(parsed, view);
    }

    #[test]
    fn truncated_buffer_fails_to_parse() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert!(HeaderView::parse(&buf).is_none());
    }

    #[test]
    fn add_remove_flags_in_place_preserve_identifier() {
        let mut buf = [0u8; HEADER_SIZE];
        let view = HeaderView {
            identifier: InternalId::Handshake.as_id(),
            flags: Flags::empty(),
            realm: 0,
            counter: 0,
            reordered_counter: 0,
        };
        view.write(&mut buf);

        add_flags_in_place(&mut buf, Flags::DO_NOT_REORDER);
        let after_add = HeaderView::parse(&buf).unwrap();
        assert!(after_add.flags.contains(Flags::DO_NOT_REORDER));
        assert_eq!(after_add.identifier, InternalId::Handshake.as_id());

        remove_flags_in_place(&mut buf, Flags::DO_NOT_REORDER);
        let after_remove = HeaderView::parse(&buf).unwrap();
        assert!(!after_remove.flags.contains(Flags::DO_NOT_REORDER));
    }

    #[test]
    fn id_and_flags_masks_partition_the_16_bits() {
        assert_eq!(ID_MASK ^ FLAGS_MASK, 0xFFFF);
        assert_eq!(ID_MASK & FLAGS_MASK, 0);
    }
}
