//! A fixed-length bit vector representing piece availability, wire-compatible
//! with the BITFIELD message (spec.md §4.1).
//!
//! Storage is MSB-first within each byte: the highest bit of the first byte
//! represents index 0, the second highest index 1, and so on. This matches
//! the wire format exactly, so serializing is a zero-copy byte view.

use bitvec::prelude::{BitVec, Msb0};

use crate::error::Error;

/// A compact bool vector, MSB-first, used both for our own piece
/// availability ("have") and for a remote peer's advertised availability.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitfield(BitVec<Msb0, u8>);

impl Bitfield {
    /// Creates a new bitfield with `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        let mut bits: BitVec<Msb0, u8> = BitVec::with_capacity(len);
        bits.resize(len, false);
        Self(bits)
    }

    /// Creates a bitfield from a byte slice received on the wire, validating
    /// that spare bits in the trailing byte are zero.
    ///
    /// `bit_len` is the logical number of bits the message represents (e.g.
    /// the torrent's piece count); `bytes` is `ceil(bit_len / 8)` long.
    pub fn from_wire_bytes(bytes: &[u8], bit_len: usize) -> Result<Self, Error> {
        let expected_byte_len = (bit_len + 7) / 8;
        if bytes.len() != expected_byte_len {
            return Err(Error::Protocol(crate::error::ProtocolError::BadPayload));
        }
        let mut bits: BitVec<Msb0, u8> = BitVec::from_slice(bytes);
        // any bits beyond bit_len live in the trailing byte; they must be zero
        for i in bit_len..bits.len() {
            if bits[i] {
                return Err(Error::Protocol(
                    crate::error::ProtocolError::SpareBitsSet,
                ));
            }
        }
        bits.truncate(bit_len);
        Ok(Self(bits))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty_bitfield(&self) -> bool {
        self.0.is_empty()
    }

    /// Resizes the bitfield, filling any newly added bits with `value`.
    pub fn resize(&mut self, new_len: usize, value: bool) {
        self.0.resize(new_len, value);
    }

    pub fn set(&mut self, index: usize) {
        self.0.set(index, true);
    }

    pub fn clear(&mut self, index: usize) {
        self.0.set(index, false);
    }

    pub fn test(&self, index: usize) -> bool {
        self.0[index]
    }

    /// Sets every bit in `[lo, hi)`.
    pub fn set_range(&mut self, lo: usize, hi: usize) {
        for i in lo..hi {
            self.0.set(i, true);
        }
    }

    /// Clears every bit in `[lo, hi)`.
    pub fn clear_range(&mut self, lo: usize, hi: usize) {
        for i in lo..hi {
            self.0.set(i, false);
        }
    }

    /// Returns the number of set bits.
    pub fn popcount(&self) -> usize {
        self.0.count_ones()
    }

    /// Returns true iff no bit is set.
    pub fn is_empty(&self) -> bool {
        self.popcount() == 0
    }

    /// Returns true iff every bit is set.
    pub fn all(&self) -> bool {
        self.0.count_zeros() == 0
    }

    /// Returns the wire-ready MSB-first byte representation, with any spare
    /// bits in the trailing byte set to zero (the invariant spec.md §4.1
    /// requires is upheld by construction: clear/set only ever touch bits
    /// within `len`).
    pub fn byte_view(&self) -> &[u8] {
        self.0.as_raw_slice()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().filter_map(|(i, b)| if *b { Some(i) } else { None })
    }
}

impl std::ops::Index<usize> for Bitfield {
    type Output = bool;

    fn index(&self, index: usize) -> &bool {
        if self.0[index] {
            &true
        } else {
            &false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_is_all_clear() {
        let bf = Bitfield::new(10);
        assert_eq!(bf.len(), 10);
        assert!(bf.is_empty());
        assert!(!bf.all());
    }

    #[test]
    fn test_set_clear_test() {
        let mut bf = Bitfield::new(8);
        bf.set(0);
        bf.set(7);
        assert!(bf.test(0));
        assert!(bf.test(7));
        assert!(!bf.test(1));
        assert_eq!(bf.popcount(), 2);
        bf.clear(0);
        assert!(!bf.test(0));
        assert_eq!(bf.popcount(), 1);
    }

    #[test]
    fn test_set_range_clear_range() {
        let mut bf = Bitfield::new(16);
        bf.set_range(2, 6);
        assert_eq!(bf.popcount(), 4);
        for i in 2..6 {
            assert!(bf.test(i));
        }
        bf.clear_range(3, 5);
        assert_eq!(bf.popcount(), 2);
        assert!(bf.test(2));
        assert!(!bf.test(3));
        assert!(!bf.test(4));
        assert!(bf.test(5));
    }

    #[test]
    fn test_round_trip_serialization() {
        // 10 bits spans 2 bytes, with 6 spare bits in the trailing byte
        let mut bf = Bitfield::new(10);
        bf.set(0);
        bf.set(9);
        let bytes = bf.byte_view().to_vec();
        let round_tripped = Bitfield::from_wire_bytes(&bytes, 10).unwrap();
        assert_eq!(bf, round_tripped);
    }

    #[test]
    fn test_spare_bits_set_is_protocol_violation() {
        // 10 bits -> 2 bytes; set a bit past index 10 (bit 15, the very last
        // spare bit) to simulate a misbehaving peer
        let bytes = [0b0000_0000, 0b0000_0001];
        let err = Bitfield::from_wire_bytes(&bytes, 10).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(crate::error::ProtocolError::SpareBitsSet)
        ));
    }

    #[test]
    fn test_wrong_byte_len_is_protocol_violation() {
        let bytes = [0u8; 3];
        let err = Bitfield::from_wire_bytes(&bytes, 10).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(crate::error::ProtocolError::BadPayload)
        ));
    }
}
