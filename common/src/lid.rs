// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! 256-bit Label Identifiers (LIDs) and their IPv6 encoding.
//!
//! Every edge in the overlay is assigned a one-hot LID by the resource
//! manager.  A forwarding identifier for a set of edges is the bitwise union
//! of their LIDs.  A LID is carried in packets as a pair of IPv6 addresses:
//! the source address holds bits [0,128) and the destination address holds
//! bits [128,256).
//!
//! Bit `i` of a LID is stored at byte `i / 8` with weight `1 << (i % 8)`.
//! With that layout the address mapping is a straight byte copy, and it is
//! bit-for-bit the encoding the switches match on: the first transmitted
//! address octet carries bits 0..8 of the identifier, least-significant bit
//! first.  The resource manager's wire form is a 256-character '0'/'1'
//! string in the opposite bit order; `from_wire`/`to_wire` apply that
//! reversal.  Both orders must be preserved exactly or addresses stop
//! round-tripping against rules installed by other deployments.

use std::fmt;
use std::net::Ipv6Addr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Width of a label identifier in bits.
pub const LID_BITS: u16 = 256;
const LID_BYTES: usize = 32;
const HALF_BYTES: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LidError {
    #[error("bit position {0} outside [0, {LID_BITS})")]
    PositionOutOfRange(u16),
    #[error("wire lid must be {LID_BITS} characters, got {0}")]
    BadWireLength(usize),
    #[error("wire lid may only contain '0' and '1'")]
    BadWireDigit,
}

/// A 256-bit label identifier.  One-hot for a single edge, multi-hot for a
/// multicast combination of edges.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lid([u8; LID_BYTES]);

impl Lid {
    pub const ZERO: Lid = Lid([0; LID_BYTES]);

    /// The one-hot LID with only bit `pos` set.
    pub fn primary(pos: u16) -> Result<Lid, LidError> {
        let mut lid = Lid::ZERO;
        lid.set(pos)?;
        Ok(lid)
    }

    /// The multi-hot LID with exactly the given bits set.  Input order and
    /// duplicates have no effect on the result.
    pub fn combine(
        positions: impl IntoIterator<Item = u16>,
    ) -> Result<Lid, LidError> {
        let mut lid = Lid::ZERO;
        for pos in positions {
            lid.set(pos)?;
        }
        Ok(lid)
    }

    /// Bitwise union of two LIDs.
    pub fn union(&self, other: &Lid) -> Lid {
        let mut out = *self;
        for (o, b) in out.0.iter_mut().zip(other.0.iter()) {
            *o |= b;
        }
        out
    }

    pub fn set(&mut self, pos: u16) -> Result<(), LidError> {
        if pos >= LID_BITS {
            return Err(LidError::PositionOutOfRange(pos));
        }
        self.0[usize::from(pos) / 8] |= 1 << (pos % 8);
        Ok(())
    }

    pub fn get(&self, pos: u16) -> bool {
        pos < LID_BITS && self.0[usize::from(pos) / 8] & (1 << (pos % 8)) != 0
    }

    /// The position of the first set bit, or None for the all-zero LID.
    /// Only meaningful for one-hot LIDs; a multi-hot LID yields its lowest
    /// member.
    pub fn bit_position(&self) -> Option<u16> {
        self.0.iter().enumerate().find(|(_, b)| **b != 0).map(
            |(idx, b)| (idx * 8) as u16 + b.trailing_zeros() as u16,
        )
    }

    /// All set bit positions, ascending.
    pub fn positions(&self) -> Vec<u16> {
        (0..LID_BITS).filter(|p| self.get(*p)).collect()
    }

    pub fn count_ones(&self) -> u32 {
        self.0.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; LID_BYTES]
    }

    /// Split into the (source, destination) address pair: bits [0,128) become
    /// the source address, bits [128,256) the destination address.
    pub fn to_addresses(&self) -> (Ipv6Addr, Ipv6Addr) {
        let mut src = [0u8; HALF_BYTES];
        let mut dst = [0u8; HALF_BYTES];
        src.copy_from_slice(&self.0[..HALF_BYTES]);
        dst.copy_from_slice(&self.0[HALF_BYTES..]);
        (Ipv6Addr::from(src), Ipv6Addr::from(dst))
    }

    /// Reconstruct a LID from a previously rendered address pair.
    pub fn from_addresses(src: Ipv6Addr, dst: Ipv6Addr) -> Lid {
        Lid::from_src_address(src).union(&Lid::from_dst_address(dst))
    }

    /// The LID whose low half is the given source address; the high half is
    /// left zero.
    pub fn from_src_address(src: Ipv6Addr) -> Lid {
        let mut bytes = [0u8; LID_BYTES];
        bytes[..HALF_BYTES].copy_from_slice(&src.octets());
        Lid(bytes)
    }

    /// The LID whose high half is the given destination address; the low
    /// half is left zero.
    pub fn from_dst_address(dst: Ipv6Addr) -> Lid {
        let mut bytes = [0u8; LID_BYTES];
        bytes[HALF_BYTES..].copy_from_slice(&dst.octets());
        Lid(bytes)
    }

    /// Parse the resource manager's wire form: a 256-character '0'/'1'
    /// string whose character `p` corresponds to bit `255 - p`.
    pub fn from_wire(s: &str) -> Result<Lid, LidError> {
        if s.len() != usize::from(LID_BITS) {
            return Err(LidError::BadWireLength(s.len()));
        }
        let mut lid = Lid::ZERO;
        for (idx, c) in s.chars().enumerate() {
            match c {
                '0' => (),
                '1' => lid.set(LID_BITS - 1 - idx as u16)?,
                _ => return Err(LidError::BadWireDigit),
            }
        }
        Ok(lid)
    }

    /// Render the wire form.  Inverse of `from_wire`.
    pub fn to_wire(&self) -> String {
        (0..LID_BITS)
            .map(|p| if self.get(LID_BITS - 1 - p) { '1' } else { '0' })
            .collect()
    }
}

impl fmt::Debug for Lid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Lid{:?}", self.positions())
    }
}

impl fmt::Display for Lid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (src, dst) = self.to_addresses();
        write!(f, "{}/{}", full_form(src), full_form(dst))
    }
}

/// Render an IPv6 address in full form: every group zero-padded to four hex
/// digits, no `::` compression.  This is the form the arbitrary-bitmask
/// rules carry.
pub fn full_form(addr: Ipv6Addr) -> String {
    let groups = addr.segments();
    let mut out = String::with_capacity(39);
    for (i, g) in groups.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&format!("{g:04x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_round_trip() {
        for pos in 0..LID_BITS {
            let lid = Lid::primary(pos).unwrap();
            assert_eq!(lid.count_ones(), 1);
            assert_eq!(lid.bit_position(), Some(pos));
        }
        assert!(Lid::primary(256).is_err());
        assert_eq!(Lid::ZERO.bit_position(), None);
    }

    #[test]
    fn test_combine_set_semantics() {
        let a = Lid::combine([10, 20, 30]).unwrap();
        let b = Lid::combine([30, 10, 20, 10]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.count_ones(), 3);
        assert_eq!(a.positions(), vec![10, 20, 30]);
        assert!(Lid::combine([300]).is_err());
    }

    #[test]
    fn test_address_round_trip() {
        for lid in [
            Lid::primary(0).unwrap(),
            Lid::primary(10).unwrap(),
            Lid::primary(127).unwrap(),
            Lid::primary(128).unwrap(),
            Lid::primary(255).unwrap(),
            Lid::combine([3, 77, 128, 254]).unwrap(),
        ] {
            let (src, dst) = lid.to_addresses();
            assert_eq!(Lid::from_addresses(src, dst), lid);
        }
    }

    // Bit 10 sits in the second source-address octet with weight 1 << 2;
    // nothing else may be set.
    #[test]
    fn test_address_bit_layout() {
        let lid = Lid::primary(10).unwrap();
        let (src, dst) = lid.to_addresses();
        assert_eq!(
            full_form(src),
            "0004:0000:0000:0000:0000:0000:0000:0000"
        );
        assert_eq!(
            full_form(dst),
            "0000:0000:0000:0000:0000:0000:0000:0000"
        );

        // The high half lands in the destination address.
        let lid = Lid::primary(128).unwrap();
        let (src, dst) = lid.to_addresses();
        assert_eq!(src, Ipv6Addr::UNSPECIFIED);
        assert_eq!(
            full_form(dst),
            "0100:0000:0000:0000:0000:0000:0000:0000"
        );
    }

    #[test]
    fn test_wire_round_trip() {
        // '1' in the first wire character is the highest internal bit.
        let mut wire = "0".repeat(255);
        wire.insert(0, '1');
        let lid = Lid::from_wire(&wire).unwrap();
        assert_eq!(lid.bit_position(), Some(255));
        assert_eq!(lid.to_wire(), wire);

        let lid = Lid::combine([9, 140, 201]).unwrap();
        assert_eq!(Lid::from_wire(&lid.to_wire()).unwrap(), lid);

        assert!(Lid::from_wire("01").is_err());
        assert!(Lid::from_wire(&"2".repeat(256)).is_err());
    }

    #[test]
    fn test_full_form_never_compresses() {
        let rendered = full_form(Ipv6Addr::UNSPECIFIED);
        assert_eq!(
            rendered,
            "0000:0000:0000:0000:0000:0000:0000:0000"
        );
        assert_eq!(rendered.len(), 39);
    }
}
