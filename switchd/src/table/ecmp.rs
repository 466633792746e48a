// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! L3_ECMP_GROUP describes a group as a contiguous span of L3_ECMP member
//! entries, each naming one egress object.  Groups of up to eight members also
//! carry a copy of the member list in the group entry itself, which the ASIC
//! uses instead of chasing the span.

use super::{get_field, get_flag, set_field, set_flag, TableDesc};

pub const MEMBER_TABLE: TableDesc = TableDesc {
    name: "l3_ecmp",
    base: 0x0e17_6000,
    words: 1,
    stride: 4,
    depth: 4096,
};

pub const GROUP_TABLE: TableDesc = TableDesc {
    name: "l3_ecmp_group",
    base: 0x0e17_4000,
    words: 7,
    stride: 32,
    depth: 1024,
};

/// The largest group the COUNT field can describe
pub const MAX_MEMBERS: usize = 1023;
/// Groups this size or smaller use the fast-path member list
pub const FAST_PATH_MEMBERS: usize = 8;
/// The largest egress index a fast-path OIF can hold
pub const FAST_PATH_MAX_OIF: u16 = (1 << OIF_WIDTH) - 1;

const NEXT_HOP_INDEX: (usize, usize) = (0, 14);

const COUNT: (usize, usize) = (0, 10);
const BASE_PTR: (usize, usize) = (10, 12);
const OIF_LO: usize = 82;
const OIF_TYPE_LO: usize = 81;
const OIF_WIDTH: usize = 13;
const OIF_STRIDE: usize = 14;
const ECMP_GT8: usize = 196;

pub fn encode_member(next_hop: u16) -> [u32; 1] {
    let mut w = [0u32; 1];
    set_field(&mut w, NEXT_HOP_INDEX.0, NEXT_HOP_INDEX.1, next_hop as u128);
    w
}

pub fn decode_member(w: &[u32]) -> Option<u16> {
    Some(get_field(w, NEXT_HOP_INDEX.0, NEXT_HOP_INDEX.1) as u16)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EcmpGroupEntry {
    /// First member slot
    pub base: u16,
    /// Number of members
    pub count: u16,
    /// The fast-path member list.  Empty for groups of more than eight, or
    /// with a member too large for an OIF field; the ASIC then walks the span.
    pub oifs: Vec<u16>,
}

impl EcmpGroupEntry {
    pub fn new(base: u16, members: &[u16]) -> Self {
        let fast = members.len() <= FAST_PATH_MEMBERS
            && members.iter().all(|m| *m <= FAST_PATH_MAX_OIF);
        let oifs = if fast {
            members.to_vec()
        } else {
            Vec::new()
        };
        EcmpGroupEntry {
            base,
            count: members.len() as u16,
            oifs,
        }
    }
}

pub fn encode_group(e: &EcmpGroupEntry) -> [u32; 7] {
    let mut w = [0u32; 7];
    set_field(&mut w, COUNT.0, COUNT.1, e.count as u128);
    set_field(&mut w, BASE_PTR.0, BASE_PTR.1, e.base as u128);
    // ECMP_GT8 sends the lookup through the member span
    let gt8 = e.oifs.is_empty();
    set_flag(&mut w, ECMP_GT8, gt8);
    if !gt8 {
        for (i, oif) in e.oifs.iter().take(FAST_PATH_MEMBERS).enumerate() {
            // A clear type bit marks the OIF as an egress object
            set_flag(&mut w, OIF_TYPE_LO + OIF_STRIDE * i, false);
            set_field(&mut w, OIF_LO + OIF_STRIDE * i, OIF_WIDTH, *oif as u128);
        }
    }
    w
}

/// Decode a group descriptor.  A count of zero marks an unused group.
pub fn decode_group(w: &[u32]) -> Option<EcmpGroupEntry> {
    let count = get_field(w, COUNT.0, COUNT.1) as u16;
    if count == 0 {
        return None;
    }
    let oifs = if get_flag(w, ECMP_GT8) {
        Vec::new()
    } else {
        (0..count as usize)
            .map(|i| get_field(w, OIF_LO + OIF_STRIDE * i, OIF_WIDTH) as u16)
            .collect()
    };
    Some(EcmpGroupEntry {
        base: get_field(w, BASE_PTR.0, BASE_PTR.1) as u16,
        count,
        oifs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member() {
        assert_eq!(encode_member(0x3fff), [0x3fff]);
        assert_eq!(decode_member(&encode_member(17)), Some(17));
    }

    #[test]
    fn test_small_group() {
        let e = EcmpGroupEntry::new(4, &[1, 2, 3]);
        let w = encode_group(&e);
        assert_eq!(get_field(&w, 0, 10), 3);
        assert_eq!(get_field(&w, 10, 12), 4);
        assert_eq!(get_field(&w, 82, 13), 1);
        assert_eq!(get_field(&w, 96, 13), 2);
        assert_eq!(get_field(&w, 110, 13), 3);
        assert!(!get_flag(&w, 196));
        assert_eq!(decode_group(&w), Some(e));
    }

    #[test]
    fn test_boundaries() {
        let one = EcmpGroupEntry::new(0, &[8191]);
        assert_eq!(decode_group(&encode_group(&one)), Some(one));

        let eight: Vec<u16> = (1..=8).collect();
        let e = EcmpGroupEntry::new(100, &eight);
        let w = encode_group(&e);
        assert_eq!(get_field(&w, 180, 13), 8);
        assert_eq!(decode_group(&w), Some(e));

        let members: Vec<u16> = (1..=1023).collect();
        let big = EcmpGroupEntry::new(4095 - 1023, &members);
        assert!(big.oifs.is_empty());
        let w = encode_group(&big);
        assert!(get_flag(&w, 196));
        assert_eq!(get_field(&w, 82, 13), 0);
        assert_eq!(decode_group(&w), Some(big));

        assert_eq!(decode_group(&[0; 7]), None);
    }

    #[test]
    fn test_wide_oif() {
        // 8192 doesn't fit in an OIF field, so the group uses its span
        let e = EcmpGroupEntry::new(7, &[3, 8192]);
        assert!(e.oifs.is_empty());
        let w = encode_group(&e);
        assert!(get_flag(&w, 196));
        assert_eq!(get_field(&w, 82, 13), 0);
        assert_eq!(decode_group(&w), Some(e));

        let e = EcmpGroupEntry::new(7, &[FAST_PATH_MAX_OIF]);
        assert_eq!(e.oifs, vec![0x1fff]);
        assert_eq!(decode_group(&encode_group(&e)), Some(e));
    }
}
