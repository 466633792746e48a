// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! L3_DEFIP: the longest-prefix-match route TCAM.  Each entry holds two
//! halves; we only program the first, as an IPv4 unicast route.

use std::net::Ipv4Addr;

use oxnet::Ipv4Net;

use super::{get_field, get_flag, set_field, set_flag, TableDesc};

pub const TABLE: TableDesc = TableDesc {
    name: "l3_defip",
    base: 0x0a17_0000,
    words: 8,
    stride: 32,
    depth: 8192,
};

const VALID0: usize = 0;
const KEY0: (usize, usize) = (2, 44);
const MASK0: (usize, usize) = (90, 44);
const ECMP0: usize = 206;
const NEXT_HOP_INDEX0: (usize, usize) = (207, 14);

// The VRF and mode bits above the address must always match, as must the
// IPv4 mode bit below it.
const MASK_FIXED: u64 = (0x3ff << 33) | 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefipEntry {
    pub subnet: Ipv4Net,
    /// `next_hop` names an ECMP group rather than an egress object
    pub ecmp: bool,
    pub next_hop: u16,
}

/// The netmask for a prefix of `len` bits
pub fn prefix_mask(len: u8) -> u32 {
    match len {
        0 => 0,
        l => u32::MAX << (32 - l.min(32)),
    }
}

pub fn encode(e: &DefipEntry) -> [u32; 8] {
    let mask = prefix_mask(e.subnet.width());
    let ip = u32::from(e.subnet.addr()) & mask;

    let mut w = [0u32; 8];
    set_flag(&mut w, VALID0, true);
    set_field(&mut w, KEY0.0, KEY0.1, (ip as u128) << 1);
    set_field(
        &mut w,
        MASK0.0,
        MASK0.1,
        (MASK_FIXED | ((mask as u64) << 1)) as u128,
    );
    set_flag(&mut w, ECMP0, e.ecmp);
    set_field(&mut w, NEXT_HOP_INDEX0.0, NEXT_HOP_INDEX0.1, e.next_hop as u128);
    w
}

/// Returns `None` for an invalid entry, or one whose mask isn't a contiguous
/// prefix.
pub fn decode(w: &[u32]) -> Option<DefipEntry> {
    if !get_flag(w, VALID0) {
        return None;
    }
    let mask = ((get_field(w, MASK0.0, MASK0.1) >> 1) & 0xffff_ffff) as u32;
    let len = mask.leading_ones();
    if len + mask.trailing_zeros() < 32 {
        return None;
    }
    let ip = ((get_field(w, KEY0.0, KEY0.1) >> 1) & 0xffff_ffff) as u32;
    let subnet = Ipv4Net::new(Ipv4Addr::from(ip), len as u8).ok()?;
    Some(DefipEntry {
        subnet,
        ecmp: get_flag(w, ECMP0),
        next_hop: get_field(w, NEXT_HOP_INDEX0.0, NEXT_HOP_INDEX0.1) as u16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_layout() {
        let e = DefipEntry {
            subnet: net("10.0.0.0/24"),
            ecmp: false,
            next_hop: 1,
        };
        let w = encode(&e);
        // VALID0, then 10.0.0.0 shifted into KEY0
        assert_eq!(get_field(&w, 0, 1), 1);
        assert_eq!(get_field(&w, 2, 44), 0x0a00_0000 << 1);
        assert_eq!(
            get_field(&w, 90, 44),
            (0x3ff << 33) | (0xffff_ff00 << 1) | 1
        );
        assert_eq!(get_field(&w, 207, 14), 1);
        assert!(!get_flag(&w, 206));
        assert_eq!(decode(&w), Some(e));
    }

    #[test]
    fn test_boundaries() {
        for s in ["0.0.0.0/0", "255.255.255.255/32", "192.168.1.0/24"] {
            for ecmp in [false, true] {
                let e = DefipEntry {
                    subnet: net(s),
                    ecmp,
                    next_hop: 16383,
                };
                assert_eq!(decode(&encode(&e)), Some(e));
            }
        }
        assert_eq!(decode(&[0; 8]), None);
    }

    #[test]
    fn test_host_bits_masked() {
        let e = DefipEntry {
            subnet: net("10.1.2.3/16"),
            ecmp: false,
            next_hop: 2,
        };
        let d = decode(&encode(&e)).unwrap();
        assert_eq!(d.subnet, net("10.1.0.0/16"));
    }

    #[test]
    fn test_noncontiguous_mask() {
        let mut w = encode(&DefipEntry {
            subnet: net("10.0.0.0/8"),
            ecmp: false,
            next_hop: 1,
        });
        // Punch a hole in the netmask
        let mask = (0x3ffu128 << 33) | (0xff00_ff00u128 << 1) | 1;
        set_field(&mut w, 90, 44, mask);
        assert_eq!(decode(&w), None);
    }

    #[test]
    fn test_prefix_mask() {
        assert_eq!(prefix_mask(0), 0);
        assert_eq!(prefix_mask(1), 0x8000_0000);
        assert_eq!(prefix_mask(24), 0xffff_ff00);
        assert_eq!(prefix_mask(32), u32::MAX);
    }
}
