// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! L2_ENTRY: the hashed MAC address table.

use common::network::MacAddr;

use super::{get_field, get_flag, set_field, set_flag, TableDesc};

pub const TABLE: TableDesc = TableDesc {
    name: "l2_entry",
    base: 0x0712_0000,
    words: 4,
    stride: 16,
    depth: 131072,
};

const VALID: usize = 0;
const KEY_TYPE: (usize, usize) = (1, 3);
const VLAN: (usize, usize) = (4, 12);
const MAC: (usize, usize) = (16, 48);
const PORT: (usize, usize) = (64, 7);
const MODULE: (usize, usize) = (71, 8);
const STATIC: usize = 93;

/// Key type for bridged entries
pub const KEY_TYPE_BRIDGE: u64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct L2Entry {
    pub mac: MacAddr,
    pub vlan: u16,
    pub port: u8,
    pub module: u8,
    pub is_static: bool,
}

pub fn encode(e: &L2Entry) -> [u32; 4] {
    let mut w = [0u32; 4];
    set_flag(&mut w, VALID, true);
    set_field(&mut w, KEY_TYPE.0, KEY_TYPE.1, KEY_TYPE_BRIDGE as u128);
    set_field(&mut w, VLAN.0, VLAN.1, e.vlan as u128);
    set_field(&mut w, MAC.0, MAC.1, u64::from(e.mac) as u128);
    set_field(&mut w, PORT.0, PORT.1, e.port as u128);
    set_field(&mut w, MODULE.0, MODULE.1, e.module as u128);
    set_flag(&mut w, STATIC, e.is_static);
    w
}

/// Returns `None` for an entry with its valid bit clear.
pub fn decode(w: &[u32]) -> Option<L2Entry> {
    if !get_flag(w, VALID) {
        return None;
    }
    Some(L2Entry {
        mac: MacAddr::from(get_field(w, MAC.0, MAC.1) as u64),
        vlan: get_field(w, VLAN.0, VLAN.1) as u16,
        port: get_field(w, PORT.0, PORT.1) as u8,
        module: get_field(w, MODULE.0, MODULE.1) as u8,
        is_static: get_flag(w, STATIC),
    })
}

/// The hash that picks an entry's home slot.  Collisions are resolved by
/// probing the following slots.
pub fn hash(mac: MacAddr, vlan: u16) -> u32 {
    let mac48: u64 = mac.into();
    let key = (mac48 << 16)
        | (((vlan & 0xfff) as u64) << 4)
        | (KEY_TYPE_BRIDGE << 1);
    (key % TABLE.depth as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let e = L2Entry {
            mac: MacAddr::new(0x00, 0x11, 0x22, 0x33, 0x44, 0x55),
            vlan: 0xabc,
            port: 12,
            module: 0,
            is_static: true,
        };
        let w = encode(&e);
        assert_eq!(w[0], 0x4455_abc1);
        assert_eq!(w[1], 0x0011_2233);
        assert_eq!(w[2], 0x2000_000c);
        assert_eq!(w[3], 0);
        assert_eq!(decode(&w), Some(e));
    }

    #[test]
    fn test_boundaries() {
        for mac in [MacAddr::ZERO, MacAddr::BROADCAST] {
            for vlan in [0, 4095] {
                let e = L2Entry {
                    mac,
                    vlan,
                    port: 127,
                    module: 255,
                    is_static: false,
                };
                assert_eq!(decode(&encode(&e)), Some(e));
            }
        }
        assert_eq!(decode(&[0; 4]), None);
    }

    #[test]
    fn test_hash() {
        let mac = MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);
        let expected = ((0xaabb_ccdd_eeffu64 << 16) % 131072) as u32;
        assert_eq!(hash(mac, 0), expected);
        assert_eq!(hash(mac, 1), expected + 16);
        assert!(hash(MacAddr::BROADCAST, 4095) < TABLE.depth);
    }
}
