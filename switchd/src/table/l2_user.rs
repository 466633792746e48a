// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! L2_USER_ENTRY: a small TCAM of masked MAC matches, used to trap control
//! traffic such as BPDUs.
//!
//! The 61-bit key (and mask) is laid out as `KEY_TYPE[60] | VLAN[59:48] |
//! MAC[47:0]`.

use common::network::MacAddr;

use super::{get_field, get_flag, set_field, set_flag, TableDesc};

pub const TABLE: TableDesc = TableDesc {
    name: "l2_user_entry",
    base: 0x0714_0000,
    words: 5,
    stride: 32,
    depth: 512,
};

const VALID: usize = 0;
const KEY: (usize, usize) = (1, 61);
const MASK: (usize, usize) = (62, 61);
const PORT: (usize, usize) = (123, 7);
const CPU: usize = 130;
const BPDU: usize = 131;

/// Every bit a mask may set
pub const MASK_ALL: u64 = (1 << 61) - 1;
/// Match the key type and an exact MAC, in any VLAN
pub const MASK_MAC_ONLY: u64 = 0x1000_ffff_ffff_ffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct L2UserEntry {
    pub mac: MacAddr,
    pub vlan: u16,
    pub mask: u64,
    pub port: u8,
    pub copy_to_cpu: bool,
    pub bpdu: bool,
}

fn key(e: &L2UserEntry) -> u64 {
    ((e.vlan as u64 & 0xfff) << 48) | u64::from(e.mac)
}

pub fn encode(e: &L2UserEntry) -> [u32; 5] {
    let mut w = [0u32; 5];
    set_flag(&mut w, VALID, true);
    set_field(&mut w, KEY.0, KEY.1, key(e) as u128);
    set_field(&mut w, MASK.0, MASK.1, (e.mask & MASK_ALL) as u128);
    set_field(&mut w, PORT.0, PORT.1, e.port as u128);
    set_flag(&mut w, CPU, e.copy_to_cpu);
    set_flag(&mut w, BPDU, e.bpdu);
    w
}

pub fn decode(w: &[u32]) -> Option<L2UserEntry> {
    if !get_flag(w, VALID) {
        return None;
    }
    let key = get_field(w, KEY.0, KEY.1) as u64;
    Some(L2UserEntry {
        mac: MacAddr::from(key & 0xffff_ffff_ffff),
        vlan: ((key >> 48) & 0xfff) as u16,
        mask: get_field(w, MASK.0, MASK.1) as u64,
        port: get_field(w, PORT.0, PORT.1) as u8,
        copy_to_cpu: get_flag(w, CPU),
        bpdu: get_flag(w, BPDU),
    })
}
