// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The ingress (VLAN) and egress (EGR_VLAN) VLAN tables, both indexed by VLAN
//! id.  Port bitmaps are 66 bits wide: bit 0 is the CPU port and bit `n` is
//! front-panel port `n`.

use super::{get_field, get_flag, set_field, set_flag, TableDesc};

pub const ING_TABLE: TableDesc = TableDesc {
    name: "vlan",
    base: 0x1216_8000,
    words: 10,
    stride: 40,
    depth: 4096,
};

pub const EGR_TABLE: TableDesc = TableDesc {
    name: "egr_vlan",
    base: 0x0d26_0000,
    words: 8,
    stride: 32,
    depth: 4096,
};

pub const BITMAP_BITS: usize = 66;

const ING_PORT_BITMAP: (usize, usize) = (0, BITMAP_BITS);
const ING_ING_PORT_BITMAP: (usize, usize) = (66, BITMAP_BITS);
const ING_STG: (usize, usize) = (132, 9);
const ING_VALID: usize = 205;
const ING_PROFILE_PTR: (usize, usize) = (232, 7);

const EGR_VALID: usize = 0;
const EGR_STG: (usize, usize) = (1, 9);
const EGR_UT_PORT_BITMAP: (usize, usize) = (96, BITMAP_BITS);
const EGR_PORT_BITMAP: (usize, usize) = (162, BITMAP_BITS);

/// The spanning tree group new VLANs are placed in
pub const DEFAULT_STG: u16 = 2;

/// The bitmap bit for a front-panel port
pub fn port_bit(port: u8) -> u128 {
    1u128 << port
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VlanEntry {
    pub port_bitmap: u128,
    pub ing_port_bitmap: u128,
    pub stg: u16,
    pub profile: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EgrVlanEntry {
    pub stg: u16,
    pub ut_port_bitmap: u128,
    pub port_bitmap: u128,
}

pub fn encode_ing(e: &VlanEntry) -> [u32; 10] {
    let mut w = [0u32; 10];
    set_field(&mut w, ING_PORT_BITMAP.0, ING_PORT_BITMAP.1, e.port_bitmap);
    set_field(
        &mut w,
        ING_ING_PORT_BITMAP.0,
        ING_ING_PORT_BITMAP.1,
        e.ing_port_bitmap,
    );
    set_field(&mut w, ING_STG.0, ING_STG.1, e.stg as u128);
    set_flag(&mut w, ING_VALID, true);
    set_field(&mut w, ING_PROFILE_PTR.0, ING_PROFILE_PTR.1, e.profile as u128);
    w
}

pub fn decode_ing(w: &[u32]) -> Option<VlanEntry> {
    if !get_flag(w, ING_VALID) {
        return None;
    }
    Some(VlanEntry {
        port_bitmap: get_field(w, ING_PORT_BITMAP.0, ING_PORT_BITMAP.1),
        ing_port_bitmap: get_field(
            w,
            ING_ING_PORT_BITMAP.0,
            ING_ING_PORT_BITMAP.1,
        ),
        stg: get_field(w, ING_STG.0, ING_STG.1) as u16,
        profile: get_field(w, ING_PROFILE_PTR.0, ING_PROFILE_PTR.1) as u8,
    })
}

pub fn encode_egr(e: &EgrVlanEntry) -> [u32; 8] {
    let mut w = [0u32; 8];
    set_flag(&mut w, EGR_VALID, true);
    set_field(&mut w, EGR_STG.0, EGR_STG.1, e.stg as u128);
    set_field(
        &mut w,
        EGR_UT_PORT_BITMAP.0,
        EGR_UT_PORT_BITMAP.1,
        e.ut_port_bitmap,
    );
    set_field(&mut w, EGR_PORT_BITMAP.0, EGR_PORT_BITMAP.1, e.port_bitmap);
    w
}

pub fn decode_egr(w: &[u32]) -> Option<EgrVlanEntry> {
    if !get_flag(w, EGR_VALID) {
        return None;
    }
    Some(EgrVlanEntry {
        stg: get_field(w, EGR_STG.0, EGR_STG.1) as u16,
        ut_port_bitmap: get_field(
            w,
            EGR_UT_PORT_BITMAP.0,
            EGR_UT_PORT_BITMAP.1,
        ),
        port_bitmap: get_field(w, EGR_PORT_BITMAP.0, EGR_PORT_BITMAP.1),
    })
}
