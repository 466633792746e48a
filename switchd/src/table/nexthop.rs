// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The two halves of an L3 next hop, both indexed by egress id.
//! ING_L3_NEXT_HOP picks the output port; EGR_L3_NEXT_HOP picks the L3
//! interface and the destination MAC.

use common::network::MacAddr;

use super::{get_field, set_field, TableDesc};

pub const ING_TABLE: TableDesc = TableDesc {
    name: "ing_l3_next_hop",
    base: 0x0e17_c000,
    words: 2,
    stride: 8,
    depth: 16384,
};

pub const EGR_TABLE: TableDesc = TableDesc {
    name: "egr_l3_next_hop",
    base: 0x0c26_0000,
    words: 4,
    stride: 16,
    depth: 16384,
};

const ENTRY_TYPE: (usize, usize) = (0, 2);
const ING_PORT: (usize, usize) = (16, 7);
const ING_MODULE: (usize, usize) = (23, 8);
const EGR_INTF: (usize, usize) = (3, 12);
const EGR_MAC: (usize, usize) = (15, 48);

/// Entry type for a unicast L3 next hop
pub const ENTRY_TYPE_UNICAST: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IngNextHop {
    pub entry_type: u8,
    pub port: u8,
    pub module: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EgrNextHop {
    pub entry_type: u8,
    pub intf: u16,
    pub mac: MacAddr,
}

pub fn encode_ing(e: &IngNextHop) -> [u32; 2] {
    let mut w = [0u32; 2];
    set_field(&mut w, ENTRY_TYPE.0, ENTRY_TYPE.1, e.entry_type as u128);
    set_field(&mut w, ING_PORT.0, ING_PORT.1, e.port as u128);
    set_field(&mut w, ING_MODULE.0, ING_MODULE.1, e.module as u128);
    w
}

pub fn decode_ing(w: &[u32]) -> Option<IngNextHop> {
    Some(IngNextHop {
        entry_type: get_field(w, ENTRY_TYPE.0, ENTRY_TYPE.1) as u8,
        port: get_field(w, ING_PORT.0, ING_PORT.1) as u8,
        module: get_field(w, ING_MODULE.0, ING_MODULE.1) as u8,
    })
}

pub fn encode_egr(e: &EgrNextHop) -> [u32; 4] {
    let mut w = [0u32; 4];
    set_field(&mut w, ENTRY_TYPE.0, ENTRY_TYPE.1, e.entry_type as u128);
    set_field(&mut w, EGR_INTF.0, EGR_INTF.1, e.intf as u128);
    set_field(&mut w, EGR_MAC.0, EGR_MAC.1, u64::from(e.mac) as u128);
    w
}

pub fn decode_egr(w: &[u32]) -> Option<EgrNextHop> {
    Some(EgrNextHop {
        entry_type: get_field(w, ENTRY_TYPE.0, ENTRY_TYPE.1) as u8,
        intf: get_field(w, EGR_INTF.0, EGR_INTF.1) as u16,
        mac: MacAddr::from(get_field(w, EGR_MAC.0, EGR_MAC.1) as u64),
    })
}
