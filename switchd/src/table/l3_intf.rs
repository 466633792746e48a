// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! EGR_L3_INTF: the source MAC and VLAN stamped on routed packets.  This table
//! has no valid bit; whether an entry is live is tracked by the allocator.

use common::network::MacAddr;

use super::{get_field, set_field, TableDesc};

pub const TABLE: TableDesc = TableDesc {
    name: "egr_l3_intf",
    base: 0x0126_4000,
    words: 4,
    stride: 16,
    depth: 4096,
};

const VID: (usize, usize) = (13, 12);
const MAC: (usize, usize) = (33, 48);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct L3IntfEntry {
    pub mac: MacAddr,
    pub vlan: u16,
}

pub fn encode(e: &L3IntfEntry) -> [u32; 4] {
    let mut w = [0u32; 4];
    set_field(&mut w, VID.0, VID.1, e.vlan as u128);
    set_field(&mut w, MAC.0, MAC.1, u64::from(e.mac) as u128);
    w
}

pub fn decode(w: &[u32]) -> Option<L3IntfEntry> {
    Some(L3IntfEntry {
        mac: MacAddr::from(get_field(w, MAC.0, MAC.1) as u64),
        vlan: get_field(w, VID.0, VID.1) as u16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let e = L3IntfEntry {
            mac: MacAddr::new(0x02, 0, 0, 0, 0, 0x0c),
            vlan: 1,
        };
        let w = encode(&e);
        assert_eq!(w[0], 1 << 13);
        assert_eq!(w[1], 0x18);
        assert_eq!(w[2], 0x0400);
        assert_eq!(decode(&w), Some(e));
    }

    #[test]
    fn test_boundaries() {
        for mac in [MacAddr::ZERO, MacAddr::BROADCAST] {
            for vlan in [0, 4095] {
                let e = L3IntfEntry { mac, vlan };
                assert_eq!(decode(&encode(&e)), Some(e));
            }
        }
        // No valid bit, so an all-zero entry still decodes
        assert_eq!(
            decode(&[0; 4]),
            Some(L3IntfEntry {
                mac: MacAddr::ZERO,
                vlan: 0
            })
        );
    }
}
