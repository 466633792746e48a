// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Layer-2 forwarding entries.
//!
//! L2_ENTRY is a hash table: a (MAC, VLAN) key hashes to a home slot, and a
//! colliding key is placed in one of the next few slots.  We can't rely on
//! reading entries back from the ASIC, so every slot we've written is
//! shadowed here, and the shadow is what lookups and collision checks use.
//!
//! The L2_USER_ENTRY TCAM holds a small number of masked matches that take
//! priority over the hash table, such as the trap for spanning-tree BPDUs.

use std::collections::BTreeMap;

use slog::{debug, error, info};

use crate::table;
use crate::table::l2::L2Entry;
use crate::table::l2_user;
use crate::table::l2_user::L2UserEntry;
use crate::table::TableUsage;
use crate::types::{SwdError, SwdResult};
use crate::Switch;
use common::network::{validate_vlan_tag, MacAddr};
use common::ports::PortId;

/// How many slots past the home slot a key may land in
pub const PROBE_DEPTH: u32 = 6;

/// Destination MAC of IEEE 802.1D spanning-tree BPDUs
pub const BPDU_MAC: MacAddr = MacAddr::new(0x01, 0x80, 0xc2, 0, 0, 0);

/// A MAC address learned (or configured) on a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct L2Addr {
    pub mac: MacAddr,
    pub vlan: u16,
    pub port: PortId,
    /// Static entries are never aged out by the ASIC
    pub is_static: bool,
}

pub struct L2Data {
    // Shadow of L2_ENTRY, keyed by slot index
    slots: BTreeMap<u32, L2Addr>,
    usage: TableUsage,
    // Shadow of L2_USER_ENTRY, keyed by slot index
    user: BTreeMap<u16, L2UserEntry>,
}

impl L2Data {
    pub fn new() -> Self {
        L2Data {
            slots: BTreeMap::new(),
            usage: TableUsage::new(table::l2::TABLE.depth),
            user: BTreeMap::new(),
        }
    }

    fn candidates(mac: MacAddr, vlan: u16) -> impl Iterator<Item = u32> {
        let home = table::l2::hash(mac, vlan);
        let depth = table::l2::TABLE.depth;
        (0..PROBE_DEPTH).map(move |i| (home + i) % depth)
    }

    // Find the slot already holding this key
    fn find(&self, mac: MacAddr, vlan: u16) -> Option<u32> {
        Self::candidates(mac, vlan).find(|idx| {
            self.slots
                .get(idx)
                .is_some_and(|a| a.mac == mac && a.vlan == vlan)
        })
    }
}

impl Default for L2Data {
    fn default() -> Self {
        Self::new()
    }
}

/// Install an L2 entry.  An existing entry for the same (MAC, VLAN) is
/// rewritten in place.
pub fn addr_add(switch: &Switch, addr: &L2Addr) -> SwdResult<()> {
    validate_vlan_tag(addr.vlan)?;
    switch.check_port(addr.port)?;

    let mut l2 = switch.l2.lock().unwrap();
    let (idx, update) = match l2.find(addr.mac, addr.vlan) {
        Some(idx) => (idx, true),
        None => {
            let mut passed = 0;
            let mut free = None;
            for idx in L2Data::candidates(addr.mac, addr.vlan) {
                if !l2.slots.contains_key(&idx) {
                    free = Some(idx);
                    break;
                }
                passed += 1;
            }
            l2.usage.collisions += passed;
            match free {
                Some(idx) => (idx, false),
                None => {
                    l2.usage.exhaustion += 1;
                    info!(switch.log, "no free l2 slot";
                        "mac" => %addr.mac, "vlan" => addr.vlan);
                    return Err(SwdError::TableFull(
                        table::l2::TABLE.name.to_string(),
                    ));
                }
            }
        }
    };

    let entry = L2Entry {
        mac: addr.mac,
        vlan: addr.vlan,
        port: addr.port.as_u8(),
        module: 0,
        is_static: addr.is_static,
    };
    table::write_entry(
        switch,
        &table::l2::TABLE,
        idx,
        &table::l2::encode(&entry),
    )?;

    debug!(switch.log, "programmed l2 entry";
        "mac" => %addr.mac,
        "vlan" => addr.vlan,
        "port" => %addr.port,
        "slot" => idx);
    if update {
        l2.usage.updates += 1;
    } else {
        l2.usage.inserts += 1;
        l2.usage.occupancy += 1;
    }
    l2.slots.insert(idx, *addr);
    Ok(())
}

/// Remove the entry for (MAC, VLAN).
pub fn addr_delete(switch: &Switch, mac: MacAddr, vlan: u16) -> SwdResult<()> {
    validate_vlan_tag(vlan)?;

    let mut l2 = switch.l2.lock().unwrap();
    let Some(idx) = l2.find(mac, vlan) else {
        l2.usage.delete_misses += 1;
        return Err(SwdError::Missing(format!("no l2 entry for {mac}/{vlan}")));
    };

    if let Err(e) = table::clear_entry(switch, &table::l2::TABLE, idx) {
        error!(switch.log, "failed to clear l2 entry";
            "mac" => %mac, "vlan" => vlan, "slot" => idx, "error" => %e);
    }
    debug!(switch.log, "deleted l2 entry"; "mac" => %mac, "vlan" => vlan);
    l2.slots.remove(&idx);
    l2.usage.deletes += 1;
    l2.usage.occupancy -= 1;
    Ok(())
}

pub fn addr_get(switch: &Switch, mac: MacAddr, vlan: u16) -> SwdResult<L2Addr> {
    validate_vlan_tag(vlan)?;
    let l2 = switch.l2.lock().unwrap();
    l2.find(mac, vlan)
        .and_then(|idx| l2.slots.get(&idx))
        .copied()
        .ok_or_else(|| SwdError::Missing(format!("no l2 entry for {mac}/{vlan}")))
}

pub fn usage(switch: &Switch) -> TableUsage {
    switch.l2.lock().unwrap().usage.clone()
}

/// Install a TCAM entry in the lowest free slot, returning the slot.
pub fn user_add(switch: &Switch, entry: &L2UserEntry) -> SwdResult<u16> {
    validate_vlan_tag(entry.vlan)?;

    let mut l2 = switch.l2.lock().unwrap();
    let depth = l2_user::TABLE.depth as u16;
    let slot = (0..depth)
        .find(|s| !l2.user.contains_key(s))
        .ok_or_else(|| SwdError::TableFull(l2_user::TABLE.name.to_string()))?;

    table::write_entry(
        switch,
        &l2_user::TABLE,
        slot as u32,
        &l2_user::encode(entry),
    )?;
    debug!(switch.log, "added l2 user entry";
        "mac" => %entry.mac, "slot" => slot);
    l2.user.insert(slot, *entry);
    Ok(slot)
}

pub fn user_delete(switch: &Switch, slot: u16) -> SwdResult<()> {
    let mut l2 = switch.l2.lock().unwrap();
    if slot as u32 >= l2_user::TABLE.depth {
        return Err(SwdError::Invalid(format!(
            "l2 user slot {slot} is out of range"
        )));
    }
    if l2.user.remove(&slot).is_none() {
        return Err(SwdError::Missing(format!("l2 user slot {slot} is empty")));
    }
    if let Err(e) = table::clear_entry(switch, &l2_user::TABLE, slot as u32) {
        error!(switch.log, "failed to clear l2 user entry";
            "slot" => slot, "error" => %e);
    }
    Ok(())
}

/// Trap spanning-tree BPDUs to the CPU, on any VLAN.
pub fn user_bpdu_add(switch: &Switch) -> SwdResult<u16> {
    let entry = L2UserEntry {
        mac: BPDU_MAC,
        vlan: 0,
        mask: l2_user::MASK_MAC_ONLY,
        port: 0,
        copy_to_cpu: true,
        bpdu: true,
    };
    user_add(switch, &entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_switch;

    fn port(n: u8) -> PortId {
        PortId::new(n).unwrap()
    }

    fn addr(mac: MacAddr, vlan: u16, p: u8) -> L2Addr {
        L2Addr {
            mac,
            vlan,
            port: port(p),
            is_static: true,
        }
    }

    fn slot_of(mac: MacAddr, vlan: u16) -> u32 {
        table::l2::hash(mac, vlan)
    }

    #[test]
    fn test_add_get_delete() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        let mac: MacAddr = "00:11:22:33:44:55".parse()?;
        let a = addr(mac, 0, 12);
        addr_add(&switch, &a)?;
        assert_eq!(addr_get(&switch, mac, 0)?, a);

        let idx = slot_of(mac, 0);
        let w = stub.memory(table::l2::TABLE.address(idx), 4);
        assert_eq!(table::l2::decode(&w).map(|e| e.port), Some(12));

        // Re-adding the key moves it to a new port without using a new slot
        addr_add(&switch, &addr(mac, 0, 13))?;
        assert_eq!(addr_get(&switch, mac, 0)?.port, port(13));
        let u = usage(&switch);
        assert_eq!((u.inserts, u.updates, u.occupancy), (1, 1, 1));

        addr_delete(&switch, mac, 0)?;
        let w = stub.memory(table::l2::TABLE.address(idx), 4);
        assert_eq!(table::l2::decode(&w), None);
        assert!(matches!(
            addr_get(&switch, mac, 0),
            Err(SwdError::Missing(_))
        ));
        assert!(matches!(
            addr_delete(&switch, mac, 0),
            Err(SwdError::Missing(_))
        ));
        Ok(())
    }

    #[test]
    fn test_deterministic() -> anyhow::Result<()> {
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse()?;
        let (a, _) = test_switch();
        let (b, sb) = test_switch();
        addr_add(&a, &addr(mac, 7, 1))?;
        addr_add(&b, &addr(mac, 7, 1))?;
        let idx = slot_of(mac, 7);
        assert_eq!(
            sb.memory(table::l2::TABLE.address(idx), 4),
            table::l2::encode(&L2Entry {
                mac,
                vlan: 7,
                port: 1,
                module: 0,
                is_static: true,
            })
        );
        assert_eq!(addr_get(&a, mac, 7)?, addr_get(&b, mac, 7)?);
        Ok(())
    }

    #[test]
    fn test_collisions() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();

        // The hash only sees the low bit of the MAC, so all of these share a
        // home slot.
        let macs: Vec<MacAddr> =
            (0..7u64).map(|i| MacAddr::from(0x0200_0000_0000 + 2 * i)).collect();
        let home = slot_of(macs[0], 1);
        assert!(macs.iter().all(|m| slot_of(*m, 1) == home));

        for (i, mac) in macs.iter().take(6).enumerate() {
            addr_add(&switch, &addr(*mac, 1, 1 + i as u8))?;
            let w = stub.memory(table::l2::TABLE.address(home + i as u32), 4);
            assert_eq!(table::l2::decode(&w).map(|e| e.mac), Some(*mac));
        }
        assert!(matches!(
            addr_add(&switch, &addr(macs[6], 1, 1)),
            Err(SwdError::TableFull(_))
        ));
        assert_eq!(usage(&switch).exhaustion, 1);

        // Each key is still found along its candidate slots
        for (i, mac) in macs.iter().take(6).enumerate() {
            assert_eq!(addr_get(&switch, *mac, 1)?.port, port(1 + i as u8));
        }

        // Deleting from the middle of the chain leaves the rest reachable,
        // and frees a slot for the seventh key.
        addr_delete(&switch, macs[2], 1)?;
        assert_eq!(addr_get(&switch, macs[5], 1)?.port, port(6));
        addr_add(&switch, &addr(macs[6], 1, 7))?;
        let w = stub.memory(table::l2::TABLE.address(home + 2), 4);
        assert_eq!(table::l2::decode(&w).map(|e| e.mac), Some(macs[6]));
        Ok(())
    }

    #[test]
    fn test_validation() -> anyhow::Result<()> {
        let (switch, _) = test_switch();
        let mac: MacAddr = "00:00:00:00:00:01".parse()?;
        assert!(matches!(
            addr_add(&switch, &addr(mac, 4096, 1)),
            Err(SwdError::Invalid(_))
        ));
        assert!(matches!(
            addr_get(&switch, mac, 5000),
            Err(SwdError::Invalid(_))
        ));
        assert_eq!(usage(&switch).occupancy, 0);
        Ok(())
    }

    #[test]
    fn test_write_failure() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        let mac: MacAddr = "00:00:00:00:00:02".parse()?;
        let base = table::l2::TABLE.base;
        stub.fail_writes(base..base + 0x10_0000);
        assert!(addr_add(&switch, &addr(mac, 0, 1)).is_err());
        assert!(addr_get(&switch, mac, 0).is_err());
        assert_eq!(usage(&switch).occupancy, 0);
        Ok(())
    }

    #[test]
    fn test_user_entries() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        let slot = user_bpdu_add(&switch)?;
        assert_eq!(slot, 0);
        let w = stub.memory(l2_user::TABLE.address(0), 5);
        let e = l2_user::decode(&w).unwrap();
        assert_eq!(e.mac, BPDU_MAC);
        assert_eq!(e.mask, l2_user::MASK_MAC_ONLY);
        assert!(e.bpdu && e.copy_to_cpu);

        let other = L2UserEntry {
            mac: "01:00:5e:00:00:01".parse()?,
            vlan: 0,
            mask: l2_user::MASK_ALL,
            port: 0,
            copy_to_cpu: true,
            bpdu: false,
        };
        assert_eq!(user_add(&switch, &other)?, 1);

        // The lowest free slot is reused
        user_delete(&switch, 0)?;
        assert_eq!(l2_user::decode(&stub.memory(l2_user::TABLE.address(0), 5)), None);
        assert_eq!(user_add(&switch, &other)?, 0);

        assert!(matches!(user_delete(&switch, 2), Err(SwdError::Missing(_))));
        assert!(matches!(
            user_delete(&switch, 512),
            Err(SwdError::Invalid(_))
        ));
        Ok(())
    }
}
