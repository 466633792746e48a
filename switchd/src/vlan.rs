// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! VLAN membership.  Each VLAN is an entry in both the ingress and egress VLAN
//! tables.  A member port appears in the ingress bitmaps and the egress
//! bitmap; an untagged member also appears in the egress untagged bitmap, so
//! the tag is stripped on the way out.

use std::collections::BTreeMap;

use slog::{debug, error};

use crate::table;
use crate::table::vlan::{self as vlan_table, EgrVlanEntry, VlanEntry};
use crate::types::{SwdError, SwdResult};
use crate::Switch;
use common::network::validate_vlan;
use common::ports::PortId;

/// The ports in a VLAN, as hardware bitmaps
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VlanMembers {
    pub ports: u128,
    pub untagged: u128,
}

impl VlanMembers {
    pub fn contains(&self, port: PortId) -> bool {
        self.ports & vlan_table::port_bit(port.as_u8()) != 0
    }

    pub fn is_untagged(&self, port: PortId) -> bool {
        self.untagged & vlan_table::port_bit(port.as_u8()) != 0
    }
}

#[derive(Default)]
pub struct VlanData {
    vlans: BTreeMap<u16, VlanMembers>,
}

impl VlanData {
    pub fn new() -> Self {
        Self::default()
    }
}

// Write both halves of a VLAN.  If the egress half can't be written, the
// ingress half is restored to `prior`.
fn write_vlan(
    switch: &Switch,
    vid: u16,
    members: &VlanMembers,
    prior: Option<&VlanMembers>,
) -> SwdResult<()> {
    let ing = VlanEntry {
        port_bitmap: members.ports,
        ing_port_bitmap: members.ports,
        stg: vlan_table::DEFAULT_STG,
        profile: 0,
    };
    let egr = EgrVlanEntry {
        stg: vlan_table::DEFAULT_STG,
        ut_port_bitmap: members.untagged,
        port_bitmap: members.ports,
    };
    let index = vid as u32;

    table::write_entry(
        switch,
        &vlan_table::ING_TABLE,
        index,
        &vlan_table::encode_ing(&ing),
    )?;
    if let Err(e) = table::write_entry(
        switch,
        &vlan_table::EGR_TABLE,
        index,
        &vlan_table::encode_egr(&egr),
    ) {
        let restored = match prior {
            Some(p) => table::write_entry(
                switch,
                &vlan_table::ING_TABLE,
                index,
                &vlan_table::encode_ing(&VlanEntry {
                    port_bitmap: p.ports,
                    ing_port_bitmap: p.ports,
                    ..ing
                }),
            ),
            None => table::clear_entry(switch, &vlan_table::ING_TABLE, index),
        };
        if let Err(e) = restored {
            error!(switch.log, "failed to restore ingress vlan";
                "vlan" => vid, "error" => %e);
        }
        return Err(e);
    }
    Ok(())
}

fn create_locked(
    switch: &Switch,
    vlans: &mut VlanData,
    vid: u16,
) -> SwdResult<()> {
    if vlans.vlans.contains_key(&vid) {
        return Ok(());
    }
    let members = VlanMembers::default();
    write_vlan(switch, vid, &members, None)?;
    debug!(switch.log, "created vlan"; "vlan" => vid);
    vlans.vlans.insert(vid, members);
    Ok(())
}

/// Create a VLAN with no members.  Creating a VLAN that already exists is not
/// an error.
pub fn create(switch: &Switch, vid: u16) -> SwdResult<()> {
    validate_vlan(vid)?;
    let mut vlans = switch.vlans.lock().unwrap();
    create_locked(switch, &mut vlans, vid)
}

/// Add a port to a VLAN, creating the VLAN if needed.
pub fn port_add(
    switch: &Switch,
    vid: u16,
    port: PortId,
    untagged: bool,
) -> SwdResult<()> {
    validate_vlan(vid)?;
    switch.check_port(port)?;

    let mut vlans = switch.vlans.lock().unwrap();
    create_locked(switch, &mut vlans, vid)?;
    let prior = vlans.vlans.get(&vid).copied().unwrap_or_default();

    let bit = vlan_table::port_bit(port.as_u8());
    let mut members = prior;
    members.ports |= bit;
    if untagged {
        members.untagged |= bit;
    } else {
        members.untagged &= !bit;
    }
    write_vlan(switch, vid, &members, Some(&prior))?;
    debug!(switch.log, "added port to vlan";
        "vlan" => vid, "port" => %port, "untagged" => untagged);
    vlans.vlans.insert(vid, members);
    Ok(())
}

pub fn port_remove(switch: &Switch, vid: u16, port: PortId) -> SwdResult<()> {
    validate_vlan(vid)?;

    let mut vlans = switch.vlans.lock().unwrap();
    let Some(prior) = vlans.vlans.get(&vid).copied() else {
        return Err(SwdError::Missing(format!("no such vlan: {vid}")));
    };
    if !prior.contains(port) {
        return Err(SwdError::Missing(format!(
            "port {port} is not in vlan {vid}"
        )));
    }

    let bit = vlan_table::port_bit(port.as_u8());
    let members = VlanMembers {
        ports: prior.ports & !bit,
        untagged: prior.untagged & !bit,
    };
    write_vlan(switch, vid, &members, Some(&prior))?;
    debug!(switch.log, "removed port from vlan";
        "vlan" => vid, "port" => %port);
    vlans.vlans.insert(vid, members);
    Ok(())
}

pub fn members(switch: &Switch, vid: u16) -> SwdResult<VlanMembers> {
    validate_vlan(vid)?;
    let vlans = switch.vlans.lock().unwrap();
    vlans
        .vlans
        .get(&vid)
        .copied()
        .ok_or_else(|| SwdError::Missing(format!("no such vlan: {vid}")))
}

/// Remove a VLAN from both tables.
pub fn destroy(switch: &Switch, vid: u16) -> SwdResult<()> {
    validate_vlan(vid)?;

    let mut vlans = switch.vlans.lock().unwrap();
    if vlans.vlans.remove(&vid).is_none() {
        return Err(SwdError::Missing(format!("no such vlan: {vid}")));
    }
    for t in [&vlan_table::ING_TABLE, &vlan_table::EGR_TABLE] {
        if let Err(e) = table::clear_entry(switch, t, vid as u32) {
            error!(switch.log, "failed to clear vlan";
                "table" => t.name, "vlan" => vid, "error" => %e);
        }
    }
    debug!(switch.log, "destroyed vlan"; "vlan" => vid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_switch;
    use asic::stub::StubDevice;

    fn port(n: u8) -> PortId {
        PortId::new(n).unwrap()
    }

    fn hw(stub: &StubDevice, vid: u16) -> (Option<VlanEntry>, Option<EgrVlanEntry>) {
        let ing = stub.memory(vlan_table::ING_TABLE.address(vid as u32), 10);
        let egr = stub.memory(vlan_table::EGR_TABLE.address(vid as u32), 8);
        (vlan_table::decode_ing(&ing), vlan_table::decode_egr(&egr))
    }

    #[test]
    fn test_create() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        create(&switch, 100)?;
        let (ing, egr) = hw(&stub, 100);
        let ing = ing.unwrap();
        let egr = egr.unwrap();
        assert_eq!((ing.port_bitmap, ing.stg), (0, vlan_table::DEFAULT_STG));
        assert_eq!((egr.port_bitmap, egr.stg), (0, vlan_table::DEFAULT_STG));

        // A second create leaves the VLAN alone
        port_add(&switch, 100, port(1), false)?;
        create(&switch, 100)?;
        assert!(members(&switch, 100)?.contains(port(1)));

        assert!(matches!(create(&switch, 0), Err(SwdError::Invalid(_))));
        assert!(matches!(create(&switch, 4096), Err(SwdError::Invalid(_))));
        create(&switch, 4095)?;
        Ok(())
    }

    #[test]
    fn test_membership() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();

        // Adding a port creates the VLAN
        port_add(&switch, 10, port(1), true)?;
        port_add(&switch, 10, port(52), false)?;
        let m = members(&switch, 10)?;
        assert!(m.is_untagged(port(1)));
        assert!(!m.is_untagged(port(52)));

        let (ing, egr) = hw(&stub, 10);
        let (ing, egr) = (ing.unwrap(), egr.unwrap());
        let both = (1u128 << 1) | (1u128 << 52);
        assert_eq!(ing.port_bitmap, both);
        assert_eq!(ing.ing_port_bitmap, both);
        assert_eq!(egr.port_bitmap, both);
        assert_eq!(egr.ut_port_bitmap, 1 << 1);

        // Re-adding a port as tagged clears its untagged bit
        port_add(&switch, 10, port(1), false)?;
        assert_eq!(hw(&stub, 10).1.unwrap().ut_port_bitmap, 0);

        port_remove(&switch, 10, port(1))?;
        assert_eq!(hw(&stub, 10).0.unwrap().port_bitmap, 1 << 52);
        assert!(matches!(
            port_remove(&switch, 10, port(1)),
            Err(SwdError::Missing(_))
        ));
        assert!(matches!(
            port_remove(&switch, 11, port(1)),
            Err(SwdError::Missing(_))
        ));
        Ok(())
    }

    #[test]
    fn test_port_validation() -> anyhow::Result<()> {
        let config = crate::config::Config {
            num_ports: 8,
            ..Default::default()
        };
        let (switch, _) = crate::test_switch_with(config);
        assert!(matches!(
            port_add(&switch, 10, port(9), false),
            Err(SwdError::Invalid(_))
        ));
        assert!(matches!(members(&switch, 10), Err(SwdError::Missing(_))));
        Ok(())
    }

    #[test]
    fn test_destroy() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        port_add(&switch, 20, port(3), false)?;
        destroy(&switch, 20)?;
        assert_eq!(hw(&stub, 20), (None, None));
        assert!(matches!(destroy(&switch, 20), Err(SwdError::Missing(_))));
        Ok(())
    }

    #[test]
    fn test_rollback() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        port_add(&switch, 30, port(2), false)?;

        let base = vlan_table::EGR_TABLE.base;
        stub.fail_writes(base..base + 0x2_0000);
        assert!(port_add(&switch, 30, port(3), false).is_err());

        // The ingress half is back to the original membership
        assert_eq!(hw(&stub, 30).0.unwrap().port_bitmap, 1 << 2);
        assert!(!members(&switch, 30)?.contains(port(3)));

        assert!(create(&switch, 31).is_err());
        assert_eq!(hw(&stub, 31).0, None);
        Ok(())
    }
}
