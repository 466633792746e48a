// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! L3 interfaces and egress objects.
//!
//! An L3 interface supplies the source MAC and VLAN for routed packets.  An
//! egress object (a next hop) names an output port, an interface, and the
//! destination MAC.  Routes and ECMP groups point at egress objects, which in
//! turn point at interfaces.  Nothing may be destroyed while something still
//! points at it.
//!
//! All of the L3 state, including routes and ECMP groups, lives under the
//! single `l3` lock so that operations spanning several tables are atomic.

use std::collections::BTreeMap;

use slog::{debug, error};

use crate::ecmp::EcmpData;
use crate::idmap::{EgressId, IdMap, IntfId};
use crate::route::RouteData;
use crate::table;
use crate::table::l3_intf::{self, L3IntfEntry};
use crate::table::nexthop::{self, EgrNextHop, IngNextHop};
use crate::types::{SwdError, SwdResult};
use crate::Switch;
use common::network::{validate_vlan_tag, MacAddr};
use common::ports::PortId;

/// The addressing an L3 interface stamps onto routed packets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct L3Intf {
    pub mac: MacAddr,
    pub vlan: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Egress {
    /// Destination MAC of the next hop
    pub mac: MacAddr,
    pub port: PortId,
    pub intf: IntfId,
}

struct IntfState {
    intf: L3Intf,
    // Number of egress objects using this interface
    refs: u32,
}

struct EgressState {
    egress: Egress,
    // Number of routes and ECMP groups using this egress object
    refs: u32,
}

pub struct L3Data {
    intf_ids: IdMap<IntfId>,
    intfs: BTreeMap<IntfId, IntfState>,
    egress_ids: IdMap<EgressId>,
    egresses: BTreeMap<EgressId, EgressState>,
    pub(crate) routes: RouteData,
    pub(crate) ecmp: EcmpData,
}

impl L3Data {
    pub fn new(log: &slog::Logger) -> Self {
        L3Data {
            intf_ids: IdMap::new(),
            intfs: BTreeMap::new(),
            egress_ids: IdMap::new(),
            egresses: BTreeMap::new(),
            routes: RouteData::new(),
            ecmp: EcmpData::new(log),
        }
    }

    /// Number of live egress objects
    pub(crate) fn egress_used(&self) -> u32 {
        self.egress_ids.used()
    }

    pub(crate) fn egress_exists(&self, id: EgressId) -> bool {
        self.egresses.contains_key(&id)
    }

    /// Record a new user of an egress object.
    pub(crate) fn egress_ref(&mut self, id: EgressId) -> SwdResult<()> {
        match self.egresses.get_mut(&id) {
            Some(e) => {
                e.refs += 1;
                Ok(())
            }
            None => Err(SwdError::Invalid(format!("no such egress: {id}"))),
        }
    }

    pub(crate) fn egress_unref(&mut self, id: EgressId) {
        if let Some(e) = self.egresses.get_mut(&id) {
            e.refs = e.refs.saturating_sub(1);
        }
    }
}

pub fn intf_create(switch: &Switch, mac: MacAddr, vlan: u16) -> SwdResult<IntfId> {
    validate_vlan_tag(vlan)?;

    let mut l3 = switch.l3.lock().unwrap();
    let id = l3.intf_ids.alloc()?;
    let entry = L3IntfEntry { mac, vlan };
    if let Err(e) = table::write_entry(
        switch,
        &l3_intf::TABLE,
        id.index() as u32,
        &l3_intf::encode(&entry),
    ) {
        let _ = l3.intf_ids.free(id);
        return Err(e);
    }

    debug!(switch.log, "created l3 interface";
        "intf" => %id, "mac" => %mac, "vlan" => vlan);
    l3.intfs.insert(
        id,
        IntfState {
            intf: L3Intf { mac, vlan },
            refs: 0,
        },
    );
    Ok(id)
}

pub fn intf_get(switch: &Switch, id: IntfId) -> SwdResult<L3Intf> {
    let l3 = switch.l3.lock().unwrap();
    l3.intfs
        .get(&id)
        .map(|s| s.intf)
        .ok_or_else(|| SwdError::Missing(format!("no such interface: {id}")))
}

/// Destroy an interface.  Fails with `Busy` while any egress object still
/// uses it.
pub fn intf_destroy(switch: &Switch, id: IntfId) -> SwdResult<()> {
    let mut l3 = switch.l3.lock().unwrap();
    match l3.intfs.get(&id) {
        None => {
            return Err(SwdError::Missing(format!("no such interface: {id}")))
        }
        Some(s) if s.refs > 0 => {
            return Err(SwdError::Busy(format!(
                "interface {id} is used by {} egress objects",
                s.refs
            )))
        }
        Some(_) => {}
    }

    if let Err(e) = table::clear_entry(switch, &l3_intf::TABLE, id.index() as u32)
    {
        error!(switch.log, "failed to clear l3 interface";
            "intf" => %id, "error" => %e);
    }
    l3.intfs.remove(&id);
    l3.intf_ids.free(id)?;
    debug!(switch.log, "destroyed l3 interface"; "intf" => %id);
    Ok(())
}

/// Create an egress object.  The ingress half is written first, so the ASIC
/// never sees an egress half without a matching port.
pub fn egress_create(switch: &Switch, egress: &Egress) -> SwdResult<EgressId> {
    switch.check_port(egress.port)?;

    let mut l3 = switch.l3.lock().unwrap();
    if !l3.intfs.contains_key(&egress.intf) {
        return Err(SwdError::Invalid(format!(
            "no such interface: {}",
            egress.intf
        )));
    }

    let id = l3.egress_ids.alloc()?;
    let index = id.index() as u32;
    let ing = IngNextHop {
        entry_type: nexthop::ENTRY_TYPE_UNICAST,
        port: egress.port.as_u8(),
        module: 0,
    };
    let egr = EgrNextHop {
        entry_type: nexthop::ENTRY_TYPE_UNICAST,
        intf: egress.intf.index(),
        mac: egress.mac,
    };

    if let Err(e) = table::write_entry(
        switch,
        &nexthop::ING_TABLE,
        index,
        &nexthop::encode_ing(&ing),
    ) {
        let _ = l3.egress_ids.free(id);
        return Err(e);
    }
    if let Err(e) = table::write_entry(
        switch,
        &nexthop::EGR_TABLE,
        index,
        &nexthop::encode_egr(&egr),
    ) {
        if let Err(e) = table::clear_entry(switch, &nexthop::ING_TABLE, index) {
            error!(switch.log, "failed to roll back ingress next hop";
                "egress" => %id, "error" => %e);
        }
        let _ = l3.egress_ids.free(id);
        return Err(e);
    }

    debug!(switch.log, "created egress";
        "egress" => %id,
        "mac" => %egress.mac,
        "port" => %egress.port,
        "intf" => %egress.intf);
    if let Some(intf) = l3.intfs.get_mut(&egress.intf) {
        intf.refs += 1;
    }
    l3.egresses.insert(
        id,
        EgressState {
            egress: *egress,
            refs: 0,
        },
    );
    Ok(id)
}

pub fn egress_get(switch: &Switch, id: EgressId) -> SwdResult<Egress> {
    let l3 = switch.l3.lock().unwrap();
    l3.egresses
        .get(&id)
        .map(|s| s.egress)
        .ok_or_else(|| SwdError::Missing(format!("no such egress: {id}")))
}

/// Destroy an egress object.  Fails with `Busy` while any route or ECMP group
/// still uses it.
pub fn egress_destroy(switch: &Switch, id: EgressId) -> SwdResult<()> {
    let mut l3 = switch.l3.lock().unwrap();
    let Some(state) = l3.egresses.get(&id) else {
        return Err(SwdError::Missing(format!("no such egress: {id}")));
    };
    if state.refs > 0 {
        return Err(SwdError::Busy(format!(
            "egress {id} is used by {} routes or groups",
            state.refs
        )));
    }
    let intf = state.egress.intf;

    let index = id.index() as u32;
    for t in [&nexthop::ING_TABLE, &nexthop::EGR_TABLE] {
        if let Err(e) = table::clear_entry(switch, t, index) {
            error!(switch.log, "failed to clear next hop";
                "table" => t.name, "egress" => %id, "error" => %e);
        }
    }
    l3.egresses.remove(&id);
    l3.egress_ids.free(id)?;
    if let Some(s) = l3.intfs.get_mut(&intf) {
        s.refs = s.refs.saturating_sub(1);
    }
    debug!(switch.log, "destroyed egress"; "egress" => %id);
    Ok(())
}

/// The egress objects built on an interface
pub fn egress_using_intf(switch: &Switch, intf: IntfId) -> Vec<EgressId> {
    let l3 = switch.l3.lock().unwrap();
    l3.egresses
        .iter()
        .filter(|(_, s)| s.egress.intf == intf)
        .map(|(id, _)| *id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_switch;

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_intf() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        let m = mac("02:00:00:00:00:0c");
        let id = intf_create(&switch, m, 0)?;
        assert_eq!(id.index(), 1);
        assert_eq!(intf_get(&switch, id)?, L3Intf { mac: m, vlan: 0 });

        let w = stub.memory(l3_intf::TABLE.address(1), 4);
        assert_eq!(l3_intf::decode(&w), Some(L3IntfEntry { mac: m, vlan: 0 }));

        assert!(matches!(
            intf_create(&switch, m, 4096),
            Err(SwdError::Invalid(_))
        ));

        intf_destroy(&switch, id)?;
        assert_eq!(stub.memory(l3_intf::TABLE.address(1), 4), vec![0; 4]);
        assert!(matches!(intf_get(&switch, id), Err(SwdError::Missing(_))));
        assert!(matches!(
            intf_destroy(&switch, id),
            Err(SwdError::Missing(_))
        ));
        Ok(())
    }

    #[test]
    fn test_intf_rollback() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        let base = l3_intf::TABLE.base;
        stub.fail_writes(base..base + 0x1_0000);
        assert!(intf_create(&switch, mac("02:00:00:00:00:01"), 0).is_err());
        assert_eq!(switch.l3.lock().unwrap().intf_ids.used(), 0);
        Ok(())
    }

    #[test]
    fn test_egress() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        let intf = intf_create(&switch, mac("02:00:00:00:00:0c"), 0)?;
        let e = Egress {
            mac: mac("52:54:00:aa:bb:cc"),
            port: PortId::new(12)?,
            intf,
        };
        let id = egress_create(&switch, &e)?;
        assert_eq!(egress_get(&switch, id)?, e);

        let index = id.index() as u32;
        let ing = stub.memory(nexthop::ING_TABLE.address(index), 2);
        assert_eq!(nexthop::decode_ing(&ing).map(|n| n.port), Some(12));
        let egr = stub.memory(nexthop::EGR_TABLE.address(index), 4);
        let egr = nexthop::decode_egr(&egr).unwrap();
        assert_eq!((egr.intf, egr.mac), (intf.index(), e.mac));

        egress_destroy(&switch, id)?;
        assert_eq!(stub.memory(nexthop::ING_TABLE.address(index), 2), vec![0; 2]);
        assert!(matches!(egress_get(&switch, id), Err(SwdError::Missing(_))));
        Ok(())
    }

    #[test]
    fn test_egress_validation() -> anyhow::Result<()> {
        let (switch, _) = test_switch();
        let intf = intf_create(&switch, mac("02:00:00:00:00:01"), 0)?;
        let e = Egress {
            mac: mac("52:54:00:00:00:01"),
            port: PortId::new(1)?,
            intf,
        };

        // The interface is gone by the time the egress is created
        intf_destroy(&switch, intf)?;
        assert!(matches!(
            egress_create(&switch, &e),
            Err(SwdError::Invalid(_))
        ));
        assert_eq!(switch.l3.lock().unwrap().egress_ids.used(), 0);

        // A port beyond those configured on this switch
        let config = crate::config::Config {
            num_ports: 4,
            ..Default::default()
        };
        let (switch, _) = crate::test_switch_with(config);
        let intf = intf_create(&switch, mac("02:00:00:00:00:01"), 0)?;
        let e = Egress {
            mac: mac("52:54:00:00:00:01"),
            port: PortId::new(5)?,
            intf,
        };
        assert!(matches!(
            egress_create(&switch, &e),
            Err(SwdError::Invalid(_))
        ));
        Ok(())
    }

    #[test]
    fn test_egress_rollback() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        let intf = intf_create(&switch, mac("02:00:00:00:00:01"), 0)?;
        let e = Egress {
            mac: mac("52:54:00:00:00:01"),
            port: PortId::new(1)?,
            intf,
        };

        // The egress half fails, so the ingress half must be cleared again
        let base = nexthop::EGR_TABLE.base;
        stub.fail_writes(base..base + 0x4_0000);
        assert!(egress_create(&switch, &e).is_err());
        assert_eq!(stub.memory(nexthop::ING_TABLE.address(1), 2), vec![0; 2]);
        assert_eq!(switch.l3.lock().unwrap().egress_ids.used(), 0);

        // The interface holds no reference from the failed attempt
        intf_destroy(&switch, intf)?;
        Ok(())
    }

    #[test]
    fn test_intf_reference_order() -> anyhow::Result<()> {
        let (switch, _) = test_switch();
        let intf = intf_create(&switch, mac("02:00:00:00:00:05"), 0)?;
        let e = Egress {
            mac: mac("52:54:00:00:00:05"),
            port: PortId::new(5)?,
            intf,
        };
        let id = egress_create(&switch, &e)?;
        assert_eq!(egress_using_intf(&switch, intf), vec![id]);

        assert!(matches!(
            intf_destroy(&switch, intf),
            Err(SwdError::Busy(_))
        ));
        egress_destroy(&switch, id)?;
        intf_destroy(&switch, intf)?;
        Ok(())
    }

    #[test]
    fn test_destroy_ignores_hw_failure() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        let intf = intf_create(&switch, mac("02:00:00:00:00:05"), 0)?;
        let id = egress_create(
            &switch,
            &Egress {
                mac: mac("52:54:00:00:00:05"),
                port: PortId::new(5)?,
                intf,
            },
        )?;

        let base = nexthop::EGR_TABLE.base;
        stub.fail_writes(base..base + 0x4_0000);
        egress_destroy(&switch, id)?;
        assert_eq!(switch.l3.lock().unwrap().egress_ids.used(), 0);
        Ok(())
    }
}
