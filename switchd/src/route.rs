// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! IPv4 routes, held in the L3_DEFIP TCAM.
//!
//! Every route is keyed by its (prefix, length) pair with the host bits
//! cleared.  Re-adding a key rewrites the slot it already occupies, so the
//! TCAM never holds two entries for the same prefix.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use oxnet::Ipv4Net;
use slog::{debug, error};

use crate::idmap::{DefipSlot, EcmpId, EgressId, IdMap};
use crate::l3::L3Data;
use crate::table;
use crate::table::defip::{self, DefipEntry};
use crate::types::{SwdError, SwdResult};
use crate::Switch;

/// What a route forwards to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteTarget {
    Egress(EgressId),
    Ecmp(EcmpId),
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RouteTarget::Egress(id) => write!(f, "egress {id}"),
            RouteTarget::Ecmp(id) => write!(f, "ecmp {id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    pub subnet: Ipv4Net,
    pub slot: DefipSlot,
    pub target: RouteTarget,
}

pub struct RouteData {
    slots: IdMap<DefipSlot>,
    routes: BTreeMap<Ipv4Net, RouteEntry>,
}

impl RouteData {
    pub fn new() -> Self {
        RouteData {
            slots: IdMap::new(),
            routes: BTreeMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.routes.len()
    }
}

impl Default for RouteData {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a route key from an address and prefix length, clearing the host
/// bits.
pub fn subnet(addr: Ipv4Addr, prefix_len: u8) -> SwdResult<Ipv4Net> {
    if prefix_len > 32 {
        return Err(SwdError::Invalid(format!(
            "invalid prefix length: {prefix_len}"
        )));
    }
    let masked = u32::from(addr) & defip::prefix_mask(prefix_len);
    Ipv4Net::new(Ipv4Addr::from(masked), prefix_len)
        .map_err(|e| SwdError::Invalid(format!("{addr}/{prefix_len}: {e}")))
}

fn key(net: Ipv4Net) -> SwdResult<Ipv4Net> {
    subnet(net.addr(), net.width())
}

fn target_ref(l3: &mut L3Data, target: RouteTarget) -> SwdResult<()> {
    match target {
        RouteTarget::Egress(id) => l3.egress_ref(id),
        RouteTarget::Ecmp(id) => l3.ecmp.group_ref(id),
    }
}

fn target_unref(l3: &mut L3Data, target: RouteTarget) {
    match target {
        RouteTarget::Egress(id) => l3.egress_unref(id),
        RouteTarget::Ecmp(id) => l3.ecmp.group_unref(id),
    }
}

fn target_exists(l3: &L3Data, target: RouteTarget) -> bool {
    match target {
        RouteTarget::Egress(id) => l3.egress_exists(id),
        RouteTarget::Ecmp(id) => l3.ecmp.exists(id),
    }
}

/// Add or replace the route for `subnet`.
pub fn add(
    switch: &Switch,
    subnet: Ipv4Net,
    target: RouteTarget,
) -> SwdResult<DefipSlot> {
    let subnet = key(subnet)?;

    let mut l3 = switch.l3.lock().unwrap();
    if !target_exists(&l3, target) {
        return Err(SwdError::Invalid(format!("no such {target}")));
    }

    let old = l3.routes.routes.get(&subnet).copied();
    let slot = match old {
        Some(r) => r.slot,
        None => l3.routes.slots.alloc()?,
    };

    let (ecmp, next_hop) = match target {
        RouteTarget::Egress(id) => (false, id.index()),
        RouteTarget::Ecmp(id) => (true, id.index()),
    };
    let entry = DefipEntry {
        subnet,
        ecmp,
        next_hop,
    };
    if let Err(e) = table::write_entry(
        switch,
        &defip::TABLE,
        slot.index() as u32,
        &defip::encode(&entry),
    ) {
        if old.is_none() {
            let _ = l3.routes.slots.free(slot);
        }
        return Err(e);
    }

    target_ref(&mut l3, target)?;
    if let Some(old) = old {
        target_unref(&mut l3, old.target);
    }
    debug!(switch.log, "added route";
        "subnet" => %subnet, "target" => %target, "slot" => %slot);
    l3.routes.routes.insert(
        subnet,
        RouteEntry {
            subnet,
            slot,
            target,
        },
    );
    Ok(slot)
}

/// Remove the route for `subnet`.
pub fn delete(switch: &Switch, subnet: Ipv4Net) -> SwdResult<()> {
    let subnet = key(subnet)?;

    let mut l3 = switch.l3.lock().unwrap();
    let Some(route) = l3.routes.routes.remove(&subnet) else {
        return Err(SwdError::Missing(format!("no route for {subnet}")));
    };
    if let Err(e) =
        table::clear_entry(switch, &defip::TABLE, route.slot.index() as u32)
    {
        error!(switch.log, "failed to clear route";
            "subnet" => %subnet, "slot" => %route.slot, "error" => %e);
    }
    l3.routes.slots.free(route.slot)?;
    target_unref(&mut l3, route.target);
    debug!(switch.log, "deleted route"; "subnet" => %subnet);
    Ok(())
}

pub fn get(switch: &Switch, subnet: Ipv4Net) -> SwdResult<RouteEntry> {
    let subnet = key(subnet)?;
    let l3 = switch.l3.lock().unwrap();
    l3.routes
        .routes
        .get(&subnet)
        .copied()
        .ok_or_else(|| SwdError::Missing(format!("no route for {subnet}")))
}

/// Add a host route.  Only IPv4 is supported.
pub fn host_add(
    switch: &Switch,
    ip: IpAddr,
    egress: EgressId,
) -> SwdResult<DefipSlot> {
    match ip {
        IpAddr::V4(v4) => add(switch, subnet(v4, 32)?, RouteTarget::Egress(egress)),
        IpAddr::V6(v6) => Err(SwdError::Unsupported(format!(
            "cannot add IPv6 host route to {v6}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l3::{egress_create, egress_destroy, intf_create, Egress};
    use crate::test_switch;
    use asic::stub::StubDevice;
    use common::network::MacAddr;
    use common::ports::PortId;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn egress(switch: &Switch, port: u8) -> anyhow::Result<EgressId> {
        let intf = intf_create(switch, MacAddr::new(2, 0, 0, 0, 0, port), 0)?;
        Ok(egress_create(
            switch,
            &Egress {
                mac: MacAddr::new(0x52, 0x54, 0, 0, 0, port),
                port: PortId::new(port)?,
                intf,
            },
        )?)
    }

    fn hw(stub: &StubDevice, slot: DefipSlot) -> Option<DefipEntry> {
        let w = stub.memory(defip::TABLE.address(slot.index() as u32), 8);
        defip::decode(&w)
    }

    #[test]
    fn test_add_get_delete() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        let e = egress(&switch, 12)?;
        let slot = add(&switch, net("10.0.0.0/24"), RouteTarget::Egress(e))?;
        assert_eq!(
            hw(&stub, slot),
            Some(DefipEntry {
                subnet: net("10.0.0.0/24"),
                ecmp: false,
                next_hop: e.index(),
            })
        );
        let r = get(&switch, net("10.0.0.0/24"))?;
        assert_eq!((r.slot, r.target), (slot, RouteTarget::Egress(e)));

        delete(&switch, net("10.0.0.0/24"))?;
        assert_eq!(hw(&stub, slot), None);
        assert!(matches!(
            get(&switch, net("10.0.0.0/24")),
            Err(SwdError::Missing(_))
        ));
        assert!(matches!(
            delete(&switch, net("10.0.0.0/24")),
            Err(SwdError::Missing(_))
        ));
        Ok(())
    }

    #[test]
    fn test_replace_in_place() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        let a = egress(&switch, 1)?;
        let b = egress(&switch, 2)?;
        let slot = add(&switch, net("192.168.1.0/24"), RouteTarget::Egress(a))?;

        // The same key, with host bits set, lands in the same slot
        let again =
            add(&switch, net("192.168.1.77/24"), RouteTarget::Egress(b))?;
        assert_eq!(slot, again);
        assert_eq!(hw(&stub, slot).map(|e| e.next_hop), Some(b.index()));
        assert_eq!(switch.l3.lock().unwrap().routes.len(), 1);

        // The first egress is no longer referenced, the second still is
        egress_destroy(&switch, a)?;
        assert!(matches!(egress_destroy(&switch, b), Err(SwdError::Busy(_))));
        delete(&switch, net("192.168.1.0/24"))?;
        egress_destroy(&switch, b)?;
        Ok(())
    }

    #[test]
    fn test_prefix_boundaries() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        let e = egress(&switch, 3)?;
        let default = add(&switch, net("0.0.0.0/0"), RouteTarget::Egress(e))?;
        let host = host_add(&switch, "10.1.2.3".parse()?, e)?;
        assert_ne!(default, host);
        assert_eq!(hw(&stub, default).map(|e| e.subnet), Some(net("0.0.0.0/0")));
        assert_eq!(
            hw(&stub, host).map(|e| e.subnet),
            Some(net("10.1.2.3/32"))
        );

        assert_eq!(subnet("10.1.2.3".parse()?, 8)?, net("10.0.0.0/8"));
        assert!(matches!(
            subnet("10.1.2.3".parse()?, 33),
            Err(SwdError::Invalid(_))
        ));
        assert!(matches!(
            host_add(&switch, "fd00::1".parse()?, e),
            Err(SwdError::Unsupported(_))
        ));
        Ok(())
    }

    #[test]
    fn test_unknown_target() -> anyhow::Result<()> {
        let (switch, _) = test_switch();
        let e = egress(&switch, 3)?;
        egress_destroy(&switch, e)?;
        assert!(matches!(
            add(&switch, net("10.0.0.0/8"), RouteTarget::Egress(e)),
            Err(SwdError::Invalid(_))
        ));
        let mut ids = IdMap::<EcmpId>::new();
        assert!(matches!(
            add(&switch, net("10.0.0.0/8"), RouteTarget::Ecmp(ids.alloc()?)),
            Err(SwdError::Invalid(_))
        ));
        assert_eq!(switch.l3.lock().unwrap().routes.slots.used(), 0);
        Ok(())
    }

    #[test]
    fn test_write_failure() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        let e = egress(&switch, 4)?;
        let base = defip::TABLE.base;
        stub.fail_writes(base..base + 0x4_0000);
        assert!(add(&switch, net("10.0.0.0/8"), RouteTarget::Egress(e)).is_err());
        assert_eq!(switch.l3.lock().unwrap().routes.slots.used(), 0);
        assert!(get(&switch, net("10.0.0.0/8")).is_err());

        // The failed route holds no reference on the egress
        egress_destroy(&switch, e)?;
        Ok(())
    }
}
