// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Mirrors the kernel's view of the front-panel ports into the ASIC.
//!
//! The kernel owns the control plane: it decides which interfaces are up,
//! which addresses they carry, who the neighbors are and where routes point.
//! Each change reaches us as an `Event`, and the synchronizer applies it to
//! the tables.  The only state kept here is what is needed to tie later events
//! back to earlier ones: which port an ifindex names, which L3 interface a
//! port got, the MACs of known neighbors, and the egress object behind each
//! route we installed.
//!
//! A route whose gateway hasn't been resolved yet is held as pending, rather
//! than programmed with a next hop the ASIC can't use.  It is installed once a
//! neighbor event supplies the gateway's MAC.
//!
//! Directly connected destinations are routed through a /32 host route for
//! each resolved neighbor.  The kernel's route for the connected subnet has no
//! gateway and isn't programmed itself.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use oxnet::Ipv4Net;
use slog::{debug, error, info, o, warn};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::idmap::{EgressId, IntfId};
use crate::l2::{self, L2Addr};
use crate::l3::{self, Egress};
use crate::ports;
use crate::route::{self, RouteTarget};
use crate::types::{SwdError, SwdResult};
use crate::Switch;
use common::network::MacAddr;
use common::ports::PortId;

#[cfg(target_os = "linux")]
pub mod netlink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Added,
    Removed,
}

/// A change in the kernel's networking state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Link {
        ifindex: u32,
        name: String,
        up: bool,
    },
    LinkRemoved {
        ifindex: u32,
    },
    Addr {
        ifindex: u32,
        op: Op,
    },
    Route {
        subnet: Ipv4Net,
        op: Op,
        gateway: Option<Ipv4Addr>,
        oif: Option<u32>,
    },
    Neigh {
        ip: Ipv4Addr,
        ifindex: u32,
        mac: Option<MacAddr>,
        op: Op,
    },
}

/// What became of an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SyncOutcome {
    /// The tables were updated
    Applied,
    /// The event doesn't concern the switch
    Ignored,
    /// The event was recorded, but can't take effect until another arrives
    Pending,
    /// Applying the event failed
    Failed,
}

// A route waiting on its gateway's MAC
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingRoute {
    gateway: Ipv4Addr,
    oif: u32,
}

// A route we programmed, and the egress object created for it
#[derive(Clone, Copy, Debug)]
struct InstalledRoute {
    gateway: Ipv4Addr,
    oif: u32,
    egress: EgressId,
}

// The host route programmed for a resolved neighbor
#[derive(Clone, Copy, Debug)]
struct HostRoute {
    ifindex: u32,
    mac: MacAddr,
    egress: EgressId,
}

pub struct Synchronizer {
    log: slog::Logger,
    port_prefix: String,
    mac_base: MacAddr,
    // ifindex -> front-panel port
    ports: BTreeMap<u32, PortId>,
    // The L3 interface created for each port
    intfs: BTreeMap<PortId, IntfId>,
    // (address, ifindex) -> MAC
    neighbors: BTreeMap<(Ipv4Addr, u32), MacAddr>,
    pending: BTreeMap<Ipv4Net, PendingRoute>,
    installed: BTreeMap<Ipv4Net, InstalledRoute>,
    hosts: BTreeMap<Ipv4Addr, HostRoute>,
}

impl Synchronizer {
    pub fn new(log: &slog::Logger, config: &Config) -> Self {
        Synchronizer {
            log: log.new(o!("unit" => "sync")),
            port_prefix: config.port_prefix.clone(),
            mac_base: config.mac_base,
            ports: BTreeMap::new(),
            intfs: BTreeMap::new(),
            neighbors: BTreeMap::new(),
            pending: BTreeMap::new(),
            installed: BTreeMap::new(),
            hosts: BTreeMap::new(),
        }
    }

    /// The port an ifindex has been mapped to
    pub fn port(&self, ifindex: u32) -> Option<PortId> {
        self.ports.get(&ifindex).copied()
    }

    /// The L3 interface created for a port
    pub fn intf(&self, port: PortId) -> Option<IntfId> {
        self.intfs.get(&port).copied()
    }

    /// Routes still waiting on a neighbor
    pub fn pending(&self) -> Vec<Ipv4Net> {
        self.pending.keys().copied().collect()
    }

    /// Neighbors with a host route
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        self.hosts.keys().copied().collect()
    }

    /// Apply a single event.  Failures are logged and reported in the outcome,
    /// never returned, so one bad event can't stop the stream.
    pub fn handle(&mut self, switch: &Switch, event: Event) -> SyncOutcome {
        debug!(self.log, "handling event"; "event" => ?event);
        let result = match &event {
            Event::Link { ifindex, name, up } => {
                self.link(switch, *ifindex, name, *up)
            }
            Event::LinkRemoved { ifindex } => self.link_removed(switch, *ifindex),
            Event::Addr { ifindex, op } => match op {
                Op::Added => self.addr_added(switch, *ifindex),
                Op::Removed => self.addr_removed(switch, *ifindex),
            },
            Event::Route {
                subnet,
                op,
                gateway,
                oif,
            } => match op {
                Op::Added => self.route_added(switch, *subnet, *gateway, *oif),
                Op::Removed => self.route_removed(switch, *subnet),
            },
            Event::Neigh {
                ip,
                ifindex,
                mac,
                op,
            } => match op {
                Op::Added => self.neigh_added(switch, *ip, *ifindex, *mac),
                Op::Removed => self.neigh_removed(switch, *ip, *ifindex, *mac),
            },
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(self.log, "failed to apply event";
                    "event" => ?event, "error" => %e);
                SyncOutcome::Failed
            }
        }
    }

    /// Consume events until the sending side goes away.
    pub async fn run(
        mut self,
        switch: Arc<Switch>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        info!(self.log, "synchronizer running");
        while let Some(event) = events.recv().await {
            tokio::task::block_in_place(|| {
                self.handle(&switch, event);
            });
        }
        info!(self.log, "event stream closed");
    }

    fn link(
        &mut self,
        switch: &Switch,
        ifindex: u32,
        name: &str,
        up: bool,
    ) -> SwdResult<SyncOutcome> {
        let port = PortId::from_ifname(&self.port_prefix, name)
            .filter(|p| switch.check_port(*p).is_ok());
        let Some(port) = port else {
            // An interface that was renamed away from the port convention no
            // longer stands for its port.
            if let Some(old) = self.ports.remove(&ifindex) {
                self.forget_port(switch, old);
            }
            return Ok(SyncOutcome::Ignored);
        };

        if let Some(old) = self.ports.insert(ifindex, port) {
            if old != port {
                self.forget_port(switch, old);
            }
        }
        ports::watch(switch, port, true);
        ports::enable_set(switch, port, up)?;
        debug!(self.log, "link"; "ifindex" => ifindex, "port" => %port, "up" => up);
        Ok(SyncOutcome::Applied)
    }

    // Stop watching a port, if no other ifindex still names it
    fn forget_port(&self, switch: &Switch, port: PortId) {
        if !self.ports.values().any(|p| *p == port) {
            ports::watch(switch, port, false);
        }
    }

    fn link_removed(
        &mut self,
        switch: &Switch,
        ifindex: u32,
    ) -> SwdResult<SyncOutcome> {
        match self.ports.remove(&ifindex) {
            Some(port) => {
                self.forget_port(switch, port);
                debug!(self.log, "link removed";
                    "ifindex" => ifindex, "port" => %port);
                Ok(SyncOutcome::Applied)
            }
            None => Ok(SyncOutcome::Ignored),
        }
    }

    fn addr_added(
        &mut self,
        switch: &Switch,
        ifindex: u32,
    ) -> SwdResult<SyncOutcome> {
        let Some(port) = self.port(ifindex) else {
            return Ok(SyncOutcome::Ignored);
        };
        if self.intfs.contains_key(&port) {
            return Ok(SyncOutcome::Ignored);
        }

        let mac = self.mac_base.with_last_octet(port.as_u8());
        let intf = l3::intf_create(switch, mac, 0)?;
        info!(self.log, "created port interface";
            "port" => %port, "intf" => %intf, "mac" => %mac);
        self.intfs.insert(port, intf);

        // Neighbors learned before the interface existed can be routed now
        let known: Vec<(Ipv4Addr, u32, MacAddr)> = self
            .neighbors
            .iter()
            .filter(|((_, idx), _)| self.port(*idx) == Some(port))
            .map(|((ip, idx), mac)| (*ip, *idx, *mac))
            .collect();
        for (ip, idx, mac) in known {
            if let Err(e) = self.host_install(switch, ip, idx, port, intf, mac)
            {
                error!(self.log, "failed to install host route";
                    "neighbor" => %ip, "error" => %e);
            }
        }
        Ok(SyncOutcome::Applied)
    }

    fn addr_removed(
        &mut self,
        switch: &Switch,
        ifindex: u32,
    ) -> SwdResult<SyncOutcome> {
        let Some(port) = self.port(ifindex) else {
            return Ok(SyncOutcome::Ignored);
        };
        let Some(intf) = self.intf(port) else {
            return Ok(SyncOutcome::Ignored);
        };

        // The interface can't go while any of our routes still lean on it
        let egresses = l3::egress_using_intf(switch, intf);
        let doomed: Vec<Ipv4Net> = self
            .installed
            .iter()
            .filter(|(_, r)| egresses.contains(&r.egress))
            .map(|(subnet, _)| *subnet)
            .collect();
        for subnet in doomed {
            debug!(self.log, "withdrawing route"; "subnet" => %subnet, "intf" => %intf);
            self.withdraw(switch, subnet)?;
        }
        let hosts: Vec<Ipv4Addr> = self
            .hosts
            .iter()
            .filter(|(_, h)| egresses.contains(&h.egress))
            .map(|(ip, _)| *ip)
            .collect();
        for ip in hosts {
            self.host_withdraw(switch, ip)?;
        }

        l3::intf_destroy(switch, intf)?;
        self.intfs.remove(&port);
        info!(self.log, "destroyed port interface"; "port" => %port, "intf" => %intf);
        Ok(SyncOutcome::Applied)
    }

    // Remove an installed route and the egress object behind it.
    fn withdraw(&mut self, switch: &Switch, subnet: Ipv4Net) -> SwdResult<()> {
        match route::delete(switch, subnet) {
            Ok(()) | Err(SwdError::Missing(_)) => {}
            Err(e) => return Err(e),
        }
        if let Some(r) = self.installed.remove(&subnet) {
            self.release_egress(switch, r.egress);
        }
        Ok(())
    }

    // Program a /32 route to a resolved neighbor.  A kernel route for the same
    // address takes precedence, and an unchanged neighbor is left alone.
    fn host_install(
        &mut self,
        switch: &Switch,
        ip: Ipv4Addr,
        ifindex: u32,
        port: PortId,
        intf: IntfId,
        mac: MacAddr,
    ) -> SwdResult<()> {
        let host = route::subnet(ip, 32)?;
        if self.installed.contains_key(&host) || self.pending.contains_key(&host)
        {
            return Ok(());
        }
        if self
            .hosts
            .get(&ip)
            .is_some_and(|h| h.ifindex == ifindex && h.mac == mac)
        {
            return Ok(());
        }

        let egress = l3::egress_create(switch, &Egress { mac, port, intf })?;
        if let Err(e) = route::host_add(switch, ip.into(), egress) {
            self.release_egress(switch, egress);
            return Err(e);
        }
        let prior = self.hosts.insert(
            ip,
            HostRoute {
                ifindex,
                mac,
                egress,
            },
        );
        if let Some(prior) = prior {
            self.release_egress(switch, prior.egress);
        }
        debug!(self.log, "installed host route";
            "neighbor" => %ip, "egress" => %egress);
        Ok(())
    }

    // Remove a neighbor's host route, if it has one.  Returns whether it did.
    fn host_withdraw(
        &mut self,
        switch: &Switch,
        ip: Ipv4Addr,
    ) -> SwdResult<bool> {
        let Some(host) = self.hosts.get(&ip).copied() else {
            return Ok(false);
        };
        match route::delete(switch, route::subnet(ip, 32)?) {
            Ok(()) | Err(SwdError::Missing(_)) => {}
            Err(e) => return Err(e),
        }
        self.hosts.remove(&ip);
        self.release_egress(switch, host.egress);
        debug!(self.log, "withdrew host route"; "neighbor" => %ip);
        Ok(true)
    }

    // Whether any remaining neighbor still resolves to `mac`
    fn mac_in_use(&self, mac: MacAddr) -> bool {
        self.neighbors.values().any(|m| *m == mac)
    }

    fn release_egress(&self, switch: &Switch, egress: EgressId) {
        if let Err(e) = l3::egress_destroy(switch, egress) {
            warn!(self.log, "failed to release egress";
                "egress" => %egress, "error" => %e);
        }
    }

    fn route_removed(
        &mut self,
        switch: &Switch,
        subnet: Ipv4Net,
    ) -> SwdResult<SyncOutcome> {
        let was_pending = self.pending.remove(&subnet).is_some();
        let was_installed = self.installed.contains_key(&subnet);
        match route::delete(switch, subnet) {
            Ok(()) => {}
            Err(SwdError::Missing(_)) if !was_installed => {
                return Ok(if was_pending {
                    SyncOutcome::Applied
                } else {
                    SyncOutcome::Ignored
                });
            }
            Err(SwdError::Missing(_)) => {}
            Err(e) => return Err(e),
        }
        if let Some(r) = self.installed.remove(&subnet) {
            self.release_egress(switch, r.egress);
        }
        debug!(self.log, "route removed"; "subnet" => %subnet);
        if subnet.width() == 32 {
            self.host_restore(switch, subnet.addr());
        }
        Ok(SyncOutcome::Applied)
    }

    // Put back the host route for a neighbor whose address was covered by a
    // kernel host route.
    fn host_restore(&mut self, switch: &Switch, ip: Ipv4Addr) {
        let Some((idx, mac)) = self
            .neighbors
            .iter()
            .find(|((addr, _), _)| *addr == ip)
            .map(|((_, idx), mac)| (*idx, *mac))
        else {
            return;
        };
        let Some(port) = self.port(idx) else {
            return;
        };
        let Some(intf) = self.intf(port) else {
            return;
        };
        if let Err(e) = self.host_install(switch, ip, idx, port, intf, mac) {
            error!(self.log, "failed to restore host route";
                "neighbor" => %ip, "error" => %e);
        }
    }

    fn route_added(
        &mut self,
        switch: &Switch,
        subnet: Ipv4Net,
        gateway: Option<Ipv4Addr>,
        oif: Option<u32>,
    ) -> SwdResult<SyncOutcome> {
        // Without a gateway, the route covers a directly connected subnet.
        // Its hosts are reached through their own host routes.
        let (Some(gateway), Some(oif)) = (gateway, oif) else {
            debug!(self.log, "connected route"; "subnet" => %subnet);
            return Ok(SyncOutcome::Ignored);
        };
        let Some(port) = self.port(oif) else {
            return Ok(SyncOutcome::Ignored);
        };
        let Some(intf) = self.intf(port) else {
            return Err(SwdError::Invalid(format!(
                "port {port} has no l3 interface for route {subnet}"
            )));
        };

        match self.neighbors.get(&(gateway, oif)).copied() {
            Some(mac) => {
                self.install(switch, subnet, gateway, oif, port, intf, mac)?;
                Ok(SyncOutcome::Applied)
            }
            None => {
                // Anything already programmed for this subnet points at the
                // old gateway, so it goes.
                if self.installed.contains_key(&subnet) {
                    self.withdraw(switch, subnet)?;
                }
                warn!(self.log, "unresolved neighbor, route pending";
                    "subnet" => %subnet, "gateway" => %gateway, "oif" => oif);
                self.pending.insert(subnet, PendingRoute { gateway, oif });
                Ok(SyncOutcome::Pending)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn install(
        &mut self,
        switch: &Switch,
        subnet: Ipv4Net,
        gateway: Ipv4Addr,
        oif: u32,
        port: PortId,
        intf: IntfId,
        mac: MacAddr,
    ) -> SwdResult<()> {
        let egress = l3::egress_create(switch, &Egress { mac, port, intf })?;
        if let Err(e) = route::add(switch, subnet, RouteTarget::Egress(egress)) {
            self.release_egress(switch, egress);
            return Err(e);
        }
        self.pending.remove(&subnet);

        // A kernel host route replaces ours for the same neighbor.  The table
        // entry was overwritten in place, so only the egress is left to free.
        if subnet.width() == 32 {
            if let Some(host) = self.hosts.remove(&subnet.addr()) {
                self.release_egress(switch, host.egress);
            }
        }

        // The route now points at the new egress, leaving the old one free
        let prior = self.installed.insert(
            subnet,
            InstalledRoute {
                gateway,
                oif,
                egress,
            },
        );
        if let Some(prior) = prior {
            self.release_egress(switch, prior.egress);
        }
        info!(self.log, "installed route";
            "subnet" => %subnet, "gateway" => %gateway, "egress" => %egress);
        Ok(())
    }

    fn neigh_added(
        &mut self,
        switch: &Switch,
        ip: Ipv4Addr,
        ifindex: u32,
        mac: Option<MacAddr>,
    ) -> SwdResult<SyncOutcome> {
        let Some(port) = self.port(ifindex) else {
            return Ok(SyncOutcome::Ignored);
        };
        let Some(mac) = mac else {
            return Ok(SyncOutcome::Ignored);
        };

        l2::addr_add(
            switch,
            &L2Addr {
                mac,
                vlan: 0,
                port,
                is_static: true,
            },
        )?;
        let prior = self.neighbors.insert((ip, ifindex), mac);
        let stale = prior.filter(|m| *m != mac && !self.mac_in_use(*m));
        if let Some(old) = stale {
            match l2::addr_delete(switch, old, 0) {
                Ok(()) | Err(SwdError::Missing(_)) => {}
                Err(e) => warn!(self.log, "failed to remove stale neighbor";
                    "neighbor" => %ip, "mac" => %old, "error" => %e),
            }
        }

        // Install the routes that were waiting on this neighbor, and re-point
        // any whose gateway has moved to a new MAC.
        let mut waiting: Vec<Ipv4Net> = self
            .pending
            .iter()
            .filter(|(_, p)| p.gateway == ip && p.oif == ifindex)
            .map(|(subnet, _)| *subnet)
            .collect();
        if prior.is_some_and(|m| m != mac) {
            waiting.extend(
                self.installed
                    .iter()
                    .filter(|(_, r)| r.gateway == ip && r.oif == ifindex)
                    .map(|(subnet, _)| *subnet),
            );
        }
        let Some(intf) = self.intf(port) else {
            if !waiting.is_empty() {
                warn!(self.log, "routes via neighbor remain pending";
                    "neighbor" => %ip, "port" => %port,
                    "reason" => "no l3 interface");
            }
            return Ok(SyncOutcome::Applied);
        };
        if let Err(e) = self.host_install(switch, ip, ifindex, port, intf, mac) {
            error!(self.log, "failed to install host route";
                "neighbor" => %ip, "error" => %e);
        }
        for subnet in waiting {
            if let Err(e) =
                self.install(switch, subnet, ip, ifindex, port, intf, mac)
            {
                error!(self.log, "failed to install route";
                    "subnet" => %subnet, "gateway" => %ip, "error" => %e);
            }
        }
        Ok(SyncOutcome::Applied)
    }

    fn neigh_removed(
        &mut self,
        switch: &Switch,
        ip: Ipv4Addr,
        ifindex: u32,
        mac: Option<MacAddr>,
    ) -> SwdResult<SyncOutcome> {
        let cached = self.neighbors.remove(&(ip, ifindex));
        if self.port(ifindex).is_none() {
            return Ok(SyncOutcome::Ignored);
        }

        let mut applied = false;
        if self.hosts.get(&ip).is_some_and(|h| h.ifindex == ifindex) {
            applied = self.host_withdraw(switch, ip)?;
        }

        let Some(mac) = mac.or(cached) else {
            return Ok(if applied {
                SyncOutcome::Applied
            } else {
                SyncOutcome::Ignored
            });
        };
        // Another neighbor may share the MAC, as with a router answering for
        // several addresses.
        if self.mac_in_use(mac) {
            debug!(self.log, "mac still in use"; "neighbor" => %ip, "mac" => %mac);
            return Ok(SyncOutcome::Applied);
        }
        match l2::addr_delete(switch, mac, 0) {
            Ok(()) => Ok(SyncOutcome::Applied),
            Err(SwdError::Missing(_)) if applied => Ok(SyncOutcome::Applied),
            Err(SwdError::Missing(_)) => Ok(SyncOutcome::Ignored),
            Err(e) => Err(e),
        }
    }
}
