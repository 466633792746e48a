// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Front-panel port control.
//!
//! Each port is one lane of an XLPORT block.  Ports 1-48 are grouped four to a
//! block, and the four 40G-capable ports at the top each get a block of their
//! own.  The board routes ports 21-28 to their blocks with adjacent lanes
//! swapped.
//!
//! This module also owns the link poller, which watches the link state of
//! every port the control plane knows about and reports changes.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use slog::{debug, info, o, trace, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::types::{SwdError, SwdResult};
use crate::Switch;
use aal::PortUpdate;
use common::ports::{PortId, PortSpeed};

/// Offset of XLPORT_PORT_ENABLE within a block
pub const XLPORT_PORT_ENABLE: u32 = 0x80000 + 0x22a;
/// Offset of a lane's MAC_MODE register, relative to the lane's base
pub const MAC_MODE: u32 = 0x511;
const MAC_MODE_LINK: u32 = 1 << 5;
/// Address distance between the lanes of a block
pub const LANE_STRIDE: u32 = 0x1000;

// Base address of each XLPORT block, in front-panel order
const BLOCKS: [u32; 16] = [
    0x40a0_0000,
    0x40b0_0000,
    0x00b0_0000,
    0x00c0_0000,
    0x00d0_0000,
    0x00e0_0000,
    0x00f0_0000,
    0x4000_0000,
    0x4010_0000,
    0x4020_0000,
    0x4030_0000,
    0x4040_0000,
    0x4060_0000,
    0x4050_0000,
    0x4090_0000,
    0x4080_0000,
];

// Blocks whose lanes are wired out of order
const PERMUTED_BLOCKS: [usize; 2] = [5, 6];
const LANE_PERMUTATION: [u8; 4] = [1, 0, 3, 2];

/// Where a port lives in the ASIC
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortLocation {
    /// Index of the XLPORT block
    pub block: usize,
    /// Base address of the block
    pub base: u32,
    pub lane: u8,
}

impl PortLocation {
    /// The block id used in register addresses
    pub fn block_id(&self) -> u32 {
        self.base >> 20
    }
}

pub fn locate(port: PortId) -> PortLocation {
    let xe = port.xe() as usize;
    let (block, lane) = if xe < 48 {
        let block = xe / 4;
        let lane = (xe % 4) as u8;
        if PERMUTED_BLOCKS.contains(&block) {
            (block, LANE_PERMUTATION[lane as usize])
        } else {
            (block, lane)
        }
    } else {
        (12 + (xe - 48), 0)
    };
    PortLocation {
        block,
        base: BLOCKS[block],
        lane,
    }
}

#[derive(Default)]
pub struct PortData {
    // Shadow of each block's XLPORT_PORT_ENABLE register
    enables: [u32; BLOCKS.len()],
    speeds: BTreeMap<PortId, PortSpeed>,
    // Ports the link poller watches
    watched: BTreeSet<PortId>,
}

impl PortData {
    pub fn new() -> Self {
        Self::default()
    }

    fn enabled(&self, loc: &PortLocation) -> bool {
        self.enables[loc.block] & (1 << loc.lane) != 0
    }
}

/// Administratively enable or disable a port.
pub fn enable_set(switch: &Switch, port: PortId, enabled: bool) -> SwdResult<()> {
    switch.check_port(port)?;
    let loc = locate(port);

    let mut ports = switch.ports.lock().unwrap();
    let mask = 1u32 << loc.lane;
    let val = if enabled {
        ports.enables[loc.block] | mask
    } else {
        ports.enables[loc.block] & !mask
    };
    switch
        .schan
        .write_memory(loc.base + XLPORT_PORT_ENABLE, &[val])?;
    ports.enables[loc.block] = val;
    debug!(switch.log, "set port enable";
        "port" => %port, "enabled" => enabled, "block" => loc.block,
        "lane" => loc.lane);
    Ok(())
}

pub fn enable_get(switch: &Switch, port: PortId) -> SwdResult<bool> {
    switch.check_port(port)?;
    let loc = locate(port);
    Ok(switch.ports.lock().unwrap().enabled(&loc))
}

/// Report whether the MAC sees link.  If the ASIC's registers can't be read,
/// the port's admin state stands in for its link state.
pub fn link_status_get(switch: &Switch, port: PortId) -> SwdResult<bool> {
    switch.check_port(port)?;
    let loc = locate(port);
    let addr = loc.base + loc.lane as u32 * LANE_STRIDE + MAC_MODE;
    match switch.schan.read_memory(addr, 1) {
        Ok(v) => Ok(v.first().is_some_and(|w| w & MAC_MODE_LINK != 0)),
        Err(e) => {
            trace!(switch.log, "falling back to admin state";
                "port" => %port, "error" => %e);
            Ok(switch.ports.lock().unwrap().enabled(&loc))
        }
    }
}

/// Set a port's speed.  The serdes are only ever run at 10G.
pub fn speed_set(switch: &Switch, port: PortId, speed: PortSpeed) -> SwdResult<()> {
    switch.check_port(port)?;
    if speed != PortSpeed::Speed10G {
        return Err(SwdError::Unsupported(format!(
            "port {port} cannot run at {speed}"
        )));
    }
    switch.ports.lock().unwrap().speeds.insert(port, speed);
    Ok(())
}

pub fn speed_get(switch: &Switch, port: PortId) -> SwdResult<PortSpeed> {
    switch.check_port(port)?;
    Ok(switch
        .ports
        .lock()
        .unwrap()
        .speeds
        .get(&port)
        .copied()
        .unwrap_or(PortSpeed::Speed10G))
}

/// Start or stop watching a port's link state.
pub fn watch(switch: &Switch, port: PortId, watch: bool) {
    let mut ports = switch.ports.lock().unwrap();
    if watch {
        ports.watched.insert(port);
    } else {
        ports.watched.remove(&port);
    }
}

fn watched(switch: &Switch) -> Vec<PortId> {
    switch.ports.lock().unwrap().watched.iter().copied().collect()
}

/// Check the link state of every watched port, returning an update for each
/// one that changed since the last poll.  The first observation of a port
/// always counts as a change.
pub fn poll_links(
    switch: &Switch,
    last: &mut BTreeMap<PortId, bool>,
) -> Vec<PortUpdate> {
    let ports = watched(switch);
    last.retain(|p, _| ports.contains(p));

    let mut updates = Vec::new();
    for port in ports {
        let linkup = match link_status_get(switch, port) {
            Ok(up) => up,
            Err(e) => {
                warn!(switch.log, "failed to read link state";
                    "port" => %port, "error" => %e);
                continue;
            }
        };
        if last.insert(port, linkup) != Some(linkup) {
            updates.push(PortUpdate::LinkUp { port, linkup });
        }
    }
    updates
}

enum PollTrigger {
    Quit,
}

/// Periodically polls link state, sending a `PortUpdate` for each change.
pub struct LinkPoller {
    tx: mpsc::UnboundedSender<PollTrigger>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<PollTrigger>>>,
}

impl LinkPoller {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        LinkPoller {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Launch the poller.  It can only be run once.
    pub fn run(
        &self,
        switch: Arc<Switch>,
        updates: mpsc::UnboundedSender<PortUpdate>,
    ) -> SwdResult<tokio::task::JoinHandle<()>> {
        let rx = self.rx.lock().unwrap().take().ok_or_else(|| {
            SwdError::Other("the link poller can only be run once".into())
        })?;
        Ok(tokio::task::spawn(poller_task(switch, rx, updates)))
    }

    pub fn quit(&self) {
        _ = self.tx.send(PollTrigger::Quit);
    }
}

impl Default for LinkPoller {
    fn default() -> Self {
        Self::new()
    }
}

// Returns `None` if the deadline passed without a trigger.
async fn wait_for_trigger(
    rx: &mut mpsc::UnboundedReceiver<PollTrigger>,
    deadline: Instant,
) -> Option<PollTrigger> {
    tokio::select! {
        trigger = rx.recv() => Some(trigger.unwrap_or(PollTrigger::Quit)),
        _ = tokio::time::sleep_until(deadline) => None,
    }
}

async fn poller_task(
    switch: Arc<Switch>,
    mut rx: mpsc::UnboundedReceiver<PollTrigger>,
    updates: mpsc::UnboundedSender<PortUpdate>,
) {
    let log = switch.log.new(o!("unit" => "link_poll"));
    let interval = Duration::from_millis(switch.config.link_poll_ms);
    info!(log, "link poller running"; "interval_ms" => switch.config.link_poll_ms);

    let mut last = BTreeMap::new();
    loop {
        let next = Instant::now() + interval;
        if let Some(PollTrigger::Quit) = wait_for_trigger(&mut rx, next).await {
            break;
        }

        // Each read may block on the transport, so the poll runs off the
        // async executor.
        let sw = switch.clone();
        let result = tokio::task::spawn_blocking(move || {
            let changes = poll_links(&sw, &mut last);
            (last, changes)
        })
        .await;
        let changes = match result {
            Ok((l, changes)) => {
                last = l;
                changes
            }
            Err(e) => {
                warn!(log, "link poll failed: {e:?}");
                last = BTreeMap::new();
                continue;
            }
        };
        for update in changes {
            debug!(log, "link change"; "update" => ?update);
            if updates.send(update).is_err() {
                info!(log, "link update channel closed");
                return;
            }
        }
    }
    info!(log, "link poller exiting");
}
