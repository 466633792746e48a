// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! ECMP groups.  A group is a descriptor in L3_ECMP_GROUP pointing at a
//! contiguous span of member entries in L3_ECMP, one per egress object.  The
//! span is recorded alongside the group so that destroying the group returns
//! it to the member freemap.

use std::collections::BTreeMap;

use slog::{debug, error};

use crate::freemap::FreeMap;
use crate::idmap::{EcmpId, EgressId, IdMap};
use crate::table;
use crate::table::ecmp::{self as ecmp_table, EcmpGroupEntry};
use crate::types::{SwdError, SwdResult};
use crate::Switch;

/// A group, as seen by callers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EcmpGroup {
    pub members: Vec<EgressId>,
    /// First slot of the group's span in the member table
    pub base: u16,
}

struct GroupState {
    group: EcmpGroup,
    // Number of routes using this group
    refs: u32,
}

pub struct EcmpData {
    ids: IdMap<EcmpId>,
    members: FreeMap,
    groups: BTreeMap<EcmpId, GroupState>,
}

impl EcmpData {
    pub fn new(log: &slog::Logger) -> Self {
        EcmpData {
            ids: IdMap::new(),
            members: FreeMap::new(
                log,
                ecmp_table::MEMBER_TABLE.name,
                ecmp_table::MEMBER_TABLE.depth as u16,
            ),
            groups: BTreeMap::new(),
        }
    }

    pub(crate) fn exists(&self, id: EcmpId) -> bool {
        self.groups.contains_key(&id)
    }

    pub(crate) fn group_ref(&mut self, id: EcmpId) -> SwdResult<()> {
        match self.groups.get_mut(&id) {
            Some(g) => {
                g.refs += 1;
                Ok(())
            }
            None => Err(SwdError::Invalid(format!("no such ecmp group: {id}"))),
        }
    }

    pub(crate) fn group_unref(&mut self, id: EcmpId) {
        if let Some(g) = self.groups.get_mut(&id) {
            g.refs = g.refs.saturating_sub(1);
        }
    }
}

// Zero the descriptor and `count` members starting at `base`, logging rather
// than returning any failure.
fn clear_hw(switch: &Switch, id: EcmpId, base: u16, count: u16) {
    if let Err(e) =
        table::clear_entry(switch, &ecmp_table::GROUP_TABLE, id.index() as u32)
    {
        error!(switch.log, "failed to clear ecmp group";
            "group" => %id, "error" => %e);
    }
    for slot in base..base + count {
        if let Err(e) =
            table::clear_entry(switch, &ecmp_table::MEMBER_TABLE, slot as u32)
        {
            error!(switch.log, "failed to clear ecmp member";
                "slot" => slot, "error" => %e);
        }
    }
}

/// Create a group spreading traffic across `members`.
pub fn create(switch: &Switch, members: &[EgressId]) -> SwdResult<EcmpId> {
    if members.is_empty() || members.len() > ecmp_table::MAX_MEMBERS {
        return Err(SwdError::Invalid(format!(
            "ecmp groups must have 1 to {} members, not {}",
            ecmp_table::MAX_MEMBERS,
            members.len()
        )));
    }
    let count = members.len() as u16;

    let mut l3 = switch.l3.lock().unwrap();
    if let Some(missing) = members.iter().find(|e| !l3.egress_exists(**e)) {
        return Err(SwdError::Invalid(format!("no such egress: {missing}")));
    }

    let id = l3.ecmp.ids.alloc()?;
    let base = match l3.ecmp.members.alloc(count) {
        Ok(base) => base,
        Err(e) => {
            let _ = l3.ecmp.ids.free(id);
            return Err(e);
        }
    };

    let mut result = Ok(());
    for (i, egress) in members.iter().enumerate() {
        result = table::write_entry(
            switch,
            &ecmp_table::MEMBER_TABLE,
            base as u32 + i as u32,
            &ecmp_table::encode_member(egress.index()),
        );
        if result.is_err() {
            break;
        }
    }
    if result.is_ok() {
        let hw: Vec<u16> = members.iter().map(|e| e.index()).collect();
        let entry = EcmpGroupEntry::new(base, &hw);
        result = table::write_entry(
            switch,
            &ecmp_table::GROUP_TABLE,
            id.index() as u32,
            &ecmp_table::encode_group(&entry),
        );
    }
    if let Err(e) = result {
        debug!(switch.log, "rolling back ecmp group";
            "group" => %id, "error" => %e);
        clear_hw(switch, id, base, count);
        let _ = l3.ecmp.members.free(base, count);
        let _ = l3.ecmp.ids.free(id);
        return Err(e);
    }

    for egress in members {
        l3.egress_ref(*egress)?;
    }
    debug!(switch.log, "created ecmp group";
        "group" => %id, "base" => base, "count" => count);
    l3.ecmp.groups.insert(
        id,
        GroupState {
            group: EcmpGroup {
                members: members.to_vec(),
                base,
            },
            refs: 0,
        },
    );
    Ok(id)
}

pub fn get(switch: &Switch, id: EcmpId) -> SwdResult<EcmpGroup> {
    let l3 = switch.l3.lock().unwrap();
    l3.ecmp
        .groups
        .get(&id)
        .map(|g| g.group.clone())
        .ok_or_else(|| SwdError::Missing(format!("no such ecmp group: {id}")))
}

/// Destroy a group and release its member span.  Fails with `Busy` while any
/// route still uses the group.
pub fn destroy(switch: &Switch, id: EcmpId) -> SwdResult<()> {
    let mut l3 = switch.l3.lock().unwrap();
    let Some(state) = l3.ecmp.groups.get(&id) else {
        return Err(SwdError::Missing(format!("no such ecmp group: {id}")));
    };
    if state.refs > 0 {
        return Err(SwdError::Busy(format!(
            "ecmp group {id} is used by {} routes",
            state.refs
        )));
    }
    let group = state.group.clone();
    l3.ecmp.groups.remove(&id);
    let count = group.members.len() as u16;

    clear_hw(switch, id, group.base, count);
    l3.ecmp.members.free(group.base, count)?;
    l3.ecmp.ids.free(id)?;
    for egress in &group.members {
        l3.egress_unref(*egress);
    }
    debug!(switch.log, "destroyed ecmp group"; "group" => %id);
    Ok(())
}
