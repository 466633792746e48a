// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Layouts of the ASIC's forwarding tables.  Each submodule describes one
//! table (or a pair of tables indexed together) and converts between a typed
//! record and the raw words the ASIC stores.  Entry bit `n` is bit `n % 32` of
//! word `n / 32`.

use crate::types::{SwdError, SwdResult};
use crate::Switch;

pub mod defip;
pub mod ecmp;
pub mod l2;
pub mod l2_user;
pub mod l3_intf;
pub mod nexthop;
pub mod vlan;

/// Where a table lives in the ASIC's address space, and how big it is.
#[derive(Clone, Copy, Debug)]
pub struct TableDesc {
    pub name: &'static str,
    /// Address of entry 0
    pub base: u32,
    /// Words per entry
    pub words: usize,
    /// Address distance between consecutive entries
    pub stride: u32,
    /// Number of entries
    pub depth: u32,
}

impl TableDesc {
    pub fn address(&self, index: u32) -> u32 {
        self.base + index * self.stride
    }

    fn check(&self, index: u32) -> SwdResult<()> {
        if index >= self.depth {
            Err(SwdError::Invalid(format!(
                "index {index} out of range for {}",
                self.name
            )))
        } else {
            Ok(())
        }
    }
}

/// Basic statistics about table usage
#[derive(Clone, Debug, Default)]
pub struct TableUsage {
    /// Maximum number of entries in the table
    pub size: u32,
    /// Current number of entries in the table
    pub occupancy: u32,
    /// Total number of entries inserted over time
    pub inserts: u64,
    /// Total number of entries deleted over time
    pub deletes: u64,
    /// Number of entries updated in place over time
    pub updates: u64,
    /// Number of slots stepped over past an occupied slot
    pub collisions: u64,
    /// Number of deletes failed due to a missing entry
    pub delete_misses: u64,
    /// Number of inserts that failed due to space exhaustion
    pub exhaustion: u64,
}

impl TableUsage {
    pub fn new(size: u32) -> TableUsage {
        TableUsage {
            size,
            ..Default::default()
        }
    }
}

/// Store `value` in the `width`-bit field starting at bit `lo`.  Bits of
/// `value` above `width` are ignored.
pub fn set_field(words: &mut [u32], lo: usize, width: usize, value: u128) {
    debug_assert!(width <= 128);
    for i in 0..width {
        let bit = lo + i;
        let mask = 1u32 << (bit % 32);
        if (value >> i) & 1 == 1 {
            words[bit / 32] |= mask;
        } else {
            words[bit / 32] &= !mask;
        }
    }
}

/// Extract the `width`-bit field starting at bit `lo`.
pub fn get_field(words: &[u32], lo: usize, width: usize) -> u128 {
    debug_assert!(width <= 128);
    (0..width).fold(0u128, |acc, i| {
        let bit = lo + i;
        let v = (words[bit / 32] >> (bit % 32)) & 1;
        acc | ((v as u128) << i)
    })
}

pub fn set_flag(words: &mut [u32], bit: usize, value: bool) {
    set_field(words, bit, 1, value as u128);
}

pub fn get_flag(words: &[u32], bit: usize) -> bool {
    get_field(words, bit, 1) == 1
}

/// Write a single entry.
pub fn write_entry(
    switch: &Switch,
    table: &TableDesc,
    index: u32,
    words: &[u32],
) -> SwdResult<()> {
    table.check(index)?;
    if words.len() != table.words {
        return Err(SwdError::Invalid(format!(
            "{} entries are {} words, not {}",
            table.name,
            table.words,
            words.len()
        )));
    }
    switch
        .schan
        .write_memory(table.address(index), words)
        .map_err(|e| e.into())
}

/// Zero a single entry, which clears any valid bit it has.
pub fn clear_entry(switch: &Switch, table: &TableDesc, index: u32) -> SwdResult<()> {
    write_entry(switch, table, index, &vec![0u32; table.words])
}
