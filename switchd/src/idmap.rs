// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Allocation of single table indices.  Each index space is tracked by a
//! bitmap, and allocation scans forward from a cursor left just past the
//! previous allocation.  Rotating through the space keeps a just-freed index
//! from being handed straight back out while the hardware may still be using
//! it.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;

use crate::types::SwdError;
use crate::types::SwdResult;

/// A typed index into one of the ASIC's tables.
pub trait Id: Copy + Eq + Ord + fmt::Debug + fmt::Display {
    /// Used in error messages
    const NAME: &'static str;
    /// The indices available for allocation
    const RANGE: Range<u32>;

    fn from_raw(raw: u32) -> Self;
    fn raw(self) -> u32;
}

macro_rules! table_id {
    ($(#[$meta:meta])* $id:ident, $name:expr, $range:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $id(u16);

        impl Id for $id {
            const NAME: &'static str = $name;
            const RANGE: Range<u32> = $range;

            fn from_raw(raw: u32) -> Self {
                $id(raw as u16)
            }

            fn raw(self) -> u32 {
                self.0 as u32
            }
        }

        impl $id {
            pub fn index(self) -> u16 {
                self.0
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

table_id!(
    /// An L3 interface, indexing EGR_L3_INTF
    IntfId,
    "l3_intf",
    1..4096
);
table_id!(
    /// An egress object, indexing both halves of the L3 next-hop table
    EgressId,
    "l3_next_hop",
    1..16384
);
table_id!(
    /// An ECMP group, indexing L3_ECMP_GROUP
    EcmpId,
    "l3_ecmp_group",
    1..1024
);
table_id!(
    /// A slot in the L3_DEFIP route TCAM
    DefipSlot,
    "l3_defip",
    0..8192
);

pub struct IdMap<T: Id> {
    bits: Vec<u64>,
    cursor: u32,
    used: u32,
    _id: PhantomData<T>,
}

impl<T: Id> Default for IdMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Id> IdMap<T> {
    pub fn new() -> Self {
        let size = T::RANGE.end - T::RANGE.start;
        IdMap {
            bits: vec![0; size.div_ceil(64) as usize],
            cursor: T::RANGE.start,
            used: 0,
            _id: PhantomData,
        }
    }

    fn size(&self) -> u32 {
        T::RANGE.end - T::RANGE.start
    }

    fn bit(&self, raw: u32) -> (usize, u64) {
        let off = raw - T::RANGE.start;
        ((off / 64) as usize, 1u64 << (off % 64))
    }

    fn check(&self, id: T) -> SwdResult<()> {
        if T::RANGE.contains(&id.raw()) {
            Ok(())
        } else {
            Err(SwdError::Invalid(format!(
                "{} {id} is out of range",
                T::NAME
            )))
        }
    }

    /// Allocate the first free index at or after the cursor, wrapping around
    /// to the bottom of the range.
    pub fn alloc(&mut self) -> SwdResult<T> {
        let size = self.size();
        let start = self.cursor - T::RANGE.start;
        for step in 0..size {
            let raw = T::RANGE.start + (start + step) % size;
            let (word, mask) = self.bit(raw);
            if self.bits[word] & mask == 0 {
                self.bits[word] |= mask;
                self.used += 1;
                self.cursor = if raw + 1 == T::RANGE.end {
                    T::RANGE.start
                } else {
                    raw + 1
                };
                return Ok(T::from_raw(raw));
            }
        }
        Err(SwdError::TableFull(T::NAME.to_string()))
    }

    pub fn free(&mut self, id: T) -> SwdResult<()> {
        self.check(id)?;
        let (word, mask) = self.bit(id.raw());
        if self.bits[word] & mask == 0 {
            return Err(SwdError::Missing(format!(
                "{} {id} is not allocated",
                T::NAME
            )));
        }
        self.bits[word] &= !mask;
        self.used -= 1;
        Ok(())
    }

    /// Is `id` currently allocated?
    pub fn contains(&self, id: T) -> bool {
        if self.check(id).is_err() {
            return false;
        }
        let (word, mask) = self.bit(id.raw());
        self.bits[word] & mask != 0
    }

    /// Number of allocated indices
    pub fn used(&self) -> u32 {
        self.used
    }
}
