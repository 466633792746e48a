// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! This is a simple structure for tracking, allocating, and freeing contiguous
//! spans of integers from a pre-defined range.  It manages the member slots of
//! the ECMP table, where each group occupies one contiguous span.
//!
//! Allocation is first-fit in address order.  Freed spans are merged with any
//! free neighbors, but live spans are never moved, so a fragmented map can
//! still fail an allocation it has enough total space for.

use std::cmp::Ord;
use std::cmp::Ordering;

use crate::types::SwdError;
use crate::types::SwdResult;

use slog::debug;

/// A Span represents a contiguous range of integers, where the range is closed
/// on the bottom and open on the top.  In other words, a Span{1,4} will include
/// 1, 2, and 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    low: u16,
    high: u16,
}

impl Span {
    fn new(low: u16, high: u16) -> Self {
        Span { low, high }
    }

    fn size(&self) -> u16 {
        self.high - self.low
    }

    // Split a span into two smaller spans.  The original span will be truncated
    // at the split point and the returned span will include the split point and
    // everything above it.
    fn split_off(&mut self, split: u16) -> Option<Span> {
        if split >= self.size() {
            None
        } else {
            let new_span = Span::new(self.low + split, self.high);
            self.high = self.low + split;
            Some(new_span)
        }
    }
}

impl PartialOrd for Span {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Overlapping spans compare as Equal.  That's never true of two spans on the
// freelist, so finding an Equal is how we spot a double free.
impl Ord for Span {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.high <= other.low {
            Ordering::Less
        } else if self.low >= other.high {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

pub struct FreeMap {
    log: slog::Logger,
    name: String,
    size: u16,
    // Free spans, ordered by offset, with no two adjacent
    freelist: Vec<Span>,
}

impl FreeMap {
    pub fn new(log: &slog::Logger, name: impl ToString, size: u16) -> Self {
        let name = name.to_string();
        let log = log.new(slog::o!("unit" => format!("freemap_{name}")));
        debug!(log, "created new freemap.  size: {size}");
        FreeMap {
            log,
            name,
            size,
            freelist: vec![Span::new(0, size)],
        }
    }

    /// Allocate `count` contiguous slots, returning the first.
    pub fn alloc(&mut self, count: u16) -> SwdResult<u16> {
        if count == 0 || count > self.size {
            return Err(SwdError::Invalid(format!(
                "cannot allocate {count} slots from {}",
                self.name
            )));
        }
        let Some(idx) = self.freelist.iter().position(|s| s.size() >= count)
        else {
            debug!(self.log, "no span of {count} available";
                "free" => self.free_count(), "spans" => self.freelist.len());
            return Err(SwdError::TableFull(self.name.clone()));
        };

        let span = &mut self.freelist[idx];
        let low = span.low;
        match span.split_off(count) {
            Some(remainder) => self.freelist[idx] = remainder,
            None => {
                self.freelist.remove(idx);
            }
        }
        slog::trace!(self.log, "allocated {count} slots at {low}");
        Ok(low)
    }

    /// Return a span to the map, merging it with any free neighbors.
    pub fn free(&mut self, base: u16, count: u16) -> SwdResult<()> {
        let high = base.checked_add(count).filter(|h| *h <= self.size);
        let span = match high {
            Some(high) if count > 0 => Span::new(base, high),
            _ => {
                return Err(SwdError::Invalid(format!(
                    "span {base}+{count} is outside {}",
                    self.name
                )))
            }
        };
        let idx = match self.freelist.binary_search(&span) {
            Ok(_) => {
                return Err(SwdError::Invalid(format!(
                    "span {base}+{count} in {} is already free",
                    self.name
                )))
            }
            Err(idx) => idx,
        };
        slog::trace!(self.log, "freeing {span:?}");

        self.freelist.insert(idx, span);
        if idx + 1 < self.freelist.len()
            && self.freelist[idx].high == self.freelist[idx + 1].low
        {
            self.freelist[idx].high = self.freelist[idx + 1].high;
            self.freelist.remove(idx + 1);
        }
        if idx > 0 && self.freelist[idx - 1].high == self.freelist[idx].low {
            self.freelist[idx - 1].high = self.freelist[idx].high;
            self.freelist.remove(idx);
        }
        Ok(())
    }

    /// Number of free slots
    pub fn free_count(&self) -> u32 {
        self.freelist.iter().map(|s| s.size() as u32).sum()
    }

    /// Is any slot in `base..base + count` allocated?
    pub fn is_used(&self, base: u16, count: u16) -> bool {
        (base..base.saturating_add(count)).any(|slot| {
            !self
                .freelist
                .iter()
                .any(|s| s.low <= slot && slot < s.high)
        })
    }
}
