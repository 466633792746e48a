// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Per-port MAC counters.

use crate::ports;
use crate::types::{SwdError, SwdResult};
use crate::Switch;
use common::ports::PortId;

/// The counters maintained by each port's MAC
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::EnumIter,
    strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum Stat {
    RxPackets,
    RxBytes,
    TxPackets,
    TxBytes,
}

impl Stat {
    /// Offset of the counter within the lane's register space
    pub fn register(self) -> u32 {
        match self {
            Stat::RxPackets => 0x0b,
            Stat::RxBytes => 0x34,
            Stat::TxPackets => 0x45,
            Stat::TxBytes => 0x64,
        }
    }
}

/// Address of a port's counter
pub fn stat_address(port: PortId, stat: Stat) -> u32 {
    let loc = ports::locate(port);
    (loc.block_id() << 20) | ((loc.lane as u32) << 12) | stat.register()
}

/// Fetch one counter.  Counters are 64 bits wide, split across two words with
/// the high word first.
pub fn stat_get(switch: &Switch, port: PortId, stat: Stat) -> SwdResult<u64> {
    switch.check_port(port)?;
    if !switch.schan.read_supported() {
        return Err(SwdError::Unsupported(format!(
            "cannot read {stat} on port {port}: asic reads are disabled"
        )));
    }
    let w = switch.schan.read_memory(stat_address(port, stat), 2)?;
    match w.as_slice() {
        [hi, lo] => Ok(((*hi as u64) << 32) | *lo as u64),
        _ => Err(SwdError::Other(format!(
            "short counter read for {stat} on port {port}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_switch;
    use strum::IntoEnumIterator;

    fn port(n: u8) -> PortId {
        PortId::new(n).unwrap()
    }

    #[test]
    fn test_address() {
        // Port 1 is lane 0 of the block at 0x40a00000
        assert_eq!(stat_address(port(1), Stat::RxPackets), 0x40a0_000b);
        assert_eq!(stat_address(port(2), Stat::TxBytes), 0x40a0_1064);
        // Port 21 sits on lane 1 of a swapped block
        assert_eq!(stat_address(port(21), Stat::RxBytes), 0x00e0_1034);
        assert_eq!(stat_address(port(52), Stat::TxPackets), 0x4080_0045);
    }

    #[test]
    fn test_names() -> anyhow::Result<()> {
        let names: Vec<String> = Stat::iter().map(|s| s.to_string()).collect();
        assert_eq!(names, ["rx_packets", "rx_bytes", "tx_packets", "tx_bytes"]);
        assert_eq!("tx_bytes".parse::<Stat>()?, Stat::TxBytes);
        assert!("bogus".parse::<Stat>().is_err());
        Ok(())
    }

    #[test]
    fn test_word_order() -> anyhow::Result<()> {
        let (switch, stub) = test_switch();
        stub.set_memory(stat_address(port(5), Stat::RxBytes), &[0x1, 0x2]);
        assert_eq!(stat_get(&switch, port(5), Stat::RxBytes)?, 0x1_0000_0002);
        assert_eq!(stat_get(&switch, port(5), Stat::TxBytes)?, 0);
        Ok(())
    }

    #[test]
    fn test_reads_disabled() {
        let config = crate::config::Config {
            schan_read_supported: false,
            ..Default::default()
        };
        let (switch, _) = crate::test_switch_with(config);
        assert!(matches!(
            stat_get(&switch, port(1), Stat::RxPackets),
            Err(SwdError::Unsupported(_))
        ));
    }
}
