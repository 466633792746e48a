// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Identifiers for the front-panel switch ports.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Number of front-panel ports on the switch.  Ports are numbered from 1; bit
/// 0 of a hardware port bitmap belongs to the CPU.
pub const PORT_COUNT: u8 = 52;

/// The default interface-name prefix for front-panel ports.
pub const DEFAULT_PORT_PREFIX: &str = "swp";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("Port {0} is out of range")]
    OutOfRange(u32),
    #[error("Invalid port: {0}")]
    Invalid(String),
}

/// A front-panel port, numbered from 1.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq, Hash, Ord, PartialOrd,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct PortId(u8);

impl PortId {
    /// Construct a port ID, checking it against the hardware port count.
    pub fn new(port: u8) -> Result<Self, PortError> {
        if port == 0 || port > PORT_COUNT {
            Err(PortError::OutOfRange(port as u32))
        } else {
            Ok(PortId(port))
        }
    }

    /// The 1-based port number.
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// The 0-based index of the port's XL MAC ("xe" number).
    pub fn xe(self) -> u8 {
        self.0 - 1
    }

    /// Iterate over the first `count` ports.
    pub fn all(count: u8) -> impl Iterator<Item = PortId> {
        (1..=count.min(PORT_COUNT)).map(PortId)
    }

    /// Parse an interface name of the form `<prefix><N>`.  Returns `None` for
    /// any name that doesn't follow the convention, or whose number is out of
    /// range.
    pub fn from_ifname(prefix: &str, name: &str) -> Option<PortId> {
        let digits = name.strip_prefix(prefix)?;
        if digits.is_empty()
            || digits.starts_with('0')
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        let n: u32 = digits.parse().ok()?;
        u8::try_from(n).ok().and_then(|n| PortId::new(n).ok())
    }

    /// Build the interface name for this port.
    pub fn ifname(self, prefix: &str) -> String {
        format!("{prefix}{}", self.0)
    }
}

impl TryFrom<u8> for PortId {
    type Error = PortError;

    fn try_from(port: u8) -> Result<Self, Self::Error> {
        PortId::new(port)
    }
}

impl TryFrom<u32> for PortId {
    type Error = PortError;

    fn try_from(port: u32) -> Result<Self, Self::Error> {
        let p = u8::try_from(port).map_err(|_| PortError::OutOfRange(port))?;
        PortId::new(p)
    }
}

impl From<PortId> for u8 {
    fn from(p: PortId) -> u8 {
        p.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PortId {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n: u8 = s
            .trim()
            .parse()
            .map_err(|_| PortError::Invalid(s.to_string()))?;
        PortId::new(n)
    }
}

/// Link speeds a port may be configured to run at.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub enum PortSpeed {
    #[serde(rename = "1G")]
    Speed1G,
    #[serde(rename = "10G")]
    Speed10G,
    #[serde(rename = "40G")]
    Speed40G,
}

impl fmt::Display for PortSpeed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PortSpeed::Speed1G => write!(f, "1G"),
            PortSpeed::Speed10G => write!(f, "10G"),
            PortSpeed::Speed40G => write!(f, "40G"),
        }
    }
}

impl FromStr for PortSpeed {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "1G" => Ok(PortSpeed::Speed1G),
            "10G" => Ok(PortSpeed::Speed10G),
            "40G" => Ok(PortSpeed::Speed40G),
            _ => Err(PortError::Invalid(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifname() {
        assert_eq!(PortId::from_ifname("swp", "swp1"), Some(PortId(1)));
        assert_eq!(PortId::from_ifname("swp", "swp52"), Some(PortId(52)));
        assert_eq!(PortId::from_ifname("port", "port12"), Some(PortId(12)));
        assert_eq!(PortId::from_ifname("swp", "swp0"), None);
        assert_eq!(PortId::from_ifname("swp", "swp53"), None);
        assert_eq!(PortId::from_ifname("swp", "swp01"), None);
        assert_eq!(PortId::from_ifname("swp", "swp1.100"), None);
        assert_eq!(PortId::from_ifname("swp", "eth0"), None);
        assert_eq!(PortId::from_ifname("swp", "swp"), None);
        assert_eq!(PortId(7).ifname("swp"), "swp7");
    }

    #[test]
    fn test_range() {
        assert!(PortId::new(0).is_err());
        assert!(PortId::new(PORT_COUNT + 1).is_err());
        assert_eq!(PortId::new(1).unwrap().xe(), 0);
        assert_eq!(PortId::all(52).count(), 52);
        assert_eq!(PortId::all(200).count(), PORT_COUNT as usize);
    }

    #[test]
    fn test_speed_parse() {
        assert_eq!("10G".parse::<PortSpeed>().unwrap(), PortSpeed::Speed10G);
        assert_eq!("40g".parse::<PortSpeed>().unwrap(), PortSpeed::Speed40G);
        assert!("25G".parse::<PortSpeed>().is_err());
    }
}
