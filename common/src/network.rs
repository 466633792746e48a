// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Largest VLAN ID that fits in the 12-bit hardware field.
pub const VLAN_MAX: u16 = 4095;

/// An EUI-48 MAC address.  In config files and on the command line it is
/// written as six hex octets separated by colons.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const ZERO: Self = MacAddr([0; 6]);
    pub const BROADCAST: Self = MacAddr([0xff; 6]);

    pub const fn new(o0: u8, o1: u8, o2: u8, o3: u8, o4: u8, o5: u8) -> Self {
        MacAddr([o0, o1, o2, o3, o4, o5])
    }

    /// Build an address from exactly six octets.
    pub fn try_from_slice(s: &[u8]) -> Option<MacAddr> {
        s.try_into().ok().map(MacAddr)
    }

    pub fn octets(self) -> [u8; 6] {
        self.0
    }

    /// This address with the final octet replaced.  Per-port addresses are
    /// derived from a switch-wide base this way.
    pub fn with_last_octet(self, octet: u8) -> MacAddr {
        let mut a = self.0;
        a[5] = octet;
        MacAddr(a)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacError {
    #[error("expected 6 octets, found {0}")]
    OctetCount(usize),
    #[error("bad octet {0:?}")]
    BadOctet(String),
}

impl FromStr for MacAddr {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, MacError> {
        let octets: Vec<&str> = s.trim().split(':').collect();
        if octets.len() != 6 {
            return Err(MacError::OctetCount(octets.len()));
        }
        let mut a = [0u8; 6];
        for (byte, octet) in a.iter_mut().zip(octets) {
            let hex = octet.len() <= 2
                && octet.bytes().all(|b| b.is_ascii_hexdigit());
            *byte = u8::from_str_radix(octet, 16)
                .ok()
                .filter(|_| hex)
                .ok_or_else(|| MacError::BadOctet(octet.to_string()))?;
        }
        Ok(MacAddr(a))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = MacError;

    fn try_from(s: String) -> Result<Self, MacError> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> String {
        mac.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

// The hardware tables carry addresses as 48-bit integers, first octet in
// the most significant byte.
impl From<MacAddr> for u64 {
    fn from(mac: MacAddr) -> u64 {
        let mut b = [0u8; 8];
        b[2..].copy_from_slice(&mac.0);
        u64::from_be_bytes(b)
    }
}

impl From<u64> for MacAddr {
    fn from(x: u64) -> Self {
        let b = x.to_be_bytes();
        let mut a = [0u8; 6];
        a.copy_from_slice(&b[2..]);
        MacAddr(a)
    }
}

#[derive(Error, Debug, Clone)]
pub enum VlanError {
    /// Not a valid VLAN ID
    #[error("Invalid VLAN tag: {}", .0)]
    InvalidVlan(u16),
}

/// Check that a VLAN tag fits in the hardware's 12-bit field.  Tag 0 is
/// accepted, as it is the "untagged" key used by L2 and L3 interface entries.
pub fn validate_vlan_tag(id: impl Into<u16>) -> Result<(), VlanError> {
    let id: u16 = id.into();
    if id > VLAN_MAX {
        Err(VlanError::InvalidVlan(id))
    } else {
        Ok(())
    }
}

/// Check that a VLAN ID names a VLAN that may be created.
pub fn validate_vlan(id: impl Into<u16>) -> Result<(), VlanError> {
    let id: u16 = id.into();
    #[allow(clippy::manual_range_contains)]
    if id < 1 || id > VLAN_MAX {
        Err(VlanError::InvalidVlan(id))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_form() {
        let a = MacAddr::new(0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc);
        assert_eq!(u64::from(a), 0x1234_5678_9abc);
        assert_eq!(MacAddr::from(0x1234_5678_9abc), a);
        // Bits above the low 48 are dropped
        assert_eq!(
            MacAddr::from(0xffff_0000_0000_0001),
            MacAddr::new(0, 0, 0, 0, 0, 1)
        );
        assert_eq!(u64::from(MacAddr::BROADCAST), 0xffff_ffff_ffff);
    }

    #[test]
    fn test_parse() {
        let a = MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);
        assert_eq!("aa:bb:cc:dd:ee:ff".parse::<MacAddr>().unwrap(), a);
        assert_eq!("AA:BB:CC:DD:EE:FF".parse::<MacAddr>().unwrap(), a);
        assert_eq!(
            "2:0:0:0:0:c".parse::<MacAddr>().unwrap(),
            MacAddr::new(2, 0, 0, 0, 0, 12)
        );
        assert_eq!(
            "aa:bb:cc:dd:ee".parse::<MacAddr>(),
            Err(MacError::OctetCount(5))
        );
        assert_eq!(
            "aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>(),
            Err(MacError::OctetCount(7))
        );
        for bad in [
            "aa:bb:cc:dd:ee:fg",
            "aa:bb:cc:dd::ff",
            "aa:bb:cc:dd:ee:+f",
            "aa:bb:cc:dd:ee:100",
        ] {
            assert!(
                matches!(bad.parse::<MacAddr>(), Err(MacError::BadOctet(_))),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn test_display() {
        let a = MacAddr::new(0x02, 0, 0, 0, 0, 0x0c);
        assert_eq!(a.to_string(), "02:00:00:00:00:0c");
        assert_eq!(format!("{a:?}"), "MacAddr(02:00:00:00:00:0c)");
    }

    #[test]
    fn test_last_octet() {
        let base = MacAddr::new(0x02, 0, 0, 0, 0, 0);
        assert_eq!(base.with_last_octet(12), MacAddr::new(2, 0, 0, 0, 0, 12));
        assert_eq!(
            MacAddr::try_from_slice(&[1, 2, 3, 4, 5, 6]),
            Some(MacAddr::new(1, 2, 3, 4, 5, 6))
        );
        assert_eq!(MacAddr::try_from_slice(&[1, 2, 3]), None);
    }

    #[test]
    fn test_vlan_ranges() {
        assert!(validate_vlan_tag(0u16).is_ok());
        assert!(validate_vlan_tag(4095u16).is_ok());
        assert!(validate_vlan_tag(4096u16).is_err());
        assert!(validate_vlan(0u16).is_err());
        assert!(validate_vlan(1u16).is_ok());
        assert!(validate_vlan(4096u16).is_err());
    }
}
