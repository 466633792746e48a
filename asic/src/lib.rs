// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Backends implementing the [`aal::Device`] contract.
//!
//! * `stub`: an in-memory model of the CMIC and the ASIC's table memory,
//!   which executes S-Channel commands and packet transmits.
//! * `chaos`: the stub, with configurable random failures injected at each
//!   device operation.
//! * `bde`: the `/dev/nos-bde` kernel driver (Linux only).

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use aal::AsicResult;
use aal::Device;

pub mod chaos;
pub mod stub;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod bde;
    }
}

/// A shared handle on whichever backend was selected at startup.
pub type Handle = Arc<dyn Device>;

/// Backend selection, plus any backend-specific settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum AsicConfig {
    Stub(stub::StubConfig),
    Chaos(chaos::ChaosConfig),
    Bde(BdeConfig),
}

impl Default for AsicConfig {
    fn default() -> Self {
        AsicConfig::Stub(stub::StubConfig::default())
    }
}

impl AsicConfig {
    pub fn backend(&self) -> &'static str {
        match self {
            AsicConfig::Stub(_) => "stub",
            AsicConfig::Chaos(_) => "chaos",
            AsicConfig::Bde(_) => "bde",
        }
    }
}

/// Settings for the kernel driver backend
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BdeConfig {
    /// Path to the character device exported by the driver
    #[serde(default = "default_devpath")]
    pub devpath: String,
}

pub const DEFAULT_DEVPATH: &str = "/dev/nos-bde";

fn default_devpath() -> String {
    DEFAULT_DEVPATH.to_string()
}

impl Default for BdeConfig {
    fn default() -> Self {
        BdeConfig {
            devpath: default_devpath(),
        }
    }
}

/// Open the backend described by `config`.
pub fn open(log: &slog::Logger, config: &AsicConfig) -> AsicResult<Handle> {
    let log = log.new(slog::o!("unit" => "asic", "backend" => config.backend()));
    match config {
        AsicConfig::Stub(c) => Ok(Arc::new(stub::StubDevice::new(&log, c))),
        AsicConfig::Chaos(c) => Ok(Arc::new(chaos::ChaosDevice::new(&log, c))),
        AsicConfig::Bde(c) => open_bde(&log, c),
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn open_bde(log: &slog::Logger, config: &BdeConfig) -> AsicResult<Handle> {
            Ok(Arc::new(bde::BdeDevice::open(log, &config.devpath)?))
        }
    } else {
        fn open_bde(_log: &slog::Logger, _config: &BdeConfig) -> AsicResult<Handle> {
            Err(aal::AsicError::AsicMissing)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() -> anyhow::Result<()> {
        let c: AsicConfig = toml::from_str("backend = \"bde\"\n")?;
        match c {
            AsicConfig::Bde(b) => assert_eq!(b.devpath, DEFAULT_DEVPATH),
            _ => panic!("wrong backend"),
        }

        let c: AsicConfig = toml::from_str(
            "backend = \"chaos\"\n[register_write]\nvalue = 0.5\n",
        )?;
        match c {
            AsicConfig::Chaos(c) => {
                assert_eq!(c.register_write.get(), 0.5);
                assert_eq!(c.register_read.get(), 0.0);
            }
            _ => panic!("wrong backend"),
        }

        assert_eq!(AsicConfig::default().backend(), "stub");
        Ok(())
    }
}
