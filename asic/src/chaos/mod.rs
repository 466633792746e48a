// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::sync::Arc;

use rand::random;
use serde::{Deserialize, Serialize};
use slog::Logger;

use aal::{AsicError, AsicResult, Device, DmaInfo, DmaMemory};

use crate::stub::{StubConfig, StubDevice};

/// Chaos that happens according to a probability.
#[derive(Default, Debug, Serialize, Deserialize, Copy, Clone)]
pub struct Chaos {
    /// A probability between 0.0 and 1.0
    pub value: f64,
}

impl Chaos {
    /// Create a new chaos value.
    pub fn new(value: f64) -> Self {
        let mut c = Self::default();
        c.set(value);
        c
    }

    /// Set the chaos value. Panics if value is outside the range [0.0, 1.0].
    pub fn set(&mut self, value: f64) {
        if !(0.0..=1.0).contains(&value) {
            panic!("probability out of range");
        }
        self.value = value;
    }

    /// Get the underlying chaos value.
    pub fn get(&self) -> f64 {
        self.value
    }

    /// Return a chaos error according to the underlying probability value.
    pub fn unfurled(&self, log: &Logger, message: &str) -> AsicResult<()> {
        if self.value > 0.0 && self.value >= random() {
            slog::error!(log, "chaos error: {}", message);
            return Err(AsicError::Synthetic(message.into()));
        }
        Ok(())
    }
}

/// The chaos ASIC config contains chaos values for each device operation.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ChaosConfig {
    /// Settings for the underlying emulated device
    pub stub: StubConfig,
    pub register_read: Chaos,
    pub register_write: Chaos,
    pub dma_info: Chaos,
    pub map_dma_region: Chaos,
    pub run_command: Chaos,
}

impl ChaosConfig {
    /// The uniform chaos config applies a uniform underlying probability to
    /// each chaos value.
    pub fn uniform(v: f64) -> Self {
        Self {
            stub: StubConfig::default(),
            register_read: Chaos::new(v),
            register_write: Chaos::new(v),
            dma_info: Chaos::new(v),
            map_dma_region: Chaos::new(v),
            run_command: Chaos::new(v),
        }
    }

    /// Fail only the operations that change device state.  Reads, and the
    /// setup calls made while opening the device, always succeed.
    pub fn uniform_set(v: f64) -> Self {
        Self {
            register_write: Chaos::new(v),
            run_command: Chaos::new(v),
            ..Default::default()
        }
    }
}

/// The stub device, with chaos injected in front of every operation.
pub struct ChaosDevice {
    log: Logger,
    config: ChaosConfig,
    stub: StubDevice,
}

impl ChaosDevice {
    pub fn new(log: &Logger, config: &ChaosConfig) -> Self {
        ChaosDevice {
            log: log.new(slog::o!("device" => "chaos")),
            config: config.clone(),
            stub: StubDevice::new(log, &config.stub),
        }
    }

    /// The wrapped stub, for inspecting emulated state
    pub fn stub(&self) -> &StubDevice {
        &self.stub
    }
}

impl Device for ChaosDevice {
    fn name(&self) -> &str {
        "chaos"
    }

    fn register_read(&self, offset: u32) -> AsicResult<u32> {
        self.config
            .register_read
            .unfurled(&self.log, "register_read")?;
        self.stub.register_read(offset)
    }

    fn register_write(&self, offset: u32, value: u32) -> AsicResult<()> {
        self.config
            .register_write
            .unfurled(&self.log, "register_write")?;
        self.stub.register_write(offset, value)
    }

    fn dma_info(&self) -> AsicResult<DmaInfo> {
        self.config.dma_info.unfurled(&self.log, "dma_info")?;
        self.stub.dma_info()
    }

    fn map_dma_region(&self) -> AsicResult<Arc<dyn DmaMemory>> {
        self.config
            .map_dma_region
            .unfurled(&self.log, "map_dma_region")?;
        self.stub.map_dma_region()
    }

    fn run_command(&self, cmd: &[u32], data: &mut [u32]) -> AsicResult<u32> {
        self.config.run_command.unfurled(&self.log, "run_command")?;
        self.stub.run_command(cmd, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Drain;

    fn test_log() -> Logger {
        let dec =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(dec).build().fuse();
        Logger::root(drain, slog::o!())
    }

    #[test]
    fn test_certain_chaos() {
        let dev = ChaosDevice::new(&test_log(), &ChaosConfig::uniform_set(1.0));
        assert!(matches!(
            dev.register_write(0x100, 1),
            Err(AsicError::Synthetic(_))
        ));
        assert_eq!(dev.register_read(0x100).unwrap(), 0);
        assert!(dev.map_dma_region().is_ok());
    }

    #[test]
    fn test_no_chaos() {
        let dev = ChaosDevice::new(&test_log(), &ChaosConfig::uniform(0.0));
        dev.register_write(0x100, 9).unwrap();
        assert_eq!(dev.register_read(0x100).unwrap(), 9);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range() {
        let _ = Chaos::new(1.5);
    }
}
