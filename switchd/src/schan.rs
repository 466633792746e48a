// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The S-Channel transport.  Every access to the ASIC's internal tables is a
//! single command/response exchange: a command header naming the operation and
//! target address, followed by up to 16 words of payload.
//!
//! In DMA mode we stage the command in a buffer at the start of the DMA pool,
//! point channel 0 at it, start the channel, and poll the DMA status register
//! until the ASIC reports completion.  In kernel mode the driver runs that same
//! protocol on our behalf, and we just hand it the words.
//!
//! The command buffer and the channel registers are shared by every caller, so
//! a single gate is held across the entire write/kick/poll/read sequence.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use slog::{debug, o, trace};

use aal::cmic;
use aal::cmic::Opcode;
use aal::{AsicError, AsicResult, DmaMemory};

/// Bytes at the start of the DMA pool reserved for the command buffer.
/// Packet buffers are carved from the pool above this point.
pub const SCHAN_RESERVED: usize = 256;

/// How S-Channel commands reach the ASIC
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SchanMode {
    /// Drive the command buffer and DMA channel from userspace
    #[default]
    Dma,
    /// Delegate each command to the kernel driver
    Kernel,
}

#[derive(Clone, Debug)]
pub struct SchanConfig {
    pub mode: SchanMode,
    /// How long to wait for a command to complete
    pub timeout: Duration,
    /// How long to sleep between polls of the completion bit
    pub poll: Duration,
    /// Whether the ASIC path supports READ_MEMORY
    pub read_supported: bool,
}

impl Default for SchanConfig {
    fn default() -> Self {
        SchanConfig {
            mode: SchanMode::Dma,
            timeout: Duration::from_millis(500),
            poll: Duration::from_micros(1000),
            read_supported: true,
        }
    }
}

// The command buffer, as seen from the host and from the ASIC
struct CmdBuf {
    mem: Arc<dyn DmaMemory>,
    bus: u64,
}

pub struct Schan {
    log: slog::Logger,
    hdl: asic::Handle,
    config: SchanConfig,
    // Holding this lock grants exclusive use of the command buffer and of the
    // DMA control registers.  In kernel mode there is no buffer, but the lock
    // still serializes commands.
    gate: Mutex<Option<CmdBuf>>,
}

impl Schan {
    pub fn new(
        log: &slog::Logger,
        hdl: asic::Handle,
        config: &SchanConfig,
    ) -> AsicResult<Self> {
        let log = log.new(o!("unit" => "schan"));
        let buf = match config.mode {
            SchanMode::Dma => {
                let info = hdl.dma_info()?;
                if info.size < SCHAN_RESERVED {
                    return Err(AsicError::Uninitialized(format!(
                        "dma pool of {} bytes is too small",
                        info.size
                    )));
                }
                let mem = hdl.map_dma_region()?;
                debug!(log, "using dma command buffer";
                    "bus" => format!("{:#x}", info.base));
                Some(CmdBuf {
                    mem,
                    bus: info.base,
                })
            }
            SchanMode::Kernel => None,
        };

        Ok(Schan {
            log,
            hdl,
            config: config.clone(),
            gate: Mutex::new(buf),
        })
    }

    pub fn read_supported(&self) -> bool {
        self.config.read_supported
    }

    /// Write `data` to the ASIC memory at `address`.
    pub fn write_memory(&self, address: u32, data: &[u32]) -> AsicResult<()> {
        self.execute(Opcode::WriteMemory, address, data, 0).map(|_| ())
    }

    /// Read `words` words of ASIC memory starting at `address`.
    pub fn read_memory(&self, address: u32, words: usize) -> AsicResult<Vec<u32>> {
        if !self.config.read_supported {
            return Err(AsicError::OperationUnsupported);
        }
        self.execute(Opcode::ReadMemory, address, &[], words)
    }

    /// Run a single S-Channel command, returning the `out_words` words of
    /// payload the ASIC wrote back.  A non-zero status from the ASIC becomes
    /// `CommandFailed`.
    pub fn execute(
        &self,
        op: Opcode,
        address: u32,
        data: &[u32],
        out_words: usize,
    ) -> AsicResult<Vec<u32>> {
        if data.len() > cmic::SCHAN_MAX_DATA_WORDS
            || out_words > cmic::SCHAN_MAX_DATA_WORDS
        {
            return Err(AsicError::InvalidArg(format!(
                "schan payload limited to {} words",
                cmic::SCHAN_MAX_DATA_WORDS
            )));
        }
        let words = match op {
            Opcode::WriteMemory => data.len(),
            Opcode::ReadMemory => out_words,
        };
        let cmd = cmic::schan_command(op, address, words);
        let mut payload = vec![0u32; data.len().max(out_words)];
        payload[..data.len()].copy_from_slice(data);

        trace!(self.log, "schan";
            "op" => ?op, "address" => format!("{address:#x}"), "words" => words);

        let gate = self.gate.lock().unwrap();
        let status = match (&self.config.mode, gate.as_ref()) {
            (SchanMode::Dma, Some(buf)) => self.dma_exchange(buf, &cmd, &mut payload)?,
            _ => self.hdl.run_command(&cmd, &mut payload)?,
        };
        drop(gate);

        if status != 0 {
            debug!(self.log, "schan command failed";
                "op" => ?op,
                "address" => format!("{address:#x}"),
                "status" => format!("{status:#x}"));
            return Err(AsicError::CommandFailed { status });
        }
        payload.truncate(out_words);
        Ok(payload)
    }

    /// Run `f` while holding the transport gate, for other users of the DMA
    /// control registers.
    pub fn exclusive<T>(&self, f: impl FnOnce() -> T) -> T {
        let _gate = self.gate.lock().unwrap();
        f()
    }

    /// Poll the DMA status register until `ch` reports completion.  Must be
    /// called with the gate held.
    pub fn wait_done(&self, ch: u32, what: &str) -> AsicResult<()> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let stat = self.hdl.register_read(cmic::CMICM_DMA_STAT)?;
            if stat & cmic::dma_done(ch) != 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AsicError::Timeout {
                    op: what.to_string(),
                    after_ms: self.config.timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(self.config.poll);
        }
    }

    /// Clear the completion bit for `ch`, leaving the other channels alone.
    /// Must be called with the gate held.
    pub fn clear_done(&self, ch: u32) -> AsicResult<()> {
        let stat = self.hdl.register_read(cmic::CMICM_DMA_STAT)?;
        self.hdl
            .register_write(cmic::CMICM_DMA_STAT, stat & !cmic::dma_done(ch))
    }

    fn dma_exchange(
        &self,
        buf: &CmdBuf,
        cmd: &[u32],
        payload: &mut [u32],
    ) -> AsicResult<u32> {
        // Stage the whole buffer, so a read always starts from a zeroed
        // payload and a stale status word can't be mistaken for a result.
        let mut staged = [0u32; cmic::SCHAN_BUF_WORDS];
        staged[cmic::SCHAN_BUF_CMD..cmic::SCHAN_BUF_CMD + cmd.len()]
            .copy_from_slice(cmd);
        staged[cmic::SCHAN_BUF_DATA..cmic::SCHAN_BUF_DATA + payload.len()]
            .copy_from_slice(payload);
        staged[cmic::SCHAN_BUF_STATUS] = u32::MAX;
        buf.mem.write_words(0, &staged)?;

        let ch = cmic::SCHAN_CHANNEL;
        self.clear_done(ch)?;
        self.hdl.register_write(cmic::dma_desc0(ch), buf.bus as u32)?;
        self.hdl
            .register_write(cmic::dma_ctrl(ch), cmic::DMA_CTRL_START)?;
        self.wait_done(ch, "schan")?;
        self.hdl.register_write(cmic::dma_ctrl(ch), 0)?;

        let mut result = [0u32; cmic::SCHAN_BUF_WORDS];
        buf.mem.read_words(0, &mut result)?;
        payload.copy_from_slice(
            &result[cmic::SCHAN_BUF_DATA..cmic::SCHAN_BUF_DATA + payload.len()],
        );
        Ok(result[cmic::SCHAN_BUF_STATUS])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;
    use aal::Device;
    use asic::stub::{StubConfig, StubDevice};

    fn stub() -> Arc<StubDevice> {
        Arc::new(StubDevice::new(&test_log(), &StubConfig::default()))
    }

    fn fast() -> SchanConfig {
        SchanConfig {
            timeout: Duration::from_millis(20),
            poll: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_dma_write_read() -> anyhow::Result<()> {
        let dev = stub();
        let schan = Schan::new(&test_log(), dev.clone(), &fast())?;

        schan.write_memory(0x0712_0010, &[1, 2, 3, 4])?;
        assert_eq!(dev.memory(0x0712_0010, 4), vec![1, 2, 3, 4]);
        assert_eq!(schan.read_memory(0x0712_0014, 2)?, vec![2, 3]);

        // The channel is left idle, and its done bit is still reported
        let stat = dev.register_read(cmic::CMICM_DMA_STAT)?;
        assert_ne!(stat & cmic::dma_done(cmic::SCHAN_CHANNEL), 0);
        assert_eq!(dev.register_read(cmic::dma_ctrl(0))?, 0);
        Ok(())
    }

    #[test]
    fn test_kernel_mode() -> anyhow::Result<()> {
        let dev = stub();
        let config = SchanConfig {
            mode: SchanMode::Kernel,
            ..fast()
        };
        let schan = Schan::new(&test_log(), dev.clone(), &config)?;
        schan.write_memory(0x100, &[7])?;
        assert_eq!(dev.memory(0x100, 1), vec![7]);
        assert_eq!(schan.read_memory(0x100, 1)?, vec![7]);
        Ok(())
    }

    #[test]
    fn test_timeout() -> anyhow::Result<()> {
        let dev = stub();
        let schan = Schan::new(&test_log(), dev.clone(), &fast())?;
        dev.stall(true);

        let start = Instant::now();
        let err = schan.write_memory(0x100, &[1]).unwrap_err();
        assert!(matches!(err, AsicError::Timeout { after_ms: 20, .. }));
        assert!(start.elapsed() < Duration::from_secs(5));

        // A stalled kernel driver reports the same error
        let config = SchanConfig {
            mode: SchanMode::Kernel,
            ..fast()
        };
        let schan = Schan::new(&test_log(), dev.clone(), &config)?;
        assert!(matches!(
            schan.read_memory(0x100, 1),
            Err(AsicError::Timeout { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_failed_status() -> anyhow::Result<()> {
        let dev = stub();
        let schan = Schan::new(&test_log(), dev.clone(), &fast())?;
        dev.fail_writes(0x2000..0x2100);
        assert!(matches!(
            schan.write_memory(0x2040, &[1, 2]),
            Err(AsicError::CommandFailed {
                status: asic::stub::STUB_FAIL_STATUS
            })
        ));
        assert_eq!(dev.memory(0x2040, 2), vec![0, 0]);
        Ok(())
    }

    #[test]
    fn test_limits() -> anyhow::Result<()> {
        let dev = stub();
        let config = SchanConfig {
            read_supported: false,
            ..fast()
        };
        let schan = Schan::new(&test_log(), dev.clone(), &config)?;
        assert!(matches!(
            schan.write_memory(0x100, &[0; 17]),
            Err(AsicError::InvalidArg(_))
        ));
        assert!(matches!(
            schan.read_memory(0x100, 1),
            Err(AsicError::OperationUnsupported)
        ));
        // Neither request made it as far as the device
        assert_eq!(dev.register_read(cmic::CMICM_DMA_STAT)?, 0);
        Ok(())
    }
}
