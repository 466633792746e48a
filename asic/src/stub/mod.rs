// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! An emulated ASIC.  The stub keeps a register file, a DMA pool, and a sparse
//! model of the ASIC's internal memory.  Starting the S-Channel DMA channel
//! executes the command sitting in the DMA pool against that memory, and
//! starting the transmit channel captures the frame described by the DCB.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use slog::{debug, o, trace};

use aal::cmic;
use aal::cmic::dcb;
use aal::cmic::Opcode;
use aal::{AsicError, AsicResult, Device, DmaInfo, DmaMemory};

/// Status word reported for a write the stub was told to fail
pub const STUB_FAIL_STATUS: u32 = 0x5a;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StubConfig {
    /// Bus address reported for the start of the DMA pool
    pub dma_base: u64,
    /// Size of the DMA pool in bytes
    pub dma_size: usize,
}

impl Default for StubConfig {
    fn default() -> Self {
        StubConfig {
            dma_base: 0x1000_0000,
            dma_size: 1 << 20,
        }
    }
}

/// The DMA pool, backed by ordinary memory.
pub struct StubDma {
    mem: Mutex<Vec<u8>>,
}

impl StubDma {
    fn new(size: usize) -> Self {
        StubDma {
            mem: Mutex::new(vec![0u8; size]),
        }
    }
}

impl DmaMemory for StubDma {
    fn size(&self) -> usize {
        self.mem.lock().unwrap().len()
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> AsicResult<()> {
        let mem = self.mem.lock().unwrap();
        aal::dma_bounds_check(offset, out.len(), mem.len())?;
        out.copy_from_slice(&mem[offset..offset + out.len()]);
        Ok(())
    }

    fn write(&self, offset: usize, data: &[u8]) -> AsicResult<()> {
        let mut mem = self.mem.lock().unwrap();
        aal::dma_bounds_check(offset, data.len(), mem.len())?;
        mem[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[derive(Default)]
struct Faults {
    // Never report completion of any DMA channel
    stall: bool,
    // Fail S-Channel writes to addresses in these ranges
    fail_writes: Vec<Range<u32>>,
}

/// A frame captured from the transmit channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transmitted {
    pub port: u8,
    pub frame: Vec<u8>,
}

pub struct StubDevice {
    log: slog::Logger,
    config: StubConfig,
    regs: Mutex<BTreeMap<u32, u32>>,
    dma: Arc<StubDma>,
    // Internal memory, one entry per 32-bit word, keyed by byte address
    memory: Mutex<BTreeMap<u32, u32>>,
    faults: Mutex<Faults>,
    transmitted: Mutex<Vec<Transmitted>>,
}

impl StubDevice {
    pub fn new(log: &slog::Logger, config: &StubConfig) -> Self {
        let log = log.new(o!("device" => "stub"));
        debug!(log, "created stub asic";
            "dma_base" => format!("{:#x}", config.dma_base),
            "dma_size" => config.dma_size);
        StubDevice {
            log,
            config: config.clone(),
            regs: Mutex::new(BTreeMap::new()),
            dma: Arc::new(StubDma::new(config.dma_size)),
            memory: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            transmitted: Mutex::new(Vec::new()),
        }
    }

    /// Stop reporting completion for any channel started after this call.
    pub fn stall(&self, stall: bool) {
        self.faults.lock().unwrap().stall = stall;
    }

    /// Fail every S-Channel write whose address lies within `range`.
    pub fn fail_writes(&self, range: Range<u32>) {
        self.faults.lock().unwrap().fail_writes.push(range);
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }

    /// Read `words` words of internal memory starting at `address`.
    /// Never-written words read as zero.
    pub fn memory(&self, address: u32, words: usize) -> Vec<u32> {
        let mem = self.memory.lock().unwrap();
        (0..words)
            .map(|i| {
                let a = address.wrapping_add(4 * i as u32);
                mem.get(&a).copied().unwrap_or(0)
            })
            .collect()
    }

    /// Seed internal memory, as the hardware itself would when updating a
    /// status register.
    pub fn set_memory(&self, address: u32, data: &[u32]) {
        let mut mem = self.memory.lock().unwrap();
        for (i, w) in data.iter().enumerate() {
            mem.insert(address.wrapping_add(4 * i as u32), *w);
        }
    }

    /// All frames sent through the transmit channel so far
    pub fn transmitted(&self) -> Vec<Transmitted> {
        self.transmitted.lock().unwrap().clone()
    }

    fn stalled(&self) -> bool {
        self.faults.lock().unwrap().stall
    }

    fn write_fails(&self, address: u32, words: usize) -> bool {
        let faults = self.faults.lock().unwrap();
        let end = address.wrapping_add(4 * words as u32);
        faults
            .fail_writes
            .iter()
            .any(|r| address < r.end && r.start < end)
    }

    fn reg(&self, offset: u32) -> u32 {
        self.regs.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    fn set_done(&self, ch: u32) {
        let mut regs = self.regs.lock().unwrap();
        let stat = regs.entry(cmic::CMICM_DMA_STAT).or_insert(0);
        *stat |= cmic::dma_done(ch);
    }

    // Translate a bus address into an offset within the DMA pool
    fn dma_offset(&self, bus: u64) -> AsicResult<usize> {
        bus.checked_sub(self.config.dma_base)
            .map(|o| o as usize)
            .filter(|o| *o < self.config.dma_size)
            .ok_or_else(|| {
                AsicError::InvalidArg(format!(
                    "bus address {bus:#x} outside the dma pool"
                ))
            })
    }

    // Execute one S-Channel command against internal memory, returning the
    // status word.  `data` carries the write payload in and the read payload
    // out.
    fn execute(&self, cmd: &[u32], data: &mut [u32]) -> u32 {
        let Some((op, words)) = cmd.first().and_then(|w| cmic::parse_schan_header(*w)) else {
            debug!(self.log, "malformed schan header"; "cmd" => ?cmd);
            return 1;
        };
        let Some(address) = cmd.get(1).copied() else {
            return 1;
        };
        let words = words.min(data.len());
        match op {
            Opcode::WriteMemory => {
                if self.write_fails(address, words) {
                    debug!(self.log, "failing schan write";
                        "address" => format!("{address:#x}"));
                    return STUB_FAIL_STATUS;
                }
                trace!(self.log, "schan write";
                    "address" => format!("{address:#x}"),
                    "data" => ?&data[..words]);
                self.set_memory(address, &data[..words]);
            }
            Opcode::ReadMemory => {
                let mem = self.memory(address, words);
                data[..words].copy_from_slice(&mem);
            }
        }
        0
    }

    // The S-Channel DMA channel was started.  The command buffer lives at the
    // bus address programmed into the channel's descriptor register.
    fn kick_schan(&self) -> AsicResult<()> {
        let bus = self.reg(cmic::dma_desc0(cmic::SCHAN_CHANNEL)) as u64;
        let offset = self.dma_offset(bus)?;
        let mut buf = [0u32; cmic::SCHAN_BUF_WORDS];
        self.dma.read_words(offset, &mut buf)?;

        let (cmd, rest) = buf.split_at_mut(cmic::SCHAN_BUF_DATA);
        let (data, status) = rest.split_at_mut(cmic::SCHAN_MAX_DATA_WORDS);
        status[0] = self.execute(cmd, data);
        self.dma.write_words(offset + 4 * cmic::SCHAN_BUF_DATA, data)?;
        self.dma
            .write_words(offset + 4 * cmic::SCHAN_BUF_STATUS, status)?;

        if !self.stalled() {
            self.set_done(cmic::SCHAN_CHANNEL);
        }
        Ok(())
    }

    // The transmit channel was started.  Capture the frame described by the
    // DCB and mark the descriptor complete.
    fn kick_tx(&self) -> AsicResult<()> {
        let bus = self.reg(cmic::dma_desc0(cmic::TX_CHANNEL)) as u64;
        let offset = self.dma_offset(bus)?;
        let mut desc = [0u32; dcb::WORDS];
        self.dma.read_words(offset, &mut desc)?;

        let len = (desc[dcb::CTRL] & 0xffff) as usize;
        let buf = self.dma_offset(desc[dcb::ADDR] as u64)?;
        let mut frame = vec![0u8; len];
        self.dma.read(buf, &mut frame)?;
        let port = (desc[dcb::PORT] & dcb::PORT_MASK) as u8;
        debug!(self.log, "transmit"; "port" => port, "len" => len);
        self.transmitted
            .lock()
            .unwrap()
            .push(Transmitted { port, frame });

        desc[dcb::STATUS] |= dcb::DONE;
        self.dma.write_words(offset, &desc)?;
        if !self.stalled() {
            self.set_done(cmic::TX_CHANNEL);
        }
        Ok(())
    }
}

impl Device for StubDevice {
    fn name(&self) -> &str {
        "stub"
    }

    fn register_read(&self, offset: u32) -> AsicResult<u32> {
        aal::check_register(offset)?;
        Ok(self.reg(offset))
    }

    fn register_write(&self, offset: u32, value: u32) -> AsicResult<()> {
        aal::check_register(offset)?;
        self.regs.lock().unwrap().insert(offset, value);

        if value & cmic::DMA_CTRL_START != 0 {
            if offset == cmic::dma_ctrl(cmic::SCHAN_CHANNEL) {
                self.kick_schan()?;
            } else if offset == cmic::dma_ctrl(cmic::TX_CHANNEL) {
                self.kick_tx()?;
            }
        }
        Ok(())
    }

    fn dma_info(&self) -> AsicResult<DmaInfo> {
        Ok(DmaInfo {
            base: self.config.dma_base,
            size: self.config.dma_size,
        })
    }

    fn map_dma_region(&self) -> AsicResult<Arc<dyn DmaMemory>> {
        Ok(self.dma.clone())
    }

    fn run_command(&self, cmd: &[u32], data: &mut [u32]) -> AsicResult<u32> {
        aal::check_command(cmd, data)?;
        if self.stalled() {
            return Err(AsicError::Timeout {
                op: "schan ioctl".to_string(),
                after_ms: 500,
            });
        }
        Ok(self.execute(cmd, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Drain;

    fn test_log() -> slog::Logger {
        let dec =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(dec).build().fuse();
        slog::Logger::root(drain, slog::o!())
    }

    #[test]
    fn test_register_window() {
        let stub = StubDevice::new(&test_log(), &StubConfig::default());
        stub.register_write(0x100, 7).unwrap();
        assert_eq!(stub.register_read(0x100).unwrap(), 7);
        assert!(matches!(
            stub.register_read(cmic::REGISTER_WINDOW),
            Err(AsicError::RegisterOutOfRange(_))
        ));
        assert!(stub.register_write(0x4_0000, 1).is_err());
    }

    #[test]
    fn test_run_command() -> anyhow::Result<()> {
        let stub = StubDevice::new(&test_log(), &StubConfig::default());
        let cmd = cmic::schan_command(Opcode::WriteMemory, 0x1000, 2);
        let mut data = [0xdead, 0xbeef];
        assert_eq!(stub.run_command(&cmd, &mut data)?, 0);
        assert_eq!(stub.memory(0x1000, 2), vec![0xdead, 0xbeef]);

        let cmd = cmic::schan_command(Opcode::ReadMemory, 0x1004, 1);
        let mut data = [0u32; 1];
        assert_eq!(stub.run_command(&cmd, &mut data)?, 0);
        assert_eq!(data, [0xbeef]);

        stub.fail_writes(0x2000..0x2010);
        let cmd = cmic::schan_command(Opcode::WriteMemory, 0x200c, 1);
        assert_eq!(stub.run_command(&cmd, &mut [1])?, STUB_FAIL_STATUS);
        assert_eq!(stub.memory(0x200c, 1), vec![0]);

        stub.clear_faults();
        stub.stall(true);
        assert!(matches!(
            stub.run_command(&cmd, &mut [1]),
            Err(AsicError::Timeout { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_dma_kick() -> anyhow::Result<()> {
        let config = StubConfig::default();
        let stub = StubDevice::new(&test_log(), &config);
        let dma = stub.map_dma_region()?;

        let cmd = cmic::schan_command(Opcode::WriteMemory, 0x3000, 1);
        dma.write_words(0x100, &cmd)?;
        dma.write_words(0x100 + 4 * cmic::SCHAN_BUF_DATA, &[0x1234])?;
        stub.register_write(
            cmic::dma_desc0(cmic::SCHAN_CHANNEL),
            (config.dma_base + 0x100) as u32,
        )?;
        stub.register_write(
            cmic::dma_ctrl(cmic::SCHAN_CHANNEL),
            cmic::DMA_CTRL_START,
        )?;

        assert_eq!(stub.memory(0x3000, 1), vec![0x1234]);
        let stat = stub.register_read(cmic::CMICM_DMA_STAT)?;
        assert_eq!(stat & cmic::dma_done(cmic::SCHAN_CHANNEL), 1);
        Ok(())
    }
}
