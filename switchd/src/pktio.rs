// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Packet I/O between the CPU and the front-panel ports.
//!
//! Frames move through the packet DMA channels.  Each transfer is described by
//! a DCB (descriptor control block) in the DMA pool, pointing at a buffer also
//! carved from the pool.  Transmit uses a single descriptor and buffer, reused
//! for every frame.  Receive uses a ring of descriptors that the ASIC fills
//! in, each marked done when its buffer holds a frame.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use slog::{debug, info, o, trace, warn};
use tokio::sync::mpsc;

use crate::schan::SCHAN_RESERVED;
use crate::types::{SwdError, SwdResult};
use crate::Switch;
use aal::cmic;
use aal::cmic::dcb;
use aal::{AsicResult, DmaInfo, DmaMemory};
use common::ports::PortId;

/// Largest frame we will transmit
pub const TX_BUF_MAX: usize = 2048;
/// Number of descriptors in the receive ring
pub const RX_DCBS: usize = 64;
pub const RX_BUF_SIZE: usize = 2048;

const DCB_ALIGN: usize = 64;
const BUF_ALIGN: usize = 16;
const RX_POLL: Duration = Duration::from_millis(1);
// Receive descriptors use the same transfer control word as transmit
const RX_CTRL: u32 = dcb::TX_CTRL;

/// A chunk of the DMA pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaBuf {
    /// Offset from the start of the pool
    pub offset: usize,
    /// The address the ASIC uses to reach the chunk
    pub bus: u32,
}

/// Carves buffers out of the DMA pool.  Nothing is ever returned to the pool.
#[derive(Debug)]
pub struct DmaPool {
    base: u64,
    size: usize,
    next: usize,
}

impl DmaPool {
    /// Manage the pool described by `info`, starting `start` bytes in.
    pub fn new(info: DmaInfo, start: usize) -> Self {
        DmaPool {
            base: info.base,
            size: info.size,
            next: start,
        }
    }

    pub fn alloc(&mut self, size: usize, align: usize) -> SwdResult<DmaBuf> {
        let offset = self.next.next_multiple_of(align);
        let end = offset + size;
        if end > self.size {
            return Err(SwdError::TableFull(format!(
                "dma pool ({size} bytes requested, {} available)",
                self.size.saturating_sub(offset)
            )));
        }
        // Descriptors carry 32-bit addresses
        if self.base + end as u64 > 1 << 32 {
            return Err(SwdError::Invalid(format!(
                "dma address {:#x} is not reachable by the asic",
                self.base + offset as u64
            )));
        }
        self.next = end;
        Ok(DmaBuf {
            offset,
            bus: (self.base + offset as u64) as u32,
        })
    }
}

/// A frame received from the ASIC
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxPacket {
    /// The source port reported in the descriptor
    pub port: u8,
    pub data: Vec<u8>,
}

/// Build the descriptor for transmitting `len` bytes from `buf` out `port`.
pub fn tx_dcb(buf: &DmaBuf, port: PortId, len: usize) -> [u32; dcb::WORDS] {
    let len = len as u32;
    let mut w = [0u32; dcb::WORDS];
    w[dcb::ADDR] = buf.bus;
    w[dcb::CTRL] = dcb::TX_CTRL | len;
    w[2] = dcb::TX_WORD2;
    w[3] = dcb::TX_WORD3;
    w[dcb::PORT] = dcb::TX_PORT | port.as_u8() as u32;
    w[dcb::STATUS] = dcb::DONE | len;
    w
}

struct TxSlot {
    dcb: DmaBuf,
    buf: DmaBuf,
}

/// The receive descriptor ring and its buffers
pub struct RxRing {
    log: slog::Logger,
    mem: Arc<dyn DmaMemory>,
    ring: DmaBuf,
    bufs: Vec<DmaBuf>,
}

impl RxRing {
    fn new(
        log: &slog::Logger,
        mem: Arc<dyn DmaMemory>,
        pool: &mut DmaPool,
    ) -> SwdResult<Self> {
        // One spare descriptor terminates the chain
        let ring = pool.alloc((RX_DCBS + 1) * dcb::BYTES, DCB_ALIGN)?;
        mem.write(ring.offset, &[0u8; (RX_DCBS + 1) * dcb::BYTES])?;

        let mut bufs = Vec::with_capacity(RX_DCBS);
        for i in 0..RX_DCBS {
            let buf = pool.alloc(RX_BUF_SIZE, BUF_ALIGN)?;
            let desc = ring.offset + i * dcb::BYTES;
            mem.write_words(
                desc,
                &[buf.bus, RX_CTRL | RX_BUF_SIZE as u32],
            )?;
            bufs.push(buf);
        }
        Ok(RxRing {
            log: log.clone(),
            mem,
            ring,
            bufs,
        })
    }

    fn desc(&self, i: usize) -> usize {
        self.ring.offset + i * dcb::BYTES
    }

    fn rearm(&self, i: usize) -> AsicResult<()> {
        self.mem
            .write_words(self.desc(i) + 4 * dcb::STATUS, &[0])
    }

    /// Hand every completed frame to `out`.  A descriptor is re-armed only
    /// once its frame has been accepted by the channel, so a frame is never
    /// lost to a closed receiver.  Returns the number of frames delivered.
    pub fn poll_once(
        &self,
        out: &mpsc::UnboundedSender<RxPacket>,
    ) -> SwdResult<usize> {
        let mut delivered = 0;
        for (i, buf) in self.bufs.iter().enumerate() {
            let mut desc = [0u32; dcb::WORDS];
            self.mem.read_words(self.desc(i), &mut desc)?;
            let status = desc[dcb::STATUS];
            if status & dcb::DONE == 0 {
                continue;
            }

            let len = (status & dcb::LEN_MASK) as usize;
            let port = (desc[dcb::PORT] & dcb::PORT_MASK) as u8;
            if len == 0 || len > RX_BUF_SIZE {
                warn!(self.log, "dropping malformed rx descriptor";
                    "desc" => i, "len" => len);
                self.rearm(i)?;
                continue;
            }

            let mut data = vec![0u8; len];
            self.mem.read(buf.offset, &mut data)?;
            trace!(self.log, "rx"; "desc" => i, "port" => port, "len" => len);
            if out.send(RxPacket { port, data }).is_err() {
                return Err(SwdError::Other("rx channel closed".into()));
            }
            self.rearm(i)?;
            delivered += 1;
        }
        Ok(delivered)
    }
}

enum RxTrigger {
    Quit,
}

pub struct PktIo {
    log: slog::Logger,
    mem: Arc<dyn DmaMemory>,
    tx: Mutex<TxSlot>,
    rx: RxRing,
    trigger_tx: mpsc::UnboundedSender<RxTrigger>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<RxTrigger>>>,
}

impl PktIo {
    /// Lay out the transmit slot and receive ring in the DMA pool, above the
    /// S-Channel command buffer.
    pub fn new(log: &slog::Logger, hdl: &asic::Handle) -> SwdResult<Self> {
        let log = log.new(o!("unit" => "pktio"));
        let info = hdl.dma_info()?;
        let mem = hdl.map_dma_region()?;
        let mut pool = DmaPool::new(info, SCHAN_RESERVED);

        let tx = TxSlot {
            dcb: pool.alloc(dcb::BYTES, DCB_ALIGN)?,
            buf: pool.alloc(TX_BUF_MAX, BUF_ALIGN)?,
        };
        let rx = RxRing::new(&log, mem.clone(), &mut pool)?;
        debug!(log, "packet rings allocated";
            "tx_dcb" => format!("{:#x}", tx.dcb.bus),
            "rx_ring" => format!("{:#x}", rx.ring.bus),
            "pool_used" => pool.next);

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        Ok(PktIo {
            log,
            mem,
            tx: Mutex::new(tx),
            rx,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        })
    }

    pub fn rx_ring(&self) -> &RxRing {
        &self.rx
    }

    /// Stop the receive task at its next wake
    pub fn quit(&self) {
        _ = self.trigger_tx.send(RxTrigger::Quit);
    }
}

fn pktio(switch: &Switch) -> SwdResult<&PktIo> {
    switch
        .pktio
        .as_ref()
        .ok_or_else(|| SwdError::Unsupported("packet I/O is disabled".into()))
}

/// Send a frame out of `port`.
pub fn tx(switch: &Switch, port: PortId, frame: &[u8]) -> SwdResult<()> {
    switch.check_port(port)?;
    if frame.is_empty() || frame.len() > TX_BUF_MAX {
        return Err(SwdError::Invalid(format!(
            "frame length must be 1 to {TX_BUF_MAX} bytes, not {}",
            frame.len()
        )));
    }
    let pktio = pktio(switch)?;

    let slot = pktio.tx.lock().unwrap();
    pktio.mem.write(slot.buf.offset, frame)?;
    pktio
        .mem
        .write_words(slot.dcb.offset, &tx_dcb(&slot.buf, port, frame.len()))?;

    let hdl = &switch.asic_hdl;
    let ch = cmic::TX_CHANNEL;
    switch.schan.exclusive(|| -> AsicResult<()> {
        switch.schan.clear_done(ch)?;
        hdl.register_write(cmic::dma_desc0(ch), slot.dcb.bus)?;
        hdl.register_write(cmic::dma_ctrl(ch), cmic::DMA_CTRL_START)?;
        let done = switch.schan.wait_done(ch, "packet tx");
        hdl.register_write(cmic::dma_ctrl(ch), 0)?;
        done
    })?;
    trace!(pktio.log, "tx"; "port" => %port, "len" => frame.len());
    Ok(())
}

// Point the receive channel at the ring and start it.
fn rx_start(switch: &Switch, pktio: &PktIo) -> SwdResult<()> {
    let hdl = &switch.asic_hdl;
    let ch = cmic::RX_CHANNEL;
    switch.schan.exclusive(|| -> AsicResult<()> {
        hdl.register_write(cmic::dma_desc0(ch), pktio.rx.ring.bus)?;
        hdl.register_write(cmic::dma_ctrl(ch), cmic::DMA_CTRL_START)
    })?;
    Ok(())
}

/// Start the receive channel and a task that forwards received frames to
/// `out`.  This can only be done once.
pub fn run_rx(
    switch: Arc<Switch>,
    out: mpsc::UnboundedSender<RxPacket>,
) -> SwdResult<tokio::task::JoinHandle<()>> {
    let pktio = pktio(&switch)?;
    let trigger = pktio.trigger_rx.lock().unwrap().take().ok_or_else(|| {
        SwdError::Other("the rx task can only be run once".into())
    })?;
    rx_start(&switch, pktio)?;
    Ok(tokio::task::spawn(rx_task(switch, trigger, out)))
}

async fn rx_task(
    switch: Arc<Switch>,
    mut trigger: mpsc::UnboundedReceiver<RxTrigger>,
    out: mpsc::UnboundedSender<RxPacket>,
) {
    let Some(pktio) = switch.pktio.as_ref() else {
        return;
    };
    info!(pktio.log, "rx task running");
    loop {
        tokio::select! {
            _ = trigger.recv() => break,
            _ = tokio::time::sleep(RX_POLL) => {}
        }
        if let Err(e) = pktio.rx.poll_once(&out) {
            if out.is_closed() {
                info!(pktio.log, "rx channel closed");
                break;
            }
            warn!(pktio.log, "rx poll failed"; "error" => %e);
        }
    }
    info!(pktio.log, "rx task exiting");
}
