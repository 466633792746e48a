// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The CMIC (CPU management interface controller) register layout and the
//! formats of the words exchanged through it.  Every backend, emulated or
//! real, agrees on these.

/// Size of BAR0.  Register offsets at or beyond this are invalid.
pub const REGISTER_WINDOW: u32 = 0x40000;

pub const CMIC_CMC0_SCHAN_CTRL: u32 = 0x32800;
pub const CMICM_DMA_STAT: u32 = 0x31150;

/// DMA channel used for S-Channel commands
pub const SCHAN_CHANNEL: u32 = 0;
/// DMA channel used for packet receive
pub const RX_CHANNEL: u32 = 1;
/// DMA channel used for packet transmit
pub const TX_CHANNEL: u32 = 2;

/// Writing this to a channel's control register starts the channel.
pub const DMA_CTRL_START: u32 = 0x1;

/// Control register for a DMA channel
pub const fn dma_ctrl(ch: u32) -> u32 {
    0x31140 + 4 * ch
}

/// Descriptor address register for a DMA channel
pub const fn dma_desc0(ch: u32) -> u32 {
    0x31158 + 4 * ch
}

/// The bit in `CMICM_DMA_STAT` signalling that a channel has finished
pub const fn dma_done(ch: u32) -> u32 {
    1 << ch
}

/// Hardware limits on a single S-Channel exchange
pub const SCHAN_MAX_CMD_WORDS: usize = 8;
pub const SCHAN_MAX_DATA_WORDS: usize = 16;

/// Layout of the S-Channel command buffer, in 32-bit words: the command
/// header area, the payload area, and the status word the ASIC writes back.
pub const SCHAN_BUF_CMD: usize = 0;
pub const SCHAN_BUF_DATA: usize = SCHAN_BUF_CMD + SCHAN_MAX_CMD_WORDS;
pub const SCHAN_BUF_STATUS: usize = SCHAN_BUF_DATA + SCHAN_MAX_DATA_WORDS;
pub const SCHAN_BUF_WORDS: usize = SCHAN_BUF_STATUS + 1;

const SCHAN_HEADER: u32 = 0x2800_0000;
const SCHAN_HEADER_MASK: u32 = 0xff00_0000;

/// S-Channel operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    WriteMemory,
    ReadMemory,
}

impl Opcode {
    fn tag(self) -> u32 {
        match self {
            Opcode::WriteMemory => 0,
            Opcode::ReadMemory => 1,
        }
    }
}

/// Build the two command words for an operation on `address` moving `words`
/// payload words.
pub fn schan_command(op: Opcode, address: u32, words: usize) -> [u32; 2] {
    let len = (words as u32) & 0x1f;
    [SCHAN_HEADER | (len << 8) | op.tag(), address]
}

/// Decode a command header into its opcode and payload length
pub fn parse_schan_header(word: u32) -> Option<(Opcode, usize)> {
    if word & SCHAN_HEADER_MASK != SCHAN_HEADER {
        return None;
    }
    let op = match word & 0xff {
        0 => Opcode::WriteMemory,
        1 => Opcode::ReadMemory,
        _ => return None,
    };
    Some((op, ((word >> 8) & 0x1f) as usize))
}

/// Descriptor control blocks (DCBs) used by the packet DMA channels.
pub mod dcb {
    pub const WORDS: usize = 16;
    pub const BYTES: usize = WORDS * 4;

    /// Word 0: bus address of the packet buffer
    pub const ADDR: usize = 0;
    /// Word 1: transfer control and byte count
    pub const CTRL: usize = 1;
    /// Word 4: source or destination port, in the low byte
    pub const PORT: usize = 4;
    /// Word 15: completion status and byte count
    pub const STATUS: usize = 15;

    pub const DONE: u32 = 1 << 31;
    pub const LEN_MASK: u32 = 0x7fff;
    pub const PORT_MASK: u32 = 0xff;

    pub const TX_CTRL: u32 = 0x0018_0000;
    pub const TX_WORD2: u32 = 0xff00_0000;
    pub const TX_WORD3: u32 = 0x0000_0100;
    pub const TX_PORT: u32 = 0x0303_0300;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header() {
        let [hdr, addr] = schan_command(Opcode::ReadMemory, 0x0712_0000, 4);
        assert_eq!(hdr, 0x2800_0401);
        assert_eq!(addr, 0x0712_0000);
        assert_eq!(parse_schan_header(hdr), Some((Opcode::ReadMemory, 4)));

        let [hdr, _] = schan_command(Opcode::WriteMemory, 0, 16);
        assert_eq!(hdr, 0x2800_1000);
        assert_eq!(parse_schan_header(hdr), Some((Opcode::WriteMemory, 16)));

        assert_eq!(parse_schan_header(0x1234_0000), None);
        assert_eq!(parse_schan_header(0x2800_0007), None);
    }

    #[test]
    fn test_channel_registers() {
        assert_eq!(dma_ctrl(SCHAN_CHANNEL), 0x31140);
        assert_eq!(dma_desc0(SCHAN_CHANNEL), 0x31158);
        assert_eq!(dma_desc0(TX_CHANNEL), 0x31160);
        assert_eq!(dma_done(TX_CHANNEL), 0x4);
        assert!(dma_ctrl(TX_CHANNEL) < REGISTER_WINDOW);
    }
}
