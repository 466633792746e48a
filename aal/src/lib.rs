// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::sync::Arc;

use thiserror::Error;

use common::ports::PortId;

pub mod cmic;

/// A specialized Result type for ASIC operations
pub type AsicResult<T> = Result<T, AsicError>;

/// Error type conveying additional information about ASIC errors
#[derive(Error, Debug)]
pub enum AsicError {
    /// An argument passed to the ASIC layer is invalid or inappropriate.  This
    /// indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// An Asic function was called before the ASIC layer was properly
    /// initialized.  Indicates misbehavior from the caller.
    #[error("ASIC layer uninitialized: {}", .0)]
    Uninitialized(String),
    /// This operation is unsupported by the ASIC model being used
    #[error("Operation unsupported by the ASIC")]
    OperationUnsupported,
    /// The ASIC layer detected some internal inconsistency
    #[error("Internal error: {}", .0)]
    Internal(String),
    /// The driver or asic wasn't found
    #[error("ASIC not found")]
    AsicMissing,
    /// The ASIC encountered an error when interacting with the device node or
    /// the local file system.
    #[error("IO error: {ctx}: {err}")]
    Io { ctx: String, err: std::io::Error },
    /// An error derived from a purposely triggered synthetic fault for testing
    /// purposes.
    #[error("Synthetic ASIC error: {}", .0)]
    Synthetic(String),
    /// A register offset fell outside the device's register window.
    #[error("Register offset {:#x} out of range", .0)]
    RegisterOutOfRange(u32),
    /// A command was handed to the ASIC, but the completion bit was never
    /// observed.  The state of the in-flight command is unknown.
    #[error("{op} timed out after {after_ms}ms")]
    Timeout { op: String, after_ms: u64 },
    /// The ASIC completed a command but reported a failure status.
    #[error("Command failed with status {status:#x}")]
    CommandFailed { status: u32 },
}

impl AsicError {
    /// Convenience constructor for errors wrapping `std::io::Error`
    pub fn io(ctx: impl ToString, err: std::io::Error) -> Self {
        AsicError::Io {
            ctx: ctx.to_string(),
            err,
        }
    }
}

/// The physical location and size of the DMA pool shared with the ASIC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaInfo {
    /// Bus address the ASIC uses to reach the start of the pool
    pub base: u64,
    /// Size of the pool in bytes
    pub size: usize,
}

/// A view of the DMA pool.  Offsets are in bytes from the start of the pool.
/// Word accessors use host byte order, which is the order the ASIC sees
/// descriptors and command buffers in.
pub trait DmaMemory: Send + Sync {
    /// Size of the region in bytes
    fn size(&self) -> usize;

    /// Copy bytes out of the region
    fn read(&self, offset: usize, out: &mut [u8]) -> AsicResult<()>;

    /// Copy bytes into the region
    fn write(&self, offset: usize, data: &[u8]) -> AsicResult<()>;

    fn read_words(&self, offset: usize, out: &mut [u32]) -> AsicResult<()> {
        let mut buf = vec![0u8; out.len() * 4];
        self.read(offset, &mut buf)?;
        for (w, c) in out.iter_mut().zip(buf.chunks_exact(4)) {
            *w = u32::from_ne_bytes([c[0], c[1], c[2], c[3]]);
        }
        Ok(())
    }

    fn write_words(&self, offset: usize, data: &[u32]) -> AsicResult<()> {
        let buf: Vec<u8> = data.iter().flat_map(|w| w.to_ne_bytes()).collect();
        self.write(offset, &buf)
    }
}

/// Check that an access of `len` bytes at `offset` stays within a region of
/// `size` bytes.
pub fn dma_bounds_check(offset: usize, len: usize, size: usize) -> AsicResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(AsicError::InvalidArg(format!(
            "dma access {offset:#x}+{len:#x} exceeds region of {size:#x} bytes"
        ))),
    }
}

/// The `Device` trait is the contract between the daemon and the kernel layer
/// that owns the ASIC's PCI function.  It exposes the register window, the
/// shared DMA pool, and a blocking S-Channel primitive for drivers that run
/// the command protocol in the kernel.
pub trait Device: Send + Sync {
    /// A short name for the backend, used in log messages
    fn name(&self) -> &str;

    /// Read a 32-bit register.  Offsets at or beyond
    /// [`cmic::REGISTER_WINDOW`] are rejected.
    fn register_read(&self, offset: u32) -> AsicResult<u32>;

    /// Write a 32-bit register.  Offsets at or beyond
    /// [`cmic::REGISTER_WINDOW`] are rejected.
    fn register_write(&self, offset: u32, value: u32) -> AsicResult<()>;

    /// Report the bus address and size of the DMA pool
    fn dma_info(&self) -> AsicResult<DmaInfo>;

    /// Map the DMA pool into this process
    fn map_dma_region(&self) -> AsicResult<Arc<dyn DmaMemory>>;

    /// Execute a single S-Channel command and wait for it to complete.  `cmd`
    /// holds at most [`cmic::SCHAN_MAX_CMD_WORDS`] words and `data` at most
    /// [`cmic::SCHAN_MAX_DATA_WORDS`].  On return, `data` holds whatever the
    /// ASIC wrote back and the result is the command's status word.
    fn run_command(&self, cmd: &[u32], data: &mut [u32]) -> AsicResult<u32>;
}

/// Reject register offsets outside the register window.
pub fn check_register(offset: u32) -> AsicResult<()> {
    if offset >= cmic::REGISTER_WINDOW {
        Err(AsicError::RegisterOutOfRange(offset))
    } else {
        Ok(())
    }
}

/// Check the word counts handed to [`Device::run_command`].
pub fn check_command(cmd: &[u32], data: &[u32]) -> AsicResult<()> {
    if cmd.is_empty() || cmd.len() > cmic::SCHAN_MAX_CMD_WORDS {
        return Err(AsicError::InvalidArg(format!(
            "command must be 1..={} words, got {}",
            cmic::SCHAN_MAX_CMD_WORDS,
            cmd.len()
        )));
    }
    if data.len() > cmic::SCHAN_MAX_DATA_WORDS {
        return Err(AsicError::InvalidArg(format!(
            "payload must be at most {} words, got {}",
            cmic::SCHAN_MAX_DATA_WORDS,
            data.len()
        )));
    }
    Ok(())
}

/// When the daemon detects a state change for a port, it sends a PortUpdate
/// event to anyone listening for them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortUpdate {
    /// Signal that the linkup/linkdown state of a port has changed
    LinkUp { port: PortId, linkup: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_window() {
        assert!(check_register(0).is_ok());
        assert!(check_register(cmic::REGISTER_WINDOW - 4).is_ok());
        assert!(matches!(
            check_register(cmic::REGISTER_WINDOW),
            Err(AsicError::RegisterOutOfRange(0x40000))
        ));
    }

    #[test]
    fn test_command_limits() {
        assert!(check_command(&[0; 2], &[0; 16]).is_ok());
        assert!(check_command(&[], &[]).is_err());
        assert!(check_command(&[0; 9], &[]).is_err());
        assert!(check_command(&[0; 2], &[0; 17]).is_err());
    }

    #[test]
    fn test_dma_bounds() {
        assert!(dma_bounds_check(0, 16, 16).is_ok());
        assert!(dma_bounds_check(1, 16, 16).is_err());
        assert!(dma_bounds_check(usize::MAX, 2, 16).is_err());
    }
}
