// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The kernel BDE (broadcom device enumerator) backend.  The driver exports a
//! character device with ioctls for register access and S-Channel commands,
//! and an mmap of the DMA pool it allocated for the ASIC.

use std::ffi::CString;
use std::sync::Arc;

use slog::{debug, info, o};

use aal::cmic;
use aal::{AsicError, AsicResult, Device, DmaInfo, DmaMemory};

const BDE_MAGIC: u32 = b'B' as u32;

#[repr(C)]
#[derive(Default)]
struct BdeReg {
    offset: u32,
    value: u32,
}

#[repr(C)]
#[derive(Default)]
struct BdeDmaInfo {
    pbase: u64,
    size: u32,
}

#[repr(C)]
#[derive(Default)]
struct BdeSchan {
    cmd: [u32; cmic::SCHAN_MAX_CMD_WORDS],
    data: [u32; cmic::SCHAN_MAX_DATA_WORDS],
    len: i32,
    status: i32,
}

// The ioctl request encoding differs between architecture families.
cfg_if::cfg_if! {
    if #[cfg(any(
        target_arch = "powerpc",
        target_arch = "powerpc64",
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "sparc64"
    ))] {
        const IOC_SIZEBITS: u32 = 13;
        const IOC_WRITE: u32 = 4;
        const IOC_READ: u32 = 2;
    } else {
        const IOC_SIZEBITS: u32 = 14;
        const IOC_WRITE: u32 = 1;
        const IOC_READ: u32 = 2;
    }
}

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << (16 + IOC_SIZEBITS)) | ((size as u32) << 16) | (BDE_MAGIC << 8) | nr
}

const READ_REG: u32 =
    ioc(IOC_READ | IOC_WRITE, 1, std::mem::size_of::<BdeReg>());
const WRITE_REG: u32 = ioc(IOC_WRITE, 2, std::mem::size_of::<BdeReg>());
const GET_DMA_INFO: u32 =
    ioc(IOC_READ, 3, std::mem::size_of::<BdeDmaInfo>());
const SCHAN_OP: u32 =
    ioc(IOC_READ | IOC_WRITE, 4, std::mem::size_of::<BdeSchan>());

/// The DMA pool, mapped into our address space.
pub struct BdeDma {
    base: *mut u8,
    size: usize,
}

// The mapping is shared memory with no thread affinity; callers serialize
// their own use of each region.
unsafe impl Send for BdeDma {}
unsafe impl Sync for BdeDma {}

impl Drop for BdeDma {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

impl DmaMemory for BdeDma {
    fn size(&self) -> usize {
        self.size
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> AsicResult<()> {
        aal::dma_bounds_check(offset, out.len(), self.size)?;
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        for (i, b) in out.iter_mut().enumerate() {
            *b = unsafe { std::ptr::read_volatile(self.base.add(offset + i)) };
        }
        Ok(())
    }

    fn write(&self, offset: usize, data: &[u8]) -> AsicResult<()> {
        aal::dma_bounds_check(offset, data.len(), self.size)?;
        for (i, b) in data.iter().enumerate() {
            unsafe { std::ptr::write_volatile(self.base.add(offset + i), *b) };
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

pub struct BdeDevice {
    log: slog::Logger,
    fd: libc::c_int,
}

impl BdeDevice {
    pub fn open(log: &slog::Logger, path: &str) -> AsicResult<Self> {
        let log = log.new(o!("device" => path.to_string()));
        let cpath = CString::new(path)
            .map_err(|_| AsicError::InvalidArg(format!("bad path: {path}")))?;
        let fd = unsafe {
            libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_SYNC)
        };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            return match err.kind() {
                std::io::ErrorKind::NotFound => Err(AsicError::AsicMissing),
                _ => Err(AsicError::io(format!("opening {path}"), err)),
            };
        }
        info!(log, "opened bde device");
        Ok(BdeDevice { log, fd })
    }

    fn ioctl<T>(&self, req: u32, arg: &mut T, what: &str) -> AsicResult<()> {
        let rval =
            unsafe { libc::ioctl(self.fd, req as _, arg as *mut T) };
        if rval < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ETIMEDOUT) {
                return Err(AsicError::Timeout {
                    op: what.to_string(),
                    after_ms: 500,
                });
            }
            return Err(AsicError::io(what, err));
        }
        Ok(())
    }
}

impl Drop for BdeDevice {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl Device for BdeDevice {
    fn name(&self) -> &str {
        "bde"
    }

    fn register_read(&self, offset: u32) -> AsicResult<u32> {
        aal::check_register(offset)?;
        let mut reg = BdeReg { offset, value: 0 };
        self.ioctl(READ_REG, &mut reg, "read_reg")?;
        Ok(reg.value)
    }

    fn register_write(&self, offset: u32, value: u32) -> AsicResult<()> {
        aal::check_register(offset)?;
        let mut reg = BdeReg { offset, value };
        self.ioctl(WRITE_REG, &mut reg, "write_reg")
    }

    fn dma_info(&self) -> AsicResult<DmaInfo> {
        let mut info = BdeDmaInfo::default();
        self.ioctl(GET_DMA_INFO, &mut info, "get_dma_info")?;
        Ok(DmaInfo {
            base: info.pbase,
            size: info.size as usize,
        })
    }

    fn map_dma_region(&self) -> AsicResult<Arc<dyn DmaMemory>> {
        let info = self.dma_info()?;
        if info.size == 0 {
            return Err(AsicError::Uninitialized("empty dma pool".into()));
        }
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                info.size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(AsicError::io(
                "mapping dma pool",
                std::io::Error::last_os_error(),
            ));
        }
        debug!(self.log, "mapped dma pool";
            "bus" => format!("{:#x}", info.base), "size" => info.size);
        Ok(Arc::new(BdeDma {
            base: base as *mut u8,
            size: info.size,
        }))
    }

    fn run_command(&self, cmd: &[u32], data: &mut [u32]) -> AsicResult<u32> {
        aal::check_command(cmd, data)?;
        let mut op = BdeSchan {
            len: cmd.len() as i32,
            status: -1,
            ..Default::default()
        };
        op.cmd[..cmd.len()].copy_from_slice(cmd);
        op.data[..data.len()].copy_from_slice(data);
        self.ioctl(SCHAN_OP, &mut op, "schan_op")?;
        data.copy_from_slice(&op.data[..data.len()]);
        Ok(op.status as u32)
    }
}
