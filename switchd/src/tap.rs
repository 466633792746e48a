// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Kernel TAP interfaces standing in for the front-panel ports.
//!
//! Each port gets a TAP named `<prefix><N>`.  Frames the ASIC punts to the CPU
//! are written to the port's TAP, and frames the kernel sends on a TAP are
//! transmitted out of its port.  The polled link state of each port is shown
//! as the carrier of its TAP.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use slog::{debug, error, info, o, trace, warn};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use crate::pktio::{self, RxPacket};
use crate::types::{SwdError, SwdResult};
use crate::Switch;
use aal::PortUpdate;
use common::ports::PortId;

const TUN_DEVICE: &str = "/dev/net/tun";
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUN_MAGIC: u32 = b'T' as u32;

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
    } else {
        const IOC_SIZEBITS: u32 = 14;
        const IOC_WRITE: u32 = 1;
    }
}

const fn iow(nr: u32, size: usize) -> u32 {
    (IOC_WRITE << (16 + IOC_SIZEBITS))
        | ((size as u32) << 16)
        | (TUN_MAGIC << 8)
        | nr
}

const TUNSETIFF: u32 = iow(202, std::mem::size_of::<libc::c_int>());
const TUNSETCARRIER: u32 = iow(226, std::mem::size_of::<libc::c_int>());

// The name and flags arms of the kernel's struct ifreq, padded out to its
// full size.
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> SwdResult<Self> {
        let bad_byte = |b: u8| b == 0 || b == b'/' || b.is_ascii_whitespace();
        if name.is_empty()
            || name.len() >= libc::IFNAMSIZ
            || name.bytes().any(bad_byte)
        {
            return Err(SwdError::Invalid(format!(
                "bad interface name: {name:?}"
            )));
        }
        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        Ok(req)
    }
}

// Captures errno before the description is formatted
fn last_error(what: std::fmt::Arguments) -> SwdError {
    let e = io::Error::last_os_error();
    SwdError::Io(io::Error::new(e.kind(), format!("{what}: {e}")))
}

fn set_nonblocking(fd: RawFd) -> SwdResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0
        || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }
            < 0
    {
        return Err(last_error(format_args!("setting O_NONBLOCK")));
    }
    Ok(())
}

/// One port's TAP interface
pub struct Tap {
    name: String,
    port: PortId,
    fd: AsyncFd<OwnedFd>,
}

impl Tap {
    /// Create (or attach to) the TAP interface `name` for `port`.
    pub fn create(name: &str, port: PortId) -> SwdResult<Self> {
        if !cfg!(target_os = "linux") {
            return Err(SwdError::Unsupported(
                "tap interfaces are only available on linux".into(),
            ));
        }
        let mut req = IfReq::new(name, IFF_TAP | IFF_NO_PI)?;
        let path = CString::new(TUN_DEVICE)
            .map_err(|_| SwdError::Invalid(TUN_DEVICE.to_string()))?;
        let raw = unsafe {
            libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC)
        };
        if raw < 0 {
            return Err(last_error(format_args!("{TUN_DEVICE}")));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let rval = unsafe {
            libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq)
        };
        if rval < 0 {
            return Err(last_error(format_args!("creating tap {name}")));
        }
        Self::from_fd(name, port, fd)
    }

    /// Wrap an already-open descriptor that carries one frame per read and
    /// write.
    pub fn from_fd(name: &str, port: PortId, fd: OwnedFd) -> SwdResult<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Tap {
            name: name.to_string(),
            port,
            fd: AsyncFd::new(fd)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    /// Wait for the kernel to send a frame, returning its length.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|fd| {
                let n = unsafe {
                    libc::read(
                        fd.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            if let Ok(result) = result {
                return result;
            }
        }
    }

    /// Hand a frame to the kernel.
    pub async fn send(&self, frame: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|fd| {
                let n = unsafe {
                    libc::write(
                        fd.get_ref().as_raw_fd(),
                        frame.as_ptr() as *const libc::c_void,
                        frame.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            if let Ok(result) = result {
                return result;
            }
        }
    }

    /// Raise or drop the interface's carrier.
    pub fn set_carrier(&self, up: bool) -> SwdResult<()> {
        let carrier: libc::c_int = up.into();
        let rval = unsafe {
            libc::ioctl(
                self.fd.get_ref().as_raw_fd(),
                TUNSETCARRIER as _,
                &carrier as *const libc::c_int,
            )
        };
        if rval < 0 {
            let name = &self.name;
            return Err(last_error(format_args!("setting carrier on {name}")));
        }
        Ok(())
    }
}

/// The TAP interfaces of all front-panel ports
pub struct PortTaps {
    log: slog::Logger,
    taps: BTreeMap<PortId, Arc<Tap>>,
}

impl PortTaps {
    /// Create a TAP for each of the first `num_ports` ports.
    pub fn create(
        log: &slog::Logger,
        prefix: &str,
        num_ports: u8,
    ) -> SwdResult<Self> {
        let taps = PortId::all(num_ports)
            .map(|port| Tap::create(&port.ifname(prefix), port))
            .collect::<SwdResult<Vec<_>>>()?;
        let taps = Self::new(log, taps);
        info!(taps.log, "created port interfaces"; "count" => taps.taps.len());
        Ok(taps)
    }

    pub fn new(log: &slog::Logger, taps: Vec<Tap>) -> Self {
        PortTaps {
            log: log.new(o!("unit" => "tap")),
            taps: taps.into_iter().map(|t| (t.port, Arc::new(t))).collect(),
        }
    }

    pub fn get(&self, port: PortId) -> Option<&Arc<Tap>> {
        self.taps.get(&port)
    }

    /// Show a link state change on the port's TAP.  Ports without a TAP are
    /// ignored.
    pub fn link_changed(&self, update: &PortUpdate) -> SwdResult<()> {
        let PortUpdate::LinkUp { port, linkup } = *update;
        match self.taps.get(&port) {
            Some(tap) => {
                debug!(self.log, "setting carrier";
                    "tap" => tap.name(), "up" => linkup);
                tap.set_carrier(linkup)
            }
            None => Ok(()),
        }
    }

    /// Start a task per port, transmitting whatever the kernel sends on the
    /// port's TAP.
    pub fn run_tx(
        &self,
        switch: &Arc<Switch>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        self.taps
            .values()
            .map(|tap| {
                let log = self.log.new(o!("tap" => tap.name().to_string()));
                tokio::task::spawn(tx_task(log, switch.clone(), tap.clone()))
            })
            .collect()
    }
}

// Frames are capped by the transmit buffer, but read with room to spare so
// that an oversized frame is rejected rather than silently truncated.
const TAP_READ_MAX: usize = 65536;

async fn tx_task(log: slog::Logger, switch: Arc<Switch>, tap: Arc<Tap>) {
    let mut buf = vec![0u8; TAP_READ_MAX];
    loop {
        let len = match tap.recv(&mut buf).await {
            Ok(0) => continue,
            Ok(len) => len,
            Err(e) => {
                error!(log, "tap read failed"; "error" => %e);
                return;
            }
        };
        let frame = &buf[..len];
        // The transmit may block on the transport
        let result = tokio::task::block_in_place(|| {
            pktio::tx(&switch, tap.port(), frame)
        });
        match result {
            Ok(()) => trace!(log, "tx"; "len" => len),
            Err(e) => debug!(log, "dropped frame"; "len" => len, "error" => %e),
        }
    }
}

/// Deliver each frame received from the ASIC to its source port's TAP.
/// Frames from ports without a TAP are dropped.
pub async fn rx_task(
    taps: Arc<PortTaps>,
    mut rx: mpsc::UnboundedReceiver<RxPacket>,
) {
    while let Some(pkt) = rx.recv().await {
        let Some(tap) = PortId::new(pkt.port).ok().and_then(|p| taps.get(p))
        else {
            trace!(taps.log, "no tap for packet";
                "port" => pkt.port, "len" => pkt.data.len());
            continue;
        };
        if let Err(e) = tap.send(&pkt.data).await {
            // Writes fail while the interface is down
            debug!(taps.log, "tap write failed";
                "tap" => tap.name(), "error" => %e);
        }
    }
    warn!(taps.log, "packet rx channel closed");
}
