// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Main entry point for `switchd`, the control plane for a Trident+ switch.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use futures::stream::StreamExt;
use libc::c_int;
use signal_hook::consts::SIGHUP;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGQUIT;
use signal_hook::consts::SIGTERM;
use signal_hook_tokio::Signals;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use structopt::StructOpt;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::l2::L2Data;
use crate::l3::L3Data;
use crate::pktio::{PktIo, RxPacket};
use crate::ports::{LinkPoller, PortData};
use crate::schan::{Schan, SchanMode};
use crate::tap::PortTaps;
use crate::vlan::VlanData;
use aal::PortUpdate;
use common::network::MacAddr;
use common::ports::PortId;
use types::*;

mod config;
mod counters;
mod ecmp;
mod freemap;
mod idmap;
mod l2;
mod l3;
mod pktio;
mod ports;
mod route;
mod schan;
mod soc;
mod sync;
mod table;
mod tap;
mod types;
mod vlan;

#[derive(Debug, Default, StructOpt)]
#[structopt(name = "switchd", about = "control plane for a trident+ switch")]
pub(crate) struct Opt {
    #[structopt(long, short = "c", help = "TOML file of daemon settings")]
    config: Option<String>,

    #[structopt(
        long,
        about = "send log data to the named file rather than stdout"
    )]
    log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        about = "log format",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: Option<common::logging::LogFormat>,

    #[structopt(
        long,
        help = "run against an emulated asic, injecting the faults described in this file"
    )]
    chaos_config: Option<String>,

    #[structopt(long, help = "path to the switch's character device")]
    device_path: Option<String>,

    #[structopt(
        long,
        help = "carry s-channel commands by 'dma' or through the 'kernel'"
    )]
    schan_mode: Option<SchanMode>,

    #[structopt(
        long,
        help = "prefix naming front-panel interfaces, as in 'swp1'"
    )]
    port_prefix: Option<String>,

    #[structopt(long, help = "number of front-panel ports")]
    num_ports: Option<u8>,

    #[structopt(
        long,
        help = "set the base mac address for the port interfaces",
        parse(try_from_str)
    )]
    mac_base: Option<MacAddr>,

    #[structopt(long, help = "ports.conf file giving each port's speed")]
    port_config: Option<String>,

    #[structopt(long, help = "rc.soc script to run at startup")]
    soc_script: Option<String>,

    #[structopt(long, help = "set up the packet dma rings")]
    pktio: bool,

    #[structopt(
        long,
        help = "create a tap interface for each port (requires --pktio)"
    )]
    tap: bool,
}

/// The main context object for running `switchd`.
pub struct Switch {
    // Time this object was created.
    start_time: chrono::DateTime<chrono::Utc>,
    pub config: Config,
    pub log: slog::Logger,
    pub asic_hdl: asic::Handle,
    pub schan: Schan,
    pub l2: Mutex<L2Data>,
    pub l3: Mutex<L3Data>,
    pub vlans: Mutex<VlanData>,
    pub ports: Mutex<PortData>,
    pub pktio: Option<PktIo>,
    pub link_poller: LinkPoller,
}

impl Switch {
    fn new(log: slog::Logger, config: Config) -> SwdResult<Self> {
        let asic_hdl = asic::open(&log, &config.asic_config)?;
        Self::with_device(log, config, asic_hdl)
    }

    fn with_device(
        log: slog::Logger,
        config: Config,
        asic_hdl: asic::Handle,
    ) -> SwdResult<Self> {
        let start_time = chrono::Utc::now();
        let schan = Schan::new(&log, asic_hdl.clone(), &config.schan())?;
        let pktio = if config.pktio {
            Some(PktIo::new(&log, &asic_hdl)?)
        } else {
            None
        };
        info!(log, "opened switch"; "device" => asic_hdl.name());

        Ok(Switch {
            start_time,
            l3: Mutex::new(L3Data::new(&log)),
            l2: Mutex::new(L2Data::new()),
            vlans: Mutex::new(VlanData::new()),
            ports: Mutex::new(PortData::new()),
            link_poller: LinkPoller::default(),
            config,
            log,
            asic_hdl,
            schan,
            pktio,
        })
    }

    /// Ensure a port exists on this board.
    pub fn check_port(&self, port: PortId) -> SwdResult<()> {
        if port.as_u8() > self.config.num_ports {
            Err(SwdError::Invalid(format!(
                "port {port} is beyond the {} ports on this switch",
                self.config.num_ports
            )))
        } else {
            Ok(())
        }
    }
}

// Run the bring-up script and apply the port configuration, then trap
// BPDUs to the CPU.
fn init_switch(switch: &Switch) -> anyhow::Result<()> {
    if let Some(path) = &switch.config.soc_script {
        debug!(switch.log, "running soc script"; "file" => path);
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading soc script {path}"))?;
        soc::run_script(switch, &text)
            .with_context(|| format!("running soc script {path}"))?;
    }

    if let Some(path) = &switch.config.port_config {
        debug!(switch.log, "reading port config"; "file" => path);
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading port config {path}"))?;
        let speeds = config::parse_ports(&text)
            .with_context(|| format!("parsing port config {path}"))?;
        for (port, speed) in speeds {
            if let Err(e) = ports::speed_set(switch, port, speed) {
                warn!(switch.log, "failed to set port speed";
                    "port" => %port, "speed" => %speed, "error" => %e);
            }
        }
    }

    l2::user_bpdu_add(switch).context("failed to install bpdu trap")?;
    Ok(())
}

async fn handle_port_updates(
    log: slog::Logger,
    mut rx: mpsc::UnboundedReceiver<PortUpdate>,
    taps: Option<Arc<PortTaps>>,
) {
    while let Some(update) = rx.recv().await {
        let PortUpdate::LinkUp { port, linkup } = update;
        info!(log, "link state changed"; "port" => %port, "up" => linkup);
        if let Some(taps) = &taps {
            if let Err(e) = taps.link_changed(&update) {
                warn!(log, "failed to update tap carrier";
                    "port" => %port, "error" => %e);
            }
        }
    }
}

async fn log_packets(
    log: slog::Logger,
    mut rx: mpsc::UnboundedReceiver<RxPacket>,
) {
    while let Some(pkt) = rx.recv().await {
        debug!(log, "received packet";
            "port" => pkt.port, "len" => pkt.data.len());
    }
}

async fn handle_signals(switch: &Switch, mut signals: Signals) {
    let log = switch.log.new(slog::o!("unit" => "signal_handler"));
    let handle = signals.handle();

    while let Some(signal) = signals.next().await {
        match signal {
            SIGTERM | SIGQUIT | SIGINT | SIGHUP => {
                info!(log, "received signal"; "sig" => signal);
                handle.close();
                return;
            }
            _ => unreachable!(),
        }
    }
}

// Start the kernel event source and the synchronizer that consumes it.
fn start_sync(switch: &Arc<Switch>) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            sync::netlink::start(&switch.log, tx)
                .context("failed to start netlink listener")?;
        } else {
            warn!(switch.log, "no kernel event source on this platform");
            drop(tx);
        }
    }
    let synchronizer = sync::Synchronizer::new(&switch.log, &switch.config);
    tokio::task::spawn(synchronizer.run(switch.clone(), rx));
    Ok(())
}

async fn switch_main(switch: Switch) -> anyhow::Result<()> {
    init_switch(&switch)?;
    let switch = Arc::new(switch);

    // The synchronizer is listening before the taps appear, so it sees
    // each of them come up.
    start_sync(&switch)?;

    let taps = if switch.config.tap {
        let taps = PortTaps::create(
            &switch.log,
            &switch.config.port_prefix,
            switch.config.num_ports,
        )
        .context("failed to create port interfaces")?;
        Some(Arc::new(taps))
    } else {
        None
    };

    let (port_tx, port_rx) = mpsc::unbounded_channel();
    let log = switch.log.new(slog::o!("unit" => "ports"));
    tokio::task::spawn(handle_port_updates(log, port_rx, taps.clone()));
    switch.link_poller.run(switch.clone(), port_tx)?;

    let mut tap_tasks = Vec::new();
    if switch.pktio.is_some() {
        let (pkt_tx, pkt_rx) = mpsc::unbounded_channel();
        match &taps {
            Some(taps) => {
                tokio::task::spawn(tap::rx_task(taps.clone(), pkt_rx));
                tap_tasks = taps.run_tx(&switch);
            }
            None => {
                let log = switch.log.new(slog::o!("unit" => "pktio"));
                tokio::task::spawn(log_packets(log, pkt_rx));
            }
        }
        pktio::run_rx(switch.clone(), pkt_tx)
            .context("failed to start packet rx")?;
    }

    const SIGNALS: &[c_int] = &[SIGTERM, SIGQUIT, SIGINT, SIGHUP];
    let signals =
        Signals::new(SIGNALS).context("failed to register signal handlers")?;
    handle_signals(&switch, signals).await;

    info!(switch.log, "shutting down switch driver";
        "uptime_secs" => (chrono::Utc::now() - switch.start_time).num_seconds());
    switch.link_poller.quit();
    if let Some(pktio) = &switch.pktio {
        pktio.quit();
    }
    for task in tap_tasks {
        task.abort();
    }

    info!(switch.log, "done");
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    let config = config::build_config(&opt)?;

    let log =
        common::logging::init("switchd", &config.log_file, config.log_format)?;
    info!(log, "switchd config: {config:#?}");

    let switch = match Switch::new(log.clone(), config) {
        Ok(s) => s,
        Err(e) => {
            error!(log, "failed to initialize switch"; "error" => %e);
            return Err(e.into());
        }
    };
    switch_main(switch).await
}

#[cfg(test)]
pub(crate) fn test_log() -> slog::Logger {
    use slog::Drain;
    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Build a switch over the emulated ASIC, with a short transport timeout so
/// that tests of stalled commands finish quickly.
#[cfg(test)]
pub(crate) fn test_switch_with(
    mut config: Config,
) -> (Switch, Arc<asic::stub::StubDevice>) {
    config.schan_timeout_ms = 20;
    config.schan_poll_us = 1000;
    let log = test_log();
    let stub = Arc::new(asic::stub::StubDevice::new(
        &log,
        &asic::stub::StubConfig::default(),
    ));
    let hdl: asic::Handle = stub.clone();
    let switch = Switch::with_device(log, config, hdl).unwrap();
    (switch, stub)
}

#[cfg(test)]
pub(crate) fn test_switch() -> (Switch, Arc<asic::stub::StubDevice>) {
    test_switch_with(Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_port() -> anyhow::Result<()> {
        let config = Config {
            num_ports: 48,
            ..Default::default()
        };
        let (switch, _) = test_switch_with(config);
        switch.check_port(PortId::new(48)?)?;
        assert!(matches!(
            switch.check_port(PortId::new(49)?),
            Err(SwdError::Invalid(_))
        ));
        Ok(())
    }

    #[test]
    fn test_init_switch() -> anyhow::Result<()> {
        let dir = std::env::temp_dir();
        let soc = dir.join(format!("switchd-rc-{}.soc", std::process::id()));
        let conf = dir.join(format!("switchd-ports-{}.conf", std::process::id()));
        std::fs::write(&soc, "setreg 0x200 0x7\n")?;
        std::fs::write(&conf, "3=10G\n4=40G\n")?;

        let config = Config {
            soc_script: Some(soc.display().to_string()),
            port_config: Some(conf.display().to_string()),
            ..Default::default()
        };
        let (switch, stub) = test_switch_with(config);
        let result = init_switch(&switch);
        std::fs::remove_file(&soc)?;
        std::fs::remove_file(&conf)?;
        result?;

        use aal::Device;
        assert_eq!(stub.register_read(0x200)?, 7);
        // The unsupported speed on port 4 is logged, not fatal
        assert_eq!(
            ports::speed_get(&switch, PortId::new(3)?)?,
            common::ports::PortSpeed::Speed10G
        );

        let t = table::l2_user::TABLE;
        let bpdu = table::l2_user::decode(&stub.memory(t.address(0), t.words));
        assert!(bpdu.is_some_and(|e| e.bpdu && e.copy_to_cpu));
        Ok(())
    }
}
