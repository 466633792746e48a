// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Configuration for `switchd`.

use std::time::Duration;

use serde::Deserialize;

use crate::schan::{SchanConfig, SchanMode};
use crate::types::{SwdError, SwdResult};
use asic::AsicConfig;
use common::logging::LogFormat;
use common::network::MacAddr;
use common::ports::{PortId, PortSpeed, DEFAULT_PORT_PREFIX, PORT_COUNT};

/// The run-time settings for the daemon.  Each may come from the optional
/// TOML config file, and command-line options override the file.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// If set, where the log should be written.  If not set, the log goes to
    /// stdout.
    pub log_file: Option<String>,

    /// Output log info in unstructured text or json?
    pub log_format: LogFormat,

    /// Which backend drives the ASIC, and its settings
    pub asic_config: AsicConfig,

    pub schan_mode: SchanMode,
    pub schan_timeout_ms: u64,
    pub schan_poll_us: u64,
    /// Whether READ_MEMORY works on this board.  When it doesn't, link state
    /// is inferred from the admin state and counters are unavailable.
    pub schan_read_supported: bool,

    /// Kernel interfaces named `<port_prefix><N>` are front-panel port N.
    pub port_prefix: String,
    /// Number of front-panel ports on the board
    pub num_ports: u8,

    /// Base address for the L3 interface MACs.  Each port's interface takes
    /// this address with the last octet replaced by the port number.
    pub mac_base: MacAddr,

    pub link_poll_ms: u64,

    /// A `ports.conf` file, giving the speed of each port
    pub port_config: Option<String>,

    /// An `rc.soc` script to run at startup
    pub soc_script: Option<String>,

    /// Set up the packet DMA rings
    pub pktio: bool,

    /// Create a TAP interface for each port, carrying its punted traffic.
    /// Requires `pktio`.
    pub tap: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: None,
            log_format: LogFormat::Json,
            asic_config: AsicConfig::default(),
            schan_mode: SchanMode::Dma,
            schan_timeout_ms: 500,
            schan_poll_us: 1000,
            schan_read_supported: true,
            port_prefix: DEFAULT_PORT_PREFIX.to_string(),
            num_ports: PORT_COUNT,
            mac_base: MacAddr::new(0x02, 0, 0, 0, 0, 0),
            link_poll_ms: 200,
            port_config: None,
            soc_script: None,
            pktio: false,
            tap: false,
        }
    }
}

impl Config {
    /// The transport settings
    pub fn schan(&self) -> SchanConfig {
        SchanConfig {
            mode: self.schan_mode,
            timeout: Duration::from_millis(self.schan_timeout_ms),
            poll: Duration::from_micros(self.schan_poll_us),
            read_supported: self.schan_read_supported,
        }
    }

    fn validate(&self) -> SwdResult<()> {
        if self.num_ports == 0 || self.num_ports > PORT_COUNT {
            return Err(SwdError::Invalid(format!(
                "num_ports must be 1 to {PORT_COUNT}, not {}",
                self.num_ports
            )));
        }
        if self.port_prefix.is_empty() {
            return Err(SwdError::Invalid("port_prefix may not be empty".into()));
        }
        if self.tap && !self.pktio {
            return Err(SwdError::Invalid(
                "tap interfaces need pktio enabled".into(),
            ));
        }
        if self.schan_timeout_ms == 0 || self.link_poll_ms == 0 {
            return Err(SwdError::Invalid(
                "timeouts and poll intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// Use the command-line arguments to update the run-time config.
fn update_from_cli(opts: &crate::Opt, config: &mut Config) -> SwdResult<()> {
    if let Some(log_file) = &opts.log_file {
        config.log_file = Some(log_file.to_string());
    }

    if let Some(log_format) = opts.log_format {
        config.log_format = log_format;
    }

    if let Some(path) = &opts.chaos_config {
        let txt = std::fs::read_to_string(path)?;
        let chaos = toml::from_str(&txt)
            .map_err(|e| SwdError::Other(format!("{path}: {e}")))?;
        config.asic_config = AsicConfig::Chaos(chaos);
    }

    if let Some(path) = &opts.device_path {
        config.asic_config = AsicConfig::Bde(asic::BdeConfig {
            devpath: path.to_string(),
        });
    }

    if let Some(mode) = opts.schan_mode {
        config.schan_mode = mode;
    }

    if let Some(prefix) = &opts.port_prefix {
        config.port_prefix = prefix.to_string();
    }

    if let Some(n) = opts.num_ports {
        config.num_ports = n;
    }

    if let Some(mac_base) = opts.mac_base {
        config.mac_base = mac_base;
    }

    if let Some(port_config) = &opts.port_config {
        config.port_config = Some(port_config.to_string());
    }

    if let Some(soc_script) = &opts.soc_script {
        config.soc_script = Some(soc_script.to_string());
    }

    if opts.pktio {
        config.pktio = true;
    }

    if opts.tap {
        config.tap = true;
    }

    Ok(())
}

/// Build the daemon's config from the defaults, the optional config file, and
/// the command line, in that order of increasing precedence.
pub(crate) fn build_config(opts: &crate::Opt) -> SwdResult<Config> {
    let mut config = match &opts.config {
        Some(path) => {
            let txt = std::fs::read_to_string(path)?;
            toml::from_str(&txt)
                .map_err(|e| SwdError::Invalid(format!("{path}: {e}")))?
        }
        None => Config::default(),
    };
    update_from_cli(opts, &mut config)?;
    config.validate()?;
    Ok(config)
}

/// Parse a `ports.conf` file.  Each line has the form `N=<speed>`, and `#`
/// starts a comment.
pub fn parse_ports(text: &str) -> SwdResult<Vec<(PortId, PortSpeed)>> {
    let mut ports = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((port, speed)) = line.split_once('=') else {
            return Err(SwdError::Invalid(format!(
                "line {}: expected <port>=<speed>",
                idx + 1
            )));
        };
        let port: PortId = port
            .parse()
            .map_err(|e| SwdError::Invalid(format!("line {}: {e}", idx + 1)))?;
        let speed: PortSpeed = speed
            .parse()
            .map_err(|e| SwdError::Invalid(format!("line {}: {e}", idx + 1)))?;
        ports.push((port, speed));
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Opt;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.port_prefix, "swp");
        assert_eq!(c.num_ports, 52);
        assert_eq!(c.mac_base, MacAddr::new(2, 0, 0, 0, 0, 0));
        let s = c.schan();
        assert_eq!(s.mode, SchanMode::Dma);
        assert_eq!(s.timeout, Duration::from_millis(500));
        assert_eq!(s.poll, Duration::from_millis(1));
        assert!(s.read_supported);
    }

    #[test]
    fn test_updates() -> anyhow::Result<()> {
        let opts = Opt {
            log_file: Some("test.log".to_string()),
            port_prefix: Some("port".to_string()),
            mac_base: Some(MacAddr::new(0x0a, 0, 0, 0, 0, 0)),
            schan_mode: Some(SchanMode::Kernel),
            device_path: Some("/dev/bde0".to_string()),
            pktio: true,
            ..Opt::default()
        };
        let config = build_config(&opts)?;
        assert_eq!(config.log_file, Some("test.log".to_string()));
        assert_eq!(config.port_prefix, "port");
        assert_eq!(config.mac_base, MacAddr::new(0x0a, 0, 0, 0, 0, 0));
        assert_eq!(config.schan_mode, SchanMode::Kernel);
        assert!(config.pktio);
        match config.asic_config {
            AsicConfig::Bde(b) => assert_eq!(b.devpath, "/dev/bde0"),
            other => panic!("wrong backend: {other:?}"),
        }

        let opts = Opt {
            num_ports: Some(60),
            ..Opt::default()
        };
        assert!(matches!(build_config(&opts), Err(SwdError::Invalid(_))));

        let opts = Opt {
            tap: true,
            ..Opt::default()
        };
        assert!(matches!(build_config(&opts), Err(SwdError::Invalid(_))));
        let opts = Opt {
            tap: true,
            pktio: true,
            ..Opt::default()
        };
        assert!(build_config(&opts)?.tap);
        Ok(())
    }

    #[test]
    fn test_config_file() -> anyhow::Result<()> {
        let path = std::env::temp_dir()
            .join(format!("switchd-config-{}.toml", std::process::id()));
        let mut f = std::fs::File::create(&path)?;
        writeln!(
            f,
            r#"
log_format = "human"
schan_mode = "kernel"
schan_read_supported = false
num_ports = 48
mac_base = "02:aa:00:00:00:00"
link_poll_ms = 50

[asic_config]
backend = "chaos"
[asic_config.run_command]
value = 0.25
"#
        )?;
        drop(f);

        let opts = Opt {
            config: Some(path.display().to_string()),
            num_ports: Some(52),
            ..Opt::default()
        };
        let config = build_config(&opts);
        std::fs::remove_file(&path)?;
        let config = config?;

        assert_eq!(config.log_format, LogFormat::Human);
        assert_eq!(config.schan_mode, SchanMode::Kernel);
        assert!(!config.schan_read_supported);
        // The command line wins over the file
        assert_eq!(config.num_ports, 52);
        assert_eq!(config.mac_base, MacAddr::new(2, 0xaa, 0, 0, 0, 0));
        assert_eq!(config.link_poll_ms, 50);
        // Settings not in the file keep their defaults
        assert_eq!(config.port_prefix, "swp");
        match config.asic_config {
            AsicConfig::Chaos(c) => assert_eq!(c.run_command.get(), 0.25),
            other => panic!("wrong backend: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_bad_config_file() -> anyhow::Result<()> {
        let path = std::env::temp_dir()
            .join(format!("switchd-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "no_such_setting = 1\n")?;
        let opts = Opt {
            config: Some(path.display().to_string()),
            ..Opt::default()
        };
        let result = build_config(&opts);
        std::fs::remove_file(&path)?;
        assert!(matches!(result, Err(SwdError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn test_parse_ports() -> anyhow::Result<()> {
        let text = "\
# speed overrides
1=10G
49=40G   # uplink

2 = 1g
";
        let p = |n| PortId::new(n).unwrap();
        assert_eq!(
            parse_ports(text)?,
            vec![
                (p(1), PortSpeed::Speed10G),
                (p(49), PortSpeed::Speed40G),
                (p(2), PortSpeed::Speed1G),
            ]
        );

        for bad in ["1", "0=10G", "53=10G", "1=25G", "x=10G"] {
            assert!(
                matches!(parse_ports(bad), Err(SwdError::Invalid(_))),
                "{bad} should not parse"
            );
        }
        Ok(())
    }
}
