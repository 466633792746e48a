// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;
use slog::Drain;

/// How log records are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line, human readable records
    Human,
    /// Bunyan-style JSON records
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            x => Err(format!("invalid log format: {x}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogFormat::Human => write!(f, "human"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

fn async_drain<W>(
    name: &'static str,
    w: W,
    log_format: LogFormat,
) -> slog_async::Async
where
    W: Write + Send + 'static,
{
    match log_format {
        LogFormat::Human => {
            let decorator = slog_term::PlainDecorator::new(w);
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            slog_async::Async::new(drain).chan_size(0x2000).build()
        }
        LogFormat::Json => {
            let drain = slog_bunyan::with_name(name, w).build().fuse();
            slog_async::Async::new(drain).chan_size(0x2000).build()
        }
    }
}

/// Build the root logger for a daemon.  Records go to `log_file` if one is
/// provided, and to stdout otherwise.
pub fn init(
    name: &'static str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let drain = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            async_drain(name, file, log_format)
        }
        None => async_drain(name, std::io::stdout(), log_format),
    };

    Ok(slog::Logger::root(drain.fuse(), slog::o!("name" => name)))
}
