// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Board bring-up scripts (`rc.soc`).  Each line is one of:
//!
//! ```text
//! setreg <offset> <value>
//! getreg <offset>
//! rcload <path>
//! ```
//!
//! Numbers may be hex (with a `0x` prefix) or decimal.  `#` starts a
//! comment.  `rcload` lines name a nested script, which we don't follow.

use slog::{debug, error, info, o};

use crate::types::{SwdError, SwdResult};
use crate::Switch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocCommand {
    SetReg { offset: u32, value: u32 },
    GetReg { offset: u32 },
    RcLoad,
}

fn parse_number(line: usize, s: &str) -> SwdResult<u32> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| SwdError::Invalid(format!("line {line}: bad number {s:?}")))
}

/// Parse a script, returning each command with its 1-based line number.
pub fn parse_script(text: &str) -> SwdResult<Vec<(usize, SocCommand)>> {
    let mut cmds = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let body = raw.split('#').next().unwrap_or("");
        let words: Vec<&str> = body.split_whitespace().collect();
        let cmd = match words.as_slice() {
            [] => continue,
            ["setreg", offset, value] => SocCommand::SetReg {
                offset: parse_number(line, offset)?,
                value: parse_number(line, value)?,
            },
            ["getreg", offset] => SocCommand::GetReg {
                offset: parse_number(line, offset)?,
            },
            ["rcload", _] => SocCommand::RcLoad,
            [cmd @ ("setreg" | "getreg" | "rcload"), ..] => {
                return Err(SwdError::Invalid(format!(
                    "line {line}: wrong number of arguments to {cmd}"
                )))
            }
            [cmd, ..] => {
                return Err(SwdError::Invalid(format!(
                    "line {line}: unknown command {cmd:?}"
                )))
            }
        };
        cmds.push((line, cmd));
    }
    Ok(cmds)
}

/// Run a script against the device's registers.  The whole script is parsed
/// before any register is touched.  Returns the `(offset, value)` pairs read
/// by `getreg` lines.
pub fn run_script(switch: &Switch, text: &str) -> SwdResult<Vec<(u32, u32)>> {
    let log = switch.log.new(o!("unit" => "soc"));
    let cmds = parse_script(text)?;
    let mut reads = Vec::new();

    for (line, cmd) in cmds {
        let result = match cmd {
            SocCommand::SetReg { offset, value } => {
                debug!(log, "setreg";
                    "offset" => format!("{offset:#x}"),
                    "value" => format!("{value:#x}"));
                switch.asic_hdl.register_write(offset, value)
            }
            SocCommand::GetReg { offset } => {
                switch.asic_hdl.register_read(offset).map(|value| {
                    info!(log, "getreg";
                        "offset" => format!("{offset:#x}"),
                        "value" => format!("{value:#x}"));
                    reads.push((offset, value));
                })
            }
            SocCommand::RcLoad => {
                debug!(log, "skipping rcload"; "line" => line);
                Ok(())
            }
        };
        if let Err(e) = result {
            error!(log, "soc script failed"; "line" => line, "error" => %e);
            return Err(e.into());
        }
    }
    Ok(reads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aal::Device;

    #[test]
    fn test_parse() -> anyhow::Result<()> {
        let text = "\
# bring-up
setreg 0x1000 0xdeadbeef

  getreg 4096   # trailing comment
rcload rc.datapath_0
";
        assert_eq!(
            parse_script(text)?,
            vec![
                (
                    2,
                    SocCommand::SetReg {
                        offset: 0x1000,
                        value: 0xdead_beef
                    }
                ),
                (4, SocCommand::GetReg { offset: 0x1000 }),
                (5, SocCommand::RcLoad),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_parse_errors() {
        let err = parse_script("setreg 0x10 1\nm L2X 0\n").unwrap_err();
        assert!(matches!(&err, SwdError::Invalid(m) if m.contains("line 2")));

        let err = parse_script("\n\nsetreg 0x10\n").unwrap_err();
        assert!(matches!(&err, SwdError::Invalid(m) if m.contains("line 3")));

        let err = parse_script("getreg 0xzz\n").unwrap_err();
        assert!(matches!(&err, SwdError::Invalid(m) if m.contains("line 1")));
    }

    #[test]
    fn test_run() -> anyhow::Result<()> {
        let (switch, stub) = crate::test_switch();
        let reads = run_script(
            &switch,
            "setreg 0x100 0x55\nsetreg 0x104 7\ngetreg 0x100\ngetreg 0x108\n",
        )?;
        assert_eq!(reads, vec![(0x100, 0x55), (0x108, 0)]);
        assert_eq!(stub.register_read(0x104)?, 7);
        Ok(())
    }

    #[test]
    fn test_run_bad_script() -> anyhow::Result<()> {
        let (switch, stub) = crate::test_switch();

        // Nothing runs if any line is bad
        assert!(run_script(&switch, "setreg 0x100 1\nbogus\n").is_err());
        assert_eq!(stub.register_read(0x100)?, 0);

        // Offsets outside the register window are refused by the device
        assert!(run_script(&switch, "setreg 0x40000 1\n").is_err());
        Ok(())
    }
}
