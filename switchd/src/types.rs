// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout switchd.

use std::convert;

use aal::AsicError;
use common::network::VlanError;
use common::ports::PortError;

pub type SwdResult<T> = Result<T, SwdError>;

#[derive(Debug, thiserror::Error)]
pub enum SwdError {
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("ASIC error: {0}")]
    Switch(AsicError),
    #[error("Resource is busy: {0}")]
    Busy(String),
    #[error("Resource is missing: {0}")]
    Missing(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("Table {0} is full")]
    TableFull(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Neighbor {0} is unresolved")]
    Unresolved(String),
    #[error("Error: {0}")]
    Other(String),
}

impl SwdError {
    /// Did the transport give up waiting for the ASIC?
    pub fn is_timeout(&self) -> bool {
        matches!(self, SwdError::Switch(AsicError::Timeout { .. }))
    }
}

impl convert::From<std::io::Error> for SwdError {
    fn from(err: std::io::Error) -> Self {
        SwdError::Io(err)
    }
}

impl convert::From<AsicError> for SwdError {
    fn from(err: AsicError) -> Self {
        match err {
            AsicError::InvalidArg(e) => SwdError::Invalid(e),
            AsicError::OperationUnsupported => {
                SwdError::Unsupported("operation unsupported by the asic".into())
            }
            e => SwdError::Switch(e),
        }
    }
}

impl convert::From<VlanError> for SwdError {
    fn from(err: VlanError) -> Self {
        SwdError::Invalid(err.to_string())
    }
}

impl convert::From<PortError> for SwdError {
    fn from(err: PortError) -> Self {
        SwdError::Invalid(err.to_string())
    }
}

impl convert::From<String> for SwdError {
    fn from(err: String) -> Self {
        SwdError::Other(err)
    }
}

impl convert::From<&str> for SwdError {
    fn from(err: &str) -> Self {
        SwdError::Other(err.to_string())
    }
}

impl convert::From<anyhow::Error> for SwdError {
    fn from(err: anyhow::Error) -> Self {
        SwdError::Other(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asic_mapping() {
        let e: SwdError = AsicError::InvalidArg("x".into()).into();
        assert!(matches!(e, SwdError::Invalid(_)));

        let e: SwdError = AsicError::OperationUnsupported.into();
        assert!(matches!(e, SwdError::Unsupported(_)));

        let e: SwdError = AsicError::Timeout {
            op: "schan".into(),
            after_ms: 500,
        }
        .into();
        assert!(e.is_timeout());

        let e: SwdError = AsicError::CommandFailed { status: 3 }.into();
        assert!(!e.is_timeout());
        assert!(matches!(e, SwdError::Switch(_)));
    }
}
