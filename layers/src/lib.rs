//! Protocol Stack Layers Library
//!
//! This crate implements the 5G protocol stack layers according to 3GPP
//! Release 16. The RLC layer (TS 38.322) is the current scope.

pub mod rlc;

use thiserror::Error;

/// Common errors for protocol layers
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LayerError {
    #[error("Malformed PDU: {0}")]
    MalformedPdu(String),

    #[error("Invalid SDU: {0}")]
    InvalidSdu(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}
