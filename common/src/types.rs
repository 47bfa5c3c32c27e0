//! Common Types for the Protocol Stack
//!
//! Defines fundamental identifiers used throughout the protocol stack

use serde::{Deserialize, Serialize};

/// Logical Channel ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LcId(pub u8);

impl LcId {
    /// Maximum valid LCID value for DRBs (TS 38.321)
    pub const MAX: u8 = 32;

    /// Create a new LCID with validation
    pub fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Get the LCID value
    pub fn value(&self) -> u8 {
        self.0
    }
}
