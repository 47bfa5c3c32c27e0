//! Cross-Layer Interface Contracts
//!
//! Narrow trait contracts between protocol stack layers. Implementations
//! are injected at entity construction; no layer reaches for a global.

pub mod rlc;

pub use rlc::{NullCapture, PduCapture, RlcUpperLayer};
