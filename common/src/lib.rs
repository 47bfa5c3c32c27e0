//! Common Utilities and Types Library
//!
//! This crate provides shared types and utilities used across the protocol
//! stack implementation.

pub mod timers;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use timers::{TimerManager, UniqueTimer};
pub use types::*;
pub use utils::*;
