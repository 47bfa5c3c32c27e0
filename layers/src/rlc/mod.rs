//! Radio Link Control (RLC) Layer Implementation
//!
//! Implements the 5G NR RLC layer according to 3GPP TS 38.322. The
//! acknowledged mode entity ([`am::AmEntity`]) carries the ARQ machinery:
//! segmentation, the transmit/receive windows, status reporting and the
//! protocol timers. Transparent mode is a queue-and-passthrough.
//!
//! The lower layer drives an entity pull-style: `get_buffer_state` for
//! scheduling, `read_pdu` with a byte budget on every transmission
//! opportunity, `write_pdu` for everything that arrives from the peer.

pub mod am;
pub mod pdu;
pub mod sn;
pub mod tm;

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use common::timers::TimerManager;
use common::types::LcId;
use interfaces::rlc::{PduCapture, RlcUpperLayer};

use crate::LayerError;
pub use sn::SnSize;

/// RLC operating modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlcMode {
    /// Transparent Mode
    Tm,
    /// Acknowledged Mode
    Am,
}

/// Upper-layer payload handed to the transmit side.
///
/// The payload is opaque and never modified; the optional delivery tag is
/// echoed upward via `notify_sent` once the peer has acknowledged the SDU.
#[derive(Debug, Clone)]
pub struct RlcSdu {
    /// Opaque payload
    pub payload: Bytes,
    /// Tag reported back on acknowledged delivery (e.g. a PDCP SN)
    pub delivery_tag: Option<u32>,
}

impl RlcSdu {
    /// SDU without a delivery tag
    pub fn new(payload: Bytes) -> Self {
        Self { payload, delivery_tag: None }
    }

    /// SDU carrying a delivery tag
    pub fn with_tag(payload: Bytes, tag: u32) -> Self {
        Self { payload, delivery_tag: Some(tag) }
    }
}

/// Behaviour when the pending-SDU queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Refuse the incoming SDU
    DropNewest,
    /// Evict the oldest queued SDU and accept the incoming one
    DropOldest,
}

/// Behaviour when t-Reassembly gives up on a partially received SDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReassemblyFailure {
    /// Discard the partial SDU
    Drop,
    /// Deliver the contiguous prefix that did arrive
    DeliverPartial,
}

/// AM entity configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlcAmConfig {
    /// SN field length
    pub sn_size: SnSize,
    /// t-PollRetransmit in ms
    pub t_poll_retransmit: u64,
    /// Poll after this many new-data PDUs
    pub poll_pdu: u32,
    /// Poll after this many new-data payload bytes
    pub poll_byte: u32,
    /// Retransmissions of one SN beyond which the link counts as broken
    pub max_retx_threshold: u32,
    /// t-Reassembly in ms
    pub t_reassembly: u64,
    /// t-StatusProhibit in ms
    pub t_status_prohibit: u64,
    /// Periodic status fallback in ms; keeps ACKs alive when every
    /// poll-bearing PDU is lost
    pub t_status_periodic: u64,
    /// Pending-SDU queue capacity
    pub tx_queue_capacity: usize,
    /// Queue-full behaviour
    pub overflow_policy: OverflowPolicy,
    /// Reassembly give-up behaviour
    pub reassembly_failure: ReassemblyFailure,
}

impl Default for RlcAmConfig {
    fn default() -> Self {
        Self {
            sn_size: SnSize::Size12,
            t_poll_retransmit: 45,
            poll_pdu: 4,
            poll_byte: 25_000,
            max_retx_threshold: 4,
            t_reassembly: 35,
            t_status_prohibit: 8,
            t_status_periodic: 160,
            tx_queue_capacity: 256,
            overflow_policy: OverflowPolicy::DropNewest,
            reassembly_failure: ReassemblyFailure::Drop,
        }
    }
}

impl RlcAmConfig {
    /// Validate the configuration at entity construction
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.poll_pdu == 0 || self.poll_byte == 0 {
            return Err(LayerError::InvalidConfiguration(
                "poll thresholds must be non-zero".into(),
            ));
        }
        if self.max_retx_threshold == 0 {
            return Err(LayerError::InvalidConfiguration(
                "max_retx_threshold must be non-zero".into(),
            ));
        }
        if self.tx_queue_capacity == 0 {
            return Err(LayerError::InvalidConfiguration(
                "tx_queue_capacity must be non-zero".into(),
            ));
        }
        if self.t_status_periodic == 0 {
            return Err(LayerError::InvalidConfiguration(
                "t_status_periodic must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Counter snapshot exposed through `get_metrics`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RlcMetrics {
    /// SDUs accepted from the upper layer
    pub tx_sdus: u64,
    /// Data PDUs handed to the lower layer (first transmissions and retx)
    pub tx_pdus: u64,
    /// Bytes handed to the lower layer in data PDUs
    pub tx_pdu_bytes: u64,
    /// Retransmitted data PDUs
    pub retx_pdus: u64,
    /// STATUS PDUs emitted
    pub status_pdus_tx: u64,
    /// SDUs dropped by the queue overflow policy
    pub queue_drops: u64,
    /// Data PDUs received from the peer
    pub rx_pdus: u64,
    /// Bytes received from the peer in data PDUs
    pub rx_pdu_bytes: u64,
    /// SDUs delivered upward
    pub rx_sdus: u64,
    /// SDUs abandoned on reassembly give-up
    pub lost_sdus: u64,
    /// Duplicate or out-of-window receptions discarded
    pub discarded_dupes: u64,
    /// Structurally invalid PDUs discarded
    pub malformed_pdus: u64,
    /// Valid-but-implausible PDUs discarded (stale ACK, overlap NACK, ...)
    pub protocol_violations: u64,
}

/// One RLC bearer: the closed set of mode variants behind a common
/// capability surface. AM-specific state never leaks out of the AM variant.
pub enum RlcEntity {
    /// Transparent mode bearer
    Tm(tm::TmEntity),
    /// Acknowledged mode bearer
    Am(am::AmEntity),
}

impl RlcEntity {
    /// Create a transparent mode bearer
    pub fn new_tm(lcid: LcId, upper: Arc<dyn RlcUpperLayer>) -> Self {
        RlcEntity::Tm(tm::TmEntity::new(lcid, upper))
    }

    /// Create an acknowledged mode bearer
    pub fn new_am(
        lcid: LcId,
        config: RlcAmConfig,
        upper: Arc<dyn RlcUpperLayer>,
        timers: &TimerManager,
        capture: Arc<dyn PduCapture>,
    ) -> Result<Self, LayerError> {
        Ok(RlcEntity::Am(am::AmEntity::new(lcid, config, upper, timers, capture)?))
    }

    /// Operating mode of this bearer
    pub fn mode(&self) -> RlcMode {
        match self {
            RlcEntity::Tm(_) => RlcMode::Tm,
            RlcEntity::Am(_) => RlcMode::Am,
        }
    }

    /// Submit an SDU for transmission
    pub fn write_sdu(&self, sdu: RlcSdu) -> Result<(), LayerError> {
        match self {
            RlcEntity::Tm(e) => e.write_sdu(sdu),
            RlcEntity::Am(e) => e.write_sdu(sdu),
        }
    }

    /// Pull the next PDU, at most `byte_budget` bytes
    pub fn read_pdu(&self, byte_budget: usize) -> Option<Bytes> {
        match self {
            RlcEntity::Tm(e) => e.read_pdu(byte_budget),
            RlcEntity::Am(e) => e.read_pdu(byte_budget),
        }
    }

    /// Hand over a PDU received from the peer
    pub fn write_pdu(&self, pdu: &[u8]) {
        match self {
            RlcEntity::Tm(e) => e.write_pdu(pdu),
            RlcEntity::Am(e) => e.write_pdu(pdu),
        }
    }

    /// Exact number of bytes pending towards the lower layer
    pub fn get_buffer_state(&self) -> usize {
        match self {
            RlcEntity::Tm(e) => e.get_buffer_state(),
            RlcEntity::Am(e) => e.get_buffer_state(),
        }
    }

    /// Process protocol timer expiries; call once per timer tick
    pub fn timer_tick(&self) {
        if let RlcEntity::Am(e) = self {
            e.timer_tick();
        }
    }

    /// Counter snapshot
    pub fn get_metrics(&self) -> RlcMetrics {
        match self {
            RlcEntity::Tm(e) => e.get_metrics(),
            RlcEntity::Am(e) => e.get_metrics(),
        }
    }

    /// Reset all protocol state, dropping everything in flight
    pub fn reestablish(&self) {
        match self {
            RlcEntity::Tm(e) => e.reestablish(),
            RlcEntity::Am(e) => e.reestablish(),
        }
    }

    /// Replace the configuration.
    ///
    /// Only valid while nothing is in flight; a live entity must be
    /// reestablished instead of patched.
    pub fn reconfigure(&self, config: RlcAmConfig) -> Result<(), LayerError> {
        match self {
            RlcEntity::Tm(_) => Err(LayerError::InvalidConfiguration(
                "transparent mode carries no AM configuration".into(),
            )),
            RlcEntity::Am(e) => e.reconfigure(config),
        }
    }
}
