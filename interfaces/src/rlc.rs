//! RLC Interface Contracts
//!
//! The RLC entity pulls its collaborators through these traits: the upper
//! layer (PDCP/RRC) receives reassembled SDUs and delivery/failure events,
//! and an optional capture sink observes every PDU on the wire. The
//! downward (MAC-facing) contract is pull-based and lives on the entity
//! itself: `get_buffer_state`, `read_pdu`, `write_pdu`.

use bytes::Bytes;
use common::types::LcId;

/// Upward interface towards the SDU-producing layer.
///
/// Callbacks are invoked from inside RLC entity operations and must not
/// block or call back into the entity.
pub trait RlcUpperLayer: Send + Sync {
    /// A fully reassembled SDU, delivered in sequence order
    fn deliver_sdu(&self, lcid: LcId, sdu: Bytes);

    /// The SDU carrying this delivery tag has been acknowledged by the peer
    fn notify_sent(&self, lcid: LcId, delivery_tag: u32);

    /// Reassembly of the SDU with this sequence number was abandoned
    fn notify_lost(&self, lcid: LcId, sn: u32);

    /// A segment exceeded the retransmission threshold; the link is
    /// considered broken
    fn on_link_failure(&self, lcid: LcId);
}

/// Per-PDU trace/capture hook.
pub trait PduCapture: Send + Sync {
    /// A PDU emitted towards the peer
    fn write_dl_pdu(&self, lcid: LcId, pdu: &[u8]);

    /// A PDU received from the peer
    fn write_ul_pdu(&self, lcid: LcId, pdu: &[u8]);
}

/// Capture sink that drops everything.
#[derive(Debug, Default)]
pub struct NullCapture;

impl PduCapture for NullCapture {
    fn write_dl_pdu(&self, _lcid: LcId, _pdu: &[u8]) {}
    fn write_ul_pdu(&self, _lcid: LcId, _pdu: &[u8]) {}
}
