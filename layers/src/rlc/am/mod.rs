//! RLC Acknowledged Mode Entity
//!
//! Couples the transmit and receive sides of one AM bearer. Received PDUs
//! are routed by the leading D/C bit: STATUS PDUs feed the transmit side's
//! acknowledgement processing, data PDUs enter the receive window. A due
//! status report is itself carried by `read_pdu`, ahead of any data, so
//! acknowledgements compete for (and consume) the lower layer's byte grant.
//!
//! Each direction sits behind its own mutex; operations lock one side at a
//! time and never nest, so calls arriving concurrently from the scheduler,
//! the receive path and the timer tick serialize without deadlock.

mod rx;
#[cfg(test)]
mod tests;
mod tx;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use common::timers::TimerManager;
use common::types::LcId;
use common::utils::bytes_to_hex;
use interfaces::rlc::{PduCapture, RlcUpperLayer};

use super::pdu::{decode_data_header, is_control_pdu, StatusReport};
use super::{RlcAmConfig, RlcMetrics, RlcSdu};
use crate::LayerError;

use rx::AmRx;
use tx::AmTx;

/// Acknowledged mode bearer
pub struct AmEntity {
    lcid: LcId,
    sn_size: super::SnSize,
    tx: Mutex<AmTx>,
    rx: Mutex<AmRx>,
    capture: Arc<dyn PduCapture>,
}

impl AmEntity {
    /// Create an AM bearer from a validated configuration
    pub fn new(
        lcid: LcId,
        config: RlcAmConfig,
        upper: Arc<dyn RlcUpperLayer>,
        timers: &TimerManager,
        capture: Arc<dyn PduCapture>,
    ) -> Result<Self, LayerError> {
        config.validate()?;
        info!(
            lcid = lcid.0,
            sn_bits = config.sn_size.bits(),
            "creating RLC AM entity"
        );
        Ok(Self {
            lcid,
            sn_size: config.sn_size,
            tx: Mutex::new(AmTx::new(lcid, config, upper.clone(), timers)),
            rx: Mutex::new(AmRx::new(lcid, config, upper, timers)),
            capture,
        })
    }

    /// Submit an SDU for reliable transmission
    pub fn write_sdu(&self, sdu: RlcSdu) -> Result<(), LayerError> {
        self.tx.lock().unwrap().write_sdu(sdu)
    }

    /// Pull the next PDU within `byte_budget`: a due status report first,
    /// then retransmissions, then new data
    pub fn read_pdu(&self, byte_budget: usize) -> Option<Bytes> {
        {
            let mut rx = self.rx.lock().unwrap();
            if rx.status_due() {
                if let Some(report) = rx.build_status(byte_budget) {
                    rx.on_status_sent();
                    drop(rx);
                    let encoded = report.encode(self.sn_size);
                    debug!(
                        lcid = self.lcid.0,
                        ack_sn = report.ack_sn,
                        nacks = report.nacks.len(),
                        "sending status report"
                    );
                    self.capture.write_dl_pdu(self.lcid, &encoded);
                    return Some(encoded);
                }
            }
        }
        let pdu = self.tx.lock().unwrap().read_pdu(byte_budget)?;
        self.capture.write_dl_pdu(self.lcid, &pdu);
        Some(pdu)
    }

    /// Route a PDU received from the peer by its D/C bit
    pub fn write_pdu(&self, pdu: &[u8]) {
        trace!(lcid = self.lcid.0, pdu = %bytes_to_hex(pdu), "PDU received");
        self.capture.write_ul_pdu(self.lcid, pdu);
        if is_control_pdu(pdu) {
            match StatusReport::decode(pdu, self.sn_size) {
                Ok(report) => {
                    // an implausible report is counted inside handle_status
                    let _ = self.tx.lock().unwrap().handle_status(&report);
                }
                Err(e) => {
                    self.tx.lock().unwrap().counters.malformed_pdus += 1;
                    warn!(lcid = self.lcid.0, error = %e, "discarding malformed status PDU");
                }
            }
        } else {
            match decode_data_header(pdu, self.sn_size) {
                Ok((hdr, hdr_len)) => {
                    let payload = Bytes::copy_from_slice(&pdu[hdr_len..]);
                    self.rx.lock().unwrap().handle_data(&hdr, payload);
                }
                Err(e) => {
                    self.rx.lock().unwrap().on_malformed();
                    warn!(lcid = self.lcid.0, error = %e, "discarding malformed data PDU");
                }
            }
        }
    }

    /// Exact bytes pending: transmit-side data plus a due status report
    pub fn get_buffer_state(&self) -> usize {
        let data = self.tx.lock().unwrap().buffer_state();
        let rx = self.rx.lock().unwrap();
        let status = if rx.status_due() { rx.pending_status_len() } else { 0 };
        data + status
    }

    /// Consume protocol timer expiries
    pub fn timer_tick(&self) {
        self.tx.lock().unwrap().timer_tick();
        self.rx.lock().unwrap().timer_tick();
    }

    /// Counter snapshot across both directions
    pub fn get_metrics(&self) -> RlcMetrics {
        let tx = self.tx.lock().unwrap().counters;
        let rx = self.rx.lock().unwrap().counters;
        RlcMetrics {
            tx_sdus: tx.tx_sdus,
            tx_pdus: tx.tx_pdus,
            tx_pdu_bytes: tx.tx_pdu_bytes,
            retx_pdus: tx.retx_pdus,
            status_pdus_tx: rx.status_pdus_tx,
            queue_drops: tx.queue_drops,
            rx_pdus: rx.rx_pdus,
            rx_pdu_bytes: rx.rx_pdu_bytes,
            rx_sdus: rx.rx_sdus,
            lost_sdus: rx.lost_sdus,
            discarded_dupes: rx.discarded_dupes,
            malformed_pdus: tx.malformed_pdus + rx.malformed_pdus,
            protocol_violations: tx.protocol_violations + rx.protocol_violations,
        }
    }

    /// Drop all protocol state in both directions
    pub fn reestablish(&self) {
        info!(lcid = self.lcid.0, "reestablishing RLC AM entity");
        self.tx.lock().unwrap().reestablish();
        self.rx.lock().unwrap().reestablish();
    }

    /// Replace the configuration of an idle entity.
    ///
    /// With PDUs in flight this fails; reconfiguration mid-stream would
    /// corrupt the windows, so the caller must reestablish instead.
    pub fn reconfigure(&self, config: RlcAmConfig) -> Result<(), LayerError> {
        config.validate()?;
        if config.sn_size != self.sn_size {
            return Err(LayerError::InvalidConfiguration(
                "SN length is fixed for the entity lifetime".into(),
            ));
        }
        let mut tx = self.tx.lock().unwrap();
        if !tx.is_idle() {
            return Err(LayerError::InvalidState(
                "reconfiguration with PDUs in flight".into(),
            ));
        }
        tx.set_config(config);
        drop(tx);
        let mut rx = self.rx.lock().unwrap();
        if !rx.is_idle() {
            return Err(LayerError::InvalidState(
                "reconfiguration with PDUs in flight".into(),
            ));
        }
        rx.set_config(config);
        Ok(())
    }
}
