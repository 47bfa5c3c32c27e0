//! RLC Transparent Mode
//!
//! No header, no segmentation, no ARQ: SDUs pass through unchanged in both
//! directions (TS 38.322 5.1.1). Used for signalling bearers that cannot
//! tolerate RLC overhead.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, warn};

use common::types::LcId;
use interfaces::rlc::RlcUpperLayer;

use super::{RlcMetrics, RlcSdu};
use crate::LayerError;

/// Pending-SDU queue bound; TM bearers carry little traffic
const TM_QUEUE_CAPACITY: usize = 128;

#[derive(Default)]
struct TmState {
    queue: VecDeque<RlcSdu>,
    queued_bytes: usize,
    metrics: RlcMetrics,
}

/// Transparent mode bearer
pub struct TmEntity {
    lcid: LcId,
    upper: Arc<dyn RlcUpperLayer>,
    state: Mutex<TmState>,
}

impl TmEntity {
    /// Create a transparent mode bearer
    pub fn new(lcid: LcId, upper: Arc<dyn RlcUpperLayer>) -> Self {
        Self {
            lcid,
            upper,
            state: Mutex::new(TmState::default()),
        }
    }

    /// Queue an SDU; transmitted verbatim as one PDU
    pub fn write_sdu(&self, sdu: RlcSdu) -> Result<(), LayerError> {
        let mut state = self.state.lock().unwrap();
        if state.queue.len() >= TM_QUEUE_CAPACITY {
            state.metrics.queue_drops += 1;
            warn!(lcid = self.lcid.0, "TM queue full, dropping SDU");
            return Err(LayerError::CapacityExceeded("TM SDU queue full".into()));
        }
        state.queued_bytes += sdu.payload.len();
        state.metrics.tx_sdus += 1;
        state.queue.push_back(sdu);
        Ok(())
    }

    /// Pop the head SDU if it fits the budget; TM never segments
    pub fn read_pdu(&self, byte_budget: usize) -> Option<Bytes> {
        let mut state = self.state.lock().unwrap();
        let len = state.queue.front()?.payload.len();
        if len > byte_budget {
            debug!(lcid = self.lcid.0, len, byte_budget, "TM SDU exceeds budget");
            return None;
        }
        let sdu = state.queue.pop_front()?;
        state.queued_bytes -= len;
        state.metrics.tx_pdus += 1;
        state.metrics.tx_pdu_bytes += len as u64;
        Some(sdu.payload)
    }

    /// Received PDUs are delivered upward unchanged
    pub fn write_pdu(&self, pdu: &[u8]) {
        {
            let mut state = self.state.lock().unwrap();
            state.metrics.rx_pdus += 1;
            state.metrics.rx_pdu_bytes += pdu.len() as u64;
            state.metrics.rx_sdus += 1;
        }
        self.upper.deliver_sdu(self.lcid, Bytes::copy_from_slice(pdu));
    }

    /// Bytes pending transmission
    pub fn get_buffer_state(&self) -> usize {
        self.state.lock().unwrap().queued_bytes
    }

    /// Counter snapshot
    pub fn get_metrics(&self) -> RlcMetrics {
        self.state.lock().unwrap().metrics
    }

    /// Drop all queued SDUs
    pub fn reestablish(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue.clear();
        state.queued_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Sink {
        delivered: StdMutex<Vec<Bytes>>,
    }

    impl RlcUpperLayer for Sink {
        fn deliver_sdu(&self, _lcid: LcId, sdu: Bytes) {
            self.delivered.lock().unwrap().push(sdu);
        }
        fn notify_sent(&self, _lcid: LcId, _tag: u32) {}
        fn notify_lost(&self, _lcid: LcId, _sn: u32) {}
        fn on_link_failure(&self, _lcid: LcId) {}
    }

    #[test]
    fn test_tm_passthrough() {
        let sink = Arc::new(Sink::default());
        let tm = TmEntity::new(LcId(0), sink.clone());

        tm.write_sdu(RlcSdu::new(Bytes::from_static(b"rrc setup"))).unwrap();
        assert_eq!(tm.get_buffer_state(), 9);

        // Budget too small: nothing comes out, TM cannot segment
        assert!(tm.read_pdu(4).is_none());

        let pdu = tm.read_pdu(100).unwrap();
        assert_eq!(&pdu[..], b"rrc setup");
        assert_eq!(tm.get_buffer_state(), 0);

        tm.write_pdu(&pdu);
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }
}
