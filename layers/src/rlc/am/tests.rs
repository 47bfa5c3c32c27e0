//! AM entity tests: two entities wired back to back through their PDU
//! surfaces, timers driven by hand.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;

use common::timers::TimerManager;
use common::types::LcId;
use interfaces::rlc::{NullCapture, RlcUpperLayer};

use crate::rlc::pdu::{decode_data_header, NackDescriptor, StatusReport};
use crate::rlc::{OverflowPolicy, ReassemblyFailure, RlcAmConfig, RlcSdu, SnSize};
use crate::LayerError;

use super::AmEntity;

#[derive(Default)]
struct Sink {
    delivered: Mutex<Vec<Bytes>>,
    sent: Mutex<Vec<u32>>,
    lost: Mutex<Vec<u32>>,
    failures: AtomicU32,
}

impl Sink {
    fn delivered(&self) -> Vec<Bytes> {
        self.delivered.lock().unwrap().clone()
    }
    fn sent(&self) -> Vec<u32> {
        self.sent.lock().unwrap().clone()
    }
    fn lost(&self) -> Vec<u32> {
        self.lost.lock().unwrap().clone()
    }
}

impl RlcUpperLayer for Sink {
    fn deliver_sdu(&self, _lcid: LcId, sdu: Bytes) {
        self.delivered.lock().unwrap().push(sdu);
    }
    fn notify_sent(&self, _lcid: LcId, delivery_tag: u32) {
        self.sent.lock().unwrap().push(delivery_tag);
    }
    fn notify_lost(&self, _lcid: LcId, sn: u32) {
        self.lost.lock().unwrap().push(sn);
    }
    fn on_link_failure(&self, _lcid: LcId) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

fn entity(cfg: RlcAmConfig, timers: &TimerManager) -> (AmEntity, Arc<Sink>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let sink = Arc::new(Sink::default());
    let e = AmEntity::new(LcId(4), cfg, sink.clone(), timers, Arc::new(NullCapture))
        .unwrap();
    (e, sink)
}

#[test]
fn test_full_sdu_exchange() {
    let timers = TimerManager::new();
    let (a, a_sink) = entity(RlcAmConfig::default(), &timers);
    let (b, b_sink) = entity(RlcAmConfig::default(), &timers);

    for i in 0..5u8 {
        a.write_sdu(RlcSdu::with_tag(Bytes::from(vec![i]), u32::from(i))).unwrap();
    }
    // five SDUs of 1 byte behind a 2-byte header each
    assert_eq!(a.get_buffer_state(), 15);

    let mut pdus = Vec::new();
    for i in 0..5u32 {
        let pdu = a.read_pdu(3).unwrap();
        assert_eq!(pdu.len(), 3);
        let (hdr, _) = decode_data_header(&pdu, SnSize::Size12).unwrap();
        assert_eq!(hdr.sn, i);
        pdus.push(pdu);
    }
    assert_eq!(a.get_buffer_state(), 0);
    assert!(a.read_pdu(100).is_none());

    for pdu in &pdus {
        b.write_pdu(pdu);
    }
    let delivered = b_sink.delivered();
    assert_eq!(delivered.len(), 5);
    for (i, sdu) in delivered.iter().enumerate() {
        assert_eq!(&sdu[..], &[i as u8]);
    }

    // the polls on PDUs 4 and 5 triggered a status report
    assert_eq!(b.get_buffer_state(), 3);
    let status = b.read_pdu(3).unwrap();
    assert_eq!(&status[..], &[0x00, 0x05, 0x00]);
    assert_eq!(b.get_buffer_state(), 0);

    a.write_pdu(&status);
    assert_eq!(a_sink.sent(), vec![0, 1, 2, 3, 4]);

    let am = a.get_metrics();
    assert_eq!(am.tx_sdus, 5);
    assert_eq!(am.tx_pdus, 5);
    assert_eq!(am.retx_pdus, 0);
    let bm = b.get_metrics();
    assert_eq!(bm.rx_sdus, 5);
    assert_eq!(bm.status_pdus_tx, 1);
}

#[test]
fn test_nack_triggers_retransmission() {
    let timers = TimerManager::new();
    let (a, a_sink) = entity(RlcAmConfig::default(), &timers);
    let (b, b_sink) = entity(RlcAmConfig::default(), &timers);

    for i in 0..5u8 {
        a.write_sdu(RlcSdu::with_tag(Bytes::from(vec![i]), u32::from(i))).unwrap();
    }
    let pdus: Vec<Bytes> = (0..5).map(|_| a.read_pdu(3).unwrap()).collect();

    // SN 2 is lost on the air
    for (i, pdu) in pdus.iter().enumerate() {
        if i != 2 {
            b.write_pdu(pdu);
        }
    }
    assert_eq!(b_sink.delivered().len(), 2);

    // ACK up to the gap plus one NACK for it: 3 + 2 bytes
    assert_eq!(b.get_buffer_state(), 5);
    let status = b.read_pdu(10).unwrap();
    let report = StatusReport::decode(&status, SnSize::Size12).unwrap();
    assert_eq!(report.ack_sn, 2);
    assert_eq!(report.nacks, vec![NackDescriptor { sn: 2, so: None, range: None }]);

    a.write_pdu(&status);
    assert_eq!(a_sink.sent(), vec![0, 1]);
    assert_eq!(a.get_buffer_state(), 3);

    let retx = a.read_pdu(3).unwrap();
    let (hdr, _) = decode_data_header(&retx, SnSize::Size12).unwrap();
    assert_eq!(hdr.sn, 2);
    assert!(hdr.poll);
    b.write_pdu(&retx);

    let delivered = b_sink.delivered();
    assert_eq!(delivered.len(), 5);
    for (i, sdu) in delivered.iter().enumerate() {
        assert_eq!(&sdu[..], &[i as u8]);
    }

    // the second report waits out t-StatusProhibit
    assert!(b.read_pdu(10).is_none());
    for _ in 0..8 {
        timers.tick();
    }
    let status = b.read_pdu(10).unwrap();
    assert_eq!(&status[..], &[0x00, 0x05, 0x00]);
    a.write_pdu(&status);
    assert_eq!(a_sink.sent(), vec![0, 1, 2, 3, 4]);
    assert_eq!(a.get_metrics().retx_pdus, 1);
}

#[test]
fn test_segmentation_and_reassembly() {
    let timers = TimerManager::new();
    let (a, _) = entity(RlcAmConfig::default(), &timers);
    let (b, b_sink) = entity(RlcAmConfig::default(), &timers);

    let sdu: Bytes = (0..500).map(|i| (i % 251) as u8).collect();
    a.write_sdu(RlcSdu::new(sdu.clone())).unwrap();
    while let Some(pdu) = a.read_pdu(100) {
        b.write_pdu(&pdu);
    }
    assert_eq!(b_sink.delivered(), vec![sdu]);

    // arbitrary per-opportunity grants reassemble just the same
    let mut rng = rand::thread_rng();
    let sdu2: Bytes = (0..500).map(|i| (i % 13) as u8).collect();
    a.write_sdu(RlcSdu::new(sdu2.clone())).unwrap();
    loop {
        let budget = rng.gen_range(5..=60);
        match a.read_pdu(budget) {
            Some(pdu) => b.write_pdu(&pdu),
            None => break,
        }
    }
    assert_eq!(b_sink.delivered().len(), 2);
    assert_eq!(b_sink.delivered()[1], sdu2);
}

#[test]
fn test_sdu_length_limits() {
    let timers = TimerManager::new();
    let (a, _) = entity(RlcAmConfig::default(), &timers);
    let (b, b_sink) = entity(RlcAmConfig::default(), &timers);

    // a zero-length SDU would segment into a header-only PDU the peer
    // rejects, so it is refused at the door
    let err = a.write_sdu(RlcSdu::new(Bytes::new()));
    assert!(matches!(err, Err(LayerError::InvalidSdu(_))));

    // beyond what the 16-bit segment-offset field can address
    let err = a.write_sdu(RlcSdu::new(Bytes::from(vec![0u8; 100_000])));
    assert!(matches!(err, Err(LayerError::InvalidSdu(_))));
    assert_eq!(a.get_buffer_state(), 0);
    assert_eq!(a.get_metrics().tx_sdus, 0);

    // the largest admissible SDU still round-trips bit-for-bit
    let sdu: Bytes = (0..65_535).map(|i| (i % 241) as u8).collect();
    a.write_sdu(RlcSdu::new(sdu.clone())).unwrap();
    while let Some(pdu) = a.read_pdu(40_000) {
        b.write_pdu(&pdu);
    }
    assert_eq!(b_sink.delivered(), vec![sdu]);
}

#[test]
fn test_out_of_order_and_duplicate_discard() {
    let timers = TimerManager::new();
    let (a, _) = entity(RlcAmConfig::default(), &timers);
    let (b, b_sink) = entity(RlcAmConfig::default(), &timers);

    for i in 0..3u8 {
        a.write_sdu(RlcSdu::new(Bytes::from(vec![i]))).unwrap();
    }
    let pdus: Vec<Bytes> = (0..3).map(|_| a.read_pdu(3).unwrap()).collect();

    b.write_pdu(&pdus[2]);
    assert!(b_sink.delivered().is_empty());
    b.write_pdu(&pdus[0]);
    b.write_pdu(&pdus[1]);
    let delivered = b_sink.delivered();
    assert_eq!(delivered.len(), 3);
    for (i, sdu) in delivered.iter().enumerate() {
        assert_eq!(&sdu[..], &[i as u8]);
    }

    // already delivered, now below the window
    b.write_pdu(&pdus[1]);
    assert_eq!(b_sink.delivered().len(), 3);
    assert_eq!(b.get_metrics().discarded_dupes, 1);
}

#[test]
fn test_implausible_status_changes_nothing() {
    let timers = TimerManager::new();
    let (a, a_sink) = entity(RlcAmConfig::default(), &timers);

    for i in 0..2u8 {
        a.write_sdu(RlcSdu::with_tag(Bytes::from(vec![i]), u32::from(i))).unwrap();
    }
    a.read_pdu(3).unwrap();
    a.read_pdu(3).unwrap();

    // ACK beyond tx_next
    let stale = StatusReport { ack_sn: 5, nacks: vec![] }.encode(SnSize::Size12);
    a.write_pdu(&stale);
    assert_eq!(a.get_metrics().protocol_violations, 1);
    assert!(a_sink.sent().is_empty());

    // a plausible report still lands afterwards
    let good = StatusReport { ack_sn: 2, nacks: vec![] }.encode(SnSize::Size12);
    a.write_pdu(&good);
    assert_eq!(a_sink.sent(), vec![0, 1]);

    // NACK for an SN that is no longer outstanding
    let bad_nack = StatusReport {
        ack_sn: 2,
        nacks: vec![NackDescriptor { sn: 0, so: None, range: None }],
    }
    .encode(SnSize::Size12);
    a.write_pdu(&bad_nack);
    assert_eq!(a.get_metrics().protocol_violations, 2);
    assert_eq!(a.get_buffer_state(), 0);
}

#[test]
fn test_poll_retransmit_expiry() {
    let timers = TimerManager::new();
    let (a, a_sink) = entity(RlcAmConfig::default(), &timers);
    let (b, b_sink) = entity(RlcAmConfig::default(), &timers);

    a.write_sdu(RlcSdu::with_tag(Bytes::from_static(b"x"), 7)).unwrap();
    let lost = a.read_pdu(3).unwrap();
    let (hdr, _) = decode_data_header(&lost, SnSize::Size12).unwrap();
    assert!(hdr.poll);
    drop(lost); // never reaches the peer

    for _ in 0..45 {
        timers.tick();
        a.timer_tick();
    }
    assert_eq!(a.get_buffer_state(), 3);
    let retx = a.read_pdu(10).unwrap();
    let (hdr, _) = decode_data_header(&retx, SnSize::Size12).unwrap();
    assert_eq!(hdr.sn, 0);
    assert!(hdr.poll);
    assert_eq!(a.get_metrics().retx_pdus, 1);

    b.write_pdu(&retx);
    assert_eq!(b_sink.delivered().len(), 1);
    let status = b.read_pdu(10).unwrap();
    a.write_pdu(&status);
    assert_eq!(a_sink.sent(), vec![7]);
}

#[test]
fn test_reassembly_expiry_skips_gap() {
    let timers = TimerManager::new();
    let (a, _) = entity(RlcAmConfig::default(), &timers);
    let (b, b_sink) = entity(RlcAmConfig::default(), &timers);

    for i in 0..3u8 {
        a.write_sdu(RlcSdu::new(Bytes::from(vec![i]))).unwrap();
    }
    let pdus: Vec<Bytes> = (0..3).map(|_| a.read_pdu(3).unwrap()).collect();

    // SN 1 never arrives
    b.write_pdu(&pdus[0]);
    b.write_pdu(&pdus[2]);
    assert_eq!(b_sink.delivered().len(), 1);

    for _ in 0..35 {
        timers.tick();
        b.timer_tick();
    }
    // the window moved past the gap: SN 2 came through, SN 1 is lost
    let delivered = b_sink.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(&delivered[1][..], &[2]);
    assert_eq!(b_sink.lost(), vec![1]);
    assert_eq!(b.get_metrics().lost_sdus, 1);

    let status = b.read_pdu(10).unwrap();
    assert_eq!(&status[..], &[0x00, 0x03, 0x00]);
}

#[test]
fn test_reassembly_expiry_delivers_partial_prefix() {
    let timers = TimerManager::new();
    let cfg = RlcAmConfig {
        reassembly_failure: ReassemblyFailure::DeliverPartial,
        ..RlcAmConfig::default()
    };
    let (a, _) = entity(cfg, &timers);
    let (b, b_sink) = entity(cfg, &timers);

    let sdu: Bytes = (0..100).map(|i| i as u8).collect();
    a.write_sdu(RlcSdu::new(sdu.clone())).unwrap();
    let first = a.read_pdu(52).unwrap(); // 50 bytes of payload
    let middle = a.read_pdu(52).unwrap(); // 48 bytes of payload
    let _tail = a.read_pdu(52).unwrap(); // lost

    b.write_pdu(&first);
    b.write_pdu(&middle);
    assert!(b_sink.delivered().is_empty());

    for _ in 0..35 {
        timers.tick();
        b.timer_tick();
    }
    let delivered = b_sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0], sdu.slice(0..98));
    assert_eq!(b_sink.lost(), vec![0]);
}

#[test]
fn test_status_prohibit_gates_reports() {
    let timers = TimerManager::new();
    let (a, _) = entity(RlcAmConfig::default(), &timers);
    let (b, _) = entity(RlcAmConfig::default(), &timers);

    for i in 0..2u8 {
        a.write_sdu(RlcSdu::new(Bytes::from(vec![i]))).unwrap();
    }
    b.write_pdu(&a.read_pdu(3).unwrap());
    b.write_pdu(&a.read_pdu(3).unwrap()); // carries a poll
    assert!(b.read_pdu(10).is_some());

    // a second poll arrives inside the prohibit window
    a.write_sdu(RlcSdu::new(Bytes::from_static(b"z"))).unwrap();
    b.write_pdu(&a.read_pdu(3).unwrap());
    assert_eq!(b.get_buffer_state(), 0);
    assert!(b.read_pdu(10).is_none());

    for _ in 0..8 {
        timers.tick();
    }
    let status = b.read_pdu(10).unwrap();
    let report = StatusReport::decode(&status, SnSize::Size12).unwrap();
    assert_eq!(report.ack_sn, 3);
}

#[test]
fn test_periodic_status_without_polls() {
    let timers = TimerManager::new();
    let cfg = RlcAmConfig {
        t_reassembly: 200,
        t_status_periodic: 50,
        ..RlcAmConfig::default()
    };
    let (a, _) = entity(cfg, &timers);
    let (b, _) = entity(cfg, &timers);

    for i in 0..5u8 {
        a.write_sdu(RlcSdu::new(Bytes::from(vec![i]))).unwrap();
    }
    let pdus: Vec<Bytes> = (0..5).map(|_| a.read_pdu(3).unwrap()).collect();

    // only poll-free PDUs make it through, leaving a gap at SN 1
    b.write_pdu(&pdus[0]);
    b.write_pdu(&pdus[2]);
    assert!(b.read_pdu(100).is_none());

    for _ in 0..50 {
        timers.tick();
        b.timer_tick();
    }
    let status = b.read_pdu(100).unwrap();
    let report = StatusReport::decode(&status, SnSize::Size12).unwrap();
    assert_eq!(report.ack_sn, 1);
    assert_eq!(report.nacks, vec![NackDescriptor { sn: 1, so: None, range: None }]);
}

#[test]
fn test_queue_overflow_policies() {
    let timers = TimerManager::new();

    let cfg = RlcAmConfig { tx_queue_capacity: 2, ..RlcAmConfig::default() };
    let (a, _) = entity(cfg, &timers);
    a.write_sdu(RlcSdu::new(Bytes::from_static(b"1"))).unwrap();
    a.write_sdu(RlcSdu::new(Bytes::from_static(b"2"))).unwrap();
    let err = a.write_sdu(RlcSdu::new(Bytes::from_static(b"3")));
    assert!(matches!(err, Err(LayerError::CapacityExceeded(_))));
    assert_eq!(a.get_metrics().queue_drops, 1);
    assert_eq!(&a.read_pdu(10).unwrap()[2..], b"1");

    let cfg = RlcAmConfig {
        tx_queue_capacity: 2,
        overflow_policy: OverflowPolicy::DropOldest,
        ..RlcAmConfig::default()
    };
    let (a, _) = entity(cfg, &timers);
    a.write_sdu(RlcSdu::new(Bytes::from_static(b"1"))).unwrap();
    a.write_sdu(RlcSdu::new(Bytes::from_static(b"2"))).unwrap();
    let err = a.write_sdu(RlcSdu::new(Bytes::from_static(b"3")));
    assert!(matches!(err, Err(LayerError::CapacityExceeded(_))));
    assert_eq!(&a.read_pdu(10).unwrap()[2..], b"2");
    assert_eq!(&a.read_pdu(10).unwrap()[2..], b"3");
}

#[test]
fn test_max_retx_signals_link_failure_once() {
    let timers = TimerManager::new();
    let cfg = RlcAmConfig { max_retx_threshold: 1, ..RlcAmConfig::default() };
    let (a, a_sink) = entity(cfg, &timers);

    a.write_sdu(RlcSdu::new(Bytes::from_static(b"abc"))).unwrap();
    a.read_pdu(10).unwrap();

    let nack = StatusReport {
        ack_sn: 0,
        nacks: vec![NackDescriptor { sn: 0, so: None, range: None }],
    }
    .encode(SnSize::Size12);

    a.write_pdu(&nack);
    assert_eq!(a_sink.failures.load(Ordering::SeqCst), 0);
    a.write_pdu(&nack);
    assert_eq!(a_sink.failures.load(Ordering::SeqCst), 1);
    a.write_pdu(&nack);
    assert_eq!(a_sink.failures.load(Ordering::SeqCst), 1);
    assert_eq!(a.get_metrics().protocol_violations, 0);
}

#[test]
fn test_window_stall_and_release() {
    let timers = TimerManager::new();
    let cfg = RlcAmConfig { tx_queue_capacity: 3000, ..RlcAmConfig::default() };
    let (a, _) = entity(cfg, &timers);

    // fill the whole 12-bit TX window plus one
    for _ in 0..2049 {
        a.write_sdu(RlcSdu::new(Bytes::from_static(b"q"))).unwrap();
    }
    for _ in 0..2048 {
        assert!(a.read_pdu(3).is_some());
    }
    // SN 2048 would leave the window: nothing comes out
    assert!(a.read_pdu(3).is_none());
    assert_eq!(a.get_buffer_state(), 3);

    let ack = StatusReport { ack_sn: 2048, nacks: vec![] }.encode(SnSize::Size12);
    a.write_pdu(&ack);
    let pdu = a.read_pdu(3).unwrap();
    let (hdr, _) = decode_data_header(&pdu, SnSize::Size12).unwrap();
    assert_eq!(hdr.sn, 2048);
}

#[test]
fn test_18bit_sn_exchange() {
    let timers = TimerManager::new();
    let cfg = RlcAmConfig { sn_size: SnSize::Size18, ..RlcAmConfig::default() };
    let (a, a_sink) = entity(cfg, &timers);
    let (b, b_sink) = entity(cfg, &timers);

    for i in 0..2u8 {
        a.write_sdu(RlcSdu::with_tag(Bytes::from(vec![i]), u32::from(i))).unwrap();
    }
    // 3-byte header plus 1 byte of payload
    assert_eq!(a.get_buffer_state(), 8);
    b.write_pdu(&a.read_pdu(4).unwrap());
    b.write_pdu(&a.read_pdu(4).unwrap());
    assert_eq!(b_sink.delivered().len(), 2);

    let status = b.read_pdu(10).unwrap();
    let report = StatusReport::decode(&status, SnSize::Size18).unwrap();
    assert_eq!(report.ack_sn, 2);
    a.write_pdu(&status);
    assert_eq!(a_sink.sent(), vec![0, 1]);
}

#[test]
fn test_malformed_pdus_counted_not_fatal() {
    let timers = TimerManager::new();
    let (a, _) = entity(RlcAmConfig::default(), &timers);

    a.write_pdu(&[]); // empty
    a.write_pdu(&[0x80]); // truncated data header
    a.write_pdu(&[0x00]); // truncated status
    assert_eq!(a.get_metrics().malformed_pdus, 3);

    // the entity keeps working
    a.write_sdu(RlcSdu::new(Bytes::from_static(b"ok"))).unwrap();
    assert!(a.read_pdu(10).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_ticker_driven_poll_retransmit() {
    use common::timers::run_ticker;
    use std::time::Duration;

    let timers = TimerManager::new();
    let (a, _) = entity(RlcAmConfig::default(), &timers);

    a.write_sdu(RlcSdu::new(Bytes::from_static(b"x"))).unwrap();
    a.read_pdu(3).unwrap(); // lost on the air

    let ticker = tokio::spawn(run_ticker(timers.clone(), Duration::from_millis(1)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    ticker.abort();

    a.timer_tick();
    // t-PollRetransmit fired: the SDU is back in the buffer
    assert_eq!(a.get_buffer_state(), 3);
    assert!(a.read_pdu(10).is_some());
}

#[test]
fn test_reestablish_and_reconfigure() {
    let timers = TimerManager::new();
    let (a, _) = entity(RlcAmConfig::default(), &timers);

    a.write_sdu(RlcSdu::new(Bytes::from_static(b"a"))).unwrap();
    a.write_sdu(RlcSdu::new(Bytes::from_static(b"b"))).unwrap();
    a.read_pdu(3).unwrap();

    // PDUs in flight: the configuration is frozen
    let cfg2 = RlcAmConfig { t_poll_retransmit: 100, ..RlcAmConfig::default() };
    assert!(matches!(a.reconfigure(cfg2), Err(LayerError::InvalidState(_))));

    a.reestablish();
    assert_eq!(a.get_buffer_state(), 0);
    assert!(a.read_pdu(100).is_none());
    assert!(a.reconfigure(cfg2).is_ok());

    // the SN length is fixed at construction
    let cfg18 = RlcAmConfig { sn_size: SnSize::Size18, ..RlcAmConfig::default() };
    assert!(matches!(a.reconfigure(cfg18), Err(LayerError::InvalidConfiguration(_))));

    // sequence numbering restarts from zero
    a.write_sdu(RlcSdu::new(Bytes::from_static(b"c"))).unwrap();
    let pdu = a.read_pdu(3).unwrap();
    let (hdr, _) = decode_data_header(&pdu, SnSize::Size12).unwrap();
    assert_eq!(hdr.sn, 0);
}
