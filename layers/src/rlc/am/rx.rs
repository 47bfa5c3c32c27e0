//! AM Receive Side
//!
//! Owns the RX window, reassembles segments into SDUs, delivers them upward
//! in sequence-number order and generates status reports. t-Reassembly
//! bounds how long a gap may stall the window; t-StatusProhibit rate-limits
//! status emission; the periodic trigger keeps acknowledgement alive when
//! every poll-bearing PDU is lost.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use common::timers::{TimerManager, UniqueTimer};
use common::types::LcId;
use interfaces::rlc::RlcUpperLayer;

use crate::rlc::pdu::{AmdPduHeader, NackDescriptor, StatusReport, SO_END_OF_SDU};
use crate::rlc::{ReassemblyFailure, RlcAmConfig};

/// RX window entry: segments of one SDU keyed by segment offset
#[derive(Default)]
struct RxSdu {
    segments: BTreeMap<usize, Bytes>,
    /// Known once the last segment arrived
    total_len: Option<usize>,
}

impl RxSdu {
    /// Bytes contiguously received from offset 0
    fn contiguous_prefix(&self) -> usize {
        let mut cur = 0;
        for (&so, seg) in &self.segments {
            if so > cur {
                break;
            }
            cur = cur.max(so + seg.len());
        }
        cur
    }

    fn is_complete(&self) -> bool {
        self.total_len.is_some_and(|t| self.contiguous_prefix() >= t)
    }

    /// True iff `[so, so + len)` adds no bytes not already received
    fn covers(&self, so: usize, len: usize) -> bool {
        let mut cur = so;
        for (&s, seg) in &self.segments {
            if s <= cur {
                cur = cur.max(s + seg.len());
            }
            if cur >= so + len {
                return true;
            }
        }
        false
    }

    /// Concatenate the contiguous prefix, `len` bytes
    fn assemble(&self, len: usize) -> Bytes {
        let mut buf = BytesMut::with_capacity(len);
        let mut cur = 0;
        for (&so, seg) in &self.segments {
            if so + seg.len() <= cur {
                continue;
            }
            if so > cur {
                break;
            }
            buf.extend_from_slice(&seg[cur - so..]);
            cur = so + seg.len();
            if cur >= len {
                break;
            }
        }
        buf.truncate(len);
        buf.freeze()
    }

    /// Missing byte ranges as inclusive SO pairs; open tail while the total
    /// length is unknown
    fn missing_ranges(&self) -> Vec<(u16, u16)> {
        let mut out = Vec::new();
        let mut cur = 0usize;
        for (&so, seg) in &self.segments {
            if so > cur {
                out.push((cur as u16, (so - 1) as u16));
            }
            cur = cur.max(so + seg.len());
        }
        match self.total_len {
            Some(total) if cur < total => out.push((cur as u16, (total - 1) as u16)),
            None => out.push((cur as u16, SO_END_OF_SDU)),
            _ => {}
        }
        out
    }
}

/// Receive-side counters, merged into [`crate::rlc::RlcMetrics`]
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct RxCounters {
    pub rx_pdus: u64,
    pub rx_pdu_bytes: u64,
    pub rx_sdus: u64,
    pub lost_sdus: u64,
    pub discarded_dupes: u64,
    pub malformed_pdus: u64,
    pub protocol_violations: u64,
    pub status_pdus_tx: u64,
}

pub(super) struct AmRx {
    lcid: LcId,
    cfg: RlcAmConfig,
    upper: Arc<dyn RlcUpperLayer>,

    // TS 38.322 7.1 state variables
    rx_next: u32,
    rx_next_highest: u32,
    rx_next_status_trigger: u32,
    do_status: bool,

    window: HashMap<u32, RxSdu>,

    reassembly_timer: UniqueTimer,
    status_prohibit_timer: UniqueTimer,
    status_periodic_timer: UniqueTimer,
    pub(super) counters: RxCounters,
}

impl AmRx {
    pub(super) fn new(
        lcid: LcId,
        cfg: RlcAmConfig,
        upper: Arc<dyn RlcUpperLayer>,
        timers: &TimerManager,
    ) -> Self {
        let reassembly_timer = timers.unique_timer();
        reassembly_timer.set(cfg.t_reassembly);
        let status_prohibit_timer = timers.unique_timer();
        status_prohibit_timer.set(cfg.t_status_prohibit);
        let status_periodic_timer = timers.unique_timer();
        status_periodic_timer.set(cfg.t_status_periodic);
        Self {
            lcid,
            cfg,
            upper,
            rx_next: 0,
            rx_next_highest: 0,
            rx_next_status_trigger: 0,
            do_status: false,
            window: HashMap::new(),
            reassembly_timer,
            status_prohibit_timer,
            status_periodic_timer,
            counters: RxCounters::default(),
        }
    }

    /// Store one received data PDU
    pub(super) fn handle_data(&mut self, hdr: &AmdPduHeader, payload: Bytes) {
        let sn_space = self.cfg.sn_size;
        self.counters.rx_pdus += 1;
        self.counters.rx_pdu_bytes += payload.len() as u64;

        // The poll is honoured even when the PDU itself is discarded
        if hdr.poll {
            trace!(lcid = self.lcid.0, sn = hdr.sn, "poll received");
            self.do_status = true;
        }

        if !sn_space.in_window(hdr.sn, self.rx_next, sn_space.window_size()) {
            self.counters.discarded_dupes += 1;
            debug!(
                lcid = self.lcid.0,
                sn = hdr.sn,
                rx_next = self.rx_next,
                "PDU outside RX window, discarded"
            );
            return;
        }

        let so = if hdr.si.is_first() { 0 } else { hdr.so as usize };
        let entry = self.window.entry(hdr.sn).or_default();

        if hdr.si.is_last() {
            let total = so + payload.len();
            if entry.total_len.is_some_and(|t| t != total) {
                self.counters.protocol_violations += 1;
                warn!(
                    lcid = self.lcid.0,
                    sn = hdr.sn,
                    "segment metadata contradicts earlier SDU length, discarded"
                );
                return;
            }
            entry.total_len = Some(total);
        }

        if entry.covers(so, payload.len()) {
            self.counters.discarded_dupes += 1;
            debug!(lcid = self.lcid.0, sn = hdr.sn, so, "duplicate segment discarded");
        } else {
            entry.segments.insert(so, payload);
        }

        if sn_space.distance(self.rx_next, hdr.sn)
            >= sn_space.distance(self.rx_next, self.rx_next_highest)
        {
            self.rx_next_highest = sn_space.wrap(hdr.sn + 1);
        }

        self.deliver_in_order();
        self.update_reassembly_timer();
        if self.has_gap() && !self.status_periodic_timer.is_running() {
            self.status_periodic_timer.run();
        }
    }

    /// True while some SN below `rx_next_highest` is not yet fully received
    fn has_gap(&self) -> bool {
        self.rx_next != self.rx_next_highest
    }

    /// Deliver the contiguous run of complete SDUs starting at `rx_next`
    fn deliver_in_order(&mut self) {
        while let Some(entry) = self.window.get(&self.rx_next) {
            if !entry.is_complete() {
                break;
            }
            let total = entry.total_len.unwrap_or(0);
            let sdu = entry.assemble(total);
            self.window.remove(&self.rx_next);
            self.counters.rx_sdus += 1;
            trace!(lcid = self.lcid.0, sn = self.rx_next, len = total, "SDU delivered");
            self.upper.deliver_sdu(self.lcid, sdu);
            self.rx_next = self.cfg.sn_size.wrap(self.rx_next + 1);
        }
    }

    fn update_reassembly_timer(&mut self) {
        let sn_space = self.cfg.sn_size;
        if self.reassembly_timer.is_running() {
            let ahead = sn_space.distance(self.rx_next, self.rx_next_status_trigger);
            if ahead == 0 || ahead > sn_space.window_size() || !self.has_gap() {
                self.reassembly_timer.stop();
            }
        }
        if !self.reassembly_timer.is_running() && self.has_gap() {
            self.reassembly_timer.run();
            self.rx_next_status_trigger = self.rx_next_highest;
        }
    }

    /// Process timer expiries; called from the entity's tick
    pub(super) fn timer_tick(&mut self) {
        if self.reassembly_timer.has_expired() {
            self.on_reassembly_expiry();
        }
        if self.status_periodic_timer.has_expired() && self.has_gap() {
            debug!(lcid = self.lcid.0, "periodic status trigger");
            self.do_status = true;
            self.status_periodic_timer.run();
        }
    }

    /// Give up waiting for everything below the status trigger
    fn on_reassembly_expiry(&mut self) {
        let sn_space = self.cfg.sn_size;
        debug!(
            lcid = self.lcid.0,
            rx_next = self.rx_next,
            trigger = self.rx_next_status_trigger,
            "t-Reassembly expired"
        );
        while self.rx_next != self.rx_next_status_trigger {
            let sn = self.rx_next;
            match self.window.remove(&sn) {
                Some(entry) if entry.is_complete() => {
                    let total = entry.total_len.unwrap_or(0);
                    self.counters.rx_sdus += 1;
                    self.upper.deliver_sdu(self.lcid, entry.assemble(total));
                }
                Some(entry) => {
                    self.counters.lost_sdus += 1;
                    warn!(lcid = self.lcid.0, sn, "abandoning partially received SDU");
                    if self.cfg.reassembly_failure == ReassemblyFailure::DeliverPartial {
                        let prefix = entry.contiguous_prefix();
                        if prefix > 0 {
                            self.upper.deliver_sdu(self.lcid, entry.assemble(prefix));
                        }
                    }
                    self.upper.notify_lost(self.lcid, sn);
                }
                None => {
                    self.counters.lost_sdus += 1;
                    warn!(lcid = self.lcid.0, sn, "SN was never received, reported lost");
                    self.upper.notify_lost(self.lcid, sn);
                }
            }
            self.rx_next = sn_space.wrap(sn + 1);
        }
        self.deliver_in_order();
        self.do_status = true;
        self.update_reassembly_timer();
    }

    /// A report may be produced: something triggered it and the prohibit
    /// timer is idle
    pub(super) fn status_due(&self) -> bool {
        self.do_status && !self.status_prohibit_timer.is_running()
    }

    /// Encoded size of the report that `build_status` would produce,
    /// untrimmed; feeds the receive side of the buffer state
    pub(super) fn pending_status_len(&self) -> usize {
        self.build_status(usize::MAX)
            .map(|r| r.encoded_len(self.cfg.sn_size))
            .unwrap_or(0)
    }

    /// Build a status report fitting `byte_budget`: cumulative ACK at
    /// `rx_next` plus a NACK for every gap below `rx_next_highest`
    pub(super) fn build_status(&self, byte_budget: usize) -> Option<StatusReport> {
        let sn_space = self.cfg.sn_size;
        if byte_budget < StatusReport::header_len(sn_space) {
            return None;
        }

        let mut report = StatusReport { ack_sn: self.rx_next, nacks: Vec::new() };
        let mut sn = self.rx_next;
        while sn != self.rx_next_highest {
            match self.window.get(&sn) {
                None => {
                    // run of wholly missing SNs becomes one NACK range
                    let mut run = 1u32;
                    let mut next = sn_space.wrap(sn + 1);
                    while next != self.rx_next_highest
                        && !self.window.contains_key(&next)
                        && run < u8::MAX as u32
                    {
                        run += 1;
                        next = sn_space.wrap(next + 1);
                    }
                    report.nacks.push(NackDescriptor {
                        sn,
                        so: None,
                        range: (run > 1).then_some(run as u8),
                    });
                    sn = next;
                    continue;
                }
                Some(entry) if entry.is_complete() => {
                    // complete but held for reordering; nothing to request
                }
                Some(entry) => {
                    for (start, end) in entry.missing_ranges() {
                        report.nacks.push(NackDescriptor { sn, so: Some((start, end)), range: None });
                    }
                }
            }
            sn = sn_space.wrap(sn + 1);
        }

        // drop trailing NACKs until the report fits the grant
        while !report.nacks.is_empty() && report.encoded_len(sn_space) > byte_budget {
            report.nacks.pop();
        }
        Some(report)
    }

    /// Bookkeeping after a report went out: clear the trigger, start the
    /// prohibit window
    pub(super) fn on_status_sent(&mut self) {
        self.do_status = false;
        self.status_prohibit_timer.run();
        self.counters.status_pdus_tx += 1;
    }

    pub(super) fn on_malformed(&mut self) {
        self.counters.malformed_pdus += 1;
    }

    pub(super) fn is_idle(&self) -> bool {
        self.window.is_empty()
    }

    pub(super) fn reestablish(&mut self) {
        self.window.clear();
        self.rx_next = 0;
        self.rx_next_highest = 0;
        self.rx_next_status_trigger = 0;
        self.do_status = false;
        self.reassembly_timer.stop();
        self.status_prohibit_timer.stop();
        self.status_periodic_timer.stop();
    }

    pub(super) fn set_config(&mut self, cfg: RlcAmConfig) {
        self.reassembly_timer.set(cfg.t_reassembly);
        self.status_prohibit_timer.set(cfg.t_status_prohibit);
        self.status_periodic_timer.set(cfg.t_status_periodic);
        self.cfg = cfg;
    }
}
