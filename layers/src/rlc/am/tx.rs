//! AM Transmit Side
//!
//! Owns the pending-SDU queue, the TX window of un-acknowledged SDUs, the
//! segmentation cursor, poll triggering (TS 38.322 5.3.3) and
//! retransmission selection. All sequence numbers of one SDU's segments are
//! identical; the segment offset distinguishes them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

use common::timers::{TimerManager, UniqueTimer};
use common::types::LcId;
use interfaces::rlc::RlcUpperLayer;

use crate::rlc::pdu::{encode_data_header, AmdPduHeader, SegmentInfo, StatusReport, SO_END_OF_SDU};
use crate::rlc::{OverflowPolicy, RlcAmConfig, RlcSdu};
use crate::LayerError;

/// Longest SDU the 16-bit segment-offset field can address; the last
/// byte's offset must stay below the end-of-SDU marker
pub(super) const MAX_SDU_LEN: usize = u16::MAX as usize;

/// TX window entry: one SDU under transmission or awaiting acknowledgement
struct TxSduEntry {
    sdu: Bytes,
    delivery_tag: Option<u32>,
    retx_count: u32,
}

/// Segmentation cursor into the SDU currently being carved into PDUs
#[derive(Clone, Copy)]
struct SegCursor {
    sn: u32,
    next_so: usize,
}

/// Unacknowledged byte range `[start, end)` of an SDU awaiting retransmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RetxSegment {
    sn: u32,
    start: usize,
    end: usize,
}

/// Transmit-side counters, merged into [`crate::rlc::RlcMetrics`]
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct TxCounters {
    pub tx_sdus: u64,
    pub tx_pdus: u64,
    pub tx_pdu_bytes: u64,
    pub retx_pdus: u64,
    pub queue_drops: u64,
    pub malformed_pdus: u64,
    pub protocol_violations: u64,
}

pub(super) struct AmTx {
    lcid: LcId,
    cfg: RlcAmConfig,
    upper: Arc<dyn RlcUpperLayer>,

    // TS 38.322 7.1 state variables
    tx_next_ack: u32,
    tx_next: u32,
    poll_sn: u32,
    pdu_without_poll: u32,
    byte_without_poll: u32,
    /// Poll forced by t-PollRetransmit expiry
    force_poll: bool,

    queue: VecDeque<RlcSdu>,
    queued_bytes: usize,
    cursor: Option<SegCursor>,
    window: HashMap<u32, TxSduEntry>,
    retx_queue: VecDeque<RetxSegment>,

    poll_retx_timer: UniqueTimer,
    link_failed: bool,
    pub(super) counters: TxCounters,
}

impl AmTx {
    pub(super) fn new(
        lcid: LcId,
        cfg: RlcAmConfig,
        upper: Arc<dyn RlcUpperLayer>,
        timers: &TimerManager,
    ) -> Self {
        let poll_retx_timer = timers.unique_timer();
        poll_retx_timer.set(cfg.t_poll_retransmit);
        Self {
            lcid,
            cfg,
            upper,
            tx_next_ack: 0,
            tx_next: 0,
            poll_sn: 0,
            pdu_without_poll: 0,
            byte_without_poll: 0,
            force_poll: false,
            queue: VecDeque::new(),
            queued_bytes: 0,
            cursor: None,
            window: HashMap::new(),
            retx_queue: VecDeque::new(),
            poll_retx_timer,
            link_failed: false,
            counters: TxCounters::default(),
        }
    }

    fn base_hdr(&self) -> usize {
        AmdPduHeader::base_len(self.cfg.sn_size)
    }

    /// Append an SDU to the pending queue, applying the overflow policy at
    /// capacity. The overflow is reported to the caller either way.
    pub(super) fn write_sdu(&mut self, sdu: RlcSdu) -> Result<(), LayerError> {
        if sdu.payload.is_empty() {
            warn!(lcid = self.lcid.0, "refusing zero-length SDU");
            return Err(LayerError::InvalidSdu("zero-length SDU".into()));
        }
        if sdu.payload.len() > MAX_SDU_LEN {
            warn!(lcid = self.lcid.0, len = sdu.payload.len(), "refusing oversized SDU");
            return Err(LayerError::InvalidSdu(format!(
                "SDU of {} bytes exceeds the {}-byte segmentation limit",
                sdu.payload.len(),
                MAX_SDU_LEN
            )));
        }
        if self.queue.len() >= self.cfg.tx_queue_capacity {
            self.counters.queue_drops += 1;
            match self.cfg.overflow_policy {
                OverflowPolicy::DropNewest => {
                    warn!(lcid = self.lcid.0, "SDU queue full, refusing new SDU");
                    return Err(LayerError::CapacityExceeded("SDU queue full".into()));
                }
                OverflowPolicy::DropOldest => {
                    if let Some(old) = self.queue.pop_front() {
                        self.queued_bytes -= old.payload.len();
                    }
                    warn!(lcid = self.lcid.0, "SDU queue full, evicting oldest SDU");
                    self.queued_bytes += sdu.payload.len();
                    self.counters.tx_sdus += 1;
                    self.queue.push_back(sdu);
                    return Err(LayerError::CapacityExceeded(
                        "SDU queue full, oldest SDU evicted".into(),
                    ));
                }
            }
        }
        self.queued_bytes += sdu.payload.len();
        self.counters.tx_sdus += 1;
        self.queue.push_back(sdu);
        Ok(())
    }

    /// Exact bytes owed to the lower layer: header overhead plus remaining
    /// payload for queued data, continuation segments and retransmissions.
    pub(super) fn buffer_state(&self) -> usize {
        let mut total = self.queue.len() * self.base_hdr() + self.queued_bytes;
        if let Some(cur) = self.cursor {
            if let Some(entry) = self.window.get(&cur.sn) {
                // continuation segments carry an SO field
                total += self.base_hdr() + 2 + (entry.sdu.len() - cur.next_so);
            }
        }
        for seg in &self.retx_queue {
            if !self.window.contains_key(&seg.sn) {
                continue;
            }
            let so_len = if seg.start > 0 { 2 } else { 0 };
            total += self.base_hdr() + so_len + (seg.end - seg.start);
        }
        total
    }

    /// Build the next data PDU, retransmissions first, at most `byte_budget`
    /// bytes.
    pub(super) fn read_pdu(&mut self, byte_budget: usize) -> Option<Bytes> {
        while let Some(&seg) = self.retx_queue.front() {
            if !self.window.contains_key(&seg.sn) {
                // acknowledged after the retransmission was queued
                self.retx_queue.pop_front();
                continue;
            }
            return self.build_retx_pdu(byte_budget, seg);
        }
        self.build_new_data_pdu(byte_budget)
    }

    fn build_retx_pdu(&mut self, byte_budget: usize, seg: RetxSegment) -> Option<Bytes> {
        let sdu = self.window.get(&seg.sn)?.sdu.clone();
        let hdr_len = self.base_hdr() + if seg.start > 0 { 2 } else { 0 };
        if byte_budget <= hdr_len {
            return None;
        }

        self.retx_queue.pop_front();
        let take = (seg.end - seg.start).min(byte_budget - hdr_len);
        let end = seg.start + take;
        if end < seg.end {
            // re-segmented to fit; remainder keeps its place at the front
            self.retx_queue.push_front(RetxSegment { sn: seg.sn, start: end, end: seg.end });
        }

        let si = match (seg.start == 0, end == sdu.len()) {
            (true, true) => SegmentInfo::Full,
            (true, false) => SegmentInfo::First,
            (false, true) => SegmentInfo::Last,
            (false, false) => SegmentInfo::Middle,
        };
        let poll = self.check_poll(false, 0, seg.sn);
        let hdr = AmdPduHeader { poll, si, sn: seg.sn, so: seg.start as u16 };

        let mut buf = BytesMut::with_capacity(hdr_len + take);
        encode_data_header(&hdr, self.cfg.sn_size, &mut buf);
        buf.extend_from_slice(&sdu[seg.start..end]);

        self.counters.tx_pdus += 1;
        self.counters.retx_pdus += 1;
        self.counters.tx_pdu_bytes += buf.len() as u64;
        debug!(
            lcid = self.lcid.0,
            sn = seg.sn,
            so = seg.start,
            len = take,
            poll,
            "retransmitting segment"
        );
        Some(buf.freeze())
    }

    fn build_new_data_pdu(&mut self, byte_budget: usize) -> Option<Bytes> {
        if self.cursor.is_none() {
            if self.queue.is_empty() {
                return None;
            }
            let outstanding = self.cfg.sn_size.distance(self.tx_next_ack, self.tx_next);
            if outstanding >= self.cfg.sn_size.window_size() {
                warn!(
                    lcid = self.lcid.0,
                    tx_next_ack = self.tx_next_ack,
                    "TX window stalled, serving retransmissions only"
                );
                return None;
            }
            let sdu = self.queue.pop_front()?;
            self.queued_bytes -= sdu.payload.len();
            let sn = self.tx_next;
            self.window.insert(
                sn,
                TxSduEntry { sdu: sdu.payload, delivery_tag: sdu.delivery_tag, retx_count: 0 },
            );
            self.cursor = Some(SegCursor { sn, next_so: 0 });
        }

        let cur = self.cursor.unwrap();
        let sdu = self.window.get(&cur.sn)?.sdu.clone();
        let hdr_len = self.base_hdr() + if cur.next_so > 0 { 2 } else { 0 };
        if byte_budget <= hdr_len {
            return None;
        }

        let remaining = sdu.len() - cur.next_so;
        let take = remaining.min(byte_budget - hdr_len);
        let si = match (cur.next_so == 0, take == remaining) {
            (true, true) => SegmentInfo::Full,
            (true, false) => SegmentInfo::First,
            (false, true) => SegmentInfo::Last,
            (false, false) => SegmentInfo::Middle,
        };

        if si.is_last() {
            self.cursor = None;
            self.tx_next = self.cfg.sn_size.wrap(self.tx_next + 1);
        } else {
            self.cursor = Some(SegCursor { sn: cur.sn, next_so: cur.next_so + take });
        }

        let poll = self.check_poll(true, take as u32, cur.sn);
        let hdr = AmdPduHeader { poll, si, sn: cur.sn, so: cur.next_so as u16 };

        let mut buf = BytesMut::with_capacity(hdr_len + take);
        encode_data_header(&hdr, self.cfg.sn_size, &mut buf);
        buf.extend_from_slice(&sdu[cur.next_so..cur.next_so + take]);

        self.counters.tx_pdus += 1;
        self.counters.tx_pdu_bytes += buf.len() as u64;
        debug!(
            lcid = self.lcid.0,
            sn = cur.sn,
            so = cur.next_so,
            len = take,
            poll,
            "transmitting segment"
        );
        Some(buf.freeze())
    }

    /// Poll evaluation per TS 38.322 5.3.3.2, called once per emitted PDU
    fn check_poll(&mut self, is_new_data: bool, payload_bytes: u32, sn: u32) -> bool {
        let mut poll = self.force_poll;
        if is_new_data {
            self.pdu_without_poll += 1;
            self.byte_without_poll = self.byte_without_poll.saturating_add(payload_bytes);
            if self.pdu_without_poll >= self.cfg.poll_pdu
                || self.byte_without_poll >= self.cfg.poll_byte
            {
                poll = true;
            }
        }
        // transmission and retransmission buffers drained by this PDU
        if self.queue.is_empty() && self.cursor.is_none() && self.retx_queue.is_empty() {
            poll = true;
        }
        // window stalled
        if self.cfg.sn_size.distance(self.tx_next_ack, self.tx_next)
            >= self.cfg.sn_size.window_size()
        {
            poll = true;
        }
        if poll {
            self.pdu_without_poll = 0;
            self.byte_without_poll = 0;
            self.force_poll = false;
            self.poll_sn = sn;
            self.poll_retx_timer.run();
            trace!(lcid = self.lcid.0, poll_sn = sn, "requesting status report");
        }
        poll
    }

    /// Apply a peer status report: cumulative ACK below `ack_sn`, selective
    /// NACKs into the retransmission queue.
    ///
    /// The whole report is validated before any of it is applied; an
    /// implausible report changes nothing.
    pub(super) fn handle_status(&mut self, status: &StatusReport) -> Result<(), LayerError> {
        let sn_space = self.cfg.sn_size;
        let span = sn_space.distance(self.tx_next_ack, self.tx_next);
        let ack_dist = sn_space.distance(self.tx_next_ack, status.ack_sn);
        if ack_dist > span {
            self.counters.protocol_violations += 1;
            warn!(
                lcid = self.lcid.0,
                ack_sn = status.ack_sn,
                tx_next_ack = self.tx_next_ack,
                tx_next = self.tx_next,
                "status ACK outside the plausible window, discarding report"
            );
            return Err(LayerError::ProtocolViolation("ACK SN outside TX window".into()));
        }

        // Validation pass: resolve every NACK to an outstanding SN and a
        // concrete byte range before touching any state.
        let mut pending: Vec<(u32, usize, usize)> = Vec::new();
        for nack in &status.nacks {
            if nack.so.is_some() && nack.range.is_some() {
                return self.status_violation("NACK combines sub-range and SN range");
            }
            let count = nack.range.map_or(1, u32::from);
            for i in 0..count {
                let s = sn_space.wrap(nack.sn.wrapping_add(i));
                if sn_space.distance(self.tx_next_ack, s) > ack_dist {
                    return self.status_violation("NACK SN beyond ACK SN");
                }
                let Some(entry) = self.window.get(&s) else {
                    return self.status_violation("NACK names an SN that is not outstanding");
                };
                let (start, end) = match nack.so {
                    None => (0, entry.sdu.len()),
                    Some((a, b)) => {
                        let start = a as usize;
                        let end = if b == SO_END_OF_SDU {
                            entry.sdu.len()
                        } else {
                            (b as usize + 1).min(entry.sdu.len())
                        };
                        (start, end)
                    }
                };
                if start >= end {
                    return self.status_violation("NACK sub-range outside the SDU");
                }
                pending.push((s, start, end));
            }
        }

        // Cumulative ACK: release everything below ack_sn not NACKed
        let nacked: HashSet<u32> = pending.iter().map(|&(s, _, _)| s).collect();
        let mut s = self.tx_next_ack;
        while s != status.ack_sn {
            if !nacked.contains(&s) {
                if let Some(entry) = self.window.remove(&s) {
                    trace!(lcid = self.lcid.0, sn = s, "SDU acknowledged");
                    if let Some(tag) = entry.delivery_tag {
                        self.upper.notify_sent(self.lcid, tag);
                    }
                }
                self.retx_queue.retain(|r| r.sn != s);
            }
            s = sn_space.wrap(s + 1);
        }

        // Lower window edge: oldest still-outstanding SN
        let mut new_ack = status.ack_sn;
        let mut s = self.tx_next_ack;
        while s != status.ack_sn {
            if self.window.contains_key(&s) {
                new_ack = s;
                break;
            }
            s = sn_space.wrap(s + 1);
        }
        self.tx_next_ack = new_ack;

        // Schedule retransmissions
        for (s, start, end) in pending {
            self.bump_retx_count(s);
            self.queue_retx(s, start, end);
        }

        // TS 38.322 5.3.3.3: a positive or negative acknowledgement of
        // poll_sn stops t-PollRetransmit
        let poll_answered =
            !self.window.contains_key(&self.poll_sn) || nacked.contains(&self.poll_sn);
        if self.window.is_empty() || poll_answered {
            self.poll_retx_timer.stop();
        }
        debug!(
            lcid = self.lcid.0,
            ack_sn = status.ack_sn,
            nacks = status.nacks.len(),
            tx_next_ack = self.tx_next_ack,
            "status report applied"
        );
        Ok(())
    }

    fn status_violation(&mut self, reason: &str) -> Result<(), LayerError> {
        self.counters.protocol_violations += 1;
        warn!(lcid = self.lcid.0, reason, "discarding status report");
        Err(LayerError::ProtocolViolation(reason.into()))
    }

    fn bump_retx_count(&mut self, sn: u32) {
        let Some(entry) = self.window.get_mut(&sn) else {
            return;
        };
        entry.retx_count += 1;
        if entry.retx_count > self.cfg.max_retx_threshold && !self.link_failed {
            self.link_failed = true;
            error!(
                lcid = self.lcid.0,
                sn,
                retx_count = entry.retx_count,
                "max retransmission threshold exceeded, signalling link failure"
            );
            self.upper.on_link_failure(self.lcid);
        }
    }

    /// Queue a retransmission unless an already-pending segment covers it
    fn queue_retx(&mut self, sn: u32, start: usize, end: usize) {
        if self
            .retx_queue
            .iter()
            .any(|r| r.sn == sn && r.start <= start && r.end >= end)
        {
            return;
        }
        self.retx_queue.push_back(RetxSegment { sn, start, end });
    }

    /// t-PollRetransmit expiry: retransmit the oldest outstanding SDU and
    /// force a poll onto the next PDU.
    pub(super) fn timer_tick(&mut self) {
        if !self.poll_retx_timer.has_expired() {
            return;
        }
        let Some(len) = self.window.get(&self.tx_next_ack).map(|e| e.sdu.len()) else {
            return;
        };
        debug!(
            lcid = self.lcid.0,
            sn = self.tx_next_ack,
            "t-PollRetransmit expired, retransmitting oldest outstanding SDU"
        );
        self.bump_retx_count(self.tx_next_ack);
        self.queue_retx(self.tx_next_ack, 0, len);
        self.force_poll = true;
        self.poll_retx_timer.run();
    }

    pub(super) fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self.cursor.is_none()
            && self.window.is_empty()
            && self.retx_queue.is_empty()
    }

    pub(super) fn reestablish(&mut self) {
        self.queue.clear();
        self.queued_bytes = 0;
        self.cursor = None;
        self.window.clear();
        self.retx_queue.clear();
        self.tx_next_ack = 0;
        self.tx_next = 0;
        self.poll_sn = 0;
        self.pdu_without_poll = 0;
        self.byte_without_poll = 0;
        self.force_poll = false;
        self.link_failed = false;
        self.poll_retx_timer.stop();
    }

    pub(super) fn set_config(&mut self, cfg: RlcAmConfig) {
        self.poll_retx_timer.set(cfg.t_poll_retransmit);
        self.cfg = cfg;
    }
}
