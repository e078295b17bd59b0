//! Reliable-transport receive engine.
//!
//! Sequence-space validation, in-order delivery, out-of-order
//! reassembly, cumulative-ack scheduling and receive-window management
//! for the byte-stream transport.

use super::seq;
use crate::mem::{ForwardAlloc, MemoryAccounting};

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use codec::segment::{SegmentHeader, seg_flags};

// PAWS: a timestamp older than this is stale enough to re-learn.
const TS_RECENT_AGE_MS: u64 = 24 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case", default))]
pub struct RecvConfig {
    pub rcvbuf_default: usize,
    pub rcvbuf_max: usize,
    /// Delayed-ack timeout.
    pub delack_ms: u64,
    /// Immediate acks granted when quick mode is entered.
    pub quickacks: u8,
    /// Receive window scale we advertise.
    pub wscale: u8,
}

impl Default for RecvConfig {
    fn default() -> Self {
        Self {
            rcvbuf_default: 128 * 1024,
            rcvbuf_max: 4 * 1024 * 1024,
            delack_ms: 40,
            quickacks: 8,
            wscale: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxSegment {
    pub seq: u32,
    pub bytes: Bytes,
}

impl RxSegment {
    fn end_seq(&self) -> u32 {
        self.seq.wrapping_add(self.bytes.len() as u32)
    }
}

/// Slow-path validation verdict, in RFC 793 check order.
#[derive(Debug, PartialEq, Eq)]
pub enum Validation {
    Ok,
    /// Unacceptable but answerable: drop the segment, ack our state.
    DropAck,
    /// Silently drop.
    Drop,
    /// Reset the connection.
    Reset,
}

/// What queuing a data segment did.
#[derive(Debug, Default)]
pub struct DataOutcome {
    /// `rcv_nxt` advanced; readable bytes may be available.
    pub delivered: bool,
    /// Force an immediate acknowledgment.
    pub ack_now: bool,
    /// The segment was discarded for lack of memory.
    pub dropped: bool,
}

pub struct RecvEngine {
    cfg: RecvConfig,
    pub mss: u32,

    pub rcv_nxt: u32,
    pub copied_seq: u32,
    pub rcv_wup: u32,
    pub rcv_wnd: u32,
    pub rcv_ssthresh: u32,
    pub window_clamp: u32,
    pub rcvbuf: usize,

    queue: VecDeque<RxSegment>,
    queued_bytes: usize,
    ofo: VecDeque<RxSegment>,
    ofo_bytes: usize,

    // Ack scheduling.
    ack_pending: bool,
    quick: u8,
    pub pingpong: bool,
    lrcvtime: u64,
    rcv_mss: u32,
    delack_deadline: Option<u64>,

    // Timestamp echo state.
    pub ts_recent: u32,
    ts_recent_stamp: u64,

    // Receiver-side RTT estimate, for buffer autotuning.
    rcv_rtt_ms: u32,
    rcv_rtt_seq: u32,
    rcv_rtt_time: u64,
    rcvq_space: usize,
    rcvq_seq: u32,
    rcvq_time: u64,

    pub half_closed: bool,
}

impl RecvEngine {
    pub fn new(cfg: RecvConfig, mss: u32) -> Self {
        let rcvbuf = cfg.rcvbuf_default;

        Self {
            cfg,
            mss,
            rcv_nxt: 0,
            copied_seq: 0,
            rcv_wup: 0,
            rcv_wnd: 0,
            rcv_ssthresh: 0,
            window_clamp: 0,
            rcvbuf,
            queue: VecDeque::new(),
            queued_bytes: 0,
            ofo: VecDeque::new(),
            ofo_bytes: 0,
            ack_pending: false,
            quick: 0,
            pingpong: false,
            lrcvtime: 0,
            rcv_mss: mss,
            delack_deadline: None,
            ts_recent: 0,
            ts_recent_stamp: 0,
            rcv_rtt_ms: 0,
            rcv_rtt_seq: 0,
            rcv_rtt_time: 0,
            rcvq_space: 0,
            rcvq_seq: 0,
            rcvq_time: 0,
            half_closed: false,
        }
    }

    /// Seed from the handshake: the peer's initial sequence number.
    /// Starts in quick-ack mode for the initial slow start.
    pub fn establish(&mut self, irs: u32, now: u64) {
        self.rcv_nxt = irs.wrapping_add(1);
        self.copied_seq = self.rcv_nxt;
        self.rcv_wup = self.rcv_nxt;

        self.window_clamp = self.cfg.rcvbuf_max as u32;
        self.rcv_wnd = (self.rcvbuf as u32).min(self.window_clamp);
        self.rcv_ssthresh = self.rcv_wnd;

        self.rcv_rtt_seq = self.rcv_nxt;
        self.rcv_rtt_time = now;
        self.rcvq_seq = self.copied_seq;
        self.rcvq_time = now;
        self.rcvq_space = self.rcvbuf;

        self.enter_quickack_mode();
    }

    pub fn wscale(&self) -> u8 {
        self.cfg.wscale
    }

    /// Bytes still open in the window we last advertised.
    pub fn receive_window(&self) -> u32 {
        let right = self.rcv_wup.wrapping_add(self.rcv_wnd);
        let open = right.wrapping_sub(self.rcv_nxt) as i32;
        open.max(0) as u32
    }

    /// Bytes queued and readable by the application.
    pub fn readable(&self) -> usize {
        self.queued_bytes
    }

    pub fn ofo_len(&self) -> usize {
        self.ofo.len()
    }

    pub fn delack_deadline(&self) -> Option<u64> {
        self.delack_deadline
    }

    /// Window value to advertise in an outgoing segment, already scaled
    /// down. The right edge never moves left.
    pub fn select_window(&mut self) -> u16 {
        let free = self.rcvbuf.saturating_sub(self.queued_bytes) as u32;
        let mut wnd = free.min(self.rcv_ssthresh).min(self.window_clamp);

        let old_right = self.rcv_wup.wrapping_add(self.rcv_wnd);
        let new_right = self.rcv_nxt.wrapping_add(wnd);
        if seq::before(new_right, old_right) {
            wnd = old_right.wrapping_sub(self.rcv_nxt);
        }

        self.rcv_wup = self.rcv_nxt;
        self.rcv_wnd = wnd;

        ((wnd >> self.cfg.wscale) as u16).max(if wnd > 0 { 1 } else { 0 })
    }

    // Grow the advertised-window clamp while the buffer keeps up.
    fn grow_window(&mut self, under_pressure: bool) {
        if under_pressure
            || self.rcv_ssthresh >= self.window_clamp
            || self.queued_bytes + self.ofo_bytes > self.rcvbuf / 2
        {
            return;
        }

        self.rcv_ssthresh = (self.rcv_ssthresh + 2 * self.mss).min(self.window_clamp);
    }

    pub fn enter_quickack_mode(&mut self) {
        self.quick = self.cfg.quickacks;
        self.pingpong = false;
    }

    /// A send shortly after receiving marks the flow interactive; acks
    /// then always wait for data to piggyback on.
    pub fn note_interactive(&mut self, now: u64) {
        if self.lrcvtime != 0 && now.saturating_sub(self.lrcvtime) < self.cfg.delack_ms {
            self.pingpong = true;
        }
    }

    pub fn schedule_ack(&mut self) {
        self.ack_pending = true;
    }

    /// Whether the incoming segment can take the fast path: in order,
    /// nothing unusual in the header, ack inside the send window.
    pub fn fast_path(&self, hdr: &SegmentHeader, snd_una: u32, snd_nxt: u32) -> bool {
        hdr.seq == self.rcv_nxt
            && hdr.flags & !(seg_flags::ACK | seg_flags::PSH) == 0
            && !hdr.unknown_options
            && seq::between(hdr.ack, snd_una, snd_nxt)
            && !self.half_closed
    }

    /// Full RFC 793 validation for segments that miss the fast path:
    /// PAWS, sequence-space acceptance, reset, in-window syn.
    pub fn validate(&mut self, hdr: &SegmentHeader, payload_len: usize, now: u64) -> Validation {
        // PAWS.
        if let Some((tsval, _)) = hdr.timestamp {
            if self.ts_recent != 0
                && seq::before(tsval, self.ts_recent)
                && now.saturating_sub(self.ts_recent_stamp) < TS_RECENT_AGE_MS
                && hdr.flags & seg_flags::RST == 0
            {
                return Validation::DropAck;
            }
        }

        let end_seq = hdr.seq.wrapping_add(payload_len as u32);
        let window = self.receive_window();

        let acceptable = if payload_len == 0 {
            if window == 0 {
                hdr.seq == self.rcv_nxt
            } else {
                seq::between(hdr.seq, self.rcv_nxt, self.rcv_nxt.wrapping_add(window))
            }
        } else if window == 0 {
            false
        } else {
            // Some part of the segment falls inside the window.
            !seq::before(end_seq, self.rcv_nxt)
                && seq::before(hdr.seq, self.rcv_nxt.wrapping_add(window))
        };

        if !acceptable {
            return if hdr.flags & seg_flags::RST != 0 {
                Validation::Drop
            } else {
                Validation::DropAck
            };
        }

        if hdr.flags & seg_flags::RST != 0 {
            return Validation::Reset;
        }

        // An in-window syn after establishment is a protocol violation.
        if hdr.flags & seg_flags::SYN != 0 {
            return Validation::Reset;
        }

        Validation::Ok
    }

    /// Remember the peer's timestamp for echoing and PAWS once the
    /// segment touches the left window edge.
    pub fn note_timestamp(&mut self, hdr: &SegmentHeader, now: u64) {
        if let Some((tsval, _)) = hdr.timestamp {
            if !seq::after(hdr.seq, self.rcv_wup) {
                self.ts_recent = tsval;
                self.ts_recent_stamp = now;
            }
        }
    }

    // Per-arrival bookkeeping for in-order data: quick-ack aging, MSS
    // estimation, window growth and the receiver RTT measurement.
    fn event_data_recv(
        &mut self,
        seg_len: usize,
        timestamp: Option<(u32, u32)>,
        now: u64,
        under_pressure: bool,
    ) {
        if seg_len >= self.rcv_mss as usize {
            self.rcv_mss = seg_len as u32;
        }

        self.lrcvtime = now;
        self.grow_window(under_pressure);
        self.rcv_rtt_measure(timestamp, now);
    }

    fn rcv_rtt_measure(&mut self, timestamp: Option<(u32, u32)>, now: u64) {
        // Echoed timestamps give a direct sample; otherwise time a whole
        // window of arrivals.
        if let Some((_, tsecr)) = timestamp {
            if tsecr != 0 {
                let sample = (now as u32).wrapping_sub(tsecr);
                self.rcv_rtt_update(sample.min(60_000));
                return;
            }
        }

        if !seq::before(self.rcv_nxt, self.rcv_rtt_seq) {
            let sample = now.saturating_sub(self.rcv_rtt_time) as u32;
            if sample > 0 {
                self.rcv_rtt_update(sample);
            }

            self.rcv_rtt_seq = self.rcv_nxt.wrapping_add(self.rcv_wnd);
            self.rcv_rtt_time = now;
        }
    }

    fn rcv_rtt_update(&mut self, sample: u32) {
        if self.rcv_rtt_ms == 0 {
            self.rcv_rtt_ms = sample.max(1);
        } else {
            self.rcv_rtt_ms = (3 * self.rcv_rtt_ms + sample.max(1)) / 4;
        }
    }

    /// Queue an in-sequence or out-of-order data segment.
    pub fn queue_data(
        &mut self,
        seg_seq: u32,
        bytes: Bytes,
        timestamp: Option<(u32, u32)>,
        now: u64,
        mem: &MemoryAccounting,
        fwd: &mut ForwardAlloc,
    ) -> DataOutcome {
        let mut outcome = DataOutcome::default();

        if bytes.is_empty() {
            return outcome;
        }

        let mut segment = RxSegment {
            seq: seg_seq,
            bytes,
        };
        let end_seq = segment.end_seq();

        // A fully seen segment is a retransmission: the peer lost our
        // ack, answer immediately.
        if !seq::after(end_seq, self.rcv_nxt) {
            self.enter_quickack_mode();
            self.schedule_ack();
            outcome.ack_now = true;
            return outcome;
        }

        // Entirely past the window, e.g. a probe.
        if !seq::before(segment.seq, self.rcv_nxt.wrapping_add(self.receive_window())) {
            self.enter_quickack_mode();
            self.schedule_ack();
            outcome.ack_now = true;
            return outcome;
        }

        // Partial head overlap: keep the fresh suffix.
        if seq::before(segment.seq, self.rcv_nxt) {
            let cut = self.rcv_nxt.wrapping_sub(segment.seq) as usize;
            segment.bytes = segment.bytes.slice(cut..);
            segment.seq = self.rcv_nxt;
        }

        if segment.seq == self.rcv_nxt {
            if self.receive_window() == 0 {
                self.enter_quickack_mode();
                self.schedule_ack();
                outcome.ack_now = true;
                return outcome;
            }

            if !self.charge(segment.bytes.len(), mem, fwd) {
                outcome.dropped = true;
                return outcome;
            }

            let seg_len = segment.bytes.len();
            self.rcv_nxt = segment.end_seq();
            self.queued_bytes += seg_len;
            self.queue.push_back(segment);

            self.event_data_recv(seg_len, timestamp, now, mem.under_pressure());
            outcome.delivered = true;

            if !self.ofo.is_empty() {
                self.ofo_drain();

                // Filled the gap: ack immediately and leave interactive
                // mode.
                if self.ofo.is_empty() {
                    self.pingpong = false;
                    outcome.ack_now = true;
                }
            }

            self.schedule_ack();
            return outcome;
        }

        // Out of order: remember it and demand a duplicate ack.
        self.enter_quickack_mode();
        self.schedule_ack();
        outcome.ack_now = true;

        if !self.charge(segment.bytes.len(), mem, fwd) {
            outcome.dropped = true;
            return outcome;
        }

        self.ofo_insert(segment);
        outcome
    }

    // Insert into the start-seq-sorted out-of-order queue, handling
    // overlaps.
    fn ofo_insert(&mut self, mut segment: RxSegment) {
        self.ofo_bytes += segment.bytes.len();

        // Common case: arrives right after the current tail.
        if let Some(tail) = self.ofo.back() {
            if segment.seq == tail.end_seq() {
                self.ofo.push_back(segment);
                return;
            }
        } else {
            self.ofo.push_back(segment);
            return;
        }

        // Reverse walk for the insertion point.
        let mut index = self.ofo.len();
        while index > 0 && seq::after(self.ofo[index - 1].seq, segment.seq) {
            index -= 1;
        }

        if index > 0 {
            let prev = &self.ofo[index - 1];

            if !seq::before(segment.seq, prev.seq) && seq::before(segment.seq, prev.end_seq()) {
                if !seq::after(segment.end_seq(), prev.end_seq()) {
                    // Fully covered by existing data.
                    self.ofo_bytes -= segment.bytes.len();
                    return;
                }

                // Right overlap: keep the fresh suffix.
                let cut = prev.end_seq().wrapping_sub(segment.seq) as usize;
                self.ofo_bytes -= cut;
                segment.bytes = segment.bytes.slice(cut..);
                segment.seq = prev.end_seq();
            }
        }

        let end_seq = segment.end_seq();
        self.ofo.insert(index, segment);

        // Drop following segments the new one fully covers.
        while let Some(next) = self.ofo.get(index + 1) {
            if !seq::before(next.seq, end_seq) || seq::after(next.end_seq(), end_seq) {
                break;
            }

            if let Some(removed) = self.ofo.remove(index + 1) {
                self.ofo_bytes -= removed.bytes.len();
            }
        }
    }

    // Move out-of-order runs that now abut rcv_nxt across to the receive
    // queue.
    fn ofo_drain(&mut self) {
        loop {
            match self.ofo.front() {
                Some(head) if !seq::after(head.seq, self.rcv_nxt) => {}
                _ => break,
            }

            let Some(mut segment) = self.ofo.pop_front() else {
                break;
            };
            self.ofo_bytes -= segment.bytes.len();

            // Covered duplicate.
            if !seq::after(segment.end_seq(), self.rcv_nxt) {
                continue;
            }

            // Partial overlap with delivered data.
            if seq::before(segment.seq, self.rcv_nxt) {
                let cut = self.rcv_nxt.wrapping_sub(segment.seq) as usize;
                segment.bytes = segment.bytes.slice(cut..);
                segment.seq = self.rcv_nxt;
            }

            self.rcv_nxt = segment.end_seq();
            self.queued_bytes += segment.bytes.len();
            self.queue.push_back(segment);
        }
    }

    fn charge(&mut self, size: usize, mem: &MemoryAccounting, fwd: &mut ForwardAlloc) -> bool {
        if self.queued_bytes + self.ofo_bytes + size > self.rcvbuf || mem.at_hard_limit() {
            if !self.prune(fwd) {
                return false;
            }
        }

        fwd.charge(mem, size)
    }

    /// Queue pruning ladder: collapse small contiguous runs, then drop
    /// the out-of-order queue entirely. Returns false when the caller
    /// must discard the segment.
    pub fn prune(&mut self, fwd: &mut ForwardAlloc) -> bool {
        self.collapse_queue();

        if self.queued_bytes + self.ofo_bytes <= self.rcvbuf {
            return true;
        }

        if !self.ofo.is_empty() {
            let dropped = self.ofo_bytes;
            self.ofo.clear();
            self.ofo_bytes = 0;
            fwd.uncharge(dropped);
        }

        self.queued_bytes + self.ofo_bytes <= self.rcvbuf
    }

    // Merge runs of contiguous small segments into coalesced buffers.
    fn collapse_queue(&mut self) {
        if self.queue.len() < 2 {
            return;
        }

        let mut collapsed: VecDeque<RxSegment> = VecDeque::with_capacity(self.queue.len());

        for segment in self.queue.drain(..) {
            match collapsed.back_mut() {
                Some(last)
                    if last.end_seq() == segment.seq
                        && last.bytes.len() + segment.bytes.len() <= 2 * self.mss as usize =>
                {
                    let mut merged = BytesMut::with_capacity(
                        last.bytes.len() + segment.bytes.len(),
                    );
                    merged.extend_from_slice(&last.bytes);
                    merged.extend_from_slice(&segment.bytes);
                    last.bytes = merged.freeze();
                }
                _ => collapsed.push_back(segment),
            }
        }

        self.queue = collapsed;
    }

    /// Copy readable bytes to the caller, advancing `copied_seq`, and
    /// run receive-buffer autotuning.
    pub fn read(
        &mut self,
        buf: &mut [u8],
        now: u64,
        mem: &MemoryAccounting,
        fwd: &mut ForwardAlloc,
    ) -> usize {
        let mut copied = 0;

        while copied < buf.len() {
            let Some(head) = self.queue.front_mut() else {
                break;
            };

            let n = (buf.len() - copied).min(head.bytes.len());
            buf[copied..copied + n].copy_from_slice(&head.bytes[..n]);
            copied += n;

            if n == head.bytes.len() {
                self.queue.pop_front();
            } else {
                head.bytes = head.bytes.slice(n..);
                head.seq = head.seq.wrapping_add(n as u32);
            }
        }

        if copied > 0 {
            self.queued_bytes -= copied;
            self.copied_seq = self.copied_seq.wrapping_add(copied as u32);
            fwd.uncharge(copied);
            fwd.reclaim(mem);
            self.rcv_space_adjust(now, mem.under_pressure());
        }

        copied
    }

    // Receive-buffer autotuning, run on every user copy: size the buffer
    // to hold two round trips at the observed consumption rate.
    fn rcv_space_adjust(&mut self, now: u64, under_pressure: bool) {
        let elapsed = now.saturating_sub(self.rcvq_time);
        if self.rcv_rtt_ms == 0 || elapsed < self.rcv_rtt_ms as u64 {
            return;
        }

        let copied = self.copied_seq.wrapping_sub(self.rcvq_seq) as usize;
        let space = 2 * copied;

        if space > self.rcvq_space {
            self.rcvq_space = space;

            if !under_pressure && space > self.rcvbuf {
                self.rcvbuf = space.min(self.cfg.rcvbuf_max);
                self.window_clamp = self.rcvbuf as u32;
            }
        }

        self.rcvq_seq = self.copied_seq;
        self.rcvq_time = now;
    }

    /// Peer closed its direction: trailing reordered data is not worth
    /// recovering.
    pub fn on_fin(&mut self, fin_seq: u32, fwd: &mut ForwardAlloc) -> bool {
        if fin_seq != self.rcv_nxt {
            // Data still missing ahead of the fin; ignore until it fits.
            return false;
        }

        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.half_closed = true;

        let dropped = self.ofo_bytes;
        self.ofo.clear();
        self.ofo_bytes = 0;
        fwd.uncharge(dropped);

        self.schedule_ack();
        true
    }

    /// Resolve the pending-ack state: `true` means emit one now; false
    /// may arm the delayed-ack timer instead.
    pub fn ack_now(&mut self, now: u64) -> bool {
        if !self.ack_pending {
            return false;
        }

        // Out-of-order data: the peer needs the duplicate ack at once.
        if !self.ofo.is_empty() {
            self.ack_pending = false;
            self.delack_deadline = None;
            return true;
        }

        if self.quick > 0 && !self.pingpong {
            self.quick -= 1;
            self.ack_pending = false;
            self.delack_deadline = None;
            return true;
        }

        // More than one full segment unacknowledged.
        if self.rcv_nxt.wrapping_sub(self.rcv_wup) > self.rcv_mss {
            self.ack_pending = false;
            self.delack_deadline = None;
            return true;
        }

        if self.delack_deadline.is_none() {
            self.delack_deadline = Some(now + self.cfg.delack_ms);
        }

        false
    }

    /// Delayed-ack timer expiry: `true` means emit the ack.
    pub fn on_delack_timer(&mut self, now: u64) -> bool {
        match self.delack_deadline {
            Some(deadline) if now >= deadline => {
                self.delack_deadline = None;
                if self.ack_pending {
                    self.ack_pending = false;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (RecvEngine, MemoryAccounting, ForwardAlloc) {
        let mut recv = RecvEngine::new(RecvConfig::default(), 1000);
        recv.establish(0, 0);
        (recv, MemoryAccounting::new(64 * 1024 * 1024), ForwardAlloc::default())
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from(vec![0xABu8; len])
    }

    #[test]
    fn in_order_delivery() {
        let (mut recv, mem, mut fwd) = setup();

        let outcome = recv.queue_data(1, payload(100), None, 0, &mem, &mut fwd);
        assert!(outcome.delivered);
        assert_eq!(recv.rcv_nxt, 101);
        assert_eq!(recv.readable(), 100);

        let mut buf = [0u8; 200];
        assert_eq!(recv.read(&mut buf, 1, &mem, &mut fwd), 100);
        assert_eq!(recv.readable(), 0);
        assert_eq!(recv.copied_seq, 101);
    }

    #[test]
    fn out_of_order_reassembly() {
        let (mut recv, mem, mut fwd) = setup();

        // Segments [1..100], [201..300], [101..200] as in the wire
        // scenario; acks observed by the peer are 101, 101, 301.
        let outcome = recv.queue_data(1, payload(100), None, 0, &mem, &mut fwd);
        assert!(outcome.delivered);
        assert_eq!(recv.rcv_nxt, 101);

        let outcome = recv.queue_data(201, payload(100), None, 1, &mem, &mut fwd);
        assert!(!outcome.delivered);
        assert!(outcome.ack_now);
        assert_eq!(recv.rcv_nxt, 101);
        assert_eq!(recv.ofo_len(), 1);

        let outcome = recv.queue_data(101, payload(100), None, 2, &mem, &mut fwd);
        assert!(outcome.delivered);
        assert!(outcome.ack_now);
        assert_eq!(recv.rcv_nxt, 301);
        assert_eq!(recv.ofo_len(), 0);
        assert_eq!(recv.readable(), 300);
    }

    #[test]
    fn retransmission_forces_immediate_ack() {
        let (mut recv, mem, mut fwd) = setup();

        recv.queue_data(1, payload(100), None, 0, &mem, &mut fwd);

        let outcome = recv.queue_data(1, payload(100), None, 1, &mem, &mut fwd);
        assert!(outcome.ack_now);
        assert!(!outcome.delivered);
        assert_eq!(recv.readable(), 100);
    }

    #[test]
    fn overlapping_segments_keep_fresh_suffix() {
        let (mut recv, mem, mut fwd) = setup();

        recv.queue_data(1, payload(100), None, 0, &mem, &mut fwd);

        // [51..150]: the first 50 bytes are already delivered.
        recv.queue_data(51, payload(100), None, 1, &mem, &mut fwd);
        assert_eq!(recv.rcv_nxt, 151);
        assert_eq!(recv.readable(), 150);
    }

    #[test]
    fn ofo_covered_segments_dropped() {
        let (mut recv, mem, mut fwd) = setup();

        recv.queue_data(201, payload(100), None, 0, &mem, &mut fwd);
        assert_eq!(recv.ofo_len(), 1);

        // Fully covered by the queued segment.
        recv.queue_data(221, payload(50), None, 1, &mem, &mut fwd);
        assert_eq!(recv.ofo_len(), 1);

        // A wider segment swallows the queued one.
        recv.queue_data(151, payload(300), None, 2, &mem, &mut fwd);
        assert_eq!(recv.ofo_len(), 1);

        recv.queue_data(1, payload(150), None, 3, &mem, &mut fwd);
        assert_eq!(recv.rcv_nxt, 451);
        assert_eq!(recv.readable(), 450);
    }

    #[test]
    fn validation_rejects_out_of_window() {
        let (mut recv, _mem, _fwd) = setup();

        let mut hdr = SegmentHeader::default();
        hdr.flags = seg_flags::ACK;

        // Far beyond the window.
        hdr.seq = recv.rcv_nxt.wrapping_add(recv.receive_window()).wrapping_add(1);
        assert_eq!(recv.validate(&hdr, 100, 0), Validation::DropAck);

        // In-window reset.
        hdr.seq = recv.rcv_nxt;
        hdr.flags = seg_flags::RST;
        assert_eq!(recv.validate(&hdr, 0, 0), Validation::Reset);

        // In-window syn.
        hdr.flags = seg_flags::SYN;
        assert_eq!(recv.validate(&hdr, 0, 0), Validation::Reset);
    }

    #[test]
    fn paws_discards_stale_timestamps() {
        let (mut recv, _mem, _fwd) = setup();

        recv.ts_recent = 1_000;
        let mut hdr = SegmentHeader::default();
        hdr.seq = recv.rcv_nxt;
        hdr.flags = seg_flags::ACK;
        hdr.timestamp = Some((500, 0));

        assert_eq!(recv.validate(&hdr, 10, 10_000), Validation::DropAck);

        hdr.timestamp = Some((2_000, 0));
        assert_eq!(recv.validate(&hdr, 10, 10_000), Validation::Ok);
    }

    #[test]
    fn window_right_edge_never_retreats() {
        let (mut recv, mem, mut fwd) = setup();

        let before = recv.rcv_wup.wrapping_add(recv.rcv_wnd);

        // Filling most of the buffer shrinks the free space, but the
        // advertised right edge must hold.
        let mut seq = 1;
        for _ in 0..100 {
            recv.queue_data(seq, payload(1000), None, 0, &mem, &mut fwd);
            seq += 1000;
        }

        recv.select_window();
        let after = recv.rcv_wup.wrapping_add(recv.rcv_wnd);
        assert!(!seq::before(after, before));
    }

    #[test]
    fn fin_purges_out_of_order_queue() {
        let (mut recv, mem, mut fwd) = setup();

        recv.queue_data(1, payload(100), None, 0, &mem, &mut fwd);
        recv.queue_data(301, payload(50), None, 1, &mem, &mut fwd);
        assert_eq!(recv.ofo_len(), 1);

        assert!(recv.on_fin(101, &mut fwd));
        assert!(recv.half_closed);
        assert_eq!(recv.ofo_len(), 0);
        assert_eq!(recv.rcv_nxt, 102);
    }

    #[test]
    fn quickack_then_delayed() {
        let (mut recv, mem, mut fwd) = setup();

        // Quick mode from establish: first segments acked immediately.
        let mut seq = 1;
        for _ in 0..RecvConfig::default().quickacks {
            recv.queue_data(seq, payload(10), None, 0, &mem, &mut fwd);
            assert!(recv.ack_now(0));
            seq += 10;
        }

        // Quick credits spent: small segments go delayed.
        recv.queue_data(seq, payload(10), None, 1, &mem, &mut fwd);
        assert!(!recv.ack_now(1));
        assert_eq!(recv.delack_deadline(), Some(1 + RecvConfig::default().delack_ms));

        assert!(recv.on_delack_timer(1 + RecvConfig::default().delack_ms));
    }

    #[test]
    fn full_segments_ack_every_other() {
        let (mut recv, mem, mut fwd) = setup();
        recv.quick = 0;

        // One full-sized segment: delayed.
        recv.queue_data(1, payload(1000), None, 0, &mem, &mut fwd);
        assert!(!recv.ack_now(0));

        // Two full-sized segments outstanding: ack now.
        recv.queue_data(1001, payload(1000), None, 1, &mem, &mut fwd);
        assert!(recv.ack_now(1));
    }
}
