//! Reliable-transport send engine.
//!
//! Owns the retransmit queue, the RTT estimator, the congestion window
//! and the retransmission timer. The queue covers exactly
//! `[snd_una, snd_nxt)` at all times; cumulative acks free whole
//! segments from the head and trim a partially covered head in place.

use super::{
    congestion::{CongestionOps, CongestionVars, Reno, initial_cwnd},
    seq,
};

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case", default))]
pub struct SendConfig {
    /// RTO before the first round-trip measurement.
    pub rto_initial_ms: u64,
    pub rto_min_ms: u64,
    pub rto_max_ms: u64,
    /// Retransmission attempts before the connection is failed.
    pub max_retries: u32,
    pub sndbuf_default: usize,
    pub sndbuf_max: usize,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            rto_initial_ms: 1_000,
            rto_min_ms: 200,
            rto_max_ms: 120_000,
            max_retries: 7,
            sndbuf_default: 64 * 1024,
            sndbuf_max: 4 * 1024 * 1024,
        }
    }
}

/// Congestion-control engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaState {
    Open,
    Disorder,
    Cwr,
    Recovery,
    Loss,
}

#[derive(Debug, Clone)]
pub struct TxSegment {
    pub seq: u32,
    pub end_seq: u32,
    pub bytes: Bytes,
    pub retransmitted: bool,
    pub sent_at: u64,
}

/// What an incoming cumulative ack did.
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub acked: usize,
    pub duplicate: bool,
    /// Head segment to resend immediately (third duplicate ack).
    pub fast_retransmit: Option<(u32, Bytes)>,
    /// The retransmit queue emptied and the timer was disarmed.
    pub queue_drained: bool,
}

#[derive(Debug)]
pub enum RtoOutcome {
    /// Timer fired with nothing outstanding.
    Idle,
    /// Resend the head segment.
    Retransmit { seq: u32, bytes: Bytes },
    /// Attempts exhausted; fail the connection.
    Failed,
}

pub struct SendEngine {
    cfg: SendConfig,

    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    pub max_window: u32,
    snd_wscale: u8,
    pub mss: u32,

    unsent: BytesMut,
    rtx: VecDeque<TxSegment>,
    rtx_bytes: usize,
    packets_out: u32,
    retrans_out: u32,

    // Jacobson estimator, milliseconds: srtt scaled by 8, mdev by 4.
    srtt: u32,
    mdev: u32,
    mdev_max: u32,
    rttvar: u32,
    rtt_seq: u32,
    pub rto_ms: u64,
    backoff: u32,
    retries: u32,

    pub cwnd: u32,
    pub ssthresh: u32,
    cwnd_cnt: u32,
    pub ca_state: CaState,
    high_seq: u32,
    dup_acks: u32,
    cong: Box<dyn CongestionOps>,

    pub sndbuf: usize,
    rto_deadline: Option<u64>,
}

impl SendEngine {
    pub fn new(cfg: SendConfig) -> Self {
        let sndbuf = cfg.sndbuf_default;
        let rto_ms = cfg.rto_initial_ms;

        Self {
            cfg,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            max_window: 0,
            snd_wscale: 0,
            mss: 1460,
            unsent: BytesMut::new(),
            rtx: VecDeque::new(),
            rtx_bytes: 0,
            packets_out: 0,
            retrans_out: 0,
            srtt: 0,
            mdev: 0,
            mdev_max: 0,
            rttvar: 0,
            rtt_seq: 0,
            rto_ms,
            backoff: 0,
            retries: 0,
            cwnd: 2,
            ssthresh: u32::MAX,
            cwnd_cnt: 0,
            ca_state: CaState::Open,
            high_seq: 0,
            dup_acks: 0,
            cong: Box::new(Reno),
            sndbuf,
            rto_deadline: None,
        }
    }

    /// Seed the engine from the handshake: our initial sequence number
    /// (the Connect consumed it), the negotiated MSS and the peer's
    /// window scale.
    pub fn establish(&mut self, iss: u32, peer_mss: u16, peer_wscale: u8) {
        self.snd_una = iss.wrapping_add(1);
        self.snd_nxt = self.snd_una;
        self.rtt_seq = self.snd_una;
        self.mss = self.mss.min(peer_mss as u32).max(64);
        self.snd_wscale = peer_wscale;
        self.cwnd = initial_cwnd(self.mss);

        // Until the first ack carries a real window, assume a handful of
        // segments so the connection can start.
        self.snd_wnd = self.mss * 10;
        self.max_window = self.snd_wnd;
    }

    pub fn in_flight(&self) -> u32 {
        self.packets_out
    }

    pub fn wmem(&self) -> usize {
        self.unsent.len() + self.rtx_bytes
    }

    pub fn has_unsent(&self) -> bool {
        !self.unsent.is_empty()
    }

    /// Consume one sequence number for a control event (fin, migrate)
    /// that rides the SAL rather than the stream.
    pub fn take_seqno(&mut self) -> u32 {
        let seqno = self.snd_nxt;
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        seqno
    }

    /// Bytes of send-buffer space currently available.
    pub fn space(&self) -> usize {
        self.sndbuf.saturating_sub(self.wmem())
    }

    pub fn rto_deadline(&self) -> Option<u64> {
        self.rto_deadline
    }

    /// The range covered by the retransmit queue, as an invariant probe.
    pub fn queued_range(&self) -> Option<(u32, u32)> {
        let first = self.rtx.front()?;
        let last = self.rtx.back()?;
        Some((first.seq, last.end_seq))
    }

    fn cur_rto(&self) -> u64 {
        (self.rto_ms << self.backoff.min(16)).min(self.cfg.rto_max_ms)
    }

    fn vars(&self) -> CongestionVars {
        CongestionVars {
            cwnd: self.cwnd,
            ssthresh: self.ssthresh,
            cwnd_cnt: self.cwnd_cnt,
            mss: self.mss,
        }
    }

    /// Accept bytes into the write buffer, bounded by the send buffer.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = self.space().min(data.len());
        self.unsent.extend_from_slice(&data[..n]);
        n
    }

    /// Move writable bytes onto the wire: segments of at most one MSS,
    /// bounded by the congestion window and the peer's receive window.
    /// Arms the retransmission timer when the queue goes non-empty.
    pub fn transmit(&mut self, now: u64) -> Vec<(u32, Bytes)> {
        let mut out = Vec::new();

        while !self.unsent.is_empty() && self.packets_out < self.cwnd {
            let wnd_end = self.snd_una.wrapping_add(self.snd_wnd);
            let room = wnd_end.wrapping_sub(self.snd_nxt) as i32;
            if room <= 0 {
                break;
            }

            let n = (self.mss as usize)
                .min(self.unsent.len())
                .min(room as usize);
            let bytes = self.unsent.split_to(n).freeze();
            let seq = self.snd_nxt;

            self.rtx.push_back(TxSegment {
                seq,
                end_seq: seq.wrapping_add(n as u32),
                bytes: bytes.clone(),
                retransmitted: false,
                sent_at: now,
            });

            self.snd_nxt = self.snd_nxt.wrapping_add(n as u32);
            self.packets_out += 1;
            self.rtx_bytes += n;

            if self.rto_deadline.is_none() {
                self.rto_deadline = Some(now + self.cur_rto());
            }

            out.push((seq, bytes));
        }

        out
    }

    /// Process a cumulative acknowledgment with the advertised window.
    ///
    /// `has_payload` tells the duplicate detector whether the carrying
    /// segment also moved data; such segments never count as dupacks.
    pub fn on_ack(&mut self, ack: u32, wnd_raw: u16, has_payload: bool, now: u64) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        // Ack of data we never sent.
        if seq::after(ack, self.snd_nxt) {
            return outcome;
        }

        let advanced = seq::after(ack, self.snd_una);

        let new_wnd = (wnd_raw as u32) << self.snd_wscale;
        let window_update = new_wnd != self.snd_wnd;
        if advanced || new_wnd > self.snd_wnd {
            self.snd_wnd = new_wnd;
            self.max_window = self.max_window.max(new_wnd);
        }

        if !advanced {
            if !has_payload && !window_update && ack == self.snd_una && !self.rtx.is_empty() {
                outcome.duplicate = true;
                outcome.fast_retransmit = self.on_dup_ack(now);
            }
            return outcome;
        }

        // Walk the queue from the head: whole segments are freed, a
        // partially covered head is trimmed in place.
        let mut pkts_acked = 0u32;
        let mut rtt_sample = None;

        while let Some(head) = self.rtx.front_mut() {
            if !seq::after(head.end_seq, ack) {
                if !head.retransmitted {
                    // Karn: retransmitted segments never produce samples.
                    rtt_sample = Some(now.saturating_sub(head.sent_at) as u32);
                } else {
                    self.retrans_out = self.retrans_out.saturating_sub(1);
                }

                let len = head.bytes.len();
                outcome.acked += len;
                self.rtx_bytes -= len;
                pkts_acked += 1;
                self.rtx.pop_front();
            } else if seq::before(head.seq, ack) {
                let cut = ack.wrapping_sub(head.seq) as usize;
                head.bytes = head.bytes.slice(cut..);
                head.seq = ack;
                outcome.acked += cut;
                self.rtx_bytes -= cut;
                break;
            } else {
                break;
            }
        }

        self.packets_out = self.packets_out.saturating_sub(pkts_acked);
        self.snd_una = ack;

        if let Some(m) = rtt_sample {
            self.rtt_update(m.max(1));
            self.backoff = 0;
            self.retries = 0;

            let vars = self.vars();
            self.cong.pkts_acked(&vars, pkts_acked, m.saturating_mul(1_000));
        }

        // Leave recovery once the ack covers the loss point.
        match self.ca_state {
            CaState::Recovery | CaState::Loss | CaState::Cwr
                if !seq::before(ack, self.high_seq) =>
            {
                self.cwnd = self.cwnd.min(self.ssthresh.max(2));
                self.ca_state = CaState::Open;
                self.dup_acks = 0;
            }
            CaState::Disorder => {
                self.ca_state = CaState::Open;
                self.dup_acks = 0;
            }
            _ => {}
        }

        if self.ca_state == CaState::Open {
            let mut vars = self.vars();
            self.cong.cong_avoid(&mut vars, ack, self.packets_out);
            self.cwnd = vars.cwnd;
            self.cwnd_cnt = vars.cwnd_cnt;
        }

        if self.rtx.is_empty() {
            self.rto_deadline = None;
            outcome.queue_drained = true;
        } else {
            self.rto_deadline = Some(now + self.cur_rto());
        }

        outcome
    }

    fn on_dup_ack(&mut self, now: u64) -> Option<(u32, Bytes)> {
        self.dup_acks += 1;

        if self.ca_state == CaState::Open {
            self.ca_state = CaState::Disorder;
        }

        if self.dup_acks != 3 || self.ca_state != CaState::Disorder {
            return None;
        }

        // Third duplicate: reno fast retransmit and window reduction.
        self.high_seq = self.snd_nxt;
        let vars = self.vars();
        self.ssthresh = self.cong.ssthresh(&vars);
        self.cwnd = self.ssthresh;
        self.cwnd_cnt = 0;
        self.ca_state = CaState::Recovery;

        self.rto_deadline = Some(now + self.cur_rto());

        let head = self.rtx.front_mut()?;
        if !head.retransmitted {
            self.retrans_out += 1;
        }
        head.retransmitted = true;
        head.sent_at = now;

        Some((head.seq, head.bytes.clone()))
    }

    /// Local congestion signal (queue pruning, transient drops): reduce
    /// the window without a retransmit.
    pub fn enter_cwr(&mut self) {
        if matches!(self.ca_state, CaState::Cwr | CaState::Recovery | CaState::Loss) {
            return;
        }

        let vars = self.vars();
        self.ssthresh = self.cong.ssthresh(&vars);
        self.cwnd = self.cwnd.min(self.ssthresh);
        self.cwnd_cnt = 0;
        self.high_seq = self.snd_nxt;
        self.ca_state = CaState::Cwr;
    }

    /// Retransmission timer expiry.
    pub fn on_rto(&mut self, now: u64) -> RtoOutcome {
        if self.rtx.is_empty() {
            self.rto_deadline = None;
            return RtoOutcome::Idle;
        }

        self.retries += 1;
        if self.retries > self.cfg.max_retries {
            self.rto_deadline = None;
            return RtoOutcome::Failed;
        }

        // Loss entry: collapse to one segment and save the recovery point.
        if self.ca_state != CaState::Loss {
            let vars = self.vars();
            self.ssthresh = self.cong.ssthresh(&vars);
            self.ca_state = CaState::Loss;
        }
        self.cwnd = 1;
        self.cwnd_cnt = 0;
        self.high_seq = self.snd_nxt;
        self.dup_acks = 0;

        self.backoff += 1;
        let deadline = now + self.cur_rto();
        self.rto_deadline = Some(deadline);

        let Some(head) = self.rtx.front_mut() else {
            return RtoOutcome::Idle;
        };

        if !head.retransmitted {
            self.retrans_out += 1;
        }
        head.retransmitted = true;
        head.sent_at = now;

        RtoOutcome::Retransmit {
            seq: head.seq,
            bytes: head.bytes.clone(),
        }
    }

    // Jacobson '88 in the classic fixed-point form; mdev tracks the
    // mean deviation, rttvar the per-window maximum of mdev.
    fn rtt_update(&mut self, m_ms: u32) {
        let mut m = m_ms.max(1) as i64;

        if self.srtt != 0 {
            m -= (self.srtt >> 3) as i64;
            self.srtt = (self.srtt as i64 + m) as u32;

            if m < 0 {
                m = -m;
                m -= (self.mdev >> 2) as i64;
                if m > 0 {
                    m >>= 3;
                }
            } else {
                m -= (self.mdev >> 2) as i64;
            }

            self.mdev = (self.mdev as i64 + m).max(1) as u32;

            if self.mdev > self.mdev_max {
                self.mdev_max = self.mdev;
                if self.mdev_max > self.rttvar {
                    self.rttvar = self.mdev_max;
                }
            }

            if seq::after(self.snd_una, self.rtt_seq) {
                if self.mdev_max < self.rttvar {
                    self.rttvar -= (self.rttvar - self.mdev_max) >> 2;
                }
                self.rtt_seq = self.snd_nxt;
                self.mdev_max = self.cfg.rto_min_ms as u32;
            }
        } else {
            self.srtt = (m as u32) << 3;
            self.mdev = (m as u32) << 1;
            self.mdev_max = self.mdev.max(self.cfg.rto_min_ms as u32);
            self.rttvar = self.mdev_max;
            self.rtt_seq = self.snd_nxt;
        }

        self.rto_ms = (((self.srtt >> 3) + self.rttvar) as u64)
            .clamp(self.cfg.rto_min_ms, self.cfg.rto_max_ms);
    }

    pub fn srtt_ms(&self) -> u32 {
        self.srtt >> 3
    }

    /// Grow the send buffer after acks freed memory, when the window is
    /// actually the limiting factor and memory is not under pressure.
    pub fn maybe_grow_sndbuf(&mut self, under_pressure: bool) {
        if under_pressure || self.sndbuf >= self.cfg.sndbuf_max {
            return;
        }

        if self.packets_out >= self.cwnd {
            self.sndbuf = (self.sndbuf * 2).min(self.cfg.sndbuf_max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SendEngine {
        let mut send = SendEngine::new(SendConfig::default());
        send.establish(999, 1000, 0);
        send
    }

    #[test]
    fn queue_covers_unacked_range() {
        let mut send = engine();
        send.snd_wnd = 1 << 20;
        send.cwnd = 100;

        assert_eq!(send.write(&[0u8; 2500]), 2500);
        let sent = send.transmit(0);
        assert_eq!(sent.len(), 3);
        assert_eq!(send.queued_range(), Some((1000, 3500)));
        assert_eq!((send.snd_una, send.snd_nxt), (1000, 3500));

        // Partial ack trims the head in place.
        send.on_ack(1500, 0xFFFF, false, 10);
        assert_eq!(send.queued_range(), Some((1500, 3500)));
        assert_eq!(send.snd_una, 1500);

        // Full ack drains the queue and disarms the timer.
        let outcome = send.on_ack(3500, 0xFFFF, false, 20);
        assert!(outcome.queue_drained);
        assert_eq!(send.queued_range(), None);
        assert_eq!(send.rto_deadline(), None);
    }

    #[test]
    fn rto_backoff_schedule() {
        let mut send = engine();
        send.snd_wnd = 1 << 20;

        send.write(&[0u8; 1000]);
        let t0 = 100_000;
        send.transmit(t0);

        let rto = send.rto_ms;
        assert_eq!(send.rto_deadline(), Some(t0 + rto));

        // Fires at t0+rto, t0+3rto, t0+7rto, ... with the doubling
        // clamped at the configured ceiling.
        let cap = SendConfig::default().rto_max_ms;
        let mut expected = t0 + rto;
        for round in 1..=7u32 {
            let now = expected;
            match send.on_rto(now) {
                RtoOutcome::Retransmit { seq, .. } => assert_eq!(seq, 1000),
                other => panic!("round {}: {:?}", round, other),
            }
            expected = now + (rto << round).min(cap);
            assert_eq!(send.rto_deadline(), Some(expected));
            assert_eq!(send.cwnd, 1);
            assert_eq!(send.ca_state, CaState::Loss);
        }

        // Eighth expiry exhausts the attempts.
        assert!(matches!(send.on_rto(expected), RtoOutcome::Failed));
    }

    #[test]
    fn karn_discards_retransmitted_samples() {
        let mut send = engine();
        send.snd_wnd = 1 << 20;

        send.write(&[0u8; 500]);
        send.transmit(0);
        send.on_rto(send.rto_ms);

        let srtt_before = send.srtt_ms();
        send.on_ack(1500, 0xFFFF, false, 50_000);
        // The only segment was retransmitted; no sample may be taken.
        assert_eq!(send.srtt_ms(), srtt_before);
    }

    #[test]
    fn rtt_estimator_converges() {
        let mut send = engine();
        send.snd_wnd = 1 << 20;
        send.cwnd = 1000;

        let mut now = 0;
        for _ in 0..50 {
            send.write(&[0u8; 100]);
            let sent = send.transmit(now);
            assert_eq!(sent.len(), 1);
            now += 100;
            send.on_ack(send.snd_nxt, 0xFFFF, false, now);
        }

        // Steady 100 ms samples: srtt ~ 100, rto floored near
        // srtt + rttvar and clamped above rto_min.
        assert!((90..=110).contains(&send.srtt_ms()), "{}", send.srtt_ms());
        assert!(send.rto_ms >= SendConfig::default().rto_min_ms);
    }

    #[test]
    fn triple_dupack_enters_recovery() {
        let mut send = engine();
        // Matches the raw window in the acks below, so none of them
        // reads as a window update.
        send.snd_wnd = 0xFFFF;
        send.cwnd = 100;

        send.write(&[0u8; 5000]);
        send.transmit(0);
        let cwnd = send.cwnd;

        assert!(send.on_ack(1000, 0xFFFF, false, 1).fast_retransmit.is_none());
        assert!(send.on_ack(1000, 0xFFFF, false, 2).fast_retransmit.is_none());

        let outcome = send.on_ack(1000, 0xFFFF, false, 3);
        let (seq, _) = outcome.fast_retransmit.expect("fast retransmit");
        assert_eq!(seq, 1000);
        assert_eq!(send.ca_state, CaState::Recovery);
        assert!(send.cwnd < cwnd);

        // Ack past the recovery point returns to open.
        send.on_ack(send.snd_nxt, 0xFFFF, false, 10);
        assert_eq!(send.ca_state, CaState::Open);
    }

    #[test]
    fn window_limits_transmission() {
        let mut send = engine();
        send.snd_wnd = 1500;
        send.cwnd = 100;

        send.write(&[0u8; 4000]);
        let sent = send.transmit(0);

        let bytes: usize = sent.iter().map(|(_, b)| b.len()).sum();
        assert_eq!(bytes, 1500);

        // An ack opening the window releases more.
        send.on_ack(1000 + 1500, 4000, false, 1);
        let sent = send.transmit(1);
        assert!(!sent.is_empty());
    }
}
