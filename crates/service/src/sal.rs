//! Service access layer state machine.
//!
//! Per-socket control protocol: handshake, migration and teardown, with
//! its own bounded retransmission queue paced by a single exponential
//! backoff timer. Transport payload never passes through here; the SAL
//! only owns control packets.

use crate::Error;

use std::collections::VecDeque;

use codec::sal::{SalFlags, SalOption};

/// Per-socket SAL states. `Closed` is both initial and terminal;
/// migration is an orthogonal flag on the socket, not a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SalState {
    Closed,
    /// Active open sent, awaiting the connect-ack.
    Request,
    /// Passive open received, awaiting the first ack.
    Respond,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

impl SalState {
    /// States with synchronized sequence numbers, i.e. the transport may
    /// process segments.
    pub fn is_synchronized(&self) -> bool {
        !matches!(self, SalState::Closed | SalState::Request | SalState::Respond)
    }

    /// The local side already sent its fin.
    pub fn local_closed(&self) -> bool {
        matches!(
            self,
            SalState::FinWait1
                | SalState::FinWait2
                | SalState::Closing
                | SalState::TimeWait
                | SalState::LastAck
        )
    }
}

impl std::fmt::Display for SalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case", default))]
pub struct SalConfig {
    /// First retransmission delay.
    pub rexmit_base_ms: u64,
    /// Backoff ceiling.
    pub rexmit_cap_ms: u64,
    /// Attempts before the socket is marked failed.
    pub max_attempts: u32,
    /// Control-queue length bound.
    pub queue_limit: usize,
    /// Maximum segment lifetime; time-wait lasts twice this.
    pub msl_ms: u64,
}

impl Default for SalConfig {
    fn default() -> Self {
        Self {
            rexmit_base_ms: 3_000,
            rexmit_cap_ms: 60_000,
            max_attempts: 7,
            queue_limit: 20,
            msl_ms: 30_000,
        }
    }
}

/// A control packet awaiting acknowledgment. The wire form is rebuilt at
/// each (re)transmission so it always carries the current flow ids.
#[derive(Debug, Clone)]
pub struct QueuedControl {
    pub seqno: u32,
    pub flags: SalFlags,
    pub options: Vec<SalOption>,
}

/// Timer verdict for the control queue.
#[derive(Debug, PartialEq, Eq)]
pub enum CtrlTimer {
    /// Nothing due.
    Idle,
    /// Resend the queue head.
    Retransmit,
    /// Attempts exhausted.
    Failed,
}

/// The SAL retransmission queue.
///
/// Only the head is ever retransmitted; acks advance the head. The
/// timer backs off exponentially from the configured base, doubling per
/// attempt up to the cap.
///
/// # Test
///
/// ```
/// use codec::sal::{SalFlags, SalOption};
/// use svc_stack_service::sal::{ControlQueue, CtrlTimer, QueuedControl, SalConfig};
///
/// let mut queue = ControlQueue::new(SalConfig::default());
///
/// queue
///     .push(
///         QueuedControl {
///             seqno: 100,
///             flags: SalFlags::CONNECT,
///             options: vec![],
///         },
///         0,
///     )
///     .unwrap();
///
/// // First retransmission after the base delay, then doubling.
/// assert_eq!(queue.deadline(), Some(3_000));
/// assert_eq!(queue.fire(3_000), CtrlTimer::Retransmit);
/// assert_eq!(queue.deadline(), Some(3_000 + 6_000));
///
/// // The ack drains the queue and disarms the timer.
/// assert!(queue.on_ack(101, 4_000));
/// assert_eq!(queue.deadline(), None);
/// assert!(queue.is_empty());
/// ```
pub struct ControlQueue {
    cfg: SalConfig,
    queue: VecDeque<QueuedControl>,
    attempts: u32,
    backoff: u32,
    deadline: Option<u64>,
}

impl ControlQueue {
    pub fn new(cfg: SalConfig) -> Self {
        Self {
            cfg,
            queue: VecDeque::new(),
            attempts: 0,
            backoff: 0,
            deadline: None,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn head(&self) -> Option<&QueuedControl> {
        self.queue.front()
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    pub fn msl_ms(&self) -> u64 {
        self.cfg.msl_ms
    }

    /// Queue a control packet. The caller transmits it immediately; the
    /// queue only schedules retransmissions.
    pub fn push(&mut self, packet: QueuedControl, now: u64) -> Result<(), Error> {
        if self.queue.len() >= self.cfg.queue_limit {
            return Err(Error::NoBufferSpace);
        }

        self.queue.push_back(packet);

        if self.deadline.is_none() {
            self.deadline = Some(now + self.cfg.rexmit_base_ms);
        }

        Ok(())
    }

    /// Cumulative control-level ack: drop acknowledged packets from the
    /// head. Returns whether the head advanced.
    pub fn on_ack(&mut self, ackno: u32, now: u64) -> bool {
        let mut advanced = false;

        while let Some(head) = self.queue.front() {
            if (ackno.wrapping_sub(head.seqno) as i32) > 0 {
                self.queue.pop_front();
                advanced = true;
            } else {
                break;
            }
        }

        if advanced {
            self.attempts = 0;
            self.backoff = 0;
            self.deadline = if self.queue.is_empty() {
                None
            } else {
                Some(now + self.cfg.rexmit_base_ms)
            };
        }

        advanced
    }

    /// Drive the retransmission timer.
    pub fn fire(&mut self, now: u64) -> CtrlTimer {
        let Some(deadline) = self.deadline else {
            return CtrlTimer::Idle;
        };

        if now < deadline || self.queue.is_empty() {
            return CtrlTimer::Idle;
        }

        self.attempts += 1;
        if self.attempts >= self.cfg.max_attempts {
            self.deadline = None;
            return CtrlTimer::Failed;
        }

        self.backoff += 1;
        let delay = (self.cfg.rexmit_base_ms << self.backoff.min(16)).min(self.cfg.rexmit_cap_ms);
        self.deadline = Some(now + delay);

        CtrlTimer::Retransmit
    }

    /// Drop everything, e.g. on reset.
    pub fn purge(&mut self) {
        self.queue.clear();
        self.deadline = None;
        self.attempts = 0;
        self.backoff = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seqno: u32) -> QueuedControl {
        QueuedControl {
            seqno,
            flags: SalFlags::CONNECT,
            options: vec![],
        }
    }

    #[test]
    fn queue_bound() {
        let cfg = SalConfig {
            queue_limit: 2,
            ..SalConfig::default()
        };
        let mut queue = ControlQueue::new(cfg);

        queue.push(packet(1), 0).unwrap();
        queue.push(packet(2), 0).unwrap();
        assert!(matches!(queue.push(packet(3), 0), Err(Error::NoBufferSpace)));
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut queue = ControlQueue::new(SalConfig::default());
        queue.push(packet(1), 0).unwrap();

        let mut now = 0;
        let mut delays = Vec::new();

        for _ in 0..6 {
            now = queue.deadline().unwrap();
            let verdict = queue.fire(now);
            assert_eq!(verdict, CtrlTimer::Retransmit);
            delays.push(queue.deadline().unwrap() - now);
        }

        // 6s, 12s, 24s, 48s then pinned at the 60s cap.
        assert_eq!(delays, vec![6_000, 12_000, 24_000, 48_000, 60_000, 60_000]);

        // Seventh attempt exhausts the budget.
        now = queue.deadline().unwrap();
        assert_eq!(queue.fire(now), CtrlTimer::Failed);
    }

    #[test]
    fn partial_ack_advances_head() {
        let mut queue = ControlQueue::new(SalConfig::default());
        queue.push(packet(10), 0).unwrap();
        queue.push(packet(11), 0).unwrap();

        assert!(queue.on_ack(11, 100));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.head().unwrap().seqno, 11);

        // Ack below the head changes nothing.
        assert!(!queue.on_ack(11, 200));
        assert_eq!(queue.len(), 1);
    }
}
