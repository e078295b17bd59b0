//! Pluggable congestion control.
//!
//! The send engine drives a small capability with two required methods
//! and one optional hook. Reno is the only implementation; selective
//! acknowledgment is refused at handshake time, so nothing fancier can
//! be negotiated.

/// The congestion variables an algorithm may read and write. `cwnd` and
/// `ssthresh` are in segments.
#[derive(Debug, Clone, Copy)]
pub struct CongestionVars {
    pub cwnd: u32,
    pub ssthresh: u32,
    pub cwnd_cnt: u32,
    pub mss: u32,
}

pub trait CongestionOps: Send {
    fn name(&self) -> &'static str;

    /// Slow-start threshold to adopt on loss entry.
    fn ssthresh(&mut self, vars: &CongestionVars) -> u32;

    /// Grow the window on an unambiguous ack that advances data.
    fn cong_avoid(&mut self, vars: &mut CongestionVars, ack: u32, in_flight: u32);

    /// Optional per-ack hook with the round-trip sample.
    fn pkts_acked(&mut self, _vars: &CongestionVars, _pkts: u32, _rtt_us: u32) {}
}

/// NewReno-style additive increase / multiplicative decrease.
///
/// # Test
///
/// ```
/// use svc_stack_service::stream::congestion::{CongestionOps, CongestionVars, Reno};
///
/// let mut reno = Reno;
/// let mut vars = CongestionVars {
///     cwnd: 4,
///     ssthresh: 8,
///     cwnd_cnt: 0,
///     mss: 1460,
/// };
///
/// // Slow start doubles per round trip: one segment per ack.
/// reno.cong_avoid(&mut vars, 0, 4);
/// assert_eq!(vars.cwnd, 5);
///
/// // Loss halves, floored at two segments.
/// assert_eq!(reno.ssthresh(&vars), 2);
/// vars.cwnd = 2;
/// assert_eq!(reno.ssthresh(&vars), 2);
/// ```
pub struct Reno;

impl CongestionOps for Reno {
    fn name(&self) -> &'static str {
        "reno"
    }

    fn ssthresh(&mut self, vars: &CongestionVars) -> u32 {
        (vars.cwnd / 2).max(2)
    }

    fn cong_avoid(&mut self, vars: &mut CongestionVars, _ack: u32, in_flight: u32) {
        // Application limited: no point inflating a window we don't use.
        if in_flight < vars.cwnd && vars.cwnd > vars.ssthresh {
            return;
        }

        if vars.cwnd <= vars.ssthresh {
            // Slow start.
            vars.cwnd += 1;
        } else if vars.cwnd_cnt >= vars.cwnd {
            // Congestion avoidance: one segment per window.
            vars.cwnd_cnt = 0;
            vars.cwnd += 1;
        } else {
            vars.cwnd_cnt += 1;
        }
    }
}

/// Initial congestion window per RFC 3390, in segments.
///
/// # Test
///
/// ```
/// use svc_stack_service::stream::congestion::initial_cwnd;
///
/// assert_eq!(initial_cwnd(1460), 3);
/// assert_eq!(initial_cwnd(1095), 4);
/// assert_eq!(initial_cwnd(2400), 2);
/// ```
pub fn initial_cwnd(mss: u32) -> u32 {
    if mss > 2190 {
        2
    } else if mss > 1095 {
        3
    } else {
        4
    }
}
