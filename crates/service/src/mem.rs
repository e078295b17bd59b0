//! Socket memory accounting.
//!
//! Every socket charges its queued bytes against a shared gauge in
//! page-sized quanta. When the total crosses the soft limit a pressure
//! flag turns on; window tuning and send-buffer growth become no-ops
//! until it clears. The flag is probed, never held.

use std::sync::atomic::{AtomicIsize, Ordering};

pub const QUANTUM: usize = 4096;

/// Shared gauge of reserved socket memory.
///
/// # Test
///
/// ```
/// use svc_stack_service::mem::{ForwardAlloc, MemoryAccounting, QUANTUM};
///
/// let mem = MemoryAccounting::new(2 * QUANTUM);
/// let mut fwd = ForwardAlloc::default();
///
/// assert!(fwd.charge(&mem, 100));
/// assert!(!mem.under_pressure());
///
/// // Reservations are made in whole quanta.
/// assert_eq!(mem.allocated(), QUANTUM as isize);
///
/// fwd.uncharge(100);
/// fwd.reclaim(&mem);
/// assert_eq!(mem.allocated(), 0);
/// ```
pub struct MemoryAccounting {
    allocated: AtomicIsize,
    soft_limit: isize,
}

impl MemoryAccounting {
    pub fn new(soft_limit: usize) -> Self {
        Self {
            allocated: AtomicIsize::new(0),
            soft_limit: soft_limit as isize,
        }
    }

    pub fn allocated(&self) -> isize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Soft limit exceeded: stop growing windows and buffers.
    pub fn under_pressure(&self) -> bool {
        self.allocated() > self.soft_limit
    }

    /// Hard limit exceeded: refuse further receive memory outright.
    pub fn at_hard_limit(&self) -> bool {
        self.allocated() > self.soft_limit * 2
    }

    fn add(&self, quanta: isize) {
        self.allocated.fetch_add(quanta, Ordering::Relaxed);
    }
}

/// Per-socket forward allocation: bytes reserved from the shared gauge
/// but not yet consumed by queued data.
#[derive(Debug, Default)]
pub struct ForwardAlloc {
    reserved: isize,
    charged: isize,
}

impl ForwardAlloc {
    /// Reserve `size` bytes for queued data, extending the reservation in
    /// whole quanta as needed. Fails only at the hard limit.
    pub fn charge(&mut self, mem: &MemoryAccounting, size: usize) -> bool {
        let size = size as isize;

        if self.reserved < size {
            if mem.at_hard_limit() {
                return false;
            }

            let want = size - self.reserved;
            let quanta = (want + QUANTUM as isize - 1) / QUANTUM as isize * QUANTUM as isize;
            mem.add(quanta);
            self.charged += quanta;
            self.reserved += quanta;
        }

        self.reserved -= size;
        true
    }

    /// Return `size` consumed bytes to the reservation.
    pub fn uncharge(&mut self, size: usize) {
        self.reserved += size as isize;
    }

    /// Hand whole unused quanta back to the shared gauge, keeping at most
    /// one in reserve.
    pub fn reclaim(&mut self, mem: &MemoryAccounting) {
        if self.reserved >= QUANTUM as isize {
            let spare = self.reserved / QUANTUM as isize * QUANTUM as isize;
            self.reserved -= spare;
            self.charged -= spare;
            mem.add(-spare);
        }
    }

    /// Drop the whole reservation, e.g. on socket destruction.
    pub fn release(&mut self, mem: &MemoryAccounting) {
        mem.add(-self.charged);
        self.charged = 0;
        self.reserved = 0;
    }
}
