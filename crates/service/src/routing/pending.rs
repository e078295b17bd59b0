//! Packets parked while waiting for the resolver.
//!
//! A send that misses the service table fires an upcall and parks the
//! fully framed packet here; the control-plane `add` drains matching
//! packets back out so the caller can retry them.

use std::sync::atomic::{AtomicU32, Ordering};

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use codec::ServiceId;
use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct ParkedPacket {
    pub dst: ServiceId,
    pub bytes: Bytes,
    pub parked_at: u64,
}

struct Inner {
    map: HashMap<ServiceId, Vec<ParkedPacket>>,
    queued: usize,
}

/// Bounded park-and-retry buffer keyed by destination service-id.
///
/// # Test
///
/// ```
/// use bytes::Bytes;
/// use codec::ServiceId;
/// use svc_stack_service::routing::pending::PendingQueue;
///
/// let queue = PendingQueue::new(2);
/// let dst = ServiceId::from_bytes([1; 32]);
///
/// assert!(queue.park(dst, Bytes::from_static(b"x"), 0));
/// assert!(queue.park(dst, Bytes::from_static(b"y"), 0));
///
/// // Full: the packet is dropped and counted.
/// assert!(!queue.park(dst, Bytes::from_static(b"z"), 0));
/// assert_eq!(queue.dropped(), 1);
///
/// let drained = queue.drain(&dst, 256);
/// assert_eq!(drained.len(), 2);
/// assert_eq!(queue.len(), 0);
/// ```
pub struct PendingQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    dropped: AtomicU32,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::with_capacity(64),
                queued: 0,
            }),
            capacity,
            dropped: AtomicU32::new(0),
        }
    }

    /// Park a packet. Returns false when the queue is full; the packet is
    /// then dropped and counted, never surfaced to the application.
    pub fn park(&self, dst: ServiceId, bytes: Bytes, now: u64) -> bool {
        let mut inner = self.inner.lock();

        if inner.queued >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        inner.queued += 1;
        inner.map.entry(dst).or_default().push(ParkedPacket {
            dst,
            bytes,
            parked_at: now,
        });

        true
    }

    /// Take every parked packet whose destination falls under the given
    /// prefix.
    pub fn drain(&self, prefix: &ServiceId, bits: u16) -> Vec<ParkedPacket> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();

        inner.map.retain(|dst, packets| {
            if dst.has_prefix(prefix, bits) {
                out.append(packets);
                false
            } else {
                true
            }
        });

        inner.queued -= out.len();
        out
    }

    /// Drop packets parked longer than `max_age` seconds.
    pub fn expire(&self, now: u64, max_age: u64) -> usize {
        let mut inner = self.inner.lock();
        let mut expired = 0;

        inner.map.retain(|_, packets| {
            let before = packets.len();
            packets.retain(|packet| now.saturating_sub(packet.parked_at) < max_age);
            expired += before - packets.len();
            !packets.is_empty()
        });

        inner.queued -= expired;
        self.dropped.fetch_add(expired as u32, Ordering::Relaxed);
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queued
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}
