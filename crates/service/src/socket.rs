//! The connection socket table.
//!
//! Two concurrent indexes cover every active stream socket: a map by
//! local flow-id, consulted on every inbound packet after SAL demux,
//! and a prefix trie by bound service-id, consulted when a connect
//! arrives for a listener. A listener may bind a covering prefix, so
//! the service lookup is a longest-prefix match like the service table:
//! an exact bind wins, then the deepest covering prefix, down to a
//! default listener at /0. Lookups hand out owned `Arc` clones; a
//! socket is destroyed only once the table entry and every other
//! holder are gone.

use crate::{Error, stream::StreamSocket, trie::PrefixTrie};

use std::sync::Arc;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use codec::{FlowId, ServiceId};
use parking_lot::{Mutex, RwLock};
use rand::Rng;

/// Allocates unique nonzero flow identifiers over the live socket set.
///
/// # Test
///
/// ```
/// use codec::FlowId;
/// use svc_stack_service::socket::FlowAllocator;
///
/// let mut flows = FlowAllocator::default();
///
/// let a = flows.alloc();
/// let b = flows.alloc();
/// assert_ne!(a, b);
/// assert!(!a.is_none());
///
/// // Claiming a live id is address-in-use.
/// assert!(flows.claim(a).is_err());
///
/// flows.release(a);
/// assert!(flows.claim(a).is_ok());
/// ```
#[derive(Default)]
pub struct FlowAllocator {
    live: HashSet<u32>,
}

impl FlowAllocator {
    /// Draw a fresh id. The space is 2³²; collisions against the live
    /// set are retried.
    pub fn alloc(&mut self) -> FlowId {
        loop {
            let id: u32 = rand::rng().random();
            if id != 0 && self.live.insert(id) {
                return FlowId::new(id);
            }
        }
    }

    /// Claim a specific id.
    pub fn claim(&mut self, id: FlowId) -> Result<(), Error> {
        if id.is_none() || !self.live.insert(id.get()) {
            return Err(Error::AddrInUse);
        }

        Ok(())
    }

    pub fn release(&mut self, id: FlowId) {
        self.live.remove(&id.get());
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

// One bound prefix carries at most one listener and one non-listening
// bound socket; accepted children are indexed by flow only.
#[derive(Default)]
struct ServiceSlot {
    listener: Option<Arc<StreamSocket>>,
    bound: Option<Arc<StreamSocket>>,
}

impl ServiceSlot {
    fn is_empty(&self) -> bool {
        self.listener.is_none() && self.bound.is_none()
    }

    fn occupied(&self) -> bool {
        !self.is_empty()
    }
}

pub struct SocketTable {
    by_flow: RwLock<HashMap<u32, Arc<StreamSocket>>>,
    by_service: RwLock<PrefixTrie<ServiceSlot>>,
    flows: Mutex<FlowAllocator>,
}

impl Default for SocketTable {
    fn default() -> Self {
        Self {
            by_flow: RwLock::new(HashMap::with_capacity(1024)),
            by_service: RwLock::new(PrefixTrie::default()),
            flows: Mutex::new(FlowAllocator::default()),
        }
    }
}

impl SocketTable {
    pub fn alloc_flow(&self) -> FlowId {
        self.flows.lock().alloc()
    }

    /// Index a socket under its local flow-id. Exactly one socket per
    /// id; the allocator makes collisions impossible in practice.
    pub fn hash_flow(&self, flow: FlowId, socket: Arc<StreamSocket>) -> Result<(), Error> {
        let mut by_flow = self.by_flow.write();

        if by_flow.contains_key(&flow.get()) {
            return Err(Error::AddrInUse);
        }

        by_flow.insert(flow.get(), socket);
        Ok(())
    }

    /// Index a socket under a bound service-id prefix. A second
    /// non-listening bind of the same prefix is refused; a listener may
    /// coexist.
    pub fn hash_service(
        &self,
        service: &ServiceId,
        bits: u16,
        socket: Arc<StreamSocket>,
    ) -> Result<(), Error> {
        let mut by_service = self.by_service.write();

        if by_service.get(service, bits).is_none() {
            by_service.insert(service, bits, ServiceSlot::default());
        }

        let slot = by_service.get_mut(service, bits).ok_or(Error::NotConnected)?;
        if slot.bound.is_some() {
            return Err(Error::AddrNotAvailable);
        }

        slot.bound = Some(socket);
        Ok(())
    }

    /// Move a bound socket into the listener role.
    pub fn promote_listener(
        &self,
        service: &ServiceId,
        bits: u16,
        socket: &Arc<StreamSocket>,
    ) -> Result<(), Error> {
        let mut by_service = self.by_service.write();
        let slot = by_service
            .get_mut(service, bits)
            .ok_or(Error::NotConnected)?;

        if slot.listener.is_some() {
            return Err(Error::AddrNotAvailable);
        }

        if slot
            .bound
            .as_ref()
            .is_some_and(|bound| Arc::ptr_eq(bound, socket))
        {
            slot.listener = slot.bound.take();
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    pub fn unhash_flow(&self, flow: FlowId) {
        self.by_flow.write().remove(&flow.get());
        self.flows.lock().release(flow);
    }

    pub fn unhash_service(&self, service: &ServiceId, bits: u16, socket: &Arc<StreamSocket>) {
        let mut by_service = self.by_service.write();

        let emptied = match by_service.get_mut(service, bits) {
            Some(slot) => {
                if slot
                    .listener
                    .as_ref()
                    .is_some_and(|existing| Arc::ptr_eq(existing, socket))
                {
                    slot.listener = None;
                }

                if slot
                    .bound
                    .as_ref()
                    .is_some_and(|existing| Arc::ptr_eq(existing, socket))
                {
                    slot.bound = None;
                }

                slot.is_empty()
            }
            None => false,
        };

        if emptied {
            by_service.remove(service, bits);
        }
    }

    pub fn lookup_flow(&self, flow: FlowId) -> Option<Arc<StreamSocket>> {
        self.by_flow.read().get(&flow.get()).cloned()
    }

    /// The socket answering for a service id: the deepest bound prefix
    /// covering it, preferring a listener within the winning slot. An
    /// exact bind is the deepest match by construction; a listener
    /// bound at /0 acts as the default.
    pub fn lookup_service(&self, service: &ServiceId) -> Option<Arc<StreamSocket>> {
        let by_service = self.by_service.read();
        let (_, _, slot) =
            by_service.find_longest_match(service, ServiceId::BITS, ServiceSlot::occupied)?;

        slot.listener.clone().or_else(|| slot.bound.clone())
    }

    pub fn len(&self) -> usize {
        self.by_flow.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every active socket, for the timer sweep.
    pub fn all(&self) -> Vec<Arc<StreamSocket>> {
        self.by_flow.read().values().cloned().collect()
    }
}
