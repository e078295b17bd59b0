//! Core of the service-centric transport stack.
//!
//! Endpoints are named by flat 256-bit service identifiers; the service
//! table late-binds every outbound packet to one instance of the
//! destination service. Above the resolution layer ride an unreliable
//! datagram transport and a reliable byte-stream transport; beneath it,
//! the service access layer carries handshake, migration and teardown
//! between hosts and a cooperating resolver.
//!
//! The crate is sans-I/O: entry points take the current time and leave
//! outbound packets in a queue the caller drains, which is also what
//! makes the protocol machinery testable without a wire.

pub mod dgram;
pub mod mem;
pub mod routing;
pub mod sal;
pub mod socket;
pub mod stream;
pub mod trie;

use crate::{
    dgram::DgramSocket,
    mem::MemoryAccounting,
    routing::{RouteKind, RouteSpec, ServiceTable, TableStats, pending::PendingQueue},
    sal::SalConfig,
    socket::SocketTable,
    stream::{
        Core, RawPacket, StreamSocket, recv::RecvConfig, send::SendConfig,
    },
};

use std::{
    collections::VecDeque,
    fmt,
    net::Ipv4Addr,
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, Ordering},
    },
};

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use codec::{
    FlowId, ServiceId,
    ctrl::capability,
    sal::{SalFlags, SalHeader},
};
use parking_lot::{Mutex, RwLock};

/// Errors surfaced across the stack's API surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Bind to a service-id already exclusively held.
    AddrNotAvailable,
    /// Send without a peer on an unconnected socket.
    AddrRequired,
    /// Flow id or socket role already taken.
    AddrInUse,
    /// The peer reset the connection attempt.
    ConnectionRefused,
    /// The peer reset an established connection, or retransmission gave
    /// up.
    ConnectionReset,
    /// Local send after the connection was closed in this direction.
    BrokenPipe,
    /// Operation requires a connected or bound socket.
    NotConnected,
    /// Control queue full or receive memory at the hard limit.
    NoBufferSpace,
    /// No matching target entry.
    NoEntry,
    /// Header inconsistent with its declared length.
    Malformed,
    /// Datagram beyond 65535 bytes.
    MessageTooLarge,
    /// Non-blocking operation would have to wait.
    WouldBlock,
    /// Timed out waiting.
    TimedOut,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(_: codec::Error) -> Self {
        Error::Malformed
    }
}

/// Upcall surface towards the resolver and the host environment.
///
/// All notifications are fire-and-forget from the stack's point of
/// view; failures are the handler's problem and never propagate back.
pub trait StackHandler: Send + Sync + 'static {
    /// A send missed the service table; the resolver should install
    /// target entries for `dst`.
    #[allow(unused_variables)]
    fn on_resolve_miss(&self, src: Option<&ServiceId>, dst: &ServiceId, src_addr: Ipv4Addr) {}

    /// A local service was bound.
    #[allow(unused_variables)]
    fn on_register(&self, service: &ServiceId, prefix_bits: u8) {}

    /// A local service bind was dropped.
    #[allow(unused_variables)]
    fn on_unregister(&self, service: &ServiceId, prefix_bits: u8) {}

    /// A connection reached the established state.
    #[allow(unused_variables)]
    fn on_established(&self, flow: FlowId) {}

    /// A connection finished teardown.
    #[allow(unused_variables)]
    fn on_closed(&self, flow: FlowId) {}
}

/// Stack-wide tunables. Deployments override the defaults from
/// configuration.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case", default))]
pub struct StackConfig {
    pub mss: u32,
    pub sal: SalConfig,
    pub send: SendConfig,
    pub recv: RecvConfig,
    /// Soft limit on total socket memory; pressure stops buffer growth.
    pub memory_limit: usize,
    /// Packets parked awaiting resolution.
    pub pending_capacity: usize,
    /// Seconds before a parked packet is dropped.
    pub pending_max_age_s: u64,
}

impl StackConfig {
    fn normalized(mut self) -> Self {
        if self.mss == 0 {
            self.mss = 1460;
        }
        if self.memory_limit == 0 {
            self.memory_limit = 64 * 1024 * 1024;
        }
        if self.pending_capacity == 0 {
            self.pending_capacity = 1024;
        }
        if self.pending_max_age_s == 0 {
            self.pending_max_age_s = 30;
        }
        self
    }
}

pub struct StackOptions<T> {
    pub config: StackConfig,
    /// Our primary source address, carried in resolver upcalls.
    pub local_addr: Ipv4Addr,
    /// Capability bitmap reported to the resolver.
    pub capabilities: u32,
    pub handler: T,
}

/// A packet ready for a packet port.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub bytes: Bytes,
    pub next_hop: Ipv4Addr,
    pub if_index: u32,
}

/// Where `route_and_emit` put the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    Sent { next_hop: Ipv4Addr, if_index: u32 },
    Loopback,
    Parked,
}

/// Selector for a migration directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrateSelector {
    Interface(u32),
    Flow(FlowId),
    Service(ServiceId),
}

pub struct StackInner {
    pub(crate) me: Weak<StackInner>,
    pub config: Arc<StackConfig>,
    pub table: Arc<ServiceTable>,
    pub sockets: SocketTable,
    pub(crate) dgrams: RwLock<HashMap<ServiceId, Arc<DgramSocket>>>,
    pub memory: MemoryAccounting,
    pub(crate) pending: PendingQueue,
    pub(crate) handler: Arc<dyn StackHandler>,
    capabilities: u32,
    local_addr: Mutex<Ipv4Addr>,
    outbound: Mutex<VecDeque<Outbound>>,
    loopback: Mutex<VecDeque<Bytes>>,
    malformed: AtomicU32,
    dropped: AtomicU32,
}

impl StackInner {
    pub(crate) fn emit(&self, out: Outbound) {
        self.outbound.lock().push_back(out);
    }

    pub(crate) fn count_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn local_addr(&self) -> Ipv4Addr {
        *self.local_addr.lock()
    }

    /// Resolve a destination service and dispatch the framed packet:
    /// out an interface, onto the loopback, or parked with an upcall.
    pub(crate) fn route_and_emit(
        &self,
        dst: &ServiceId,
        src: Option<&ServiceId>,
        bytes: Bytes,
    ) -> RouteOutcome {
        let parked = match self.table.resolve(dst) {
            Ok(target) => match target.kind() {
                RouteKind::Forward => {
                    target.charge(bytes.len());
                    let next_hop = target.next_hop();
                    let if_index = target.if_index();
                    self.emit(Outbound {
                        bytes,
                        next_hop,
                        if_index,
                    });
                    return RouteOutcome::Sent { next_hop, if_index };
                }
                RouteKind::Local => {
                    target.charge(bytes.len());
                    self.loopback.lock().push_back(bytes);
                    return RouteOutcome::Loopback;
                }
                RouteKind::Delay => bytes,
            },
            Err(_) => bytes,
        };

        self.pending.park(*dst, parked, self.table.now());
        self.handler.on_resolve_miss(src, dst, self.local_addr());
        RouteOutcome::Parked
    }

    fn transit_forward(&self, dst: &ServiceId, raw: &[u8]) -> bool {
        if self.capabilities & capability::TRANSIT == 0 {
            return false;
        }

        match self.table.resolve(dst) {
            Ok(target) if target.kind() == RouteKind::Forward => {
                target.charge(raw.len());
                self.emit(Outbound {
                    bytes: Bytes::copy_from_slice(raw),
                    next_hop: target.next_hop(),
                    if_index: target.if_index(),
                });
                true
            }
            _ => false,
        }
    }

    fn dispatch(&self, raw: &[u8], src: Ipv4Addr, if_index: u32, now: u64) -> Result<(), Error> {
        let (sal, hdr_len) = match SalHeader::decode(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::debug!("malformed packet from {}: {}", src, err);
                self.count_malformed();
                return Err(Error::Malformed);
            }
        };

        let pkt = RawPacket {
            payload: Bytes::copy_from_slice(&raw[hdr_len..]),
            sal,
            src,
            if_index,
            now,
        };

        // Bound flows demultiplex directly.
        if !pkt.sal.dst_flow.is_none() {
            match self.sockets.lookup_flow(pkt.sal.dst_flow) {
                Some(sock) => sock.deliver(pkt),
                None => self.count_drop(),
            }
            return Ok(());
        }

        // A connection request routes by destination service-id.
        if pkt.sal.flags.contains(SalFlags::CONNECT) && !pkt.sal.flags.contains(SalFlags::ACK) {
            let Some(sid) = pkt.sal.service_id().copied() else {
                self.count_malformed();
                return Err(Error::Malformed);
            };

            if let Some(listener) = self.sockets.lookup_service(&sid) {
                listener.deliver(pkt);
            } else if !self.transit_forward(&sid, raw) {
                self.count_drop();
            }
            return Ok(());
        }

        // No flows, no control flags: a datagram. The destination id is
        // a SAL option, the source id leads the payload.
        if !pkt.sal.flags.is_control() {
            let Some(dst) = pkt.sal.service_id().copied() else {
                self.count_drop();
                return Ok(());
            };

            if pkt.payload.len() < 32 {
                self.count_malformed();
                return Err(Error::Malformed);
            }

            let mut src_sid = [0u8; 32];
            src_sid.copy_from_slice(&pkt.payload[..32]);

            let sock = self.dgrams.read().get(&dst).cloned();
            match sock {
                Some(sock) => {
                    sock.deliver(ServiceId::from_bytes(src_sid), pkt.payload.slice(32..))
                }
                None => {
                    if !self.transit_forward(&dst, raw) {
                        self.count_drop();
                    }
                }
            }
            return Ok(());
        }

        self.count_drop();
        Ok(())
    }

    pub(crate) fn drain_loopback(&self, now: u64) {
        loop {
            let item = self.loopback.lock().pop_front();
            let Some(bytes) = item else {
                break;
            };

            let src = self.local_addr();
            let _ = self.dispatch(&bytes, src, 0, now);
        }
    }
}

/// The assembled stack: resolution table, socket tables, transports.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct Stack {
    inner: Arc<StackInner>,
}

impl Stack {
    pub fn new<T>(options: StackOptions<T>) -> Self
    where
        T: StackHandler,
    {
        let config = Arc::new(options.config.normalized());

        let inner = Arc::new_cyclic(|me| StackInner {
            me: me.clone(),
            memory: MemoryAccounting::new(config.memory_limit),
            pending: PendingQueue::new(config.pending_capacity),
            table: ServiceTable::new(),
            sockets: SocketTable::default(),
            dgrams: RwLock::new(HashMap::with_capacity(16)),
            handler: Arc::new(options.handler),
            capabilities: options.capabilities,
            local_addr: Mutex::new(options.local_addr),
            outbound: Mutex::new(VecDeque::with_capacity(256)),
            loopback: Mutex::new(VecDeque::new()),
            malformed: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
            config,
        });

        Self { inner }
    }

    pub fn table(&self) -> &Arc<ServiceTable> {
        &self.inner.table
    }

    pub fn capabilities(&self) -> u32 {
        self.inner.capabilities
    }

    pub fn set_local_addr(&self, addr: Ipv4Addr) {
        *self.inner.local_addr.lock() = addr;
    }

    /// Packets counted and dropped on parse failure.
    pub fn malformed(&self) -> u32 {
        self.inner.malformed.load(Ordering::Relaxed)
    }

    /// Packets counted and dropped for other reasons (no socket, no
    /// route, backlog overflow).
    pub fn dropped(&self) -> u32 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Create a stream socket, indexed under a fresh flow id.
    pub fn socket(&self) -> Arc<StreamSocket> {
        let flow = self.inner.sockets.alloc_flow();
        let core = Core::new(&self.inner, flow);
        let sock = StreamSocket::from_core(Arc::downgrade(&self.inner), core);

        if let Err(err) = self.inner.sockets.hash_flow(flow, sock.clone()) {
            log::error!("fresh flow {} already hashed: {}", flow, err);
        }

        sock
    }

    /// Create a datagram socket bound to a service id.
    pub fn dgram(&self, bind: ServiceId) -> Result<Arc<DgramSocket>, Error> {
        let mut dgrams = self.inner.dgrams.write();

        if dgrams.contains_key(&bind) {
            return Err(Error::AddrNotAvailable);
        }

        let sock = Arc::new(DgramSocket::new(Arc::downgrade(&self.inner), bind));
        dgrams.insert(bind, sock.clone());
        Ok(sock)
    }

    /// Feed one inbound frame from a packet port. Parse failures are
    /// counted and reported, never surfaced to applications.
    pub fn handle_packet(
        &self,
        raw: &[u8],
        src: Ipv4Addr,
        if_index: u32,
        now: u64,
    ) -> Result<(), Error> {
        let result = self.inner.dispatch(raw, src, if_index, now);
        self.inner.drain_loopback(now);
        result
    }

    /// Take the next packet to put on the wire.
    pub fn pop_outbound(&self) -> Option<Outbound> {
        self.inner.outbound.lock().pop_front()
    }

    /// Drive every socket's timers. The daemon calls this on a short
    /// period; tests call it with synthetic time.
    pub fn on_tick(&self, now: u64) {
        for sock in self.inner.sockets.all() {
            sock.tick(now);
        }

        self.inner
            .pending
            .expire(self.inner.table.now(), self.inner.config.pending_max_age_s);
        self.inner.drain_loopback(now);
    }

    // ---- control plane ----------------------------------------------

    /// Install a local bind in the service table and notify the
    /// resolver.
    pub fn register(&self, prefix: &ServiceId, bits: u16, if_index: u32) {
        self.inner
            .table
            .add(prefix, bits, &RouteSpec::local(if_index));
        self.inner.handler.on_register(prefix, bits as u8);
    }

    pub fn unregister(&self, prefix: &ServiceId, bits: u16, if_index: u32) -> Result<(), Error> {
        self.inner
            .table
            .del(prefix, bits, Some((Ipv4Addr::UNSPECIFIED, if_index)))?;
        self.inner.handler.on_unregister(prefix, bits as u8);
        Ok(())
    }

    /// Install a target entry and retry packets parked on the prefix.
    pub fn add_route(&self, prefix: &ServiceId, bits: u16, spec: &RouteSpec) {
        self.inner.table.add(prefix, bits, spec);

        for parked in self.inner.pending.drain(prefix, bits) {
            match self.inner.table.resolve(&parked.dst) {
                Ok(target) => match target.kind() {
                    RouteKind::Forward => {
                        target.charge(parked.bytes.len());
                        self.inner.emit(Outbound {
                            bytes: parked.bytes,
                            next_hop: target.next_hop(),
                            if_index: target.if_index(),
                        });
                    }
                    RouteKind::Local => {
                        target.charge(parked.bytes.len());
                        self.inner.loopback.lock().push_back(parked.bytes);
                    }
                    RouteKind::Delay => {
                        self.inner.count_drop();
                    }
                },
                Err(_) => self.inner.count_drop(),
            }
        }
    }

    pub fn mod_route(&self, prefix: &ServiceId, bits: u16, spec: &RouteSpec) -> Result<(), Error> {
        self.inner.table.modify(prefix, bits, spec)
    }

    pub fn del_route(
        &self,
        prefix: &ServiceId,
        bits: u16,
        selector: Option<(Ipv4Addr, u32)>,
    ) -> Result<usize, Error> {
        self.inner.table.del(prefix, bits, selector)
    }

    pub fn get_routes(
        &self,
        prefix: &ServiceId,
        bits: u16,
    ) -> Vec<(ServiceId, u16, Arc<routing::RouteEntry>)> {
        self.inner.table.walk(prefix, bits)
    }

    pub fn stats(&self) -> TableStats {
        self.inner.table.stats()
    }

    /// Migrate matching sockets to a new egress interface, announcing
    /// the new source address to their peers.
    pub fn migrate(
        &self,
        selector: &MigrateSelector,
        to_if_index: u32,
        new_source: Ipv4Addr,
        now: u64,
    ) -> usize {
        let mut migrated = 0;

        for sock in self.inner.sockets.all() {
            if sock.migrate_if_matches(selector, to_if_index, new_source, now) {
                migrated += 1;
            }
        }

        migrated
    }
}
