//! The service resolution table.
//!
//! Maps service-id prefixes to lists of target entries and answers the
//! destination lookup for every outbound packet: longest-prefix match
//! over non-empty nodes, then weighted selection within the lowest
//! priority class present.

pub mod pending;

use crate::{Error, trie::PrefixTrie};

use std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use codec::ServiceId;
use parking_lot::RwLock;
use rand::Rng;

/// What resolving to a target entry means for the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RouteKind {
    /// Demultiplex to a local socket.
    Local = 1,
    /// Forward to the entry's next hop.
    Forward = 2,
    /// Park the packet and wait for the resolver.
    Delay = 3,
}

impl TryFrom<u16> for RouteKind {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Error> {
        Ok(match value {
            1 => Self::Local,
            2 => Self::Forward,
            3 => Self::Delay,
            _ => return Err(Error::Malformed),
        })
    }
}

/// Caller-supplied description of one target entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    pub kind: RouteKind,
    pub next_hop: Ipv4Addr,
    pub if_index: u32,
    /// Lower is preferred.
    pub priority: u32,
    /// Selection weight within a priority class.
    pub weight: u32,
    /// Seconds without activity before eviction; 0 disables.
    pub idle_timeout: u32,
    /// Seconds after creation before eviction; 0 disables.
    pub hard_timeout: u32,
}

impl RouteSpec {
    pub fn forward(next_hop: Ipv4Addr, if_index: u32) -> Self {
        Self {
            kind: RouteKind::Forward,
            next_hop,
            if_index,
            priority: 0,
            weight: 1,
            idle_timeout: 0,
            hard_timeout: 0,
        }
    }

    pub fn local(if_index: u32) -> Self {
        Self {
            kind: RouteKind::Local,
            next_hop: Ipv4Addr::UNSPECIFIED,
            if_index,
            priority: 0,
            weight: 1,
            idle_timeout: 0,
            hard_timeout: 0,
        }
    }
}

/// Monotonic per-table second counter, advanced by the sweeper.
///
/// # Test
///
/// ```
/// use svc_stack_service::routing::Timer;
///
/// let timer = Timer::default();
///
/// assert_eq!(timer.get(), 0);
/// assert_eq!(timer.add(), 1);
/// assert_eq!(timer.get(), 1);
/// ```
#[derive(Default)]
pub struct Timer(AtomicU64);

impl Timer {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn add(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Monotonic counter bundle attached to every target entry. Wraparound
/// at 2³² is accepted.
#[derive(Debug, Default)]
pub struct TargetCounters {
    pub packets_resolved: AtomicU32,
    pub bytes_resolved: AtomicU32,
    pub packets_dropped: AtomicU32,
    pub bytes_dropped: AtomicU32,
    pub tokens_consumed: AtomicU32,
}

impl TargetCounters {
    fn charge(&self, bytes: usize) {
        self.packets_resolved.fetch_add(1, Ordering::Relaxed);
        self.bytes_resolved.fetch_add(bytes as u32, Ordering::Relaxed);
    }

    fn charge_drop(&self, bytes: usize) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        self.bytes_dropped.fetch_add(bytes as u32, Ordering::Relaxed);
    }
}

/// One reachable instance of a service.
#[derive(Debug)]
pub struct RouteEntry {
    pub kind: RouteKind,
    pub next_hop: Ipv4Addr,
    pub if_index: u32,
    pub priority: u32,
    pub weight: u32,
    pub idle_timeout: u32,
    pub hard_timeout: u32,
    created: u64,
    last_active: AtomicU64,
    pub counters: TargetCounters,
}

impl RouteEntry {
    fn new(spec: &RouteSpec, now: u64) -> Arc<Self> {
        Arc::new(Self {
            kind: spec.kind,
            next_hop: spec.next_hop,
            if_index: spec.if_index,
            priority: spec.priority,
            weight: spec.weight,
            idle_timeout: spec.idle_timeout,
            hard_timeout: spec.hard_timeout,
            created: now,
            last_active: AtomicU64::new(now),
            counters: TargetCounters::default(),
        })
    }

    fn matches(&self, next_hop: &Ipv4Addr, if_index: u32) -> bool {
        self.next_hop == *next_hop && self.if_index == if_index
    }

    fn expired(&self, now: u64) -> bool {
        if self.hard_timeout != 0 && now >= self.created + self.hard_timeout as u64 {
            return true;
        }

        self.idle_timeout != 0
            && now >= self.last_active.load(Ordering::Relaxed) + self.idle_timeout as u64
    }

    /// Seconds this entry has been installed.
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.created)
    }
}

struct NodeEntries {
    entries: Vec<Arc<RouteEntry>>,
    // Rotation cursor for round-robin over zero-weight classes.
    cursor: AtomicUsize,
}

// Structural comparison for tests; the cursor is selection state, not
// table content.
impl PartialEq for NodeEntries {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(a, b)| a.matches(&b.next_hop, b.if_index))
    }
}

impl Eq for NodeEntries {}

impl std::fmt::Debug for NodeEntries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEntries")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// A selected target, handed back to the caller of `resolve`.
///
/// The caller charges the entry exactly once per packet: `charge` when
/// the packet went out, `charge_drop` when it was dropped afterwards.
pub struct Resolved {
    entry: Arc<RouteEntry>,
    totals: Arc<TargetCounters>,
}

impl Resolved {
    pub fn kind(&self) -> RouteKind {
        self.entry.kind
    }

    pub fn next_hop(&self) -> Ipv4Addr {
        self.entry.next_hop
    }

    pub fn if_index(&self) -> u32 {
        self.entry.if_index
    }

    pub fn entry(&self) -> &Arc<RouteEntry> {
        &self.entry
    }

    pub fn charge(&self, bytes: usize) {
        self.entry.counters.charge(bytes);
        self.totals.charge(bytes);
    }

    pub fn charge_drop(&self, bytes: usize) {
        self.entry.counters.charge_drop(bytes);
        self.totals.charge_drop(bytes);
    }
}

/// Aggregate table statistics served over the control socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableStats {
    pub services: u32,
    pub instances: u32,
    pub packets_resolved: u32,
    pub bytes_resolved: u32,
    pub packets_dropped: u32,
    pub bytes_dropped: u32,
}

/// The trie-backed service table.
///
/// # Test
///
/// ```
/// use svc_stack_service::routing::*;
/// use codec::ServiceId;
///
/// let table = ServiceTable::new();
///
/// let mut key = [0u8; 32];
/// key[0] = 0x01;
/// let prefix = ServiceId::from_bytes(key);
///
/// table.add(&prefix, 8, &RouteSpec::forward("10.0.0.1".parse().unwrap(), 1));
///
/// let target = table.resolve(&prefix).unwrap();
/// assert_eq!(target.next_hop(), "10.0.0.1".parse::<std::net::Ipv4Addr>().unwrap());
///
/// let mut other = [0u8; 32];
/// other[0] = 0x02;
/// assert!(table.resolve(&ServiceId::from_bytes(other)).is_err());
/// ```
pub struct ServiceTable {
    routes: RwLock<PrefixTrie<NodeEntries>>,
    totals: Arc<TargetCounters>,
    instances: AtomicUsize,
    timer: Timer,
}

impl ServiceTable {
    /// Create the table and its eviction sweeper.
    ///
    /// The sweeper advances the table clock once a second and removes
    /// entries whose idle or hard timeout has elapsed; it exits when the
    /// last handle to the table is dropped.
    pub fn new() -> Arc<Self> {
        let this = Arc::new(Self {
            routes: RwLock::new(PrefixTrie::default()),
            totals: Arc::new(TargetCounters::default()),
            instances: AtomicUsize::new(0),
            timer: Timer::default(),
        });

        let weak = Arc::downgrade(&this);
        thread::spawn(move || {
            loop {
                thread::sleep(Duration::from_secs(1));

                let Some(table) = weak.upgrade() else {
                    break;
                };

                let now = table.timer.add();
                let evicted = table.sweep(now);
                if evicted > 0 {
                    log::debug!("service table sweep: evicted={}", evicted);
                }
            }
        });

        this
    }

    /// The table clock, in seconds since creation.
    pub fn now(&self) -> u64 {
        self.timer.get()
    }

    /// Number of non-empty prefixes.
    pub fn services(&self) -> usize {
        self.routes.read().len()
    }

    /// Number of installed target entries.
    pub fn instances(&self) -> usize {
        self.instances.load(Ordering::Relaxed)
    }

    /// Install a target entry; entries with an identical prefix
    /// accumulate into the node's list.
    pub fn add(&self, prefix: &ServiceId, bits: u16, spec: &RouteSpec) {
        let now = self.timer.get();
        let mut routes = self.routes.write();

        if let Some(node) = routes.get_mut(prefix, bits) {
            node.entries.push(RouteEntry::new(spec, now));
        } else {
            routes.insert(
                prefix,
                bits,
                NodeEntries {
                    entries: vec![RouteEntry::new(spec, now)],
                    cursor: AtomicUsize::new(0),
                },
            );
        }

        self.instances.fetch_add(1, Ordering::Relaxed);
    }

    /// Replace the priority, weight and timeouts of the entry identified
    /// by `(prefix, bits, next_hop, if_index)`.
    pub fn modify(&self, prefix: &ServiceId, bits: u16, spec: &RouteSpec) -> Result<(), Error> {
        let mut routes = self.routes.write();
        let node = routes.get_mut(prefix, bits).ok_or(Error::NoEntry)?;

        let slot = node
            .entries
            .iter_mut()
            .find(|entry| entry.matches(&spec.next_hop, spec.if_index))
            .ok_or(Error::NoEntry)?;

        // Entries are shared with in-flight `Resolved` handles; swap in a
        // fresh entry carrying over the counters' owner identity.
        let created = slot.created;
        let replacement = RouteEntry::new(spec, created);
        replacement
            .last_active
            .store(slot.last_active.load(Ordering::Relaxed), Ordering::Relaxed);
        *slot = replacement;

        Ok(())
    }

    /// Remove one entry (by next-hop and interface) or every entry at the
    /// node. The trie node is pruned once its list is empty.
    pub fn del(
        &self,
        prefix: &ServiceId,
        bits: u16,
        selector: Option<(Ipv4Addr, u32)>,
    ) -> Result<usize, Error> {
        let mut routes = self.routes.write();
        let node = routes.get_mut(prefix, bits).ok_or(Error::NoEntry)?;

        let before = node.entries.len();
        match selector {
            Some((next_hop, if_index)) => {
                node.entries.retain(|entry| !entry.matches(&next_hop, if_index));
            }
            None => node.entries.clear(),
        }

        let removed = before - node.entries.len();
        if removed == 0 {
            return Err(Error::NoEntry);
        }

        if node.entries.is_empty() {
            routes.remove(prefix, bits);
        }

        self.instances.fetch_sub(removed, Ordering::Relaxed);
        Ok(removed)
    }

    /// Longest-prefix match plus weighted selection.
    ///
    /// Structural nodes and nodes whose entry list is empty are skipped,
    /// falling back to the next-shorter non-empty ancestor. The selected
    /// entry's activity stamp is refreshed.
    pub fn resolve(&self, key: &ServiceId) -> Result<Resolved, Error> {
        let routes = self.routes.read();
        let (_, _, node) = routes
            .find_longest_match(key, ServiceId::BITS, |node: &NodeEntries| {
                !node.entries.is_empty()
            })
            .ok_or(Error::NoEntry)?;

        let entry = Self::select(node);
        entry.last_active.store(self.timer.get(), Ordering::Relaxed);

        Ok(Resolved {
            entry,
            totals: self.totals.clone(),
        })
    }

    // Lowest priority class present, then weighted random selection;
    // a class with zero total weight falls back to the rotation cursor.
    fn select(node: &NodeEntries) -> Arc<RouteEntry> {
        let min_priority = node
            .entries
            .iter()
            .map(|entry| entry.priority)
            .min()
            .unwrap_or(0);

        let class: Vec<&Arc<RouteEntry>> = node
            .entries
            .iter()
            .filter(|entry| entry.priority == min_priority)
            .collect();

        let total: u64 = class.iter().map(|entry| entry.weight as u64).sum();
        if total == 0 {
            let at = node.cursor.fetch_add(1, Ordering::Relaxed) % class.len();
            return class[at].clone();
        }

        let mut draw = rand::rng().random_range(0..total);
        for entry in &class {
            let weight = entry.weight as u64;
            if draw < weight {
                return (*entry).clone();
            }

            draw -= weight;
        }

        class[class.len() - 1].clone()
    }

    /// Enumerate every entry below a prefix, shortest prefixes first.
    pub fn walk(&self, prefix: &ServiceId, bits: u16) -> Vec<(ServiceId, u16, Arc<RouteEntry>)> {
        let routes = self.routes.read();
        let mut out = Vec::new();

        routes.walk(prefix, bits, &mut |p, b, node: &NodeEntries| {
            for entry in &node.entries {
                out.push((*p, b, entry.clone()));
            }
        });

        out
    }

    /// Remove expired entries. Returns the number evicted.
    pub fn sweep(&self, now: u64) -> usize {
        let mut routes = self.routes.write();

        let mut stale = Vec::new();
        routes.walk(&ServiceId::default(), 0, &mut |p, b, node: &NodeEntries| {
            if node.entries.iter().any(|entry| entry.expired(now)) {
                stale.push((*p, b));
            }
        });

        let mut evicted = 0;
        for (prefix, bits) in stale {
            if let Some(node) = routes.get_mut(&prefix, bits) {
                let before = node.entries.len();
                node.entries.retain(|entry| !entry.expired(now));
                evicted += before - node.entries.len();

                if node.entries.is_empty() {
                    routes.remove(&prefix, bits);
                }
            }
        }

        self.instances.fetch_sub(evicted, Ordering::Relaxed);
        evicted
    }

    /// Aggregate statistics snapshot.
    pub fn stats(&self) -> TableStats {
        TableStats {
            services: self.services() as u32,
            instances: self.instances() as u32,
            packets_resolved: self.totals.packets_resolved.load(Ordering::Relaxed),
            bytes_resolved: self.totals.bytes_resolved.load(Ordering::Relaxed),
            packets_dropped: self.totals.packets_dropped.load(Ordering::Relaxed),
            bytes_dropped: self.totals.bytes_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(first: &[u8]) -> ServiceId {
        let mut bytes = [0u8; 32];
        bytes[..first.len()].copy_from_slice(first);
        ServiceId::from_bytes(bytes)
    }

    fn forward(last_octet: u8) -> RouteSpec {
        RouteSpec::forward(Ipv4Addr::new(10, 0, 0, last_octet), 1)
    }

    #[test]
    fn longest_nonempty_match_wins() {
        let table = ServiceTable::new();

        table.add(&sid(&[0x01]), 8, &forward(1));
        table.add(&sid(&[0x01, 0x00]), 16, &forward(2));

        // 0x010F.. matches both prefixes; the /16 must win.
        let target = table.resolve(&sid(&[0x01, 0x0F, 0x00])).unwrap();
        assert_eq!(target.next_hop(), Ipv4Addr::new(10, 0, 0, 2));

        // 0x02.. matches nothing.
        assert!(matches!(table.resolve(&sid(&[0x02])), Err(Error::NoEntry)));

        // 0x01FF.. only matches the /8.
        let target = table.resolve(&sid(&[0x01, 0xFF])).unwrap();
        assert_eq!(target.next_hop(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn weighted_split() {
        let table = ServiceTable::new();
        let prefix = sid(&[0x01]);

        let mut heavy = forward(1);
        heavy.weight = 3;
        let mut light = forward(2);
        light.weight = 1;

        table.add(&prefix, 8, &heavy);
        table.add(&prefix, 8, &light);

        let mut hits = 0u32;
        for _ in 0..10_000 {
            if table.resolve(&prefix).unwrap().next_hop() == Ipv4Addr::new(10, 0, 0, 1) {
                hits += 1;
            }
        }

        // p = 3/4, sigma = sqrt(n * p * (1 - p)) ~ 43.3; 3 sigma ~ 130.
        assert!((7_300..=7_700).contains(&hits), "hits = {}", hits);
    }

    #[test]
    fn priority_class_shadows_heavier_weights() {
        let table = ServiceTable::new();
        let prefix = sid(&[0x01]);

        let mut preferred = forward(1);
        preferred.priority = 1;
        let mut fallback = forward(2);
        fallback.priority = 7;
        fallback.weight = 1000;

        table.add(&prefix, 8, &preferred);
        table.add(&prefix, 8, &fallback);

        for _ in 0..100 {
            assert_eq!(
                table.resolve(&prefix).unwrap().next_hop(),
                Ipv4Addr::new(10, 0, 0, 1)
            );
        }
    }

    #[test]
    fn zero_weight_round_robin() {
        let table = ServiceTable::new();
        let prefix = sid(&[0x01]);

        let mut a = forward(1);
        a.weight = 0;
        let mut b = forward(2);
        b.weight = 0;

        table.add(&prefix, 8, &a);
        table.add(&prefix, 8, &b);

        let first = table.resolve(&prefix).unwrap().next_hop();
        let second = table.resolve(&prefix).unwrap().next_hop();
        let third = table.resolve(&prefix).unwrap().next_hop();

        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn modify_and_delete() {
        let table = ServiceTable::new();
        let prefix = sid(&[0x01]);

        table.add(&prefix, 8, &forward(1));

        let mut updated = forward(1);
        updated.weight = 9;
        table.modify(&prefix, 8, &updated).unwrap();

        // Modifying an uninstalled target is no-entry.
        assert!(matches!(
            table.modify(&prefix, 8, &forward(9)),
            Err(Error::NoEntry)
        ));

        assert_eq!(
            table
                .del(&prefix, 8, Some((Ipv4Addr::new(10, 0, 0, 1), 1)))
                .unwrap(),
            1
        );
        assert!(matches!(table.resolve(&prefix), Err(Error::NoEntry)));
        assert_eq!(table.services(), 0);
    }

    #[test]
    fn idle_eviction() {
        let table = ServiceTable::new();
        let prefix = sid(&[0x01]);

        let mut spec = forward(1);
        spec.idle_timeout = 5;
        table.add(&prefix, 8, &spec);

        assert_eq!(table.sweep(4), 0);
        assert_eq!(table.sweep(5), 1);
        assert!(matches!(table.resolve(&prefix), Err(Error::NoEntry)));
    }

    #[test]
    fn hard_eviction_ignores_activity() {
        let table = ServiceTable::new();
        let prefix = sid(&[0x01]);

        let mut spec = forward(1);
        spec.hard_timeout = 3;
        table.add(&prefix, 8, &spec);

        // Activity refreshes the idle stamp only.
        table.resolve(&prefix).unwrap();
        assert_eq!(table.sweep(3), 1);
    }

    #[test]
    fn counters_charged_by_caller() {
        let table = ServiceTable::new();
        let prefix = sid(&[0x01]);
        table.add(&prefix, 8, &forward(1));

        let target = table.resolve(&prefix).unwrap();
        target.charge(100);

        let target = table.resolve(&prefix).unwrap();
        target.charge_drop(40);

        let stats = table.stats();
        assert_eq!(stats.packets_resolved, 1);
        assert_eq!(stats.bytes_resolved, 100);
        assert_eq!(stats.packets_dropped, 1);
        assert_eq!(stats.bytes_dropped, 40);
    }
}
