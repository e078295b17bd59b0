use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The type of information passed into the statistics channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    SendBytes(usize),
    ReceivedPkts(usize),
    SendPkts(usize),
    ErrorPkts(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-port counter bundle.
pub struct Counts<T> {
    pub received_bytes: T,
    pub send_bytes: T,
    pub received_pkts: T,
    pub send_pkts: T,
    pub error_pkts: T,
}

impl<T: Number> Counts<T> {
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::ReceivedPkts(v) => self.received_pkts.add(*v),
            Stats::SendBytes(v) => self.send_bytes.add(*v),
            Stats::SendPkts(v) => self.send_pkts.add(*v),
            Stats::ErrorPkts(v) => self.error_pkts.add(*v),
        }
    }
}

impl Default for Counts<Count> {
    fn default() -> Self {
        Self {
            received_bytes: Count::default(),
            send_bytes: Count::default(),
            received_pkts: Count::default(),
            send_pkts: Count::default(),
            error_pkts: Count::default(),
        }
    }
}

/// Packet and byte counters per packet port, keyed by interface index.
#[derive(Default, Clone)]
pub struct Statistics(Arc<RwLock<AHashMap<u32, Counts<Count>>>>);

impl Statistics {
    /// Start tracking a port.
    pub fn register(&self, if_index: u32) {
        self.0.write().insert(if_index, Counts::default());
    }

    pub fn unregister(&self, if_index: u32) {
        self.0.write().remove(&if_index);
    }

    /// Snapshot of one port's counters.
    pub fn get(&self, if_index: u32) -> Option<Counts<usize>> {
        self.0.read().get(&if_index).map(|counts| Counts {
            received_bytes: counts.received_bytes.get(),
            received_pkts: counts.received_pkts.get(),
            send_bytes: counts.send_bytes.get(),
            send_pkts: counts.send_pkts.get(),
            error_pkts: counts.error_pkts.get(),
        })
    }

    /// A sender handle for one port's workers.
    pub fn get_reporter(&self, if_index: u32) -> StatisticsReporter {
        StatisticsReporter {
            table: self.0.clone(),
            if_index,
        }
    }
}

/// Held by each worker to feed the per-port counters.
#[derive(Clone)]
pub struct StatisticsReporter {
    table: Arc<RwLock<AHashMap<u32, Counts<Count>>>>,
    if_index: u32,
}

impl StatisticsReporter {
    pub fn send(&self, reports: &[Stats]) {
        if let Some(counts) = self.table.read().get(&self.if_index) {
            for report in reports {
                counts.add(report);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_feeds_port_counters() {
        let statistics = Statistics::default();
        statistics.register(1);

        let reporter = statistics.get_reporter(1);
        reporter.send(&[Stats::ReceivedBytes(100), Stats::ReceivedPkts(1)]);
        reporter.send(&[Stats::ErrorPkts(1)]);

        let counts = statistics.get(1).unwrap();
        assert_eq!(counts.received_bytes, 100);
        assert_eq!(counts.received_pkts, 1);
        assert_eq!(counts.error_pkts, 1);

        // Unregistered ports swallow reports.
        statistics.unregister(1);
        reporter.send(&[Stats::SendPkts(1)]);
        assert!(statistics.get(1).is_none());
    }
}
