use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time;

use crate::shutdown::Shutdown;

/// Byte counter for one connection. The owning connection is the only
/// writer; the aggregator is the only reader and the only resetter. Relaxed
/// atomics are deliberate: the value is a sampled rate, not a ledger, and a
/// drain can miss at most the increment that is in flight while it swaps.
pub struct ConnCounter {
    name: String,
    bytes: AtomicU64,
}

impl ConnCounter {
    fn new(name: String) -> Self {
        Self {
            name,
            bytes: AtomicU64::new(0),
        }
    }
}

/// Fixed set of per-connection counters, sized once at fleet startup and
/// ordered by fleet index. Cloning shares the same counters.
#[derive(Clone)]
pub struct CounterStore {
    counters: Arc<[ConnCounter]>,
}

impl CounterStore {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        let counters: Vec<ConnCounter> = names.into_iter().map(ConnCounter::new).collect();
        Self {
            counters: counters.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Write handle for the connection at the given fleet index.
    pub fn handle(&self, index: usize) -> CounterHandle {
        CounterHandle {
            store: self.clone(),
            index,
        }
    }

    /// Reads and resets every counter, in fleet index order.
    pub fn drain(&self) -> Vec<(&str, u64)> {
        self.counters
            .iter()
            .map(|c| (c.name.as_str(), c.bytes.swap(0, Ordering::Relaxed)))
            .collect()
    }
}

/// Single-connection writer into the store. Each connection holds exactly
/// one handle and only ever touches its own entry.
#[derive(Clone)]
pub struct CounterHandle {
    store: CounterStore,
    index: usize,
}

impl CounterHandle {
    pub fn record(&self, bytes: usize) {
        self.store.counters[self.index]
            .bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn name(&self) -> &str {
        &self.store.counters[self.index].name
    }
}

/// Periodic throughput reporter. Once per interval it drains the whole
/// store and prints one line per connection plus a total and an active
/// count. The report goes to stdout; it is the run's observable output,
/// not a log line.
pub struct Aggregator {
    store: CounterStore,
    interval: Duration,
    unit_size: u64,
}

impl Aggregator {
    /// `unit_size` converts drained bytes into reported units: the message
    /// length for message rates, 1 for raw byte rates.
    pub fn new(store: CounterStore, interval: Duration, unit_size: u64) -> Self {
        Self {
            store,
            interval,
            unit_size: unit_size.max(1),
        }
    }

    pub async fn run(self, shutdown: Shutdown) {
        let mut ticker = time::interval(self.interval);
        // the first tick completes immediately
        ticker.tick().await;

        while !shutdown.is_triggered() {
            ticker.tick().await;
            print!("{}", format_report(&self.store.drain(), self.unit_size));
        }
    }
}

/// Formats one report: `<name>: <rate>` per connection in store order, then
/// `Total:` and `Active:` summary lines. A connection with a zero delta is
/// still listed; it simply shows as inactive.
pub fn format_report(drained: &[(&str, u64)], unit_size: u64) -> String {
    let mut out = String::new();
    let mut total_bytes = 0u64;
    let mut active = 0usize;

    for (name, bytes) in drained {
        out.push_str(&format!("{}: {}\n", name, bytes / unit_size));
        total_bytes += bytes;
        if *bytes > 0 {
            active += 1;
        }
    }
    out.push_str(&format!("Total: {}\n", total_bytes / unit_size));
    out.push_str(&format!("Active: {}\n", active));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_reads_and_resets() {
        let store = CounterStore::new(["tcp-0".to_string(), "tcp-1".to_string()]);
        store.handle(0).record(16);
        store.handle(0).record(8);

        assert_eq!(store.drain(), vec![("tcp-0", 24), ("tcp-1", 0)]);
        // a drain resets; the next one starts from zero
        assert_eq!(store.drain(), vec![("tcp-0", 0), ("tcp-1", 0)]);
    }

    #[test]
    fn drain_order_follows_fleet_index() {
        let names = (0..5).map(|i| format!("tcp-{}", i));
        let store = CounterStore::new(names);
        store.handle(3).record(1);

        let drained = store.drain();
        let order: Vec<&str> = drained.iter().map(|(name, _)| *name).collect();
        assert_eq!(order, vec!["tcp-0", "tcp-1", "tcp-2", "tcp-3", "tcp-4"]);
    }

    #[test]
    fn report_lists_every_connection_and_summary() {
        let drained = vec![("tcp-0", 24), ("tcp-1", 0)];
        let report = format_report(&drained, 8);
        assert_eq!(report, "tcp-0: 3\ntcp-1: 0\nTotal: 3\nActive: 1\n");
    }

    #[test]
    fn report_in_byte_units() {
        let drained = vec![("udp-0", 100)];
        let report = format_report(&drained, 1);
        assert_eq!(report, "udp-0: 100\nTotal: 100\nActive: 1\n");
    }
}
