//! In-process fan-out of normalized records to sink writers.
//!
//! Writers register per channel; `publish` hands the record to every bound
//! writer in registration order and tracks per-channel counts plus the
//! last-seen event/receive timestamps per `(channel, instrument)` for the
//! health monitor. Writer enqueue must not block the producer; bounded
//! writer buffers surface back-pressure as counted drops.

use crate::events::{Channel, Record};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Sink-side consumer of records.
///
/// `enqueue` is called on the hot path of every shard task: implementations
/// buffer internally and never block or suspend the caller.
pub trait RecordWriter: Send + Sync {
    fn name(&self) -> &'static str;
    fn enqueue(&self, record: &Record);
}

#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    pub events_by_channel: HashMap<&'static str, u64>,
}

/// Last-seen timestamps per (channel, instrument).
#[derive(Debug, Clone, Default)]
pub struct LastSeenSnapshot {
    pub event_ns: HashMap<(Channel, String), u64>,
    pub recv_ns: HashMap<(Channel, String), u64>,
}

#[derive(Default)]
pub struct Router {
    bindings: HashMap<Channel, Vec<Arc<dyn RecordWriter>>>,
    events_by_channel: Mutex<HashMap<&'static str, u64>>,
    last_event_ns: RwLock<HashMap<(Channel, String), u64>>,
    last_recv_ns: RwLock<HashMap<(Channel, String), u64>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a writer for a channel. Called during wiring, before any
    /// publisher task starts.
    pub fn bind(&mut self, channel: Channel, writer: Arc<dyn RecordWriter>) {
        self.bindings.entry(channel).or_default().push(writer);
    }

    pub fn has_binding(&self, channel: Channel) -> bool {
        self.bindings
            .get(&channel)
            .map(|writers| !writers.is_empty())
            .unwrap_or(false)
    }

    /// Fan a record out to every writer bound to its channel.
    pub fn publish(&self, record: &Record) {
        let Some(writers) = self.bindings.get(&record.channel) else {
            return;
        };
        if writers.is_empty() {
            return;
        }

        if let Ok(mut counts) = self.events_by_channel.lock() {
            *counts.entry(record.channel.as_str()).or_insert(0) += 1;
        }
        let key = (record.channel, record.instrument.clone());
        if let Ok(mut map) = self.last_event_ns.write() {
            map.insert(key.clone(), record.ts_event_ns);
        }
        if let Ok(mut map) = self.last_recv_ns.write() {
            map.insert(key, record.ts_recv_ns);
        }

        for writer in writers {
            writer.enqueue(record);
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            events_by_channel: self
                .events_by_channel
                .lock()
                .map(|counts| counts.clone())
                .unwrap_or_default(),
        }
    }

    pub fn last_seen_snapshot(&self) -> LastSeenSnapshot {
        LastSeenSnapshot {
            event_ns: self
                .last_event_ns
                .read()
                .map(|m| m.clone())
                .unwrap_or_default(),
            recv_ns: self
                .last_recv_ns
                .read()
                .map(|m| m.clone())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Body, MarkPrice};
    use rust_decimal::Decimal;
    use std::sync::Mutex as StdMutex;

    struct CapturingWriter {
        name: &'static str,
        seen: StdMutex<Vec<(Channel, String, u64)>>,
    }

    impl CapturingWriter {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self { name, seen: StdMutex::new(Vec::new()) })
        }
    }

    impl RecordWriter for CapturingWriter {
        fn name(&self) -> &'static str {
            self.name
        }

        fn enqueue(&self, record: &Record) {
            self.seen.lock().unwrap().push((
                record.channel,
                record.instrument.clone(),
                record.ts_event_ns,
            ));
        }
    }

    fn mark_record(instrument: &str, ts: u64) -> Record {
        Record::new(
            instrument,
            Channel::MarkPrice,
            ts,
            ts + 5,
            Body::MarkPrice(MarkPrice { mark_price: Decimal::ONE, index_price: None }),
        )
    }

    #[test]
    fn test_publish_fans_out_to_bound_writers() {
        let mut router = Router::new();
        let a = CapturingWriter::new("a");
        let b = CapturingWriter::new("b");
        router.bind(Channel::MarkPrice, a.clone());
        router.bind(Channel::MarkPrice, b.clone());

        router.publish(&mark_record("BTCUSDT", 100));
        assert_eq!(a.seen.lock().unwrap().len(), 1);
        assert_eq!(b.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unbound_channel_is_dropped_without_counting() {
        let mut router = Router::new();
        let writer = CapturingWriter::new("a");
        router.bind(Channel::Trades, writer.clone());

        router.publish(&mark_record("BTCUSDT", 100));
        assert!(writer.seen.lock().unwrap().is_empty());
        assert!(router.stats().events_by_channel.is_empty());
    }

    #[test]
    fn test_publish_order_preserved_per_instrument() {
        let mut router = Router::new();
        let writer = CapturingWriter::new("a");
        router.bind(Channel::MarkPrice, writer.clone());

        for ts in [10, 20, 30] {
            router.publish(&mark_record("BTCUSDT", ts));
        }
        let seen = writer.seen.lock().unwrap();
        let ts_order: Vec<u64> = seen.iter().map(|(_, _, ts)| *ts).collect();
        assert_eq!(ts_order, vec![10, 20, 30]);
    }

    #[test]
    fn test_counts_and_last_seen() {
        let mut router = Router::new();
        router.bind(Channel::MarkPrice, CapturingWriter::new("a"));

        router.publish(&mark_record("BTCUSDT", 100));
        router.publish(&mark_record("BTCUSDT", 200));
        router.publish(&mark_record("ETHUSDT", 150));

        let stats = router.stats();
        assert_eq!(stats.events_by_channel.get("mark_price"), Some(&3));

        let snapshot = router.last_seen_snapshot();
        let key = (Channel::MarkPrice, "BTCUSDT".to_string());
        assert_eq!(snapshot.event_ns.get(&key), Some(&200));
        assert_eq!(snapshot.recv_ns.get(&key), Some(&205));
    }

    #[test]
    fn test_has_binding() {
        let mut router = Router::new();
        assert!(!router.has_binding(Channel::Trades));
        router.bind(Channel::Trades, CapturingWriter::new("a"));
        assert!(router.has_binding(Channel::Trades));
    }
}
