//! Fixed-grid 5-second trade aggregation.
//!
//! Buckets are keyed by epoch-aligned window start. Emission is driven by a
//! watermark (`now - late_grace`): every window at or below the watermark is
//! emitted exactly once per symbol, as an explicit zero bucket when no trade
//! arrived, so downstream consumers see a deterministic row per grid slot.

use crate::events::{AggTrade5s, Body, Channel, Record};
use crate::util::{window_start, NS_PER_SEC};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// One normalized trade as the aggregator consumes it.
#[derive(Debug, Clone)]
pub struct TradeInput {
    pub price: Decimal,
    pub qty: Decimal,
    pub ts_event_ns: u64,
    pub ts_recv_ns: u64,
    pub trade_id: Option<String>,
    /// Taker sold (the buyer was the resting maker).
    pub is_sell: bool,
}

#[derive(Debug)]
struct Bucket {
    window_start_ns: u64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    notional: Decimal,
    trade_count: u32,
    buy_qty: Decimal,
    sell_qty: Decimal,
    buy_notional: Decimal,
    sell_notional: Decimal,
    first_trade_id: Option<String>,
    last_trade_id: Option<String>,
    last_recv_ns: u64,
}

impl Bucket {
    fn seed(window_start_ns: u64, trade: &TradeInput) -> Self {
        let notional = trade.price * trade.qty;
        let mut bucket = Self {
            window_start_ns,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.qty,
            notional,
            trade_count: 1,
            buy_qty: Decimal::ZERO,
            sell_qty: Decimal::ZERO,
            buy_notional: Decimal::ZERO,
            sell_notional: Decimal::ZERO,
            first_trade_id: trade.trade_id.clone(),
            last_trade_id: trade.trade_id.clone(),
            last_recv_ns: trade.ts_recv_ns,
        };
        if trade.is_sell {
            bucket.sell_qty = trade.qty;
            bucket.sell_notional = notional;
        } else {
            bucket.buy_qty = trade.qty;
            bucket.buy_notional = notional;
        }
        bucket
    }

    fn update(&mut self, trade: &TradeInput) {
        let notional = trade.price * trade.qty;
        if trade.price > self.high {
            self.high = trade.price;
        }
        if trade.price < self.low {
            self.low = trade.price;
        }
        self.close = trade.price;
        self.volume += trade.qty;
        self.notional += notional;
        self.trade_count += 1;
        if trade.is_sell {
            self.sell_qty += trade.qty;
            self.sell_notional += notional;
        } else {
            self.buy_qty += trade.qty;
            self.buy_notional += notional;
        }
        if trade.trade_id.is_some() {
            self.last_trade_id = trade.trade_id.clone();
        }
        self.last_recv_ns = trade.ts_recv_ns;
    }
}

/// Per-symbol 5-second bucketing with watermark-driven emission.
pub struct AggTradeAggregator {
    interval_s: u32,
    interval_ns: u64,
    symbols: Vec<String>,
    buckets: HashMap<String, Bucket>,
    last_emitted: HashMap<String, u64>,
    last_flush_window: Option<u64>,
    max_catchup_windows: u32,
    late_grace_ns: u64,
    catchup_caps: u64,
    skipped_windows: u64,
    late_trades: u64,
}

impl AggTradeAggregator {
    pub fn new(
        interval_s: u32,
        symbols: Vec<String>,
        max_catchup_windows: u32,
        late_grace_s: u64,
    ) -> Self {
        Self {
            interval_s,
            interval_ns: interval_s as u64 * NS_PER_SEC,
            symbols,
            buckets: HashMap::new(),
            last_emitted: HashMap::new(),
            last_flush_window: None,
            max_catchup_windows,
            late_grace_ns: late_grace_s * NS_PER_SEC,
            catchup_caps: 0,
            skipped_windows: 0,
            late_trades: 0,
        }
    }

    /// Feed one trade. Returns the previous bucket when the trade rolled the
    /// window over; late trades are counted and dropped.
    pub fn update(&mut self, symbol: &str, trade: TradeInput) -> Option<Record> {
        let start = window_start(trade.ts_event_ns, self.interval_ns);
        if let Some(last) = self.last_emitted.get(symbol) {
            if start <= *last {
                self.late_trades += 1;
                return None;
            }
        }

        let mut emitted = None;
        if let Some(bucket) = self.buckets.get(symbol) {
            if bucket.window_start_ns != start {
                let bucket = self.buckets.remove(symbol).expect("bucket present");
                let fresh = self
                    .last_emitted
                    .get(symbol)
                    .map(|last| bucket.window_start_ns > *last)
                    .unwrap_or(true);
                if fresh {
                    self.last_emitted
                        .insert(symbol.to_string(), bucket.window_start_ns);
                    emitted = Some(self.emit(symbol, &bucket));
                }
                // A bucket at or below the emitted edge (catch-up skipped past
                // it) is discarded to keep emission monotone.
            }
        }

        match self.buckets.get_mut(symbol) {
            Some(bucket) => bucket.update(&trade),
            None => {
                self.buckets
                    .insert(symbol.to_string(), Bucket::seed(start, &trade));
            }
        }
        emitted
    }

    /// Emit every window at or below the watermark for every symbol.
    ///
    /// Catch-up after an outage is capped per symbol; capped windows are
    /// skipped permanently and accounted for, never emitted out of order.
    pub fn flush(&mut self, now_ns: u64) -> Vec<Record> {
        let Some(watermark_ns) = now_ns.checked_sub(self.late_grace_ns) else {
            return Vec::new();
        };
        let grid = watermark_ns / self.interval_ns;
        if grid == 0 {
            return Vec::new();
        }
        let last_emittable = (grid - 1) * self.interval_ns;
        if let Some(last_flush) = self.last_flush_window {
            if last_emittable <= last_flush {
                return Vec::new();
            }
        }
        self.last_flush_window = Some(last_emittable);

        let mut records = Vec::new();
        for symbol in self.symbols.clone() {
            let mut next = match self.last_emitted.get(&symbol) {
                Some(last) => last + self.interval_ns,
                // First flush for the symbol emits exactly one window.
                None => last_emittable,
            };
            let mut emitted_windows = 0u32;
            while next <= last_emittable {
                let matches_bucket = self
                    .buckets
                    .get(&symbol)
                    .map(|b| b.window_start_ns == next)
                    .unwrap_or(false);
                if matches_bucket {
                    let bucket = self.buckets.remove(&symbol).expect("bucket present");
                    records.push(self.emit(&symbol, &bucket));
                } else {
                    records.push(self.emit_empty(&symbol, next, now_ns));
                }
                self.last_emitted.insert(symbol.clone(), next);
                emitted_windows += 1;
                if self.max_catchup_windows > 0 && emitted_windows >= self.max_catchup_windows {
                    let remaining = (last_emittable - next) / self.interval_ns;
                    if remaining > 0 {
                        self.catchup_caps += 1;
                        self.skipped_windows += remaining;
                        // Skip the capped backlog entirely; the next flush
                        // resumes at the live edge.
                        self.last_emitted.insert(symbol.clone(), last_emittable);
                    }
                    break;
                }
                next += self.interval_ns;
            }
        }
        records
    }

    fn emit(&self, symbol: &str, bucket: &Bucket) -> Record {
        let window_end_ns = bucket.window_start_ns + self.interval_ns - 1;
        Record::new(
            symbol,
            Channel::AggTrades5s,
            window_end_ns,
            bucket.last_recv_ns,
            Body::AggTrade5s(AggTrade5s {
                interval_s: self.interval_s,
                window_start_ns: bucket.window_start_ns,
                open: bucket.open,
                high: bucket.high,
                low: bucket.low,
                close: bucket.close,
                volume: bucket.volume,
                notional: bucket.notional,
                trade_count: bucket.trade_count,
                buy_qty: bucket.buy_qty,
                sell_qty: bucket.sell_qty,
                buy_notional: bucket.buy_notional,
                sell_notional: bucket.sell_notional,
                first_trade_id: bucket.first_trade_id.clone(),
                last_trade_id: bucket.last_trade_id.clone(),
            }),
        )
    }

    fn emit_empty(&self, symbol: &str, window_start_ns: u64, now_ns: u64) -> Record {
        let window_end_ns = window_start_ns + self.interval_ns - 1;
        Record::new(
            symbol,
            Channel::AggTrades5s,
            window_end_ns,
            now_ns,
            Body::AggTrade5s(AggTrade5s {
                interval_s: self.interval_s,
                window_start_ns,
                open: Decimal::ZERO,
                high: Decimal::ZERO,
                low: Decimal::ZERO,
                close: Decimal::ZERO,
                volume: Decimal::ZERO,
                notional: Decimal::ZERO,
                trade_count: 0,
                buy_qty: Decimal::ZERO,
                sell_qty: Decimal::ZERO,
                buy_notional: Decimal::ZERO,
                sell_notional: Decimal::ZERO,
                first_trade_id: None,
                last_trade_id: None,
            }),
        )
    }

    /// Drain (catchup_caps, skipped_windows).
    pub fn take_catchup_stats(&mut self) -> (u64, u64) {
        (
            std::mem::take(&mut self.catchup_caps),
            std::mem::take(&mut self.skipped_windows),
        )
    }

    /// Drain the late-trade counter.
    pub fn take_late_trades(&mut self) -> u64 {
        std::mem::take(&mut self.late_trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::NS_PER_SEC;
    use std::str::FromStr;

    const W: u64 = 5 * NS_PER_SEC;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn trade(ts_s: f64, price: &str, qty: &str, is_sell: bool) -> TradeInput {
        TradeInput {
            price: dec(price),
            qty: dec(qty),
            ts_event_ns: (ts_s * NS_PER_SEC as f64) as u64,
            ts_recv_ns: (ts_s * NS_PER_SEC as f64) as u64 + 1_000_000,
            trade_id: None,
            is_sell,
        }
    }

    fn aggregator(symbols: &[&str]) -> AggTradeAggregator {
        AggTradeAggregator::new(5, symbols.iter().map(|s| s.to_string()).collect(), 120, 2)
    }

    fn body(record: &Record) -> &AggTrade5s {
        match &record.body {
            Body::AggTrade5s(body) => body,
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_single_window_emission() {
        let mut agg = aggregator(&["BTCUSDT"]);
        assert!(agg.update("BTCUSDT", trade(0.1, "100", "1", false)).is_none());
        assert!(agg.update("BTCUSDT", trade(4.9, "110", "2", true)).is_none());

        let records = agg.flush(7 * NS_PER_SEC);
        assert_eq!(records.len(), 1);
        let b = body(&records[0]);
        assert_eq!(b.window_start_ns, 0);
        assert_eq!(records[0].ts_event_ns, 5 * NS_PER_SEC - 1);
        assert_eq!(b.open, dec("100"));
        assert_eq!(b.high, dec("110"));
        assert_eq!(b.low, dec("100"));
        assert_eq!(b.close, dec("110"));
        assert_eq!(b.volume, dec("3"));
        assert_eq!(b.buy_qty, dec("1"));
        assert_eq!(b.sell_qty, dec("2"));
        assert_eq!(b.trade_count, 2);
    }

    #[test]
    fn test_volume_splits_exactly() {
        let mut agg = aggregator(&["BTCUSDT"]);
        for (price, qty, is_sell) in [
            ("100.1", "0.003", false),
            ("100.2", "1.117", true),
            ("100.3", "0.25", false),
        ] {
            agg.update("BTCUSDT", trade(1.0, price, qty, is_sell));
        }
        let records = agg.flush(8 * NS_PER_SEC);
        let b = body(&records[0]);
        assert_eq!(b.volume, b.buy_qty + b.sell_qty);
        assert_eq!(b.notional, b.buy_notional + b.sell_notional);
        assert!(b.low <= b.open && b.open <= b.high);
        assert!(b.low <= b.close && b.close <= b.high);
    }

    #[test]
    fn test_rollover_emits_previous_bucket() {
        let mut agg = aggregator(&["BTCUSDT"]);
        assert!(agg.update("BTCUSDT", trade(1.0, "100", "1", false)).is_none());
        let rolled = agg.update("BTCUSDT", trade(6.0, "101", "1", false));
        let record = rolled.expect("rollover emits the closed bucket");
        assert_eq!(body(&record).window_start_ns, 0);
        assert_eq!(body(&record).close, dec("100"));
    }

    #[test]
    fn test_empty_window_fill() {
        let mut agg = aggregator(&["BTCUSDT"]);
        // Trade in window [5,10); nothing afterwards.
        agg.update("BTCUSDT", trade(6.0, "100", "1", false));
        let first = agg.flush(12 * NS_PER_SEC);
        assert_eq!(first.len(), 1);
        assert_eq!(body(&first[0]).window_start_ns, 5 * NS_PER_SEC);

        // No trades between 10 s and 20 s: flush at 22 s fills two empties.
        let now = 22 * NS_PER_SEC;
        let records = agg.flush(now);
        assert_eq!(records.len(), 2);
        let starts: Vec<u64> = records.iter().map(|r| body(r).window_start_ns).collect();
        assert_eq!(starts, vec![10 * NS_PER_SEC, 15 * NS_PER_SEC]);
        for record in &records {
            let b = body(record);
            assert_eq!(b.trade_count, 0);
            assert_eq!(b.open, Decimal::ZERO);
            assert_eq!(b.volume, Decimal::ZERO);
            assert_eq!(record.ts_recv_ns, now);
        }
    }

    #[test]
    fn test_windows_strictly_increase_by_interval() {
        let mut agg = aggregator(&["BTCUSDT"]);
        agg.update("BTCUSDT", trade(0.5, "100", "1", false));
        agg.update("BTCUSDT", trade(11.0, "101", "1", false));
        let mut records = agg.flush(20 * NS_PER_SEC);
        records.extend(agg.flush(30 * NS_PER_SEC));

        let starts: Vec<u64> = records.iter().map(|r| body(r).window_start_ns).collect();
        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], W);
        }
    }

    #[test]
    fn test_late_trade_counted_not_bucketed() {
        let mut agg = aggregator(&["BTCUSDT"]);
        agg.update("BTCUSDT", trade(1.0, "100", "1", false));
        agg.flush(10 * NS_PER_SEC);

        // Window 0 was already emitted; this trade is late.
        assert!(agg.update("BTCUSDT", trade(2.0, "999", "9", false)).is_none());
        assert_eq!(agg.take_late_trades(), 1);
        assert_eq!(agg.take_late_trades(), 0);

        let records = agg.flush(15 * NS_PER_SEC);
        // The late price never shows up in a bucket.
        assert!(records.iter().all(|r| body(r).high != dec("999")));
    }

    #[test]
    fn test_catchup_cap() {
        let mut agg = AggTradeAggregator::new(5, vec!["BTCUSDT".to_string()], 4, 2);
        agg.update("BTCUSDT", trade(1.0, "100", "1", false));
        agg.flush(10 * NS_PER_SEC);

        // Jump far ahead: 20 emittable windows pending, cap at 4.
        let records = agg.flush(110 * NS_PER_SEC);
        assert_eq!(records.len(), 4);
        let (caps, skipped) = agg.take_catchup_stats();
        assert_eq!(caps, 1);
        assert!(skipped > 0);
        assert_eq!(agg.take_catchup_stats(), (0, 0));

        // After the cap the symbol resumes at the live edge, still monotone.
        let next = agg.flush(120 * NS_PER_SEC);
        assert!(!next.is_empty());
        assert!(body(&next[0]).window_start_ns > body(&records[3]).window_start_ns);
    }

    #[test]
    fn test_first_flush_emits_single_window_per_symbol() {
        let mut agg = aggregator(&["BTCUSDT", "ETHUSDT"]);
        let records = agg.flush(1_000_000 * NS_PER_SEC);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_repeated_flush_same_watermark_is_noop() {
        let mut agg = aggregator(&["BTCUSDT"]);
        agg.update("BTCUSDT", trade(1.0, "100", "1", false));
        assert_eq!(agg.flush(10 * NS_PER_SEC).len(), 1);
        assert!(agg.flush(10 * NS_PER_SEC).is_empty());
        assert!(agg.flush(11 * NS_PER_SEC).is_empty());
    }
}
