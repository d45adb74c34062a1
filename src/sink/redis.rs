//! Pipelined key-value writer for live-read traffic.
//!
//! Records map onto two command kinds: capped stream appends for trades and
//! liquidations, and last-state hashes for everything with a "latest value"
//! reading. Commands buffer and flush as one pipeline when the buffer
//! reaches the pipeline size or the periodic tick fires. Last-state keys
//! carry channel-specific TTLs so consumers can distinguish "no data" from
//! "stale data".

use crate::config::RedisConfig;
use crate::error::Result;
use crate::events::{Body, Channel, Record};
use crate::router::RecordWriter;
use crate::sink::SinkStats;
use redis::aio::MultiplexedConnection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NAMESPACE: &str = "marketdata";

/// One buffered sink command.
#[derive(Debug, Clone, PartialEq)]
pub enum KvCommand {
    /// `XADD <key> MAXLEN ~ <maxlen> * <fields...>`
    StreamAppend {
        key: String,
        fields: Vec<(String, String)>,
        maxlen: usize,
    },
    /// `HSET <key> <fields...>` with an optional `EXPIRE`.
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
        ttl_s: Option<u64>,
    },
}

/// TTL per last-state channel; `None` leaves the key persistent.
fn last_state_ttl(channel: Channel) -> Option<u64> {
    match channel {
        Channel::MarkPrice => Some(3),
        Channel::AggTrades5s => Some(10),
        Channel::Klines => Some(120),
        _ => None,
    }
}

pub struct RedisWriter {
    connection: MultiplexedConnection,
    pipeline_size: usize,
    flush_interval: Duration,
    stream_maxlen: usize,

    buffer: Mutex<Vec<KvCommand>>,
    pipeline_ready: Notify,

    events: AtomicU64,
    items_flushed: AtomicU64,
    flush_errors: AtomicU64,
}

impl RedisWriter {
    pub async fn connect(config: &RedisConfig) -> Result<Arc<Self>> {
        let client = redis::Client::open(config.url.as_str())?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        info!(url = %config.url, "key-value sink connected");
        Ok(Arc::new(Self {
            connection,
            pipeline_size: config.pipeline_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(5)),
            stream_maxlen: config.stream_maxlen,
            buffer: Mutex::new(Vec::new()),
            pipeline_ready: Notify::new(),
            events: AtomicU64::new(0),
            items_flushed: AtomicU64::new(0),
            flush_errors: AtomicU64::new(0),
        }))
    }

    pub async fn run_autoflush(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush().await,
                _ = self.pipeline_ready.notified() => self.flush().await,
                _ = shutdown.cancelled() => break,
            }
        }
        self.flush().await;
        info!("key-value writer stopped");
    }

    async fn flush(&self) {
        let commands: Vec<KvCommand> = match self.buffer.lock() {
            Ok(mut buffer) => std::mem::take(&mut *buffer),
            Err(_) => return,
        };
        if commands.is_empty() {
            return;
        }
        let count = commands.len() as u64;

        let mut pipe = redis::pipe();
        for command in &commands {
            match command {
                KvCommand::StreamAppend { key, fields, maxlen } => {
                    let mut cmd = pipe.cmd("XADD");
                    cmd = cmd.arg(key).arg("MAXLEN").arg("~").arg(*maxlen).arg("*");
                    for (field, value) in fields {
                        cmd = cmd.arg(field).arg(value);
                    }
                    cmd.ignore();
                }
                KvCommand::HashSet { key, fields, ttl_s } => {
                    let mut cmd = pipe.cmd("HSET");
                    cmd = cmd.arg(key);
                    for (field, value) in fields {
                        cmd = cmd.arg(field).arg(value);
                    }
                    cmd.ignore();
                    if let Some(ttl) = ttl_s {
                        pipe.cmd("EXPIRE").arg(key).arg(*ttl).ignore();
                    }
                }
            }
        }

        let mut connection = self.connection.clone();
        let result: redis::RedisResult<()> = pipe.query_async(&mut connection).await;
        match result {
            Ok(()) => {
                self.items_flushed.fetch_add(count, Ordering::Relaxed);
                debug!(commands = count, "pipeline flushed");
            }
            Err(err) => {
                // Last-state values are superseded within one tick; dropping
                // the failed pipeline is cheaper than replaying stale state.
                self.flush_errors.fetch_add(1, Ordering::Relaxed);
                warn!(commands = count, error = %err, "pipeline flush failed");
            }
        }
    }

    pub fn stats(&self) -> SinkStats {
        let pending = self.buffer.lock().map(|b| b.len() as u64).unwrap_or(0);
        let mut stats = SinkStats {
            name: "redis",
            events: self.events.load(Ordering::Relaxed),
            items_flushed: self.items_flushed.load(Ordering::Relaxed),
            flush_errors: self.flush_errors.load(Ordering::Relaxed),
            ..Default::default()
        };
        if pending > 0 {
            stats.pending_by_table.insert("pipeline", pending);
        }
        stats
    }

    /// Build the sink commands for one record. Public for tests; the hot
    /// path goes through `enqueue`.
    pub fn build_commands(record: &Record, stream_maxlen: usize) -> Vec<KvCommand> {
        let mut base_fields = vec![
            ("ts_event_ns".to_string(), record.ts_event_ns.to_string()),
            ("ts_recv_ns".to_string(), record.ts_recv_ns.to_string()),
        ];
        match &record.body {
            Body::Trade(trade) => {
                base_fields.push(("px".to_string(), trade.price.to_string()));
                base_fields.push(("qty".to_string(), trade.qty.to_string()));
                base_fields.push(("side".to_string(), trade.side.as_str().to_string()));
                if let Some(trade_id) = &trade.trade_id {
                    base_fields.push(("trade_id".to_string(), trade_id.clone()));
                }
                if let Some(aggressor) = trade.is_aggressor {
                    base_fields.push((
                        "is_aggressor".to_string(),
                        if aggressor { "1" } else { "0" }.to_string(),
                    ));
                }
                vec![KvCommand::StreamAppend {
                    key: key(&["trades", &record.instrument]),
                    fields: base_fields,
                    maxlen: stream_maxlen,
                }]
            }
            Body::Liquidation(liq) => {
                base_fields.push(("side".to_string(), liq.side.as_str().to_string()));
                base_fields.push(("px".to_string(), liq.price.to_string()));
                base_fields.push(("qty".to_string(), liq.qty.to_string()));
                if let Some(order_id) = &liq.order_id {
                    base_fields.push(("order_id".to_string(), order_id.clone()));
                }
                if let Some(reason) = &liq.reason {
                    base_fields.push(("reason".to_string(), reason.clone()));
                }
                vec![KvCommand::StreamAppend {
                    key: key(&["liquidations", &record.instrument]),
                    fields: base_fields,
                    maxlen: stream_maxlen,
                }]
            }
            Body::DepthSnapshot(depth) => {
                let kind = match depth.depth {
                    1 => "l1",
                    5 => "top5",
                    10 => "top10",
                    20 => "top20",
                    50 => "top50",
                    _ => "top100",
                };
                for (idx, (price, qty)) in depth
                    .bid_prices
                    .iter()
                    .zip(depth.bid_qtys.iter())
                    .enumerate()
                {
                    base_fields.push((format!("b{}_px", idx + 1), price.to_string()));
                    base_fields.push((format!("b{}_sz", idx + 1), qty.to_string()));
                }
                for (idx, (price, qty)) in depth
                    .ask_prices
                    .iter()
                    .zip(depth.ask_qtys.iter())
                    .enumerate()
                {
                    base_fields.push((format!("a{}_px", idx + 1), price.to_string()));
                    base_fields.push((format!("a{}_sz", idx + 1), qty.to_string()));
                }
                vec![KvCommand::HashSet {
                    key: key(&[kind, &record.instrument]),
                    fields: base_fields,
                    ttl_s: last_state_ttl(record.channel),
                }]
            }
            Body::MarkPrice(mark) => {
                base_fields.push(("mark_px".to_string(), mark.mark_price.to_string()));
                if let Some(index) = mark.index_price {
                    base_fields.push(("index_px".to_string(), index.to_string()));
                }
                vec![KvCommand::HashSet {
                    key: key(&["mark_price", &record.instrument]),
                    fields: base_fields,
                    ttl_s: last_state_ttl(record.channel),
                }]
            }
            Body::Funding(funding) => {
                base_fields.push((
                    "funding_rate".to_string(),
                    funding.funding_rate.to_string(),
                ));
                base_fields.push((
                    "next_funding_ts_ns".to_string(),
                    funding.next_funding_ts_ns.to_string(),
                ));
                vec![KvCommand::HashSet {
                    key: key(&["funding", &record.instrument]),
                    fields: base_fields,
                    ttl_s: last_state_ttl(record.channel),
                }]
            }
            Body::AggTrade5s(agg) => {
                base_fields.push(("window_start_ns".to_string(), agg.window_start_ns.to_string()));
                base_fields.push(("o".to_string(), agg.open.to_string()));
                base_fields.push(("h".to_string(), agg.high.to_string()));
                base_fields.push(("l".to_string(), agg.low.to_string()));
                base_fields.push(("c".to_string(), agg.close.to_string()));
                base_fields.push(("volume".to_string(), agg.volume.to_string()));
                base_fields.push(("notional".to_string(), agg.notional.to_string()));
                base_fields.push(("trade_count".to_string(), agg.trade_count.to_string()));
                base_fields.push(("buy_qty".to_string(), agg.buy_qty.to_string()));
                base_fields.push(("sell_qty".to_string(), agg.sell_qty.to_string()));
                vec![KvCommand::HashSet {
                    key: key(&["agg_trades_5s", &record.instrument]),
                    fields: base_fields,
                    ttl_s: last_state_ttl(record.channel),
                }]
            }
            Body::Kline(kline) => {
                base_fields.push(("o".to_string(), kline.open.to_string()));
                base_fields.push(("h".to_string(), kline.high.to_string()));
                base_fields.push(("l".to_string(), kline.low.to_string()));
                base_fields.push(("c".to_string(), kline.close.to_string()));
                base_fields.push(("volume".to_string(), kline.volume.to_string()));
                base_fields.push(("quote_volume".to_string(), kline.quote_volume.to_string()));
                base_fields.push(("trade_count".to_string(), kline.trade_count.to_string()));
                vec![KvCommand::HashSet {
                    key: key(&["klines", &kline.interval, &record.instrument]),
                    fields: base_fields,
                    ttl_s: last_state_ttl(record.channel),
                }]
            }
            Body::AdvancedMetrics(adv) => {
                for (name, value) in &adv.metrics {
                    base_fields.push((name.clone(), value.to_string()));
                }
                vec![KvCommand::HashSet {
                    key: key(&["advanced_metrics", &record.instrument]),
                    fields: base_fields,
                    ttl_s: last_state_ttl(record.channel),
                }]
            }
            // Raw diffs have no sensible last-state representation.
            Body::DepthDiff(_) => Vec::new(),
        }
    }
}

fn key(parts: &[&str]) -> String {
    let mut out = String::from(NAMESPACE);
    for part in parts {
        out.push(':');
        out.push_str(part);
    }
    out
}

impl RecordWriter for RedisWriter {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn enqueue(&self, record: &Record) {
        let commands = Self::build_commands(record, self.stream_maxlen);
        if commands.is_empty() {
            return;
        }
        self.events.fetch_add(1, Ordering::Relaxed);
        let mut ready = false;
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend(commands);
            ready = buffer.len() >= self.pipeline_size;
        }
        if ready {
            self.pipeline_ready.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DepthSnapshot, Kline, MarkPrice, Side, Trade};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_trade_maps_to_capped_stream() {
        let record = Record::new(
            "BTCUSDT",
            Channel::Trades,
            1,
            2,
            Body::Trade(Trade {
                price: dec("67000.5"),
                qty: dec("0.1"),
                side: Side::Buy,
                trade_id: Some("9".to_string()),
                is_aggressor: Some(true),
            }),
        );
        let commands = RedisWriter::build_commands(&record, 1000);
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            KvCommand::StreamAppend { key, fields, maxlen } => {
                assert_eq!(key, "marketdata:trades:BTCUSDT");
                assert_eq!(*maxlen, 1000);
                assert!(fields.contains(&("px".to_string(), "67000.5".to_string())));
                assert!(fields.contains(&("is_aggressor".to_string(), "1".to_string())));
            }
            other => panic!("expected stream append, got {other:?}"),
        }
    }

    #[test]
    fn test_mark_price_last_state_ttl() {
        let record = Record::new(
            "BTCUSDT",
            Channel::MarkPrice,
            1,
            2,
            Body::MarkPrice(MarkPrice {
                mark_price: dec("67000"),
                index_price: Some(dec("66990")),
            }),
        );
        let commands = RedisWriter::build_commands(&record, 1000);
        match &commands[0] {
            KvCommand::HashSet { key, fields, ttl_s } => {
                assert_eq!(key, "marketdata:mark_price:BTCUSDT");
                assert_eq!(*ttl_s, Some(3));
                assert!(fields.contains(&("index_px".to_string(), "66990".to_string())));
            }
            other => panic!("expected hash set, got {other:?}"),
        }
    }

    #[test]
    fn test_kline_key_includes_interval() {
        let record = Record::new(
            "ETHUSDT",
            Channel::Klines,
            1,
            2,
            Body::Kline(Kline {
                interval: "1m".to_string(),
                open: dec("1"),
                high: dec("2"),
                low: dec("1"),
                close: dec("2"),
                volume: dec("10"),
                quote_volume: dec("15"),
                taker_buy_base_volume: dec("6"),
                taker_buy_quote_volume: dec("9"),
                trade_count: 5,
                is_closed: true,
            }),
        );
        let commands = RedisWriter::build_commands(&record, 1000);
        match &commands[0] {
            KvCommand::HashSet { key, ttl_s, .. } => {
                assert_eq!(key, "marketdata:klines:1m:ETHUSDT");
                assert_eq!(*ttl_s, Some(120));
            }
            other => panic!("expected hash set, got {other:?}"),
        }
    }

    #[test]
    fn test_depth_kinds_and_no_ttl() {
        for (depth, kind) in [(1u16, "l1"), (5, "top5"), (20, "top20")] {
            let channel = match depth {
                1 => Channel::L1,
                5 => Channel::ObTop5,
                _ => Channel::ObTop20,
            };
            let record = Record::new(
                "BTCUSDT",
                channel,
                1,
                2,
                Body::DepthSnapshot(DepthSnapshot {
                    depth,
                    bid_prices: vec![dec("100")],
                    bid_qtys: vec![dec("1")],
                    ask_prices: vec![dec("101")],
                    ask_qtys: vec![dec("2")],
                }),
            );
            let commands = RedisWriter::build_commands(&record, 1000);
            match &commands[0] {
                KvCommand::HashSet { key, fields, ttl_s } => {
                    assert_eq!(key, &format!("marketdata:{}:BTCUSDT", kind));
                    assert_eq!(*ttl_s, None);
                    assert!(fields.contains(&("b1_px".to_string(), "100".to_string())));
                    assert!(fields.contains(&("a1_sz".to_string(), "2".to_string())));
                }
                other => panic!("expected hash set, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_diff_produces_no_commands() {
        let record = Record::new(
            "BTCUSDT",
            Channel::ObDiff,
            1,
            2,
            Body::DepthDiff(crate::events::DepthDiff {
                sequence: 2,
                prev_sequence: 1,
                bids: Vec::new(),
                asks: Vec::new(),
            }),
        );
        assert!(RedisWriter::build_commands(&record, 1000).is_empty());
    }
}
