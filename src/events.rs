//! Normalized event model.
//!
//! Every payload decoded from the venue (or derived internally) becomes a
//! [`Record`]: a shared header plus a tagged body. The router dispatches on
//! the channel tag; writers map bodies onto sink rows and cache commands.

use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Closed set of logical channels the pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Trades,
    AggTrades5s,
    L1,
    ObTop5,
    ObTop20,
    ObDiff,
    Liquidations,
    Klines,
    MarkPrice,
    Funding,
    AdvancedMetrics,
}

impl Channel {
    pub const ALL: [Channel; 11] = [
        Channel::Trades,
        Channel::AggTrades5s,
        Channel::L1,
        Channel::ObTop5,
        Channel::ObTop20,
        Channel::ObDiff,
        Channel::Liquidations,
        Channel::Klines,
        Channel::MarkPrice,
        Channel::Funding,
        Channel::AdvancedMetrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Trades => "trades",
            Channel::AggTrades5s => "agg_trades_5s",
            Channel::L1 => "l1",
            Channel::ObTop5 => "ob_top5",
            Channel::ObTop20 => "ob_top20",
            Channel::ObDiff => "ob_diff",
            Channel::Liquidations => "liquidations",
            Channel::Klines => "klines",
            Channel::MarkPrice => "mark_price",
            Channel::Funding => "funding",
            Channel::AdvancedMetrics => "advanced_metrics",
        }
    }

    /// Destination table in the columnar store.
    pub fn table(&self) -> &'static str {
        match self {
            Channel::ObDiff => "order_book_diffs",
            other => other.as_str(),
        }
    }

    pub fn from_str(name: &str) -> Option<Channel> {
        Channel::ALL.iter().copied().find(|c| c.as_str() == name)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Taker side of a trade or liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Normalized record: shared header plus a channel-specific body.
#[derive(Debug, Clone)]
pub struct Record {
    /// Uppercase instrument symbol, e.g. "BTCUSDT".
    pub instrument: String,
    pub channel: Channel,
    /// Event time reported by the venue (or window end for aggregates).
    pub ts_event_ns: u64,
    /// Local receive time.
    pub ts_recv_ns: u64,
    pub body: Body,
}

#[derive(Debug, Clone)]
pub enum Body {
    Trade(Trade),
    AggTrade5s(AggTrade5s),
    DepthSnapshot(DepthSnapshot),
    DepthDiff(DepthDiff),
    Liquidation(Liquidation),
    Kline(Kline),
    MarkPrice(MarkPrice),
    Funding(Funding),
    AdvancedMetrics(AdvancedMetrics),
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub price: Decimal,
    pub qty: Decimal,
    pub side: Side,
    pub trade_id: Option<String>,
    pub is_aggressor: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct AggTrade5s {
    pub interval_s: u32,
    pub window_start_ns: u64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub notional: Decimal,
    pub trade_count: u32,
    pub buy_qty: Decimal,
    pub sell_qty: Decimal,
    pub buy_notional: Decimal,
    pub sell_notional: Decimal,
    pub first_trade_id: Option<String>,
    pub last_trade_id: Option<String>,
}

/// Top-of-book or top-N snapshot. Prices and quantities are parallel arrays
/// ordered best-first on both sides.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub depth: u16,
    pub bid_prices: Vec<Decimal>,
    pub bid_qtys: Vec<Decimal>,
    pub ask_prices: Vec<Decimal>,
    pub ask_qtys: Vec<Decimal>,
}

/// Incremental book update; a zero quantity deletes the level.
#[derive(Debug, Clone)]
pub struct DepthDiff {
    pub sequence: u64,
    pub prev_sequence: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Clone)]
pub struct Liquidation {
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub order_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Kline {
    pub interval: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub taker_buy_base_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
    pub trade_count: u32,
    pub is_closed: bool,
}

#[derive(Debug, Clone)]
pub struct MarkPrice {
    pub mark_price: Decimal,
    pub index_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct Funding {
    pub funding_rate: Decimal,
    pub next_funding_ts_ns: u64,
}

/// Derived microstructure metrics keyed by name. A `BTreeMap` keeps row
/// content deterministic, which lets sink consumers dedup replayed batches.
#[derive(Debug, Clone)]
pub struct AdvancedMetrics {
    pub metrics: BTreeMap<String, Decimal>,
}

impl Record {
    pub fn new(instrument: impl Into<String>, channel: Channel, ts_event_ns: u64, ts_recv_ns: u64, body: Body) -> Self {
        let mut instrument = instrument.into();
        if instrument.chars().any(|c| c.is_ascii_lowercase()) {
            instrument = instrument.to_uppercase();
        }
        Self {
            instrument,
            channel,
            ts_event_ns,
            ts_recv_ns,
            body,
        }
    }
}
