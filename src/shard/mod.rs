//! Connection shard.
//!
//! A shard owns one multiplexed websocket connection and a fixed subset of
//! symbols. The reader task normalizes frames into records and per-symbol
//! state updates; independent timers emit top-20 snapshots (100 ms), L1
//! samples (200 ms) and the 1.5 s metric window; the 5-second trade
//! aggregator consumes through a bounded queue. Transport errors back off
//! and reconnect; sequence gaps during an outage heal through the book's
//! reset-and-resync path.

pub mod state;

pub use state::{BookTickerState, GlobalCaches, MarkState, SymbolState};

use crate::aggregate::metrics::{self, MetricsInput};
use crate::aggregate::window::L1Sample;
use crate::aggregate::{AggTradeAggregator, TradeInput};
use crate::binance::streams::{self, StreamKind};
use crate::binance::types::{
    CombinedStreamMessage, DepthDiffMessage, ForceOrderMessage, KlineMessage, MarkPriceMessage,
    TradeMessage,
};
use crate::binance::FuturesRestClient;
use crate::book::DiffOutcome;
use crate::config::AppConfig;
use crate::error::{FeedError, Result};
use crate::events::{
    AdvancedMetrics, Body, Channel, DepthDiff, DepthSnapshot, Funding, Kline, Liquidation,
    MarkPrice, Record, Side, Trade,
};
use crate::rest::RestCaches;
use crate::router::Router;
use crate::util::{dec_to_f64, ms_to_ns, now_ns, parse_decimal, window_start};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reconnect backoff after a transport error.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// Age bound for the global bookTicker L1 fallback.
const BOOK_TICKER_MAX_AGE_NS: u64 = 5 * crate::util::NS_PER_SEC;

/// Per-shard counter maps keyed by channel name.
#[derive(Default)]
struct Counters {
    ws_msgs: Mutex<HashMap<&'static str, u64>>,
    ws_conns: Mutex<HashMap<&'static str, u64>>,
    ws_discs: Mutex<HashMap<&'static str, u64>>,
    parse_errors: Mutex<HashMap<&'static str, u64>>,
    validation_errors: Mutex<HashMap<&'static str, u64>>,
}

fn bump(map: &Mutex<HashMap<&'static str, u64>>, key: &'static str) {
    if let Ok(mut counters) = map.lock() {
        *counters.entry(key).or_insert(0) += 1;
    }
}

fn snapshot(map: &Mutex<HashMap<&'static str, u64>>) -> HashMap<&'static str, u64> {
    map.lock().map(|m| m.clone()).unwrap_or_default()
}

/// Counter snapshot for the orchestrator's stats surface.
#[derive(Debug, Clone, Default)]
pub struct ShardStats {
    pub id: usize,
    pub symbols: usize,
    pub ws_msgs: HashMap<&'static str, u64>,
    pub ws_conns: HashMap<&'static str, u64>,
    pub ws_discs: HashMap<&'static str, u64>,
    pub parse_errors: HashMap<&'static str, u64>,
    pub validation_errors: HashMap<&'static str, u64>,
    pub agg_enqueued: u64,
    pub agg_processed: u64,
    pub agg_emitted: u64,
    pub agg_dropped: u64,
}

pub struct Shard {
    id: usize,
    symbols: Vec<String>,
    states: HashMap<String, Mutex<SymbolState>>,
    router: Arc<Router>,
    rest: Arc<FuturesRestClient>,
    caches: Arc<GlobalCaches>,
    rest_caches: Arc<RestCaches>,
    config: Arc<AppConfig>,
    counters: Counters,

    aggregator: Option<Mutex<AggTradeAggregator>>,
    agg_tx: Option<mpsc::Sender<(String, TradeInput)>>,
    agg_rx: Mutex<Option<mpsc::Receiver<(String, TradeInput)>>>,
    agg_enqueued: AtomicU64,
    agg_processed: AtomicU64,
    agg_emitted: AtomicU64,
    agg_dropped: AtomicU64,
}

impl Shard {
    pub fn new(
        id: usize,
        symbols: Vec<String>,
        router: Arc<Router>,
        rest: Arc<FuturesRestClient>,
        caches: Arc<GlobalCaches>,
        rest_caches: Arc<RestCaches>,
        config: Arc<AppConfig>,
    ) -> Arc<Self> {
        let mut states = HashMap::new();
        for symbol in &symbols {
            states.insert(symbol.clone(), Mutex::new(SymbolState::new()));
        }

        let (aggregator, agg_tx, agg_rx) = if config.channel_enabled(Channel::AggTrades5s) {
            let aggregator = AggTradeAggregator::new(
                5,
                symbols.clone(),
                config.agg_trade_max_catchup_windows,
                config.agg_trade_late_grace_s,
            );
            let (tx, rx) = mpsc::channel(config.agg_trade_queue_max.max(1));
            (Some(Mutex::new(aggregator)), Some(tx), Some(rx))
        } else {
            (None, None, None)
        };

        Arc::new(Self {
            id,
            symbols,
            states,
            router,
            rest,
            caches,
            rest_caches,
            config,
            counters: Counters::default(),
            aggregator,
            agg_tx,
            agg_rx: Mutex::new(agg_rx),
            agg_enqueued: AtomicU64::new(0),
            agg_processed: AtomicU64::new(0),
            agg_emitted: AtomicU64::new(0),
            agg_dropped: AtomicU64::new(0),
        })
    }

    pub fn stats(&self) -> ShardStats {
        ShardStats {
            id: self.id,
            symbols: self.symbols.len(),
            ws_msgs: snapshot(&self.counters.ws_msgs),
            ws_conns: snapshot(&self.counters.ws_conns),
            ws_discs: snapshot(&self.counters.ws_discs),
            parse_errors: snapshot(&self.counters.parse_errors),
            validation_errors: snapshot(&self.counters.validation_errors),
            agg_enqueued: self.agg_enqueued.load(Ordering::Relaxed),
            agg_processed: self.agg_processed.load(Ordering::Relaxed),
            agg_emitted: self.agg_emitted.load(Ordering::Relaxed),
            agg_dropped: self.agg_dropped.load(Ordering::Relaxed),
        }
    }

    /// Run the shard until cancellation: bootstrap every owned book, start
    /// the timers and the aggregator tasks, then hold the stream loop.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(shard = self.id, symbols = self.symbols.len(), "shard starting");
        self.bootstrap_books(&shutdown).await;
        if shutdown.is_cancelled() {
            return;
        }

        if self.aggregator.is_some() {
            tokio::spawn(Arc::clone(&self).run_agg_consumer(shutdown.clone()));
            tokio::spawn(Arc::clone(&self).run_agg_flush(shutdown.clone()));
        }
        tokio::spawn(Arc::clone(&self).run_top_snapshot_timer(shutdown.clone()));
        tokio::spawn(Arc::clone(&self).run_l1_timer(shutdown.clone()));
        tokio::spawn(Arc::clone(&self).run_window_flush(shutdown.clone()));

        let shard_id = self.id;
        self.run_stream_loop(shutdown).await;
        info!(shard = shard_id, "shard stopped");
    }

    /// REST-seed every owned book with a small per-symbol jitter so shards
    /// do not burst the depth endpoint in lockstep.
    async fn bootstrap_books(&self, shutdown: &CancellationToken) {
        for (idx, symbol) in self.symbols.clone().into_iter().enumerate() {
            let jitter_ms = (idx as u64 * 50) + rand::thread_rng().gen_range(0..50);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
                _ = shutdown.cancelled() => return,
            }
            self.resync_symbol(symbol).await;
        }
    }

    fn stream_names(&self) -> Vec<String> {
        let advanced = self.config.channel_enabled(Channel::AdvancedMetrics);
        let depth_derived = advanced
            || self.config.channel_enabled(Channel::ObTop20)
            || self.config.channel_enabled(Channel::ObTop5)
            || self.config.channel_enabled(Channel::L1)
            || self.config.channel_enabled(Channel::ObDiff);
        let trades = advanced
            || self.config.channel_enabled(Channel::Trades)
            || self.config.channel_enabled(Channel::AggTrades5s);
        let mark = advanced
            || self.config.channel_enabled(Channel::MarkPrice)
            || self.config.channel_enabled(Channel::Funding);
        let liquidations = advanced || self.config.channel_enabled(Channel::Liquidations);
        let klines = self.config.channel_enabled(Channel::Klines);

        let mut names = Vec::new();
        for symbol in &self.symbols {
            if depth_derived {
                names.push(streams::depth_diff_stream(symbol));
            }
            if trades {
                names.push(streams::trade_stream(symbol));
            }
            if mark {
                names.push(streams::mark_price_stream(symbol));
            }
            if liquidations {
                names.push(streams::force_order_stream(symbol));
            }
            if klines {
                names.push(streams::kline_stream(symbol, &self.config.kline_interval));
            }
        }
        names
    }

    async fn run_stream_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let stream_names = self.stream_names();
        if stream_names.is_empty() {
            warn!(shard = self.id, "no streams enabled, shard idle");
            shutdown.cancelled().await;
            return;
        }
        let url = streams::combined_url(&stream_names);

        while !shutdown.is_cancelled() {
            bump(&self.counters.ws_conns, "shard");
            info!(shard = self.id, streams = stream_names.len(), "connecting");
            match connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    info!(shard = self.id, "connected");
                    let (mut write, mut read) = ws_stream.split();
                    loop {
                        let message = tokio::select! {
                            message = read.next() => message,
                            _ = shutdown.cancelled() => return,
                        };
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(symbol) = self.handle_frame(&text) {
                                    let shard = Arc::clone(&self);
                                    tokio::spawn(async move {
                                        shard.resync_symbol(symbol).await;
                                    });
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if write.send(Message::Pong(data)).await.is_err() {
                                    warn!(shard = self.id, "pong send failed");
                                    break;
                                }
                            }
                            Some(Ok(Message::Pong(_))) => {}
                            Some(Ok(Message::Close(frame))) => {
                                info!(shard = self.id, frame = ?frame, "close frame received");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                error!(shard = self.id, error = %err, "websocket error");
                                break;
                            }
                            None => {
                                warn!(shard = self.id, "stream ended");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(shard = self.id, error = %err, "connect failed");
                }
            }

            bump(&self.counters.ws_discs, "shard");
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Decode and dispatch one frame. Returns a symbol that needs an
    /// asynchronous REST resync, which the caller spawns.
    fn handle_frame(&self, text: &str) -> Option<String> {
        let envelope: CombinedStreamMessage = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                bump(&self.counters.parse_errors, "envelope");
                debug!(shard = self.id, error = %err, "undecodable frame");
                return None;
            }
        };
        let Some(kind) = streams::classify(&envelope.stream) else {
            return None;
        };
        let ts_recv_ns = now_ns();
        let mut resync = None;
        let result = match kind {
            StreamKind::DepthDiff => match self.on_depth_diff(envelope.data, ts_recv_ns) {
                Ok(needs_resync) => {
                    resync = needs_resync;
                    Ok(())
                }
                Err(err) => Err(err),
            },
            StreamKind::Trade => self.on_trade(envelope.data, ts_recv_ns),
            StreamKind::MarkPrice => self.on_mark_price(envelope.data, ts_recv_ns),
            StreamKind::ForceOrder => self.on_force_order(envelope.data, ts_recv_ns),
            StreamKind::Kline => self.on_kline(envelope.data, ts_recv_ns),
        };
        if let Err(err) = result {
            let channel = match kind {
                StreamKind::DepthDiff => Channel::ObDiff.as_str(),
                StreamKind::Trade => Channel::Trades.as_str(),
                StreamKind::MarkPrice => Channel::MarkPrice.as_str(),
                StreamKind::ForceOrder => Channel::Liquidations.as_str(),
                StreamKind::Kline => Channel::Klines.as_str(),
            };
            match err {
                FeedError::Validation(message) => {
                    bump(&self.counters.validation_errors, channel);
                    warn!(shard = self.id, channel, error = %message, "validation error");
                }
                other => {
                    bump(&self.counters.parse_errors, channel);
                    warn!(shard = self.id, channel, error = %other, "parse error");
                }
            }
        }
        resync
    }

    fn on_depth_diff(
        &self,
        data: serde_json::Value,
        ts_recv_ns: u64,
    ) -> Result<Option<String>> {
        let msg: DepthDiffMessage = serde_json::from_value(data)?;
        let symbol = msg.symbol.to_uppercase();
        let bids = parse_levels(&msg.bids)?;
        let asks = parse_levels(&msg.asks)?;
        bump(&self.counters.ws_msgs, Channel::ObDiff.as_str());

        let mut needs_resync = false;
        if let Some(state_lock) = self.states.get(&symbol) {
            if let Ok(mut state) = state_lock.lock() {
                let outcome = state.book.apply_diff(
                    msg.first_update_id,
                    msg.final_update_id,
                    &bids,
                    &asks,
                );
                match outcome {
                    DiffOutcome::GapReset => {
                        state.window.flags.resynced_this_window = true;
                        needs_resync = true;
                        warn!(
                            shard = self.id,
                            symbol = %symbol,
                            first = msg.first_update_id,
                            last = msg.final_update_id,
                            "sequence gap, book reset"
                        );
                    }
                    DiffOutcome::Stale => {}
                    DiffOutcome::Applied => {
                        if state.book.is_crossed() {
                            state.window.flags.crossed_book = true;
                        }
                        if let Some(top) = state.book.l1() {
                            state.window.on_depth(L1Sample::from_top(&top));
                        }
                    }
                }
            }
        }

        if self.config.channel_enabled(Channel::ObDiff) {
            self.publish(Record::new(
                symbol.clone(),
                Channel::ObDiff,
                ms_to_ns(msg.event_time_ms),
                ts_recv_ns,
                Body::DepthDiff(DepthDiff {
                    sequence: msg.final_update_id,
                    prev_sequence: msg.first_update_id,
                    bids,
                    asks,
                }),
            ));
        }
        Ok(needs_resync.then_some(symbol))
    }

    fn on_trade(&self, data: serde_json::Value, ts_recv_ns: u64) -> Result<()> {
        let msg: TradeMessage = serde_json::from_value(data)?;
        let symbol = msg.symbol.to_uppercase();
        let price = parse_decimal(&msg.price)
            .map_err(|e| FeedError::Validation(format!("trade price: {}", e)))?;
        let qty = parse_decimal(&msg.qty)
            .map_err(|e| FeedError::Validation(format!("trade qty: {}", e)))?;
        let ts_event_ns = ms_to_ns(if msg.trade_time_ms > 0 {
            msg.trade_time_ms
        } else {
            msg.event_time_ms
        });
        bump(&self.counters.ws_msgs, Channel::Trades.as_str());

        if let Some(state_lock) = self.states.get(&symbol) {
            if let Ok(mut state) = state_lock.lock() {
                state.window.on_trade(
                    dec_to_f64(price),
                    dec_to_f64(qty),
                    msg.buyer_is_maker,
                    ts_event_ns,
                );
            }
        }

        if self.config.channel_enabled(Channel::Trades) {
            self.publish(Record::new(
                symbol.clone(),
                Channel::Trades,
                ts_event_ns,
                ts_recv_ns,
                Body::Trade(Trade {
                    price,
                    qty,
                    side: if msg.buyer_is_maker { Side::Sell } else { Side::Buy },
                    trade_id: msg.trade_id.map(|id| id.to_string()),
                    is_aggressor: Some(!msg.buyer_is_maker),
                }),
            ));
        }

        if let Some(tx) = &self.agg_tx {
            let input = TradeInput {
                price,
                qty,
                ts_event_ns,
                ts_recv_ns,
                trade_id: msg.trade_id.map(|id| id.to_string()),
                is_sell: msg.buyer_is_maker,
            };
            match tx.try_send((symbol, input)) {
                Ok(()) => {
                    self.agg_enqueued.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.agg_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    fn on_mark_price(&self, data: serde_json::Value, ts_recv_ns: u64) -> Result<()> {
        let msg: MarkPriceMessage = serde_json::from_value(data)?;
        let symbol = msg.symbol.to_uppercase();
        let mark_price = parse_decimal(&msg.mark_price)
            .map_err(|e| FeedError::Validation(format!("mark price: {}", e)))?;
        let index_price = match &msg.index_price {
            Some(raw) if !raw.is_empty() => Some(
                parse_decimal(raw)
                    .map_err(|e| FeedError::Validation(format!("index price: {}", e)))?,
            ),
            _ => None,
        };
        let ts_event_ns = ms_to_ns(msg.event_time_ms);
        bump(&self.counters.ws_msgs, Channel::MarkPrice.as_str());

        self.caches.set_mark(
            &symbol,
            MarkState {
                mark_price: dec_to_f64(mark_price),
                index_price: index_price.map(dec_to_f64),
                ts_event_ns,
            },
        );
        if let Some(state_lock) = self.states.get(&symbol) {
            if let Ok(mut state) = state_lock.lock() {
                state.window.flags.has_mark = true;
            }
        }

        if self.config.channel_enabled(Channel::MarkPrice) {
            self.publish(Record::new(
                symbol.clone(),
                Channel::MarkPrice,
                ts_event_ns,
                ts_recv_ns,
                Body::MarkPrice(MarkPrice { mark_price, index_price }),
            ));
        }
        if self.config.channel_enabled(Channel::Funding) {
            if let (Some(rate), Some(next_ms)) = (&msg.funding_rate, msg.next_funding_time_ms) {
                bump(&self.counters.ws_msgs, Channel::Funding.as_str());
                let funding_rate = parse_decimal(rate)
                    .map_err(|e| FeedError::Validation(format!("funding rate: {}", e)))?;
                self.publish(Record::new(
                    symbol,
                    Channel::Funding,
                    ts_event_ns,
                    ts_recv_ns,
                    Body::Funding(Funding {
                        funding_rate,
                        next_funding_ts_ns: ms_to_ns(next_ms),
                    }),
                ));
            }
        }
        Ok(())
    }

    fn on_force_order(&self, data: serde_json::Value, ts_recv_ns: u64) -> Result<()> {
        let msg: ForceOrderMessage = serde_json::from_value(data)?;
        let order = msg.order;
        let symbol = order.symbol.to_uppercase();
        let side = match order.side.as_str() {
            "BUY" => Side::Buy,
            "SELL" => Side::Sell,
            other => {
                return Err(FeedError::Validation(format!(
                    "liquidation side '{}'",
                    other
                )))
            }
        };
        let price = parse_decimal(&order.last_filled_price)
            .map_err(|e| FeedError::Validation(format!("liquidation price: {}", e)))?;
        let qty = parse_decimal(&order.filled_qty)
            .map_err(|e| FeedError::Validation(format!("liquidation qty: {}", e)))?;
        let ts_event_ns = ms_to_ns(order.trade_time_ms);
        bump(&self.counters.ws_msgs, Channel::Liquidations.as_str());

        self.caches.push_liquidation(&symbol, ts_event_ns);

        if self.config.channel_enabled(Channel::Liquidations) {
            self.publish(Record::new(
                symbol,
                Channel::Liquidations,
                ts_event_ns,
                ts_recv_ns,
                Body::Liquidation(Liquidation {
                    side,
                    price,
                    qty,
                    order_id: order.order_id.map(|id| id.to_string()),
                    reason: order.status,
                }),
            ));
        }
        Ok(())
    }

    fn on_kline(&self, data: serde_json::Value, ts_recv_ns: u64) -> Result<()> {
        let msg: KlineMessage = serde_json::from_value(data)?;
        // Open candles stream continuously; only the closing update persists.
        if !msg.kline.is_closed {
            return Ok(());
        }
        let symbol = msg.symbol.to_uppercase();
        bump(&self.counters.ws_msgs, Channel::Klines.as_str());
        if !self.config.channel_enabled(Channel::Klines) {
            return Ok(());
        }

        let k = msg.kline;
        let parse = |field: &str, raw: &str| {
            parse_decimal(raw).map_err(|e| FeedError::Validation(format!("kline {}: {}", field, e)))
        };
        self.publish(Record::new(
            symbol,
            Channel::Klines,
            ms_to_ns(msg.event_time_ms),
            ts_recv_ns,
            Body::Kline(Kline {
                interval: k.interval.clone(),
                open: parse("open", &k.open)?,
                high: parse("high", &k.high)?,
                low: parse("low", &k.low)?,
                close: parse("close", &k.close)?,
                volume: parse("volume", &k.volume)?,
                quote_volume: parse("quote_volume", &k.quote_volume)?,
                taker_buy_base_volume: parse("taker_buy_base", &k.taker_buy_base_volume)?,
                taker_buy_quote_volume: parse("taker_buy_quote", &k.taker_buy_quote_volume)?,
                trade_count: k.trade_count,
                is_closed: k.is_closed,
            }),
        ));
        Ok(())
    }

    /// Fetch a REST depth snapshot and reseed the book. At most one request
    /// is in flight per symbol and successful snapshots arm a cooldown, so
    /// a burst of gaps cannot stampede the endpoint.
    async fn resync_symbol(&self, symbol: String) {
        let cooldown = Duration::from_secs(self.config.rest_cooldown_sec);
        {
            let Some(state_lock) = self.states.get(&symbol) else {
                return;
            };
            let Ok(mut state) = state_lock.lock() else {
                return;
            };
            if !state.book.begin_rest_snapshot(cooldown) {
                debug!(shard = self.id, symbol = %symbol, "resync suppressed (inflight or cooldown)");
                return;
            }
        }

        let result = self
            .rest
            .depth(&symbol, self.config.rest_depth_limit)
            .await
            .and_then(|snapshot| {
                let bids = parse_levels(&snapshot.bids)?;
                let asks = parse_levels(&snapshot.asks)?;
                Ok((snapshot.last_update_id, bids, asks))
            });

        let Some(state_lock) = self.states.get(&symbol) else {
            return;
        };
        let Ok(mut state) = state_lock.lock() else {
            return;
        };
        match result {
            Ok((last_update_id, bids, asks)) => {
                state.book.apply_snapshot(last_update_id, bids, asks);
                state.book.finish_rest_snapshot(true);
                info!(
                    shard = self.id,
                    symbol = %symbol,
                    last_update_id,
                    initialized = state.book.initialized,
                    "book seeded from REST snapshot"
                );
            }
            Err(err) => {
                state.book.finish_rest_snapshot(false);
                warn!(shard = self.id, symbol = %symbol, error = %err, "REST snapshot failed");
            }
        }
    }

    /// 100 ms top-of-book snapshots from every initialized local book.
    async fn run_top_snapshot_timer(self: Arc<Self>, shutdown: CancellationToken) {
        let top20 = self.config.channel_enabled(Channel::ObTop20);
        let top5 = self.config.channel_enabled(Channel::ObTop5);
        if !top20 && !top5 {
            return;
        }
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.top20_snapshot_ms.max(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            let ts = now_ns();
            for symbol in &self.symbols {
                let Some(state_lock) = self.states.get(symbol) else {
                    continue;
                };
                let levels = {
                    let Ok(state) = state_lock.lock() else { continue };
                    if !state.book.initialized {
                        continue;
                    }
                    state.book.top(20)
                };
                if top20 {
                    self.publish(depth_record(symbol, Channel::ObTop20, 20, &levels, ts));
                }
                if top5 {
                    let trimmed = (
                        levels.0.iter().take(5).copied().collect::<Vec<_>>(),
                        levels.1.iter().take(5).copied().collect::<Vec<_>>(),
                    );
                    self.publish(depth_record(symbol, Channel::ObTop5, 5, &trimmed, ts));
                }
            }
        }
    }

    /// 200 ms L1 sampler: top-of-book snapshot plus the microprice-bearing
    /// metric surrogate with its own independently-reset OFI accumulator.
    async fn run_l1_timer(self: Arc<Self>, shutdown: CancellationToken) {
        let l1_enabled = self.config.channel_enabled(Channel::L1);
        let advanced = self.config.channel_enabled(Channel::AdvancedMetrics);
        if !l1_enabled && !advanced {
            return;
        }
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.l1_sample_ms.max(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            let ts = now_ns();
            for symbol in &self.symbols {
                let Some(state_lock) = self.states.get(symbol) else {
                    continue;
                };
                let sampled = {
                    let Ok(mut state) = state_lock.lock() else { continue };
                    match state.book.l1() {
                        Some(top) => Some((top, state.window.take_fast_ofi())),
                        None => None,
                    }
                };
                let Some((top, fast_ofi)) = sampled else {
                    continue;
                };
                if l1_enabled {
                    let levels = (
                        vec![(top.bid_price, top.bid_qty)],
                        vec![(top.ask_price, top.ask_qty)],
                    );
                    self.publish(depth_record(symbol, Channel::L1, 1, &levels, ts));
                }
                if advanced {
                    let sample = L1Sample::from_top(&top);
                    self.publish(Record::new(
                        symbol.clone(),
                        Channel::AdvancedMetrics,
                        ts,
                        ts,
                        Body::AdvancedMetrics(AdvancedMetrics {
                            metrics: metrics::l1_surrogate(&sample, fast_ofi),
                        }),
                    ));
                }
            }
        }
    }

    /// 1.5 s metric window flush.
    async fn run_window_flush(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.channel_enabled(Channel::AdvancedMetrics) {
            return;
        }
        let window_ns = self.config.window_flush_ms.max(100) * crate::util::NS_PER_MS;
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.window_flush_ms.max(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            let now = now_ns();
            for symbol in &self.symbols {
                let Some(state_lock) = self.states.get(symbol) else {
                    continue;
                };
                let liquidations = self.caches.take_liquidations(symbol);
                let mark = self.caches.mark(symbol);
                let ticker_l1 = self.caches.book_ticker(symbol);
                let open_interest = self.rest_caches.open_interest(symbol);
                let long_short = self.rest_caches.long_short(symbol);

                let metrics_map = {
                    let Ok(mut state) = state_lock.lock() else { continue };
                    if !liquidations.is_empty() {
                        state.window.flags.has_liq = true;
                    }

                    // L1 policy: local book, then a fresh global bookTicker,
                    // then the previous close as a harmless symmetric quote.
                    let l1 = match state.book.l1() {
                        Some(top) => {
                            state.window.flags.has_l1 = true;
                            Some(L1Sample::from_top(&top))
                        }
                        None => match ticker_l1 {
                            Some(cached)
                                if now.saturating_sub(cached.ts_recv_ns)
                                    <= BOOK_TICKER_MAX_AGE_NS =>
                            {
                                state.window.flags.has_l1 = true;
                                Some(cached.l1)
                            }
                            _ => state.window.last_close.map(|close| L1Sample {
                                bid_price: close,
                                bid_qty: 0.0,
                                ask_price: close,
                                ask_qty: 0.0,
                            }),
                        },
                    };

                    let (bids, asks) = state.book.top(20);
                    let top_bids: Vec<(f64, f64)> = bids
                        .iter()
                        .map(|(p, q)| (dec_to_f64(*p), dec_to_f64(*q)))
                        .collect();
                    let top_asks: Vec<(f64, f64)> = asks
                        .iter()
                        .map(|(p, q)| (dec_to_f64(*p), dec_to_f64(*q)))
                        .collect();

                    let input = MetricsInput {
                        l1,
                        top_bids: &top_bids,
                        top_asks: &top_asks,
                        index_price: mark.and_then(|m| m.index_price),
                        open_interest,
                        long_short_ratio: long_short,
                        window_start_ns: window_start(now, window_ns),
                        window_ns,
                        book_update_count: state.book.take_window_update_count(),
                    };
                    let state = &mut *state;
                    let map = metrics::compute(&state.window, &mut state.rolling, &input);
                    state.window.reset();
                    map
                };

                bump(&self.counters.ws_msgs, Channel::AdvancedMetrics.as_str());
                self.publish(Record::new(
                    symbol.clone(),
                    Channel::AdvancedMetrics,
                    now,
                    now,
                    Body::AdvancedMetrics(AdvancedMetrics { metrics: metrics_map }),
                ));
            }
        }
    }

    /// Drain the bounded trade queue into the 5-second aggregator.
    async fn run_agg_consumer(self: Arc<Self>, shutdown: CancellationToken) {
        let receiver = match self.agg_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(mut receiver) = receiver else {
            return;
        };
        loop {
            let item = tokio::select! {
                item = receiver.recv() => item,
                _ = shutdown.cancelled() => return,
            };
            let Some((symbol, input)) = item else {
                return;
            };
            let rolled = match &self.aggregator {
                Some(agg) => agg.lock().ok().and_then(|mut agg| agg.update(&symbol, input)),
                None => None,
            };
            self.agg_processed.fetch_add(1, Ordering::Relaxed);
            if let Some(record) = rolled {
                bump(&self.counters.ws_msgs, Channel::AggTrades5s.as_str());
                self.agg_emitted.fetch_add(1, Ordering::Relaxed);
                self.publish(record);
            }
        }
    }

    /// Watermark flush for the 5-second grid, once per second.
    async fn run_agg_flush(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            let Some(agg) = &self.aggregator else { return };
            let (records, caps, skipped, late) = {
                let Ok(mut agg) = agg.lock() else { continue };
                let records = agg.flush(now_ns());
                let (caps, skipped) = agg.take_catchup_stats();
                let late = agg.take_late_trades();
                (records, caps, skipped, late)
            };
            if caps > 0 {
                warn!(
                    shard = self.id,
                    capped_symbols = caps,
                    skipped_windows = skipped,
                    "agg-trade catch-up capped"
                );
            }
            if late > 0 {
                warn!(shard = self.id, late_trades = late, "late trades dropped");
            }
            if !records.is_empty() {
                self.agg_emitted
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                for record in records {
                    bump(&self.counters.ws_msgs, Channel::AggTrades5s.as_str());
                    self.publish(record);
                }
            }
        }
    }

    fn publish(&self, record: Record) {
        self.router.publish(&record);
    }
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<(Decimal, Decimal)>> {
    let mut levels = Vec::with_capacity(raw.len());
    for [price, qty] in raw {
        let price = parse_decimal(price)
            .map_err(|e| FeedError::Validation(format!("level price '{}': {}", price, e)))?;
        let qty = parse_decimal(qty)
            .map_err(|e| FeedError::Validation(format!("level qty '{}': {}", qty, e)))?;
        levels.push((price, qty));
    }
    Ok(levels)
}

fn depth_record(
    symbol: &str,
    channel: Channel,
    depth: u16,
    levels: &(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>),
    ts_ns: u64,
) -> Record {
    let (bids, asks) = levels;
    Record::new(
        symbol,
        channel,
        ts_ns,
        ts_ns,
        Body::DepthSnapshot(DepthSnapshot {
            depth,
            bid_prices: bids.iter().map(|(p, _)| *p).collect(),
            bid_qtys: bids.iter().map(|(_, q)| *q).collect(),
            ask_prices: asks.iter().map(|(p, _)| *p).collect(),
            ask_qtys: asks.iter().map(|(_, q)| *q).collect(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ChannelConfig, ClickHouseConfig, OutputTargets, RedisConfig};
    use crate::router::RecordWriter;

    fn test_config() -> Arc<AppConfig> {
        let mut channels = HashMap::new();
        for channel in Channel::ALL {
            channels.insert(
                channel,
                ChannelConfig { enabled: true, outputs: OutputTargets::CLICKHOUSE_ONLY },
            );
        }
        Arc::new(AppConfig {
            symbols: vec!["BTCUSDT".to_string()],
            kline_interval: "1m".to_string(),
            channels,
            clickhouse: ClickHouseConfig {
                url: "http://localhost:8123".to_string(),
                database: "marketdata".to_string(),
                batch_rows: 5000,
                flush_interval_ms: 250,
                max_buffer_rows: 200_000,
                compression: None,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                pipeline_size: 200,
                flush_interval_ms: 50,
                stream_maxlen: 1000,
            },
            top20_snapshot_ms: 100,
            l1_sample_ms: 200,
            window_flush_ms: 1500,
            rest_depth_limit: 200,
            rest_cooldown_sec: 30,
            rest_retry_max: 3,
            agg_trade_queue_max: 16,
            agg_trade_max_catchup_windows: 120,
            agg_trade_late_grace_s: 2,
            symbols_per_shard: 30,
            cpu_core: None,
            open_interest_period_s: 30,
            open_interest_parallelism: 50,
            long_short_requests_per_min: 190,
            long_short_parallelism: 32,
            rest_start_delay_s: 8,
        })
    }

    struct CapturingWriter {
        seen: Mutex<Vec<Record>>,
    }

    impl RecordWriter for CapturingWriter {
        fn name(&self) -> &'static str {
            "capture"
        }

        fn enqueue(&self, record: &Record) {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(record.clone());
            }
        }
    }

    fn shard_with_capture() -> (Arc<Shard>, Arc<CapturingWriter>) {
        let writer = Arc::new(CapturingWriter { seen: Mutex::new(Vec::new()) });
        let mut router = Router::new();
        for channel in Channel::ALL {
            router.bind(channel, writer.clone());
        }
        let config = test_config();
        let shard = Shard::new(
            0,
            vec!["BTCUSDT".to_string()],
            Arc::new(router),
            Arc::new(FuturesRestClient::new(0).unwrap()),
            Arc::new(GlobalCaches::new()),
            Arc::new(RestCaches::new()),
            config,
        );
        (shard, writer)
    }

    fn diff_frame(first: u64, last: u64, bids: &str, asks: &str) -> serde_json::Value {
        serde_json::json!({
            "e": "depthUpdate",
            "E": 1_700_000_000_000u64,
            "s": "BTCUSDT",
            "U": first,
            "u": last,
            "b": serde_json::from_str::<serde_json::Value>(bids).unwrap(),
            "a": serde_json::from_str::<serde_json::Value>(asks).unwrap(),
        })
    }

    #[tokio::test]
    async fn test_depth_diff_updates_book_and_publishes() {
        let (shard, writer) = shard_with_capture();
        shard
            .on_depth_diff(
                diff_frame(1, 2, r#"[["100.0","1.0"]]"#, r#"[["101.0","2.0"]]"#),
                now_ns(),
            )
            .unwrap();

        let state = shard.states.get("BTCUSDT").unwrap().lock().unwrap();
        assert_eq!(state.book.last_update_id, Some(2));
        drop(state);

        let seen = writer.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].channel, Channel::ObDiff);
    }

    #[tokio::test]
    async fn test_trade_feeds_window_and_queue() {
        let (shard, writer) = shard_with_capture();
        let frame = serde_json::json!({
            "e": "trade",
            "E": 1_700_000_000_000u64,
            "T": 1_700_000_000_001u64,
            "s": "BTCUSDT",
            "t": 5u64,
            "p": "67000.5",
            "q": "0.25",
            "m": false
        });
        shard.on_trade(frame, now_ns()).unwrap();

        let state = shard.states.get("BTCUSDT").unwrap().lock().unwrap();
        assert_eq!(state.window.trade_prices.len(), 1);
        assert!(state.window.flags.has_trades);
        drop(state);

        assert_eq!(shard.agg_enqueued.load(Ordering::Relaxed), 1);
        let seen = writer.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        match &seen[0].body {
            Body::Trade(trade) => {
                assert_eq!(trade.side, Side::Buy);
                assert_eq!(trade.is_aggressor, Some(true));
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_trade_price_is_validation_error() {
        let (shard, _) = shard_with_capture();
        let frame = serde_json::json!({
            "e": "trade",
            "E": 1u64,
            "T": 1u64,
            "s": "BTCUSDT",
            "p": "not-a-price",
            "q": "0.25",
            "m": false
        });
        let err = shard.on_trade(frame, now_ns()).unwrap_err();
        assert!(matches!(err, FeedError::Validation(_)));
    }

    #[tokio::test]
    async fn test_mark_price_updates_cache_and_emits_funding() {
        let (shard, writer) = shard_with_capture();
        let frame = serde_json::json!({
            "e": "markPriceUpdate",
            "E": 1_700_000_000_000u64,
            "s": "BTCUSDT",
            "p": "67700.12",
            "i": "67690.00",
            "r": "0.0001",
            "T": 1_700_000_400_000u64
        });
        shard.on_mark_price(frame, now_ns()).unwrap();

        let mark = shard.caches.mark("BTCUSDT").unwrap();
        assert!((mark.mark_price - 67700.12).abs() < 1e-9);
        assert!(mark.index_price.is_some());

        let seen = writer.seen.lock().unwrap();
        let channels: Vec<Channel> = seen.iter().map(|r| r.channel).collect();
        assert!(channels.contains(&Channel::MarkPrice));
        assert!(channels.contains(&Channel::Funding));
    }

    #[tokio::test]
    async fn test_open_kline_is_skipped() {
        let (shard, writer) = shard_with_capture();
        let frame = serde_json::json!({
            "e": "kline",
            "E": 1u64,
            "s": "BTCUSDT",
            "k": {
                "i": "1m", "o": "1", "h": "2", "l": "1", "c": "2",
                "v": "10", "q": "15", "V": "6", "Q": "9", "n": 5, "x": false
            }
        });
        shard.on_kline(frame, now_ns()).unwrap();
        assert!(writer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gap_diff_flags_resync() {
        let (shard, _) = shard_with_capture();
        // Seed an initialized book.
        {
            let mut state = shard.states.get("BTCUSDT").unwrap().lock().unwrap();
            let bids: Vec<(Decimal, Decimal)> =
                (80..100).map(|p| (Decimal::from(p), Decimal::ONE)).collect();
            let asks: Vec<(Decimal, Decimal)> =
                (101..121).map(|p| (Decimal::from(p), Decimal::ONE)).collect();
            state.book.apply_snapshot(100, bids, asks);
            assert!(state.book.initialized);
        }

        let resync = shard
            .on_depth_diff(
                diff_frame(205, 207, r#"[["95.0","5.0"]]"#, "[]"),
                now_ns(),
            )
            .unwrap();
        assert_eq!(resync, Some("BTCUSDT".to_string()));

        let state = shard.states.get("BTCUSDT").unwrap().lock().unwrap();
        assert!(!state.book.initialized);
        assert!(state.window.flags.resynced_this_window);
    }

    #[test]
    fn test_stream_names_cover_enabled_channels() {
        let (shard, _) = shard_with_capture();
        let names = shard.stream_names();
        assert!(names.contains(&"btcusdt@depth@100ms".to_string()));
        assert!(names.contains(&"btcusdt@trade".to_string()));
        assert!(names.contains(&"btcusdt@markPrice@1s".to_string()));
        assert!(names.contains(&"btcusdt@forceOrder".to_string()));
        assert!(names.contains(&"btcusdt@kline_1m".to_string()));
    }
}
