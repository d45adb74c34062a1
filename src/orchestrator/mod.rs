//! Wiring and lifecycle.
//!
//! The orchestrator resolves the symbol universe, initializes only the sink
//! writers the enabled channels require, binds the router, constructs the
//! shards (staggered to amortize connection load), runs the global
//! bookTicker fallback socket and starts the REST scheduler once the shards
//! have steady state. One cancellation token cascades shutdown; writers
//! flush their remaining buffers on stop.

use crate::binance::streams::all_book_ticker_url;
use crate::binance::types::BookTickerMessage;
use crate::binance::FuturesRestClient;
use crate::config::AppConfig;
use crate::error::{FeedError, Result};
use crate::events::Channel;
use crate::health::{default_channels, HealthMonitor};
use crate::rest::{RestCaches, RestScheduler};
use crate::router::{Router, RouterStats};
use crate::shard::{BookTickerState, GlobalCaches, Shard, ShardStats};
use crate::sink::{ClickHouseWriter, RedisWriter, SinkStats};
use crate::util::now_ns;
use crate::aggregate::window::L1Sample;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Delay between shard starts.
const SHARD_STAGGER: Duration = Duration::from_millis(250);

/// Aggregated counter snapshot across writers, router and shards.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub clickhouse: Option<SinkStats>,
    pub redis: Option<SinkStats>,
    pub router: RouterStats,
    pub shards: Vec<ShardStats>,
}

pub struct Orchestrator {
    config: Arc<AppConfig>,
    router: Arc<Router>,
    shards: Vec<Arc<Shard>>,
    clickhouse: Option<Arc<ClickHouseWriter>>,
    redis: Option<Arc<RedisWriter>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Wire everything and start the pipeline.
    pub async fn start(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);
        let rest_client = Arc::new(FuturesRestClient::new(config.rest_retry_max)?);

        let symbols = if config.symbols.is_empty() {
            let discovered = rest_client.perpetual_symbols().await?;
            info!(symbols = discovered.len(), "symbol universe discovered");
            discovered
        } else {
            config.symbols.clone()
        };
        if symbols.is_empty() {
            return Err(FeedError::Config("symbol universe is empty".to_string()));
        }

        let shutdown = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Initialize only the writers the enabled channels need.
        let targets = config.required_targets();
        let clickhouse = if targets.clickhouse {
            let writer = ClickHouseWriter::new(&config.clickhouse)?;
            writer.bootstrap_schema().await?;
            tasks.push(tokio::spawn(
                Arc::clone(&writer).run_autoflush(shutdown.clone()),
            ));
            Some(writer)
        } else {
            None
        };
        let redis = if targets.redis {
            let writer = RedisWriter::connect(&config.redis).await?;
            tasks.push(tokio::spawn(
                Arc::clone(&writer).run_autoflush(shutdown.clone()),
            ));
            Some(writer)
        } else {
            None
        };

        let mut router = Router::new();
        for channel in Channel::ALL {
            let conf = config.channel(channel);
            if !conf.enabled {
                continue;
            }
            if conf.outputs.clickhouse {
                if let Some(writer) = &clickhouse {
                    router.bind(channel, writer.clone());
                }
            }
            if conf.outputs.redis {
                if let Some(writer) = &redis {
                    router.bind(channel, writer.clone());
                }
            }
        }
        let router = Arc::new(router);

        let caches = Arc::new(GlobalCaches::new());
        let rest_caches = Arc::new(RestCaches::new());

        // One shard per symbol chunk, started with a stagger.
        let mut shards = Vec::new();
        for (idx, chunk) in symbols.chunks(config.symbols_per_shard.max(1)).enumerate() {
            let shard = Shard::new(
                idx,
                chunk.to_vec(),
                Arc::clone(&router),
                Arc::clone(&rest_client),
                Arc::clone(&caches),
                Arc::clone(&rest_caches),
                Arc::clone(&config),
            );
            shards.push(Arc::clone(&shard));

            let token = shutdown.clone();
            let delay = SHARD_STAGGER * idx as u32;
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return,
                }
                shard.run(token).await;
            }));
        }

        tasks.push(tokio::spawn(run_book_ticker(
            Arc::clone(&caches),
            shutdown.clone(),
        )));

        // The REST pollers wait for the shards to reach steady state.
        let scheduler = Arc::new(RestScheduler::new(
            Arc::clone(&rest_client),
            symbols.clone(),
            Arc::clone(&rest_caches),
            config.open_interest_period_s,
            config.open_interest_parallelism,
            config.long_short_requests_per_min,
            config.long_short_parallelism,
        ));
        {
            let token = shutdown.clone();
            let delay = Duration::from_secs(config.rest_start_delay_s);
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return,
                }
                tokio::spawn(Arc::clone(&scheduler).run_open_interest(token.clone()));
                tokio::spawn(Arc::clone(&scheduler).run_long_short(token));
            }));
        }

        let health_channels = default_channels(|channel| config.channel_enabled(channel));
        let monitor = HealthMonitor::new(Arc::clone(&router), symbols.clone(), health_channels);
        tasks.push(tokio::spawn(monitor.run(shutdown.clone())));

        info!(
            symbols = symbols.len(),
            shards = shards.len(),
            clickhouse = clickhouse.is_some(),
            redis = redis.is_some(),
            "feed pipeline started"
        );

        let orchestrator = Self {
            config,
            router,
            shards,
            clickhouse,
            redis,
            shutdown,
            tasks: Mutex::new(tasks),
        };
        orchestrator.spawn_stats_logger();
        Ok(orchestrator)
    }

    /// Cancel every task and wait for the writers' final flush.
    pub async fn stop(&self) {
        info!("stopping feed pipeline");
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        futures::future::join_all(tasks).await;
        info!("feed pipeline stopped");
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            clickhouse: self.clickhouse.as_ref().map(|w| w.stats()),
            redis: self.redis.as_ref().map(|w| w.stats()),
            router: self.router.stats(),
            shards: self.shards.iter().map(|s| s.stats()).collect(),
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Periodic delta logging of the pipeline counters, ten-second grid.
    fn spawn_stats_logger(&self) {
        let shards = self.shards.clone();
        let clickhouse = self.clickhouse.clone();
        let redis = self.redis.clone();
        let router = Arc::clone(&self.router);
        let token = self.shutdown.clone();
        let interval_s = 10u64;
        let handle = tokio::spawn(async move {
            let mut last = StatsSnapshot::default();
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_s));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = token.cancelled() => return,
                }
                let current = StatsSnapshot {
                    clickhouse: clickhouse.as_ref().map(|w| w.stats()),
                    redis: redis.as_ref().map(|w| w.stats()),
                    router: router.stats(),
                    shards: shards.iter().map(|s| s.stats()).collect(),
                };
                log_deltas(&current, &last, interval_s);
                last = current;
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }
}

fn log_deltas(current: &StatsSnapshot, last: &StatsSnapshot, interval_s: u64) {
    for (name, now, before) in [
        ("clickhouse", &current.clickhouse, &last.clickhouse),
        ("redis", &current.redis, &last.redis),
    ] {
        if let Some(now) = now {
            let before_events = before.as_ref().map(|s| s.events).unwrap_or(0);
            let before_flushed = before.as_ref().map(|s| s.items_flushed).unwrap_or(0);
            let before_errors = before.as_ref().map(|s| s.flush_errors).unwrap_or(0);
            info!(
                target = name,
                events_delta = now.events - before_events,
                flushed_delta = now.items_flushed - before_flushed,
                flush_errors_delta = now.flush_errors - before_errors,
                interval_s,
                "[ingest]"
            );
            if now.flush_errors > before_errors {
                warn!(
                    target = name,
                    flush_errors = now.flush_errors,
                    "[errors] sink flush errors"
                );
            }
        }
    }

    let mut routed: Vec<(&str, u64)> = current
        .router
        .events_by_channel
        .iter()
        .map(|(channel, count)| {
            let before = last
                .router
                .events_by_channel
                .get(channel)
                .copied()
                .unwrap_or(0);
            (*channel, count - before)
        })
        .filter(|(_, delta)| *delta > 0)
        .collect();
    routed.sort();
    if !routed.is_empty() {
        let line = routed
            .iter()
            .map(|(channel, delta)| format!("{}+{}", channel, delta))
            .collect::<Vec<_>>()
            .join(" | ");
        info!(interval_s, routed = %line, "[diff]");
    }

    let mut discs = 0u64;
    let mut parse_errors = 0u64;
    let mut validation_errors = 0u64;
    for (idx, shard) in current.shards.iter().enumerate() {
        let before = last.shards.get(idx);
        let before_discs: u64 = before.map(|s| s.ws_discs.values().sum()).unwrap_or(0);
        let before_parse: u64 = before.map(|s| s.parse_errors.values().sum()).unwrap_or(0);
        let before_validation: u64 = before
            .map(|s| s.validation_errors.values().sum())
            .unwrap_or(0);
        discs += shard.ws_discs.values().sum::<u64>() - before_discs;
        parse_errors += shard.parse_errors.values().sum::<u64>() - before_parse;
        validation_errors += shard.validation_errors.values().sum::<u64>() - before_validation;
    }
    if discs > 0 {
        warn!(discs, interval_s, "[discs]");
    }
    if parse_errors > 0 || validation_errors > 0 {
        warn!(parse_errors, validation_errors, interval_s, "[errors]");
    }
}

/// Global all-market bookTicker socket feeding the L1 fallback cache.
async fn run_book_ticker(caches: Arc<GlobalCaches>, shutdown: CancellationToken) {
    let url = all_book_ticker_url();
    while !shutdown.is_cancelled() {
        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                info!("bookTicker fallback socket connected");
                let (mut write, mut read) = ws_stream.split();
                loop {
                    let message = tokio::select! {
                        message = read.next() => message,
                        _ = shutdown.cancelled() => return,
                    };
                    match message {
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(msg) = serde_json::from_str::<BookTickerMessage>(&text) {
                                if let (Ok(bid), Ok(bid_qty), Ok(ask), Ok(ask_qty)) = (
                                    msg.bid_price.parse::<f64>(),
                                    msg.bid_qty.parse::<f64>(),
                                    msg.ask_price.parse::<f64>(),
                                    msg.ask_qty.parse::<f64>(),
                                ) {
                                    caches.set_book_ticker(
                                        &msg.symbol.to_uppercase(),
                                        BookTickerState {
                                            l1: L1Sample {
                                                bid_price: bid,
                                                bid_qty,
                                                ask_price: ask,
                                                ask_qty,
                                            },
                                            ts_recv_ns: now_ns(),
                                        },
                                    );
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "bookTicker socket error");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "bookTicker connect failed");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(3)) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}
