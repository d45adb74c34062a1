//! Configuration management.
//!
//! Everything is loaded once at startup from environment variables and passed
//! as an immutable value into the components. Missing required settings are
//! fatal before any task starts; everything else has a production default.

use crate::error::{FeedError, Result};
use crate::events::Channel;
use std::collections::HashMap;

/// Which sinks a channel's records are delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputTargets {
    pub clickhouse: bool,
    pub redis: bool,
}

impl OutputTargets {
    pub const BOTH: OutputTargets = OutputTargets { clickhouse: true, redis: true };
    pub const CLICKHOUSE_ONLY: OutputTargets = OutputTargets { clickhouse: true, redis: false };
    pub const NONE: OutputTargets = OutputTargets { clickhouse: false, redis: false };

    pub fn any(&self) -> bool {
        self.clickhouse || self.redis
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub outputs: OutputTargets,
}

/// ClickHouse sink settings (HTTP interface, JSONEachRow inserts).
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub batch_rows: usize,
    pub flush_interval_ms: u64,
    /// Rows a single table buffer may hold before the producer starts
    /// dropping; back-pressure boundary for a slow sink.
    pub max_buffer_rows: usize,
    /// Optional sink-side compression hint on insert requests.
    pub compression: Option<String>,
}

/// Redis sink settings (pipelined commands).
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub pipeline_size: usize,
    pub flush_interval_ms: u64,
    pub stream_maxlen: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Explicit symbol list; empty means "discover the perpetual universe
    /// from exchangeInfo at startup".
    pub symbols: Vec<String>,
    pub kline_interval: String,
    pub channels: HashMap<Channel, ChannelConfig>,

    pub clickhouse: ClickHouseConfig,
    pub redis: RedisConfig,

    pub top20_snapshot_ms: u64,
    pub l1_sample_ms: u64,
    pub window_flush_ms: u64,

    pub rest_depth_limit: u32,
    pub rest_cooldown_sec: u64,
    pub rest_retry_max: u32,

    pub agg_trade_queue_max: usize,
    pub agg_trade_max_catchup_windows: u32,
    pub agg_trade_late_grace_s: u64,

    pub symbols_per_shard: usize,
    pub cpu_core: Option<usize>,

    pub open_interest_period_s: u64,
    pub open_interest_parallelism: usize,
    pub long_short_requests_per_min: u32,
    pub long_short_parallelism: usize,
    pub rest_start_delay_s: u64,
}

impl AppConfig {
    /// Load configuration from the environment.
    ///
    /// Required: `CLICKHOUSE_URL` (e.g. `http://localhost:8123`). Everything
    /// else defaults to the production values.
    pub fn from_env() -> Result<Self> {
        let clickhouse_url = std::env::var("CLICKHOUSE_URL")
            .map_err(|_| FeedError::Config("CLICKHOUSE_URL is required".to_string()))?;

        let symbols = match std::env::var("FEED_SYMBOLS") {
            Ok(raw) if raw.trim().eq_ignore_ascii_case("all") => Vec::new(),
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => Vec::new(),
        };

        let channels = Self::channel_configs()?;
        if !channels.values().any(|c| c.enabled && c.outputs.any()) {
            return Err(FeedError::Config(
                "no channel is enabled with at least one output target".to_string(),
            ));
        }

        Ok(Self {
            symbols,
            kline_interval: env_string("FEED_KLINE_INTERVAL", "1m"),
            channels,
            clickhouse: ClickHouseConfig {
                url: clickhouse_url,
                database: env_string("CLICKHOUSE_DB", "marketdata"),
                batch_rows: env_parse("CLICKHOUSE_BATCH_ROWS", 5000)?,
                flush_interval_ms: env_parse("CLICKHOUSE_FLUSH_INTERVAL_MS", 250)?,
                max_buffer_rows: env_parse("CLICKHOUSE_MAX_BUFFER_ROWS", 200_000)?,
                compression: std::env::var("CLICKHOUSE_COMPRESSION").ok(),
            },
            redis: RedisConfig {
                url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
                pipeline_size: env_parse("REDIS_PIPELINE_SIZE", 200)?,
                flush_interval_ms: env_parse("REDIS_FLUSH_INTERVAL_MS", 50)?,
                stream_maxlen: env_parse("REDIS_STREAM_MAXLEN", 1000)?,
            },
            top20_snapshot_ms: env_parse("TOP20_SNAPSHOT_MS", 100)?,
            l1_sample_ms: env_parse("L1_SAMPLE_MS", 200)?,
            window_flush_ms: env_parse("WINDOW_FLUSH_MS", 1500)?,
            rest_depth_limit: env_parse("REST_DEPTH_LIMIT", 200)?,
            rest_cooldown_sec: env_parse("REST_COOLDOWN_SEC", 30)?,
            rest_retry_max: env_parse("REST_RETRY_MAX", 3)?,
            agg_trade_queue_max: env_parse("AGG_TRADE_QUEUE_MAX", 20_000)?,
            agg_trade_max_catchup_windows: env_parse("AGG_TRADE_MAX_CATCHUP_WINDOWS", 120)?,
            agg_trade_late_grace_s: env_parse("AGG_TRADE_LATE_GRACE_S", 2)?,
            symbols_per_shard: env_parse("SYMBOLS_PER_SHARD", 30)?,
            cpu_core: env_optional_parse("FEED_CPU_CORE")?,
            open_interest_period_s: env_parse("OPEN_INTEREST_PERIOD_S", 30)?,
            open_interest_parallelism: env_parse("OPEN_INTEREST_PARALLELISM", 50)?,
            long_short_requests_per_min: env_parse("LONG_SHORT_REQUESTS_PER_MIN", 190)?,
            long_short_parallelism: env_parse("LONG_SHORT_PARALLELISM", 32)?,
            rest_start_delay_s: env_parse("REST_START_DELAY_S", 8)?,
        })
    }

    /// Per-channel enable/target flags.
    ///
    /// `CHANNEL_<NAME>` accepts `off`, `clickhouse`, `redis` or `both`.
    /// Defaults: every channel on with both targets, except raw book diffs
    /// which have no last-state representation and go to ClickHouse only.
    fn channel_configs() -> Result<HashMap<Channel, ChannelConfig>> {
        let mut map = HashMap::new();
        for channel in Channel::ALL {
            let default = match channel {
                Channel::ObDiff => OutputTargets::CLICKHOUSE_ONLY,
                _ => OutputTargets::BOTH,
            };
            let var = format!("CHANNEL_{}", channel.as_str().to_uppercase());
            let (enabled, outputs) = match std::env::var(&var) {
                Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                    "off" | "0" | "false" => (false, OutputTargets::NONE),
                    "clickhouse" => (true, OutputTargets::CLICKHOUSE_ONLY),
                    "redis" => (true, OutputTargets { clickhouse: false, redis: true }),
                    "both" | "on" | "1" | "true" => (true, OutputTargets::BOTH),
                    other => {
                        return Err(FeedError::Config(format!(
                            "{}: unknown target '{}' (expected off|clickhouse|redis|both)",
                            var, other
                        )))
                    }
                },
                Err(_) => (true, default),
            };
            map.insert(channel, ChannelConfig { enabled, outputs });
        }
        Ok(map)
    }

    pub fn channel(&self, channel: Channel) -> &ChannelConfig {
        &self.channels[&channel]
    }

    pub fn channel_enabled(&self, channel: Channel) -> bool {
        self.channels
            .get(&channel)
            .map(|c| c.enabled && c.outputs.any())
            .unwrap_or(false)
    }

    /// Union of sink targets needed by the enabled channels.
    pub fn required_targets(&self) -> OutputTargets {
        let mut targets = OutputTargets::NONE;
        for conf in self.channels.values() {
            if !conf.enabled {
                continue;
            }
            targets.clickhouse |= conf.outputs.clickhouse;
            targets.redis |= conf.outputs.redis;
        }
        targets
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| FeedError::Config(format!("{}: invalid value '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

fn env_optional_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FeedError::Config(format!("{}: invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}
