//! Periodic REST pollers.
//!
//! Two tasks share the futures REST client: open interest on a ~30 s/symbol
//! round-robin and the 5-minute top long/short position ratio processed in
//! five per-minute buckets. Both run under IP-level budgets: a GCRA token
//! bucket caps the ratio poller below the vendor's 200 requests/minute and
//! a semaphore bounds in-flight parallelism. Results land in latest-value
//! caches; entries are never evicted, shards judge freshness when mapping a
//! value into a window.

use crate::binance::FuturesRestClient;
use crate::error::FeedError;
use crate::util::ms_to_ns;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Latest `(event_ts_ns, value)` per symbol from the pollers.
#[derive(Default)]
pub struct RestCaches {
    open_interest: RwLock<HashMap<String, (u64, f64)>>,
    long_short: RwLock<HashMap<String, (u64, f64)>>,
}

impl RestCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_interest(&self, symbol: &str) -> Option<(u64, f64)> {
        self.open_interest
            .read()
            .ok()
            .and_then(|map| map.get(symbol).copied())
    }

    pub fn long_short(&self, symbol: &str) -> Option<(u64, f64)> {
        self.long_short
            .read()
            .ok()
            .and_then(|map| map.get(symbol).copied())
    }

    fn set_open_interest(&self, symbol: &str, ts_ns: u64, value: f64) {
        if let Ok(mut map) = self.open_interest.write() {
            map.insert(symbol.to_string(), (ts_ns, value));
        }
    }

    fn set_long_short(&self, symbol: &str, ts_ns: u64, value: f64) {
        if let Ok(mut map) = self.long_short.write() {
            map.insert(symbol.to_string(), (ts_ns, value));
        }
    }
}

/// GCRA token bucket guarding the shared IP request budget.
pub struct TokenBucket {
    limiter: GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl TokenBucket {
    pub fn per_minute(requests: u32) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(requests.max(1)).expect("non-zero after max(1)"),
        );
        Self {
            limiter: GovernorRateLimiter::direct(quota),
        }
    }

    /// Wait until a request token is available.
    pub async fn acquire(&self) {
        loop {
            if self.limiter.check().is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

/// Split symbols into near-equal groups by index; bucket `i` is polled in
/// minute `i` of the cycle.
pub fn minute_bucket(symbols: &[String], buckets: usize, minute_index: u64) -> Vec<String> {
    if buckets == 0 {
        return Vec::new();
    }
    let selected = (minute_index as usize) % buckets;
    symbols
        .iter()
        .enumerate()
        .filter(|(idx, _)| idx % buckets == selected)
        .map(|(_, symbol)| symbol.clone())
        .collect()
}

/// Open-interest batch size: the whole universe once per target period,
/// spread across one request batch per second.
pub fn per_second_batch(symbol_count: usize, period_s: u64) -> usize {
    if symbol_count == 0 {
        return 0;
    }
    let period = period_s.max(1) as usize;
    symbol_count.div_ceil(period)
}

pub struct RestScheduler {
    client: Arc<FuturesRestClient>,
    symbols: Vec<String>,
    caches: Arc<RestCaches>,
    oi_period_s: u64,
    oi_semaphore: Arc<Semaphore>,
    ls_semaphore: Arc<Semaphore>,
    ls_bucket: Arc<TokenBucket>,
}

impl RestScheduler {
    pub fn new(
        client: Arc<FuturesRestClient>,
        symbols: Vec<String>,
        caches: Arc<RestCaches>,
        oi_period_s: u64,
        oi_parallelism: usize,
        ls_requests_per_min: u32,
        ls_parallelism: usize,
    ) -> Self {
        Self {
            client,
            symbols,
            caches,
            oi_period_s,
            oi_semaphore: Arc::new(Semaphore::new(oi_parallelism.max(1))),
            ls_semaphore: Arc::new(Semaphore::new(ls_parallelism.max(1))),
            ls_bucket: Arc::new(TokenBucket::per_minute(ls_requests_per_min)),
        }
    }

    /// Round-robin open-interest poller: one batch per second sized so the
    /// whole universe is covered once per target period. A 429 abandons the
    /// remainder of the tick.
    pub async fn run_open_interest(self: Arc<Self>, shutdown: CancellationToken) {
        if self.symbols.is_empty() {
            return;
        }
        let batch = per_second_batch(self.symbols.len(), self.oi_period_s);
        let mut cursor = 0usize;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            let rate_limited = Arc::new(std::sync::atomic::AtomicBool::new(false));
            for _ in 0..batch {
                if rate_limited.load(std::sync::atomic::Ordering::Relaxed) {
                    break;
                }
                let symbol = self.symbols[cursor % self.symbols.len()].clone();
                cursor = cursor.wrapping_add(1);

                let Ok(permit) = Arc::clone(&self.oi_semaphore).acquire_owned().await else {
                    return;
                };
                let client = Arc::clone(&self.client);
                let caches = Arc::clone(&self.caches);
                let rate_limited = Arc::clone(&rate_limited);
                tokio::spawn(async move {
                    let _permit = permit;
                    match client.open_interest(&symbol).await {
                        Ok(response) => {
                            if let Ok(value) = response.open_interest.parse::<f64>() {
                                caches.set_open_interest(&symbol, ms_to_ns(response.time), value);
                            }
                        }
                        Err(FeedError::RateLimit(_)) => {
                            rate_limited.store(true, std::sync::atomic::Ordering::Relaxed);
                            warn!(symbol = %symbol, "open-interest tick skipped, IP budget hit");
                        }
                        Err(err) => {
                            debug!(symbol = %symbol, error = %err, "open-interest poll failed");
                        }
                    }
                });
            }
        }
    }

    /// Long/short ratio poller: each minute processes one of five symbol
    /// buckets, every request behind the shared token bucket.
    pub async fn run_long_short(self: Arc<Self>, shutdown: CancellationToken) {
        if self.symbols.is_empty() {
            return;
        }
        let mut minute_index = 0u64;
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            let bucket = minute_bucket(&self.symbols, 5, minute_index);
            minute_index = minute_index.wrapping_add(1);
            debug!(symbols = bucket.len(), minute = minute_index, "long/short bucket");

            for symbol in bucket {
                tokio::select! {
                    _ = self.ls_bucket.acquire() => {}
                    _ = shutdown.cancelled() => return,
                }
                let Ok(permit) = Arc::clone(&self.ls_semaphore).acquire_owned().await else {
                    return;
                };
                let client = Arc::clone(&self.client);
                let caches = Arc::clone(&self.caches);
                tokio::spawn(async move {
                    let _permit = permit;
                    match client.top_long_short_ratio(&symbol).await {
                        Ok(Some(entry)) => {
                            if let Ok(value) = entry.long_short_ratio.parse::<f64>() {
                                caches.set_long_short(&symbol, ms_to_ns(entry.timestamp), value);
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            debug!(symbol = %symbol, error = %err, "long/short poll failed");
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("SYM{i}USDT")).collect()
    }

    #[test]
    fn test_per_second_batch_covers_universe() {
        assert_eq!(per_second_batch(30, 30), 1);
        assert_eq!(per_second_batch(31, 30), 2);
        assert_eq!(per_second_batch(1000, 30), 34);
        assert_eq!(per_second_batch(0, 30), 0);
    }

    #[test]
    fn test_minute_buckets_partition_evenly() {
        let all = symbols(1000);
        let mut seen = std::collections::HashSet::new();
        for minute in 0..5 {
            let bucket = minute_bucket(&all, 5, minute);
            assert_eq!(bucket.len(), 200);
            for symbol in bucket {
                assert!(seen.insert(symbol), "symbol appeared in two buckets");
            }
        }
        assert_eq!(seen.len(), 1000);
        // The cycle repeats after five minutes.
        assert_eq!(minute_bucket(&all, 5, 0), minute_bucket(&all, 5, 5));
    }

    #[test]
    fn test_token_bucket_caps_burst() {
        let bucket = TokenBucket::per_minute(190);
        let mut granted = 0;
        for _ in 0..400 {
            if bucket.try_acquire() {
                granted += 1;
            }
        }
        // GCRA admits at most the per-minute budget in a zero-time burst.
        assert!(granted <= 190, "granted {granted} > budget");
        assert!(granted > 0);
    }

    #[test]
    fn test_caches_keep_stale_entries() {
        let caches = RestCaches::new();
        caches.set_open_interest("BTCUSDT", 1_000, 123.0);
        caches.set_long_short("BTCUSDT", 2_000, 1.5);
        assert_eq!(caches.open_interest("BTCUSDT"), Some((1_000, 123.0)));
        assert_eq!(caches.long_short("BTCUSDT"), Some((2_000, 1.5)));
        assert_eq!(caches.open_interest("ETHUSDT"), None);

        // Updates supersede; nothing evicts.
        caches.set_open_interest("BTCUSDT", 5_000, 130.0);
        assert_eq!(caches.open_interest("BTCUSDT"), Some((5_000, 130.0)));
    }
}
