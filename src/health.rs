//! Feed-health monitor.
//!
//! Every 10 seconds compares the router's last-seen map against the symbol
//! universe for the monitored channels, computes missing and stale counts,
//! and raises yellow/red alerts on threshold crossings with a recovery
//! notification when a channel returns to green.

use crate::events::Channel;
use crate::router::Router;
use crate::util::{now_ns, NS_PER_MS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Unhealthy share of the universe that turns a channel yellow / red.
const YELLOW_RATIO: f64 = 0.10;
const RED_RATIO: f64 = 0.50;

const SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Green,
    Yellow,
    Red,
}

/// Per-channel event-age bound before a symbol counts as stale.
fn max_lag_ms(channel: Channel) -> u64 {
    match channel {
        Channel::MarkPrice => 5_000,
        Channel::ObTop5 | Channel::ObTop20 => 5_000,
        Channel::L1 => 30_000,
        _ => 30_000,
    }
}

/// Channels worth alerting on: continuous per-symbol streams.
pub fn default_channels(enabled: impl Fn(Channel) -> bool) -> Vec<Channel> {
    [Channel::MarkPrice, Channel::ObTop5, Channel::L1]
        .into_iter()
        .filter(|channel| enabled(*channel))
        .collect()
}

pub struct HealthMonitor {
    router: Arc<Router>,
    symbols: Vec<String>,
    channels: Vec<Channel>,
    levels: HashMap<Channel, Level>,
}

impl HealthMonitor {
    pub fn new(router: Arc<Router>, symbols: Vec<String>, channels: Vec<Channel>) -> Self {
        let levels = channels.iter().map(|c| (*c, Level::Green)).collect();
        Self {
            router,
            symbols,
            channels,
            levels,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        if self.channels.is_empty() || self.symbols.is_empty() {
            return;
        }
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            self.check();
        }
    }

    fn check(&mut self) {
        let snapshot = self.router.last_seen_snapshot();
        let now = now_ns();

        for channel in self.channels.clone() {
            let mut missing: Vec<&str> = Vec::new();
            let mut stale: Vec<&str> = Vec::new();
            let mut lags_ms: Vec<u64> = Vec::new();
            let lag_bound_ns = max_lag_ms(channel) * NS_PER_MS;

            for symbol in &self.symbols {
                let key = (channel, symbol.clone());
                match (snapshot.event_ns.get(&key), snapshot.recv_ns.get(&key)) {
                    (Some(event_ns), Some(recv_ns)) => {
                        lags_ms.push(recv_ns.saturating_sub(*event_ns) / NS_PER_MS);
                        if now.saturating_sub(*event_ns) > lag_bound_ns {
                            stale.push(symbol);
                        }
                    }
                    _ => missing.push(symbol),
                }
            }

            let unhealthy = missing.len() + stale.len();
            let ratio = unhealthy as f64 / self.symbols.len() as f64;
            let level = if ratio >= RED_RATIO {
                Level::Red
            } else if ratio >= YELLOW_RATIO {
                Level::Yellow
            } else {
                Level::Green
            };

            let previous = self.levels.insert(channel, level).unwrap_or(Level::Green);
            let sample_missing = missing[..missing.len().min(SAMPLE_LIMIT)].join(",");
            let sample_stale = stale[..stale.len().min(SAMPLE_LIMIT)].join(",");

            match (previous, level) {
                (_, Level::Red) => error!(
                    channel = %channel,
                    missing = missing.len(),
                    stale = stale.len(),
                    sample_missing = %sample_missing,
                    sample_stale = %sample_stale,
                    "health RED"
                ),
                (_, Level::Yellow) => warn!(
                    channel = %channel,
                    missing = missing.len(),
                    stale = stale.len(),
                    sample_missing = %sample_missing,
                    sample_stale = %sample_stale,
                    "health YELLOW"
                ),
                (Level::Yellow | Level::Red, Level::Green) => {
                    info!(channel = %channel, "health recovered")
                }
                (Level::Green, Level::Green) => {}
            }

            if !lags_ms.is_empty() {
                let avg = lags_ms.iter().sum::<u64>() as f64 / lags_ms.len() as f64;
                let max = lags_ms.iter().max().copied().unwrap_or(0);
                info!(channel = %channel, avg_lag_ms = avg, max_lag_ms = max, "health lag");
            }
        }
    }
}
