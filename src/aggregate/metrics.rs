//! Derived microstructure metrics.
//!
//! Computed per symbol at every window flush from the window buffers, the
//! rolling states and the current top-20 book. All divisions are guarded:
//! an undefined metric emits zero and the flag entries expose which inputs
//! were missing. Arithmetic runs in `f64`; the emitted map converts back to
//! the decimal record domain.

use crate::aggregate::window::{L1Sample, RollingState, WindowState};
use crate::util::f64_to_dec;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

const EPS: f64 = 1e-12;

/// Freshness bound for REST-polled values mapped into a window.
const REST_FRESHNESS_NS: u64 = 12 * crate::util::NS_PER_SEC;

/// Inputs assembled by the shard at flush time.
pub struct MetricsInput<'a> {
    pub l1: Option<L1Sample>,
    /// Top-20 levels, best first: (price, qty) in the float domain.
    pub top_bids: &'a [(f64, f64)],
    pub top_asks: &'a [(f64, f64)],
    pub index_price: Option<f64>,
    /// `(event_ts_ns, value)` from the REST pollers.
    pub open_interest: Option<(u64, f64)>,
    pub long_short_ratio: Option<(u64, f64)>,
    pub window_start_ns: u64,
    pub window_ns: u64,
    pub book_update_count: u64,
}

/// Compute the full metric record for a closing window and advance the
/// rolling states. The caller resets the window afterwards.
pub fn compute(
    window: &WindowState,
    rolling: &mut RollingState,
    input: &MetricsInput<'_>,
) -> BTreeMap<String, Decimal> {
    let mut out = BTreeMap::new();
    let window_s = input.window_ns as f64 / 1e9;
    let window_end_ns = input.window_start_ns + input.window_ns;

    let mid = input.l1.map(|l1| l1.mid()).unwrap_or(0.0);
    let spread = input.l1.map(|l1| l1.spread()).unwrap_or(0.0);

    out.insert("spread_px".to_string(), f64_to_dec(spread));
    out.insert("mid_px".to_string(), f64_to_dec(mid));
    out.insert("spread_bps".to_string(), f64_to_dec(safe_div(spread, mid) * 10_000.0));
    out.insert("ofi_sum".to_string(), f64_to_dec(window.ofi_sum));

    let microprice_edge = match window.microprice_last {
        Some(micro) => safe_div(micro - mid, mid) * 10_000.0,
        None => 0.0,
    };
    out.insert("microprice_edge_bps".to_string(), f64_to_dec(microprice_edge));

    out.insert(
        "l1_jump_rate".to_string(),
        f64_to_dec(safe_div(window.l1_jumps as f64, window_s)),
    );
    out.insert(
        "replenishment_rate".to_string(),
        f64_to_dec(safe_div(window.replenish_events as f64, window_s)),
    );

    let (slope_bid, curvature_bid) = depth_shape(input.top_bids);
    let (slope_ask, curvature_ask) = depth_shape(input.top_asks);
    out.insert("slope_bid".to_string(), f64_to_dec(slope_bid));
    out.insert("slope_ask".to_string(), f64_to_dec(slope_ask));
    out.insert("curvature_bid".to_string(), f64_to_dec(curvature_bid));
    out.insert("curvature_ask".to_string(), f64_to_dec(curvature_ask));

    let rv = realized_vol(&window.mid_prices);
    out.insert("rv_3s".to_string(), f64_to_dec(rv));
    out.insert("rv_ewma_1m".to_string(), f64_to_dec(rolling.rv_ewma_1m.update(rv)));
    out.insert("rv_ewma_5m".to_string(), f64_to_dec(rolling.rv_ewma_5m.update(rv)));
    out.insert("rv_ewma_15m".to_string(), f64_to_dec(rolling.rv_ewma_15m.update(rv)));

    // Parkinson over the prior closed minute; the window range feeds the
    // current minute bucket first.
    if let Some((high, low)) = window_range(window) {
        rolling.parkinson.observe(input.window_start_ns, high, low);
    }
    out.insert("parkinson_1m".to_string(), f64_to_dec(rolling.parkinson.value()));

    let trade_count = window.trade_prices.len() as f64;
    let trade_rate = safe_div(trade_count, window_s);
    out.insert("trade_rate_hz".to_string(), f64_to_dec(trade_rate));
    let rate_ewma = rolling.trade_rate_ewma.update(trade_rate);
    out.insert("burst_score".to_string(), f64_to_dec(safe_div(trade_rate, rate_ewma)));

    let signed_volume = window.buy_volume - window.sell_volume;
    rolling.cvd_cum += signed_volume;
    out.insert("cvd_cum".to_string(), f64_to_dec(rolling.cvd_cum));
    out.insert(
        "vpin".to_string(),
        f64_to_dec(safe_div(signed_volume.abs(), window.total_volume())),
    );

    let kyle = match (window.microprice_first, window.microprice_last) {
        (Some(first), Some(last)) => safe_div((last - first).abs(), signed_volume.abs()),
        _ => 0.0,
    };
    out.insert("kyle_lambda".to_string(), f64_to_dec(kyle));

    let mid_move = match (window.mid_prices.first(), window.mid_prices.last()) {
        (Some(first), Some(last)) => (last - first).abs(),
        _ => 0.0,
    };
    out.insert(
        "amihud_illiq".to_string(),
        f64_to_dec(safe_div(mid_move, window.quote_volume)),
    );

    out.insert(
        "effective_spread_bps".to_string(),
        f64_to_dec(safe_div(window.effective_spread_sum, window.effective_spread_weight)),
    );

    // Queue depletion time: best-side size against the opposing taker flow.
    let (qdt_bid, qdt_ask) = match input.l1 {
        Some(l1) => (
            safe_div(l1.bid_qty, window.sell_volume / window_s),
            safe_div(l1.ask_qty, window.buy_volume / window_s),
        ),
        None => (0.0, 0.0),
    };
    out.insert("qdt_bid_s".to_string(), f64_to_dec(qdt_bid));
    out.insert("qdt_ask_s".to_string(), f64_to_dec(qdt_ask));

    out.insert(
        "ob_entropy_bid".to_string(),
        f64_to_dec(shannon_entropy(input.top_bids)),
    );
    out.insert(
        "ob_entropy_ask".to_string(),
        f64_to_dec(shannon_entropy(input.top_asks)),
    );

    let basis = match input.index_price {
        Some(index) if index > EPS && mid > EPS => (mid - index) / index * 10_000.0,
        _ => 0.0,
    };
    out.insert("index_basis_bps".to_string(), f64_to_dec(basis));
    let drift = match rolling.prev_basis_bps {
        Some(prev) => basis - prev,
        None => 0.0,
    };
    out.insert("basis_drift_bps".to_string(), f64_to_dec(drift));
    rolling.prev_basis_bps = Some(basis);

    let rel_spread = safe_div(spread, mid);
    let z = rolling.spread_regime.score_and_update(rel_spread);
    let regime = if z > 1.0 {
        2.0
    } else if z < -1.0 {
        0.0
    } else {
        1.0
    };
    out.insert("spread_regime".to_string(), f64_to_dec(regime));

    // REST-polled values, attached only while fresh relative to the window.
    if let Some((ts, value)) = input.open_interest {
        if rest_value_fresh(ts, input.window_start_ns, window_end_ns) {
            out.insert("open_interest".to_string(), f64_to_dec(value));
        }
    }
    if let Some((ts, value)) = input.long_short_ratio {
        if rest_value_fresh(ts, input.window_start_ns, window_end_ns) {
            out.insert("top_long_short_ratio".to_string(), f64_to_dec(value));
        }
    }

    out.insert(
        "book_update_count".to_string(),
        Decimal::from(input.book_update_count),
    );

    let flags = &window.flags;
    for (name, value) in [
        ("has_depth", flags.has_depth),
        ("has_trades", flags.has_trades),
        ("has_mark", flags.has_mark),
        ("has_liq", flags.has_liq),
        ("has_l1", flags.has_l1),
        ("crossed_book", flags.crossed_book),
        ("resynced_this_window", flags.resynced_this_window),
    ] {
        out.insert(name.to_string(), Decimal::from(u8::from(value)));
    }

    out
}

/// Lightweight metric set for the 200 ms L1 sampler.
pub fn l1_surrogate(l1: &L1Sample, fast_ofi: f64) -> BTreeMap<String, Decimal> {
    let mut out = BTreeMap::new();
    let mid = l1.mid();
    let spread = l1.spread();
    out.insert("spread_px".to_string(), f64_to_dec(spread));
    out.insert("mid_px".to_string(), f64_to_dec(mid));
    out.insert("spread_bps".to_string(), f64_to_dec(safe_div(spread, mid) * 10_000.0));
    out.insert(
        "microprice".to_string(),
        f64_to_dec(l1.microprice().unwrap_or(0.0)),
    );
    out.insert("ofi_200ms".to_string(), f64_to_dec(fast_ofi));
    out
}

fn rest_value_fresh(ts_ns: u64, window_start_ns: u64, window_end_ns: u64) -> bool {
    ts_ns >= window_start_ns.saturating_sub(REST_FRESHNESS_NS) && ts_ns < window_end_ns
}

fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator.abs() <= EPS {
        0.0
    } else {
        numerator / denominator
    }
}

/// `sqrt(sum of squared log returns)` over the window's mid series.
fn realized_vol(mids: &[f64]) -> f64 {
    let mut sum = 0.0;
    for pair in mids.windows(2) {
        if pair[0] > EPS && pair[1] > EPS {
            let r = (pair[1] / pair[0]).ln();
            sum += r * r;
        }
    }
    sum.sqrt()
}

/// OLS slope of price on cumulative quantity over the given levels, plus the
/// curvature (slope of the first half minus slope of the second half).
fn depth_shape(levels: &[(f64, f64)]) -> (f64, f64) {
    let slope = ols_slope(levels);
    if levels.len() < 4 {
        return (slope, 0.0);
    }
    let half = levels.len() / 2;
    let curvature = ols_slope(&levels[..half]) - ols_slope(&levels[half..]);
    (slope, curvature)
}

fn ols_slope(levels: &[(f64, f64)]) -> f64 {
    if levels.len() < 2 {
        return 0.0;
    }
    let mut points = Vec::with_capacity(levels.len());
    let mut cumulative = 0.0;
    for (price, qty) in levels {
        cumulative += qty;
        points.push((cumulative, *price));
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var = 0.0;
    for (x, y) in &points {
        cov += (x - mean_x) * (y - mean_y);
        var += (x - mean_x) * (x - mean_x);
    }
    safe_div(cov, var)
}

/// Shannon entropy of the level quantities normalized as a distribution.
fn shannon_entropy(levels: &[(f64, f64)]) -> f64 {
    let total: f64 = levels.iter().map(|(_, qty)| qty).sum();
    if total <= EPS {
        return 0.0;
    }
    let mut entropy = 0.0;
    for (_, qty) in levels {
        let p = qty / total;
        if p > EPS {
            entropy -= p * p.ln();
        }
    }
    entropy
}

fn window_range(window: &WindowState) -> Option<(f64, f64)> {
    let series: &[f64] = if !window.trade_prices.is_empty() {
        &window.trade_prices
    } else if !window.mid_prices.is_empty() {
        &window.mid_prices
    } else {
        return None;
    };
    let mut high = f64::MIN;
    let mut low = f64::MAX;
    for value in series {
        high = high.max(*value);
        low = low.min(*value);
    }
    Some((high, low))
}
