//! 1.5-second microstructure window state.
//!
//! Collected per symbol between metric flushes: mid-price series, trade
//! series, L1 deltas (order-flow imbalance, jump and replenishment counters,
//! microprice endpoints), plus the rolling states that survive the window
//! boundary (EWMAs, cumulative volume delta, the Parkinson minute bucket).

use crate::book::TopOfBook;
use crate::util::{dec_to_f64, NS_PER_SEC};

/// L1 observation in the float domain used by metric computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct L1Sample {
    pub bid_price: f64,
    pub bid_qty: f64,
    pub ask_price: f64,
    pub ask_qty: f64,
}

impl L1Sample {
    pub fn from_top(top: &TopOfBook) -> Self {
        Self {
            bid_price: dec_to_f64(top.bid_price),
            bid_qty: dec_to_f64(top.bid_qty),
            ask_price: dec_to_f64(top.ask_price),
            ask_qty: dec_to_f64(top.ask_qty),
        }
    }

    pub fn mid(&self) -> f64 {
        (self.bid_price + self.ask_price) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask_price - self.bid_price
    }

    /// Size-weighted quote: `(askQty*bid + bidQty*ask) / (bidQty + askQty)`.
    pub fn microprice(&self) -> Option<f64> {
        let total = self.bid_qty + self.ask_qty;
        if total <= f64::EPSILON {
            return None;
        }
        Some((self.ask_qty * self.bid_price + self.bid_qty * self.ask_price) / total)
    }
}

/// Input-availability flags for the closing window. Undefined metrics emit
/// zero; these make the gap visible to consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowFlags {
    pub has_depth: bool,
    pub has_trades: bool,
    pub has_mark: bool,
    pub has_liq: bool,
    pub has_l1: bool,
    pub crossed_book: bool,
    pub resynced_this_window: bool,
}

/// Window-scoped accumulators, reset at every flush.
#[derive(Debug, Default)]
pub struct WindowState {
    pub mid_prices: Vec<f64>,
    pub trade_prices: Vec<f64>,
    pub trade_ts_ns: Vec<u64>,

    pub buy_volume: f64,
    pub sell_volume: f64,
    pub quote_volume: f64,

    /// Volume-weighted sum of `2 * side_sign * (px - mid) / mid`.
    pub effective_spread_sum: f64,
    pub effective_spread_weight: f64,

    pub ofi_sum: f64,
    /// Independent accumulator for the 200 ms L1 sampler; reset per sample,
    /// not per window.
    pub ofi_fast: f64,

    pub microprice_first: Option<f64>,
    pub microprice_last: Option<f64>,
    pub l1_jumps: u32,
    pub replenish_events: u32,

    prev_l1: Option<L1Sample>,
    /// Close of the previous window; survives resets as the L1-of-last-resort.
    pub last_close: Option<f64>,

    pub flags: WindowFlags,
}

impl WindowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an L1 observation from a depth update.
    pub fn on_depth(&mut self, l1: L1Sample) {
        self.flags.has_depth = true;
        self.mid_prices.push(l1.mid());

        if let Some(prev) = self.prev_l1 {
            let ofi = (l1.bid_qty - prev.bid_qty) - (l1.ask_qty - prev.ask_qty);
            self.ofi_sum += ofi;
            self.ofi_fast += ofi;
            if l1.bid_price != prev.bid_price || l1.ask_price != prev.ask_price {
                self.l1_jumps += 1;
            }
            if l1.bid_qty > prev.bid_qty || l1.ask_qty > prev.ask_qty {
                self.replenish_events += 1;
            }
        }
        if let Some(microprice) = l1.microprice() {
            if self.microprice_first.is_none() {
                self.microprice_first = Some(microprice);
            }
            self.microprice_last = Some(microprice);
        }
        self.prev_l1 = Some(l1);
    }

    /// Record a trade; `is_sell` means the taker sold.
    pub fn on_trade(&mut self, price: f64, qty: f64, is_sell: bool, ts_event_ns: u64) {
        self.flags.has_trades = true;
        self.trade_prices.push(price);
        self.trade_ts_ns.push(ts_event_ns);
        if is_sell {
            self.sell_volume += qty;
        } else {
            self.buy_volume += qty;
        }
        self.quote_volume += price * qty;
        self.last_close = Some(price);

        // Effective spread needs the mid at trade time; the latest observed
        // mid is the closest stand-in on a 100 ms depth grid.
        if let Some(mid) = self.mid_prices.last().copied() {
            if mid > f64::EPSILON {
                let side_sign = if is_sell { -1.0 } else { 1.0 };
                self.effective_spread_sum +=
                    qty * 2.0 * side_sign * (price - mid) / mid * 10_000.0;
                self.effective_spread_weight += qty;
            }
        }
    }

    pub fn total_volume(&self) -> f64 {
        self.buy_volume + self.sell_volume
    }

    /// Drain the 200 ms OFI accumulator.
    pub fn take_fast_ofi(&mut self) -> f64 {
        std::mem::take(&mut self.ofi_fast)
    }

    /// Reset window-scoped accumulators. The previous L1, last close and the
    /// fast OFI accumulator carry across the boundary.
    pub fn reset(&mut self) {
        self.mid_prices.clear();
        self.trade_prices.clear();
        self.trade_ts_ns.clear();
        self.buy_volume = 0.0;
        self.sell_volume = 0.0;
        self.quote_volume = 0.0;
        self.effective_spread_sum = 0.0;
        self.effective_spread_weight = 0.0;
        self.ofi_sum = 0.0;
        self.microprice_first = None;
        self.microprice_last = None;
        self.l1_jumps = 0;
        self.replenish_events = 0;
        self.flags = WindowFlags::default();
    }
}

/// Exponentially-weighted moving average with fixed alpha.
#[derive(Debug, Clone, Copy)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// Feed an observation and return the updated mean.
    pub fn update(&mut self, x: f64) -> f64 {
        let next = match self.value {
            Some(prev) => self.alpha * x + (1.0 - self.alpha) * prev,
            None => x,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// EWMA mean/variance pair backing the spread-regime z-score.
#[derive(Debug, Clone, Copy)]
pub struct EwmaVar {
    alpha: f64,
    mean: Option<f64>,
    var: f64,
}

impl EwmaVar {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, mean: None, var: 0.0 }
    }

    /// Feed an observation; returns the z-score of `x` against the state
    /// before this update (first observation scores zero).
    pub fn score_and_update(&mut self, x: f64) -> f64 {
        let z = match self.mean {
            Some(mean) if self.var > f64::EPSILON => (x - mean) / self.var.sqrt(),
            _ => 0.0,
        };
        match self.mean {
            Some(mean) => {
                let delta = x - mean;
                let new_mean = mean + self.alpha * delta;
                // West's incremental EWM variance.
                self.var = (1.0 - self.alpha) * (self.var + self.alpha * delta * delta);
                self.mean = Some(new_mean);
            }
            None => {
                self.mean = Some(x);
                self.var = 0.0;
            }
        }
        z
    }
}

/// Range bucket for the 1-minute Parkinson estimator: highs/lows accumulate
/// per minute; the previous closed minute feeds the metric.
#[derive(Debug, Default)]
pub struct ParkinsonMinute {
    current_minute_ns: Option<u64>,
    high: f64,
    low: f64,
    closed: Option<(f64, f64)>,
}

impl ParkinsonMinute {
    const MINUTE_NS: u64 = 60 * NS_PER_SEC;

    /// Fold a window's high/low into the minute containing `ts_ns`.
    pub fn observe(&mut self, ts_ns: u64, high: f64, low: f64) {
        let minute = ts_ns - (ts_ns % Self::MINUTE_NS);
        match self.current_minute_ns {
            Some(current) if current == minute => {
                self.high = self.high.max(high);
                self.low = self.low.min(low);
            }
            Some(_) => {
                self.closed = Some((self.high, self.low));
                self.current_minute_ns = Some(minute);
                self.high = high;
                self.low = low;
            }
            None => {
                self.current_minute_ns = Some(minute);
                self.high = high;
                self.low = low;
            }
        }
    }

    /// `sqrt((ln(H/L))^2 / (4 ln 2))` over the prior closed minute.
    pub fn value(&self) -> f64 {
        match self.closed {
            Some((high, low)) if low > f64::EPSILON && high >= low => {
                let log_range = (high / low).ln();
                (log_range * log_range / (4.0 * std::f64::consts::LN_2)).sqrt()
            }
            _ => 0.0,
        }
    }
}

/// States that survive window boundaries.
#[derive(Debug)]
pub struct RollingState {
    pub rv_ewma_1m: Ewma,
    pub rv_ewma_5m: Ewma,
    pub rv_ewma_15m: Ewma,
    pub trade_rate_ewma: Ewma,
    pub spread_regime: EwmaVar,
    pub parkinson: ParkinsonMinute,
    /// Cumulative taker buy minus taker sell volume across all windows.
    pub cvd_cum: f64,
    pub prev_basis_bps: Option<f64>,
}

impl Default for RollingState {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingState {
    pub fn new() -> Self {
        Self {
            rv_ewma_1m: Ewma::new(0.1),
            rv_ewma_5m: Ewma::new(0.03),
            rv_ewma_15m: Ewma::new(0.01),
            trade_rate_ewma: Ewma::new(0.1),
            spread_regime: EwmaVar::new(0.1),
            parkinson: ParkinsonMinute::default(),
            cvd_cum: 0.0,
            prev_basis_bps: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l1(bid: f64, bid_qty: f64, ask: f64, ask_qty: f64) -> L1Sample {
        L1Sample { bid_price: bid, bid_qty, ask_price: ask, ask_qty }
    }

    #[test]
    fn test_ofi_accumulates_l1_deltas() {
        let mut window = WindowState::new();
        window.on_depth(l1(100.0, 5.0, 101.0, 5.0));
        // Bid +2, ask -1 => OFI +3.
        window.on_depth(l1(100.0, 7.0, 101.0, 4.0));
        // Bid -3, ask +2 => OFI -5.
        window.on_depth(l1(100.0, 4.0, 101.0, 6.0));
        assert!((window.ofi_sum - (-2.0)).abs() < 1e-9);
        assert_eq!(window.mid_prices.len(), 3);
    }

    #[test]
    fn test_jump_and_replenish_counters() {
        let mut window = WindowState::new();
        window.on_depth(l1(100.0, 5.0, 101.0, 5.0));
        // Price move on the bid: jump.
        window.on_depth(l1(100.5, 5.0, 101.0, 5.0));
        // Qty uptick only: replenishment, no jump.
        window.on_depth(l1(100.5, 6.0, 101.0, 5.0));
        assert_eq!(window.l1_jumps, 1);
        // Only the second transition upticked a quantity.
        assert_eq!(window.replenish_events, 1);
    }

    #[test]
    fn test_microprice_endpoints() {
        let mut window = WindowState::new();
        window.on_depth(l1(100.0, 1.0, 102.0, 1.0));
        window.on_depth(l1(100.0, 3.0, 102.0, 1.0));
        let first = window.microprice_first.unwrap();
        let last = window.microprice_last.unwrap();
        // Equal sizes: microprice is the mid.
        assert!((first - 101.0).abs() < 1e-9);
        // Bid-heavy book pushes the microprice toward the ask.
        assert!(last > first);
    }

    #[test]
    fn test_fast_ofi_is_independent() {
        let mut window = WindowState::new();
        window.on_depth(l1(100.0, 5.0, 101.0, 5.0));
        window.on_depth(l1(100.0, 8.0, 101.0, 5.0));
        assert!((window.take_fast_ofi() - 3.0).abs() < 1e-9);
        assert_eq!(window.take_fast_ofi(), 0.0);
        // The window-scoped sum kept its value.
        assert!((window.ofi_sum - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_keeps_rolling_inputs() {
        let mut window = WindowState::new();
        window.on_depth(l1(100.0, 5.0, 101.0, 5.0));
        window.on_trade(100.5, 1.0, false, 1_000);
        window.reset();

        assert!(window.mid_prices.is_empty());
        assert!(window.trade_prices.is_empty());
        assert_eq!(window.ofi_sum, 0.0);
        assert!(!window.flags.has_trades);
        // Last close and previous L1 survive for the next window.
        assert_eq!(window.last_close, Some(100.5));
        window.on_depth(l1(100.0, 6.0, 101.0, 5.0));
        assert!((window.ofi_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ewma_seeds_with_first_value() {
        let mut ewma = Ewma::new(0.1);
        assert_eq!(ewma.value(), None);
        assert!((ewma.update(10.0) - 10.0).abs() < 1e-12);
        let second = ewma.update(20.0);
        assert!((second - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_ewma_var_scores() {
        let mut state = EwmaVar::new(0.1);
        assert_eq!(state.score_and_update(1.0), 0.0);
        // No variance yet: still zero.
        assert_eq!(state.score_and_update(1.0), 0.0);
        for _ in 0..20 {
            state.score_and_update(1.0);
            state.score_and_update(2.0);
        }
        // A far outlier scores strongly positive.
        assert!(state.score_and_update(10.0) > 1.0);
    }

    #[test]
    fn test_parkinson_uses_prior_closed_minute() {
        let mut p = ParkinsonMinute::default();
        p.observe(10 * NS_PER_SEC, 110.0, 90.0);
        // Same minute: no closed bucket yet.
        assert_eq!(p.value(), 0.0);
        p.observe(30 * NS_PER_SEC, 120.0, 95.0);
        assert_eq!(p.value(), 0.0);

        // Next minute closes the first bucket with H=120, L=90.
        p.observe(70 * NS_PER_SEC, 100.0, 99.0);
        let expected = ((120.0f64 / 90.0).ln().powi(2) / (4.0 * std::f64::consts::LN_2)).sqrt();
        assert!((p.value() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_effective_spread_sign() {
        let mut window = WindowState::new();
        window.on_depth(l1(100.0, 1.0, 100.2, 1.0));
        // Taker buy above the mid: positive effective spread.
        window.on_trade(100.2, 1.0, false, 1);
        assert!(window.effective_spread_sum > 0.0);

        let mut sell_window = WindowState::new();
        sell_window.on_depth(l1(100.0, 1.0, 100.2, 1.0));
        // Taker sell below the mid: positive as well (sign folds in).
        sell_window.on_trade(100.0, 1.0, true, 1);
        assert!(sell_window.effective_spread_sum > 0.0);
    }
}
