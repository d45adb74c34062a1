//! Local order book reconstruction from incremental depth updates.
//!
//! Maintains sorted bid/ask levels per symbol using `BTreeMap` and applies
//! the venue's sequence rules: stale events are dropped, gaps clear the book
//! and re-enter bootstrap, and a REST snapshot (cooldown-gated, at most one
//! in flight per symbol) reseeds the levels.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Levels both sides must hold before the book counts as initialized.
pub const MIN_INIT_LEVELS: usize = 20;

/// Outcome of applying one incremental update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Update applied in sequence.
    Applied,
    /// `u <= last_update_id`: already reflected, dropped.
    Stale,
    /// `U > last_update_id + 1`: book was cleared and the update applied as
    /// the first chunk of a fresh bootstrap. Caller should request a resync.
    GapReset,
}

/// Best bid/ask prices and quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopOfBook {
    pub bid_price: Decimal,
    pub bid_qty: Decimal,
    pub ask_price: Decimal,
    pub ask_qty: Decimal,
}

impl TopOfBook {
    pub fn mid(&self) -> Decimal {
        (self.bid_price + self.ask_price) / Decimal::TWO
    }
}

/// Order book state for a single symbol.
#[derive(Debug)]
pub struct LocalOrderBook {
    /// Bid levels: price -> quantity (ascending; best bid is the last key).
    pub bids: BTreeMap<Decimal, Decimal>,

    /// Ask levels: price -> quantity (ascending; best ask is the first key).
    pub asks: BTreeMap<Decimal, Decimal>,

    /// Last applied update id; `None` until the first snapshot or diff.
    pub last_update_id: Option<u64>,

    /// Both sides hold at least [`MIN_INIT_LEVELS`] levels.
    pub initialized: bool,

    /// Diffs applied since the counter was last drained.
    window_update_count: u64,

    rest_inflight: bool,
    last_rest_snapshot: Option<Instant>,
}

impl Default for LocalOrderBook {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalOrderBook {
    pub fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: None,
            initialized: false,
            window_update_count: 0,
            rest_inflight: false,
            last_rest_snapshot: None,
        }
    }

    /// Replace the book with a REST snapshot.
    pub fn apply_snapshot(
        &mut self,
        last_update_id: u64,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
    ) {
        self.bids.clear();
        self.asks.clear();
        for (price, qty) in bids {
            if !qty.is_zero() {
                self.bids.insert(price, qty);
            }
        }
        for (price, qty) in asks {
            if !qty.is_zero() {
                self.asks.insert(price, qty);
            }
        }
        self.last_update_id = Some(last_update_id);
        self.recompute_initialized();
    }

    /// Apply one incremental update `{U, u, bids, asks}`.
    ///
    /// Sequence policy: gap iff `U > last_update_id + 1`, duplicate iff
    /// `u <= last_update_id`; both checks apply only to initialized books so
    /// bootstrap chunks always land.
    pub fn apply_diff(
        &mut self,
        first_update_id: u64,
        final_update_id: u64,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
    ) -> DiffOutcome {
        let mut outcome = DiffOutcome::Applied;

        if self.initialized {
            if let Some(last) = self.last_update_id {
                if final_update_id <= last {
                    return DiffOutcome::Stale;
                }
                if first_update_id > last + 1 {
                    // Sequence gap: drop all levels and treat this update as
                    // the first chunk of the new bootstrap.
                    self.bids.clear();
                    self.asks.clear();
                    self.initialized = false;
                    self.last_update_id = None;
                    outcome = DiffOutcome::GapReset;
                }
            }
        }

        for (price, qty) in bids {
            if qty.is_zero() {
                self.bids.remove(price);
            } else {
                self.bids.insert(*price, *qty);
            }
        }
        for (price, qty) in asks {
            if qty.is_zero() {
                self.asks.remove(price);
            } else {
                self.asks.insert(*price, *qty);
            }
        }

        self.last_update_id = Some(final_update_id);
        self.window_update_count += 1;
        self.recompute_initialized();
        outcome
    }

    /// Top-n bids (best first, descending) and asks (best first, ascending).
    pub fn top(&self, n: usize) -> (Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(n)
            .map(|(p, q)| (*p, *q))
            .collect();
        let asks = self.asks.iter().take(n).map(|(p, q)| (*p, *q)).collect();
        (bids, asks)
    }

    /// Best bid/ask, or `None` while the book is not initialized.
    pub fn l1(&self) -> Option<TopOfBook> {
        if !self.initialized {
            return None;
        }
        let (bid_price, bid_qty) = self.bids.iter().next_back()?;
        let (ask_price, ask_qty) = self.asks.iter().next()?;
        Some(TopOfBook {
            bid_price: *bid_price,
            bid_qty: *bid_qty,
            ask_price: *ask_price,
            ask_qty: *ask_qty,
        })
    }

    pub fn is_crossed(&self) -> bool {
        if !self.initialized {
            return false;
        }
        match (self.bids.keys().next_back(), self.asks.keys().next()) {
            (Some(best_bid), Some(best_ask)) => best_bid >= best_ask,
            _ => false,
        }
    }

    /// Try to claim the REST resync slot. Returns false while another
    /// snapshot is in flight or the cooldown since the last successful one
    /// has not elapsed.
    pub fn begin_rest_snapshot(&mut self, cooldown: Duration) -> bool {
        if self.rest_inflight {
            return false;
        }
        if let Some(at) = self.last_rest_snapshot {
            if at.elapsed() < cooldown {
                return false;
            }
        }
        self.rest_inflight = true;
        true
    }

    /// Release the resync slot; a success arms the cooldown.
    pub fn finish_rest_snapshot(&mut self, success: bool) {
        self.rest_inflight = false;
        if success {
            self.last_rest_snapshot = Some(Instant::now());
        }
    }

    /// Drain the per-window diff counter.
    pub fn take_window_update_count(&mut self) -> u64 {
        std::mem::take(&mut self.window_update_count)
    }

    fn recompute_initialized(&mut self) {
        self.initialized = self.bids.len() >= MIN_INIT_LEVELS && self.asks.len() >= MIN_INIT_LEVELS;
    }
}
