//! Per-symbol and process-global state owned by the streaming side.

use crate::aggregate::{RollingState, WindowState};
use crate::aggregate::window::L1Sample;
use crate::book::LocalOrderBook;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// Everything a shard tracks for one symbol. Guarded by a short-held lock;
/// nothing may suspend while holding it.
pub struct SymbolState {
    pub book: LocalOrderBook,
    pub window: WindowState,
    pub rolling: RollingState,
}

impl SymbolState {
    pub fn new() -> Self {
        Self {
            book: LocalOrderBook::new(),
            window: WindowState::new(),
            rolling: RollingState::new(),
        }
    }
}

impl Default for SymbolState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MarkState {
    pub mark_price: f64,
    pub index_price: Option<f64>,
    pub ts_event_ns: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BookTickerState {
    pub l1: L1Sample,
    pub ts_recv_ns: u64,
}

/// Single-writer, multi-reader caches shared across shards: the latest mark
/// price per symbol, the global bookTicker L1 fallback, and the pending
/// liquidation timestamps drained at each window flush.
#[derive(Default)]
pub struct GlobalCaches {
    mark: RwLock<HashMap<String, MarkState>>,
    book_ticker: RwLock<HashMap<String, BookTickerState>>,
    pending_liquidations: Mutex<HashMap<String, Vec<u64>>>,
}

impl GlobalCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mark(&self, symbol: &str, state: MarkState) {
        if let Ok(mut map) = self.mark.write() {
            map.insert(symbol.to_string(), state);
        }
    }

    pub fn mark(&self, symbol: &str) -> Option<MarkState> {
        self.mark.read().ok().and_then(|map| map.get(symbol).copied())
    }

    pub fn set_book_ticker(&self, symbol: &str, state: BookTickerState) {
        if let Ok(mut map) = self.book_ticker.write() {
            map.insert(symbol.to_string(), state);
        }
    }

    pub fn book_ticker(&self, symbol: &str) -> Option<BookTickerState> {
        self.book_ticker
            .read()
            .ok()
            .and_then(|map| map.get(symbol).copied())
    }

    pub fn push_liquidation(&self, symbol: &str, ts_ns: u64) {
        if let Ok(mut map) = self.pending_liquidations.lock() {
            map.entry(symbol.to_string()).or_default().push(ts_ns);
        }
    }

    /// Drain the pending liquidations for one symbol.
    pub fn take_liquidations(&self, symbol: &str) -> Vec<u64> {
        self.pending_liquidations
            .lock()
            .ok()
            .and_then(|mut map| map.remove(symbol))
            .unwrap_or_default()
    }
}
