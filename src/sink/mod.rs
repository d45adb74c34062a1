//! Sink writers.
//!
//! Two destinations: the columnar analytic store (ClickHouse over HTTP,
//! batched JSONEachRow inserts) and the live-read key-value cache (Redis,
//! pipelined commands). Both buffer on `enqueue` and flush from their own
//! background task on size and time triggers.

pub mod clickhouse;
pub mod redis;
pub mod rows;
pub mod schema;

pub use clickhouse::ClickHouseWriter;
pub use redis::RedisWriter;

use std::collections::HashMap;

/// Counter snapshot shared by both writers; table-keyed maps stay empty for
/// the key-value writer.
#[derive(Debug, Clone, Default)]
pub struct SinkStats {
    pub name: &'static str,
    /// Records accepted by `enqueue`.
    pub events: u64,
    /// Rows/commands confirmed by the sink.
    pub items_flushed: u64,
    pub flush_errors: u64,
    /// Records lost to saturated buffers.
    pub dropped: u64,
    pub rows_by_table: HashMap<&'static str, u64>,
    pub flushed_by_table: HashMap<&'static str, u64>,
    pub pending_by_table: HashMap<&'static str, u64>,
}
