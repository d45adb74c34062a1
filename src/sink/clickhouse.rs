//! Batched bulk inserter for the columnar store.
//!
//! Rows buffer per destination table and flush when a table reaches the
//! batch size or the flush interval elapses. Flushes run concurrently up to
//! a semaphore bound; flushes of the same table are serialized by a
//! per-table mutex so retried batches cannot interleave. A failed flush
//! re-queues its rows at the front of the buffer; nothing is dropped unless
//! a bounded buffer saturates, which the producer counts.

use crate::config::ClickHouseConfig;
use crate::error::{FeedError, Result};
use crate::events::{Channel, Record};
use crate::router::RecordWriter;
use crate::sink::{rows, schema, SinkStats};
use reqwest::Client;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Concurrent flush requests across all tables.
const FLUSH_CONCURRENCY: usize = 4;

/// Sink-side insert deadline.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

struct TableCounters {
    rows: u64,
    flushed: u64,
    dropped: u64,
}

pub struct ClickHouseWriter {
    client: Client,
    base_url: String,
    database: String,
    batch_rows: usize,
    max_buffer_rows: usize,
    flush_interval: Duration,
    compression: Option<String>,

    buffers: Mutex<HashMap<&'static str, VecDeque<String>>>,
    counters: Mutex<HashMap<&'static str, TableCounters>>,
    table_locks: HashMap<&'static str, AsyncMutex<()>>,
    flush_sem: Arc<Semaphore>,
    batch_ready: Notify,
    pending_flushes: Mutex<Vec<JoinHandle<()>>>,

    events: AtomicU64,
    flush_errors: AtomicU64,
}

impl ClickHouseWriter {
    pub fn new(config: &ClickHouseConfig) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(FLUSH_TIMEOUT)
            .build()
            .map_err(|e| FeedError::Config(format!("HTTP client build failed: {}", e)))?;

        let mut table_locks = HashMap::new();
        for channel in Channel::ALL {
            table_locks.insert(channel.table(), AsyncMutex::new(()));
        }

        Ok(Arc::new(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            batch_rows: config.batch_rows.max(1),
            max_buffer_rows: config.max_buffer_rows.max(config.batch_rows),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(10)),
            compression: config.compression.clone(),
            buffers: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            table_locks,
            flush_sem: Arc::new(Semaphore::new(FLUSH_CONCURRENCY)),
            batch_ready: Notify::new(),
            pending_flushes: Mutex::new(Vec::new()),
            events: AtomicU64::new(0),
            flush_errors: AtomicU64::new(0),
        }))
    }

    /// Create the database, every table and the column migrations.
    pub async fn bootstrap_schema(&self) -> Result<()> {
        self.execute(&schema::create_database(&self.database)).await?;
        for (table, ddl) in schema::schema_ddl(&self.database) {
            self.execute(&ddl).await?;
            debug!(table, "schema ready");
        }
        for (migration, sql) in schema::migration_ddl(&self.database) {
            self.execute(&sql).await?;
            debug!(migration, "migration applied");
        }
        info!(database = %self.database, "columnar schema bootstrapped");
        Ok(())
    }

    async fn execute(&self, query: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/", self.base_url))
            .query(&[("query", query)])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Sink(format!(
                "DDL failed (HTTP {}): {}",
                status,
                body.trim()
            )));
        }
        Ok(())
    }

    /// Flush loop: wakes on the interval or as soon as a table reaches the
    /// batch size, performs a final drain on shutdown.
    pub async fn run_autoflush(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => Self::schedule_ready_batches(&self, true),
                _ = self.batch_ready.notified() => Self::schedule_ready_batches(&self, false),
                _ = shutdown.cancelled() => break,
            }
        }

        // Drain in-flight flushes, then push out whatever is still buffered.
        let pending: Vec<JoinHandle<()>> = match self.pending_flushes.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in pending {
            let _ = handle.await;
        }
        Self::final_flush(&self).await;
        info!("columnar writer stopped");
    }

    /// Schedule batches that should flush now.
    fn schedule_ready_batches(writer: &Arc<Self>, include_partial: bool) {
        for (table, batch) in writer.take_ready_batches(include_partial) {
            Self::spawn_flush(writer, table, batch);
        }
    }

    /// Drain batches from the buffers. `include_partial` drains every
    /// non-empty buffer (timer path); otherwise only tables that reached the
    /// batch size are taken (size-trigger path).
    fn take_ready_batches(&self, include_partial: bool) -> Vec<(&'static str, Vec<String>)> {
        let mut batches: Vec<(&'static str, Vec<String>)> = Vec::new();
        if let Ok(mut buffers) = self.buffers.lock() {
            for (table, buffer) in buffers.iter_mut() {
                while buffer.len() >= self.batch_rows {
                    let batch: Vec<String> = buffer.drain(..self.batch_rows).collect();
                    batches.push((*table, batch));
                }
                if include_partial && !buffer.is_empty() {
                    batches.push((*table, buffer.drain(..).collect()));
                }
            }
        }
        batches
    }

    fn spawn_flush(writer: &Arc<Self>, table: &'static str, batch: Vec<String>) {
        let task_writer = Arc::clone(writer);
        let handle = tokio::spawn(async move {
            task_writer.flush_batch(table, batch).await;
        });
        if let Ok(mut pending) = writer.pending_flushes.lock() {
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }
    }

    async fn flush_batch(self: Arc<Self>, table: &'static str, batch: Vec<String>) {
        if batch.is_empty() {
            return;
        }
        let Ok(_permit) = self.flush_sem.acquire().await else {
            return;
        };
        // Same-table flushes must not overlap; the permit bounds total
        // concurrency, the table lock serializes retries per table.
        let _table_guard = self.table_locks[table].lock().await;

        let row_count = batch.len();
        let payload = batch.join("\n");
        let query = format!(
            "INSERT INTO {}.{} FORMAT JSONEachRow",
            self.database, table
        );
        let mut request = self
            .client
            .post(format!("{}/", self.base_url))
            .query(&[("query", query.as_str())])
            .body(payload);
        if let Some(compression) = &self.compression {
            request = request
                .query(&[("enable_http_compression", "1")])
                .header(reqwest::header::ACCEPT_ENCODING, compression.as_str());
        }
        let result = request.send().await;

        let failed = match result {
            Ok(response) if response.status().is_success() => false,
            Ok(response) => {
                warn!(
                    table,
                    rows = row_count,
                    status = %response.status(),
                    "flush rejected by sink"
                );
                true
            }
            Err(err) => {
                warn!(table, rows = row_count, error = %err, "flush failed");
                true
            }
        };

        if failed {
            self.flush_errors.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut buffers) = self.buffers.lock() {
                let buffer = buffers.entry(table).or_default();
                for row in batch.into_iter().rev() {
                    buffer.push_front(row);
                }
            }
        } else {
            if let Ok(mut counters) = self.counters.lock() {
                counters
                    .entry(table)
                    .or_insert(TableCounters { rows: 0, flushed: 0, dropped: 0 })
                    .flushed += row_count as u64;
            }
            debug!(table, rows = row_count, "flushed");
        }
    }

    async fn final_flush(writer: &Arc<Self>) {
        let batches: Vec<(&'static str, Vec<String>)> = match writer.buffers.lock() {
            Ok(mut buffers) => buffers
                .iter_mut()
                .filter(|(_, buffer)| !buffer.is_empty())
                .map(|(table, buffer)| (*table, buffer.drain(..).collect()))
                .collect(),
            Err(_) => Vec::new(),
        };
        for (table, batch) in batches {
            Arc::clone(writer).flush_batch(table, batch).await;
        }
    }

    pub fn stats(&self) -> SinkStats {
        let mut stats = SinkStats {
            name: "clickhouse",
            events: self.events.load(Ordering::Relaxed),
            flush_errors: self.flush_errors.load(Ordering::Relaxed),
            ..Default::default()
        };
        if let Ok(counters) = self.counters.lock() {
            for (table, c) in counters.iter() {
                stats.rows_by_table.insert(*table, c.rows);
                stats.flushed_by_table.insert(*table, c.flushed);
                stats.items_flushed += c.flushed;
                stats.dropped += c.dropped;
            }
        }
        if let Ok(buffers) = self.buffers.lock() {
            for (table, buffer) in buffers.iter() {
                if !buffer.is_empty() {
                    stats.pending_by_table.insert(*table, buffer.len() as u64);
                }
            }
        }
        stats
    }
}

impl RecordWriter for ClickHouseWriter {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn enqueue(&self, record: &Record) {
        let Some((table, line)) = rows::to_row(record) else {
            return;
        };
        self.events.fetch_add(1, Ordering::Relaxed);

        let mut ready = false;
        if let Ok(mut buffers) = self.buffers.lock() {
            let buffer = buffers.entry(table).or_default();
            if buffer.len() >= self.max_buffer_rows {
                if let Ok(mut counters) = self.counters.lock() {
                    counters
                        .entry(table)
                        .or_insert(TableCounters { rows: 0, flushed: 0, dropped: 0 })
                        .dropped += 1;
                }
                return;
            }
            buffer.push_back(line);
            if let Ok(mut counters) = self.counters.lock() {
                counters
                    .entry(table)
                    .or_insert(TableCounters { rows: 0, flushed: 0, dropped: 0 })
                    .rows += 1;
            }
            ready = buffer.len() >= self.batch_rows;
        }
        if ready {
            self.batch_ready.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Body, MarkPrice, Record};
    use rust_decimal::Decimal;

    fn writer(batch_rows: usize, max_buffer_rows: usize) -> Arc<ClickHouseWriter> {
        ClickHouseWriter::new(&ClickHouseConfig {
            url: "http://localhost:8123".to_string(),
            database: "marketdata".to_string(),
            batch_rows,
            flush_interval_ms: 250,
            max_buffer_rows,
            compression: None,
        })
        .unwrap()
    }

    fn mark_record(ts: u64) -> Record {
        Record::new(
            "BTCUSDT",
            Channel::MarkPrice,
            ts,
            ts,
            Body::MarkPrice(MarkPrice { mark_price: Decimal::ONE, index_price: None }),
        )
    }

    #[tokio::test]
    async fn test_enqueue_buffers_rows() {
        let writer = writer(100, 1000);
        for ts in 0..3 {
            writer.enqueue(&mark_record(ts));
        }
        let stats = writer.stats();
        assert_eq!(stats.events, 3);
        assert_eq!(stats.rows_by_table.get("mark_price"), Some(&3));
        assert_eq!(stats.pending_by_table.get("mark_price"), Some(&3));
        assert_eq!(stats.items_flushed, 0);
    }

    #[tokio::test]
    async fn test_saturated_buffer_drops_and_counts() {
        let writer = writer(2, 2);
        for ts in 0..5 {
            writer.enqueue(&mark_record(ts));
        }
        let stats = writer.stats();
        assert_eq!(stats.pending_by_table.get("mark_price"), Some(&2));
        assert_eq!(stats.dropped, 3);
    }

    #[tokio::test]
    async fn test_ready_batches_respect_batch_size() {
        let writer = writer(2, 1000);
        for ts in 0..5 {
            writer.enqueue(&mark_record(ts));
        }

        // Size-trigger path takes two full batches and leaves the remainder.
        let batches = writer.take_ready_batches(false);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|(table, rows)| *table == "mark_price" && rows.len() == 2));
        assert_eq!(
            writer.stats().pending_by_table.get("mark_price"),
            Some(&1)
        );

        // Timer path drains the partial remainder.
        let rest = writer.take_ready_batches(true);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].1.len(), 1);
        assert!(writer.stats().pending_by_table.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_preserves_order_at_front() {
        let writer = writer(10, 1000);
        for ts in 0..3 {
            writer.enqueue(&mark_record(ts));
        }
        let mut batches = writer.take_ready_batches(true);
        assert_eq!(batches.len(), 1);
        let batch = batches.remove(0).1;

        // Simulate the failure path: rows return to the buffer front.
        {
            let mut buffers = writer.buffers.lock().unwrap();
            let buffer = buffers.entry("mark_price").or_default();
            buffer.push_back("tail-row".to_string());
            for row in batch.into_iter().rev() {
                buffer.push_front(row);
            }
        }
        let drained = writer.take_ready_batches(true);
        let rows = &drained[0].1;
        assert_eq!(rows.len(), 4);
        assert!(rows[0].contains("\"ts_event_ns\":0"));
        assert_eq!(rows[3], "tail-row");
    }
}
