//! Columnar store schema.
//!
//! Idempotent DDL executed once at startup: every table shares the record
//! header, is partitioned monthly by event time and ordered by
//! `(instrument, ts_event_ns)`. Decimal columns carry 38 total / 18
//! fractional digits. A small migration set brings pre-existing tables up to
//! the current column set.

const COMMON_COLUMNS: &str = "\
    instrument String, \
    ts_event_ns UInt64, \
    ts_recv_ns UInt64, \
    event_time DateTime64(9) MATERIALIZED toDateTime64(ts_event_ns / 1000000000, 9), \
    recv_time DateTime64(9) MATERIALIZED toDateTime64(ts_recv_ns / 1000000000, 9)";

const ENGINE: &str = "\
    ENGINE = MergeTree \
    PARTITION BY toYYYYMM(event_time) \
    ORDER BY (instrument, ts_event_ns)";

pub fn create_database(database: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {}", database)
}

/// `(table, ddl)` pairs for every destination table.
pub fn schema_ddl(database: &str) -> Vec<(&'static str, String)> {
    let depth_columns = "\
        depth UInt16, \
        bid_prices Array(Decimal(38, 18)), \
        bid_qtys Array(Decimal(38, 18)), \
        ask_prices Array(Decimal(38, 18)), \
        ask_qtys Array(Decimal(38, 18))";

    let tables: Vec<(&'static str, String)> = vec![
        (
            "trades",
            "price Decimal(38, 18), \
             qty Decimal(38, 18), \
             side LowCardinality(String), \
             trade_id Nullable(String), \
             is_aggressor Nullable(UInt8)"
                .to_string(),
        ),
        (
            "agg_trades_5s",
            "interval_s UInt16, \
             window_start_ns UInt64, \
             open Decimal(38, 18), \
             high Decimal(38, 18), \
             low Decimal(38, 18), \
             close Decimal(38, 18), \
             volume Decimal(38, 18), \
             notional Decimal(38, 18), \
             trade_count UInt32, \
             buy_qty Decimal(38, 18), \
             sell_qty Decimal(38, 18), \
             buy_notional Decimal(38, 18), \
             sell_notional Decimal(38, 18), \
             first_trade_id Nullable(String), \
             last_trade_id Nullable(String)"
                .to_string(),
        ),
        ("l1", depth_columns.to_string()),
        ("ob_top5", depth_columns.to_string()),
        ("ob_top20", depth_columns.to_string()),
        (
            "order_book_diffs",
            "sequence UInt64, \
             prev_sequence UInt64, \
             bids Map(String, Decimal(38, 18)), \
             asks Map(String, Decimal(38, 18))"
                .to_string(),
        ),
        (
            "liquidations",
            "side LowCardinality(String), \
             price Decimal(38, 18), \
             qty Decimal(38, 18), \
             order_id Nullable(String), \
             reason Nullable(String)"
                .to_string(),
        ),
        (
            "klines",
            "interval LowCardinality(String), \
             open Decimal(38, 18), \
             high Decimal(38, 18), \
             low Decimal(38, 18), \
             close Decimal(38, 18), \
             volume Decimal(38, 18), \
             quote_volume Decimal(38, 18), \
             taker_buy_base_volume Decimal(38, 18), \
             taker_buy_quote_volume Decimal(38, 18), \
             trade_count UInt32, \
             is_closed UInt8"
                .to_string(),
        ),
        (
            "mark_price",
            "mark_price Decimal(38, 18), \
             index_price Nullable(Decimal(38, 18))"
                .to_string(),
        ),
        (
            "funding",
            "funding_rate Decimal(38, 18), \
             next_funding_ts_ns UInt64"
                .to_string(),
        ),
        (
            "advanced_metrics",
            "metrics Map(String, Decimal(38, 18))".to_string(),
        ),
    ];

    tables
        .into_iter()
        .map(|(name, body)| {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {}.{} ({}, {}) {}",
                database, name, COMMON_COLUMNS, body, ENGINE
            );
            (name, ddl)
        })
        .collect()
}

/// One-shot column migrations for tables created by earlier schema versions.
pub fn migration_ddl(database: &str) -> Vec<(&'static str, String)> {
    vec![
        (
            "funding.funding_rate",
            format!(
                "ALTER TABLE {}.funding ADD COLUMN IF NOT EXISTS funding_rate Decimal(38, 18)",
                database
            ),
        ),
        (
            "funding.next_funding_ts_ns",
            format!(
                "ALTER TABLE {}.funding ADD COLUMN IF NOT EXISTS next_funding_ts_ns UInt64",
                database
            ),
        ),
        (
            "klines.quote_volume",
            format!(
                "ALTER TABLE {}.klines ADD COLUMN IF NOT EXISTS quote_volume Decimal(38, 18) AFTER volume",
                database
            ),
        ),
        (
            "klines.taker_buy_base_volume",
            format!(
                "ALTER TABLE {}.klines ADD COLUMN IF NOT EXISTS taker_buy_base_volume Decimal(38, 18) AFTER quote_volume",
                database
            ),
        ),
        (
            "klines.taker_buy_quote_volume",
            format!(
                "ALTER TABLE {}.klines ADD COLUMN IF NOT EXISTS taker_buy_quote_volume Decimal(38, 18) AFTER taker_buy_base_volume",
                database
            ),
        ),
    ]
}
