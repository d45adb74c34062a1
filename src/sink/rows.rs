//! Record-to-row mapping for the columnar sink.
//!
//! Each record becomes one JSONEachRow line for its destination table.
//! Decimals serialize as strings so the sink parses them at full precision;
//! the row content is deterministic, which lets consumers dedup replays of
//! the same batch.

use crate::events::{Body, Record};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};

/// Map a record onto `(table, json_line)`. Returns `None` for bodies the
/// columnar sink does not persist (there are none today; the match keeps the
/// compiler honest when variants are added).
pub fn to_row(record: &Record) -> Option<(&'static str, String)> {
    let mut row = Map::new();
    row.insert("instrument".to_string(), json!(record.instrument));
    row.insert("ts_event_ns".to_string(), json!(record.ts_event_ns));
    row.insert("ts_recv_ns".to_string(), json!(record.ts_recv_ns));

    let table = record.channel.table();
    match &record.body {
        Body::Trade(trade) => {
            row.insert("price".to_string(), dec(trade.price));
            row.insert("qty".to_string(), dec(trade.qty));
            row.insert("side".to_string(), json!(trade.side.as_str()));
            row.insert("trade_id".to_string(), opt_string(&trade.trade_id));
            row.insert(
                "is_aggressor".to_string(),
                match trade.is_aggressor {
                    Some(flag) => json!(u8::from(flag)),
                    None => Value::Null,
                },
            );
        }
        Body::AggTrade5s(agg) => {
            row.insert("interval_s".to_string(), json!(agg.interval_s));
            row.insert("window_start_ns".to_string(), json!(agg.window_start_ns));
            row.insert("open".to_string(), dec(agg.open));
            row.insert("high".to_string(), dec(agg.high));
            row.insert("low".to_string(), dec(agg.low));
            row.insert("close".to_string(), dec(agg.close));
            row.insert("volume".to_string(), dec(agg.volume));
            row.insert("notional".to_string(), dec(agg.notional));
            row.insert("trade_count".to_string(), json!(agg.trade_count));
            row.insert("buy_qty".to_string(), dec(agg.buy_qty));
            row.insert("sell_qty".to_string(), dec(agg.sell_qty));
            row.insert("buy_notional".to_string(), dec(agg.buy_notional));
            row.insert("sell_notional".to_string(), dec(agg.sell_notional));
            row.insert("first_trade_id".to_string(), opt_string(&agg.first_trade_id));
            row.insert("last_trade_id".to_string(), opt_string(&agg.last_trade_id));
        }
        Body::DepthSnapshot(depth) => {
            row.insert("depth".to_string(), json!(depth.depth));
            row.insert("bid_prices".to_string(), dec_array(&depth.bid_prices));
            row.insert("bid_qtys".to_string(), dec_array(&depth.bid_qtys));
            row.insert("ask_prices".to_string(), dec_array(&depth.ask_prices));
            row.insert("ask_qtys".to_string(), dec_array(&depth.ask_qtys));
        }
        Body::DepthDiff(diff) => {
            row.insert("sequence".to_string(), json!(diff.sequence));
            row.insert("prev_sequence".to_string(), json!(diff.prev_sequence));
            row.insert("bids".to_string(), dec_map(&diff.bids));
            row.insert("asks".to_string(), dec_map(&diff.asks));
        }
        Body::Liquidation(liq) => {
            row.insert("side".to_string(), json!(liq.side.as_str()));
            row.insert("price".to_string(), dec(liq.price));
            row.insert("qty".to_string(), dec(liq.qty));
            row.insert("order_id".to_string(), opt_string(&liq.order_id));
            row.insert("reason".to_string(), opt_string(&liq.reason));
        }
        Body::Kline(kline) => {
            row.insert("interval".to_string(), json!(kline.interval));
            row.insert("open".to_string(), dec(kline.open));
            row.insert("high".to_string(), dec(kline.high));
            row.insert("low".to_string(), dec(kline.low));
            row.insert("close".to_string(), dec(kline.close));
            row.insert("volume".to_string(), dec(kline.volume));
            row.insert("quote_volume".to_string(), dec(kline.quote_volume));
            row.insert(
                "taker_buy_base_volume".to_string(),
                dec(kline.taker_buy_base_volume),
            );
            row.insert(
                "taker_buy_quote_volume".to_string(),
                dec(kline.taker_buy_quote_volume),
            );
            row.insert("trade_count".to_string(), json!(kline.trade_count));
            row.insert("is_closed".to_string(), json!(u8::from(kline.is_closed)));
        }
        Body::MarkPrice(mark) => {
            row.insert("mark_price".to_string(), dec(mark.mark_price));
            row.insert(
                "index_price".to_string(),
                match mark.index_price {
                    Some(index) => dec(index),
                    None => Value::Null,
                },
            );
        }
        Body::Funding(funding) => {
            row.insert("funding_rate".to_string(), dec(funding.funding_rate));
            row.insert(
                "next_funding_ts_ns".to_string(),
                json!(funding.next_funding_ts_ns),
            );
        }
        Body::AdvancedMetrics(adv) => {
            let mut metrics = Map::new();
            for (name, value) in &adv.metrics {
                metrics.insert(name.clone(), json!(value.to_string()));
            }
            row.insert("metrics".to_string(), Value::Object(metrics));
        }
    }

    Some((table, Value::Object(row).to_string()))
}

fn dec(value: Decimal) -> Value {
    json!(value.to_string())
}

fn dec_array(values: &[Decimal]) -> Value {
    Value::Array(values.iter().map(|v| json!(v.to_string())).collect())
}

fn dec_map(entries: &[(Decimal, Decimal)]) -> Value {
    let mut map = Map::new();
    for (price, qty) in entries {
        map.insert(price.to_string(), json!(qty.to_string()));
    }
    Value::Object(map)
}

fn opt_string(value: &Option<String>) -> Value {
    match value {
        Some(s) => json!(s),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{
        AdvancedMetrics, AggTrade5s, Channel, DepthDiff, DepthSnapshot, Side, Trade,
    };
    use std::collections::BTreeMap;
    use std::str::FromStr;

    fn dec_of(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn parse(line: &str) -> Value {
        serde_json::from_str(line).unwrap()
    }

    #[test]
    fn test_trade_row() {
        let record = Record::new(
            "BTCUSDT",
            Channel::Trades,
            1_000,
            2_000,
            Body::Trade(Trade {
                price: dec_of("67650.00"),
                qty: dec_of("1.234"),
                side: Side::Sell,
                trade_id: Some("42".to_string()),
                is_aggressor: Some(false),
            }),
        );
        let (table, line) = to_row(&record).unwrap();
        assert_eq!(table, "trades");

        let row = parse(&line);
        assert_eq!(row["instrument"], "BTCUSDT");
        assert_eq!(row["ts_event_ns"], 1_000);
        assert_eq!(row["price"], "67650.00");
        assert_eq!(row["side"], "SELL");
        assert_eq!(row["is_aggressor"], 0);
    }

    #[test]
    fn test_row_round_trip_preserves_decimals() {
        let record = Record::new(
            "BTCUSDT",
            Channel::AggTrades5s,
            4_999_999_999,
            5_100,
            Body::AggTrade5s(AggTrade5s {
                interval_s: 5,
                window_start_ns: 0,
                open: dec_of("100.000000000000000001"),
                high: dec_of("110"),
                low: dec_of("100.000000000000000001"),
                close: dec_of("110"),
                volume: dec_of("3"),
                notional: dec_of("320.10"),
                trade_count: 2,
                buy_qty: dec_of("1"),
                sell_qty: dec_of("2"),
                buy_notional: dec_of("100.10"),
                sell_notional: dec_of("220.00"),
                first_trade_id: None,
                last_trade_id: Some("7".to_string()),
            }),
        );
        let (table, line) = to_row(&record).unwrap();
        assert_eq!(table, "agg_trades_5s");

        let row = parse(&line);
        // 18-fractional-digit value survives as the same normalized decimal.
        let open = Decimal::from_str(row["open"].as_str().unwrap()).unwrap();
        assert_eq!(open, dec_of("100.000000000000000001"));
        assert_eq!(row["first_trade_id"], Value::Null);
        assert_eq!(row["last_trade_id"], "7");
        let volume = Decimal::from_str(row["volume"].as_str().unwrap()).unwrap();
        let buy = Decimal::from_str(row["buy_qty"].as_str().unwrap()).unwrap();
        let sell = Decimal::from_str(row["sell_qty"].as_str().unwrap()).unwrap();
        assert_eq!(volume, buy + sell);
    }

    #[test]
    fn test_diff_row_maps_prices_to_strings() {
        let record = Record::new(
            "BTCUSDT",
            Channel::ObDiff,
            1,
            2,
            Body::DepthDiff(DepthDiff {
                sequence: 102,
                prev_sequence: 101,
                bids: vec![(dec_of("10"), dec_of("2"))],
                asks: vec![(dec_of("12"), dec_of("0"))],
            }),
        );
        let (table, line) = to_row(&record).unwrap();
        assert_eq!(table, "order_book_diffs");
        let row = parse(&line);
        assert_eq!(row["bids"]["10"], "2");
        assert_eq!(row["asks"]["12"], "0");
        assert_eq!(row["sequence"], 102);
    }

    #[test]
    fn test_depth_row_parallel_arrays() {
        let record = Record::new(
            "BTCUSDT",
            Channel::ObTop5,
            1,
            2,
            Body::DepthSnapshot(DepthSnapshot {
                depth: 5,
                bid_prices: vec![dec_of("100"), dec_of("99")],
                bid_qtys: vec![dec_of("1"), dec_of("2")],
                ask_prices: vec![dec_of("101")],
                ask_qtys: vec![dec_of("3")],
            }),
        );
        let (table, line) = to_row(&record).unwrap();
        assert_eq!(table, "ob_top5");
        let row = parse(&line);
        assert_eq!(row["depth"], 5);
        assert_eq!(row["bid_prices"].as_array().unwrap().len(), 2);
        assert_eq!(row["ask_qtys"][0], "3");
    }

    #[test]
    fn test_metrics_row_is_deterministic() {
        let mut metrics = BTreeMap::new();
        metrics.insert("spread_bps".to_string(), dec_of("1.5"));
        metrics.insert("mid_px".to_string(), dec_of("100.1"));
        let record = Record::new(
            "BTCUSDT",
            Channel::AdvancedMetrics,
            1,
            2,
            Body::AdvancedMetrics(AdvancedMetrics { metrics }),
        );
        let (_, first) = to_row(&record).unwrap();
        let (_, second) = to_row(&record).unwrap();
        assert_eq!(first, second);
        let row = parse(&first);
        assert_eq!(row["metrics"]["spread_bps"], "1.5");
    }
}
