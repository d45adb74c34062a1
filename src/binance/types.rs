//! Wire formats for the venue's public streams and REST endpoints.
//!
//! Field names mirror the venue's single-letter JSON keys; everything else in
//! the pipeline works on the normalized [`crate::events::Record`] model.

use serde::Deserialize;

/// Envelope for multiplexed `/stream?streams=` connections.
#[derive(Debug, Deserialize)]
pub struct CombinedStreamMessage {
    pub stream: String,
    pub data: serde_json::Value,
}

/// Incremental depth update (`<symbol>@depth@100ms`).
#[derive(Debug, Clone, Deserialize)]
pub struct DepthDiffMessage {
    #[serde(rename = "E")]
    pub event_time_ms: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "U")]
    pub first_update_id: u64,

    #[serde(rename = "u")]
    pub final_update_id: u64,

    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,

    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

/// Trade stream payload (`<symbol>@trade`).
#[derive(Debug, Clone, Deserialize)]
pub struct TradeMessage {
    #[serde(rename = "E")]
    pub event_time_ms: u64,

    #[serde(rename = "T")]
    pub trade_time_ms: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "p")]
    pub price: String,

    #[serde(rename = "q")]
    pub qty: String,

    /// True when the buyer is the resting maker, i.e. the taker sold.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,

    #[serde(rename = "t")]
    pub trade_id: Option<u64>,
}

/// Global best bid/ask stream (`!bookTicker`).
#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerMessage {
    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "b")]
    pub bid_price: String,

    #[serde(rename = "B")]
    pub bid_qty: String,

    #[serde(rename = "a")]
    pub ask_price: String,

    #[serde(rename = "A")]
    pub ask_qty: String,
}

/// Mark/index price stream (`<symbol>@markPrice@1s`); also carries funding.
#[derive(Debug, Clone, Deserialize)]
pub struct MarkPriceMessage {
    #[serde(rename = "E")]
    pub event_time_ms: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "p")]
    pub mark_price: String,

    #[serde(rename = "i")]
    pub index_price: Option<String>,

    #[serde(rename = "r")]
    pub funding_rate: Option<String>,

    #[serde(rename = "T")]
    pub next_funding_time_ms: Option<u64>,
}

/// Liquidation order stream (`<symbol>@forceOrder`).
#[derive(Debug, Clone, Deserialize)]
pub struct ForceOrderMessage {
    #[serde(rename = "E")]
    pub event_time_ms: u64,

    #[serde(rename = "o")]
    pub order: ForceOrder,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForceOrder {
    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "S")]
    pub side: String,

    #[serde(rename = "T")]
    pub trade_time_ms: u64,

    /// Last filled price; the order price `p` is the cap, not the fill.
    #[serde(rename = "L")]
    pub last_filled_price: String,

    #[serde(rename = "z")]
    pub filled_qty: String,

    #[serde(rename = "i")]
    pub order_id: Option<u64>,

    #[serde(rename = "X")]
    pub status: Option<String>,
}

/// Kline stream (`<symbol>@kline_<interval>`).
#[derive(Debug, Clone, Deserialize)]
pub struct KlineMessage {
    #[serde(rename = "E")]
    pub event_time_ms: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KlinePayload {
    #[serde(rename = "i")]
    pub interval: String,

    #[serde(rename = "o")]
    pub open: String,

    #[serde(rename = "h")]
    pub high: String,

    #[serde(rename = "l")]
    pub low: String,

    #[serde(rename = "c")]
    pub close: String,

    #[serde(rename = "v")]
    pub volume: String,

    #[serde(rename = "q")]
    pub quote_volume: String,

    #[serde(rename = "V")]
    pub taker_buy_base_volume: String,

    #[serde(rename = "Q")]
    pub taker_buy_quote_volume: String,

    #[serde(rename = "n")]
    pub trade_count: u32,

    #[serde(rename = "x")]
    pub is_closed: bool,
}

/// REST depth snapshot (`GET /fapi/v1/depth`).
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshotResponse {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

/// `GET /fapi/v1/openInterest`.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenInterestResponse {
    pub symbol: String,

    #[serde(rename = "openInterest")]
    pub open_interest: String,

    pub time: u64,
}

/// One entry of `GET /futures/data/topLongShortPositionRatio`.
#[derive(Debug, Clone, Deserialize)]
pub struct LongShortRatioEntry {
    #[serde(rename = "longShortRatio")]
    pub long_short_ratio: String,

    #[serde(rename = "longAccount")]
    pub long_account: String,

    #[serde(rename = "shortAccount")]
    pub short_account: String,

    pub timestamp: u64,
}

/// `GET /fapi/v1/exchangeInfo`, reduced to what symbol discovery needs.
#[derive(Debug, Deserialize)]
pub struct ExchangeInfoResponse {
    pub symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeSymbol {
    pub symbol: String,
    pub status: String,

    #[serde(rename = "contractType")]
    pub contract_type: Option<String>,

    #[serde(rename = "quoteAsset")]
    pub quote_asset: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_diff_deserialization() {
        let json = r#"{
            "e": "depthUpdate",
            "E": 1699999999123,
            "T": 1699999999100,
            "s": "BTCUSDT",
            "U": 1000,
            "u": 1005,
            "pu": 999,
            "b": [["67650.00", "1.23400"], ["67649.50", "0.45600"]],
            "a": [["67651.00", "0.98700"], ["67651.50", "0"]]
        }"#;

        let update: DepthDiffMessage = serde_json::from_str(json).unwrap();
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.first_update_id, 1000);
        assert_eq!(update.final_update_id, 1005);
        assert_eq!(update.bids.len(), 2);
        assert_eq!(update.asks[1][1], "0");
    }

    #[test]
    fn test_trade_deserialization() {
        let json = r#"{
            "e": "trade",
            "E": 1699999999123,
            "T": 1699999999120,
            "s": "ETHUSDT",
            "t": 987654,
            "p": "3520.10",
            "q": "0.250",
            "m": true
        }"#;

        let trade: TradeMessage = serde_json::from_str(json).unwrap();
        assert_eq!(trade.symbol, "ETHUSDT");
        assert!(trade.buyer_is_maker);
        assert_eq!(trade.trade_id, Some(987654));
    }

    #[test]
    fn test_mark_price_without_index() {
        let json = r#"{
            "e": "markPriceUpdate",
            "E": 1699999999123,
            "s": "BTCUSDT",
            "p": "67700.12",
            "r": "0.00010000",
            "T": 1700000400000
        }"#;

        let mark: MarkPriceMessage = serde_json::from_str(json).unwrap();
        assert_eq!(mark.mark_price, "67700.12");
        assert!(mark.index_price.is_none());
        assert_eq!(mark.next_funding_time_ms, Some(1_700_000_400_000));
    }

    #[test]
    fn test_force_order_deserialization() {
        let json = r#"{
            "e": "forceOrder",
            "E": 1699999999123,
            "o": {
                "s": "BTCUSDT",
                "S": "SELL",
                "o": "LIMIT",
                "f": "IOC",
                "q": "0.014",
                "p": "67000.00",
                "ap": "67010.00",
                "X": "FILLED",
                "l": "0.014",
                "z": "0.014",
                "T": 1699999999100,
                "L": "67010.00"
            }
        }"#;

        let liq: ForceOrderMessage = serde_json::from_str(json).unwrap();
        assert_eq!(liq.order.side, "SELL");
        assert_eq!(liq.order.last_filled_price, "67010.00");
        assert_eq!(liq.order.order_id, None);
    }

    #[test]
    fn test_kline_deserialization() {
        let json = r#"{
            "e": "kline",
            "E": 1699999999123,
            "s": "BTCUSDT",
            "k": {
                "t": 1699999940000,
                "T": 1699999999999,
                "s": "BTCUSDT",
                "i": "1m",
                "o": "67600.0",
                "c": "67650.0",
                "h": "67660.0",
                "l": "67590.0",
                "v": "12.5",
                "n": 311,
                "x": true,
                "q": "845000.0",
                "V": "7.2",
                "Q": "487000.0"
            }
        }"#;

        let kline: KlineMessage = serde_json::from_str(json).unwrap();
        assert!(kline.kline.is_closed);
        assert_eq!(kline.kline.interval, "1m");
        assert_eq!(kline.kline.taker_buy_base_volume, "7.2");
    }

    #[test]
    fn test_combined_envelope() {
        let json = r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1,"T":1,"s":"BTCUSDT","p":"1","q":"1","m":false}}"#;
        let envelope: CombinedStreamMessage = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.stream, "btcusdt@trade");
        let trade: TradeMessage = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.trade_id, None);
    }
}
