//! Stream names and websocket URLs for the futures market-data endpoints.

/// Websocket base URL for USDT-margined perpetual futures.
pub const FUTURES_WS_URL: &str = "wss://fstream.binance.com";

/// REST base URL for USDT-margined perpetual futures.
pub const FUTURES_REST_URL: &str = "https://fapi.binance.com";

pub fn depth_diff_stream(symbol: &str) -> String {
    format!("{}@depth@100ms", symbol.to_lowercase())
}

pub fn trade_stream(symbol: &str) -> String {
    format!("{}@trade", symbol.to_lowercase())
}

pub fn mark_price_stream(symbol: &str) -> String {
    format!("{}@markPrice@1s", symbol.to_lowercase())
}

pub fn force_order_stream(symbol: &str) -> String {
    format!("{}@forceOrder", symbol.to_lowercase())
}

pub fn kline_stream(symbol: &str, interval: &str) -> String {
    format!("{}@kline_{}", symbol.to_lowercase(), interval)
}

/// All-market best bid/ask stream used as the global L1 fallback.
pub fn all_book_ticker_url() -> String {
    format!("{}/ws/!bookTicker", FUTURES_WS_URL)
}

/// Multiplexed URL carrying every stream of a shard on one connection.
pub fn combined_url(streams: &[String]) -> String {
    format!("{}/stream?streams={}", FUTURES_WS_URL, streams.join("/"))
}

/// Logical kind of a stream, recovered from the combined-envelope name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    DepthDiff,
    Trade,
    MarkPrice,
    ForceOrder,
    Kline,
}

/// Classify a combined-stream name (`btcusdt@depth@100ms`) back into the
/// handler it belongs to.
pub fn classify(stream: &str) -> Option<StreamKind> {
    let suffix = stream.split_once('@').map(|(_, rest)| rest)?;
    if suffix.starts_with("depth") {
        Some(StreamKind::DepthDiff)
    } else if suffix == "trade" {
        Some(StreamKind::Trade)
    } else if suffix.starts_with("markPrice") {
        Some(StreamKind::MarkPrice)
    } else if suffix == "forceOrder" {
        Some(StreamKind::ForceOrder)
    } else if suffix.starts_with("kline_") {
        Some(StreamKind::Kline)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_names_lowercase_symbol() {
        assert_eq!(depth_diff_stream("BTCUSDT"), "btcusdt@depth@100ms");
        assert_eq!(trade_stream("ETHUSDT"), "ethusdt@trade");
        assert_eq!(mark_price_stream("BTCUSDT"), "btcusdt@markPrice@1s");
        assert_eq!(kline_stream("BTCUSDT", "1m"), "btcusdt@kline_1m");
    }

    #[test]
    fn test_combined_url_joins_streams() {
        let url = combined_url(&["btcusdt@trade".to_string(), "ethusdt@trade".to_string()]);
        assert_eq!(
            url,
            "wss://fstream.binance.com/stream?streams=btcusdt@trade/ethusdt@trade"
        );
    }

    #[test]
    fn test_classify_round_trip() {
        assert_eq!(classify(&depth_diff_stream("BTCUSDT")), Some(StreamKind::DepthDiff));
        assert_eq!(classify(&trade_stream("BTCUSDT")), Some(StreamKind::Trade));
        assert_eq!(classify(&mark_price_stream("BTCUSDT")), Some(StreamKind::MarkPrice));
        assert_eq!(classify(&force_order_stream("BTCUSDT")), Some(StreamKind::ForceOrder));
        assert_eq!(classify(&kline_stream("BTCUSDT", "5m")), Some(StreamKind::Kline));
        assert_eq!(classify("btcusdt@bookTicker"), None);
        assert_eq!(classify("garbage"), None);
    }
}
