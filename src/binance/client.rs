//! Futures REST client.
//!
//! One shared `reqwest::Client` serves order-book bootstrap/resync and the
//! periodic open-interest and position-ratio pollers. Transient failures and
//! HTTP 429 retry with exponential backoff capped at 3 seconds.

use crate::binance::streams::FUTURES_REST_URL;
use crate::binance::types::{
    DepthSnapshotResponse, ExchangeInfoResponse, LongShortRatioEntry, OpenInterestResponse,
};
use crate::error::{FeedError, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Overall request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// TCP/TLS connect deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Retry backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct FuturesRestClient {
    client: Client,
    base_url: String,
    retry_max: u32,
}

impl std::fmt::Debug for FuturesRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesRestClient")
            .field("base_url", &self.base_url)
            .field("retry_max", &self.retry_max)
            .finish()
    }
}

impl FuturesRestClient {
    pub fn new(retry_max: u32) -> Result<Self> {
        Self::with_base_url(FUTURES_REST_URL.to_string(), retry_max)
    }

    pub fn with_base_url(base_url: String, retry_max: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("marketfeed/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FeedError::Config(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            retry_max,
        })
    }

    /// Order-book snapshot used for bootstrap and gap resync.
    pub async fn depth(&self, symbol: &str, limit: u32) -> Result<DepthSnapshotResponse> {
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.base_url, symbol, limit
        );
        self.get_with_retry(&url).await
    }

    /// Current open interest for one symbol.
    pub async fn open_interest(&self, symbol: &str) -> Result<OpenInterestResponse> {
        let url = format!("{}/fapi/v1/openInterest?symbol={}", self.base_url, symbol);
        self.get_once(&url).await
    }

    /// Latest 5-minute top trader long/short position ratio for one symbol.
    pub async fn top_long_short_ratio(&self, symbol: &str) -> Result<Option<LongShortRatioEntry>> {
        let url = format!(
            "{}/futures/data/topLongShortPositionRatio?symbol={}&period=5m&limit=1",
            self.base_url, symbol
        );
        let entries: Vec<LongShortRatioEntry> = self.get_once(&url).await?;
        Ok(entries.into_iter().next())
    }

    /// Symbol universe: TRADING perpetual contracts quoted in USDT.
    pub async fn perpetual_symbols(&self) -> Result<Vec<String>> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let info: ExchangeInfoResponse = self.get_with_retry(&url).await?;
        let symbols: Vec<String> = info
            .symbols
            .into_iter()
            .filter(|s| s.status == "TRADING")
            .filter(|s| s.contract_type.as_deref() == Some("PERPETUAL"))
            .filter(|s| s.quote_asset == "USDT")
            .map(|s| s.symbol)
            .collect();
        if symbols.is_empty() {
            return Err(FeedError::Validation(
                "exchangeInfo returned no tradable perpetual symbols".to_string(),
            ));
        }
        Ok(symbols)
    }

    /// Single-shot GET without retry; periodic pollers simply skip a tick on
    /// failure instead of piling retries onto a limited IP budget.
    async fn get_once<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(FeedError::RateLimit("HTTP 429 from upstream".to_string()));
        }
        if !status.is_success() {
            return Err(FeedError::from(response.error_for_status().unwrap_err()));
        }
        Ok(response.json::<T>().await?)
    }

    /// GET with exponential backoff on 429 and transient errors.
    async fn get_with_retry<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match self.get_once(url).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.retry_max => {
                    let backoff = Duration::from_millis(250 * (1 << attempt)).min(MAX_BACKOFF);
                    warn!(
                        url = %url,
                        attempt = attempt + 1,
                        max = self.retry_max,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "REST request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(url = %url, error = %err, "REST request failed");
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_construction() {
        let client = FuturesRestClient::new(3).unwrap();
        assert_eq!(client.base_url, FUTURES_REST_URL);
        assert_eq!(client.retry_max, 3);
    }

    #[test]
    fn test_custom_base_url() {
        let client =
            FuturesRestClient::with_base_url("http://localhost:9999".to_string(), 1).unwrap();
        assert_eq!(client.base_url, "http://localhost:9999");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        // Discard port on loopback; the connect is refused immediately.
        let client =
            FuturesRestClient::with_base_url("http://127.0.0.1:9".to_string(), 0).unwrap();
        let err = client.open_interest("BTCUSDT").await.unwrap_err();
        assert!(err.is_retryable(), "expected transient error, got {err:?}");
    }
}
