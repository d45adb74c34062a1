//! Binance USDT-margined futures integration.
//!
//! Wire types for the public websocket streams, the REST client used for
//! order-book bootstrap/resync and the periodic pollers, and stream-name
//! construction for multiplexed connections.

pub mod client;
pub mod streams;
pub mod types;

pub use client::FuturesRestClient;
