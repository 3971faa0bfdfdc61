pub mod binance;
pub mod gateway;

pub use binance::*;
pub use gateway::*;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{Candle, Symbol, TimeFrame};

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("Exchange request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Exchange returned {status} for {symbol}: {body}")]
    Status {
        symbol: String,
        status: u16,
        body: String,
    },

    #[error("Malformed exchange data: {0}")]
    Decode(String),

    #[error("No market data for {0}")]
    Empty(String),
}

/// Read-only market data used by the dashboard.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Most recent `limit` bars, oldest first.
    async fn candles(
        &self,
        symbol: &Symbol,
        interval: TimeFrame,
        limit: u32,
    ) -> Result<Vec<Candle>, MarketDataError>;

    /// Last traded price.
    async fn last_price(&self, symbol: &Symbol) -> Result<Decimal, MarketDataError>;
}
