use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::{MarketDataError, MarketDataSource};
use crate::types::{Candle, Symbol, TimeFrame};

pub const BINANCE_API: &str = "https://api.binance.com";

/// Public (unsigned) Binance REST endpoints.
#[derive(Debug, Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
}

impl BinanceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MarketDataError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(
        &self,
        symbol: &Symbol,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, MarketDataError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).query(query).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(MarketDataError::Status {
                symbol: symbol.to_string(),
                status,
                body,
            });
        }

        Ok(resp)
    }
}

#[async_trait]
impl MarketDataSource for BinanceClient {
    async fn candles(
        &self,
        symbol: &Symbol,
        interval: TimeFrame,
        limit: u32,
    ) -> Result<Vec<Candle>, MarketDataError> {
        debug!("Fetching {} {} candles for {}", limit, interval, symbol);

        let query = [
            ("symbol", symbol.exchange_symbol()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        let resp: Vec<Vec<serde_json::Value>> =
            self.get(symbol, "/api/v3/klines", &query).await?.json().await?;

        parse_klines(resp)
    }

    async fn last_price(&self, symbol: &Symbol) -> Result<Decimal, MarketDataError> {
        let query = [("symbol", symbol.exchange_symbol())];
        let resp: PriceResponse = self
            .get(symbol, "/api/v3/ticker/price", &query)
            .await?
            .json()
            .await?;

        parse_decimal("price", &resp.price)
    }
}

/// Kline rows are positional arrays: `[open_time, open, high, low, close, volume, ...]`
/// with prices as strings.
pub fn parse_klines(rows: Vec<Vec<serde_json::Value>>) -> Result<Vec<Candle>, MarketDataError> {
    rows.into_iter()
        .map(|k| {
            let open_time = k
                .first()
                .and_then(|v| v.as_i64())
                .ok_or_else(|| MarketDataError::Decode("kline without open time".to_string()))?;
            let field = |idx: usize, name: &str| -> Result<Decimal, MarketDataError> {
                let raw = k
                    .get(idx)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| MarketDataError::Decode(format!("kline without {}", name)))?;
                parse_decimal(name, raw)
            };

            Ok(Candle {
                open_time: Utc
                    .timestamp_millis_opt(open_time)
                    .single()
                    .ok_or_else(|| MarketDataError::Decode(format!("bad open time {}", open_time)))?,
                open: field(1, "open")?,
                high: field(2, "high")?,
                low: field(3, "low")?,
                close: field(4, "close")?,
                volume: field(5, "volume")?,
            })
        })
        .collect()
}

fn parse_decimal(name: &str, raw: &str) -> Result<Decimal, MarketDataError> {
    Decimal::from_str(raw).map_err(|e| MarketDataError::Decode(format!("{} '{}': {}", name, raw, e)))
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_klines() {
        let rows = vec![
            vec![
                json!(1_700_000_000_000i64),
                json!("2000.10"),
                json!("2010.00"),
                json!("1990.50"),
                json!("2005.25"),
                json!("1234.5"),
                json!(1_700_014_399_999i64),
                json!("2470000.0"),
                json!(4321),
            ],
        ];

        let candles = parse_klines(rows).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].open_time.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(candles[0].close, dec!(2005.25));
        assert_eq!(candles[0].range(), dec!(19.50));
        assert_eq!(candles[0].volume, dec!(1234.5));
    }

    #[test]
    fn test_parse_klines_rejects_garbage() {
        let missing_close = vec![vec![json!(1), json!("1"), json!("1"), json!("1")]];
        assert!(matches!(parse_klines(missing_close), Err(MarketDataError::Decode(_))));

        let bad_number = vec![vec![
            json!(1),
            json!("1"),
            json!("1"),
            json!("1"),
            json!("abc"),
            json!("1"),
        ]];
        assert!(matches!(parse_klines(bad_number), Err(MarketDataError::Decode(_))));
    }

    #[test]
    fn test_client_trims_base_url() {
        let client = BinanceClient::new("https://api.binance.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, BINANCE_API);
    }
}
