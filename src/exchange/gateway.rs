use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{MarketDataError, MarketDataSource};
use crate::types::{Candle, Symbol, TimeFrame};

/// Coin and reference candles fetched together.
#[derive(Debug, Clone)]
pub struct MarketSeries {
    pub series: Vec<Candle>,
    pub reference: Vec<Candle>,
}

impl MarketSeries {
    pub fn last_close(&self) -> Option<Decimal> {
        self.series.last().map(|c| c.close)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    symbol: Symbol,
    reference: Symbol,
    interval: TimeFrame,
    limit: u32,
}

struct CachedSeries {
    fetched_at: Instant,
    data: Arc<MarketSeries>,
}

/// Front for the exchange that keeps candle fetches for a fixed TTL.
pub struct MarketDataGateway {
    source: Arc<dyn MarketDataSource>,
    ttl: Duration,
    cache: RwLock<HashMap<SeriesKey, CachedSeries>>,
}

impl MarketDataGateway {
    pub fn new(source: Arc<dyn MarketDataSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Candles for `symbol` and `reference`, served from cache while fresh.
    /// Failures are returned to the caller and never cached.
    pub async fn fetch_series(
        &self,
        symbol: &Symbol,
        reference: &Symbol,
        interval: TimeFrame,
        limit: u32,
    ) -> Result<Arc<MarketSeries>, MarketDataError> {
        let key = SeriesKey {
            symbol: symbol.clone(),
            reference: reference.clone(),
            interval,
            limit,
        };

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    debug!("Cache hit for {} vs {} {}", symbol, reference, interval);
                    return Ok(Arc::clone(&entry.data));
                }
            }
        }

        let reference_candles = self.source.candles(reference, interval, limit).await?;
        let candles = self.source.candles(symbol, interval, limit).await?;

        if candles.is_empty() {
            return Err(MarketDataError::Empty(symbol.to_string()));
        }
        if reference_candles.is_empty() {
            return Err(MarketDataError::Empty(reference.to_string()));
        }

        info!(
            "Fetched {} {} candles for {} and {} for {}",
            candles.len(),
            interval,
            symbol,
            reference_candles.len(),
            reference
        );

        let data = Arc::new(MarketSeries {
            series: candles,
            reference: reference_candles,
        });

        let mut cache = self.cache.write().await;
        let ttl = self.ttl;
        cache.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
        cache.insert(
            key,
            CachedSeries {
                fetched_at: Instant::now(),
                data: Arc::clone(&data),
            },
        );

        Ok(data)
    }

    /// Close of the newest cached bar for `symbol`.
    pub async fn current_price(
        &self,
        symbol: &Symbol,
        reference: &Symbol,
        interval: TimeFrame,
        limit: u32,
    ) -> Result<Decimal, MarketDataError> {
        self.fetch_series(symbol, reference, interval, limit)
            .await?
            .last_close()
            .ok_or_else(|| MarketDataError::Empty(symbol.to_string()))
    }

    /// Last traded price, always fetched live.
    pub async fn last_price(&self, symbol: &Symbol) -> Result<Decimal, MarketDataError> {
        self.source.last_price(symbol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockMarketDataSource;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn candles(n: usize, close: Decimal) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| Candle {
                open_time: start + ChronoDuration::hours(4 * i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: dec!(1),
            })
            .collect()
    }

    fn eth() -> Symbol {
        Symbol::new("ETH", "USDT")
    }

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    #[tokio::test]
    async fn test_repeated_fetch_within_ttl_hits_cache() {
        let mut source = MockMarketDataSource::new();
        source
            .expect_candles()
            .times(2)
            .returning(|symbol, _, limit| {
                let close = if symbol.base_asset() == "BTC" { dec!(40000) } else { dec!(2000) };
                Ok(candles(limit as usize, close))
            });

        let gateway = MarketDataGateway::new(Arc::new(source), Duration::from_secs(60));

        let first = gateway.fetch_series(&eth(), &btc(), TimeFrame::H4, 100).await.unwrap();
        let second = gateway.fetch_series(&eth(), &btc(), TimeFrame::H4, 100).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.series.len(), 100);
        assert_eq!(first.last_close(), Some(dec!(2000)));
        assert_eq!(first.reference[0].close, dec!(40000));
    }

    #[tokio::test]
    async fn test_different_arguments_are_cached_separately() {
        let mut source = MockMarketDataSource::new();
        source
            .expect_candles()
            .times(4)
            .returning(|_, _, limit| Ok(candles(limit as usize, dec!(1))));

        let gateway = MarketDataGateway::new(Arc::new(source), Duration::from_secs(60));
        gateway.fetch_series(&eth(), &btc(), TimeFrame::H4, 100).await.unwrap();
        gateway.fetch_series(&eth(), &btc(), TimeFrame::H1, 100).await.unwrap();
        gateway.fetch_series(&eth(), &btc(), TimeFrame::H4, 100).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let mut source = MockMarketDataSource::new();
        source
            .expect_candles()
            .times(4)
            .returning(|_, _, limit| Ok(candles(limit as usize, dec!(1))));

        let gateway = MarketDataGateway::new(Arc::new(source), Duration::ZERO);
        gateway.fetch_series(&eth(), &btc(), TimeFrame::H4, 10).await.unwrap();
        gateway.fetch_series(&eth(), &btc(), TimeFrame::H4, 10).await.unwrap();
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let mut source = MockMarketDataSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_candles()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(MarketDataError::Decode("boom".to_string())));
        source
            .expect_candles()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, limit| Ok(candles(limit as usize, dec!(1))));

        let gateway = MarketDataGateway::new(Arc::new(source), Duration::from_secs(60));
        assert!(gateway.fetch_series(&eth(), &btc(), TimeFrame::H4, 10).await.is_err());
        assert!(gateway.fetch_series(&eth(), &btc(), TimeFrame::H4, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_series_is_an_error() {
        let mut source = MockMarketDataSource::new();
        source
            .expect_candles()
            .returning(|symbol, _, limit| {
                if symbol.base_asset() == "ETH" {
                    Ok(Vec::new())
                } else {
                    Ok(candles(limit as usize, dec!(1)))
                }
            });

        let gateway = MarketDataGateway::new(Arc::new(source), Duration::from_secs(60));
        let err = gateway.fetch_series(&eth(), &btc(), TimeFrame::H4, 10).await.unwrap_err();
        assert!(matches!(err, MarketDataError::Empty(s) if s == "ETH/USDT"));
    }

    #[tokio::test]
    async fn test_current_price_uses_cached_series() {
        let mut source = MockMarketDataSource::new();
        source
            .expect_candles()
            .times(2)
            .returning(|symbol, _, limit| {
                let close = if symbol.base_asset() == "BTC" { dec!(40000) } else { dec!(2000) };
                Ok(candles(limit as usize, close))
            });

        let gateway = MarketDataGateway::new(Arc::new(source), Duration::from_secs(60));
        gateway.fetch_series(&eth(), &btc(), TimeFrame::H4, 100).await.unwrap();
        let price = gateway.current_price(&eth(), &btc(), TimeFrame::H4, 100).await.unwrap();
        assert_eq!(price, dec!(2000));
    }

    #[tokio::test]
    async fn test_last_price_is_not_cached() {
        let mut source = MockMarketDataSource::new();
        source
            .expect_last_price()
            .times(2)
            .returning(|_| Ok(dec!(2200)));

        let gateway = MarketDataGateway::new(Arc::new(source), Duration::from_secs(60));
        assert_eq!(gateway.last_price(&eth()).await.unwrap(), dec!(2200));
        assert_eq!(gateway.last_price(&eth()).await.unwrap(), dec!(2200));
    }
}
