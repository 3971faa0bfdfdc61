use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::database::{Ledger, LedgerError};
use crate::exchange::MarketDataGateway;
use crate::ml::{build_features, SignalModel, SignalReading};
use crate::settings::AppConfig;
use crate::types::{LedgerSummary, Position, Symbol, TimeFrame};

/// The wallet holds USDT only.
pub const QUOTE_ASSET: &str = "USDT";

/// Market parameters and limits the dashboard trades with.
#[derive(Debug, Clone)]
pub struct DashboardOptions {
    pub reference: Symbol,
    pub interval: TimeFrame,
    pub candle_limit: u32,
    pub min_investment: Decimal,
    pub watchlist: Vec<Symbol>,
}

impl From<&AppConfig> for DashboardOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            reference: config.market.reference.clone(),
            interval: config.market.interval,
            candle_limit: config.market.candle_limit,
            min_investment: config.dashboard.min_investment,
            watchlist: config.market.watchlist.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenPositionView {
    #[serde(flatten)]
    pub position: Position,
    pub current_price: Decimal,
    /// False when the live price could not be fetched and the entry price is shown.
    pub price_available: bool,
    pub unrealized_pnl_pct: Decimal,
    pub entry_value: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub balance: Decimal,
    pub initial_balance: Decimal,
    pub open_value_at_entry: Decimal,
    pub total_at_entry: Decimal,
    pub positions: Vec<OpenPositionView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignalStatus {
    Ready(SignalReading),
    InsufficientData,
    Disabled,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub symbol: Symbol,
    pub current_price: Option<Decimal>,
    pub market_error: Option<String>,
    pub signal: SignalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    NotFound,
    AlreadyClosed,
    Rejected,
    MarketUnavailable,
}

/// Result of a user action, with a message fit for display.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub message: String,
    pub position: Option<Position>,
}

impl Outcome {
    fn new(status: OutcomeStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            position: None,
        }
    }

    fn completed(message: impl Into<String>, position: Position) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            message: message.into(),
            position: Some(position),
        }
    }

    #[cfg(test)]
    pub fn is_completed(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchlistPrice {
    pub symbol: Symbol,
    pub price: Option<Decimal>,
    pub error: Option<String>,
}

/// Ledger, market data and signal model behind every user interaction.
///
/// Market and model failures are turned into messages; only ledger failures
/// come back as errors.
pub struct Dashboard {
    ledger: Ledger,
    market: MarketDataGateway,
    signal: Option<SignalModel>,
    options: DashboardOptions,
}

impl Dashboard {
    pub fn new(
        ledger: Ledger,
        market: MarketDataGateway,
        signal: Option<SignalModel>,
        options: DashboardOptions,
    ) -> Self {
        if signal.is_none() {
            warn!("Signal model not loaded, analysis will only show prices");
        }
        Self {
            ledger,
            market,
            signal,
            options,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn watchlist(&self) -> &[Symbol] {
        &self.options.watchlist
    }

    pub fn min_investment(&self) -> Decimal {
        self.options.min_investment
    }

    pub async fn summary(&self) -> Result<LedgerSummary, LedgerError> {
        self.ledger.summary().await
    }

    /// Wallet plus open positions marked at the last traded price.
    pub async fn overview(&self) -> Result<Overview, LedgerError> {
        let summary = self.ledger.summary().await?;
        let open = self.ledger.list_positions(true).await?;

        let mut positions = Vec::with_capacity(open.len());
        for position in open {
            positions.push(self.mark(position).await);
        }

        Ok(Overview {
            balance: summary.balance,
            initial_balance: summary.initial_balance,
            open_value_at_entry: summary.open_value_at_entry,
            total_at_entry: summary.total_at_entry(),
            positions,
        })
    }

    async fn mark(&self, position: Position) -> OpenPositionView {
        let (current_price, price_available) = match self.market.last_price(&position.symbol).await {
            Ok(price) => (price, true),
            Err(e) => {
                warn!("No live price for {}: {}", position.symbol, e);
                (position.entry_price, false)
            }
        };

        OpenPositionView {
            current_price,
            price_available,
            unrealized_pnl_pct: position.pnl_pct_at(current_price),
            entry_value: position.entry_value(),
            position,
        }
    }

    pub async fn closed_positions(&self) -> Result<Vec<Position>, LedgerError> {
        self.ledger.list_positions(false).await
    }

    pub async fn position(&self, id: i64) -> Result<Option<Position>, LedgerError> {
        match self.ledger.get_position(id).await {
            Ok(position) => Ok(Some(position)),
            Err(LedgerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Current price and model reading for `symbol`. Never fails.
    pub async fn analyze(&self, symbol: &Symbol) -> Analysis {
        let series = match self
            .market
            .fetch_series(symbol, &self.options.reference, self.options.interval, self.options.candle_limit)
            .await
        {
            Ok(series) => series,
            Err(e) => {
                warn!("Market data unavailable for {}: {}", symbol, e);
                return Analysis {
                    symbol: symbol.clone(),
                    current_price: None,
                    market_error: Some(e.to_string()),
                    signal: SignalStatus::Failed {
                        reason: "market data unavailable".to_string(),
                    },
                };
            }
        };

        let signal = match &self.signal {
            None => SignalStatus::Disabled,
            Some(model) => match build_features(&series.series, &series.reference, model.features()) {
                Ok(None) => SignalStatus::InsufficientData,
                Ok(Some(table)) => {
                    debug!("{} complete feature rows for {}", table.len(), symbol);
                    match model.evaluate(&table) {
                        Ok(reading) => SignalStatus::Ready(reading),
                        Err(e) => {
                            warn!("Signal evaluation failed for {}: {}", symbol, e);
                            SignalStatus::Failed { reason: e.to_string() }
                        }
                    }
                }
                Err(e) => SignalStatus::Failed { reason: e.to_string() },
            },
        };

        Analysis {
            symbol: symbol.clone(),
            current_price: series.last_close(),
            market_error: None,
            signal,
        }
    }

    /// Buy `symbol` for `invest_usdt` at the latest close.
    pub async fn open_position(&self, symbol: &Symbol, invest_usdt: Decimal) -> Result<Outcome, LedgerError> {
        if symbol.quote_asset() != QUOTE_ASSET {
            return Ok(Outcome::new(
                OutcomeStatus::Rejected,
                format!("Only {} pairs can be traded, got {}", QUOTE_ASSET, symbol),
            ));
        }
        if invest_usdt < self.options.min_investment {
            return Ok(Outcome::new(
                OutcomeStatus::Rejected,
                format!("Minimum investment is {} USDT", self.options.min_investment),
            ));
        }

        let balance = self.ledger.get_balance().await?;
        if invest_usdt > balance {
            return Ok(insufficient(invest_usdt, balance));
        }

        let price = match self
            .market
            .current_price(symbol, &self.options.reference, self.options.interval, self.options.candle_limit)
            .await
        {
            Ok(price) => price,
            Err(e) => {
                warn!("Cannot open {}: {}", symbol, e);
                return Ok(Outcome::new(
                    OutcomeStatus::MarketUnavailable,
                    format!("Could not fetch a price for {}: {}", symbol, e),
                ));
            }
        };

        match self.ledger.open_position(symbol, invest_usdt, price).await {
            Ok(position) => Ok(Outcome::completed(
                format!(
                    "Opened {} {} at {} for {} USDT",
                    position.amount, symbol, position.entry_price, invest_usdt
                ),
                position,
            )),
            Err(LedgerError::InsufficientFunds { requested, available }) => {
                Ok(insufficient(requested, available))
            }
            Err(e @ LedgerError::InvalidAmount { .. }) => {
                Ok(Outcome::new(OutcomeStatus::Rejected, e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Sell position `id` at the live price. The position stays open if no
    /// price can be fetched.
    pub async fn close_position(&self, id: i64) -> Result<Outcome, LedgerError> {
        let position = match self.ledger.get_position(id).await {
            Ok(position) => position,
            Err(LedgerError::NotFound(_)) => {
                return Ok(Outcome::new(
                    OutcomeStatus::NotFound,
                    format!("Position #{} does not exist", id),
                ))
            }
            Err(e) => return Err(e),
        };
        if !position.is_open {
            return Ok(already_closed(id));
        }

        let price = match self.market.last_price(&position.symbol).await {
            Ok(price) => price,
            Err(e) => {
                warn!("Cannot close #{}: {}", id, e);
                return Ok(Outcome::new(
                    OutcomeStatus::MarketUnavailable,
                    format!(
                        "Could not fetch a price for {}, position #{} left open: {}",
                        position.symbol, id, e
                    ),
                ));
            }
        };

        match self.ledger.close_position(id, price).await? {
            Some(closed) => {
                let pnl = closed.pnl_pct.unwrap_or_default() * Decimal::from(100);
                info!("Closed #{} via dashboard", id);
                Ok(Outcome::completed(
                    format!("Closed {} at {} ({:+.2}%)", closed.symbol, price, pnl),
                    closed,
                ))
            }
            None => Ok(already_closed(id)),
        }
    }

    /// Live prices for the watchlist; failures are reported per symbol.
    pub async fn watchlist_prices(&self) -> Vec<WatchlistPrice> {
        let mut prices = Vec::with_capacity(self.options.watchlist.len());
        for symbol in &self.options.watchlist {
            let entry = match self.market.last_price(symbol).await {
                Ok(price) => WatchlistPrice { symbol: symbol.clone(), price: Some(price), error: None },
                Err(e) => WatchlistPrice { symbol: symbol.clone(), price: None, error: Some(e.to_string()) },
            };
            prices.push(entry);
        }
        prices
    }
}

fn insufficient(requested: Decimal, available: Decimal) -> Outcome {
    Outcome::new(
        OutcomeStatus::Rejected,
        format!(
            "Insufficient balance: {} USDT requested, {} USDT available",
            requested, available
        ),
    )
}

fn already_closed(id: i64) -> Outcome {
    Outcome::new(
        OutcomeStatus::AlreadyClosed,
        format!("Position #{} is already closed", id),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exchange::{MarketDataError, MockMarketDataSource};
    use crate::ml::model::MockClassifier;
    use crate::ml::signal::{ModelConfig, SignalLabel};
    use crate::types::Candle;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) fn candles(n: usize, close: Decimal) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                // Small wobble keeps returns non-constant
                let close = close + Decimal::from((i * 7 % 5) as i64) / dec!(100);
                Candle {
                    open_time: start + ChronoDuration::hours(4 * i as i64),
                    open: close,
                    high: close + dec!(1),
                    low: close - dec!(1),
                    close,
                    volume: dec!(10),
                }
            })
            .collect()
    }

    /// ETH closes at 2000.03 (wobble of the last bar), BTC at 40000.03, live price 2200.
    pub(crate) fn market() -> MockMarketDataSource {
        let mut source = MockMarketDataSource::new();
        source.expect_candles().returning(|symbol, _, limit| {
            let base = if symbol.base_asset() == "BTC" { dec!(40000) } else { dec!(2000) };
            Ok(candles(limit as usize, base))
        });
        source.expect_last_price().returning(|_| Ok(dec!(2200)));
        source
    }

    pub(crate) fn options() -> DashboardOptions {
        let config = AppConfig::default();
        DashboardOptions::from(&config)
    }

    pub(crate) fn signal(probability: f64) -> SignalModel {
        let mut classifier = MockClassifier::new();
        classifier.expect_num_features().return_const(2usize);
        classifier.expect_predict_proba().returning(move |_| Ok(probability));
        let config = ModelConfig {
            features: vec!["relative_strength".to_string(), "return_1".to_string()],
            chosen_threshold: 0.6,
        };
        SignalModel::new(Box::new(classifier), config).unwrap()
    }

    pub(crate) async fn dashboard(source: MockMarketDataSource, signal: Option<SignalModel>) -> Dashboard {
        let ledger = Ledger::in_memory(dec!(10000)).await.unwrap();
        let gateway = MarketDataGateway::new(Arc::new(source), Duration::from_secs(60));
        Dashboard::new(ledger, gateway, signal, options())
    }

    fn eth() -> Symbol {
        Symbol::new("ETH", "USDT")
    }

    #[tokio::test]
    async fn test_open_and_close_round_trip() {
        let dash = dashboard(market(), None).await;

        let opened = dash.open_position(&eth(), dec!(100)).await.unwrap();
        assert!(opened.is_completed(), "{}", opened.message);
        let position = opened.position.unwrap();
        assert_eq!(position.entry_price, dec!(2000.03));
        assert_eq!(dash.ledger().get_balance().await.unwrap(), dec!(9900));

        let overview = dash.overview().await.unwrap();
        assert_eq!(overview.positions.len(), 1);
        assert!(overview.positions[0].price_available);
        assert_eq!(overview.positions[0].current_price, dec!(2200));
        assert_eq!(overview.total_at_entry, dec!(9900) + position.entry_value());

        let closed = dash.close_position(position.id).await.unwrap();
        assert!(closed.is_completed(), "{}", closed.message);
        assert!(closed.message.contains("ETH/USDT"));
        assert!(dash.ledger().get_balance().await.unwrap() > dec!(10009));
        assert_eq!(dash.closed_positions().await.unwrap().len(), 1);

        let again = dash.close_position(position.id).await.unwrap();
        assert_eq!(again.status, OutcomeStatus::AlreadyClosed);
    }

    #[tokio::test]
    async fn test_open_rejects_small_and_unaffordable_investments() {
        let dash = dashboard(market(), None).await;

        let small = dash.open_position(&eth(), dec!(9.99)).await.unwrap();
        assert_eq!(small.status, OutcomeStatus::Rejected);
        assert!(small.message.contains("Minimum"));

        let btc_eth = dash.open_position(&Symbol::new("ETH", "BTC"), dec!(100)).await.unwrap();
        assert_eq!(btc_eth.status, OutcomeStatus::Rejected);

        let large = dash.open_position(&eth(), dec!(10000.01)).await.unwrap();
        assert_eq!(large.status, OutcomeStatus::Rejected);
        assert!(large.message.contains("Insufficient balance"));

        assert_eq!(dash.ledger().get_balance().await.unwrap(), dec!(10000));
        assert!(dash.ledger().list_positions(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_without_market_data_changes_nothing() {
        let mut source = MockMarketDataSource::new();
        source
            .expect_candles()
            .returning(|_, _, _| Err(MarketDataError::Decode("down".to_string())));
        let dash = dashboard(source, None).await;

        let outcome = dash.open_position(&eth(), dec!(100)).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::MarketUnavailable);
        assert_eq!(dash.ledger().get_balance().await.unwrap(), dec!(10000));
    }

    #[tokio::test]
    async fn test_close_keeps_position_open_when_price_fails() {
        let mut source = MockMarketDataSource::new();
        source
            .expect_candles()
            .returning(|_, _, limit| Ok(candles(limit as usize, dec!(2000))));
        source
            .expect_last_price()
            .returning(|_| Err(MarketDataError::Decode("down".to_string())));
        let dash = dashboard(source, None).await;

        let id = dash.open_position(&eth(), dec!(100)).await.unwrap().position.unwrap().id;
        let outcome = dash.close_position(id).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::MarketUnavailable);
        assert!(dash.ledger().get_position(id).await.unwrap().is_open);

        // The overview falls back to the entry price
        let overview = dash.overview().await.unwrap();
        assert!(!overview.positions[0].price_available);
        assert_eq!(overview.positions[0].unrealized_pnl_pct, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_close_unknown_position() {
        let dash = dashboard(market(), None).await;
        let outcome = dash.close_position(404).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::NotFound);
        assert!(dash.position(404).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_analyze_reports_signal() {
        let dash = dashboard(market(), Some(signal(0.75))).await;
        let analysis = dash.analyze(&eth()).await;

        assert_eq!(analysis.current_price, Some(dec!(2000.03)));
        match analysis.signal {
            SignalStatus::Ready(reading) => {
                assert_eq!(reading.label, SignalLabel::Buy);
                assert_eq!(reading.probability, 0.75);
            }
            other => panic!("expected a reading, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_analyze_without_model_or_history() {
        let dash = dashboard(market(), None).await;
        assert!(matches!(dash.analyze(&eth()).await.signal, SignalStatus::Disabled));

        let mut source = MockMarketDataSource::new();
        source
            .expect_candles()
            .returning(|_, _, _| Ok(candles(10, dec!(5))));
        let dash = dashboard(source, Some(signal(0.9))).await;
        let analysis = dash.analyze(&eth()).await;
        assert!(matches!(analysis.signal, SignalStatus::InsufficientData));
        assert!(analysis.current_price.is_some());
    }

    #[tokio::test]
    async fn test_analyze_market_failure_is_reported() {
        let mut source = MockMarketDataSource::new();
        source
            .expect_candles()
            .returning(|_, _, _| Err(MarketDataError::Empty("ETH/USDT".to_string())));
        let dash = dashboard(source, Some(signal(0.9))).await;

        let analysis = dash.analyze(&eth()).await;
        assert!(analysis.current_price.is_none());
        assert!(analysis.market_error.unwrap().contains("ETH/USDT"));
    }

    #[tokio::test]
    async fn test_watchlist_prices() {
        let dash = dashboard(market(), None).await;
        assert_eq!(dash.watchlist().len(), 10);

        let prices = dash.watchlist_prices().await;
        assert_eq!(prices.len(), 10);
        assert!(prices.iter().all(|p| p.price == Some(dec!(2200))));
    }
}
