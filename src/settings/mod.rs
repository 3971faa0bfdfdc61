use ::config::{Config, ConfigBuilder, Environment, File};
use ::config::builder::DefaultState;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::exchange::BINANCE_API;
use crate::ml::MIN_ALIGNED_ROWS;
use crate::types::{Symbol, TimeFrame};

pub const ENV_PREFIX: &str = "PAPER_TRADER";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Binance caps a kline request at 1000 bars.
const MAX_CANDLE_LIMIT: u32 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No database URL: set [database].url or DATABASE_URL")]
    MissingDatabaseUrl,

    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub market: MarketSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub dashboard: DashboardSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub initial_balance: Decimal,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            initial_balance: dec!(10000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketSettings {
    pub base_url: String,
    pub reference: Symbol,
    pub interval: TimeFrame,
    pub candle_limit: u32,
    pub cache_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub watchlist: Vec<Symbol>,
}

impl Default for MarketSettings {
    fn default() -> Self {
        let watchlist = ["ETH", "BNB", "SOL", "XRP", "DOGE", "ADA", "AVAX", "SHIB", "DOT", "MATIC"]
            .iter()
            .map(|base| Symbol::new(base, "USDT"))
            .collect();

        Self {
            base_url: BINANCE_API.to_string(),
            reference: Symbol::new("BTC", "USDT"),
            interval: TimeFrame::H4,
            candle_limit: 100,
            cache_ttl_secs: 60,
            request_timeout_secs: 10,
            watchlist,
        }
    }
}

impl MarketSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub model_path: PathBuf,
    pub config_path: PathBuf,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("data/trading_model.json"),
            config_path: PathBuf::from("data/model_config.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardSettings {
    pub port: u16,
    pub min_investment: Decimal,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            port: 3000,
            min_investment: dec!(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl AppConfig {
    /// Optional TOML file, then `PAPER_TRADER__SECTION__KEY` variables, then
    /// `DATABASE_URL`. A `.env` file is read first if present.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", env_file.display());
        }

        let builder = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("market.watchlist"),
            );

        Self::from_builder(builder, std::env::var(DATABASE_URL_ENV).ok())
    }

    fn from_builder(
        builder: ConfigBuilder<DefaultState>,
        env_database_url: Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config: AppConfig = builder.build()?.try_deserialize()?;
        let url = resolve_database_url(config.database.url.take(), env_database_url)?;
        config.database.url = Some(url);
        config.validate()?;
        Ok(config)
    }

    /// Resolved connection string. Only `None` for configs that never went
    /// through [`AppConfig::load`].
    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database.url.as_deref().ok_or(ConfigError::MissingDatabaseUrl)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.database.initial_balance <= Decimal::ZERO {
            errors.push("database.initial_balance must be > 0".to_string());
        }
        if self.market.base_url.trim().is_empty() {
            errors.push("market.base_url must not be empty".to_string());
        }
        let min_limit = MIN_ALIGNED_ROWS as u32;
        if self.market.candle_limit < min_limit || self.market.candle_limit > MAX_CANDLE_LIMIT {
            errors.push(format!(
                "market.candle_limit must be between {} and {}",
                min_limit, MAX_CANDLE_LIMIT
            ));
        }
        if self.market.request_timeout_secs == 0 {
            errors.push("market.request_timeout_secs must be > 0".to_string());
        }
        if self.market.watchlist.is_empty() {
            errors.push("market.watchlist must not be empty".to_string());
        }
        if self.dashboard.min_investment <= Decimal::ZERO {
            errors.push("dashboard.min_investment must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

/// `DATABASE_URL` wins over the file; blank values count as unset.
pub fn resolve_database_url(
    from_file: Option<String>,
    from_env: Option<String>,
) -> Result<String, ConfigError> {
    let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    present(from_env)
        .or_else(|| present(from_file))
        .ok_or(ConfigError::MissingDatabaseUrl)
}
