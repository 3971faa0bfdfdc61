//! Ledger error types

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid {field}: {value} (must be greater than zero)")]
    InvalidAmount { field: &'static str, value: Decimal },

    #[error("Insufficient funds: requested {requested} USDT, available {available} USDT")]
    InsufficientFunds { requested: Decimal, available: Decimal },

    #[error("Position {0} not found")]
    NotFound(i64),

    #[error("Wallet is not initialized")]
    WalletNotInitialized,

    #[error("Wallet was modified concurrently, nothing was written")]
    Conflict,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt value in column {column}: {reason}")]
    Decode { column: &'static str, reason: String },
}
