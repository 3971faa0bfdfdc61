pub mod error;

pub use error::{LedgerError, Result};

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::types::{
    amount_for, LedgerSummary, Position, Symbol, BALANCE_DP, PNL_DP,
};

const WALLET_ID: i64 = 1;

const POSITION_COLUMNS: &str =
    "id, symbol, amount, entry_price, is_open, open_date, close_date, close_price, pnl_pct";

/// Wallet and position ledger backed by a SQLite pool.
///
/// Every balance-affecting operation runs inside one transaction and writes the
/// wallet with a compare-and-swap on the balance it read, so two sessions can
/// never spend the same funds or close the same position twice.
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open the pool and make sure the schema and wallet exist
    pub async fn connect(database_url: &str, initial_balance: Decimal) -> Result<Self> {
        info!("Opening ledger database at: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.initialize(initial_balance).await?;

        info!("Ledger initialized successfully");
        Ok(ledger)
    }

    /// In-memory ledger (for testing)
    #[cfg(test)]
    pub async fn in_memory(initial_balance: Decimal) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let ledger = Self { pool };
        ledger.initialize(initial_balance).await?;
        Ok(ledger)
    }

    /// Create the tables and seed the wallet. Safe to call any number of times;
    /// an existing wallet keeps its balance.
    pub async fn initialize(&self, initial_balance: Decimal) -> Result<()> {
        if initial_balance.is_sign_negative() {
            return Err(LedgerError::InvalidAmount {
                field: "initial_balance",
                value: initial_balance,
            });
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                usdt_balance TEXT NOT NULL,
                initial_balance TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                amount TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                is_open INTEGER NOT NULL DEFAULT 1,
                open_date TEXT NOT NULL,
                close_date TEXT,
                close_price TEXT,
                pnl_pct TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_positions_open ON positions(is_open, open_date)
            "#,
        )
        .execute(&self.pool)
        .await?;

        let balance = initial_balance.round_dp(BALANCE_DP).to_string();
        let seeded = sqlx::query(
            r#"
            INSERT INTO wallet (id, usdt_balance, initial_balance, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(WALLET_ID)
        .bind(&balance)
        .bind(&balance)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        if seeded.rows_affected() == 1 {
            info!("Wallet created with {} USDT", balance);
        } else {
            debug!("Wallet already present, keeping existing balance");
        }

        Ok(())
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get_balance(&self) -> Result<Decimal> {
        let mut conn = self.pool.acquire().await?;
        let (balance, _) = read_wallet(&mut conn).await?;
        Ok(balance)
    }

    /// Positions with the given open flag, newest first
    pub async fn list_positions(&self, open: bool) -> Result<Vec<Position>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM positions WHERE is_open = ? ORDER BY open_date DESC, id DESC",
            POSITION_COLUMNS
        ))
        .bind(if open { 1 } else { 0 })
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(position_from_row).collect()
    }

    pub async fn get_position(&self, id: i64) -> Result<Position> {
        let row = sqlx::query(&format!("SELECT {} FROM positions WHERE id = ?", POSITION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => position_from_row(&row),
            None => Err(LedgerError::NotFound(id)),
        }
    }

    /// Spend `invest_usdt` on `symbol` at `price`.
    ///
    /// The funds check and the debit happen in the same transaction as the
    /// position insert; an insufficient balance is rejected before any write.
    pub async fn open_position(
        &self,
        symbol: &Symbol,
        invest_usdt: Decimal,
        price: Decimal,
    ) -> Result<Position> {
        let invest_usdt = positive("invest_usdt", invest_usdt.round_dp(BALANCE_DP))?;
        let entry_price = positive("price", price.normalize())?;

        let amount = amount_for(invest_usdt, entry_price);
        if amount.is_zero() {
            return Err(LedgerError::InvalidAmount { field: "amount", value: amount });
        }

        let mut tx = self.pool.begin().await?;

        let (balance, stored) = read_wallet(&mut tx).await?;
        if invest_usdt > balance {
            return Err(LedgerError::InsufficientFunds {
                requested: invest_usdt,
                available: balance,
            });
        }
        write_wallet(&mut tx, &stored, balance - invest_usdt).await?;

        let open_date = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO positions (symbol, amount, entry_price, is_open, open_date)
            VALUES (?, ?, ?, 1, ?)
            "#,
        )
        .bind(symbol.to_string())
        .bind(amount.to_string())
        .bind(entry_price.to_string())
        .bind(timestamp(open_date))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let position = Position {
            id: inserted.last_insert_rowid(),
            symbol: symbol.clone(),
            amount,
            entry_price,
            is_open: true,
            open_date,
            close_date: None,
            close_price: None,
            pnl_pct: None,
        };

        info!(
            "Opened position #{}: {} {} @ {} ({} USDT)",
            position.id, amount, symbol, entry_price, invest_usdt
        );
        Ok(position)
    }

    /// Close an open position at `price` and credit the proceeds.
    ///
    /// Unknown or already-closed ids are a no-op and return `None`.
    pub async fn close_position(&self, id: i64, price: Decimal) -> Result<Option<Position>> {
        let close_price = positive("price", price.normalize())?;

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!("SELECT {} FROM positions WHERE id = ?", POSITION_COLUMNS))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            debug!("Close ignored: position #{} does not exist", id);
            return Ok(None);
        };

        let mut position = position_from_row(&row)?;
        if !position.is_open {
            debug!("Close ignored: position #{} is already closed", id);
            return Ok(None);
        }

        let return_usdt = position.value_at(close_price).round_dp(BALANCE_DP);
        let pnl_pct = position.pnl_pct_at(close_price).round_dp(PNL_DP);
        let close_date = Utc::now();

        let marked = sqlx::query(
            r#"
            UPDATE positions
            SET is_open = 0, close_date = ?, close_price = ?, pnl_pct = ?
            WHERE id = ? AND is_open = 1
            "#,
        )
        .bind(timestamp(close_date))
        .bind(close_price.to_string())
        .bind(pnl_pct.to_string())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if marked.rows_affected() == 0 {
            warn!("Position #{} was closed by another session", id);
            return Ok(None);
        }

        let (balance, stored) = read_wallet(&mut tx).await?;
        write_wallet(&mut tx, &stored, balance + return_usdt).await?;

        tx.commit().await?;

        position.is_open = false;
        position.close_date = Some(close_date);
        position.close_price = Some(close_price);
        position.pnl_pct = Some(pnl_pct);

        info!(
            "Closed position #{} {} @ {}: returned {} USDT, pnl {}%",
            id,
            position.symbol,
            close_price,
            return_usdt,
            pnl_pct * Decimal::from(100)
        );
        Ok(Some(position))
    }

    pub async fn summary(&self) -> Result<LedgerSummary> {
        let row = sqlx::query("SELECT usdt_balance, initial_balance FROM wallet WHERE id = ?")
            .bind(WALLET_ID)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::WalletNotInitialized)?;

        let balance = decimal_column(&row, "usdt_balance")?;
        let initial_balance = decimal_column(&row, "initial_balance")?;

        let open = self.list_positions(true).await?;
        let open_value_at_entry = open.iter().map(|p| p.entry_value()).sum();

        Ok(LedgerSummary {
            balance,
            initial_balance,
            open_positions: open.len(),
            open_value_at_entry,
        })
    }
}

async fn read_wallet(conn: &mut SqliteConnection) -> Result<(Decimal, String)> {
    let row = sqlx::query("SELECT usdt_balance FROM wallet WHERE id = ?")
        .bind(WALLET_ID)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(LedgerError::WalletNotInitialized)?;

    let stored: String = row.try_get("usdt_balance")?;
    let balance = parse_decimal("usdt_balance", &stored)?;
    Ok((balance, stored))
}

/// Replace the balance only if it still holds the value read in this transaction.
async fn write_wallet(conn: &mut SqliteConnection, expected: &str, balance: Decimal) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE wallet
        SET usdt_balance = ?, updated_at = ?
        WHERE id = ? AND usdt_balance = ?
        "#,
    )
    .bind(balance.round_dp(BALANCE_DP).to_string())
    .bind(timestamp(Utc::now()))
    .bind(WALLET_ID)
    .bind(expected)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(LedgerError::Conflict);
    }
    Ok(())
}

fn positive(field: &'static str, value: Decimal) -> Result<Decimal> {
    if value <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount { field, value });
    }
    Ok(value)
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn position_from_row(row: &SqliteRow) -> Result<Position> {
    let symbol: String = row.try_get("symbol")?;

    Ok(Position {
        id: row.try_get("id")?,
        symbol: Symbol::from_str(&symbol).map_err(|reason| LedgerError::Decode {
            column: "symbol",
            reason,
        })?,
        amount: decimal_column(row, "amount")?,
        entry_price: decimal_column(row, "entry_price")?,
        is_open: row.try_get::<i64, _>("is_open")? == 1,
        open_date: timestamp_column(row, "open_date")?
            .ok_or(LedgerError::Decode { column: "open_date", reason: "missing".to_string() })?,
        close_date: timestamp_column(row, "close_date")?,
        close_price: optional_decimal_column(row, "close_price")?,
        pnl_pct: optional_decimal_column(row, "pnl_pct")?,
    })
}

fn parse_decimal(column: &'static str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| LedgerError::Decode {
        column,
        reason: e.to_string(),
    })
}

fn decimal_column(row: &SqliteRow, column: &'static str) -> Result<Decimal> {
    let raw: String = row.try_get(column)?;
    parse_decimal(column, &raw)
}

fn optional_decimal_column(row: &SqliteRow, column: &'static str) -> Result<Option<Decimal>> {
    row.try_get::<Option<String>, _>(column)?
        .map(|raw| parse_decimal(column, &raw))
        .transpose()
}

fn timestamp_column(row: &SqliteRow, column: &'static str) -> Result<Option<DateTime<Utc>>> {
    row.try_get::<Option<String>, _>(column)?
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| LedgerError::Decode {
                    column,
                    reason: e.to_string(),
                })
        })
        .transpose()
}
