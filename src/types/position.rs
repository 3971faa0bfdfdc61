use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::Symbol;

/// Decimal places persisted for each ledger column. Prices are kept as quoted.
pub const BALANCE_DP: u32 = 2;
pub const AMOUNT_DP: u32 = 8;
pub const PNL_DP: u32 = 4;

/// A simulated spot holding. Open until closed once; closing is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub symbol: Symbol,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub is_open: bool,
    pub open_date: DateTime<Utc>,
    pub close_date: Option<DateTime<Utc>>,
    pub close_price: Option<Decimal>,
    pub pnl_pct: Option<Decimal>,
}

impl Position {
    /// USDT valuation at the entry price.
    pub fn entry_value(&self) -> Decimal {
        self.amount * self.entry_price
    }

    pub fn value_at(&self, price: Decimal) -> Decimal {
        self.amount * price
    }

    /// Fractional return between entry and `price` (0.10 = +10%).
    pub fn pnl_pct_at(&self, price: Decimal) -> Decimal {
        pnl_fraction(self.entry_price, price)
    }
}

/// Coin quantity bought with `invest_usdt` at `price`, truncated so the
/// entry valuation never exceeds the investment.
pub fn amount_for(invest_usdt: Decimal, price: Decimal) -> Decimal {
    (invest_usdt / price).round_dp_with_strategy(AMOUNT_DP, RoundingStrategy::ToZero)
}

pub fn pnl_fraction(entry_price: Decimal, exit_price: Decimal) -> Decimal {
    if entry_price.is_zero() {
        return Decimal::ZERO;
    }
    (exit_price - entry_price) / entry_price
}

/// Snapshot of the wallet and the entry valuation of open positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub balance: Decimal,
    pub initial_balance: Decimal,
    pub open_positions: usize,
    pub open_value_at_entry: Decimal,
}

impl LedgerSummary {
    pub fn total_at_entry(&self) -> Decimal {
        self.balance + self.open_value_at_entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_and_pnl() {
        assert_eq!(amount_for(dec!(100), dec!(2000)), dec!(0.05));
        assert_eq!(amount_for(dec!(10), dec!(3)), dec!(3.33333333));
        assert_eq!(pnl_fraction(dec!(2000), dec!(2200)), dec!(0.1));
        assert_eq!(pnl_fraction(dec!(50), dec!(40)), dec!(-0.2));
    }

    #[test]
    fn test_position_valuation() {
        let position = Position {
            id: 1,
            symbol: Symbol::new("ETH", "USDT"),
            amount: dec!(0.05),
            entry_price: dec!(2000),
            is_open: true,
            open_date: Utc::now(),
            close_date: None,
            close_price: None,
            pnl_pct: None,
        };
        assert_eq!(position.entry_value(), dec!(100));
        assert_eq!(position.value_at(dec!(2200)), dec!(110));
        assert_eq!(position.pnl_pct_at(dec!(1800)), dec!(-0.1));
    }
}
