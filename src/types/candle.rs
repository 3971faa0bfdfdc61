use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLCV bar keyed by its open time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn close_f64(&self) -> Option<f64> {
        self.close.to_f64()
    }

    pub fn range_f64(&self) -> Option<f64> {
        self.range().to_f64()
    }

    pub fn volume_f64(&self) -> Option<f64> {
        self.volume.to_f64()
    }
}

