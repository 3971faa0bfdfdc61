use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use thiserror::Error;

use crate::types::Candle;

/// Fewer aligned bars than this and no features are produced.
pub const MIN_ALIGNED_ROWS: usize = 50;
pub const CORRELATION_WINDOW: usize = 50;

const RSI_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const BB_PERIOD: usize = 20;
const ATR_PERIOD: usize = 14;
const VOLUME_PERIOD: usize = 20;

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("Unknown feature '{0}'")]
    UnknownFeature(String),
}

/// Named features the builder knows how to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    RelativeStrength,
    RollingCorrBtc,
    Return1,
    ReferenceReturn1,
    Rsi14,
    MacdHist,
    BbPosition,
    AtrPct,
    VolumeRatio,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 9] = [
        FeatureKind::RelativeStrength,
        FeatureKind::RollingCorrBtc,
        FeatureKind::Return1,
        FeatureKind::ReferenceReturn1,
        FeatureKind::Rsi14,
        FeatureKind::MacdHist,
        FeatureKind::BbPosition,
        FeatureKind::AtrPct,
        FeatureKind::VolumeRatio,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureKind::RelativeStrength => "relative_strength",
            FeatureKind::RollingCorrBtc => "rolling_corr_btc",
            FeatureKind::Return1 => "return_1",
            FeatureKind::ReferenceReturn1 => "reference_return_1",
            FeatureKind::Rsi14 => "rsi_14",
            FeatureKind::MacdHist => "macd_hist",
            FeatureKind::BbPosition => "bb_position",
            FeatureKind::AtrPct => "atr_pct",
            FeatureKind::VolumeRatio => "volume_ratio",
        }
    }

    fn compute(&self, aligned: &Aligned) -> Vec<Option<f64>> {
        match self {
            FeatureKind::RelativeStrength => aligned
                .close
                .iter()
                .zip(&aligned.reference_close)
                .map(|(c, r)| finite(c / r))
                .collect(),
            FeatureKind::RollingCorrBtc => rolling_correlation(
                &pct_change(&aligned.close),
                &pct_change(&aligned.reference_close),
                CORRELATION_WINDOW,
            ),
            FeatureKind::Return1 => pct_change(&aligned.close),
            FeatureKind::ReferenceReturn1 => pct_change(&aligned.reference_close),
            FeatureKind::Rsi14 => rsi(&aligned.close, RSI_PERIOD),
            FeatureKind::MacdHist => macd_histogram(&aligned.close),
            FeatureKind::BbPosition => bollinger_position(&aligned.close, BB_PERIOD),
            FeatureKind::AtrPct => range_pct(&aligned.range, &aligned.close, ATR_PERIOD),
            FeatureKind::VolumeRatio => volume_ratio(&aligned.volume, VOLUME_PERIOD),
        }
    }
}

impl FromStr for FeatureKind {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| FeatureError::UnknownFeature(s.to_string()))
    }
}

/// Complete feature rows, oldest first, columns in the requested order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureTable {
    names: Vec<String>,
    timestamps: Vec<DateTime<Utc>>,
    rows: Vec<Vec<f64>>,
}

impl FeatureTable {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[cfg(test)]
    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn latest(&self) -> Option<(DateTime<Utc>, &[f64])> {
        let ts = *self.timestamps.last()?;
        let row = self.rows.last()?;
        Some((ts, row.as_slice()))
    }

    #[cfg(test)]
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.names.iter().position(|n| n == name)?;
        Some(self.rows.iter().map(|row| row[idx]).collect())
    }
}

/// Coin and reference bars restricted to shared timestamps.
struct Aligned {
    timestamps: Vec<DateTime<Utc>>,
    close: Vec<f64>,
    range: Vec<f64>,
    volume: Vec<f64>,
    reference_close: Vec<f64>,
}

impl Aligned {
    fn new(series: &[Candle], reference: &[Candle]) -> Self {
        let by_time: HashMap<DateTime<Utc>, &Candle> =
            reference.iter().map(|c| (c.open_time, c)).collect();

        let mut seen = HashSet::new();
        let mut pairs: Vec<(&Candle, &Candle)> = series
            .iter()
            .filter(|c| seen.insert(c.open_time))
            .filter_map(|c| by_time.get(&c.open_time).map(|r| (c, *r)))
            .collect();
        pairs.sort_by_key(|(c, _)| c.open_time);

        let missing = f64::NAN;
        Self {
            timestamps: pairs.iter().map(|(c, _)| c.open_time).collect(),
            close: pairs.iter().map(|(c, _)| c.close_f64().unwrap_or(missing)).collect(),
            range: pairs.iter().map(|(c, _)| c.range_f64().unwrap_or(missing)).collect(),
            volume: pairs.iter().map(|(c, _)| c.volume_f64().unwrap_or(missing)).collect(),
            reference_close: pairs.iter().map(|(_, r)| r.close_f64().unwrap_or(missing)).collect(),
        }
    }

    fn len(&self) -> usize {
        self.timestamps.len()
    }
}

/// Align `series` with `reference`, compute `feature_names`, forward-fill and
/// drop incomplete rows.
///
/// Returns `Ok(None)` when fewer than [`MIN_ALIGNED_ROWS`] bars align or no
/// complete row survives. Unknown names are a configuration error.
pub fn build_features(
    series: &[Candle],
    reference: &[Candle],
    feature_names: &[String],
) -> Result<Option<FeatureTable>, FeatureError> {
    let kinds = feature_names
        .iter()
        .map(|name| name.parse::<FeatureKind>())
        .collect::<Result<Vec<_>, _>>()?;

    let aligned = Aligned::new(series, reference);
    if aligned.len() < MIN_ALIGNED_ROWS {
        return Ok(None);
    }

    let columns: Vec<Vec<Option<f64>>> = kinds
        .iter()
        .map(|kind| forward_fill(kind.compute(&aligned)))
        .collect();

    let mut timestamps = Vec::new();
    let mut rows = Vec::new();
    for (i, ts) in aligned.timestamps.iter().enumerate() {
        let row: Option<Vec<f64>> = columns.iter().map(|col| col[i]).collect();
        if let Some(row) = row {
            timestamps.push(*ts);
            rows.push(row);
        }
    }

    if rows.is_empty() {
        return Ok(None);
    }

    Ok(Some(FeatureTable {
        names: feature_names.to_vec(),
        timestamps,
        rows,
    }))
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn forward_fill(values: Vec<Option<f64>>) -> Vec<Option<f64>> {
    let mut last = None;
    values
        .into_iter()
        .map(|v| {
            if v.is_some() {
                last = v;
            }
            last
        })
        .collect()
}

fn pct_change(values: &[f64]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    out.extend(values.first().map(|_| None));
    out.extend(values.windows(2).map(|w| finite((w[1] - w[0]) / w[0])));
    out
}

/// Pearson correlation over trailing windows; a window with any gap is missing.
fn rolling_correlation(a: &[Option<f64>], b: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    (0..a.len())
        .map(|i| {
            if i + 1 < window {
                return None;
            }
            let xs: Option<Vec<f64>> = a[i + 1 - window..=i].iter().copied().collect();
            let ys: Option<Vec<f64>> = b[i + 1 - window..=i].iter().copied().collect();
            pearson(&xs?, &ys?)
        })
        .collect()
}

fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let denom = (var_x * var_y).sqrt();
    if denom == 0.0 {
        return None;
    }
    finite(cov / denom)
}

/// Wilder RSI: simple average of the first `period` moves, then smoothed.
fn rsi(close: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; close.len()];
    if close.len() <= period {
        return out;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = close[i] - close[i - 1];
        avg_gain += change.max(0.0);
        avg_loss += (-change).max(0.0);
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = rsi_value(avg_gain, avg_loss);

    let p = period as f64;
    for i in period + 1..close.len() {
        let change = close[i] - close[i - 1];
        avg_gain = (avg_gain * (p - 1.0) + change.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-change).max(0.0)) / p;
        out[i] = rsi_value(avg_gain, avg_loss);
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    finite(100.0 - 100.0 / (1.0 + avg_gain / avg_loss))
}

/// EMA seeded with the SMA of the first `period` present values.
fn ema(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut count = 0;
    let mut sum = 0.0;
    let mut current: Option<f64> = None;

    values
        .iter()
        .map(|v| {
            let v = (*v)?;
            current = match current {
                Some(prev) => Some((v - prev) * multiplier + prev),
                None => {
                    count += 1;
                    sum += v;
                    (count == period).then(|| sum / period as f64)
                }
            };
            current.and_then(finite)
        })
        .collect()
}

fn macd_histogram(close: &[f64]) -> Vec<Option<f64>> {
    let close: Vec<Option<f64>> = close.iter().map(|c| finite(*c)).collect();
    let fast = ema(&close, MACD_FAST);
    let slow = ema(&close, MACD_SLOW);
    let macd: Vec<Option<f64>> = fast
        .iter()
        .zip(&slow)
        .map(|(f, s)| Some((*f)? - (*s)?))
        .collect();
    let signal = ema(&macd, MACD_SIGNAL);

    macd.iter()
        .zip(&signal)
        .map(|(m, s)| finite((*m)? - (*s)?))
        .collect()
}

fn trailing_mean(values: &[f64], end: usize, period: usize) -> Option<f64> {
    if end + 1 < period {
        return None;
    }
    finite(values[end + 1 - period..=end].iter().sum::<f64>() / period as f64)
}

/// Position of the close inside 2σ Bollinger bands, 0 = lower, 1 = upper.
fn bollinger_position(close: &[f64], period: usize) -> Vec<Option<f64>> {
    (0..close.len())
        .map(|i| {
            let mean = trailing_mean(close, i, period)?;
            let window = &close[i + 1 - period..=i];
            let variance = window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / period as f64;
            let std_dev = variance.sqrt();
            let lower = mean - 2.0 * std_dev;
            let width = 4.0 * std_dev;
            if width == 0.0 {
                return Some(0.5);
            }
            finite((close[i] - lower) / width).map(|p| p.clamp(0.0, 1.0))
        })
        .collect()
}

/// Mean high-low range over `period` bars as a percentage of the close.
fn range_pct(range: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    (0..close.len())
        .map(|i| finite(trailing_mean(range, i, period)? / close[i] * 100.0))
        .collect()
}

fn volume_ratio(volume: &[f64], period: usize) -> Vec<Option<f64>> {
    (0..volume.len())
        .map(|i| {
            let avg = trailing_mean(volume, i, period)?;
            if avg == 0.0 {
                return Some(1.0);
            }
            finite(volume[i] / avg)
        })
        .collect()
}
