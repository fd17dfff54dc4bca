use crate::data::{FourHourCandle, SessionPeriod};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ATR_PERIOD: usize = 14;

/// True Range of one candle against the previous close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrueRangePoint {
    pub timestamp: String,
    pub date: NaiveDate,
    pub period: SessionPeriod,
    pub true_range: f64,
    pub close: f64,
}

/// One smoothed ATR value, stamped with the candle it closes on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrPoint {
    pub timestamp: String,
    pub date: NaiveDate,
    pub period: SessionPeriod,
    pub atr: f64,
    pub close: f64,
}

/// Calculates the True Range of every candle after the first.
///
/// TR = max(high - low, |high - previous close|, |low - previous close|)
///
/// # Returns
/// One point per candle from index 1, empty with fewer than two candles
pub fn true_ranges(candles: &[FourHourCandle]) -> Vec<TrueRangePoint> {
    candles
        .windows(2)
        .map(|pair| {
            let (previous, current) = (&pair[0], &pair[1]);
            let true_range = (current.high - current.low)
                .max((current.high - previous.close).abs())
                .max((current.low - previous.close).abs());

            TrueRangePoint {
                timestamp: current.timestamp.clone(),
                date: current.date,
                period: current.period,
                true_range,
                close: current.close,
            }
        })
        .collect()
}

/// Calculates ATR with Wilder's smoothing.
///
/// The seed is the simple mean of the first `period` true ranges; every later
/// value is `((period - 1) * previous + tr) / period`.
///
/// # Arguments
/// * `tr_values`: True ranges, oldest first
/// * `period`: Smoothing period, 14 for the standard ATR
///
/// # Returns
/// One ATR per true range from index `period - 1`, empty when there are fewer
/// than `period` values
pub fn wilders_atr(tr_values: &[TrueRangePoint], period: usize) -> Vec<AtrPoint> {
    if period == 0 || tr_values.len() < period {
        return Vec::new();
    }

    let n = period as f64;
    let seed = tr_values[..period].iter().map(|tr| tr.true_range).sum::<f64>() / n;

    let mut atr_values = Vec::with_capacity(tr_values.len() - period + 1);
    atr_values.push(to_atr_point(&tr_values[period - 1], seed));

    let mut previous = seed;
    for tr in &tr_values[period..] {
        previous = ((n - 1.0) * previous + tr.true_range) / n;
        atr_values.push(to_atr_point(tr, previous));
    }

    atr_values
}

fn to_atr_point(tr: &TrueRangePoint, atr: f64) -> AtrPoint {
    AtrPoint {
        timestamp: tr.timestamp.clone(),
        date: tr.date,
        period: tr.period,
        atr,
        close: tr.close,
    }
}
