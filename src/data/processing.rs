use super::ingestion::IntradayBar;
use chrono::{DateTime, NaiveDate, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// First hour (ET) of the session window that feeds the 4H candles.
pub const SESSION_START_HOUR: u32 = 9;
/// Hour (ET) at which the morning block ends and the afternoon block starts.
pub const SESSION_SPLIT_HOUR: u32 = 13;
/// Hour (ET) at which the afternoon block ends, exclusive.
pub const SESSION_END_HOUR: u32 = 16;

/// The two 4-hour blocks of a trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPeriod {
    /// 09:00-13:00 ET
    Morning,
    /// 13:00-16:00 ET
    Afternoon,
}

impl SessionPeriod {
    /// Maps an Eastern hour to its block, `None` outside 09:00-16:00.
    pub fn for_hour(hour: u32) -> Option<Self> {
        match hour {
            h if (SESSION_START_HOUR..SESSION_SPLIT_HOUR).contains(&h) => Some(Self::Morning),
            h if (SESSION_SPLIT_HOUR..SESSION_END_HOUR).contains(&h) => Some(Self::Afternoon),
            _ => None,
        }
    }

    /// Eastern hour at which the block closes.
    pub fn end_hour(self) -> u32 {
        match self {
            Self::Morning => SESSION_SPLIT_HOUR,
            Self::Afternoon => SESSION_END_HOUR,
        }
    }

    pub fn window_label(self) -> &'static str {
        match self {
            Self::Morning => "09:00-13:00",
            Self::Afternoon => "13:00-16:00",
        }
    }
}

impl fmt::Display for SessionPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Morning => write!(f, "morning"),
            Self::Afternoon => write!(f, "afternoon"),
        }
    }
}

/// A 4-hour session candle as stored in the levels data file.
///
/// Candles are identified and ordered by their `timestamp` label, so the label
/// format doubles as the sort key of the stored history.
///
/// # Fields
/// * `timestamp`: Sortable block label, e.g. `2024-03-04 09:00-13:00`
/// * `date`: Eastern trading date of the block
/// * `period`: Morning (09:00-13:00) or afternoon (13:00-16:00) block
/// * `open`: Open of the first 5-minute bar in the block
/// * `high`: Highest high across the block
/// * `low`: Lowest low across the block
/// * `close`: Close of the last 5-minute bar in the block
/// * `volume`: Summed volume of the block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FourHourCandle {
    pub timestamp: String,
    pub date: NaiveDate,
    pub period: SessionPeriod,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl FourHourCandle {
    pub fn label(date: NaiveDate, period: SessionPeriod) -> String {
        format!("{} {}", date, period.window_label())
    }

    /// Whether the block had already closed at `now`.
    ///
    /// Blocks from earlier dates are always closed. A block from the current
    /// date is closed once the Eastern clock reaches its end hour; before that it
    /// only holds part of the session and must not be persisted.
    ///
    /// # Arguments
    /// * `now`: Current Eastern time
    pub fn is_closed_at(&self, now: &DateTime<Tz>) -> bool {
        match self.date.cmp(&now.date_naive()) {
            Ordering::Less => true,
            Ordering::Equal => now.hour() >= self.period.end_hour(),
            Ordering::Greater => false,
        }
    }

    fn from_bars(date: NaiveDate, period: SessionPeriod, bars: &[&IntradayBar]) -> Option<Self> {
        let first = bars.first()?;
        let last = bars.last()?;

        Some(Self {
            timestamp: Self::label(date, period),
            date,
            period,
            open: first.open,
            high: bars.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max),
            low: bars.iter().map(|b| b.low).fold(f64::INFINITY, f64::min),
            close: last.close,
            volume: bars.iter().map(|b| b.volume).sum(),
        })
    }
}

/// Converts 5-minute bars into morning and afternoon 4H candles.
///
/// Bars are ordered by time and de-duplicated on their timestamp (the last bar
/// wins). Bars outside 09:00-16:00 ET are dropped. Each trading day yields up to
/// two candles: open of the first bar, highest high, lowest low, close of the last
/// bar and summed volume. Output is ordered by date, morning before afternoon.
///
/// # Arguments
/// * `bars`: Intraday bars in any order
///
/// # Returns
/// The 4H candles, empty when no bar falls inside the session window
pub fn convert_to_four_hour_candles(bars: &[IntradayBar]) -> Vec<FourHourCandle> {
    let ordered: BTreeMap<DateTime<Tz>, &IntradayBar> =
        bars.iter().map(|bar| (bar.timestamp, bar)).collect();

    let mut days: BTreeMap<NaiveDate, (Vec<&IntradayBar>, Vec<&IntradayBar>)> = BTreeMap::new();
    for (timestamp, bar) in ordered {
        let Some(period) = SessionPeriod::for_hour(timestamp.hour()) else {
            continue;
        };
        let (morning, afternoon) = days.entry(timestamp.date_naive()).or_default();
        match period {
            SessionPeriod::Morning => morning.push(bar),
            SessionPeriod::Afternoon => afternoon.push(bar),
        }
    }

    let mut candles = Vec::with_capacity(days.len() * 2);
    for (date, (morning, afternoon)) in days {
        candles.extend(FourHourCandle::from_bars(date, SessionPeriod::Morning, &morning));
        candles.extend(FourHourCandle::from_bars(date, SessionPeriod::Afternoon, &afternoon));
    }

    candles
}
