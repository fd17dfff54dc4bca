pub mod calculator;
pub mod fibonacci;

pub use calculator::{LevelsCalculator, UpdateOutcome};
pub use fibonacci::{calculate_levels, LevelSet};

use crate::data::processing::{SESSION_END_HOUR, SESSION_SPLIT_HOUR};
use crate::data::SessionPeriod;
use chrono::{DateTime, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which scheduled run this is.
///
/// The 1PM run builds levels off the morning candle, the 4PM run (and any
/// manual run at another hour) off the afternoon candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    #[serde(rename = "1PM_update")]
    Midday,
    #[serde(rename = "4PM_update")]
    Close,
}

impl UpdateType {
    pub fn for_time(now: &DateTime<Tz>) -> Self {
        if now.hour() == SESSION_SPLIT_HOUR {
            Self::Midday
        } else {
            Self::Close
        }
    }

    /// Update type for a cron-triggered run, `None` outside the 13:00 and 16:00
    /// Eastern hours.
    ///
    /// The workflow carries one cron pair for EDT and one for EST, so on any given
    /// day two of the four triggers land an hour early and must be skipped.
    pub fn for_scheduled_time(now: &DateTime<Tz>) -> Option<Self> {
        match now.hour() {
            SESSION_SPLIT_HOUR => Some(Self::Midday),
            SESSION_END_HOUR => Some(Self::Close),
            _ => None,
        }
    }

    pub fn target_period(self) -> SessionPeriod {
        match self {
            Self::Midday => SessionPeriod::Morning,
            Self::Close => SessionPeriod::Afternoon,
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Midday => write!(f, "1PM_update"),
            Self::Close => write!(f, "4PM_update"),
        }
    }
}
