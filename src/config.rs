use crate::error::{LevelsError, LevelsResult};
use crate::levels::UpdateType;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

pub const DEFAULT_DATA_FILE: &str = "spy_levels_data.json";
pub const DEFAULT_POLYGON_URL: &str = "https://api.polygon.io";
pub const MAX_LOOKBACK_DAYS: i64 = 365;

/// Which session close to build levels from, overriding the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UpdateArg {
    /// 1PM update, levels from the morning candle
    Midday,
    /// 4PM update, levels from the afternoon candle
    Close,
}

impl From<UpdateArg> for UpdateType {
    fn from(arg: UpdateArg) -> Self {
        match arg {
            UpdateArg::Midday => UpdateType::Midday,
            UpdateArg::Close => UpdateType::Close,
        }
    }
}

/// SPY levels updater - fetches intraday bars and writes ATR based levels
#[derive(Parser, Debug, Clone)]
#[command(name = "spy_levels")]
#[command(about = "Updates 4H ATR Fibonacci levels for SPY from Polygon intraday data")]
#[command(version)]
pub struct Args {
    /// Polygon API key
    #[arg(long, env = "POLYGON_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// JSON file holding candles, ATR history and current levels
    #[arg(long, env = "SPY_LEVELS_DATA_FILE", default_value = DEFAULT_DATA_FILE)]
    pub data_file: PathBuf,

    /// Ticker to fetch
    #[arg(long, default_value = "SPY")]
    pub symbol: String,

    /// Calendar days of 5-minute bars to request
    #[arg(long, default_value_t = 15)]
    pub lookback_days: i64,

    /// ATR smoothing period
    #[arg(long, default_value_t = 14)]
    pub atr_period: usize,

    /// Number of 4H candles retained in the data file
    #[arg(long, default_value_t = 30)]
    pub max_candles: usize,

    /// Force the update type instead of deriving it from the Eastern clock
    #[arg(long, value_enum)]
    pub update: Option<UpdateArg>,

    /// Cron-triggered run: skip unless the Eastern clock is in the 13:00 or 16:00 hour
    #[arg(long, env = "SPY_LEVELS_SCHEDULED")]
    pub scheduled: bool,

    /// Retries for transient fetch failures
    #[arg(long, default_value_t = 3)]
    pub fetch_retries: usize,

    /// Polygon REST base URL
    #[arg(long, env = "POLYGON_BASE_URL", default_value = DEFAULT_POLYGON_URL)]
    pub polygon_url: String,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub data_file: PathBuf,
    pub symbol: String,
    pub lookback_days: i64,
    pub atr_period: usize,
    pub max_candles: usize,
    pub update_override: Option<UpdateType>,
    pub scheduled: bool,
    pub fetch_retries: usize,
    pub polygon_url: String,
}

impl Config {
    /// Loads `.env` if present, then parses arguments and environment.
    pub fn from_env_and_args() -> LevelsResult<Self> {
        dotenv::dotenv().ok();
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> LevelsResult<Self> {
        let api_key = args
            .api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                LevelsError::Config("POLYGON_API_KEY environment variable not set".to_string())
            })?;

        if args.atr_period == 0 {
            return Err(LevelsError::Config("atr period must be at least 1".to_string()));
        }
        if args.max_candles <= args.atr_period {
            return Err(LevelsError::Config(format!(
                "max candles ({}) must exceed the atr period ({})",
                args.max_candles, args.atr_period
            )));
        }
        if !(1..=MAX_LOOKBACK_DAYS).contains(&args.lookback_days) {
            return Err(LevelsError::Config(format!(
                "lookback must be between 1 and {} days, got {}",
                MAX_LOOKBACK_DAYS, args.lookback_days
            )));
        }

        Ok(Self {
            api_key,
            data_file: args.data_file,
            symbol: args.symbol.to_uppercase(),
            lookback_days: args.lookback_days,
            atr_period: args.atr_period,
            max_candles: args.max_candles,
            update_override: args.update.map(UpdateType::from),
            scheduled: args.scheduled,
            fetch_retries: args.fetch_retries,
            polygon_url: args.polygon_url.trim_end_matches('/').to_string(),
        })
    }
}
