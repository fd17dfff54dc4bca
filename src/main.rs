mod config;
mod data;
mod error;
mod indicators;
mod levels;
mod storage;

use chrono::Utc;
use chrono_tz::US::Eastern;
use config::Config;
use levels::{LevelsCalculator, UpdateOutcome};
use tracing_subscriber::EnvFilter;

/// Entry point for the scheduled SPY levels update.
///
/// This function runs one update:
/// 1. Initialize logging, load `.env` and parse arguments
/// 2. Fetch recent 5-minute SPY bars from Polygon
/// 3. Fold them into the stored 4H candle history
/// 4. Recompute ATR(14) and the Fibonacci levels around the prior 4H close
/// 5. Save the data file and print the levels
///
/// Runs that cannot produce levels (off-schedule trigger, no data, short history,
/// missing candle) leave the data file as it was and still exit successfully, so
/// the workflow's commit step has nothing to commit.
///
/// # Returns
/// An error for bad configuration or when the data file cannot be read or written
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env_and_args()?;
    let calculator = LevelsCalculator::from_config(&config);

    let now = Utc::now().with_timezone(&Eastern);
    match calculator.update_levels(now).await? {
        UpdateOutcome::Updated(report) => {
            println!("\n{}", report);
        }
        UpdateOutcome::OffSchedule => {
            println!("Scheduled trigger outside the 1PM/4PM ET hours, nothing to do");
        }
        UpdateOutcome::NoData => {
            println!("No new data fetched, {} left unchanged", config.data_file.display());
        }
        UpdateOutcome::InsufficientHistory { candles, required } => {
            println!(
                "Not enough data for ATR calculation: {} candles stored, {} required",
                candles, required
            );
        }
        UpdateOutcome::MissingTargetCandle(period) => {
            println!("Could not find recent {} candle for level calculation", period);
        }
    }

    Ok(())
}
