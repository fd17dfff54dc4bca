use super::{calculate_levels, LevelSet, UpdateType};
use crate::config::Config;
use crate::data::{convert_to_four_hour_candles, MarketDataSource, PolygonClient, SessionPeriod};
use crate::error::{LevelsError, LevelsResult};
use crate::indicators::{true_ranges, wilders_atr, DEFAULT_ATR_PERIOD};
use crate::storage::{merge_candles, LevelsSnapshot, LevelsStore};
use chrono::{DateTime, Days, Offset};
use chrono_tz::Tz;
use std::fmt;
use std::path::PathBuf;

/// What a single update run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Levels were recomputed and the data file rewritten.
    Updated(UpdateReport),
    /// A cron-triggered run outside the 13:00 and 16:00 Eastern hours.
    OffSchedule,
    /// The fetch failed or returned no bars.
    NoData,
    /// Too few candles for the ATR period.
    InsufficientHistory { candles: usize, required: usize },
    /// No stored candle of the period the update type builds from.
    MissingTargetCandle(SessionPeriod),
}

/// Summary of a successful update, printed at the end of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    pub symbol: String,
    pub update_type: UpdateType,
    pub target_period: SessionPeriod,
    pub prior_close: f64,
    pub current_atr: f64,
    pub atr_period: usize,
    pub levels: LevelSet,
    pub candle_count: usize,
    pub atr_count: usize,
}

impl fmt::Display for UpdateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} {} LEVELS UPDATE ===", self.symbol, self.update_type)?;
        writeln!(f, "Prior 4H Close ({}): {:.2}", self.target_period, self.prior_close)?;
        writeln!(f, "Current ATR({}): {:.2}", self.atr_period, self.current_atr)?;
        writeln!(f)?;
        writeln!(f, "Calculated Levels:")?;
        for level in self.levels.sorted_desc() {
            writeln!(f, "{}: {:.2}", level.name, level.value)?;
        }
        writeln!(f)?;
        writeln!(f, "Total 4H candles stored: {}", self.candle_count)?;
        write!(f, "ATR calculation periods: {}", self.atr_count)
    }
}

/// Runs the fetch, aggregate, ATR and levels pipeline against a data file.
///
/// The data file is only rewritten when a full set of levels could be produced;
/// every other outcome leaves it untouched.
///
/// # Key Features
/// * Any [`MarketDataSource`] can feed the pipeline, Polygon in production
/// * Blocks that have not closed yet are never persisted
/// * Freshly fetched candles replace stored ones with the same label
/// * Cron-triggered runs outside the 13:00 and 16:00 Eastern hours are skipped
pub struct LevelsCalculator<S: MarketDataSource> {
    source: S,
    store: LevelsStore,
    symbol: String,
    lookback_days: i64,
    atr_period: usize,
    max_candles: usize,
    update_override: Option<UpdateType>,
    scheduled: bool,
}

impl LevelsCalculator<PolygonClient> {
    pub fn from_config(config: &Config) -> Self {
        let client = PolygonClient::new(
            config.api_key.clone(),
            config.polygon_url.clone(),
            config.fetch_retries,
        );

        Self::new(client, config.data_file.clone(), config.symbol.clone())
            .with_lookback_days(config.lookback_days)
            .with_atr_period(config.atr_period)
            .with_max_candles(config.max_candles)
            .with_update_override(config.update_override)
            .with_schedule_guard(config.scheduled)
    }
}

impl<S: MarketDataSource> LevelsCalculator<S> {
    /// Creates a calculator with the standard settings.
    ///
    /// Defaults: 15 days of lookback, ATR(14), 30 stored candles, the update
    /// type derived from the clock and no schedule guard. The `with_*` methods
    /// override each of them.
    ///
    /// # Arguments
    /// * `source`: Where intraday bars come from
    /// * `data_file`: Path of the JSON levels data file
    /// * `symbol`: Ticker to fetch, e.g. `SPY`
    ///
    /// # Returns
    /// A new `LevelsCalculator`; nothing is fetched or read until
    /// [`LevelsCalculator::update_levels`] runs
    pub fn new(source: S, data_file: impl Into<PathBuf>, symbol: impl Into<String>) -> Self {
        Self {
            source,
            store: LevelsStore::new(data_file),
            symbol: symbol.into(),
            lookback_days: 15,
            atr_period: DEFAULT_ATR_PERIOD,
            max_candles: 30,
            update_override: None,
            scheduled: false,
        }
    }

    pub fn with_lookback_days(mut self, days: i64) -> Self {
        self.lookback_days = days;
        self
    }

    pub fn with_atr_period(mut self, period: usize) -> Self {
        self.atr_period = period;
        self
    }

    pub fn with_max_candles(mut self, max_candles: usize) -> Self {
        self.max_candles = max_candles;
        self
    }

    pub fn with_update_override(mut self, update: Option<UpdateType>) -> Self {
        self.update_override = update;
        self
    }

    /// Skip runs outside the 13:00 and 16:00 Eastern hours unless an override is set.
    pub fn with_schedule_guard(mut self, scheduled: bool) -> Self {
        self.scheduled = scheduled;
        self
    }

    /// Updates the stored candles, ATR history and current levels.
    ///
    /// # Arguments
    /// * `now`: Current Eastern time, drives the fetch window and the update type
    ///
    /// # Errors
    /// Returns an error if the lookback window is out of range or the data file
    /// cannot be read or written. Fetch failures are logged and reported as
    /// [`UpdateOutcome::NoData`].
    pub async fn update_levels(&self, now: DateTime<Tz>) -> LevelsResult<UpdateOutcome> {
        tracing::info!("Starting levels update at {}", now);

        let update_type = match self.update_override {
            Some(update_type) => update_type,
            None if self.scheduled => match UpdateType::for_scheduled_time(&now) {
                Some(update_type) => update_type,
                None => {
                    tracing::info!("Scheduled run at {} is outside the 13:00/16:00 hours, skipping", now);
                    return Ok(UpdateOutcome::OffSchedule);
                }
            },
            None => UpdateType::for_time(&now),
        };
        let target_period = update_type.target_period();
        tracing::info!(%update_type, %target_period, "Update type resolved");

        let end = now.date_naive();
        let start = u64::try_from(self.lookback_days)
            .ok()
            .and_then(|days| end.checked_sub_days(Days::new(days)))
            .ok_or_else(|| {
                LevelsError::Config(format!("lookback of {} days is out of range", self.lookback_days))
            })?;
        let bars = match self.source.fetch_intraday_bars(&self.symbol, start, end).await {
            Ok(bars) => bars,
            Err(e) => {
                tracing::error!("Error fetching data: {}", e);
                Vec::new()
            }
        };
        if bars.is_empty() {
            tracing::warn!("No new data fetched");
            return Ok(UpdateOutcome::NoData);
        }

        let mut stored = self.store.load().await?;

        let (fresh, open): (Vec<_>, Vec<_>) = convert_to_four_hour_candles(&bars)
            .into_iter()
            .partition(|candle| candle.is_closed_at(&now));
        if !open.is_empty() {
            tracing::info!(skipped = open.len(), "Skipping 4H blocks that have not closed yet");
        }
        tracing::debug!(fresh = fresh.len(), stored = stored.candles.len(), "Merging 4H candles");
        let candles = merge_candles(std::mem::take(&mut stored.candles), fresh, self.max_candles);

        let atr_values = wilders_atr(&true_ranges(&candles), self.atr_period);
        let Some(current) = atr_values.last() else {
            tracing::warn!(
                candles = candles.len(),
                "Not enough data for ATR calculation (need at least {} periods)",
                self.atr_period
            );
            return Ok(UpdateOutcome::InsufficientHistory {
                candles: candles.len(),
                required: self.atr_period + 1,
            });
        };
        let current_atr = current.atr;

        let Some(prior_close) = candles
            .iter()
            .rev()
            .find(|c| c.period == target_period)
            .map(|c| c.close)
        else {
            tracing::warn!("Could not find recent {} candle for level calculation", target_period);
            return Ok(UpdateOutcome::MissingTargetCandle(target_period));
        };
        tracing::info!("Using {} close: {}", target_period, prior_close);

        let levels = calculate_levels(prior_close, current_atr);

        let report = UpdateReport {
            symbol: self.symbol.clone(),
            update_type,
            target_period,
            prior_close,
            current_atr,
            atr_period: self.atr_period,
            levels: levels.clone(),
            candle_count: candles.len(),
            atr_count: atr_values.len(),
        };

        stored.candles = candles;
        stored.atr_values = atr_values;
        stored.current_levels = Some(LevelsSnapshot {
            update_type,
            timestamp: now.with_timezone(&now.offset().fix()),
            prior_4h_close: prior_close,
            current_atr,
            levels,
        });
        self.store.save(&stored).await?;
        tracing::info!(path = %self.store.path().display(), "Levels data saved");

        Ok(UpdateOutcome::Updated(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ingestion::IntradayBar;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use chrono_tz::US::Eastern;
    use std::sync::Mutex;
    use tempfile::TempDir;

    enum FakeResponse {
        Bars(Vec<IntradayBar>),
        Fail,
    }

    struct FakeSource {
        response: FakeResponse,
        requests: Mutex<Vec<(String, NaiveDate, NaiveDate)>>,
    }

    impl FakeSource {
        fn new(response: FakeResponse) -> Self {
            Self {
                response,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for FakeSource {
        async fn fetch_intraday_bars(
            &self,
            symbol: &str,
            start: NaiveDate,
            end: NaiveDate,
        ) -> LevelsResult<Vec<IntradayBar>> {
            self.requests
                .lock()
                .unwrap()
                .push((symbol.to_string(), start, end));
            match &self.response {
                FakeResponse::Bars(bars) => Ok(bars.clone()),
                FakeResponse::Fail => Err(LevelsError::api_error(503, "down")),
            }
        }
    }

    fn bar(day: u32, hour: u32, minute: u32, price: f64) -> IntradayBar {
        bar_in(3, day, hour, minute, price)
    }

    fn bar_in(month: u32, day: u32, hour: u32, minute: u32, price: f64) -> IntradayBar {
        IntradayBar {
            timestamp: Eastern.with_ymd_and_hms(2024, month, day, hour, minute, 0).unwrap(),
            open: price,
            high: price + 0.5,
            low: price - 0.5,
            close: price,
            volume: 100,
        }
    }

    /// Two morning and two afternoon bars per day from March 4th.
    fn session_bars(days: u32, afternoons: bool) -> Vec<IntradayBar> {
        let mut bars = Vec::new();
        for offset in 0..days {
            let day = 4 + offset;
            let base = 100.0 + offset as f64;
            bars.push(bar(day, 9, 30, base));
            bars.push(bar(day, 12, 0, base + 1.0));
            if afternoons {
                bars.push(bar(day, 13, 30, base + 0.5));
                bars.push(bar(day, 15, 55, base + 2.0));
            }
        }
        bars
    }

    fn eastern(day: u32, hour: u32, minute: u32) -> DateTime<Tz> {
        Eastern.with_ymd_and_hms(2024, 3, day, hour, minute, 0).unwrap()
    }

    /// A January (EST) clock given in UTC, the way the cron triggers fire.
    fn january_utc(day: u32, hour: u32, minute: u32) -> DateTime<Tz> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0)
            .unwrap()
            .with_timezone(&Eastern)
    }

    /// Full sessions for January 8th to 21st plus a January 22nd cut off at 14:55.
    fn winter_bars() -> Vec<IntradayBar> {
        let mut bars = Vec::new();
        for day in 8..22 {
            let base = 100.0 + (day - 8) as f64;
            bars.push(bar_in(1, day, 9, 30, base));
            bars.push(bar_in(1, day, 12, 0, base + 1.0));
            bars.push(bar_in(1, day, 13, 30, base + 0.5));
            bars.push(bar_in(1, day, 15, 55, base + 2.0));
        }
        bars.push(bar_in(1, 22, 9, 30, 100.0));
        bars.push(bar_in(1, 22, 13, 30, 101.0));
        bars.push(bar_in(1, 22, 14, 55, 102.0));
        bars
    }

    #[tokio::test]
    async fn test_close_update_writes_levels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spy_levels_data.json");
        let calculator =
            LevelsCalculator::new(FakeSource::new(FakeResponse::Bars(session_bars(8, true))), &path, "SPY");

        let outcome = calculator.update_levels(eastern(11, 16, 10)).await.unwrap();
        let report = match outcome {
            UpdateOutcome::Updated(report) => report,
            other => panic!("expected update, got {:?}", other),
        };

        assert_eq!(report.update_type, UpdateType::Close);
        assert_eq!(report.target_period, SessionPeriod::Afternoon);
        assert_eq!(report.prior_close, 109.0);
        assert_eq!(report.candle_count, 16);
        assert_eq!(report.atr_count, 2);
        assert_eq!(report.levels.get("Level_0"), Some(109.0));
        let expected = 109.0 + report.current_atr;
        assert!((report.levels.get("Level_+1.0").unwrap() - expected).abs() < 1e-9);

        let requests = calculator.source.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![(
                "SPY".to_string(),
                NaiveDate::from_ymd_opt(2024, 2, 25).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
            )]
        );

        let stored = calculator.store.load().await.unwrap();
        assert_eq!(stored.candles.len(), 16);
        assert_eq!(stored.atr_values.len(), 2);
        let snapshot = stored.current_levels.unwrap();
        assert_eq!(snapshot.update_type, UpdateType::Close);
        assert_eq!(snapshot.prior_4h_close, 109.0);
        assert_eq!(snapshot.levels.len(), 13);
    }

    #[tokio::test]
    async fn test_midday_update_uses_morning_close() {
        let dir = TempDir::new().unwrap();
        let calculator = LevelsCalculator::new(
            FakeSource::new(FakeResponse::Bars(session_bars(8, true))),
            dir.path().join("data.json"),
            "SPY",
        );

        match calculator.update_levels(eastern(11, 13, 5)).await.unwrap() {
            UpdateOutcome::Updated(report) => {
                assert_eq!(report.update_type, UpdateType::Midday);
                // Morning close of the last day: 100 + 7 + 1
                assert_eq!(report.prior_close, 108.0);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_override_beats_clock() {
        let dir = TempDir::new().unwrap();
        let calculator = LevelsCalculator::new(
            FakeSource::new(FakeResponse::Bars(session_bars(8, true))),
            dir.path().join("data.json"),
            "SPY",
        )
        .with_update_override(Some(UpdateType::Midday));

        match calculator.update_levels(eastern(11, 16, 10)).await.unwrap() {
            UpdateOutcome::Updated(report) => assert_eq!(report.update_type, UpdateType::Midday),
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_history_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");
        let calculator =
            LevelsCalculator::new(FakeSource::new(FakeResponse::Bars(session_bars(5, true))), &path, "SPY");

        let outcome = calculator.update_levels(eastern(11, 16, 10)).await.unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::InsufficientHistory {
                candles: 10,
                required: 15
            }
        );
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stored_history_completes_short_fetch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");

        // Seed the file with the first week of candles.
        let first = LevelsCalculator::new(
            FakeSource::new(FakeResponse::Bars(session_bars(8, true))),
            &path,
            "SPY",
        );
        assert!(matches!(
            first.update_levels(eastern(11, 16, 10)).await.unwrap(),
            UpdateOutcome::Updated(_)
        ));

        // A later run that only sees one new day still has enough history.
        let next_day = vec![bar(12, 10, 0, 120.0), bar(12, 14, 0, 121.0)];
        let second = LevelsCalculator::new(FakeSource::new(FakeResponse::Bars(next_day)), &path, "SPY");
        match second.update_levels(eastern(12, 16, 10)).await.unwrap() {
            UpdateOutcome::Updated(report) => {
                assert_eq!(report.candle_count, 18);
                assert_eq!(report.prior_close, 121.0);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_target_candle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");
        let calculator = LevelsCalculator::new(
            FakeSource::new(FakeResponse::Bars(session_bars(16, false))),
            &path,
            "SPY",
        );

        let outcome = calculator.update_levels(eastern(20, 16, 10)).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::MissingTargetCandle(SessionPeriod::Afternoon));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_empty_or_failed_fetch_is_no_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");

        let empty = LevelsCalculator::new(FakeSource::new(FakeResponse::Bars(Vec::new())), &path, "SPY");
        assert_eq!(empty.update_levels(eastern(11, 16, 10)).await.unwrap(), UpdateOutcome::NoData);

        let failing = LevelsCalculator::new(FakeSource::new(FakeResponse::Fail), &path, "SPY");
        assert_eq!(failing.update_levels(eastern(11, 16, 10)).await.unwrap(), UpdateOutcome::NoData);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unclosed_afternoon_is_not_stored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");

        // 15:05 EST, before the afternoon block closes.
        let early = LevelsCalculator::new(FakeSource::new(FakeResponse::Bars(winter_bars())), &path, "SPY");
        match early.update_levels(january_utc(22, 20, 5)).await.unwrap() {
            UpdateOutcome::Updated(report) => {
                assert_eq!(report.update_type, UpdateType::Close);
                // Last closed afternoon is January 21st: 100 + 13 + 2
                assert_eq!(report.prior_close, 115.0);
                assert_eq!(report.candle_count, 29);
            }
            other => panic!("expected update, got {:?}", other),
        }
        let stored = early.store.load().await.unwrap();
        assert!(stored.candles.iter().any(|c| c.timestamp == "2024-01-22 09:00-13:00"));
        assert!(!stored.candles.iter().any(|c| c.timestamp == "2024-01-22 13:00-16:00"));

        // Next day, the full January 22nd session is available.
        let mut full_day = winter_bars();
        full_day.push(bar_in(1, 22, 15, 55, 110.0));
        let next = LevelsCalculator::new(FakeSource::new(FakeResponse::Bars(full_day)), &path, "SPY");
        match next.update_levels(january_utc(23, 21, 10)).await.unwrap() {
            UpdateOutcome::Updated(report) => assert_eq!(report.prior_close, 110.0),
            other => panic!("expected update, got {:?}", other),
        }
        let stored = next.store.load().await.unwrap();
        let afternoon = stored
            .candles
            .iter()
            .find(|c| c.timestamp == "2024-01-22 13:00-16:00")
            .unwrap();
        assert_eq!(afternoon.close, 110.0);
    }

    #[tokio::test]
    async fn test_fresh_fetch_repairs_stored_candle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");

        let first = LevelsCalculator::new(FakeSource::new(FakeResponse::Bars(session_bars(8, true))), &path, "SPY");
        assert!(matches!(
            first.update_levels(eastern(11, 16, 10)).await.unwrap(),
            UpdateOutcome::Updated(_)
        ));

        // A later fetch carries a bar the first one missed.
        let mut bars = session_bars(8, true);
        bars.push(bar(11, 15, 58, 150.0));
        let second = LevelsCalculator::new(FakeSource::new(FakeResponse::Bars(bars)), &path, "SPY");
        match second.update_levels(eastern(11, 16, 40)).await.unwrap() {
            UpdateOutcome::Updated(report) => assert_eq!(report.prior_close, 150.0),
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scheduled_winter_runs_skip_early_triggers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");
        let calculator = LevelsCalculator::new(FakeSource::new(FakeResponse::Bars(winter_bars())), &path, "SPY")
            .with_schedule_guard(true);

        // EDT crons land at 12:05 and 15:05 EST.
        assert_eq!(
            calculator.update_levels(january_utc(22, 17, 5)).await.unwrap(),
            UpdateOutcome::OffSchedule
        );
        assert_eq!(
            calculator.update_levels(january_utc(22, 20, 5)).await.unwrap(),
            UpdateOutcome::OffSchedule
        );
        assert!(calculator.source.requests.lock().unwrap().is_empty());
        assert!(!path.exists());

        // EST cron at 13:05 publishes the 1PM levels off the morning block.
        match calculator.update_levels(january_utc(22, 18, 5)).await.unwrap() {
            UpdateOutcome::Updated(report) => {
                assert_eq!(report.update_type, UpdateType::Midday);
                assert_eq!(report.prior_close, 100.0);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_override_bypasses_schedule_guard() {
        let dir = TempDir::new().unwrap();
        let calculator = LevelsCalculator::new(
            FakeSource::new(FakeResponse::Bars(winter_bars())),
            dir.path().join("data.json"),
            "SPY",
        )
        .with_schedule_guard(true)
        .with_update_override(Some(UpdateType::Close));

        assert!(matches!(
            calculator.update_levels(january_utc(22, 17, 5)).await.unwrap(),
            UpdateOutcome::Updated(_)
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_lookback_is_config_error() {
        let dir = TempDir::new().unwrap();
        for days in [i64::MAX, -1] {
            let calculator = LevelsCalculator::new(
                FakeSource::new(FakeResponse::Bars(session_bars(8, true))),
                dir.path().join("data.json"),
                "SPY",
            )
            .with_lookback_days(days);

            let err = calculator.update_levels(eastern(11, 16, 10)).await.unwrap_err();
            assert!(matches!(err, LevelsError::Config(_)));
        }
    }

    #[test]
    fn test_report_lists_levels_high_to_low() {
        let report = UpdateReport {
            symbol: "SPY".to_string(),
            update_type: UpdateType::Close,
            target_period: SessionPeriod::Afternoon,
            prior_close: 500.0,
            current_atr: 4.0,
            atr_period: 14,
            levels: calculate_levels(500.0, 4.0),
            candle_count: 30,
            atr_count: 16,
        };

        let text = report.to_string();
        assert!(text.starts_with("=== SPY 4PM_update LEVELS UPDATE ==="));
        assert!(text.contains("Prior 4H Close (afternoon): 500.00"));
        assert!(text.contains("Current ATR(14): 4.00"));
        let top = text.find("Level_+1.0: 504.00").unwrap();
        let bottom = text.find("Level_-1.0: 496.00").unwrap();
        assert!(top < bottom);
        assert!(text.ends_with("ATR calculation periods: 16"));
    }
}
