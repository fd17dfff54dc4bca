use crate::data::FourHourCandle;
use crate::error::{LevelsError, LevelsResult};
use crate::indicators::AtrPoint;
use crate::levels::{LevelSet, UpdateType};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Levels published by the latest successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelsSnapshot {
    pub update_type: UpdateType,
    pub timestamp: DateTime<FixedOffset>,
    pub prior_4h_close: f64,
    pub current_atr: f64,
    pub levels: LevelSet,
}

/// Contents of the levels data file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelsData {
    #[serde(rename = "4h_candles", default)]
    pub candles: Vec<FourHourCandle>,
    #[serde(default)]
    pub atr_values: Vec<AtrPoint>,
    #[serde(
        default,
        serialize_with = "serialize_snapshot",
        deserialize_with = "deserialize_snapshot"
    )]
    pub current_levels: Option<LevelsSnapshot>,
}

// No snapshot is written as `{}`.
fn serialize_snapshot<S: Serializer>(
    snapshot: &Option<LevelsSnapshot>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match snapshot {
        Some(snapshot) => snapshot.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

fn deserialize_snapshot<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<LevelsSnapshot>, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(ref map) if map.is_empty() => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Merges freshly aggregated candles into the stored history.
///
/// A fresh candle replaces a stored one with the same label. Every fetch covers
/// the whole lookback window, so the fresh copy holds at least the bars the stored
/// copy was built from, and a block stored from delayed data gets repaired on
/// the next run.
///
/// # Arguments
/// * `existing`: Candles loaded from the data file
/// * `fresh`: Closed candles aggregated from this run's fetch
/// * `max_candles`: Number of most recent candles to keep
///
/// # Returns
/// The merged candles sorted by label, at most `max_candles` long
pub fn merge_candles(
    existing: Vec<FourHourCandle>,
    fresh: Vec<FourHourCandle>,
    max_candles: usize,
) -> Vec<FourHourCandle> {
    let replaced: HashSet<&str> = fresh.iter().map(|c| c.timestamp.as_str()).collect();

    let mut merged: Vec<FourHourCandle> = existing
        .into_iter()
        .filter(|c| !replaced.contains(c.timestamp.as_str()))
        .collect();
    merged.extend(fresh.iter().cloned());
    merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    if merged.len() > max_candles {
        merged.drain(..merged.len() - max_candles);
    }
    merged
}

/// JSON file store for [`LevelsData`].
///
/// Owns the path of the levels data file that the workflow commits back to the
/// repository.
///
/// # Key Features
/// * A missing file loads as empty history, so the first run needs no seed file
/// * `{}` or `null` for `current_levels` loads as "no snapshot yet"
/// * Writes go through a sibling `.tmp` file and a rename
/// * Output is pretty-printed with a trailing newline to keep commit diffs small
pub struct LevelsStore {
    path: PathBuf,
}

impl LevelsStore {
    /// Creates a store for the given data file path.
    ///
    /// Nothing is read or created until [`LevelsStore::load`] or
    /// [`LevelsStore::save`] is called.
    ///
    /// # Arguments
    /// * `path`: Location of the JSON data file, usually `spy_levels_data.json`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the data file, returning empty history when it does not exist yet.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file exists but cannot be read
    /// - The contents are not a valid levels data document
    pub async fn load(&self) -> LevelsResult<LevelsData> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "No existing data file, starting fresh");
                return Ok(LevelsData::default());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&contents).map_err(|e| self.storage_error(e))
    }

    /// Writes pretty-printed JSON through a sibling temp file and a rename, so
    /// a failed run never leaves a truncated data file behind.
    pub async fn save(&self, data: &LevelsData) -> LevelsResult<()> {
        let mut contents = serde_json::to_string_pretty(data)?;
        contents.push('\n');

        let tmp_path = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        tracing::debug!(path = %self.path.display(), bytes = contents.len(), "Saved levels data");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn storage_error(&self, e: impl std::fmt::Display) -> LevelsError {
        LevelsError::Storage {
            path: self.path.display().to_string(),
            message: e.to_string(),
        }
    }
}
