//! Personalized threshold calibration
//!
//! During training the user labels each measurement as "stressed" or "calm".
//! Once enough labeled HRV readings exist, a personal threshold is derived and
//! the monitor switches to predicting mode.
//!
//! # Completion rules
//!
//! - **Median of recent** (default): both lists hold at least 3 readings; the
//!   threshold is the midpoint between the median of the last 3 stressed
//!   readings and the median of the last 3 calm readings. Medians keep a
//!   single outlier from dragging the threshold.
//! - **Legacy mean**: at least 6 labeled readings in total, collected over at
//!   least one hour; threshold is the mean stressed reading, or 80% of the
//!   mean calm reading when no stressed reading exists. Kept for
//!   compatibility with records calibrated that way.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use statrs::statistics::{Data, OrderStatistics, Statistics};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{ActiveMode, Demographics, Gender, SensitivityConfig, StressLabel};
use crate::store::{keys, KeyValueStore};

/// Threshold used before any labeled data exists (ms)
pub const DEFAULT_THRESHOLD_MS: f64 = 50.0;

/// Share of the calm level used when only calm readings exist
pub const CALM_FALLBACK_FACTOR: f64 = 0.8;

/// How many recent readings of each label the median rule looks at
pub const MEDIAN_WINDOW: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationPolicy {
    /// Midpoint of the medians of the most recent readings of each label
    MedianOfRecent {
        /// Readings required per label (default: 3)
        min_per_label: usize,
        /// Recent readings per label fed to the median (default: 3)
        recent: usize,
    },
    /// Mean of stressed readings after enough sessions over enough time
    LegacyMean {
        /// Labeled readings required in total (default: 6)
        min_total: usize,
        /// Time since training start required, in seconds (default: 3600)
        min_span_secs: i64,
    },
}

impl Default for CalibrationPolicy {
    fn default() -> Self {
        CalibrationPolicy::MedianOfRecent {
            min_per_label: MEDIAN_WINDOW,
            recent: MEDIAN_WINDOW,
        }
    }
}

impl CalibrationPolicy {
    pub fn legacy() -> Self {
        CalibrationPolicy::LegacyMean {
            min_total: 6,
            min_span_secs: 3600,
        }
    }
}

/// Calibration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Threshold used before any labeled data exists (default: 50.0)
    pub default_threshold_ms: f64,

    /// Discard the persisted record on every launch (default: false)
    pub reset_on_launch: bool,

    pub policy: CalibrationPolicy,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            default_threshold_ms: DEFAULT_THRESHOLD_MS,
            reset_on_launch: false,
            policy: CalibrationPolicy::default(),
        }
    }
}

/// Persisted calibration state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub training_active: bool,
    pub training_start_date: Option<DateTime<Utc>>,
    pub stressed_readings: Vec<f64>,
    pub calm_readings: Vec<f64>,
    pub custom_threshold: Option<f64>,
    pub sensitivity: SensitivityConfig,
    pub demographics: Demographics,
    pub active_mode: ActiveMode,
}

impl Default for CalibrationRecord {
    fn default() -> Self {
        Self {
            training_active: true,
            training_start_date: None,
            stressed_readings: Vec::new(),
            calm_readings: Vec::new(),
            custom_threshold: None,
            sensitivity: SensitivityConfig::default(),
            demographics: Demographics::default(),
            active_mode: ActiveMode::Training,
        }
    }
}

fn read<T, K>(store: &K, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
    K: KeyValueStore + ?Sized,
{
    store
        .get(key)?
        .map(|value| {
            serde_json::from_value(value).map_err(|e| StoreError::Serialization {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Read a sensitivity bound, saturating any number into `1..=10`
///
/// Non-numeric values fall back to `default`.
fn read_sensitivity<K>(store: &K, key: &str, default: u8) -> Result<u8, StoreError>
where
    K: KeyValueStore + ?Sized,
{
    let Some(value) = store.get(key)? else {
        return Ok(default);
    };
    match value.as_f64().filter(|v| v.is_finite()) {
        Some(v) => {
            let min = f64::from(SensitivityConfig::MIN);
            let max = f64::from(SensitivityConfig::MAX);
            Ok(v.round().clamp(min, max) as u8)
        }
        None => {
            warn!(key, %value, "stored sensitivity is not a number, using default");
            Ok(default)
        }
    }
}

impl CalibrationRecord {
    /// Load the record from its logical keys, defaulting anything missing
    ///
    /// Stored sensitivity values outside `1..=10` are clamped.
    pub fn load<K: KeyValueStore + ?Sized>(store: &K) -> Result<Self, StoreError> {
        let defaults = Self::default();

        let stressed_count = read_sensitivity(
            store,
            keys::SENSITIVITY_STRESSED_COUNT,
            defaults.sensitivity.stressed_count(),
        )?;
        let window_size = read_sensitivity(
            store,
            keys::SENSITIVITY_WINDOW_SIZE,
            defaults.sensitivity.window_size(),
        )?;

        Ok(Self {
            training_active: read(store, keys::TRAINING_ACTIVE)?.unwrap_or(defaults.training_active),
            training_start_date: read(store, keys::TRAINING_START_DATE)?,
            stressed_readings: read(store, keys::STRESSED_READINGS)?.unwrap_or_default(),
            calm_readings: read(store, keys::CALM_READINGS)?.unwrap_or_default(),
            custom_threshold: read(store, keys::CUSTOM_THRESHOLD)?,
            sensitivity: SensitivityConfig::new(stressed_count, window_size),
            demographics: Demographics {
                age: read(store, keys::USER_AGE)?,
                gender: read::<Gender, _>(store, keys::USER_GENDER)?.unwrap_or_default(),
            },
            active_mode: read(store, keys::ACTIVE_MODE)?.unwrap_or(defaults.active_mode),
        })
    }

    /// Write every logical key
    pub fn save<K: KeyValueStore + ?Sized>(&self, store: &mut K) -> Result<(), StoreError> {
        store.set(keys::TRAINING_ACTIVE, json!(self.training_active))?;
        store.set(keys::TRAINING_START_DATE, json!(self.training_start_date))?;
        store.set(keys::STRESSED_READINGS, json!(self.stressed_readings))?;
        store.set(keys::CALM_READINGS, json!(self.calm_readings))?;
        store.set(keys::CUSTOM_THRESHOLD, json!(self.custom_threshold))?;
        store.set(keys::USER_AGE, json!(self.demographics.age))?;
        store.set(keys::USER_GENDER, json!(self.demographics.gender))?;
        store.set(keys::SENSITIVITY_STRESSED_COUNT, json!(self.sensitivity.stressed_count()))?;
        store.set(keys::SENSITIVITY_WINDOW_SIZE, json!(self.sensitivity.window_size()))?;
        store.set(keys::ACTIVE_MODE, json!(self.active_mode))?;
        Ok(())
    }

    pub fn total_readings(&self) -> usize {
        self.stressed_readings.len() + self.calm_readings.len()
    }
}

/// What happened when a labeled reading was recorded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordOutcome {
    pub label: StressLabel,
    /// Stressed readings still guide the user through an intervention
    pub intervene: bool,
    /// Threshold learned if this reading completed training
    pub completed_threshold: Option<f64>,
}

/// Median of a slice, `None` when empty
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut data = Data::new(values.to_vec());
    Some(data.median())
}

fn last_n(values: &[f64], n: usize) -> &[f64] {
    &values[values.len().saturating_sub(n)..]
}

/// Owns the calibration record and applies the completion policy
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    record: CalibrationRecord,
    policy: CalibrationPolicy,
    default_threshold: f64,
}

impl CalibrationEngine {
    pub fn new(record: CalibrationRecord, policy: CalibrationPolicy, default_threshold: f64) -> Self {
        Self {
            record,
            policy,
            default_threshold,
        }
    }

    /// Load the persisted record from `store`
    pub fn load<K: KeyValueStore + ?Sized>(
        store: &K,
        policy: CalibrationPolicy,
        default_threshold: f64,
    ) -> Result<Self, StoreError> {
        let record = CalibrationRecord::load(store)?;
        debug!(
            mode = %record.active_mode,
            stressed = record.stressed_readings.len(),
            calm = record.calm_readings.len(),
            "calibration record loaded"
        );
        Ok(Self::new(record, policy, default_threshold))
    }

    pub fn record(&self) -> &CalibrationRecord {
        &self.record
    }

    pub fn policy(&self) -> &CalibrationPolicy {
        &self.policy
    }

    pub fn mode(&self) -> ActiveMode {
        self.record.active_mode
    }

    pub fn is_training(&self) -> bool {
        self.record.training_active
    }

    pub fn sensitivity(&self) -> SensitivityConfig {
        self.record.sensitivity
    }

    /// Begin a fresh training phase
    pub fn start_training<K: KeyValueStore + ?Sized>(
        &mut self,
        demographics: Demographics,
        sensitivity: SensitivityConfig,
        now: DateTime<Utc>,
        store: &mut K,
    ) -> Result<(), StoreError> {
        self.record.stressed_readings.clear();
        self.record.calm_readings.clear();
        self.record.custom_threshold = None;
        self.record.training_active = true;
        self.record.training_start_date = Some(now);
        self.record.active_mode = ActiveMode::Training;
        self.record.demographics = demographics;
        self.record.sensitivity = sensitivity;
        info!(age = ?demographics.age, gender = %demographics.gender, "training started");
        self.record.save(store)
    }

    /// Append a labeled reading and check whether training is complete
    pub fn record_labeled_reading<K: KeyValueStore + ?Sized>(
        &mut self,
        hrv_ms: f64,
        label: StressLabel,
        now: DateTime<Utc>,
        store: &mut K,
    ) -> Result<RecordOutcome, StoreError> {
        if !self.record.training_active {
            warn!(%label, hrv_ms, "labeled reading recorded outside training");
        }
        if self.record.training_start_date.is_none() {
            self.record.training_start_date = Some(now);
        }

        match label {
            StressLabel::Stressed => self.record.stressed_readings.push(hrv_ms),
            StressLabel::Calm => self.record.calm_readings.push(hrv_ms),
        }
        info!(
            %label,
            hrv_ms,
            stressed = self.record.stressed_readings.len(),
            calm = self.record.calm_readings.len(),
            "labeled reading recorded"
        );

        let completed_threshold = if self.record.training_active {
            self.check_completion(now)
        } else {
            None
        };

        match completed_threshold {
            Some(threshold) => self.complete(threshold, store)?,
            None => self.record.save(store)?,
        }

        Ok(RecordOutcome {
            label,
            intervene: label == StressLabel::Stressed,
            completed_threshold,
        })
    }

    /// Threshold to adopt if the completion rule is satisfied at `now`
    pub fn check_completion(&self, now: DateTime<Utc>) -> Option<f64> {
        let stressed = &self.record.stressed_readings;
        let calm = &self.record.calm_readings;

        match self.policy {
            CalibrationPolicy::MedianOfRecent { min_per_label, recent } => {
                if stressed.len() < min_per_label.max(1) || calm.len() < min_per_label.max(1) {
                    return None;
                }
                Self::median_midpoint(stressed, calm, recent.max(1))
            }
            CalibrationPolicy::LegacyMean { min_total, min_span_secs } => {
                if self.record.total_readings() < min_total {
                    return None;
                }
                let start = self.record.training_start_date?;
                if now - start < Duration::seconds(min_span_secs) {
                    return None;
                }
                if !stressed.is_empty() {
                    Some(stressed.iter().mean())
                } else if !calm.is_empty() {
                    Some(CALM_FALLBACK_FACTOR * calm.iter().mean())
                } else {
                    None
                }
            }
        }
    }

    /// Provisional threshold usable before training completes
    pub fn tentative_threshold(&self) -> f64 {
        let stressed = &self.record.stressed_readings;
        let calm = &self.record.calm_readings;
        let window = self.recent_window();

        if stressed.len() >= window && calm.len() >= window {
            if let Some(threshold) = Self::median_midpoint(stressed, calm, window) {
                return threshold;
            }
        }
        if let (Some(s), Some(c)) = (median(stressed), median(calm)) {
            return (s + c) / 2.0;
        }
        if let Some(s) = median(stressed) {
            return s;
        }
        if let Some(c) = median(calm) {
            return CALM_FALLBACK_FACTOR * c;
        }
        self.default_threshold
    }

    /// Threshold the classifier should use right now
    pub fn current_threshold(&self) -> f64 {
        self.record
            .custom_threshold
            .unwrap_or_else(|| self.tentative_threshold())
    }

    /// Clear readings, threshold and demographics and re-enter training
    pub fn reset<K: KeyValueStore + ?Sized>(
        &mut self,
        now: DateTime<Utc>,
        store: &mut K,
    ) -> Result<(), StoreError> {
        self.record.stressed_readings.clear();
        self.record.calm_readings.clear();
        self.record.custom_threshold = None;
        self.record.demographics = Demographics::default();
        self.record.training_active = true;
        self.record.training_start_date = Some(now);
        self.record.active_mode = ActiveMode::Training;
        info!("calibration reset");
        self.record.save(store)
    }

    /// Set X; Y follows if needed
    pub fn set_sensitivity_stressed_count<K: KeyValueStore + ?Sized>(
        &mut self,
        count: u8,
        store: &mut K,
    ) -> Result<SensitivityConfig, StoreError> {
        self.record.sensitivity.set_stressed_count(count);
        self.record.save(store)?;
        Ok(self.record.sensitivity)
    }

    /// Set Y; X follows if needed
    pub fn set_sensitivity_window_size<K: KeyValueStore + ?Sized>(
        &mut self,
        size: u8,
        store: &mut K,
    ) -> Result<SensitivityConfig, StoreError> {
        self.record.sensitivity.set_window_size(size);
        self.record.save(store)?;
        Ok(self.record.sensitivity)
    }

    pub fn set_demographics<K: KeyValueStore + ?Sized>(
        &mut self,
        demographics: Demographics,
        store: &mut K,
    ) -> Result<(), StoreError> {
        self.record.demographics = demographics;
        self.record.save(store)
    }

    fn complete<K: KeyValueStore + ?Sized>(&mut self, threshold: f64, store: &mut K) -> Result<(), StoreError> {
        self.record.custom_threshold = Some(threshold);
        self.record.training_active = false;
        self.record.active_mode = ActiveMode::Predicting;
        info!(
            threshold,
            stressed = self.record.stressed_readings.len(),
            calm = self.record.calm_readings.len(),
            "training complete"
        );
        self.record.save(store)
    }

    fn recent_window(&self) -> usize {
        match self.policy {
            CalibrationPolicy::MedianOfRecent { recent, .. } => recent.max(1),
            CalibrationPolicy::LegacyMean { .. } => MEDIAN_WINDOW,
        }
    }

    fn median_midpoint(stressed: &[f64], calm: &[f64], window: usize) -> Option<f64> {
        let s = median(last_n(stressed, window))?;
        let c = median(last_n(calm, window))?;
        Some((s + c) / 2.0)
    }
}
