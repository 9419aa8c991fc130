//! Core data types shared across the measurement and classification engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single heart-rate sample from the sample source
///
/// Immutable once captured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// When the sample was recorded
    pub timestamp: DateTime<Utc>,

    /// Beats per minute, always > 0 for samples built through [`HeartRateSample::new`]
    pub bpm: f64,
}

impl HeartRateSample {
    /// Create a validated sample, rejecting non-positive or non-finite bpm
    pub fn new(timestamp: DateTime<Utc>, bpm: f64) -> Option<Self> {
        if bpm.is_finite() && bpm > 0.0 {
            Some(Self { timestamp, bpm })
        } else {
            None
        }
    }

    /// Whether this sample can take part in an HRV computation
    pub fn is_usable(&self) -> bool {
        self.bpm.is_finite() && self.bpm > 0.0
    }
}

/// Heart rate variability reading derived from a short run of samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HrvReading {
    /// SDNN in milliseconds
    pub value_ms: f64,

    /// Number of samples the value was computed from
    pub sample_count: usize,

    /// Timestamp of the last sample used
    pub produced_at: DateTime<Utc>,
}

/// User-supplied label attached to a training reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StressLabel {
    Stressed,
    Calm,
}

impl fmt::Display for StressLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StressLabel::Stressed => write!(f, "stressed"),
            StressLabel::Calm => write!(f, "calm"),
        }
    }
}

impl std::str::FromStr for StressLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stressed" | "stress" | "yes" => Ok(StressLabel::Stressed),
            "calm" | "relaxed" | "no" => Ok(StressLabel::Calm),
            _ => Err(format!("Invalid label: {}", s)),
        }
    }
}

/// Which pipeline live readings are routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveMode {
    Training,
    Predicting,
}

impl fmt::Display for ActiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveMode::Training => write!(f, "Training"),
            ActiveMode::Predicting => write!(f, "Predicting"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
    Other,
    #[default]
    Unspecified,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::Female => write!(f, "Female"),
            Gender::Male => write!(f, "Male"),
            Gender::Other => write!(f, "Other"),
            Gender::Unspecified => write!(f, "Unspecified"),
        }
    }
}

impl std::str::FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "female" | "f" => Ok(Gender::Female),
            "male" | "m" => Ok(Gender::Male),
            "other" => Ok(Gender::Other),
            "unspecified" | "" => Ok(Gender::Unspecified),
            _ => Err(format!("Invalid gender: {}", s)),
        }
    }
}

/// Demographic context captured when training starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Demographics {
    pub age: Option<u8>,
    pub gender: Gender,
}

/// "X of the last Y" smoothing configuration
///
/// Maintains `1 <= stressed_count <= window_size <= 10`. Out-of-range input is
/// never rejected; it is clamped, and moving one bound past the other drags
/// the other bound along with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitivityConfig {
    stressed_count: u8,
    window_size: u8,
}

impl SensitivityConfig {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    /// Build a configuration, clamping both values into range
    pub fn new(stressed_count: u8, window_size: u8) -> Self {
        let window_size = window_size.clamp(Self::MIN, Self::MAX);
        let stressed_count = stressed_count.clamp(Self::MIN, window_size);
        Self {
            stressed_count,
            window_size,
        }
    }

    /// Number of stressed decisions (X) required within the window
    pub fn stressed_count(&self) -> u8 {
        self.stressed_count
    }

    /// Number of recent decisions (Y) kept in the window
    pub fn window_size(&self) -> u8 {
        self.window_size
    }

    /// Set X; raises Y when X would exceed it
    pub fn set_stressed_count(&mut self, count: u8) {
        let count = count.clamp(Self::MIN, Self::MAX);
        self.stressed_count = count;
        if self.window_size < count {
            self.window_size = count;
        }
    }

    /// Set Y; lowers X when Y would fall below it
    pub fn set_window_size(&mut self, size: u8) {
        let size = size.clamp(Self::MIN, Self::MAX);
        self.window_size = size;
        if self.stressed_count > size {
            self.stressed_count = size;
        }
    }
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            stressed_count: 3,
            window_size: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_validation() {
        let now = Utc::now();
        assert!(HeartRateSample::new(now, 72.0).is_some());
        assert!(HeartRateSample::new(now, 0.0).is_none());
        assert!(HeartRateSample::new(now, -5.0).is_none());
        assert!(HeartRateSample::new(now, f64::NAN).is_none());
    }

    #[test]
    fn test_raising_stressed_count_raises_window() {
        let mut sensitivity = SensitivityConfig::new(3, 5);
        sensitivity.set_stressed_count(7);
        assert_eq!(sensitivity.stressed_count(), 7);
        assert_eq!(sensitivity.window_size(), 7);
    }

    #[test]
    fn test_lowering_window_lowers_stressed_count() {
        let mut sensitivity = SensitivityConfig::new(4, 6);
        sensitivity.set_window_size(2);
        assert_eq!(sensitivity.window_size(), 2);
        assert_eq!(sensitivity.stressed_count(), 2);
    }

    #[test]
    fn test_sensitivity_clamps_out_of_range() {
        let sensitivity = SensitivityConfig::new(0, 42);
        assert_eq!(sensitivity.stressed_count(), 1);
        assert_eq!(sensitivity.window_size(), 10);

        let sensitivity = SensitivityConfig::new(9, 4);
        assert_eq!(sensitivity.stressed_count(), 4);
        assert_eq!(sensitivity.window_size(), 4);
    }

    #[test]
    fn test_label_parsing() {
        assert_eq!("Stressed".parse::<StressLabel>().unwrap(), StressLabel::Stressed);
        assert_eq!("no".parse::<StressLabel>().unwrap(), StressLabel::Calm);
        assert!("maybe".parse::<StressLabel>().is_err());
    }
}
