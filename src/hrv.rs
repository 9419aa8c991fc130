//! Heart Rate Variability (HRV) calculation
//!
//! Converts a short run of heart-rate samples into inter-beat intervals and
//! summarizes them with SDNN, the standard deviation of the intervals.
//!
//! # Background
//!
//! The wearable only exposes averaged heart rate, not beat-to-beat RR
//! intervals, so each sample is turned into one synthetic interval:
//!
//! ```text
//! interval_ms = 60000 / max(bpm, 1)
//! ```
//!
//! SDNN is then the *sample* standard deviation (Bessel's correction) of those
//! intervals. Lower SDNN means less variability, which is read as higher
//! stress.
//!
//! A measurement session samples every 10 seconds for a minute, so a reading
//! uses at most 6 points. Streams recorded at a finer resolution are decimated
//! (every other sample) before being truncated to 6 points.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use thiserror::Error;

use crate::models::{HeartRateSample, HrvReading};

/// Minimum usable samples for a reading
pub const MIN_SAMPLES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HrvError {
    #[error("Insufficient samples: {usable} usable, {required} required")]
    InsufficientSamples { usable: usize, required: usize },
}

/// How synthetic inter-beat intervals are rounded before SDNN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalRounding {
    /// Round to the nearest whole millisecond
    Nearest,
    /// Keep the unrounded interval
    Raw,
}

/// HRV calculation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HrvConfig {
    /// Interval rounding mode
    pub rounding: IntervalRounding,

    /// Maximum number of samples used for one reading (default: 6)
    pub max_points: usize,

    /// Intended spacing between samples in seconds (default: 10)
    pub cadence_secs: u32,
}

impl Default for HrvConfig {
    fn default() -> Self {
        Self {
            rounding: IntervalRounding::Nearest,
            max_points: 6,
            cadence_secs: 10,
        }
    }
}

/// SDNN calculator over heart-rate samples
#[derive(Debug, Clone, Default)]
pub struct HrvCalculator {
    config: HrvConfig,
}

impl HrvCalculator {
    pub fn new(config: HrvConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HrvConfig {
        &self.config
    }

    /// Compute an HRV reading from an ordered run of samples
    ///
    /// Fails with [`HrvError::InsufficientSamples`] when fewer than 2 usable
    /// samples remain. That is an expected "not enough data yet" signal.
    pub fn compute(&self, samples: &[HeartRateSample]) -> Result<HrvReading, HrvError> {
        let usable: Vec<&HeartRateSample> = samples.iter().filter(|s| s.is_usable()).collect();
        if usable.len() < MIN_SAMPLES {
            return Err(HrvError::InsufficientSamples {
                usable: usable.len(),
                required: MIN_SAMPLES,
            });
        }

        let selected = self.select_points(&usable);
        let intervals: Vec<f64> = selected.iter().map(|s| self.interval_ms(s.bpm)).collect();

        let value_ms = Self::sdnn(&intervals).ok_or(HrvError::InsufficientSamples {
            usable: intervals.len(),
            required: MIN_SAMPLES,
        })?;

        // select_points never returns fewer than MIN_SAMPLES entries here
        let produced_at = selected[selected.len() - 1].timestamp;

        Ok(HrvReading {
            value_ms,
            sample_count: selected.len(),
            produced_at,
        })
    }

    /// Convert a heart rate into an inter-beat interval in milliseconds
    pub fn interval_ms(&self, bpm: f64) -> f64 {
        let interval = 60_000.0 / bpm.max(1.0);
        match self.config.rounding {
            IntervalRounding::Nearest => interval.round(),
            IntervalRounding::Raw => interval,
        }
    }

    /// Sample standard deviation of the intervals, `None` below 2 values
    pub fn sdnn(intervals: &[f64]) -> Option<f64> {
        if intervals.len() < MIN_SAMPLES {
            return None;
        }
        Some(intervals.iter().std_dev())
    }

    /// Pick the points used for one reading
    ///
    /// More than `max_points` samples recorded faster than the intended
    /// cadence are decimated to indices 0, 2, 4, ... first.
    fn select_points<'a>(&self, usable: &[&'a HeartRateSample]) -> Vec<&'a HeartRateSample> {
        let max_points = self.config.max_points.max(MIN_SAMPLES);

        let decimated: Vec<&HeartRateSample> =
            if usable.len() > max_points && self.is_oversampled(usable) {
                usable.iter().step_by(2).copied().collect()
            } else {
                usable.to_vec()
            };

        decimated.into_iter().take(max_points).collect()
    }

    fn is_oversampled(&self, usable: &[&HeartRateSample]) -> bool {
        let (first, last) = match (usable.first(), usable.last()) {
            (Some(first), Some(last)) if usable.len() > 1 => (first, last),
            _ => return false,
        };
        let span_ms = (last.timestamp - first.timestamp).num_milliseconds() as f64;
        let mean_spacing_ms = span_ms / (usable.len() - 1) as f64;
        mean_spacing_ms < f64::from(self.config.cadence_secs) * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn samples_every(spacing_secs: i64, bpms: &[f64]) -> Vec<HeartRateSample> {
        bpms.iter()
            .enumerate()
            .map(|(i, &bpm)| HeartRateSample {
                timestamp: base_time() + Duration::seconds(spacing_secs * i as i64),
                bpm,
            })
            .collect()
    }

    #[test]
    fn test_constant_heart_rate_has_zero_sdnn() {
        let calc = HrvCalculator::default();
        let samples = samples_every(10, &[60.0; 6]);

        let reading = calc.compute(&samples).unwrap();
        assert_eq!(reading.value_ms, 0.0);
        assert_eq!(reading.sample_count, 6);
        assert_eq!(reading.produced_at, base_time() + Duration::seconds(50));
    }

    #[test]
    fn test_sdnn_uses_bessel_correction() {
        // intervals 1000 and 800 ms: mean 900, sum of squares 20000, n-1 = 1
        let calc = HrvCalculator::default();
        let samples = samples_every(10, &[60.0, 75.0]);

        let reading = calc.compute(&samples).unwrap();
        let expected = (20_000.0f64).sqrt();
        assert!((reading.value_ms - expected).abs() < 1e-9);
    }

    #[test]
    fn test_sdnn_matches_formula() {
        let intervals = [1000.0, 950.0, 1020.0, 980.0, 1010.0, 940.0];
        let n = intervals.len() as f64;
        let mean = intervals.iter().sum::<f64>() / n;
        let expected =
            (intervals.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();

        let sdnn = HrvCalculator::sdnn(&intervals).unwrap();
        assert!((sdnn - expected).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_samples() {
        let calc = HrvCalculator::default();

        assert_eq!(
            calc.compute(&[]),
            Err(HrvError::InsufficientSamples { usable: 0, required: 2 })
        );
        assert_eq!(
            calc.compute(&samples_every(10, &[72.0])),
            Err(HrvError::InsufficientSamples { usable: 1, required: 2 })
        );
    }

    #[test]
    fn test_unusable_samples_are_ignored() {
        let calc = HrvCalculator::default();
        let samples = samples_every(10, &[70.0, 0.0, f64::NAN]);

        assert!(matches!(
            calc.compute(&samples),
            Err(HrvError::InsufficientSamples { usable: 1, .. })
        ));
    }

    #[test]
    fn test_rounding_modes() {
        let nearest = HrvCalculator::default();
        assert_eq!(nearest.interval_ms(70.0), 857.0);

        let raw = HrvCalculator::new(HrvConfig {
            rounding: IntervalRounding::Raw,
            ..HrvConfig::default()
        });
        assert!((raw.interval_ms(70.0) - 857.142_857).abs() < 1e-3);

        // bpm below 1 is treated as 1
        assert_eq!(nearest.interval_ms(0.5), 60_000.0);
    }

    #[test]
    fn test_high_resolution_stream_is_decimated() {
        let calc = HrvCalculator::default();
        // 5 s spacing: every other sample is kept, giving 10 s spacing
        let bpms = [60.0, 99.0, 60.0, 99.0, 60.0, 99.0, 60.0, 99.0, 60.0, 99.0, 60.0, 99.0];
        let samples = samples_every(5, &bpms);

        let reading = calc.compute(&samples).unwrap();
        assert_eq!(reading.sample_count, 6);
        assert_eq!(reading.value_ms, 0.0);
        assert_eq!(reading.produced_at, base_time() + Duration::seconds(50));
    }

    #[test]
    fn test_regular_stream_is_truncated_not_decimated() {
        let calc = HrvCalculator::default();
        let bpms = [60.0, 60.0, 60.0, 60.0, 60.0, 60.0, 120.0, 120.0];
        let samples = samples_every(10, &bpms);

        let reading = calc.compute(&samples).unwrap();
        assert_eq!(reading.sample_count, 6);
        assert_eq!(reading.value_ms, 0.0);
    }
}
