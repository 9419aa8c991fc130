use calmsense::calibration::{median, CalibrationEngine, CalibrationPolicy, CalibrationRecord, CALM_FALLBACK_FACTOR};
use calmsense::classifier::{Classifier, ClassifierPolicy};
use calmsense::hrv::{HrvCalculator, HrvConfig};
use calmsense::models::{HeartRateSample, HrvReading, SensitivityConfig, StressLabel};
use calmsense::store::MemoryStore;
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

/// Property tests for calibration, HRV and classification invariants

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

#[derive(Debug, Clone, Copy)]
enum SensitivityEdit {
    StressedCount(u8),
    WindowSize(u8),
}

fn sensitivity_edit() -> impl Strategy<Value = SensitivityEdit> {
    prop_oneof![
        any::<u8>().prop_map(SensitivityEdit::StressedCount),
        any::<u8>().prop_map(SensitivityEdit::WindowSize),
    ]
}

proptest! {
    #[test]
    fn sensitivity_bounds_hold_after_any_edits(edits in prop::collection::vec(sensitivity_edit(), 0..40)) {
        let mut engine = CalibrationEngine::new(CalibrationRecord::default(), CalibrationPolicy::default(), 50.0);
        let mut store = MemoryStore::new();

        for edit in edits {
            let sensitivity = match edit {
                SensitivityEdit::StressedCount(x) => engine.set_sensitivity_stressed_count(x, &mut store).unwrap(),
                SensitivityEdit::WindowSize(y) => engine.set_sensitivity_window_size(y, &mut store).unwrap(),
            };
            let (x, y) = (sensitivity.stressed_count(), sensitivity.window_size());
            prop_assert!(1 <= x && x <= y && y <= 10, "X={} Y={}", x, y);

            // an in-range value is taken as given
            match edit {
                SensitivityEdit::StressedCount(v) if (1..=10).contains(&v) => prop_assert_eq!(x, v),
                SensitivityEdit::WindowSize(v) if (1..=10).contains(&v) => prop_assert_eq!(y, v),
                _ => {}
            }
        }
    }

    #[test]
    fn sdnn_matches_sample_standard_deviation(intervals in prop::collection::vec(300.0f64..2000.0, 2..30)) {
        let n = intervals.len() as f64;
        let mean = intervals.iter().sum::<f64>() / n;
        let variance = intervals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);

        let sdnn = HrvCalculator::sdnn(&intervals).unwrap();
        prop_assert!((sdnn - variance.sqrt()).abs() <= 1e-6 * variance.sqrt().max(1.0));
    }

    #[test]
    fn constant_heart_rate_has_zero_hrv(bpm in 30u32..200, count in 2usize..7) {
        let samples: Vec<HeartRateSample> = (0..count)
            .map(|i| HeartRateSample::new(start() + Duration::seconds(i as i64 * 10), f64::from(bpm)).unwrap())
            .collect();

        let reading = HrvCalculator::new(HrvConfig::default()).compute(&samples).unwrap();
        prop_assert_eq!(reading.value_ms, 0.0);
        prop_assert_eq!(reading.sample_count, count);
    }

    #[test]
    fn hrv_is_never_negative(bpms in prop::collection::vec(30.0f64..220.0, 2..20)) {
        let samples: Vec<HeartRateSample> = bpms
            .iter()
            .enumerate()
            .map(|(i, &bpm)| HeartRateSample::new(start() + Duration::seconds(i as i64 * 10), bpm).unwrap())
            .collect();

        let reading = HrvCalculator::new(HrvConfig::default()).compute(&samples).unwrap();
        prop_assert!(reading.value_ms >= 0.0);
        prop_assert!(reading.sample_count <= 6);
    }

    #[test]
    fn calm_only_tentative_threshold_scales_median(a in 10.0f64..150.0, b in 10.0f64..150.0) {
        let mut engine = CalibrationEngine::new(CalibrationRecord::default(), CalibrationPolicy::default(), 50.0);
        let mut store = MemoryStore::new();
        engine.record_labeled_reading(a, StressLabel::Calm, start(), &mut store).unwrap();
        engine.record_labeled_reading(b, StressLabel::Calm, start(), &mut store).unwrap();

        prop_assert!(engine.is_training());
        prop_assert_eq!(engine.tentative_threshold(), CALM_FALLBACK_FACTOR * ((a + b) / 2.0));
    }

    #[test]
    fn completed_threshold_lies_between_recent_medians(
        stressed in prop::collection::vec(10.0f64..150.0, 3..8),
        calm in prop::collection::vec(10.0f64..150.0, 3..8),
    ) {
        let mut engine = CalibrationEngine::new(CalibrationRecord::default(), CalibrationPolicy::default(), 50.0);
        let mut store = MemoryStore::new();

        // all stressed first so completion happens on the last calm reading
        let mut completed = None;
        for &value in &stressed {
            let outcome = engine.record_labeled_reading(value, StressLabel::Stressed, start(), &mut store).unwrap();
            prop_assert_eq!(outcome.completed_threshold, None);
        }
        for (i, &value) in calm.iter().enumerate() {
            let outcome = engine.record_labeled_reading(value, StressLabel::Calm, start(), &mut store).unwrap();
            if i < 2 {
                prop_assert_eq!(outcome.completed_threshold, None);
            } else if outcome.completed_threshold.is_some() {
                completed = outcome.completed_threshold;
            }
        }

        // training stops at the third calm reading
        let s = median(&stressed[stressed.len() - 3..]).unwrap();
        let c = median(&calm[..3]).unwrap();
        let threshold = completed.unwrap();
        prop_assert_eq!(threshold, (s + c) / 2.0);
        prop_assert!(threshold >= s.min(c) && threshold <= s.max(c));
        prop_assert!(!engine.is_training());
        prop_assert_eq!(engine.current_threshold(), threshold);
    }

    #[test]
    fn windowed_majority_counts_recent_votes(
        flags in prop::collection::vec(any::<bool>(), 1..40),
        x in 1u8..=10,
        y in 1u8..=10,
    ) {
        let sensitivity = SensitivityConfig::new(x, y);
        let mut classifier = Classifier::new(ClassifierPolicy::WindowedMajority, 50.0);

        for (i, &below) in flags.iter().enumerate() {
            let reading = HrvReading {
                value_ms: if below { 40.0 } else { 60.0 },
                sample_count: 6,
                produced_at: start() + Duration::minutes(i as i64),
            };
            let decision = classifier.classify(&reading, sensitivity, reading.produced_at);

            let window = usize::from(sensitivity.window_size());
            let from = (i + 1).saturating_sub(window);
            let votes = flags[from..=i].iter().filter(|&&b| b).count();
            prop_assert_eq!(decision.stressed, votes >= usize::from(sensitivity.stressed_count()));
            prop_assert!(classifier.state().recent_decisions.len() <= window);
        }
    }
}
