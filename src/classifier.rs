//! Stress classification with temporal smoothing
//!
//! A single HRV reading below the threshold is weak evidence. Two policies
//! turn the stream of readings into a stable decision:
//!
//! - **Windowed majority** (default): the last Y "below threshold" flags are
//!   kept and the user is stressed when at least X of them are set.
//! - **Hysteresis**: stressed once HRV has stayed below the threshold for a
//!   sustained period (120 s by default), calm the moment it recovers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::models::{HrvReading, SensitivityConfig};

/// How long HRV must stay low under the hysteresis policy (seconds)
pub const DEFAULT_SUSTAIN_SECS: i64 = 120;

/// Delay before an advisory is cleared after a calm transition (seconds)
pub const DEFAULT_ADVISORY_GRACE_SECS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierPolicy {
    WindowedMajority,
    Hysteresis { sustain_secs: i64 },
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        ClassifierPolicy::WindowedMajority
    }
}

impl ClassifierPolicy {
    pub fn hysteresis() -> Self {
        ClassifierPolicy::Hysteresis {
            sustain_secs: DEFAULT_SUSTAIN_SECS,
        }
    }
}

/// Classifier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierSettings {
    /// Grace period before a calm transition clears the advisory (default: 5)
    pub advisory_grace_secs: i64,

    pub policy: ClassifierPolicy,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            advisory_grace_secs: DEFAULT_ADVISORY_GRACE_SECS,
            policy: ClassifierPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transition {
    None,
    BecameStressed,
    BecameCalm,
}

/// Result of classifying one reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    pub below_threshold: bool,
    pub stressed: bool,
    pub transition: Transition,
}

/// Transient classifier state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationState {
    /// Most recent "below threshold" flags, oldest first, at most Y long
    pub recent_decisions: VecDeque<bool>,
    pub current_threshold: f64,
    pub is_stressed: bool,
    pub low_hrv_since: Option<DateTime<Utc>>,
}

impl ClassificationState {
    pub fn new(threshold: f64) -> Self {
        Self {
            recent_decisions: VecDeque::new(),
            current_threshold: threshold,
            is_stressed: false,
            low_hrv_since: None,
        }
    }

    pub fn stressed_votes(&self) -> usize {
        self.recent_decisions.iter().filter(|&&below| below).count()
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    policy: ClassifierPolicy,
    state: ClassificationState,
}

impl Classifier {
    pub fn new(policy: ClassifierPolicy, threshold: f64) -> Self {
        Self {
            policy,
            state: ClassificationState::new(threshold),
        }
    }

    pub fn policy(&self) -> ClassifierPolicy {
        self.policy
    }

    pub fn state(&self) -> &ClassificationState {
        &self.state
    }

    pub fn is_stressed(&self) -> bool {
        self.state.is_stressed
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        if threshold != self.state.current_threshold {
            debug!(from = self.state.current_threshold, to = threshold, "classifier threshold");
        }
        self.state.current_threshold = threshold;
    }

    /// Classify one reading observed at `now`
    pub fn classify(&mut self, reading: &HrvReading, sensitivity: SensitivityConfig, now: DateTime<Utc>) -> Decision {
        let below_threshold = reading.value_ms < self.state.current_threshold;
        let was_stressed = self.state.is_stressed;

        let stressed = match self.policy {
            ClassifierPolicy::WindowedMajority => self.vote(below_threshold, sensitivity),
            ClassifierPolicy::Hysteresis { sustain_secs } => {
                self.sustained(below_threshold, Duration::seconds(sustain_secs), now)
            }
        };
        self.state.is_stressed = stressed;

        let transition = match (was_stressed, stressed) {
            (false, true) => Transition::BecameStressed,
            (true, false) => Transition::BecameCalm,
            _ => Transition::None,
        };

        debug!(
            hrv_ms = reading.value_ms,
            threshold = self.state.current_threshold,
            below_threshold,
            stressed,
            "reading classified"
        );
        if transition != Transition::None {
            info!(?transition, hrv_ms = reading.value_ms, "stress state changed");
        }

        Decision {
            below_threshold,
            stressed,
            transition,
        }
    }

    /// Drop the oldest decisions so at most `window_size` remain
    pub fn resize_window(&mut self, window_size: u8) {
        let capacity = usize::from(window_size.max(SensitivityConfig::MIN));
        while self.state.recent_decisions.len() > capacity {
            self.state.recent_decisions.pop_front();
        }
    }

    /// Clear the stressed flag after the user acknowledged an intervention
    ///
    /// Decision history is dropped too, so the next stressed decision needs
    /// fresh evidence.
    pub fn clear_stressed(&mut self) {
        self.state.is_stressed = false;
        self.state.recent_decisions.clear();
        self.state.low_hrv_since = None;
    }

    /// Forget all history, keeping the threshold
    pub fn reset(&mut self) {
        self.state = ClassificationState::new(self.state.current_threshold);
    }

    fn vote(&mut self, below_threshold: bool, sensitivity: SensitivityConfig) -> bool {
        self.state.recent_decisions.push_back(below_threshold);
        self.resize_window(sensitivity.window_size());
        self.state.stressed_votes() >= usize::from(sensitivity.stressed_count())
    }

    fn sustained(&mut self, below_threshold: bool, sustain: Duration, now: DateTime<Utc>) -> bool {
        if !below_threshold {
            self.state.low_hrv_since = None;
            return false;
        }
        let since = *self.state.low_hrv_since.get_or_insert(now);
        self.state.is_stressed || now - since >= sustain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn reading(value_ms: f64) -> HrvReading {
        HrvReading {
            value_ms,
            sample_count: 6,
            produced_at: t(0),
        }
    }

    /// Feed `below` flags as readings of 40 ms (below) or 60 ms (above)
    fn feed(classifier: &mut Classifier, flags: &[bool], sensitivity: SensitivityConfig) -> Vec<Decision> {
        flags
            .iter()
            .enumerate()
            .map(|(i, &below)| {
                let value = if below { 40.0 } else { 60.0 };
                classifier.classify(&reading(value), sensitivity, t(i as i64 * 60))
            })
            .collect()
    }

    #[test]
    fn test_three_of_five_is_stressed() {
        let mut classifier = Classifier::new(ClassifierPolicy::WindowedMajority, 50.0);
        let decisions = feed(
            &mut classifier,
            &[true, false, true, true, false],
            SensitivityConfig::new(3, 5),
        );
        assert!(decisions.last().unwrap().stressed);
        assert!(classifier.is_stressed());
    }

    #[test]
    fn test_one_of_five_is_calm() {
        let mut classifier = Classifier::new(ClassifierPolicy::WindowedMajority, 50.0);
        let decisions = feed(
            &mut classifier,
            &[true, false, false, false, false],
            SensitivityConfig::new(3, 5),
        );
        assert!(decisions.iter().all(|d| !d.stressed));
    }

    #[test]
    fn test_transition_reported_once() {
        let mut classifier = Classifier::new(ClassifierPolicy::WindowedMajority, 50.0);
        let decisions = feed(
            &mut classifier,
            &[true, true, true, true, true, false, false, false],
            SensitivityConfig::new(3, 5),
        );
        let transitions: Vec<Transition> = decisions.iter().map(|d| d.transition).collect();
        assert_eq!(
            transitions,
            vec![
                Transition::None,
                Transition::None,
                Transition::BecameStressed,
                Transition::None,
                Transition::None,
                Transition::None,
                Transition::None,
                Transition::BecameCalm,
            ]
        );
    }

    #[test]
    fn test_reading_equal_to_threshold_is_not_below() {
        let mut classifier = Classifier::new(ClassifierPolicy::WindowedMajority, 50.0);
        let decision = classifier.classify(&reading(50.0), SensitivityConfig::new(1, 1), t(0));
        assert!(!decision.below_threshold);
        assert!(!decision.stressed);
    }

    #[test]
    fn test_shrinking_window_evicts_oldest() {
        let mut classifier = Classifier::new(ClassifierPolicy::WindowedMajority, 50.0);
        feed(&mut classifier, &[true, true, false, false], SensitivityConfig::new(3, 5));
        classifier.resize_window(2);
        assert_eq!(
            classifier.state().recent_decisions,
            VecDeque::from(vec![false, false])
        );
    }

    #[test]
    fn test_hysteresis_needs_sustained_low_hrv() {
        let mut classifier = Classifier::new(ClassifierPolicy::hysteresis(), 50.0);
        let sensitivity = SensitivityConfig::default();

        assert!(!classifier.classify(&reading(40.0), sensitivity, t(0)).stressed);
        assert!(!classifier.classify(&reading(40.0), sensitivity, t(60)).stressed);
        let decision = classifier.classify(&reading(40.0), sensitivity, t(120));
        assert!(decision.stressed);
        assert_eq!(decision.transition, Transition::BecameStressed);

        // recovery is immediate
        let decision = classifier.classify(&reading(55.0), sensitivity, t(180));
        assert_eq!(decision.transition, Transition::BecameCalm);
        assert_eq!(classifier.state().low_hrv_since, None);
    }

    #[test]
    fn test_hysteresis_restarts_after_recovery() {
        let mut classifier = Classifier::new(ClassifierPolicy::hysteresis(), 50.0);
        let sensitivity = SensitivityConfig::default();

        classifier.classify(&reading(40.0), sensitivity, t(0));
        classifier.classify(&reading(60.0), sensitivity, t(60));
        classifier.classify(&reading(40.0), sensitivity, t(90));
        assert!(!classifier.classify(&reading(40.0), sensitivity, t(180)).stressed);
        assert!(classifier.classify(&reading(40.0), sensitivity, t(210)).stressed);
    }

    #[test]
    fn test_clear_stressed_starts_fresh_window() {
        let mut classifier = Classifier::new(ClassifierPolicy::WindowedMajority, 50.0);
        let sensitivity = SensitivityConfig::new(3, 5);
        feed(&mut classifier, &[true, true, true], sensitivity);
        assert!(classifier.is_stressed());

        classifier.clear_stressed();
        assert!(!classifier.is_stressed());
        assert!(classifier.state().recent_decisions.is_empty());

        // two more low readings are not enough on their own
        let decisions = feed(&mut classifier, &[true, true], sensitivity);
        assert!(decisions.iter().all(|d| d.transition == Transition::None));
        assert_eq!(classifier.state().current_threshold, 50.0);
    }
}
