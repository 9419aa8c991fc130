//! Stress monitor: the single coordinating sequence
//!
//! Owns the capture session, the calibration engine, the classifier and the
//! intervention state, and routes every finished reading:
//!
//! ```text
//! session -> HRV reading -> training:   calibration (label required)
//!                        -> predicting: classifier -> intervention
//! ```
//!
//! All mutation goes through `&mut self`; timers come from one
//! [`Scheduler`] which the caller advances, either with a virtual clock
//! (tests, `simulate`) or in real time via [`crate::runtime`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::calibration::{CalibrationEngine, CalibrationSettings};
use crate::classifier::{Classifier, ClassifierSettings, Transition};
use crate::clock::Scheduler;
use crate::error::{CalmError, QueryError, Result};
use crate::events::{EventBus, MonitorEvent, MonitorStatus, NotificationKind, NotificationSink};
use crate::hrv::{HrvCalculator, HrvConfig};
use crate::intervention::InterventionSession;
use crate::models::{ActiveMode, Demographics, HeartRateSample, HrvReading, SensitivityConfig, StressLabel};
use crate::session::{SessionConfig, SessionController, SessionOutcome, SessionState, SessionTimer};
use crate::source::{AccessDecision, Metric, SampleSource};
use crate::store::KeyValueStore;

/// Message shown while a stressed decision stands
pub const STRESS_ADVISORY: &str = "Stress detected. Take a slow breath and relax your shoulders.";

/// Timers owned by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorTask {
    Session(SessionTimer),
    ClearAdvisory,
}

impl From<SessionTimer> for MonitorTask {
    fn from(timer: SessionTimer) -> Self {
        MonitorTask::Session(timer)
    }
}

/// Everything the monitor needs to know up front
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub session: SessionConfig,
    pub hrv: HrvConfig,
    pub calibration: CalibrationSettings,
    pub classifier: ClassifierSettings,
}

pub struct StressMonitor<S, K, N> {
    config: MonitorConfig,
    source: S,
    store: K,
    sink: N,
    scheduler: Scheduler<MonitorTask>,
    session: SessionController,
    calibration: CalibrationEngine,
    classifier: Classifier,
    intervention: InterventionSession,
    events: EventBus,
    status: MonitorStatus,
    advisory: Option<String>,
    last_reading: Option<HrvReading>,
    pending_label: Option<StressLabel>,
}

impl<S, K, N> StressMonitor<S, K, N>
where
    S: SampleSource,
    K: KeyValueStore,
    N: NotificationSink,
{
    /// Build a monitor, loading the persisted calibration from `store`
    pub fn new(config: MonitorConfig, source: S, mut store: K, sink: N, start: DateTime<Utc>) -> Result<Self> {
        let events = EventBus::default();
        let mut calibration = CalibrationEngine::load(
            &store,
            config.calibration.policy.clone(),
            config.calibration.default_threshold_ms,
        )?;
        if config.calibration.reset_on_launch {
            info!("discarding persisted calibration on launch");
            calibration.reset(start, &mut store)?;
        }

        let classifier = Classifier::new(config.classifier.policy, calibration.current_threshold());
        let session = SessionController::new(
            config.session.clone(),
            HrvCalculator::new(config.hrv.clone()),
            events.clone(),
        );

        info!(
            mode = %calibration.mode(),
            threshold = calibration.current_threshold(),
            "stress monitor ready"
        );

        Ok(Self {
            config,
            source,
            store,
            sink,
            scheduler: Scheduler::new(start),
            session,
            calibration,
            classifier,
            intervention: InterventionSession::new(),
            events,
            status: MonitorStatus::Ready,
            advisory: None,
            last_reading: None,
            pending_label: None,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.scheduler.now()
    }

    pub fn status(&self) -> &MonitorStatus {
        &self.status
    }

    pub fn advisory(&self) -> Option<&str> {
        self.advisory.as_deref()
    }

    pub fn last_reading(&self) -> Option<HrvReading> {
        self.last_reading
    }

    pub fn mode(&self) -> ActiveMode {
        self.calibration.mode()
    }

    pub fn session_state(&self) -> &SessionState {
        self.session.state()
    }

    /// Id of the capture session in flight
    pub fn session_id(&self) -> Option<Uuid> {
        self.session.session().map(|s| s.id)
    }

    pub fn calibration(&self) -> &CalibrationEngine {
        &self.calibration
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn intervention(&self) -> &InterventionSession {
        &self.intervention
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn store(&self) -> &K {
        &self.store
    }

    pub fn sink(&self) -> &N {
        &self.sink
    }

    /// When the next timer fires, if any
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.scheduler.next_due()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Ask the sample source for heart-rate access
    pub fn authorize(&mut self) -> bool {
        match self.source.request_access(&[Metric::HeartRate]) {
            AccessDecision::Granted => {
                if self.status == MonitorStatus::AccessDenied {
                    self.set_status(MonitorStatus::Ready);
                }
                true
            }
            AccessDecision::Denied { reason } => {
                warn!(%reason, "heart rate access denied");
                self.set_status(MonitorStatus::AccessDenied);
                false
            }
        }
    }

    /// Begin a fresh training phase
    pub fn start_training(&mut self, demographics: Demographics, sensitivity: SensitivityConfig) -> Result<()> {
        let now = self.now();
        self.calibration
            .start_training(demographics, sensitivity, now, &mut self.store)?;
        self.reset_classifier();
        self.events.publish(MonitorEvent::ModeChanged(ActiveMode::Training));
        Ok(())
    }

    /// Start a measurement
    ///
    /// A finished session is dismissed first. While training, `label` says how
    /// the user feels and is required; it is ignored while predicting.
    /// Returns `Ok(false)` when a session is already running.
    pub fn start_measurement(&mut self, label: Option<StressLabel>) -> Result<bool> {
        if self.session.state().is_active() {
            debug!("measurement already running");
            return Ok(false);
        }
        if self.calibration.mode() == ActiveMode::Training && label.is_none() {
            return Err(CalmError::LabelRequired);
        }
        if *self.session.state() != SessionState::Idle {
            self.session.dismiss(&mut self.source, &mut self.scheduler);
        }

        match self.session.start(&mut self.source, &mut self.scheduler) {
            Ok(started) => {
                if started {
                    self.pending_label = label;
                    self.sync_status();
                }
                Ok(started)
            }
            Err(err) => {
                warn!(error = %err, "measurement could not start");
                if matches!(err, CalmError::AuthorizationDenied { .. }) {
                    self.set_status(MonitorStatus::AccessDenied);
                }
                Err(err)
            }
        }
    }

    /// Fire every timer due up to `deadline`, then move the clock there
    pub fn advance_to(&mut self, deadline: DateTime<Utc>) -> Result<()> {
        while let Some(fired) = self.scheduler.pop_due(deadline) {
            match fired.task {
                MonitorTask::Session(timer) => {
                    let outcome = self
                        .session
                        .handle(timer, &mut self.source, &mut self.scheduler);
                    match outcome {
                        Some(outcome) => self.on_outcome(outcome)?,
                        None => self.sync_status(),
                    }
                }
                MonitorTask::ClearAdvisory => self.clear_advisory(),
            }
        }
        self.scheduler.set_now(deadline);
        Ok(())
    }

    pub fn advance_by(&mut self, delta: Duration) -> Result<()> {
        let deadline = self.now() + delta;
        self.advance_to(deadline)
    }

    /// Deliver a history answer produced asynchronously for `session_id`
    ///
    /// Only an answer to the query currently outstanding is applied; answers
    /// for a dismissed or finished session, or with no query pending, are
    /// ignored.
    pub fn deliver_history(
        &mut self,
        session_id: Uuid,
        result: std::result::Result<Vec<HeartRateSample>, QueryError>,
    ) -> Result<()> {
        if let Some(outcome) = self
            .session
            .deliver_history(session_id, result, &mut self.scheduler)
        {
            self.on_outcome(outcome)?;
        }
        Ok(())
    }

    /// Abandon the current session; no-op when idle
    pub fn dismiss_session(&mut self) -> bool {
        let dismissed = self.session.dismiss(&mut self.source, &mut self.scheduler);
        if dismissed {
            self.pending_label = None;
            if !self.intervention.is_active() {
                self.set_status(MonitorStatus::Ready);
            }
        }
        dismissed
    }

    /// User finished the guided relaxation
    pub fn acknowledge_intervention(&mut self) -> bool {
        if !self.intervention.acknowledge(self.now()) {
            return false;
        }
        self.events.publish(MonitorEvent::InterventionChanged { active: false });
        let was_stressed = self.classifier.is_stressed();
        self.classifier.clear_stressed();
        if was_stressed {
            self.events.publish(MonitorEvent::StressChanged { stressed: false });
        }
        self.set_status(MonitorStatus::Ready);
        true
    }

    /// Clear labeled data and re-enter training
    pub fn reset_calibration(&mut self) -> Result<()> {
        let now = self.now();
        self.calibration.reset(now, &mut self.store)?;
        self.reset_classifier();
        self.events.publish(MonitorEvent::ModeChanged(ActiveMode::Training));
        Ok(())
    }

    pub fn set_sensitivity_stressed_count(&mut self, count: u8) -> Result<SensitivityConfig> {
        let sensitivity = self
            .calibration
            .set_sensitivity_stressed_count(count, &mut self.store)?;
        self.classifier.resize_window(sensitivity.window_size());
        Ok(sensitivity)
    }

    pub fn set_sensitivity_window_size(&mut self, size: u8) -> Result<SensitivityConfig> {
        let sensitivity = self
            .calibration
            .set_sensitivity_window_size(size, &mut self.store)?;
        self.classifier.resize_window(sensitivity.window_size());
        Ok(sensitivity)
    }

    pub fn set_demographics(&mut self, demographics: Demographics) -> Result<()> {
        self.calibration.set_demographics(demographics, &mut self.store)?;
        Ok(())
    }

    fn on_outcome(&mut self, outcome: SessionOutcome) -> Result<()> {
        match outcome {
            SessionOutcome::Completed(reading) => {
                self.last_reading = Some(reading);
                let label = self.pending_label.take();
                match (self.calibration.mode(), label) {
                    (ActiveMode::Training, Some(label)) => self.record_training(reading, label)?,
                    (ActiveMode::Training, None) => {
                        warn!(hrv_ms = reading.value_ms, "unlabeled reading during training discarded");
                        self.set_status(MonitorStatus::Ready);
                    }
                    (ActiveMode::Predicting, _) => self.predict(reading),
                }
            }
            SessionOutcome::Failed { reason, retries } => {
                self.pending_label = None;
                warn!(?reason, retries, "measurement failed");
                self.sink.fire(NotificationKind::PoorSignal);
                self.set_status(MonitorStatus::PoorSignal);
            }
        }
        Ok(())
    }

    fn record_training(&mut self, reading: HrvReading, label: StressLabel) -> Result<()> {
        let now = self.now();
        let outcome = self
            .calibration
            .record_labeled_reading(reading.value_ms, label, now, &mut self.store)?;
        self.set_status(MonitorStatus::Recorded {
            hrv_ms: reading.value_ms,
        });

        if outcome.intervene {
            self.sink.fire(NotificationKind::StressDetected);
            self.enter_intervention();
        }

        // the classifier stays untouched until predicting starts
        if let Some(threshold) = outcome.completed_threshold {
            self.reset_classifier();
            self.sink.fire(NotificationKind::TrainingComplete);
            self.events.publish(MonitorEvent::TrainingCompleted { threshold });
            self.events.publish(MonitorEvent::ModeChanged(ActiveMode::Predicting));
        }
        Ok(())
    }

    fn predict(&mut self, reading: HrvReading) {
        let now = self.now();
        self.classifier.set_threshold(self.calibration.current_threshold());
        let decision = self
            .classifier
            .classify(&reading, self.calibration.sensitivity(), now);

        let hrv_ms = reading.value_ms;
        self.set_status(if decision.stressed {
            MonitorStatus::Stressed { hrv_ms }
        } else {
            MonitorStatus::Calm { hrv_ms }
        });

        match decision.transition {
            Transition::BecameStressed => {
                self.events.publish(MonitorEvent::StressChanged { stressed: true });
                self.scheduler
                    .cancel_where(|task| *task == MonitorTask::ClearAdvisory);
                self.set_advisory(Some(STRESS_ADVISORY.to_string()));
                self.sink.fire(NotificationKind::StressDetected);
                self.enter_intervention();
            }
            Transition::BecameCalm => {
                self.events.publish(MonitorEvent::StressChanged { stressed: false });
            }
            Transition::None => {}
        }

        // a calm decision lets a lingering advisory expire
        if !decision.stressed && self.advisory.is_some() && !self.intervention.is_active() {
            self.scheduler
                .cancel_where(|task| *task == MonitorTask::ClearAdvisory);
            let grace = Duration::seconds(self.config.classifier.advisory_grace_secs);
            self.scheduler.schedule_after(grace, MonitorTask::ClearAdvisory);
        }
    }

    fn enter_intervention(&mut self) {
        if self
            .intervention
            .enter(self.last_reading.is_some(), self.now())
        {
            self.events.publish(MonitorEvent::InterventionChanged { active: true });
        }
    }

    fn clear_advisory(&mut self) {
        if self.intervention.is_active() {
            debug!("advisory kept, intervention active");
            return;
        }
        self.set_advisory(None);
    }

    fn reset_classifier(&mut self) {
        self.classifier.reset();
        self.classifier.set_threshold(self.calibration.current_threshold());
    }

    fn sync_status(&mut self) {
        let status = match self.session.state() {
            SessionState::Capturing => match self.session.remaining_secs(self.now()) {
                Some(remaining_secs) => MonitorStatus::Measuring { remaining_secs },
                None => return,
            },
            SessionState::Finalizing => MonitorStatus::Analyzing,
            _ => return,
        };
        self.set_status(status);
    }

    fn set_status(&mut self, status: MonitorStatus) {
        if self.status != status {
            self.status = status.clone();
            self.events.publish(MonitorEvent::StatusChanged(status));
        }
    }

    fn set_advisory(&mut self, advisory: Option<String>) {
        if self.advisory != advisory {
            self.advisory = advisory.clone();
            self.events.publish(MonitorEvent::AdvisoryChanged(advisory));
        }
    }
}
