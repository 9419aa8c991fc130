//! Timed "stay still" capture session
//!
//! State machine: `Idle -> Capturing -> Finalizing -> {Completed | Failed}`.
//!
//! While capturing, a 100 ms tick advances the countdown and at every 10 s
//! boundary one snapshot sample is taken from the sample source. After the
//! 60 s window live collection stops, a 1 s settle delay passes, and the
//! buffered samples (or, when too few were captured, the source's history
//! since the session started) are turned into an HRV reading. History lookups
//! are retried every 3 s, at most 10 times, before the session fails with
//! `PoorSignal`.
//!
//! Every timer carries the id of the session that scheduled it. Timers or
//! late results for a session that has since been dismissed are ignored.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Scheduler;
use crate::error::{CalmError, QueryError, Result};
use crate::events::{EventBus, MonitorEvent};
use crate::hrv::HrvCalculator;
use crate::models::{HeartRateSample, HrvReading};
use crate::source::{CollectionConfig, CollectionHandle, HistoryQuery, SampleSource};

/// Capture session timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Length of the capture window in seconds (default: 60)
    pub duration_secs: u32,

    /// Tick granularity in milliseconds (default: 100)
    pub tick_ms: u32,

    /// Snapshot cadence in seconds (default: 10)
    pub snapshot_every_secs: u32,

    /// How far before the session start snapshot queries look (default: 15)
    pub lookback_secs: u32,

    /// Maximum buffered samples (default: 6)
    pub max_captured: usize,

    /// Delay between the end of capture and evaluation (default: 1000)
    pub settle_ms: u32,

    /// Delay between history attempts in seconds (default: 3)
    pub retry_backoff_secs: u32,

    /// Retries after the first history attempt (default: 10)
    pub max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: 60,
            tick_ms: 100,
            snapshot_every_secs: 10,
            lookback_secs: 15,
            max_captured: 6,
            settle_ms: 1000,
            retry_backoff_secs: 3,
            max_retries: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Not enough heart-rate data after the retry budget was spent
    PoorSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SessionState {
    Idle,
    Capturing,
    Finalizing,
    Completed(HrvReading),
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Capturing | SessionState::Finalizing)
    }
}

/// Terminal result of a session, reported once
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed(HrvReading),
    Failed { reason: FailureReason, retries: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Tick,
    Settle,
    Retry,
}

/// Timer scheduled by the session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimer {
    pub session_id: Uuid,
    pub kind: TimerKind,
}

/// Data for the measurement currently in flight
#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    /// Accepted snapshot samples, append-only
    pub captured: Vec<HeartRateSample>,
    pub retry_count: u32,
    pub last_captured_timestamp: Option<DateTime<Utc>>,
    sampled_seconds: BTreeSet<u32>,
    last_reported_second: Option<u32>,
    /// A history query was issued and its answer has not been applied yet
    awaiting_history: bool,
    collection: Option<CollectionHandle>,
}

impl CaptureSession {
    fn new(start_time: DateTime<Utc>, collection: CollectionHandle) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time,
            captured: Vec::new(),
            retry_count: 0,
            last_captured_timestamp: None,
            sampled_seconds: BTreeSet::new(),
            // the full duration is announced on start
            last_reported_second: Some(0),
            awaiting_history: false,
            collection: Some(collection),
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.collection.is_some()
    }
}

/// Drives one capture session at a time
#[derive(Debug)]
pub struct SessionController {
    config: SessionConfig,
    hrv: HrvCalculator,
    state: SessionState,
    session: Option<CaptureSession>,
    events: EventBus,
}

impl SessionController {
    pub fn new(config: SessionConfig, hrv: HrvCalculator, events: EventBus) -> Self {
        Self {
            config,
            hrv,
            state: SessionState::Idle,
            session: None,
            events,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The in-flight session, if capturing or finalizing
    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    /// Whether `session_id` is the session currently in flight
    pub fn owns(&self, session_id: Uuid) -> bool {
        self.session.as_ref().map(|s| s.id) == Some(session_id)
    }

    /// Whole seconds left in the capture window at `now`
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> Option<u32> {
        let session = self.session.as_ref()?;
        let elapsed_ms = (now - session.start_time).num_milliseconds().max(0);
        let total_ms = i64::from(self.config.duration_secs) * 1000;
        let remaining_ms = (total_ms - elapsed_ms).max(0);
        Some(((remaining_ms + 999) / 1000) as u32)
    }

    /// Start a capture session
    ///
    /// Only valid from `Idle`; returns `Ok(false)` without side effects
    /// otherwise. Fails with `AuthorizationDenied` when live collection
    /// cannot begin.
    pub fn start<S, T>(&mut self, source: &mut S, sched: &mut Scheduler<T>) -> Result<bool>
    where
        S: SampleSource + ?Sized,
        T: From<SessionTimer>,
    {
        if self.state != SessionState::Idle {
            debug!(state = ?self.state, "start ignored, session not idle");
            return Ok(false);
        }

        let handle = source.begin_collection(&CollectionConfig::default())?;
        let session = CaptureSession::new(sched.now(), handle);
        let id = session.id;
        self.session = Some(session);

        info!(session_id = %id, start = %sched.now(), "capture session started");
        self.set_state(SessionState::Capturing);
        self.events.publish(MonitorEvent::Countdown {
            remaining_secs: self.config.duration_secs,
        });
        self.schedule(sched, id, TimerKind::Tick, self.tick());
        Ok(true)
    }

    /// Handle a fired session timer
    ///
    /// Returns the session outcome when this timer ended the session.
    pub fn handle<S, T>(
        &mut self,
        timer: SessionTimer,
        source: &mut S,
        sched: &mut Scheduler<T>,
    ) -> Option<SessionOutcome>
    where
        S: SampleSource + ?Sized,
        T: From<SessionTimer>,
    {
        if !self.owns(timer.session_id) {
            debug!(session_id = %timer.session_id, kind = ?timer.kind, "stale timer ignored");
            return None;
        }

        match (timer.kind, &self.state) {
            (TimerKind::Tick, SessionState::Capturing) => {
                self.on_tick(source, sched);
                None
            }
            (TimerKind::Settle, SessionState::Finalizing) => self.evaluate(source, sched),
            (TimerKind::Retry, SessionState::Finalizing) => self.attempt_history(source, sched),
            (kind, state) => {
                debug!(?kind, ?state, "timer does not apply to current state");
                None
            }
        }
    }

    /// Apply the answer to a history query issued for `session_id`
    ///
    /// Only the answer to the outstanding query is applied. Answers for
    /// sessions that are no longer in flight, answers arriving outside
    /// `Finalizing` and answers with no query outstanding are dropped.
    pub fn deliver_history<T>(
        &mut self,
        session_id: Uuid,
        result: std::result::Result<Vec<HeartRateSample>, QueryError>,
        sched: &mut Scheduler<T>,
    ) -> Option<SessionOutcome>
    where
        T: From<SessionTimer>,
    {
        if !self.owns(session_id) || self.state != SessionState::Finalizing {
            debug!(%session_id, "late history result ignored");
            return None;
        }
        match self.session.as_mut() {
            Some(session) if session.awaiting_history => session.awaiting_history = false,
            _ => {
                debug!(%session_id, "history result without an outstanding query ignored");
                return None;
            }
        }

        let reading = result
            .map_err(CalmError::from)
            .and_then(|samples| self.hrv.compute(&samples).map_err(CalmError::from));

        match reading {
            Ok(reading) => Some(self.complete(reading, sched)),
            Err(err) => self.retry_or_fail(err, sched),
        }
    }

    /// Abandon the current session and return to `Idle`
    ///
    /// Ends live collection if still running and cancels pending timers.
    /// Returns `false` when already idle.
    pub fn dismiss<S, T>(&mut self, source: &mut S, sched: &mut Scheduler<T>) -> bool
    where
        S: SampleSource + ?Sized,
    {
        if self.state == SessionState::Idle {
            return false;
        }

        if let Some(mut session) = self.session.take() {
            if let Some(handle) = session.collection.take() {
                if !source.end_collection(handle) {
                    warn!(session_id = %session.id, "live collection did not acknowledge stop");
                }
            }
            let cancelled = sched.cancel_owned(session.id);
            info!(session_id = %session.id, cancelled, "capture session dismissed");
        }

        self.set_state(SessionState::Idle);
        true
    }

    fn on_tick<S, T>(&mut self, source: &mut S, sched: &mut Scheduler<T>)
    where
        S: SampleSource + ?Sized,
        T: From<SessionTimer>,
    {
        let now = sched.now();
        let (id, elapsed_ms) = match self.session.as_ref() {
            Some(session) => (session.id, (now - session.start_time).num_milliseconds().max(0)),
            None => return,
        };
        let elapsed_secs = (elapsed_ms / 1000) as u32;
        let every = self.config.snapshot_every_secs.max(1);

        if elapsed_secs > 0 && elapsed_secs <= self.config.duration_secs && elapsed_secs % every == 0 {
            self.capture_snapshot(elapsed_secs, now, source);
        }

        self.report_countdown(elapsed_secs);

        if elapsed_ms >= i64::from(self.config.duration_secs) * 1000 {
            self.finish_capture(source, sched);
        } else {
            self.schedule(sched, id, TimerKind::Tick, self.tick());
        }
    }

    fn capture_snapshot<S>(&mut self, second: u32, now: DateTime<Utc>, source: &mut S)
    where
        S: SampleSource + ?Sized,
    {
        let max_captured = self.config.max_captured;
        let lookback = Duration::seconds(i64::from(self.config.lookback_secs));
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };

        if !session.sampled_seconds.insert(second) {
            return;
        }
        if session.captured.len() >= max_captured {
            debug!(second, "capture buffer full, snapshot skipped");
            return;
        }

        let query = HistoryQuery::latest_heart_rate(session.start_time - lookback, now);
        match source.query(&query) {
            Ok(samples) => {
                let Some(sample) = samples.into_iter().next() else {
                    debug!(second, "no sample available for snapshot");
                    return;
                };
                let is_new = session
                    .last_captured_timestamp
                    .map_or(true, |last| sample.timestamp > last);
                if is_new && sample.is_usable() {
                    session.captured.push(sample);
                    session.last_captured_timestamp = Some(sample.timestamp);
                    debug!(second, bpm = sample.bpm, captured = session.captured.len(), "snapshot accepted");
                } else {
                    debug!(second, "snapshot duplicates previous sample");
                }
            }
            Err(err) => warn!(second, error = %err, "snapshot query failed"),
        }
    }

    fn report_countdown(&mut self, elapsed_secs: u32) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.last_reported_second == Some(elapsed_secs) {
            return;
        }
        session.last_reported_second = Some(elapsed_secs);
        let remaining_secs = self.config.duration_secs.saturating_sub(elapsed_secs);
        self.events.publish(MonitorEvent::Countdown { remaining_secs });
    }

    fn finish_capture<S, T>(&mut self, source: &mut S, sched: &mut Scheduler<T>)
    where
        S: SampleSource + ?Sized,
        T: From<SessionTimer>,
    {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let id = session.id;
        if let Some(handle) = session.collection.take() {
            if !source.end_collection(handle) {
                warn!(session_id = %id, "live collection did not acknowledge stop");
            }
        }
        info!(session_id = %id, captured = session.captured.len(), "capture window finished");

        self.set_state(SessionState::Finalizing);
        let settle = Duration::milliseconds(i64::from(self.config.settle_ms));
        self.schedule(sched, id, TimerKind::Settle, settle);
    }

    fn evaluate<S, T>(&mut self, source: &mut S, sched: &mut Scheduler<T>) -> Option<SessionOutcome>
    where
        S: SampleSource + ?Sized,
        T: From<SessionTimer>,
    {
        let max_captured = self.config.max_captured;
        let session = self.session.as_ref()?;

        if session.captured.len() >= max_captured {
            match self.hrv.compute(&session.captured[..max_captured]) {
                Ok(reading) => return Some(self.complete(reading, sched)),
                Err(err) => debug!(error = %err, "buffered samples unusable, querying history"),
            }
        }

        self.attempt_history(source, sched)
    }

    fn attempt_history<S, T>(&mut self, source: &mut S, sched: &mut Scheduler<T>) -> Option<SessionOutcome>
    where
        S: SampleSource + ?Sized,
        T: From<SessionTimer>,
    {
        let session = self.session.as_mut()?;
        let id = session.id;
        session.awaiting_history = true;
        let query = HistoryQuery::heart_rate_since(session.start_time, self.config.max_captured);
        let result = source.query(&query);
        self.deliver_history(id, result, sched)
    }

    fn retry_or_fail<T>(&mut self, err: CalmError, sched: &mut Scheduler<T>) -> Option<SessionOutcome>
    where
        T: From<SessionTimer>,
    {
        let max_retries = self.config.max_retries;
        let session = self.session.as_mut()?;
        let id = session.id;

        if session.retry_count >= max_retries {
            let retries = session.retry_count;
            warn!(session_id = %id, retries, error = %err, "retry budget exhausted");
            return Some(self.fail(FailureReason::PoorSignal, retries, sched));
        }

        session.retry_count += 1;
        let attempt = session.retry_count;
        if err.is_retryable() {
            debug!(session_id = %id, attempt, error = %err, "reading not ready, retrying");
        } else {
            warn!(session_id = %id, attempt, error = %err, "unexpected error, retrying");
        }
        let backoff = Duration::seconds(i64::from(self.config.retry_backoff_secs));
        self.schedule(sched, id, TimerKind::Retry, backoff);
        None
    }

    fn complete<T>(&mut self, reading: HrvReading, sched: &mut Scheduler<T>) -> SessionOutcome {
        if let Some(session) = self.session.take() {
            sched.cancel_owned(session.id);
            info!(
                session_id = %session.id,
                hrv_ms = reading.value_ms,
                samples = reading.sample_count,
                retries = session.retry_count,
                "capture session completed"
            );
        }
        self.set_state(SessionState::Completed(reading));
        self.events.publish(MonitorEvent::ReadingProduced(reading));
        SessionOutcome::Completed(reading)
    }

    fn fail<T>(&mut self, reason: FailureReason, retries: u32, sched: &mut Scheduler<T>) -> SessionOutcome {
        if let Some(session) = self.session.take() {
            sched.cancel_owned(session.id);
        }
        self.set_state(SessionState::Failed(reason));
        SessionOutcome::Failed { reason, retries }
    }

    fn schedule<T>(&self, sched: &mut Scheduler<T>, id: Uuid, kind: TimerKind, delay: Duration)
    where
        T: From<SessionTimer>,
    {
        sched.schedule_owned(delay, id, SessionTimer { session_id: id, kind }.into());
    }

    fn tick(&self) -> Duration {
        Duration::milliseconds(i64::from(self.config.tick_ms.max(1)))
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(from = ?self.state, to = ?state, "session state");
        self.state = state.clone();
        self.events.publish(MonitorEvent::SessionStateChanged(state));
    }
}
