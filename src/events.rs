//! Change notifications and the notification sink
//!
//! The core never talks to a UI binding layer. Every observable change is
//! published as a [`MonitorEvent`] on an [`EventBus`], which the presentation
//! layer subscribes to. Haptic or system notifications go through the
//! fire-and-forget [`NotificationSink`].

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::models::{ActiveMode, HrvReading};
use crate::session::SessionState;

/// Default number of undelivered events a slow subscriber may lag behind
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// High level status shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MonitorStatus {
    /// Nothing running, ready to measure
    Ready,
    /// Capture window running
    Measuring { remaining_secs: u32 },
    /// Capture finished, waiting for a reading
    Analyzing,
    /// Last predicting-mode decision was calm
    Calm { hrv_ms: f64 },
    /// Last predicting-mode decision was stressed
    Stressed { hrv_ms: f64 },
    /// Training reading stored
    Recorded { hrv_ms: f64 },
    /// Session ended without a usable reading
    PoorSignal,
    /// Heart-rate access refused
    AccessDenied,
}

/// Everything the presentation layer may observe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MonitorEvent {
    SessionStateChanged(SessionState),
    Countdown { remaining_secs: u32 },
    ReadingProduced(HrvReading),
    StatusChanged(MonitorStatus),
    StressChanged { stressed: bool },
    AdvisoryChanged(Option<String>),
    InterventionChanged { active: bool },
    TrainingCompleted { threshold: f64 },
    ModeChanged(ActiveMode),
}

/// Broadcast bus for [`MonitorEvent`]s
///
/// Publishing never blocks and never fails; with no subscribers events are
/// simply dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: MonitorEvent) {
        debug!(?event, "event");
        // Err only means there are no subscribers right now
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Kinds of user-facing notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    /// Stress detected, guide the user to relax
    StressDetected,
    /// Calibration finished and a threshold is in place
    TrainingComplete,
    /// Session ended without a usable reading
    PoorSignal,
}

/// Fire-and-forget notification output (haptics, banners)
pub trait NotificationSink {
    fn fire(&mut self, kind: NotificationKind);
}

/// Sink that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn fire(&mut self, kind: NotificationKind) {
        info!(?kind, "notification");
    }
}

/// Sink that remembers everything it was asked to fire
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub fired: Vec<NotificationKind>,
}

impl RecordingSink {
    pub fn count(&self, kind: NotificationKind) -> usize {
        self.fired.iter().filter(|k| **k == kind).count()
    }
}

impl NotificationSink for RecordingSink {
    fn fire(&mut self, kind: NotificationKind) {
        self.fired.push(kind);
    }
}

/// Drain everything currently buffered on a receiver
pub fn drain(receiver: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(MonitorEvent::StressChanged { stressed: true });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(MonitorEvent::Countdown { remaining_secs: 60 });
        bus.publish(MonitorEvent::Countdown { remaining_secs: 59 });

        assert_eq!(
            drain(&mut rx),
            vec![
                MonitorEvent::Countdown { remaining_secs: 60 },
                MonitorEvent::Countdown { remaining_secs: 59 },
            ]
        );
    }

    #[test]
    fn test_recording_sink_counts() {
        let mut sink = RecordingSink::default();
        sink.fire(NotificationKind::StressDetected);
        sink.fire(NotificationKind::StressDetected);
        sink.fire(NotificationKind::PoorSignal);
        assert_eq!(sink.count(NotificationKind::StressDetected), 2);
    }
}
