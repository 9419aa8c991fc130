//! Wall-clock driver for the monitor
//!
//! The monitor itself only knows virtual time. This module advances it from a
//! [`Clock`] on a tokio interval so the binary can run a measurement in real
//! time. Everything still happens on the calling task.

use chrono::Duration;
use std::time::Duration as StdDuration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{CalmError, Result};
use crate::events::NotificationSink;
use crate::monitor::StressMonitor;
use crate::session::SessionState;
use crate::source::SampleSource;
use crate::store::KeyValueStore;

/// Run the current measurement in real time until it completes or fails
///
/// `poll` is how often wall-clock time is mapped onto the scheduler. Gives up
/// with an error once `timeout` of wall-clock time has passed.
pub async fn run_until_settled<S, K, N, C>(
    monitor: &mut StressMonitor<S, K, N>,
    clock: &C,
    poll: StdDuration,
    timeout: StdDuration,
) -> Result<SessionState>
where
    S: SampleSource,
    K: KeyValueStore,
    N: NotificationSink,
    C: Clock,
{
    let started = clock.now();
    let limit = Duration::from_std(timeout)
        .map_err(|e| CalmError::Configuration(format!("invalid timeout: {}", e)))?;

    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let now = clock.now();
        monitor.advance_to(now)?;

        match monitor.session_state() {
            SessionState::Capturing | SessionState::Finalizing => {}
            state => {
                debug!(?state, "measurement settled");
                return Ok(state.clone());
            }
        }

        if now - started >= limit {
            warn!(timeout_secs = timeout.as_secs(), "measurement did not settle in time");
            return Err(CalmError::Internal("measurement timed out".to_string()));
        }
    }
}
