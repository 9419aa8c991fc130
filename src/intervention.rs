//! Guided relaxation after a stressed decision

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InterventionState {
    NotIntervening,
    Intervening { since: DateTime<Utc> },
}

/// `NotIntervening <-> Intervening`
///
/// Entered on a stressed transition; left only when the user acknowledges it.
#[derive(Debug, Clone)]
pub struct InterventionSession {
    state: InterventionState,
    completed: u32,
}

impl Default for InterventionSession {
    fn default() -> Self {
        Self::new()
    }
}

impl InterventionSession {
    pub fn new() -> Self {
        Self {
            state: InterventionState::NotIntervening,
            completed: 0,
        }
    }

    pub fn state(&self) -> InterventionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, InterventionState::Intervening { .. })
    }

    /// Interventions acknowledged so far
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Begin an intervention
    ///
    /// No-op returning `false` when one is already running or no HRV reading
    /// exists yet.
    pub fn enter(&mut self, has_reading: bool, now: DateTime<Utc>) -> bool {
        if self.is_active() {
            debug!("intervention already active");
            return false;
        }
        if !has_reading {
            debug!("intervention skipped, no reading yet");
            return false;
        }
        self.state = InterventionState::Intervening { since: now };
        info!(since = %now, "intervention started");
        true
    }

    /// End the intervention; returns `false` if none was running
    pub fn acknowledge(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            InterventionState::Intervening { since } => {
                self.state = InterventionState::NotIntervening;
                self.completed += 1;
                info!(duration_secs = (now - since).num_seconds(), "intervention acknowledged");
                true
            }
            InterventionState::NotIntervening => false,
        }
    }
}
