// Library interface for calmsense
// The binary and integration tests go through these modules

pub mod analysis;
pub mod calibration;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod hrv;
pub mod intervention;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod runtime;
pub mod session;
pub mod source;
pub mod store;

// Re-export commonly used types for convenience
pub use models::*;
pub use calibration::{CalibrationEngine, CalibrationPolicy, CalibrationRecord};
pub use classifier::{Classifier, ClassifierPolicy, Decision, Transition};
pub use clock::{Clock, Scheduler, SystemClock};
pub use config::AppConfig;
pub use error::{CalmError, QueryError, Result, StoreError};
pub use events::{EventBus, MonitorEvent, MonitorStatus, NotificationKind, NotificationSink};
pub use hrv::{HrvCalculator, HrvConfig, HrvError, IntervalRounding};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use monitor::{MonitorConfig, StressMonitor};
pub use session::{SessionConfig, SessionController, SessionOutcome, SessionState};
pub use source::{MemorySampleSource, SampleSource};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
