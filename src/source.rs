//! Sample source collaborator
//!
//! The platform health store is outside the core. [`SampleSource`] is the
//! contract the session controller consumes: authorization, historical
//! queries and a live-collection handle. [`MemorySampleSource`] is the
//! in-memory adapter used by tests and the simulation harness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::error::{CalmError, QueryError};
use crate::models::HeartRateSample;

/// Metrics the core reads from the sample source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    HeartRate,
}

/// Outcome of an authorization request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Granted,
    Denied { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Time-ranged historical query
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub metric: Metric,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
    pub order: SortOrder,
}

impl HistoryQuery {
    /// Heart-rate samples since `start`, oldest first
    pub fn heart_rate_since(start: DateTime<Utc>, limit: usize) -> Self {
        Self {
            metric: Metric::HeartRate,
            start,
            end: None,
            limit,
            order: SortOrder::Ascending,
        }
    }

    /// Most recent heart-rate sample in `[start, end]`
    pub fn latest_heart_rate(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            metric: Metric::HeartRate,
            start,
            end: Some(end),
            limit: 1,
            order: SortOrder::Descending,
        }
    }

    /// Whether a timestamp falls inside the query range
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && self.end.map_or(true, |end| timestamp <= end)
    }
}

/// Live collection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionConfig {
    pub metric: Metric,
    /// Activity label shown by the platform while collecting
    pub activity: String,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            metric: Metric::HeartRate,
            activity: "mind-and-body".to_string(),
        }
    }
}

/// Token for an active live collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionHandle(Uuid);

impl CollectionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CollectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Contract for the platform heart-rate store
pub trait SampleSource {
    /// Ask for read access to the given metrics
    fn request_access(&mut self, metrics: &[Metric]) -> AccessDecision;

    /// Query stored samples, ordered per `query.order`
    fn query(&mut self, query: &HistoryQuery) -> Result<Vec<HeartRateSample>, QueryError>;

    /// Begin live collection so the platform records samples more densely
    ///
    /// Fails with [`CalmError::AuthorizationDenied`] when access was refused.
    fn begin_collection(&mut self, config: &CollectionConfig) -> crate::error::Result<CollectionHandle>;

    /// End a live collection; returns whether the platform acknowledged it
    fn end_collection(&mut self, handle: CollectionHandle) -> bool;
}

/// In-memory sample source
///
/// Holds a fixed set of samples and answers queries against them. Queries can
/// be made to fail, either always or for a scripted number of calls.
#[derive(Debug, Clone)]
pub struct MemorySampleSource {
    samples: Vec<HeartRateSample>,
    access: AccessDecision,
    active: Option<CollectionHandle>,
    scripted_failures: VecDeque<QueryError>,
    always_fail: Option<QueryError>,
    queries: Vec<HistoryQuery>,
    collections_started: usize,
    collections_ended: usize,
}

impl MemorySampleSource {
    pub fn new(mut samples: Vec<HeartRateSample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self {
            samples,
            access: AccessDecision::Granted,
            active: None,
            scripted_failures: VecDeque::new(),
            always_fail: None,
            queries: Vec::new(),
            collections_started: 0,
            collections_ended: 0,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Deny access with the given reason
    pub fn deny_access(mut self, reason: impl Into<String>) -> Self {
        self.access = AccessDecision::Denied {
            reason: reason.into(),
        };
        self
    }

    /// Fail the next query with `error`
    pub fn push_failure(&mut self, error: QueryError) {
        self.scripted_failures.push_back(error);
    }

    /// Fail every query with `error`
    pub fn fail_always(&mut self, error: QueryError) {
        self.always_fail = Some(error);
    }

    pub fn add_sample(&mut self, sample: HeartRateSample) {
        let pos = self.samples.partition_point(|s| s.timestamp <= sample.timestamp);
        self.samples.insert(pos, sample);
    }

    /// Every query received so far
    pub fn queries(&self) -> &[HistoryQuery] {
        &self.queries
    }

    /// Queries received with ascending order (history lookups)
    pub fn history_queries(&self) -> Vec<&HistoryQuery> {
        self.queries
            .iter()
            .filter(|q| q.order == SortOrder::Ascending)
            .collect()
    }

    pub fn is_collecting(&self) -> bool {
        self.active.is_some()
    }

    pub fn collections_started(&self) -> usize {
        self.collections_started
    }

    pub fn collections_ended(&self) -> usize {
        self.collections_ended
    }
}

impl SampleSource for MemorySampleSource {
    fn request_access(&mut self, _metrics: &[Metric]) -> AccessDecision {
        self.access.clone()
    }

    fn query(&mut self, query: &HistoryQuery) -> Result<Vec<HeartRateSample>, QueryError> {
        self.queries.push(query.clone());

        if let AccessDecision::Denied { reason } = &self.access {
            return Err(QueryError::Unavailable {
                reason: reason.clone(),
            });
        }
        if let Some(error) = self.scripted_failures.pop_front() {
            return Err(error);
        }
        if let Some(error) = &self.always_fail {
            return Err(error.clone());
        }

        let matching = self.samples.iter().filter(|s| query.contains(s.timestamp));
        let result = match query.order {
            SortOrder::Ascending => matching.take(query.limit).copied().collect(),
            SortOrder::Descending => matching.rev().take(query.limit).copied().collect(),
        };
        Ok(result)
    }

    fn begin_collection(&mut self, _config: &CollectionConfig) -> crate::error::Result<CollectionHandle> {
        if let AccessDecision::Denied { reason } = &self.access {
            return Err(CalmError::AuthorizationDenied {
                reason: reason.clone(),
            });
        }
        let handle = CollectionHandle::new();
        self.active = Some(handle);
        self.collections_started += 1;
        Ok(handle)
    }

    fn end_collection(&mut self, handle: CollectionHandle) -> bool {
        if self.active == Some(handle) {
            self.active = None;
            self.collections_ended += 1;
            true
        } else {
            false
        }
    }
}
