//! Virtual clock and timer queue
//!
//! All timed behavior (100 ms ticks, settle delay, retry backoff, advisory
//! grace period) goes through a [`Scheduler`]. Time only moves when the owner
//! advances it, which keeps sessions deterministic under test. A wall-clock
//! driver lives in [`crate::runtime`].

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Source of the current time
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Handle for a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Entry<T> {
    owner: Option<Uuid>,
    task: T,
}

/// A due timer popped from the queue
#[derive(Debug, Clone, PartialEq)]
pub struct Fired<T> {
    pub id: TimerId,
    pub at: DateTime<Utc>,
    pub task: T,
}

/// Deterministic timer queue with its own virtual "now"
///
/// Timers due at the same instant fire in scheduling order. Timers may carry
/// an owner id so everything belonging to one capture session can be
/// cancelled at once.
#[derive(Debug)]
pub struct Scheduler<T> {
    now: DateTime<Utc>,
    next_id: u64,
    queue: BTreeMap<(DateTime<Utc>, TimerId), Entry<T>>,
}

impl<T> Scheduler<T> {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: start,
            next_id: 0,
            queue: BTreeMap::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Schedule `task` to fire `delay` from now
    pub fn schedule_after(&mut self, delay: Duration, task: T) -> TimerId {
        self.insert(self.now + delay, None, task)
    }

    /// Schedule `task` on behalf of `owner`
    pub fn schedule_owned(&mut self, delay: Duration, owner: Uuid, task: T) -> TimerId {
        self.insert(self.now + delay, Some(owner), task)
    }

    fn insert(&mut self, at: DateTime<Utc>, owner: Option<Uuid>, task: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.queue.insert((at, id), Entry { owner, task });
        id
    }

    /// Cancel one timer; returns whether it was still pending
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let key = self.queue.keys().find(|(_, timer)| *timer == id).copied();
        match key {
            Some(key) => self.queue.remove(&key).is_some(),
            None => false,
        }
    }

    /// Cancel every timer scheduled for `owner`, returning how many were dropped
    pub fn cancel_owned(&mut self, owner: Uuid) -> usize {
        let before = self.queue.len();
        self.queue.retain(|_, entry| entry.owner != Some(owner));
        before - self.queue.len()
    }

    /// Cancel every timer whose task matches the predicate
    pub fn cancel_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.queue.len();
        self.queue.retain(|_, entry| !predicate(&entry.task));
        before - self.queue.len()
    }

    /// When the earliest pending timer is due
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pop the earliest timer due at or before `deadline`, moving "now" to it
    pub fn pop_due(&mut self, deadline: DateTime<Utc>) -> Option<Fired<T>> {
        let key = *self.queue.keys().next()?;
        if key.0 > deadline {
            return None;
        }
        let entry = self.queue.remove(&key)?;
        if key.0 > self.now {
            self.now = key.0;
        }
        Some(Fired {
            id: key.1,
            at: key.0,
            task: entry.task,
        })
    }

    /// Move "now" forward without firing anything
    ///
    /// Never moves time backwards.
    pub fn set_now(&mut self, now: DateTime<Utc>) {
        if now > self.now {
            self.now = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_timers_fire_in_time_order() {
        let mut sched = Scheduler::new(start());
        sched.schedule_after(Duration::seconds(3), "retry");
        sched.schedule_after(Duration::milliseconds(100), "tick");
        sched.schedule_after(Duration::seconds(1), "settle");

        let deadline = start() + Duration::seconds(10);
        let order: Vec<&str> = std::iter::from_fn(|| sched.pop_due(deadline))
            .map(|fired| fired.task)
            .collect();

        assert_eq!(order, vec!["tick", "settle", "retry"]);
        assert_eq!(sched.now(), start() + Duration::seconds(3));
    }

    #[test]
    fn test_same_instant_keeps_scheduling_order() {
        let mut sched = Scheduler::new(start());
        sched.schedule_after(Duration::seconds(1), 1);
        sched.schedule_after(Duration::seconds(1), 2);

        let deadline = start() + Duration::seconds(1);
        assert_eq!(sched.pop_due(deadline).map(|f| f.task), Some(1));
        assert_eq!(sched.pop_due(deadline).map(|f| f.task), Some(2));
    }

    #[test]
    fn test_pop_due_respects_deadline() {
        let mut sched = Scheduler::new(start());
        sched.schedule_after(Duration::seconds(5), ());

        assert!(sched.pop_due(start() + Duration::seconds(4)).is_none());
        assert_eq!(sched.pending(), 1);
        assert!(sched.pop_due(start() + Duration::seconds(5)).is_some());
        assert!(sched.is_idle());
    }

    #[test]
    fn test_cancel_owned() {
        let mut sched = Scheduler::new(start());
        let session = Uuid::new_v4();
        sched.schedule_owned(Duration::seconds(1), session, "tick");
        sched.schedule_owned(Duration::seconds(3), session, "retry");
        sched.schedule_after(Duration::seconds(5), "advisory");

        assert_eq!(sched.cancel_owned(session), 2);
        assert_eq!(sched.pending(), 1);
    }

    #[test]
    fn test_cancel_single_timer() {
        let mut sched = Scheduler::new(start());
        let id = sched.schedule_after(Duration::seconds(1), "a");
        assert!(sched.cancel(id));
        assert!(!sched.cancel(id));
    }
}
