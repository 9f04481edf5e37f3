//! Time source and wake-up bookkeeping for round timeouts.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock that never reports a time earlier than one it already returned.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_ms: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_millis();
        let prev = self.last_ms.fetch_max(wall, Ordering::AcqRel);
        let ms = prev.max(wall);
        DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }
}

/// Clock moved by hand, for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) -> DateTime<Utc> {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if by > Duration::zero() {
            *now += by;
        }
        *now
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if at > *now {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Pending wake-ups keyed by order. Only the latest wake per order is kept;
/// callers must tolerate being woken when nothing is due for the order.
#[derive(Debug, Default)]
pub struct TimerQueue {
    by_time: BTreeSet<(DateTime<Utc>, Uuid)>,
    by_order: HashMap<Uuid, DateTime<Utc>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_wake(&mut self, order_id: Uuid, at: DateTime<Utc>) {
        if let Some(prev) = self.by_order.insert(order_id, at) {
            self.by_time.remove(&(prev, order_id));
        }
        self.by_time.insert((at, order_id));
    }

    pub fn cancel(&mut self, order_id: Uuid) {
        if let Some(prev) = self.by_order.remove(&order_id) {
            self.by_time.remove(&(prev, order_id));
        }
    }

    /// Removes and returns every order whose wake time is at or before `now`,
    /// earliest first.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due = Vec::new();
        while let Some(&(at, order_id)) = self.by_time.first() {
            if at > now {
                break;
            }
            self.by_time.pop_first();
            self.by_order.remove(&order_id);
            due.push(order_id);
        }
        due
    }

    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.by_time.first().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.by_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_order.is_empty()
    }
}
