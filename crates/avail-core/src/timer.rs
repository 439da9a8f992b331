//! Named one-shot and periodic timers with generation-checked ids.
//!
//! The registry owns its own notion of "now". The daemon refreshes it from
//! the monotonic clock before each dispatch; tests move it with
//! [`TimerRegistry::advance`] so every FSM sees deterministic time.
//!
//! Disarming is idempotent. A [`TimerId`] that was disarmed (or already
//! fired as a one-shot) can never fire again, even if its slot is reused.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::arena::{Arena, Key};
use crate::error::AvailResult;

/// Default bound on concurrently armed timers.
pub const DEFAULT_TIMER_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId(Key);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0.index, self.0.generation)
    }
}

#[derive(Debug)]
struct TimerEntry<T> {
    name: String,
    deadline: Instant,
    period: Option<Duration>,
    seq: u64,
    tag: T,
}

#[derive(Debug)]
pub struct TimerRegistry<T> {
    timers: Arena<TimerEntry<T>>,
    now: Instant,
    next_seq: u64,
}

impl<T> TimerRegistry<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TIMER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            timers: Arena::with_capacity("timer", capacity),
            now: Instant::now(),
            next_seq: 0,
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Move the registry clock forward. Never moves it backwards.
    pub fn set_now(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn arm(
        &mut self,
        name: impl Into<String>,
        after: Duration,
        tag: impl Into<T>,
    ) -> AvailResult<TimerId> {
        self.insert(name.into(), after, None, tag.into())
    }

    pub fn arm_periodic(
        &mut self,
        name: impl Into<String>,
        every: Duration,
        tag: impl Into<T>,
    ) -> AvailResult<TimerId> {
        self.insert(name.into(), every, Some(every), tag.into())
    }

    fn insert(
        &mut self,
        name: String,
        after: Duration,
        period: Option<Duration>,
        tag: T,
    ) -> AvailResult<TimerId> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let deadline = self.now + after;
        let key = self.timers.insert(TimerEntry {
            name,
            deadline,
            period,
            seq,
            tag,
        })?;
        let id = TimerId(key);
        trace!(timer = %id, ?after, "timer armed");
        Ok(id)
    }

    /// Cancel a timer. Returns whether it was still armed.
    pub fn disarm(&mut self, id: TimerId) -> bool {
        match self.timers.remove(id.0) {
            Some(entry) => {
                trace!(timer = %id, name = %entry.name, "timer disarmed");
                true
            }
            None => false,
        }
    }

    /// Disarm the timer held in `slot` (if any) and clear the slot.
    pub fn disarm_slot(&mut self, slot: &mut Option<TimerId>) {
        if let Some(id) = slot.take() {
            self.disarm(id);
        }
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.timers.contains(id.0)
    }

    pub fn name(&self, id: TimerId) -> Option<&str> {
        self.timers.get(id.0).map(|e| e.name.as_str())
    }

    /// Time left before `id` fires.
    pub fn remaining(&self, id: TimerId) -> Option<Duration> {
        self.timers
            .get(id.0)
            .map(|e| e.deadline.saturating_duration_since(self.now))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|(_, e)| e.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl<T: Clone> TimerRegistry<T> {
    /// Take the earliest due timer. One-shot timers are removed; periodic
    /// ones are re-armed one period after their previous deadline.
    pub fn pop_due(&mut self) -> Option<(TimerId, T)> {
        let now = self.now;
        let (key, _) = self
            .timers
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .min_by_key(|(_, e)| (e.deadline, e.seq))?;

        let id = TimerId(key);
        let entry = self.timers.get_mut(key)?;
        match entry.period {
            Some(period) => {
                entry.deadline += period;
                if entry.deadline <= now {
                    entry.deadline = now + period;
                }
                trace!(timer = %id, name = %entry.name, "periodic timer fired");
                Some((id, entry.tag.clone()))
            }
            None => {
                let entry = self.timers.remove(key)?;
                trace!(timer = %id, name = %entry.name, "timer fired");
                Some((id, entry.tag))
            }
        }
    }
}

impl<T> Default for TimerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
