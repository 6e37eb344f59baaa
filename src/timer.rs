// MIT License - Copyright (c) 2026 zway-core contributors
// One-shot timers fired on the worker task

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{Result, ZWayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer {}", self.0)
    }
}

pub type TimerCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TimerState {
    next_id: u64,
    due: BTreeMap<(Instant, TimerId), TimerCallback>,
    deadlines: HashMap<TimerId, Instant>,
}

/// Pending timers, ordered by deadline then creation.
#[derive(Default)]
pub struct Timers {
    state: Mutex<TimerState>,
    notify: Notify,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `callback` to run once after `delay`.
    pub fn add(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerId {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = TimerId(state.next_id);
        state.due.insert((deadline, id), Box::new(callback));
        state.deadlines.insert(id, deadline);
        drop(state);
        trace!("Added {} due in {:?}", id, delay);
        self.notify.notify_one();
        id
    }

    /// Cancel a timer that has not fired yet.
    pub fn remove(&self, id: TimerId) -> Result<()> {
        let mut state = self.state.lock();
        let deadline = state
            .deadlines
            .remove(&id)
            .ok_or_else(|| ZWayError::invalid_arg(format!("{} not found", id)))?;
        state.due.remove(&(deadline, id));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().due.keys().next().map(|(deadline, _)| *deadline)
    }

    pub(crate) fn changed(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Remove and return every timer due at `now`, in firing order.
    pub(crate) fn take_due(&self, now: Instant) -> Vec<TimerCallback> {
        let mut state = self.state.lock();
        let mut out = Vec::new();
        while let Some(entry) = state.due.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), callback) = entry.remove_entry();
            state.deadlines.remove(&id);
            out.push(callback);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_due_in_deadline_order() {
        let timers = Timers::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for (delay, tag) in [(300, "c"), (100, "a"), (200, "b")] {
            let log = log.clone();
            timers.add(Duration::from_millis(delay), move || log.lock().unwrap().push(tag));
        }
        assert!(timers.take_due(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(250)).await;
        for cb in timers.take_due(Instant::now()) {
            cb();
        }
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_deadline().map(|d| d > Instant::now()), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove() {
        let timers = Timers::new();
        let id = timers.add(Duration::from_secs(1), || {});
        timers.remove(id).unwrap();
        assert!(timers.is_empty());
        assert!(matches!(timers.remove(id), Err(ZWayError::InvalidArg { .. })));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(timers.take_due(Instant::now()).is_empty());
    }
}
