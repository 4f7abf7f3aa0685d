use std::collections::BTreeMap;

use tokio::time::Instant;

/// Identifies a scheduled timer for cancellation. Handles are unique for the lifetime of a
///  [TimerQueue], so cancelling a timer that already fired is a no-op.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TimerHandle {
    deadline: Instant,
    id: u64,
}
impl TimerHandle {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Timers ordered by deadline. The queue does not do any waiting itself: the owner asks for
///  the next deadline, sleeps until then, and pops whatever is due.
#[derive(Debug)]
pub struct TimerQueue<A> {
    entries: BTreeMap<(Instant, u64), A>,
    next_id: u64,
}

impl<A> Default for TimerQueue<A> {
    fn default() -> Self {
        TimerQueue {
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }
}

impl<A> TimerQueue<A> {
    pub fn schedule(&mut self, deadline: Instant, action: A) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert((deadline, id), action);
        TimerHandle { deadline, id }
    }

    pub fn cancel(&mut self, handle: TimerHandle) -> Option<A> {
        self.entries.remove(&(handle.deadline, handle.id))
    }

    /// convenience for the common 'cancel whatever is in this slot' pattern
    pub fn cancel_opt(&mut self, handle: &mut Option<TimerHandle>) {
        if let Some(handle) = handle.take() {
            self.cancel(handle);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    /// removes and returns the earliest timer that is due at `now`, if any
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerHandle, A)> {
        let (&(deadline, id), _) = self.entries.first_key_value()?;
        if deadline > now {
            return None;
        }
        self.entries.remove(&(deadline, id))
            .map(|action| (TimerHandle { deadline, id }, action))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pop_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerQueue::default();
        timers.schedule(now + Duration::from_millis(20), "b");
        timers.schedule(now + Duration::from_millis(10), "a");
        timers.schedule(now + Duration::from_millis(20), "c");

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        assert!(timers.pop_due(now).is_none());

        let due = now + Duration::from_millis(20);
        assert_eq!(timers.pop_due(due).map(|(_, a)| a), Some("a"));
        assert_eq!(timers.pop_due(due).map(|(_, a)| a), Some("b"));
        assert_eq!(timers.pop_due(due).map(|(_, a)| a), Some("c"));
        assert!(timers.pop_due(due).is_none());
        assert!(timers.is_empty());
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut timers = TimerQueue::default();
        let a = timers.schedule(now, 1);
        let mut b = Some(timers.schedule(now, 2));

        assert_eq!(timers.cancel(a), Some(1));
        assert_eq!(timers.cancel(a), None);

        timers.cancel_opt(&mut b);
        assert!(b.is_none());
        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
    }
}
