use std::time::Duration;

use crate::wire::wrapped_messages::Mid;

/// Decides which members a channel's next reliable or keep-alive wrapper asks to acknowledge.
///
/// Members that missed a MAK take priority and are asked again as a group, with the keep-alive
///  interval shortened so that they get their next chance soon. Otherwise a window of members
///  is MAKed round-robin, and the interval relaxes back to nominal.
#[derive(Debug)]
pub struct MakCycle {
    cursor: Mid,
    priority: Option<(Mid, Mid)>,
    interval: Duration,
    nominal: Duration,
}

impl MakCycle {
    pub fn new(nominal: Duration) -> MakCycle {
        MakCycle {
            cursor: 0,
            priority: None,
            interval: nominal,
            nominal,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_nominal(&mut self, nominal: Duration) {
        self.nominal = nominal;
        self.interval = self.interval.min(nominal);
    }

    pub fn has_priority(&self) -> bool {
        self.priority.is_some()
    }

    /// a member's MAK timed out, but it has retries left
    pub fn add_priority(&mut self, mid: Mid) {
        self.priority = Some(match self.priority {
            None => (mid, mid),
            Some((first, last)) => (first.min(mid), last.max(mid)),
        });
        self.interval = (self.interval / 2).max(self.nominal / 8);
    }

    /// The MAK range for the next wrapper, `None` if there are no members. `highest_mid` is the
    ///  highest MID currently assigned in the channel.
    pub fn next_directive(&mut self, highest_mid: Mid, span: u16) -> Option<(Mid, Mid)> {
        if let Some(range) = self.priority.take() {
            return Some(range);
        }
        if highest_mid == 0 || span == 0 {
            return None;
        }

        self.interval = (self.interval * 2).min(self.nominal);

        let first = if self.cursor >= highest_mid { 1 } else { self.cursor + 1 };
        let last = (first as u32 + span as u32 - 1).min(highest_mid as u32) as Mid;
        self.cursor = last;
        Some((first, last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_wraps() {
        let mut mak = MakCycle::new(Duration::from_secs(5));
        assert_eq!(mak.next_directive(5, 2), Some((1, 2)));
        assert_eq!(mak.next_directive(5, 2), Some((3, 4)));
        assert_eq!(mak.next_directive(5, 2), Some((5, 5)));
        assert_eq!(mak.next_directive(5, 2), Some((1, 2)));
    }

    #[test]
    fn test_round_robin_after_members_left() {
        let mut mak = MakCycle::new(Duration::from_secs(5));
        assert_eq!(mak.next_directive(9, 8), Some((1, 8)));
        assert_eq!(mak.next_directive(3, 8), Some((1, 3)));
    }

    #[test]
    fn test_no_members() {
        let mut mak = MakCycle::new(Duration::from_secs(5));
        assert_eq!(mak.next_directive(0, 8), None);
    }

    #[test]
    fn test_priority_first_and_interval() {
        let nominal = Duration::from_secs(4);
        let mut mak = MakCycle::new(nominal);

        mak.add_priority(7);
        assert_eq!(mak.interval(), Duration::from_secs(2));
        mak.add_priority(3);
        assert_eq!(mak.interval(), Duration::from_secs(1));
        mak.add_priority(5);
        mak.add_priority(5);
        assert_eq!(mak.interval(), Duration::from_millis(500));
        assert!(mak.has_priority());

        assert_eq!(mak.next_directive(10, 2), Some((3, 7)));
        assert!(!mak.has_priority());
        assert_eq!(mak.interval(), Duration::from_millis(500));

        assert_eq!(mak.next_directive(10, 2), Some((1, 2)));
        assert_eq!(mak.interval(), Duration::from_secs(1));
        mak.next_directive(10, 2);
        mak.next_directive(10, 2);
        assert_eq!(mak.interval(), nominal);
    }
}
