use std::time::Duration;

use crate::sdt::config::NAK_MAX_RETRIES;
use crate::sdt::seq::Seq;
use crate::sdt::timer::TimerHandle;
use crate::wire::channel_params::ChannelParams;
use crate::wire::wrapped_messages::Mid;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NakPhase {
    /// nothing missing
    Idle,
    /// waiting for the holdoff to pass before sending a NAK
    Holdoff,
    /// NAK sent, waiting for the retransmission
    Waiting,
    /// another member NAKed an overlapping range, waiting for the retransmission it triggers
    Suppressed,
}

/// NAK state of a remote channel
#[derive(Debug)]
pub struct NakState {
    pub phase: NakPhase,
    pub first: Seq,
    pub last: Seq,
    pub retries_left: u8,
    pub timer: Option<TimerHandle>,
}

impl Default for NakState {
    fn default() -> Self {
        NakState {
            phase: NakPhase::Idle,
            first: Seq::ZERO,
            last: Seq::ZERO,
            retries_left: NAK_MAX_RETRIES,
            timer: None,
        }
    }
}

impl NakState {
    pub fn overlaps(&self, first: Seq, last: Seq) -> bool {
        !first.is_after(self.last) && !last.is_before(self.first)
    }
}

/// Members spread their NAKs over time so that the first NAK for a range suppresses the
///  others: each member waits a number of holdoff intervals derived from its MID, capped at
///  the channel's maximum wait. A zero holdoff or maximum wait means 'NAK immediately'.
pub fn nak_holdoff(params: &ChannelParams, rseq: Seq, mid: Mid) -> Duration {
    if params.nak_holdoff.is_zero() || params.nak_max_wait.is_zero() || params.nak_modulus == 0 {
        return Duration::ZERO;
    }

    let slot = rseq.to_raw().wrapping_add(mid as u32) % params.nak_modulus as u32;
    (params.nak_holdoff * slot).min(params.nak_max_wait)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn params(holdoff_millis: u64, modulus: u16, max_wait_millis: u64) -> ChannelParams {
        ChannelParams {
            expiry: Duration::from_secs(15),
            nak_outbound: false,
            nak_holdoff: Duration::from_millis(holdoff_millis),
            nak_modulus: modulus,
            nak_max_wait: Duration::from_millis(max_wait_millis),
        }
    }

    #[rstest]
    #[case::mid_1(params(2, 16, 20), 0, 1, 2)]
    #[case::mid_2(params(2, 16, 20), 0, 2, 4)]
    #[case::modulus_wraps(params(2, 16, 20), 0, 16, 0)]
    #[case::rseq_shifts_slot(params(2, 16, 20), 3, 1, 8)]
    #[case::capped(params(2, 16, 20), 0, 15, 20)]
    #[case::zero_holdoff(params(0, 16, 20), 0, 1, 0)]
    #[case::zero_max_wait(params(2, 16, 0), 0, 1, 0)]
    #[case::rseq_wraps(params(1, 50, 100), 0xffff_ffff, 3, 2)]
    fn test_nak_holdoff(#[case] params: ChannelParams, #[case] rseq: u32, #[case] mid: Mid, #[case] expected_millis: u64) {
        assert_eq!(nak_holdoff(&params, Seq::from_raw(rseq), mid), Duration::from_millis(expected_millis));
    }

    #[test]
    fn test_holdoff_differs_between_members() {
        let params = params(2, 16, 20);
        assert_ne!(nak_holdoff(&params, Seq::ZERO, 1), nak_holdoff(&params, Seq::ZERO, 2));
    }

    #[rstest]
    #[case::inside(5, 6, true)]
    #[case::touching_start(1, 4, true)]
    #[case::touching_end(8, 9, true)]
    #[case::before(1, 3, false)]
    #[case::after(9, 12, false)]
    fn test_overlaps(#[case] first: u32, #[case] last: u32, #[case] expected: bool) {
        let state = NakState {
            first: Seq::from_raw(4),
            last: Seq::from_raw(8),
            ..NakState::default()
        };
        assert_eq!(state.overlaps(Seq::from_raw(first), Seq::from_raw(last)), expected);
    }
}
