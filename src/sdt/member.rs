use std::collections::BTreeSet;
use std::time::Duration;

use crate::sdt::channel::{LocalChannelKey, RemoteChannelKey};
use crate::sdt::config::MAK_MAX_RETRIES;
use crate::sdt::events::MemberData;
use crate::sdt::seq::Seq;
use crate::sdt::timer::TimerHandle;
use crate::wire::cid::Cid;
use crate::wire::wrapped_messages::Mid;

crate::arena_key!(MemberKey);

/// Membership state of one direction of a [Member]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum HalfState {
    Null,
    JoinRequested,
    JoinPending,
    Member,
}

/// The peer's membership in our local channel
#[derive(Debug)]
pub struct RemoteHalf {
    pub state: HalfState,
    pub mid: Mid,
    /// the last Rseq of our channel that the peer acknowledged
    pub acked_rseq: Seq,
    /// JOIN retries carry the sequence numbers of the original JOIN
    pub join_tseq: Seq,
    pub join_rseq: Seq,
    pub join_retries_left: u8,
    pub join_timeout: Duration,
    pub join_timer: Option<TimerHandle>,
    pub reciprocal_timer: Option<TimerHandle>,
    pub mak_retries_left: u8,
    pub mak_timer: Option<TimerHandle>,
    /// the peer sent LEAVING, so there is no point in asking it to LEAVE
    pub peer_left: bool,
}

/// Our membership in the peer's channel
#[derive(Debug)]
pub struct LocalHalf {
    pub state: HalfState,
    pub mid: Mid,
    pub remote_channel: Option<RemoteChannelKey>,
    pub ack_pending: bool,
    pub last_acked: Seq,
    pub expiry_timer: Option<TimerHandle>,
    pub first_ack_timer: Option<TimerHandle>,
}

/// A peer component bonded to a local component by a pair of channels: the peer is a member
///  of our local channel (the remote half) and we are a member of the peer's channel (the
///  local half). Both halves are allocated and released together.
#[derive(Debug)]
pub struct Member {
    pub local_component: Cid,
    pub remote_component: Cid,
    pub local_channel: LocalChannelKey,
    pub remote_half: RemoteHalf,
    pub local_half: LocalHalf,
    /// JOIN was initiated by this side, i.e. this side is responsible for connecting sessions
    pub initiated_locally: bool,
    pub full_member: bool,
    pub tearing_down: bool,
    pub connected: BTreeSet<u32>,
    pub connecting: BTreeSet<u32>,
}

impl Member {
    pub fn new(local_component: Cid, remote_component: Cid, local_channel: LocalChannelKey, initiated_locally: bool) -> Member {
        Member {
            local_component,
            remote_component,
            local_channel,
            remote_half: RemoteHalf {
                state: HalfState::Null,
                mid: 0,
                acked_rseq: Seq::ZERO,
                join_tseq: Seq::ZERO,
                join_rseq: Seq::ZERO,
                join_retries_left: 0,
                join_timeout: Duration::ZERO,
                join_timer: None,
                reciprocal_timer: None,
                mak_retries_left: MAK_MAX_RETRIES,
                mak_timer: None,
                peer_left: false,
            },
            local_half: LocalHalf {
                state: HalfState::Null,
                mid: 0,
                remote_channel: None,
                ack_pending: false,
                last_acked: Seq::ZERO,
                expiry_timer: None,
                first_ack_timer: None,
            },
            initiated_locally,
            full_member: false,
            tearing_down: false,
            connected: BTreeSet::new(),
            connecting: BTreeSet::new(),
        }
    }

    pub fn data(&self, key: MemberKey) -> MemberData {
        MemberData {
            member: key,
            local_component: self.local_component,
            remote_component: self.remote_component,
        }
    }

    pub fn is_full_member(&self) -> bool {
        self.remote_half.state == HalfState::Member && self.local_half.state == HalfState::Member
    }

    /// all timers of both halves, for cancellation
    pub fn take_timers(&mut self) -> Vec<TimerHandle> {
        [
            self.remote_half.join_timer.take(),
            self.remote_half.reciprocal_timer.take(),
            self.remote_half.mak_timer.take(),
            self.local_half.expiry_timer.take(),
            self.local_half.first_ack_timer.take(),
        ].into_iter()
            .flatten()
            .collect()
    }
}
