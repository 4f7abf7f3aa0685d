use std::time::Duration;

use crate::sdt::mak::MakCycle;
use crate::sdt::member::MemberKey;
use crate::sdt::nak::NakState;
use crate::sdt::retained::RetainedWraps;
use crate::sdt::rx_queue::RxQueue;
use crate::sdt::seq::Seq;
use crate::sdt::timer::TimerHandle;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::channel_params::ChannelParams;
use crate::wire::cid::Cid;
use crate::wire::transport_addr::TransportAddr;
use crate::wire::wrapped_messages::{Mid, MAX_MID};

crate::arena_key!(LocalChannelKey);
crate::arena_key!(RemoteChannelKey);

/// A channel led by one of our local components
#[derive(Debug)]
pub struct LocalChannel {
    pub owner: Cid,
    pub number: u16,
    pub params: ChannelParams,
    /// `Null` for unicast channels, which send every wrapper to each member's ad-hoc address
    pub dest_addr: TransportAddr,
    pub tseq: Seq,
    pub rseq: Seq,
    /// indexed by MID - 1
    members: Vec<Option<MemberKey>>,
    member_count: usize,
    pub retained: RetainedWraps,
    pub mak: MakCycle,
    pub keepalive_timer: Option<TimerHandle>,
    /// Rseq range that was just retransmitted; NAKs for it are ignored until the timer clears it
    pub blank: Option<(Seq, Seq)>,
    pub blank_timer: Option<TimerHandle>,
    /// where the round-robin for piggy-backed ACKs continues
    pub last_ack_mid: Mid,
    /// keep the channel when its last member leaves
    pub hold_open: bool,
}

impl LocalChannel {
    pub fn new(owner: Cid, number: u16, params: ChannelParams, dest_addr: TransportAddr, keepalive_interval: Duration, hold_open: bool) -> LocalChannel {
        LocalChannel {
            owner,
            number,
            params,
            dest_addr,
            tseq: Seq::ZERO,
            rseq: Seq::ZERO,
            members: Vec::new(),
            member_count: 0,
            retained: RetainedWraps::default(),
            mak: MakCycle::new(keepalive_interval),
            keepalive_timer: None,
            blank: None,
            blank_timer: None,
            last_ack_mid: 0,
            hold_open,
        }
    }

    /// assigns the lowest free MID, `None` if the channel is full
    pub fn alloc_mid(&mut self, member: MemberKey) -> Option<Mid> {
        let idx = match self.members.iter().position(|m| m.is_none()) {
            Some(idx) => idx,
            None => {
                if self.members.len() >= MAX_MID.safe_cast() {
                    return None;
                }
                self.members.push(None);
                self.members.len() - 1
            }
        };
        self.members[idx] = Some(member);
        self.member_count += 1;
        Some((idx + 1).prechecked_cast())
    }

    pub fn release_mid(&mut self, mid: Mid) {
        if let Some(slot) = self.members.get_mut((mid as usize).wrapping_sub(1)) {
            if slot.take().is_some() {
                self.member_count -= 1;
            }
        }
        while let Some(None) = self.members.last() {
            self.members.pop();
        }
    }

    pub fn member(&self, mid: Mid) -> Option<MemberKey> {
        if mid == 0 {
            return None;
        }
        self.members.get(mid as usize - 1).copied().flatten()
    }

    pub fn member_count(&self) -> usize {
        self.member_count
    }

    pub fn highest_mid(&self) -> Mid {
        self.members.len().prechecked_cast()
    }

    pub fn members(&self) -> impl Iterator<Item = (Mid, MemberKey)> + '_ {
        self.members.iter()
            .enumerate()
            .filter_map(|(idx, m)| m.map(|m| ((idx + 1).prechecked_cast(), m)))
    }

    /// members in MID order, starting after `after` and wrapping around
    pub fn members_after(&self, after: Mid) -> Vec<(Mid, MemberKey)> {
        let (mut tail, head): (Vec<_>, Vec<_>) = self.members()
            .partition(|(mid, _)| *mid > after);
        tail.extend(head);
        tail
    }

    /// the oldest Rseq a member can still get by NAKing
    pub fn oldest_available(&self) -> Seq {
        self.retained.oldest_rseq()
            .unwrap_or(self.rseq.next())
    }
}

/// A channel led by a peer that one or more of our local components are members of
#[derive(Debug)]
pub struct RemoteChannel {
    pub leader: Cid,
    pub number: u16,
    pub params: ChannelParams,
    pub dest_addr: TransportAddr,
    pub tseq: Seq,
    pub rseq: Seq,
    pub queue: RxQueue,
    pub nak: NakState,
    /// our members, i.e. the members whose local half is in this channel
    pub members: Vec<MemberKey>,
}

impl RemoteChannel {
    pub fn new(leader: Cid, number: u16, params: ChannelParams, dest_addr: TransportAddr, tseq: Seq, rseq: Seq) -> RemoteChannel {
        RemoteChannel {
            leader,
            number,
            params,
            dest_addr,
            tseq,
            rseq,
            queue: RxQueue::default(),
            nak: NakState::default(),
            members: Vec::new(),
        }
    }
}
