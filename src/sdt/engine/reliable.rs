use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::sdt::channel::{LocalChannelKey, RemoteChannelKey};
use crate::sdt::client::ClientMessage;
use crate::sdt::config::{SdtConfig, MAK_MAX_RETRIES, NAK_MAX_RETRIES};
use crate::sdt::engine::{SdtEngine, TimerAction};
use crate::sdt::events::LeaveCause;
use crate::sdt::member::{HalfState, Member, MemberKey};
use crate::sdt::nak::{nak_holdoff, NakPhase};
use crate::sdt::rx_queue::RxWrap;
use crate::sdt::seq::Seq;
use crate::sdt::tx_wrap::TxWrap;
use crate::wire::cid::Cid;
use crate::wire::reason_code::ReasonCode;
use crate::wire::root_layer::{finish_datagram, start_datagram, SDT_PROTOCOL_ID};
use crate::wire::sdt_messages::{NakData, SdtMessage, WrapperData, WrapperHeader};
use crate::wire::wrapped_messages::{ClientPdu, WrappedMessage, MID_ALL_MEMBERS};

/// members that are asked to acknowledge, and that count for keep-alives
fn is_makable(member: &Member) -> bool {
    member.remote_half.state >= HalfState::JoinPending && !member.tearing_down
}

impl SdtEngine {
    pub fn start_wrapper(&self, channel: LocalChannelKey, reliable: bool, size_hint: usize) -> anyhow::Result<TxWrap> {
        let ch = self.local_channels.get(channel)
            .ok_or_else(|| anyhow!("unknown local channel {:?}", channel))?;
        Ok(TxWrap::new(channel, ch.owner, reliable, self.config.max_packet_size, size_hint))
    }

    /// Sends a wrapper, adding ACKs that are due in its channel if there is room. Reliable
    ///  wrappers are retained until all members acknowledged them.
    pub fn flush_wrapper(&mut self, mut wrap: TxWrap, now: Instant) -> anyhow::Result<()> {
        if !self.local_channels.contains(wrap.channel()) {
            bail!("channel {:?} was closed", wrap.channel());
        }
        self.add_pending_acks(&mut wrap);
        let with_mak = wrap.is_reliable();
        self.send_wrapper(wrap, with_mak, now)
    }

    /// a wrapper with a single message
    pub fn send_wrap(&mut self, channel: LocalChannelKey, reliable: bool, msg: &ClientPdu, now: Instant) -> anyhow::Result<()> {
        let mut wrap = self.start_wrapper(channel, reliable, TxWrap::overhead() + msg.data.len() + 10)?;
        wrap.add_proto_msg(msg.dest_mid, msg.protocol, msg.association, &msg.data)?;
        self.flush_wrapper(wrap, now)
    }

    /// Sends client data to a member on a connected session
    pub fn send_to_member(&mut self, member: MemberKey, protocol: u32, data: &[u8], reliable: bool, now: Instant) -> anyhow::Result<()> {
        let m = self.members.get(member)
            .ok_or_else(|| anyhow!("unknown member {:?}", member))?;
        if !m.connected.contains(&protocol) {
            bail!("no session for protocol {} with {}", protocol, m.remote_component);
        }
        let msg = ClientPdu {
            dest_mid: m.remote_half.mid,
            protocol,
            association: self.association_of(m),
            data: Bytes::copy_from_slice(data),
        };
        let channel = m.local_channel;
        self.send_wrap(channel, reliable, &msg, now)
    }

    /// A member's messages are associated with the channel it leads for us
    pub(super) fn association_of(&self, member: &Member) -> u16 {
        member.local_half.remote_channel
            .and_then(|rc| self.remote_channels.get(rc))
            .map(|rc| rc.number)
            .unwrap_or(0)
    }

    /// Adds ACKs for members that owe one, round-robin so that a full wrapper does not starve
    ///  members with high MIDs. Returns the number of ACKs added.
    fn add_pending_acks(&mut self, wrap: &mut TxWrap) -> usize {
        let key = wrap.channel();
        let Some(ch) = self.local_channels.get(key) else { return 0; };

        let mut num_added = 0;
        let mut last_mid = None;
        for (mid, member_key) in ch.members_after(ch.last_ack_mid) {
            let Some(member) = self.members.get_mut(member_key) else { continue; };
            if !member.local_half.ack_pending || member.tearing_down || member.remote_half.state < HalfState::JoinPending {
                continue;
            }
            let Some(rc) = member.local_half.remote_channel.and_then(|rc| self.remote_channels.get(rc)) else {
                continue;
            };
            let ack = match WrappedMessage::Ack(rc.rseq).to_bytes() {
                Ok(ack) => ack,
                Err(e) => {
                    warn!("error serializing ACK: {}", e);
                    continue;
                }
            };
            if wrap.add_proto_msg(mid, SDT_PROTOCOL_ID, rc.number, &ack).is_err() {
                break;
            }
            trace!("ACK {} for channel {} of {}", rc.rseq, rc.number, rc.leader);
            member.local_half.ack_pending = false;
            member.local_half.last_acked = rc.rseq;
            last_mid = Some(mid);
            num_added += 1;
        }

        if let Some(mid) = last_mid {
            if let Some(ch) = self.local_channels.get_mut(key) {
                ch.last_ack_mid = mid;
            }
        }
        num_added
    }

    /// Numbers, sends and (if reliable) retains a wrapper
    fn send_wrapper(&mut self, wrap: TxWrap, with_mak: bool, now: Instant) -> anyhow::Result<()> {
        let key = wrap.channel();
        let reliable = wrap.is_reliable();
        let ch = self.local_channels.get_mut(key)
            .ok_or_else(|| anyhow!("channel {:?} was closed", key))?;
        let mak_timeout = SdtConfig::mak_timeout(ch.params.expiry);

        let mut mak_range = (0, 0);
        if with_mak && ch.members().any(|(_, m)| self.members.get(m).map(is_makable).unwrap_or(false)) {
            let highest_mid = ch.highest_mid();
            if let Some(range) = ch.mak.next_directive(highest_mid, self.config.mak_span) {
                mak_range = range;
                for mid in range.0..=range.1 {
                    let Some(member_key) = ch.member(mid) else { continue; };
                    let Some(member) = self.members.get_mut(member_key) else { continue; };
                    if is_makable(member) && member.remote_half.mak_timer.is_none() {
                        member.remote_half.mak_timer = Some(self.timers.schedule(now + mak_timeout, TimerAction::MakTimeout(member_key)));
                    }
                }
            }
        }

        ch.tseq = ch.tseq.next();
        if reliable {
            ch.rseq = ch.rseq.next();
        }
        let retain = reliable && ch.member_count() > 0;
        let oldest_available = if retain {
            ch.retained.oldest_rseq().unwrap_or(ch.rseq)
        }
        else {
            ch.oldest_available()
        };

        let header = WrapperHeader {
            channel: ch.number,
            tseq: ch.tseq,
            rseq: ch.rseq,
            oldest_available,
            first_mak: mak_range.0,
            last_mak: mak_range.1,
            mak_threshold: self.config.mak_threshold,
        };
        let (datagram, wrap_start) = wrap.finish(&header)?;
        if retain {
            let acks_owed = ch.member_count() as u32;
            ch.retained.push(ch.tseq, ch.rseq, datagram.slice(wrap_start..), acks_owed);
        }

        let destinations = match ch.dest_addr.socket_addr() {
            Some(addr) => vec![addr],
            None => ch.members()
                .filter_map(|(_, m)| self.members.get(m))
                .filter(|m| m.remote_half.state >= HalfState::JoinPending)
                .filter_map(|m| self.remote_components.get(&m.remote_component))
                .map(|c| c.adhoc_addr)
                .collect(),
        };

        self.timers.cancel_opt(&mut ch.keepalive_timer);
        ch.keepalive_timer = Some(self.timers.schedule(now + ch.mak.interval(), TimerAction::KeepAlive(key)));

        trace!("sending wrapper {}/{} of channel {} to {:?}", header.tseq, header.rseq, header.channel, destinations);
        for to in destinations {
            if let Err(e) = self.transport.send_to(to, &datagram) {
                warn!("error sending wrapper to {}: {}", to, e);
            }
        }
        Ok(())
    }

    /// sends ACKs that became due while processing a datagram or timer
    pub(super) fn send_pending_acks(&mut self, now: Instant) {
        let due = self.acks_due.drain().collect::<Vec<_>>();
        for key in due {
            loop {
                let Some(ch) = self.local_channels.get(key) else { break; };
                let mut wrap = TxWrap::new(key, ch.owner, false, self.config.max_packet_size, 0);
                if self.add_pending_acks(&mut wrap) == 0 {
                    break;
                }
                if let Err(e) = self.send_wrapper(wrap, false, now) {
                    warn!("error sending ACKs: {}", e);
                    break;
                }
            }
        }
    }

    pub(super) fn ensure_keepalive(&mut self, channel: LocalChannelKey, now: Instant) {
        if let Some(ch) = self.local_channels.get_mut(channel) {
            if ch.keepalive_timer.is_none() {
                ch.keepalive_timer = Some(self.timers.schedule(now + ch.mak.interval(), TimerAction::KeepAlive(channel)));
            }
        }
    }

    pub(super) fn on_keepalive(&mut self, key: LocalChannelKey, now: Instant) {
        let Some(ch) = self.local_channels.get(key) else { return; };
        if !ch.members().any(|(_, m)| self.members.get(m).map(is_makable).unwrap_or(false)) {
            trace!("no members in channel {} - no keep-alive", ch.number);
            return;
        }
        let mut wrap = TxWrap::new(key, ch.owner, false, self.config.max_packet_size, 0);
        self.add_pending_acks(&mut wrap);
        if let Err(e) = self.send_wrapper(wrap, true, now) {
            warn!("error sending keep-alive: {}", e);
        }
    }

    pub(super) fn on_mak_timeout(&mut self, key: MemberKey, now: Instant) {
        let Some(member) = self.members.get_mut(key) else { return; };
        if member.remote_half.mak_retries_left == 0 {
            info!("{} stopped acknowledging", member.remote_component);
            self.kill_member(key, LeaveCause::MakTimeout, ReasonCode::ChannelExpired, now);
            return;
        }
        member.remote_half.mak_retries_left -= 1;
        let (channel, mid) = (member.local_channel, member.remote_half.mid);
        debug!("no ACK from {} for MAK, {} retries left", member.remote_component, member.remote_half.mak_retries_left);

        if let Some(ch) = self.local_channels.get_mut(channel) {
            ch.mak.add_priority(mid);
            let due = now + ch.mak.interval();
            if ch.keepalive_timer.map(|t| t.deadline() > due).unwrap_or(true) {
                self.timers.cancel_opt(&mut ch.keepalive_timer);
                ch.keepalive_timer = Some(self.timers.schedule(due, TimerAction::KeepAlive(channel)));
            }
        }
    }

    /// An ACK from the peer for our channel. The first one completes its membership.
    pub(super) fn rx_ack(&mut self, key: MemberKey, association: u16, rseq: Seq, now: Instant) {
        let Some(member) = self.members.get_mut(key) else { return; };
        let Some(ch) = self.local_channels.get_mut(member.local_channel) else { return; };
        if association != ch.number {
            debug!("ACK from {} for channel {}, but it is a member of {} - ignoring", member.remote_component, association, ch.number);
            return;
        }
        if rseq.is_after(ch.rseq) {
            warn!("ACK from {} for {} which was never sent - ignoring", member.remote_component, rseq);
            return;
        }

        if rseq.is_after(member.remote_half.acked_rseq) {
            let num_purged = ch.retained.release_acks(member.remote_half.acked_rseq, rseq);
            trace!("ACK {} from {}, purged {} wrappers", rseq, member.remote_component, num_purged);
            member.remote_half.acked_rseq = rseq;
        }
        member.remote_half.mak_retries_left = MAK_MAX_RETRIES;
        self.timers.cancel_opt(&mut member.remote_half.mak_timer);

        let mut accepted_now = false;
        match member.remote_half.state {
            HalfState::JoinRequested => {
                debug!("ACK from {} implies JOIN_ACCEPT", member.remote_component);
                self.timers.cancel_opt(&mut member.remote_half.join_timer);
                member.remote_half.state = HalfState::Member;
                accepted_now = true;
            }
            HalfState::JoinPending => {
                member.remote_half.state = HalfState::Member;
            }
            HalfState::Null | HalfState::Member => {}
        }

        if accepted_now {
            self.on_peer_accepted(key, now);
        }
        self.check_first_ack(key, now);
        self.check_full_member(key, now);
    }

    pub(super) fn rx_wrapper(&mut self, sender: Cid, data: WrapperData, now: Instant) {
        let header = data.header;
        let Some(&rc_key) = self.remote_channels_by_number.get(&(sender, header.channel)) else {
            trace!("wrapper for channel {} of {} which we are not a member of", header.channel, sender);
            return;
        };
        let Some(rc) = self.remote_channels.get_mut(rc_key) else { return; };

        if !header.tseq.is_after(rc.tseq) {
            trace!("repeated wrapper {} in channel {} of {}", header.tseq, header.channel, sender);
            return;
        }
        if header.oldest_available.is_after(rc.rseq.next()) {
            warn!("channel {} of {} lost sequence: need {}, oldest available is {}", header.channel, sender, rc.rseq.next(), header.oldest_available);
            self.kill_remote_channel_members(rc_key, LeaveCause::LostSequence, ReasonCode::LostSequence, now);
            return;
        }

        let wrap = RxWrap {
            header,
            reliable: data.reliable,
            client_block: data.client_block,
        };
        if wrap.is_deliverable(rc.rseq) {
            self.deliver(rc_key, wrap, now);
            while let Some(next) = self.remote_channels.get_mut(rc_key).and_then(|rc| rc.queue.pop_deliverable(rc.tseq, rc.rseq)) {
                self.deliver(rc_key, next, now);
            }
        }
        else if wrap.needs_rseq().is_after(rc.rseq) {
            trace!("wrapper {} in channel {} arrived ahead of {}", header.rseq, header.channel, rc.rseq.next());
            if !rc.queue.insert(wrap) {
                trace!("wrapper {} is already queued", header.tseq);
            }
        }
        else {
            trace!("stale wrapper {} in channel {}", header.tseq, header.channel);
        }

        self.update_nak(rc_key, now);
    }

    fn deliver(&mut self, rc_key: RemoteChannelKey, wrap: RxWrap, now: Instant) {
        let Some(rc) = self.remote_channels.get_mut(rc_key) else { return; };
        rc.tseq = wrap.header.tseq;
        if wrap.reliable {
            rc.rseq = wrap.header.rseq;
        }
        let (rseq, expiry) = (rc.rseq, rc.params.expiry);
        let members = rc.members.clone();

        for &key in &members {
            let Some(member) = self.members.get_mut(key) else { continue; };
            self.timers.cancel_opt(&mut member.local_half.expiry_timer);
            member.local_half.expiry_timer = Some(self.timers.schedule(now + expiry, TimerAction::MemberExpiry(key)));

            if member.local_half.state == HalfState::Member {
                let threshold = wrap.header.mak_threshold;
                let over_threshold = threshold != 0 && rseq.diff(member.local_half.last_acked) >= threshold as i32;
                if wrap.header.is_maked(member.local_half.mid) || over_threshold {
                    member.local_half.ack_pending = true;
                    self.acks_due.insert(member.local_channel);
                }
            }
        }

        for pdu in ClientPdu::read_block(wrap.client_block.clone()) {
            let pdu = match pdu {
                Ok(pdu) => pdu,
                Err(e) => {
                    warn!("malformed client block in wrapper {}: {}", wrap.header.tseq, e);
                    break;
                }
            };

            let targets = members.iter()
                .copied()
                .filter(|&key| self.members.get(key)
                    .map(|m| m.local_half.state >= HalfState::JoinPending
                        && !m.tearing_down
                        && (pdu.dest_mid == MID_ALL_MEMBERS || pdu.dest_mid == m.local_half.mid))
                    .unwrap_or(false))
                .collect::<Vec<_>>();

            for key in targets {
                if !self.members.contains(key) {
                    continue;
                }
                if pdu.protocol == SDT_PROTOCOL_ID {
                    for msg in WrappedMessage::read_block(pdu.data.clone()) {
                        match msg {
                            Ok(msg) => self.rx_wrapped(key, pdu.association, msg, now),
                            Err(e) => {
                                debug!("malformed SDT message: {}", e);
                                break;
                            }
                        }
                        if !self.members.contains(key) {
                            break;
                        }
                    }
                }
                else {
                    self.deliver_to_client(key, &pdu, wrap.reliable);
                }
            }
        }
    }

    fn deliver_to_client(&mut self, key: MemberKey, pdu: &ClientPdu, reliable: bool) {
        let Some(member) = self.members.get(key) else { return; };
        if !member.connected.contains(&pdu.protocol) {
            trace!("no session for protocol {} with {} - dropping message", pdu.protocol, member.remote_component);
            return;
        }
        let msg = ClientMessage {
            member: member.data(key),
            protocol: pdu.protocol,
            association: pdu.association,
            reliable,
            data: pdu.data.clone(),
        };
        match self.client_protocols.get_mut(&pdu.protocol) {
            Some(handler) => handler.on_message(msg),
            None => debug!("protocol {} was deregistered - dropping message", pdu.protocol),
        }
    }

    pub(super) fn kill_remote_channel_members(&mut self, rc_key: RemoteChannelKey, cause: LeaveCause, reason: ReasonCode, now: Instant) {
        let members = self.remote_channels.get(rc_key)
            .map(|rc| rc.members.clone())
            .unwrap_or_default();
        for key in members {
            self.kill_member(key, cause, reason, now);
        }
    }

    /// Starts, extends or ends NAKing after the remote channel's queue changed
    fn update_nak(&mut self, rc_key: RemoteChannelKey, now: Instant) {
        let Some(rc) = self.remote_channels.get_mut(rc_key) else { return; };

        let Some(last) = rc.queue.last_missing(rc.rseq) else {
            if rc.nak.phase != NakPhase::Idle {
                debug!("gap in channel {} of {} is closed", rc.number, rc.leader);
                self.timers.cancel_opt(&mut rc.nak.timer);
                rc.nak.phase = NakPhase::Idle;
                rc.nak.retries_left = NAK_MAX_RETRIES;
            }
            return;
        };

        rc.nak.first = rc.rseq.next();
        rc.nak.last = last;
        if rc.nak.phase != NakPhase::Idle {
            return;
        }

        rc.nak.retries_left = NAK_MAX_RETRIES;
        let mid = rc.members.first()
            .and_then(|&key| self.members.get(key))
            .map(|m| m.local_half.mid)
            .unwrap_or(0);
        let holdoff = nak_holdoff(&rc.params, rc.rseq, mid);
        debug!("missing {}..{} in channel {} of {}, NAK holdoff {:?}", rc.nak.first, rc.nak.last, rc.number, rc.leader, holdoff);

        rc.nak.phase = NakPhase::Holdoff;
        if holdoff.is_zero() {
            self.send_nak_and_wait(rc_key, now);
        }
        else {
            rc.nak.timer = Some(self.timers.schedule(now + holdoff, TimerAction::Nak(rc_key)));
        }
    }

    pub(super) fn on_nak_timer(&mut self, rc_key: RemoteChannelKey, now: Instant) {
        let Some(rc) = self.remote_channels.get_mut(rc_key) else { return; };
        let phase = rc.nak.phase;
        match phase {
            NakPhase::Idle => {}
            NakPhase::Holdoff => self.send_nak_and_wait(rc_key, now),
            NakPhase::Waiting | NakPhase::Suppressed => {
                if rc.nak.retries_left == 0 {
                    warn!("channel {} of {} does not retransmit {}..{}", rc.number, rc.leader, rc.nak.first, rc.nak.last);
                    self.kill_remote_channel_members(rc_key, LeaveCause::NakTimeout, ReasonCode::LostSequence, now);
                    return;
                }
                if phase == NakPhase::Waiting {
                    rc.nak.retries_left -= 1;
                }
                self.send_nak_and_wait(rc_key, now);
            }
        }
    }

    fn send_nak_and_wait(&mut self, rc_key: RemoteChannelKey, now: Instant) {
        if let Err(e) = self.send_nak(rc_key) {
            warn!("error sending NAK: {}", e);
        }
        if let Some(rc) = self.remote_channels.get_mut(rc_key) {
            rc.nak.phase = NakPhase::Waiting;
            self.timers.cancel_opt(&mut rc.nak.timer);
            rc.nak.timer = Some(self.timers.schedule(now + SdtConfig::nak_timeout(rc.params.expiry), TimerAction::Nak(rc_key)));
        }
    }

    fn send_nak(&self, rc_key: RemoteChannelKey) -> anyhow::Result<()> {
        let rc = self.remote_channels.get(rc_key)
            .ok_or_else(|| anyhow!("unknown remote channel {:?}", rc_key))?;
        let member = rc.members.iter()
            .filter_map(|&key| self.members.get(key))
            .find(|m| m.local_half.state >= HalfState::JoinPending && !m.tearing_down)
            .ok_or_else(|| anyhow!("no member in channel {} of {}", rc.number, rc.leader))?;
        let leader_addr = self.adhoc_addr_of(rc.leader)
            .ok_or_else(|| anyhow!("no address for {}", rc.leader))?;

        let msg = SdtMessage::Nak(NakData {
            leader: rc.leader,
            channel: rc.number,
            mid: member.local_half.mid,
            rseq: rc.rseq,
            first_missed: rc.nak.first,
            last_missed: rc.nak.last,
        });
        debug!("NAK {}..{} to {}", rc.nak.first, rc.nak.last, rc.leader);
        self.send_sdt_message(member.local_component, leader_addr, &msg)?;

        if rc.params.nak_outbound {
            if let Some(dest) = rc.dest_addr.socket_addr() {
                if dest.ip().is_multicast() {
                    self.send_sdt_message(member.local_component, dest, &msg)?;
                }
            }
        }
        Ok(())
    }

    pub(super) fn rx_nak(&mut self, sender: Cid, from: SocketAddr, data: NakData, now: Instant) {
        if self.local_components.contains_key(&data.leader) {
            let Some(&ch_key) = self.local_channels_by_number.get(&(data.leader, data.channel)) else {
                debug!("NAK from {} for unknown channel {}", sender, data.channel);
                return;
            };
            if self.find_member_by_mid(data.leader, data.channel, data.mid, sender).is_none() {
                debug!("NAK from {} which is not MID {} of channel {}", sender, data.mid, data.channel);
                return;
            }
            if let Err(e) = self.resend(ch_key, data.first_missed, data.last_missed, from, now) {
                warn!("error retransmitting: {}", e);
            }
            return;
        }

        // another member's NAK, sent outbound
        let Some(&rc_key) = self.remote_channels_by_number.get(&(data.leader, data.channel)) else { return; };
        let Some(rc) = self.remote_channels.get_mut(rc_key) else { return; };
        if rc.nak.phase == NakPhase::Holdoff && rc.nak.overlaps(data.first_missed, data.last_missed) {
            debug!("NAK for channel {} is covered by {}", rc.number, sender);
            rc.nak.phase = NakPhase::Suppressed;
            self.timers.cancel_opt(&mut rc.nak.timer);
            rc.nak.timer = Some(self.timers.schedule(now + SdtConfig::nak_timeout(rc.params.expiry), TimerAction::Nak(rc_key)));
        }
    }

    /// Retransmits retained wrappers in `first..=last`, coalesced into as few datagrams as
    ///  possible. Wrappers retransmitted within the last blank time are skipped.
    fn resend(&mut self, key: LocalChannelKey, first: Seq, last: Seq, nak_from: SocketAddr, now: Instant) -> anyhow::Result<()> {
        let ch = self.local_channels.get_mut(key)
            .ok_or_else(|| anyhow!("unknown local channel {:?}", key))?;
        let blank = ch.blank;
        let wraps = ch.retained.in_range(first, last)
            .filter(|w| blank.map(|(f, l)| !w.rseq.is_in(f, l)).unwrap_or(true))
            .map(|w| (w.rseq, w.pdu.clone()))
            .collect::<Vec<_>>();
        let (Some(served_first), Some(served_last)) = (wraps.first().map(|w| w.0), wraps.last().map(|w| w.0)) else {
            debug!("nothing to retransmit for {}..{} in channel {}", first, last, ch.number);
            return Ok(());
        };

        let oldest = ch.oldest_available();
        let mut datagrams = Vec::new();
        let mut buf = BytesMut::with_capacity(self.config.max_packet_size);
        let mut root_start = None;
        for (_, pdu) in &wraps {
            if let Some(start) = root_start {
                if buf.len() + pdu.len() > self.config.max_packet_size {
                    finish_datagram(&mut buf, start)?;
                    datagrams.push(buf.split().freeze());
                    root_start = None;
                }
            }
            if root_start.is_none() {
                root_start = Some(start_datagram(&mut buf, ch.owner));
            }

            let header_start = buf.len() + 3;
            buf.extend_from_slice(pdu);
            let oldest_offs = header_start + WrapperHeader::OFFS_OLDEST_AVAILABLE;
            buf[oldest_offs..oldest_offs + 4].copy_from_slice(&oldest.to_raw().to_be_bytes());
            let mak_offs = header_start + WrapperHeader::OFFS_MAK_RANGE;
            buf[mak_offs..mak_offs + 4].fill(0);
        }
        if let Some(start) = root_start {
            finish_datagram(&mut buf, start)?;
            datagrams.push(buf.freeze());
        }

        // the window only ever covers one contiguous span of retransmitted wrappers
        ch.blank = Some(match ch.blank {
            Some((f, l)) if !served_first.is_after(l.next()) && !f.is_after(served_last.next()) =>
                (f.min(served_first), l.max(served_last)),
            _ => (served_first, served_last),
        });
        self.timers.cancel_opt(&mut ch.blank_timer);
        ch.blank_timer = Some(self.timers.schedule(now + self.config.nak_blank_time, TimerAction::BlankClear(key)));

        let to = ch.dest_addr.socket_addr().unwrap_or(nak_from);
        debug!("retransmitting {}..{} of channel {} to {} in {} datagrams", served_first, served_last, ch.number, to, datagrams.len());
        for datagram in datagrams {
            self.transport.send_to(to, &datagram)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::Instant;

    use rstest::rstest;

    use crate::sdt::client::MockClientProtocolHandler;
    use crate::sdt::config::{SdtConfig, NAK_MAX_RETRIES};
    use crate::sdt::events::LeaveCause;
    use crate::sdt::member::MemberKey;
    use crate::sdt::nak::NakPhase;
    use crate::sdt::seq::Seq;
    use crate::test_util::{exchange, join_nodes, joined_pair, test_addr, test_cid, SdtTestNode, SentDatagram};
    use crate::wire::reason_code::ReasonCode;
    use crate::wire::sdt_messages::{NakData, SdtMessage, WrapperData, WrapperHeader};
    use crate::wire::transport_addr::TransportAddr;
    use crate::wire::wrapped_messages::{ClientPdu, MID_ALL_MEMBERS};

    fn to_all(data: &'static [u8]) -> ClientPdu {
        ClientPdu {
            dest_mid: MID_ALL_MEMBERS,
            protocol: 0x99,
            association: 0,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_nak_resends_only_missing_wrapper() {
        let now = Instant::now();
        let (mut a, mut b, member) = joined_pair(SdtConfig::default_ipv4(), now);
        let channel = a.engine.member(member).unwrap().local_channel;

        for data in [b"one" as &[u8], b"two", b"three"] {
            a.engine.send_wrap(channel, true, &ClientPdu { data: Bytes::copy_from_slice(data), ..to_all(b"") }, now).unwrap();
        }
        let mut sent = a.take_sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent.iter().map(|d| d.wrapper().header.rseq).collect::<Vec<_>>(), vec![Seq::from_raw(1), Seq::from_raw(2), Seq::from_raw(3)]);
        let lost = sent.remove(1);
        for d in sent {
            b.engine.on_datagram(a.addr, d.data, now);
        }
        let rc = b.engine.remote_channel(a.cid, a.engine.local_channel(channel).unwrap().number).unwrap();
        assert_eq!(rc.rseq, Seq::from_raw(1));
        assert_eq!(rc.queue.len(), 1);
        b.take_sent();

        // holdoff for rseq 1 and MID 1 with modulus 50 is two 2ms intervals
        b.run_timers_until(now + Duration::from_millis(3));
        assert!(b.take_sent().is_empty());
        let t = now + Duration::from_millis(4);
        b.run_timers_until(t);
        let nak = b.take_sent().remove(0);
        match &nak.messages()[0].1 {
            SdtMessage::Nak(data) => {
                assert_eq!(data.first_missed, Seq::from_raw(2));
                assert_eq!(data.last_missed, Seq::from_raw(2));
            }
            other => panic!("expected NAK, was {:?}", other),
        }

        a.engine.on_datagram(b.addr, nak.data.clone(), t);
        let resent = a.take_sent();
        assert_eq!(resent.len(), 1);
        let wrappers = resent[0].wrappers();
        assert_eq!(wrappers.len(), 1);
        assert_eq!(wrappers[0].header.rseq, Seq::from_raw(2));
        assert_eq!(wrappers[0].header.first_mak, 0);
        assert_eq!(wrappers[0].client_block, lost.wrapper().client_block);

        // a second NAK within the blank time is ignored
        a.engine.on_datagram(b.addr, nak.data.clone(), t + Duration::from_millis(1));
        assert!(a.take_sent().is_empty());

        // ... but served again after it
        a.run_timers_until(t + Duration::from_millis(6));
        a.engine.on_datagram(b.addr, nak.data, t + Duration::from_millis(6));
        assert_eq!(a.take_sent().len(), 1);

        b.engine.on_datagram(a.addr, resent.into_iter().next().unwrap().data, t);
        let rc = b.engine.remote_channel(a.cid, a.engine.local_channel(channel).unwrap().number).unwrap();
        assert_eq!(rc.rseq, Seq::from_raw(3));
        assert!(rc.queue.is_empty());
        assert_eq!(rc.nak.phase, NakPhase::Idle);
    }

    fn channel_number(node: &SdtTestNode, member: MemberKey) -> u16 {
        let channel = node.engine.member(member).unwrap().local_channel;
        node.engine.local_channel(channel).unwrap().number
    }

    /// a NAK from b for `first..=last` of a's channel
    fn nak_from_b(a: &mut SdtTestNode, b: &SdtTestNode, member: MemberKey, first: u32, last: u32, now: Instant) {
        let nak = NakData {
            leader: a.cid,
            channel: channel_number(a, member),
            mid: a.engine.member(member).unwrap().remote_half.mid,
            rseq: Seq::ZERO,
            first_missed: Seq::from_raw(first),
            last_missed: Seq::from_raw(last),
        };
        a.receive(b.cid, b.addr, SdtMessage::Nak(nak), now);
    }

    fn count_naks(sent: &[SentDatagram]) -> usize {
        sent.iter()
            .flat_map(|d| d.messages())
            .filter(|(_, m)| matches!(m, SdtMessage::Nak(_)))
            .count()
    }

    #[rstest]
    #[case::one_datagram(1400, vec![3])]
    #[case::one_per_datagram(200, vec![1, 1, 1])]
    fn test_resend_coalesces_up_to_packet_size(#[case] max_packet_size: usize, #[case] expected_wrappers: Vec<usize>) {
        let now = Instant::now();
        let mut config = SdtConfig::default_ipv4();
        config.max_packet_size = max_packet_size;
        let (mut a, b, member) = joined_pair(config, now);
        let channel = a.engine.member(member).unwrap().local_channel;

        for _ in 0..3 {
            a.engine.send_wrap(channel, true, &ClientPdu { data: Bytes::from(vec![7u8; 60]), ..to_all(b"") }, now).unwrap();
        }
        a.take_sent();

        nak_from_b(&mut a, &b, member, 1, 3, now);
        let resent = a.take_sent();
        assert!(resent.iter().all(|d| d.to == b.addr && d.data.len() <= max_packet_size));
        assert_eq!(resent.iter().map(|d| d.wrappers().len()).collect::<Vec<_>>(), expected_wrappers);
        let rseqs = resent.iter()
            .flat_map(|d| d.wrappers())
            .map(|w| w.header.rseq.to_raw())
            .collect::<Vec<_>>();
        assert_eq!(rseqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_blank_window_does_not_cover_gaps() {
        let now = Instant::now();
        let (mut a, b, member) = joined_pair(SdtConfig::default_ipv4(), now);
        let channel = a.engine.member(member).unwrap().local_channel;
        for _ in 0..5 {
            a.engine.send_wrap(channel, true, &to_all(b"data"), now).unwrap();
        }
        a.take_sent();

        nak_from_b(&mut a, &b, member, 2, 2, now);
        assert_eq!(a.take_sent().len(), 1);
        nak_from_b(&mut a, &b, member, 4, 4, now);
        assert_eq!(a.take_sent().len(), 1);

        // 3 was never retransmitted
        nak_from_b(&mut a, &b, member, 3, 3, now);
        let resent = a.take_sent();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].wrapper().header.rseq, Seq::from_raw(3));

        nak_from_b(&mut a, &b, member, 3, 4, now);
        assert!(a.take_sent().is_empty());
    }

    #[test]
    fn test_nak_without_holdoff_is_sent_at_once() {
        let now = Instant::now();
        let mut config = SdtConfig::default_ipv4();
        config.default_channel_params.nak_holdoff = Duration::ZERO;
        config.default_channel_params.nak_max_wait = Duration::ZERO;
        let (mut a, mut b, member) = joined_pair(config, now);
        let channel = a.engine.member(member).unwrap().local_channel;

        a.engine.send_wrap(channel, true, &to_all(b"one"), now).unwrap();
        a.engine.send_wrap(channel, true, &to_all(b"two"), now).unwrap();
        let second = a.take_sent().remove(1);
        b.take_sent();

        b.engine.on_datagram(a.addr, second.data, now);
        assert_eq!(count_naks(&b.take_sent()), 1);
        let rc = b.engine.remote_channel(a.cid, channel_number(&a, member)).unwrap();
        assert_eq!(rc.nak.phase, NakPhase::Waiting);
    }

    #[test]
    fn test_nak_suppressed_by_other_member() {
        let now = Instant::now();
        let (mut a, mut b, member) = joined_pair(SdtConfig::default_ipv4(), now);
        let channel = a.engine.member(member).unwrap().local_channel;
        let number = channel_number(&a, member);

        a.engine.send_wrap(channel, true, &to_all(b"one"), now).unwrap();
        a.engine.send_wrap(channel, true, &to_all(b"two"), now).unwrap();
        let second = a.take_sent().remove(1);
        b.take_sent();
        b.engine.on_datagram(a.addr, second.data, now);
        assert_eq!(b.engine.remote_channel(a.cid, number).unwrap().nak.phase, NakPhase::Holdoff);

        let foreign_nak = NakData {
            leader: a.cid,
            channel: number,
            mid: 7,
            rseq: Seq::ZERO,
            first_missed: Seq::from_raw(1),
            last_missed: Seq::from_raw(1),
        };
        b.receive(test_cid(3), test_addr(3), SdtMessage::Nak(foreign_nak), now);

        let rc = b.engine.remote_channel(a.cid, number).unwrap();
        assert_eq!(rc.nak.phase, NakPhase::Suppressed);
        assert_eq!(rc.nak.retries_left, NAK_MAX_RETRIES);

        b.run_timers_until(now + Duration::from_millis(100));
        assert_eq!(count_naks(&b.take_sent()), 0);
        assert_eq!(b.engine.remote_channel(a.cid, number).unwrap().nak.retries_left, NAK_MAX_RETRIES);
    }

    #[test]
    fn test_nak_timeout_loses_channel() {
        let now = Instant::now();
        let (mut a, mut b, member) = joined_pair(SdtConfig::default_ipv4(), now);
        let channel = a.engine.member(member).unwrap().local_channel;

        a.engine.send_wrap(channel, true, &to_all(b"one"), now).unwrap();
        a.engine.send_wrap(channel, true, &to_all(b"two"), now).unwrap();
        let second = a.take_sent().remove(1);
        b.engine.on_datagram(a.addr, second.data, now);

        // 2ms holdoff, then three NAK timeouts of 1.5s
        b.run_timers_until(now + Duration::from_millis(4_400));
        assert_eq!(b.engine.num_members(), 1);
        b.run_timers_until(now + Duration::from_secs(5));
        assert_eq!(b.engine.num_members(), 0);
        assert_eq!(b.left_events(), vec![(LeaveCause::NakTimeout, ReasonCode::LostSequence)]);

        let naks = b.take_sent().iter()
            .flat_map(|d| d.messages())
            .filter(|(_, m)| matches!(m, SdtMessage::Nak(_)))
            .count();
        assert_eq!(naks, 3);
    }

    #[test]
    fn test_purge_after_all_members_acked() {
        let now = Instant::now();
        let (mut a, mut b, member_b) = joined_pair(SdtConfig::default_ipv4(), now);
        let mut c = SdtTestNode::new(3, SdtConfig::default_ipv4());
        let channel = a.engine.member(member_b).unwrap().local_channel;
        join_nodes(&mut a, &mut c, channel, now);
        assert_eq!(a.engine.local_channel(channel).unwrap().member_count(), 2);
        assert!(a.engine.local_channel(channel).unwrap().retained.is_empty());

        a.engine.send_wrap(channel, true, &to_all(b"data"), now).unwrap();
        let ch = a.engine.local_channel(channel).unwrap();
        assert_eq!(ch.retained.acks_owed(ch.rseq), Some(2));

        exchange(&mut a, &mut b, now);
        let ch = a.engine.local_channel(channel).unwrap();
        assert_eq!(ch.retained.acks_owed(ch.rseq), Some(1));

        exchange(&mut a, &mut c, now);
        assert!(a.engine.local_channel(channel).unwrap().retained.is_empty());
    }

    #[test]
    fn test_lost_sequence() {
        let now = Instant::now();
        let (a, mut b, member) = joined_pair(SdtConfig::default_ipv4(), now);
        let number = a.engine.local_channel(a.engine.member(member).unwrap().local_channel).unwrap().number;
        let rc = b.engine.remote_channel(a.cid, number).unwrap();

        let header = WrapperHeader {
            channel: number,
            tseq: Seq::from_raw(rc.tseq.to_raw() + 5),
            rseq: Seq::from_raw(rc.rseq.to_raw() + 5),
            oldest_available: Seq::from_raw(rc.rseq.to_raw() + 3),
            first_mak: 0,
            last_mak: 0,
            mak_threshold: 0,
        };
        b.receive(a.cid, a.addr, SdtMessage::Wrapper(WrapperData { reliable: true, header, client_block: Bytes::new() }), now);

        assert_eq!(b.engine.num_members(), 0);
        assert_eq!(b.left_events(), vec![(LeaveCause::LostSequence, ReasonCode::LostSequence)]);
    }

    #[test]
    fn test_mak_timeout_frees_mid() {
        let now = Instant::now();
        let (mut a, _b, member) = joined_pair(SdtConfig::default_ipv4(), now);
        let channel = a.engine.member(member).unwrap().local_channel;

        // b is silent from here on: keep-alive at 5s, then two priority MAKs
        a.run_timers_until(now + Duration::from_secs(13));
        assert!(a.engine.member(member).is_some());
        assert_eq!(a.engine.member(member).unwrap().remote_half.mak_retries_left, 0);

        a.run_timers_until(now + Duration::from_secs(14));
        assert!(a.engine.member(member).is_none());
        assert_eq!(a.left_events(), vec![(LeaveCause::MakTimeout, ReasonCode::ChannelExpired)]);
        assert!(a.engine.local_channel(channel).unwrap().retained.is_empty());

        let next = a.engine.add_member(channel, crate::test_util::test_cid(3), crate::test_util::test_addr(3), now).unwrap();
        assert_eq!(a.engine.member(next).unwrap().remote_half.mid, 1);
    }

    #[test]
    fn test_keepalive_keeps_members() {
        let now = Instant::now();
        let (mut a, mut b, member) = joined_pair(SdtConfig::default_ipv4(), now);

        let mut t = now;
        for _ in 0..60 {
            t += Duration::from_secs(1);
            a.run_timers_until(t);
            b.run_timers_until(t);
            exchange(&mut a, &mut b, t);
        }
        assert!(a.engine.member(member).is_some());
        assert_eq!(b.engine.num_members(), 1);
        assert!(a.left_events().is_empty());
    }

    #[test]
    fn test_client_data_on_connected_session() {
        let now = Instant::now();
        let mut a = SdtTestNode::new(1, SdtConfig::default_ipv4());
        let mut b = SdtTestNode::new(2, SdtConfig::default_ipv4());

        a.engine.register_client_protocol(0x42, Box::new(MockClientProtocolHandler::new())).unwrap();
        let mut handler = MockClientProtocolHandler::new();
        handler.expect_on_message()
            .withf(|msg| msg.protocol == 0x42 && msg.reliable && msg.data == Bytes::from_static(b"hello"))
            .times(1)
            .return_const(());
        b.engine.register_client_protocol(0x42, Box::new(handler)).unwrap();

        let channel = a.open_channel(TransportAddr::Null);
        let member = join_nodes(&mut a, &mut b, channel, now);
        assert!(a.engine.member(member).unwrap().connected.contains(&0x42));

        a.engine.send_to_member(member, 0x42, b"hello", true, now).unwrap();
        assert!(a.engine.send_to_member(member, 0x43, b"nope", true, now).is_err());
        exchange(&mut a, &mut b, now);
    }
}
