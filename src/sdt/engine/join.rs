use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::sdt::channel::{LocalChannelKey, RemoteChannel};
use crate::sdt::client::{ChannelDecision, ChannelRequest};
use crate::sdt::config::{SdtConfig, MIN_EXPIRY_TIME};
use crate::sdt::engine::{SdtEngine, TimerAction};
use crate::sdt::events::{LeaveCause, SdtEvent};
use crate::sdt::member::{HalfState, Member, MemberKey};
use crate::wire::channel_params::ChannelParams;
use crate::wire::cid::Cid;
use crate::wire::reason_code::ReasonCode;
use crate::wire::sdt_messages::{JoinAcceptData, JoinData, RefuseData, SdtMessage};
use crate::wire::transport_addr::TransportAddr;
use crate::wire::wrapped_messages::{Mid, MAX_MID};

impl SdtEngine {
    /// Adds a peer component to a local channel by sending it a JOIN. The membership is
    ///  complete when the peer has joined back and both sides acknowledged, which is reported
    ///  as [SdtEvent::MemberJoined].
    pub fn add_member(&mut self, channel: LocalChannelKey, remote: Cid, remote_addr: SocketAddr, now: Instant) -> anyhow::Result<MemberKey> {
        let ch = self.local_channels.get(channel)
            .ok_or_else(|| anyhow!("unknown local channel {:?}", channel))?;
        if self.members.len() >= self.config.max_members {
            bail!("maximum number of members reached");
        }
        if self.find_member_in_channel(channel, remote).is_some() {
            bail!("{} is already a member of channel {}", remote, ch.number);
        }

        let key = self.new_member(channel, remote, remote_addr, true)
            .ok_or_else(|| anyhow!("channel {:?} is saturated", channel))?;

        if let Err(e) = self.send_join(key, now) {
            self.kill_member(key, LeaveCause::JoinFailed, ReasonCode::Nonspecific, now);
            return Err(e);
        }
        Ok(key)
    }

    /// allocates a member with a MID in the channel, its remote half ready to send JOIN
    fn new_member(&mut self, channel: LocalChannelKey, remote: Cid, remote_addr: SocketAddr, initiated_locally: bool) -> Option<MemberKey> {
        let ch = self.local_channels.get(channel)?;
        let key = self.members.insert(Member::new(ch.owner, remote, channel, initiated_locally));

        let Some(ch) = self.local_channels.get_mut(channel) else {
            self.members.remove(key);
            return None;
        };
        let Some(mid) = ch.alloc_mid(key) else {
            self.members.remove(key);
            return None;
        };
        let (tseq, rseq) = (ch.tseq, ch.rseq);

        if let Some(member) = self.members.get_mut(key) {
            let half = &mut member.remote_half;
            half.state = HalfState::JoinRequested;
            half.mid = mid;
            half.acked_rseq = rseq;
            half.join_tseq = tseq;
            half.join_rseq = rseq;
            half.join_retries_left = self.config.join_retries;
            half.join_timeout = self.config.join_timeout;
        }
        self.register_remote_component(remote, remote_addr);
        Some(key)
    }

    /// sends (or re-sends) the JOIN for a member's remote half, and arms the retry timer
    fn send_join(&mut self, key: MemberKey, now: Instant) -> anyhow::Result<()> {
        let member = self.members.get(key)
            .ok_or_else(|| anyhow!("unknown member {:?}", key))?;
        let ch = self.local_channels.get(member.local_channel)
            .ok_or_else(|| anyhow!("member {:?} without a channel", key))?;
        let reciprocal = member.local_half.remote_channel
            .and_then(|rc| self.remote_channels.get(rc))
            .map(|rc| rc.number)
            .unwrap_or(0);
        let to = self.adhoc_addr_of(member.remote_component)
            .ok_or_else(|| anyhow!("no address for {}", member.remote_component))?;

        let msg = SdtMessage::Join(JoinData {
            dest: member.remote_component,
            mid: member.remote_half.mid,
            channel: ch.number,
            reciprocal,
            tseq: member.remote_half.join_tseq,
            rseq: member.remote_half.join_rseq,
            dest_addr: ch.dest_addr,
            params: ch.params,
            adhoc_expiry: self.config.adhoc_expiry,
        });
        debug!("sending JOIN for channel {} / MID {} to {}", ch.number, member.remote_half.mid, member.remote_component);
        self.send_sdt_message(ch.owner, to, &msg)?;

        let timeout = member.remote_half.join_timeout;
        let handle = self.timers.schedule(now + timeout, TimerAction::JoinRetry(key));
        if let Some(member) = self.members.get_mut(key) {
            if let Some(old) = member.remote_half.join_timer.replace(handle) {
                self.timers.cancel(old);
            }
        }
        Ok(())
    }

    pub(super) fn on_join_retry(&mut self, key: MemberKey, now: Instant) {
        let Some(member) = self.members.get_mut(key) else { return; };
        if member.remote_half.state != HalfState::JoinRequested {
            return;
        }
        if member.remote_half.join_retries_left == 0 {
            info!("no answer to JOIN from {}", member.remote_component);
            self.kill_member(key, LeaveCause::JoinFailed, ReasonCode::Nonspecific, now);
            return;
        }
        member.remote_half.join_retries_left -= 1;
        member.remote_half.join_timeout *= 2;

        if let Err(e) = self.send_join(key, now) {
            warn!("error re-sending JOIN: {}", e);
            self.kill_member(key, LeaveCause::JoinFailed, ReasonCode::Nonspecific, now);
        }
    }

    pub(super) fn on_reciprocal_timeout(&mut self, key: MemberKey, now: Instant) {
        let Some(member) = self.members.get(key) else { return; };
        if member.local_half.state == HalfState::Null {
            info!("{} accepted our JOIN but did not join back", member.remote_component);
            self.kill_member(key, LeaveCause::JoinFailed, ReasonCode::NoReciprocal, now);
        }
    }

    pub(super) fn rx_join(&mut self, sender: Cid, from: SocketAddr, join: JoinData, now: Instant) {
        debug!("JOIN from {} for channel {} / MID {}, reciprocal {}", sender, join.channel, join.mid, join.reciprocal);

        if let Err(reason) = self.handle_join(sender, from, &join, now) {
            debug!("refusing JOIN from {}: {:?}", sender, reason);
            let msg = SdtMessage::JoinRefuse(RefuseData {
                leader: sender,
                channel: join.channel,
                mid: join.mid,
                rseq: join.rseq,
                reason,
            });
            if let Err(e) = self.send_sdt_message(join.dest, from, &msg) {
                warn!("error sending JOIN_REFUSE to {}: {}", from, e);
            }
        }
    }

    /// Everything is validated before any state is allocated, so a refused JOIN leaves no
    ///  trace.
    fn handle_join(&mut self, sender: Cid, from: SocketAddr, join: &JoinData, now: Instant) -> Result<(), ReasonCode> {
        let Some(local) = self.local_components.get(&join.dest) else {
            return Err(ReasonCode::NoRecipient);
        };
        let listening = local.listening;

        if join.channel == 0 || join.mid == 0 || join.mid > MAX_MID {
            return Err(ReasonCode::IllegalParams);
        }
        if join.params.expiry < MIN_EXPIRY_TIME || join.params.nak_modulus == 0 {
            return Err(ReasonCode::IllegalParams);
        }
        match join.dest_addr {
            TransportAddr::Null => {}
            TransportAddr::Ip(addr) if addr.ip().is_multicast() => {
                if self.config.unicast_only {
                    return Err(ReasonCode::OnlyUnicast);
                }
            }
            TransportAddr::Ip(_) => return Err(ReasonCode::BadAddr),
        }

        if let Some(existing) = self.find_member_in_remote_channel(sender, join.channel, join.dest) {
            return self.rx_repeated_join(existing, from, join);
        }

        if join.reciprocal != 0 {
            let key = self.local_channels_by_number.get(&(join.dest, join.reciprocal))
                .and_then(|&channel| self.find_member_in_channel(channel, sender))
                .filter(|&key| self.is_waiting_for_reciprocal(key))
                .ok_or(ReasonCode::NoReciprocal)?;
            self.accept_join(key, sender, from, join, now);
            return Ok(());
        }

        // both sides sent JOIN at the same time: bond our pending member with the peer's channel
        if let Some(key) = self.find_crossed_join(join.dest, sender) {
            debug!("JOIN from {} crossed ours", sender);
            self.accept_join(key, sender, from, join, now);
            return Ok(());
        }

        self.rx_cold_join(sender, from, join, listening, now)
    }

    fn rx_repeated_join(&mut self, key: MemberKey, from: SocketAddr, join: &JoinData) -> Result<(), ReasonCode> {
        let Some(member) = self.members.get(key) else {
            return Err(ReasonCode::Nonspecific);
        };
        if member.local_half.mid != join.mid {
            return Err(ReasonCode::AlreadyMember);
        }
        debug!("repeated JOIN from {} - re-sending JOIN_ACCEPT", member.remote_component);
        if let Err(e) = self.send_join_accept(key, from) {
            warn!("error re-sending JOIN_ACCEPT: {}", e);
        }
        Ok(())
    }

    fn rx_cold_join(&mut self, sender: Cid, from: SocketAddr, join: &JoinData, listening: bool, now: Instant) -> Result<(), ReasonCode> {
        if !listening {
            return Err(ReasonCode::Nonspecific);
        }
        if self.members.len() >= self.config.max_members {
            return Err(ReasonCode::LowResources);
        }

        let request = ChannelRequest {
            local_component: join.dest,
            remote_component: sender,
            remote_addr: from,
            channel: join.channel,
            dest_addr: join.dest_addr,
            params: join.params,
        };
        let (channel, is_new_channel) = match self.channel_request_handler.on_channel_requested(&request) {
            ChannelDecision::Refuse(reason) => return Err(reason),
            ChannelDecision::NewChannel => {
                if self.local_channels.len() >= self.config.max_local_channels {
                    return Err(ReasonCode::LowResources);
                }
                let params = ChannelParams {
                    expiry: join.params.expiry,
                    ..self.config.default_channel_params
                };
                let channel = self.open_local_channel(join.dest, TransportAddr::Null, Some(params), false)
                    .map_err(|e| {
                        warn!("error opening reciprocal channel: {}", e);
                        ReasonCode::LowResources
                    })?;
                (channel, true)
            }
            ChannelDecision::UseChannel(channel) => {
                match self.local_channels.get(channel) {
                    Some(ch) if ch.owner == join.dest => {}
                    _ => {
                        warn!("channel request handler returned an invalid channel {:?}", channel);
                        return Err(ReasonCode::Nonspecific);
                    }
                }
                if self.find_member_in_channel(channel, sender).is_some() {
                    return Err(ReasonCode::AlreadyMember);
                }
                (channel, false)
            }
        };

        let Some(key) = self.new_member(channel, sender, from, false) else {
            if is_new_channel {
                self.remove_local_channel(channel);
            }
            return Err(ReasonCode::Saturated);
        };

        self.accept_join(key, sender, from, join, now);
        if let Err(e) = self.send_join(key, now) {
            warn!("error sending reciprocal JOIN: {}", e);
            self.kill_member(key, LeaveCause::JoinFailed, ReasonCode::Nonspecific, now);
        }
        Ok(())
    }

    /// Puts the member's local half into the peer's channel, and answers with JOIN_ACCEPT
    fn accept_join(&mut self, key: MemberKey, leader: Cid, from: SocketAddr, join: &JoinData, now: Instant) {
        let rc_key = match self.remote_channels_by_number.get(&(leader, join.channel)) {
            Some(&rc_key) => rc_key,
            None => {
                let rc_key = self.remote_channels.insert(RemoteChannel::new(leader, join.channel, join.params, join.dest_addr, join.tseq, join.rseq));
                self.remote_channels_by_number.insert((leader, join.channel), rc_key);
                if let Some(addr) = join.dest_addr.socket_addr() {
                    if addr.ip().is_multicast() {
                        self.subscribe(addr.ip());
                    }
                }
                debug!("joined remote channel {} of {}", join.channel, leader);
                rc_key
            }
        };
        let Some(rc) = self.remote_channels.get_mut(rc_key) else { return; };
        rc.members.push(key);
        let (rc_rseq, expiry) = (rc.rseq, rc.params.expiry);

        if let Some(component) = self.remote_components.get_mut(&leader) {
            component.adhoc_addr = from;
            component.adhoc_expiry = join.adhoc_expiry;
        }

        let Some(member) = self.members.get_mut(key) else { return; };
        member.local_half.state = HalfState::JoinPending;
        member.local_half.mid = join.mid;
        member.local_half.remote_channel = Some(rc_key);
        member.local_half.last_acked = rc_rseq;
        let mut reciprocal_timer = member.remote_half.reciprocal_timer.take();
        self.timers.cancel_opt(&mut reciprocal_timer);

        if let Err(e) = self.send_join_accept(key, from) {
            warn!("error sending JOIN_ACCEPT: {}", e);
        }

        let handle = self.timers.schedule(now + expiry, TimerAction::MemberExpiry(key));
        if let Some(member) = self.members.get_mut(key) {
            member.local_half.expiry_timer = Some(handle);
        }

        self.check_first_ack(key, now);
    }

    fn send_join_accept(&self, key: MemberKey, to: SocketAddr) -> anyhow::Result<()> {
        let member = self.members.get(key)
            .ok_or_else(|| anyhow!("unknown member {:?}", key))?;
        let rc = member.local_half.remote_channel
            .and_then(|rc| self.remote_channels.get(rc))
            .ok_or_else(|| anyhow!("member {:?} is not in a remote channel", key))?;
        let ch = self.local_channels.get(member.local_channel)
            .ok_or_else(|| anyhow!("member {:?} without a channel", key))?;

        let msg = SdtMessage::JoinAccept(JoinAcceptData {
            leader: rc.leader,
            channel: rc.number,
            mid: member.local_half.mid,
            rseq: rc.rseq,
            reciprocal: ch.number,
        });
        self.send_sdt_message(member.local_component, to, &msg)
    }

    /// The local half becomes a member by sending its first ACK, which is only meaningful once
    ///  the peer knows it is a member of our channel.
    pub(super) fn check_first_ack(&mut self, key: MemberKey, now: Instant) {
        let Some(member) = self.members.get_mut(key) else { return; };
        if member.local_half.state != HalfState::JoinPending || member.remote_half.state < HalfState::JoinPending {
            return;
        }
        member.local_half.state = HalfState::Member;
        member.local_half.ack_pending = true;
        self.acks_due.insert(member.local_channel);

        let handle = self.timers.schedule(now + self.config.join_timeout, TimerAction::FirstAckResend(key));
        if let Some(old) = member.local_half.first_ack_timer.replace(handle) {
            self.timers.cancel(old);
        }

        self.check_full_member(key, now);
    }

    /// the first ACK travels in an unreliable wrapper, so it is sent a second time
    pub(super) fn on_first_ack_resend(&mut self, key: MemberKey) {
        if let Some(member) = self.members.get_mut(key) {
            if member.local_half.state == HalfState::Member {
                member.local_half.ack_pending = true;
                self.acks_due.insert(member.local_channel);
            }
        }
    }

    pub(super) fn check_full_member(&mut self, key: MemberKey, now: Instant) {
        let Some(member) = self.members.get_mut(key) else { return; };
        if member.full_member || member.tearing_down || !member.is_full_member() {
            return;
        }
        member.full_member = true;
        info!("{} and {} are bonded", member.local_component, member.remote_component);
        let data = member.data(key);
        let initiated_locally = member.initiated_locally;
        self.send_event(SdtEvent::MemberJoined(data));

        if initiated_locally && self.config.auto_connect {
            let mut protocols = self.client_protocols.keys().copied().collect::<Vec<_>>();
            protocols.sort();
            if !protocols.is_empty() {
                // the peer only accepts CONNECT once it has our first ACK
                self.send_pending_acks(now);
            }
            for protocol in protocols {
                if let Err(e) = self.connect(key, protocol, now) {
                    warn!("error connecting protocol {}: {}", protocol, e);
                }
            }
        }
    }

    pub(super) fn rx_join_accept(&mut self, sender: Cid, data: JoinAcceptData, now: Instant) {
        let Some(key) = self.find_member_by_mid(data.leader, data.channel, data.mid, sender) else {
            debug!("JOIN_ACCEPT from {} for unknown channel {} / MID {}", sender, data.channel, data.mid);
            return;
        };
        let Some(member) = self.members.get_mut(key) else { return; };
        if member.remote_half.state != HalfState::JoinRequested {
            debug!("duplicate JOIN_ACCEPT from {}", sender);
            return;
        }

        debug!("{} accepted JOIN for channel {}", sender, data.channel);
        member.remote_half.state = HalfState::JoinPending;
        let mut join_timer = member.remote_half.join_timer.take();
        self.timers.cancel_opt(&mut join_timer);
        self.on_peer_accepted(key, now);
        self.check_first_ack(key, now);
    }

    /// the peer is now in our channel: it needs keep-alives, and it has to join back
    pub(super) fn on_peer_accepted(&mut self, key: MemberKey, now: Instant) {
        let Some(member) = self.members.get(key) else { return; };
        let channel = member.local_channel;

        if member.local_half.state == HalfState::Null && member.remote_half.reciprocal_timer.is_none() {
            let expiry = self.local_channels.get(channel)
                .map(|ch| ch.params.expiry)
                .unwrap_or(MIN_EXPIRY_TIME);
            let handle = self.timers.schedule(now + SdtConfig::reciprocal_timeout(expiry), TimerAction::ReciprocalTimeout(key));
            if let Some(member) = self.members.get_mut(key) {
                member.remote_half.reciprocal_timer = Some(handle);
            }
        }

        self.ensure_keepalive(channel, now);
    }

    pub(super) fn rx_join_refuse(&mut self, sender: Cid, data: RefuseData, now: Instant) {
        let Some(key) = self.find_member_by_mid(data.leader, data.channel, data.mid, sender) else {
            debug!("JOIN_REFUSE from {} for unknown channel {} / MID {}", sender, data.channel, data.mid);
            return;
        };
        match self.members.get(key) {
            Some(member) if member.remote_half.state == HalfState::JoinRequested => {
                info!("{} refused JOIN: {:?}", sender, data.reason);
                self.kill_member(key, LeaveCause::JoinFailed, data.reason, now);
            }
            _ => debug!("JOIN_REFUSE from {} for a member that is not joining - ignoring", sender),
        }
    }

    pub(super) fn rx_leaving(&mut self, sender: Cid, data: RefuseData, now: Instant) {
        let Some(key) = self.find_member_by_mid(data.leader, data.channel, data.mid, sender) else {
            debug!("LEAVING from {} for unknown channel {} / MID {}", sender, data.channel, data.mid);
            return;
        };
        info!("{} left channel {}: {:?}", sender, data.channel, data.reason);
        if let Some(member) = self.members.get_mut(key) {
            member.remote_half.peer_left = true;
        }
        self.kill_member(key, LeaveCause::Left, data.reason, now);
    }

    /// the member holding `mid` in a local channel, if it is bonded with `remote`
    pub(super) fn find_member_by_mid(&self, leader: Cid, channel: u16, mid: Mid, remote: Cid) -> Option<MemberKey> {
        let ch = self.local_channels_by_number.get(&(leader, channel))
            .and_then(|&key| self.local_channels.get(key))?;
        let key = ch.member(mid)?;
        self.members.get(key)
            .filter(|m| m.remote_component == remote)
            .map(|_| key)
    }

    fn find_member_in_channel(&self, channel: LocalChannelKey, remote: Cid) -> Option<MemberKey> {
        let ch = self.local_channels.get(channel)?;
        ch.members()
            .map(|(_, key)| key)
            .find(|&key| self.members.get(key).map(|m| m.remote_component == remote).unwrap_or(false))
    }

    /// our member in a remote channel on behalf of `local`
    fn find_member_in_remote_channel(&self, leader: Cid, channel: u16, local: Cid) -> Option<MemberKey> {
        let rc = self.remote_channels_by_number.get(&(leader, channel))
            .and_then(|&key| self.remote_channels.get(key))?;
        rc.members.iter()
            .copied()
            .find(|&key| self.members.get(key).map(|m| m.local_component == local).unwrap_or(false))
    }

    fn is_waiting_for_reciprocal(&self, key: MemberKey) -> bool {
        self.members.get(key)
            .map(|m| m.local_half.state == HalfState::Null && !m.tearing_down)
            .unwrap_or(false)
    }

    fn find_crossed_join(&self, local: Cid, remote: Cid) -> Option<MemberKey> {
        self.members.iter()
            .filter(|(_, m)| m.local_component == local && m.remote_component == remote)
            .filter(|(_, m)| m.initiated_locally && m.remote_half.state >= HalfState::JoinRequested)
            .map(|(key, _)| key)
            .find(|&key| self.is_waiting_for_reciprocal(key))
    }
}
