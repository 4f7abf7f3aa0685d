use anyhow::{anyhow, bail};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::sdt::engine::SdtEngine;
use crate::sdt::events::{LeaveCause, MemberLeftData, SdtEvent, SessionData};
use crate::sdt::member::{HalfState, MemberKey};
use crate::wire::reason_code::ReasonCode;
use crate::wire::root_layer::SDT_PROTOCOL_ID;
use crate::wire::sdt_messages::{RefuseData, SdtMessage};
use crate::wire::wrapped_messages::WrappedMessage;

impl SdtEngine {
    /// Ends a membership on request of the application. The peer is told why.
    pub fn remove_member(&mut self, key: MemberKey, reason: ReasonCode, now: Instant) -> anyhow::Result<()> {
        if !self.members.contains(key) {
            bail!("unknown member {:?}", key);
        }
        self.kill_member(key, LeaveCause::Left, reason, now);
        self.send_pending_acks(now);
        Ok(())
    }

    /// Tears down a member, whatever the trigger. Calling this for a member that is already
    ///  being torn down does nothing.
    pub(super) fn kill_member(&mut self, key: MemberKey, cause: LeaveCause, reason: ReasonCode, now: Instant) {
        let Some(member) = self.members.get_mut(key) else { return; };
        if member.tearing_down {
            trace!("member {:?} is already being torn down", key);
            return;
        }
        member.tearing_down = true;
        for handle in member.take_timers() {
            self.timers.cancel(handle);
        }
        info!("tearing down member {} / {}: {:?} ({:?})", member.local_component, member.remote_component, cause, reason);

        if let Err(e) = self.send_parting_wrapper(key, reason, now) {
            warn!("error sending LEAVE: {}", e);
        }
        if let Err(e) = self.send_leaving(key, reason) {
            warn!("error sending LEAVING: {}", e);
        }

        let Some(member) = self.members.remove(key) else { return; };
        let data = member.data(key);
        for &protocol in &member.connected {
            self.send_event(SdtEvent::SessionDisconnected(SessionData { member: data, protocol }));
        }
        self.send_event(SdtEvent::MemberLeft(MemberLeftData { member: data, cause, reason }));

        if let Some(ch) = self.local_channels.get_mut(member.local_channel) {
            let num_purged = ch.retained.release_acks(member.remote_half.acked_rseq, ch.rseq);
            if num_purged > 0 {
                trace!("purged {} wrappers that only {} still owed an ACK for", num_purged, member.remote_component);
            }
            ch.release_mid(member.remote_half.mid);
        }

        if let Some(rc_key) = member.local_half.remote_channel {
            let is_empty = self.remote_channels.get_mut(rc_key)
                .map(|rc| {
                    rc.members.retain(|&k| k != key);
                    rc.members.is_empty()
                })
                .unwrap_or(false);
            if is_empty {
                self.remove_remote_channel(rc_key);
            }
        }
        self.release_remote_component(member.remote_component);

        let close_channel = self.local_channels.get(member.local_channel)
            .map(|ch| ch.member_count() == 0 && !ch.hold_open)
            .unwrap_or(false);
        if close_channel {
            self.remove_local_channel(member.local_channel);
        }
    }

    /// DISCONNECTING for every connected protocol and LEAVE, in one reliable wrapper to the
    ///  member in our channel
    fn send_parting_wrapper(&mut self, key: MemberKey, reason: ReasonCode, now: Instant) -> anyhow::Result<()> {
        let member = self.members.get(key)
            .ok_or_else(|| anyhow!("unknown member {:?}", key))?;
        if member.remote_half.state < HalfState::JoinPending {
            return Ok(());
        }
        let (channel, mid) = (member.local_channel, member.remote_half.mid);
        let association = self.association_of(member);
        let mut messages = member.connected.iter()
            .map(|&protocol| WrappedMessage::Disconnecting(protocol, reason))
            .collect::<Vec<_>>();
        if !member.remote_half.peer_left {
            messages.push(WrappedMessage::Leave);
        }
        if messages.is_empty() {
            return Ok(());
        }

        let mut wrap = self.start_wrapper(channel, true, 0)?;
        for msg in messages {
            wrap.add_proto_msg(mid, SDT_PROTOCOL_ID, association, &msg.to_bytes()?)?;
        }
        debug!("sending {} parting messages to MID {}", wrap.num_msgs(), mid);
        self.flush_wrapper(wrap, now)
    }

    /// tells the peer that our local half left its channel
    fn send_leaving(&self, key: MemberKey, reason: ReasonCode) -> anyhow::Result<()> {
        let member = self.members.get(key)
            .ok_or_else(|| anyhow!("unknown member {:?}", key))?;
        if member.local_half.state < HalfState::JoinPending {
            return Ok(());
        }
        let rc = member.local_half.remote_channel
            .and_then(|rc| self.remote_channels.get(rc))
            .ok_or_else(|| anyhow!("member {:?} is not in a remote channel", key))?;
        let to = self.adhoc_addr_of(member.remote_component)
            .ok_or_else(|| anyhow!("no address for {}", member.remote_component))?;

        let msg = SdtMessage::Leaving(RefuseData {
            leader: rc.leader,
            channel: rc.number,
            mid: member.local_half.mid,
            rseq: rc.rseq,
            reason,
        });
        self.send_sdt_message(member.local_component, to, &msg)
    }
}
