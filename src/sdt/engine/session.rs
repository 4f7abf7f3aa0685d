use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::sdt::channel::LocalChannelKey;
use crate::sdt::engine::SdtEngine;
use crate::sdt::events::{LeaveCause, SdtEvent, SessionData, SessionRefusedData, SessionsReceivedData};
use crate::sdt::member::MemberKey;
use crate::sdt::tx_wrap::TxWrap;
use crate::wire::channel_params::ChannelParams;
use crate::wire::cid::Cid;
use crate::wire::reason_code::ReasonCode;
use crate::wire::root_layer::{ROOT_OVERHEAD, SDT_PROTOCOL_ID};
use crate::wire::sdt_messages::{ChannelSessions, SdtMessage, SessionMember};
use crate::wire::transport_addr::TransportAddr;
use crate::wire::wrapped_messages::{ChannelParamsData, WrappedMessage, MID_ALL_MEMBERS};

impl SdtEngine {
    /// Opens a session for a client protocol with a bonded member. The outcome is reported as
    ///  [SdtEvent::SessionConnected] or [SdtEvent::SessionRefused].
    pub fn connect(&mut self, key: MemberKey, protocol: u32, now: Instant) -> anyhow::Result<()> {
        let member = self.members.get(key)
            .ok_or_else(|| anyhow!("unknown member {:?}", key))?;
        if !member.full_member || member.tearing_down {
            bail!("{} is not a full member", member.remote_component);
        }
        if !self.client_protocols.contains_key(&protocol) {
            bail!("client protocol {} is not registered", protocol);
        }
        if member.connected.contains(&protocol) || member.connecting.contains(&protocol) {
            bail!("protocol {} is already connected to {}", protocol, member.remote_component);
        }

        debug!("connecting protocol {} to {}", protocol, member.remote_component);
        self.send_sdt_to_member(key, WrappedMessage::Connect(protocol), now)?;
        if let Some(member) = self.members.get_mut(key) {
            member.connecting.insert(protocol);
        }
        Ok(())
    }

    pub fn disconnect(&mut self, key: MemberKey, protocol: u32, now: Instant) -> anyhow::Result<()> {
        let member = self.members.get(key)
            .ok_or_else(|| anyhow!("unknown member {:?}", key))?;
        if !member.connected.contains(&protocol) {
            bail!("protocol {} is not connected to {}", protocol, member.remote_component);
        }

        self.send_sdt_to_member(key, WrappedMessage::Disconnect(protocol), now)?;
        self.session_ended(key, protocol);
        Ok(())
    }

    /// Changes the parameters of a local channel, and announces them to its members
    pub fn set_channel_params(&mut self, channel: LocalChannelKey, params: ChannelParams, now: Instant) -> anyhow::Result<()> {
        Self::validate_channel_params(&params)?;
        let keepalive_interval = self.config.keepalive_interval(params.expiry);
        let ch = self.local_channels.get_mut(channel)
            .ok_or_else(|| anyhow!("unknown local channel {:?}", channel))?;
        ch.params = params;
        ch.mak.set_nominal(keepalive_interval);
        let owner = ch.owner;
        let has_members = ch.member_count() > 0;

        let adhoc = self.local_components.get(&owner)
            .ok_or_else(|| anyhow!("unknown local component {}", owner))?;
        let msg = WrappedMessage::ChannelParams(ChannelParamsData {
            params,
            adhoc_addr: TransportAddr::Ip(adhoc.adhoc_addr),
            adhoc_expiry: self.config.adhoc_expiry,
        });
        if !has_members {
            return Ok(());
        }

        let data = msg.to_bytes()?;
        let mut wrap = self.start_wrapper(channel, true, TxWrap::overhead() + data.len() + 10)?;
        wrap.add_proto_msg(MID_ALL_MEMBERS, SDT_PROTOCOL_ID, 0, &data)?;
        self.flush_wrapper(wrap, now)
    }

    /// Asks a peer component for its channels and sessions. The answer arrives as
    ///  [SdtEvent::SessionsReceived].
    pub fn request_sessions(&self, local: Cid, remote: Cid, remote_addr: SocketAddr) -> anyhow::Result<()> {
        if !self.local_components.contains_key(&local) {
            bail!("unknown local component {}", local);
        }
        self.send_sdt_message(local, remote_addr, &SdtMessage::GetSessions(remote))
    }

    /// a reliable SDT message in our channel, addressed to the member
    fn send_sdt_to_member(&mut self, key: MemberKey, msg: WrappedMessage, now: Instant) -> anyhow::Result<()> {
        let member = self.members.get(key)
            .ok_or_else(|| anyhow!("unknown member {:?}", key))?;
        let (channel, mid) = (member.local_channel, member.remote_half.mid);
        let association = self.association_of(member);

        let data = msg.to_bytes()?;
        let mut wrap = self.start_wrapper(channel, true, TxWrap::overhead() + data.len() + 10)?;
        wrap.add_proto_msg(mid, SDT_PROTOCOL_ID, association, &data)?;
        self.flush_wrapper(wrap, now)
    }

    /// An SDT message that arrived in a wrapper for the member's local half
    pub(super) fn rx_wrapped(&mut self, key: MemberKey, association: u16, msg: WrappedMessage, now: Instant) {
        trace!("{:?} for member {:?}", msg.vector(), key);
        match msg {
            WrappedMessage::Ack(rseq) => self.rx_ack(key, association, rseq, now),
            WrappedMessage::Leave => self.kill_member(key, LeaveCause::Left, ReasonCode::AskedToLeave, now),
            WrappedMessage::ChannelParams(data) => self.rx_channel_params(key, data),
            WrappedMessage::Connect(protocol) => self.rx_connect(key, protocol, now),
            WrappedMessage::ConnectAccept(protocol) => self.rx_connect_accept(key, protocol),
            WrappedMessage::ConnectRefuse(protocol, reason) => self.rx_connect_refuse(key, protocol, reason),
            WrappedMessage::Disconnect(protocol) => self.rx_disconnect(key, protocol, now),
            WrappedMessage::Disconnecting(protocol, reason) => self.rx_disconnecting(key, protocol, reason),
        }
    }

    fn rx_channel_params(&mut self, key: MemberKey, data: ChannelParamsData) {
        let Some(member) = self.members.get(key) else { return; };
        let leader = member.remote_component;
        if Self::validate_channel_params(&data.params).is_err() {
            warn!("{} announced invalid channel parameters {:?} - ignoring", leader, data.params);
            return;
        }
        if let Some(rc) = member.local_half.remote_channel.and_then(|rc| self.remote_channels.get_mut(rc)) {
            debug!("new parameters for channel {} of {}: {:?}", rc.number, leader, data.params);
            rc.params = data.params;
        }
        if let Some(component) = self.remote_components.get_mut(&leader) {
            if let Some(addr) = data.adhoc_addr.socket_addr() {
                component.adhoc_addr = addr;
            }
            component.adhoc_expiry = data.adhoc_expiry;
        }
    }

    fn rx_connect(&mut self, key: MemberKey, protocol: u32, now: Instant) {
        let Some(member) = self.members.get_mut(key) else { return; };
        if !self.client_protocols.contains_key(&protocol) {
            debug!("{} wants to connect unknown protocol {}", member.remote_component, protocol);
            if let Err(e) = self.send_sdt_to_member(key, WrappedMessage::ConnectRefuse(protocol, ReasonCode::NoRecipient), now) {
                warn!("error sending CONNECT_REFUSE: {}", e);
            }
            return;
        }
        if !member.full_member {
            debug!("{} wants to connect protocol {} before the membership is complete", member.remote_component, protocol);
            if let Err(e) = self.send_sdt_to_member(key, WrappedMessage::ConnectRefuse(protocol, ReasonCode::Nonspecific), now) {
                warn!("error sending CONNECT_REFUSE: {}", e);
            }
            return;
        }

        member.connecting.remove(&protocol);
        let is_new = member.connected.insert(protocol);
        let data = member.data(key);
        if let Err(e) = self.send_sdt_to_member(key, WrappedMessage::ConnectAccept(protocol), now) {
            warn!("error sending CONNECT_ACCEPT: {}", e);
        }
        if is_new {
            info!("session for protocol {} with {}", protocol, data.remote_component);
            self.send_event(SdtEvent::SessionConnected(SessionData { member: data, protocol }));
        }
    }

    fn rx_connect_accept(&mut self, key: MemberKey, protocol: u32) {
        let Some(member) = self.members.get_mut(key) else { return; };
        if !member.connecting.remove(&protocol) {
            debug!("unexpected CONNECT_ACCEPT for protocol {} from {}", protocol, member.remote_component);
            return;
        }
        member.connected.insert(protocol);
        info!("session for protocol {} with {}", protocol, member.remote_component);
        let data = member.data(key);
        self.send_event(SdtEvent::SessionConnected(SessionData { member: data, protocol }));
    }

    fn rx_connect_refuse(&mut self, key: MemberKey, protocol: u32, reason: ReasonCode) {
        let Some(member) = self.members.get_mut(key) else { return; };
        if !member.connecting.remove(&protocol) {
            debug!("unexpected CONNECT_REFUSE for protocol {} from {}", protocol, member.remote_component);
            return;
        }
        info!("{} refused a session for protocol {}: {:?}", member.remote_component, protocol, reason);
        let data = member.data(key);
        self.send_event(SdtEvent::SessionRefused(SessionRefusedData { member: data, protocol, reason }));
    }

    fn rx_disconnect(&mut self, key: MemberKey, protocol: u32, now: Instant) {
        let Some(member) = self.members.get(key) else { return; };
        if !member.connected.contains(&protocol) {
            debug!("DISCONNECT for protocol {} which is not connected", protocol);
            return;
        }
        if let Err(e) = self.send_sdt_to_member(key, WrappedMessage::Disconnecting(protocol, ReasonCode::AskedToLeave), now) {
            warn!("error sending DISCONNECTING: {}", e);
        }
        self.session_ended(key, protocol);
    }

    fn rx_disconnecting(&mut self, key: MemberKey, protocol: u32, reason: ReasonCode) {
        debug!("peer disconnects protocol {}: {:?}", protocol, reason);
        self.session_ended(key, protocol);
    }

    fn session_ended(&mut self, key: MemberKey, protocol: u32) {
        let Some(member) = self.members.get_mut(key) else { return; };
        if member.connected.remove(&protocol) {
            info!("session for protocol {} with {} ended", protocol, member.remote_component);
            let data = member.data(key);
            self.send_event(SdtEvent::SessionDisconnected(SessionData { member: data, protocol }));
        }
    }

    /// Answers with the channels the component leads or is a member of, as many as fit into
    ///  a single datagram
    pub(super) fn rx_get_sessions(&self, sender: Cid, from: SocketAddr, cid: Cid) {
        if !self.local_components.contains_key(&cid) {
            trace!("GET_SESSIONS from {} for {} which is not ours", sender, cid);
            return;
        }

        let mut channels = Vec::new();
        for (_, ch) in self.local_channels.iter().filter(|(_, ch)| ch.owner == cid) {
            let members = ch.members()
                .filter_map(|(mid, key)| self.members.get(key).map(|m| (mid, m)))
                .map(|(mid, m)| SessionMember {
                    mid,
                    cid: m.remote_component,
                    reciprocal: self.association_of(m),
                    protocols: m.connected.iter().copied().collect(),
                })
                .collect();
            channels.push(ChannelSessions {
                leader: cid,
                channel: ch.number,
                dest_addr: ch.dest_addr,
                members,
            });
        }
        for (_, m) in self.members.iter().filter(|(_, m)| m.local_component == cid) {
            let Some(rc) = m.local_half.remote_channel.and_then(|rc| self.remote_channels.get(rc)) else { continue; };
            let reciprocal = self.local_channels.get(m.local_channel)
                .map(|ch| ch.number)
                .unwrap_or(0);
            channels.push(ChannelSessions {
                leader: rc.leader,
                channel: rc.number,
                dest_addr: rc.dest_addr,
                members: vec![SessionMember {
                    mid: m.local_half.mid,
                    cid,
                    reciprocal,
                    protocols: m.connected.iter().copied().collect(),
                }],
            });
        }

        let mut remaining = self.config.max_packet_size.saturating_sub(ROOT_OVERHEAD + 4);
        let num_channels = channels.len();
        channels.retain(|c| {
            let len = c.serialized_len();
            if len > remaining {
                return false;
            }
            remaining -= len;
            true
        });
        if channels.len() < num_channels {
            debug!("only {} of {} channels fit into the SESSIONS answer", channels.len(), num_channels);
        }

        if let Err(e) = self.send_sdt_message(cid, from, &SdtMessage::Sessions(channels)) {
            warn!("error sending SESSIONS: {}", e);
        }
    }

    pub(super) fn rx_sessions(&self, sender: Cid, channels: Vec<ChannelSessions>) {
        debug!("{} reports {} channels", sender, channels.len());
        self.send_event(SdtEvent::SessionsReceived(SessionsReceivedData { from: sender, channels }));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::sdt::client::MockClientProtocolHandler;
    use crate::sdt::config::SdtConfig;
    use crate::sdt::events::SdtEvent;
    use crate::test_util::{exchange, join_nodes, joined_pair, SdtTestNode};
    use crate::wire::reason_code::ReasonCode;
    use crate::wire::transport_addr::TransportAddr;

    const PROTOCOL: u32 = 0x42;

    fn node_with_protocol(n: u8) -> SdtTestNode {
        let mut node = SdtTestNode::new(n, SdtConfig::default_ipv4());
        node.engine.register_client_protocol(PROTOCOL, Box::new(MockClientProtocolHandler::new())).unwrap();
        node
    }

    fn session_events(node: &mut SdtTestNode) -> Vec<String> {
        node.drain_events().into_iter()
            .filter_map(|e| match e {
                SdtEvent::SessionConnected(data) => Some(format!("connected {}", data.protocol)),
                SdtEvent::SessionRefused(data) => Some(format!("refused {} {:?}", data.protocol, data.reason)),
                SdtEvent::SessionDisconnected(data) => Some(format!("disconnected {}", data.protocol)),
                SdtEvent::MemberLeft(_) => Some("left".to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_auto_connect() {
        let now = Instant::now();
        let mut a = node_with_protocol(1);
        let mut b = node_with_protocol(2);
        let channel = a.open_channel(TransportAddr::Null);
        let member = join_nodes(&mut a, &mut b, channel, now);

        assert!(a.engine.member(member).unwrap().connected.contains(&PROTOCOL));
        assert!(b.engine.member(b.members_with(a.cid)[0]).unwrap().connected.contains(&PROTOCOL));
        assert_eq!(session_events(&mut a), vec!["connected 66"]);
        assert_eq!(session_events(&mut b), vec!["connected 66"]);
    }

    #[test]
    fn test_connect_refused() {
        let now = Instant::now();
        let mut a = node_with_protocol(1);
        let mut b = SdtTestNode::new(2, SdtConfig::default_ipv4());
        let channel = a.open_channel(TransportAddr::Null);
        let member = join_nodes(&mut a, &mut b, channel, now);

        assert!(a.engine.member(member).unwrap().connected.is_empty());
        assert!(a.engine.member(member).unwrap().connecting.is_empty());
        assert_eq!(session_events(&mut a), vec![format!("refused 66 {:?}", ReasonCode::NoRecipient)]);
    }

    #[test]
    fn test_connect_requires_full_member() {
        let now = Instant::now();
        let mut a = node_with_protocol(1);
        let channel = a.open_channel(TransportAddr::Null);
        let member = a.engine.add_member(channel, crate::test_util::test_cid(2), crate::test_util::test_addr(2), now).unwrap();
        assert!(a.engine.connect(member, PROTOCOL, now).is_err());
    }

    #[test]
    fn test_disconnect() {
        let now = Instant::now();
        let mut a = node_with_protocol(1);
        let mut b = node_with_protocol(2);
        let channel = a.open_channel(TransportAddr::Null);
        let member = join_nodes(&mut a, &mut b, channel, now);
        a.drain_events();
        b.drain_events();

        a.engine.disconnect(member, PROTOCOL, now).unwrap();
        assert!(a.engine.disconnect(member, PROTOCOL, now).is_err());
        exchange(&mut a, &mut b, now);

        assert!(b.engine.member(b.members_with(a.cid)[0]).unwrap().connected.is_empty());
        assert_eq!(session_events(&mut a), vec!["disconnected 66"]);
        assert_eq!(session_events(&mut b), vec!["disconnected 66"]);

        a.engine.connect(member, PROTOCOL, now).unwrap();
        exchange(&mut a, &mut b, now);
        assert_eq!(session_events(&mut a), vec!["connected 66"]);
    }

    #[test]
    fn test_connect_refused_before_full_member() {
        let now = Instant::now();
        let mut a = node_with_protocol(1);
        let mut b = node_with_protocol(2);
        let channel = a.open_channel(TransportAddr::Null);
        let member = join_nodes(&mut a, &mut b, channel, now);
        a.engine.disconnect(member, PROTOCOL, now).unwrap();
        exchange(&mut a, &mut b, now);
        a.drain_events();
        b.drain_events();

        let at_b = b.members_with(a.cid)[0];
        b.engine.members.get_mut(at_b).unwrap().full_member = false;
        a.engine.connect(member, PROTOCOL, now).unwrap();
        exchange(&mut a, &mut b, now);

        assert!(b.engine.member(at_b).unwrap().connected.is_empty());
        assert!(a.engine.member(member).unwrap().connected.is_empty());
        assert_eq!(session_events(&mut a), vec![format!("refused 66 {:?}", ReasonCode::Nonspecific)]);
        assert!(session_events(&mut b).is_empty());
    }

    #[test]
    fn test_teardown_disconnects_sessions() {
        let now = Instant::now();
        let mut a = node_with_protocol(1);
        let mut b = node_with_protocol(2);
        let channel = a.open_channel(TransportAddr::Null);
        let member = join_nodes(&mut a, &mut b, channel, now);
        a.drain_events();
        b.drain_events();

        a.engine.remove_member(member, ReasonCode::Nonspecific, now).unwrap();
        exchange(&mut a, &mut b, now);
        assert_eq!(session_events(&mut a), vec!["disconnected 66", "left"]);
        assert_eq!(session_events(&mut b), vec!["disconnected 66", "left"]);
    }

    #[test]
    fn test_channel_params() {
        let now = Instant::now();
        let (mut a, mut b, member) = joined_pair(SdtConfig::default_ipv4(), now);
        let channel = a.engine.member(member).unwrap().local_channel;

        let mut params = a.engine.config().default_channel_params;
        params.expiry = Duration::from_secs(30);
        a.engine.set_channel_params(channel, params, now).unwrap();
        exchange(&mut a, &mut b, now);

        let number = a.engine.local_channel(channel).unwrap().number;
        assert_eq!(b.engine.remote_channel(a.cid, number).unwrap().params.expiry, Duration::from_secs(30));

        params.expiry = Duration::from_secs(1);
        assert!(a.engine.set_channel_params(channel, params, now).is_err());
    }

    #[test]
    fn test_get_sessions() {
        let now = Instant::now();
        let (mut a, mut b, member) = joined_pair(SdtConfig::default_ipv4(), now);
        let number_a = a.engine.local_channel(a.engine.member(member).unwrap().local_channel).unwrap().number;
        b.drain_events();

        b.engine.request_sessions(b.cid, a.cid, a.addr).unwrap();
        exchange(&mut a, &mut b, now);

        let reports = b.drain_events().into_iter()
            .filter_map(|e| match e {
                SdtEvent::SessionsReceived(data) => Some(data),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].from, a.cid);

        let channels = &reports[0].channels;
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].leader, a.cid);
        assert_eq!(channels[0].channel, number_a);
        assert_eq!(channels[0].members.len(), 1);
        assert_eq!(channels[0].members[0].cid, b.cid);
        assert_eq!(channels[0].members[0].mid, 1);
        assert_eq!(channels[1].leader, b.cid);
        assert_eq!(channels[1].members[0].cid, a.cid);
        assert_eq!(channels[1].members[0].reciprocal, number_a);
    }

    #[test]
    fn test_get_sessions_for_unknown_component() {
        let now = Instant::now();
        let (mut a, b, _) = joined_pair(SdtConfig::default_ipv4(), now);
        a.receive(b.cid, b.addr, crate::wire::sdt_messages::SdtMessage::GetSessions(crate::test_util::test_cid(7)), now);
        assert!(a.take_sent().is_empty());
    }
}
