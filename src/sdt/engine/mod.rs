//! The SDT protocol engine.
//!
//! [SdtEngine] owns all protocol state: local and remote components, the channels they lead or
//!  are members of, the members bonding them, and the timers driving retries, keep-alives and
//!  expiry. It does no I/O of its own except sending through a [DatagramTransport], and it
//!  never looks at a clock: every entry point takes the current time as a parameter. That
//!  makes the engine single-threaded by construction, and it makes tests deterministic.
//!
//! A runtime driver (see [crate::end_point]) feeds it received datagrams, expired timers and
//!  application requests, one at a time.

use std::collections::hash_map::Entry;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::sdt::channel::{LocalChannel, LocalChannelKey, RemoteChannel, RemoteChannelKey};
use crate::sdt::client::{ChannelRequestHandler, ClientProtocolHandler};
use crate::sdt::config::{SdtConfig, MIN_EXPIRY_TIME};
use crate::sdt::events::{LeaveCause, SdtEvent, SdtEventNotifier};
use crate::sdt::member::{Member, MemberKey};
use crate::sdt::timer::{TimerHandle, TimerQueue};
use crate::sdt::transport::DatagramTransport;
use crate::util::arena::Arena;
use crate::util::random::{Random, RngRandom};
use crate::wire::channel_params::ChannelParams;
use crate::wire::cid::Cid;
use crate::wire::pdu::PduBlockReader;
use crate::wire::reason_code::ReasonCode;
use crate::wire::root_layer::{finish_datagram, parse_datagram, start_datagram, SDT_PROTOCOL_ID};
use crate::wire::sdt_messages::SdtMessage;
use crate::wire::transport_addr::TransportAddr;

mod join;
mod reliable;
mod session;
mod teardown;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum TimerAction {
    JoinRetry(MemberKey),
    ReciprocalTimeout(MemberKey),
    MemberExpiry(MemberKey),
    MakTimeout(MemberKey),
    FirstAckResend(MemberKey),
    Nak(RemoteChannelKey),
    KeepAlive(LocalChannelKey),
    BlankClear(LocalChannelKey),
}

/// A component hosted by this engine
#[derive(Debug, Clone)]
pub struct LocalComponent {
    pub cid: Cid,
    /// advertised to peers as the address for unicast traffic
    pub adhoc_addr: SocketAddr,
    /// accept JOINs from peers that are not members of one of our channels yet
    pub listening: bool,
}

/// A peer component that at least one of our members is bonded with
#[derive(Debug, Clone)]
pub struct RemoteComponent {
    pub adhoc_addr: SocketAddr,
    pub adhoc_expiry: u8,
    num_members: usize,
}

pub struct SdtEngine {
    config: Arc<SdtConfig>,
    transport: Arc<dyn DatagramTransport>,
    events: SdtEventNotifier,
    channel_request_handler: Box<dyn ChannelRequestHandler>,
    client_protocols: FxHashMap<u32, Box<dyn ClientProtocolHandler>>,

    local_components: FxHashMap<Cid, LocalComponent>,
    remote_components: FxHashMap<Cid, RemoteComponent>,

    local_channels: Arena<LocalChannelKey, LocalChannel>,
    local_channels_by_number: FxHashMap<(Cid, u16), LocalChannelKey>,
    remote_channels: Arena<RemoteChannelKey, RemoteChannel>,
    remote_channels_by_number: FxHashMap<(Cid, u16), RemoteChannelKey>,
    members: Arena<MemberKey, Member>,

    timers: TimerQueue<TimerAction>,
    /// reference counts of joined multicast groups
    multicast_groups: FxHashMap<IpAddr, usize>,
    next_channel_number: u16,
    /// local channels with members that owe an ACK
    acks_due: FxHashSet<LocalChannelKey>,
}

impl SdtEngine {
    pub fn new(
        config: Arc<SdtConfig>,
        transport: Arc<dyn DatagramTransport>,
        events: SdtEventNotifier,
        channel_request_handler: Box<dyn ChannelRequestHandler>,
    ) -> anyhow::Result<SdtEngine> {
        Self::new_with_random::<RngRandom>(config, transport, events, channel_request_handler)
    }

    pub fn new_with_random<R: Random>(
        config: Arc<SdtConfig>,
        transport: Arc<dyn DatagramTransport>,
        events: SdtEventNotifier,
        channel_request_handler: Box<dyn ChannelRequestHandler>,
    ) -> anyhow::Result<SdtEngine> {
        config.validate()?;

        Ok(SdtEngine {
            config,
            transport,
            events,
            channel_request_handler,
            client_protocols: Default::default(),
            local_components: Default::default(),
            remote_components: Default::default(),
            local_channels: Default::default(),
            local_channels_by_number: Default::default(),
            remote_channels: Default::default(),
            remote_channels_by_number: Default::default(),
            members: Default::default(),
            timers: Default::default(),
            multicast_groups: Default::default(),
            next_channel_number: R::gen_u16_range(1..u16::MAX),
            acks_due: Default::default(),
        })
    }

    pub fn config(&self) -> &SdtConfig {
        &self.config
    }

    pub fn events(&self) -> &SdtEventNotifier {
        &self.events
    }

    pub fn register_client_protocol(&mut self, protocol: u32, handler: Box<dyn ClientProtocolHandler>) -> anyhow::Result<()> {
        if protocol == SDT_PROTOCOL_ID {
            bail!("protocol {} is SDT itself", protocol);
        }
        match self.client_protocols.entry(protocol) {
            Entry::Occupied(_) => {
                Err(anyhow!("client protocol {} is already registered", protocol))
            }
            Entry::Vacant(e) => {
                debug!("registered client protocol {}", protocol);
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub fn set_channel_request_handler(&mut self, handler: Box<dyn ChannelRequestHandler>) {
        self.channel_request_handler = handler;
    }

    pub fn deregister_client_protocol(&mut self, protocol: u32) -> anyhow::Result<()> {
        if self.client_protocols.remove(&protocol).is_none() {
            bail!("client protocol {} is not registered", protocol);
        }
        Ok(())
    }

    pub fn add_local_component(&mut self, cid: Cid, adhoc_addr: SocketAddr, listening: bool) -> anyhow::Result<()> {
        if !self.config.allow_multiple_components && !self.local_components.is_empty() {
            bail!("this engine is configured for a single local component");
        }
        match self.local_components.entry(cid) {
            Entry::Occupied(_) => {
                Err(anyhow!("local component {} is already registered", cid))
            }
            Entry::Vacant(e) => {
                info!("adding local component {} at {}", cid, adhoc_addr);
                e.insert(LocalComponent { cid, adhoc_addr, listening });
                Ok(())
            }
        }
    }

    /// Closes all channels led by the component, tearing down its members
    pub fn remove_local_component(&mut self, cid: Cid, now: Instant) -> anyhow::Result<()> {
        if !self.local_components.contains_key(&cid) {
            bail!("unknown local component {}", cid);
        }
        for key in self.local_channels_of(cid) {
            self.close_local_channel(key, ReasonCode::Nonspecific, now)?;
        }
        self.local_components.remove(&cid);
        info!("removed local component {}", cid);
        self.send_pending_acks(now);
        Ok(())
    }

    pub fn set_listening(&mut self, cid: Cid, listening: bool) -> anyhow::Result<()> {
        let component = self.local_components.get_mut(&cid)
            .ok_or_else(|| anyhow!("unknown local component {}", cid))?;
        component.listening = listening;
        Ok(())
    }

    /// Peers know a component by its ad-hoc address, so changing it ends all of its memberships.
    pub fn set_adhoc_address(&mut self, cid: Cid, adhoc_addr: SocketAddr, now: Instant) -> anyhow::Result<()> {
        let component = self.local_components.get_mut(&cid)
            .ok_or_else(|| anyhow!("unknown local component {}", cid))?;
        if component.adhoc_addr == adhoc_addr {
            return Ok(());
        }
        info!("ad-hoc address of {} changes from {} to {}", cid, component.adhoc_addr, adhoc_addr);
        component.adhoc_addr = adhoc_addr;

        let affected = self.members.iter()
            .filter(|(_, m)| m.local_component == cid)
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        for key in affected {
            self.kill_member(key, LeaveCause::Left, ReasonCode::AddrChanging, now);
        }
        self.send_pending_acks(now);
        Ok(())
    }

    pub fn local_components(&self) -> Vec<Cid> {
        self.local_components.keys().copied().collect()
    }

    pub fn local_component(&self, cid: Cid) -> Option<&LocalComponent> {
        self.local_components.get(&cid)
    }

    pub fn remote_component(&self, cid: Cid) -> Option<&RemoteComponent> {
        self.remote_components.get(&cid)
    }

    /// Opens a channel led by `owner`. `dest_addr` is either a multicast address or `Null` for a
    ///  channel that sends to each member's ad-hoc address.
    pub fn open_local_channel(&mut self, owner: Cid, dest_addr: TransportAddr, params: Option<ChannelParams>, hold_open: bool) -> anyhow::Result<LocalChannelKey> {
        if !self.local_components.contains_key(&owner) {
            bail!("unknown local component {}", owner);
        }
        match dest_addr {
            TransportAddr::Null => {}
            TransportAddr::Ip(addr) if addr.ip().is_multicast() => {}
            TransportAddr::Ip(addr) => bail!("channel destination {} is not a multicast address", addr),
        }
        let params = params.unwrap_or(self.config.default_channel_params);
        Self::validate_channel_params(&params)?;
        if self.local_channels.len() >= self.config.max_local_channels {
            bail!("maximum number of local channels reached");
        }

        let number = self.alloc_channel_number(owner)
            .ok_or_else(|| anyhow!("no free channel number for {}", owner))?;
        let keepalive_interval = self.config.keepalive_interval(params.expiry);
        let key = self.local_channels.insert(LocalChannel::new(owner, number, params, dest_addr, keepalive_interval, hold_open));
        self.local_channels_by_number.insert((owner, number), key);
        info!("opened local channel {} of {} to {}", number, owner, dest_addr);
        Ok(key)
    }

    /// Tears down all members of the channel with `reason`, and closes it
    pub fn close_local_channel(&mut self, key: LocalChannelKey, reason: ReasonCode, now: Instant) -> anyhow::Result<()> {
        let ch = self.local_channels.get_mut(key)
            .ok_or_else(|| anyhow!("unknown local channel {:?}", key))?;
        ch.hold_open = true;

        let mut previous = None;
        loop {
            let Some(ch) = self.local_channels.get(key) else { break; };
            let Some((_, member)) = ch.members().last() else { break; };
            if previous == Some(member) {
                warn!("member {:?} survived its teardown - this is a bug", member);
                break;
            }
            previous = Some(member);
            self.kill_member(member, LeaveCause::Left, reason, now);
        }

        self.remove_local_channel(key);
        self.send_pending_acks(now);
        Ok(())
    }

    pub fn local_channel(&self, key: LocalChannelKey) -> Option<&LocalChannel> {
        self.local_channels.get(key)
    }

    pub fn local_channels_of(&self, owner: Cid) -> Vec<LocalChannelKey> {
        self.local_channels.iter()
            .filter(|(_, ch)| ch.owner == owner)
            .map(|(key, _)| key)
            .collect()
    }

    pub fn remote_channel(&self, leader: Cid, number: u16) -> Option<&RemoteChannel> {
        self.remote_channels_by_number.get(&(leader, number))
            .and_then(|&key| self.remote_channels.get(key))
    }

    pub fn member(&self, key: MemberKey) -> Option<&Member> {
        self.members.get(key)
    }

    pub fn members(&self) -> impl Iterator<Item = (MemberKey, &Member)> {
        self.members.iter()
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Processes a received datagram. Malformed input is logged and dropped.
    pub fn on_datagram(&mut self, from: SocketAddr, datagram: Bytes, now: Instant) {
        trace!("received {} bytes from {}", datagram.len(), from);

        let payloads = match parse_datagram(datagram) {
            Ok(payloads) => payloads,
            Err(e) => {
                debug!("dropping datagram from {}: {}", from, e);
                return;
            }
        };

        for payload in payloads {
            if self.local_components.contains_key(&payload.sender) {
                trace!("ignoring datagram sent by local component {}", payload.sender);
                continue;
            }
            for pdu in PduBlockReader::new(payload.data, 1, 0) {
                let pdu = match pdu {
                    Ok(pdu) => pdu,
                    Err(e) => {
                        debug!("malformed SDT PDU from {} - skipping rest of the block: {}", from, e);
                        break;
                    }
                };
                match SdtMessage::try_deser(pdu) {
                    Ok(msg) => self.on_message(payload.sender, from, msg, now),
                    Err(e) => debug!("dropping SDT message from {}: {}", from, e),
                }
            }
        }

        self.send_pending_acks(now);
    }

    fn on_message(&mut self, sender: Cid, from: SocketAddr, msg: SdtMessage, now: Instant) {
        trace!("{:?} from {} at {}", msg.vector(), sender, from);
        match msg {
            SdtMessage::Wrapper(data) => self.rx_wrapper(sender, data, now),
            SdtMessage::Join(data) => self.rx_join(sender, from, data, now),
            SdtMessage::JoinAccept(data) => self.rx_join_accept(sender, data, now),
            SdtMessage::JoinRefuse(data) => self.rx_join_refuse(sender, data, now),
            SdtMessage::Leaving(data) => self.rx_leaving(sender, data, now),
            SdtMessage::Nak(data) => self.rx_nak(sender, from, data, now),
            SdtMessage::GetSessions(cid) => self.rx_get_sessions(sender, from, cid),
            SdtMessage::Sessions(channels) => self.rx_sessions(sender, channels),
        }
    }

    /// Runs all timers that are due at `now`
    pub fn on_timers_due(&mut self, now: Instant) {
        while let Some((handle, action)) = self.timers.pop_due(now) {
            trace!("timer {:?}", action);
            match action {
                TimerAction::JoinRetry(key) => {
                    if self.take_member_timer(key, handle, |m| &mut m.remote_half.join_timer) {
                        self.on_join_retry(key, now);
                    }
                }
                TimerAction::ReciprocalTimeout(key) => {
                    if self.take_member_timer(key, handle, |m| &mut m.remote_half.reciprocal_timer) {
                        self.on_reciprocal_timeout(key, now);
                    }
                }
                TimerAction::MemberExpiry(key) => {
                    if self.take_member_timer(key, handle, |m| &mut m.local_half.expiry_timer) {
                        debug!("member {:?} expired", key);
                        self.kill_member(key, LeaveCause::Expired, ReasonCode::ChannelExpired, now);
                    }
                }
                TimerAction::MakTimeout(key) => {
                    if self.take_member_timer(key, handle, |m| &mut m.remote_half.mak_timer) {
                        self.on_mak_timeout(key, now);
                    }
                }
                TimerAction::FirstAckResend(key) => {
                    if self.take_member_timer(key, handle, |m| &mut m.local_half.first_ack_timer) {
                        self.on_first_ack_resend(key);
                    }
                }
                TimerAction::Nak(key) => {
                    let is_current = self.remote_channels.get_mut(key)
                        .map(|rc| take_if_current(&mut rc.nak.timer, handle))
                        .unwrap_or(false);
                    if is_current {
                        self.on_nak_timer(key, now);
                    }
                }
                TimerAction::KeepAlive(key) => {
                    let is_current = self.local_channels.get_mut(key)
                        .map(|ch| take_if_current(&mut ch.keepalive_timer, handle))
                        .unwrap_or(false);
                    if is_current {
                        self.on_keepalive(key, now);
                    }
                }
                TimerAction::BlankClear(key) => {
                    if let Some(ch) = self.local_channels.get_mut(key) {
                        if take_if_current(&mut ch.blank_timer, handle) {
                            ch.blank = None;
                        }
                    }
                }
            }
        }

        self.send_pending_acks(now);
    }

    fn take_member_timer(&mut self, key: MemberKey, handle: TimerHandle, slot: impl FnOnce(&mut Member) -> &mut Option<TimerHandle>) -> bool {
        match self.members.get_mut(key) {
            Some(member) => take_if_current(slot(member), handle),
            None => false,
        }
    }

    fn alloc_channel_number(&mut self, owner: Cid) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next_channel_number;
            self.next_channel_number = match self.next_channel_number.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            if !self.local_channels_by_number.contains_key(&(owner, candidate)) {
                return Some(candidate);
            }
        }
        None
    }

    fn validate_channel_params(params: &ChannelParams) -> anyhow::Result<()> {
        if params.expiry < MIN_EXPIRY_TIME {
            bail!("channel expiry {:?} is below the minimum of {:?}", params.expiry, MIN_EXPIRY_TIME);
        }
        if params.expiry.as_secs() > u8::MAX as u64 {
            bail!("channel expiry {:?} can not be represented on the wire", params.expiry);
        }
        if params.nak_modulus == 0 {
            bail!("NAK modulus must not be 0");
        }
        Ok(())
    }

    fn remove_local_channel(&mut self, key: LocalChannelKey) {
        if let Some(mut ch) = self.local_channels.remove(key) {
            self.timers.cancel_opt(&mut ch.keepalive_timer);
            self.timers.cancel_opt(&mut ch.blank_timer);
            self.local_channels_by_number.remove(&(ch.owner, ch.number));
            self.acks_due.remove(&key);
            info!("closed local channel {} of {}", ch.number, ch.owner);
        }
    }

    fn remove_remote_channel(&mut self, key: RemoteChannelKey) {
        if let Some(mut rc) = self.remote_channels.remove(key) {
            self.timers.cancel_opt(&mut rc.nak.timer);
            self.remote_channels_by_number.remove(&(rc.leader, rc.number));
            if let Some(addr) = rc.dest_addr.socket_addr() {
                if addr.ip().is_multicast() {
                    self.unsubscribe(addr.ip());
                }
            }
            debug!("no more members in remote channel {} of {}", rc.number, rc.leader);
        }
    }

    fn subscribe(&mut self, group: IpAddr) {
        let count = self.multicast_groups.entry(group).or_insert(0);
        *count += 1;
        if *count == 1 {
            if let Err(e) = self.transport.join_multicast(group) {
                warn!("error joining multicast group {}: {}", group, e);
            }
        }
    }

    fn unsubscribe(&mut self, group: IpAddr) {
        if let Entry::Occupied(mut e) = self.multicast_groups.entry(group) {
            *e.get_mut() -= 1;
            if *e.get() == 0 {
                e.remove();
                if let Err(e) = self.transport.leave_multicast(group) {
                    warn!("error leaving multicast group {}: {}", group, e);
                }
            }
        }
    }

    /// sends a base layer message in a datagram of its own
    fn send_sdt_message(&self, sender: Cid, to: SocketAddr, msg: &SdtMessage) -> anyhow::Result<()> {
        trace!("sending {:?} to {}", msg.vector(), to);
        let mut buf = BytesMut::with_capacity(128);
        let root_start = start_datagram(&mut buf, sender);
        msg.ser(&mut buf)?;
        finish_datagram(&mut buf, root_start)?;
        self.transport.send_to(to, &buf)
    }

    fn send_event(&self, event: SdtEvent) {
        self.events.send_event(event);
    }

    fn adhoc_addr_of(&self, remote: Cid) -> Option<SocketAddr> {
        self.remote_components.get(&remote)
            .map(|c| c.adhoc_addr)
    }

    fn register_remote_component(&mut self, cid: Cid, adhoc_addr: SocketAddr) {
        let component = self.remote_components.entry(cid)
            .or_insert(RemoteComponent {
                adhoc_addr,
                adhoc_expiry: self.config.adhoc_expiry,
                num_members: 0,
            });
        component.adhoc_addr = adhoc_addr;
        component.num_members += 1;
    }

    fn release_remote_component(&mut self, cid: Cid) {
        if let Entry::Occupied(mut e) = self.remote_components.entry(cid) {
            e.get_mut().num_members = e.get().num_members.saturating_sub(1);
            if e.get().num_members == 0 {
                trace!("forgetting remote component {}", cid);
                e.remove();
            }
        }
    }
}

fn take_if_current(slot: &mut Option<TimerHandle>, handle: TimerHandle) -> bool {
    if *slot == Some(handle) {
        *slot = None;
        true
    }
    else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdt::client::{AutoJoin, MockClientProtocolHandler};
    use crate::test_util::{test_addr, test_cid, TrackingDatagramTransport};
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};
    use rstest::rstest;
    use std::time::Duration;

    fn engine(config: SdtConfig) -> SdtEngine {
        SdtEngine::new(
            Arc::new(config),
            Arc::new(TrackingDatagramTransport::default()),
            SdtEventNotifier::new(),
            Box::new(AutoJoin),
        ).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = SdtConfig::default_ipv4();
        config.mak_span = 0;
        assert!(SdtEngine::new(Arc::new(config), Arc::new(TrackingDatagramTransport::default()), SdtEventNotifier::new(), Box::new(AutoJoin)).is_err());
    }

    #[test]
    fn test_register_client_protocol() {
        let mut engine = engine(SdtConfig::default_ipv4());
        engine.register_client_protocol(5, Box::new(MockClientProtocolHandler::new())).unwrap();
        assert!(engine.register_client_protocol(5, Box::new(MockClientProtocolHandler::new())).is_err());
        assert!(engine.register_client_protocol(SDT_PROTOCOL_ID, Box::new(MockClientProtocolHandler::new())).is_err());
        engine.deregister_client_protocol(5).unwrap();
        assert!(engine.deregister_client_protocol(5).is_err());
    }

    #[test]
    fn test_single_local_component() {
        let mut engine = engine(SdtConfig::default_ipv4());
        engine.add_local_component(test_cid(1), test_addr(1), true).unwrap();
        assert!(engine.add_local_component(test_cid(2), test_addr(1), true).is_err());

        let mut config = SdtConfig::default_ipv4();
        config.allow_multiple_components = true;
        let mut engine = self::engine(config);
        engine.add_local_component(test_cid(1), test_addr(1), true).unwrap();
        engine.add_local_component(test_cid(2), test_addr(1), true).unwrap();
        assert!(engine.add_local_component(test_cid(2), test_addr(1), true).is_err());
    }

    #[test]
    fn test_channel_numbers() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u16_range_context();
        ctx.expect().return_const(u16::MAX - 1);

        let mut engine = SdtEngine::new_with_random::<MockRandom>(
            Arc::new(SdtConfig::default_ipv4()),
            Arc::new(TrackingDatagramTransport::default()),
            SdtEventNotifier::new(),
            Box::new(AutoJoin),
        ).unwrap();
        engine.add_local_component(test_cid(1), test_addr(1), true).unwrap();

        let keys = (0..3)
            .map(|_| engine.open_local_channel(test_cid(1), TransportAddr::Null, None, true).unwrap())
            .collect::<Vec<_>>();
        let numbers = keys.iter()
            .map(|&key| engine.local_channel(key).unwrap().number)
            .collect::<Vec<_>>();
        assert_eq!(numbers, vec![u16::MAX - 1, u16::MAX, 1]);
    }

    #[rstest]
    #[case::unicast_dest(TransportAddr::Ip("10.0.0.1:5568".parse().unwrap()), None)]
    #[case::short_expiry(TransportAddr::Null, Some(Duration::from_secs(1)))]
    #[case::long_expiry(TransportAddr::Null, Some(Duration::from_secs(300)))]
    fn test_open_channel_invalid(#[case] dest_addr: TransportAddr, #[case] expiry: Option<Duration>) {
        let mut engine = engine(SdtConfig::default_ipv4());
        engine.add_local_component(test_cid(1), test_addr(1), true).unwrap();
        let params = expiry.map(|expiry| ChannelParams { expiry, ..engine.config().default_channel_params });
        assert!(engine.open_local_channel(test_cid(1), dest_addr, params, false).is_err());
        assert!(engine.open_local_channel(test_cid(9), TransportAddr::Null, None, false).is_err());
    }

    #[test]
    fn test_open_and_close_channel() {
        let now = Instant::now();
        let mut engine = engine(SdtConfig::default_ipv4());
        engine.add_local_component(test_cid(1), test_addr(1), true).unwrap();
        let key = engine.open_local_channel(test_cid(1), TransportAddr::Ip("239.192.0.1:5568".parse().unwrap()), None, false).unwrap();
        assert_eq!(engine.local_channels_of(test_cid(1)), vec![key]);

        engine.close_local_channel(key, ReasonCode::Nonspecific, now).unwrap();
        assert!(engine.local_channel(key).is_none());
        assert!(engine.close_local_channel(key, ReasonCode::Nonspecific, now).is_err());
    }

    #[test]
    fn test_ignores_garbage() {
        let mut engine = engine(SdtConfig::default_ipv4());
        engine.on_datagram(test_addr(2), Bytes::from_static(b"definitely not ACN"), Instant::now());
        assert_eq!(engine.num_members(), 0);
        assert_eq!(engine.next_deadline(), None);
    }
}
