use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::sdt::channel::LocalChannelKey;
use crate::sdt::client::{AutoJoin, ChannelRequestHandler};
use crate::sdt::config::SdtConfig;
use crate::sdt::engine::SdtEngine;
use crate::sdt::events::{LeaveCause, SdtEvent, SdtEventNotifier};
use crate::sdt::member::MemberKey;
use crate::test_util::transport::{SentDatagram, TrackingDatagramTransport};
use crate::wire::cid::Cid;
use crate::wire::reason_code::ReasonCode;
use crate::wire::root_layer::{finish_datagram, start_datagram};
use crate::wire::sdt_messages::SdtMessage;
use crate::wire::transport_addr::TransportAddr;

/// convenience method for unit test code: create a [Cid] based on a number, the same number
///  generating the same CID and different numbers different CIDs
pub fn test_cid(number: u8) -> Cid {
    Cid::from_bytes([number; 16])
}

pub fn test_addr(number: u8) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, number], 5568))
}

/// An engine with a single listening component, numbered for [test_cid] and [test_addr]
pub struct SdtTestNode {
    pub engine: SdtEngine,
    pub transport: Arc<TrackingDatagramTransport>,
    pub cid: Cid,
    pub addr: SocketAddr,
    events: broadcast::Receiver<SdtEvent>,
}

impl SdtTestNode {
    pub fn new(number: u8, config: SdtConfig) -> SdtTestNode {
        Self::with_handler(number, config, Box::new(AutoJoin))
    }

    pub fn with_handler(number: u8, mut config: SdtConfig, handler: Box<dyn ChannelRequestHandler>) -> SdtTestNode {
        config.self_addr = test_addr(number);
        let transport = Arc::new(TrackingDatagramTransport::default());
        let notifier = SdtEventNotifier::new();
        let events = notifier.subscribe();

        let mut engine = SdtEngine::new(Arc::new(config), transport.clone(), notifier, handler)
            .expect("invalid test configuration");
        engine.add_local_component(test_cid(number), test_addr(number), true)
            .expect("error adding local component");

        SdtTestNode {
            engine,
            transport,
            cid: test_cid(number),
            addr: test_addr(number),
            events,
        }
    }

    pub fn replace_handler(&mut self, handler: Box<dyn ChannelRequestHandler>) {
        self.engine.set_channel_request_handler(handler);
    }

    /// opens a channel that stays open when its last member leaves
    pub fn open_channel(&mut self, dest_addr: TransportAddr) -> LocalChannelKey {
        self.engine.open_local_channel(self.cid, dest_addr, None, true)
            .expect("error opening channel")
    }

    pub fn take_sent(&self) -> Vec<SentDatagram> {
        self.transport.take_sent()
    }

    /// Delivers datagrams sent to the other node's address, or to a multicast group it
    ///  subscribed to. Returns the number of delivered datagrams.
    pub fn deliver_to(&self, other: &mut SdtTestNode, now: Instant) -> usize {
        let groups = other.transport.multicast_groups();
        let datagrams = self.transport.take_sent_where(|d| d.to == other.addr || groups.contains(&d.to.ip()));
        for d in &datagrams {
            other.engine.on_datagram(self.addr, d.data.clone(), now);
        }
        datagrams.len()
    }

    /// processes a message as if it had been sent by `sender` in a datagram of its own
    pub fn receive(&mut self, sender: Cid, from: SocketAddr, msg: SdtMessage, now: Instant) {
        let mut buf = BytesMut::new();
        let root_start = start_datagram(&mut buf, sender);
        msg.ser(&mut buf).expect("error serializing message");
        finish_datagram(&mut buf, root_start).expect("error finishing datagram");
        self.engine.on_datagram(from, buf.freeze(), now);
    }

    /// asserts that exactly one datagram was sent, with a JOIN_REFUSE, and returns its reason
    pub fn single_refusal(&self) -> ReasonCode {
        let sent = self.take_sent();
        assert_eq!(sent.len(), 1, "expected a single JOIN_REFUSE");
        match &sent[0].messages()[0].1 {
            SdtMessage::JoinRefuse(data) => data.reason,
            other => panic!("expected JOIN_REFUSE, was {:?}", other),
        }
    }

    pub fn members_with(&self, remote: Cid) -> Vec<MemberKey> {
        self.engine.members()
            .filter(|(_, m)| m.remote_component == remote)
            .map(|(key, _)| key)
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<SdtEvent> {
        let mut result = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            result.push(event);
        }
        result
    }

    /// cause and reason of all [SdtEvent::MemberLeft] events since events were last drained
    pub fn left_events(&mut self) -> Vec<(LeaveCause, ReasonCode)> {
        self.drain_events().into_iter()
            .filter_map(|e| match e {
                SdtEvent::MemberLeft(data) => Some((data.cause, data.reason)),
                _ => None,
            })
            .collect()
    }

    /// runs timers in deadline order, each at its own deadline
    pub fn run_timers_until(&mut self, deadline: Instant) {
        while let Some(next) = self.engine.next_deadline() {
            if next > deadline {
                break;
            }
            self.engine.on_timers_due(next);
        }
    }
}

/// delivers datagrams back and forth until both nodes are quiet
pub fn exchange(a: &mut SdtTestNode, b: &mut SdtTestNode, now: Instant) {
    for _ in 0..100 {
        if a.deliver_to(b, now) + b.deliver_to(a, now) == 0 {
            return;
        }
    }
    panic!("{} and {} do not stop talking", a.cid, b.cid);
}

/// `a` adds `b` to one of its channels, and the two exchange datagrams until they are bonded
pub fn join_nodes(a: &mut SdtTestNode, b: &mut SdtTestNode, channel: LocalChannelKey, now: Instant) -> MemberKey {
    let member = a.engine.add_member(channel, b.cid, b.addr, now)
        .expect("error adding member");
    exchange(a, b, now);
    assert!(a.engine.member(member).map(|m| m.full_member).unwrap_or(false), "{} did not join", b.cid);
    member
}

/// two nodes 1 and 2, where 1 added 2 to a unicast channel
pub fn joined_pair(config: SdtConfig, now: Instant) -> (SdtTestNode, SdtTestNode, MemberKey) {
    let mut a = SdtTestNode::new(1, config.clone());
    let mut b = SdtTestNode::new(2, config);
    let channel = a.open_channel(TransportAddr::Null);
    let member = join_nodes(&mut a, &mut b, channel, now);
    (a, b, member)
}
