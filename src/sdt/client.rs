use std::net::SocketAddr;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::sdt::channel::LocalChannelKey;
use crate::sdt::events::MemberData;
use crate::wire::channel_params::ChannelParams;
use crate::wire::cid::Cid;
use crate::wire::reason_code::ReasonCode;
use crate::wire::transport_addr::TransportAddr;

/// A client protocol message, delivered in order for the channel it was received on
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientMessage {
    pub member: MemberData,
    pub protocol: u32,
    pub association: u16,
    pub reliable: bool,
    pub data: Bytes,
}

/// Receives messages for one client protocol. Messages are only delivered for members that
///  have a connected session for the protocol.
#[cfg_attr(test, automock)]
pub trait ClientProtocolHandler: Send {
    fn on_message(&mut self, msg: ClientMessage);
}

/// A peer asks to join one of its channels without being a member of one of ours, i.e. this
///  side has to provide the reciprocal channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChannelRequest {
    pub local_component: Cid,
    pub remote_component: Cid,
    pub remote_addr: SocketAddr,
    pub channel: u16,
    pub dest_addr: TransportAddr,
    pub params: ChannelParams,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelDecision {
    Refuse(ReasonCode),
    /// open a new unicast channel as the reciprocal, closing it when the member leaves
    NewChannel,
    /// add the peer to an existing channel of the addressed component
    UseChannel(LocalChannelKey),
}

#[cfg_attr(test, automock)]
pub trait ChannelRequestHandler: Send {
    fn on_channel_requested(&mut self, request: &ChannelRequest) -> ChannelDecision;
}

/// accepts every request with a dedicated reciprocal channel
pub struct AutoJoin;
impl ChannelRequestHandler for AutoJoin {
    fn on_channel_requested(&mut self, _request: &ChannelRequest) -> ChannelDecision {
        ChannelDecision::NewChannel
    }
}
