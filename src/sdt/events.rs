use tokio::sync::broadcast;
use tracing::trace;

use crate::sdt::member::MemberKey;
use crate::wire::cid::Cid;
use crate::wire::reason_code::ReasonCode;
use crate::wire::sdt_messages::ChannelSessions;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SdtEvent {
    /// both halves of a member reached 'member' state
    MemberJoined(MemberData),
    SessionConnected(SessionData),
    SessionRefused(SessionRefusedData),
    SessionDisconnected(SessionData),
    /// A member was torn down. This is sent exactly once per member, regardless of whether it
    ///  was ever fully joined.
    MemberLeft(MemberLeftData),
    SessionsReceived(SessionsReceivedData),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemberData {
    pub member: MemberKey,
    pub local_component: Cid,
    pub remote_component: Cid,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionData {
    pub member: MemberData,
    pub protocol: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionRefusedData {
    pub member: MemberData,
    pub protocol: u32,
    pub reason: ReasonCode,
}

/// What ended a membership
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaveCause {
    /// left regularly, on request by either side
    Left,
    JoinFailed,
    NakTimeout,
    MakTimeout,
    LostSequence,
    Expired,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemberLeftData {
    pub member: MemberData,
    pub cause: LeaveCause,
    pub reason: ReasonCode,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionsReceivedData {
    pub from: Cid,
    pub channels: Vec<ChannelSessions>,
}


#[derive(Clone)]
pub struct SdtEventNotifier {
    sender: broadcast::Sender<SdtEvent>,
}
impl SdtEventNotifier {
    pub fn new() -> SdtEventNotifier {
        let (sender, _) = broadcast::channel(1024);

        SdtEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SdtEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: SdtEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for SdtEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}
