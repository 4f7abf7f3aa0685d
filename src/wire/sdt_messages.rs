//! SDT base layer messages, i.e. the PDUs directly inside a root PDU.
//!
//! Vectors are shared between the base layer and the wrapped layer (see
//!  [crate::wire::wrapped_messages]). Each message is only valid in one of them.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::sdt::seq::Seq;
use crate::wire::channel_params::ChannelParams;
use crate::wire::cid::Cid;
use crate::wire::pdu::{begin_pdu, end_pdu, Pdu, FLAGS_ALL};
use crate::wire::reason_code::ReasonCode;
use crate::wire::transport_addr::TransportAddr;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum SdtVector {
    RelWrap = 1,
    UnrelWrap = 2,
    ChannelParams = 3,
    Join = 4,
    JoinRefuse = 5,
    JoinAccept = 6,
    Leave = 7,
    Leaving = 8,
    Connect = 9,
    ConnectAccept = 10,
    ConnectRefuse = 11,
    Disconnect = 12,
    Disconnecting = 13,
    Ack = 14,
    Nak = 15,
    GetSessions = 16,
    Sessions = 17,
}

/// Fixed part of a reliable or unreliable wrapper
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct WrapperHeader {
    pub channel: u16,
    pub tseq: Seq,
    pub rseq: Seq,
    pub oldest_available: Seq,
    pub first_mak: u16,
    pub last_mak: u16,
    pub mak_threshold: u16,
}
impl WrapperHeader {
    pub const SERIALIZED_LEN: usize = 20;
    /// offset of the 'oldest available' field inside the serialized header
    pub const OFFS_OLDEST_AVAILABLE: usize = 10;
    /// offset of the MAK range inside the serialized header
    pub const OFFS_MAK_RANGE: usize = 14;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.channel);
        buf.put_u32(self.tseq.to_raw());
        buf.put_u32(self.rseq.to_raw());
        buf.put_u32(self.oldest_available.to_raw());
        buf.put_u16(self.first_mak);
        buf.put_u16(self.last_mak);
        buf.put_u16(self.mak_threshold);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<WrapperHeader> {
        Ok(WrapperHeader {
            channel: buf.try_get_u16()?,
            tseq: Seq::from_raw(buf.try_get_u32()?),
            rseq: Seq::from_raw(buf.try_get_u32()?),
            oldest_available: Seq::from_raw(buf.try_get_u32()?),
            first_mak: buf.try_get_u16()?,
            last_mak: buf.try_get_u16()?,
            mak_threshold: buf.try_get_u16()?,
        })
    }

    pub fn is_maked(&self, mid: u16) -> bool {
        self.first_mak != 0 && self.first_mak <= mid && mid <= self.last_mak
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WrapperData {
    pub reliable: bool,
    pub header: WrapperHeader,
    pub client_block: Bytes,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct JoinData {
    pub dest: Cid,
    pub mid: u16,
    pub channel: u16,
    pub reciprocal: u16,
    pub tseq: Seq,
    pub rseq: Seq,
    pub dest_addr: TransportAddr,
    pub params: ChannelParams,
    pub adhoc_expiry: u8,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct JoinAcceptData {
    pub leader: Cid,
    pub channel: u16,
    pub mid: u16,
    pub rseq: Seq,
    pub reciprocal: u16,
}

/// Layout shared by JOIN_REFUSE and LEAVING
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RefuseData {
    pub leader: Cid,
    pub channel: u16,
    pub mid: u16,
    pub rseq: Seq,
    pub reason: ReasonCode,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NakData {
    pub leader: Cid,
    pub channel: u16,
    pub mid: u16,
    pub rseq: Seq,
    pub first_missed: Seq,
    pub last_missed: Seq,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionMember {
    pub mid: u16,
    pub cid: Cid,
    pub reciprocal: u16,
    pub protocols: Vec<u32>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelSessions {
    pub leader: Cid,
    pub channel: u16,
    pub dest_addr: TransportAddr,
    pub members: Vec<SessionMember>,
}
impl ChannelSessions {
    pub fn serialized_len(&self) -> usize {
        Cid::SERIALIZED_LEN + 2 + self.dest_addr.serialized_len() + 2 +
            self.members.iter()
                .map(|m| 2 + Cid::SERIALIZED_LEN + 2 + 2 + 4 * m.protocols.len())
                .sum::<usize>()
    }

    fn ser(&self, buf: &mut impl BufMut) {
        self.leader.ser(buf);
        buf.put_u16(self.channel);
        self.dest_addr.ser(buf);
        buf.put_u16(self.members.len() as u16);
        for member in &self.members {
            buf.put_u16(member.mid);
            member.cid.ser(buf);
            buf.put_u16(member.reciprocal);
            buf.put_u16(member.protocols.len() as u16);
            for &protocol in &member.protocols {
                buf.put_u32(protocol);
            }
        }
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ChannelSessions> {
        let leader = Cid::try_deser(buf)?;
        let channel = buf.try_get_u16()?;
        let dest_addr = TransportAddr::try_deser(buf)?;
        let num_members = buf.try_get_u16()?;
        let mut members = Vec::new();
        for _ in 0..num_members {
            let mid = buf.try_get_u16()?;
            let cid = Cid::try_deser(buf)?;
            let reciprocal = buf.try_get_u16()?;
            let num_protocols = buf.try_get_u16()?;
            let mut protocols = Vec::new();
            for _ in 0..num_protocols {
                protocols.push(buf.try_get_u32()?);
            }
            members.push(SessionMember { mid, cid, reciprocal, protocols });
        }
        Ok(ChannelSessions { leader, channel, dest_addr, members })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SdtMessage {
    Wrapper(WrapperData),
    Join(JoinData),
    JoinAccept(JoinAcceptData),
    JoinRefuse(RefuseData),
    Leaving(RefuseData),
    Nak(NakData),
    GetSessions(Cid),
    Sessions(Vec<ChannelSessions>),
}

impl SdtMessage {
    pub fn vector(&self) -> SdtVector {
        match self {
            SdtMessage::Wrapper(data) => if data.reliable { SdtVector::RelWrap } else { SdtVector::UnrelWrap },
            SdtMessage::Join(_) => SdtVector::Join,
            SdtMessage::JoinAccept(_) => SdtVector::JoinAccept,
            SdtMessage::JoinRefuse(_) => SdtVector::JoinRefuse,
            SdtMessage::Leaving(_) => SdtVector::Leaving,
            SdtMessage::Nak(_) => SdtVector::Nak,
            SdtMessage::GetSessions(_) => SdtVector::GetSessions,
            SdtMessage::Sessions(_) => SdtVector::Sessions,
        }
    }

    /// Appends this message as a complete base layer PDU
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let start = begin_pdu(buf);
        buf.put_u8(self.vector().into());
        match self {
            SdtMessage::Wrapper(data) => {
                data.header.ser(buf);
                buf.put_slice(&data.client_block);
            }
            SdtMessage::Join(data) => Self::ser_join(data, buf),
            SdtMessage::JoinAccept(data) => {
                data.leader.ser(buf);
                buf.put_u16(data.channel);
                buf.put_u16(data.mid);
                buf.put_u32(data.rseq.to_raw());
                buf.put_u16(data.reciprocal);
            }
            SdtMessage::JoinRefuse(data) | SdtMessage::Leaving(data) => Self::ser_refuse(data, buf),
            SdtMessage::Nak(data) => {
                data.leader.ser(buf);
                buf.put_u16(data.channel);
                buf.put_u16(data.mid);
                buf.put_u32(data.rseq.to_raw());
                buf.put_u32(data.first_missed.to_raw());
                buf.put_u32(data.last_missed.to_raw());
            }
            SdtMessage::GetSessions(cid) => cid.ser(buf),
            SdtMessage::Sessions(channels) => {
                for channel in channels {
                    channel.ser(buf);
                }
            }
        }
        end_pdu(buf, start, FLAGS_ALL)
    }

    fn ser_join(data: &JoinData, buf: &mut impl BufMut) {
        data.dest.ser(buf);
        buf.put_u16(data.mid);
        buf.put_u16(data.channel);
        buf.put_u16(data.reciprocal);
        buf.put_u32(data.tseq.to_raw());
        buf.put_u32(data.rseq.to_raw());
        data.dest_addr.ser(buf);
        data.params.ser(buf);
        buf.put_u8(data.adhoc_expiry);
    }

    fn ser_refuse(data: &RefuseData, buf: &mut impl BufMut) {
        data.leader.ser(buf);
        buf.put_u16(data.channel);
        buf.put_u16(data.mid);
        buf.put_u32(data.rseq.to_raw());
        buf.put_u8(data.reason.into());
    }

    pub fn try_deser(pdu: Pdu) -> anyhow::Result<SdtMessage> {
        let vector = SdtVector::try_from_primitive(pdu.vector_u8())
            .map_err(|_| anyhow!("unknown SDT vector {}", pdu.vector_u8()))?;
        let mut buf = pdu.data;

        let result = match vector {
            SdtVector::RelWrap | SdtVector::UnrelWrap => {
                let header = WrapperHeader::try_deser(&mut buf)?;
                SdtMessage::Wrapper(WrapperData {
                    reliable: vector == SdtVector::RelWrap,
                    header,
                    client_block: buf.split_off(0),
                })
            }
            SdtVector::Join => SdtMessage::Join(Self::deser_join(&mut buf)?),
            SdtVector::JoinAccept => SdtMessage::JoinAccept(JoinAcceptData {
                leader: Cid::try_deser(&mut buf)?,
                channel: buf.try_get_u16()?,
                mid: buf.try_get_u16()?,
                rseq: Seq::from_raw(buf.try_get_u32()?),
                reciprocal: buf.try_get_u16()?,
            }),
            SdtVector::JoinRefuse => SdtMessage::JoinRefuse(Self::deser_refuse(&mut buf)?),
            SdtVector::Leaving => SdtMessage::Leaving(Self::deser_refuse(&mut buf)?),
            SdtVector::Nak => SdtMessage::Nak(NakData {
                leader: Cid::try_deser(&mut buf)?,
                channel: buf.try_get_u16()?,
                mid: buf.try_get_u16()?,
                rseq: Seq::from_raw(buf.try_get_u32()?),
                first_missed: Seq::from_raw(buf.try_get_u32()?),
                last_missed: Seq::from_raw(buf.try_get_u32()?),
            }),
            SdtVector::GetSessions => SdtMessage::GetSessions(Cid::try_deser(&mut buf)?),
            SdtVector::Sessions => {
                let mut channels = Vec::new();
                while buf.has_remaining() {
                    channels.push(ChannelSessions::try_deser(&mut buf)?);
                }
                SdtMessage::Sessions(channels)
            }
            SdtVector::ChannelParams | SdtVector::Leave | SdtVector::Connect | SdtVector::ConnectAccept |
            SdtVector::ConnectRefuse | SdtVector::Disconnect | SdtVector::Disconnecting | SdtVector::Ack => {
                bail!("{:?} is only valid inside a wrapper", vector);
            }
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after {:?}", buf.remaining(), vector);
        }
        Ok(result)
    }

    fn deser_join(buf: &mut impl Buf) -> anyhow::Result<JoinData> {
        Ok(JoinData {
            dest: Cid::try_deser(buf)?,
            mid: buf.try_get_u16()?,
            channel: buf.try_get_u16()?,
            reciprocal: buf.try_get_u16()?,
            tseq: Seq::from_raw(buf.try_get_u32()?),
            rseq: Seq::from_raw(buf.try_get_u32()?),
            dest_addr: TransportAddr::try_deser(buf)?,
            params: ChannelParams::try_deser(buf)?,
            adhoc_expiry: buf.try_get_u8()?,
        })
    }

    fn deser_refuse(buf: &mut impl Buf) -> anyhow::Result<RefuseData> {
        Ok(RefuseData {
            leader: Cid::try_deser(buf)?,
            channel: buf.try_get_u16()?,
            mid: buf.try_get_u16()?,
            rseq: Seq::from_raw(buf.try_get_u32()?),
            reason: ReasonCode::try_from_primitive(buf.try_get_u8()?)?,
        })
    }
}
