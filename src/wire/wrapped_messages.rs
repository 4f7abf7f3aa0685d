//! The client block inside wrappers, and the SDT messages that travel in it.
//!
//! A client block is a block of PDUs with the destination MID as vector and the client protocol
//!  plus association as header. SDT itself is one of the client protocols, its messages being
//!  PDUs with a one-byte vector and no header.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;

use crate::sdt::seq::Seq;
use crate::wire::channel_params::ChannelParams;
use crate::wire::pdu::{begin_pdu, end_pdu, Pdu, PduBlockReader, FLAGS_ALL};
use crate::wire::reason_code::ReasonCode;
use crate::wire::sdt_messages::SdtVector;
use crate::wire::transport_addr::TransportAddr;

pub type Mid = u16;

/// destination MID addressing all members of a channel
pub const MID_ALL_MEMBERS: Mid = 0xffff;
pub const MAX_MID: Mid = 0xfffe;

pub const CLIENT_PDU_VECTOR_LEN: usize = 2;
pub const CLIENT_PDU_HEADER_LEN: usize = 6;

/// One message in a wrapper's client block
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientPdu {
    pub dest_mid: Mid,
    pub protocol: u32,
    pub association: u16,
    pub data: Bytes,
}
impl ClientPdu {
    fn from_pdu(pdu: Pdu) -> ClientPdu {
        let mut header = pdu.header.clone();
        // header length is enforced by the block reader
        let protocol = header.get_u32();
        let association = header.get_u16();
        ClientPdu {
            dest_mid: pdu.vector_u16(),
            protocol,
            association,
            data: pdu.data,
        }
    }

    pub fn read_block(client_block: Bytes) -> impl Iterator<Item = anyhow::Result<ClientPdu>> {
        PduBlockReader::new(client_block, CLIENT_PDU_VECTOR_LEN, CLIENT_PDU_HEADER_LEN)
            .map(|pdu| pdu.map(ClientPdu::from_pdu))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChannelParamsData {
    pub params: ChannelParams,
    pub adhoc_addr: TransportAddr,
    pub adhoc_expiry: u8,
}

/// SDT messages that are sent inside wrappers, as client protocol [crate::wire::root_layer::SDT_PROTOCOL_ID]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WrappedMessage {
    ChannelParams(ChannelParamsData),
    Leave,
    Connect(u32),
    ConnectAccept(u32),
    ConnectRefuse(u32, ReasonCode),
    Disconnect(u32),
    Disconnecting(u32, ReasonCode),
    Ack(Seq),
}

impl WrappedMessage {
    pub fn vector(&self) -> SdtVector {
        match self {
            WrappedMessage::ChannelParams(_) => SdtVector::ChannelParams,
            WrappedMessage::Leave => SdtVector::Leave,
            WrappedMessage::Connect(_) => SdtVector::Connect,
            WrappedMessage::ConnectAccept(_) => SdtVector::ConnectAccept,
            WrappedMessage::ConnectRefuse(_, _) => SdtVector::ConnectRefuse,
            WrappedMessage::Disconnect(_) => SdtVector::Disconnect,
            WrappedMessage::Disconnecting(_, _) => SdtVector::Disconnecting,
            WrappedMessage::Ack(_) => SdtVector::Ack,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let start = begin_pdu(buf);
        buf.put_u8(self.vector().into());
        match self {
            WrappedMessage::ChannelParams(data) => {
                data.params.ser(buf);
                data.adhoc_addr.ser(buf);
                buf.put_u8(data.adhoc_expiry);
            }
            WrappedMessage::Leave => {}
            WrappedMessage::Connect(protocol) |
            WrappedMessage::ConnectAccept(protocol) |
            WrappedMessage::Disconnect(protocol) => {
                buf.put_u32(*protocol);
            }
            WrappedMessage::ConnectRefuse(protocol, reason) |
            WrappedMessage::Disconnecting(protocol, reason) => {
                buf.put_u32(*protocol);
                buf.put_u8((*reason).into());
            }
            WrappedMessage::Ack(rseq) => {
                buf.put_u32(rseq.to_raw());
            }
        }
        end_pdu(buf, start, FLAGS_ALL)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(32);
        self.ser(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn try_deser(pdu: Pdu) -> anyhow::Result<WrappedMessage> {
        let vector = SdtVector::try_from_primitive(pdu.vector_u8())
            .map_err(|_| anyhow!("unknown SDT vector {}", pdu.vector_u8()))?;
        let mut buf = pdu.data;

        let result = match vector {
            SdtVector::ChannelParams => WrappedMessage::ChannelParams(ChannelParamsData {
                params: ChannelParams::try_deser(&mut buf)?,
                adhoc_addr: TransportAddr::try_deser(&mut buf)?,
                adhoc_expiry: buf.try_get_u8()?,
            }),
            SdtVector::Leave => WrappedMessage::Leave,
            SdtVector::Connect => WrappedMessage::Connect(buf.try_get_u32()?),
            SdtVector::ConnectAccept => WrappedMessage::ConnectAccept(buf.try_get_u32()?),
            SdtVector::ConnectRefuse => WrappedMessage::ConnectRefuse(buf.try_get_u32()?, ReasonCode::try_from_primitive(buf.try_get_u8()?)?),
            SdtVector::Disconnect => WrappedMessage::Disconnect(buf.try_get_u32()?),
            SdtVector::Disconnecting => WrappedMessage::Disconnecting(buf.try_get_u32()?, ReasonCode::try_from_primitive(buf.try_get_u8()?)?),
            SdtVector::Ack => WrappedMessage::Ack(Seq::from_raw(buf.try_get_u32()?)),
            _ => bail!("{:?} is not valid inside a wrapper", vector),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after {:?}", buf.remaining(), vector);
        }
        Ok(result)
    }

    pub fn read_block(data: Bytes) -> impl Iterator<Item = anyhow::Result<WrappedMessage>> {
        PduBlockReader::new(data, 1, 0)
            .map(|pdu| pdu.and_then(WrappedMessage::try_deser))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case::channel_params(WrappedMessage::ChannelParams(ChannelParamsData {
        params: ChannelParams { expiry: Duration::from_secs(4), nak_outbound: true, nak_holdoff: Duration::from_millis(2), nak_modulus: 16, nak_max_wait: Duration::from_millis(20) },
        adhoc_addr: TransportAddr::Ip("10.1.2.3:5568".parse().unwrap()),
        adhoc_expiry: 15,
    }))]
    #[case::leave(WrappedMessage::Leave)]
    #[case::connect(WrappedMessage::Connect(0x1234))]
    #[case::connect_accept(WrappedMessage::ConnectAccept(0x1234))]
    #[case::connect_refuse(WrappedMessage::ConnectRefuse(0x1234, ReasonCode::NoRecipient))]
    #[case::disconnect(WrappedMessage::Disconnect(7))]
    #[case::disconnecting(WrappedMessage::Disconnecting(7, ReasonCode::AskedToLeave))]
    #[case::ack(WrappedMessage::Ack(Seq::from_raw(0xffff_fff0)))]
    fn test_reparse(#[case] msg: WrappedMessage) {
        let parsed = WrappedMessage::read_block(msg.to_bytes().unwrap())
            .collect::<anyhow::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(parsed, vec![msg]);
    }

    #[test]
    fn test_ack_layout() {
        let bytes = WrappedMessage::Ack(Seq::from_raw(0x01020304)).to_bytes().unwrap();
        assert_eq!(&bytes[..], &[0x70, 7, 14, 1, 2, 3, 4]);
    }

    #[rstest]
    #[case::base_layer_only(vec![0x70, 3, 4])]
    #[case::trailing_bytes(vec![0x70, 5, 7, 0, 0])]
    #[case::bad_reason(vec![0x70, 8, 11, 0, 0, 0, 1, 99])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        let mut block = WrappedMessage::read_block(Bytes::from(raw));
        assert!(block.next().unwrap().is_err());
    }

    #[test]
    fn test_read_client_block() {
        let raw: &[u8] = &[
            0x70, 13, 0, 2, 0, 0, 0, 1, 0, 9, b'a', b'b', b'c',
            0x50, 5, 0, 3, b'd',
        ];
        let pdus = ClientPdu::read_block(Bytes::copy_from_slice(raw))
            .collect::<anyhow::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(pdus, vec![
            ClientPdu { dest_mid: 2, protocol: 1, association: 9, data: Bytes::from_static(b"abc") },
            ClientPdu { dest_mid: 3, protocol: 1, association: 9, data: Bytes::from_static(b"d") },
        ]);
    }
}
