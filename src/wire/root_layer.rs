//! ACN root layer: the preamble that starts every datagram, followed by a block of root PDUs.
//!
//! ```ascii
//! 0:  preamble size (u16) = 0x0010
//! 2:  postamble size (u16) = 0
//! 4:  ACN packet identifier "ASC-E1.17\0\0\0"
//! 16: root PDU block - vector: protocol id (u32), header: sender CID, data: protocol payload
//! ```

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::wire::cid::Cid;
use crate::wire::pdu::{begin_pdu, end_pdu, PduBlockReader, FLAGS_ALL};

pub const PREAMBLE_SIZE: u16 = 0x0010;
pub const POSTAMBLE_SIZE: u16 = 0;
pub const ACN_PACKET_IDENTIFIER: &[u8; 12] = b"ASC-E1.17\0\0\0";

pub const SDT_PROTOCOL_ID: u32 = 1;

/// number of bytes that precede the root PDU's payload in every datagram this crate writes
pub const ROOT_OVERHEAD: usize = PREAMBLE_SIZE as usize + 2 + 4 + Cid::SERIALIZED_LEN;

/// Writes the preamble and the start of an SDT root PDU. The returned offset must be passed to
///  [finish_datagram] after the payload was appended.
pub fn start_datagram(buf: &mut BytesMut, sender: Cid) -> usize {
    buf.put_u16(PREAMBLE_SIZE);
    buf.put_u16(POSTAMBLE_SIZE);
    buf.put_slice(ACN_PACKET_IDENTIFIER);

    let root_start = begin_pdu(buf);
    buf.put_u32(SDT_PROTOCOL_ID);
    sender.ser(buf);
    root_start
}

pub fn finish_datagram(buf: &mut BytesMut, root_start: usize) -> anyhow::Result<()> {
    end_pdu(buf, root_start, FLAGS_ALL)
}

/// The SDT payload of one root PDU
#[derive(Debug, Clone)]
pub struct RootPayload {
    pub sender: Cid,
    pub data: Bytes,
}

/// Parses a datagram's root layer, returning the payloads of all root PDUs carrying SDT.
///  PDUs for other protocols are skipped.
pub fn parse_datagram(mut datagram: Bytes) -> anyhow::Result<Vec<RootPayload>> {
    if datagram.len() < PREAMBLE_SIZE as usize {
        bail!("datagram of {} bytes is too short for an ACN preamble", datagram.len());
    }
    let preamble_size = datagram.try_get_u16()?;
    let postamble_size = datagram.try_get_u16()?;
    if preamble_size != PREAMBLE_SIZE {
        bail!("unsupported preamble size {}", preamble_size);
    }
    if datagram.split_to(ACN_PACKET_IDENTIFIER.len()) != &ACN_PACKET_IDENTIFIER[..] {
        bail!("not an ACN packet");
    }
    if postamble_size as usize > datagram.len() {
        bail!("postamble size {} exceeds the datagram", postamble_size);
    }
    datagram.truncate(datagram.len() - postamble_size as usize);

    let mut result = Vec::new();
    for pdu in PduBlockReader::new(datagram, 4, Cid::SERIALIZED_LEN) {
        let pdu = pdu?;
        let protocol = pdu.vector_u32();
        if protocol != SDT_PROTOCOL_ID {
            trace!("skipping root PDU for protocol {}", protocol);
            continue;
        }
        let sender = Cid::try_deser(&mut pdu.header.clone())?;
        result.push(RootPayload { sender, data: pdu.data });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_layout() {
        let cid = Cid::from_bytes([3; 16]);
        let mut buf = BytesMut::new();
        let root_start = start_datagram(&mut buf, cid);
        buf.put_slice(b"payload");
        finish_datagram(&mut buf, root_start).unwrap();

        assert_eq!(&buf[0..4], &[0, 0x10, 0, 0]);
        assert_eq!(&buf[4..16], b"ASC-E1.17\0\0\0");
        assert_eq!(root_start, 16);
        assert_eq!(ROOT_OVERHEAD, buf.len() - 7);

        let payloads = parse_datagram(buf.freeze()).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].sender, cid);
        assert_eq!(&payloads[0].data[..], b"payload");
    }

    #[test]
    fn test_skips_foreign_protocol() {
        let mut buf = BytesMut::new();
        buf.put_u16(PREAMBLE_SIZE);
        buf.put_u16(POSTAMBLE_SIZE);
        buf.put_slice(ACN_PACKET_IDENTIFIER);
        let start = begin_pdu(&mut buf);
        buf.put_u32(5);
        buf.put_slice(&[1; 16]);
        buf.put_slice(b"other");
        end_pdu(&mut buf, start, FLAGS_ALL).unwrap();

        assert!(parse_datagram(buf.freeze()).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_wrong_identifier() {
        let mut buf = BytesMut::new();
        buf.put_u16(PREAMBLE_SIZE);
        buf.put_u16(POSTAMBLE_SIZE);
        buf.put_slice(b"ASC-E1.31\0\0\0");
        assert!(parse_datagram(buf.freeze()).is_err());
    }
}
