use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};

use crate::sdt::channel::LocalChannelKey;
use crate::wire::cid::Cid;
use crate::wire::pdu::{begin_pdu, end_pdu, FLAGS_ALL, FLAG_DATA, FLAG_HEADER, FLAG_VECTOR};
use crate::wire::root_layer::{finish_datagram, start_datagram};
use crate::wire::sdt_messages::{SdtVector, WrapperHeader};
use crate::wire::wrapped_messages::Mid;

/// An outgoing wrapper under construction.
///
/// The datagram is built in place: root layer and wrapper header are written when the wrapper
///  is started (the header as a placeholder), messages are appended, and the header is patched
///  when the wrapper is flushed through [crate::sdt::engine::SdtEngine::flush_wrapper].
///
/// Consecutive messages share the destination MID and protocol / association by PDU field
///  inheritance if they are the same.
pub struct TxWrap {
    channel: LocalChannelKey,
    reliable: bool,
    buf: BytesMut,
    root_start: usize,
    wrap_start: usize,
    max_len: usize,
    last_dest: Option<Mid>,
    last_header: Option<(u32, u16)>,
    num_msgs: usize,
}

impl TxWrap {
    pub(crate) fn new(channel: LocalChannelKey, sender: Cid, reliable: bool, max_len: usize, size_hint: usize) -> TxWrap {
        let mut buf = BytesMut::with_capacity(size_hint.clamp(Self::overhead(), max_len));
        let root_start = start_datagram(&mut buf, sender);
        let wrap_start = begin_pdu(&mut buf);
        let vector = if reliable { SdtVector::RelWrap } else { SdtVector::UnrelWrap };
        buf.put_u8(vector.into());
        buf.put_bytes(0, WrapperHeader::SERIALIZED_LEN);

        TxWrap {
            channel,
            reliable,
            buf,
            root_start,
            wrap_start,
            max_len,
            last_dest: None,
            last_header: None,
            num_msgs: 0,
        }
    }

    /// bytes in a datagram that precede the first message
    pub fn overhead() -> usize {
        crate::wire::root_layer::ROOT_OVERHEAD + 3 + WrapperHeader::SERIALIZED_LEN
    }

    pub fn channel(&self) -> LocalChannelKey {
        self.channel
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn is_empty(&self) -> bool {
        self.num_msgs == 0
    }

    pub fn num_msgs(&self) -> usize {
        self.num_msgs
    }

    pub fn remaining(&self) -> usize {
        self.max_len.saturating_sub(self.buf.len())
    }

    /// Appends a message for one member (or all members with
    ///  [crate::wire::wrapped_messages::MID_ALL_MEMBERS]). Fails without modifying the wrapper
    ///  if the message does not fit.
    pub fn add_proto_msg(&mut self, dest: Mid, protocol: u32, association: u16, data: &[u8]) -> anyhow::Result<()> {
        let mut flags = FLAG_DATA;
        let mut len = 2 + data.len();
        if self.last_dest != Some(dest) {
            flags |= FLAG_VECTOR;
            len += 2;
        }
        if self.last_header != Some((protocol, association)) {
            flags |= FLAG_HEADER;
            len += 6;
        }
        if len > self.remaining() {
            bail!("message of {} bytes does not fit into the wrapper, {} bytes remaining", data.len(), self.remaining());
        }

        let start = begin_pdu(&mut self.buf);
        if flags & FLAG_VECTOR != 0 {
            self.buf.put_u16(dest);
        }
        if flags & FLAG_HEADER != 0 {
            self.buf.put_u32(protocol);
            self.buf.put_u16(association);
        }
        self.buf.put_slice(data);
        end_pdu(&mut self.buf, start, flags)?;

        self.last_dest = Some(dest);
        self.last_header = Some((protocol, association));
        self.num_msgs += 1;
        Ok(())
    }

    /// Repeats the previous message for another destination, inheriting protocol, association
    ///  and data.
    pub fn rpt_proto_msg(&mut self, dest: Mid) -> anyhow::Result<()> {
        if self.num_msgs == 0 {
            bail!("no previous message to repeat");
        }
        let (flags, len) = if self.last_dest == Some(dest) { (0, 2) } else { (FLAG_VECTOR, 4) };
        if len > self.remaining() {
            bail!("repeated message does not fit into the wrapper");
        }

        let start = begin_pdu(&mut self.buf);
        if flags & FLAG_VECTOR != 0 {
            self.buf.put_u16(dest);
        }
        end_pdu(&mut self.buf, start, flags)?;

        self.last_dest = Some(dest);
        self.num_msgs += 1;
        Ok(())
    }

    /// Patches the wrapper header and returns the finished datagram together with the offset
    ///  at which the wrapper PDU starts.
    pub(crate) fn finish(mut self, header: &WrapperHeader) -> anyhow::Result<(Bytes, usize)> {
        let header_start = self.wrap_start + 3;
        header.ser(&mut &mut self.buf[header_start..header_start + WrapperHeader::SERIALIZED_LEN]);
        end_pdu(&mut self.buf, self.wrap_start, FLAGS_ALL)?;
        finish_datagram(&mut self.buf, self.root_start)?;
        Ok((self.buf.freeze(), self.wrap_start))
    }
}
