//! Generic ACN PDU framing.
//!
//! Every layer of the protocol (root layer, SDT base layer, client block, SDT wrapped layer)
//!  uses the same PDU format:
//!
//! ```ascii
//! 0: flags (4 bits) | length (12 bits, or 20 bits if the L flag is set)
//! *: vector (layer specific length, omitted if the V flag is clear)
//! *: header (layer specific length, omitted if the H flag is clear)
//! *: data (the rest of the PDU, omitted if the D flag is clear)
//! ```
//!
//! The length covers the entire PDU including the flags and length field itself. A PDU with a
//!  clear V / H / D flag inherits the corresponding field from the preceding PDU in the same
//!  block, so the first PDU in a block must carry all of them.

use anyhow::bail;
use bytes::{Buf, Bytes, BytesMut};

pub const FLAG_LENGTH: u8 = 0x80;
pub const FLAG_VECTOR: u8 = 0x40;
pub const FLAG_HEADER: u8 = 0x20;
pub const FLAG_DATA: u8 = 0x10;
pub const FLAGS_ALL: u8 = FLAG_VECTOR | FLAG_HEADER | FLAG_DATA;

/// maximum length representable without the L flag
pub const MAX_SHORT_PDU_LEN: usize = 0x0fff;

/// Appends a placeholder for a PDU's flags and length, returning the offset to pass to [end_pdu]
pub fn begin_pdu(buf: &mut BytesMut) -> usize {
    let start = buf.len();
    buf.extend_from_slice(&[0, 0]);
    start
}

/// Patches flags and length of a PDU started by [begin_pdu], the PDU extending to the current
///  end of the buffer.
pub fn end_pdu(buf: &mut BytesMut, start: usize, flags: u8) -> anyhow::Result<()> {
    let len = buf.len() - start;
    if len > MAX_SHORT_PDU_LEN {
        bail!("PDU length {} exceeds the maximum of {}", len, MAX_SHORT_PDU_LEN);
    }
    let raw = (((flags & 0x70) as u16) << 8) | len as u16;
    buf[start..start+2].copy_from_slice(&raw.to_be_bytes());
    Ok(())
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Pdu {
    pub vector: Bytes,
    pub header: Bytes,
    pub data: Bytes,
}
impl Pdu {
    pub fn vector_u8(&self) -> u8 {
        self.vector[0]
    }

    pub fn vector_u16(&self) -> u16 {
        u16::from_be_bytes([self.vector[0], self.vector[1]])
    }

    pub fn vector_u32(&self) -> u32 {
        u32::from_be_bytes([self.vector[0], self.vector[1], self.vector[2], self.vector[3]])
    }
}

/// Iterates over the PDUs in a block, resolving inherited fields. The reader stops after the
///  first framing error since there is no way to resynchronize inside a block.
pub struct PduBlockReader {
    block: Bytes,
    vector_len: usize,
    header_len: usize,
    prev: Option<Pdu>,
}

impl PduBlockReader {
    pub fn new(block: Bytes, vector_len: usize, header_len: usize) -> PduBlockReader {
        PduBlockReader {
            block,
            vector_len,
            header_len,
            prev: None,
        }
    }

    fn read_pdu(&mut self) -> anyhow::Result<Pdu> {
        let flags = self.block[0];
        let len_field_len = if flags & FLAG_LENGTH != 0 { 3 } else { 2 };
        if self.block.len() < len_field_len {
            bail!("truncated PDU length field");
        }

        let len = if flags & FLAG_LENGTH != 0 {
            ((self.block[0] as usize & 0x0f) << 16) | ((self.block[1] as usize) << 8) | self.block[2] as usize
        }
        else {
            ((self.block[0] as usize & 0x0f) << 8) | self.block[1] as usize
        };
        if len < len_field_len || len > self.block.len() {
            bail!("PDU length {} is inconsistent with {} bytes remaining in the block", len, self.block.len());
        }

        let mut pdu = self.block.split_to(len);
        pdu.advance(len_field_len);

        let vector = if flags & FLAG_VECTOR != 0 {
            if pdu.len() < self.vector_len {
                bail!("PDU too short for its vector");
            }
            pdu.split_to(self.vector_len)
        }
        else {
            match &self.prev {
                Some(prev) => prev.vector.clone(),
                None => bail!("first PDU in block inherits its vector"),
            }
        };

        let header = if flags & FLAG_HEADER != 0 {
            if pdu.len() < self.header_len {
                bail!("PDU too short for its header");
            }
            pdu.split_to(self.header_len)
        }
        else {
            match &self.prev {
                Some(prev) => prev.header.clone(),
                None => bail!("first PDU in block inherits its header"),
            }
        };

        let data = if flags & FLAG_DATA != 0 {
            pdu
        }
        else {
            if !pdu.is_empty() {
                bail!("PDU inherits its data but has {} trailing bytes", pdu.len());
            }
            match &self.prev {
                Some(prev) => prev.data.clone(),
                None => bail!("first PDU in block inherits its data"),
            }
        };

        let result = Pdu { vector, header, data };
        self.prev = Some(result.clone());
        Ok(result)
    }
}

impl Iterator for PduBlockReader {
    type Item = anyhow::Result<Pdu>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.block.is_empty() {
            return None;
        }
        let result = self.read_pdu();
        if result.is_err() {
            self.block.clear();
        }
        Some(result)
    }
}
