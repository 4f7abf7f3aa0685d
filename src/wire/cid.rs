use std::fmt::{Debug, Display, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut};
use uuid::Uuid;

/// Component identifier: the UUID that identifies an SDT participant independent of its
///  network address.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Cid(Uuid);

impl Cid {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn new_random() -> Cid {
        Cid(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Cid {
        Cid(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Cid> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("CID requires {} bytes, {} remaining", Self::SERIALIZED_LEN, buf.remaining());
        }
        let mut raw = [0u8; 16];
        buf.copy_to_slice(&mut raw);
        Ok(Cid::from_bytes(raw))
    }
}

impl Debug for Cid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for Cid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deser_short_buffer() {
        let mut buf: &[u8] = &[1, 2, 3];
        assert!(Cid::try_deser(&mut buf).is_err());
    }

    #[test]
    fn test_ser_is_raw_uuid_bytes() {
        let cid = Cid::from_bytes([7; 16]);
        let mut buf = Vec::new();
        cid.ser(&mut buf);
        assert_eq!(buf, vec![7u8; 16]);

        let mut b: &[u8] = &buf;
        assert_eq!(Cid::try_deser(&mut b).unwrap(), cid);
        assert!(b.is_empty());
    }
}
