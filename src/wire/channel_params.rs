use std::time::Duration;

use bytes::{Buf, BufMut};

const FLAG_NAK_OUTBOUND: u8 = 0x80;

/// Per-channel parameters, negotiated in JOIN and updated by CHANNEL_PARAMS.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChannelParams {
    /// Members consider the channel dead if nothing arrives for this long. Sent in whole seconds.
    pub expiry: Duration,
    /// Members send NAKs to the channel's destination address as well as to the leader, so
    ///  that other members can suppress their own NAKs for the same range.
    pub nak_outbound: bool,
    pub nak_holdoff: Duration,
    pub nak_modulus: u16,
    pub nak_max_wait: Duration,
}

impl ChannelParams {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.expiry.as_secs().min(u8::MAX as u64) as u8);
        buf.put_u8(if self.nak_outbound { FLAG_NAK_OUTBOUND } else { 0 });
        buf.put_u16(self.nak_holdoff.as_millis().min(u16::MAX as u128) as u16);
        buf.put_u16(self.nak_modulus);
        buf.put_u16(self.nak_max_wait.as_millis().min(u16::MAX as u128) as u16);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ChannelParams> {
        let expiry = Duration::from_secs(buf.try_get_u8()? as u64);
        let flags = buf.try_get_u8()?;
        let nak_holdoff = Duration::from_millis(buf.try_get_u16()? as u64);
        let nak_modulus = buf.try_get_u16()?;
        let nak_max_wait = Duration::from_millis(buf.try_get_u16()? as u64);

        Ok(ChannelParams {
            expiry,
            nak_outbound: flags & FLAG_NAK_OUTBOUND != 0,
            nak_holdoff,
            nak_modulus,
            nak_max_wait,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let params = ChannelParams {
            expiry: Duration::from_secs(15),
            nak_outbound: true,
            nak_holdoff: Duration::from_millis(2),
            nak_modulus: 50,
            nak_max_wait: Duration::from_millis(20),
        };

        let mut buf = Vec::new();
        params.ser(&mut buf);
        assert_eq!(buf, vec![15, 0x80, 0, 2, 0, 50, 0, 20]);

        let mut b: &[u8] = &buf;
        assert_eq!(ChannelParams::try_deser(&mut b).unwrap(), params);
    }

    #[test]
    fn test_sub_second_expiry_truncates() {
        let params = ChannelParams {
            expiry: Duration::from_millis(2500),
            nak_outbound: false,
            nak_holdoff: Duration::ZERO,
            nak_modulus: 1,
            nak_max_wait: Duration::ZERO,
        };

        let mut buf = Vec::new();
        params.ser(&mut buf);
        assert_eq!(buf[0], 2);
        assert_eq!(buf[1], 0);
    }
}
