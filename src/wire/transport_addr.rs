use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum AddrType {
    Null = 0,
    Ipv4 = 1,
    Ipv6 = 2,
}

/// An address as it appears in JOIN, CHANNEL_PARAMS and SESSIONS: either 'null' (meaning
///  'the address this came from' or 'unicast to each member' depending on context) or an
///  IP socket address.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TransportAddr {
    Null,
    Ip(SocketAddr),
}

impl TransportAddr {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            TransportAddr::Null => None,
            TransportAddr::Ip(addr) => Some(*addr),
        }
    }

    pub fn is_multicast(&self) -> bool {
        match self {
            TransportAddr::Null => false,
            TransportAddr::Ip(addr) => addr.ip().is_multicast(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            TransportAddr::Null => 1,
            TransportAddr::Ip(SocketAddr::V4(_)) => 1 + 2 + 4,
            TransportAddr::Ip(SocketAddr::V6(_)) => 1 + 2 + 16,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            TransportAddr::Null => {
                buf.put_u8(AddrType::Null.into());
            }
            TransportAddr::Ip(addr) => {
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        buf.put_u8(AddrType::Ipv4.into());
                        buf.put_u16(addr.port());
                        buf.put_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        buf.put_u8(AddrType::Ipv6.into());
                        buf.put_u16(addr.port());
                        buf.put_slice(&ip.octets());
                    }
                }
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<TransportAddr> {
        let addr_type = AddrType::try_from_primitive(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid transport address type: {}", e))?;

        match addr_type {
            AddrType::Null => Ok(TransportAddr::Null),
            AddrType::Ipv4 => {
                let port = buf.try_get_u16()?;
                let ip = Ipv4Addr::from(buf.try_get_u32()?);
                Ok(TransportAddr::Ip(SocketAddr::from((ip, port))))
            }
            AddrType::Ipv6 => {
                let port = buf.try_get_u16()?;
                let ip = Ipv6Addr::from(buf.try_get_u128()?);
                Ok(TransportAddr::Ip(SocketAddr::from((ip, port))))
            }
        }
    }
}

impl From<SocketAddr> for TransportAddr {
    fn from(value: SocketAddr) -> Self {
        TransportAddr::Ip(value)
    }
}

impl From<Option<SocketAddr>> for TransportAddr {
    fn from(value: Option<SocketAddr>) -> Self {
        match value {
            Some(addr) => TransportAddr::Ip(addr),
            None => TransportAddr::Null,
        }
    }
}

impl Display for TransportAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportAddr::Null => write!(f, "<null>"),
            TransportAddr::Ip(addr) => write!(f, "{}", addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::null(TransportAddr::Null, vec![0])]
    #[case::v4(TransportAddr::Ip("239.192.0.1:5568".parse().unwrap()), vec![1, 0x15, 0xc0, 239, 192, 0, 1])]
    #[case::v6(TransportAddr::Ip("[ff18::1]:5568".parse().unwrap()), vec![2, 0x15, 0xc0, 0xff, 0x18, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1])]
    fn test_ser(#[case] addr: TransportAddr, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        addr.ser(&mut buf);
        assert_eq!(buf, expected);
        assert_eq!(addr.serialized_len(), expected.len());

        let mut b: &[u8] = &buf;
        assert_eq!(TransportAddr::try_deser(&mut b).unwrap(), addr);
    }

    #[rstest]
    #[case::unknown_type(vec![3, 0, 0])]
    #[case::truncated_v4(vec![1, 0x15, 0xc0, 10])]
    #[case::empty(vec![])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(TransportAddr::try_deser(&mut b).is_err());
    }

    #[rstest]
    #[case::null(TransportAddr::Null, false)]
    #[case::unicast(TransportAddr::Ip("10.0.0.1:5568".parse().unwrap()), false)]
    #[case::multicast(TransportAddr::Ip("239.192.0.1:5568".parse().unwrap()), true)]
    fn test_is_multicast(#[case] addr: TransportAddr, #[case] expected: bool) {
        assert_eq!(addr.is_multicast(), expected);
    }
}
