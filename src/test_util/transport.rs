use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use bytes::Bytes;

use crate::sdt::transport::DatagramTransport;
use crate::wire::cid::Cid;
use crate::wire::pdu::PduBlockReader;
use crate::wire::root_layer::parse_datagram;
use crate::wire::sdt_messages::{SdtMessage, WrapperData};

#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub to: SocketAddr,
    pub data: Bytes,
}
impl SentDatagram {
    /// all SDT messages in the datagram with their sender, panicking if anything is malformed
    pub fn messages(&self) -> Vec<(Cid, SdtMessage)> {
        let mut result = Vec::new();
        for payload in parse_datagram(self.data.clone()).expect("malformed root layer") {
            for pdu in PduBlockReader::new(payload.data, 1, 0) {
                let msg = SdtMessage::try_deser(pdu.expect("malformed SDT PDU"))
                    .expect("malformed SDT message");
                result.push((payload.sender, msg));
            }
        }
        result
    }

    pub fn wrappers(&self) -> Vec<WrapperData> {
        self.messages().into_iter()
            .filter_map(|(_, msg)| match msg {
                SdtMessage::Wrapper(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn wrapper(&self) -> WrapperData {
        match self.wrappers().into_iter().next() {
            Some(wrapper) => wrapper,
            None => panic!("no wrapper in datagram to {}", self.to),
        }
    }
}

/// Records sent datagrams instead of sending them
#[derive(Debug, Default)]
pub struct TrackingDatagramTransport {
    sent: Mutex<Vec<SentDatagram>>,
    multicast_groups: Mutex<BTreeSet<IpAddr>>,
}
impl TrackingDatagramTransport {
    pub fn take_sent(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// removes and returns datagrams for which `filter` returns true, leaving all others
    pub fn take_sent_where(&self, filter: impl Fn(&SentDatagram) -> bool) -> Vec<SentDatagram> {
        let mut sent = self.sent.lock().unwrap();
        let (taken, kept) = sent.drain(..).partition(|d| filter(d));
        *sent = kept;
        taken
    }

    pub fn multicast_groups(&self) -> Vec<IpAddr> {
        self.multicast_groups.lock().unwrap()
            .iter()
            .copied()
            .collect()
    }
}

impl DatagramTransport for TrackingDatagramTransport {
    fn send_to(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        self.sent.lock().unwrap()
            .push(SentDatagram { to, data: Bytes::copy_from_slice(datagram) });
        Ok(())
    }

    fn join_multicast(&self, group: IpAddr) -> anyhow::Result<()> {
        self.multicast_groups.lock().unwrap().insert(group);
        Ok(())
    }

    fn leave_multicast(&self, group: IpAddr) -> anyhow::Result<()> {
        self.multicast_groups.lock().unwrap().remove(&group);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_sent_where_keeps_others() {
        let transport = TrackingDatagramTransport::default();
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.2:1".parse().unwrap();
        transport.send_to(a, b"1").unwrap();
        transport.send_to(b, b"2").unwrap();
        transport.send_to(a, b"3").unwrap();

        let to_a = transport.take_sent_where(|d| d.to == a);
        assert_eq!(to_a.iter().map(|d| d.data.clone()).collect::<Vec<_>>(), vec![Bytes::from_static(b"1"), Bytes::from_static(b"3")]);
        assert_eq!(transport.take_sent().len(), 1);
        assert!(transport.take_sent().is_empty());
    }
}
