use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// The engine's view of datagram I/O. Sending is synchronous: SDT never waits for a socket to
///  become writable, a datagram that can not be sent right away is lost like any other.
#[cfg_attr(test, automock)]
pub trait DatagramTransport: Send + Sync {
    fn send_to(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()>;

    fn join_multicast(&self, group: IpAddr) -> anyhow::Result<()>;

    fn leave_multicast(&self, group: IpAddr) -> anyhow::Result<()>;
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}
impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> UdpTransport {
        UdpTransport { socket }
    }
}

impl DatagramTransport for UdpTransport {
    fn send_to(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        trace!("sending {} bytes to {:?}", datagram.len(), to);
        self.socket.try_send_to(datagram, to)?;
        Ok(())
    }

    fn join_multicast(&self, group: IpAddr) -> anyhow::Result<()> {
        debug!("joining multicast group {}", group);
        match group {
            IpAddr::V4(group) => self.socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(group) => self.socket.join_multicast_v6(&group, 0)?,
        }
        Ok(())
    }

    fn leave_multicast(&self, group: IpAddr) -> anyhow::Result<()> {
        debug!("leaving multicast group {}", group);
        match group {
            IpAddr::V4(group) => self.socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(group) => self.socket.leave_multicast_v6(&group, 0)?,
        }
        Ok(())
    }
}
