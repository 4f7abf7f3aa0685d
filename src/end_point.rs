//! Runs an [SdtEngine] on a UDP socket.
//!
//! The engine itself is synchronous and single-threaded. [SdtEndPoint::run] owns it and loops
//!  over received datagrams, due timers and requests from the application, which arrive
//!  through an [SdtHandle] as closures executed on the engine.

use std::future::pending;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::sdt::channel::LocalChannelKey;
use crate::sdt::client::{ChannelRequestHandler, ClientProtocolHandler};
use crate::sdt::config::SdtConfig;
use crate::sdt::engine::SdtEngine;
use crate::sdt::events::{SdtEvent, SdtEventNotifier};
use crate::sdt::member::MemberKey;
use crate::sdt::transport::UdpTransport;
use crate::wire::channel_params::ChannelParams;
use crate::wire::cid::Cid;
use crate::wire::reason_code::ReasonCode;
use crate::wire::transport_addr::TransportAddr;

type EngineCall = Box<dyn FnOnce(&mut SdtEngine, Instant) + Send>;

enum Command {
    Run(EngineCall),
    Shutdown,
}

pub struct SdtEndPoint {
    engine: SdtEngine,
    socket: Arc<UdpSocket>,
    commands: mpsc::Receiver<Command>,
    max_packet_size: usize,
}

impl SdtEndPoint {
    pub async fn new(config: SdtConfig, channel_request_handler: Box<dyn ChannelRequestHandler>) -> anyhow::Result<(SdtEndPoint, SdtHandle)> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("SDT end point bound to {}", local_addr);

        let max_packet_size = config.max_packet_size;
        let events = SdtEventNotifier::new();
        let engine = SdtEngine::new(
            Arc::new(config),
            Arc::new(UdpTransport::new(socket.clone())),
            events.clone(),
            channel_request_handler,
        )?;
        let (sender, commands) = mpsc::channel(64);

        let end_point = SdtEndPoint {
            engine,
            socket,
            commands,
            max_packet_size,
        };
        let handle = SdtHandle {
            commands: sender,
            events,
            local_addr,
        };
        Ok((end_point, handle))
    }

    /// Processes datagrams, timers and application requests until it is shut down through a
    ///  handle, or all handles are dropped. Local components are removed on the way out, which
    ///  tells their peers.
    pub async fn run(self) {
        let SdtEndPoint { mut engine, socket, mut commands, max_packet_size } = self;
        let mut receive_buffer = vec![0u8; max_packet_size + 1];

        loop {
            let next_deadline = engine.next_deadline();
            select! {
                recv_result = socket.recv_from(&mut receive_buffer) => {
                    match recv_result {
                        Ok((len, from)) => {
                            if len > max_packet_size {
                                warn!("received datagram from {} exceeds the maximum packet size - skipping", from);
                                continue;
                            }
                            engine.on_datagram(from, Bytes::copy_from_slice(&receive_buffer[..len]), Instant::now());
                        }
                        Err(e) => {
                            error!("error receiving UDP datagram: {}", e);
                        }
                    }
                }
                _ = sleep_until_deadline(next_deadline) => {
                    engine.on_timers_due(Instant::now());
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Run(f)) => f(&mut engine, Instant::now()),
                        Some(Command::Shutdown) | None => break,
                    }
                }
            }
        }

        info!("shutting down SDT end point");
        let now = Instant::now();
        for cid in engine.local_components() {
            if let Err(e) = engine.remove_local_component(cid, now) {
                warn!("error removing local component {}: {}", cid, e);
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// The application's access to a running [SdtEndPoint]
#[derive(Clone)]
pub struct SdtHandle {
    commands: mpsc::Sender<Command>,
    events: SdtEventNotifier,
    local_addr: SocketAddr,
}

impl SdtHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SdtEvent> {
        self.events.subscribe()
    }

    /// Runs `f` on the engine and returns its result
    pub async fn call<T: Send + 'static>(&self, f: impl FnOnce(&mut SdtEngine, Instant) -> T + Send + 'static) -> anyhow::Result<T> {
        let (sender, receiver) = oneshot::channel();
        let call: EngineCall = Box::new(move |engine, now| {
            let _ = sender.send(f(engine, now));
        });
        self.commands.send(Command::Run(call)).await
            .map_err(|_| anyhow!("SDT end point is shut down"))?;
        receiver.await
            .map_err(|_| anyhow!("SDT end point is shut down"))
    }

    /// adds a component that is reachable at the end point's own address
    pub async fn add_local_component(&self, cid: Cid, listening: bool) -> anyhow::Result<()> {
        let adhoc_addr = self.local_addr;
        self.call(move |engine, _| engine.add_local_component(cid, adhoc_addr, listening)).await?
    }

    pub async fn register_client_protocol(&self, protocol: u32, handler: Box<dyn ClientProtocolHandler>) -> anyhow::Result<()> {
        self.call(move |engine, _| engine.register_client_protocol(protocol, handler)).await?
    }

    pub async fn open_local_channel(&self, owner: Cid, dest_addr: TransportAddr, params: Option<ChannelParams>, hold_open: bool) -> anyhow::Result<LocalChannelKey> {
        self.call(move |engine, _| engine.open_local_channel(owner, dest_addr, params, hold_open)).await?
    }

    pub async fn close_local_channel(&self, channel: LocalChannelKey, reason: ReasonCode) -> anyhow::Result<()> {
        self.call(move |engine, now| engine.close_local_channel(channel, reason, now)).await?
    }

    pub async fn add_member(&self, channel: LocalChannelKey, remote: Cid, remote_addr: SocketAddr) -> anyhow::Result<MemberKey> {
        self.call(move |engine, now| engine.add_member(channel, remote, remote_addr, now)).await?
    }

    pub async fn remove_member(&self, member: MemberKey, reason: ReasonCode) -> anyhow::Result<()> {
        self.call(move |engine, now| engine.remove_member(member, reason, now)).await?
    }

    pub async fn connect(&self, member: MemberKey, protocol: u32) -> anyhow::Result<()> {
        self.call(move |engine, now| engine.connect(member, protocol, now)).await?
    }

    pub async fn disconnect(&self, member: MemberKey, protocol: u32) -> anyhow::Result<()> {
        self.call(move |engine, now| engine.disconnect(member, protocol, now)).await?
    }

    pub async fn send_to_member(&self, member: MemberKey, protocol: u32, data: Bytes, reliable: bool) -> anyhow::Result<()> {
        self.call(move |engine, now| engine.send_to_member(member, protocol, &data, reliable, now)).await?
    }

    pub async fn request_sessions(&self, local: Cid, remote: Cid, remote_addr: SocketAddr) -> anyhow::Result<()> {
        self.call(move |engine, _| engine.request_sessions(local, remote, remote_addr)).await?
    }

    pub async fn shutdown(&self) {
        debug!("requesting SDT end point shutdown");
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::sdt::client::AutoJoin;
    use crate::sdt::events::LeaveCause;

    fn config() -> SdtConfig {
        SdtConfig::new("127.0.0.1:0".parse().unwrap())
    }

    async fn next_matching(events: &mut broadcast::Receiver<SdtEvent>, f: impl Fn(&SdtEvent) -> bool) -> SdtEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if f(&event) {
                    return event;
                }
            }
        }).await.unwrap()
    }

    #[tokio::test]
    async fn test_join_and_leave_over_udp() {
        let (end_point_a, a) = SdtEndPoint::new(config(), Box::new(AutoJoin)).await.unwrap();
        let (end_point_b, b) = SdtEndPoint::new(config(), Box::new(AutoJoin)).await.unwrap();
        tokio::spawn(end_point_a.run());
        tokio::spawn(end_point_b.run());

        let (cid_a, cid_b) = (Cid::new_random(), Cid::new_random());
        a.add_local_component(cid_a, true).await.unwrap();
        b.add_local_component(cid_b, true).await.unwrap();
        let mut events_a = a.subscribe();
        let mut events_b = b.subscribe();

        let channel = a.open_local_channel(cid_a, TransportAddr::Null, None, true).await.unwrap();
        let member = a.add_member(channel, cid_b, b.local_addr()).await.unwrap();

        match next_matching(&mut events_a, |e| matches!(e, SdtEvent::MemberJoined(_))).await {
            SdtEvent::MemberJoined(data) => {
                assert_eq!(data.member, member);
                assert_eq!(data.remote_component, cid_b);
            }
            _ => unreachable!(),
        }
        next_matching(&mut events_b, |e| matches!(e, SdtEvent::MemberJoined(_))).await;

        a.remove_member(member, ReasonCode::Nonspecific).await.unwrap();
        match next_matching(&mut events_b, |e| matches!(e, SdtEvent::MemberLeft(_))).await {
            SdtEvent::MemberLeft(data) => assert_eq!(data.member.remote_component, cid_a),
            _ => unreachable!(),
        }

        a.shutdown().await;
        b.shutdown().await;
        assert!(a.add_member(channel, cid_b, b.local_addr()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_retries_run_on_timers() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (end_point, a) = SdtEndPoint::new(config(), Box::new(AutoJoin)).await.unwrap();
        tokio::spawn(end_point.run());

        let cid = Cid::new_random();
        a.add_local_component(cid, true).await.unwrap();
        let mut events = a.subscribe();
        let channel = a.open_local_channel(cid, TransportAddr::Null, None, true).await.unwrap();

        let start = Instant::now();
        a.add_member(channel, Cid::new_random(), silent.local_addr().unwrap()).await.unwrap();

        // JOIN is re-sent after 200, 400 and 800ms, then given up after another 1.6s
        match next_matching(&mut events, |e| matches!(e, SdtEvent::MemberLeft(_))).await {
            SdtEvent::MemberLeft(data) => assert_eq!(data.cause, LeaveCause::JoinFailed),
            _ => unreachable!(),
        }
        assert!(Instant::now() - start >= Duration::from_millis(3_000));
        a.shutdown().await;
    }
}
