use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

use crate::clock::MonotonicClock;
use crate::config::HudpConfig;
use crate::dispatch::{Delivery, PacketDispatcher};
use crate::error::SendError;
use crate::events::{EventObserver, EventSink, TransportEvent};
use crate::packet_header::{Channel, PacketHeader};
use crate::recv_channel::RecvChannel;
use crate::send_channel::SendChannel;
use crate::send_pipeline::SendPipeline;
use crate::stats::{StatsSnapshot, TransportStats};

/// Cadence of the receiver-side gap scanner.
const GAP_SCAN_INTERVAL: Duration = Duration::from_millis(50);

/// Per-remote-address engine pair. Created lazily on first contact (inbound
///  or outbound) and kept until the transport shuts down.
struct Peer {
    send: SendChannel,
    recv: RecvChannel,
}

struct EndPointShared {
    config: Arc<HudpConfig>,
    socket: Arc<UdpSocket>,
    pipeline: SendPipeline,
    clock: Arc<MonotonicClock>,
    events: EventSink,
    stats: Arc<TransportStats>,
    dispatcher: Arc<dyn PacketDispatcher>,
    peers: RwLock<FxHashMap<SocketAddr, Arc<Peer>>>,
}

impl EndPointShared {
    async fn get_or_create_peer(&self, addr: SocketAddr) -> Arc<Peer> {
        if let Some(peer) = self.peers.read().await.get(&addr) {
            return peer.clone();
        }

        let mut peers = self.peers.write().await;
        // racing creators resolve to whichever entry landed first
        if let Some(peer) = peers.get(&addr) {
            return peer.clone();
        }

        debug!("first contact with {:?} - initializing peer state", addr);
        let send = SendChannel::new(
            self.config.clone(),
            addr,
            self.pipeline.clone(),
            self.clock.clone(),
            self.events.clone(),
            self.stats.clone(),
        );
        send.spawn_active_loop();

        let recv = RecvChannel::new(
            self.config.clone(),
            addr,
            self.pipeline.clone(),
            self.clock.clone(),
            self.events.clone(),
            self.stats.clone(),
            self.dispatcher.clone(),
        );

        let peer = Arc::new(Peer { send, recv });
        peers.insert(addr, peer.clone());
        peer
    }

    /// Ingress loop: decode, then dispatch by flags and channel into the
    ///  originating peer's engines. Malformed packets are dropped silently;
    ///  socket errors are reported and the loop keeps going.
    async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop on {:?}", self.socket.local_addr().ok());

        let mut buf = vec![0u8; 65536];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error receiving datagram: {}", e);
                    self.pipeline.report_socket_error(format!("recv_from: {}", e));
                    continue;
                }
            };

            let mut parse_buf = &buf[..len];
            let header = match PacketHeader::deser(&mut parse_buf) {
                Ok(header) => header,
                Err(_) => {
                    debug!("received malformed packet ({} bytes) from {:?} - dropping", len, from);
                    continue;
                }
            };
            trace!("received packet from {:?}: {:?}", from, header);

            if header.is_ack() {
                if !parse_buf.is_empty() {
                    debug!("ACK from {:?} carries {} payload bytes - ignoring them", from, parse_buf.len());
                }
                self.get_or_create_peer(from).await.send.on_ack(header.seq).await;
                continue;
            }

            match header.channel {
                Channel::Reliable => {
                    let payload = Bytes::copy_from_slice(parse_buf);
                    self.get_or_create_peer(from)
                        .await
                        .recv
                        .on_data_packet(&header, payload)
                        .await;
                }
                Channel::Unreliable => {
                    // stateless pass-through: no ACK, no buffering, no dedup
                    let payload = Bytes::copy_from_slice(parse_buf);
                    self.stats.rx_total.fetch_add(1, Ordering::Relaxed);
                    self.stats.rx_unreliable.fetch_add(1, Ordering::Relaxed);
                    self.events.emit(TransportEvent::RxData {
                        channel: Channel::Unreliable,
                        seq: header.seq,
                        ts_ms: header.ts_ms,
                    });

                    self.dispatcher
                        .on_packet(
                            from,
                            Delivery {
                                channel: Channel::Unreliable,
                                seq: header.seq,
                                ts_ms: header.ts_ms,
                                rtt_ms: None,
                                payload,
                                skipped: false,
                            },
                        )
                        .await;

                    self.events.emit(TransportEvent::Deliver {
                        channel: Channel::Unreliable,
                        seq: header.seq,
                        in_order: false,
                        skipped: false,
                    });
                }
            }
        }
    }

    /// Periodically gives every peer's receiver a chance to skip a gap that
    ///  has outlived its timeout.
    async fn gap_scan_loop(self: Arc<Self>) {
        let mut scan_interval = interval(GAP_SCAN_INTERVAL);
        loop {
            scan_interval.tick().await;

            let peers = self
                .peers
                .read()
                .await
                .values()
                .cloned()
                .collect::<Vec<_>>();
            for peer in peers {
                peer.recv.check_gap().await;
            }
        }
    }
}

/// The place where all parts of the transport come together: it owns the UDP
///  socket, feeds inbound datagrams to the per-peer engines, and routes
///  outbound sends. One `EndPoint` serves both roles - a client is an
///  endpoint that only ever talks to one peer.
pub struct EndPoint {
    shared: Arc<EndPointShared>,
    recv_handle: Mutex<Option<JoinHandle<()>>>,
    scan_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EndPoint {
    pub async fn new(
        bind_addr: SocketAddr,
        dispatcher: Arc<dyn PacketDispatcher>,
        observer: Option<Arc<dyn EventObserver>>,
        config: HudpConfig,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;
        let config = Arc::new(config);

        let socket = Arc::new(Self::bind_socket(bind_addr, &config)?);
        info!("bound socket to {:?}", socket.local_addr()?);

        let events = EventSink::new(observer);
        let shared = Arc::new(EndPointShared {
            pipeline: SendPipeline::new(Arc::new(socket.clone()), &config, events.clone()),
            config,
            socket,
            clock: Arc::new(MonotonicClock::new()),
            events,
            stats: Arc::new(TransportStats::default()),
            dispatcher,
            peers: RwLock::new(FxHashMap::default()),
        });

        let end_point = EndPoint {
            recv_handle: Mutex::new(Some(tokio::spawn(shared.clone().recv_loop()))),
            scan_handle: Mutex::new(Some(tokio::spawn(shared.clone().gap_scan_loop()))),
            shared,
            closed: AtomicBool::new(false),
        };
        Ok(end_point)
    }

    fn bind_socket(bind_addr: SocketAddr, config: &HudpConfig) -> anyhow::Result<UdpSocket> {
        let domain = if bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .context("creating UDP socket")?;

        // best effort - some platforms cap these below the requested size
        if let Err(e) = socket.set_recv_buffer_size(config.socket_rcvbuf) {
            warn!("could not set socket receive buffer to {}: {}", config.socket_rcvbuf, e);
        }
        if let Err(e) = socket.set_send_buffer_size(config.socket_sndbuf) {
            warn!("could not set socket send buffer to {}: {}", config.socket_sndbuf, e);
        }

        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("binding UDP socket to {:?}", bind_addr))?;
        socket.set_nonblocking(true)?;

        UdpSocket::from_std(socket.into()).context("registering socket with the runtime")
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.pipeline.local_addr()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Sends a payload to a peer on the chosen channel, with the per-channel
    ///  contracts of [`SendChannel`].
    pub async fn send_to(&self, to: SocketAddr, payload: Bytes, reliable: bool) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }

        let peer = self.shared.get_or_create_peer(to).await;
        if reliable {
            peer.send.send_reliable(payload).await
        }
        else {
            peer.send.send_unreliable(payload).await
        }
    }

    /// Stops the ingress loop and the gap scanner, cancels every peer's
    ///  retransmission timers and fails suspended senders with `Closed`.
    ///  Idempotent.
    pub async fn close(&self) {
        self.shutdown();

        for peer in self.shared.peers.read().await.values() {
            peer.send.close();
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.recv_handle.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.scan_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Client-side handle: one socket, one implicit peer (the server).
pub struct HudpClient {
    end_point: EndPoint,
    server_addr: SocketAddr,
}

impl HudpClient {
    pub async fn connect(
        server_addr: SocketAddr,
        dispatcher: Arc<dyn PacketDispatcher>,
        observer: Option<Arc<dyn EventObserver>>,
        config: HudpConfig,
    ) -> anyhow::Result<HudpClient> {
        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        }
        else {
            "[::]:0".parse().expect("valid wildcard address")
        };

        Ok(HudpClient {
            end_point: EndPoint::new(bind_addr, dispatcher, observer, config).await?,
            server_addr,
        })
    }

    pub async fn send(&self, payload: Bytes, reliable: bool) -> Result<(), SendError> {
        self.end_point.send_to(self.server_addr, payload, reliable).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.end_point.local_addr()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.end_point.stats()
    }

    pub async fn close(&self) {
        self.end_point.close().await;
    }
}

/// Server-side handle: one socket shared by all peers, with per-peer state
///  created on first contact.
pub struct HudpServer {
    end_point: EndPoint,
}

impl HudpServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        dispatcher: Arc<dyn PacketDispatcher>,
        observer: Option<Arc<dyn EventObserver>>,
        config: HudpConfig,
    ) -> anyhow::Result<HudpServer> {
        Ok(HudpServer {
            end_point: EndPoint::new(bind_addr, dispatcher, observer, config).await?,
        })
    }

    pub async fn send_to(&self, to: SocketAddr, payload: Bytes, reliable: bool) -> Result<(), SendError> {
        self.end_point.send_to(to, payload, reliable).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.end_point.local_addr()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.end_point.stats()
    }

    pub async fn close(&self) {
        self.end_point.close().await;
    }
}
