use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

use crate::config::HudpConfig;
use crate::events::{EventSink, TransportEvent};

/// Abstraction for sending a buffer on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending packet to {:?}", to);

        self.send_to(packet_buf, to).await?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// All egress goes through here - application data, ACKs and retransmissions
///  alike. This is also the single place where the egress-only testing hooks
///  (`loss_prob`, `jitter`) are applied; ingress is never tampered with.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    loss_prob: f64,
    jitter: Duration,
    events: EventSink,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, config: &HudpConfig, events: EventSink) -> SendPipeline {
        SendPipeline {
            socket,
            loss_prob: config.loss_prob,
            jitter: config.jitter,
            events,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// A failed send is logged and reported as an event, and the packet is
    ///  dropped - retransmission (reliable channel) or the application
    ///  (unreliable channel) covers for it.
    pub async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        if self.loss_prob > 0.0 && rand::random::<f64>() < self.loss_prob {
            debug!("egress loss hook: dropping {} byte packet to {:?}", packet_buf.len(), to);
            return;
        }

        if !self.jitter.is_zero() {
            let delay = self.jitter.mul_f64(rand::random::<f64>());
            let socket = self.socket.clone();
            let events = self.events.clone();
            let buf = packet_buf.to_vec();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = socket.do_send_packet(to, &buf).await {
                    error!("error sending delayed UDP packet to {:?}: {}", to, e);
                    events.emit(TransportEvent::SocketError {
                        context: format!("send_to {}: {}", to, e),
                    });
                }
            });
            return;
        }

        if let Err(e) = self.socket.do_send_packet(to, packet_buf).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
            self.events.emit(TransportEvent::SocketError {
                context: format!("send_to {}: {}", to, e),
            });
        }
    }

    pub fn report_socket_error(&self, context: impl Into<String>) {
        self.events.emit(TransportEvent::SocketError {
            context: context.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(loss_prob: f64, jitter: Duration) -> HudpConfig {
        HudpConfig {
            loss_prob,
            jitter,
            ..HudpConfig::default()
        }
    }

    #[tokio::test]
    async fn test_passes_packet_through() {
        let to = SocketAddr::from(([127, 0, 0, 1], 9));

        let mut socket = MockSendSocket::new();
        socket
            .expect_do_send_packet()
            .once()
            .withf(move |addr, buf| *addr == to && buf == [1u8, 2, 3])
            .returning(|_, _| Ok(()));

        let pipeline = SendPipeline::new(Arc::new(socket), &test_config(0.0, Duration::ZERO), EventSink::default());
        pipeline.send_packet(to, &[1, 2, 3]).await;
    }

    #[tokio::test]
    async fn test_full_loss_drops_everything() {
        let to = SocketAddr::from(([127, 0, 0, 1], 9));

        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().never();

        let pipeline = SendPipeline::new(Arc::new(socket), &test_config(1.0, Duration::ZERO), EventSink::default());
        for _ in 0..50 {
            pipeline.send_packet(to, &[1, 2, 3]).await;
        }
    }
}
