use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::packet_header::Channel;
use crate::seq::SeqNr;

/// A payload handed to the application, together with its delivery metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub channel: Channel,
    pub seq: SeqNr,
    /// The sender's wire timestamp, opaque to the receiver.
    pub ts_ms: u32,
    /// Best-effort RTT estimate of this transport, reliable channel only.
    pub rtt_ms: Option<u64>,
    pub payload: Bytes,
    /// `true` for the first delivery after a gap skip.
    pub skipped: bool,
}

/// Receive-side seam between the transport and the application.
///
/// Invoked on the transport's scheduler: implementations must hand the
/// delivery off (queue, channel, ...) rather than block, or they stall
/// ingress for every peer on the socket.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketDispatcher: Send + Sync + 'static {
    async fn on_packet(&self, from: SocketAddr, delivery: Delivery);
}
