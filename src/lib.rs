//! H-UDP is a hybrid datagram transport that multiplexes two delivery services
//!  over a single UDP socket per endpoint: an *unreliable* channel that forwards
//!  datagrams best-effort with no ordering, and a *reliable* channel that
//!  provides in-order, at-most-once delivery via Selective Repeat ARQ.
//!
//! ## Design goals
//!
//! * Two channels, one socket - applications choose per send whether a payload
//!   is worth retransmitting or is stale the moment a newer one exists
//! * The abstraction is sending / receiving *datagrams* (defined-length chunks
//!   of data as opposed to streams of bytes). Payloads are never fragmented;
//!   callers stay under the configured MTU
//! * Reliable delivery is per-packet: each sequence is individually
//!   acknowledged and individually retransmitted - no cumulative ACKs
//! * Bounded head-of-line blocking rather than maximum delivery reliability:
//!   a sequence that stays missing past a configurable timeout is skipped,
//!   and the stream continues with fresh data. Skipped packets are lost to
//!   the application but never silently - the transport reports every skip
//! * A server multiplexes many clients over one socket, with fully
//!   independent per-peer sequence spaces, created on first contact
//! * No handshake, no encryption, no congestion control, no adaptive RTO -
//!   these are deliberate non-goals, not omissions
//!
//! ## Header
//!
//! Packet header (inside a UDP packet) - all numbers in network byte order (BE):
//! ```ascii
//! 0:  channel (u8): 0 = UNRELIABLE, 1 = RELIABLE
//! 1:  flags (u8): bit 0 = ACK, bit 1 = NACK (reserved, never sent),
//!      bit 2 = RETX, others 0
//! 2:  packet sequence number (u16): per channel, per direction, per peer.
//!      Sequence numbers are wrap-around, so 0 follows after FFFF
//! 4:  sender timestamp (u32): the sender's monotonic millisecond clock at
//!      transmission time, truncated to 32 bits. Opaque to the receiver
//! 8:  payload (0 .. MTU-8 bytes)
//! ```
//!
//! ACK packets are exactly 8 bytes: header with the ACK flag, the acknowledged
//!  sequence number, no payload, always on the reliable channel. Every received
//!  reliable data packet is answered by exactly one ACK per arrival - including
//!  duplicates, which keeps the ACK policy stateless.
//!
//! RTT is measured on the data sender's own clock at ACK arrival; the
//!  timestamp inside an ACK is observability only, and no cross-clock
//!  arithmetic is ever attempted.
//!
//! ## Reliability
//!
//! The sender keeps every unacknowledged packet in an in-flight table, capped
//!  at the send window size. When the window is full, `send` suspends until
//!  an ACK (or a retransmission-budget drop) frees a slot. Each in-flight
//!  sequence has a fixed-timeout retransmission deadline; a packet that
//!  exhausts `max_retx` retransmissions is dropped with an observable event,
//!  and the original caller - whose `send` completed when the packet first
//!  reached the socket - is not re-notified.
//!
//! The receiver delivers in sequence order, buffering out-of-order arrivals
//!  up to the receive window. A missing sequence blocks delivery for at most
//!  `gap_skip_timeout`; after that the cursor jumps to the next buffered
//!  sequence and the skipped range is gone from the reliable stream.
//!
//! ## Related:
//! * TCP
//!   * stream oriented, cumulative ACKs, unbounded head-of-line blocking
//!   * retransmits forever; H-UDP trades completeness for bounded latency
//! * QUIC
//!   * connection based - initial handshake, enforced encryption
//!   * far richer machinery (streams, flow control) than two fixed channels
//! * SRT / UDT
//!   * similar skip-on-timeout philosophy for live media
//!   * congestion control and rate shaping, which H-UDP deliberately omits

mod clock;
pub mod config;
pub mod dispatch;
pub mod end_point;
pub mod error;
pub mod events;
mod packet_header;
mod recv_channel;
mod send_channel;
mod send_pipeline;
pub mod seq;
pub mod stats;

pub use config::HudpConfig;
pub use dispatch::{Delivery, PacketDispatcher};
pub use end_point::{EndPoint, HudpClient, HudpServer};
pub use error::SendError;
pub use events::{EventObserver, TransportEvent};
pub use packet_header::{Channel, PacketFlags, PacketHeader};
pub use seq::SeqNr;
pub use stats::StatsSnapshot;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
