use thiserror::Error;

/// Errors surfaced to callers of `send`.
///
/// Everything else that can go wrong - malformed ingress, transient socket
/// errors, a packet exhausting its retransmissions - is observable through
/// the event stream but intentionally not an error: the transport keeps
/// running, and the caller of `send` was already told the packet was handed
/// to the socket.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("payload of {payload_len} bytes does not fit the configured mtu of {mtu} (8 byte header)")]
    PayloadTooLarge { payload_len: usize, mtu: usize },

    /// The caller was cancelled while suspended on a full send window. The
    /// window slot is released and nothing was transmitted.
    #[error("send cancelled while waiting for send window capacity")]
    BackpressureCancelled,

    #[error("transport is closed")]
    Closed,
}
