use std::time::Duration;

use anyhow::bail;

use crate::packet_header::PacketHeader;

/// Transport configuration. `Default` gives values suitable for a LAN or
///  loopback path; `validate()` is called at transport construction.
#[derive(Clone, Debug)]
pub struct HudpConfig {
    /// Maximum total packet size on the wire (header plus payload). H-UDP does
    ///  not fragment: callers must keep payloads at or below `mtu - 8`.
    ///
    /// Path MTU discovery does not work reliably across arbitrary networks, so
    ///  the value is configured rather than probed. The default of 1200 leaves
    ///  headroom below common 1500-byte Ethernet paths even with tunneling
    ///  overhead on the route.
    pub mtu: usize,

    /// Fixed retransmission timeout for unacknowledged reliable packets.
    ///  There is no adaptive RTO.
    pub retx_timeout: Duration,

    /// Maximum number of unacknowledged reliable packets in flight. Senders
    ///  suspend when the window is full. Must stay below half the sequence
    ///  space (2^15) for wraparound arithmetic to be unambiguous.
    pub send_window_size: u16,

    /// Maximum range of out-of-order reliable sequences buffered above the
    ///  receiver's delivery cursor. Same upper bound as the send window.
    pub recv_window_size: u16,

    /// Number of retransmissions before a reliable packet is dropped from the
    ///  send buffer (with an observable event, not an error to the caller).
    pub max_retx: u32,

    /// How long the receiver waits on a missing sequence before skipping past
    ///  it and delivering what is buffered.
    pub gap_skip_timeout: Duration,

    /// OS-level socket receive buffer (SO_RCVBUF).
    pub socket_rcvbuf: usize,
    /// OS-level socket send buffer (SO_SNDBUF).
    pub socket_sndbuf: usize,

    /// Egress-only drop probability, for testing. Ingress is never tampered with.
    pub loss_prob: f64,
    /// Egress-only maximum uniform extra delay, for testing.
    pub jitter: Duration,
}

impl Default for HudpConfig {
    fn default() -> HudpConfig {
        HudpConfig {
            mtu: 1200,
            retx_timeout: Duration::from_millis(200),
            send_window_size: 64,
            recv_window_size: 64,
            max_retx: 10,
            gap_skip_timeout: Duration::from_millis(200),
            socket_rcvbuf: 1 << 20,
            socket_sndbuf: 1 << 20,
            loss_prob: 0.0,
            jitter: Duration::ZERO,
        }
    }
}

impl HudpConfig {
    const MAX_WINDOW_SIZE: u16 = 1 << 15;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu <= PacketHeader::SERIALIZED_LEN {
            bail!("mtu of {} leaves no room for payload after the {} byte header", self.mtu, PacketHeader::SERIALIZED_LEN);
        }
        if self.send_window_size == 0 || self.send_window_size >= Self::MAX_WINDOW_SIZE {
            bail!("send window size must be in [1, 2^15), was {}", self.send_window_size);
        }
        if self.recv_window_size == 0 || self.recv_window_size >= Self::MAX_WINDOW_SIZE {
            bail!("receive window size must be in [1, 2^15), was {}", self.recv_window_size);
        }
        if !(0.0..=1.0).contains(&self.loss_prob) {
            bail!("loss probability must be in [0, 1], was {}", self.loss_prob);
        }
        Ok(())
    }

    /// The biggest payload that fits a single packet under the configured MTU.
    pub fn max_payload_len(&self) -> usize {
        self.mtu - PacketHeader::SERIALIZED_LEN
    }
}
