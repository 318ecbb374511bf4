use std::sync::Arc;

#[cfg(test)] use mockall::automock;

use crate::packet_header::Channel;
use crate::seq::SeqNr;

/// Observable transport events, reported through an optional [`EventObserver`].
///
/// These exist for instrumentation and tests; none of them carry payload
/// bytes, and emitting them never changes protocol behavior.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// A data packet left for the socket (initial transmission or retransmission).
    TxData {
        channel: Channel,
        seq: SeqNr,
        ts_ms: u32,
        bytes: usize,
        retx: bool,
    },
    /// A data packet arrived from the socket.
    RxData {
        channel: Channel,
        seq: SeqNr,
        ts_ms: u32,
    },
    /// An ACK was emitted for a received reliable data packet.
    AckTx { seq: SeqNr },
    /// An ACK arrived for an in-flight reliable packet. The RTT is measured
    ///  on the sender's own clock; the ACK's timestamp field is opaque.
    AckRx { seq: SeqNr, rtt_ms: u64 },
    /// A reliable packet was retransmitted for the `count`th time.
    Retx { seq: SeqNr, count: u32 },
    /// A payload was handed to the application.
    Deliver {
        channel: Channel,
        seq: SeqNr,
        in_order: bool,
        skipped: bool,
    },
    /// The receiver gave up waiting on a gap and advanced its cursor.
    SkipGap {
        from_seq: SeqNr,
        to_seq: SeqNr,
        waited_ms: u64,
    },
    /// A reliable packet exhausted its retransmissions and was dropped from
    ///  the send buffer. The original `send` caller is not notified.
    DropMaxRetx { seq: SeqNr },
    /// A transient socket error; the transport keeps running.
    SocketError { context: String },
}

#[cfg_attr(test, automock)]
pub trait EventObserver: Send + Sync + 'static {
    fn on_event(&self, event: &TransportEvent);
}

/// Fan-out point for event emission; cloned into every engine.
#[derive(Clone, Default)]
pub struct EventSink {
    observer: Option<Arc<dyn EventObserver>>,
}

impl EventSink {
    pub fn new(observer: Option<Arc<dyn EventObserver>>) -> EventSink {
        EventSink { observer }
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }
}
