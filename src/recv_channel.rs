use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::clock::MonotonicClock;
use crate::config::HudpConfig;
use crate::dispatch::{Delivery, PacketDispatcher};
use crate::events::{EventSink, TransportEvent};
use crate::packet_header::{Channel, PacketHeader};
use crate::send_pipeline::SendPipeline;
use crate::seq::SeqNr;
use crate::stats::TransportStats;

/// An out-of-order reliable packet parked until the sequences before it arrive
///  or are skipped.
struct BufferedPacket {
    payload: Bytes,
    ts_ms: u32,
}

struct RecvChannelInner {
    config: Arc<HudpConfig>,
    peer_addr: SocketAddr,
    pipeline: SendPipeline,
    clock: Arc<MonotonicClock>,
    events: EventSink,
    stats: Arc<TransportStats>,
    dispatcher: Arc<dyn PacketDispatcher>,

    /// next sequence to deliver
    expected: SeqNr,
    /// buffered sequences strictly above `expected`, within the receive window
    buffer: FxHashMap<SeqNr, BufferedPacket>,
    /// when `expected` first became a gap; unset while nothing is buffered
    gap_first_seen_ms: Option<u64>,
}

impl RecvChannelInner {
    async fn send_ack(&self, seq: SeqNr) {
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN);
        PacketHeader::new_ack(seq, self.clock.wire_ts()).ser(&mut buf);

        self.pipeline.send_packet(self.peer_addr, &buf).await;
        self.events.emit(TransportEvent::AckTx { seq });
    }

    async fn deliver(&self, seq: SeqNr, ts_ms: u32, payload: Bytes, in_order: bool, skipped: bool) {
        self.dispatcher
            .on_packet(
                self.peer_addr,
                Delivery {
                    channel: Channel::Reliable,
                    seq,
                    ts_ms,
                    rtt_ms: self.stats.rtt_mean_ms(),
                    payload,
                    skipped,
                },
            )
            .await;

        self.events.emit(TransportEvent::Deliver {
            channel: Channel::Reliable,
            seq,
            in_order,
            skipped,
        });
    }

    /// Delivers every buffered sequence contiguous with `expected`, advancing
    ///  the cursor.
    async fn drain_in_order(&mut self) {
        while let Some(packet) = self.buffer.remove(&self.expected) {
            let seq = self.expected;
            self.expected = seq.next();
            self.deliver(seq, packet.ts_ms, packet.payload, true, false).await;
        }
    }

    /// Gap bookkeeping after the buffers changed: a non-empty buffer means
    ///  `expected` is missing, and the age of that gap starts counting when it
    ///  is first observed.
    fn update_gap_marker(&mut self) {
        if self.buffer.is_empty() {
            self.gap_first_seen_ms = None;
        }
        else if self.gap_first_seen_ms.is_none() {
            self.gap_first_seen_ms = Some(self.clock.now_ms());
        }
    }

    /// The smallest buffered sequence strictly above `expected`, probing the
    ///  receive window in serial order.
    fn next_buffered_above_expected(&self) -> Option<SeqNr> {
        for i in 1..self.config.recv_window_size {
            let candidate = self.expected + i;
            if self.buffer.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Per-peer receiver engine for the reliable channel: acknowledges every
///  arrival, delivers in order, buffers out-of-order sequences, and skips
///  past persistent gaps so head-of-line blocking stays bounded.
pub struct RecvChannel {
    inner: Arc<RwLock<RecvChannelInner>>,
}

impl RecvChannel {
    pub fn new(
        config: Arc<HudpConfig>,
        peer_addr: SocketAddr,
        pipeline: SendPipeline,
        clock: Arc<MonotonicClock>,
        events: EventSink,
        stats: Arc<TransportStats>,
        dispatcher: Arc<dyn PacketDispatcher>,
    ) -> RecvChannel {
        RecvChannel {
            inner: Arc::new(RwLock::new(RecvChannelInner {
                config,
                peer_addr,
                pipeline,
                clock,
                events,
                stats,
                dispatcher,
                expected: SeqNr::ZERO,
                buffer: FxHashMap::default(),
                gap_first_seen_ms: None,
            })),
        }
    }

    /// Ingress for a reliable data packet. The ACK goes out before anything
    ///  else, unconditionally - duplicates and out-of-window arrivals included.
    pub async fn on_data_packet(&self, header: &PacketHeader, payload: Bytes) {
        let mut inner = self.inner.write().await;
        let seq = header.seq;

        inner.send_ack(seq).await;

        inner.stats.rx_total.fetch_add(1, Ordering::Relaxed);
        inner.stats.rx_reliable.fetch_add(1, Ordering::Relaxed);
        inner.events.emit(TransportEvent::RxData {
            channel: Channel::Reliable,
            seq,
            ts_ms: header.ts_ms,
        });

        if seq == inner.expected {
            inner.expected = seq.next();
            inner.deliver(seq, header.ts_ms, payload, true, false).await;
            inner.drain_in_order().await;
            inner.update_gap_marker();
        }
        else if seq.precedes(inner.expected) {
            // duplicate or replay - the ACK above is all the sender needs
            trace!("received duplicate #{} from {:?} (expecting #{})", seq, inner.peer_addr, inner.expected);
        }
        else if seq.in_window(inner.expected, inner.config.recv_window_size) {
            trace!("buffering out-of-order #{} from {:?} (expecting #{})", seq, inner.peer_addr, inner.expected);
            inner
                .buffer
                .entry(seq)
                .or_insert(BufferedPacket {
                    payload,
                    ts_ms: header.ts_ms,
                });
            inner.update_gap_marker();
        }
        else {
            debug!("received #{} outside the receive window above #{} from {:?} - discarding", seq, inner.expected, inner.peer_addr);
        }
    }

    /// Positions the delivery cursor mid-stream, as if the channel had already
    ///  delivered everything up to `seq`.
    #[cfg(test)]
    pub(crate) async fn warm_expected(&self, seq: SeqNr) {
        self.inner.write().await.expected = seq;
    }

    /// Periodic gap check, driven by the transport's scanner. Once `expected`
    ///  has been missing for the configured timeout, the cursor jumps to the
    ///  smallest buffered sequence above it; the skipped range is lost to the
    ///  application and never delivered.
    pub async fn check_gap(&self) {
        let mut inner = self.inner.write().await;

        let Some(first_seen_ms) = inner.gap_first_seen_ms else {
            return;
        };

        let now_ms = inner.clock.now_ms();
        let waited_ms = now_ms.saturating_sub(first_seen_ms);
        if waited_ms < inner.config.gap_skip_timeout.as_millis() as u64 {
            return;
        }

        let Some(target) = inner.next_buffered_above_expected() else {
            inner.gap_first_seen_ms = None;
            return;
        };

        debug!("skipping gap [{}, {}) towards {:?} after {} ms", inner.expected, target, inner.peer_addr, waited_ms);
        inner.stats.skip_count.fetch_add(1, Ordering::Relaxed);
        inner.events.emit(TransportEvent::SkipGap {
            from_seq: inner.expected,
            to_seq: target,
            waited_ms,
        });

        let packet = inner
            .buffer
            .remove(&target)
            .expect("probed from the buffer above");
        inner.expected = target.next();
        inner.gap_first_seen_ms = None;
        inner.deliver(target, packet.ts_ms, packet.payload, false, true).await;
        inner.drain_in_order().await;
        inner.update_gap_marker();
    }
}
