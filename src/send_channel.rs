use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::clock::MonotonicClock;
use crate::config::HudpConfig;
use crate::error::SendError;
use crate::events::{EventSink, TransportEvent};
use crate::packet_header::{Channel, PacketFlags, PacketHeader};
use crate::send_pipeline::SendPipeline;
use crate::seq::SeqNr;
use crate::stats::TransportStats;

/// One entry per unacknowledged reliable sequence. The payload bytes are kept
///  verbatim for retransmission; the entry is destroyed on ACK receipt or when
///  the retransmission budget is exhausted.
struct InFlightEntry {
    payload: Bytes,
    first_send_ms: u64,
    retx_count: u32,
    deadline: Instant,
}

struct SendChannelInner {
    config: Arc<HudpConfig>,
    peer_addr: SocketAddr,
    pipeline: SendPipeline,
    clock: Arc<MonotonicClock>,
    events: EventSink,
    stats: Arc<TransportStats>,

    /// next sequence to allocate, wrapping mod 2^16
    next_seq: SeqNr,
    /// oldest unacked sequence, equal to `next_seq` while nothing is in flight
    send_base: SeqNr,
    in_flight: FxHashMap<SeqNr, InFlightEntry>,
}

impl SendChannelInner {
    /// `send_base` is the smallest in-flight sequence in serial order, falling
    ///  back to `next_seq` when the window is empty.
    fn advance_send_base(&mut self) {
        let mut smallest = None;
        for &seq in self.in_flight.keys() {
            match smallest {
                None => smallest = Some(seq),
                Some(s) => {
                    if seq.precedes(s) {
                        smallest = Some(seq);
                    }
                }
            }
        }
        self.send_base = smallest.unwrap_or(self.next_seq);
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|e| e.deadline).min()
    }

    async fn transmit(&self, header: PacketHeader, payload: &[u8]) {
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + payload.len());
        header.ser(&mut buf);
        buf.put_slice(payload);

        self.pipeline.send_packet(self.peer_addr, &buf).await;

        self.stats.tx_total.fetch_add(1, Ordering::Relaxed);
        self.events.emit(TransportEvent::TxData {
            channel: header.channel,
            seq: header.seq,
            ts_ms: header.ts_ms,
            bytes: buf.len(),
            retx: header.is_retx(),
        });
    }
}

/// Per-peer sender engine: reliable Selective Repeat ARQ plus the stateless
///  unreliable egress path.
///
/// Reliable sends suspend while the window is full and complete once the
///  packet is handed to the socket - not once it is acknowledged. A packet
///  that exhausts its retransmissions is dropped with an observable event;
///  the original caller is not re-notified.
pub struct SendChannel {
    config: Arc<HudpConfig>,
    inner: Arc<RwLock<SendChannelInner>>,

    /// one permit per send-window slot; closed on shutdown so blocked senders
    ///  fail with `Closed`
    window_slots: Arc<Semaphore>,
    /// wakes the retransmission scheduler when the in-flight table changes
    retx_nudge: Arc<Notify>,
    retx_handle: Mutex<Option<JoinHandle<()>>>,

    /// independent sequence space for the unreliable channel - observability
    ///  only, no duplicate detection on the far side
    unreliable_seq: AtomicU16,
}

impl Drop for SendChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.retx_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl SendChannel {
    pub fn new(
        config: Arc<HudpConfig>,
        peer_addr: SocketAddr,
        pipeline: SendPipeline,
        clock: Arc<MonotonicClock>,
        events: EventSink,
        stats: Arc<TransportStats>,
    ) -> SendChannel {
        let inner = Arc::new(RwLock::new(SendChannelInner {
            config: config.clone(),
            peer_addr,
            pipeline,
            clock,
            events,
            stats,
            next_seq: SeqNr::ZERO,
            send_base: SeqNr::ZERO,
            in_flight: FxHashMap::default(),
        }));

        SendChannel {
            window_slots: Arc::new(Semaphore::new(config.send_window_size as usize)),
            config,
            inner,
            retx_nudge: Arc::new(Notify::new()),
            retx_handle: Mutex::new(None),
            unreliable_seq: AtomicU16::new(0),
        }
    }

    /// Spawns the retransmission scheduler. Must be called once before the
    ///  first reliable send.
    pub fn spawn_active_loop(&self) {
        let mut handle = self.retx_handle.lock().unwrap();
        if handle.is_some() {
            warn!("retransmission loop already spawned");
            return;
        }
        *handle = Some(tokio::spawn(Self::run_retx_loop(
            self.config.clone(),
            self.inner.clone(),
            self.window_slots.clone(),
            self.retx_nudge.clone(),
        )));
    }

    /// Sends a payload on the reliable channel, suspending while the send
    ///  window is full. Returns once the packet is handed to the socket.
    ///  Cancelling a suspended caller releases the window slot without sending.
    pub async fn send_reliable(&self, payload: Bytes) -> Result<(), SendError> {
        if payload.len() + PacketHeader::SERIALIZED_LEN > self.config.mtu {
            return Err(SendError::PayloadTooLarge {
                payload_len: payload.len(),
                mtu: self.config.mtu,
            });
        }

        // window admission: the permit is forgotten once taken and re-created
        //  when the sequence leaves the in-flight table (ack or drop)
        let permit = self
            .window_slots
            .acquire()
            .await
            .map_err(|_| SendError::Closed)?;
        permit.forget();

        let mut inner = self.inner.write().await;

        let seq = inner.next_seq;
        inner.next_seq = seq.next();
        if inner.in_flight.is_empty() {
            inner.send_base = seq;
        }

        let now_ms = inner.clock.now_ms();
        let header = PacketHeader::new_data(Channel::Reliable, seq, inner.clock.wire_ts());

        inner.in_flight.insert(
            seq,
            InFlightEntry {
                payload: payload.clone(),
                first_send_ms: now_ms,
                retx_count: 0,
                deadline: Instant::now() + self.config.retx_timeout,
            },
        );

        trace!("sending reliable #{} to {:?} ({} bytes)", seq, inner.peer_addr, payload.len());
        inner.stats.tx_reliable.fetch_add(1, Ordering::Relaxed);
        inner.transmit(header, &payload).await;
        drop(inner);

        self.retx_nudge.notify_one();
        Ok(())
    }

    /// Sends a payload on the unreliable channel: stamp, emit once, never
    ///  buffer.
    pub async fn send_unreliable(&self, payload: Bytes) -> Result<(), SendError> {
        if payload.len() + PacketHeader::SERIALIZED_LEN > self.config.mtu {
            return Err(SendError::PayloadTooLarge {
                payload_len: payload.len(),
                mtu: self.config.mtu,
            });
        }
        if self.window_slots.is_closed() {
            return Err(SendError::Closed);
        }

        let seq = SeqNr::from_raw(self.unreliable_seq.fetch_add(1, Ordering::Relaxed));

        let inner = self.inner.read().await;
        let header = PacketHeader::new_data(Channel::Unreliable, seq, inner.clock.wire_ts());
        inner.stats.tx_unreliable.fetch_add(1, Ordering::Relaxed);
        inner.transmit(header, &payload).await;
        Ok(())
    }

    /// ACK ingress: frees the sequence's window slot and samples RTT on this
    ///  side's own clock. The ACK's timestamp field is opaque here.
    pub async fn on_ack(&self, seq: SeqNr) {
        let mut inner = self.inner.write().await;

        let Some(entry) = inner.in_flight.remove(&seq) else {
            debug!("received ACK for #{} which is not in flight - late or duplicate, ignoring", seq);
            return;
        };

        let rtt_ms = inner.clock.now_ms().saturating_sub(entry.first_send_ms);
        inner.stats.record_rtt(rtt_ms);
        inner.events.emit(TransportEvent::AckRx { seq, rtt_ms });
        trace!("ACK for #{} from {:?}, rtt {} ms", seq, inner.peer_addr, rtt_ms);

        inner.advance_send_base();
        drop(inner);

        self.window_slots.add_permits(1);
        self.retx_nudge.notify_one();
    }

    /// Positions the sequence space mid-stream, as if the channel had already
    ///  carried traffic up to `seq`.
    #[cfg(test)]
    pub(crate) async fn warm_sequences(&self, seq: SeqNr) {
        let mut inner = self.inner.write().await;
        inner.next_seq = seq;
        inner.send_base = seq;
    }

    /// Fails all suspended senders with `Closed` and stops the scheduler.
    pub fn close(&self) {
        self.window_slots.close();
        if let Some(handle) = self.retx_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Retransmission scheduler: sleeps until the earliest in-flight deadline,
    ///  woken early whenever the table changes. No sequence is retransmitted
    ///  before its deadline; cancellation on ACK takes effect on the next wake.
    async fn run_retx_loop(
        config: Arc<HudpConfig>,
        inner: Arc<RwLock<SendChannelInner>>,
        window_slots: Arc<Semaphore>,
        retx_nudge: Arc<Notify>,
    ) {
        loop {
            let next_deadline = inner.read().await.earliest_deadline();

            match next_deadline {
                None => retx_nudge.notified().await,
                Some(deadline) => {
                    select! {
                        _ = sleep_until(deadline) => {
                            Self::handle_due_deadlines(&config, &inner, &window_slots).await;
                        }
                        _ = retx_nudge.notified() => {
                            // table changed - recompute the earliest deadline
                        }
                    }
                }
            }
        }
    }

    async fn handle_due_deadlines(
        config: &HudpConfig,
        inner: &RwLock<SendChannelInner>,
        window_slots: &Semaphore,
    ) {
        let mut inner = inner.write().await;
        let now = Instant::now();

        let due = inner
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(&seq, _)| seq)
            .collect::<Vec<_>>();

        for seq in due {
            let entry = inner.in_flight.get_mut(&seq).expect("collected from the table above");

            if entry.retx_count >= config.max_retx {
                inner.in_flight.remove(&seq);
                debug!("#{} exhausted its {} retransmissions to {:?} - dropping", seq, config.max_retx, inner.peer_addr);

                inner.stats.drop_count.fetch_add(1, Ordering::Relaxed);
                inner.events.emit(TransportEvent::DropMaxRetx { seq });

                inner.advance_send_base();
                window_slots.add_permits(1);
                continue;
            }

            entry.retx_count += 1;
            entry.deadline = now + config.retx_timeout;
            let count = entry.retx_count;
            let payload = entry.payload.clone();

            let header = PacketHeader {
                channel: Channel::Reliable,
                flags: PacketFlags::RETX,
                seq,
                ts_ms: inner.clock.wire_ts(),
            };

            trace!("retransmitting #{} to {:?} (attempt {})", seq, inner.peer_addr, count);
            inner.stats.retx_count.fetch_add(1, Ordering::Relaxed);
            inner.events.emit(TransportEvent::Retx { seq, count });
            inner.transmit(header, &payload).await;
        }
    }
}
