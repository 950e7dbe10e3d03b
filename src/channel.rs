//! Per-peer channel: the reliability state machine.
//!
//! A channel owns the send and receive queues for one remote address, allocates
//!  packet ids, estimates the round-trip time, paces client-mode sending, and runs a
//!  single periodic tick task that does both the retransmit scan and the
//!  inactivity/keepalive check. Inbound packets are fed through a bounded per-channel
//!  queue by the endpoint's read loop and handled on the channel's own dispatch task,
//!  so channels never contend with each other on the hot path.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::crypt::ChannelCrypt;
use crate::end_point::{EndPointShared, SendWork};
use crate::error::{DisconnectReason, TransportError};
use crate::packet::{IdCounter, Packet, PacketHeader, PacketId, PacketType};
use crate::reader::{DeliveryFn, MessageReader};
use crate::receive_queue::ReceiveQueue;
use crate::send_queue::{DeliveryState, SendQueue, SendQueueEntry};
use crate::split::{fragments, Combine};
use crate::stats::ChannelStats;

pub(crate) const MIN_RTT: Duration = Duration::from_millis(30);
pub(crate) const MAX_RTT: Duration = Duration::from_millis(3000);

/// Retransmit delay used before the first round-trip sample arrives.
pub(crate) const START_RTT: Duration = Duration::from_millis(200);

const INBOUND_QUEUE_LEN: usize = 64;

/// Deadline for the next retransmission of a packet: the smoothed round-trip time
///  plus a floor, multiplied per attempt for exponential back-off, bounded to
///  `[MIN_RTT, MAX_RTT]`.
pub(crate) fn retransmit_delay(trip_time_middle: Duration, attempts: u32) -> Duration {
    let base = if trip_time_middle.is_zero() {
        START_RTT
    } else {
        MIN_RTT + trip_time_middle
    };
    let backed_off = if attempts > 0 { base * (attempts + 1) } else { base };
    backed_off.clamp(MIN_RTT, MAX_RTT)
}

pub struct Channel {
    shared: Arc<EndPointShared>,
    addr: SocketAddr,
    addr_key: String,
    server_mode: bool,

    next_id: IdCounter,
    expected_id: IdCounter,
    send_queue: SendQueue,
    receive_queue: ReceiveQueue,
    combine: Mutex<Combine>,
    crypt: ChannelCrypt,
    stats: ChannelStats,

    max_data_len: usize,
    send_delay_us: AtomicU64,

    reader: RwLock<Option<Arc<dyn MessageReader>>>,

    destroyed: AtomicBool,
    destroy_reason: Mutex<Option<DisconnectReason>>,

    inbound_tx: mpsc::Sender<Packet>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    pub(crate) fn new(
        shared: Arc<EndPointShared>,
        addr: SocketAddr,
        server_mode: bool,
    ) -> Arc<Channel> {
        debug!("new channel {} (server mode: {})", addr, server_mode);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_LEN);
        let config = shared.config();

        let channel = Arc::new(Channel {
            addr,
            addr_key: addr.to_string(),
            server_mode,
            next_id: IdCounter::new(PacketId::ZERO),
            expected_id: IdCounter::new(PacketId::ZERO),
            send_queue: SendQueue::new(),
            receive_queue: ReceiveQueue::new(),
            combine: Mutex::new(Combine::new()),
            crypt: ChannelCrypt::new(shared.private_key()),
            stats: ChannelStats::new(),
            max_data_len: config.max_packet_data_len,
            send_delay_us: AtomicU64::new(config.initial_send_delay.as_micros() as u64),
            reader: RwLock::new(None),
            destroyed: AtomicBool::new(false),
            destroy_reason: Mutex::new(None),
            inbound_tx,
            tick_task: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            shared,
        });

        channel.spawn_dispatch(inbound_rx);
        channel.spawn_tick();
        channel
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_server_mode(&self) -> bool {
        self.server_mode
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// True once the handshake has installed the session key and DATA payloads are
    ///  encrypted on the wire.
    pub fn is_encrypted(&self) -> bool {
        self.crypt.is_on()
    }

    /// Current adaptive send delay (client mode pacing).
    pub fn send_delay(&self) -> Duration {
        Duration::from_micros(self.send_delay_us.load(Ordering::Relaxed))
    }

    pub fn set_reader(&self, reader: Arc<dyn MessageReader>) {
        *self.reader.write().unwrap() = Some(reader);
    }

    pub(crate) fn reader(&self) -> Option<Arc<dyn MessageReader>> {
        self.reader.read().unwrap().clone()
    }

    pub(crate) fn install_session_key(&self, key: Bytes) {
        self.crypt.install_session_key(key);
    }

    pub(crate) fn decrypt_handshake_data(&self, data: &[u8]) -> anyhow::Result<Bytes> {
        crate::crypt::rsa_decrypt(self.crypt.private_key(), data)
    }

    fn destroyed_error(&self) -> TransportError {
        let reason = self
            .destroy_reason
            .lock()
            .unwrap()
            .unwrap_or(DisconnectReason::Closed);
        TransportError::ChannelDestroyed(reason)
    }

    /// Writes an application message to the peer. Messages larger than the
    ///  per-packet limit are split transparently; the returned id is the first
    ///  packet's and identifies the message on the receiving side.
    pub async fn write(self: &Arc<Self>, data: &[u8]) -> Result<PacketId, TransportError> {
        self.write_message(data, None).await
    }

    /// Like [`Channel::write`], but registers a delivery callback that fires exactly
    ///  once: with `Ok` when the message's first packet is acknowledged, or with an
    ///  error when `timeout` (default from the config) elapses first or the channel
    ///  is destroyed.
    pub async fn write_with_delivery(
        self: &Arc<Self>,
        data: &[u8],
        delivery: DeliveryFn,
        timeout: Option<Duration>,
    ) -> Result<PacketId, TransportError> {
        let timeout = timeout.unwrap_or(self.shared.config().delivery_timeout);
        self.write_message(data, Some((delivery, timeout))).await
    }

    async fn write_message(
        self: &Arc<Self>,
        data: &[u8],
        mut delivery: Option<(DeliveryFn, Duration)>,
    ) -> Result<PacketId, TransportError> {
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }

        let chunks = fragments(data, self.max_data_len).collect::<Vec<_>>();
        trace!(
            "writing message of length {} to {} in {} packets",
            data.len(),
            self.addr,
            chunks.len()
        );

        let mut first_id = None;
        for (chunk, split) in chunks {
            let id = self.write_data_packet(chunk, split, delivery.take()).await?;
            first_id.get_or_insert(id);
        }
        Ok(first_id.expect("a message always yields at least one packet"))
    }

    async fn write_data_packet(
        self: &Arc<Self>,
        chunk: &[u8],
        split: bool,
        delivery: Option<(DeliveryFn, Duration)>,
    ) -> Result<PacketId, TransportError> {
        if !self.server_mode {
            self.pace().await;
        }

        let id = self.next_id.take_next();
        let encrypted = self.crypt.encrypt_packet_data(id, chunk);
        let header = PacketHeader::new(PacketType::Data, id).with_split(split);
        let datagram = Packet::new(header, encrypted).marshal();

        let delivery = delivery.map(|(callback, timeout)| {
            let state = DeliveryState::new(id, callback);
            state.spawn_timeout(timeout);
            state
        });

        let now = Instant::now();
        let entry = SendQueueEntry {
            id,
            datagram: datagram.clone(),
            sent_at: now,
            retransmit_at: now + retransmit_delay(self.stats.trip_time_middle(), 0),
            retransmit_attempts: 0,
            delivery: delivery.clone(),
        };
        if !self.send_queue.add(entry) {
            // lost the race against destruction; the callback fires through the
            // queue's teardown only if the entry made it in, so fail it here
            if let Some(delivery) = delivery {
                delivery.complete(Err(self.destroyed_error()));
            }
            return Err(self.destroyed_error());
        }

        self.stats.record_send();
        self.shared
            .submit_send(SendWork {
                channel: Some(self.clone()),
                addr: self.addr,
                datagram,
                droppable: !self.server_mode,
            })
            .await;

        Ok(id)
    }

    /// Adaptive client-mode send pacing.
    ///
    /// Probes the head of the send queue: outstanding retransmits there mean the
    ///  path is saturated, so wait in short steps for them to clear. The per-channel
    ///  send delay shrinks slowly while probes come back clean and grows when they
    ///  do not, converging just below the loss-inducing rate. Finally the delay is
    ///  enforced relative to the previous send.
    async fn pace(&self) {
        let config = self.shared.config();

        let mut saw_retransmits = false;
        for _ in 0..config.pacing_probe_rounds {
            if self.send_queue.head_retransmit_attempts() == 0 {
                break;
            }
            saw_retransmits = true;
            tokio::time::sleep(config.pacing_probe_step).await;
        }

        if self.stats.delay_check_due(config.delay_check_interval) {
            let delay = self.send_delay_us.load(Ordering::Relaxed);
            let adjusted = if saw_retransmits {
                delay + 10
            } else if delay > config.delay_fast_decrease_threshold {
                delay - 10
            } else if delay > config.delay_decrease_threshold {
                delay - 1
            } else {
                delay
            };
            if adjusted != delay {
                trace!("send delay for {} adjusted to {}us", self.addr, adjusted);
                self.send_delay_us.store(adjusted, Ordering::Relaxed);
            }
        }

        let delay = self.send_delay();
        let since_last_send = self.stats.last_send_elapsed();
        if since_last_send < delay {
            tokio::time::sleep(delay - since_last_send).await;
        }
        self.stats.touch_send();
    }

    /// Hands an inbound packet to the channel's dispatch task. Never blocks the
    ///  endpoint's read loop: when the channel cannot keep up, the packet is dropped
    ///  and recovered by retransmission.
    pub(crate) fn enqueue_inbound(&self, packet: Packet) {
        if self.inbound_tx.try_send(packet).is_err() {
            debug!("inbound queue of {} full, dropping packet", self.addr);
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, mut inbound_rx: mpsc::Receiver<Packet>) {
        let channel = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(packet) = inbound_rx.recv().await {
                if channel.is_destroyed() {
                    return;
                }
                channel.dispatch(packet).await;
            }
        });
        *self.dispatch_task.lock().unwrap() = Some(handle);
    }

    /// Handles one parsed inbound packet. Handshake and PUNCH packets never get
    ///  here; the endpoint routes them before the channel is involved.
    pub(crate) async fn dispatch(self: &Arc<Self>, packet: Packet) {
        let Some(packet_type) = packet.packet_type() else {
            debug!(
                "channel {} dropping packet with undefined status {}",
                self.addr,
                packet.status()
            );
            return;
        };
        trace!("channel {} got {:?} id {}", self.addr, packet_type, packet.id());

        match packet_type {
            PacketType::Ping => self.write_control(PacketType::Pong, PacketId::ZERO).await,
            PacketType::Pong => {}
            PacketType::Ack => self.on_ack(packet.id()),
            PacketType::Disconnect => {
                self.destroy(DisconnectReason::PeerDisconnect).await;
                return;
            }
            PacketType::Data => self.on_data(packet).await,
            other => {
                debug!("channel {} ignoring unexpected {:?}", self.addr, other);
            }
        }

        self.stats.touch_activity();
    }

    fn on_ack(&self, id: PacketId) {
        match self.send_queue.remove_by_id(id) {
            Some(entry) => {
                let sample = entry.sent_at.elapsed();
                let middle = self.stats.record_trip_time(sample);
                self.stats.record_ack();
                trace!(
                    "ack for {}: trip time {:?}, smoothed {:?}",
                    id,
                    sample,
                    middle
                );
                if let Some(delivery) = entry.delivery {
                    delivery.complete(Ok(()));
                }
            }
            None => self.stats.record_duplicate_ack(),
        }
    }

    async fn on_data(self: &Arc<Self>, packet: Packet) {
        let id = packet.id();
        let data = match self.crypt.decrypt_packet_data(id, packet.data()) {
            Ok(data) => data,
            Err(e) => {
                debug!("dropping undecryptable packet {} from {}: {}", id, self.addr, e);
                return;
            }
        };
        let packet = Packet::new(packet.header(), data);

        // the ordering decision is made before the ACK goes out, so the peer may
        // treat an ACK as proof of at-least-once delivery
        let dist = self.expected_id.get().distance(id);
        self.write_control(PacketType::Ack, id).await;

        if dist < 0 {
            // duplicate of an already delivered id
            self.stats.record_drop();
        } else if dist > 0 {
            if self.receive_queue.contains(id) {
                self.stats.record_drop();
            } else {
                self.receive_queue.add(packet);
            }
        } else {
            let mut ready = vec![packet];
            self.expected_id.advance();
            self.receive_queue
                .process(&self.expected_id, |p| ready.push(p));

            for packet in ready {
                self.stats.record_recv();
                let completed = self.combine.lock().unwrap().push(packet);
                if let Some(message) = completed {
                    self.shared.deliver_message(self.clone(), message).await;
                }
            }
        }
    }

    async fn write_control(self: &Arc<Self>, packet_type: PacketType, id: PacketId) {
        let datagram = Packet::control(packet_type, id).marshal();
        self.shared
            .submit_send(SendWork {
                channel: Some(self.clone()),
                addr: self.addr,
                datagram,
                droppable: false,
            })
            .await;
    }

    async fn write_ping(self: &Arc<Self>) {
        self.write_control(PacketType::Ping, PacketId::ZERO).await;
    }

    /// One periodic task per channel: every tick scans the send queue for due
    ///  retransmits, and every `keepalive_check_interval` it checks inactivity and
    ///  keepalive in the same place.
    fn spawn_tick(self: &Arc<Self>) {
        let channel = self.clone();
        let handle = tokio::spawn(async move {
            let config = channel.shared.config();
            let mut tick = tokio::time::interval(config.retransmit_tick);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_keepalive_check = Instant::now();

            loop {
                tick.tick().await;
                if channel.is_destroyed() {
                    return;
                }

                let middle = channel.stats.trip_time_middle();
                let scan = channel.send_queue.scan_retransmits(
                    Instant::now(),
                    config.max_retransmit_attempts,
                    |attempts| retransmit_delay(middle, attempts),
                );
                if scan.exhausted {
                    channel.destroy(DisconnectReason::MaxRetransmits).await;
                    return;
                }
                for (id, datagram) in scan.resend {
                    channel.stats.record_retransmit();
                    debug!("retransmit {} to {}", id, channel.addr);
                    channel.shared.write_raw(&datagram, channel.addr).await;
                }

                if last_keepalive_check.elapsed() >= config.keepalive_check_interval {
                    last_keepalive_check = Instant::now();
                    let idle = channel.stats.last_activity_elapsed();
                    if idle > config.disconnect_after {
                        channel.destroy(DisconnectReason::Inactive).await;
                        return;
                    }
                    if idle > config.ping_after && !channel.server_mode {
                        debug!("channel ping {}", channel.addr);
                        channel.write_ping().await;
                    }
                }
            }
        });
        *self.tick_task.lock().unwrap() = Some(handle);
    }

    /// Closes the channel: DISCONNECT is written directly on the calling path so it
    ///  is observably sent before the channel state is torn down.
    pub async fn close(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let datagram = Packet::control(PacketType::Disconnect, PacketId::ZERO).marshal();
        self.shared.write_raw(&datagram, self.addr).await;
        self.destroy(DisconnectReason::Closed).await;
    }

    /// Tears the channel down: fails outstanding delivery callbacks, clears the
    ///  queues, removes the channel from the endpoint and emits one terminal
    ///  notification through the reader path. Idempotent.
    pub(crate) async fn destroy(self: &Arc<Self>, reason: DisconnectReason) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.destroy_reason.lock().unwrap() = Some(reason);
        debug!(
            "destroying channel {}: {} ({} unacked, {} buffered)",
            self.addr,
            reason,
            self.send_queue.len(),
            self.receive_queue.len()
        );

        for delivery in self.send_queue.destroy() {
            delivery.complete(Err(TransportError::ChannelDestroyed(reason)));
        }
        self.receive_queue.clear();
        self.combine.lock().unwrap().clear();

        self.shared.remove_channel(&self.addr_key);
        self.shared
            .notify_channel_error(self.clone(), TransportError::ChannelDestroyed(reason))
            .await;

        // aborting only takes effect at an await point, so this must come after the
        // notification above: destroy may well be running on one of these tasks
        if let Some(task) = self.tick_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.dispatch_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RudpConfig;
    use crate::end_point::EndPoint;
    use rstest::rstest;

    #[rstest]
    #[case::no_sample_yet(0, 0, 200)]
    #[case::no_sample_first_retry(0, 1, 400)]
    #[case::sampled(100, 0, 130)]
    #[case::sampled_first_retry(100, 1, 260)]
    #[case::sampled_second_retry(100, 2, 390)]
    #[case::tiny_sample(1, 0, 31)]
    #[case::capped(2000, 3, 3000)]
    #[case::no_sample_many_retries(0, 50, 3000)]
    fn test_retransmit_delay(
        #[case] middle_ms: u64,
        #[case] attempts: u32,
        #[case] expected_ms: u64,
    ) {
        let delay = retransmit_delay(Duration::from_millis(middle_ms), attempts);
        assert_eq!(delay, Duration::from_millis(expected_ms));
    }

    #[rstest]
    #[case(0, 0)]
    #[case(0, 200)]
    #[case(1, 7)]
    #[case(10_000, 99)]
    #[case(u64::MAX / 1_000_000, 100)]
    fn test_retransmit_delay_bounds(#[case] middle_ms: u64, #[case] attempts: u32) {
        let delay = retransmit_delay(Duration::from_millis(middle_ms), attempts);
        assert!(delay >= MIN_RTT);
        assert!(delay <= MAX_RTT);
    }

    fn data_packet(id: u32) -> Packet {
        Packet::new(
            PacketHeader::new(PacketType::Data, PacketId::from_raw(id)),
            Bytes::new(),
        )
    }

    /// Feeds out-of-order, duplicated DATA ids through the dispatch path and checks
    ///  the receive queue, drop counter and expected id after each phase.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispatch_reordering_and_duplicates() {
        let server = EndPoint::new(RudpConfig::default()).await.unwrap();
        let client = EndPoint::new(RudpConfig::default()).await.unwrap();

        let channel = client
            .connect(&server.local_addr().to_string())
            .await
            .unwrap();

        for id in [1, 4, 1, 2, 4, 2] {
            channel.dispatch(data_packet(id)).await;
        }
        assert_eq!(channel.receive_queue.len(), 3);
        assert_eq!(channel.stats.drops(), 3);
        assert_eq!(channel.expected_id.get(), PacketId::ZERO);

        for id in [3, 0, 3] {
            channel.dispatch(data_packet(id)).await;
        }
        assert_eq!(channel.receive_queue.len(), 0);
        assert_eq!(channel.stats.drops(), 4);
        assert_eq!(channel.expected_id.get(), PacketId::from_raw(5));

        client.close().await;
        server.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ack_updates_trip_time_and_send_queue() {
        let server = EndPoint::new(RudpConfig::default()).await.unwrap();
        let client = EndPoint::new(RudpConfig::default()).await.unwrap();

        let channel = client
            .connect(&server.local_addr().to_string())
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        channel.write(b"probe").await.unwrap();
        while channel.send_queue_len() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(channel.send_queue_len(), 0);
        assert!(channel.stats.trip_time_middle() > Duration::ZERO);
        assert_eq!(channel.stats.snapshot().acks_received, 1);

        // an ACK for an id that is not in the send queue counts as duplicate
        channel
            .dispatch(Packet::control(PacketType::Ack, PacketId::from_raw(77)))
            .await;
        assert_eq!(channel.stats.snapshot().duplicate_acks, 1);

        client.close().await;
        server.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_silent_peer_is_destroyed_as_inactive() {
        let server_config = RudpConfig {
            ping_after: Duration::from_millis(200),
            disconnect_after: Duration::from_millis(600),
            keepalive_check_interval: Duration::from_millis(100),
            ..RudpConfig::default()
        };
        let server = EndPoint::new(server_config).await.unwrap();
        let client = EndPoint::new(RudpConfig::default()).await.unwrap();

        let channel = client
            .connect(&server.local_addr().to_string())
            .await
            .unwrap();
        assert_eq!(server.num_channels(), 1);

        // tear the client side down without a DISCONNECT: the peer just goes silent
        channel.destroy(DisconnectReason::Closed).await;

        let deadline = Instant::now() + Duration::from_secs(3);
        while server.num_channels() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(server.num_channels(), 0);

        client.close().await;
        server.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_to_destroyed_channel_fails() {
        let server = EndPoint::new(RudpConfig::default()).await.unwrap();
        let client = EndPoint::new(RudpConfig::default()).await.unwrap();

        let channel = client
            .connect(&server.local_addr().to_string())
            .await
            .unwrap();
        channel.close().await;

        assert_eq!(
            channel.write(b"too late").await,
            Err(TransportError::ChannelDestroyed(DisconnectReason::Closed))
        );

        client.close().await;
        server.close().await;
    }
}
