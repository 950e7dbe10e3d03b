//! The endpoint is where everything comes together: it owns the UDP socket,
//!  dispatches inbound datagrams to their channels, and hosts the worker tasks.
//!
//! Inbound: one read loop parses headers and routes - handshake and PUNCH packets are
//!  handled right there, everything else goes into the owning channel's dispatch
//!  queue. Delivered application messages pass through one bounded reader queue
//!  consumed by a single worker that tries the channel's reader before the global
//!  one. Outbound: regular packets go through a bounded sender queue and worker;
//!  handshake and DISCONNECT packets are written directly on the calling path.

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use rand::Rng;
use rsa::RsaPrivateKey;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::channel::Channel;
use crate::config::RudpConfig;
use crate::connect::{self, Rendezvous};
use crate::crypt;
use crate::error::{DisconnectReason, TransportError};
use crate::packet::{Packet, PacketType};
use crate::reader::MessageReader;

/// Length of the bounded sender and reader work queues.
const WORK_QUEUE_LEN: usize = 10;

/// Write side of the datagram endpoint the transport runs on. Everything above
///  this seam deals in packets and channels; everything below it is plain
///  fire-and-forget datagram I/O, which also makes this the natural seam to mock
///  in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait DatagramSink: Send + Sync + 'static {
    /// Best-effort delivery: a failed write is logged and forgotten, and the
    ///  reliability machinery treats it like any other lost datagram.
    async fn send_datagram(&self, datagram: &[u8], to: SocketAddr);

    fn bound_addr(&self) -> SocketAddr;
}

#[async_trait]
impl DatagramSink for Arc<UdpSocket> {
    async fn send_datagram(&self, datagram: &[u8], to: SocketAddr) {
        trace!("sending {} bytes to {:?}", datagram.len(), to);

        if let Err(e) = self.send_to(datagram, to).await {
            error!("sending datagram to {:?} failed: {}", to, e);
        }
    }

    fn bound_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("a bound UdpSocket has a local addr")
    }
}

pub(crate) struct SendWork {
    /// Skip the write when this channel is destroyed by the time the worker gets
    ///  to it.
    pub channel: Option<Arc<Channel>>,
    pub addr: SocketAddr,
    pub datagram: Bytes,
    /// First transmissions of client-mode DATA packets are subject to the test-only
    ///  drop knob; control packets and retransmits are not.
    pub droppable: bool,
}

enum ReaderWork {
    Message {
        channel: Arc<Channel>,
        message: Packet,
    },
    ChannelError {
        channel: Arc<Channel>,
        error: TransportError,
    },
    /// Marker queued by `close()` after the last terminal notification; the worker
    ///  exits when it reaches it, guaranteeing everything before it was delivered.
    Shutdown,
}

fn should_drop(droppable: bool, drop_one_in: u32) -> bool {
    droppable && drop_one_in > 0 && rand::thread_rng().gen_range(0..drop_one_in) == 0
}

/// State shared between the endpoint handle, its worker tasks and the channels.
pub(crate) struct EndPointShared {
    config: Arc<RudpConfig>,
    recv_socket: Arc<UdpSocket>,
    sink: Arc<dyn DatagramSink>,
    private_key: Arc<RsaPrivateKey>,
    channels: RwLock<FxHashMap<String, Arc<Channel>>>,
    rendezvous: Rendezvous,
    sender_tx: mpsc::Sender<SendWork>,
    reader_tx: mpsc::Sender<ReaderWork>,
    closed: AtomicBool,
}

impl EndPointShared {
    pub fn config(&self) -> Arc<RudpConfig> {
        self.config.clone()
    }

    pub fn private_key(&self) -> Arc<RsaPrivateKey> {
        self.private_key.clone()
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    pub fn get_channel(&self, addr_key: &str) -> Option<Arc<Channel>> {
        self.channels.read().unwrap().get(addr_key).cloned()
    }

    pub fn remove_channel(&self, addr_key: &str) {
        self.channels.write().unwrap().remove(addr_key);
    }

    fn channel_snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.read().unwrap().values().cloned().collect()
    }

    /// Looks up or creates the channel for `addr`. There is at most one channel per
    ///  remote address at any time; reconnects destroy the old channel first.
    pub fn create_channel(self: &Arc<Self>, addr: SocketAddr, server_mode: bool) -> Arc<Channel> {
        let key = addr.to_string();
        if let Some(existing) = self.get_channel(&key) {
            return existing;
        }

        let channel = Channel::new(self.clone(), addr, server_mode);
        self.channels
            .write()
            .unwrap()
            .insert(key, channel.clone());
        channel
    }

    /// Unreliable write, directly on the calling path: handshake, DISCONNECT,
    ///  retransmits and application punch packets.
    pub async fn write_raw(&self, data: &[u8], addr: SocketAddr) {
        self.sink.send_datagram(data, addr).await;
    }

    pub async fn submit_send(&self, work: SendWork) {
        if self.sender_tx.send(work).await.is_err() {
            debug!("sender worker gone, dropping outbound packet");
        }
    }

    pub async fn deliver_message(&self, channel: Arc<Channel>, message: Packet) {
        if self
            .reader_tx
            .send(ReaderWork::Message { channel, message })
            .await
            .is_err()
        {
            debug!("reader worker gone, dropping inbound message");
        }
    }

    pub async fn notify_channel_error(&self, channel: Arc<Channel>, error: TransportError) {
        if self
            .reader_tx
            .send(ReaderWork::ChannelError { channel, error })
            .await
            .is_err()
        {
            debug!("reader worker gone, dropping channel error notification");
        }
    }

    /// Routes one parsed inbound packet. The codec passes any status through;
    ///  statuses this protocol revision does not define end here.
    async fn route(self: &Arc<Self>, from: SocketAddr, packet: Packet) {
        let addr_key = from.to_string();

        let Some(packet_type) = packet.packet_type() else {
            debug!(
                "dropping packet with undefined status {} from {}",
                packet.status(),
                from
            );
            return;
        };

        if packet_type.is_handshake() {
            // a fresh CONNECT on an existing channel means the client reconnected
            if packet_type == PacketType::Connect {
                if let Some(existing) = self.get_channel(&addr_key) {
                    debug!("reconnect from {}, destroying the existing channel", from);
                    existing.destroy(DisconnectReason::Reconnect).await;
                }
            }

            if let Err(e) = connect::serve(self, from, packet).await {
                debug!("handshake with {} failed: {}", from, e);
                if let Some(channel) = self.get_channel(&addr_key) {
                    channel.destroy(DisconnectReason::HandshakeFailed).await;
                }
            }
            return;
        }

        if packet_type == PacketType::Punch {
            if let Some(listener) = &self.config.punch_listener {
                listener.on_punch(from, packet.into_data()).await;
            }
            return;
        }

        match self.get_channel(&addr_key) {
            Some(channel) => channel.enqueue_inbound(packet),
            None => debug!("dropping {:?} from unknown address {}", packet_type, from),
        }
    }
}

async fn recv_loop(shared: Arc<EndPointShared>) {
    info!("start listening at {:?}", shared.sink.bound_addr());

    let mut buf = vec![0u8; 65536];
    loop {
        let (len, from) = match shared.recv_socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                error!("socket receive error: {}", e);
                continue;
            }
        };

        match Packet::unmarshal(&buf[..len]) {
            Ok(packet) => shared.route(from, packet).await,
            Err(e) => debug!(
                "dropping malformed datagram of {} bytes from {}: {}",
                len, from, e
            ),
        }
    }
}

async fn sender_loop(shared: Arc<EndPointShared>, mut rx: mpsc::Receiver<SendWork>) {
    while let Some(work) = rx.recv().await {
        if let Some(channel) = &work.channel {
            if channel.is_destroyed() {
                continue;
            }
        }

        if should_drop(work.droppable, shared.config.drop_one_in) {
            trace!("drop knob: discarding outbound packet to {}", work.addr);
            continue;
        }

        shared.sink.send_datagram(&work.datagram, work.addr).await;
    }
}

async fn reader_loop(shared: Arc<EndPointShared>, mut rx: mpsc::Receiver<ReaderWork>) {
    while let Some(work) = rx.recv().await {
        match work {
            ReaderWork::Message { channel, message } => {
                if channel.is_destroyed() {
                    continue;
                }
                if let Some(reader) = channel.reader() {
                    if reader.on_message(&channel, message.clone()).await {
                        continue;
                    }
                }
                if let Some(reader) = &shared.config.reader {
                    reader.on_message(&channel, message).await;
                }
            }
            ReaderWork::ChannelError { channel, error } => {
                if let Some(reader) = channel.reader() {
                    reader.on_error(Some(&channel), error).await;
                }
                if let Some(reader) = &shared.config.reader {
                    reader.on_error(Some(&channel), error).await;
                }
            }
            ReaderWork::Shutdown => return,
        }
    }
}

/// A bound transport endpoint. One UDP socket, any number of channels.
pub struct EndPoint {
    shared: Arc<EndPointShared>,
    read_task: JoinHandle<()>,
    sender_task: JoinHandle<()>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl EndPoint {
    /// Binds the UDP socket (port 0 picks any free port), generates the endpoint's
    ///  RSA keypair and starts the worker tasks.
    pub async fn new(config: RudpConfig) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.local_port)).await?);
        info!("bound endpoint to {:?}", socket.local_addr()?);

        let private_key = Arc::new(crypt::generate_private_key()?);

        let (sender_tx, sender_rx) = mpsc::channel(WORK_QUEUE_LEN);
        let (reader_tx, reader_rx) = mpsc::channel(WORK_QUEUE_LEN);

        let shared = Arc::new(EndPointShared {
            config: Arc::new(config),
            recv_socket: socket.clone(),
            sink: Arc::new(socket),
            private_key,
            channels: RwLock::new(FxHashMap::default()),
            rendezvous: Rendezvous::new(),
            sender_tx,
            reader_tx,
            closed: AtomicBool::new(false),
        });

        Ok(EndPoint {
            read_task: tokio::spawn(recv_loop(shared.clone())),
            sender_task: tokio::spawn(sender_loop(shared.clone(), sender_rx)),
            reader_task: Mutex::new(Some(tokio::spawn(reader_loop(shared.clone(), reader_rx)))),
            shared,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.sink.bound_addr()
    }

    /// Establishes a channel to a remote endpoint, e.g. `"127.0.0.1:8765"`.
    pub async fn connect(&self, addr: &str) -> anyhow::Result<Arc<Channel>> {
        self.connect_with(addr, None).await
    }

    /// Like [`EndPoint::connect`], registering a per-channel reader that is tried
    ///  before the global one.
    pub async fn connect_with_reader(
        &self,
        addr: &str,
        reader: Arc<dyn MessageReader>,
    ) -> anyhow::Result<Arc<Channel>> {
        self.connect_with(addr, Some(reader)).await
    }

    async fn connect_with(
        &self,
        addr: &str,
        reader: Option<Arc<dyn MessageReader>>,
    ) -> anyhow::Result<Arc<Channel>> {
        let Some(addr) = tokio::net::lookup_host(addr).await?.next() else {
            anyhow::bail!("cannot resolve {}", addr);
        };
        connect::connect(&self.shared, addr, reader).await
    }

    /// Raw unreliable UDP write, bypassing all channel machinery. This is what
    ///  NAT-traversal helpers use to send PUNCH packets.
    pub async fn write_to(&self, data: &[u8], addr: SocketAddr) {
        self.shared.write_raw(data, addr).await;
    }

    pub fn num_channels(&self) -> usize {
        self.shared.channels.read().unwrap().len()
    }

    pub fn for_each_channel(&self, mut f: impl FnMut(&Arc<Channel>)) {
        for channel in self.shared.channel_snapshot() {
            f(&channel);
        }
    }

    /// Closes all channels (each sends DISCONNECT first), notifies the global
    ///  reader, drains the pending reader work and stops the workers.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing endpoint {:?}", self.local_addr());

        if let Some(reader) = &self.shared.config.reader {
            reader.on_error(None, TransportError::EndpointClosed).await;
        }

        for channel in self.shared.channel_snapshot() {
            channel.close().await;
        }

        // the terminal notifications queued by the closing channels are only
        // buffered so far; run the reader worker up to a shutdown marker before
        // stopping anything, so none of them is lost
        if self.shared.reader_tx.send(ReaderWork::Shutdown).await.is_ok() {
            let reader_task = self.reader_task.lock().unwrap().take();
            if let Some(task) = reader_task {
                task.await.ok();
            }
        }

        self.read_task.abort();
        self.sender_task.abort();
    }
}
