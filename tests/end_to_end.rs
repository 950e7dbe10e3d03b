//! End-to-end scenarios over real UDP sockets on the loopback interface.

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use rudp::{
    Channel, DisconnectReason, EndPoint, MessageReader, Packet, PacketHeader, PacketId,
    PacketType, PunchListener, RudpConfig, TransportError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

/// Forwards every delivered message into an mpsc queue for the test to inspect.
struct CollectingReader {
    messages: mpsc::UnboundedSender<Packet>,
    errors: mpsc::UnboundedSender<TransportError>,
}

impl CollectingReader {
    fn new() -> (
        Arc<CollectingReader>,
        mpsc::UnboundedReceiver<Packet>,
        mpsc::UnboundedReceiver<TransportError>,
    ) {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        (
            Arc::new(CollectingReader {
                messages: messages_tx,
                errors: errors_tx,
            }),
            messages_rx,
            errors_rx,
        )
    }
}

#[async_trait]
impl MessageReader for CollectingReader {
    async fn on_message(&self, _channel: &Arc<Channel>, message: Packet) -> bool {
        self.messages.send(message).ok();
        true
    }

    async fn on_error<'a>(&self, _channel: Option<&'a Arc<Channel>>, error: TransportError) {
        self.errors.send(error).ok();
    }
}

async fn endpoint_with_reader(reader: Arc<CollectingReader>) -> EndPoint {
    let config = RudpConfig {
        reader: Some(reader),
        ..RudpConfig::default()
    };
    EndPoint::new(config).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delivery_callback_and_send_queue_drain() {
    let (reader, _messages, _errors) = CollectingReader::new();
    let server = endpoint_with_reader(reader).await;
    let client = EndPoint::new(RudpConfig::default()).await.unwrap();

    let channel = client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel();
    channel
        .write_with_delivery(
            b"some test data",
            Box::new(move |id, result| {
                tx.send((id, result)).ok();
            }),
            None,
        )
        .await
        .unwrap();

    let (id, result) = timeout(Duration::from_secs(1), rx)
        .await
        .expect("delivery callback within one second")
        .unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(id, PacketId::ZERO);
    assert_eq!(channel.send_queue_len(), 0);

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delivery_callback_fires_with_error_when_channel_closes() {
    let server = EndPoint::new(RudpConfig::default()).await.unwrap();
    let client = EndPoint::new(RudpConfig::default()).await.unwrap();

    let channel = client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel();
    channel
        .write_with_delivery(
            b"some test data",
            Box::new(move |_, result| {
                tx.send(result).ok();
            }),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    channel.close().await;

    let result = timeout(Duration::from_secs(1), rx)
        .await
        .expect("delivery callback after close")
        .unwrap();
    assert!(result.is_err());

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reassembly_of_split_messages() {
    let (reader, mut messages, _errors) = CollectingReader::new();
    let server = endpoint_with_reader(reader).await;

    let client_config = RudpConfig {
        max_packet_data_len: 512,
        ..RudpConfig::default()
    };
    let client = EndPoint::new(client_config).await.unwrap();

    let channel = client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();

    let mut large = vec![0u8; 512 * 1024];
    rand::thread_rng().fill_bytes(&mut large);
    let mut small = vec![0u8; 1024];
    rand::thread_rng().fill_bytes(&mut small);

    channel.write(&large).await.unwrap();
    channel.write(&small).await.unwrap();

    let first = timeout(Duration::from_secs(60), messages.recv())
        .await
        .expect("large message delivered")
        .unwrap();
    assert_eq!(first.id(), PacketId::ZERO);
    assert_eq!(first.data().as_ref(), large.as_slice());

    let second = timeout(Duration::from_secs(10), messages.recv())
        .await
        .expect("small message delivered")
        .unwrap();
    assert_eq!(second.data().as_ref(), small.as_slice());

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_in_order_exactly_once_delivery_under_drops() {
    let (reader, mut messages, _errors) = CollectingReader::new();
    let server = endpoint_with_reader(reader).await;

    // every 5th data packet is dropped on first transmission, so delivery relies
    // on the retransmission path
    let client_config = RudpConfig {
        drop_one_in: 5,
        ..RudpConfig::default()
    };
    let client = EndPoint::new(client_config).await.unwrap();

    let channel = client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();

    let count = 100;
    for i in 0..count {
        channel.write(format!("message {}", i).as_bytes()).await.unwrap();
    }

    for i in 0..count {
        let message = timeout(Duration::from_secs(30), messages.recv())
            .await
            .expect("message delivered despite drops")
            .unwrap();
        assert_eq!(
            std::str::from_utf8(message.data()).unwrap(),
            format!("message {}", i)
        );
    }

    // nothing is delivered twice
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(messages.try_recv().is_err());
    assert!(channel.stats().snapshot().retransmits > 0);

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_disconnect_destroys_server_channel() {
    let (reader, _messages, mut errors) = CollectingReader::new();
    let server = endpoint_with_reader(reader).await;
    let client = EndPoint::new(RudpConfig::default()).await.unwrap();

    let channel = client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();
    assert_eq!(server.num_channels(), 1);

    channel.close().await;

    let error = timeout(Duration::from_secs(2), errors.recv())
        .await
        .expect("terminal notification on the server side")
        .unwrap();
    assert_eq!(
        error,
        TransportError::ChannelDestroyed(DisconnectReason::PeerDisconnect)
    );
    assert_eq!(server.num_channels(), 0);
    assert_eq!(client.num_channels(), 0);

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_keepalive_pings_keep_idle_channels_alive() {
    let config = || RudpConfig {
        ping_after: Duration::from_millis(200),
        disconnect_after: Duration::from_millis(1000),
        keepalive_check_interval: Duration::from_millis(100),
        ..RudpConfig::default()
    };
    let server = EndPoint::new(config()).await.unwrap();
    let client = EndPoint::new(config()).await.unwrap();

    client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();

    // idle for well past the disconnect deadline; client pings keep both ends alive
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(client.num_channels(), 1);
    assert_eq!(server.num_channels(), 1);

    client.close().await;
    server.close().await;
}

struct PunchCollector {
    tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
}

#[async_trait]
impl PunchListener for PunchCollector {
    async fn on_punch(&self, from: SocketAddr, data: Bytes) {
        self.tx.send((from, data)).ok();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_punch_packets_reach_the_callback() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = RudpConfig {
        punch_listener: Some(Arc::new(PunchCollector { tx })),
        ..RudpConfig::default()
    };
    let server = EndPoint::new(config).await.unwrap();
    let client = EndPoint::new(RudpConfig::default()).await.unwrap();

    let punch = Packet::new(
        PacketHeader::new(PacketType::Punch, PacketId::ZERO),
        Bytes::from_static(b"hole punching helper"),
    );
    client
        .write_to(&punch.marshal(), server.local_addr())
        .await;

    let (_, data) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("punch callback")
        .unwrap();
    assert_eq!(data.as_ref(), b"hole punching helper");

    // no channel was created for the punch sender
    assert_eq!(server.num_channels(), 0);

    client.close().await;
    server.close().await;
}
