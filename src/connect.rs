//! The four-way connection handshake and its UUID rendezvous.
//!
//! The initiating side generates a UUID, registers a one-shot rendezvous slot under
//!  it and sends CONNECT. All four handshake packets carry the UUID, so the answers
//!  find their way back to the waiting `connect` call; CONNECT_DONE resolves the
//!  slot with the established channel. The whole exchange runs against a deadline -
//!  no packet of it is retransmitted.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::channel::Channel;
use crate::crypt;
use crate::end_point::EndPointShared;
use crate::error::TransportError;
use crate::packet::{Packet, PacketHeader, PacketId, PacketType};
use crate::reader::MessageReader;

/// Payload of the handshake packets: `{ len u8, uuid ascii, key material }`.
/// CONNECT_DONE carries an empty key-material field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectPayload {
    pub uuid: String,
    pub data: Bytes,
}

impl ConnectPayload {
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.uuid.len() + self.data.len());
        buf.put_u8(self.uuid.len() as u8);
        buf.put_slice(self.uuid.as_bytes());
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn unmarshal(mut buf: &[u8]) -> anyhow::Result<ConnectPayload> {
        let len = Buf::try_get_u8(&mut buf)? as usize;
        if buf.remaining() < len {
            bail!("handshake payload shorter than its uuid length field");
        }
        let uuid = std::str::from_utf8(&buf[..len])?.to_string();
        buf.advance(len);

        Ok(ConnectPayload {
            uuid,
            data: Bytes::copy_from_slice(buf),
        })
    }
}

struct PendingConnect {
    tx: Option<oneshot::Sender<Arc<Channel>>>,
    channel: Option<Arc<Channel>>,
}

/// Maps handshake UUIDs to the `connect` calls waiting on them.
pub(crate) struct Rendezvous {
    pending: Mutex<FxHashMap<String, PendingConnect>>,
}

impl Rendezvous {
    pub fn new() -> Rendezvous {
        Rendezvous {
            pending: Mutex::new(FxHashMap::default()),
        }
    }

    fn register(&self, uuid: &str) -> oneshot::Receiver<Arc<Channel>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            uuid.to_string(),
            PendingConnect {
                tx: Some(tx),
                channel: None,
            },
        );
        rx
    }

    fn is_registered(&self, uuid: &str) -> bool {
        self.pending.lock().unwrap().contains_key(uuid)
    }

    /// Remembers the channel created for this handshake so CONNECT_DONE can hand it
    ///  to the waiting `connect` call. False when the uuid is unknown.
    fn attach_channel(&self, uuid: &str, channel: Arc<Channel>) -> bool {
        match self.pending.lock().unwrap().get_mut(uuid) {
            Some(pending) => {
                pending.channel = Some(channel);
                true
            }
            None => false,
        }
    }

    /// Resolves the rendezvous: wakes the waiting `connect` call with the channel.
    fn complete(&self, uuid: &str) -> bool {
        let mut pending = self.pending.lock().unwrap();
        let Some(entry) = pending.get_mut(uuid) else {
            return false;
        };
        match (entry.tx.take(), entry.channel.clone()) {
            (Some(tx), Some(channel)) => {
                // the receiver may be gone when connect timed out concurrently
                tx.send(channel).ok();
                true
            }
            _ => false,
        }
    }

    fn deregister(&self, uuid: &str) {
        self.pending.lock().unwrap().remove(uuid);
    }
}

/// Client side: runs the full handshake against `addr` and returns the established
///  channel, or [`TransportError::HandshakeTimeout`] when the deadline passes first.
pub(crate) async fn connect(
    shared: &Arc<EndPointShared>,
    addr: SocketAddr,
    reader: Option<Arc<dyn MessageReader>>,
) -> anyhow::Result<Arc<Channel>> {
    let public_key_pem = crypt::public_key_to_pem(&shared.private_key().to_public_key())?;

    let uuid = Uuid::new_v4().to_string();
    debug!("connecting to {} (handshake {})", addr, uuid);

    let payload = ConnectPayload {
        uuid: uuid.clone(),
        data: public_key_pem,
    };
    let packet = Packet::new(
        PacketHeader::new(PacketType::Connect, PacketId::ZERO),
        payload.marshal(),
    );

    let rx = shared.rendezvous().register(&uuid);
    let result = wait_for_answer(shared, addr, packet, rx).await;
    shared.rendezvous().deregister(&uuid);

    let channel = result?;
    if let Some(reader) = reader {
        channel.set_reader(reader);
    }
    debug!("connected to {}", addr);
    Ok(channel)
}

async fn wait_for_answer(
    shared: &Arc<EndPointShared>,
    addr: SocketAddr,
    packet: Packet,
    rx: oneshot::Receiver<Arc<Channel>>,
) -> anyhow::Result<Arc<Channel>> {
    // handshake packets bypass the sender worker
    shared.write_raw(&packet.marshal(), addr).await;

    match tokio::time::timeout(shared.config().handshake_timeout, rx).await {
        Ok(Ok(channel)) => Ok(channel),
        // sender dropped: the nascent channel was destroyed under us
        Ok(Err(_)) => Err(TransportError::HandshakeTimeout.into()),
        Err(_) => Err(TransportError::HandshakeTimeout.into()),
    }
}

/// Dispatches one inbound handshake packet. An error from here destroys the
///  channel at that address, if one was created already.
pub(crate) async fn serve(
    shared: &Arc<EndPointShared>,
    from: SocketAddr,
    packet: Packet,
) -> anyhow::Result<()> {
    trace!("handshake packet {:?} from {}", packet.packet_type(), from);

    match packet.packet_type() {
        Some(PacketType::Connect) => on_connect(shared, from, packet).await,
        Some(PacketType::ConnectServerAnswer) => on_server_answer(shared, from, packet).await,
        Some(PacketType::ConnectClientAnswer) => on_client_answer(shared, from, packet).await,
        Some(PacketType::ConnectDone) => on_done(shared, packet),
        other => bail!("{:?} is not a handshake packet", other),
    }
}

/// Server side: a client opens a handshake with its public key. Answer with our
///  public key, encrypted so only that client can read it.
async fn on_connect(
    shared: &Arc<EndPointShared>,
    from: SocketAddr,
    packet: Packet,
) -> anyhow::Result<()> {
    let payload = ConnectPayload::unmarshal(packet.data())?;
    let client_public_key = crypt::public_key_from_pem(&payload.data)?;

    let channel = shared.create_channel(from, true);

    let server_key_pem = crypt::public_key_to_pem(&shared.private_key().to_public_key())?;
    let answer = ConnectPayload {
        uuid: payload.uuid,
        data: crypt::rsa_encrypt(&client_public_key, &server_key_pem)?,
    };
    let answer_packet = Packet::new(
        PacketHeader::new(PacketType::ConnectServerAnswer, PacketId::ZERO),
        answer.marshal(),
    );
    shared.write_raw(&answer_packet.marshal(), from).await;

    if let Some(listener) = &shared.config().connect_listener {
        listener.on_connect(&channel).await;
    }
    Ok(())
}

/// Client side: the server answered with its public key. Generate the session key
///  and send it over, encrypted under the server's key.
async fn on_server_answer(
    shared: &Arc<EndPointShared>,
    from: SocketAddr,
    packet: Packet,
) -> anyhow::Result<()> {
    let payload = ConnectPayload::unmarshal(packet.data())?;
    if !shared.rendezvous().is_registered(&payload.uuid) {
        bail!("server answer for unknown handshake {}", payload.uuid);
    }

    let channel = shared.create_channel(from, false);
    shared.rendezvous().attach_channel(&payload.uuid, channel.clone());

    let server_key_pem = channel.decrypt_handshake_data(&payload.data)?;
    let server_public_key = crypt::public_key_from_pem(&server_key_pem)?;

    let session_key = crypt::generate_session_key();
    let answer = ConnectPayload {
        uuid: payload.uuid,
        data: crypt::rsa_encrypt(&server_public_key, &session_key)?,
    };
    let answer_packet = Packet::new(
        PacketHeader::new(PacketType::ConnectClientAnswer, PacketId::ZERO),
        answer.marshal(),
    );
    shared.write_raw(&answer_packet.marshal(), from).await;

    channel.install_session_key(session_key);
    Ok(())
}

/// Server side: the client sent the session key. Install it and confirm.
async fn on_client_answer(
    shared: &Arc<EndPointShared>,
    from: SocketAddr,
    packet: Packet,
) -> anyhow::Result<()> {
    let payload = ConnectPayload::unmarshal(packet.data())?;
    let Some(channel) = shared.get_channel(&from.to_string()) else {
        bail!("client answer from {} without a channel", from);
    };

    let session_key = channel.decrypt_handshake_data(&payload.data)?;
    if session_key.len() != crypt::SESSION_KEY_LEN {
        bail!("session key of length {} received", session_key.len());
    }
    channel.install_session_key(session_key);

    let done = ConnectPayload {
        uuid: payload.uuid,
        data: Bytes::new(),
    };
    let done_packet = Packet::new(
        PacketHeader::new(PacketType::ConnectDone, PacketId::ZERO),
        done.marshal(),
    );
    shared.write_raw(&done_packet.marshal(), from).await;
    Ok(())
}

/// Client side: handshake complete, wake the waiting `connect` call.
fn on_done(shared: &Arc<EndPointShared>, packet: Packet) -> anyhow::Result<()> {
    let payload = ConnectPayload::unmarshal(packet.data())?;
    if !shared.rendezvous().complete(&payload.uuid) {
        bail!("connect done for unknown handshake {}", payload.uuid);
    }
    Ok(())
}
