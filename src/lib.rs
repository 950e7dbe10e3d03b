//! Reliable, ordered, encrypted message transport tunneled through a single UDP socket.
//!
//! Peers exchange arbitrarily sized application messages through *channels*, one channel
//!  per remote address. Within a channel the transport guarantees in-order, exactly-once
//!  delivery: every data packet carries a 24-bit wrapping sequence id, is acknowledged
//!  individually, and is retransmitted until acknowledged or until the channel is given
//!  up on. Messages larger than a single datagram are split into fragments and
//!  reassembled on the receiving side.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data as
//!   opposed to streams of bytes)
//! * A single UDP socket per endpoint handles all channels; the endpoint routes inbound
//!   datagrams to per-channel dispatch queues so channels do not contend on the hot path
//! * A connection handshake establishes a per-channel symmetric session key via an RSA
//!   key exchange; data payloads are encrypted per packet from then on
//! * Sending is paced adaptively: the per-channel send delay converges just below the
//!   rate at which the path starts dropping packets
//! * Retransmission backs off exponentially per packet, driven by a smoothed round-trip
//!   time estimate
//! * Inactive channels ping their peer and are eventually torn down; both sides clean up
//!   independently
//!
//! ## Wire format
//!
//! Every datagram starts with a fixed 4-byte header - one little-endian `u32` packing
//!  the packet status and id:
//!
//! ```ascii
//! byte 0..3: status & id word (u32 LE)
//!            * bits  0..23: packet id (wrapping sequence number, DATA/ACK only)
//!            * bits 24..31: status
//! byte 4..N: payload (possibly empty; encrypted for DATA packets once the
//!            session key is established)
//! ```
//!
//! Status values:
//!
//! ```ascii
//! 0 CONNECT                 handshake: client public key
//! 1 CONNECT_SERVER_ANSWER   handshake: server public key (RSA-encrypted)
//! 2 CONNECT_CLIENT_ANSWER   handshake: session key (RSA-encrypted)
//! 3 CONNECT_DONE            handshake: completion marker
//! 4 DATA                    application payload, acknowledged and retransmitted
//! 5 ACK                     acknowledgement for one DATA id
//! 6 PING                    keepalive probe (unreliable)
//! 7 PONG                    keepalive answer (unreliable)
//! 8 DISCONNECT              peer is closing the channel
//! 9 PUNCH                   NAT-traversal passthrough, handed to the application
//! ```
//!
//! Bit 7 of the status byte (`0x80`) is the SPLIT flag: a DATA packet whose payload is
//!  a non-final fragment of a larger message. The final fragment is a plain DATA packet;
//!  its arrival completes reassembly.
//!
//! ## Handshake
//!
//! Four packets, correlated by a client-generated UUID:
//!
//! ```ascii
//! client -> server  CONNECT               { len u8, uuid, client public key PEM }
//! server -> client  CONNECT_SERVER_ANSWER { len u8, uuid, OAEP(client pub, server public key PEM) }
//! client -> server  CONNECT_CLIENT_ANSWER { len u8, uuid, OAEP(server pub, session key) }
//! server -> client  CONNECT_DONE          { len u8, uuid }
//! ```
//!
//! The session key is 32 random bytes generated by the client. Handshake packets are
//!  sent unreliably on the calling path; the client retries by failing `connect` after
//!  a deadline and letting the application try again.

pub mod channel;
pub mod config;
mod connect;
mod crypt;
pub mod end_point;
mod error;
pub mod packet;
pub mod reader;
mod receive_queue;
mod send_queue;
mod split;
pub mod stats;

pub use channel::Channel;
pub use config::RudpConfig;
pub use end_point::EndPoint;
pub use error::{DisconnectReason, TransportError};
pub use packet::{Packet, PacketHeader, PacketId, PacketType};
pub use reader::{ConnectListener, DeliveryFn, MessageReader, PunchListener};

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
