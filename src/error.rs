use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Why a channel was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local application closed the channel or the endpoint.
    Closed,
    /// No packet was received from the peer for the configured inactivity window.
    Inactive,
    /// A packet exceeded the retransmit-attempts ceiling.
    MaxRetransmits,
    /// The peer sent DISCONNECT.
    PeerDisconnect,
    /// The peer started a fresh handshake while the channel existed.
    Reconnect,
    /// The handshake failed after the channel had been created.
    HandshakeFailed,
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DisconnectReason::Closed => "closed",
            DisconnectReason::Inactive => "inactive",
            DisconnectReason::MaxRetransmits => "max retransmits",
            DisconnectReason::PeerDisconnect => "peer disconnect",
            DisconnectReason::Reconnect => "reconnect",
            DisconnectReason::HandshakeFailed => "handshake failed",
        };
        write!(f, "{}", text)
    }
}

/// Errors surfaced to the application.
///
/// Packet-level problems (malformed datagrams, crypto failures, duplicates) never
///  reach the application as errors - they are counted in the channel statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("could not connect to peer within the handshake deadline")]
    HandshakeTimeout,

    #[error("channel destroyed: {0}")]
    ChannelDestroyed(DisconnectReason),

    #[error("packet delivery timed out")]
    DeliveryTimeout,

    #[error("endpoint closed")]
    EndpointClosed,
}
