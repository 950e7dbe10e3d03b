//! Application-facing capability objects: message readers, lifecycle listeners and
//!  per-packet delivery callbacks. Nothing about their representation is part of the
//!  wire contract.

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::channel::Channel;
use crate::error::TransportError;
use crate::packet::{Packet, PacketId};

/// Receives in-order application messages from a channel.
///
/// A channel's own reader (registered at connect time) is tried first; when it reports
///  the message as not processed, the endpoint's global reader is invoked.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageReader: Send + Sync + 'static {
    /// Called once per delivered application message, in send order. Returns true
    ///  when the message was consumed, suppressing the fallback to the global reader.
    async fn on_message(&self, channel: &Arc<Channel>, message: Packet) -> bool;

    /// Terminal notification: the channel was destroyed (`channel` is set) or the
    ///  endpoint was closed (`channel` is `None`). Fired exactly once per reader.
    async fn on_error<'a>(&self, channel: Option<&'a Arc<Channel>>, error: TransportError) {
        let _ = (channel, error);
    }
}

/// Notified when a remote peer completes a handshake with this endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectListener: Send + Sync + 'static {
    async fn on_connect(&self, channel: &Arc<Channel>);
}

/// Receives PUNCH packets - the NAT-traversal passthrough. The transport does not
///  interpret these in any way and no channel state is touched.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PunchListener: Send + Sync + 'static {
    async fn on_punch(&self, from: SocketAddr, data: Bytes);
}

/// Per-packet delivery callback, registered with a write and invoked exactly once:
///  with `Ok` when the ACK for the message's first packet arrives, or with an error
///  on delivery timeout or channel destruction.
pub type DeliveryFn = Box<dyn FnOnce(PacketId, Result<(), TransportError>) + Send + 'static>;
