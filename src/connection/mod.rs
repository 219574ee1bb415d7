//! The `connection` module decouples the broker from any particular transport.
//!
//! The broker only sees `ClientConnection`: a duplex channel of typed messages.
//! Transports (the WebSocket one, or the in-memory pair used by tests) sit on
//! the other end of a `channel` and move messages between the queues and the wire.

pub mod channel;

use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::protocol::Message;
use crate::utils::error::Result;

pub use channel::{ConnectionPeer, InboundSink, OutboundSource, QueuedConnection, channel};

/// Unique identifier for a transport connection.
///
/// This is not the client id: a connection exists before the handshake, and
/// its client id is only handed out once `Connect` succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A duplex, message-oriented connection to one client.
///
/// `send` may be called concurrently from any number of tasks; ordering is only
/// kept per caller. `receive` has a single consumer, the broker's dispatch loop.
/// Both fail with `ConnectionClosed` once the connection is torn down and with
/// `ConnectionAborted` when the transport broke underneath.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Queues a message for delivery. Waits only for queue capacity, never for the network.
    async fn send(&self, message: Message) -> Result<()>;

    /// Next inbound message in arrival order.
    async fn receive(&self) -> Result<Message>;

    /// Starts a graceful teardown; pending and later calls fail with `ConnectionClosed`.
    async fn close(&self);
}

#[cfg(test)]
mod tests;
