//! Bounded queue pair backing a `ClientConnection`.
//!
//! `channel` returns the broker-facing `QueuedConnection` and the transport-facing
//! `ConnectionPeer`. Both queues are bounded, so a client that stops reading
//! eventually applies back-pressure to whoever sends to it. Cancelling the stop
//! token completes both directions at once: nothing new is accepted, but
//! messages already queued are still handed out before the reader sees the end.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::connection::{ClientConnection, ConnectionId};
use crate::protocol::Message;
use crate::utils::error::{MessageRouterError, Result};

pub fn channel(capacity: usize, stop: CancellationToken) -> (Arc<QueuedConnection>, ConnectionPeer) {
    let capacity = capacity.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    let connection = Arc::new(QueuedConnection {
        id: ConnectionId::new(),
        inbound: Mutex::new(inbound_rx),
        outbound: outbound_tx,
        stop: stop.clone(),
    });

    let peer = ConnectionPeer {
        sink: InboundSink {
            inbound: inbound_tx,
            stop: stop.clone(),
        },
        source: OutboundSource {
            outbound: outbound_rx,
            stop,
        },
    };

    (connection, peer)
}

/// Broker side of the queue pair.
#[derive(Debug)]
pub struct QueuedConnection {
    id: ConnectionId,
    inbound: Mutex<mpsc::Receiver<Result<Message>>>,
    outbound: mpsc::Sender<Message>,
    stop: CancellationToken,
}

impl QueuedConnection {
    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }
}

#[async_trait]
impl ClientConnection for QueuedConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, message: Message) -> Result<()> {
        if self.stop.is_cancelled() {
            return Err(MessageRouterError::ConnectionClosed);
        }

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(MessageRouterError::ConnectionClosed),
            sent = self.outbound.send(message) => sent.map_err(|_| MessageRouterError::ConnectionClosed),
        }
    }

    async fn receive(&self) -> Result<Message> {
        let mut inbound = self.inbound.lock().await;

        let item = tokio::select! {
            biased;
            item = inbound.recv() => item,
            _ = self.stop.cancelled() => {
                // Completed: hand out what is left, including a recorded failure.
                inbound.close();
                inbound.recv().await
            }
        };
        item.unwrap_or(Err(MessageRouterError::ConnectionClosed))
    }

    async fn close(&self) {
        self.stop.cancel();
    }
}

/// Transport side of the queue pair.
#[derive(Debug)]
pub struct ConnectionPeer {
    sink: InboundSink,
    source: OutboundSource,
}

impl ConnectionPeer {
    /// Splits the peer so the receive and send pumps can run concurrently.
    pub fn split(self) -> (InboundSink, OutboundSource) {
        (self.sink, self.source)
    }

    pub async fn deliver(&self, message: Message) -> Result<()> {
        self.sink.deliver(message).await
    }

    pub async fn next_outgoing(&mut self) -> Option<Message> {
        self.source.next().await
    }

    pub fn close(&self) {
        self.sink.stop.cancel();
    }
}

/// Writes decoded inbound messages for the broker to receive.
#[derive(Debug, Clone)]
pub struct InboundSink {
    inbound: mpsc::Sender<Result<Message>>,
    stop: CancellationToken,
}

impl InboundSink {
    pub async fn deliver(&self, message: Message) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(MessageRouterError::ConnectionClosed),
            sent = self.inbound.send(Ok(message)) => sent.map_err(|_| MessageRouterError::ConnectionClosed),
        }
    }

    /// Ends the inbound stream with `error`; the broker sees it on its next receive.
    pub async fn fail(&self, error: MessageRouterError) {
        if self.stop.is_cancelled() {
            return;
        }
        if let Err(e) = self.inbound.try_send(Err(error)) {
            warn!(error = %e, "could not record transport failure");
        }
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }
}

/// Reads messages queued by the broker for the wire.
#[derive(Debug)]
pub struct OutboundSource {
    outbound: mpsc::Receiver<Message>,
    stop: CancellationToken,
}

impl OutboundSource {
    /// Next message to write. After the connection is stopped the messages
    /// already queued are still returned, then `None`.
    pub async fn next(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            message = self.outbound.recv() => message,
            _ = self.stop.cancelled() => {
                self.outbound.close();
                self.outbound.recv().await
            }
        }
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }
}
