//! WebSocket transport for one connection.
//!
//! `handle_connection` upgrades an accepted TCP stream, attaches a queue pair to
//! the broker and runs the two I/O pumps until either side goes away:
//! - the receive pump decodes WebSocket messages into router messages and
//!   feeds the inbound queue
//! - the send pump drains the outbound queue and writes one WebSocket text
//!   message per router message
//!
//! The broker's dispatch loop, reading the inbound queue, is the third unit.
//! Whichever pump stops first cancels the connection token, which stops the
//! other pump and unblocks any pending `send`/`receive`.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::MessageRouterServer;
use crate::connection::{ClientConnection, ConnectionId, InboundSink, OutboundSource, channel};
use crate::protocol::FrameDecoder;
use crate::protocol::codec;
use crate::utils::error::MessageRouterError;

/// Per-connection settings shared by every accepted socket.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Normalized path the upgrade request must target.
    pub root_path: String,
    pub queue_capacity: usize,
}

impl ConnectionOptions {
    pub fn new(root_path: &str, queue_capacity: usize) -> Self {
        Self {
            root_path: normalize_path(root_path),
            queue_capacity,
        }
    }
}

/// `/`-prefixed, without a trailing `/` unless it is the root itself.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{trimmed}")
}

/// Serves one client socket until it closes or `stop` is cancelled.
pub async fn handle_connection(
    stream: TcpStream,
    broker: MessageRouterServer,
    options: ConnectionOptions,
    stop: CancellationToken,
) {
    let peer_addr = stream.peer_addr().ok();
    let root_path = options.root_path.clone();

    let handshake = accept_hdr_async(stream, move |request: &Request, response: Response| {
        check_path(&root_path, request, response)
    });

    let ws_stream = tokio::select! {
        _ = stop.cancelled() => return,
        accepted = handshake => match accepted {
            Ok(ws) => ws,
            Err(e) => {
                warn!(peer = ?peer_addr, error = %e, "WebSocket handshake failed");
                return;
            }
        },
    };

    let (connection, peer) = channel(options.queue_capacity, stop.child_token());
    let connection_id = connection.id();
    info!(%connection_id, peer = ?peer_addr, "WebSocket connection opened");

    if let Err(e) = broker.client_connected(connection).await {
        debug!(%connection_id, error = %e, "broker refused connection");
        return;
    }

    let (inbound, outbound) = peer.split();
    let (ws_sender, ws_receiver) = ws_stream.split();

    tokio::join!(
        receive_pump(ws_receiver, inbound, connection_id),
        send_pump(ws_sender, outbound, connection_id),
    );

    broker.client_disconnected(connection_id).await;
    info!(%connection_id, "WebSocket connection closed");
}

fn check_path(root_path: &str, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if normalize_path(request.uri().path()) == root_path {
        return Ok(response);
    }

    debug!(path = %request.uri().path(), "rejecting upgrade for unknown path");
    let mut rejection = ErrorResponse::new(Some(format!("no endpoint at {}", request.uri().path())));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}

/// Socket to inbound queue.
pub(crate) async fn receive_pump<S>(mut ws_receiver: S, inbound: InboundSink, connection_id: ConnectionId)
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let stop = inbound.stop_token().clone();
    let mut decoder = FrameDecoder::new();

    'pump: loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = ws_receiver.next() => next,
        };

        match next {
            Some(Ok(WsMessage::Text(text))) => decoder.push(text.as_bytes()),
            Some(Ok(WsMessage::Binary(data))) => decoder.push(&data),
            Some(Ok(WsMessage::Close(frame))) => {
                debug!(%connection_id, ?frame, "close frame received");
                break;
            }
            // Pings are answered by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                let err = MessageRouterError::from(e);
                if err != MessageRouterError::ConnectionClosed {
                    warn!(%connection_id, error = %err, "WebSocket receive failed");
                    inbound.fail(err).await;
                }
                break;
            }
            None => break,
        }

        while let Some(decoded) = decoder.decode_next() {
            match decoded {
                Ok(message) => {
                    if inbound.deliver(message).await.is_err() {
                        break 'pump;
                    }
                }
                Err(err) => {
                    warn!(%connection_id, error = %err, "dropping malformed message");
                }
            }
        }

        // A WebSocket message never continues into the next one.
        if let Some(err) = decoder.finish() {
            warn!(%connection_id, error = %err, "dropping truncated message");
        }
    }

    stop.cancel();
}

/// Outbound queue to socket.
pub(crate) async fn send_pump<S>(mut ws_sender: S, mut outbound: OutboundSource, connection_id: ConnectionId)
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    while let Some(message) = outbound.next().await {
        let text = match codec::serialize(&message) {
            Ok(text) => text,
            Err(err) => {
                error!(%connection_id, error = %err, "failed to serialize message");
                continue;
            }
        };

        if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
            debug!(%connection_id, error = %e, "WebSocket send failed");
            break;
        }
    }

    outbound.stop_token().cancel();
    let _ = ws_sender.close().await;
}
