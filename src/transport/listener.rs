use std::net::SocketAddr;
use std::sync::Mutex;

use rand::Rng;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::MessageRouterServer;
use crate::config::ServerSettings;
use crate::transport::websocket::{ConnectionOptions, handle_connection};
use crate::utils::error::{MessageRouterError, Result};

/// Attempts made to find a free port before giving up.
const MAX_PORT_PROBES: usize = 100;

/// Accepts WebSocket clients and hands them to the broker.
///
/// The listener's stop token is a child of the broker's, so shutting the
/// broker down stops accepting as well.
pub struct WebSocketServer {
    local_addr: SocketAddr,
    root_path: String,
    stop: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketServer {
    /// Binds the configured port (or probes for a free one) and starts accepting.
    pub async fn start(
        settings: &ServerSettings,
        broker: MessageRouterServer,
        queue_capacity: usize,
    ) -> Result<Self> {
        let listener = bind(settings).await?;
        let local_addr = listener.local_addr()?;
        let options = ConnectionOptions::new(&settings.root_path, queue_capacity);
        let stop = broker.stop_token().child_token();

        let root_path = options.root_path.clone();
        info!("WebSocket server listening on ws://{local_addr}{root_path}");

        let accept_task = tokio::spawn(accept_loop(listener, broker, options, stop.clone()));

        Ok(Self {
            local_addr,
            root_path,
            stop,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL clients connect to, e.g. `ws://127.0.0.1:49215/`.
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.local_addr, self.root_path)
    }

    /// Stops accepting, closes every connection and waits for their tasks.
    pub async fn stop(&self) {
        self.stop.cancel();

        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                warn!(error = %e, "accept loop ended abnormally");
            }
        }
        info!(addr = %self.local_addr, "WebSocket server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    broker: MessageRouterServer,
    options: ConnectionOptions,
    stop: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted TCP connection");
                    connections.spawn(handle_connection(
                        stream,
                        broker.clone(),
                        options.clone(),
                        stop.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "failed to accept connection"),
            },
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn bind(settings: &ServerSettings) -> Result<TcpListener> {
    let host = settings.host.as_str();

    if let Some(port) = settings.port {
        return Ok(TcpListener::bind((host, port)).await?);
    }

    let (start, end) = (settings.port_range_start, settings.port_range_end);
    if start >= end {
        return Err(MessageRouterError::Io(format!(
            "empty port range {start}..{end}"
        )));
    }

    for _ in 0..MAX_PORT_PROBES {
        let port = rand::rng().random_range(start..end);
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!(port, error = %e, "port unavailable"),
        }
    }

    Err(MessageRouterError::Io(format!(
        "no free port found in {start}..{end} after {MAX_PORT_PROBES} attempts"
    )))
}
