use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::broker::topic::ClientId;
use crate::connection::{ClientConnection, ConnectionId};
use crate::protocol::Message;
use crate::utils::error::Result;

/// Broker-side state of one connection.
///
/// The client id is minted up front so the validator can see it, but it only
/// becomes visible to routing once the handshake succeeds.
pub(crate) struct ClientSession {
    id: ClientId,
    connection: Arc<dyn ClientConnection>,
    registered: AtomicBool,
    finished: CancellationToken,
}

impl ClientSession {
    pub(crate) fn new(connection: Arc<dyn ClientConnection>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            connection,
            registered: AtomicBool::new(false),
            finished: CancellationToken::new(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub(crate) fn connection(&self) -> &Arc<dyn ClientConnection> {
        &self.connection
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    pub(crate) async fn send(&self, message: Message) -> Result<()> {
        self.connection.send(message).await
    }

    /// Held by the dispatch loop; dropping it (even while unwinding) marks the session finished.
    pub(crate) fn finish_guard(&self) -> DropGuard {
        self.finished.clone().drop_guard()
    }

    /// Resolves once the dispatch loop has exited and the session is cleaned up.
    pub(crate) async fn finished(&self) {
        self.finished.cancelled().await
    }
}
