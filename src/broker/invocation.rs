use uuid::Uuid;

use crate::broker::topic::ClientId;

/// Links a caller's `Invoke` to the re-addressed request forwarded to the
/// service client.
///
/// Keyed in the broker by `service_request_id`, which the broker mints itself.
/// The record is consumed exactly once: by the matching `InvokeResponse`, or
/// when either side disconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInvocation {
    pub caller_request_id: String,
    pub service_request_id: String,
    pub caller_client_id: ClientId,
    pub service_client_id: ClientId,
}

impl ServiceInvocation {
    pub fn new(caller_request_id: String, caller_client_id: ClientId, service_client_id: ClientId) -> Self {
        Self {
            caller_request_id,
            service_request_id: new_service_request_id(),
            caller_client_id,
            service_client_id,
        }
    }

    /// Whether the client takes part in this invocation on either side.
    pub fn involves(&self, client_id: &str) -> bool {
        self.caller_client_id == client_id || self.service_client_id == client_id
    }
}

fn new_service_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}
