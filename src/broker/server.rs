use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::invocation::ServiceInvocation;
use crate::broker::session::ClientSession;
use crate::broker::topic::{ClientId, Topic};
use crate::broker::validator::{AccessTokenValidator, StaticTokenValidator};
use crate::config::BrokerSettings;
use crate::connection::{ClientConnection, ConnectionId};
use crate::protocol::names::{is_valid_topic_name, validate_endpoint};
use crate::protocol::{
    ConnectRequest, ConnectResponse, ErrorInfo, InvokeRequest, InvokeResponse, Message,
    PublishMessage, RegisterServiceRequest, RegisterServiceResponse, SubscribeMessage,
    TopicMessage, UnregisterServiceRequest, UnregisterServiceResponse, UnsubscribeMessage,
};
use crate::utils::error::{MessageRouterError, Result};

/// The message router broker.
///
/// Owns the four registries (clients, topics, services, invocations) and runs
/// one dispatch loop per connection. Messages from one client are handled
/// strictly in arrival order; different clients are handled concurrently.
///
/// Cloning is cheap and every clone drives the same broker.
#[derive(Clone)]
pub struct MessageRouterServer {
    inner: Arc<Inner>,
}

struct Inner {
    /// Every live connection, registered or not.
    connections: DashMap<ConnectionId, Arc<ClientSession>>,
    /// Clients that completed the handshake, by client id.
    clients: DashMap<ClientId, Arc<ClientSession>>,
    topics: DashMap<String, Topic>,
    /// Endpoint to owning client.
    services: DashMap<String, ClientId>,
    /// Pending invocations by service request id.
    invocations: DashMap<String, ServiceInvocation>,
    validator: Option<Arc<dyn AccessTokenValidator>>,
    stop: CancellationToken,
}

impl Default for MessageRouterServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRouterServer {
    /// A broker that accepts every client.
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_validator(validator: impl AccessTokenValidator + 'static) -> Self {
        Self::build(Some(Arc::new(validator)))
    }

    /// Validates tokens against `access_tokens` when the list is non-empty.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        if settings.access_tokens.is_empty() {
            Self::new()
        } else {
            Self::with_validator(StaticTokenValidator::new(settings.access_tokens.iter().cloned()))
        }
    }

    fn build(validator: Option<Arc<dyn AccessTokenValidator>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: DashMap::new(),
                clients: DashMap::new(),
                topics: DashMap::new(),
                services: DashMap::new(),
                invocations: DashMap::new(),
                validator,
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Token cancelled when the broker shuts down. Transports link their
    /// connection tokens to it.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.inner.stop
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Takes over a new connection and starts its dispatch loop.
    ///
    /// The client is not routable until it sends a successful `Connect`.
    pub async fn client_connected(&self, connection: Arc<dyn ClientConnection>) -> Result<()> {
        if self.is_shutdown() {
            connection.close().await;
            return Err(MessageRouterError::ConnectionClosed);
        }

        let session = Arc::new(ClientSession::new(connection));
        debug!(connection_id = %session.connection_id(), "connection accepted");
        self.inner
            .connections
            .insert(session.connection_id(), session.clone());

        let server = self.clone();
        tokio::spawn(async move { server.process_messages(session).await });
        Ok(())
    }

    /// Closes the connection and waits until its dispatch loop has exited and
    /// the client has been removed from every registry.
    pub async fn client_disconnected(&self, connection_id: ConnectionId) {
        let Some(session) = self
            .inner
            .connections
            .get(&connection_id)
            .map(|entry| entry.value().clone())
        else {
            return;
        };

        session.connection().close().await;
        session.finished().await;
    }

    /// Stops every dispatch loop and waits for all of them to finish.
    ///
    /// No message is processed once this returns.
    pub async fn shutdown(&self) {
        info!("message router shutting down");
        self.inner.stop.cancel();

        let sessions: Vec<Arc<ClientSession>> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        join_all(sessions.iter().map(|session| async move {
            session.connection().close().await;
            session.finished().await;
        }))
        .await;

        info!("message router stopped");
    }

    /// Number of clients that completed the handshake.
    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Number of live connections, including ones still awaiting `Connect`.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.inner.clients.contains_key(client_id)
    }

    /// Current subscribers of `topic`, sorted.
    pub fn subscribers(&self, topic: &str) -> Vec<ClientId> {
        let mut subscribers = self
            .inner
            .topics
            .get(topic)
            .map(|topic| topic.snapshot())
            .unwrap_or_default();
        subscribers.sort();
        subscribers
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics.len()
    }

    pub fn service_owner(&self, endpoint: &str) -> Option<ClientId> {
        self.inner
            .services
            .get(endpoint)
            .map(|owner| owner.value().clone())
    }

    pub fn pending_invocations(&self) -> usize {
        self.inner.invocations.len()
    }

    async fn process_messages(self, session: Arc<ClientSession>) {
        let _finished = session.finish_guard();
        let stop = self.inner.stop.clone();

        loop {
            let received = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                received = session.connection().receive() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(MessageRouterError::ConnectionClosed) => break,
                Err(err) if err.is_connection_error() => {
                    warn!(connection_id = %session.connection_id(), error = %err, "connection aborted");
                    break;
                }
                Err(err) => {
                    warn!(connection_id = %session.connection_id(), error = %err, "dropping unreadable message");
                    continue;
                }
            };

            let message_type = message.message_type();
            match AssertUnwindSafe(self.dispatch(&session, message))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(client_id = %session.id(), message_type, error = %err, "failed to handle message");
                }
                Err(panic) => {
                    let err = MessageRouterError::Handler(panic_message(panic.as_ref()));
                    error!(client_id = %session.id(), message_type, error = %err, "{}", err.name());
                }
            }
        }

        self.remove_session(&session).await;
    }

    async fn dispatch(&self, session: &Arc<ClientSession>, message: Message) -> Result<()> {
        debug!(client_id = %session.id(), message_type = message.message_type(), "dispatching");

        if !session.is_registered() {
            return match message {
                Message::Connect(request) => self.on_connect(session, request).await,
                other => self.reject_unconnected(session, other).await,
            };
        }

        match message {
            Message::Connect(_) => {
                debug!(client_id = %session.id(), "repeated connect");
                session
                    .send(Message::ConnectResponse(ConnectResponse {
                        client_id: Some(session.id().to_string()),
                        error: None,
                    }))
                    .await
            }
            Message::Subscribe(request) => {
                self.on_subscribe(session, request);
                Ok(())
            }
            Message::Unsubscribe(request) => {
                self.on_unsubscribe(session, request);
                Ok(())
            }
            Message::Publish(request) => {
                self.on_publish(session, request).await;
                Ok(())
            }
            Message::Invoke(request) => self.on_invoke(session, request).await,
            Message::InvokeResponse(response) => {
                self.on_invoke_response(session, response).await;
                Ok(())
            }
            Message::RegisterService(request) => self.on_register_service(session, request).await,
            Message::UnregisterService(request) => {
                self.on_unregister_service(session, request).await
            }
            other @ (Message::ConnectResponse(_)
            | Message::Topic(_)
            | Message::RegisterServiceResponse(_)
            | Message::UnregisterServiceResponse(_)) => {
                warn!(client_id = %session.id(), message_type = other.message_type(), "ignoring server-to-client message");
                Ok(())
            }
        }
    }

    async fn on_connect(&self, session: &Arc<ClientSession>, request: ConnectRequest) -> Result<()> {
        if let Err(err) = self
            .validate_access_token(session.id(), request.access_token.as_deref())
            .await
        {
            warn!(connection_id = %session.connection_id(), error = %err, "connect rejected");
            return session
                .send(Message::ConnectResponse(ConnectResponse {
                    client_id: None,
                    error: Some(ErrorInfo::from(&err)),
                }))
                .await;
        }

        session.mark_registered();
        self.inner
            .clients
            .insert(session.id().to_string(), session.clone());
        info!(client_id = %session.id(), connection_id = %session.connection_id(), "client connected");

        session
            .send(Message::ConnectResponse(ConnectResponse {
                client_id: Some(session.id().to_string()),
                error: None,
            }))
            .await
    }

    async fn validate_access_token(&self, client_id: &str, access_token: Option<&str>) -> Result<()> {
        let Some(validator) = &self.inner.validator else {
            return Ok(());
        };

        match AssertUnwindSafe(validator.validate(client_id, access_token))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err @ MessageRouterError::AccessTokenRejected(_))) => Err(err),
            Ok(Err(err)) => Err(MessageRouterError::AccessTokenRejected(err.to_string())),
            Err(panic) => Err(MessageRouterError::AccessTokenRejected(panic_message(
                panic.as_ref(),
            ))),
        }
    }

    /// Requests arriving before the handshake get a `NotConnected` response so
    /// the sender does not wait for one forever; everything else is dropped.
    async fn reject_unconnected(&self, session: &ClientSession, message: Message) -> Result<()> {
        let error = Some(ErrorInfo::from(MessageRouterError::NotConnected));
        let response = match message {
            Message::Invoke(request) => Message::InvokeResponse(InvokeResponse {
                request_id: request.request_id,
                payload: None,
                error,
            }),
            Message::RegisterService(request) => {
                Message::RegisterServiceResponse(RegisterServiceResponse {
                    request_id: request.request_id,
                    error,
                })
            }
            Message::UnregisterService(request) => {
                Message::UnregisterServiceResponse(UnregisterServiceResponse {
                    request_id: request.request_id,
                    error,
                })
            }
            other => {
                warn!(connection_id = %session.connection_id(), message_type = other.message_type(), "dropping message from unconnected client");
                return Ok(());
            }
        };

        session.send(response).await
    }

    fn on_subscribe(&self, session: &ClientSession, request: SubscribeMessage) {
        if !is_valid_topic_name(&request.topic) {
            debug!(client_id = %session.id(), topic = %request.topic, "ignoring subscribe to invalid topic");
            return;
        }

        self.inner
            .topics
            .entry(request.topic.clone())
            .or_insert_with(|| Topic::new(&request.topic))
            .subscribe(session.id().to_string());
        debug!(client_id = %session.id(), topic = %request.topic, "subscribed");
    }

    fn on_unsubscribe(&self, session: &ClientSession, request: UnsubscribeMessage) {
        if !is_valid_topic_name(&request.topic) {
            return;
        }

        if let Some(mut topic) = self.inner.topics.get_mut(&request.topic) {
            topic.unsubscribe(session.id());
        }
        self.inner
            .topics
            .remove_if(&request.topic, |_, topic| topic.is_empty());
        debug!(client_id = %session.id(), topic = %request.topic, "unsubscribed");
    }

    async fn on_publish(&self, session: &ClientSession, request: PublishMessage) {
        if !is_valid_topic_name(&request.topic) {
            debug!(client_id = %session.id(), topic = %request.topic, "ignoring publish to invalid topic");
            return;
        }

        // Snapshot first: no registry guard may be held across the sends.
        let Some(subscribers) = self
            .inner
            .topics
            .get(&request.topic)
            .map(|topic| topic.snapshot())
        else {
            return;
        };

        let target = request.scope.client_id();
        let recipients: Vec<Arc<ClientSession>> = subscribers
            .iter()
            .filter(|id| target.is_none_or(|target| target == id.as_str()))
            .filter_map(|id| self.client(id))
            .collect();

        let topic_message = TopicMessage {
            topic: request.topic,
            payload: request.payload,
            scope: request.scope,
            source_id: Some(session.id().to_string()),
            correlation_id: request.correlation_id,
        };

        let deliveries = recipients.iter().map(|recipient| {
            let message = Message::Topic(topic_message.clone());
            async move { (recipient.id(), recipient.send(message).await) }
        });

        for (recipient, result) in join_all(deliveries).await {
            if let Err(err) = result {
                warn!(client_id = %recipient, topic = %topic_message.topic, error = %err, "failed to deliver topic message");
            }
        }
    }

    async fn on_register_service(&self, session: &ClientSession, request: RegisterServiceRequest) -> Result<()> {
        let result = self.register_service(session.id(), &request.endpoint);
        match &result {
            Ok(()) => info!(client_id = %session.id(), endpoint = %request.endpoint, "service registered"),
            Err(err) => warn!(client_id = %session.id(), endpoint = %request.endpoint, error = %err, "service registration failed"),
        }

        session
            .send(Message::RegisterServiceResponse(RegisterServiceResponse {
                request_id: request.request_id,
                error: result.err().map(ErrorInfo::from),
            }))
            .await
    }

    fn register_service(&self, owner: &str, endpoint: &str) -> Result<()> {
        validate_endpoint(endpoint)?;

        match self.inner.services.entry(endpoint.to_string()) {
            Entry::Occupied(_) => Err(MessageRouterError::DuplicateEndpoint(endpoint.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(owner.to_string());
                Ok(())
            }
        }
    }

    async fn on_unregister_service(&self, session: &ClientSession, request: UnregisterServiceRequest) -> Result<()> {
        // Only the owner's own registration is removed.
        if self
            .inner
            .services
            .remove_if(&request.endpoint, |_, owner| owner == session.id())
            .is_some()
        {
            info!(client_id = %session.id(), endpoint = %request.endpoint, "service unregistered");
        }

        session
            .send(Message::UnregisterServiceResponse(UnregisterServiceResponse {
                request_id: request.request_id,
                error: None,
            }))
            .await
    }

    async fn on_invoke(&self, session: &ClientSession, request: InvokeRequest) -> Result<()> {
        let caller_request_id = request.request_id.clone();
        let endpoint = request.endpoint.clone();

        let result = match AssertUnwindSafe(self.forward_invocation(session, request))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(MessageRouterError::Handler(panic_message(panic.as_ref()))),
        };

        let Err(err) = result else {
            return Ok(());
        };

        match &err {
            MessageRouterError::DuplicateRequestId(_) | MessageRouterError::Handler(_) => {
                error!(client_id = %session.id(), endpoint = %endpoint, error = %err, "invocation failed")
            }
            _ => warn!(client_id = %session.id(), endpoint = %endpoint, error = %err, "invocation failed"),
        }

        session
            .send(Message::InvokeResponse(InvokeResponse {
                request_id: caller_request_id,
                payload: None,
                error: Some(ErrorInfo::from(&err)),
            }))
            .await
    }

    async fn forward_invocation(&self, session: &ClientSession, request: InvokeRequest) -> Result<()> {
        let target = self.resolve_service_client(&request)?;

        let invocation = ServiceInvocation::new(
            request.request_id,
            session.id().to_string(),
            target.id().to_string(),
        );
        let service_request_id = invocation.service_request_id.clone();

        match self.inner.invocations.entry(service_request_id.clone()) {
            Entry::Occupied(_) => {
                return Err(MessageRouterError::DuplicateRequestId(service_request_id));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(invocation);
            }
        }

        let forwarded = InvokeRequest {
            request_id: service_request_id.clone(),
            endpoint: request.endpoint,
            payload: request.payload,
            scope: request.scope,
            source_id: Some(session.id().to_string()),
            correlation_id: request.correlation_id,
        };

        if let Err(err) = target.send(Message::Invoke(forwarded)).await {
            self.inner.invocations.remove(&service_request_id);
            return Err(err);
        }

        debug!(caller = %session.id(), service = %target.id(), service_request_id = %service_request_id, "invocation forwarded");
        Ok(())
    }

    fn resolve_service_client(&self, request: &InvokeRequest) -> Result<Arc<ClientSession>> {
        if let Some(client_id) = request.scope.client_id() {
            return self
                .client(client_id)
                .ok_or_else(|| MessageRouterError::UnknownClient(client_id.to_string()));
        }

        self.service_owner(&request.endpoint)
            .and_then(|owner| self.client(&owner))
            .ok_or_else(|| MessageRouterError::UnknownEndpoint(request.endpoint.clone()))
    }

    async fn on_invoke_response(&self, session: &ClientSession, response: InvokeResponse) {
        let removed = self
            .inner
            .invocations
            .remove_if(&response.request_id, |_, invocation| {
                invocation.service_client_id == session.id()
            });

        let Some((_, invocation)) = removed else {
            if self.inner.invocations.contains_key(&response.request_id) {
                warn!(client_id = %session.id(), service_request_id = %response.request_id, "dropping invoke response from a client that does not own the request");
            } else {
                debug!(client_id = %session.id(), service_request_id = %response.request_id, "dropping late or duplicate invoke response");
            }
            return;
        };

        self.reply_to_caller(
            &invocation,
            InvokeResponse {
                request_id: invocation.caller_request_id.clone(),
                payload: response.payload,
                error: response.error,
            },
        )
        .await;
    }

    async fn reply_to_caller(&self, invocation: &ServiceInvocation, response: InvokeResponse) {
        let Some(caller) = self.client(&invocation.caller_client_id) else {
            debug!(caller = %invocation.caller_client_id, "caller left before the response arrived");
            return;
        };

        if let Err(err) = caller.send(Message::InvokeResponse(response)).await {
            warn!(caller = %invocation.caller_client_id, error = %err, "failed to deliver invoke response");
        }
    }

    /// Drops every trace of the client: its subscriptions, its endpoints and
    /// the invocations it takes part in. Callers still waiting on this client
    /// as a service get a `ConnectionClosed` error response.
    async fn remove_session(&self, session: &ClientSession) {
        if self
            .inner
            .connections
            .remove(&session.connection_id())
            .is_none()
        {
            return;
        }

        if !session.is_registered() {
            debug!(connection_id = %session.connection_id(), "unconnected client left");
            return;
        }

        let client_id = session.id();
        self.inner.clients.remove(client_id);

        self.inner.topics.retain(|_, topic| {
            topic.unsubscribe(client_id);
            !topic.is_empty()
        });
        self.inner.services.retain(|_, owner| owner != client_id);

        let orphaned: Vec<String> = self
            .inner
            .invocations
            .iter()
            .filter(|entry| entry.value().involves(client_id))
            .map(|entry| entry.key().clone())
            .collect();

        for service_request_id in orphaned {
            let Some((_, invocation)) = self.inner.invocations.remove(&service_request_id) else {
                continue;
            };

            if invocation.service_client_id == client_id && invocation.caller_client_id != client_id {
                let response = InvokeResponse {
                    request_id: invocation.caller_request_id.clone(),
                    payload: None,
                    error: Some(ErrorInfo::from(MessageRouterError::ConnectionClosed)),
                };
                self.reply_to_caller(&invocation, response).await;
            }
        }

        info!(client_id = %client_id, "client disconnected");
    }

    fn client(&self, client_id: &str) -> Option<Arc<ClientSession>> {
        self.inner
            .clients
            .get(client_id)
            .map(|entry| entry.value().clone())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
