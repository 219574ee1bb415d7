use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ClientConnection, QueuedConnection, channel};
use crate::protocol::{
    ConnectRequest, ErrorInfo, InvokeRequest, InvokeResponse, Message, MessageScope,
    PublishMessage, RegisterServiceRequest, SubscribeMessage, TopicMessage,
    UnregisterServiceRequest, UnsubscribeMessage,
};
use crate::transport::websocket::{receive_pump, send_pump};
use crate::utils::error::{MessageRouterError, Result};

const QUEUE_CAPACITY: usize = 256;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback receiving every message published to a subscribed topic.
pub type TopicHandler = Arc<dyn Fn(TopicMessage) + Send + Sync>;

/// Callback serving invocations of a registered endpoint. The returned payload
/// becomes the response; an error is sent back to the caller instead.
pub type ServiceHandler =
    Arc<dyn Fn(InvokeRequest) -> BoxFuture<'static, Result<Option<String>>> + Send + Sync>;

/// Delivery options of `publish`.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Deliver only to this client, if it is subscribed.
    pub target_client: Option<String>,
    pub correlation_id: Option<String>,
}

/// Routing options of `invoke`.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Send the request to this client instead of the endpoint's registered owner.
    pub target_client: Option<String>,
    pub correlation_id: Option<String>,
}

fn scope_for(target_client: Option<&str>) -> MessageScope {
    target_client
        .map(MessageScope::from_client_id)
        .unwrap_or_default()
}

/// Client handle for a message router.
///
/// Cloning is cheap; all clones share one connection. Call `close` when done,
/// the background tasks keep the connection alive otherwise.
#[derive(Clone)]
pub struct MessageRouterClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    client_id: String,
    connection: Arc<QueuedConnection>,
    stop: CancellationToken,
    pending: DashMap<String, oneshot::Sender<Message>>,
    next_request_id: AtomicU64,
    topics: DashMap<String, Vec<(u64, TopicHandler)>>,
    next_subscriber_id: AtomicU64,
    services: DashMap<String, ServiceHandler>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageRouterClient {
    /// Opens a WebSocket to `url` and completes the `Connect` handshake.
    pub async fn connect(url: &str, access_token: Option<&str>) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (ws_sender, ws_receiver) = ws_stream.split();

        let stop = CancellationToken::new();
        let (connection, peer) = channel(QUEUE_CAPACITY, stop.clone());
        let connection_id = connection.id();
        let (inbound, outbound) = peer.split();

        let io_task = tokio::spawn(async move {
            tokio::join!(
                receive_pump(ws_receiver, inbound, connection_id),
                send_pump(ws_sender, outbound, connection_id),
            );
        });

        let client_id = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            handshake(&connection, access_token),
        )
        .await
        {
            Ok(Ok(client_id)) => client_id,
            Ok(Err(err)) => {
                connection.close().await;
                let _ = io_task.await;
                return Err(err);
            }
            Err(_) => {
                connection.close().await;
                let _ = io_task.await;
                return Err(MessageRouterError::ConnectionAborted(
                    "timed out waiting for ConnectResponse".to_string(),
                ));
            }
        };
        info!(%client_id, %url, "connected to message router");

        let inner = Arc::new(ClientInner {
            client_id,
            connection,
            stop,
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            topics: DashMap::new(),
            next_subscriber_id: AtomicU64::new(1),
            services: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let receive_task = tokio::spawn(inner.clone().process_incoming());
        inner.track(io_task);
        inner.track(receive_task);

        Ok(Self { inner })
    }

    /// Id the router assigned to this client.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Calls `handler` for every message published to `topic` until the
    /// returned subscription is dropped via `unsubscribe`.
    ///
    /// Local subscribers to the same topic share one subscription at the router.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(TopicMessage) + Send + Sync + 'static,
    {
        let handler: TopicHandler = Arc::new(handler);
        let subscriber_id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut subscribers = self.inner.topics.entry(topic.to_string()).or_default();
            subscribers.push((subscriber_id, handler));
            subscribers.len() == 1
        };

        if first {
            let subscribe = Message::Subscribe(SubscribeMessage {
                request_id: None,
                topic: topic.to_string(),
            });
            if let Err(err) = self.inner.connection.send(subscribe).await {
                self.inner.remove_subscriber(topic, subscriber_id);
                return Err(err);
            }
            debug!(%topic, "subscribed");
        }

        Ok(Subscription {
            client: self.inner.clone(),
            topic: topic.to_string(),
            subscriber_id,
        })
    }

    /// Publishes without waiting for delivery.
    pub async fn publish(&self, topic: &str, payload: impl Into<String>, options: PublishOptions) -> Result<()> {
        self.inner
            .connection
            .send(Message::Publish(PublishMessage {
                request_id: None,
                topic: topic.to_string(),
                payload: Some(payload.into()),
                scope: scope_for(options.target_client.as_deref()),
                correlation_id: options.correlation_id,
            }))
            .await
    }

    /// Registers `endpoint` at the router and serves its invocations with `handler`.
    ///
    /// Each invocation runs on its own task.
    pub async fn register_service<F, Fut>(&self, endpoint: &str, handler: F) -> Result<()>
    where
        F: Fn(InvokeRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>>> + Send + 'static,
    {
        let handler: ServiceHandler = Arc::new(move |request| handler(request).boxed());

        match self.inner.services.entry(endpoint.to_string()) {
            Entry::Occupied(_) => {
                return Err(MessageRouterError::DuplicateEndpoint(endpoint.to_string()));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(handler);
            }
        }

        let request_id = self.inner.next_request_id();
        let result = self
            .inner
            .request(
                request_id.clone(),
                Message::RegisterService(RegisterServiceRequest {
                    request_id,
                    endpoint: endpoint.to_string(),
                }),
            )
            .await
            .and_then(|response| match response {
                Message::RegisterServiceResponse(response) => into_result(response.error),
                other => Err(unexpected_response(&other)),
            });

        if result.is_err() {
            self.inner.services.remove(endpoint);
        }
        result
    }

    pub async fn unregister_service(&self, endpoint: &str) -> Result<()> {
        self.inner.services.remove(endpoint);

        let request_id = self.inner.next_request_id();
        let response = self
            .inner
            .request(
                request_id.clone(),
                Message::UnregisterService(UnregisterServiceRequest {
                    request_id,
                    endpoint: endpoint.to_string(),
                }),
            )
            .await?;

        match response {
            Message::UnregisterServiceResponse(response) => into_result(response.error),
            other => Err(unexpected_response(&other)),
        }
    }

    /// Invokes `endpoint` and waits for its response payload.
    ///
    /// Routing failures at the router (unknown endpoint or client) come back
    /// as errors rather than a hang.
    pub async fn invoke(&self, endpoint: &str, payload: Option<String>, options: InvokeOptions) -> Result<Option<String>> {
        let request_id = self.inner.next_request_id();
        let request = Message::Invoke(InvokeRequest {
            request_id: request_id.clone(),
            endpoint: endpoint.to_string(),
            payload,
            scope: scope_for(options.target_client.as_deref()),
            source_id: None,
            correlation_id: options.correlation_id,
        });

        match self.inner.request(request_id, request).await? {
            Message::InvokeResponse(response) => match response.error {
                Some(error) => Err(error.into()),
                None => Ok(response.payload),
            },
            other => Err(unexpected_response(&other)),
        }
    }

    /// Closes the connection. Requests still waiting fail with `ConnectionClosed`.
    pub async fn close(&self) {
        self.inner.connection.close().await;

        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn handshake(connection: &QueuedConnection, access_token: Option<&str>) -> Result<String> {
    connection
        .send(Message::Connect(ConnectRequest {
            access_token: access_token.map(str::to_string),
        }))
        .await?;

    loop {
        match connection.receive().await? {
            Message::ConnectResponse(response) => {
                if let Some(error) = response.error {
                    return Err(error.into());
                }
                return response.client_id.ok_or_else(|| {
                    MessageRouterError::MessageParse("ConnectResponse without a client id".to_string())
                });
            }
            other => debug!(message_type = other.message_type(), "ignoring message before ConnectResponse"),
        }
    }
}

fn into_result(error: Option<ErrorInfo>) -> Result<()> {
    match error {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

fn unexpected_response(message: &Message) -> MessageRouterError {
    MessageRouterError::MessageParse(format!("unexpected {} response", message.message_type()))
}

impl ClientInner {
    fn next_request_id(&self) -> String {
        self.next_request_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Sends a request and waits for the response carrying the same request id.
    async fn request(&self, request_id: String, message: Message) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        // Pending requests are dropped once the receive loop ends; anything
        // registered after that must not wait.
        if self.stop.is_cancelled() {
            self.pending.remove(&request_id);
            return Err(MessageRouterError::ConnectionClosed);
        }

        if let Err(err) = self.connection.send(message).await {
            self.pending.remove(&request_id);
            return Err(err);
        }

        rx.await.map_err(|_| MessageRouterError::ConnectionClosed)
    }

    fn remove_subscriber(&self, topic: &str, subscriber_id: u64) -> bool {
        let now_empty = match self.topics.get_mut(topic) {
            Some(mut subscribers) => {
                subscribers.retain(|(id, _)| *id != subscriber_id);
                subscribers.is_empty()
            }
            None => false,
        };

        now_empty
            && self
                .topics
                .remove_if(topic, |_, subscribers| subscribers.is_empty())
                .is_some()
    }

    async fn process_incoming(self: Arc<Self>) {
        loop {
            let message = match self.connection.receive().await {
                Ok(message) => message,
                Err(MessageRouterError::ConnectionClosed) => break,
                Err(err) => {
                    warn!(client_id = %self.client_id, error = %err, "connection to router lost");
                    break;
                }
            };

            match message {
                Message::Topic(message) => self.deliver_topic_message(message),
                Message::Invoke(request) => self.serve_invocation(request),
                Message::InvokeResponse(_)
                | Message::RegisterServiceResponse(_)
                | Message::UnregisterServiceResponse(_) => {
                    if let Some(request_id) = message.request_id().map(str::to_string) {
                        self.complete(&request_id, message);
                    }
                }
                other => debug!(message_type = other.message_type(), "ignoring message"),
            }
        }

        self.stop.cancel();
        // Dropping the senders fails every waiting request with ConnectionClosed.
        self.pending.clear();
        debug!(client_id = %self.client_id, "receive loop stopped");
    }

    fn complete(&self, request_id: &str, message: Message) {
        match self.pending.remove(request_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(message);
            }
            None => debug!(%request_id, "response for unknown request"),
        }
    }

    fn deliver_topic_message(&self, message: TopicMessage) {
        let handlers: Vec<TopicHandler> = match self.topics.get(&message.topic) {
            Some(subscribers) => subscribers.iter().map(|(_, handler)| handler.clone()).collect(),
            None => return,
        };

        for handler in handlers {
            let delivered = message.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(delivered))).is_err() {
                warn!(topic = %message.topic, "topic handler panicked");
            }
        }
    }

    fn serve_invocation(&self, request: InvokeRequest) {
        let handler = self
            .services
            .get(&request.endpoint)
            .map(|handler| handler.value().clone());
        let connection = self.connection.clone();

        tokio::spawn(async move {
            let request_id = request.request_id.clone();
            let endpoint = request.endpoint.clone();

            let result = match handler {
                Some(handler) => match AssertUnwindSafe(handler(request)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(MessageRouterError::Handler(format!(
                        "service handler for '{endpoint}' panicked"
                    ))),
                },
                None => Err(MessageRouterError::UnknownEndpoint(endpoint.clone())),
            };

            let response = match result {
                Ok(payload) => InvokeResponse {
                    request_id,
                    payload,
                    error: None,
                },
                Err(err) => InvokeResponse {
                    request_id,
                    payload: None,
                    error: Some(ErrorInfo::from(&err)),
                },
            };

            if let Err(err) = connection.send(Message::InvokeResponse(response)).await {
                debug!(%endpoint, error = %err, "could not send invoke response");
            }
        });
    }
}

/// Handle of one local topic subscriber.
pub struct Subscription {
    client: Arc<ClientInner>,
    topic: String,
    subscriber_id: u64,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stops delivery to this subscriber; the router subscription ends with the last one.
    pub async fn unsubscribe(self) -> Result<()> {
        if !self.client.remove_subscriber(&self.topic, self.subscriber_id) {
            return Ok(());
        }

        debug!(topic = %self.topic, "unsubscribed");
        self.client
            .connection
            .send(Message::Unsubscribe(UnsubscribeMessage {
                request_id: None,
                topic: self.topic.clone(),
            }))
            .await
    }
}
