use super::{InvokeOptions, MessageRouterClient, PublishOptions};
use crate::broker::{MessageRouterServer, StaticTokenValidator};
use crate::config::ServerSettings;
use crate::protocol::TopicMessage;
use crate::transport::WebSocketServer;
use crate::utils::error::MessageRouterError;
use std::time::Duration;
use tokio::sync::mpsc;

async fn start(broker: MessageRouterServer) -> (MessageRouterServer, WebSocketServer) {
    let server = WebSocketServer::start(&ServerSettings::default(), broker.clone(), 16)
        .await
        .expect("server should start");
    (broker, server)
}

async fn connect(server: &WebSocketServer) -> MessageRouterClient {
    MessageRouterClient::connect(&server.url(), None)
        .await
        .expect("client should connect")
}

fn collector() -> (
    impl Fn(TopicMessage) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<TopicMessage>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |message| {
            let _ = tx.send(message);
        },
        rx,
    )
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<TopicMessage>) -> TopicMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for topic message")
        .expect("handler dropped")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_connect_assigns_client_id() {
    let (broker, server) = start(MessageRouterServer::new()).await;
    let client = connect(&server).await;

    assert!(!client.client_id().is_empty());
    assert!(broker.is_registered(client.client_id()));

    client.close().await;
    assert!(client.is_closed());
    wait_until(|| broker.client_count() == 0).await;
    server.stop().await;
}

#[tokio::test]
async fn test_connect_with_rejected_token_fails() {
    let (broker, server) =
        start(MessageRouterServer::with_validator(StaticTokenValidator::new(["secret"]))).await;

    let err = MessageRouterClient::connect(&server.url(), Some("wrong"))
        .await
        .err()
        .expect("connect should fail");
    assert_eq!(err.name(), "AccessTokenRejected");
    assert_eq!(broker.client_count(), 0);

    let client = MessageRouterClient::connect(&server.url(), Some("secret"))
        .await
        .expect("valid token should connect");
    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_subscribe_and_publish() {
    let (broker, server) = start(MessageRouterServer::new()).await;
    let subscriber = connect(&server).await;
    let publisher = connect(&server).await;

    let (handler, mut rx) = collector();
    let _subscription = subscriber.subscribe("news", handler).await.unwrap();
    wait_until(|| broker.subscribers("news").len() == 1).await;

    publisher
        .publish(
            "news",
            "hello",
            PublishOptions {
                correlation_id: Some("trace-1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let message = recv(&mut rx).await;
    assert_eq!(message.topic, "news");
    assert_eq!(message.payload.as_deref(), Some("hello"));
    assert_eq!(message.source_id.as_deref(), Some(publisher.client_id()));
    assert_eq!(message.correlation_id.as_deref(), Some("trace-1"));

    subscriber.close().await;
    publisher.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_local_subscribers_share_one_router_subscription() {
    let (broker, server) = start(MessageRouterServer::new()).await;
    let client = connect(&server).await;

    let (first_handler, mut first_rx) = collector();
    let (second_handler, mut second_rx) = collector();
    let first = client.subscribe("news", first_handler).await.unwrap();
    let second = client.subscribe("news", second_handler).await.unwrap();
    wait_until(|| broker.subscribers("news").len() == 1).await;

    client
        .publish("news", "both", PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(recv(&mut first_rx).await.payload.as_deref(), Some("both"));
    assert_eq!(recv(&mut second_rx).await.payload.as_deref(), Some("both"));

    first.unsubscribe().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.subscribers("news").len(), 1);

    second.unsubscribe().await.unwrap();
    wait_until(|| broker.subscribers("news").is_empty()).await;

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_targeted_publish() {
    let (broker, server) = start(MessageRouterServer::new()).await;
    let a = connect(&server).await;
    let b = connect(&server).await;

    let (a_handler, mut a_rx) = collector();
    let (b_handler, mut b_rx) = collector();
    let _a_sub = a.subscribe("news", a_handler).await.unwrap();
    let _b_sub = b.subscribe("news", b_handler).await.unwrap();
    wait_until(|| broker.subscribers("news").len() == 2).await;

    a.publish(
        "news",
        "only b",
        PublishOptions {
            target_client: Some(b.client_id().to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(recv(&mut b_rx).await.payload.as_deref(), Some("only b"));
    assert!(
        tokio::time::timeout(Duration::from_millis(100), a_rx.recv())
            .await
            .is_err()
    );

    a.close().await;
    b.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_register_and_invoke_service() {
    let (broker, server) = start(MessageRouterServer::new()).await;
    let service = connect(&server).await;
    let caller = connect(&server).await;

    service
        .register_service("echo", |request| async move { Ok(request.payload) })
        .await
        .unwrap();
    assert_eq!(broker.service_owner("echo").as_deref(), Some(service.client_id()));

    let response = caller
        .invoke("echo", Some("ping".to_string()), InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(response.as_deref(), Some("ping"));
    assert_eq!(broker.pending_invocations(), 0);

    service.close().await;
    caller.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_duplicate_registration_fails() {
    let (_broker, server) = start(MessageRouterServer::new()).await;
    let a = connect(&server).await;
    let b = connect(&server).await;

    a.register_service("svc", |_| async { Ok(None) }).await.unwrap();

    let err = b
        .register_service("svc", |_| async { Ok(None) })
        .await
        .unwrap_err();
    assert_eq!(err.name(), "DuplicateEndpoint");

    let err = a
        .register_service("svc", |_| async { Ok(None) })
        .await
        .unwrap_err();
    assert_eq!(err, MessageRouterError::DuplicateEndpoint("svc".to_string()));

    a.unregister_service("svc").await.unwrap();
    b.register_service("svc", |_| async { Ok(None) }).await.unwrap();

    a.close().await;
    b.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_invoke_unknown_endpoint() {
    let (_broker, server) = start(MessageRouterServer::new()).await;
    let caller = connect(&server).await;

    let err = caller
        .invoke("nowhere", None, InvokeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.name(), "UnknownEndpoint");

    caller.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_service_error_reaches_caller() {
    let (_broker, server) = start(MessageRouterServer::new()).await;
    let service = connect(&server).await;
    let caller = connect(&server).await;

    service
        .register_service("fail", |_| async {
            Err(MessageRouterError::Handler("out of cheese".to_string()))
        })
        .await
        .unwrap();

    let err = caller
        .invoke("fail", None, InvokeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.name(), "HandlerException");
    assert!(err.to_string().contains("out of cheese"));

    service.close().await;
    caller.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_invoke_targeted_client() {
    let (_broker, server) = start(MessageRouterServer::new()).await;
    let service = connect(&server).await;
    let caller = connect(&server).await;

    // Routed by client id rather than through the service registry.
    service
        .register_service("direct", |request| async move {
            Ok(Some(format!("got {}", request.payload.unwrap_or_default())))
        })
        .await
        .unwrap();

    let response = caller
        .invoke(
            "direct",
            Some("x".to_string()),
            InvokeOptions {
                target_client: Some(service.client_id().to_string()),
                correlation_id: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(response.as_deref(), Some("got x"));

    service.close().await;
    caller.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_service_disconnect_resolves_pending_invoke() {
    let (broker, server) = start(MessageRouterServer::new()).await;
    let service = connect(&server).await;
    let caller = connect(&server).await;

    service
        .register_service("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        })
        .await
        .unwrap();

    let pending = {
        let caller = caller.clone();
        tokio::spawn(async move { caller.invoke("slow", None, InvokeOptions::default()).await })
    };
    wait_until(|| broker.pending_invocations() == 1).await;

    service.close().await;

    let err = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("invoke should resolve")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.name(), "ConnectionClosed");

    caller.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_close_fails_pending_requests() {
    let (_broker, server) = start(MessageRouterServer::new()).await;
    let service = connect(&server).await;
    let caller = connect(&server).await;

    service
        .register_service("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        })
        .await
        .unwrap();

    let pending = {
        let caller = caller.clone();
        tokio::spawn(async move { caller.invoke("slow", None, InvokeOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    caller.close().await;
    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("invoke should resolve")
        .unwrap();
    assert_eq!(result, Err(MessageRouterError::ConnectionClosed));

    // Requests after close fail immediately.
    assert!(caller.invoke("slow", None, InvokeOptions::default()).await.is_err());

    service.close().await;
    server.stop().await;
}
