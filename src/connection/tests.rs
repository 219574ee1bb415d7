use super::{ClientConnection, channel};
use crate::protocol::{Message, SubscribeMessage};
use crate::utils::error::MessageRouterError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn subscribe(topic: &str) -> Message {
    Message::Subscribe(SubscribeMessage {
        request_id: None,
        topic: topic.to_string(),
    })
}

#[tokio::test]
async fn test_messages_flow_both_ways_in_order() {
    let (connection, mut peer) = channel(8, CancellationToken::new());

    peer.deliver(subscribe("a")).await.unwrap();
    peer.deliver(subscribe("b")).await.unwrap();
    assert_eq!(connection.receive().await.unwrap(), subscribe("a"));
    assert_eq!(connection.receive().await.unwrap(), subscribe("b"));

    connection.send(subscribe("out")).await.unwrap();
    assert_eq!(peer.next_outgoing().await, Some(subscribe("out")));
}

#[tokio::test]
async fn test_close_unblocks_pending_receive() {
    let (connection, _peer) = channel(8, CancellationToken::new());

    let receiver = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.receive().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    connection.close().await;

    let result = tokio::time::timeout(Duration::from_secs(1), receiver)
        .await
        .expect("receive should unblock")
        .unwrap();
    assert_eq!(result, Err(MessageRouterError::ConnectionClosed));
    assert!(connection.is_closed());
}

#[tokio::test]
async fn test_send_after_close_fails() {
    let (connection, mut peer) = channel(8, CancellationToken::new());
    connection.close().await;

    assert_eq!(
        connection.send(subscribe("late")).await,
        Err(MessageRouterError::ConnectionClosed)
    );
    assert_eq!(peer.next_outgoing().await, None);
}

#[tokio::test]
async fn test_full_outbound_queue_applies_back_pressure_until_cancelled() {
    let stop = CancellationToken::new();
    let (connection, _peer) = channel(1, stop.child_token());

    connection.send(subscribe("fills")).await.unwrap();

    let blocked = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.send(subscribe("waits")).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!blocked.is_finished());

    // Cancelling the parent token tears the connection down as well.
    stop.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), blocked)
        .await
        .expect("send should unblock")
        .unwrap();
    assert_eq!(result, Err(MessageRouterError::ConnectionClosed));
}

#[tokio::test]
async fn test_transport_failure_is_reported_as_aborted() {
    let (connection, peer) = channel(8, CancellationToken::new());
    let (sink, _source) = peer.split();

    sink.fail(MessageRouterError::ConnectionAborted("reset by peer".into()))
        .await;
    sink.stop_token().cancel();

    assert_eq!(
        connection.receive().await,
        Err(MessageRouterError::ConnectionAborted("reset by peer".into()))
    );
}

#[test]
fn test_connection_ids_are_unique() {
    let (a, _) = channel(1, CancellationToken::new());
    let (b, _) = channel(1, CancellationToken::new());
    assert_ne!(a.id(), b.id());
}

#[tokio::test]
async fn test_close_still_hands_out_queued_inbound_messages() {
    let (connection, peer) = channel(8, CancellationToken::new());

    peer.deliver(subscribe("a")).await.unwrap();
    peer.deliver(subscribe("b")).await.unwrap();
    peer.close();

    assert_eq!(peer.deliver(subscribe("late")).await, Err(MessageRouterError::ConnectionClosed));
    assert_eq!(connection.receive().await.unwrap(), subscribe("a"));
    assert_eq!(connection.receive().await.unwrap(), subscribe("b"));
    assert_eq!(connection.receive().await, Err(MessageRouterError::ConnectionClosed));
}

#[tokio::test]
async fn test_close_still_hands_out_queued_outbound_messages() {
    let (connection, mut peer) = channel(8, CancellationToken::new());

    connection.send(subscribe("a")).await.unwrap();
    connection.send(subscribe("b")).await.unwrap();
    connection.close().await;

    assert_eq!(peer.next_outgoing().await, Some(subscribe("a")));
    assert_eq!(peer.next_outgoing().await, Some(subscribe("b")));
    assert_eq!(peer.next_outgoing().await, None);
}

#[tokio::test]
async fn test_failure_after_queued_messages_is_still_reported() {
    let (connection, peer) = channel(8, CancellationToken::new());
    let (sink, _source) = peer.split();

    sink.deliver(subscribe("a")).await.unwrap();
    sink.fail(MessageRouterError::ConnectionAborted("reset by peer".into()))
        .await;
    sink.stop_token().cancel();

    assert_eq!(connection.receive().await.unwrap(), subscribe("a"));
    assert_eq!(
        connection.receive().await,
        Err(MessageRouterError::ConnectionAborted("reset by peer".into()))
    );
    assert_eq!(connection.receive().await, Err(MessageRouterError::ConnectionClosed));
}
