use super::codec::{self, FrameDecoder};
use super::message::*;
use super::names;
use serde_json::json;

#[test]
fn test_deserialize_type_not_first_property() {
    let raw = br#"{ "junk1": "junkText", "topic": "a/b/c", "type": "Subscribe" }"#;
    let message = codec::deserialize(raw).unwrap();
    match message {
        Message::Subscribe(sub) => assert_eq!(sub.topic, "a/b/c"),
        other => panic!("Expected Subscribe, got {other:?}"),
    }
}

#[test]
fn test_unknown_discriminator_is_parse_error() {
    let err = codec::deserialize(br#"{ "type": "Teleport", "topic": "x" }"#).unwrap_err();
    assert_eq!(err.name(), "MessageParseError");
}

#[test]
fn test_missing_discriminator_is_parse_error() {
    let err = codec::deserialize(br#"{ "topic": "x" }"#).unwrap_err();
    assert_eq!(err.name(), "MessageParseError");
}

#[test]
fn test_serialized_shape_is_camel_case_and_omits_empty_fields() {
    let message = Message::Invoke(InvokeRequest {
        request_id: "1".to_string(),
        endpoint: "echo".to_string(),
        payload: Some("ping".to_string()),
        correlation_id: Some("trace-7".to_string()),
        ..Default::default()
    });

    let value: serde_json::Value = serde_json::from_str(&codec::serialize(&message).unwrap()).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "Invoke",
            "requestId": "1",
            "endpoint": "echo",
            "payload": "ping",
            "correlationId": "trace-7"
        })
    );
}

#[test]
fn test_connect_response_error_shape() {
    let message = Message::ConnectResponse(ConnectResponse {
        client_id: None,
        error: Some(ErrorInfo {
            name: "AccessTokenRejected".to_string(),
            message: Some("Invalid token".to_string()),
        }),
    });

    let value: serde_json::Value = serde_json::from_str(&codec::serialize(&message).unwrap()).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "ConnectResponse",
            "error": { "name": "AccessTokenRejected", "message": "Invalid token" }
        })
    );
}

#[test]
fn test_every_kind_survives_the_codec() {
    let messages = vec![
        Message::Connect(ConnectRequest::default()),
        Message::Connect(ConnectRequest {
            access_token: Some("abc".to_string()),
        }),
        Message::ConnectResponse(ConnectResponse {
            client_id: Some("clientId".to_string()),
            error: None,
        }),
        Message::Unsubscribe(UnsubscribeMessage {
            request_id: None,
            topic: "testTopic".to_string(),
        }),
        Message::Publish(PublishMessage {
            request_id: Some("2".to_string()),
            topic: "testTopic".to_string(),
            payload: Some("testPayload".to_string()),
            scope: MessageScope::from_client_id("abc"),
            correlation_id: Some("testCorrelationId".to_string()),
        }),
        Message::Topic(TopicMessage {
            topic: "testTopic".to_string(),
            payload: Some("testPayload".to_string()),
            source_id: Some("sender".to_string()),
            ..Default::default()
        }),
        Message::InvokeResponse(InvokeResponse {
            request_id: "testRequestId".to_string(),
            payload: None,
            error: Some(ErrorInfo {
                name: "errorType".to_string(),
                message: Some("errorMessage".to_string()),
            }),
        }),
        Message::RegisterService(RegisterServiceRequest {
            request_id: "3".to_string(),
            endpoint: "testEndpoint".to_string(),
        }),
        Message::RegisterServiceResponse(RegisterServiceResponse {
            request_id: "3".to_string(),
            error: None,
        }),
        Message::UnregisterService(UnregisterServiceRequest {
            request_id: "4".to_string(),
            endpoint: "testEndpoint".to_string(),
        }),
        Message::UnregisterServiceResponse(UnregisterServiceResponse {
            request_id: "4".to_string(),
            error: None,
        }),
    ];

    for message in messages {
        let text = codec::serialize(&message).unwrap();
        assert_eq!(codec::deserialize(text.as_bytes()).unwrap(), message, "{text}");
    }
}

#[test]
fn test_scope_addressing() {
    let scope = MessageScope::from_client_id("c1");
    assert!(scope.is_client_id());
    assert_eq!(scope.client_id(), Some("c1"));
    assert_eq!(scope.as_str(), "@c1");

    let default = MessageScope::parse("");
    assert!(default.is_default());
    assert_eq!(default.client_id(), None);

    let named = MessageScope::parse("desk");
    assert!(!named.is_client_id());
}

#[test]
fn test_request_id_accessor() {
    let message = Message::RegisterService(RegisterServiceRequest {
        request_id: "42".to_string(),
        endpoint: "svc".to_string(),
    });
    assert_eq!(message.request_id(), Some("42"));
    assert_eq!(message.message_type(), "RegisterService");
    assert_eq!(Message::Connect(ConnectRequest::default()).request_id(), None);
}

#[test]
fn test_frame_decoder_back_to_back_values() {
    let mut decoder = FrameDecoder::new();
    decoder.push(br#"{"type":"Subscribe","topic":"a"} {"type":"Unsubscribe","topic":"a"}"#);

    assert!(matches!(decoder.decode_next(), Some(Ok(Message::Subscribe(_)))));
    assert!(matches!(decoder.decode_next(), Some(Ok(Message::Unsubscribe(_)))));
    assert!(decoder.decode_next().is_none());
    assert_eq!(decoder.buffered(), 0);
}

#[test]
fn test_frame_decoder_waits_for_more_input() {
    let mut decoder = FrameDecoder::new();
    decoder.push(br#"{"type":"Subscribe","#);
    assert!(decoder.decode_next().is_none());
    assert!(decoder.buffered() > 0);

    decoder.push(br#""topic":"news"}"#);
    match decoder.decode_next() {
        Some(Ok(Message::Subscribe(sub))) => assert_eq!(sub.topic, "news"),
        other => panic!("Expected Subscribe, got {other:?}"),
    }
}

#[test]
fn test_frame_decoder_skips_unknown_message_and_continues() {
    let mut decoder = FrameDecoder::new();
    decoder.push(br#"{"type":"Bogus"}{"type":"Subscribe","topic":"ok"}"#);

    assert!(matches!(decoder.decode_next(), Some(Err(_))));
    assert!(matches!(decoder.decode_next(), Some(Ok(Message::Subscribe(_)))));
}

#[test]
fn test_frame_decoder_drops_garbage() {
    let mut decoder = FrameDecoder::new();
    decoder.push(b"}}not json");

    let err = decoder.decode_next().unwrap().unwrap_err();
    assert_eq!(err.name(), "MessageParseError");
    assert_eq!(decoder.buffered(), 0);

    decoder.push(br#"{"type":"Subscribe","topic":"after"}"#);
    assert!(matches!(decoder.decode_next(), Some(Ok(Message::Subscribe(_)))));
}

#[test]
fn test_frame_decoder_finish_drops_truncated_value() {
    let mut decoder = FrameDecoder::new();
    decoder.push(br#"{"type":"Subscribe","topic":"a"} {"type":"Subscribe","topic":"b"#);

    assert!(matches!(decoder.decode_next(), Some(Ok(Message::Subscribe(_)))));
    assert!(decoder.decode_next().is_none());

    let err = decoder.finish().expect("leftover bytes are reported");
    assert_eq!(err.name(), "MessageParseError");
    assert_eq!(decoder.buffered(), 0);

    decoder.push(br#"{"type":"Subscribe","topic":"news"}"#);
    match decoder.decode_next() {
        Some(Ok(Message::Subscribe(sub))) => assert_eq!(sub.topic, "news"),
        other => panic!("Expected Subscribe, got {other:?}"),
    }
    assert!(decoder.finish().is_none());
}

#[test]
fn test_name_rules() {
    assert!(names::is_valid_topic_name("news"));
    assert!(names::is_valid_topic_name("ComposeUI/fdc3/v2.0/broadcast"));
    assert!(names::is_valid_endpoint("svc:echo-1"));

    assert!(!names::is_valid_topic_name(""));
    assert!(!names::is_valid_topic_name("   "));
    assert!(!names::is_valid_topic_name("/leading"));
    assert!(!names::is_valid_topic_name("trailing/"));
    assert!(!names::is_valid_topic_name("a//b"));
    assert!(!names::is_valid_endpoint("has space"));
    assert!(!names::is_valid_endpoint(&"x".repeat(names::MAX_NAME_LENGTH + 1)));

    let err = names::validate_endpoint("bad name").unwrap_err();
    assert_eq!(err.name(), "InvalidEndpoint");
}
