//! Message definitions for the router protocol
//!
//! `Message` is the closed set of everything that can cross a connection. On the
//! wire each message is one JSON object whose `type` property selects the shape;
//! the remaining properties are camelCase and optional ones are omitted when empty.
//!
//! Notes on fields:
//! - `requestId`: chosen by whoever sends a request and echoed in its response
//! - `payload`: opaque string, never inspected by the broker
//! - `scope`: empty for the application-wide scope, `@<clientId>` to address one client
//! - `correlationId`: tracing token, passed through untouched
//! - `sourceId`: the sending client, stamped by the broker on forwarded messages

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::error::MessageRouterError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    Connect(ConnectRequest),
    ConnectResponse(ConnectResponse),
    Subscribe(SubscribeMessage),
    Unsubscribe(UnsubscribeMessage),
    Publish(PublishMessage),
    Topic(TopicMessage),
    Invoke(InvokeRequest),
    InvokeResponse(InvokeResponse),
    RegisterService(RegisterServiceRequest),
    RegisterServiceResponse(RegisterServiceResponse),
    UnregisterService(UnregisterServiceRequest),
    UnregisterServiceResponse(UnregisterServiceResponse),
}

impl Message {
    /// The value of the `type` discriminator.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Connect(_) => "Connect",
            Self::ConnectResponse(_) => "ConnectResponse",
            Self::Subscribe(_) => "Subscribe",
            Self::Unsubscribe(_) => "Unsubscribe",
            Self::Publish(_) => "Publish",
            Self::Topic(_) => "Topic",
            Self::Invoke(_) => "Invoke",
            Self::InvokeResponse(_) => "InvokeResponse",
            Self::RegisterService(_) => "RegisterService",
            Self::RegisterServiceResponse(_) => "RegisterServiceResponse",
            Self::UnregisterService(_) => "UnregisterService",
            Self::UnregisterServiceResponse(_) => "UnregisterServiceResponse",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Connect(_) | Self::ConnectResponse(_) | Self::Topic(_) => None,
            Self::Subscribe(m) => m.request_id.as_deref(),
            Self::Unsubscribe(m) => m.request_id.as_deref(),
            Self::Publish(m) => m.request_id.as_deref(),
            Self::Invoke(m) => Some(&m.request_id),
            Self::InvokeResponse(m) => Some(&m.request_id),
            Self::RegisterService(m) => Some(&m.request_id),
            Self::RegisterServiceResponse(m) => Some(&m.request_id),
            Self::UnregisterService(m) => Some(&m.request_id),
            Self::UnregisterServiceResponse(m) => Some(&m.request_id),
        }
    }
}

/// Error object carried by failure responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&MessageRouterError> for ErrorInfo {
    fn from(err: &MessageRouterError) -> Self {
        let message = match err {
            MessageRouterError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            name: err.name().to_string(),
            message: Some(message),
        }
    }
}

impl From<MessageRouterError> for ErrorInfo {
    fn from(err: MessageRouterError) -> Self {
        Self::from(&err)
    }
}

/// Addressing restriction of a publish or invocation.
///
/// The empty scope is the application-wide default. A scope starting with `@`
/// names exactly one client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageScope(String);

impl MessageScope {
    const CLIENT_PREFIX: char = '@';

    pub fn parse(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_client_id(client_id: &str) -> Self {
        Self(format!("{}{client_id}", Self::CLIENT_PREFIX))
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_client_id(&self) -> bool {
        self.0.starts_with(Self::CLIENT_PREFIX)
    }

    /// The addressed client id, if this scope names one.
    pub fn client_id(&self) -> Option<&str> {
        self.0.strip_prefix(Self::CLIENT_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub topic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub topic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "MessageScope::is_default")]
    pub scope: MessageScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Delivery of a published message to one subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicMessage {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "MessageScope::is_default")]
    pub scope: MessageScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub request_id: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "MessageScope::is_default")]
    pub scope: MessageScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServiceRequest {
    pub request_id: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServiceResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterServiceRequest {
    pub request_id: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterServiceResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}
