//! The `protocol` module defines what travels over a connection: the message
//! model, the naming rules for topics and endpoints, and the JSON codec that
//! turns a stream of bytes into discrete messages.

pub mod codec;
pub mod message;
pub mod names;

pub use codec::FrameDecoder;
pub use message::{
    ConnectRequest, ConnectResponse, ErrorInfo, InvokeRequest, InvokeResponse, Message,
    MessageScope, PublishMessage, RegisterServiceRequest, RegisterServiceResponse,
    SubscribeMessage, TopicMessage, UnregisterServiceRequest, UnregisterServiceResponse,
    UnsubscribeMessage,
};

#[cfg(test)]
mod tests;
