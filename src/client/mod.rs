//! The `client` module is the client-side API of the router.
//!
//! `MessageRouterClient` connects over WebSocket, performs the handshake and
//! exposes subscribe, publish, service registration and invocation as async
//! calls. Responses are matched to requests by request id.

pub mod router_client;

pub use router_client::{
    InvokeOptions, MessageRouterClient, PublishOptions, ServiceHandler, Subscription,
    TopicHandler,
};

#[cfg(test)]
mod tests;
