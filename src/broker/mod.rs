//! The `broker` module routes messages between connected clients.
//!
//! `MessageRouterServer` owns the client, topic, service and invocation
//! registries and runs one dispatch loop per connection. Transports hand it
//! connections through `client_connected` and never touch the registries.

pub mod invocation;
pub mod server;
mod session;
pub mod topic;
pub mod validator;

pub use invocation::ServiceInvocation;
pub use server::MessageRouterServer;
pub use topic::{ClientId, Topic};
pub use validator::{AccessTokenValidator, StaticTokenValidator};
