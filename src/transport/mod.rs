//! The `transport` module is responsible for handling network communication
//! with clients via WebSockets.
//!
//! `WebSocketServer` accepts sockets and hands each one to the broker as a
//! `ClientConnection`; `websocket` runs the per-connection I/O pumps that move
//! messages between the socket and the connection's queues.

pub mod listener;
pub mod websocket;

pub use listener::WebSocketServer;
pub use websocket::{ConnectionOptions, handle_connection};
