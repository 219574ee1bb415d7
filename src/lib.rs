//! # msgrouter
//!
//! `msgrouter` is an in-memory message router for cooperating processes. Clients
//! connect over WebSocket, publish to and subscribe on named topics, and expose
//! named services that other clients invoke with request/response semantics.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `protocol`: The message model, naming rules and the JSON codec.
//! - `connection`: The transport-agnostic `ClientConnection` the broker talks to.
//! - `broker`: The router itself: clients, topics, services and pending invocations.
//! - `transport`: The WebSocket listener and per-connection I/O pumps.
//! - `client`: The client-side API used by applications.
//! - `config`: Handles loading and managing server configuration.
//! - `utils`: Shared utilities: the error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod transport;
pub mod utils;
