//! # value-rpc
//!
//! A bidirectional, multiplexed RPC runtime carrying self-describing
//! MessagePack values ([rmpv::Value]) over length-prefixed TCP frames.
//!
//! A server publishes named endpoints of four shapes, a client invokes
//! them; any number of concurrent requests share one connection, each
//! with its own lifecycle, cancellation and flow control.
//!
//! ## Feature
//!
//! - Four endpoint shapes: single call, server streaming, client
//!   streaming, bidirectional chat
//! - Dynamically typed arguments and results with declarative schemas
//!   ([typedef]) verified on every call
//! - Per-request cancellation, including the cancel-before-start race
//! - Receiver-driven throttling of server streams
//! - Client reconnect keeps the server-side identity (requests in flight
//!   are not resumed, their channels observe errors)
//! - Optional SOCKS5 proxy dialing
//!
//! ## Usage
//!
//! 1. Bind an [RpcServer](server::RpcServer) and register endpoints with
//!    `add_function` / `add_outgoing_stream` / `add_incoming_stream` /
//!    `add_chat`, then let `run()` accept.
//! 2. Create an [RpcClient](client::RpcClient) with a [ClientConfig] and
//!    `connect()`.
//! 3. Call with `call_function`, or stream with `get_stream` /
//!    `put_stream` / `chat`. Channels are `crossfire` channels; a stream
//!    ends when its channel closes.

#[macro_use]
extern crate log;

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod net;
pub mod proto;
pub mod server;
pub mod typedef;

pub use rmpv::Value;

pub use client::RpcClient;
pub use config::{ClientConfig, ServerConfig};
pub use error::{RpcError, RpcIntErr};
pub use server::RpcServer;
pub use typedef::{Kind, TypeDef};
