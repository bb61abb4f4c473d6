//! termbridge — a bidirectional JSON-RPC 2.0 bridge between terminal CLIs
//! and an IDE-embedded server, over a Unix domain socket.
//!
//! The bridge is a process pair: a long-lived [`server::BridgeServer`]
//! embedded in the IDE host, and a short-lived [`client::BridgeClient`]
//! invoked from the CLI.
//!
//! ```text
//! ┌─────────────────┐        Unix Socket         ┌─────────────────────┐
//! │  CLI process    │ ◄─────────────────────────►│  IDE host process   │
//! │  (BridgeClient) │  length-prefixed JSON-RPC  │  (BridgeServer)     │
//! └─────────────────┘                            └─────────────────────┘
//! ```
//!
//! - `protocol` — the JSON-RPC 2.0 message model and error codes
//! - `framing` — length-prefixed wire framing and stream reassembly
//! - `discovery` — socket discovery, descriptor file, liveness probing
//! - `server` — multi-client dispatch and broadcast
//! - `client` — request correlation, timeouts, notification callbacks
//!
//! # Example
//!
//! ```ignore
//! use termbridge::{BridgeClient, BridgeServer};
//! use serde_json::json;
//!
//! let server = BridgeServer::new();
//! server.register_handler("echo", |params| async move {
//!     Ok(params.unwrap_or(serde_json::Value::Null))
//! });
//! server.start()?;
//!
//! let client = BridgeClient::new();
//! client.connect().await?;
//! let result = client.request("echo", Some(json!({"x": 1}))).await?;
//! ```

pub mod client;
pub mod discovery;
pub mod framing;
pub mod protocol;
pub mod server;

/// Bridge version reported by `ping` and written to the descriptor file.
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use client::{BridgeClient, ClientConfig, ClientError};
pub use protocol::{Message, RequestId, RpcError};
pub use server::{BridgeServer, ServerError};
