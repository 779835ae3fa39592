//! JSON-RPC 2.0 client transport over STOMP framing.
//!
//! The crate is layered bottom-up:
//!
//! - `reactor` - event loop threads owning TCP/TLS links and listeners
//! - `stomp` - wire codec, heartbeats and the session state machine
//! - `rpc` - request/response correlation, retries and inbound dispatch
//! - `events` - subscription registry for server-pushed events
//! - `config` - layered configuration and one-call client construction
//!
//! # Example
//!
//! ```ignore
//! use stomp_jsonrpc::config::ClientConfig;
//! use stomp_jsonrpc::rpc::JsonRpcRequest;
//!
//! let client = ClientConfig::load(None)?.open(None)?;
//! let handle = client.call(JsonRpcRequest::new("echo", serde_json::json!({}), "1"))?;
//! let response = handle.wait(None)?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod reactor;
pub mod rpc;
pub mod stomp;

pub use error::{ClientError, FailureKind};
