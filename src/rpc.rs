//! JSON-RPC correlation and retry engine.
//!
//! This module provides:
//! - request/response envelopes and their validation
//! - [`ClientPolicy`] for retry and heartbeat behavior
//! - [`JsonRpcClient`], which issues calls over a STOMP session
//! - [`ResponseTracker`], the per-client pending-call table with retry sweep
//! - [`ResponseWorker`], which routes inbound traffic to trackers and events

mod call;
mod client;
mod decomposer;
mod envelope;
mod policy;
mod tracker;
mod worker;

pub use call::{BatchHandle, CallCallback, CallEvent, CallHandle, PendingCall};
pub use client::{Destinations, JsonRpcClient, DEFAULT_REQUEST_DESTINATION, DEFAULT_RESPONSE_DESTINATION};
pub use decomposer::ResponseDecomposer;
pub use envelope::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION, TIMEOUT_ERROR_CODE,
    TIMEOUT_ERROR_MESSAGE,
};
pub use policy::ClientPolicy;
pub use tracker::{FrameSender, ResponseTracker, SWEEP_INTERVAL};
pub use worker::{ResponseWorker, DEFAULT_EVENT_RETENTION};
