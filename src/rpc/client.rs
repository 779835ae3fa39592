//! JSON-RPC client bound to one STOMP session.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::error::ClientError;
use crate::reactor::{FrameReceiver, ReactorClient};
use crate::rpc::call::{BatchHandle, CallCallback, CallHandle, PendingCall};
use crate::rpc::envelope::{id_key, JsonRpcRequest};
use crate::rpc::policy::ClientPolicy;
use crate::rpc::tracker::{FrameSender, ResponseTracker};
use crate::stomp::frame::Message;
use crate::stomp::StompClient;

pub const DEFAULT_REQUEST_DESTINATION: &str = "rpc.requests";
pub const DEFAULT_RESPONSE_DESTINATION: &str = "rpc.responses";

/// Where requests go and where responses and events come back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    pub requests: String,
    pub responses: String,
}

impl Default for Destinations {
    fn default() -> Self {
        Self {
            requests: DEFAULT_REQUEST_DESTINATION.to_string(),
            responses: DEFAULT_RESPONSE_DESTINATION.to_string(),
        }
    }
}

/// Puts request frames on the session's request destination.
pub(crate) struct StompSender {
    stomp: StompClient,
    destination: String,
}

impl StompSender {
    pub(crate) fn new(stomp: StompClient, destination: String) -> Self {
        Self { stomp, destination }
    }
}

impl FrameSender for StompSender {
    fn resend(&self, payload: Bytes) -> Result<(), ClientError> {
        self.stomp.resend(&self.destination, payload)
    }
}

/// Feeds link failures into the pending-call table.
pub(crate) struct LinkWatcher(pub(crate) Weak<ResponseTracker>);

impl FrameReceiver for LinkWatcher {
    fn on_frame(&self, _client: &ReactorClient, _message: Message) {}

    fn on_link_lost(&self, _client: &ReactorClient, error: &ClientError) {
        if let Some(tracker) = self.0.upgrade() {
            tracker.link_lost(error);
        }
    }
}

/// Issues calls over a STOMP session and hands back waitable handles.
///
/// Created through [`ResponseWorker::register`](crate::rpc::ResponseWorker::register),
/// which routes the session's inbound traffic back to this client.
pub struct JsonRpcClient {
    stomp: StompClient,
    tracker: Arc<ResponseTracker>,
    destinations: Destinations,
}

impl JsonRpcClient {
    pub(crate) fn new(stomp: StompClient, tracker: Arc<ResponseTracker>, destinations: Destinations) -> Self {
        Self {
            stomp,
            tracker,
            destinations,
        }
    }

    pub fn stomp(&self) -> &StompClient {
        &self.stomp
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    pub fn policy(&self) -> Arc<ClientPolicy> {
        self.tracker.policy()
    }

    /// Replace the retry and heartbeat policy for subsequent calls and
    /// reconnects.
    pub fn set_policy(&self, policy: ClientPolicy) {
        let policy = Arc::new(policy);
        self.stomp.transport().set_policy(Arc::clone(&policy));
        self.tracker.set_policy(policy);
    }

    /// Connect eagerly. Calls connect on demand otherwise.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.stomp.connect()
    }

    pub fn is_connected(&self) -> bool {
        self.stomp.is_connected()
    }

    /// Number of calls still waiting for responses.
    pub fn pending_calls(&self) -> usize {
        self.tracker.pending()
    }

    /// Send one request. The request must carry a non-null id.
    pub fn call(&self, request: JsonRpcRequest) -> Result<CallHandle, ClientError> {
        self.call_with_callback(request, None)
    }

    pub fn call_with_callback(
        &self,
        request: JsonRpcRequest,
        callback: Option<CallCallback>,
    ) -> Result<CallHandle, ClientError> {
        let id = request_id(&request)?;
        let payload = request.to_bytes()?;
        debug!("Calling {} with id {}", request.method, id);
        self.issue(vec![id], payload, callback).map(CallHandle::new)
    }

    /// Send several requests in one frame. Ids must be present and unique.
    pub fn batch_call(&self, requests: Vec<JsonRpcRequest>) -> Result<BatchHandle, ClientError> {
        self.batch_call_with_callback(requests, None)
    }

    pub fn batch_call_with_callback(
        &self,
        requests: Vec<JsonRpcRequest>,
        callback: Option<CallCallback>,
    ) -> Result<BatchHandle, ClientError> {
        if requests.is_empty() {
            return Err(ClientError::Misuse("Empty batch".to_string()));
        }
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(requests.len());
        for request in &requests {
            let id = request_id(request)?;
            if !seen.insert(id_key(&id)) {
                return Err(ClientError::Misuse(format!("Duplicate id {} in batch", id)));
            }
            ids.push(id);
        }
        let payload = JsonRpcRequest::batch_to_bytes(&requests)?;
        self.issue(ids, payload, callback)
    }

    /// Fire-and-forget request without an id. Nothing is tracked or retried.
    pub fn notify(&self, request: JsonRpcRequest) -> Result<(), ClientError> {
        if !request.is_notification() {
            return Err(ClientError::Misuse(
                "notifications must not carry an id".to_string(),
            ));
        }
        self.stomp.send(&self.destinations.requests, request.to_bytes()?)
    }

    fn issue(
        &self,
        ids: Vec<Value>,
        payload: Bytes,
        callback: Option<CallCallback>,
    ) -> Result<BatchHandle, ClientError> {
        let policy = self.tracker.policy();
        let call = Arc::new(PendingCall::new(ids, callback));
        let key = self
            .tracker
            .register(Arc::clone(&call), payload.clone(), &policy)?;

        // Not connected yet: the session parks the frame and dials.
        if let Err(e) = self.stomp.send(&self.destinations.requests, payload) {
            if !policy.is_retryable(&e) {
                self.tracker.remove(key);
                return Err(e);
            }
            debug!("Send failed ({}), leaving call to the retry sweep", e);
        }
        Ok(BatchHandle::new(call, Arc::downgrade(&self.tracker), key))
    }

    /// Disconnect and resolve whatever is still pending.
    pub fn close(&self) -> Result<(), ClientError> {
        let result = if self.stomp.transport().reactor().on_loop_thread() {
            self.stomp.stop();
            Ok(())
        } else {
            self.stomp.disconnect().map(|_| ())
        };
        self.tracker.fail_all();
        result
    }
}

fn request_id(request: &JsonRpcRequest) -> Result<Value, ClientError> {
    match &request.id {
        Some(id) if !id.is_null() => Ok(id.clone()),
        _ => Err(ClientError::Misuse(format!(
            "call to {} requires an id; use notify for one-way requests",
            request.method
        ))),
    }
}
