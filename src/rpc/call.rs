//! Pending calls and the handles callers wait on.
//!
//! A single call is a batch of one; both share [`PendingCall`].

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::error::ClientError;
use crate::rpc::envelope::{id_key, JsonRpcResponse};
use crate::rpc::tracker::ResponseTracker;

/// Lifecycle notifications delivered to an optional per-call callback.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The request frame is being sent again.
    Retrying { attempt: u32 },
    /// The underlying link went down while the call was pending.
    LinkLost(String),
    /// A response for one of the call's ids arrived (or was synthesized).
    Resolved(JsonRpcResponse),
}

/// Callback invoked from the worker pool; must not block for long.
pub type CallCallback = Arc<dyn Fn(CallEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Done,
    Cancelled,
}

struct CallState {
    responses: HashMap<String, JsonRpcResponse>,
    status: Status,
}

/// Tracks the expected ids of one logical call until all are resolved.
pub struct PendingCall {
    ids: Vec<Value>,
    state: Mutex<CallState>,
    done: Condvar,
    callback: Option<CallCallback>,
}

impl PendingCall {
    pub(crate) fn new(ids: Vec<Value>, callback: Option<CallCallback>) -> Self {
        Self {
            ids,
            state: Mutex::new(CallState {
                responses: HashMap::new(),
                status: Status::Pending,
            }),
            done: Condvar::new(),
            callback,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ids(&self) -> &[Value] {
        &self.ids
    }

    /// Record a response. Unknown or duplicate ids are ignored.
    ///
    /// Returns `true` once every expected id has a response.
    pub(crate) fn add_response(&self, response: JsonRpcResponse) -> bool {
        let key = id_key(response.id());
        let completed = {
            let mut state = self.lock();
            if state.status != Status::Pending {
                return state.status == Status::Done;
            }
            if !self.ids.iter().any(|id| id_key(id) == key) || state.responses.contains_key(&key) {
                debug!("Ignoring unexpected response id {}", key);
                return false;
            }
            state.responses.insert(key, response.clone());
            if state.responses.len() == self.ids.len() {
                state.status = Status::Done;
                self.done.notify_all();
                true
            } else {
                false
            }
        };
        self.notify(CallEvent::Resolved(response));
        completed
    }

    /// Ids that still lack a response.
    pub(crate) fn missing_ids(&self) -> Vec<Value> {
        let state = self.lock();
        self.ids
            .iter()
            .filter(|id| !state.responses.contains_key(&id_key(id)))
            .cloned()
            .collect()
    }

    /// Resolve every missing id with `make(id)`.
    pub(crate) fn fail_missing(&self, make: impl Fn(Value) -> JsonRpcResponse) {
        for id in self.missing_ids() {
            self.add_response(make(id));
        }
    }

    pub(crate) fn notify(&self, event: CallEvent) {
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }

    fn cancel(&self) -> bool {
        let mut state = self.lock();
        if state.status != Status::Pending {
            return false;
        }
        state.status = Status::Cancelled;
        self.done.notify_all();
        true
    }

    pub fn is_done(&self) -> bool {
        self.lock().status == Status::Done
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().status == Status::Cancelled
    }

    /// Block until resolved, cancelled or `timeout` elapses.
    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<JsonRpcResponse>, ClientError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            match state.status {
                Status::Done => {
                    return Ok(self
                        .ids
                        .iter()
                        .filter_map(|id| state.responses.get(&id_key(id)).cloned())
                        .collect())
                }
                Status::Cancelled => return Err(ClientError::Cancelled),
                Status::Pending => {}
            }
            state = match deadline {
                None => self
                    .done
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ClientError::Timeout(timeout.unwrap_or_default()));
                    }
                    self.done
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }
}

/// Handle for a batch call. Responses come back in request order.
pub struct BatchHandle {
    call: Arc<PendingCall>,
    tracker: Weak<ResponseTracker>,
    key: u64,
}

impl BatchHandle {
    pub(crate) fn new(call: Arc<PendingCall>, tracker: Weak<ResponseTracker>, key: u64) -> Self {
        Self { call, tracker, key }
    }

    /// Block the calling thread until every id is resolved.
    ///
    /// `None` waits without a bound; the call still resolves once its retry
    /// budget runs out, or earlier through [`cancel`](Self::cancel).
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<JsonRpcResponse>, ClientError> {
        self.call.wait(timeout)
    }

    /// Stop waiting and drop the pending entry. The remote side may still
    /// have executed the request.
    pub fn cancel(&self) -> bool {
        let cancelled = self.call.cancel();
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.remove(self.key);
        }
        cancelled
    }

    pub fn is_done(&self) -> bool {
        self.call.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.call.is_cancelled()
    }

    pub fn ids(&self) -> &[Value] {
        self.call.ids()
    }
}

/// Handle for a single call.
pub struct CallHandle {
    batch: BatchHandle,
}

impl CallHandle {
    pub(crate) fn new(batch: BatchHandle) -> Self {
        Self { batch }
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<JsonRpcResponse, ClientError> {
        self.batch
            .wait(timeout)?
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Protocol("call resolved without a response".to_string()))
    }

    pub fn cancel(&self) -> bool {
        self.batch.cancel()
    }

    pub fn is_done(&self) -> bool {
        self.batch.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.batch.is_cancelled()
    }

    pub fn id(&self) -> &Value {
        &self.batch.ids()[0]
    }
}
