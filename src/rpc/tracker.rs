//! Correlation table and retry sweep for one client.
//!
//! Every issued call is tracked with the frame it was sent as. A periodic
//! sweep resends calls whose retry timeout elapsed and resolves the rest
//! with a synthetic 5022 response once their attempts are used up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::rpc::call::{CallEvent, PendingCall};
use crate::rpc::envelope::{id_key, JsonRpcResponse, TIMEOUT_ERROR_CODE};
use crate::rpc::policy::ClientPolicy;

/// How often pending calls are checked for expiry.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Something that can put a request frame back on the wire.
pub trait FrameSender: Send + Sync {
    fn resend(&self, payload: Bytes) -> Result<(), ClientError>;
}

struct Tracking {
    call: Arc<PendingCall>,
    payload: Bytes,
    retry_timeout: Duration,
    deadline: Instant,
    attempts_left: u32,
    attempt: u32,
}

#[derive(Default)]
struct Table {
    calls: HashMap<u64, Tracking>,
    ids: HashMap<String, u64>,
}

impl Table {
    fn remove(&mut self, key: u64) -> Option<Tracking> {
        let tracking = self.calls.remove(&key)?;
        for id in tracking.call.ids() {
            self.ids.remove(&id_key(id));
        }
        Some(tracking)
    }
}

/// Pending-call table of a single client.
pub struct ResponseTracker {
    table: Mutex<Table>,
    next_key: AtomicU64,
    sender: Arc<dyn FrameSender>,
    policy: RwLock<Arc<ClientPolicy>>,
}

impl ResponseTracker {
    pub fn new(sender: Arc<dyn FrameSender>, policy: Arc<ClientPolicy>) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            next_key: AtomicU64::new(1),
            sender,
            policy: RwLock::new(policy),
        }
    }

    pub fn policy(&self) -> Arc<ClientPolicy> {
        Arc::clone(&self.policy.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Applies to calls registered and failures classified from now on.
    pub fn set_policy(&self, policy: Arc<ClientPolicy>) {
        *self.policy.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = policy;
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking `call`. Fails if one of its ids is already in flight.
    pub fn register(
        &self,
        call: Arc<PendingCall>,
        payload: Bytes,
        policy: &ClientPolicy,
    ) -> Result<u64, ClientError> {
        let mut table = self.lock();
        for id in call.ids() {
            if id.is_null() {
                return Err(ClientError::Misuse("calls require a non-null id".to_string()));
            }
            if table.ids.contains_key(&id_key(id)) {
                return Err(ClientError::Misuse(format!("id {} is already in flight", id)));
            }
        }

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        for id in call.ids() {
            table.ids.insert(id_key(id), key);
        }
        table.calls.insert(
            key,
            Tracking {
                call,
                payload,
                retry_timeout: policy.retry_timeout(),
                deadline: Instant::now() + policy.retry_timeout(),
                attempts_left: policy.retry_number(),
                attempt: 1,
            },
        );
        Ok(key)
    }

    pub fn remove(&self, key: u64) {
        self.lock().remove(key);
    }

    pub fn pending(&self) -> usize {
        self.lock().calls.len()
    }

    /// Route an inbound response to its pending call.
    ///
    /// Responses with a null id never resolve anything.
    pub fn process_response(&self, response: JsonRpcResponse) {
        if response.id().is_null() {
            warn!("Dropping uncorrelated response: {}", response);
            return;
        }
        let key = id_key(response.id());
        let call = {
            let table = self.lock();
            table
                .ids
                .get(&key)
                .and_then(|k| table.calls.get(k).map(|t| (*k, Arc::clone(&t.call))))
        };
        let Some((call_key, call)) = call else {
            debug!("No pending call for response {}", response);
            return;
        };
        if call.add_response(response) {
            self.remove(call_key);
        }
    }

    /// Resend or expire every call whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) {
        let mut resend = Vec::new();
        let mut expired = Vec::new();
        {
            let mut table = self.lock();
            let due: Vec<u64> = table
                .calls
                .iter()
                .filter(|(_, t)| t.deadline <= now)
                .map(|(k, _)| *k)
                .collect();
            for key in due {
                let Some(tracking) = table.calls.get_mut(&key) else {
                    continue;
                };
                if tracking.attempts_left > 1 {
                    tracking.attempts_left -= 1;
                    tracking.attempt += 1;
                    tracking.deadline = now + tracking.retry_timeout;
                    resend.push((
                        key,
                        Arc::clone(&tracking.call),
                        tracking.payload.clone(),
                        tracking.attempt,
                    ));
                } else if let Some(tracking) = table.remove(key) {
                    expired.push(tracking.call);
                }
            }
        }

        for call in expired {
            debug!("Call {:?} exhausted its retries", call.ids());
            call.fail_missing(JsonRpcResponse::timeout);
        }

        for (key, call, payload, attempt) in resend {
            debug!("Resending call {:?}, attempt {}", call.ids(), attempt);
            call.notify(CallEvent::Retrying { attempt });
            if let Err(e) = self.sender.resend(payload) {
                if self.policy().is_retryable(&e) {
                    debug!("Resend failed, will retry: {}", e);
                } else {
                    warn!("Resend failed: {}", e);
                    self.remove(key);
                    fail_with(&call, &e);
                }
            }
        }
    }

    /// The link went down. Retryable failures keep calls pending for the
    /// next sweep; anything else resolves them now.
    pub fn link_lost(&self, error: &ClientError) {
        let retryable = self.policy().is_retryable(error);
        let calls: Vec<Arc<PendingCall>> = {
            let mut table = self.lock();
            if retryable {
                table.calls.values().map(|t| Arc::clone(&t.call)).collect()
            } else {
                let keys: Vec<u64> = table.calls.keys().copied().collect();
                keys.into_iter()
                    .filter_map(|k| table.remove(k))
                    .map(|t| t.call)
                    .collect()
            }
        };
        for call in calls {
            call.notify(CallEvent::LinkLost(error.to_string()));
            if !retryable {
                fail_with(&call, error);
            }
        }
    }

    /// Resolve everything still pending with the timeout response.
    pub fn fail_all(&self) {
        let calls: Vec<Arc<PendingCall>> = {
            let mut table = self.lock();
            let keys: Vec<u64> = table.calls.keys().copied().collect();
            keys.into_iter()
                .filter_map(|k| table.remove(k))
                .map(|t| t.call)
                .collect()
        };
        for call in calls {
            call.fail_missing(JsonRpcResponse::timeout);
        }
    }

    /// Run [`sweep`](Self::sweep) every [`SWEEP_INTERVAL`] until the tracker is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, runtime: &tokio::runtime::Handle) {
        let weak = Arc::downgrade(self);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(tracker) = weak.upgrade() else {
                    break;
                };
                tracker.sweep(Instant::now());
            }
        });
    }
}

fn fail_with(call: &PendingCall, error: &ClientError) {
    let message = error.to_string();
    call.fail_missing(|id: Value| JsonRpcResponse::failure(id, TIMEOUT_ERROR_CODE, message.clone()));
}
