//! Inbound dispatch between sessions, pending calls and event subscribers.
//!
//! Sessions push raw response-channel payloads onto one queue. A single
//! dispatcher task on the worker pool classifies each payload:
//!
//! - a JSON array is handled element by element
//! - an object with a `method` member is an event for the [`EventPublisher`]
//! - anything else must be a valid response and goes to the owning tracker
//!
//! Classification is sequential so events keep their arrival order; the
//! event deliveries themselves fan out over the pool.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::events::{Event, EventPublisher, SubscriptionId, PURGE_INTERVAL};
use crate::rpc::client::{Destinations, JsonRpcClient, LinkWatcher, StompSender};
use crate::rpc::envelope::JsonRpcResponse;
use crate::rpc::tracker::ResponseTracker;
use crate::stomp::{ChannelListener, StompClient};

/// Default retention for unclaimed events.
pub const DEFAULT_EVENT_RETENTION: Duration = Duration::from_secs(3 * 60 * 60);

struct Inbound {
    payload: Bytes,
    tracker: Weak<ResponseTracker>,
}

/// Channel listener for a client's response destination.
struct ResponseChannel {
    queue: mpsc::UnboundedSender<Inbound>,
    tracker: Weak<ResponseTracker>,
}

impl ChannelListener for ResponseChannel {
    fn on_message(&self, payload: Bytes) {
        let inbound = Inbound {
            payload,
            tracker: Weak::clone(&self.tracker),
        };
        if self.queue.send(inbound).is_err() {
            debug!("Response worker closed, dropping inbound message");
        }
    }
}

/// Worker pool shared by every registered client.
pub struct ResponseWorker {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    queue: mpsc::UnboundedSender<Inbound>,
    publisher: Arc<EventPublisher>,
}

impl ResponseWorker {
    /// Start a pool of `parallelism` threads. Unclaimed events are kept for
    /// `event_retention`.
    pub fn new(parallelism: usize, event_retention: Duration) -> Result<Arc<Self>, ClientError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(parallelism.max(1))
            .thread_name("stomp-response-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let publisher = EventPublisher::new(handle.clone(), event_retention);
        publisher.spawn_purger(PURGE_INTERVAL);

        let (queue, mut inbound) = mpsc::unbounded_channel::<Inbound>();
        let dispatch_publisher = Arc::clone(&publisher);
        handle.spawn(async move {
            while let Some(message) = inbound.recv().await {
                dispatch(&dispatch_publisher, &message.payload, &message.tracker);
            }
        });

        debug!("Response worker started with {} threads", parallelism.max(1));
        Ok(Arc::new(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            queue,
            publisher,
        }))
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Bind `stomp` to a new [`JsonRpcClient`]: subscribe to the response
    /// destination, start the retry sweep and watch for link loss.
    pub fn register(
        &self,
        stomp: StompClient,
        destinations: Destinations,
    ) -> Result<JsonRpcClient, ClientError> {
        let sender = Arc::new(StompSender::new(stomp.clone(), destinations.requests.clone()));
        let tracker = Arc::new(ResponseTracker::new(sender, stomp.transport().policy()));

        stomp.subscribe(
            &destinations.responses,
            Arc::new(ResponseChannel {
                queue: self.queue.clone(),
                tracker: Arc::downgrade(&tracker),
            }),
        )?;
        stomp
            .transport()
            .add_receiver(Arc::new(LinkWatcher(Arc::downgrade(&tracker))));
        tracker.spawn_sweeper(&self.handle);

        Ok(JsonRpcClient::new(stomp, tracker, destinations))
    }

    /// Whether the pool is still up, i.e. [`close`](Self::close) has not run.
    pub fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Complete every event subscriber and stop the pool.
    pub fn close(&self) {
        self.publisher.close();
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl Drop for ResponseWorker {
    fn drop(&mut self) {
        self.close();
    }
}

fn dispatch(publisher: &EventPublisher, payload: &[u8], tracker: &Weak<ResponseTracker>) {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!("Dropping unparseable message: {}", e);
            return;
        }
    };
    match value {
        Value::Array(items) => {
            for item in items {
                route(publisher, item, tracker);
            }
        }
        other => route(publisher, other, tracker),
    }
}

fn route(publisher: &EventPublisher, value: Value, tracker: &Weak<ResponseTracker>) {
    let mut node = match value {
        Value::Object(node) => node,
        other => {
            warn!("Dropping non-object message: {}", other);
            return;
        }
    };
    if let Some(method) = node.remove("method") {
        let method = match method {
            Value::String(method) => method,
            other => {
                warn!("Dropping event with non-string method: {}", other);
                return;
            }
        };
        match SubscriptionId::parse(&method) {
            Ok(id) => {
                let params = node.remove("params").unwrap_or(Value::Null);
                publisher.publish(Event::new(id, params));
            }
            Err(e) => warn!("Dropping event: {}", e),
        }
        return;
    }

    let value = Value::Object(node);
    match JsonRpcResponse::from_value(value) {
        Ok(response) => match tracker.upgrade() {
            Some(tracker) => tracker.process_response(response),
            None => debug!("Client gone, dropping {}", response),
        },
        Err(e) => warn!("Dropping message: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventSubscriber, Subscription};
    use crate::rpc::call::PendingCall;
    use crate::rpc::policy::ClientPolicy;
    use crate::rpc::tracker::FrameSender;
    use serde_json::json;
    use std::sync::mpsc::{sync_channel, SyncSender};

    struct NullSender;

    impl FrameSender for NullSender {
        fn resend(&self, _payload: Bytes) -> Result<(), ClientError> {
            Ok(())
        }
    }

    struct Collector(SyncSender<Value>);

    impl EventSubscriber for Collector {
        fn on_subscribe(&self, subscription: Subscription) {
            subscription.request(u64::MAX);
        }
        fn on_next(&self, event: Event) {
            let _ = self.0.send(event.params().clone());
        }
        fn on_error(&self, _error: ClientError) {}
        fn on_complete(&self) {}
    }

    fn tracker() -> Arc<ResponseTracker> {
        Arc::new(ResponseTracker::new(Arc::new(NullSender), Arc::new(ClientPolicy::default())))
    }

    #[test]
    fn test_dispatch_routes_responses_and_events() {
        let worker = ResponseWorker::new(2, DEFAULT_EVENT_RETENTION).unwrap();
        let (tx, events) = sync_channel(8);
        worker
            .publisher()
            .subscribe("*|testcase|*|*", Arc::new(Collector(tx)))
            .unwrap();

        let tracker = tracker();
        let call = Arc::new(PendingCall::new(vec![json!("1"), json!("2")], None));
        tracker
            .register(Arc::clone(&call), Bytes::new(), &ClientPolicy::default())
            .unwrap();
        let weak = Arc::downgrade(&tracker);

        dispatch(
            worker.publisher(),
            br#"{"jsonrpc": "2.0", "method": "|testcase|test|update", "params": {"value": 42}}"#,
            &weak,
        );
        dispatch(
            worker.publisher(),
            br#"[{"jsonrpc":"2.0","id":"2","result":2},{"jsonrpc":"2.0","id":"1","result":1}]"#,
            &weak,
        );

        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            json!({"value": 42})
        );
        assert!(call.is_done());
        assert_eq!(tracker.pending(), 0);
        worker.close();
    }

    #[test]
    fn test_dispatch_drops_violations() {
        let worker = ResponseWorker::new(1, DEFAULT_EVENT_RETENTION).unwrap();
        let tracker = tracker();
        let call = Arc::new(PendingCall::new(vec![json!(1)], None));
        tracker
            .register(Arc::clone(&call), Bytes::new(), &ClientPolicy::default())
            .unwrap();
        let weak = Arc::downgrade(&tracker);

        for payload in [
            &b"not json"[..],
            &br#"{"jsonrpc":"1.0","id":1,"result":true}"#[..],
            &br#"{"jsonrpc":"2.0","result":true}"#[..],
            &br#"{"jsonrpc":"2.0","id":null,"error":{"code":1,"message":"x"}}"#[..],
            &br#"{"jsonrpc":"2.0","method":"too|few","params":{}}"#[..],
        ] {
            dispatch(worker.publisher(), payload, &weak);
        }
        assert!(!call.is_done());
        assert_eq!(worker.publisher().unclaimed_count(), 0);
        worker.close();
    }
}
