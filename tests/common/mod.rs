//! In-process STOMP broker for integration tests.
//!
//! The broker runs on its own [`Reactor`] listener and answers the handshake,
//! records subscriptions and requests, and replies to JSON-RPC requests on
//! the response destination according to its [`Mode`].

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use stomp_jsonrpc::reactor::{FrameReceiver, Reactor, ReactorClient, ReactorListener};
use stomp_jsonrpc::rpc::{
    ClientPolicy, Destinations, JsonRpcClient, ResponseWorker, DEFAULT_EVENT_RETENTION,
    DEFAULT_RESPONSE_DESTINATION,
};
use stomp_jsonrpc::stomp::frame::{
    HEADER_DESTINATION, HEADER_HEART_BEAT, HEADER_ID, HEADER_RECEIPT, HEADER_RECEIPT_ID,
};
use stomp_jsonrpc::stomp::{Command, Message, StompClient};

/// Upper bound for every blocking wait in the integration tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How the broker treats requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reply to each request with its params as the result. Batches are
    /// answered in reverse order; method `fail` gets an error response.
    Echo,
    /// Record requests and never reply.
    Silent,
}

#[derive(Default)]
struct Record {
    connects: usize,
    disconnects: usize,
    requests: Vec<Value>,
    sessions: Vec<(ReactorClient, Arc<Session>)>,
}

struct State {
    mode: Mode,
    receipts: bool,
    record: Mutex<Record>,
}

impl State {
    fn record(&self) -> std::sync::MutexGuard<'_, Record> {
        self.record.lock().unwrap()
    }
}

/// One accepted connection.
struct Session {
    state: Arc<State>,
    subscriptions: Mutex<HashMap<String, String>>,
}

impl Session {
    fn deliver(&self, client: &ReactorClient, destination: &str, payload: Value) -> bool {
        let Some(id) = self.subscriptions.lock().unwrap().get(destination).cloned() else {
            return false;
        };
        let message = Message::new(Command::Message)
            .with_header(HEADER_DESTINATION, destination)
            .with_header("subscription", id)
            .with_header("message-id", uuid::Uuid::new_v4().to_string())
            .with_content(payload.to_string());
        client.send_message(message).is_ok()
    }
}

impl FrameReceiver for Session {
    fn on_frame(&self, client: &ReactorClient, message: Message) {
        match message.command() {
            Command::Connect => {
                self.state.record().connects += 1;
                let connected = Message::new(Command::Connected)
                    .with_header("version", "1.2")
                    .with_header(HEADER_HEART_BEAT, "0,0");
                let _ = client.send_message(connected);
            }
            Command::Subscribe => {
                if let (Some(destination), Some(id)) =
                    (message.header(HEADER_DESTINATION), message.header(HEADER_ID))
                {
                    self.subscriptions
                        .lock()
                        .unwrap()
                        .insert(destination.to_string(), id.to_string());
                }
            }
            Command::Send => {
                let Ok(request) = serde_json::from_slice::<Value>(message.content()) else {
                    return;
                };
                self.state.record().requests.push(request.clone());
                if self.state.mode == Mode::Echo {
                    if let Some(reply) = echo(&request) {
                        self.deliver(client, DEFAULT_RESPONSE_DESTINATION, reply);
                    }
                }
            }
            Command::Disconnect => {
                self.state.record().disconnects += 1;
                if !self.state.receipts {
                    return;
                }
                if let Some(receipt) = message.header(HEADER_RECEIPT) {
                    let _ = client.send_message(
                        Message::new(Command::Receipt).with_header(HEADER_RECEIPT_ID, receipt),
                    );
                }
            }
            _ => {}
        }
    }
}

fn echo(request: &Value) -> Option<Value> {
    match request {
        Value::Array(items) => {
            let replies: Vec<Value> = items.iter().rev().filter_map(echo_one).collect();
            Some(Value::Array(replies))
        }
        other => echo_one(other),
    }
}

fn echo_one(request: &Value) -> Option<Value> {
    let id = request.get("id")?.clone();
    if request.get("method") == Some(&json!("fail")) {
        return Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": "Method not found"}
        }));
    }
    Some(json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": request.get("params").cloned().unwrap_or(Value::Null)
    }))
}

pub struct Broker {
    reactor: Reactor,
    listener: ReactorListener,
    state: Arc<State>,
}

impl Broker {
    pub fn start(mode: Mode) -> Self {
        Self::start_on(Reactor::new().unwrap(), mode, true)
    }

    /// Broker that never answers DISCONNECT receipts.
    pub fn without_receipts(mode: Mode) -> Self {
        Self::start_on(Reactor::new().unwrap(), mode, false)
    }

    pub fn start_on(reactor: Reactor, mode: Mode, receipts: bool) -> Self {
        let state = Arc::new(State {
            mode,
            receipts,
            record: Mutex::new(Record::default()),
        });
        let accept_state = Arc::clone(&state);
        let listener = reactor
            .create_listener("127.0.0.1", 0, move |client| {
                let session = Arc::new(Session {
                    state: Arc::clone(&accept_state),
                    subscriptions: Mutex::new(HashMap::new()),
                });
                client.add_receiver(session.clone());
                accept_state.record().sessions.push((client.clone(), session));
            })
            .unwrap();
        Self {
            reactor,
            listener,
            state,
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    pub fn connects(&self) -> usize {
        self.state.record().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.record().disconnects
    }

    pub fn requests(&self) -> Vec<Value> {
        self.state.record().requests.clone()
    }

    pub fn is_subscribed(&self, destination: &str) -> bool {
        self.state
            .record()
            .sessions
            .iter()
            .any(|(_, session)| session.subscriptions.lock().unwrap().contains_key(destination))
    }

    /// Send `payload` to every session subscribed to `destination`.
    pub fn push(&self, destination: &str, payload: Value) -> usize {
        let sessions: Vec<_> = self.state.record().sessions.clone();
        sessions
            .iter()
            .filter(|(client, session)| session.deliver(client, destination, payload.clone()))
            .count()
    }

    pub fn close(&self) {
        self.listener.close().wait(Some(TEST_TIMEOUT)).unwrap();
        self.reactor.close();
    }
}

/// Poll `condition` until it holds or [`TEST_TIMEOUT`] elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// A client wired to its own reactor and worker.
pub struct TestClient {
    pub client: JsonRpcClient,
    pub worker: Arc<ResponseWorker>,
    pub reactor: Reactor,
}

impl TestClient {
    pub fn new(port: u16, policy: ClientPolicy) -> Self {
        Self::on(Reactor::new().unwrap(), "127.0.0.1", port, policy)
    }

    pub fn on(reactor: Reactor, host: &str, port: u16, policy: ClientPolicy) -> Self {
        let worker = ResponseWorker::new(2, DEFAULT_EVENT_RETENTION).unwrap();
        let transport = reactor.create_client(host, port, Arc::new(policy));
        let stomp = StompClient::new(transport, TEST_TIMEOUT);
        let client = worker.register(stomp, Destinations::default()).unwrap();
        Self {
            client,
            worker,
            reactor,
        }
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        let _ = self.client.close();
        self.worker.close();
        self.reactor.close();
    }
}
