//! STOMP session on top of a reactor link.
//!
//! The session owns the handshake, channel subscriptions, the open
//! transaction and the disconnect receipt. All of it lives behind one lock
//! so that a subscribe racing a CONNECTED frame is sent exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ClientError;
use crate::reactor::{FrameReceiver, ReactorClient};
use crate::stomp::frame::{
    Command, Message, HEADER_ACCEPT, HEADER_DESTINATION, HEADER_HEART_BEAT, HEADER_HOST,
    HEADER_ID, HEADER_MESSAGE, HEADER_RECEIPT, HEADER_RECEIPT_ID, HEADER_TRANSACTION,
};
use crate::stomp::heartbeat::{format_heartbeat, negotiate_pair};

pub const PROTOCOL_VERSION: &str = "1.2";

/// How long `disconnect` waits for the broker's receipt.
pub const DISCONNECT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Most frames parked while the session is down; the oldest go first.
pub const MAX_OUTBOX: usize = 1024;

/// Consumer of one subscribed destination. Runs on the loop thread.
pub trait ChannelListener: Send + Sync {
    /// Body of a MESSAGE frame.
    fn on_message(&self, payload: Bytes);

    /// An ERROR frame addressed to this destination.
    fn on_error(&self, headers: &[(String, String)], payload: Bytes) {
        let message = headers
            .iter()
            .find(|(name, _)| name == HEADER_MESSAGE)
            .map(|(_, value)| value.as_str())
            .unwrap_or_default();
        warn!("Broker error: {} ({} byte body)", message, payload.len());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Idle,
    Pending,
    Connected,
}

struct Channel {
    token: String,
    listener: Arc<dyn ChannelListener>,
}

struct Session {
    handshake: Handshake,
    channels: HashMap<String, Channel>,
    transaction: Option<String>,
    receipt: Option<(String, SyncSender<()>)>,
    connect_waiters: Vec<(u64, SyncSender<Result<(), ClientError>>)>,
    next_waiter: u64,
    /// Frames submitted before CONNECTED; flushed right after it.
    outbox: VecDeque<Message>,
}

impl Session {
    fn drop_waiter(&mut self, id: u64) {
        self.connect_waiters.retain(|(waiter, _)| *waiter != id);
    }
}

struct StompInner {
    transport: ReactorClient,
    host: String,
    handshake_timeout: Duration,
    session: Mutex<Session>,
}

impl StompInner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send now if the session is up, otherwise park the frame and make sure
    /// a connect is under way. Caller holds the session lock.
    fn submit(&self, session: &mut Session, message: Message) -> Result<(), ClientError> {
        self.park_or_send(session, message, false)
    }

    /// `collapse` skips parking a frame identical to one already parked.
    fn park_or_send(
        &self,
        session: &mut Session,
        message: Message,
        collapse: bool,
    ) -> Result<(), ClientError> {
        if session.handshake == Handshake::Connected {
            return self.transport.send_message(message);
        }
        if collapse && session.outbox.contains(&message) {
            debug!("{} frame already queued for the next session", message.command());
        } else {
            if session.outbox.len() >= MAX_OUTBOX {
                warn!("Outbox full, dropping oldest of {} queued frames", session.outbox.len());
                session.outbox.pop_front();
            }
            session.outbox.push_back(message);
        }
        self.transport.reconnect()
    }
}

/// STOMP session client. Cheap to clone.
#[derive(Clone)]
pub struct StompClient {
    inner: Arc<StompInner>,
}

impl StompClient {
    /// Attach a session to `transport`. The link is not opened yet.
    pub fn new(transport: ReactorClient, handshake_timeout: Duration) -> Self {
        let host = transport
            .remote()
            .map(|(host, _)| host.to_string())
            .unwrap_or_default();
        let inner = Arc::new(StompInner {
            transport: transport.clone(),
            host,
            handshake_timeout,
            session: Mutex::new(Session {
                handshake: Handshake::Idle,
                channels: HashMap::new(),
                transaction: None,
                receipt: None,
                connect_waiters: Vec::new(),
                next_waiter: 0,
                outbox: VecDeque::new(),
            }),
        });
        transport.add_receiver(Arc::new(SessionReceiver(Arc::downgrade(&inner))));
        Self { inner }
    }

    pub fn transport(&self) -> &ReactorClient {
        &self.inner.transport
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().handshake == Handshake::Connected
    }

    /// Open the link and block until the broker answers CONNECTED.
    pub fn connect(&self) -> Result<(), ClientError> {
        if self.inner.transport.reactor().on_loop_thread() {
            return Err(ClientError::Misuse(
                "blocking connect called from the reactor thread".to_string(),
            ));
        }
        let (tx, rx) = sync_channel(1);
        let waiter = {
            let mut session = self.inner.lock();
            if session.handshake == Handshake::Connected {
                return Ok(());
            }
            let id = session.next_waiter;
            session.next_waiter += 1;
            session.connect_waiters.push((id, tx));
            id
        };

        if let Err(e) = self.inner.transport.connect() {
            self.inner.lock().drop_waiter(waiter);
            return Err(e);
        }

        match rx.recv_timeout(self.inner.handshake_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.inner.lock().drop_waiter(waiter);
                Err(ClientError::Timeout(self.inner.handshake_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Closed),
        }
    }

    /// Subscribe `listener` to `destination`; returns the subscription token.
    pub fn subscribe(
        &self,
        destination: &str,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<String, ClientError> {
        let mut session = self.inner.lock();
        if session.channels.contains_key(destination) {
            return Err(ClientError::Misuse(format!(
                "Already subscribed to {}",
                destination
            )));
        }
        let token = Uuid::new_v4().to_string();
        session.channels.insert(
            destination.to_string(),
            Channel {
                token: token.clone(),
                listener,
            },
        );
        // Otherwise sent with the rest once CONNECTED arrives.
        if session.handshake == Handshake::Connected {
            self.inner
                .transport
                .send_message(subscribe_frame(destination, &token))?;
        }
        debug!("Subscribed to {} as {}", destination, token);
        Ok(token)
    }

    pub fn unsubscribe(&self, destination: &str) -> Result<(), ClientError> {
        let mut session = self.inner.lock();
        let channel = session.channels.remove(destination).ok_or_else(|| {
            ClientError::Misuse(format!("Not subscribed to {}", destination))
        })?;
        if session.handshake == Handshake::Connected {
            self.inner.transport.send_message(
                Message::new(Command::Unsubscribe).with_header(HEADER_ID, channel.token),
            )?;
        }
        Ok(())
    }

    /// Send `payload` to `destination`, inside the open transaction if any.
    pub fn send(&self, destination: &str, payload: Bytes) -> Result<(), ClientError> {
        let mut session = self.inner.lock();
        let mut message = Message::new(Command::Send).with_header(HEADER_DESTINATION, destination);
        if let Some(transaction) = &session.transaction {
            message.set_header(HEADER_TRANSACTION, transaction.clone());
        }
        self.inner.submit(&mut session, message.with_content(payload))
    }

    /// Like [`send`](Self::send), but while the session is down an identical
    /// parked frame absorbs this one instead of queueing a copy.
    pub fn resend(&self, destination: &str, payload: Bytes) -> Result<(), ClientError> {
        let mut session = self.inner.lock();
        let mut message = Message::new(Command::Send).with_header(HEADER_DESTINATION, destination);
        if let Some(transaction) = &session.transaction {
            message.set_header(HEADER_TRANSACTION, transaction.clone());
        }
        self.inner
            .park_or_send(&mut session, message.with_content(payload), true)
    }

    /// Open a transaction; returns its id.
    pub fn begin(&self) -> Result<String, ClientError> {
        let mut session = self.inner.lock();
        if session.transaction.is_some() {
            return Err(ClientError::Misuse("Transaction already running".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        self.inner.submit(
            &mut session,
            Message::new(Command::Begin).with_header(HEADER_TRANSACTION, id.clone()),
        )?;
        session.transaction = Some(id.clone());
        Ok(id)
    }

    pub fn commit(&self) -> Result<(), ClientError> {
        let mut session = self.inner.lock();
        let Some(id) = session.transaction.take() else {
            return Err(ClientError::Misuse("No running transaction".to_string()));
        };
        self.inner.submit(
            &mut session,
            Message::new(Command::Commit).with_header(HEADER_TRANSACTION, id),
        )
    }

    pub fn transaction(&self) -> Option<String> {
        self.inner.lock().transaction.clone()
    }

    /// Say goodbye and close the link.
    ///
    /// Waits up to [`DISCONNECT_RECEIPT_TIMEOUT`] for the receipt, then
    /// closes regardless. Returns whether the receipt arrived.
    pub fn disconnect(&self) -> Result<bool, ClientError> {
        if self.inner.transport.reactor().on_loop_thread() {
            return Err(ClientError::Misuse(
                "blocking disconnect called from the reactor thread".to_string(),
            ));
        }
        let (tx, rx) = sync_channel(1);
        let sent = {
            let mut session = self.inner.lock();
            if session.handshake == Handshake::Connected {
                let token = Uuid::new_v4().to_string();
                session.receipt = Some((token.clone(), tx));
                self.inner
                    .transport
                    .send_message(Message::new(Command::Disconnect).with_header(HEADER_RECEIPT, token))
                    .is_ok()
            } else {
                false
            }
        };

        let confirmed = sent && rx.recv_timeout(DISCONNECT_RECEIPT_TIMEOUT).is_ok();
        if sent && !confirmed {
            debug!("No disconnect receipt within {:?}", DISCONNECT_RECEIPT_TIMEOUT);
        }
        self.stop();
        Ok(confirmed)
    }

    /// Close the link without a goodbye.
    pub fn stop(&self) {
        {
            let mut session = self.inner.lock();
            session.handshake = Handshake::Idle;
            session.receipt = None;
            session.transaction = None;
            session.outbox.clear();
            for (_, waiter) in session.connect_waiters.drain(..) {
                let _ = waiter.send(Err(ClientError::Closed));
            }
        }
        self.inner.transport.close();
    }
}

fn subscribe_frame(destination: &str, token: &str) -> Message {
    Message::new(Command::Subscribe)
        .with_header(HEADER_DESTINATION, destination)
        .with_header(HEADER_ID, token)
}

/// Holds the session weakly so the transport does not keep it alive.
struct SessionReceiver(Weak<StompInner>);

impl FrameReceiver for SessionReceiver {
    fn on_open(&self, client: &ReactorClient) -> Vec<Message> {
        let Some(inner) = self.0.upgrade() else {
            return Vec::new();
        };
        inner.lock().handshake = Handshake::Pending;

        let policy = client.policy();
        let outgoing = if policy.is_outgoing_heartbeat() {
            policy.outgoing_heartbeat()
        } else {
            Duration::ZERO
        };
        let incoming = if policy.is_incoming_heartbeat() {
            policy.incoming_heartbeat()
        } else {
            Duration::ZERO
        };
        vec![Message::new(Command::Connect)
            .with_header(HEADER_ACCEPT, PROTOCOL_VERSION)
            .with_header(HEADER_HOST, inner.host.clone())
            .with_header(HEADER_HEART_BEAT, format_heartbeat(outgoing, incoming))]
    }

    fn on_frame(&self, client: &ReactorClient, message: Message) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        match message.command() {
            Command::Connected => on_connected(&inner, client, &message),
            Command::Message => {
                let Some(listener) = listener_for(&inner, &message) else {
                    return;
                };
                listener.on_message(message.content().clone());
            }
            Command::Error => {
                let Some(listener) = listener_for(&inner, &message) else {
                    warn!(
                        "Unaddressed broker error: {}",
                        message.header(HEADER_MESSAGE).unwrap_or_default()
                    );
                    return;
                };
                listener.on_error(message.headers(), message.content().clone());
            }
            Command::Receipt => {
                let mut session = inner.lock();
                let matches = matches!(
                    (&session.receipt, message.header(HEADER_RECEIPT_ID)),
                    (Some((token, _)), Some(id)) if token == id
                );
                if matches {
                    if let Some((_, done)) = session.receipt.take() {
                        let _ = done.send(());
                    }
                }
            }
            other => debug!("Ignoring {} frame", other),
        }
    }

    fn on_link_lost(&self, _client: &ReactorClient, error: &ClientError) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let mut session = inner.lock();
        session.handshake = Handshake::Idle;
        // The broker forgets transactions with the session.
        if let Some(transaction) = session.transaction.take() {
            debug!("Transaction {} abandoned with the link", transaction);
        }
        for (_, waiter) in session.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.duplicate()));
        }
    }
}

fn on_connected(inner: &StompInner, client: &ReactorClient, message: &Message) {
    let policy = client.policy();
    let offer_out = if policy.is_outgoing_heartbeat() {
        policy.outgoing_heartbeat().as_millis() as u64
    } else {
        0
    };
    let offer_in = if policy.is_incoming_heartbeat() {
        policy.incoming_heartbeat().as_millis() as u64
    } else {
        0
    };
    let peer = message.header(HEADER_HEART_BEAT).unwrap_or("0,0");
    let (outgoing, incoming) = negotiate_pair(offer_out, offer_in, peer).unwrap_or_else(|| {
        warn!("Unparseable heart-beat header {:?}, heartbeats disabled", peer);
        (0, 0)
    });
    client.set_heartbeat(outgoing, incoming);

    let mut session = inner.lock();
    if session.handshake != Handshake::Pending {
        debug!("Unexpected CONNECTED frame");
        return;
    }
    session.handshake = Handshake::Connected;

    let mut frames: Vec<Message> = session
        .channels
        .iter()
        .map(|(destination, channel)| subscribe_frame(destination, &channel.token))
        .collect();
    frames.extend(session.outbox.drain(..));
    for frame in frames {
        if let Err(e) = client.send_message(frame) {
            warn!("Failed to flush frame after connect: {}", e);
            break;
        }
    }

    info!("Session established with {}", inner.host);
    for (_, waiter) in session.connect_waiters.drain(..) {
        let _ = waiter.send(Ok(()));
    }
}

/// Listener for the frame's destination, once the session is up.
fn listener_for(inner: &StompInner, message: &Message) -> Option<Arc<dyn ChannelListener>> {
    let session = inner.lock();
    if session.handshake != Handshake::Connected {
        debug!("Discarding {} frame received before CONNECTED", message.command());
        return None;
    }
    let destination = message.header(HEADER_DESTINATION)?;
    match session.channels.get(destination) {
        Some(channel) => Some(Arc::clone(&channel.listener)),
        None => {
            debug!("No listener for destination {}", destination);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use crate::rpc::ClientPolicy;
    use crate::stomp::frame::{decode, encode};
    use bytes::BytesMut;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Minimal scripted peer speaking raw frames over a std socket.
    struct Peer {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl Peer {
        fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();
            Self {
                stream,
                buf: BytesMut::new(),
            }
        }

        fn read(&mut self) -> Message {
            loop {
                if let Some((message, used)) = decode(&self.buf).unwrap() {
                    let _ = self.buf.split_to(used);
                    if !message.is_heartbeat() {
                        return message;
                    }
                    continue;
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).unwrap();
                assert!(n > 0, "peer closed");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }

        fn write(&mut self, message: Message) {
            self.stream.write_all(&encode(&message)).unwrap();
        }
    }

    struct Inbox(SyncSender<Bytes>);

    impl ChannelListener for Inbox {
        fn on_message(&self, payload: Bytes) {
            let _ = self.0.send(payload);
        }
    }

    fn session() -> (Reactor, StompClient, TcpListener) {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let reactor = Reactor::new().unwrap();
        let policy = ClientPolicy::new(
            Duration::from_millis(100),
            1,
            Duration::from_millis(2000),
            Duration::ZERO,
            vec![],
        );
        let transport = reactor.create_client("127.0.0.1", port, Arc::new(policy));
        (reactor, StompClient::new(transport, TEST_TIMEOUT), server)
    }

    #[test]
    fn test_handshake_subscribe_and_deliver() {
        let (reactor, client, server) = session();
        let (tx, rx) = sync_channel(4);
        client.subscribe("rpc.responses", Arc::new(Inbox(tx))).unwrap();

        let broker = std::thread::spawn(move || {
            let mut peer = Peer::accept(&server);
            let connect = peer.read();
            assert_eq!(connect.command(), Command::Connect);
            assert_eq!(connect.header(HEADER_ACCEPT), Some("1.2"));
            assert_eq!(connect.header(HEADER_HEART_BEAT), Some("0,2000"));

            // A stray frame before CONNECTED must be dropped.
            peer.write(
                Message::new(Command::Message)
                    .with_header(HEADER_DESTINATION, "rpc.responses")
                    .with_content(&b"early"[..]),
            );
            peer.write(Message::new(Command::Connected).with_header(HEADER_HEART_BEAT, "0,0"));

            let subscribe = peer.read();
            assert_eq!(subscribe.command(), Command::Subscribe);
            assert_eq!(subscribe.header(HEADER_DESTINATION), Some("rpc.responses"));
            peer.write(
                Message::new(Command::Message)
                    .with_header(HEADER_DESTINATION, "rpc.responses")
                    .with_content(&b"hello"[..]),
            );
            peer
        });

        client.connect().unwrap();
        assert!(client.is_connected());
        let payload = rx.recv_timeout(TEST_TIMEOUT).unwrap();
        assert_eq!(&payload[..], b"hello");
        assert!(rx.try_recv().is_err());

        let _peer = broker.join().unwrap();
        client.stop();
        reactor.close();
    }

    #[test]
    fn test_double_subscribe_rejected() {
        let (reactor, client, _server) = session();
        let (tx, _rx) = sync_channel(1);
        let listener: Arc<dyn ChannelListener> = Arc::new(Inbox(tx));
        client.subscribe("events", Arc::clone(&listener)).unwrap();
        let err = client.subscribe("events", listener).unwrap_err();
        assert!(matches!(err, ClientError::Misuse(_)));

        client.unsubscribe("events").unwrap();
        assert!(matches!(client.unsubscribe("events"), Err(ClientError::Misuse(_))));
        client.stop();
        reactor.close();
    }

    #[test]
    fn test_transaction_misuse() {
        let (reactor, client, _server) = session();
        assert!(matches!(client.commit(), Err(ClientError::Misuse(_))));
        let id = client.begin().unwrap();
        assert_eq!(client.transaction(), Some(id));
        assert!(matches!(client.begin(), Err(ClientError::Misuse(_))));
        client.commit().unwrap();
        assert!(client.transaction().is_none());
        client.stop();
        reactor.close();
    }

    #[test]
    fn test_send_in_transaction_and_disconnect_receipt() {
        let (reactor, client, server) = session();

        let broker = std::thread::spawn(move || {
            let mut peer = Peer::accept(&server);
            assert_eq!(peer.read().command(), Command::Connect);
            peer.write(Message::new(Command::Connected));

            let begin = peer.read();
            assert_eq!(begin.command(), Command::Begin);
            let tx_id = begin.header(HEADER_TRANSACTION).unwrap().to_string();

            let send = peer.read();
            assert_eq!(send.command(), Command::Send);
            assert_eq!(send.header(HEADER_TRANSACTION), Some(tx_id.as_str()));
            assert_eq!(&send.content()[..], b"{}");

            assert_eq!(peer.read().command(), Command::Commit);

            let disconnect = peer.read();
            assert_eq!(disconnect.command(), Command::Disconnect);
            let receipt = disconnect.header(HEADER_RECEIPT).unwrap().to_string();
            peer.write(Message::new(Command::Receipt).with_header(HEADER_RECEIPT_ID, receipt));
            peer
        });

        client.connect().unwrap();
        client.begin().unwrap();
        client.send("rpc.requests", Bytes::from_static(b"{}")).unwrap();
        client.commit().unwrap();
        assert!(client.disconnect().unwrap());
        assert!(!client.is_connected());

        let _peer = broker.join().unwrap();
        reactor.close();
    }

    #[test]
    fn test_parked_resends_collapse_and_outbox_is_bounded() {
        let (reactor, client, _server) = session();
        let payload = Bytes::from_static(br#"{"id":1}"#);
        for _ in 0..3 {
            client.resend("rpc.requests", payload.clone()).unwrap();
        }
        assert_eq!(client.inner.lock().outbox.len(), 1);

        // Plain sends of the same bytes are distinct messages.
        client.send("rpc.requests", payload.clone()).unwrap();
        assert_eq!(client.inner.lock().outbox.len(), 2);

        for i in 0..MAX_OUTBOX + 5 {
            client
                .send("rpc.requests", Bytes::from(format!("{{\"n\":{}}}", i)))
                .unwrap();
        }
        let session = client.inner.lock();
        assert_eq!(session.outbox.len(), MAX_OUTBOX);
        assert_eq!(
            session.outbox.back().map(|m| m.content().clone()),
            Some(Bytes::from(format!("{{\"n\":{}}}", MAX_OUTBOX + 4)))
        );
        drop(session);
        client.stop();
        reactor.close();
    }

    #[test]
    fn test_failed_connect_leaves_no_waiter() {
        let port = {
            let spare = TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap().port()
        };
        let reactor = Reactor::new().unwrap();
        let policy = ClientPolicy::new(Duration::from_millis(100), 1, Duration::ZERO, Duration::ZERO, vec![]);
        let transport = reactor.create_client("127.0.0.1", port, Arc::new(policy));
        let client = StompClient::new(transport, TEST_TIMEOUT);

        assert!(client.connect().is_err());
        assert!(client.inner.lock().connect_waiters.is_empty());
        client.stop();
        reactor.close();
    }

    #[test]
    fn test_link_loss_abandons_transaction() {
        let (reactor, client, server) = session();
        let broker = std::thread::spawn(move || {
            let mut peer = Peer::accept(&server);
            assert_eq!(peer.read().command(), Command::Connect);
            peer.write(Message::new(Command::Connected));
            assert_eq!(peer.read().command(), Command::Begin);
            // Dropping the peer closes the link.
        });

        client.connect().unwrap();
        client.begin().unwrap();
        broker.join().unwrap();

        let deadline = std::time::Instant::now() + TEST_TIMEOUT;
        while client.is_connected() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!client.is_connected());
        assert!(client.transaction().is_none());
        client.stop();
        reactor.close();
    }

    #[test]
    fn test_disconnect_without_receipt_times_out() {
        let (reactor, client, server) = session();
        let broker = std::thread::spawn(move || {
            let mut peer = Peer::accept(&server);
            peer.read();
            peer.write(Message::new(Command::Connected));
            assert_eq!(peer.read().command(), Command::Disconnect);
            peer
        });

        client.connect().unwrap();
        let started = std::time::Instant::now();
        assert!(!client.disconnect().unwrap());
        assert!(started.elapsed() >= DISCONNECT_RECEIPT_TIMEOUT);

        let _peer = broker.join().unwrap();
        reactor.close();
    }
}
