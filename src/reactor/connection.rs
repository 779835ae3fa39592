//! Client links driven by the reactor loop.
//!
//! Each open link runs one task on the loop thread that multiplexes socket
//! reads, the outbound frame queue and both heartbeat timers. Frames queued
//! from any thread are written in submission order.

use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::Reactor;
use crate::error::ClientError;
use crate::rpc::ClientPolicy;
use crate::stomp::frame::{decode, encode, Message, MAX_FRAME_SIZE};
use crate::stomp::heartbeat::{add_grace_period, reduce_grace_period};

pub(crate) trait LinkStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkStream for T {}

pub(crate) type BoxedStream = Box<dyn LinkStream>;

/// Observer of a client's inbound traffic.
///
/// Every method runs on the loop thread and must not block.
pub trait FrameReceiver: Send + Sync {
    /// Frames written ahead of anything queued while the link was down.
    fn on_open(&self, _client: &ReactorClient) -> Vec<Message> {
        Vec::new()
    }

    /// A complete non-heartbeat frame arrived.
    fn on_frame(&self, client: &ReactorClient, message: Message);

    /// The link went down for a reason other than a local close.
    fn on_link_lost(&self, _client: &ReactorClient, _error: &ClientError) {}
}

/// Encryption sub-state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    /// Plain TCP link.
    None,
    Handshaking,
    Established,
    Closing,
    Closed,
}

pub(crate) enum Outbound {
    Frame(Message),
    Heartbeat { outgoing: u64, incoming: u64 },
    Close,
}

type Waiter = SyncSender<Result<(), ClientError>>;

enum Link {
    Closed,
    Connecting {
        backlog: Vec<Message>,
        waiters: Vec<Waiter>,
    },
    Open {
        tx: mpsc::UnboundedSender<Outbound>,
        generation: u64,
    },
    /// Closed locally, or an accepted link that ended. Never reopens.
    Stopped,
}

struct ClientInner {
    reactor: Reactor,
    /// `None` for accepted links, which cannot be redialed.
    remote: Option<(String, u16)>,
    policy: RwLock<Arc<ClientPolicy>>,
    connect_timeout: RwLock<Duration>,
    link: Mutex<Link>,
    generation: AtomicU64,
    receivers: Mutex<Vec<Arc<dyn FrameReceiver>>>,
    tls_state: Mutex<TlsState>,
}

/// Handle to one (re)connectable link. Cheap to clone.
#[derive(Clone)]
pub struct ReactorClient {
    inner: Arc<ClientInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ReactorClient {
    pub(crate) fn new(reactor: Reactor, host: &str, port: u16, policy: Arc<ClientPolicy>) -> Self {
        Self::build(reactor, Some((host.to_string(), port)), policy, Link::Closed)
    }

    fn build(
        reactor: Reactor,
        remote: Option<(String, u16)>,
        policy: Arc<ClientPolicy>,
        link: Link,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                reactor,
                remote,
                policy: RwLock::new(policy),
                connect_timeout: RwLock::new(super::DEFAULT_CONNECT_TIMEOUT),
                link: Mutex::new(link),
                generation: AtomicU64::new(0),
                receivers: Mutex::new(Vec::new()),
                tls_state: Mutex::new(TlsState::None),
            }),
        }
    }

    /// Wrap an accepted stream. Must run on the loop thread; reading starts
    /// only once [`start_accepted`](Self::start_accepted) is called.
    pub(crate) fn accepted(reactor: Reactor, tls: bool) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self::build(
            reactor,
            None,
            Arc::new(ClientPolicy::with_retry(Duration::ZERO, 1, Duration::ZERO)),
            Link::Open { tx, generation: 1 },
        );
        client.inner.generation.store(1, Ordering::Release);
        if tls {
            client.set_tls_state(TlsState::Established);
        }
        (client, rx)
    }

    pub(crate) fn start_accepted(&self, stream: BoxedStream, rx: mpsc::UnboundedReceiver<Outbound>) {
        tokio::spawn(run_link(self.clone(), stream, rx, 1));
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    pub fn remote(&self) -> Option<(&str, u16)> {
        self.inner.remote.as_ref().map(|(host, port)| (host.as_str(), *port))
    }

    pub fn policy(&self) -> Arc<ClientPolicy> {
        Arc::clone(&self.inner.policy.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    pub fn set_policy(&self, policy: Arc<ClientPolicy>) {
        *self.inner.policy.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = policy;
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        *self
            .inner
            .connect_timeout
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = timeout;
    }

    fn connect_timeout(&self) -> Duration {
        *self
            .inner
            .connect_timeout
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_receiver(&self, receiver: Arc<dyn FrameReceiver>) {
        lock(&self.inner.receivers).push(receiver);
    }

    fn receivers(&self) -> Vec<Arc<dyn FrameReceiver>> {
        lock(&self.inner.receivers).clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(*lock(&self.inner.link), Link::Open { .. })
    }

    pub fn tls_state(&self) -> TlsState {
        *lock(&self.inner.tls_state)
    }

    fn set_tls_state(&self, state: TlsState) {
        *lock(&self.inner.tls_state) = state;
    }

    /// Open the link, blocking the calling thread.
    ///
    /// Retryable failures are retried until the policy's attempts are used
    /// up, sleeping the retry timeout in between. Must not be called from
    /// the loop thread.
    pub fn connect(&self) -> Result<(), ClientError> {
        if self.inner.reactor.on_loop_thread() {
            return Err(ClientError::Misuse(
                "blocking connect called from the reactor thread".to_string(),
            ));
        }
        let policy = self.policy();
        let attempts = policy.retry_number().max(1);
        let mut attempt = 1;
        loop {
            match self.connect_once() {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts && policy.is_retryable(&e) => {
                    debug!(
                        "Connect attempt {}/{} failed: {}, retrying in {:?}",
                        attempt,
                        attempts,
                        e,
                        policy.retry_timeout()
                    );
                    std::thread::sleep(policy.retry_timeout());
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn connect_once(&self) -> Result<(), ClientError> {
        let (tx, rx) = sync_channel(1);
        let dial = {
            let mut link = lock(&self.inner.link);
            match &mut *link {
                Link::Open { .. } => return Ok(()),
                Link::Stopped => return Err(ClientError::Closed),
                Link::Connecting { waiters, .. } => {
                    waiters.push(tx);
                    false
                }
                Link::Closed => {
                    *link = Link::Connecting {
                        backlog: Vec::new(),
                        waiters: vec![tx],
                    };
                    true
                }
            }
        };
        if dial {
            self.dial()?;
        }

        let timeout = self.connect_timeout();
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::ReactorStopped),
        }
    }

    /// Start reopening a closed link without waiting for it.
    pub fn reconnect(&self) -> Result<(), ClientError> {
        let dial = {
            let mut link = lock(&self.inner.link);
            match &*link {
                Link::Closed => {
                    *link = Link::Connecting {
                        backlog: Vec::new(),
                        waiters: Vec::new(),
                    };
                    true
                }
                Link::Stopped => return Err(ClientError::Closed),
                _ => false,
            }
        };
        if dial {
            self.dial()?;
        }
        Ok(())
    }

    /// Queue a frame for writing. Never blocks.
    ///
    /// While the link is down the frame is held and a reconnect is started.
    pub fn send_message(&self, message: Message) -> Result<(), ClientError> {
        let dial = {
            let mut link = lock(&self.inner.link);
            match &mut *link {
                Link::Open { tx, .. } => {
                    return tx
                        .send(Outbound::Frame(message))
                        .map_err(|_| ClientError::Closed);
                }
                Link::Connecting { backlog, .. } => {
                    backlog.push(message);
                    false
                }
                Link::Closed => {
                    *link = Link::Connecting {
                        backlog: vec![message],
                        waiters: Vec::new(),
                    };
                    true
                }
                Link::Stopped => return Err(ClientError::Closed),
            }
        };
        if dial {
            self.dial()?;
        }
        Ok(())
    }

    /// Apply negotiated heartbeat intervals (milliseconds, 0 disables).
    pub fn set_heartbeat(&self, outgoing: u64, incoming: u64) {
        if let Link::Open { tx, .. } = &*lock(&self.inner.link) {
            let _ = tx.send(Outbound::Heartbeat { outgoing, incoming });
        }
    }

    /// Close the link for good. Queued frames are flushed first.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.link), Link::Stopped);
        match previous {
            Link::Open { tx, .. } => {
                if self.tls_state() == TlsState::Established {
                    self.set_tls_state(TlsState::Closing);
                }
                let _ = tx.send(Outbound::Close);
            }
            Link::Connecting { waiters, .. } => {
                for waiter in waiters {
                    let _ = waiter.send(Err(ClientError::Closed));
                }
            }
            Link::Closed | Link::Stopped => {}
        }
    }

    fn dial(&self) -> Result<(), ClientError> {
        let Some((host, port)) = self.inner.remote.clone() else {
            return Err(ClientError::Closed);
        };
        let client = self.clone();
        let queued = self.inner.reactor.queue(async move {
            let timeout = client.connect_timeout();
            let opened = match tokio::time::timeout(timeout, client.open_stream(&host, port)).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(timeout)),
            };
            match opened {
                Ok(stream) => client.link_up(stream),
                Err(e) => client.connect_failed(e),
            }
        });
        if let Err(e) = queued {
            // No receiver callbacks here: callers may hold a receiver's lock.
            self.abandon_connect(&e);
            return Err(e);
        }
        Ok(())
    }

    async fn open_stream(&self, host: &str, port: u16) -> Result<BoxedStream, ClientError> {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;

        let Some(provider) = self.inner.reactor.tls() else {
            return Ok(Box::new(tcp));
        };
        self.set_tls_state(TlsState::Handshaking);
        let config = provider.client_config()?;
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| ClientError::Tls(format!("invalid server name {}: {}", host, e)))?;
        let stream = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        self.set_tls_state(TlsState::Established);
        Ok(Box::new(stream))
    }

    fn link_up(&self, stream: BoxedStream) {
        // Greeting frames are collected before taking the link lock; receivers
        // may call back into send paths that take it.
        let greeting: Vec<Message> = self
            .receivers()
            .iter()
            .flat_map(|receiver| receiver.on_open(self))
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let waiters = {
            let mut link = lock(&self.inner.link);
            let Link::Connecting { backlog, waiters } =
                std::mem::replace(&mut *link, Link::Closed)
            else {
                // Closed while dialing.
                *link = Link::Stopped;
                debug!("Link closed during connect, dropping stream");
                return;
            };
            for message in greeting.into_iter().chain(backlog) {
                let _ = tx.send(Outbound::Frame(message));
            }
            *link = Link::Open { tx, generation };
            waiters
        };

        if let Some((host, port)) = self.remote() {
            info!("Connected to {}:{}", host, port);
        }
        tokio::spawn(run_link(self.clone(), stream, rx, generation));
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    fn connect_failed(&self, error: ClientError) {
        if self.tls_state() == TlsState::Handshaking {
            self.set_tls_state(TlsState::Closed);
        }
        if !self.abandon_connect(&error) {
            return;
        }
        warn!("Connect failed: {}", error);
        for receiver in self.receivers() {
            receiver.on_link_lost(self, &error);
        }
    }

    /// Leave the connecting state and fail its waiters. Returns false when
    /// the link was not connecting.
    fn abandon_connect(&self, error: &ClientError) -> bool {
        let waiters = {
            let mut link = lock(&self.inner.link);
            match std::mem::replace(&mut *link, Link::Closed) {
                Link::Connecting { backlog, waiters } => {
                    if !backlog.is_empty() {
                        debug!("Dropping {} frames queued for a failed connect", backlog.len());
                    }
                    waiters
                }
                other => {
                    *link = other;
                    return false;
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Err(error.duplicate()));
        }
        true
    }

    fn link_down(&self, generation: u64, result: Result<(), ClientError>) {
        if self.tls_state() != TlsState::None {
            self.set_tls_state(TlsState::Closed);
        }
        {
            let mut link = lock(&self.inner.link);
            if let Link::Open { generation: current, .. } = &*link {
                if *current == generation {
                    *link = if self.inner.remote.is_some() {
                        Link::Closed
                    } else {
                        Link::Stopped
                    };
                }
            }
        }
        match result {
            Ok(()) => debug!("Link closed"),
            Err(error) => {
                warn!("Link lost: {}", error);
                for receiver in self.receivers() {
                    receiver.on_link_lost(self, &error);
                }
            }
        }
    }

    fn dispatch(&self, buf: &mut BytesMut) -> Result<(), ClientError> {
        loop {
            match decode(buf) {
                Ok(Some((message, consumed))) => {
                    buf.advance(consumed);
                    if message.is_heartbeat() {
                        continue;
                    }
                    for receiver in self.receivers() {
                        receiver.on_frame(self, message.clone());
                    }
                }
                Ok(None) => {
                    if buf.len() > MAX_FRAME_SIZE {
                        return Err(ClientError::MalformedFrame(format!(
                            "frame exceeds {} bytes",
                            MAX_FRAME_SIZE
                        )));
                    }
                    return Ok(());
                }
                Err(malformed) => {
                    warn!("Discarding malformed frame: {}", malformed);
                    buf.advance(malformed.consumed);
                }
            }
        }
    }
}

impl std::fmt::Debug for ReactorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorClient")
            .field("remote", &self.inner.remote)
            .field("open", &self.is_open())
            .field("tls", &self.tls_state())
            .finish()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_link(
    client: ReactorClient,
    stream: BoxedStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    generation: u64,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut send_every: Option<Duration> = None;
    let mut expect_within: Option<Duration> = None;
    let mut next_tick: Option<Instant> = None;
    let mut deadline: Option<Instant> = None;

    let result = loop {
        let policy = client.policy();
        let tick = if policy.is_outgoing_heartbeat() { next_tick } else { None };
        let expiry = if policy.is_incoming_heartbeat() { deadline } else { None };

        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break Err(ClientError::Closed),
                Ok(_) => {
                    deadline = expect_within.map(|window| Instant::now() + window);
                    if let Err(e) = client.dispatch(&mut buf) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e.into()),
            },
            out = outbound.recv() => match out {
                Some(Outbound::Frame(message)) => {
                    if let Err(e) = write_frame(&mut writer, &encode(&message)).await {
                        break Err(e);
                    }
                    next_tick = send_every.map(|every| Instant::now() + every);
                }
                Some(Outbound::Heartbeat { outgoing, incoming }) => {
                    send_every = (outgoing > 0)
                        .then(|| Duration::from_millis(reduce_grace_period(outgoing)));
                    expect_within = (incoming > 0)
                        .then(|| Duration::from_millis(add_grace_period(incoming)));
                    next_tick = send_every.map(|every| Instant::now() + every);
                    deadline = expect_within.map(|window| Instant::now() + window);
                    debug!("Heartbeats: send every {:?}, expect within {:?}", send_every, expect_within);
                }
                Some(Outbound::Close) | None => {
                    let _ = writer.shutdown().await;
                    break Ok(());
                }
            },
            _ = sleep_until_opt(tick) => {
                next_tick = send_every.map(|every| Instant::now() + every);
                // The toggle may have flipped while we slept.
                if !client.policy().is_outgoing_heartbeat() {
                    continue;
                }
                if let Err(e) = write_frame(&mut writer, b"\n").await {
                    break Err(e);
                }
            }
            _ = sleep_until_opt(expiry) => {
                if !client.policy().is_incoming_heartbeat() {
                    deadline = expect_within.map(|window| Instant::now() + window);
                    continue;
                }
                break Err(ClientError::HeartbeatExpired(expect_within.unwrap_or_default()));
            }
        }
    };

    client.link_down(generation, result);
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<(), ClientError> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stomp::frame::{Command, HEADER_DESTINATION};
    use std::io::{Read, Write};
    use std::net::TcpListener;

    struct Collect(Mutex<Vec<Message>>, SyncSender<()>);

    impl FrameReceiver for Collect {
        fn on_frame(&self, _client: &ReactorClient, message: Message) {
            self.0.lock().unwrap().push(message);
            let _ = self.1.try_send(());
        }
    }

    fn policy() -> Arc<ClientPolicy> {
        Arc::new(ClientPolicy::with_retry(Duration::from_millis(50), 1, Duration::ZERO))
    }

    #[test]
    fn test_connect_refused_is_connection_failure() {
        let port = {
            let spare = TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap().port()
        };
        let reactor = Reactor::new().unwrap();
        let client = reactor.create_client("127.0.0.1", port, policy());
        let err = client.connect().unwrap_err();
        assert!(matches!(err, ClientError::ConnectionFailed(_)), "{:?}", err);
        assert!(!client.is_open());
        reactor.close();
    }

    #[test]
    fn test_frames_written_in_order_and_read_back() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let reactor = Reactor::new().unwrap();
        let client = reactor.create_client("127.0.0.1", port, policy());
        let (tx, rx) = sync_channel(8);
        let collected = Arc::new(Collect(Mutex::new(Vec::new()), tx));
        client.add_receiver(collected.clone());

        // Queued before the link exists; goes out once connected.
        client
            .send_message(Message::new(Command::Send).with_header(HEADER_DESTINATION, "a"))
            .unwrap();
        let (mut peer, _) = server.accept().unwrap();
        client
            .send_message(Message::new(Command::Send).with_header(HEADER_DESTINATION, "b"))
            .unwrap();

        let expected = [
            encode(&Message::new(Command::Send).with_header(HEADER_DESTINATION, "a")),
            encode(&Message::new(Command::Send).with_header(HEADER_DESTINATION, "b")),
        ]
        .concat();
        let mut got = vec![0u8; expected.len()];
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        peer.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);

        // Two frames split across writes, with a heartbeat in between.
        let reply = encode(&Message::new(Command::Message).with_header(HEADER_DESTINATION, "r"));
        peer.write_all(&reply[..3]).unwrap();
        peer.flush().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        peer.write_all(&reply[3..]).unwrap();
        peer.write_all(b"\n").unwrap();
        peer.write_all(&reply).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(collected.0.lock().unwrap().len(), 2);

        client.close();
        reactor.close();
    }

    #[test]
    fn test_connect_from_loop_thread_is_misuse() {
        let reactor = Reactor::new().unwrap();
        let client = reactor.create_client("127.0.0.1", 1, policy());
        let (tx, rx) = sync_channel(1);
        let inner = client.clone();
        reactor
            .queue(async move {
                let _ = tx.send(inner.connect());
            })
            .unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(ClientError::Misuse(_))));
        reactor.close();
    }

    #[test]
    fn test_send_after_close_fails() {
        let reactor = Reactor::new().unwrap();
        let client = reactor.create_client("127.0.0.1", 1, policy());
        client.close();
        assert!(matches!(
            client.send_message(Message::heartbeat()),
            Err(ClientError::Closed)
        ));
        assert!(matches!(client.connect(), Err(ClientError::Closed)));
        reactor.close();
    }
}
