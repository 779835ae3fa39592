//! Listening sockets on a reactor.

use std::net::SocketAddr;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use super::connection::{BoxedStream, ReactorClient};
use super::Reactor;
use crate::error::ClientError;

/// Invoked on the loop thread for every accepted connection.
pub type AcceptCallback = Arc<dyn Fn(&ReactorClient) + Send + Sync>;

/// A bound server socket. Dropping it without [`close`](Self::close) also
/// stops accepting.
pub struct ReactorListener {
    reactor: Reactor,
    local_addr: SocketAddr,
    stop: Mutex<Option<oneshot::Sender<SyncSender<()>>>>,
}

/// Completion of an asynchronous listener close.
pub struct CloseHandle {
    done: Receiver<()>,
}

impl CloseHandle {
    /// Block until the socket is released. `None` waits without a bound.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        let outcome = match timeout {
            Some(timeout) => self.done.recv_timeout(timeout),
            None => self.done.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match outcome {
            // A vanished accept task has already released the socket.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout(timeout.unwrap_or_default())),
        }
    }
}

impl ReactorListener {
    pub(crate) fn bind(
        reactor: Reactor,
        host: &str,
        port: u16,
        on_accept: AcceptCallback,
    ) -> Result<Self, ClientError> {
        let acceptor = match reactor.tls() {
            Some(provider) => {
                let config = provider.server_config()?.ok_or_else(|| {
                    ClientError::Tls("no server identity configured for listener".to_string())
                })?;
                Some(TlsAcceptor::from(config))
            }
            None => None,
        };

        // Bound on the caller's thread so the port is known on return.
        let socket = std::net::TcpListener::bind((host, port))?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let loop_reactor = reactor.clone();
        reactor.queue(async move {
            match TcpListener::from_std(socket) {
                Ok(listener) => accept_loop(loop_reactor, listener, acceptor, on_accept, stop_rx).await,
                Err(e) => warn!("Failed to register listener on {}: {}", local_addr, e),
            }
        })?;

        debug!("Listening on {}", local_addr);
        Ok(Self {
            reactor,
            local_addr,
            stop: Mutex::new(Some(stop_tx)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Schedule the close on the loop thread.
    ///
    /// Connections already accepted stay open.
    pub fn close(&self) -> CloseHandle {
        let (done_tx, done_rx) = sync_channel(1);
        let stop = self
            .stop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match stop {
            Some(stop) => {
                let queued = self.reactor.queue(async move {
                    if let Err(done) = stop.send(done_tx) {
                        let _ = done.send(());
                    }
                });
                if queued.is_err() {
                    debug!("Reactor already stopped, listener {} is gone", self.local_addr);
                }
            }
            None => {
                let _ = done_tx.send(());
            }
        }
        CloseHandle { done: done_rx }
    }
}

async fn accept_loop(
    reactor: Reactor,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    on_accept: AcceptCallback,
    mut stop: oneshot::Receiver<SyncSender<()>>,
) {
    loop {
        tokio::select! {
            signal = &mut stop => {
                drop(listener);
                if let Ok(done) = signal {
                    let _ = done.send(());
                }
                debug!("Listener closed");
                return;
            }
            first = listener.accept() => {
                // Drain everything already pending, not just one connection.
                let mut pending = vec![first];
                while let Some(next) = listener.accept().now_or_never() {
                    pending.push(next);
                }
                debug!("Accepted {} connection(s)", pending.len());
                for accepted in pending {
                    match accepted {
                        Ok((stream, peer)) => {
                            admit(&reactor, stream, peer, acceptor.clone(), Arc::clone(&on_accept))
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }
            }
        }
    }
}

fn admit(
    reactor: &Reactor,
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    on_accept: AcceptCallback,
) {
    let _ = stream.set_nodelay(true);
    match acceptor {
        None => start(reactor.clone(), Box::new(stream), false, &on_accept),
        Some(acceptor) => {
            let reactor = reactor.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls) => start(reactor, Box::new(tls), true, &on_accept),
                    Err(e) => warn!("TLS handshake with {} failed: {}", peer, e),
                }
            });
        }
    }
}

fn start(reactor: Reactor, stream: BoxedStream, tls: bool, on_accept: &AcceptCallback) {
    let (client, rx) = ReactorClient::accepted(reactor, tls);
    on_accept(&client);
    client.start_accepted(stream, rx);
}
