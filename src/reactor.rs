//! I/O event loop.
//!
//! A [`Reactor`] owns one dedicated thread running a single-threaded tokio
//! runtime. Every socket it manages is read, written and torn down on that
//! thread. Other threads hand work to it through a task channel that only
//! the loop drains.
//!
//! # Example
//!
//! ```ignore
//! let reactor = Reactor::new()?;
//! let client = reactor.create_client("localhost", 61613, Arc::new(ClientPolicy::default()));
//! client.connect()?;
//! ```

mod connection;
mod listener;
pub mod shared;
mod tls;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::rpc::ClientPolicy;

pub use connection::{FrameReceiver, ReactorClient, TlsState};
pub use listener::{AcceptCallback, CloseHandle, ReactorListener};
pub use tls::{StaticTlsMaterial, TlsMaterialProvider};

/// Default bound on a TCP connect plus protocol handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum ReactorTask {
    Run(BoxedTask),
    Shutdown,
}

struct Inner {
    name: String,
    tasks: mpsc::UnboundedSender<ReactorTask>,
    tls: Option<Arc<dyn TlsMaterialProvider>>,
    loop_thread: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.tasks.send(ReactorTask::Shutdown);
    }
}

/// Cloneable handle to an event loop thread.
///
/// The loop stops when [`close`](Self::close) is called or the last handle
/// is dropped.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

impl Reactor {
    /// Start a reactor for plain TCP links.
    pub fn new() -> Result<Self, ClientError> {
        Self::start("stomp-reactor", None)
    }

    /// Start a reactor whose links are all wrapped in TLS.
    pub fn with_tls(provider: Arc<dyn TlsMaterialProvider>) -> Result<Self, ClientError> {
        // Fail fast on bad material instead of on first connect.
        provider.client_config()?;
        Self::start("stomp-tls-reactor", Some(provider))
    }

    fn start(name: &str, tls: Option<Arc<dyn TlsMaterialProvider>>) -> Result<Self, ClientError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<ReactorTask>();

        let thread_name = name.to_string();
        let join = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(task) = rx.recv().await {
                        match task {
                            ReactorTask::Run(future) => {
                                tokio::spawn(future);
                            }
                            ReactorTask::Shutdown => break,
                        }
                    }
                });
                // Dropping the runtime cancels every link and listener task.
                drop(runtime);
                debug!("Reactor {} stopped", thread_name);
            })?;

        debug!("Reactor {} started", name);
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                tasks: tx,
                tls,
                loop_thread: join.thread().id(),
                join: Mutex::new(Some(join)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_tls(&self) -> bool {
        self.inner.tls.is_some()
    }

    pub(crate) fn tls(&self) -> Option<&Arc<dyn TlsMaterialProvider>> {
        self.inner.tls.as_ref()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.tasks.is_closed()
    }

    /// Whether the caller is running on this reactor's loop thread.
    pub fn on_loop_thread(&self) -> bool {
        std::thread::current().id() == self.inner.loop_thread
    }

    /// Run `task` on the loop thread.
    pub fn queue<F>(&self, task: F) -> Result<(), ClientError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .tasks
            .send(ReactorTask::Run(Box::pin(task)))
            .map_err(|_| ClientError::ReactorStopped)
    }

    /// Create a client for `host:port`. Nothing is opened until it connects
    /// or sends.
    pub fn create_client(&self, host: &str, port: u16, policy: Arc<ClientPolicy>) -> ReactorClient {
        ReactorClient::new(self.clone(), host, port, policy)
    }

    /// Bind a listening socket. `on_accept` runs on the loop thread for each
    /// accepted connection before any of its bytes are read.
    pub fn create_listener<F>(
        &self,
        host: &str,
        port: u16,
        on_accept: F,
    ) -> Result<ReactorListener, ClientError>
    where
        F: Fn(&ReactorClient) + Send + Sync + 'static,
    {
        ReactorListener::bind(self.clone(), host, port, Arc::new(on_accept))
    }

    /// Stop the loop and wait for its thread to exit.
    ///
    /// Open links are dropped without a protocol-level goodbye.
    pub fn close(&self) {
        if self.inner.tasks.send(ReactorTask::Shutdown).is_err() {
            return;
        }
        if self.on_loop_thread() {
            return;
        }
        let join = self
            .inner
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(join) = join {
            if join.join().is_err() {
                warn!("Reactor {} thread panicked", self.inner.name);
            }
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.inner.name)
            .field("tls", &self.is_tls())
            .field("running", &self.is_running())
            .finish()
    }
}
