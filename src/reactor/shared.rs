//! Process-wide reactors and response worker.
//!
//! One plain reactor, one TLS reactor and one response worker are shared by
//! every client in the process. Each is built on first use and later calls
//! get the same instance, ignoring their arguments. An instance that a
//! holder closed is replaced by a fresh one on the next call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use super::{Reactor, TlsMaterialProvider};
use crate::error::ClientError;
use crate::rpc::ResponseWorker;

static PLAIN: Mutex<Option<Reactor>> = Mutex::new(None);
static TLS: Mutex<Option<Reactor>> = Mutex::new(None);
static WORKER: Mutex<Option<Arc<ResponseWorker>>> = Mutex::new(None);

/// Return the cached instance while `alive` holds for it, otherwise build
/// and cache a new one. A failed build leaves the slot for the next caller.
fn get_or_build<T: Clone>(
    slot: &Mutex<Option<T>>,
    alive: impl Fn(&T) -> bool,
    build: impl FnOnce() -> Result<T, ClientError>,
) -> Result<T, ClientError> {
    let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(value) = slot.as_ref() {
        if alive(value) {
            return Ok(value.clone());
        }
        debug!("Shared instance was closed, rebuilding");
    }
    let value = build()?;
    *slot = Some(value.clone());
    Ok(value)
}

/// The shared plain-TCP reactor.
pub fn plain_reactor() -> Result<Reactor, ClientError> {
    get_or_build(&PLAIN, Reactor::is_running, || {
        debug!("Creating shared plain reactor");
        Reactor::new()
    })
}

/// The shared TLS reactor. `provider` is only used when a reactor is built.
pub fn tls_reactor(provider: Arc<dyn TlsMaterialProvider>) -> Result<Reactor, ClientError> {
    get_or_build(&TLS, Reactor::is_running, || {
        debug!("Creating shared TLS reactor");
        Reactor::with_tls(provider)
    })
}

/// The shared response worker. Arguments are only used when a worker is built.
pub fn response_worker(
    parallelism: usize,
    event_retention: Duration,
) -> Result<Arc<ResponseWorker>, ClientError> {
    get_or_build(&WORKER, |worker| worker.is_running(), || {
        debug!("Creating shared response worker ({} threads)", parallelism);
        ResponseWorker::new(parallelism, event_retention)
    })
}
/// Close and forget every shared instance. The next call to a getter builds
/// a new one. Clients still holding the old instances see them stopped.
pub fn shutdown() {
    release(&WORKER, |worker| worker.close());
    release(&PLAIN, Reactor::close);
    release(&TLS, Reactor::close);
}

fn release<T>(slot: &Mutex<Option<T>>, close: impl FnOnce(&T)) {
    let taken = slot
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(value) = taken {
        close(&value);
    }
}
