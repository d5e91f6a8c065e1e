//! The RPC seam between the client mirror and a parameter server.
//!
//! [`ParameterTransport`] offers two call modes: synchronous calls that block
//! the caller until the server answers, and deferred calls that return a
//! [`PendingCall`] immediately. The mirror only ever polls pending calls, so
//! its `poll()` never blocks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::debug;

use super::service::{
    METHOD_GET_CHANGED_PARAMETERS_QUEUE, METHOD_GET_PARAM, METHOD_INIT_PARAMETER_SYNC,
    METHOD_REGISTER_REMOTE_LISTENERS, METHOD_RESET_PARAM, METHOD_SET_PARAM,
};
use super::types::{ParameterChange, ParameterSnapshot, ParameterValue, SessionId};
use crate::error::{LinienError, Result};
use crate::ipc::IpcClient;

/// A deferred RPC result that can be checked without blocking.
#[derive(Debug)]
pub struct PendingCall<T> {
    rx: oneshot::Receiver<Result<T>>,
    issued_at: Instant,
}

/// Completes the [`PendingCall`] it was created with.
#[derive(Debug)]
pub struct CallCompleter<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> PendingCall<T> {
    /// Create a pending call together with the handle that completes it.
    pub fn channel() -> (CallCompleter<T>, PendingCall<T>) {
        let (tx, rx) = oneshot::channel();
        (
            CallCompleter { tx },
            PendingCall {
                rx,
                issued_at: Instant::now(),
            },
        )
    }

    /// A call that is already complete.
    pub fn ready(result: Result<T>) -> Self {
        let (completer, pending) = Self::channel();
        completer.complete(result);
        pending
    }

    /// Take the result if it has arrived.
    ///
    /// Returns `None` while the call is outstanding. A call whose completer was
    /// dropped resolves to `CallAborted`.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(LinienError::CallAborted)),
        }
    }

    /// Time since the call was issued.
    pub fn age(&self) -> Duration {
        self.issued_at.elapsed()
    }
}

impl<T> CallCompleter<T> {
    pub fn complete(self, result: Result<T>) {
        // The caller may have dropped its PendingCall; nobody is waiting then.
        let _ = self.tx.send(result);
    }
}

/// Remote-procedure-call surface of a parameter server, as seen by a client.
pub trait ParameterTransport {
    /// Start a session and fetch the full parameter inventory.
    fn init_parameter_sync(&self, session: SessionId) -> Result<Vec<ParameterSnapshot>>;

    fn get_param(&self, name: &str) -> Result<ParameterValue>;

    fn set_param(&self, name: &str, value: ParameterValue) -> Result<()>;

    fn reset_param(&self, name: &str) -> Result<()>;

    /// Deferred fetch of the session's queued changes.
    fn get_changed_parameters_queue(&self, session: SessionId) -> PendingCall<Vec<ParameterChange>>;

    /// Deferred subscription of the session to additional names.
    fn register_remote_listeners(&self, session: SessionId, names: Vec<String>) -> PendingCall<()>;
}

/// [`ParameterTransport`] over the IPC JSON-RPC client.
///
/// Synchronous calls block the calling thread on the runtime, so they must not
/// be made from inside that runtime's worker threads. Deferred calls are
/// spawned onto the runtime. The runtime must be multi-threaded.
#[derive(Debug, Clone)]
pub struct IpcTransport {
    client: Arc<IpcClient>,
    runtime: Handle,
}

impl IpcTransport {
    /// Connect to a control server, blocking the calling thread.
    pub fn connect(runtime: Handle, addr: SocketAddr) -> Result<Self> {
        let client = runtime.block_on(IpcClient::connect(addr))?;
        Ok(Self::new(runtime, Arc::new(client)))
    }

    pub fn new(runtime: Handle, client: Arc<IpcClient>) -> Self {
        Self { client, runtime }
    }

    fn call_blocking<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.runtime.block_on(self.client.call(method, params))?;
        Ok(serde_json::from_value(value)?)
    }

    fn call_deferred<T>(&self, method: &'static str, params: Value) -> PendingCall<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (completer, pending) = PendingCall::channel();
        let client = self.client.clone();
        self.runtime.spawn(async move {
            let result = client
                .call(method, params)
                .await
                .and_then(|value| serde_json::from_value(value).map_err(LinienError::from));
            if let Err(e) = &result {
                debug!("Deferred {} failed: {}", method, e);
            }
            completer.complete(result);
        });
        pending
    }
}

impl ParameterTransport for IpcTransport {
    fn init_parameter_sync(&self, session: SessionId) -> Result<Vec<ParameterSnapshot>> {
        self.call_blocking(METHOD_INIT_PARAMETER_SYNC, json!({ "session": session }))
    }

    fn get_param(&self, name: &str) -> Result<ParameterValue> {
        self.call_blocking(METHOD_GET_PARAM, json!({ "name": name }))
    }

    fn set_param(&self, name: &str, value: ParameterValue) -> Result<()> {
        self.call_blocking(METHOD_SET_PARAM, json!({ "name": name, "value": value }))
    }

    fn reset_param(&self, name: &str) -> Result<()> {
        self.call_blocking(METHOD_RESET_PARAM, json!({ "name": name }))
    }

    fn get_changed_parameters_queue(&self, session: SessionId) -> PendingCall<Vec<ParameterChange>> {
        self.call_deferred(
            METHOD_GET_CHANGED_PARAMETERS_QUEUE,
            json!({ "session": session }),
        )
    }

    fn register_remote_listeners(&self, session: SessionId, names: Vec<String>) -> PendingCall<()> {
        self.call_deferred(
            METHOD_REGISTER_REMOTE_LISTENERS,
            json!({ "session": session, "names": names }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_call_is_empty_until_completed() {
        let (completer, mut pending) = PendingCall::<u32>::channel();
        assert!(pending.try_take().is_none());
        assert!(pending.try_take().is_none());

        completer.complete(Ok(7));
        assert_eq!(pending.try_take().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_dropped_completer_aborts_call() {
        let (completer, mut pending) = PendingCall::<u32>::channel();
        drop(completer);
        assert!(matches!(pending.try_take(), Some(Err(LinienError::CallAborted))));
    }

    #[test]
    fn test_ready_call() {
        let mut pending = PendingCall::ready(Ok("done"));
        assert_eq!(pending.try_take().unwrap().unwrap(), "done");
    }

    #[test]
    fn test_age_grows() {
        let (_completer, pending) = PendingCall::<()>::channel();
        std::thread::sleep(Duration::from_millis(5));
        assert!(pending.age() >= Duration::from_millis(5));
    }
}
