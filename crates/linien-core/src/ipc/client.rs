//! TCP client for the control server's JSON-RPC endpoint.
//!
//! One connection carries one request/response exchange at a time; a tokio
//! `Mutex` around the stream serializes callers, so an `Arc<IpcClient>` can be
//! shared by any number of tasks. Responses are matched to requests by id.
//!
//! A call that fails in transit, or whose future is dropped between writing
//! the request and reading the response, leaves the stream at an unknown
//! frame boundary. The client then refuses further calls with
//! `ServerUnreachable` instead of pairing later requests with stale answers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::protocol::{read_frame, write_frame, IpcRequest, IpcResponse};
use crate::config::IpcConfig;
use crate::{LinienError, Result};

/// Connection to a control server.
#[derive(Debug)]
pub struct IpcClient {
    stream: Mutex<TcpStream>,
    addr: SocketAddr,
    next_id: AtomicU64,
    desynced: AtomicBool,
}

/// Marks the client unusable unless disarmed after a complete exchange.
struct ExchangeGuard<'a> {
    desynced: &'a AtomicBool,
    complete: bool,
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        if !self.complete {
            self.desynced.store(true, Ordering::SeqCst);
        }
    }
}

impl IpcClient {
    /// Connect within `IpcConfig::CONNECT_TIMEOUT`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = match tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Connecting to {} failed: {}", addr, e);
                return Err(unreachable(addr));
            }
            Err(_) => {
                debug!("Connecting to {} timed out", addr);
                return Err(unreachable(addr));
            }
        };
        stream.set_nodelay(true)?;
        debug!("IPC client connected to {}", addr);

        Ok(Self {
            stream: Mutex::new(stream),
            addr,
            next_id: AtomicU64::new(1),
            desynced: AtomicBool::new(false),
        })
    }

    /// Call `method` and wait for its result.
    ///
    /// Errors reported by the server come back as `LinienError::Remote` with
    /// the server's error code.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = serde_json::to_vec(&IpcRequest::new(method, params, id))?;

        let mut stream = self.stream.lock().await;
        if self.desynced.load(Ordering::SeqCst) {
            return Err(unreachable(self.addr));
        }

        let mut guard = ExchangeGuard {
            desynced: &self.desynced,
            complete: false,
        };
        let (mut reader, mut writer) = stream.split();
        if let Err(e) = write_frame(&mut writer, &request).await {
            warn!("Sending {} to {} failed: {}", method, self.addr, e);
            return Err(unreachable(self.addr));
        }
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(unreachable(self.addr)),
            Err(e) => {
                warn!("Reading reply to {} from {} failed: {}", method, self.addr, e);
                return Err(unreachable(self.addr));
            }
        };
        guard.complete = true;
        drop(guard);

        let response: IpcResponse = serde_json::from_slice(&frame)?;
        // Errors the server could not tie to a request arrive with a null id.
        let answered = match &response.id {
            Some(reply_id) => *reply_id == Value::from(id),
            None => response.error.is_some(),
        };
        if !answered {
            return Err(LinienError::Validation {
                field: "id".to_string(),
                message: format!("reply to request {} carried id {:?}", id, response.id),
            });
        }

        match (response.result, response.error) {
            (_, Some(error)) => Err(LinienError::Remote {
                code: error.code,
                message: error.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether a failed exchange has made this connection unusable.
    pub fn is_desynced(&self) -> bool {
        self.desynced.load(Ordering::SeqCst)
    }
}

fn unreachable(addr: SocketAddr) -> LinienError {
    LinienError::ServerUnreachable {
        addr: addr.to_string(),
    }
}
