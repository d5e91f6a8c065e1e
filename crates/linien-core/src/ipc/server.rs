//! TCP endpoint of the control server.
//!
//! Every accepted connection gets its own task; requests on one connection
//! are answered strictly in order, which is what lets a client keep exactly
//! one deferred call of each kind in flight. The number of simultaneous
//! connections is bounded by `IpcConfig::MAX_CONNECTIONS`; a client beyond
//! the bound receives one error response and is disconnected.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::protocol::{read_frame, write_frame, IpcRequest, IpcResponse, JSONRPC_VERSION};
use crate::config::IpcConfig;
use crate::Result;

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const SERVER_BUSY: i32 = -32000;

/// Method table behind the IPC server.
#[async_trait::async_trait]
pub trait IpcDispatch: Send + Sync + 'static {
    /// Handle one call. Errors are sent back with `to_rpc_error_code()`.
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value>;
}

/// Running server. Dropping it stops accepting and closes all connections.
pub struct IpcServerHandle {
    pub addr: SocketAddr,
    stop: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl IpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and ask every connection task to finish.
    pub fn shutdown(&mut self) {
        if !*self.stop.borrow() {
            info!("IPC server on {} shutting down", self.addr);
        }
        let _ = self.stop.send(true);
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// Length-prefixed JSON-RPC server.
pub struct IpcServer;

impl IpcServer {
    /// Bind `addr` (port 0 picks a free port) and serve `dispatch` in the
    /// background.
    pub async fn start<D: IpcDispatch>(addr: SocketAddr, dispatch: Arc<D>) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("IPC server listening on {}", addr);

        let (stop, stopped) = watch::channel(false);
        let slots = Arc::new(Semaphore::new(IpcConfig::MAX_CONNECTIONS));
        let accept_task = tokio::spawn(accept(listener, dispatch, slots, stopped));

        Ok(IpcServerHandle {
            addr,
            stop,
            accept_task: Some(accept_task),
        })
    }
}

async fn accept<D: IpcDispatch>(
    listener: TcpListener,
    dispatch: Arc<D>,
    slots: Arc<Semaphore>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = stopped.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("IPC accept failed: {}", e);
                    continue;
                }
            },
        };

        match slots.clone().try_acquire_owned() {
            Ok(permit) => {
                debug!("IPC connection from {}", peer);
                let dispatch = dispatch.clone();
                let stopped = stopped.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, &*dispatch, stopped, permit).await {
                        debug!("IPC connection {} ended: {}", peer, e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    "Rejecting IPC connection from {}: {} connections open",
                    peer,
                    IpcConfig::MAX_CONNECTIONS
                );
                tokio::spawn(reject(stream));
            }
        }
    }
}

async fn reject(mut stream: TcpStream) {
    let response = IpcResponse::error(
        None,
        SERVER_BUSY,
        format!("Server busy: at most {} connections", IpcConfig::MAX_CONNECTIONS),
    );
    if let Ok(bytes) = serde_json::to_vec(&response) {
        if write_frame(&mut stream, &bytes).await.is_err() {
            return;
        }
    }
    // Consume the client's first request so closing does not reset the
    // connection before the error frame is read.
    let _ = tokio::time::timeout(IpcConfig::REJECT_LINGER, read_frame(&mut stream)).await;
}

async fn serve_connection<D: IpcDispatch>(
    mut stream: TcpStream,
    dispatch: &D,
    mut stopped: watch::Receiver<bool>,
    _permit: OwnedSemaphorePermit,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.split();

    loop {
        let frame = tokio::select! {
            _ = stopped.changed() => return Ok(()),
            frame = read_frame(&mut reader) => match frame? {
                Some(frame) => frame,
                None => return Ok(()),
            },
        };

        let response = answer(&frame, dispatch).await;
        write_frame(&mut writer, &serde_json::to_vec(&response)?).await?;
    }
}

/// Decode one request frame and run it.
async fn answer<D: IpcDispatch>(frame: &[u8], dispatch: &D) -> IpcResponse {
    let request: IpcRequest = match serde_json::from_slice(frame) {
        Ok(request) => request,
        Err(e) => return IpcResponse::error(None, PARSE_ERROR, format!("Parse error: {}", e)),
    };
    if request.jsonrpc != JSONRPC_VERSION {
        return IpcResponse::error(
            request.id,
            INVALID_REQUEST,
            format!("Invalid request: unsupported jsonrpc version {:?}", request.jsonrpc),
        );
    }

    trace!("IPC call {}", request.method);
    let params = request.params.unwrap_or_else(|| Value::Object(Default::default()));
    match dispatch.dispatch(&request.method, params).await {
        Ok(result) => IpcResponse::success(request.id, result),
        Err(e) => {
            if e.is_usage_error() {
                debug!("IPC call {} rejected: {}", request.method, e);
            } else {
                warn!("IPC call {} failed: {}", request.method, e);
            }
            IpcResponse::error(request.id, e.to_rpc_error_code(), e.to_string())
        }
    }
}
