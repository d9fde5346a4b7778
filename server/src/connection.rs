//! Per-client connection plumbing.
//!
//! Each connection runs a read loop that decodes length-prefixed MessagePack
//! frames and dispatches every request on its own task. The write half is
//! shared behind a mutex so responses and change notifications can be
//! interleaved safely. The connection also owns the client-facing callback
//! machinery: remote handles for invoking callbacks on the client, a registry
//! of server-side callbacks the client can invoke (e.g. `stopWatching`), and
//! the disconnect hooks that tear subscriptions down when the peer goes away.

use crate::handlers::{self, ServerState};
use crate::protocol::{from_value, Notification, Request, Response, RpcError};
use log::{debug, error};
use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on a single frame. A request larger than this closes the
/// connection rather than buffering it.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to a connection's write half.
pub type WriterHandle = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Serialize a message and write it as one length-prefixed frame.
pub async fn write_frame<T: Serialize>(writer: &WriterHandle, msg: &T) -> io::Result<()> {
    let bytes = rmp_serde::to_vec_named(msg).map_err(io::Error::other)?;
    let mut w = writer.lock().await;
    w.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    w.write_all(&bytes).await?;
    w.flush().await
}

type ServerCallback = Arc<dyn Fn(&[Value]) + Send + Sync>;

struct ClientInner {
    id: u64,
    writer: WriterHandle,
    callbacks: Mutex<HashMap<u64, ServerCallback>>,
    next_callback: AtomicU64,
    /// Pending disconnect hooks; None once the client has disconnected.
    hooks: Mutex<Option<Vec<Box<dyn FnOnce() + Send>>>>,
}

/// Cheaply cloneable handle to one connected client.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

impl ClientHandle {
    pub fn new(writer: WriterHandle) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
                writer,
                callbacks: Mutex::new(HashMap::new()),
                next_callback: AtomicU64::new(1),
                hooks: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Handle for a callback that lives on the client side of the wire.
    pub fn remote_callback(&self, id: u64) -> RemoteCallback {
        RemoteCallback {
            writer: self.inner.writer.clone(),
            id,
        }
    }

    /// Register a server-side callback the client can invoke by id.
    pub fn register_callback(&self, f: impl Fn(&[Value]) + Send + Sync + 'static) -> u64 {
        let id = self.inner.next_callback.fetch_add(1, Ordering::Relaxed);
        lock_or_recover(&self.inner.callbacks).insert(id, Arc::new(f));
        id
    }

    /// Invoke a registered callback. Returns false for unknown ids.
    pub fn invoke_callback(&self, id: u64, args: &[Value]) -> bool {
        let cb = lock_or_recover(&self.inner.callbacks).get(&id).cloned();
        match cb {
            Some(cb) => {
                cb(args);
                true
            }
            None => false,
        }
    }

    /// Register a hook to run when this client disconnects. Hooks added
    /// after disconnection run immediately.
    pub fn on_disconnect(&self, hook: Box<dyn FnOnce() + Send>) {
        let pending = {
            let mut hooks = lock_or_recover(&self.inner.hooks);
            match hooks.as_mut() {
                Some(v) => {
                    v.push(hook);
                    None
                }
                None => Some(hook),
            }
        };
        if let Some(hook) = pending {
            hook();
        }
    }

    /// Mark the client disconnected and run every registered hook.
    pub fn disconnected(&self) {
        let hooks = lock_or_recover(&self.inner.hooks).take();
        if let Some(hooks) = hooks {
            for hook in hooks {
                hook();
            }
        }
        lock_or_recover(&self.inner.callbacks).clear();
    }
}

/// Helper to lock a std::sync::Mutex, recovering from poisoning.
/// The data is still valid after a panic, so we just unwrap the poison error.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle for a callback on the client side of the wire. Invocation is
/// fire-and-forget: the write happens on a detached task so the caller is
/// never blocked by a slow peer.
#[derive(Clone)]
pub struct RemoteCallback {
    writer: WriterHandle,
    id: u64,
}

impl RemoteCallback {
    pub fn invoke(&self, value: Value) {
        let writer = self.writer.clone();
        let msg = Notification::callback(self.id, vec![value]);
        tokio::spawn(async move {
            if let Err(e) = write_frame(&writer, &msg).await {
                debug!("callback delivery failed: {}", e);
            }
        });
    }
}

/// Drive one client connection until EOF or a transport fault, then run its
/// disconnect hooks.
pub async fn serve(stream: TcpStream, state: Arc<ServerState>) {
    let (reader, writer) = tokio::io::split(stream);
    let writer: WriterHandle = Arc::new(tokio::sync::Mutex::new(Box::new(writer)));
    let client = ClientHandle::new(writer.clone());
    debug!("client {} connected", client.id());

    read_loop(reader, &writer, &client, &state).await;

    client.disconnected();
    debug!("client {} disconnected", client.id());
}

async fn read_loop<R>(
    mut reader: R,
    writer: &WriterHandle,
    client: &ClientHandle,
    state: &Arc<ServerState>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            error!("client {}: oversized frame ({} bytes)", client.id(), len);
            return;
        }
        let mut buf = vec![0u8; len];
        if reader.read_exact(&mut buf).await.is_err() {
            return;
        }

        let request: Request = match rmp_serde::from_slice(&buf) {
            Ok(r) => r,
            Err(e) => {
                let resp = Response::error(None, RpcError::parse_error(e.to_string()));
                if write_frame(writer, &resp).await.is_err() {
                    return;
                }
                continue;
            }
        };

        // Callback invocations address connection state, not the dispatcher.
        if request.method == "Callback" {
            let result = invoke_registered(client, &request.params);
            let response = match result {
                Ok(value) => Response::success(request.id, value),
                Err(error) => Response::error(Some(request.id), error),
            };
            if write_frame(writer, &response).await.is_err() {
                return;
            }
            continue;
        }

        let state = Arc::clone(state);
        let client = client.clone();
        let writer = writer.clone();
        tokio::spawn(async move {
            let response = handlers::dispatch(&state, &request, &client).await;
            if let Err(e) = write_frame(&writer, &response).await {
                debug!("client {}: response write failed: {}", client.id(), e);
            }
        });
    }
}

/// Invoke a server-side callback previously handed to this client.
fn invoke_registered(client: &ClientHandle, params: &Value) -> Result<Value, RpcError> {
    #[derive(Deserialize)]
    struct Params {
        id: u64,
        #[serde(default)]
        args: Vec<Value>,
    }

    let params: Params = from_value(handlers::first_param(params))
        .map_err(|e| RpcError::invalid_params(format!("{}; expected {{ id: integer }}", e)))?;

    if client.invoke_callback(params.id, &params.args) {
        Ok(Value::Boolean(true))
    } else {
        Err(RpcError::invalid_params(format!(
            "Unknown callback id: {}",
            params.id
        )))
    }
}

/// In-memory client whose far end can be read by tests.
#[cfg(test)]
pub(crate) fn duplex_client() -> (ClientHandle, tokio::io::DuplexStream) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let writer: WriterHandle = Arc::new(tokio::sync::Mutex::new(Box::new(near)));
    (ClientHandle::new(writer), far)
}
