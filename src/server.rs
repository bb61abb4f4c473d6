//! Bridge server: accepts CLI connections on the well-known Unix socket and
//! dispatches JSON-RPC requests to registered handlers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   accept    ┌──────────────────────────────────┐
//! │ UnixListener │ ──────────► │ per-connection reader task       │
//! └─────────────┘             │   StreamReassembler → dispatch   │
//!                             │ per-connection writer task       │
//!                             │   responses (mpsc) + broadcasts  │
//!                             └──────────────────────────────────┘
//! ```
//!
//! Each accepted connection gets its own reassembler and task pair, and
//! each request is handled as its own task, so a slow handler never stalls
//! frame parsing or the other in-flight requests.
//!
//! Responses travel over a per-connection channel; broadcast notifications
//! fan out through a `tokio::sync::broadcast` channel every writer task
//! subscribes to, so a lagging client skips the oldest notifications
//! instead of blocking the rest.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::discovery::{self, BridgeInfo};
use crate::framing::{frame_message, StreamReassembler};
use crate::protocol::{
    params_from_value, Message, Notification, PingResult, Request, RpcError,
};
use crate::BRIDGE_VERSION;

/// Built-in liveness method, answered without consulting the registry.
const PING_METHOD: &str = "ping";

/// Per-connection response queue depth. Responses are never dropped; a full
/// queue applies backpressure to that connection's dispatch loop only.
const RESPONSE_QUEUE_DEPTH: usize = 32;

/// Broadcast ring capacity. A client that falls further behind than this
/// loses the oldest notifications (`RecvError::Lagged`).
const NOTIFY_QUEUE_DEPTH: usize = 64;

/// Read chunk size for the per-connection reader.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Errors starting the bridge server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bridge server is already running")]
    AlreadyRunning,

    /// A stale socket file from an unclean shutdown could not be unlinked.
    #[error("cannot remove stale socket {}: {source}", path.display())]
    StaleSocket {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async handler future returned by registered handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;

type DynHandler = Arc<dyn Fn(Option<Value>) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Stopped,
    Starting,
    Running,
}

struct ClientHandle {
    writer: JoinHandle<()>,
    reader: Option<JoinHandle<()>>,
}

struct ServerInner {
    socket_path: PathBuf,
    info_path: PathBuf,
    handlers: RwLock<HashMap<String, DynHandler>>,
    clients: Mutex<HashMap<u64, ClientHandle>>,
    next_client_id: AtomicU64,
    state: Mutex<ServerState>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    notify_tx: broadcast::Sender<Arc<Vec<u8>>>,
}

/// The IDE-side bridge server.
///
/// Lifecycle: `Stopped → start() → Running → stop() → Stopped`. Handlers
/// are registered by method name (last registration wins); requests for
/// unknown methods get a METHOD_NOT_FOUND response, and the built-in `ping`
/// is always available so liveness checks never depend on registered
/// handlers.
pub struct BridgeServer {
    inner: Arc<ServerInner>,
}

impl BridgeServer {
    /// Server on the default socket and descriptor paths.
    pub fn new() -> Self {
        Self::with_paths(discovery::default_socket_path(), discovery::default_info_path())
    }

    /// Server on explicit socket and descriptor paths.
    pub fn with_paths(socket_path: impl Into<PathBuf>, info_path: impl Into<PathBuf>) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_QUEUE_DEPTH);
        Self {
            inner: Arc::new(ServerInner {
                socket_path: socket_path.into(),
                info_path: info_path.into(),
                handlers: RwLock::new(HashMap::new()),
                clients: Mutex::new(HashMap::new()),
                next_client_id: AtomicU64::new(1),
                state: Mutex::new(ServerState::Stopped),
                accept_task: Mutex::new(None),
                notify_tx,
            }),
        }
    }

    /// Path of the listening socket.
    pub fn socket_path(&self) -> &std::path::Path {
        &self.inner.socket_path
    }

    /// Number of currently connected clients. Purely observational.
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().unwrap().len()
    }

    /// Register an async handler for a JSON-RPC method. The last
    /// registration for a given name wins; handlers added while the server
    /// is running only affect requests dispatched afterwards.
    pub fn register_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: DynHandler = Arc::new(move |params| -> HandlerFuture {
            Box::pin(handler(params))
        });
        self.inner
            .handlers
            .write()
            .unwrap()
            .insert(method.into(), handler);
    }

    /// Register a handler taking strongly-typed params and returning a
    /// serializable result.
    ///
    /// Params are decoded at the registry boundary (a missing `params`
    /// member decodes from JSON `null`); a decode failure yields an
    /// INVALID_PARAMS response without invoking the handler.
    pub fn register_typed<P, R, F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        self.register_handler(method, move |params| {
            let parsed = params_from_value::<P>(params);
            let invocation = parsed.map(&handler);
            async move {
                let result = invocation?.await?;
                serde_json::to_value(result).map_err(|err| RpcError::internal(err.to_string()))
            }
        });
    }

    /// Bind the socket, write the descriptor, and begin accepting
    /// connections. Must be called from within a tokio runtime.
    ///
    /// A stale socket file from a prior unclean shutdown is unlinked first;
    /// failure to unlink is fatal. Failure to write the descriptor is logged
    /// and non-fatal — the server still runs, clients just cannot
    /// auto-discover it.
    pub fn start(&self) -> Result<(), ServerError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != ServerState::Stopped {
                return Err(ServerError::AlreadyRunning);
            }
            *state = ServerState::Starting;
        }

        match self.bind() {
            Ok(listener) => {
                let accept = tokio::spawn(accept_loop(Arc::clone(&self.inner), listener));
                *self.inner.accept_task.lock().unwrap() = Some(accept);
                *self.inner.state.lock().unwrap() = ServerState::Running;
                info!(socket = %self.inner.socket_path.display(), "bridge server started");
                Ok(())
            }
            Err(err) => {
                *self.inner.state.lock().unwrap() = ServerState::Stopped;
                Err(err)
            }
        }
    }

    fn bind(&self) -> Result<UnixListener, ServerError> {
        let socket_path = &self.inner.socket_path;

        if let Some(dir) = socket_path.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        // A prior unclean shutdown must not block a fresh bind.
        if socket_path.exists() {
            std::fs::remove_file(socket_path).map_err(|source| ServerError::StaleSocket {
                path: socket_path.clone(),
                source,
            })?;
        }

        let listener = UnixListener::bind(socket_path).map_err(|source| ServerError::Bind {
            path: socket_path.clone(),
            source,
        })?;

        if let Err(err) = discovery::restrict_permissions(socket_path) {
            warn!(%err, "could not restrict socket permissions");
        }

        let info = BridgeInfo::current(socket_path.clone());
        if let Err(err) = info.write(&self.inner.info_path) {
            warn!(%err, path = %self.inner.info_path.display(), "could not write bridge descriptor");
        }

        Ok(listener)
    }

    /// Send a notification to every connected client, best effort.
    ///
    /// The notification is framed once and fanned out; a client that has
    /// disconnected or fallen behind never blocks delivery to the others,
    /// and no failure surfaces to the caller.
    pub fn broadcast(&self, method: impl Into<String>, params: Option<Value>) {
        let notification = Message::Notification(Notification::new(method, params));
        match frame_message(&notification) {
            // send() only errors when no client is subscribed.
            Ok(frame) => {
                let _ = self.inner.notify_tx.send(Arc::new(frame));
            }
            Err(err) => warn!(%err, "could not frame broadcast notification"),
        }
    }

    /// Disconnect every client, close the listener, and remove the socket
    /// and descriptor files (best effort). Stopping an already-stopped
    /// server is a no-op warning.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == ServerState::Stopped {
                warn!("bridge server already stopped");
                return;
            }
            *state = ServerState::Stopped;
        }

        if let Some(accept) = self.inner.accept_task.lock().unwrap().take() {
            accept.abort();
        }

        let clients: Vec<ClientHandle> = {
            let mut clients = self.inner.clients.lock().unwrap();
            clients.drain().map(|(_, handle)| handle).collect()
        };
        for handle in clients {
            handle.writer.abort();
            if let Some(reader) = handle.reader {
                reader.abort();
            }
        }

        for path in [&self.inner.socket_path, &self.inner.info_path] {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(%err, path = %path.display(), "could not remove bridge file");
                }
            }
        }

        info!("bridge server stopped");
    }
}

impl Default for BridgeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        // Release the socket and descriptor even if the owner forgot stop().
        let running = *self.inner.state.lock().unwrap() == ServerState::Running;
        if running {
            self.stop();
        }
    }
}

impl ServerInner {
    /// Answer one request: built-in ping, then the handler registry.
    /// Always produces exactly one response echoing the request id.
    async fn dispatch(&self, request: Request) -> Message {
        let started = Instant::now();
        let Request {
            id, method, params, ..
        } = request;

        let outcome = if method == PING_METHOD {
            serde_json::to_value(PingResult {
                pong: true,
                timestamp: Utc::now().timestamp_millis(),
                version: BRIDGE_VERSION.to_string(),
            })
            .map_err(|err| RpcError::internal(err.to_string()))
        } else {
            let handler = self.handlers.read().unwrap().get(&method).cloned();
            match handler {
                Some(handler) => handler(params).await,
                None => Err(RpcError::method_not_found(&method)),
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) => {
                debug!(%method, elapsed_ms, "request handled");
                Message::success(id, result)
            }
            Err(error) => {
                debug!(%method, elapsed_ms, code = error.code, "request failed");
                Message::error(id, error)
            }
        }
    }
}

/// Accept connections until the task is aborted by `stop()`.
async fn accept_loop(inner: Arc<ServerInner>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => spawn_connection(&inner, stream),
            Err(err) => {
                warn!(%err, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Allocate a client id and spawn the reader/writer task pair for one
/// accepted connection.
fn spawn_connection(inner: &Arc<ServerInner>, stream: UnixStream) {
    let client_id = inner.next_client_id.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = stream.into_split();

    let (response_tx, response_rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
    let notifications = inner.notify_tx.subscribe();
    let writer = tokio::spawn(write_outbound(
        client_id,
        write_half,
        response_rx,
        notifications,
    ));

    // Register before spawning the reader so an instantly-closing
    // connection still finds its own entry to remove.
    let total = {
        let mut clients = inner.clients.lock().unwrap();
        clients.insert(
            client_id,
            ClientHandle {
                writer,
                reader: None,
            },
        );
        clients.len()
    };
    info!(client = client_id, total, "client connected");

    let reader = tokio::spawn(run_connection(
        Arc::clone(inner),
        client_id,
        read_half,
        response_tx,
    ));
    if let Some(handle) = inner.clients.lock().unwrap().get_mut(&client_id) {
        handle.reader = Some(reader);
    }
}

/// Per-connection read loop: feed incoming bytes to this connection's
/// reassembler and dispatch each complete request in wire order.
async fn run_connection(
    inner: Arc<ServerInner>,
    client_id: u64,
    mut socket: OwnedReadHalf,
    responses: mpsc::Sender<Vec<u8>>,
) {
    let mut reassembler = StreamReassembler::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    'io: loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(client = client_id, %err, "read error");
                break;
            }
        };

        for item in reassembler.feed(&chunk[..n]) {
            match item {
                Ok(Message::Request(request)) => {
                    // Handlers run as their own tasks so a slow method never
                    // stalls frame parsing or the other in-flight requests
                    // on this connection.
                    let inner = Arc::clone(&inner);
                    let responses = responses.clone();
                    tokio::spawn(async move {
                        let response = inner.dispatch(request).await;
                        match frame_message(&response) {
                            // send fails only when the connection is gone.
                            Ok(frame) => {
                                let _ = responses.send(frame).await;
                            }
                            Err(err) => {
                                error!(client = client_id, %err, "could not frame response")
                            }
                        }
                    });
                }
                Ok(Message::Notification(notification)) => {
                    // No client→server notification semantics beyond observability.
                    info!(
                        client = client_id,
                        method = %notification.method,
                        "notification from client"
                    );
                }
                Ok(_) => {
                    debug!(client = client_id, "ignoring response message from client");
                }
                Err(err) if err.is_fatal() => {
                    error!(client = client_id, %err, "closing desynchronized connection");
                    break 'io;
                }
                Err(err) => {
                    warn!(client = client_id, %err, "dropping malformed frame");
                }
            }
        }
    }

    let total = {
        let mut clients = inner.clients.lock().unwrap();
        clients.remove(&client_id);
        clients.len()
    };
    info!(client = client_id, total, "client disconnected");
}

/// Per-connection writer: drain response frames and broadcast notifications
/// into the socket until either side closes.
async fn write_outbound(
    client_id: u64,
    mut socket: OwnedWriteHalf,
    mut responses: mpsc::Receiver<Vec<u8>>,
    mut notifications: broadcast::Receiver<Arc<Vec<u8>>>,
) {
    loop {
        tokio::select! {
            maybe_frame = responses.recv() => match maybe_frame {
                Some(frame) => {
                    if socket.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            result = notifications.recv() => match result {
                Ok(frame) => {
                    if socket.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(client = client_id, skipped, "slow client skipped notifications");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{error_codes, RequestId};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn test_server() -> BridgeServer {
        // Paths are never bound in dispatch-only tests.
        BridgeServer::with_paths("/tmp/termbridge-test.sock", "/tmp/termbridge-test.info")
    }

    fn request(method: &str, params: Option<Value>) -> Request {
        Request::new(RequestId::Number(1), method, params)
    }

    #[tokio::test]
    async fn test_dispatch_builtin_ping() {
        let server = test_server();
        let response = server.inner.dispatch(request("ping", None)).await;

        let Message::Success(success) = response else {
            panic!("expected success response");
        };
        assert_eq!(success.id, RequestId::Number(1));
        let ping: PingResult = serde_json::from_value(success.result).unwrap();
        assert!(ping.pong);
        assert_eq!(ping.version, BRIDGE_VERSION);
        assert!(ping.timestamp > 0);
    }

    #[tokio::test]
    async fn test_dispatch_method_not_found() {
        let server = test_server();
        let response = server.inner.dispatch(request("nope", None)).await;

        let Message::Error(error) = response else {
            panic!("expected error response");
        };
        assert_eq!(error.error.code, error_codes::METHOD_NOT_FOUND);
        assert!(error.error.message.contains("nope"));
    }

    #[tokio::test]
    async fn test_dispatch_echo_handler() {
        let server = test_server();
        server.register_handler("echo", |params| async move {
            Ok::<_, RpcError>(params.unwrap_or(Value::Null))
        });

        let response = server
            .inner
            .dispatch(request("echo", Some(json!({"x": 1}))))
            .await;

        let Message::Success(success) = response else {
            panic!("expected success response");
        };
        assert_eq!(success.result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_dispatch_handler_error_preserves_code_and_message() {
        let server = test_server();
        server.register_handler("fail", |_| async {
            Err::<Value, _>(RpcError::new(error_codes::NO_ACTIVE_EDITOR, "no editor open"))
        });

        let response = server.inner.dispatch(request("fail", None)).await;
        let Message::Error(error) = response else {
            panic!("expected error response");
        };
        assert_eq!(error.error.code, error_codes::NO_ACTIVE_EDITOR);
        assert_eq!(error.error.message, "no editor open");
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let server = test_server();
        server.register_handler("greet", |_| async { Ok::<_, RpcError>(json!("first")) });
        server.register_handler("greet", |_| async { Ok::<_, RpcError>(json!("second")) });

        let response = server.inner.dispatch(request("greet", None)).await;
        let Message::Success(success) = response else {
            panic!("expected success response");
        };
        assert_eq!(success.result, json!("second"));
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_invalid_params() {
        #[derive(serde::Deserialize)]
        struct CursorParams {
            line: u32,
            character: u32,
        }

        let server = test_server();
        server.register_typed("editor/setCursor", |params: CursorParams| async move {
            Ok::<_, RpcError>(json!({"line": params.line, "character": params.character}))
        });

        // Well-formed params reach the handler.
        let ok = server
            .inner
            .dispatch(request(
                "editor/setCursor",
                Some(json!({"line": 3, "character": 0})),
            ))
            .await;
        assert!(matches!(ok, Message::Success(_)));

        // Malformed params never do.
        let err = server
            .inner
            .dispatch(request("editor/setCursor", Some(json!({"line": "x"}))))
            .await;
        let Message::Error(error) = err else {
            panic!("expected error response");
        };
        assert_eq!(error.error.code, error_codes::INVALID_PARAMS);
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::AlreadyRunning;
        assert_eq!(err.to_string(), "bridge server is already running");

        let err = ServerError::StaleSocket {
            path: PathBuf::from("/tmp/x.sock"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/tmp/x.sock"));
    }
}
