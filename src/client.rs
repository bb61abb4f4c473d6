//! Bridge client for CLI processes talking to the IDE-embedded server.
//!
//! One [`BridgeClient`] owns one socket connection. Requests are correlated
//! by id against a pending-request table, each with its own timeout, so any
//! number of `request()` calls can be in flight concurrently and responses
//! may arrive in any order. Server-sent notifications are delivered to
//! per-method callbacks, unordered relative to pending requests.
//!
//! # Example
//!
//! ```ignore
//! use termbridge::client::BridgeClient;
//! use serde_json::json;
//!
//! let client = BridgeClient::new(); // auto-discovers via the descriptor
//! client.connect().await?;
//! let result = client.request("editor/getText", Some(json!({}))).await?;
//! client.disconnect().await;
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::discovery;
use crate::framing::{frame_message, StreamReassembler};
use crate::protocol::{Message, Request, RequestId};

/// Default time a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Read chunk size for the reader task.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Client-side error taxonomy.
///
/// Connect failures, protocol errors, and timeouts stay distinguishable so
/// callers can explain each one differently (e.g. "no bridge server found"
/// versus "the server rejected the call").
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not open the socket (server not running, wrong path, denied).
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// `request()` was called while disconnected.
    #[error("not connected to bridge")]
    NotConnected,

    /// No response arrived within the configured timeout.
    #[error("request timed out: {method}")]
    Timeout { method: String },

    /// The connection closed while the request was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server answered with a JSON-RPC error response.
    #[error("{message} (code: {code})")]
    Server {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Framing or encoding failure on this side.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                ClientError::ConnectionFailed(err)
            }
            _ => ClientError::Io(err),
        }
    }
}

/// Construction options. An explicit `socket_path` always wins over
/// descriptor auto-discovery — an operator-specified path is never silently
/// overridden.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Connect to exactly this socket, skipping auto-discovery.
    pub socket_path: Option<PathBuf>,
    /// Descriptor file used for auto-discovery (defaults to the well-known
    /// location).
    pub info_path: Option<PathBuf>,
    /// Per-request timeout (defaults to 10 s).
    pub timeout: Option<Duration>,
}

type PendingSender = oneshot::Sender<Result<Value, ClientError>>;
type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// State shared with the reader task.
struct ClientShared {
    connected: AtomicBool,
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingSender>>,
    notification_handlers: Mutex<HashMap<String, NotificationHandler>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

impl ClientShared {
    /// Route one incoming message: responses resolve their pending entry,
    /// notifications go to the registered callback, anything else is noise.
    fn handle_message(&self, message: Message) {
        match message {
            Message::Success(response) => {
                match self.take_pending(&response.id) {
                    Some(tx) => {
                        let _ = tx.send(Ok(response.result));
                    }
                    // Late response for a request that already timed out.
                    None => debug!(id = %response.id, "dropping response for expired request"),
                }
            }
            Message::Error(response) => match self.take_pending(&response.id) {
                Some(tx) => {
                    let _ = tx.send(Err(ClientError::Server {
                        code: response.error.code,
                        message: response.error.message,
                        data: response.error.data,
                    }));
                }
                None => debug!(id = %response.id, "dropping error for expired request"),
            },
            Message::Notification(notification) => {
                let handler = self
                    .notification_handlers
                    .lock()
                    .unwrap()
                    .get(&notification.method)
                    .cloned();
                match handler {
                    Some(handler) => handler(notification.params),
                    None => trace!(method = %notification.method, "unhandled notification"),
                }
            }
            Message::Request(request) => {
                debug!(method = %request.method, "ignoring server-to-client request");
            }
        }
    }

    fn take_pending(&self, id: &RequestId) -> Option<PendingSender> {
        self.pending.lock().unwrap().remove(id)
    }

    /// Reject every still-pending request so callers never hang on a dead
    /// connection. Connection loss and explicit disconnect share this path.
    fn reject_pending(&self) {
        let drained: Vec<(RequestId, PendingSender)> =
            self.pending.lock().unwrap().drain().collect();
        for (id, tx) in drained {
            debug!(%id, "rejecting pending request: connection closed");
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reject_pending();
    }
}

/// The CLI-side bridge client.
///
/// Lifecycle: `Disconnected → connect() → Connected → disconnect()/close →
/// Disconnected`. Dropping the client aborts its reader task, so a
/// short-lived CLI process is never kept alive by an idle connection.
pub struct BridgeClient {
    socket_path: Option<PathBuf>,
    info_path: PathBuf,
    timeout: Duration,
    shared: Arc<ClientShared>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeClient {
    /// Client that auto-discovers the socket via the descriptor file.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Client pinned to an explicit socket path.
    pub fn with_socket_path(path: impl Into<PathBuf>) -> Self {
        Self::with_config(ClientConfig {
            socket_path: Some(path.into()),
            ..ClientConfig::default()
        })
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            socket_path: config.socket_path,
            info_path: config.info_path.unwrap_or_else(discovery::default_info_path),
            timeout: config.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            shared: Arc::new(ClientShared {
                connected: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                notification_handlers: Mutex::new(HashMap::new()),
                writer: tokio::sync::Mutex::new(None),
            }),
            reader_task: Mutex::new(None),
        }
    }

    /// Override the per-request timeout (default 10 s).
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Open the socket connection and start the reader task.
    ///
    /// The socket path is the explicit one if given, otherwise whatever the
    /// descriptor file names (falling back to the default path). Connecting
    /// an already-connected client is a no-op.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            return Ok(());
        }

        let path = self
            .socket_path
            .clone()
            .unwrap_or_else(|| discovery::resolve_socket_path(&self.info_path));

        let stream = UnixStream::connect(&path)
            .await
            .map_err(ClientError::ConnectionFailed)?;
        let (read_half, write_half) = stream.into_split();

        *self.shared.writer.lock().await = Some(write_half);
        self.shared.connected.store(true, Ordering::SeqCst);

        let task = tokio::spawn(read_loop(Arc::clone(&self.shared), read_half));
        *self.reader_task.lock().unwrap() = Some(task);

        info!(socket = %path.display(), "connected to bridge");
        Ok(())
    }

    /// Send a request and wait for the matching response.
    ///
    /// Concurrent calls are correlated by id, so responses may arrive in
    /// any order. On timeout the pending entry is removed and a late
    /// response is dropped rather than mis-delivered. Calling while
    /// disconnected fails immediately without touching the socket.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let id = RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(id.clone(), tx);

        let message = Message::Request(Request::new(id.clone(), method, params));
        let frame = match frame_message(&message) {
            Ok(frame) => frame,
            Err(err) => {
                self.shared.take_pending(&id);
                return Err(ClientError::Protocol(err.to_string()));
            }
        };

        {
            let mut writer = self.shared.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                self.shared.take_pending(&id);
                return Err(ClientError::NotConnected);
            };
            if let Err(err) = writer.write_all(&frame).await {
                self.shared.take_pending(&id);
                return Err(err.into());
            }
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without resolving: the sweep beat us to it.
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.shared.take_pending(&id);
                Err(ClientError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Register the handler for a server-sent notification method,
    /// replacing any prior registration. Notifications without a handler
    /// are silently dropped.
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.shared
            .notification_handlers
            .lock()
            .unwrap()
            .insert(method.into(), Arc::new(handler));
    }

    /// Close the connection and reject every pending request with a
    /// connection-closed error. A no-op when already disconnected.
    pub async fn disconnect(&self) {
        if !self.shared.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
        *self.shared.writer.lock().await = None;
        self.shared.reject_pending();
        info!("disconnected from bridge");
    }
}

impl Default for BridgeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        // Don't let the reader task outlive the client and keep a finished
        // CLI process running.
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Reader task: feed socket bytes into the reassembler and route each
/// complete message. A peer-initiated close performs the same pending-
/// request sweep as an explicit `disconnect()`.
async fn read_loop(shared: Arc<ClientShared>, mut socket: OwnedReadHalf) {
    let mut reassembler = StreamReassembler::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    'io: loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(%err, "read error");
                break;
            }
        };

        for item in reassembler.feed(&chunk[..n]) {
            match item {
                Ok(message) => shared.handle_message(message),
                Err(err) if err.is_fatal() => {
                    warn!(%err, "stream desynchronized, closing connection");
                    break 'io;
                }
                Err(err) => warn!(%err, "dropping malformed frame"),
            }
        }
    }

    shared.mark_disconnected();
    debug!("reader task finished");
}
