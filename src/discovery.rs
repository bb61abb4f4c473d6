//! Socket discovery and the on-disk bridge descriptor.
//!
//! Two lookup strategies compose into one result set:
//!
//! 1. The well-known bridge socket, resolved through the [`BridgeInfo`]
//!    descriptor file the server writes at startup (falling back to the
//!    default socket path).
//! 2. A scan of per-user temp directories for generic IDE IPC sockets
//!    (`vscode-ipc-*.sock`), sorted freshest-first by modification time.
//!
//! Candidates are probed for liveness with a short connect-and-disconnect.
//! Discovery is read-only: it never unlinks or rewrites candidate files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;

use crate::BRIDGE_VERSION;

/// Directory holding the bridge socket and descriptor, owned by the user.
const BRIDGE_DIR_NAME: &str = ".termbridge";
const SOCKET_FILE_NAME: &str = "bridge.sock";
const INFO_FILE_NAME: &str = "bridge.info";

/// Filename pattern of generic IDE IPC sockets picked up by the scan.
const IDE_SOCKET_PREFIX: &str = "vscode-ipc-";
const IDE_SOCKET_SUFFIX: &str = ".sock";

/// How long a liveness probe waits for the connect to complete.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// The per-user bridge directory (`~/.termbridge`).
pub fn bridge_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(BRIDGE_DIR_NAME)
}

/// Default path of the well-known bridge socket.
pub fn default_socket_path() -> PathBuf {
    bridge_dir().join(SOCKET_FILE_NAME)
}

/// Default path of the bridge descriptor file.
pub fn default_info_path() -> PathBuf {
    bridge_dir().join(INFO_FILE_NAME)
}

/// On-disk descriptor written by the server at start and removed at clean
/// stop. Clients that were not given an explicit socket path read this to
/// find the live server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeInfo {
    pub socket_path: PathBuf,
    pub version: String,
    pub pid: u32,
    /// Epoch milliseconds at server start.
    pub started_at: i64,
}

impl BridgeInfo {
    /// Describe the current process serving at `socket_path`.
    pub fn current(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            version: BRIDGE_VERSION.to_string(),
            pid: std::process::id(),
            started_at: Utc::now().timestamp_millis(),
        }
    }

    /// Read and parse a descriptor file. Returns `None` if the file is
    /// missing or unparseable; discovery treats both the same way.
    pub fn read(path: &Path) -> Option<Self> {
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Write the descriptor with owner-only permissions.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        std::fs::write(path, text)?;
        restrict_permissions(path)
    }
}

/// Restrict a file to owner read/write (0600).
pub(crate) fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

/// Which lookup strategy produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// The well-known bridge socket (descriptor file or default path).
    Bridge,
    /// A generic IDE IPC socket found by the temp-directory scan.
    IdeIpc,
}

/// A candidate socket path. Ephemeral: recomputed on each discovery call.
#[derive(Debug, Clone)]
pub struct DiscoveredSocket {
    pub path: PathBuf,
    pub kind: SocketKind,
    /// Time since the backing file was last modified (or since server start
    /// for the bridge socket).
    pub age: Duration,
    /// Whether a liveness probe succeeded against this path.
    pub active: bool,
}

/// Resolve the socket path a client should connect to when it was not given
/// one explicitly: the descriptor's `socketPath` if the descriptor is
/// readable, otherwise the default path.
pub fn resolve_socket_path(info_path: &Path) -> PathBuf {
    match BridgeInfo::read(info_path) {
        Some(info) => info.socket_path,
        None => default_socket_path(),
    }
}

/// Locate the well-known bridge socket, if any.
///
/// Prefers the descriptor file; a descriptor whose `socketPath` no longer
/// exists on disk is ignored. Falls back to the default socket path when no
/// descriptor is present.
pub fn find_bridge_socket(info_path: &Path) -> Option<DiscoveredSocket> {
    if let Some(info) = BridgeInfo::read(info_path) {
        if info.socket_path.exists() {
            let age_ms = (Utc::now().timestamp_millis() - info.started_at).max(0);
            return Some(DiscoveredSocket {
                path: info.socket_path,
                kind: SocketKind::Bridge,
                age: Duration::from_millis(age_ms as u64),
                active: false,
            });
        }
    }

    let fallback = default_socket_path();
    if fallback.exists() {
        return Some(DiscoveredSocket {
            path: fallback,
            kind: SocketKind::Bridge,
            age: Duration::ZERO,
            active: false,
        });
    }
    None
}

/// True for filenames matching the IDE IPC socket pattern.
fn is_ide_socket_name(name: &str) -> bool {
    name.starts_with(IDE_SOCKET_PREFIX) && name.ends_with(IDE_SOCKET_SUFFIX)
}

/// Per-user temp directories to scan, deduplicated by canonical path.
fn scan_directories() -> Vec<PathBuf> {
    let candidates = [
        dirs::runtime_dir(),
        Some(std::env::temp_dir()),
        Some(PathBuf::from("/tmp")),
    ];

    let mut seen = Vec::new();
    for dir in candidates.into_iter().flatten() {
        if let Ok(canonical) = std::fs::canonicalize(&dir) {
            if !seen.contains(&canonical) {
                seen.push(canonical);
            }
        }
    }
    seen
}

/// Scan temp directories for generic IDE IPC sockets, sorted by age
/// ascending (most recently modified first).
pub fn scan_ide_sockets() -> Vec<DiscoveredSocket> {
    let mut found = Vec::new();

    for dir in scan_directories() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_ide_socket_name(name) {
                continue;
            }
            // The socket may vanish between readdir and stat.
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .unwrap_or(Duration::ZERO);
            found.push(DiscoveredSocket {
                path: entry.path(),
                kind: SocketKind::IdeIpc,
                age,
                active: false,
            });
        }
    }

    found.sort_by_key(|socket| socket.age);
    found
}

/// Probe a candidate path for a listener: connect under a short timeout and
/// drop the connection immediately. Refusal, not-found, and timeout all
/// count as inactive.
pub async fn probe_socket(path: &Path, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, UnixStream::connect(path)).await,
        Ok(Ok(_))
    )
}

/// Discover every candidate socket and probe each for liveness: the bridge
/// socket first, then scanned IDE sockets freshest-first.
pub async fn discover_sockets() -> Vec<DiscoveredSocket> {
    let mut sockets = Vec::new();

    if let Some(mut bridge) = find_bridge_socket(&default_info_path()) {
        bridge.active = probe_socket(&bridge.path, PROBE_TIMEOUT).await;
        sockets.push(bridge);
    }

    for mut socket in scan_ide_sockets() {
        socket.active = probe_socket(&socket.path, PROBE_TIMEOUT).await;
        sockets.push(socket);
    }

    sockets
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    #[test]
    fn test_bridge_info_roundtrip_uses_camel_case() {
        let info = BridgeInfo::current("/tmp/bridge.sock");
        let text = serde_json::to_string(&info).unwrap();
        assert!(text.contains("socketPath"));
        assert!(text.contains("startedAt"));

        let decoded: BridgeInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_bridge_info_write_read() {
        let tmp = TempDir::new().unwrap();
        let info_path = tmp.path().join("bridge.info");

        let info = BridgeInfo::current(tmp.path().join("bridge.sock"));
        info.write(&info_path).unwrap();

        let read_back = BridgeInfo::read(&info_path).unwrap();
        assert_eq!(read_back, info);

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&info_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_bridge_info_read_missing_or_garbage() {
        let tmp = TempDir::new().unwrap();
        assert!(BridgeInfo::read(&tmp.path().join("absent")).is_none());

        let garbage = tmp.path().join("bridge.info");
        std::fs::write(&garbage, "not json").unwrap();
        assert!(BridgeInfo::read(&garbage).is_none());
    }

    #[test]
    fn test_resolve_prefers_descriptor_over_default() {
        let tmp = TempDir::new().unwrap();
        let info_path = tmp.path().join("bridge.info");
        let socket_path = tmp.path().join("custom.sock");

        BridgeInfo::current(&socket_path).write(&info_path).unwrap();
        assert_eq!(resolve_socket_path(&info_path), socket_path);

        // No descriptor → default path.
        assert_eq!(
            resolve_socket_path(&tmp.path().join("absent")),
            default_socket_path()
        );
    }

    #[test]
    fn test_find_bridge_socket_ignores_dangling_descriptor() {
        let tmp = TempDir::new().unwrap();
        let info_path = tmp.path().join("bridge.info");

        // Descriptor points at a socket that does not exist: the dangling
        // entry must not be returned (only the default-path fallback may be,
        // if one happens to exist on this machine).
        BridgeInfo::current(tmp.path().join("gone.sock"))
            .write(&info_path)
            .unwrap();
        match find_bridge_socket(&info_path) {
            None => {}
            Some(found) => assert_eq!(found.path, default_socket_path()),
        }
    }

    #[test]
    fn test_ide_socket_name_pattern() {
        assert!(is_ide_socket_name("vscode-ipc-1234-abcd.sock"));
        assert!(!is_ide_socket_name("vscode-ipc-1234.log"));
        assert!(!is_ide_socket_name("other-ipc.sock"));
        assert!(!is_ide_socket_name("bridge.sock"));
    }

    #[tokio::test]
    async fn test_probe_live_socket() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("live.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        assert!(probe_socket(&path, PROBE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_probe_dead_and_missing_sockets() {
        let tmp = TempDir::new().unwrap();

        // Missing file.
        assert!(!probe_socket(&tmp.path().join("absent.sock"), PROBE_TIMEOUT).await);

        // Stale socket file with no listener behind it.
        let stale = tmp.path().join("stale.sock");
        drop(UnixListener::bind(&stale).unwrap());
        assert!(!probe_socket(&stale, PROBE_TIMEOUT).await);
    }
}
