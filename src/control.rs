//! Control socket for firewall-flush notifications
//!
//! Embedded router platforms run `netfilter.d` scripts whenever an
//! external actor rebuilds the firewall. Such a script pokes this UNIX
//! socket with a single `netfilter.d:<type>:<table>` message, and the
//! daemon re-asserts everything it owns in the affected family and
//! table.
//!
//! The protocol is a single read of up to 1024 bytes, colon-separated;
//! larger messages are truncated. No response is written, the connection
//! is closed after processing.

use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::Engine;
use crate::error::ControlError;
use crate::netfilter::PortRemap;

/// Well-known control socket path
pub const CONTROL_SOCKET_PATH: &str = "/opt/var/run/magitrickle.sock";

/// Largest message a single read accepts
const MAX_MESSAGE_SIZE: usize = 1024;

/// Bind the control socket, replacing a stale socket file
///
/// # Errors
///
/// Returns `ControlError` when a stale file cannot be removed or the
/// socket cannot be bound.
pub fn bind(path: impl AsRef<Path>) -> Result<UnixListener, ControlError> {
    let path = path.as_ref();

    if path.exists() {
        std::fs::remove_file(path).map_err(|e| ControlError::SocketCreation {
            path: path.display().to_string(),
            reason: format!("failed to remove stale socket: {e}"),
        })?;
    }

    let listener = UnixListener::bind(path).map_err(|e| ControlError::BindError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    info!(path = %path.display(), "control socket listening");
    Ok(listener)
}

/// Spawn the accept loop; each connection is handled concurrently
pub fn spawn_accept_loop(
    listener: UnixListener,
    engine: Arc<Engine>,
    port_remap: Option<Arc<PortRemap>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let engine = Arc::clone(&engine);
                            let port_remap = port_remap.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, engine, port_remap).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "control socket accept failed");
                        }
                    }
                }
            }
        }
        debug!("control socket accept loop stopped");
    })
}

async fn handle_connection(
    mut stream: UnixStream,
    engine: Arc<Engine>,
    port_remap: Option<Arc<PortRemap>>,
) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let len = match stream.read(&mut buf).await {
        Ok(len) => len,
        Err(e) => {
            debug!(error = %e, "control socket read failed");
            return;
        }
    };

    let message = String::from_utf8_lossy(&buf[..len]);
    let Some((kind, table)) = parse_message(&message) else {
        debug!(message = %message, "ignoring unknown control message");
        return;
    };

    debug!(kind, table, "netfilter.d event");

    if let Some(remap) = &port_remap {
        if let Err(e) = remap.netfilterd_hook(kind, table).await {
            error!(error = %e, "failed to re-assert DNS remap after netfilter.d");
        }
    }
    for group in engine.groups() {
        if let Err(e) = group.netfilterd_hook(kind, table).await {
            error!(group = %group.id(), error = %e, "failed to re-assert group rules after netfilter.d");
        }
    }
}

/// Parse a `netfilter.d:<type>:<table>` message
///
/// Returns `None` for anything else.
#[must_use]
pub fn parse_message(message: &str) -> Option<(&str, &str)> {
    let message = message.trim_end_matches(['\n', '\0']);
    let parts: Vec<&str> = message.split(':').collect();
    if parts.len() == 3 && parts[0] == "netfilter.d" {
        Some((parts[1], parts[2]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Records;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_message() {
        assert_eq!(
            parse_message("netfilter.d:iptables:mangle"),
            Some(("iptables", "mangle"))
        );
        assert_eq!(parse_message("netfilter.d::nat"), Some(("", "nat")));
        assert_eq!(parse_message("netfilter.d:ip6tables:filter\n"), Some(("ip6tables", "filter")));
        assert!(parse_message("netfilter.d:mangle").is_none());
        assert!(parse_message("reload:now:please").is_none());
        assert!(parse_message("").is_none());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("magitrickle.sock");

        // Leave a stale file behind.
        std::fs::write(&path, b"stale").unwrap();

        let listener = bind(&path).unwrap();
        drop(listener);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_accept_loop_handles_message_and_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("magitrickle.sock");

        let engine = Arc::new(Engine::new(Arc::new(Records::new()), 3600));
        let listener = bind(&path).unwrap();
        let cancel = CancellationToken::new();
        let handle = spawn_accept_loop(listener, engine, None, cancel.clone());

        // A client pokes the socket; no response is expected.
        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(b"netfilter.d:iptables:mangle")
            .await
            .unwrap();
        drop(stream);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
