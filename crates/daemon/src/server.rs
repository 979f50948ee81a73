//! Accepts client connections on the request socket and serves the
//! `do_balloon` RPC: one line in (bytes wanted), one line out (`OK`/`FAIL`),
//! mutex held for the lifetime of the connection.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

use qmemman_shared::protocol::{self, ProtocolError};

use crate::hypervisor::Hypervisor;
use crate::state::{StateError, SystemState};
use crate::watcher::ForceReenumerate;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Removes a stale socket file, binds fresh with world-writable
/// permissions (any local user may ask qmemman for memory), then restores
/// the process umask.
pub fn bind(sock_path: &Path) -> std::io::Result<UnixListener> {
    let _ = std::fs::remove_file(sock_path);
    // Safety: umask is process-global state; the daemon binds its one
    // socket during startup before spawning other tasks, so there is no
    // concurrent file creation to race.
    let previous = unsafe { libc::umask(0) };
    let result = UnixListener::bind(sock_path);
    unsafe {
        libc::umask(previous);
    }
    let listener = result?;
    std::fs::set_permissions(sock_path, std::fs::Permissions::from_mode(0o666))?;
    Ok(listener)
}

pub struct RequestServer<H: Hypervisor> {
    state: Arc<Mutex<SystemState<H>>>,
    force_reenumerate: ForceReenumerate,
}

impl<H: Hypervisor> RequestServer<H> {
    pub fn new(state: Arc<Mutex<SystemState<H>>>, force_reenumerate: ForceReenumerate) -> Self {
        Self {
            state,
            force_reenumerate,
        }
    }

    /// Runs until the listener itself errors out (the OS socket is gone);
    /// a single misbehaving connection never takes the server down.
    pub async fn run(self, listener: UnixListener) -> std::io::Result<()> {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let state = self.state.clone();
            let force_reenumerate = self.force_reenumerate.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, state, force_reenumerate).await {
                    tracing::warn!(error = %err, "request connection ended with an error");
                }
            });
        }
    }
}

async fn handle_connection<H: Hypervisor>(
    stream: UnixStream,
    state: Arc<Mutex<SystemState<H>>>,
    force_reenumerate: ForceReenumerate,
) -> Result<(), ServerError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let Some(amount) = protocol::read_request_line(&mut reader).await? else {
        return Ok(());
    };

    let mut guard = state.lock().await;
    let granted = guard.balloon(amount as f64).await?;
    protocol::write_response(&mut write_half, granted).await?;
    tracing::info!(amount, granted, "handled memory request");

    // Mutex stays held: the caller (typically a VM-start sequence) keeps
    // its reservation parked until it disconnects. Anything it sends
    // after the first line is an illegal second request and is refused
    // by simply never acting on it.
    loop {
        match protocol::read_request_line(&mut reader).await {
            Ok(None) => break,
            Ok(Some(_)) => {
                tracing::warn!("second request on the same connection, refusing");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "malformed data after initial request, closing");
                break;
            }
        }
    }

    force_reenumerate.store(true, Ordering::SeqCst);
    drop(guard);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;
    use crate::hypervisor::fake::FakeHypervisor;
    use qmemman_shared::QmemmanClient;

    async fn spawn_server() -> (tempfile::TempDir, std::path::PathBuf, ForceReenumerate) {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("qmemman.sock");
        let hv = Arc::new(FakeHypervisor::new(8192 * 1024, 8192 * 1024));
        let state = SystemState::with_paths(
            hv,
            Allocator::default(),
            dir.path().join("avail-mem"),
            dir.path().join("do-not-membalance"),
        )
        .await
        .unwrap();
        let state = Arc::new(Mutex::new(state));
        let force = ForceReenumerate::new(std::sync::atomic::AtomicBool::new(false));

        let listener = bind(&sock_path).unwrap();
        let server = RequestServer::new(state, force.clone());
        tokio::spawn(server.run(listener));

        (dir, sock_path, force)
    }

    #[tokio::test]
    async fn grants_request_when_plenty_free() {
        let (_dir, sock_path, force) = spawn_server().await;
        let mut client = QmemmanClient::connect_to(sock_path.to_str().unwrap())
            .await
            .unwrap();
        let granted = client.request_memory(1024).await.unwrap();
        assert!(granted);
        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(force.load(Ordering::SeqCst));
    }
}
