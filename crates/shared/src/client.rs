use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::DEFAULT_SOCK_PATH;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("server sent an unrecognized response: {0:?}")]
    BadResponse(String),
}

/// Programmatic counterpart to the request server: connect, ask for
/// `amount` bytes of host-free memory, and report whether the daemon
/// managed to reserve it.
///
/// Typical caller: whatever starts a new VM and needs headroom parked
/// until the VM's own meminfo subscription comes up.
pub struct QmemmanClient {
    stream: UnixStream,
}

impl QmemmanClient {
    pub async fn connect() -> Result<Self, ClientError> {
        Self::connect_to(DEFAULT_SOCK_PATH).await
    }

    pub async fn connect_to(path: &str) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self { stream })
    }

    /// Ask the daemon to reserve `amount` bytes. The connection must be
    /// kept open (i.e. `self` must stay alive) for as long as the
    /// reservation needs to be held; dropping it releases the mutex on
    /// the daemon side and lets balancing reclaim the memory.
    pub async fn request_memory(&mut self, amount: u64) -> Result<bool, ClientError> {
        let line = format!("{amount}\n");
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.flush().await?;

        let (read_half, _write_half) = self.stream.split();
        let mut reader = BufReader::new(read_half);
        let mut response = String::new();
        reader.read_line(&mut response).await?;
        match response.trim() {
            "OK" => Ok(true),
            "FAIL" => Ok(false),
            other => Err(ClientError::BadResponse(other.to_string())),
        }
    }
}
