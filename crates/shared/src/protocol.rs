use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Requests over the qmemman socket are capped at this many bytes; a line
/// longer than this without a trailing `\n` is treated as malformed input.
pub const MAX_REQUEST_LINE_BYTES: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("request line exceeded {MAX_REQUEST_LINE_BYTES} bytes")]
    LineTooLong,
    #[error("request line was not valid UTF-8")]
    NotUtf8,
    #[error("request was not a valid unsigned byte count: {0:?}")]
    NotANumber(String),
}

/// Read a single `\n`-terminated line, bounded to [`MAX_REQUEST_LINE_BYTES`].
///
/// Returns `Ok(None)` on a clean EOF with no bytes read at all (the client
/// closed the connection without sending anything).
///
/// Warning: this is the only supported way to read a request off the
/// socket; do not read the stream directly elsewhere.
pub async fn read_request_line(
    reader: &mut BufReader<OwnedReadHalf>,
) -> Result<Option<u64>, ProtocolError> {
    let mut buf = Vec::new();
    let mut limited = reader.take(MAX_REQUEST_LINE_BYTES as u64 + 1);
    let n = limited.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_REQUEST_LINE_BYTES {
        return Err(ProtocolError::LineTooLong);
    }
    let text = std::str::from_utf8(&buf).map_err(|_| ProtocolError::NotUtf8)?;
    let text = text.trim();
    text.parse::<u64>()
        .map(Some)
        .map_err(|_| ProtocolError::NotANumber(text.to_string()))
}

/// Send the one-line `OK\n` / `FAIL\n` response.
///
/// Warning: do not write to the accepted stream except through this
/// function.
pub async fn write_response(writer: &mut OwnedWriteHalf, ok: bool) -> std::io::Result<()> {
    let line: &[u8] = if ok { b"OK\n" } else { b"FAIL\n" };
    writer.write_all(line).await?;
    writer.flush().await
}
