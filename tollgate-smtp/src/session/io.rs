//! Byte-level I/O for the session: the growable line buffer and reply
//! writes. Replies are flushed before the next line is read, which is what
//! keeps slow peers from growing an output buffer (and gives invariant 1:
//! one reply on the wire before the next command is parsed).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tollgate_common::{error::SessionError, reply::Reply};

use super::Session;

/// Ceiling on buffered bytes while hunting for a line terminator. A peer
/// that sends this much without a newline is not speaking SMTP.
const MAX_BUFFERED: usize = 1024 * 1024;

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Session<S> {
    /// Next LF-terminated line, without its CRLF. `None` on EOF. Bare LF is
    /// tolerated; embedded CR bytes are preserved.
    pub(super) async fn read_line(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        loop {
            if let Some(pos) = self.read_buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.read_buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }

            if self.read_buf.len() > MAX_BUFFERED {
                return Err(SessionError::Internal(
                    "line buffer overflow without terminator".to_string(),
                ));
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Write one reply and flush it before anything else happens.
    pub(super) async fn send(&mut self, reply: &Reply) -> Result<(), SessionError> {
        tracing::trace!(peer = %self.connection.peer(), %reply, "send");
        self.stream.write_all(reply.render().as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
