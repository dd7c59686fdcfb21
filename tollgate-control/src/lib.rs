//! The admin channel: a loopback-only TCP listener speaking a one-line
//! protocol. `pause` gates the acceptor, `resume` lifts it, `status` dumps
//! the worker counters, `reload` re-reads configuration and rebuilds the
//! plugin chain. Bound by the parent in prefork mode, by the worker itself
//! in single-process mode.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use tollgate_common::{state::ServerState, Signal};

pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:20025";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to bind control socket {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("control i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Status,
    Reload,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "status" => Some(Self::Status),
            "reload" => Some(Self::Reload),
            _ => None,
        }
    }
}

pub struct ControlServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    reload: Arc<dyn Fn() + Send + Sync>,
}

impl ControlServer {
    /// Bind the channel. The address must be loopback; anything else is a
    /// configuration mistake this refuses to serve.
    pub async fn bind(
        addr: &str,
        state: Arc<ServerState>,
        reload: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<Self, ControlError> {
        let parsed: std::net::SocketAddr = addr.parse().map_err(|_| ControlError::Bind {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid address"),
        })?;
        if !parsed.ip().is_loopback() {
            return Err(ControlError::Bind {
                addr: addr.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "control channel must bind loopback",
                ),
            });
        }

        let listener = TcpListener::bind(parsed)
            .await
            .map_err(|source| ControlError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        tracing::info!(%parsed, "control channel listening");
        Ok(Self {
            listener,
            state,
            reload,
        })
    }

    /// Wrap a socket the supervisor bound before forking. Workers inherit
    /// the fd; the kernel arbitrates accepts exactly as it does for the
    /// SMTP listener.
    pub fn from_std(
        listener: std::net::TcpListener,
        state: Arc<ServerState>,
        reload: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<Self, ControlError> {
        let addr = listener.local_addr().map_err(ControlError::Io)?;
        if !addr.ip().is_loopback() {
            return Err(ControlError::Bind {
                addr: addr.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "control channel must bind loopback",
                ),
            });
        }
        listener.set_nonblocking(true).map_err(ControlError::Io)?;
        let listener = TcpListener::from_std(listener).map_err(ControlError::Io)?;
        Ok(Self {
            listener,
            state,
            reload,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), ControlError> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("control channel shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::debug!(%peer, "control connection");
                    let state = Arc::clone(&self.state);
                    let reload = Arc::clone(&self.reload);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, state, reload).await {
                            tracing::warn!(%err, "control connection failed");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<ServerState>,
    reload: Arc<dyn Fn() + Send + Sync>,
) -> Result<(), ControlError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let response = match Command::parse(&line) {
            Some(Command::Pause) => {
                state.pause();
                tracing::info!("paused by control channel");
                "200 paused".to_string()
            }
            Some(Command::Resume) => {
                state.resume();
                tracing::info!("resumed by control channel");
                "200 resumed".to_string()
            }
            Some(Command::Status) => {
                let counters = state.snapshot();
                format!(
                    "200 accepted={} active={} rejected-black={} rejected-white={} paused={}",
                    counters.accepted,
                    counters.active,
                    counters.rejected_black,
                    counters.rejected_white,
                    counters.paused
                )
            }
            Some(Command::Reload) => {
                reload();
                tracing::info!("reloaded by control channel");
                "200 reloaded".to_string()
            }
            None => "500 unknown command".to_string(),
        };

        write_half.write_all(response.as_bytes()).await?;
        write_half.write_all(b"\r\n").await?;
        write_half.flush().await?;
    }

    Ok(())
}

/// One-shot client used by tooling and the test harness.
pub async fn send_command(addr: &str, command: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(command.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;

    let (read_half, _write_half) = stream.split();
    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;
    Ok(line.trim_end().to_string())
}
