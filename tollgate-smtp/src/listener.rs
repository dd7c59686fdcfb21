//! The accepting front end: adaptive batch accepts and the pause gate.
//!
//! Accepts are drained in batches of `numaccept`: the first accept awaits,
//! the rest are poll-once drains. Draining a full batch doubles `numaccept`
//! (capped at [`MAX_ACCEPT`]); every 30 seconds it resets to
//! [`INITIAL_ACCEPT`]. That gives burst tolerance without letting one hot
//! listener starve the worker's other tasks.

use std::sync::Arc;

use futures_util::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use tollgate_common::{error::ListenerError, Signal};

use crate::session::Session;
use crate::Smtp;

pub const INITIAL_ACCEPT: usize = 20;
pub const MAX_ACCEPT: usize = 1000;
pub const ACCEPT_RESET_SECS: u64 = 30;

/// Sent to (and only to) connections accepted while the gate is down.
pub const PAUSED_REPLY: &[u8] = b"451 Sorry, this server is currently paused\r\n";

pub struct Listener {
    listener: TcpListener,
    smtp: Arc<Smtp>,
}

impl Listener {
    pub fn new(listener: TcpListener, smtp: Arc<Smtp>) -> Self {
        Self { listener, smtp }
    }

    /// Wrap a listening socket inherited from the supervisor (prefork
    /// workers share the parent's bound fd; the kernel arbitrates accepts).
    pub fn from_std(listener: std::net::TcpListener, smtp: Arc<Smtp>) -> Result<Self, ListenerError> {
        listener
            .set_nonblocking(true)
            .map_err(ListenerError::AcceptFailed)?;
        let listener = TcpListener::from_std(listener).map_err(ListenerError::AcceptFailed)?;
        Ok(Self { listener, smtp })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(
        &self,
        shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        let mut shutdown_rx = shutdown.resubscribe();
        let mut numaccept = INITIAL_ACCEPT;
        let reset_period = std::time::Duration::from_secs(ACCEPT_RESET_SECS);
        let mut reset = tokio::time::interval_at(
            tokio::time::Instant::now() + reset_period,
            reset_period,
        );
        reset.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            addr = ?self.listener.local_addr().ok(),
            "smtp listener serving"
        );

        loop {
            tokio::select! {
                sig = shutdown_rx.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        tracing::info!("smtp listener shutting down");
                        return Ok(());
                    }
                }

                _ = reset.tick() => {
                    numaccept = INITIAL_ACCEPT;
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    self.dispatch_connection(stream, peer, &shutdown);

                    // Drain the rest of the batch without waiting.
                    let mut batch = 1;
                    let mut saturated = true;
                    while batch < numaccept {
                        match self.listener.accept().now_or_never() {
                            Some(Ok((stream, peer))) => {
                                self.dispatch_connection(stream, peer, &shutdown);
                                batch += 1;
                            }
                            Some(Err(err)) => {
                                tracing::warn!(%err, "accept failed mid-batch");
                                saturated = false;
                                break;
                            }
                            None => {
                                saturated = false;
                                break;
                            }
                        }
                    }

                    if saturated {
                        numaccept = next_batch_size(numaccept, true);
                        tracing::debug!(numaccept, "accept batch saturated");
                    }
                }
            }
        }
    }

    fn dispatch_connection(
        &self,
        stream: TcpStream,
        peer: std::net::SocketAddr,
        shutdown: &broadcast::Receiver<Signal>,
    ) {
        let smtp = Arc::clone(&self.smtp);

        if smtp.server.is_paused() {
            tokio::spawn(async move {
                let mut stream = stream;
                let _ = stream.write_all(PAUSED_REPLY).await;
                let _ = stream.shutdown().await;
            });
            return;
        }

        smtp.server.connection_accepted();
        let shutdown = shutdown.resubscribe();
        tokio::spawn(async move {
            let session = Session::new(stream, peer, Arc::clone(&smtp));
            match session.run(shutdown).await {
                Ok(()) => {}
                Err(err) if err.is_shutdown() => {
                    tracing::debug!(%peer, %err, "session ended on shutdown");
                }
                Err(err) => {
                    tracing::warn!(%peer, %err, "session ended with error");
                }
            }
            smtp.server.connection_closed();
        });
    }
}

/// Doubling rule for the accept batch size.
fn next_batch_size(current: usize, saturated: bool) -> usize {
    if saturated {
        (current * 2).min(MAX_ACCEPT)
    } else {
        current
    }
}
