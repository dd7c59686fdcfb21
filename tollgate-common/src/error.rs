//! Shared error types.

use std::io;

use thiserror::Error;

/// Errors that end a single SMTP session. None of these are fatal to the
/// worker; the listener logs and moves on.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// Client went quiet past the idle limit.
    #[error("session timed out after {0} seconds")]
    Timeout(u64),

    /// Peer closed or the session was cancelled mid-hook.
    #[error("session cancelled")]
    Cancelled,

    #[error("shutdown requested")]
    Shutdown,

    /// Contained handler or session failure; the client saw a 451.
    #[error("internal session error: {0}")]
    Internal(String),
}

impl SessionError {
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown | Self::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),
}
