pub mod address;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod notes;
pub mod reply;
pub mod state;
pub mod transaction;

pub use tracing;

/// Broadcast signal used to coordinate shutdown across a worker's tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
