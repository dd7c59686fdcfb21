//! The SMTP front end: command parsing, the protocol state machine, the
//! per-connection session driver, and the accepting listener.

pub mod command;
pub mod listener;
pub mod session;
pub mod state;

pub use command::Command;
pub use listener::Listener;
pub use session::{Session, SmtpConfig};
pub use state::State;

use std::sync::Arc;

use tollgate_common::{config::Config, state::ServerState};
use tollgate_hooks::Dispatcher;

/// Hard ceiling on a command line per RFC 5321: 998 bytes plus CRLF.
pub const MAX_COMMAND_LINE: usize = 998;

/// Everything a session needs from its worker: the hook chain, the shared
/// counters/pause gate, the config oracle, and the session tunables.
pub struct Smtp {
    pub dispatcher: Dispatcher,
    pub server: Arc<ServerState>,
    pub config: Arc<Config>,
    pub settings: SmtpConfig,
}
