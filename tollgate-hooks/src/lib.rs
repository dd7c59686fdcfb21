//! Hook names, plugin registry, and the chain dispatcher.

pub mod dispatch;
pub mod dns;
pub mod plugin;
pub mod result;

pub use dispatch::{Dispatcher, HookContext, Suspension};
pub use plugin::{Plugin, PluginError, Registry};
pub use result::HookResult;

use core::fmt::{self, Display, Formatter};

/// Decision points during SMTP processing. Plugins register handlers per
/// hook; handlers run in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Connect,
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    DataPost,
    Auth,
    AuthPlain,
    AuthLogin,
    AuthCramMd5,
    Quit,
    ResetTransaction,
    Disconnect,
    UnrecognizedCommand,
}

impl Hook {
    pub const ALL: [Hook; 15] = [
        Hook::Connect,
        Hook::Helo,
        Hook::Ehlo,
        Hook::Mail,
        Hook::Rcpt,
        Hook::Data,
        Hook::DataPost,
        Hook::Auth,
        Hook::AuthPlain,
        Hook::AuthLogin,
        Hook::AuthCramMd5,
        Hook::Quit,
        Hook::ResetTransaction,
        Hook::Disconnect,
        Hook::UnrecognizedCommand,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Hook::Connect => "connect",
            Hook::Helo => "helo",
            Hook::Ehlo => "ehlo",
            Hook::Mail => "mail",
            Hook::Rcpt => "rcpt",
            Hook::Data => "data",
            Hook::DataPost => "data_post",
            Hook::Auth => "auth",
            Hook::AuthPlain => "auth-plain",
            Hook::AuthLogin => "auth-login",
            Hook::AuthCramMd5 => "auth-cram-md5",
            Hook::Quit => "quit",
            Hook::ResetTransaction => "reset_transaction",
            Hook::Disconnect => "disconnect",
            Hook::UnrecognizedCommand => "unrecognized_command",
        }
    }
}

impl Display for Hook {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
