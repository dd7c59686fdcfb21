//! HookResult -> SMTP reply mapping. One place implements the table from the
//! reply policy: OK takes the hook's 2xx (with the handler's text when it
//! gave one), DENY is 550, DENYSOFT 451, DENYHARD 550 + close, DONE
//! suppresses the default, DECLINED applies it.

use tollgate_common::reply::{Code, Reply};
use tollgate_hooks::HookResult;

#[derive(Debug, PartialEq, Eq)]
pub(super) struct Mapped {
    pub reply: Option<Reply>,
    pub close: bool,
    /// The hook denied: the caller rolls back whatever envelope mutation the
    /// command had staged.
    pub denied: bool,
}

pub(super) fn map_result(result: &HookResult, default: Reply) -> Mapped {
    match result {
        HookResult::Ok(message) => Mapped {
            reply: Some(match message {
                Some(text) => Reply::new(default.code(), text.clone()),
                None => default,
            }),
            close: false,
            denied: false,
        },
        HookResult::Declined => Mapped {
            reply: Some(default),
            close: false,
            denied: false,
        },
        HookResult::Deny(message) => Mapped {
            reply: Some(Reply::new(
                Code::Rejected,
                message.clone().unwrap_or_else(|| "denied".to_string()),
            )),
            close: false,
            denied: true,
        },
        HookResult::DenySoft(message) => Mapped {
            reply: Some(Reply::new(
                Code::ActionUnavailable,
                message
                    .clone()
                    .unwrap_or_else(|| "temporarily denied".to_string()),
            )),
            close: false,
            denied: true,
        },
        HookResult::DenyHard(message) => Mapped {
            reply: Some(Reply::new(
                Code::Rejected,
                message.clone().unwrap_or_else(|| "denied".to_string()),
            )),
            close: true,
            denied: true,
        },
        HookResult::Done => Mapped {
            reply: None,
            close: false,
            denied: false,
        },
        // Never reaches the session: the dispatcher resolves suspensions.
        HookResult::Yield => Mapped {
            reply: Some(Reply::new(Code::ActionUnavailable, "internal error")),
            close: true,
            denied: true,
        },
    }
}
