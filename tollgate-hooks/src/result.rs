//! The tagged result a handler returns to the dispatcher.

/// Outcome of one handler invocation. Semantics are fixed:
///
/// * `Ok`: terminal; the session writes the hook's success reply.
/// * `Deny`: terminal; 550.
/// * `DenySoft`: terminal; 451, client should retry.
/// * `DenyHard`: terminal; 550 and the connection is closed.
/// * `Declined`: this handler passes; the chain continues, and if every
///   handler declines the hook's built-in default applies.
/// * `Done`: terminal; the handler already produced the reply itself, the
///   session writes nothing.
/// * `Yield`: the handler started asynchronous work registered on the
///   hook's [`Suspension`](crate::Suspension); the chain parks until all of
///   it completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult {
    Ok(Option<String>),
    Deny(Option<String>),
    DenySoft(Option<String>),
    DenyHard(Option<String>),
    Declined,
    Done,
    Yield,
}

impl HookResult {
    pub fn ok() -> Self {
        Self::Ok(None)
    }

    pub fn deny(msg: impl Into<String>) -> Self {
        Self::Deny(Some(msg.into()))
    }

    pub fn deny_soft(msg: impl Into<String>) -> Self {
        Self::DenySoft(Some(msg.into()))
    }

    pub fn deny_hard(msg: impl Into<String>) -> Self {
        Self::DenyHard(Some(msg.into()))
    }

    /// True for every variant that stops the handler chain.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Declined | Self::Yield)
    }

    /// Attached human-readable message, when the variant carries one.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Ok(m) | Self::Deny(m) | Self::DenySoft(m) | Self::DenyHard(m) => m.as_deref(),
            Self::Declined | Self::Done | Self::Yield => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::HookResult;

    #[test]
    fn terminality() {
        assert!(HookResult::ok().is_terminal());
        assert!(HookResult::deny("no").is_terminal());
        assert!(HookResult::Done.is_terminal());
        assert!(!HookResult::Declined.is_terminal());
        assert!(!HookResult::Yield.is_terminal());
    }

    #[test]
    fn messages() {
        assert_eq!(HookResult::deny_soft("later").message(), Some("later"));
        assert_eq!(HookResult::Ok(None).message(), None);
        assert_eq!(HookResult::Declined.message(), None);
    }
}
