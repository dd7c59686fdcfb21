//! RFC 5321 path parsing for MAIL FROM / RCPT TO arguments.
//!
//! Implements the minimal grammar from RFC 5321 Section 4.1.2:
//!
//! ```text
//! Reverse-path = Path / "<>"
//! Forward-path = Path
//! Path         = "<" [ A-d-l ":" ] Mailbox ">"
//! Mailbox      = Local-part "@" Domain
//! ```
//!
//! Source routes (`<@relay1,@relay2:user@host>`) are accepted and discarded.
//! Bare `user@host` without angle brackets is tolerated because real clients
//! send it.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("path exceeds 256 octets")]
    PathTooLong,
    #[error("local part exceeds 64 octets")]
    LocalPartTooLong,
    #[error("missing '@' separator")]
    MissingAtSign,
    #[error("invalid character in local part: {0:?}")]
    InvalidLocalPart(String),
    #[error("invalid domain: {0:?}")]
    InvalidDomain(String),
}

/// A parsed SMTP path: local part plus domain.
///
/// The null reverse-path `<>` is represented as `Option<Address>::None` by
/// callers; an `Address` itself is always a real mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    local: String,
    host: String,
}

impl Address {
    pub fn new(local: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            host: host.into(),
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Canonical angle-bracket form, `<local@host>`.
    pub fn formatted(&self) -> String {
        format!("<{}@{}>", self.local, self.host)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.host)
    }
}

/// Render an optional sender the way reply lines and logs want it: `<>` for
/// the null sender, `<local@host>` otherwise.
pub fn format_sender(sender: Option<&Address>) -> String {
    sender.map_or_else(|| "<>".to_string(), Address::formatted)
}

/// Parse a MAIL FROM argument. `Ok(None)` is the null sender `<>`.
pub fn parse_reverse_path(input: &str) -> Result<Option<Address>, AddressError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }
    if trimmed.len() > 256 {
        return Err(AddressError::PathTooLong);
    }
    if trimmed == "<>" {
        return Ok(None);
    }
    parse_path(trimmed).map(Some)
}

/// Parse a RCPT TO argument. The null path is not a valid forward-path.
pub fn parse_forward_path(input: &str) -> Result<Address, AddressError> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "<>" {
        return Err(AddressError::Empty);
    }
    if trimmed.len() > 256 {
        return Err(AddressError::PathTooLong);
    }
    parse_path(trimmed)
}

fn parse_path(input: &str) -> Result<Address, AddressError> {
    let content = input
        .strip_prefix('<')
        .and_then(|rest| rest.strip_suffix('>'))
        .unwrap_or(input);

    // Discard a deprecated source route: everything up to the last ':' that
    // is outside an address literal.
    let mailbox = find_route_colon(content).map_or(content, |pos| &content[pos + 1..]);

    let (local, host) = mailbox.rsplit_once('@').ok_or(AddressError::MissingAtSign)?;

    if local.is_empty() {
        return Err(AddressError::InvalidLocalPart(local.to_string()));
    }
    if local.len() > 64 {
        return Err(AddressError::LocalPartTooLong);
    }
    if !local.bytes().all(is_local_byte) {
        return Err(AddressError::InvalidLocalPart(local.to_string()));
    }
    if host.is_empty() || !host.bytes().all(is_domain_byte) {
        return Err(AddressError::InvalidDomain(host.to_string()));
    }

    Ok(Address::new(local, host.to_ascii_lowercase()))
}

fn find_route_colon(input: &str) -> Option<usize> {
    let mut in_literal = false;
    let mut last = None;
    for (i, b) in input.bytes().enumerate() {
        match b {
            b'[' => in_literal = true,
            b']' => in_literal = false,
            b':' if !in_literal => last = Some(i),
            _ => {}
        }
    }
    last
}

fn is_local_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'/'
                | b'='
                | b'?'
                | b'^'
                | b'_'
                | b'`'
                | b'{'
                | b'|'
                | b'}'
                | b'~'
                | b'.'
                | b'"'
                | b' '
                | b'\\'
        )
}

fn is_domain_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'[' | b']' | b':')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn null_sender() {
        assert_eq!(parse_reverse_path("<>").unwrap(), None);
        assert!(parse_forward_path("<>").is_err());
    }

    #[test]
    fn simple_path() {
        let addr = parse_forward_path("<user@example.com>").unwrap();
        assert_eq!(addr.local(), "user");
        assert_eq!(addr.host(), "example.com");
        assert_eq!(addr.formatted(), "<user@example.com>");
    }

    #[test]
    fn bare_mailbox_tolerated() {
        let addr = parse_forward_path("user@example.com").unwrap();
        assert_eq!(addr.formatted(), "<user@example.com>");
    }

    #[test]
    fn domain_lowercased() {
        let addr = parse_forward_path("<User@EXAMPLE.Com>").unwrap();
        assert_eq!(addr.local(), "User");
        assert_eq!(addr.host(), "example.com");
    }

    #[test]
    fn source_route_discarded() {
        let addr = parse_forward_path("<@relay1.example,@relay2.example:user@example.com>")
            .unwrap();
        assert_eq!(addr.local(), "user");
        assert_eq!(addr.host(), "example.com");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_forward_path("").is_err());
        assert!(parse_forward_path("<user>").is_err());
        assert!(parse_forward_path("<@example.com>").is_err());
        assert!(parse_forward_path("<user@>").is_err());
        assert!(parse_reverse_path(&format!("<{}@x.y>", "a".repeat(300))).is_err());
    }

    #[test]
    fn formats_null_and_real_senders() {
        assert_eq!(format_sender(None), "<>");
        let addr = Address::new("a", "b.c");
        assert_eq!(format_sender(Some(&addr)), "<a@b.c>");
    }
}
