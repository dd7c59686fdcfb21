//! SMTP command parsing. Commands are ASCII and case-insensitive; path
//! arguments follow the minimal RFC 5321 grammar in
//! `tollgate_common::address`.

use core::fmt::{self, Display, Formatter};

use tollgate_common::address::{self, Address};

/// ESMTP parameters trailing a MAIL FROM path (`KEY=VALUE` or bare flags).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailParams {
    pairs: Vec<(String, Option<String>)>,
}

impl MailParams {
    fn parse(rest: &str) -> Result<Self, String> {
        let mut pairs = Vec::new();
        for token in rest.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value.to_string())),
                None => (token, None),
            };
            let key = key.to_ascii_uppercase();
            if pairs.iter().any(|(k, _)| *k == key) {
                return Err(format!("duplicate parameter {key}"));
            }
            if key == "SIZE" {
                let valid = value
                    .as_deref()
                    .is_some_and(|v| v.parse::<usize>().is_ok_and(|n| n > 0));
                if !valid {
                    return Err(format!("invalid SIZE value in {token}"));
                }
            }
            pairs.push((key, value));
        }
        Ok(Self { pairs })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, v)| v.as_deref())
    }

    /// Declared message size (RFC 1870), when the client sent one.
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE")?.parse().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    /// `None` is the null reverse-path `<>` used by bounces and probes.
    MailFrom(Option<Address>, MailParams),
    RcptTo(Address),
    Data,
    Rset,
    Noop,
    Quit,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// Verb we do not implement; the `unrecognized_command` hook decides.
    Unrecognized(String),
}

/// A recognised verb with an argument we could not parse. Maps to 501.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadArgument(pub String);

impl Display for BadArgument {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, BadArgument> {
        let trimmed = line.trim();

        let bytes = trimmed.as_bytes();

        if bytes.len() >= 10 && bytes[..10].eq_ignore_ascii_case(b"MAIL FROM:") {
            let rest = trimmed[10..].trim_start();
            let (path, params) = split_path_and_params(rest);
            let sender = address::parse_reverse_path(path)
                .map_err(|err| BadArgument(format!("could not parse sender: {err}")))?;
            let params = MailParams::parse(params).map_err(BadArgument)?;
            return Ok(Self::MailFrom(sender, params));
        }

        if bytes.len() >= 8 && bytes[..8].eq_ignore_ascii_case(b"RCPT TO:") {
            let rest = trimmed[8..].trim_start();
            let (path, _params) = split_path_and_params(rest);
            let rcpt = address::parse_forward_path(path)
                .map_err(|err| BadArgument(format!("could not parse recipient: {err}")))?;
            return Ok(Self::RcptTo(rcpt));
        }

        let mut words = trimmed.split_whitespace();
        let verb = words.next().unwrap_or_default();

        if verb.eq_ignore_ascii_case("HELO") || verb.eq_ignore_ascii_case("EHLO") {
            let host = words.next().unwrap_or_default().to_string();
            if host.is_empty() {
                return Err(BadArgument("hostname required".to_string()));
            }
            return Ok(if verb.eq_ignore_ascii_case("EHLO") {
                Self::Ehlo(host)
            } else {
                Self::Helo(host)
            });
        }

        if verb.eq_ignore_ascii_case("AUTH") {
            let Some(mechanism) = words.next() else {
                return Err(BadArgument("authentication mechanism required".to_string()));
            };
            return Ok(Self::Auth {
                mechanism: mechanism.to_ascii_uppercase(),
                initial: words.next().map(str::to_string),
            });
        }

        if verb.eq_ignore_ascii_case("DATA") {
            Ok(Self::Data)
        } else if verb.eq_ignore_ascii_case("RSET") {
            Ok(Self::Rset)
        } else if verb.eq_ignore_ascii_case("NOOP") {
            Ok(Self::Noop)
        } else if verb.eq_ignore_ascii_case("QUIT") {
            Ok(Self::Quit)
        } else {
            Ok(Self::Unrecognized(trimmed.to_string()))
        }
    }

    /// The verb, for logging.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Helo(_) => "HELO",
            Self::Ehlo(_) => "EHLO",
            Self::MailFrom(..) => "MAIL",
            Self::RcptTo(_) => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::Auth { .. } => "AUTH",
            Self::Unrecognized(_) => "?",
        }
    }
}

/// Split `<path> key=value ...` on the first whitespace after the path.
fn split_path_and_params(rest: &str) -> (&str, &str) {
    // The path may contain spaces only inside a quoted local part; none of
    // the clients this daemon fronts produce those, so first-space is right.
    match rest.split_once(char::is_whitespace) {
        Some((path, params)) => (path, params),
        None => (rest, ""),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Every upper/lower casing of a verb.
    fn string_casing(string: &str) -> impl Iterator<Item = String> + '_ {
        let len = string.len();
        let cases = usize::pow(2, u32::try_from(len).unwrap_or(0));
        (0..cases).map(move |i| {
            string
                .chars()
                .enumerate()
                .map(|(idx, c)| {
                    if (i >> idx) & 1 == 0 {
                        c.to_ascii_lowercase()
                    } else {
                        c.to_ascii_uppercase()
                    }
                })
                .collect()
        })
    }

    #[test]
    fn mail_from_variants() {
        let cmd = Command::parse("MAIL FROM:<a@b.example>").unwrap();
        assert!(matches!(cmd, Command::MailFrom(Some(_), _)));

        let cmd = Command::parse("MAIL FROM:<>").unwrap();
        assert!(matches!(cmd, Command::MailFrom(None, _)));

        let cmd = Command::parse("mail from: <a@b.example> SIZE=1000 BODY=8BITMIME").unwrap();
        if let Command::MailFrom(Some(addr), params) = cmd {
            assert_eq!(addr.formatted(), "<a@b.example>");
            assert_eq!(params.size(), Some(1000));
            assert_eq!(params.get("body"), Some("8BITMIME"));
        } else {
            panic!("expected MailFrom");
        }

        assert!(Command::parse("MAIL FROM:<not an address>").is_err());
        assert!(Command::parse("MAIL FROM:<a@b.example> SIZE=0").is_err());
        assert!(Command::parse("MAIL FROM:<a@b.example> SIZE=x").is_err());
        assert!(Command::parse("MAIL FROM:<a@b.example> SIZE=1 SIZE=2").is_err());
    }

    #[test]
    fn rcpt_to_variants() {
        let cmd = Command::parse("RCPT TO:<c@d.example>").unwrap();
        assert!(matches!(cmd, Command::RcptTo(_)));
        assert!(Command::parse("RCPT TO:<>").is_err());
        assert!(Command::parse("RCPT TO:").is_err());
    }

    #[test]
    fn helo_requires_hostname() {
        assert_eq!(
            Command::parse("HELO mx.example").unwrap(),
            Command::Helo("mx.example".to_string())
        );
        assert_eq!(
            Command::parse("EHLO mx.example").unwrap(),
            Command::Ehlo("mx.example".to_string())
        );
        assert!(Command::parse("EHLO").is_err());
    }

    #[test]
    fn auth_mechanism_uppercased() {
        let cmd = Command::parse("auth cram-md5").unwrap();
        assert_eq!(
            cmd,
            Command::Auth {
                mechanism: "CRAM-MD5".to_string(),
                initial: None
            }
        );

        let cmd = Command::parse("AUTH PLAIN AGFsaWNlAHNlc2FtZQ==").unwrap();
        assert_eq!(
            cmd,
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: Some("AGFsaWNlAHNlc2FtZQ==".to_string())
            }
        );

        assert!(Command::parse("AUTH").is_err());
    }

    #[test]
    fn casing_is_irrelevant() {
        for cmd in string_casing("quit") {
            assert_eq!(Command::parse(&cmd).unwrap(), Command::Quit);
        }
        for cmd in string_casing("noop") {
            assert_eq!(Command::parse(&cmd).unwrap(), Command::Noop);
        }
        for cmd in string_casing("rset") {
            assert_eq!(Command::parse(&cmd).unwrap(), Command::Rset);
        }
        for cmd in string_casing("data") {
            assert_eq!(Command::parse(&cmd).unwrap(), Command::Data);
        }
    }

    #[test]
    fn unknown_verbs_are_unrecognized_not_errors() {
        assert_eq!(
            Command::parse("VRFY root").unwrap(),
            Command::Unrecognized("VRFY root".to_string())
        );
        assert_eq!(
            Command::parse("XDEBUG").unwrap(),
            Command::Unrecognized("XDEBUG".to_string())
        );
    }
}
