//! The protocol state machine. Transitions are pure: sequencing violations
//! come back as values the session turns into 503 replies.

use core::fmt::{self, Display, Formatter};

use tollgate_common::transaction::Transaction;

use crate::command::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// Socket accepted; the synthetic connect step has not finished.
    #[default]
    Connect,
    /// Banner sent; between transactions.
    Greeted,
    /// Inside an envelope: sender set, recipients accumulating.
    MailRcpt,
    /// Between the 354 and the final dot.
    Reading,
    /// QUIT, DENYHARD, or error; no further commands.
    Closed,
}

/// A command arriving in the wrong state. Carries the 503 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadSequence(pub &'static str);

impl Display for BadSequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl State {
    /// Where `command` takes the session from `self`. `tx` supplies the
    /// envelope facts the table needs (recipient count).
    pub fn transition(self, command: &Command, tx: &Transaction) -> Result<State, BadSequence> {
        match (self, command) {
            (State::Closed, _) => Err(BadSequence("connection is closing")),
            (State::Reading, _) => Err(BadSequence("currently reading message data")),

            (_, Command::Noop | Command::Unrecognized(_)) => Ok(self),
            (_, Command::Quit) => Ok(State::Closed),
            (_, Command::Rset) => Ok(State::Greeted),
            (_, Command::Auth { .. }) => Ok(self),

            (State::Greeted, Command::Helo(_) | Command::Ehlo(_)) => Ok(State::Greeted),
            (State::Connect | State::MailRcpt, Command::Helo(_) | Command::Ehlo(_)) => {
                Err(BadSequence("HELO not allowed here"))
            }

            (State::Greeted, Command::MailFrom(..)) => Ok(State::MailRcpt),
            (State::MailRcpt, Command::MailFrom(..)) => {
                Err(BadSequence("nested MAIL command"))
            }
            (State::Connect, Command::MailFrom(..)) => Err(BadSequence("send HELO first")),

            (State::MailRcpt, Command::RcptTo(_)) => Ok(State::MailRcpt),
            (_, Command::RcptTo(_)) => Err(BadSequence("MAIL first")),

            (State::MailRcpt, Command::Data) if !tx.recipients().is_empty() => {
                Ok(State::Reading)
            }
            (State::MailRcpt, Command::Data) => Err(BadSequence("RCPT first")),
            (_, Command::Data) => Err(BadSequence("MAIL first")),
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Connect => "connect",
            State::Greeted => "greeted",
            State::MailRcpt => "mail",
            State::Reading => "data",
            State::Closed => "closed",
        })
    }
}
