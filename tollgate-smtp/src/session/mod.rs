//! Per-connection session driver.
//!
//! A session is strictly serial: one command is read, its hook chain runs to
//! a result (suspending over DNS work when a handler yields), exactly one
//! reply is flushed, and only then is the next command read.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use tollgate_common::{
    address::{format_sender, Address},
    connection::Connection,
    error::SessionError,
    reply::{Code, Reply},
    transaction::Transaction,
    Signal,
};
use tollgate_hooks::{Hook, HookContext, HookResult};

use crate::command::{Command, MailParams};
use crate::state::State;
use crate::{Smtp, MAX_COMMAND_LINE};

mod auth;
mod io;
mod response;

use response::map_result;

/// Session-level tunables read from the config oracle.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// Name in the banner and HELO replies (`me` key; hostname fallback).
    pub banner: String,
    /// Seconds of client silence before the 421 (`idle_timeout` key).
    pub idle_timeout_secs: u64,
    /// Transaction size cap in bytes, 0 = unlimited (`databytes` key).
    pub databytes: usize,
}

impl SmtpConfig {
    pub fn from_config(config: &tollgate_common::config::Config) -> Self {
        let fallback =
            || std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            banner: {
                let me = config.get_one("me", "");
                if me.is_empty() {
                    fallback()
                } else {
                    me
                }
            },
            idle_timeout_secs: config
                .get_one("idle_timeout", "300")
                .parse()
                .unwrap_or(300),
            databytes: config.get_one("databytes", "0").parse().unwrap_or(0),
        }
    }
}

pub struct Session<S: AsyncRead + AsyncWrite + Unpin + Send> {
    pub(crate) stream: S,
    pub(crate) read_buf: Vec<u8>,
    pub(crate) state: State,
    pub(crate) connection: Connection,
    pub(crate) transaction: Transaction,
    pub(crate) smtp: Arc<Smtp>,
    pub(crate) authenticated: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Session<S> {
    pub fn new(stream: S, peer: std::net::SocketAddr, smtp: Arc<Smtp>) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
            state: State::Connect,
            connection: Connection::new(peer),
            transaction: Transaction::new(),
            smtp,
            authenticated: false,
        }
    }

    async fn dispatch(&mut self, hook: Hook) -> HookResult {
        let smtp = Arc::clone(&self.smtp);
        let mut ctx = HookContext {
            connection: &mut self.connection,
            transaction: &mut self.transaction,
            server: smtp.server.as_ref(),
            config: smtp.config.as_ref(),
        };
        smtp.dispatcher.run(hook, &mut ctx).await
    }

    /// Drive the session to completion. The synthetic connect step runs
    /// first, so the very first thing on the wire is the connect hook's
    /// verdict (banner or refusal).
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        tracing::debug!(peer = %self.connection.peer(), "session start");

        let result = self.dispatch(Hook::Connect).await;
        let banner = Reply::new(
            Code::ServiceReady,
            format!("{} ESMTP", self.smtp.settings.banner),
        );
        let mapped = map_result(&result, banner);
        if let Some(reply) = &mapped.reply {
            self.send(reply).await?;
        }
        let open = !mapped.denied && !mapped.close;
        self.state = if open { State::Greeted } else { State::Closed };

        let outcome = if open {
            self.command_loop(&mut shutdown).await
        } else {
            Ok(())
        };

        let _ = self.dispatch(Hook::Disconnect).await;
        tracing::debug!(peer = %self.connection.peer(), "session end");
        outcome
    }

    async fn command_loop(
        &mut self,
        shutdown: &mut broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let idle = Duration::from_secs(self.smtp.settings.idle_timeout_secs);
        loop {
            let line = tokio::select! {
                _ = shutdown.recv() => {
                    let _ = self
                        .send(&Reply::new(Code::Unavailable, "Server shutting down"))
                        .await;
                    return Err(SessionError::Shutdown);
                }
                read = tokio::time::timeout(idle, self.read_line()) => match read {
                    Err(_) => {
                        let _ = self
                            .send(&Reply::new(Code::Unavailable, "Idle timeout, closing connection"))
                            .await;
                        return Err(SessionError::Timeout(idle.as_secs()));
                    }
                    Ok(Ok(None)) => return Ok(()),
                    Ok(Ok(Some(line))) => line,
                    Ok(Err(err)) => return Err(err),
                },
            };

            if line.len() > MAX_COMMAND_LINE {
                self.send(&Reply::new(Code::SyntaxError, "Line too long"))
                    .await?;
                continue;
            }

            let text = String::from_utf8_lossy(&line).to_string();
            tracing::trace!(peer = %self.connection.peer(), line = %text, "recv");

            if self.handle_command(&text).await? {
                return Ok(());
            }
        }
    }

    /// Returns `true` when the connection should close.
    async fn handle_command(&mut self, line: &str) -> Result<bool, SessionError> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(bad) => {
                self.send(&Reply::new(Code::ParameterError, bad.to_string()))
                    .await?;
                return Ok(false);
            }
        };

        // Sequencing is validated up front; the handlers below only see
        // commands that are legal in the current state.
        if let Err(bad) = self.state.transition(&command, &self.transaction) {
            self.send(&Reply::new(Code::BadSequence, bad.0)).await?;
            return Ok(false);
        }

        match command {
            Command::Helo(host) => self.helo(host, false).await,
            Command::Ehlo(host) => self.helo(host, true).await,
            Command::MailFrom(sender, params) => self.mail(sender, params).await,
            Command::RcptTo(rcpt) => self.rcpt(rcpt).await,
            Command::Data => self.data().await,
            Command::Rset => self.rset().await,
            Command::Noop => {
                self.send(&Reply::new(Code::Ok, "OK")).await?;
                Ok(false)
            }
            Command::Quit => self.quit().await,
            Command::Auth { mechanism, initial } => self.auth(&mechanism, initial).await,
            Command::Unrecognized(raw) => self.unrecognized(&raw).await,
        }
    }

    async fn helo(&mut self, host: String, extended: bool) -> Result<bool, SessionError> {
        self.connection.hello = Some(host.clone());
        self.transaction = Transaction::new();

        let hook = if extended { Hook::Ehlo } else { Hook::Helo };
        let result = self.dispatch(hook).await;

        let greeting = format!(
            "{} Hi {} [{}]",
            self.smtp.settings.banner,
            host,
            self.connection.remote_ip()
        );
        let default = if extended {
            Reply::multi(Code::Ok, self.capabilities(greeting))
        } else {
            Reply::new(Code::Ok, greeting)
        };

        let mapped = map_result(&result, default);
        if let Some(reply) = &mapped.reply {
            self.send(reply).await?;
        }
        Ok(mapped.close)
    }

    /// EHLO capability lines. AUTH is only advertised when a plugin actually
    /// handles the mechanism hooks.
    fn capabilities(&self, greeting: String) -> Vec<String> {
        let mut lines = vec![greeting, "PIPELINING".to_string(), "8BITMIME".to_string()];
        if self.smtp.settings.databytes > 0 {
            lines.push(format!("SIZE {}", self.smtp.settings.databytes));
        }
        if self.smtp.dispatcher.registry().has_handlers(Hook::AuthPlain) {
            lines.push("AUTH PLAIN LOGIN CRAM-MD5".to_string());
        }
        lines
    }

    async fn mail(
        &mut self,
        sender: Option<Address>,
        params: MailParams,
    ) -> Result<bool, SessionError> {
        let databytes = self.smtp.settings.databytes;
        if databytes > 0 {
            if let Some(declared) = params.size() {
                if declared > databytes {
                    self.send(&Reply::new(
                        Code::ExceededStorage,
                        format!("declared size {declared} exceeds limit {databytes}"),
                    ))
                    .await?;
                    return Ok(false);
                }
            }
        }

        self.transaction = Transaction::new();
        self.transaction.set_sender(sender);

        let result = self.dispatch(Hook::Mail).await;
        let default = Reply::new(
            Code::Ok,
            format!("{}, sender OK", format_sender(self.transaction.sender())),
        );
        let mapped = map_result(&result, default);

        if mapped.denied {
            self.transaction = Transaction::new();
        } else {
            self.state = State::MailRcpt;
        }
        if let Some(reply) = &mapped.reply {
            self.send(reply).await?;
        }
        Ok(mapped.close)
    }

    async fn rcpt(&mut self, rcpt: Address) -> Result<bool, SessionError> {
        let formatted = rcpt.formatted();
        self.transaction.add_recipient(rcpt);

        let result = self.dispatch(Hook::Rcpt).await;
        let default = Reply::new(Code::Ok, format!("{formatted}, recipient ok"));
        let mapped = map_result(&result, default);

        if mapped.denied {
            self.transaction.pop_recipient();
        }
        if let Some(reply) = &mapped.reply {
            self.send(reply).await?;
        }
        Ok(mapped.close)
    }

    async fn data(&mut self) -> Result<bool, SessionError> {
        let result = self.dispatch(Hook::Data).await;
        let mapped = map_result(
            &result,
            Reply::new(Code::StartMailInput, "go ahead, end with <CRLF>.<CRLF>"),
        );

        if mapped.denied || matches!(result, HookResult::Done) {
            if let Some(reply) = &mapped.reply {
                self.send(reply).await?;
            }
            return Ok(mapped.close);
        }

        if let Some(reply) = &mapped.reply {
            self.send(reply).await?;
        }
        self.state = State::Reading;

        let overflow = match self.read_body().await? {
            // EOF mid-body: nothing sensible left to say.
            None => return Ok(true),
            Some(overflow) => overflow,
        };

        self.state = State::Greeted;
        if overflow {
            self.transaction = Transaction::new();
            self.send(&Reply::new(
                Code::ExceededStorage,
                format!(
                    "message size exceeds fixed maximum of {} bytes",
                    self.smtp.settings.databytes
                ),
            ))
            .await?;
            return Ok(false);
        }

        tracing::debug!(
            peer = %self.connection.peer(),
            size = self.transaction.data_size(),
            "message received"
        );

        let result = self.dispatch(Hook::DataPost).await;
        let mapped = map_result(&result, Reply::new(Code::Ok, "Queued"));
        if let Some(reply) = &mapped.reply {
            self.send(reply).await?;
        }
        self.transaction = Transaction::new();
        Ok(mapped.close)
    }

    /// Read dot-stuffed body lines into the transaction until the lone dot.
    /// `Some(true)` means the databytes cap was blown (body discarded past
    /// the cap, terminator still consumed).
    async fn read_body(&mut self) -> Result<Option<bool>, SessionError> {
        let idle = Duration::from_secs(self.smtp.settings.idle_timeout_secs);
        let limit = self.smtp.settings.databytes;
        let mut overflow = false;

        loop {
            let line = match tokio::time::timeout(idle, self.read_line()).await {
                Err(_) => {
                    let _ = self
                        .send(&Reply::new(Code::Unavailable, "Idle timeout, closing connection"))
                        .await;
                    return Err(SessionError::Timeout(idle.as_secs()));
                }
                Ok(Ok(None)) => return Ok(None),
                Ok(Ok(Some(line))) => line,
                Ok(Err(err)) => return Err(err),
            };

            if line == b"." {
                return Ok(Some(overflow));
            }

            let content = line.strip_prefix(b".").unwrap_or(&line);
            if overflow {
                continue;
            }
            if limit > 0 && self.transaction.data_size() + content.len() + 2 > limit {
                overflow = true;
                continue;
            }
            self.transaction.append_body(content);
            self.transaction.append_body(b"\r\n");
        }
    }

    async fn rset(&mut self) -> Result<bool, SessionError> {
        let result = self.dispatch(Hook::ResetTransaction).await;
        self.transaction = Transaction::new();
        self.state = State::Greeted;

        let mapped = map_result(&result, Reply::new(Code::Ok, "OK"));
        if let Some(reply) = &mapped.reply {
            self.send(reply).await?;
        }
        Ok(mapped.close)
    }

    async fn quit(&mut self) -> Result<bool, SessionError> {
        let result = self.dispatch(Hook::Quit).await;
        let default = Reply::new(
            Code::GoodBye,
            format!("{} closing connection", self.smtp.settings.banner),
        );
        let mapped = map_result(&result, default);
        if let Some(reply) = &mapped.reply {
            self.send(reply).await?;
        }
        self.state = State::Closed;
        Ok(true)
    }

    async fn unrecognized(&mut self, raw: &str) -> Result<bool, SessionError> {
        tracing::debug!(peer = %self.connection.peer(), command = raw, "unrecognized command");
        let result = self.dispatch(Hook::UnrecognizedCommand).await;
        let mapped = map_result(&result, Reply::new(Code::SyntaxError, "Unrecognized command"));
        if let Some(reply) = &mapped.reply {
            self.send(reply).await?;
        }
        Ok(mapped.close)
    }
}
