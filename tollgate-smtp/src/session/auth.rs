//! AUTH command dialogues (PLAIN, LOGIN, CRAM-MD5).
//!
//! The session owns the socket, so the base64 challenge/response exchanges
//! happen here; the collected material lands in transaction notes and the
//! `auth` / `auth-<mech>` hook chains do the verifying. On success the
//! connection becomes a relay client.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncWrite};

use tollgate_common::{
    error::SessionError,
    notes::keys,
    reply::{Code, Reply},
};
use tollgate_hooks::{Hook, HookResult};

use super::Session;

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Session<S> {
    pub(super) async fn auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<bool, SessionError> {
        if self.authenticated {
            self.send(&Reply::new(Code::BadSequence, "already authenticated"))
                .await?;
            return Ok(false);
        }

        let collected = match mechanism {
            "PLAIN" => self.auth_plain(initial).await?,
            "LOGIN" => self.auth_login(initial).await?,
            "CRAM-MD5" => self.auth_cram_md5().await?,
            _ => {
                self.send(&Reply::new(
                    Code::ParameterNotImplemented,
                    format!("Unimplemented authentication mechanism {mechanism}"),
                ))
                .await?;
                return Ok(false);
            }
        };

        if !collected {
            // The dialogue already sent its 501/cancel reply.
            return Ok(false);
        }

        let mech_hook = match mechanism {
            "PLAIN" => Hook::AuthPlain,
            "LOGIN" => Hook::AuthLogin,
            _ => Hook::AuthCramMd5,
        };

        let mut result = self.dispatch(Hook::Auth).await;
        if result == HookResult::Declined {
            result = self.dispatch(mech_hook).await;
        }

        self.scrub_auth_notes();

        let close = match result {
            HookResult::Ok(message) => {
                self.authenticated = true;
                self.connection.relay_client = true;
                self.send(&Reply::new(
                    Code::AuthSuccessful,
                    message.unwrap_or_else(|| "Authentication successful".to_string()),
                ))
                .await?;
                false
            }
            HookResult::Done => false,
            HookResult::DenyHard(message) => {
                self.send(&Reply::new(
                    Code::AuthFailed,
                    message.unwrap_or_else(|| "Authentication failed".to_string()),
                ))
                .await?;
                true
            }
            HookResult::DenySoft(message) => {
                self.send(&Reply::new(
                    Code::ActionUnavailable,
                    message.unwrap_or_else(|| "Temporary authentication failure".to_string()),
                ))
                .await?;
                false
            }
            _ => {
                self.send(&Reply::new(Code::AuthFailed, "Authentication failed"))
                    .await?;
                false
            }
        };
        Ok(close)
    }

    /// RFC 4616: a single base64 blob of `authzid NUL authcid NUL passwd`.
    async fn auth_plain(&mut self, initial: Option<String>) -> Result<bool, SessionError> {
        let blob = match initial {
            Some(blob) => blob,
            None => match self.challenge("").await? {
                Some(response) => response,
                None => return Ok(false),
            },
        };

        let Ok(decoded) = BASE64.decode(blob.as_bytes()) else {
            self.send(&Reply::new(Code::ParameterError, "Invalid base64"))
                .await?;
            return Ok(false);
        };
        let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
        if parts.len() != 3 {
            self.send(&Reply::new(Code::ParameterError, "Invalid AUTH PLAIN response"))
                .await?;
            return Ok(false);
        }

        let user = String::from_utf8_lossy(parts[1]).to_string();
        let pass = String::from_utf8_lossy(parts[2]).to_string();
        self.set_auth_note(keys::AUTH_USER, user);
        self.set_auth_note(keys::AUTH_PASS, pass);
        Ok(true)
    }

    /// Two prompted base64 lines: username, then password.
    async fn auth_login(&mut self, initial: Option<String>) -> Result<bool, SessionError> {
        let user_b64 = match initial {
            Some(blob) => blob,
            None => match self.challenge("Username:").await? {
                Some(response) => response,
                None => return Ok(false),
            },
        };
        let pass_b64 = match self.challenge("Password:").await? {
            Some(response) => response,
            None => return Ok(false),
        };

        let (Ok(user), Ok(pass)) = (
            BASE64.decode(user_b64.as_bytes()),
            BASE64.decode(pass_b64.as_bytes()),
        ) else {
            self.send(&Reply::new(Code::ParameterError, "Invalid base64"))
                .await?;
            return Ok(false);
        };

        self.set_auth_note(keys::AUTH_USER, String::from_utf8_lossy(&user).to_string());
        self.set_auth_note(keys::AUTH_PASS, String::from_utf8_lossy(&pass).to_string());
        Ok(true)
    }

    /// RFC 2195: challenge is a base64 ticket, response is
    /// `user SP hmac-md5-hex(ticket, secret)`.
    async fn auth_cram_md5(&mut self) -> Result<bool, SessionError> {
        let ticket = format!(
            "<{}@{}>",
            uuid::Uuid::new_v4().simple(),
            self.smtp.settings.banner
        );
        let challenge = BASE64.encode(ticket.as_bytes());
        self.send(&Reply::new(Code::AuthContinue, challenge)).await?;

        let Some(response) = self.read_auth_line().await? else {
            return Ok(false);
        };
        let Ok(decoded) = BASE64.decode(response.as_bytes()) else {
            self.send(&Reply::new(Code::ParameterError, "Invalid base64"))
                .await?;
            return Ok(false);
        };
        let decoded = String::from_utf8_lossy(&decoded).to_string();
        let Some((user, digest)) = decoded.split_once(' ') else {
            self.send(&Reply::new(Code::ParameterError, "Invalid CRAM-MD5 response"))
                .await?;
            return Ok(false);
        };

        self.set_auth_note(keys::AUTH_USER, user.to_string());
        self.set_auth_note(keys::AUTH_TICKET, ticket);
        self.set_auth_note(keys::AUTH_RESPONSE, digest.to_string());
        Ok(true)
    }

    /// Send a 334 prompt and read the client's line. `None` when the client
    /// cancelled with `*` (the 501 has been sent).
    async fn challenge(&mut self, prompt: &str) -> Result<Option<String>, SessionError> {
        let encoded = BASE64.encode(prompt.as_bytes());
        self.send(&Reply::new(Code::AuthContinue, encoded)).await?;
        self.read_auth_line().await
    }

    async fn read_auth_line(&mut self) -> Result<Option<String>, SessionError> {
        let idle = std::time::Duration::from_secs(self.smtp.settings.idle_timeout_secs);
        let line = match tokio::time::timeout(idle, self.read_line()).await {
            Err(_) => return Err(SessionError::Timeout(idle.as_secs())),
            Ok(Ok(None)) => return Err(SessionError::Cancelled),
            Ok(Ok(Some(line))) => line,
            Ok(Err(err)) => return Err(err),
        };
        let text = String::from_utf8_lossy(&line).trim().to_string();
        if text == "*" {
            self.send(&Reply::new(Code::ParameterError, "Authentication cancelled"))
                .await?;
            return Ok(None);
        }
        Ok(Some(text))
    }

    /// Auth notes may be rewritten on a later attempt in the same
    /// transaction, so clear before setting.
    fn set_auth_note(&mut self, key: &str, value: String) {
        self.transaction.notes.remove(key);
        self.transaction.notes.set(key, value);
    }

    fn scrub_auth_notes(&mut self) {
        for key in [
            keys::AUTH_USER,
            keys::AUTH_PASS,
            keys::AUTH_TICKET,
            keys::AUTH_RESPONSE,
        ] {
            self.transaction.notes.remove(key);
        }
    }
}
