//! SMTP AUTH verification (PLAIN, LOGIN, CRAM-MD5).
//!
//! The session conducts the challenge/response dialogue (only it can read
//! continuation lines) and stores the collected material in transaction
//! notes before dispatching the `auth-*` hooks; this plugin only verifies.
//! Notes consumed: `auth.user`, `auth.pass` (PLAIN/LOGIN), `auth.ticket` +
//! `auth.response` (CRAM-MD5). On success the session sets `relay_client`.
//!
//! Credential backends (SQL, LDAP, checkpassword) are external; the core
//! consumes them through [`CredentialStore`]. The bundled implementation
//! reads the `auth_users` config key (`user secret` per line), which is all
//! the test rig needs.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use md5::Md5;

use tollgate_common::config::Config;
use tollgate_hooks::{Hook, HookContext, HookResult, Plugin, PluginError, Suspension};

pub use tollgate_common::notes::keys::{
    AUTH_PASS as NOTE_PASS, AUTH_RESPONSE as NOTE_RESPONSE, AUTH_TICKET as NOTE_TICKET,
    AUTH_USER as NOTE_USER,
};

/// Secret lookup seam for authentication backends.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The shared secret for `user`, or `None` when unknown.
    async fn secret(&self, user: &str) -> Option<String>;
}

pub struct FlatFileCredentials {
    users: Vec<(String, String)>,
}

impl FlatFileCredentials {
    pub fn from_config(config: &Config) -> Self {
        let users = config
            .get("auth_users")
            .iter()
            .filter_map(|line| {
                line.split_once(char::is_whitespace)
                    .map(|(user, secret)| (user.to_string(), secret.trim().to_string()))
            })
            .collect();
        Self { users }
    }
}

#[async_trait]
impl CredentialStore for FlatFileCredentials {
    async fn secret(&self, user: &str) -> Option<String> {
        self.users
            .iter()
            .find(|(name, _)| name == user)
            .map(|(_, secret)| secret.clone())
    }
}

/// Compute the CRAM-MD5 digest for a challenge ticket: lowercase hex of
/// HMAC-MD5(secret, ticket).
pub fn cram_md5_digest(ticket: &str, secret: &str) -> String {
    let mut mac =
        Hmac::<Md5>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(ticket.as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut hex = String::with_capacity(32);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Constant-time-ish comparison; both sides are fixed-length hex here, so a
/// simple fold over the bytes is enough to avoid early exit.
fn eq_no_early_exit(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub struct Auth {
    store: Arc<dyn CredentialStore>,
}

impl Auth {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    async fn check_password(&self, ctx: &HookContext<'_>) -> HookResult {
        let (Some(user), Some(pass)) = (
            ctx.transaction.notes.get(NOTE_USER),
            ctx.transaction.notes.get(NOTE_PASS),
        ) else {
            return HookResult::Declined;
        };

        match self.store.secret(user).await {
            Some(secret) if eq_no_early_exit(&secret, pass) => {
                tracing::info!(user, "authentication succeeded");
                HookResult::Ok(Some(format!("Authentication successful for {user}")))
            }
            _ => {
                tracing::info!(user, "authentication failed");
                HookResult::Declined
            }
        }
    }

    async fn check_cram(&self, ctx: &HookContext<'_>) -> HookResult {
        let (Some(user), Some(ticket), Some(response)) = (
            ctx.transaction.notes.get(NOTE_USER),
            ctx.transaction.notes.get(NOTE_TICKET),
            ctx.transaction.notes.get(NOTE_RESPONSE),
        ) else {
            return HookResult::Declined;
        };

        match self.store.secret(user).await {
            Some(secret)
                if eq_no_early_exit(&cram_md5_digest(ticket, &secret), response) =>
            {
                tracing::info!(user, "authentication succeeded");
                HookResult::Ok(Some(format!("Authentication successful for {user}")))
            }
            _ => {
                tracing::info!(user, "authentication failed");
                HookResult::Declined
            }
        }
    }
}

#[async_trait]
impl Plugin for Auth {
    fn name(&self) -> &'static str {
        "auth_flat_file"
    }

    fn hooks(&self) -> &'static [Hook] {
        &[Hook::Auth, Hook::AuthPlain, Hook::AuthLogin, Hook::AuthCramMd5]
    }

    async fn run(
        &self,
        hook: Hook,
        ctx: &mut HookContext<'_>,
        _ops: &Arc<Suspension>,
    ) -> Result<HookResult, PluginError> {
        Ok(match hook {
            Hook::AuthPlain | Hook::AuthLogin => self.check_password(ctx).await,
            Hook::AuthCramMd5 => self.check_cram(ctx).await,
            // The generic auth hook is advisory; verification happens on the
            // mechanism hooks.
            _ => HookResult::Declined,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tollgate_common::{
        connection::Connection, state::ServerState, transaction::Transaction,
    };

    fn store() -> Arc<dyn CredentialStore> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("auth_users"), "alice sesame\nbob hunter2\n").unwrap();
        let config = Config::new(dir.path());
        Arc::new(FlatFileCredentials::from_config(&config))
    }

    async fn run_auth(hook: Hook, notes: &[(&str, &str)]) -> HookResult {
        let registry = Arc::new(
            tollgate_hooks::Registry::builder()
                .register(Arc::new(Auth::new(store())))
                .build(),
        );
        let mut conn = Connection::new("203.0.113.1:1234".parse().unwrap());
        let mut tx = Transaction::new();
        for (k, v) in notes {
            tx.notes.set(*k, *v);
        }
        let state = ServerState::new();
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut tx,
            server: &state,
            config: &config,
        };
        tollgate_hooks::Dispatcher::new(registry)
            .run(hook, &mut ctx)
            .await
    }

    #[tokio::test]
    async fn plain_accepts_good_credentials() {
        let result = run_auth(
            Hook::AuthPlain,
            &[(NOTE_USER, "alice"), (NOTE_PASS, "sesame")],
        )
        .await;
        assert!(matches!(result, HookResult::Ok(_)));
    }

    #[tokio::test]
    async fn plain_declines_bad_password_and_unknown_user() {
        assert_eq!(
            run_auth(Hook::AuthPlain, &[(NOTE_USER, "alice"), (NOTE_PASS, "wrong")]).await,
            HookResult::Declined
        );
        assert_eq!(
            run_auth(Hook::AuthPlain, &[(NOTE_USER, "mallory"), (NOTE_PASS, "x")]).await,
            HookResult::Declined
        );
    }

    #[tokio::test]
    async fn cram_md5_verifies_digest() {
        let ticket = "<1896.697170952@postoffice.example>";
        let good = cram_md5_digest(ticket, "hunter2");

        let result = run_auth(
            Hook::AuthCramMd5,
            &[
                (NOTE_USER, "bob"),
                (NOTE_TICKET, ticket),
                (NOTE_RESPONSE, good.as_str()),
            ],
        )
        .await;
        assert!(matches!(result, HookResult::Ok(_)));

        let result = run_auth(
            Hook::AuthCramMd5,
            &[
                (NOTE_USER, "bob"),
                (NOTE_TICKET, ticket),
                (NOTE_RESPONSE, "deadbeef"),
            ],
        )
        .await;
        assert_eq!(result, HookResult::Declined);
    }

    #[test]
    fn digest_matches_rfc2195_example() {
        // RFC 2195 section 2: tim / tanstaaftanstaaf
        let digest = cram_md5_digest(
            "<1896.697170952@postoffice.reston.mci.net>",
            "tanstaaftanstaaf",
        );
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }
}
