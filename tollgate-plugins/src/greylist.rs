//! Binds the hash greylist policy to the transaction lifecycle.
//!
//! Runs the ladder at `data_post`. Bounce probes (`<>` sender) are never
//! denied there: the decision is parked in a transaction note and would be
//! issued at the `data` hook of a transaction with a real sender; the note
//! dies with its transaction. Recipient whitelisting short-circuits both
//! hooks.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use tollgate_common::config::Config;
use tollgate_greylist::{fingerprint, Decision, Greylist, GreylistConfig, Mode};
use tollgate_hooks::{Hook, HookContext, HookResult, Plugin, PluginError, Suspension};

const NOTE_FINGERPRINT: &str = "greylist.fingerprint";
const NOTE_DEFERRED: &str = "greylist.deferred";
const DENY_MESSAGE: &str = "This mail is temporarily denied";

pub struct GreylistPlugin {
    greylist: Greylist,
}

impl GreylistPlugin {
    pub fn from_config(config: &Config, default_db_dir: &std::path::Path) -> Self {
        let pairs = config.get_pairs("hash_greylist");
        Self {
            greylist: Greylist::new(GreylistConfig::from_pairs(&pairs, default_db_dir)),
        }
    }

    pub fn with_config(cfg: GreylistConfig) -> Self {
        Self {
            greylist: Greylist::new(cfg),
        }
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64)
    }

    /// Every recipient carries a whitelist note: greylisting is bypassed
    /// even after a deferral note was set.
    fn all_recipients_whitelisted(ctx: &HookContext<'_>) -> bool {
        let recipients = ctx.transaction.recipients();
        !recipients.is_empty()
            && recipients.iter().all(|rcpt| {
                ctx.transaction
                    .notes
                    .contains(&format!("whitelist.rcpt.{}", rcpt.formatted()))
            })
    }

    fn data_post(&self, ctx: &mut HookContext<'_>) -> HookResult {
        let cfg = self.greylist.config();

        if ctx.connection.relay_client
            || ctx.connection.whitelist_host
            || ctx.transaction.notes.contains("whitelist.sender")
            || Self::all_recipients_whitelisted(ctx)
        {
            return HookResult::Declined;
        }
        if ctx.transaction.data_size() > cfg.max_size {
            tracing::debug!(
                size = ctx.transaction.data_size(),
                max = cfg.max_size,
                "message too large to greylist"
            );
            return HookResult::Declined;
        }

        let fprint = match ctx.transaction.notes.get(NOTE_FINGERPRINT) {
            Some(cached) => cached.to_string(),
            None => {
                ctx.transaction.body_reset();
                let fprint = fingerprint(ctx.transaction);
                ctx.transaction.notes.set(NOTE_FINGERPRINT, fprint.clone());
                fprint
            }
        };

        let decision =
            match self
                .greylist
                .check(Self::now(), &ctx.connection.remote_ip(), &fprint)
            {
                Ok(decision) => decision,
                Err(err) => {
                    // Fail open: a broken store must not hold up mail.
                    tracing::error!(%err, "greylist store unavailable");
                    return HookResult::Declined;
                }
            };

        match decision {
            Decision::Whitelisted | Decision::Promoted => return HookResult::Declined,
            Decision::FirstSeen | Decision::EarlyRetry(_) => ctx.server.rejected_black(),
            Decision::Overdue => ctx.server.rejected_white(),
        }

        // Off and testonly still walk the ladder above so the store keeps
        // sweeping and recording; only the deny itself is suppressed.
        match cfg.mode {
            Mode::Off => return HookResult::Declined,
            Mode::TestOnly => {
                tracing::info!(fingerprint = %fprint, ?decision, "testonly: would have denied");
                return HookResult::Declined;
            }
            Mode::DenySoft => {}
        }

        if ctx.transaction.sender().is_none() {
            // SMTP probes with the null sender pass; park the decision.
            ctx.transaction.notes.set(NOTE_DEFERRED, DENY_MESSAGE);
            return HookResult::Declined;
        }

        HookResult::deny_soft(DENY_MESSAGE)
    }

    fn data(&self, ctx: &mut HookContext<'_>) -> HookResult {
        if Self::all_recipients_whitelisted(ctx) {
            return HookResult::Declined;
        }
        match ctx.transaction.notes.get(NOTE_DEFERRED) {
            Some(message) if ctx.transaction.sender().is_some() => {
                HookResult::deny_soft(message.to_string())
            }
            _ => HookResult::Declined,
        }
    }
}

#[async_trait]
impl Plugin for GreylistPlugin {
    fn name(&self) -> &'static str {
        "hash_greylist"
    }

    fn hooks(&self) -> &'static [Hook] {
        &[Hook::Data, Hook::DataPost]
    }

    async fn run(
        &self,
        hook: Hook,
        ctx: &mut HookContext<'_>,
        _ops: &Arc<Suspension>,
    ) -> Result<HookResult, PluginError> {
        Ok(match hook {
            Hook::Data => self.data(ctx),
            Hook::DataPost => self.data_post(ctx),
            _ => HookResult::Declined,
        })
    }
}
