//! Static whitelist / relay-client lists.
//!
//! Sets the connection flags and notes the rest of the policy chain reads:
//! `relay_client`, `whitelist_host`, the `whitelist.sender` note, and one
//! `whitelist.rcpt.<addr>` note per whitelisted recipient. Always declines;
//! the decisions belong to the plugins that consume the flags.

use std::sync::Arc;

use async_trait::async_trait;

use tollgate_common::config::Config;
use tollgate_hooks::{Hook, HookContext, HookResult, Plugin, PluginError, Suspension};

pub struct Whitelist {
    relay_clients: Vec<String>,
    hosts: Vec<String>,
    senders: Vec<String>,
    recipients: Vec<String>,
}

impl Whitelist {
    pub fn from_config(config: &Config) -> Self {
        Self {
            relay_clients: config.get("relayclients").to_vec(),
            hosts: config.get("whitelisthosts").to_vec(),
            senders: config.get("whitelistsenders").to_vec(),
            recipients: config.get("whitelistrcpt").to_vec(),
        }
    }

    /// An entry matches an IP exactly, or as a prefix when it ends in `.`
    /// (`10.11.` covers the /16).
    fn ip_listed(list: &[String], ip: &str) -> bool {
        list.iter()
            .any(|entry| entry == ip || (entry.ends_with('.') && ip.starts_with(entry.as_str())))
    }

    /// An entry matches a full `user@host` or a bare domain.
    fn addr_listed(list: &[String], local: &str, host: &str) -> bool {
        let full = format!("{local}@{host}");
        list.iter()
            .any(|entry| entry.eq_ignore_ascii_case(&full) || entry.eq_ignore_ascii_case(host))
    }
}

#[async_trait]
impl Plugin for Whitelist {
    fn name(&self) -> &'static str {
        "whitelist"
    }

    fn hooks(&self) -> &'static [Hook] {
        &[Hook::Connect, Hook::Mail, Hook::Rcpt]
    }

    async fn run(
        &self,
        hook: Hook,
        ctx: &mut HookContext<'_>,
        _ops: &Arc<Suspension>,
    ) -> Result<HookResult, PluginError> {
        match hook {
            Hook::Connect => {
                let ip = ctx.connection.remote_ip();
                if Self::ip_listed(&self.relay_clients, &ip) {
                    ctx.connection.relay_client = true;
                }
                if Self::ip_listed(&self.hosts, &ip) {
                    ctx.connection.whitelist_host = true;
                    tracing::debug!(%ip, "connecting host is whitelisted");
                }
            }
            Hook::Mail => {
                if let Some(sender) = ctx.transaction.sender() {
                    if Self::addr_listed(&self.senders, sender.local(), sender.host()) {
                        ctx.transaction.notes.set("whitelist.sender", "1");
                    }
                }
            }
            Hook::Rcpt => {
                if let Some(rcpt) = ctx.transaction.recipients().last() {
                    if Self::addr_listed(&self.recipients, rcpt.local(), rcpt.host()) {
                        let key = format!("whitelist.rcpt.{}", rcpt.formatted());
                        ctx.transaction.notes.set(key, "1");
                    }
                }
            }
            _ => {}
        }
        Ok(HookResult::Declined)
    }
}
