//! Right-hand-side blocklist checks on the envelope sender domain.
//!
//! At MAIL the sender domain is queried against every configured zone as a
//! batch (A records, plus TXT for zones without a configured message) and
//! the hook yields until the batch completes; hits land in transaction
//! notes. The rejection itself is issued at RCPT so a listed sender still
//! gets its recipients logged.
//!
//! Config key `rhsbl_zones`: one `zone` or `zone message...` per line.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;

use tollgate_common::config::Config;
use tollgate_hooks::dns::{BatchHandler, DnsAnswer, DnsBatch, Resolve};
use tollgate_hooks::{Hook, HookContext, HookResult, Plugin, PluginError, Suspension};

const NOTE_DOMAIN: &str = "rhsbl.domain";
const NOTE_ZONE: &str = "rhsbl.zone";
const NOTE_MESSAGE: &str = "rhsbl.message";

#[derive(Debug, Clone)]
struct Zone {
    name: String,
    message: Option<String>,
}

pub struct Rhsbl {
    zones: Vec<Zone>,
    batch: DnsBatch,
}

impl Rhsbl {
    pub fn from_config(config: &Config, resolver: Arc<dyn Resolve>) -> Self {
        let zones = config
            .get("rhsbl_zones")
            .iter()
            .map(|line| match line.split_once(char::is_whitespace) {
                Some((name, message)) => Zone {
                    name: name.to_string(),
                    message: Some(message.trim().to_string()),
                },
                None => Zone {
                    name: line.clone(),
                    message: None,
                },
            })
            .collect();

        Self {
            zones,
            batch: DnsBatch::new(resolver),
        }
    }
}

/// Continuation state for one MAIL-time batch. Notes are set-once, so the
/// first listing wins and repeat answers are naturally idempotent.
struct ZoneResults {
    domain: String,
    zones: Vec<Zone>,
}

impl ZoneResults {
    fn zone_for(&self, query: &str) -> Option<&Zone> {
        self.zones
            .iter()
            .find(|zone| query == format!("{}.{}", self.domain, zone.name))
    }
}

impl BatchHandler for ZoneResults {
    fn process_a_result(&self, query: &str, answer: &DnsAnswer<Ipv4Addr>, ops: &Suspension) {
        if !answer.is_hit() {
            return;
        }
        let Some(zone) = self.zone_for(query) else {
            return;
        };

        tracing::info!(domain = %self.domain, zone = %zone.name, "sender domain listed");
        ops.note_transaction(NOTE_DOMAIN, self.domain.clone());
        ops.note_transaction(NOTE_ZONE, zone.name.clone());
        if let Some(message) = &zone.message {
            ops.note_transaction(NOTE_MESSAGE, message.clone());
        }
    }

    fn process_txt_result(&self, query: &str, answer: &DnsAnswer<String>, ops: &Suspension) {
        let DnsAnswer::Records(texts) = answer else {
            return;
        };
        if self.zone_for(query).is_some() {
            if let Some(text) = texts.first() {
                ops.note_transaction(NOTE_MESSAGE, text.clone());
            }
        }
    }
}

#[async_trait]
impl Plugin for Rhsbl {
    fn name(&self) -> &'static str {
        "rhsbl"
    }

    fn hooks(&self) -> &'static [Hook] {
        &[Hook::Mail, Hook::Rcpt]
    }

    async fn run(
        &self,
        hook: Hook,
        ctx: &mut HookContext<'_>,
        ops: &Arc<Suspension>,
    ) -> Result<HookResult, PluginError> {
        match hook {
            Hook::Mail => {
                if ctx.connection.relay_client || self.zones.is_empty() {
                    return Ok(HookResult::Declined);
                }
                let Some(sender) = ctx.transaction.sender() else {
                    // The null sender has no right-hand side to look up.
                    return Ok(HookResult::Declined);
                };
                let domain = sender.host().to_string();

                let a_queries: Vec<String> = self
                    .zones
                    .iter()
                    .map(|zone| format!("{domain}.{}", zone.name))
                    .collect();
                let txt_queries: Vec<String> = self
                    .zones
                    .iter()
                    .filter(|zone| zone.message.is_none())
                    .map(|zone| format!("{domain}.{}", zone.name))
                    .collect();

                let handler = Arc::new(ZoneResults {
                    domain,
                    zones: self.zones.clone(),
                });

                if self.batch.lookup(a_queries, txt_queries, handler, ops) {
                    Ok(HookResult::Yield)
                } else {
                    Ok(HookResult::Declined)
                }
            }
            Hook::Rcpt => {
                let Some(domain) = ctx.transaction.notes.get(NOTE_DOMAIN) else {
                    return Ok(HookResult::Declined);
                };
                let message = ctx
                    .transaction
                    .notes
                    .get(NOTE_MESSAGE)
                    .unwrap_or("is listed");
                Ok(HookResult::deny(format!(
                    "Mail from {domain} rejected because it {message}"
                )))
            }
            _ => Ok(HookResult::Declined),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tollgate_common::{
        address::Address, connection::Connection, state::ServerState, transaction::Transaction,
    };
    use tollgate_hooks::{Dispatcher, Registry};

    struct MockResolver {
        listed: Vec<&'static str>,
    }

    #[async_trait]
    impl Resolve for MockResolver {
        async fn lookup_a(&self, name: &str) -> DnsAnswer<Ipv4Addr> {
            if self.listed.contains(&name) {
                DnsAnswer::Records(vec![Ipv4Addr::new(127, 0, 0, 2)])
            } else {
                DnsAnswer::NoRecords
            }
        }

        async fn lookup_txt(&self, _name: &str) -> DnsAnswer<String> {
            DnsAnswer::NoRecords
        }
    }

    fn setup(
        zones: &str,
        listed: Vec<&'static str>,
    ) -> (tempfile::TempDir, Dispatcher, ServerState) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rhsbl_zones"), zones).unwrap();
        let config = Config::new(dir.path());
        let plugin = Rhsbl::from_config(&config, Arc::new(MockResolver { listed }));
        let registry = Arc::new(Registry::builder().register(Arc::new(plugin)).build());
        (dir, Dispatcher::new(registry), ServerState::new())
    }

    #[tokio::test]
    async fn listed_sender_is_denied_at_rcpt() {
        let (dir, dispatcher, state) = setup(
            "bl.example domain listed\n",
            vec!["spam.tld.bl.example"],
        );
        let config = Config::new(dir.path());

        let mut conn = Connection::new("203.0.113.9:4000".parse().unwrap());
        let mut tx = Transaction::new();
        tx.set_sender(Some(Address::new("x", "spam.tld")));

        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut tx,
            server: &state,
            config: &config,
        };
        let mail = dispatcher.run(Hook::Mail, &mut ctx).await;
        assert_eq!(mail, HookResult::Declined);

        tx.add_recipient(Address::new("c", "d.example"));
        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut tx,
            server: &state,
            config: &config,
        };
        let rcpt = dispatcher.run(Hook::Rcpt, &mut ctx).await;
        assert_eq!(
            rcpt,
            HookResult::deny("Mail from spam.tld rejected because it domain listed")
        );
    }

    #[tokio::test]
    async fn clean_sender_passes() {
        let (dir, dispatcher, state) = setup("bl.example domain listed\n", vec![]);
        let config = Config::new(dir.path());

        let mut conn = Connection::new("203.0.113.9:4000".parse().unwrap());
        let mut tx = Transaction::new();
        tx.set_sender(Some(Address::new("x", "ham.tld")));

        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut tx,
            server: &state,
            config: &config,
        };
        assert_eq!(
            dispatcher.run(Hook::Mail, &mut ctx).await,
            HookResult::Declined
        );

        tx.add_recipient(Address::new("c", "d.example"));
        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut tx,
            server: &state,
            config: &config,
        };
        assert_eq!(
            dispatcher.run(Hook::Rcpt, &mut ctx).await,
            HookResult::Declined
        );
    }

    #[tokio::test]
    async fn null_sender_and_relay_clients_skip_lookups() {
        let (dir, dispatcher, state) = setup("bl.example\n", vec!["spam.tld.bl.example"]);
        let config = Config::new(dir.path());

        let mut conn = Connection::new("203.0.113.9:4000".parse().unwrap());
        let mut tx = Transaction::new();
        tx.set_sender(None);
        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut tx,
            server: &state,
            config: &config,
        };
        assert_eq!(
            dispatcher.run(Hook::Mail, &mut ctx).await,
            HookResult::Declined
        );

        let mut conn = Connection::new("203.0.113.9:4000".parse().unwrap());
        conn.relay_client = true;
        let mut tx = Transaction::new();
        tx.set_sender(Some(Address::new("x", "spam.tld")));
        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut tx,
            server: &state,
            config: &config,
        };
        assert_eq!(
            dispatcher.run(Hook::Mail, &mut ctx).await,
            HookResult::Declined
        );
        assert!(!tx.notes.contains("rhsbl.domain"));
    }
}
