//! Batched, bounded A/TXT lookups for DNS blocklist plugins.
//!
//! A plugin hands [`DnsBatch::lookup`] its query sets and a result handler.
//! When at least one query was issued the call returns `true` and the caller
//! must yield; every answer is delivered to the handler on the worker
//! runtime, each holding an op slot on the hook's suspension so the chain
//! resumes only after the whole batch has completed. Handlers must be
//! idempotent with respect to repeat answers.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    TokioResolver,
};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::dispatch::Suspension;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("resolver initialisation failed: {0}")]
    Init(String),
}

/// Outcome of one query. Absence (NXDOMAIN / no records) is an answer, not
/// an error; `Failed` covers timeouts and server failures and is treated as
/// fail-open by policy code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsAnswer<T> {
    Records(Vec<T>),
    NoRecords,
    Failed(String),
}

impl<T> DnsAnswer<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Records(records) if !records.is_empty())
    }
}

/// Resolver seam. Production uses [`SystemResolver`]; tests inject a mock.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup_a(&self, name: &str) -> DnsAnswer<Ipv4Addr>;
    async fn lookup_txt(&self, name: &str) -> DnsAnswer<String>;
}

/// hickory-resolver backed implementation using the system configuration.
pub struct SystemResolver {
    resolver: TokioResolver,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;

        let resolver = match TokioResolver::builder(TokioConnectionProvider::default()) {
            Ok(builder) => builder.with_options(opts).build(),
            Err(err) => {
                tracing::warn!(%err, "system DNS configuration unavailable, using public resolvers");
                TokioResolver::builder_with_config(
                    ResolverConfig::cloudflare(),
                    TokioConnectionProvider::default(),
                )
                .with_options(opts)
                .build()
            }
        };

        Ok(Self { resolver })
    }
}

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup_a(&self, name: &str) -> DnsAnswer<Ipv4Addr> {
        match self.resolver.ipv4_lookup(name).await {
            Ok(lookup) => {
                let records: Vec<Ipv4Addr> = lookup.iter().map(|a| a.0).collect();
                if records.is_empty() {
                    DnsAnswer::NoRecords
                } else {
                    DnsAnswer::Records(records)
                }
            }
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => DnsAnswer::NoRecords,
            Err(err) => DnsAnswer::Failed(err.to_string()),
        }
    }

    async fn lookup_txt(&self, name: &str) -> DnsAnswer<String> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => {
                let records: Vec<String> = lookup.iter().map(ToString::to_string).collect();
                if records.is_empty() {
                    DnsAnswer::NoRecords
                } else {
                    DnsAnswer::Records(records)
                }
            }
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => DnsAnswer::NoRecords,
            Err(err) => DnsAnswer::Failed(err.to_string()),
        }
    }
}

/// Receives per-answer callbacks. Runs on the worker runtime; side effects
/// go through the suspension (notes, verdict), never the socket.
pub trait BatchHandler: Send + Sync {
    fn process_a_result(&self, query: &str, answer: &DnsAnswer<Ipv4Addr>, ops: &Suspension);
    fn process_txt_result(&self, query: &str, answer: &DnsAnswer<String>, ops: &Suspension);
}

pub struct DnsBatch {
    resolver: Arc<dyn Resolve>,
    parallelism: usize,
}

/// Cap on concurrent in-flight queries per batch.
pub const DEFAULT_PARALLELISM: usize = 20;

impl DnsBatch {
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self {
            resolver,
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Issue every query concurrently (bounded). Returns `false` when both
    /// sets are empty and the caller should continue without yielding.
    pub fn lookup(
        &self,
        a_queries: Vec<String>,
        txt_queries: Vec<String>,
        handler: Arc<dyn BatchHandler>,
        ops: &Arc<Suspension>,
    ) -> bool {
        if a_queries.is_empty() && txt_queries.is_empty() {
            return false;
        }

        let limit = Arc::new(Semaphore::new(self.parallelism));

        for query in a_queries {
            let guard = ops.begin_op();
            let ops = Arc::clone(ops);
            let handler = Arc::clone(&handler);
            let resolver = Arc::clone(&self.resolver);
            let limit = Arc::clone(&limit);
            tokio::spawn(async move {
                let _permit = limit.acquire().await;
                let answer = resolver.lookup_a(&query).await;
                if !ops.is_cancelled() {
                    handler.process_a_result(&query, &answer, &ops);
                }
                drop(guard);
            });
        }

        for query in txt_queries {
            let guard = ops.begin_op();
            let ops = Arc::clone(ops);
            let handler = Arc::clone(&handler);
            let resolver = Arc::clone(&self.resolver);
            let limit = Arc::clone(&limit);
            tokio::spawn(async move {
                let _permit = limit.acquire().await;
                let answer = resolver.lookup_txt(&query).await;
                if !ops.is_cancelled() {
                    handler.process_txt_result(&query, &answer, &ops);
                }
                drop(guard);
            });
        }

        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        dispatch::{Dispatcher, HookContext},
        plugin::{Plugin, PluginError, Registry},
        Hook, HookResult,
    };
    use std::sync::Mutex;
    use tollgate_common::{
        config::Config, connection::Connection, state::ServerState, transaction::Transaction,
    };

    pub struct MockResolver {
        /// Names that resolve to 127.0.0.2 (the conventional DNSBL listing).
        pub listed: Vec<&'static str>,
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

        async fn lookup_txt(&self, name: &str) -> DnsAnswer<String> {
            if self.listed.contains(&name) {
                DnsAnswer::Records(vec![format!("{name} is listed")])
            } else {
                DnsAnswer::NoRecords
            }
        }
    }

    struct Recorder {
        hits: Mutex<Vec<String>>,
    }

    impl BatchHandler for Recorder {
        fn process_a_result(&self, query: &str, answer: &DnsAnswer<Ipv4Addr>, ops: &Suspension) {
            if answer.is_hit() {
                self.hits.lock().unwrap().push(query.to_string());
                ops.note_transaction(format!("dnsbl.{query}"), "listed");
            }
        }

        fn process_txt_result(&self, query: &str, answer: &DnsAnswer<String>, _ops: &Suspension) {
            if let DnsAnswer::Records(texts) = answer {
                self.hits
                    .lock()
                    .unwrap()
                    .push(format!("txt:{query}:{}", texts[0]));
            }
        }
    }

    struct BatchPlugin {
        batch: DnsBatch,
        handler: Arc<Recorder>,
    }

    #[async_trait]
    impl Plugin for BatchPlugin {
        fn name(&self) -> &'static str {
            "batch-test"
        }

        fn hooks(&self) -> &'static [Hook] {
            &[Hook::Mail]
        }

        async fn run(
            &self,
            _hook: Hook,
            _ctx: &mut HookContext<'_>,
            ops: &Arc<crate::Suspension>,
        ) -> Result<HookResult, PluginError> {
            let issued = self.batch.lookup(
                vec![
                    "spam.tld.bl.example".to_string(),
                    "ham.tld.bl.example".to_string(),
                ],
                vec!["spam.tld.bl.example".to_string()],
                self.handler.clone(),
                ops,
            );
            Ok(if issued {
                HookResult::Yield
            } else {
                HookResult::Declined
            })
        }
    }

    #[tokio::test]
    async fn batch_suspends_until_all_answers_delivered() {
        let handler = Arc::new(Recorder {
            hits: Mutex::new(Vec::new()),
        });
        let batch = DnsBatch::new(Arc::new(MockResolver {
            listed: vec!["spam.tld.bl.example"],
        }))
        .with_parallelism(2);

        let registry = Arc::new(
            Registry::builder()
                .register(Arc::new(BatchPlugin {
                    batch,
                    handler: handler.clone(),
                }))
                .build(),
        );
        let dispatcher = Dispatcher::new(registry);

        let mut conn = Connection::new("192.0.2.1:2525".parse().unwrap());
        let mut tx = Transaction::new();
        let state = ServerState::new();
        let config = Config::new("/nonexistent");
        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut tx,
            server: &state,
            config: &config,
        };

        let result = dispatcher.run(Hook::Mail, &mut ctx).await;
        // No verdict set by continuations: chain resumes and runs off the end.
        assert_eq!(result, HookResult::Declined);

        let hits = handler.hits.lock().unwrap();
        assert!(hits.contains(&"spam.tld.bl.example".to_string()));
        assert!(hits
            .iter()
            .any(|h| h.starts_with("txt:spam.tld.bl.example")));
        assert_eq!(hits.iter().filter(|h| h.contains("ham")).count(), 0);
        drop(hits);

        assert_eq!(tx.notes.get("dnsbl.spam.tld.bl.example"), Some("listed"));
    }

    #[tokio::test]
    async fn empty_batch_does_not_yield() {
        let batch = DnsBatch::new(Arc::new(MockResolver { listed: vec![] }));
        let handler = Arc::new(Recorder {
            hits: Mutex::new(Vec::new()),
        });
        let suspension_probe = crate::dispatch::Suspension::new_for_test();
        assert!(!batch.lookup(Vec::new(), Vec::new(), handler, &suspension_probe));
        assert_eq!(suspension_probe.pending_ops(), 0);
    }
}
