//! The chain executor and its cooperative suspension model.
//!
//! A handler that starts asynchronous work registers each operation on the
//! hook's [`Suspension`] and returns [`HookResult::Yield`]. The dispatcher
//! then parks (no client input is read, no reply is written) until every
//! outstanding operation has completed, applies the note writes the
//! continuations queued, and either resumes the chain at the next handler or
//! returns the terminal verdict a continuation set. Suspension is explicit
//! state, never captured stack.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use tokio::sync::Notify;

use tollgate_common::{
    config::Config, connection::Connection, state::ServerState, transaction::Transaction,
};

use crate::{plugin::Registry, Hook, HookResult};

/// Borrowed view of the session state handed to each handler, scoped to one
/// hook call.
pub struct HookContext<'a> {
    pub connection: &'a mut Connection,
    pub transaction: &'a mut Transaction,
    pub server: &'a ServerState,
    pub config: &'a Config,
}

/// Deferred mutation queued by a continuation. Continuations run outside the
/// handler borrow, so their writes are applied by the dispatcher on resume.
enum NoteWrite {
    Connection(String, String),
    Transaction(String, String),
}

/// Shared state for one suspended hook step.
///
/// `pending` counts outstanding operations; the chain resumes when it reaches
/// zero. The first terminal verdict a continuation sets wins; with no verdict
/// the chain resumes as if the yielding handler had declined.
pub struct Suspension {
    pending: AtomicUsize,
    cancelled: AtomicBool,
    verdict: Mutex<Option<HookResult>>,
    writes: Mutex<Vec<NoteWrite>>,
    notify: Notify,
}

impl Suspension {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            verdict: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Arc<Self> {
        Self::new()
    }

    /// Register one in-flight operation. The returned guard must live for
    /// the duration of the operation; dropping it (success, failure, or task
    /// teardown) is what releases the slot.
    pub fn begin_op(self: &Arc<Self>) -> OpGuard {
        self.pending.fetch_add(1, Ordering::SeqCst);
        OpGuard {
            suspension: Arc::clone(self),
        }
    }

    /// Set the chain's resume verdict. First terminal result wins;
    /// `Declined` (continue from the next handler) is the default and need
    /// not be set explicitly.
    pub fn resume(&self, result: HookResult) {
        if matches!(result, HookResult::Declined) {
            return;
        }
        let mut verdict = self.verdict.lock().expect("verdict poisoned");
        if verdict.is_none() {
            *verdict = Some(result);
        }
    }

    /// Queue a transaction note for the dispatcher to apply on resume.
    pub fn note_transaction(&self, key: impl Into<String>, value: impl Into<String>) {
        self.writes
            .lock()
            .expect("writes poisoned")
            .push(NoteWrite::Transaction(key.into(), value.into()));
    }

    /// Queue a connection note for the dispatcher to apply on resume.
    pub fn note_connection(&self, key: impl Into<String>, value: impl Into<String>) {
        self.writes
            .lock()
            .expect("writes poisoned")
            .push(NoteWrite::Connection(key.into(), value.into()));
    }

    /// True once the session abandoned this hook step. Continuations should
    /// skip side effects but must still drop their guards.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pending_ops(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn op_finished(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_one();
        }
    }

    async fn wait(&self) {
        loop {
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            self.notify.notified().await;
        }
    }

    fn take_verdict(&self) -> Option<HookResult> {
        self.verdict.lock().expect("verdict poisoned").take()
    }

    fn apply_writes(&self, ctx: &mut HookContext<'_>) {
        for write in self.writes.lock().expect("writes poisoned").drain(..) {
            match write {
                NoteWrite::Connection(k, v) => {
                    ctx.connection.notes.set(k, v);
                }
                NoteWrite::Transaction(k, v) => {
                    ctx.transaction.notes.set(k, v);
                }
            }
        }
    }
}

/// RAII slot for one asynchronous operation.
pub struct OpGuard {
    suspension: Arc<Suspension>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.suspension.op_finished();
    }
}

/// Marks the suspension cancelled if the dispatcher future is dropped while
/// parked (session torn down mid-hook).
struct CancelOnDrop {
    suspension: Arc<Suspension>,
    disarmed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.disarmed {
            self.suspension.cancelled.store(true, Ordering::SeqCst);
        }
    }
}

pub struct Dispatcher {
    registry: std::sync::RwLock<Arc<Registry>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry: std::sync::RwLock::new(registry),
        }
    }

    /// Current registry snapshot. Sessions mid-chain keep the snapshot they
    /// started with; a swap only affects later hook invocations.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry.read().expect("registry poisoned"))
    }

    /// Replace the plugin set (control-channel `reload`).
    pub fn swap(&self, registry: Arc<Registry>) {
        *self.registry.write().expect("registry poisoned") = registry;
    }

    /// Run the handler chain for `hook`. Returns the terminal result, or
    /// `Declined` when every handler declined (the session applies the
    /// hook's built-in default).
    pub async fn run(&self, hook: Hook, ctx: &mut HookContext<'_>) -> HookResult {
        let registry = self.registry();
        let handlers = registry.handlers(hook);
        let mut index = 0;

        while index < handlers.len() {
            let plugin = &handlers[index];
            let suspension = Suspension::new();

            let result = match plugin.run(hook, ctx, &suspension).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(hook = %hook, plugin = plugin.name(), %err,
                        "handler failed, converting to DENYSOFT");
                    return HookResult::deny_soft("temporary failure, please try again later");
                }
            };

            match result {
                HookResult::Declined => {
                    index += 1;
                }
                HookResult::Yield => {
                    let mut cancel = CancelOnDrop {
                        suspension: Arc::clone(&suspension),
                        disarmed: false,
                    };
                    suspension.wait().await;
                    cancel.disarmed = true;
                    drop(cancel);

                    suspension.apply_writes(ctx);
                    match suspension.take_verdict() {
                        None => index += 1,
                        Some(terminal) => {
                            tracing::debug!(hook = %hook, plugin = plugin.name(),
                                ?terminal, "hook resumed with verdict");
                            return terminal;
                        }
                    }
                }
                terminal => {
                    tracing::trace!(hook = %hook, plugin = plugin.name(), ?terminal,
                        "hook chain terminated");
                    return terminal;
                }
            }
        }

        HookResult::Declined
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plugin::test_support::Scripted;
    use crate::plugin::{Plugin, PluginError};
    use async_trait::async_trait;
    use std::time::Duration;

    fn context_parts() -> (Connection, Transaction, ServerState, Config) {
        (
            Connection::new("192.0.2.1:2525".parse().unwrap()),
            Transaction::new(),
            ServerState::new(),
            Config::new("/nonexistent"),
        )
    }

    macro_rules! ctx {
        ($conn:ident, $tx:ident, $state:ident, $config:ident) => {
            HookContext {
                connection: &mut $conn,
                transaction: &mut $tx,
                server: &$state,
                config: &$config,
            }
        };
    }

    fn scripted(
        name: &'static str,
        results: Vec<Result<HookResult, PluginError>>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn Plugin> {
        Arc::new(Scripted {
            name,
            hooks: &[Hook::Mail],
            script: Mutex::new(results),
            calls,
        })
    }

    #[tokio::test]
    async fn declined_falls_through_and_terminal_stops() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(
            Registry::builder()
                .register(scripted("a", vec![Ok(HookResult::Declined)], calls.clone()))
                .register(scripted("b", vec![Ok(HookResult::deny("no"))], calls.clone()))
                .register(scripted("c", vec![Ok(HookResult::ok())], calls.clone()))
                .build(),
        );
        let dispatcher = Dispatcher::new(registry);
        let (mut conn, mut tx, state, config) = context_parts();

        let result = dispatcher
            .run(Hook::Mail, &mut ctx!(conn, tx, state, config))
            .await;
        assert_eq!(result, HookResult::deny("no"));
        assert_eq!(*calls.lock().unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn all_declined_returns_declined() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(
            Registry::builder()
                .register(scripted("a", vec![Ok(HookResult::Declined)], calls.clone()))
                .register(scripted("b", vec![Ok(HookResult::Declined)], calls.clone()))
                .build(),
        );
        let dispatcher = Dispatcher::new(registry);
        let (mut conn, mut tx, state, config) = context_parts();

        let result = dispatcher
            .run(Hook::Mail, &mut ctx!(conn, tx, state, config))
            .await;
        assert_eq!(result, HookResult::Declined);
    }

    #[tokio::test]
    async fn handler_error_becomes_denysoft() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(
            Registry::builder()
                .register(scripted(
                    "broken",
                    vec![Err(PluginError::Internal("boom".into()))],
                    calls.clone(),
                ))
                .build(),
        );
        let dispatcher = Dispatcher::new(registry);
        let (mut conn, mut tx, state, config) = context_parts();

        let result = dispatcher
            .run(Hook::Mail, &mut ctx!(conn, tx, state, config))
            .await;
        assert!(matches!(result, HookResult::DenySoft(_)));
    }

    /// Yields, spawns two ops; one records a note, neither sets a verdict:
    /// the chain must resume at the next handler with the note applied.
    struct Yielding;

    #[async_trait]
    impl Plugin for Yielding {
        fn name(&self) -> &'static str {
            "yielding"
        }

        fn hooks(&self) -> &'static [Hook] {
            &[Hook::Mail]
        }

        async fn run(
            &self,
            _hook: Hook,
            _ctx: &mut HookContext<'_>,
            ops: &Arc<Suspension>,
        ) -> Result<HookResult, PluginError> {
            for i in 0..2u64 {
                let guard = ops.begin_op();
                let ops = Arc::clone(ops);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10 * (i + 1))).await;
                    if i == 0 {
                        ops.note_transaction("dns.hit", "listed");
                    }
                    drop(guard);
                });
            }
            Ok(HookResult::Yield)
        }
    }

    #[tokio::test]
    async fn yield_resumes_after_all_ops_and_applies_notes() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(
            Registry::builder()
                .register(Arc::new(Yielding))
                .register(scripted("after", vec![Ok(HookResult::ok())], calls.clone()))
                .build(),
        );
        let dispatcher = Dispatcher::new(registry);
        let (mut conn, mut tx, state, config) = context_parts();

        let result = dispatcher
            .run(Hook::Mail, &mut ctx!(conn, tx, state, config))
            .await;
        assert_eq!(result, HookResult::ok());
        assert_eq!(*calls.lock().unwrap(), ["after"]);
        assert_eq!(tx.notes.get("dns.hit"), Some("listed"));
    }

    /// Yields with an op whose continuation sets a terminal verdict.
    struct YieldDeny;

    #[async_trait]
    impl Plugin for YieldDeny {
        fn name(&self) -> &'static str {
            "yield-deny"
        }

        fn hooks(&self) -> &'static [Hook] {
            &[Hook::Mail]
        }

        async fn run(
            &self,
            _hook: Hook,
            _ctx: &mut HookContext<'_>,
            ops: &Arc<Suspension>,
        ) -> Result<HookResult, PluginError> {
            let guard = ops.begin_op();
            let ops = Arc::clone(ops);
            tokio::spawn(async move {
                ops.resume(HookResult::deny("listed"));
                drop(guard);
            });
            Ok(HookResult::Yield)
        }
    }

    #[tokio::test]
    async fn continuation_verdict_terminates_chain() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(
            Registry::builder()
                .register(Arc::new(YieldDeny))
                .register(scripted("never", vec![Ok(HookResult::ok())], calls.clone()))
                .build(),
        );
        let dispatcher = Dispatcher::new(registry);
        let (mut conn, mut tx, state, config) = context_parts();

        let result = dispatcher
            .run(Hook::Mail, &mut ctx!(conn, tx, state, config))
            .await;
        assert_eq!(result, HookResult::deny("listed"));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_dispatcher_marks_suspension_cancelled() {
        let suspension = Suspension::new();
        let guard = suspension.begin_op();

        // Simulate the session tearing down a parked hook step.
        let cancel = CancelOnDrop {
            suspension: Arc::clone(&suspension),
            disarmed: false,
        };
        drop(cancel);

        assert!(suspension.is_cancelled());
        assert_eq!(suspension.pending_ops(), 1);
        drop(guard);
        assert_eq!(suspension.pending_ops(), 0);
    }

    #[tokio::test]
    async fn first_verdict_wins() {
        let suspension = Suspension::new();
        suspension.resume(HookResult::deny_soft("first"));
        suspension.resume(HookResult::deny("second"));
        assert_eq!(
            suspension.take_verdict(),
            Some(HookResult::deny_soft("first"))
        );
    }
}
