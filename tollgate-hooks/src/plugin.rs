//! The plugin trait and the ordered per-hook registry.

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use thiserror::Error;

use crate::dispatch::{HookContext, Suspension};
use crate::{Hook, HookResult};

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("{0}")]
    Internal(String),
}

/// A policy module. One instance per worker; it owns its configuration and
/// shares nothing with other workers except files.
///
/// `run` is invoked for every hook the plugin registered via [`Plugin::hooks`].
/// Returning `Err` is contained by the dispatcher (logged, mapped to a
/// generic DENYSOFT); it never tears down the session.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hooks this plugin wants, in the order it wants them registered.
    fn hooks(&self) -> &'static [Hook];

    async fn run(
        &self,
        hook: Hook,
        ctx: &mut HookContext<'_>,
        ops: &Arc<Suspension>,
    ) -> Result<HookResult, PluginError>;
}

/// Ordered handler lists, one per hook. Registration order across plugins is
/// preserved; a plugin registering several hooks keeps its position in each.
#[derive(Default)]
pub struct Registry {
    by_hook: AHashMap<Hook, Vec<Arc<dyn Plugin>>>,
    names: Vec<&'static str>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn handlers(&self, hook: Hook) -> &[Arc<dyn Plugin>] {
        self.by_hook.get(&hook).map_or(&[], Vec::as_slice)
    }

    /// Names of every registered plugin, in registration order.
    pub fn plugin_names(&self) -> &[&'static str] {
        &self.names
    }

    pub fn has_handlers(&self, hook: Hook) -> bool {
        !self.handlers(hook).is_empty()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    by_hook: AHashMap<Hook, Vec<Arc<dyn Plugin>>>,
    names: Vec<&'static str>,
}

impl RegistryBuilder {
    pub fn register(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.names.push(plugin.name());
        for &hook in plugin.hooks() {
            self.by_hook.entry(hook).or_default().push(Arc::clone(&plugin));
        }
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            by_hook: self.by_hook,
            names: self.names,
        }
    }
}


#[cfg(test)]
mod test {
    use super::test_support::Scripted;
    use super::*;
    use std::sync::Mutex;

    fn scripted(name: &'static str, hooks: &'static [Hook]) -> Arc<dyn Plugin> {
        Arc::new(Scripted {
            name,
            hooks,
            script: Mutex::new(Vec::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }

    #[test]
    fn registration_order_is_preserved() {
        let registry = Registry::builder()
            .register(scripted("first", &[Hook::Connect, Hook::Mail]))
            .register(scripted("second", &[Hook::Mail]))
            .build();

        let names: Vec<_> = registry
            .handlers(Hook::Mail)
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(names, ["first", "second"]);
        assert_eq!(registry.handlers(Hook::Connect).len(), 1);
        assert!(!registry.has_handlers(Hook::Quit));
        assert_eq!(registry.plugin_names(), ["first", "second"]);
    }
}
