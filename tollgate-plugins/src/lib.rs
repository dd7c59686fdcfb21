//! Bundled policy plugins and the registry factory the worker uses to
//! (re)construct them from configuration.

pub mod auth;
pub mod greylist;
pub mod rhsbl;
pub mod whitelist;

use std::path::Path;
use std::sync::Arc;

use tollgate_common::config::Config;
use tollgate_hooks::dns::Resolve;
use tollgate_hooks::Registry;

/// Build the plugin registry from the `plugins` config key (one plugin name
/// per line, chain order). An absent key loads the full bundled set.
/// Unknown names are logged and skipped so a typo cannot take the worker
/// down on reload.
pub fn build_registry(
    config: &Config,
    default_db_dir: &Path,
    resolver: Arc<dyn Resolve>,
) -> Registry {
    let configured = config.get("plugins");
    let names: Vec<&str> = if configured.is_empty() {
        vec!["whitelist", "rhsbl", "auth_flat_file", "hash_greylist"]
    } else {
        configured.iter().map(String::as_str).collect()
    };

    let mut builder = Registry::builder();
    for name in names {
        match name {
            "whitelist" => {
                builder = builder.register(Arc::new(whitelist::Whitelist::from_config(config)));
            }
            "rhsbl" => {
                builder = builder.register(Arc::new(rhsbl::Rhsbl::from_config(
                    config,
                    Arc::clone(&resolver),
                )));
            }
            "auth_flat_file" => {
                builder = builder.register(Arc::new(auth::Auth::new(Arc::new(
                    auth::FlatFileCredentials::from_config(config),
                ))));
            }
            "hash_greylist" => {
                builder = builder.register(Arc::new(greylist::GreylistPlugin::from_config(
                    config,
                    default_db_dir,
                )));
            }
            other => {
                tracing::warn!(plugin = other, "unknown plugin name in config, skipping");
            }
        }
    }
    builder.build()
}

#[cfg(test)]
mod test {
    use super::*;
    use tollgate_hooks::dns::{DnsAnswer, Resolve};

    struct NullResolver;

    #[async_trait::async_trait]
    impl Resolve for NullResolver {
        async fn lookup_a(&self, _name: &str) -> DnsAnswer<std::net::Ipv4Addr> {
            DnsAnswer::NoRecords
        }

        async fn lookup_txt(&self, _name: &str) -> DnsAnswer<String> {
            DnsAnswer::NoRecords
        }
    }

    #[test]
    fn default_set_loads_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        let registry = build_registry(&config, dir.path(), Arc::new(NullResolver));
        assert_eq!(
            registry.plugin_names(),
            ["whitelist", "rhsbl", "auth_flat_file", "hash_greylist"]
        );
    }

    #[test]
    fn unknown_names_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plugins"), "hash_greylist\nno_such_plugin\n").unwrap();
        let config = Config::new(dir.path());
        let registry = build_registry(&config, dir.path(), Arc::new(NullResolver));
        assert_eq!(registry.plugin_names(), ["hash_greylist"]);
    }
}
