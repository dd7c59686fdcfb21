//! Flat key -> line-list configuration oracle.
//!
//! Every key maps to the non-comment lines of `<config_dir>/<key>`; a missing
//! file is an empty list. Lookups are cached until [`Config::reload`] drops
//! the cache (wired to the control channel's `reload` command).

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use ahash::AHashMap;

#[derive(Debug)]
pub struct Config {
    dir: PathBuf,
    cache: Mutex<AHashMap<String, Arc<Vec<String>>>>,
}

impl Config {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(AHashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All configured lines for `key`, comments and blanks stripped.
    pub fn get(&self, key: &str) -> Arc<Vec<String>> {
        if let Some(cached) = self.cache.lock().expect("config cache poisoned").get(key) {
            return Arc::clone(cached);
        }

        let lines = Arc::new(self.read_lines(key));
        self.cache
            .lock()
            .expect("config cache poisoned")
            .insert(key.to_string(), Arc::clone(&lines));
        lines
    }

    /// First line for `key`, or `default` when unset.
    pub fn get_one(&self, key: &str, default: &str) -> String {
        self.get(key)
            .first()
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Parse a `key value key value ...` whitespace-pair line list into a map,
    /// the layout used by `hash_greylist` and friends.
    pub fn get_pairs(&self, key: &str) -> AHashMap<String, String> {
        let mut pairs = AHashMap::new();
        for line in self.get(key).iter() {
            let mut words = line.split_whitespace();
            while let (Some(k), Some(v)) = (words.next(), words.next()) {
                pairs.insert(k.to_string(), v.to_string());
            }
        }
        pairs
    }

    /// Drop every cached key so the next lookup re-reads from disk.
    pub fn reload(&self) {
        self.cache.lock().expect("config cache poisoned").clear();
    }

    fn read_lines(&self, key: &str) -> Vec<String> {
        let path = self.dir.join(key);
        match std::fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                tracing::warn!(key, path = %path.display(), %err, "failed to read config key");
                Vec::new()
            }
        }
    }
}
