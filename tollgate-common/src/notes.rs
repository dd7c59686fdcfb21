//! Set-once-read-many annotation maps carried by connections and
//! transactions. Plugins communicate across hooks through these.

use ahash::AHashMap;

/// Note keys that cross crate boundaries (session writes, plugins read).
pub mod keys {
    pub const AUTH_USER: &str = "auth.user";
    pub const AUTH_PASS: &str = "auth.pass";
    pub const AUTH_TICKET: &str = "auth.ticket";
    pub const AUTH_RESPONSE: &str = "auth.response";
}

#[derive(Debug, Default, Clone)]
pub struct Notes {
    inner: AHashMap<String, String>,
}

impl Notes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a note. The first write wins; later writes for the same key are
    /// ignored and reported via the return value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.inner.contains_key(&key) {
            return false;
        }
        self.inner.insert(key, value.into());
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.inner.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
