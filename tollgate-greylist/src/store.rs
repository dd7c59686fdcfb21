//! On-disk key-value store shared by every worker on the host.
//!
//! Format: ASCII `key<TAB>value` lines in `<db_dir>/hash_greylist.dbm`.
//! Every open acquires an exclusive advisory `flock` on the companion
//! `hash_greylist.dbm.lock` file; the lock lives exactly as long as the
//! [`StoreGuard`] and is released on every exit path, error or not, when the
//! guard's lock fd closes. Writes rewrite the whole file through a temp file
//! and rename. The store is small (at most a few hundred thousand short
//! keys), so whole-file I/O stays well inside the time a lock holder may run.
//!
//! The guard must never be held across an `.await`.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const DB_FILE: &str = "hash_greylist.dbm";
pub const LOCK_FILE: &str = "hash_greylist.dbm.lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Store {
    data_path: PathBuf,
    lock_path: PathBuf,
}

impl Store {
    pub fn new(db_dir: impl AsRef<Path>) -> Self {
        let db_dir = db_dir.as_ref();
        Self {
            data_path: db_dir.join(DB_FILE),
            lock_path: db_dir.join(LOCK_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.data_path
    }

    /// Acquire the exclusive lock and load the store. Blocks until the lock
    /// is granted; holders only ever keep it for one key update, so the wait
    /// is bounded.
    pub fn open(&self) -> Result<StoreGuard, StoreError> {
        if let Some(dir) = self.data_path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|source| StoreError::Lock {
                path: self.lock_path.clone(),
                source,
            })?;

        let rc = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(StoreError::Lock {
                path: self.lock_path.clone(),
                source: std::io::Error::last_os_error(),
            });
        }

        let mut entries = BTreeMap::new();
        let mut dirty = false;
        match std::fs::read_to_string(&self.data_path) {
            Ok(content) => {
                for line in content.lines() {
                    if line.is_empty() {
                        continue;
                    }
                    match line.split_once('\t') {
                        Some((key, value)) => {
                            entries.insert(key.to_string(), value.to_string());
                        }
                        None => {
                            // Unparseable line; dropping it here means the
                            // next commit rewrites a clean file.
                            dirty = true;
                        }
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.data_path.clone(),
                    source,
                })
            }
        }

        Ok(StoreGuard {
            data_path: self.data_path.clone(),
            entries,
            dirty,
            _lock: lock,
        })
    }
}

/// Exclusive, loaded view of the store. Mutations are in-memory until
/// [`StoreGuard::commit`]; the advisory lock is released when the guard
/// drops, committed or not.
pub struct StoreGuard {
    data_path: PathBuf,
    entries: BTreeMap<String, String>,
    dirty: bool,
    _lock: File,
}

impl StoreGuard {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Remove every key the predicate rejects; returns how many went.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, v| keep(k, v));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Persist pending mutations (temp file + rename). A no-op when nothing
    /// changed. The lock is released when `self` drops.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }

        let tmp_path = self.data_path.with_extension("dbm.tmp");
        let io_err = |source, path: &Path| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut tmp = File::create(&tmp_path).map_err(|e| io_err(e, &tmp_path))?;
        for (key, value) in &self.entries {
            writeln!(tmp, "{key}\t{value}").map_err(|e| io_err(e, &tmp_path))?;
        }
        tmp.sync_all().map_err(|e| io_err(e, &tmp_path))?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.data_path).map_err(|e| io_err(e, &self.data_path))?;
        self.dirty = false;
        Ok(())
    }
}
