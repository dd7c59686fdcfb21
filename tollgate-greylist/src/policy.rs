//! The hash greylist policy: fingerprint computation, the
//! black/grey/white ladder, and the periodic sweep.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use ahash::AHashMap;
use md5::{Digest, Md5};

use tollgate_common::{address::format_sender, transaction::Transaction};

use crate::store::{Store, StoreError};

const LASTFLUSHED: &str = "lastflushed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Deny first contacts with a 451.
    #[default]
    DenySoft,
    /// Track entries, never deny.
    TestOnly,
    /// Disabled outright.
    Off,
}

impl Mode {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "testonly" => Self::TestOnly,
            "off" => Self::Off,
            _ => Self::DenySoft,
        }
    }
}

/// Policy durations are seconds; see the `hash_greylist` config key.
#[derive(Debug, Clone)]
pub struct GreylistConfig {
    pub black_timeout: i64,
    pub grey_timeout: i64,
    pub white_timeout: i64,
    pub max_size: usize,
    pub flush_period: i64,
    pub mode: Mode,
    pub db_dir: PathBuf,
}

impl Default for GreylistConfig {
    fn default() -> Self {
        Self {
            black_timeout: 60,
            grey_timeout: 12_000,
            white_timeout: 3_110_400,
            max_size: 200_000,
            flush_period: 3600,
            mode: Mode::DenySoft,
            db_dir: PathBuf::from("/var/lib/tollgate"),
        }
    }
}

impl GreylistConfig {
    /// Build from the whitespace-pair lines of the `hash_greylist` key.
    /// Unknown keys are ignored; bad numbers keep the default.
    pub fn from_pairs(pairs: &AHashMap<String, String>, default_db_dir: &std::path::Path) -> Self {
        let mut cfg = Self {
            db_dir: default_db_dir.to_path_buf(),
            ..Self::default()
        };

        let num = |key: &str, default: i64| {
            pairs
                .get(key)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(default)
        };

        cfg.black_timeout = num("black_timeout", cfg.black_timeout);
        cfg.grey_timeout = num("grey_timeout", cfg.grey_timeout);
        cfg.white_timeout = num("white_timeout", cfg.white_timeout);
        cfg.flush_period = num("flush_period", cfg.flush_period);
        if let Some(size) = pairs.get("max_size").and_then(|v| v.parse::<usize>().ok()) {
            cfg.max_size = size;
        }
        if let Some(mode) = pairs.get("mode") {
            cfg.mode = Mode::parse(mode);
        }
        if let Some(dir) = pairs.get("db_dir") {
            cfg.db_dir = PathBuf::from(dir);
        }

        cfg
    }
}

/// MD5 hex over body bytes, sender, each recipient in order, and the
/// Message-ID header value (empty when absent). Computed once per
/// transaction and cached in a note by the plugin.
pub fn fingerprint(tx: &Transaction) -> String {
    let mut hasher = Md5::new();
    hasher.update(tx.body());
    hasher.update(format_sender(tx.sender()));
    for rcpt in tx.recipients() {
        hasher.update(rcpt.formatted());
    }
    hasher.update(tx.header("Message-ID").unwrap_or_default());

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(32);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

pub fn format_grey(ts: i64, count: u64) -> String {
    format!("{ts}:{count}")
}

pub fn parse_grey(value: &str) -> Option<(i64, u64)> {
    let (ts, count) = value.split_once(':')?;
    Some((ts.parse().ok()?, count.parse().ok()?))
}

/// What the ladder decided for one (IP, fingerprint) pair. Mapping decisions
/// to SMTP results (and the `testonly`/`off` gates) is the plugin's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Remote IP is within `white_timeout`; pass without touching the
    /// fingerprint table.
    Whitelisted,
    /// Unknown fingerprint, now stored with count 1.
    FirstSeen,
    /// Retry inside the black window; entry rewritten with the new
    /// timestamp and this count.
    EarlyRetry(u64),
    /// Retry inside the grey window; fingerprint removed, IP whitelisted.
    Promoted,
    /// Fingerprint older than `grey_timeout`; removed, treated as unseen
    /// on the next attempt.
    Overdue,
}

pub struct Greylist {
    cfg: GreylistConfig,
    store: Store,
}

impl Greylist {
    pub fn new(cfg: GreylistConfig) -> Self {
        let store = Store::new(&cfg.db_dir);
        Self { cfg, store }
    }

    pub fn config(&self) -> &GreylistConfig {
        &self.cfg
    }

    /// Run the ladder for one completed transaction. One lock
    /// acquire/release per call; the lock is never held across an await
    /// (nothing in here is async).
    pub fn check(&self, now: i64, remote_ip: &str, fprint: &str) -> Result<Decision, StoreError> {
        let mut db = self.store.open()?;

        let last_flushed = db
            .get(LASTFLUSHED)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        if now - last_flushed > self.cfg.flush_period {
            self.sweep(&mut db, now);
        }

        if let Some(seen) = db.get(remote_ip).and_then(|v| v.parse::<i64>().ok()) {
            if now - seen <= self.cfg.white_timeout {
                db.commit()?;
                return Ok(Decision::Whitelisted);
            }
            db.remove(remote_ip);
        }

        let decision = match db.get(fprint).map(str::to_string) {
            None => {
                db.insert(fprint, format_grey(now, 1));
                Decision::FirstSeen
            }
            Some(value) => match parse_grey(&value) {
                None => {
                    // Malformed fingerprint value; start over.
                    db.insert(fprint, format_grey(now, 1));
                    Decision::FirstSeen
                }
                Some((ts, count)) if now - ts < self.cfg.black_timeout => {
                    db.insert(fprint, format_grey(now, count + 1));
                    Decision::EarlyRetry(count + 1)
                }
                Some((ts, _)) if now - ts < self.cfg.grey_timeout => {
                    db.remove(fprint);
                    db.insert(remote_ip, now.to_string());
                    Decision::Promoted
                }
                Some(_) => {
                    db.remove(fprint);
                    Decision::Overdue
                }
            },
        };

        db.commit()?;
        Ok(decision)
    }

    /// Delete expired and malformed entries; record the sweep time.
    fn sweep(&self, db: &mut crate::store::StoreGuard, now: i64) {
        let cfg = &self.cfg;
        let removed = db.retain(|key, value| {
            if key == LASTFLUSHED {
                return true;
            }
            if key.parse::<Ipv4Addr>().is_ok() {
                return value
                    .parse::<i64>()
                    .is_ok_and(|seen| now - seen <= cfg.white_timeout);
            }
            if is_fingerprint(key) {
                return parse_grey(value).is_some_and(|(ts, _)| now - ts <= cfg.grey_timeout);
            }
            // Neither an IP, a fingerprint, nor the flush marker.
            false
        });

        if removed > 0 {
            tracing::debug!(removed, "greylist sweep");
        }
        db.insert(LASTFLUSHED, now.to_string());
    }
}

/// Anchored fingerprint test: exactly 32 lowercase hex digits.
fn is_fingerprint(key: &str) -> bool {
    key.len() == 32 && key.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}
