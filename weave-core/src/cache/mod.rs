//! cache — time-bounded "last confirmed appearance" store for known identities
//!
//! One entry per identity, last write wins.  Entries are never evicted in the
//! background: validity (`now - timestamp <= window`) is decided at read time,
//! so a stale entry simply stops matching.
//!
//! The backing store may live behind blocking I/O (a vector database), so all
//! backend calls go through [`RetryPolicy::run`].  Writes take `&mut self`; a
//! caller that shares the cache across threads must put it behind a lock,
//! which gives the single-writer discipline for free.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::detection::Embedding;
use crate::identity::{nearest, IdentityId, SimilarityMatch};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identity: IdentityId,
    pub embedding: Embedding,
    pub timestamp: NaiveDateTime,
}

/// Storage behind the identity cache.
pub trait CacheBackend: Send + Sync {
    fn read(&self, identity: IdentityId) -> Result<Option<CacheEntry>>;

    /// Overwrite the entry for `entry.identity`.
    fn write(&mut self, entry: CacheEntry) -> Result<()>;

    /// All stored entries, valid or not.
    fn entries(&self) -> Result<Vec<CacheEntry>>;
}

/// In-process backend keyed by identity id.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: BTreeMap<IdentityId, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheBackend for MemoryCache {
    fn read(&self, identity: IdentityId) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(&identity).cloned())
    }

    fn write(&mut self, entry: CacheEntry) -> Result<()> {
        self.entries.insert(entry.identity, entry);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<CacheEntry>> {
        Ok(self.entries.values().cloned().collect())
    }
}

// ── Retry ────────────────────────────────────────────────────────────────────

/// Bounded retry with exponential backoff for store calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// No retries and no sleeping.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Run `op` until it succeeds or `max_attempts` is exhausted, returning
    /// the last error.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.max_attempts.max(1);
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "store call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= attempts => {
                    return Err(e.context(format!("{operation} failed after {attempt} attempts")));
                }
                Err(e) => {
                    warn!(
                        operation,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "store call failed, retrying: {e:#}"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    delay = (delay * 2).min(self.max_delay);
                    attempt += 1;
                }
            }
        }
    }
}

// ── IdentityCache ────────────────────────────────────────────────────────────

pub struct IdentityCache<B: CacheBackend = MemoryCache> {
    backend: B,
    validity: TimeDelta,
    retry: RetryPolicy,
    writes: u64,
}

impl IdentityCache<MemoryCache> {
    pub fn in_memory(validity: TimeDelta) -> Self {
        Self::new(MemoryCache::new(), validity, RetryPolicy::default())
    }
}

impl<B: CacheBackend> IdentityCache<B> {
    pub fn new(backend: B, validity: TimeDelta, retry: RetryPolicy) -> Self {
        Self {
            backend,
            validity,
            retry,
            writes: 0,
        }
    }

    pub fn validity(&self) -> TimeDelta {
        self.validity
    }

    pub fn is_valid(&self, entry: &CacheEntry, now: NaiveDateTime) -> bool {
        now - entry.timestamp <= self.validity
    }

    /// The entry for `identity`, if present and still inside the window.
    pub fn read(&self, identity: IdentityId, now: NaiveDateTime) -> Result<Option<CacheEntry>> {
        let entry = self
            .retry
            .run("cache read", || self.backend.read(identity))?;
        Ok(entry.filter(|e| self.is_valid(e, now)))
    }

    /// Best valid entry for a body embedding.  Ties go to the smallest id.
    pub fn nearest(&self, body: &Embedding, now: NaiveDateTime) -> Result<Option<SimilarityMatch>> {
        let entries = self.retry.run("cache scan", || self.backend.entries())?;
        Ok(nearest(entries.iter().filter(|e| self.is_valid(e, now)).map(
            |e| SimilarityMatch {
                identity: e.identity,
                similarity: body.cosine(&e.embedding),
            },
        )))
    }

    pub fn write(
        &mut self,
        identity: IdentityId,
        embedding: Embedding,
        timestamp: NaiveDateTime,
    ) -> Result<()> {
        let entry = CacheEntry {
            identity,
            embedding,
            timestamp,
        };
        let backend = &mut self.backend;
        self.retry
            .run("cache write", || backend.write(entry.clone()))?;
        self.writes += 1;
        debug!(identity, %timestamp, "identity cache refreshed");
        Ok(())
    }

    /// Load an initial snapshot.  Later timestamps win when a snapshot names
    /// the same identity twice.
    pub fn seed<I: IntoIterator<Item = CacheEntry>>(&mut self, entries: I) -> Result<usize> {
        let mut latest: BTreeMap<IdentityId, CacheEntry> = BTreeMap::new();
        for entry in entries {
            match latest.get(&entry.identity) {
                Some(existing) if existing.timestamp > entry.timestamp => {}
                _ => {
                    latest.insert(entry.identity, entry);
                }
            }
        }
        let count = latest.len();
        for entry in latest.into_values() {
            let backend = &mut self.backend;
            self.retry
                .run("cache seed", || backend.write(entry.clone()))?;
        }
        Ok(count)
    }

    pub fn snapshot(&self) -> Result<Vec<CacheEntry>> {
        self.retry.run("cache snapshot", || self.backend.entries())
    }

    /// Number of writes since construction (seeding excluded).
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use chrono::NaiveDate;
    use std::cell::Cell;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 9, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    #[test]
    fn write_overwrites_previous_entry() {
        let mut cache = IdentityCache::in_memory(TimeDelta::hours(24));
        cache.write(1, emb(&[1.0, 0.0]), at(9, 0, 0)).unwrap();
        cache.write(1, emb(&[0.0, 1.0]), at(9, 5, 0)).unwrap();
        let entry = cache.read(1, at(9, 6, 0)).unwrap().unwrap();
        assert_eq!(entry.embedding, emb(&[0.0, 1.0]));
        assert_eq!(entry.timestamp, at(9, 5, 0));
        assert_eq!(cache.backend().len(), 1);
        assert_eq!(cache.write_count(), 2);
    }

    #[test]
    fn validity_is_checked_lazily_at_read_time() {
        let mut cache = IdentityCache::in_memory(TimeDelta::minutes(10));
        cache.write(7, emb(&[1.0, 0.0]), at(9, 0, 0)).unwrap();
        assert!(cache.read(7, at(9, 10, 0)).unwrap().is_some());
        assert!(cache.read(7, at(9, 10, 1)).unwrap().is_none());
        // Still stored, just not valid.
        assert_eq!(cache.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn nearest_skips_expired_and_breaks_ties_by_smallest_id() {
        let mut cache = IdentityCache::in_memory(TimeDelta::minutes(10));
        cache.write(5, emb(&[1.0, 0.0]), at(9, 0, 0)).unwrap();
        cache.write(3, emb(&[1.0, 0.0]), at(9, 0, 0)).unwrap();
        cache.write(1, emb(&[1.0, 0.0]), at(8, 0, 0)).unwrap();
        let m = cache.nearest(&emb(&[1.0, 0.0]), at(9, 1, 0)).unwrap().unwrap();
        assert_eq!(m.identity, 3);
        assert!((m.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn seed_keeps_latest_sample_per_identity() {
        let mut cache = IdentityCache::in_memory(TimeDelta::hours(1));
        let n = cache
            .seed(vec![
                CacheEntry {
                    identity: 2,
                    embedding: emb(&[0.0, 1.0]),
                    timestamp: at(9, 30, 0),
                },
                CacheEntry {
                    identity: 2,
                    embedding: emb(&[1.0, 0.0]),
                    timestamp: at(9, 0, 0),
                },
            ])
            .unwrap();
        assert_eq!(n, 1);
        let entry = cache.read(2, at(9, 31, 0)).unwrap().unwrap();
        assert_eq!(entry.embedding, emb(&[0.0, 1.0]));
        assert_eq!(cache.write_count(), 0);
    }

    #[test]
    fn retry_recovers_from_transient_failures() {
        let calls = Cell::new(0);
        let value = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
        .run("flaky", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(anyhow!("connection reset"))
            } else {
                Ok(42)
            }
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let err = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
        .run("down", || -> Result<()> {
            calls.set(calls.get() + 1);
            Err(anyhow!("refused"))
        })
        .unwrap_err();
        assert_eq!(calls.get(), 2);
        assert!(format!("{err:#}").contains("down failed after 2 attempts"));
    }
}
