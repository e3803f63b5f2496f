//! Content-addressed result cache.
//!
//! Keys are SHA-256 fingerprints over the service id, the input payload
//! handle, the settings (map order ignored) and the sub-command sequence
//! (order kept). Entries are never merged: a write replaces, last writer wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::config::CacheConfig;
use crate::request::{PayloadRef, ProcessingRequest, Settings, SubCommand};
use crate::scheduler::job::ExecutionMode;

/// Stable hash identifying semantically identical requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(
        service_id: &str,
        payload: &PayloadRef,
        settings: &Settings,
        sub_commands: &[SubCommand],
    ) -> Self {
        let mut hasher = Sha256::new();
        write_str(&mut hasher, service_id);
        write_str(&mut hasher, payload.as_str());

        write_len(&mut hasher, settings.len());
        // BTreeMap iterates in key order, so insertion order never matters.
        for (name, value) in settings {
            write_str(&mut hasher, name);
            write_value(&mut hasher, value);
        }

        write_len(&mut hasher, sub_commands.len());
        for cmd in sub_commands {
            write_str(&mut hasher, &cmd.id);
            write_value(&mut hasher, &cmd.payload);
            write_len(&mut hasher, cmd.depends_on.len());
            for dep in &cmd.depends_on {
                write_str(&mut hasher, dep);
            }
            hasher.update(cmd.order_hint.to_le_bytes());
        }

        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn of(request: &ProcessingRequest) -> Self {
        Self::compute(
            &request.service_id,
            &request.payload_ref,
            &request.settings,
            &request.sub_commands,
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_le_bytes());
}

fn write_str(hasher: &mut Sha256, s: &str) {
    write_len(hasher, s.len());
    hasher.update(s.as_bytes());
}

fn write_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, u8::from(*b)]),
        Value::Number(n) => {
            hasher.update([2u8]);
            write_str(hasher, &n.to_string());
        }
        Value::String(s) => {
            hasher.update([3u8]);
            write_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update([4u8]);
            write_len(hasher, items.len());
            for item in items {
                write_value(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update([5u8]);
            write_len(hasher, map.len());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                write_str(hasher, key);
                write_value(hasher, &map[key]);
            }
        }
    }
}

/// Immutable cached result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub payload_ref: PayloadRef,
    pub mode: ExecutionMode,
    pub model_used: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    stored_at: Instant,
}

impl CacheEntry {
    pub fn new(payload_ref: PayloadRef, mode: ExecutionMode, model_used: impl Into<String>) -> Self {
        Self {
            payload_ref,
            mode,
            model_used: model_used.into(),
            created_at: Utc::now(),
            stored_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.stored_at) >= ttl
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct Stored {
    seq: u64,
    entry: CacheEntry,
}

/// Fingerprint → result store shared by all jobs.
#[derive(Debug)]
pub struct CacheStore {
    entries: RwLock<HashMap<Fingerprint, Stored>>,
    next_seq: AtomicU64,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            ttl: Duration::from_secs(config.ttl_secs),
            max_entries: config.max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &Fingerprint) -> Option<CacheEntry> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(stored) if !stored.entry.is_expired(self.ttl, now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key, "Cache hit");
                    return Some(stored.entry.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Expired: drop it unless a fresher write raced in.
        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|s| s.entry.is_expired(self.ttl, Instant::now()))
        {
            entries.remove(key);
            tracing::debug!(key = %key, "Cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `entry` under `key`, replacing any previous entry.
    pub async fn put(&self, key: Fingerprint, entry: CacheEntry) {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let now = Instant::now();
            entries.retain(|_, s| !s.entry.is_expired(self.ttl, now));
            if entries.len() >= self.max_entries {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, s)| s.seq)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        tracing::debug!(key = %key, payload = %entry.payload_ref, "Cache write");
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        entries.insert(key, Stored { seq, entry });
    }

    pub async fn invalidate(&self, key: &Fingerprint) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len().await,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
