//! Query response cache.
//!
//! Keys are HMAC-SHA256 digests over the normalized question and the
//! caller's context, so a key never reveals the question and cannot be
//! forged without the server secret.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use clinic_core::query::{QueryRequest, QueryResult};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use sha2::Sha256;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Cache backend failure. Always handled fail-soft by the orchestrator.
#[derive(Debug, Error)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);

/// Derives cache keys from query requests.
pub struct CacheKeyer {
    secret: SecretString,
}

impl CacheKeyer {
    /// Keyer with an explicit secret.
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    /// Keyer from a configured secret; an empty one is replaced by 32
    /// random bytes (keys then only live as long as the process).
    pub fn from_config(secret: &SecretString) -> Self {
        if secret.expose_secret().is_empty() {
            debug!("no cache key secret configured, generating one");
            Self::new(SecretString::new(hex::encode(rand::random::<[u8; 32]>())))
        } else {
            Self::new(secret.clone())
        }
    }

    /// Hex-encoded key for `request`.
    pub fn key(&self, request: &QueryRequest) -> String {
        let preferences: BTreeMap<&String, &serde_json::Value> = request.context.preferences.iter().collect();
        let material = json!({
            "q": normalize_query(&request.query),
            "user": request.user_id.as_str(),
            "patient": request.context.patient_id,
            "topics": request.context.previous_topics,
            "preferences": preferences,
            "maxResults": request.options.max_results,
        });
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(material.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Trim, lowercase and collapse internal whitespace.
pub fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Storage for cached results.
#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Live entry for `key`.
    async fn get(&self, key: &str) -> Result<Option<QueryResult>, CacheError>;

    /// Store `result` under `key` for `ttl`.
    async fn put(&self, key: &str, result: &QueryResult, ttl: Duration) -> Result<(), CacheError>;
}

struct CacheEntry {
    result: QueryResult,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Bounded in-process cache with per-entry TTL.
pub struct InMemoryQueryCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
}

impl InMemoryQueryCache {
    /// Cache holding at most `max_entries` results.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Drop expired entries. Returns how many.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.inserted_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            let _ = self.entries.remove(&key);
        }
    }

    /// Stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl QueryCache for InMemoryQueryCache {
    async fn get(&self, key: &str) -> Result<Option<QueryResult>, CacheError> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.result.clone());
        if hit.is_none() {
            let _ = self.entries.remove_if(key, |_, e| e.expires_at <= now);
        }
        Ok(hit)
    }

    async fn put(&self, key: &str, result: &QueryResult, ttl: Duration) -> Result<(), CacheError> {
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            let _ = self.purge_expired();
            while self.entries.len() >= self.max_entries {
                self.evict_oldest();
            }
        }
        let now = Instant::now();
        let _ = self.entries.insert(
            key.to_owned(),
            CacheEntry {
                result: result.clone(),
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }
}
