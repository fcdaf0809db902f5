use crate::signature::SourceSignature;
use crate::store::{StoreError, TtlCache};
use crate::thumbnails::ResizeKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

const LOCK_PREFIX: &str = "gv_thumb_lock_";
const FAILURE_PREFIX: &str = "gv_thumb_fail_";

/// Short-lived advisory lock so only one caller resizes a given key.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    cache: Arc<dyn TtlCache>,
    ttl: Duration,
}

impl ConcurrencyGuard {
    pub fn new(cache: Arc<dyn TtlCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// `None` when another caller holds the lock or the cache is unavailable.
    pub fn acquire(&self, key: &ResizeKey) -> Option<LockToken> {
        let cache_key = lock_key(key);
        match self.cache.try_acquire(&cache_key, self.ttl) {
            Ok(true) => Some(LockToken {
                cache: Arc::clone(&self.cache),
                key: cache_key,
            }),
            Ok(false) => None,
            Err(err) => {
                warn!(key = %key, error = %err, "cannot acquire resize lock");
                None
            }
        }
    }
}

/// Releases its lock when dropped, on every exit path including unwinding.
pub struct LockToken {
    cache: Arc<dyn TtlCache>,
    key: String,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if let Err(err) = self.cache.delete(&self.key) {
            warn!(key = %self.key, error = %err, "failed to release resize lock; it will expire");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub message: String,
    pub time: String,
}

/// Remembers recent resize failures per key and source signature.
#[derive(Clone)]
pub struct FailureMemo {
    cache: Arc<dyn TtlCache>,
    ttl: Duration,
}

impl FailureMemo {
    pub fn new(cache: Arc<dyn TtlCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn has_recent_failure(&self, key: &ResizeKey, sig: &SourceSignature) -> bool {
        self.recent_failure(key, sig).is_some()
    }

    pub fn recent_failure(&self, key: &ResizeKey, sig: &SourceSignature) -> Option<FailureRecord> {
        match self.cache.get(&failure_key(key, sig)) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(record) => Some(record),
                Err(_) => Some(FailureRecord {
                    message: raw,
                    time: String::new(),
                }),
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key = %key, error = %err, "cannot read failure memo");
                None
            }
        }
    }

    pub fn record(&self, key: &ResizeKey, sig: &SourceSignature, message: &str) {
        let record = FailureRecord {
            message: message.to_string(),
            time: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        };
        let stored = serde_json::to_string(&record)
            .map_err(StoreError::from)
            .and_then(|raw| self.cache.set(&failure_key(key, sig), &raw, self.ttl));
        if let Err(err) = stored {
            warn!(key = %key, error = %err, "cannot record resize failure");
        }
    }
}

fn lock_key(key: &ResizeKey) -> String {
    format!("{}{}", LOCK_PREFIX, key)
}

fn failure_key(key: &ResizeKey, sig: &SourceSignature) -> String {
    format!("{}{}_{}", FAILURE_PREFIX, key, sig)
}
