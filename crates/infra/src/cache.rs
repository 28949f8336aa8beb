//! Cache invalidation consumed by job handlers.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskforge_core::UserId;

/// Cache error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("invalid cache pattern: {0}")]
    InvalidPattern(String),
}

/// Well-known cache keys.
pub struct CacheKeys;

impl CacheKeys {
    pub fn user_progress(user_id: UserId) -> String {
        format!("user:{user_id}:progress")
    }

    pub fn financial_accounts(user_id: UserId) -> String {
        format!("user:{user_id}:financial_accounts")
    }

    pub fn transactions(user_id: UserId) -> String {
        format!("user:{user_id}:transactions")
    }

    pub fn analytics(user_id: UserId) -> String {
        format!("user:{user_id}:analytics")
    }

    /// Every key derived from a user.
    pub fn for_user(user_id: UserId) -> [String; 4] {
        [
            Self::user_progress(user_id),
            Self::financial_accounts(user_id),
            Self::transactions(user_id),
            Self::analytics(user_id),
        ]
    }
}

/// Invalidation operations; all return the number of entries removed.
#[async_trait]
pub trait CacheInvalidation: Send + Sync {
    /// Drop every entry derived from a user.
    async fn invalidate_user(&self, user_id: UserId) -> Result<usize, CacheError>;

    /// Drop entries matching `pattern` (`prefix*` or an exact key).
    async fn clear_pattern(&self, pattern: &str) -> Result<usize, CacheError>;

    /// Drop entries whose TTL has elapsed.
    async fn clear_expired(&self) -> Result<usize, CacheError>;
}

#[async_trait]
impl<C> CacheInvalidation for Arc<C>
where
    C: CacheInvalidation + ?Sized,
{
    async fn invalidate_user(&self, user_id: UserId) -> Result<usize, CacheError> {
        (**self).invalidate_user(user_id).await
    }

    async fn clear_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        (**self).clear_pattern(pattern).await
    }

    async fn clear_expired(&self) -> Result<usize, CacheError> {
        (**self).clear_expired().await
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

/// In-memory TTL cache for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set(&self, key: impl Into<String>, value: serde_json::Value, ttl: Duration) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Entry { value, expires_at });
    }

    /// Live (unexpired) value for `key`.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|e| e.expires_at > Utc::now())
            .map(|e| e.value.clone())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_where(&self, mut pred: impl FnMut(&str, &Entry) -> bool) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|k, e| !pred(k, e));
        before - entries.len()
    }
}

#[async_trait]
impl CacheInvalidation for InMemoryCache {
    async fn invalidate_user(&self, user_id: UserId) -> Result<usize, CacheError> {
        let keys = CacheKeys::for_user(user_id);
        Ok(self.remove_where(|k, _| keys.iter().any(|key| key == k)))
    }

    async fn clear_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern == "*" {
            return Err(CacheError::InvalidPattern(pattern.to_string()));
        }

        let removed = match pattern.strip_suffix('*') {
            Some(prefix) => self.remove_where(|k, _| k.starts_with(prefix)),
            None => self.remove_where(|k, _| k == pattern),
        };
        Ok(removed)
    }

    async fn clear_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        Ok(self.remove_where(|_, e| e.expires_at <= now))
    }
}
