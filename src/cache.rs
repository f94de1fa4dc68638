//! Volatile per-user state seam.
//!
//! The StateCache holds everything that expires: the current safety state
//! (24 h), the heartbeat rate-limit counter (fixed window), the alert dedup
//! mark (5 min), and the optional user cache. Keys are per-user
//! (`user:state:<uuid>`, `ratelimit:<uuid>`, `alert:sent:<uuid>`,
//! `user:cache:<uuid>`), so there is no cross-user contention.
//!
//! [`MemoryStateCache`] is the in-process reference backend; it implements
//! the same key/TTL semantics against an injected [`Clock`], so tests
//! advance time instead of sleeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::model::{User, UserState};

/// Volatile state operations required by the safety pipeline.
#[async_trait]
pub trait StateCache: Send + Sync {
    async fn set_user_state(&self, state: &UserState, ttl: Duration) -> Result<(), CacheError>;
    async fn user_state(&self, user_id: Uuid) -> Result<Option<UserState>, CacheError>;

    /// Fixed-window counter with TTL. Returns whether this request is
    /// within the limit.
    async fn check_rate_limit(
        &self,
        user_id: Uuid,
        window: Duration,
        limit: u64,
    ) -> Result<bool, CacheError>;

    async fn alert_sent(&self, user_id: Uuid) -> Result<bool, CacheError>;
    async fn mark_alert_sent(&self, user_id: Uuid, ttl: Duration) -> Result<(), CacheError>;

    async fn cache_user(&self, user: &User, ttl: Duration) -> Result<(), CacheError>;
    async fn cached_user(&self, user_id: Uuid) -> Result<Option<User>, CacheError>;
}

/// StateCache error types.
#[derive(Debug, PartialEq, Eq)]
pub enum CacheError {
    Unavailable(String),
    Serialization(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Unavailable(msg) => write!(f, "state cache unavailable: {msg}"),
            CacheError::Serialization(msg) => write!(f, "state cache serialization: {msg}"),
        }
    }
}

impl std::error::Error for CacheError {}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory reference backend with Redis-shaped key/TTL semantics.
pub struct MemoryStateCache {
    clock: SharedClock,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStateCache {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn set(&self, key: String, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| {
            self.clock.now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
        });
        self.entries
            .lock()
            .unwrap()
            .insert(key, Entry { value, expires_at });
    }

    fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let entries = self.entries.lock().unwrap();
        entries.get(key).and_then(|entry| {
            match entry.expires_at {
                Some(expiry) if expiry <= now => None,
                _ => Some(entry.value.clone()),
            }
        })
    }

    fn state_key(user_id: Uuid) -> String {
        format!("user:state:{user_id}")
    }

    fn ratelimit_key(user_id: Uuid) -> String {
        format!("ratelimit:{user_id}")
    }

    fn alert_key(user_id: Uuid) -> String {
        format!("alert:sent:{user_id}")
    }

    fn user_key(user_id: Uuid) -> String {
        format!("user:cache:{user_id}")
    }
}

#[async_trait]
impl StateCache for MemoryStateCache {
    async fn set_user_state(&self, state: &UserState, ttl: Duration) -> Result<(), CacheError> {
        let json = serde_json::to_string(state)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set(Self::state_key(state.user_id), json, Some(ttl));
        Ok(())
    }

    async fn user_state(&self, user_id: Uuid) -> Result<Option<UserState>, CacheError> {
        match self.get(&Self::state_key(user_id)) {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn check_rate_limit(
        &self,
        user_id: Uuid,
        window: Duration,
        limit: u64,
    ) -> Result<bool, CacheError> {
        let key = Self::ratelimit_key(user_id);
        let count = match self.get(&key) {
            Some(value) => {
                let count: u64 = value
                    .parse()
                    .map_err(|_| CacheError::Serialization("rate-limit counter".to_string()))?;
                let count = count + 1;
                // Increment without touching the window expiry.
                let mut entries = self.entries.lock().unwrap();
                if let Some(entry) = entries.get_mut(&key) {
                    entry.value = count.to_string();
                }
                count
            }
            None => {
                // First request opens the window.
                self.set(key, "1".to_string(), Some(window));
                1
            }
        };

        Ok(count <= limit)
    }

    async fn alert_sent(&self, user_id: Uuid) -> Result<bool, CacheError> {
        Ok(self.get(&Self::alert_key(user_id)).is_some())
    }

    async fn mark_alert_sent(&self, user_id: Uuid, ttl: Duration) -> Result<(), CacheError> {
        self.set(Self::alert_key(user_id), "1".to_string(), Some(ttl));
        Ok(())
    }

    async fn cache_user(&self, user: &User, ttl: Duration) -> Result<(), CacheError> {
        let json =
            serde_json::to_string(user).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set(Self::user_key(user.id), json, Some(ttl));
        Ok(())
    }

    async fn cached_user(&self, user_id: Uuid) -> Result<Option<User>, CacheError> {
        match self.get(&Self::user_key(user_id)) {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }
}
