//! Durable persistence seam.
//!
//! Relational persistence is an external collaborator; the pipeline talks
//! to it only through the [`Store`] trait. [`MemoryStore`] is the
//! in-process reference backend used by tests and local runs. All queries
//! are bounded per-user, matching the indexes the production schema
//! carries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::model::{Alert, BlackboxTrail, Heartbeat, LastGasp, User};

/// Durable storage operations required by the safety pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_user(&self, user: &User) -> Result<(), StoreError>;
    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn create_heartbeat(&self, hb: &Heartbeat) -> Result<(), StoreError>;
    /// Newest heartbeat by client timestamp.
    async fn latest_heartbeat(&self, user_id: Uuid) -> Result<Option<Heartbeat>, StoreError>;
    /// Heartbeats with `timestamp >= since`, newest first.
    async fn heartbeats_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Heartbeat>, StoreError>;

    async fn create_last_gasp(&self, gasp: &LastGasp) -> Result<(), StoreError>;
    /// Newest LastGasp with `expiry_ts > now`. Expired rows stay in the
    /// store; they are filtered here, not swept.
    async fn active_last_gasp(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<LastGasp>, StoreError>;

    async fn create_alert(&self, alert: &Alert) -> Result<(), StoreError>;
    async fn alert_by_id(&self, id: Uuid) -> Result<Option<Alert>, StoreError>;
    /// All alerts for a user, newest first.
    async fn alerts_for_user(&self, user_id: Uuid) -> Result<Vec<Alert>, StoreError>;
    /// Record the contact phones that were actually notified.
    async fn set_alert_recipients(
        &self,
        alert_id: Uuid,
        sent_to: &[String],
    ) -> Result<(), StoreError>;
    /// Set `resolved_at` if it is still null. Unknown id is an error.
    async fn resolve_alert(
        &self,
        alert_id: Uuid,
        resolved_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn create_trail(&self, trail: &BlackboxTrail) -> Result<(), StoreError>;
    /// Most recent trails, newest upload first.
    async fn trails_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<BlackboxTrail>, StoreError>;
}

/// Store error types.
#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unreachable or query failed; callers may retry
    Unavailable(String),
    /// Referenced row does not exist
    NotFound(&'static str),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::NotFound(what) => write!(f, "{what} not found"),
        }
    }
}

impl std::error::Error for StoreError {}

/// In-memory reference backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    heartbeats: Vec<Heartbeat>,
    last_gasps: Vec<LastGasp>,
    alerts: HashMap<Uuid, Alert>,
    trails: Vec<BlackboxTrail>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.users.get(&id).cloned())
    }

    async fn create_heartbeat(&self, hb: &Heartbeat) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.heartbeats.push(hb.clone());
        Ok(())
    }

    async fn latest_heartbeat(&self, user_id: Uuid) -> Result<Option<Heartbeat>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .heartbeats
            .iter()
            .filter(|hb| hb.user_id == user_id)
            .max_by_key(|hb| hb.timestamp)
            .cloned())
    }

    async fn heartbeats_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Heartbeat>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Heartbeat> = inner
            .heartbeats
            .iter()
            .filter(|hb| hb.user_id == user_id && hb.timestamp >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(rows)
    }

    async fn create_last_gasp(&self, gasp: &LastGasp) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.last_gasps.push(gasp.clone());
        Ok(())
    }

    async fn active_last_gasp(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<LastGasp>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .last_gasps
            .iter()
            .filter(|lg| lg.user_id == user_id && lg.is_active(now))
            .max_by_key(|lg| lg.created_at)
            .cloned())
    }

    async fn create_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn alert_by_id(&self, id: Uuid) -> Result<Option<Alert>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.alerts.get(&id).cloned())
    }

    async fn alerts_for_user(&self, user_id: Uuid) -> Result<Vec<Alert>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Alert> = inner
            .alerts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn set_alert_recipients(
        &self,
        alert_id: Uuid,
        sent_to: &[String],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let alert = inner
            .alerts
            .get_mut(&alert_id)
            .ok_or(StoreError::NotFound("alert"))?;
        alert.sent_to = sent_to.to_vec();
        Ok(())
    }

    async fn resolve_alert(
        &self,
        alert_id: Uuid,
        resolved_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let alert = inner
            .alerts
            .get_mut(&alert_id)
            .ok_or(StoreError::NotFound("alert"))?;
        if alert.resolved_at.is_none() {
            alert.resolved_at = Some(resolved_at);
        }
        Ok(())
    }

    async fn create_trail(&self, trail: &BlackboxTrail) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.trails.push(trail.clone());
        Ok(())
    }

    async fn trails_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<BlackboxTrail>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<BlackboxTrail> = inner
            .trails
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertState, CellInfo, HeartbeatSource};
    use chrono::Duration;

    fn heartbeat(user_id: Uuid, at: DateTime<Utc>) -> Heartbeat {
        Heartbeat {
            id: Uuid::new_v4(),
            user_id,
            source: HeartbeatSource::Http,
            lat: 6.5244,
            lng: 3.3792,
            accuracy_m: 20,
            cell_info: CellInfo::default(),
            battery_pct: None,
            speed: None,
            last_gasp: false,
            timestamp: at,
            signature: String::new(),
            created_at: at,
        }
    }

    #[tokio::test]
    async fn test_latest_heartbeat_by_timestamp() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        store
            .create_heartbeat(&heartbeat(user_id, now - Duration::minutes(10)))
            .await
            .unwrap();
        let newest = heartbeat(user_id, now);
        store.create_heartbeat(&newest).await.unwrap();
        store
            .create_heartbeat(&heartbeat(user_id, now - Duration::minutes(5)))
            .await
            .unwrap();

        let latest = store.latest_heartbeat(user_id).await.unwrap().unwrap();
        assert_eq!(latest.id, newest.id);
    }

    #[tokio::test]
    async fn test_heartbeats_since_newest_first() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        for minutes in [10, 2, 6] {
            store
                .create_heartbeat(&heartbeat(user_id, now - Duration::minutes(minutes)))
                .await
                .unwrap();
        }

        let rows = store
            .heartbeats_since(user_id, now - Duration::minutes(7))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].timestamp > rows[1].timestamp);
    }

    #[tokio::test]
    async fn test_active_last_gasp_newest_nonexpired_wins() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        let expired = LastGasp {
            id: Uuid::new_v4(),
            user_id,
            lat: 0.0,
            lng: 0.0,
            accuracy_m: 50,
            cell_info: CellInfo::default(),
            created_at: now - Duration::hours(3),
            expiry_ts: now - Duration::hours(2),
        };
        let active = LastGasp {
            created_at: now - Duration::minutes(5),
            expiry_ts: now + Duration::minutes(55),
            ..expired.clone()
        };
        let older_active = LastGasp {
            created_at: now - Duration::minutes(30),
            expiry_ts: now + Duration::minutes(30),
            ..expired.clone()
        };

        store.create_last_gasp(&expired).await.unwrap();
        store.create_last_gasp(&active).await.unwrap();
        store.create_last_gasp(&older_active).await.unwrap();

        let found = store.active_last_gasp(user_id, now).await.unwrap().unwrap();
        assert_eq!(found.created_at, active.created_at);

        // After everything expires, nothing is active.
        let later = now + Duration::hours(2);
        assert!(store.active_last_gasp(user_id, later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_alert_unknown_id() {
        let store = MemoryStore::new();
        let err = store
            .resolve_alert(Uuid::new_v4(), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound("alert"));
    }

    #[tokio::test]
    async fn test_resolve_alert_keeps_first_resolution_time() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let alert = Alert {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            state: AlertState::AtRisk,
            score: 30,
            reason: "test".to_string(),
            sent_to: Vec::new(),
            created_at: now,
            resolved_at: None,
        };
        store.create_alert(&alert).await.unwrap();

        store.resolve_alert(alert.id, now).await.unwrap();
        store
            .resolve_alert(alert.id, now + Duration::minutes(10))
            .await
            .unwrap();

        let stored = store.alert_by_id(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.resolved_at, Some(now));
    }
}
