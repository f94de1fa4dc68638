//! LastGasp tracking.
//!
//! A LastGasp is an explicit "last known location" marker recorded when a
//! heartbeat arrives with the `last_gasp` flag. Markers expire by wall
//! clock; overlapping entries may coexist and the newest non-expired one
//! wins. Expired rows are filtered out of queries, not swept.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::model::{Heartbeat, LastGasp};
use crate::store::{Store, StoreError};

/// Records and queries emergency location markers.
pub struct LastGaspTracker {
    store: Arc<dyn Store>,
    clock: SharedClock,
    timeout: Duration,
}

impl LastGaspTracker {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    /// Persist a marker for a heartbeat that carried the LastGasp flag.
    ///
    /// The marker lives for the configured timeout from now, independent of
    /// the heartbeat's own timestamp.
    pub async fn record(&self, hb: &Heartbeat) -> Result<LastGasp, StoreError> {
        let now = self.clock.now();
        let gasp = LastGasp {
            id: Uuid::new_v4(),
            user_id: hb.user_id,
            lat: hb.lat,
            lng: hb.lng,
            accuracy_m: hb.accuracy_m,
            cell_info: hb.cell_info.clone(),
            created_at: now,
            expiry_ts: now
                + chrono::Duration::from_std(self.timeout)
                    .unwrap_or_else(|_| chrono::Duration::zero()),
        };
        self.store.create_last_gasp(&gasp).await?;
        Ok(gasp)
    }

    /// The newest non-expired marker for a user, if any.
    pub async fn active(&self, user_id: Uuid) -> Result<Option<LastGasp>, StoreError> {
        self.store.active_last_gasp(user_id, self.clock.now()).await
    }
}
