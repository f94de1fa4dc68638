//! Heartbeat intake for both transports.
//!
//! HTTP and SMS heartbeats converge on [`RawHeartbeat`] after
//! authentication; only the verification step differs (canonical JSON for
//! HTTP, raw signed-region bytes for SMS). Synchronous failures are
//! terminal for the request and never reach the evaluator; the evaluation
//! itself runs as a detached task so the ingress response never waits on
//! it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{CacheError, StateCache};
use crate::clock::SharedClock;
use crate::evaluator::SafetyEvaluator;
use crate::lastgasp::LastGaspTracker;
use crate::model::{CellInfo, Heartbeat, HeartbeatSource, RawHeartbeat, User};
use crate::signer::{CanonicalHeartbeat, Signer, SignerError};
use crate::sms;
use crate::store::{Store, StoreError};

/// At most one heartbeat per user per window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(30);
const RATE_LIMIT_MAX: u64 = 1;

/// JSON body of `POST /v1/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: u32,
    pub cell_info: CellInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default)]
    pub last_gasp: bool,
    pub signature: String,
}

/// Outcome of an SMS webhook delivery. The webhook always answers 200 to
/// keep the provider from retrying; rejections carry a human-readable note
/// for the response body.
#[derive(Debug)]
pub enum SmsOutcome {
    Accepted(Heartbeat),
    Rejected(&'static str),
}

/// Authenticates, rate-limits, and persists heartbeats, then hands off to
/// the evaluator.
pub struct Ingress {
    store: Arc<dyn Store>,
    cache: Arc<dyn StateCache>,
    signer: Signer,
    lastgasp: Arc<LastGaspTracker>,
    evaluator: Arc<SafetyEvaluator>,
    clock: SharedClock,
}

impl Ingress {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn StateCache>,
        signer: Signer,
        lastgasp: Arc<LastGaspTracker>,
        evaluator: Arc<SafetyEvaluator>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            cache,
            signer,
            lastgasp,
            evaluator,
            clock,
        }
    }

    /// Ingest a structured HTTP heartbeat.
    pub async fn ingest_http(&self, req: HeartbeatRequest) -> Result<Heartbeat, IngressError> {
        let user_id = Uuid::parse_str(&req.user_id)
            .map_err(|_| IngressError::BadRequest("invalid user_id".to_string()))?;

        if let Some(battery) = req.battery_pct {
            if battery > 100 {
                return Err(IngressError::BadRequest(
                    "battery_pct out of range".to_string(),
                ));
            }
        }
        if let Some(speed) = req.speed {
            if speed < 0.0 {
                return Err(IngressError::BadRequest("speed out of range".to_string()));
            }
        }

        let allowed = self
            .cache
            .check_rate_limit(user_id, RATE_LIMIT_WINDOW, RATE_LIMIT_MAX)
            .await?;
        if !allowed {
            return Err(IngressError::RateLimited);
        }

        self.resolve_user(user_id).await?;

        let canonical = CanonicalHeartbeat {
            user_id: req.user_id.clone(),
            timestamp: req.timestamp.timestamp(),
            lat: req.lat,
            lng: req.lng,
            accuracy_m: req.accuracy_m,
            cell_info: req.cell_info.clone(),
            battery_pct: req.battery_pct,
            speed: req.speed,
            last_gasp: req.last_gasp,
        };
        match self.signer.verify_structured(&canonical, &req.signature) {
            Ok(()) => {}
            Err(SignerError::InvalidSignature) => return Err(IngressError::Unauthorized),
            Err(SignerError::Serialization(msg)) => return Err(IngressError::Unavailable(msg)),
        }

        let raw = RawHeartbeat {
            user_id,
            source: HeartbeatSource::Http,
            lat: req.lat,
            lng: req.lng,
            accuracy_m: req.accuracy_m,
            cell_info: req.cell_info,
            battery_pct: req.battery_pct,
            speed: req.speed,
            last_gasp: req.last_gasp,
            timestamp: req.timestamp,
            signature: req.signature,
        };

        let heartbeat = self.persist(raw).await?;
        self.spawn_evaluation(user_id);
        Ok(heartbeat)
    }

    /// Ingest an SMS heartbeat body delivered by the provider webhook.
    pub async fn ingest_sms(&self, body: &str) -> SmsOutcome {
        let raw = match sms::parse(body) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("unparseable SMS heartbeat: {e}");
                return SmsOutcome::Rejected("Message received but could not be parsed");
            }
        };

        // The signed bytes are the body with the signature suffix stripped.
        let Some(signed) = sms::signed_region(body) else {
            return SmsOutcome::Rejected("Invalid signature");
        };
        if self
            .signer
            .verify_raw(signed.as_bytes(), &raw.signature)
            .is_err()
        {
            tracing::warn!(user_id = %raw.user_id, "SMS heartbeat failed verification");
            return SmsOutcome::Rejected("Invalid signature");
        }

        match self.resolve_user(raw.user_id).await {
            Ok(_) => {}
            Err(IngressError::UserNotFound) => return SmsOutcome::Rejected("User not found"),
            Err(e) => {
                tracing::error!("SMS user lookup failed: {e}");
                return SmsOutcome::Rejected("Storage error");
            }
        }

        let user_id = raw.user_id;
        let heartbeat = match self.persist(raw).await {
            Ok(hb) => hb,
            Err(e) => {
                tracing::error!(user_id = %user_id, "SMS heartbeat persist failed: {e}");
                return SmsOutcome::Rejected("Storage error");
            }
        };

        self.spawn_evaluation(user_id);
        SmsOutcome::Accepted(heartbeat)
    }

    /// Shared post-authentication path: assign id and receive time,
    /// persist, and record a LastGasp marker when flagged.
    async fn persist(&self, raw: RawHeartbeat) -> Result<Heartbeat, IngressError> {
        let heartbeat = raw.into_heartbeat(Uuid::new_v4(), self.clock.now());
        self.store.create_heartbeat(&heartbeat).await?;

        if heartbeat.last_gasp {
            // The heartbeat is already persisted; a marker failure must not
            // fail the request.
            if let Err(e) = self.lastgasp.record(&heartbeat).await {
                tracing::error!(user_id = %heartbeat.user_id, "failed to record LastGasp: {e}");
            }
        }

        Ok(heartbeat)
    }

    async fn resolve_user(&self, user_id: Uuid) -> Result<User, IngressError> {
        self.store
            .user_by_id(user_id)
            .await?
            .ok_or(IngressError::UserNotFound)
    }

    /// Detach an evaluation run from the request lifecycle. The task
    /// carries no request context and honors only process shutdown.
    fn spawn_evaluation(&self, user_id: Uuid) {
        let evaluator = self.evaluator.clone();
        tokio::spawn(async move {
            if let Err(e) = evaluator.evaluate(user_id).await {
                tracing::error!(user_id = %user_id, "safety evaluation failed: {e}");
            }
        });
    }
}

/// Ingress error types, mapped onto HTTP statuses by the server layer.
#[derive(Debug)]
pub enum IngressError {
    /// Malformed body or invalid id (400)
    BadRequest(String),
    /// Signature mismatch (401)
    Unauthorized,
    /// Unknown user (404)
    UserNotFound,
    /// Heartbeat cadence exceeded (429)
    RateLimited,
    /// Store or cache failure (500)
    Unavailable(String),
}

impl std::fmt::Display for IngressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngressError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            IngressError::Unauthorized => write!(f, "invalid signature"),
            IngressError::UserNotFound => write!(f, "user not found"),
            IngressError::RateLimited => write!(f, "rate limit exceeded"),
            IngressError::Unavailable(msg) => write!(f, "backend unavailable: {msg}"),
        }
    }
}

impl std::error::Error for IngressError {}

impl From<StoreError> for IngressError {
    fn from(e: StoreError) -> Self {
        IngressError::Unavailable(e.to_string())
    }
}

impl From<CacheError> for IngressError {
    fn from(e: CacheError) -> Self {
        IngressError::Unavailable(e.to_string())
    }
}
