//! Per-user safety evaluation.
//!
//! The evaluator decides a [`SafetyState`] for a user from the latest
//! persisted heartbeat, in strict order:
//!
//! 1. an active LastGasp dominates everything (WAIT_LASTGASP),
//! 2. no heartbeat yet bootstraps to SAFE,
//! 3. deterministic rules (recent LastGasp flag, stale heartbeat) override
//!    scoring,
//! 4. otherwise a composite 0..100 score maps onto SAFE / CAUTION /
//!    AT_RISK.
//!
//! The decision is idempotent over the latest persisted heartbeat, so
//! interleaved runs for one user settle on last-writer-wins in the
//! StateCache.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::alert::{AlertError, AlertOrchestrator};
use crate::cache::{CacheError, StateCache};
use crate::clock::SharedClock;
use crate::geo;
use crate::lastgasp::LastGaspTracker;
use crate::model::{AlertState, Heartbeat, HeartbeatSource, SafetyState, UserState};
use crate::store::{Store, StoreError};

/// Lifetime of a cached [`UserState`].
pub const USER_STATE_TTL: Duration = Duration::from_secs(24 * 3600);

/// How far back the movement detectors look for a heartbeat pair, in
/// minutes.
const DETECTOR_LOOKBACK_MINS: i64 = 5;

/// Outcome of one evaluation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationResult {
    pub state: SafetyState,
    pub score: u8,
    pub reason: String,
}

/// Decides safety states and hands transitions to the alert orchestrator.
pub struct SafetyEvaluator {
    store: Arc<dyn Store>,
    cache: Arc<dyn StateCache>,
    lastgasp: Arc<LastGaspTracker>,
    orchestrator: Arc<AlertOrchestrator>,
    clock: SharedClock,
    heartbeat_window: Duration,
}

impl SafetyEvaluator {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn StateCache>,
        lastgasp: Arc<LastGaspTracker>,
        orchestrator: Arc<AlertOrchestrator>,
        clock: SharedClock,
        heartbeat_window: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            lastgasp,
            orchestrator,
            clock,
            heartbeat_window,
        }
    }

    /// Evaluate a user's safety and act on any state transition.
    pub async fn evaluate(&self, user_id: Uuid) -> Result<EvaluationResult, EvalError> {
        let now = self.clock.now();

        // An unexpired LastGasp suppresses normal evaluation entirely.
        if let Some(gasp) = self.lastgasp.active(user_id).await? {
            let result = EvaluationResult {
                state: SafetyState::WaitLastGasp,
                score: 0,
                reason: "LastGasp active — monitoring connectivity".to_string(),
            };
            self.cache
                .set_user_state(
                    &UserState {
                        user_id,
                        state: result.state,
                        score: result.score,
                        last_heartbeat: None,
                        last_gasp_active: true,
                        last_gasp_expiry: Some(gasp.expiry_ts),
                        updated_at: now,
                    },
                    USER_STATE_TTL,
                )
                .await?;
            return Ok(result);
        }

        let Some(heartbeat) = self.store.latest_heartbeat(user_id).await? else {
            // Nothing to judge yet.
            return Ok(EvaluationResult {
                state: SafetyState::Safe,
                score: 100,
                reason: "No heartbeat data yet".to_string(),
            });
        };

        let age = now - heartbeat.timestamp;
        let result = match self.deterministic_rules(&heartbeat, age) {
            Some(result) => result,
            None => {
                let score = composite_score(&heartbeat, age);
                let (state, reason) = match score {
                    80.. => (SafetyState::Safe, "All indicators normal"),
                    50..=79 => (
                        SafetyState::Caution,
                        "Some indicators concerning - silent check initiated",
                    ),
                    _ => (SafetyState::AtRisk, "Multiple risk indicators detected"),
                };
                EvaluationResult {
                    state,
                    score,
                    reason: reason.to_string(),
                }
            }
        };

        // Read the previous state before overwriting it; the transition
        // check below compares against it.
        let previous = self.cache.user_state(user_id).await?;
        self.cache
            .set_user_state(
                &UserState {
                    user_id,
                    state: result.state,
                    score: result.score,
                    last_heartbeat: Some(heartbeat.timestamp),
                    last_gasp_active: false,
                    last_gasp_expiry: None,
                    updated_at: now,
                },
                USER_STATE_TTL,
            )
            .await?;

        self.handle_transition(user_id, previous.as_ref(), &result)
            .await?;

        Ok(result)
    }

    /// Sudden-stop check over the two most recent heartbeats within the
    /// detector lookback.
    pub async fn detect_sudden_stop(&self, user_id: Uuid) -> Result<bool, EvalError> {
        let since = self.clock.now() - ChronoDuration::minutes(DETECTOR_LOOKBACK_MINS);
        let recent = self.store.heartbeats_since(user_id, since).await?;
        if recent.len() < 2 {
            return Ok(false);
        }
        Ok(geo::sudden_stop(&recent[1], &recent[0]))
    }

    /// Tower-jump check over the two most recent heartbeats within the
    /// detector lookback.
    pub async fn detect_tower_jump(&self, user_id: Uuid) -> Result<bool, EvalError> {
        let since = self.clock.now() - ChronoDuration::minutes(DETECTOR_LOOKBACK_MINS);
        let recent = self.store.heartbeats_since(user_id, since).await?;
        if recent.len() < 2 {
            return Ok(false);
        }
        Ok(geo::tower_jump(&recent[1], &recent[0]))
    }

    /// Hard rules that override scoring. First match wins.
    fn deterministic_rules(
        &self,
        heartbeat: &Heartbeat,
        age: ChronoDuration,
    ) -> Option<EvaluationResult> {
        let window = ChronoDuration::from_std(self.heartbeat_window)
            .unwrap_or_else(|_| ChronoDuration::zero());

        if age < window {
            if heartbeat.last_gasp {
                return Some(EvaluationResult {
                    state: SafetyState::Caution,
                    score: 60,
                    reason: "LastGasp received — monitoring".to_string(),
                });
            }
            return None;
        }

        Some(EvaluationResult {
            state: SafetyState::AtRisk,
            score: 30,
            reason: format!("No heartbeat for {} minutes", age.num_minutes()),
        })
    }

    async fn handle_transition(
        &self,
        user_id: Uuid,
        previous: Option<&UserState>,
        result: &EvaluationResult,
    ) -> Result<(), EvalError> {
        let unchanged = previous.map(|p| p.state) == Some(result.state);
        if unchanged && result.state != SafetyState::Alert {
            return Ok(());
        }

        let Ok(alert_state) = AlertState::try_from(result.state) else {
            // Transitions into SAFE or WAIT_LASTGASP carry no outbound
            // action.
            return Ok(());
        };

        match self
            .orchestrator
            .handle_transition(user_id, alert_state, result.score, &result.reason)
            .await
        {
            Ok(()) => Ok(()),
            // Dispatch trouble is operator-visible through logs and the
            // alert row; it does not invalidate the evaluation.
            Err(e @ (AlertError::Dispatch(_) | AlertError::NoContacts)) => {
                tracing::warn!(user_id = %user_id, "alert dispatch incomplete: {e}");
                Ok(())
            }
            Err(e) => Err(EvalError::Alert(e)),
        }
    }
}

/// Composite safety score over a single heartbeat, clamped to 0..=100.
///
/// Deterministic in (heartbeat, age); recency is the only age-dependent
/// component, so growing the age never raises the score.
pub fn composite_score(heartbeat: &Heartbeat, age: ChronoDuration) -> u8 {
    let mut score: i32 = 0;

    // Recency
    let age_minutes = age.num_minutes();
    score += match age_minutes {
        ..=4 => 30,
        5..=9 => 20,
        10..=14 => 10,
        _ => 0,
    };

    // GPS accuracy
    score += match heartbeat.accuracy_m {
        0..=49 => 20,
        50..=199 => 15,
        200..=499 => 10,
        _ => 5,
    };

    // Movement pattern
    score += match heartbeat.speed {
        Some(speed) if (0.0..100.0).contains(&speed) => 20,
        Some(speed) if speed >= 100.0 => 10,
        Some(_) => 0,
        None => 15,
    };

    // Signal quality
    let rssi = heartbeat.cell_info.rssi;
    score += if rssi > -70 {
        10
    } else if rssi > -90 {
        5
    } else {
        0
    };

    // Source reliability
    score += match heartbeat.source {
        HeartbeatSource::Http => 5,
        HeartbeatSource::Sms => 3,
    };

    // Battery level
    score += match heartbeat.battery_pct {
        Some(battery) if battery > 20 => 15,
        Some(battery) if battery > 5 => 10,
        Some(_) => 5,
        None => 10,
    };

    score.clamp(0, 100) as u8
}

/// Evaluator error types. These never propagate to a client; the detached
/// evaluation task logs them and the previous state stands.
#[derive(Debug)]
pub enum EvalError {
    Store(StoreError),
    Cache(CacheError),
    Alert(AlertError),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalError::Store(e) => write!(f, "evaluation store error: {e}"),
            EvalError::Cache(e) => write!(f, "evaluation cache error: {e}"),
            EvalError::Alert(e) => write!(f, "state transition error: {e}"),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<StoreError> for EvalError {
    fn from(e: StoreError) -> Self {
        EvalError::Store(e)
    }
}

impl From<CacheError> for EvalError {
    fn from(e: CacheError) -> Self {
        EvalError::Cache(e)
    }
}
