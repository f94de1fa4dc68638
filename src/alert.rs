//! Alert orchestration: dedup, persistence, and contact fan-out.
//!
//! CAUTION transitions send the user a silent "are you safe?" push.
//! AT_RISK and ALERT transitions persist an alert row and notify every
//! trusted contact by SMS, with WhatsApp as best effort. Repeat alerts for
//! one user are suppressed for a 5-minute window; the dedup mark is set
//! after dispatch completes, so a concurrent race can at worst double one
//! burst (false positives are preferred over missed alerts).

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::{CacheError, StateCache};
use crate::clock::SharedClock;
use crate::model::{Alert, AlertState, Heartbeat, User};
use crate::notify::Notifier;
use crate::store::{Store, StoreError};

/// Window during which repeat alerts for one user are suppressed.
pub const ALERT_DEDUP_WINDOW: Duration = Duration::from_secs(300);

const SILENT_PING_TITLE: &str = "Are you safe?";
const SILENT_PING_BODY: &str = "Tap to confirm you're okay";

/// Fans out safety alerts to trusted contacts and acknowledges
/// resolutions.
pub struct AlertOrchestrator {
    store: Arc<dyn Store>,
    cache: Arc<dyn StateCache>,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
    mapbox_token: String,
}

impl AlertOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn StateCache>,
        notifier: Arc<dyn Notifier>,
        clock: SharedClock,
        mapbox_token: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            notifier,
            clock,
            mapbox_token: mapbox_token.into(),
        }
    }

    /// React to a state transition reported by the evaluator.
    pub async fn handle_transition(
        &self,
        user_id: Uuid,
        state: AlertState,
        score: u8,
        reason: &str,
    ) -> Result<(), AlertError> {
        match state {
            AlertState::Caution => self.send_silent_ping(user_id).await,
            AlertState::AtRisk | AlertState::Alert => {
                self.dispatch_alert(user_id, state, score, reason).await
            }
        }
    }

    /// Mark an alert resolved and notify contacts. Resolving twice is an
    /// idempotent no-op.
    pub async fn resolve(&self, alert_id: Uuid) -> Result<Alert, AlertError> {
        let mut alert = self
            .store
            .alert_by_id(alert_id)
            .await?
            .ok_or(AlertError::AlertNotFound)?;

        if alert.resolved_at.is_some() {
            return Ok(alert);
        }

        let now = self.clock.now();
        self.store.resolve_alert(alert_id, now).await?;
        alert.resolved_at = Some(now);

        // Resolution notices are best effort.
        match self.store.user_by_id(alert.user_id).await {
            Ok(Some(user)) => {
                let message = resolution_message(&user, now);
                for contact in &user.trusted_contacts {
                    if let Err(e) = self.notifier.send_sms(&contact.phone, &message).await {
                        tracing::warn!(
                            user_id = %user.id,
                            phone = %contact.phone,
                            "resolution notice failed: {e}"
                        );
                    }
                }
            }
            Ok(None) => {
                tracing::warn!(alert_id = %alert_id, "resolved alert for unknown user");
            }
            Err(e) => {
                tracing::warn!(alert_id = %alert_id, "user lookup for resolution notice failed: {e}");
            }
        }

        Ok(alert)
    }

    async fn send_silent_ping(&self, user_id: Uuid) -> Result<(), AlertError> {
        let user = self
            .store
            .user_by_id(user_id)
            .await?
            .ok_or(AlertError::UserNotFound)?;

        let Some(token) = user.push_token.as_deref() else {
            tracing::debug!(user_id = %user_id, "no push token, skipping silent ping");
            return Ok(());
        };

        if let Err(e) = self
            .notifier
            .send_push(token, SILENT_PING_TITLE, SILENT_PING_BODY)
            .await
        {
            tracing::warn!(user_id = %user_id, "silent ping failed: {e}");
        }

        Ok(())
    }

    async fn dispatch_alert(
        &self,
        user_id: Uuid,
        state: AlertState,
        score: u8,
        reason: &str,
    ) -> Result<(), AlertError> {
        if self.cache.alert_sent(user_id).await? {
            tracing::debug!(user_id = %user_id, "alert suppressed by dedup window");
            return Ok(());
        }

        let now = self.clock.now();
        let alert = Alert {
            id: Uuid::new_v4(),
            user_id,
            state,
            score,
            reason: reason.to_string(),
            sent_to: Vec::new(),
            created_at: now,
            resolved_at: None,
        };
        self.store.create_alert(&alert).await?;

        let user = self
            .store
            .user_by_id(user_id)
            .await?
            .ok_or(AlertError::UserNotFound)?;
        let heartbeat = self.store.latest_heartbeat(user_id).await?;

        let message = alert_message(
            &user,
            heartbeat.as_ref(),
            score,
            reason,
            &self.mapbox_token,
        );

        let mut sent_to: Vec<String> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        for contact in &user.trusted_contacts {
            match self.notifier.send_sms(&contact.phone, &message).await {
                Ok(()) => sent_to.push(contact.phone.clone()),
                Err(e) => failures.push(format!("{}: {e}", contact.phone)),
            }

            // WhatsApp is optional; failures are logged, not collected.
            if let Err(e) = self.notifier.send_whatsapp(&contact.phone, &message).await {
                tracing::warn!(
                    user_id = %user_id,
                    phone = %contact.phone,
                    "whatsapp dispatch failed: {e}"
                );
            }
        }

        // The alert row keeps the phones that actually got the message so
        // operators can compare sent_to against the contact list.
        if let Err(e) = self.store.set_alert_recipients(alert.id, &sent_to).await {
            tracing::error!(alert_id = %alert.id, "failed to record recipients: {e}");
        }

        self.cache
            .mark_alert_sent(user_id, ALERT_DEDUP_WINDOW)
            .await?;

        if user.trusted_contacts.is_empty() {
            return Err(AlertError::NoContacts);
        }
        if !failures.is_empty() {
            return Err(AlertError::Dispatch(failures));
        }

        tracing::info!(
            user_id = %user_id,
            alert_id = %alert.id,
            state = %state,
            recipients = sent_to.len(),
            "alert dispatched"
        );
        Ok(())
    }
}

/// Format a timestamp the way contacts see it: `Jan 2, 3:04 PM`.
fn contact_timestamp(at: DateTime<Utc>) -> String {
    at.format("%b %-d, %-I:%M %p").to_string()
}

/// Map link for an alert location: Mapbox static map when a token is
/// configured, plain maps link otherwise.
fn map_link(lat: f64, lng: f64, mapbox_token: &str) -> String {
    if !mapbox_token.is_empty() {
        format!(
            "https://api.mapbox.com/styles/v1/mapbox/streets-v11/static/\
             pin-s+f74e4e({lng:.6},{lat:.6})/{lng:.6},{lat:.6},15,0/600x400@2x?access_token={mapbox_token}"
        )
    } else {
        format!("https://www.google.com/maps?q={lat:.6},{lng:.6}")
    }
}

fn alert_message(
    user: &User,
    heartbeat: Option<&Heartbeat>,
    score: u8,
    reason: &str,
    mapbox_token: &str,
) -> String {
    match heartbeat {
        Some(hb) => format!(
            "🚨 SAFETRACE ALERT\n\n\
             {} may be in danger.\n\n\
             Last seen: {}\n\
             Location: {:.6}, {:.6} (±{}m)\n\
             Confidence: {}%\n\
             Reason: {}\n\n\
             Map: {}\n\n\
             Please check on them immediately.\n\
             Contact: {}",
            user.name,
            contact_timestamp(hb.timestamp),
            hb.lat,
            hb.lng,
            hb.accuracy_m,
            score,
            reason,
            map_link(hb.lat, hb.lng, mapbox_token),
            user.phone,
        ),
        // Telemetry can be partial; send the alert anyway.
        None => format!(
            "🚨 SAFETRACE ALERT\n\n\
             {} may be in danger.\n\n\
             Last seen: unknown\n\
             Confidence: {}%\n\
             Reason: {}\n\n\
             Please check on them immediately.\n\
             Contact: {}",
            user.name, score, reason, user.phone,
        ),
    }
}

fn resolution_message(user: &User, at: DateTime<Utc>) -> String {
    format!(
        "✅ SafeTrace Update\n\n\
         {} has confirmed they are safe.\n\
         Alert resolved at {}.",
        user.name,
        contact_timestamp(at),
    )
}

/// Alert orchestration error types.
#[derive(Debug)]
pub enum AlertError {
    Store(StoreError),
    Cache(CacheError),
    UserNotFound,
    AlertNotFound,
    NoContacts,
    /// One line per contact whose SMS failed
    Dispatch(Vec<String>),
}

impl std::fmt::Display for AlertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertError::Store(e) => write!(f, "{e}"),
            AlertError::Cache(e) => write!(f, "{e}"),
            AlertError::UserNotFound => write!(f, "user not found"),
            AlertError::AlertNotFound => write!(f, "alert not found"),
            AlertError::NoContacts => write!(f, "no trusted contacts configured"),
            AlertError::Dispatch(failures) => {
                write!(f, "some alerts failed: {}", failures.join("; "))
            }
        }
    }
}

impl std::error::Error for AlertError {}

impl From<StoreError> for AlertError {
    fn from(e: StoreError) -> Self {
        AlertError::Store(e)
    }
}

impl From<CacheError> for AlertError {
    fn from(e: CacheError) -> Self {
        AlertError::Cache(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStateCache;
    use crate::clock::{Clock, ManualClock};
    use crate::model::{CellInfo, Contact, HeartbeatSource, UserSettings};
    use crate::notify::{Channel, RecordingNotifier};
    use crate::store::MemoryStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        cache: Arc<MemoryStateCache>,
        notifier: Arc<RecordingNotifier>,
        orchestrator: AlertOrchestrator,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryStateCache::new(clock.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let orchestrator = AlertOrchestrator::new(
            store.clone(),
            cache.clone(),
            notifier.clone(),
            clock.clone(),
            "",
        );
        Fixture {
            clock,
            store,
            cache,
            notifier,
            orchestrator,
        }
    }

    async fn seed_user(fixture: &Fixture, push_token: Option<&str>) -> User {
        let now = fixture.clock.now();
        let user = User {
            id: Uuid::new_v4(),
            phone: "+2348000000001".to_string(),
            name: "Ada".to_string(),
            trusted_contacts: vec![
                Contact {
                    id: "c1".to_string(),
                    name: "Ngozi".to_string(),
                    phone: "+2348000000002".to_string(),
                },
                Contact {
                    id: "c2".to_string(),
                    name: "Emeka".to_string(),
                    phone: "+2348000000003".to_string(),
                },
            ],
            settings: UserSettings::default(),
            push_token: push_token.map(|t| t.to_string()),
            created_at: now,
            updated_at: now,
        };
        fixture.store.create_user(&user).await.unwrap();
        user
    }

    async fn seed_heartbeat(fixture: &Fixture, user_id: Uuid) -> Heartbeat {
        let now = fixture.clock.now();
        let hb = Heartbeat {
            id: Uuid::new_v4(),
            user_id,
            source: HeartbeatSource::Http,
            lat: 6.5244,
            lng: 3.3792,
            accuracy_m: 25,
            cell_info: CellInfo::default(),
            battery_pct: Some(40),
            speed: None,
            last_gasp: false,
            timestamp: now,
            signature: String::new(),
            created_at: now,
        };
        fixture.store.create_heartbeat(&hb).await.unwrap();
        hb
    }

    #[tokio::test]
    async fn test_caution_sends_silent_ping() {
        let f = fixture();
        let user = seed_user(&f, Some("push-token-1")).await;

        f.orchestrator
            .handle_transition(user.id, AlertState::Caution, 58, "concerning")
            .await
            .unwrap();

        let pushes = f.notifier.sent_on(Channel::Push);
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].to, "push-token-1");
        assert!(pushes[0].body.contains("Are you safe?"));
        assert!(f.notifier.sent_on(Channel::Sms).is_empty());
    }

    #[tokio::test]
    async fn test_caution_without_push_token_is_noop() {
        let f = fixture();
        let user = seed_user(&f, None).await;

        f.orchestrator
            .handle_transition(user.id, AlertState::Caution, 58, "concerning")
            .await
            .unwrap();

        assert!(f.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn test_at_risk_fans_out_to_contacts() {
        let f = fixture();
        let user = seed_user(&f, None).await;
        seed_heartbeat(&f, user.id).await;

        f.orchestrator
            .handle_transition(user.id, AlertState::AtRisk, 30, "No heartbeat for 12 minutes")
            .await
            .unwrap();

        let sms = f.notifier.sent_on(Channel::Sms);
        assert_eq!(sms.len(), 2);
        assert!(sms[0].body.contains("SAFETRACE ALERT"));
        assert!(sms[0].body.contains("Ada may be in danger"));
        assert!(sms[0].body.contains("Confidence: 30%"));
        assert!(sms[0].body.contains("google.com/maps?q=6.524400,3.379200"));
        assert_eq!(f.notifier.sent_on(Channel::WhatsApp).len(), 2);

        assert!(f.cache.alert_sent(user.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_dedup_window_suppresses_repeat_bursts() {
        let f = fixture();
        let user = seed_user(&f, None).await;
        seed_heartbeat(&f, user.id).await;

        f.orchestrator
            .handle_transition(user.id, AlertState::AtRisk, 30, "risk")
            .await
            .unwrap();
        f.orchestrator
            .handle_transition(user.id, AlertState::AtRisk, 28, "risk")
            .await
            .unwrap();

        // One burst: two contacts, one SMS each, one persisted row.
        assert_eq!(f.notifier.sent_on(Channel::Sms).len(), 2);
        assert_eq!(f.store.alerts_for_user(user.id).await.unwrap().len(), 1);

        f.clock.advance(chrono::Duration::minutes(6));
        f.orchestrator
            .handle_transition(user.id, AlertState::Alert, 20, "risk")
            .await
            .unwrap();
        assert_eq!(f.notifier.sent_on(Channel::Sms).len(), 4);
        assert_eq!(f.store.alerts_for_user(user.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sent_to_records_only_successes() {
        let f = fixture();
        let user = seed_user(&f, None).await;
        seed_heartbeat(&f, user.id).await;
        f.notifier.fail_sms_to("+2348000000002");

        let err = f
            .orchestrator
            .handle_transition(user.id, AlertState::Alert, 15, "risk")
            .await
            .unwrap_err();
        assert!(matches!(err, AlertError::Dispatch(_)));

        // The alert row persists with the successful recipient only.
        let alerts = f.store.alerts_for_user(user.id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].sent_to, vec!["+2348000000003".to_string()]);

        let sms = f.notifier.sent_on(Channel::Sms);
        assert_eq!(sms.len(), 1);
        assert_eq!(sms[0].to, "+2348000000003");

        // Dedup mark is set even when some sends failed.
        assert!(f.cache.alert_sent(user.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_notifies_once() {
        let f = fixture();
        let user = seed_user(&f, None).await;

        let alert = Alert {
            id: Uuid::new_v4(),
            user_id: user.id,
            state: AlertState::Alert,
            score: 12,
            reason: "risk".to_string(),
            sent_to: Vec::new(),
            created_at: f.clock.now(),
            resolved_at: None,
        };
        f.store.create_alert(&alert).await.unwrap();

        let resolved = f.orchestrator.resolve(alert.id).await.unwrap();
        assert!(resolved.resolved_at.is_some());

        let sms = f.notifier.sent_on(Channel::Sms);
        assert_eq!(sms.len(), 2);
        assert!(sms[0].body.contains("has confirmed they are safe"));

        // Second resolve: idempotent, no further notices.
        let again = f.orchestrator.resolve(alert.id).await.unwrap();
        assert_eq!(again.resolved_at, resolved.resolved_at);
        assert_eq!(f.notifier.sent_on(Channel::Sms).len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_unknown_alert() {
        let f = fixture();
        let err = f.orchestrator.resolve(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AlertError::AlertNotFound));
    }

    #[test]
    fn test_map_link_prefers_mapbox() {
        let link = map_link(6.5244, 3.3792, "tok123");
        assert!(link.starts_with("https://api.mapbox.com/styles/v1/mapbox/streets-v11/static/"));
        assert!(link.contains("access_token=tok123"));

        let fallback = map_link(6.5244, 3.3792, "");
        assert_eq!(fallback, "https://www.google.com/maps?q=6.524400,3.379200");
    }

    #[test]
    fn test_contact_timestamp_format() {
        let at: DateTime<Utc> = "2025-11-19T15:04:00Z".parse().unwrap();
        assert_eq!(contact_timestamp(at), "Nov 19, 3:04 PM");
    }
}
