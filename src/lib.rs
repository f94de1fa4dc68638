//! SafeTrace - personal-safety monitoring service.
//!
//! Mobile clients submit signed location/sensor heartbeats over HTTP, with
//! a compressed SMS fallback for degraded connectivity. For each user the
//! service continuously decides a safety state and, when risk crosses
//! thresholds, notifies the user's trusted contacts out of band.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       SafeTrace Service                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  HTTP /v1/heartbeat ──┐                                      │
//! │                       ├──▶ Ingress ──▶ Store                 │
//! │  SMS  /v1/sms/webhook ┘       │                              │
//! │                               ▼  (detached task)             │
//! │                          Evaluator ──▶ StateCache            │
//! │                               │                              │
//! │                               ▼                              │
//! │                       AlertOrchestrator ──▶ Notifier         │
//! │                                             (SMS/WhatsApp/   │
//! │                                              push)           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Heartbeats are authenticated with HMAC-SHA256 on both transports: the
//! HTTP body is signed over a canonical JSON form, the SMS body over its
//! bytes minus the signature suffix. An explicit LastGasp marker
//! ("connectivity about to drop, here is my location") suppresses normal
//! scoring for a configured window; alerts to trusted contacts are
//! deduplicated per user over a 5-minute window.
//!
//! Persistence, volatile state, and message dispatch are external
//! collaborators behind the [`store::Store`], [`cache::StateCache`], and
//! [`notify::Notifier`] traits; everything is injected by constructor so
//! the pipeline runs against in-memory doubles in tests.

pub mod alert;
pub mod cache;
pub mod clock;
pub mod config;
pub mod evaluator;
pub mod geo;
pub mod ingress;
pub mod lastgasp;
pub mod model;
pub mod notify;
pub mod server;
pub mod signer;
pub mod sms;
pub mod store;

// Re-export key types at crate root for convenience
pub use alert::AlertOrchestrator;
pub use cache::{MemoryStateCache, StateCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use evaluator::{composite_score, EvaluationResult, SafetyEvaluator};
pub use ingress::{HeartbeatRequest, Ingress, IngressError};
pub use model::{
    Alert, AlertState, CellInfo, Contact, Heartbeat, HeartbeatSource, LastGasp, RawHeartbeat,
    SafetyState, User, UserSettings, UserState,
};
pub use notify::{Notifier, RecordingNotifier, TwilioNotifier};
pub use signer::{CanonicalHeartbeat, Signer};
pub use store::{MemoryStore, Store};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
