//! Domain records shared across the safety pipeline.
//!
//! Everything here crosses at least one boundary (HTTP, SMS, Store,
//! StateCache), so every record carries serde derives. JSON-backed columns
//! (cell info, trusted contacts, settings, sent_to) are modeled as typed
//! records; raw `serde_json::Value` never leaves the store adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-user safety state decided by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyState {
    #[serde(rename = "SAFE")]
    Safe,
    #[serde(rename = "CAUTION")]
    Caution,
    #[serde(rename = "AT_RISK")]
    AtRisk,
    #[serde(rename = "ALERT")]
    Alert,
    #[serde(rename = "WAIT_LASTGASP")]
    WaitLastGasp,
}

impl SafetyState {
    /// Wire representation, as stored in the cache and returned by the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyState::Safe => "SAFE",
            SafetyState::Caution => "CAUTION",
            SafetyState::AtRisk => "AT_RISK",
            SafetyState::Alert => "ALERT",
            SafetyState::WaitLastGasp => "WAIT_LASTGASP",
        }
    }
}

impl std::fmt::Display for SafetyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subset of [`SafetyState`] that produces a persisted alert row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertState {
    #[serde(rename = "CAUTION")]
    Caution,
    #[serde(rename = "AT_RISK")]
    AtRisk,
    #[serde(rename = "ALERT")]
    Alert,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Caution => "CAUTION",
            AlertState::AtRisk => "AT_RISK",
            AlertState::Alert => "ALERT",
        }
    }
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<SafetyState> for AlertState {
    type Error = SafetyState;

    fn try_from(state: SafetyState) -> Result<Self, Self::Error> {
        match state {
            SafetyState::Caution => Ok(AlertState::Caution),
            SafetyState::AtRisk => Ok(AlertState::AtRisk),
            SafetyState::Alert => Ok(AlertState::Alert),
            other => Err(other),
        }
    }
}

/// Transport a heartbeat arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatSource {
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "sms")]
    Sms,
}

impl std::fmt::Display for HeartbeatSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeartbeatSource::Http => f.write_str("http"),
            HeartbeatSource::Sms => f.write_str("sms"),
        }
    }
}

/// A trusted contact enrolled to receive alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
}

/// User preferences, stored as an opaque JSON column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Expected heartbeat cadence in seconds
    pub heartbeat_interval: u32,
    /// Seconds to wait for a silent-ping response
    pub silent_prompt_timeout: u32,
    pub auto_escalate_police: bool,
    pub share_audio: bool,
    /// "power_button_3x" | "shake"
    pub panic_gesture: String,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: 180,
            silent_prompt_timeout: 10,
            auto_escalate_police: false,
            share_audio: false,
            panic_gesture: "power_button_3x".to_string(),
        }
    }
}

/// A SafeTrace user with their trusted-contact list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// E.164 phone number
    pub phone: String,
    pub name: String,
    pub trusted_contacts: Vec<Contact>,
    pub settings: UserSettings,
    /// Device push token for silent pings; absent until the client registers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cellular network context attached to a heartbeat.
///
/// Opaque to the evaluator except for `rssi` and `cid`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellInfo {
    pub mcc: u32,
    pub mnc: u32,
    pub cid: u32,
    pub lac: u32,
    /// Signal strength in dBm (negative)
    pub rssi: i32,
    #[serde(default)]
    pub network_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub neighbors: Vec<NeighborCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborCell {
    pub cid: u32,
    pub rssi: i32,
}

/// A signed location/sensor report. Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source: HeartbeatSource,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: u32,
    pub cell_info: CellInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<u8>,
    /// km/h
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    pub last_gasp: bool,
    /// Client-reported capture time
    pub timestamp: DateTime<Utc>,
    pub signature: String,
    /// Server receive time
    pub created_at: DateTime<Utc>,
}

/// Transport-independent heartbeat as it exists after authentication,
/// before the store assigns an id and receive time.
///
/// Both the HTTP body and the SMS payload converge on this record; only the
/// signature verification step differs between the two.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHeartbeat {
    pub user_id: Uuid,
    pub source: HeartbeatSource,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: u32,
    pub cell_info: CellInfo,
    pub battery_pct: Option<u8>,
    pub speed: Option<f64>,
    pub last_gasp: bool,
    pub timestamp: DateTime<Utc>,
    pub signature: String,
}

impl RawHeartbeat {
    /// Promote to a persistable heartbeat with a server-assigned id and
    /// receive time.
    pub fn into_heartbeat(self, id: Uuid, received_at: DateTime<Utc>) -> Heartbeat {
        Heartbeat {
            id,
            user_id: self.user_id,
            source: self.source,
            lat: self.lat,
            lng: self.lng,
            accuracy_m: self.accuracy_m,
            cell_info: self.cell_info,
            battery_pct: self.battery_pct,
            speed: self.speed,
            last_gasp: self.last_gasp,
            timestamp: self.timestamp,
            signature: self.signature,
            created_at: received_at,
        }
    }
}

/// Emergency "last known location" marker, independent of normal heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastGasp {
    pub id: Uuid,
    pub user_id: Uuid,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: u32,
    pub cell_info: CellInfo,
    pub created_at: DateTime<Utc>,
    pub expiry_ts: DateTime<Utc>,
}

impl LastGasp {
    /// Expiry is by wall clock; expired rows stay in the store but are
    /// filtered out of queries.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expiry_ts > now
    }
}

/// A persisted safety alert, resolvable exactly once by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub user_id: Uuid,
    pub state: AlertState,
    pub score: u8,
    pub reason: String,
    /// Contact phones actually notified; empty until dispatch completes
    pub sent_to: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Volatile per-user safety state held in the StateCache (24 h TTL).
///
/// Absence means "UNKNOWN".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserState {
    pub user_id: Uuid,
    pub state: SafetyState,
    pub score: u8,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_gasp_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_gasp_expiry: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Summary row for an uploaded offline trail; bulk data lives behind
/// `file_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboxTrail {
    pub id: Uuid,
    pub user_id: Uuid,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub data_points: u32,
    pub file_url: String,
    pub uploaded_at: DateTime<Utc>,
}

/// A single offline trail sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboxEntry {
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: u32,
    pub cell_info: CellInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_data: Option<SensorData>,
}

/// Accelerometer/gyroscope sample attached to a trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorData {
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
}
