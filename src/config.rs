//! Configuration for the SafeTrace service.
//!
//! Everything comes from process environment variables. The required
//! credentials (database, HMAC, JWT, SMS provider) fail start-up when
//! absent; thresholds fall back to documented defaults.

use std::time::Duration;

/// Main service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to
    pub port: u16,

    /// Store backend URL (external collaborator)
    pub database_url: String,
    /// StateCache backend URL (external collaborator)
    pub redis_url: String,

    /// Process-wide HMAC secret for heartbeat signatures
    pub hmac_secret: String,
    /// Secret for session tokens issued by the out-of-scope auth surface
    pub jwt_secret: String,

    /// SMS provider credentials
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_phone_number: String,

    /// Push credentials file; push dispatch is skipped when empty
    pub fcm_credentials_path: String,

    /// Static-map token; falls back to a plain maps link when empty
    pub mapbox_token: String,

    /// Expected heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Age beyond which a heartbeat is considered stale
    pub heartbeat_window: Duration,
    /// Lifetime of a LastGasp marker
    pub lastgasp_timeout: Duration,
    /// Silent-ping response window
    pub silent_prompt: Duration,
    /// Retention for uploaded blackbox trails
    pub blackbox_retention: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = Self {
            port: env_u64("PORT", 8080) as u16,
            database_url: env_str("DATABASE_URL", ""),
            redis_url: env_str("REDIS_URL", "redis://localhost:6379"),
            hmac_secret: env_str("HMAC_SECRET", ""),
            jwt_secret: env_str("JWT_SECRET", ""),
            twilio_account_sid: env_str("TWILIO_ACCOUNT_SID", ""),
            twilio_auth_token: env_str("TWILIO_AUTH_TOKEN", ""),
            twilio_phone_number: env_str("TWILIO_PHONE_NUMBER", ""),
            fcm_credentials_path: env_str("FCM_CREDENTIALS_PATH", ""),
            mapbox_token: env_str("MAPBOX_TOKEN", ""),
            heartbeat_interval: Duration::from_secs(env_u64("HEARTBEAT_INTERVAL_SECONDS", 180)),
            heartbeat_window: Duration::from_secs(env_u64("HEARTBEAT_WINDOW_SECONDS", 600)),
            lastgasp_timeout: Duration::from_secs(env_u64("LASTGASP_TIMEOUT_SECONDS", 3600)),
            silent_prompt: Duration::from_secs(env_u64("SILENT_PROMPT_SECONDS", 10)),
            blackbox_retention: Duration::from_secs(
                env_u64("BLACKBOX_RETENTION_HOURS", 12) * 3600,
            ),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::MissingVar("DATABASE_URL"));
        }
        if self.hmac_secret.is_empty() {
            return Err(ConfigError::MissingVar("HMAC_SECRET"));
        }
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::MissingVar("JWT_SECRET"));
        }
        if self.twilio_account_sid.is_empty() {
            return Err(ConfigError::MissingVar("TWILIO_ACCOUNT_SID"));
        }
        if self.twilio_auth_token.is_empty() {
            return Err(ConfigError::MissingVar("TWILIO_AUTH_TOKEN"));
        }
        Ok(())
    }

    /// Configuration with placeholder credentials, bypassing the
    /// environment entirely. Used by tests and local smoke runs.
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            database_url: "memory://".to_string(),
            redis_url: "memory://".to_string(),
            hmac_secret: "test-hmac-secret".to_string(),
            jwt_secret: "test-jwt-secret".to_string(),
            twilio_account_sid: "ACtest".to_string(),
            twilio_auth_token: "token".to_string(),
            twilio_phone_number: "+15550000000".to_string(),
            fcm_credentials_path: String::new(),
            mapbox_token: String::new(),
            heartbeat_interval: Duration::from_secs(180),
            heartbeat_window: Duration::from_secs(600),
            lastgasp_timeout: Duration::from_secs(3600),
            silent_prompt: Duration::from_secs(10),
            blackbox_retention: Duration::from_secs(12 * 3600),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    MissingVar(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVar(name) => write!(f, "{name} is required"),
        }
    }
}

impl std::error::Error for ConfigError {}
