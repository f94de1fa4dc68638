//! Compressed SMS heartbeat codec.
//!
//! Wire form: `k1=v1;k2=v2;...;sig=<base64>` with keys from a fixed set:
//! `uid`, `ts`, `lat`, `lng`, `acc`, `cell` (CSV `mcc,mnc,cid,lac,rssi`),
//! optional `bat`, `spd`, `lg`, and mandatory `sig`.
//!
//! Parse contract:
//! - unknown keys are ignored (forward compatibility)
//! - duplicate keys: last occurrence wins
//! - missing `uid`/`ts`/`sig` and numeric parse failures reject with the
//!   offending field name
//!
//! The signature covers the exact substring preceding `;sig=`, so
//! verification happens against [`signed_region`] of the original body,
//! not a re-serialization.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::model::{CellInfo, HeartbeatSource, RawHeartbeat};

/// Parse a compressed SMS heartbeat body.
pub fn parse(body: &str) -> Result<RawHeartbeat, SmsCodecError> {
    let mut user_id: Option<Uuid> = None;
    let mut timestamp: Option<DateTime<Utc>> = None;
    let mut lat = 0.0_f64;
    let mut lng = 0.0_f64;
    let mut accuracy_m = 0_u32;
    let mut cell_info = CellInfo::default();
    let mut battery_pct: Option<u8> = None;
    let mut speed: Option<f64> = None;
    let mut last_gasp = false;
    let mut signature: Option<String> = None;

    for part in body.split(';') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "uid" => {
                user_id = Some(
                    Uuid::parse_str(value).map_err(|_| SmsCodecError::InvalidField("uid"))?,
                );
            }
            "ts" => {
                let parsed = DateTime::parse_from_rfc3339(value)
                    .map_err(|_| SmsCodecError::InvalidField("ts"))?;
                timestamp = Some(parsed.with_timezone(&Utc));
            }
            "lat" => {
                lat = value
                    .parse()
                    .map_err(|_| SmsCodecError::InvalidField("lat"))?;
            }
            "lng" => {
                lng = value
                    .parse()
                    .map_err(|_| SmsCodecError::InvalidField("lng"))?;
            }
            "acc" => {
                accuracy_m = value
                    .parse()
                    .map_err(|_| SmsCodecError::InvalidField("acc"))?;
            }
            "cell" => {
                cell_info = parse_cell(value)?;
            }
            "bat" => {
                let bat: u8 = value
                    .parse()
                    .map_err(|_| SmsCodecError::InvalidField("bat"))?;
                if bat > 100 {
                    return Err(SmsCodecError::InvalidField("bat"));
                }
                battery_pct = Some(bat);
            }
            "spd" => {
                let spd: f64 = value
                    .parse()
                    .map_err(|_| SmsCodecError::InvalidField("spd"))?;
                if spd < 0.0 {
                    return Err(SmsCodecError::InvalidField("spd"));
                }
                speed = Some(spd);
            }
            "lg" => {
                last_gasp = value == "1" || value == "true";
            }
            "sig" => {
                signature = Some(value.to_string());
            }
            // Unknown keys from newer clients are skipped.
            _ => {}
        }
    }

    let user_id = user_id.ok_or(SmsCodecError::MissingField("uid"))?;
    let timestamp = timestamp.ok_or(SmsCodecError::MissingField("ts"))?;
    let signature = signature.ok_or(SmsCodecError::MissingField("sig"))?;

    Ok(RawHeartbeat {
        user_id,
        source: HeartbeatSource::Sms,
        lat,
        lng,
        accuracy_m,
        cell_info,
        battery_pct,
        speed,
        last_gasp,
        timestamp,
        signature,
    })
}

/// Emit the compressed SMS form of a heartbeat, signature included.
///
/// Coordinates use 6 decimal places, speed 1; optional fields appear only
/// when set.
pub fn emit(hb: &RawHeartbeat) -> String {
    let mut parts = vec![
        format!("uid={}", hb.user_id),
        format!(
            "ts={}",
            hb.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
        format!("lat={:.6}", hb.lat),
        format!("lng={:.6}", hb.lng),
        format!("acc={}", hb.accuracy_m),
        format!(
            "cell={},{},{},{},{}",
            hb.cell_info.mcc, hb.cell_info.mnc, hb.cell_info.cid, hb.cell_info.lac,
            hb.cell_info.rssi
        ),
    ];

    if let Some(bat) = hb.battery_pct {
        parts.push(format!("bat={bat}"));
    }
    if let Some(spd) = hb.speed {
        parts.push(format!("spd={spd:.1}"));
    }
    if hb.last_gasp {
        parts.push("lg=1".to_string());
    }

    parts.push(format!("sig={}", hb.signature));
    parts.join(";")
}

/// The signed bytes of an SMS body: everything before the `;sig=` suffix.
pub fn signed_region(body: &str) -> Option<&str> {
    body.rfind(";sig=").map(|idx| &body[..idx])
}

fn parse_cell(value: &str) -> Result<CellInfo, SmsCodecError> {
    let fields: Vec<&str> = value.split(',').collect();
    if fields.len() < 5 {
        return Err(SmsCodecError::InvalidField("cell"));
    }

    let int = |s: &str| -> Result<u32, SmsCodecError> {
        s.trim().parse().map_err(|_| SmsCodecError::InvalidField("cell"))
    };

    Ok(CellInfo {
        mcc: int(fields[0])?,
        mnc: int(fields[1])?,
        cid: int(fields[2])?,
        lac: int(fields[3])?,
        rssi: fields[4]
            .trim()
            .parse()
            .map_err(|_| SmsCodecError::InvalidField("cell"))?,
        network_type: String::new(),
        neighbors: Vec::new(),
    })
}

/// SMS codec errors. Both kinds surface to the webhook as a parse failure.
#[derive(Debug, PartialEq, Eq)]
pub enum SmsCodecError {
    MissingField(&'static str),
    InvalidField(&'static str),
}

impl SmsCodecError {
    /// The field that triggered the error.
    pub fn field(&self) -> &'static str {
        match self {
            SmsCodecError::MissingField(f) | SmsCodecError::InvalidField(f) => f,
        }
    }
}

impl std::fmt::Display for SmsCodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmsCodecError::MissingField(field) => write!(f, "invalid SMS format: missing {field}"),
            SmsCodecError::InvalidField(field) => write!(f, "invalid SMS format: bad {field}"),
        }
    }
}

impl std::error::Error for SmsCodecError {}
