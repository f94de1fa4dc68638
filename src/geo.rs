//! Geospatial helpers: haversine distance and the auxiliary movement
//! detectors.
//!
//! The detectors look at the two most recent heartbeats for a user; the
//! evaluator exposes them to higher-level callers but does not fold them
//! into the composite score.

use crate::model::Heartbeat;

/// Mean Earth radius in km.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates, in km.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Sudden-stop detector over two consecutive heartbeats.
///
/// Fires when speed drops from above 40 km/h to below 5 km/h within 60
/// seconds and the implied deceleration exceeds 6 m/s². Requires speed on
/// both samples.
pub fn sudden_stop(previous: &Heartbeat, latest: &Heartbeat) -> bool {
    let (Some(prev_speed), Some(latest_speed)) = (previous.speed, latest.speed) else {
        return false;
    };

    if prev_speed <= 40.0 || latest_speed >= 5.0 {
        return false;
    }

    let dt_secs = (latest.timestamp - previous.timestamp).num_milliseconds() as f64 / 1000.0;
    if dt_secs <= 0.0 || dt_secs >= 60.0 {
        return false;
    }

    // km/h to m/s, then per elapsed second
    let deceleration = (prev_speed - latest_speed) / 3.6 / dt_secs;
    deceleration > 6.0
}

/// Tower-jump detector over two consecutive heartbeats.
///
/// Fires on a serving-cell change combined with more than 5 km of
/// displacement in under 2 minutes.
pub fn tower_jump(previous: &Heartbeat, latest: &Heartbeat) -> bool {
    if latest.cell_info.cid == previous.cell_info.cid {
        return false;
    }

    let distance = haversine_km(previous.lat, previous.lng, latest.lat, latest.lng);
    let dt_mins = (latest.timestamp - previous.timestamp).num_milliseconds() as f64 / 60_000.0;

    distance > 5.0 && dt_mins >= 0.0 && dt_mins < 2.0
}
