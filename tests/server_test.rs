//! Integration tests for the SafeTrace HTTP surface.
//!
//! Each test binds the real router on port 0 with in-memory backends and
//! drives it over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use safetrace::cache::MemoryStateCache;
use safetrace::clock::{SharedClock, SystemClock};
use safetrace::config::Config;
use safetrace::ingress::HeartbeatRequest;
use safetrace::model::{CellInfo, Contact, User, UserSettings};
use safetrace::notify::RecordingNotifier;
use safetrace::server::{self, AppState};
use safetrace::signer::{CanonicalHeartbeat, Signer};
use safetrace::store::{MemoryStore, Store};

struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    signer: Signer,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_server() -> TestServer {
    let config = Config::for_tests();
    let clock: SharedClock = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryStateCache::new(clock.clone()));
    let notifier = Arc::new(RecordingNotifier::new());

    let state = Arc::new(AppState::new(
        &config,
        store.clone(),
        cache,
        notifier,
        clock,
    ));

    let (addr, shutdown_tx, _task) = server::run(0, state).await.expect("Failed to start server");

    TestServer {
        addr,
        store,
        signer: Signer::new(config.hmac_secret),
        shutdown: Some(shutdown_tx),
    }
}

async fn seed_user(server: &TestServer) -> User {
    let now = Utc::now();
    let user = User {
        id: Uuid::new_v4(),
        phone: "+2348000000001".to_string(),
        name: "Ada".to_string(),
        trusted_contacts: vec![Contact {
            id: "c1".to_string(),
            name: "Ngozi".to_string(),
            phone: "+2348000000002".to_string(),
        }],
        settings: UserSettings::default(),
        push_token: None,
        created_at: now,
        updated_at: now,
    };
    server.store.create_user(&user).await.unwrap();
    user
}

fn signed_heartbeat(server: &TestServer, user_id: Uuid) -> HeartbeatRequest {
    let timestamp = Utc::now();
    let cell_info = CellInfo {
        mcc: 621,
        mnc: 20,
        cid: 12345,
        lac: 678,
        rssi: -60,
        network_type: "4G".to_string(),
        neighbors: Vec::new(),
    };
    let canonical = CanonicalHeartbeat {
        user_id: user_id.to_string(),
        timestamp: timestamp.timestamp(),
        lat: 6.5244,
        lng: 3.3792,
        accuracy_m: 20,
        cell_info: cell_info.clone(),
        battery_pct: Some(80),
        speed: Some(5.0),
        last_gasp: false,
    };
    let signature = server.signer.sign_structured(&canonical).unwrap();

    HeartbeatRequest {
        user_id: user_id.to_string(),
        timestamp,
        lat: 6.5244,
        lng: 3.3792,
        accuracy_m: 20,
        cell_info,
        battery_pct: Some(80),
        speed: Some(5.0),
        last_gasp: false,
        signature,
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_server().await;

    let response = reqwest::get(server.url("/health")).await.unwrap();
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "safetrace-api");
    assert!(body["time"].as_str().is_some());
}

#[tokio::test]
async fn test_heartbeat_ingest_happy_path() {
    let server = start_server().await;
    let user = seed_user(&server).await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/v1/heartbeat"))
        .json(&signed_heartbeat(&server, user.id))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "heartbeat received");
    assert!(body["id"].as_str().is_some());

    let stored = server.store.latest_heartbeat(user.id).await.unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn test_heartbeat_rejects_bad_signature() {
    let server = start_server().await;
    let user = seed_user(&server).await;
    let client = reqwest::Client::new();

    let mut request = signed_heartbeat(&server, user.id);
    request.lat += 1.0;

    let response = client
        .post(server.url("/v1/heartbeat"))
        .json(&request)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_heartbeat_rate_limit() {
    let server = start_server().await;
    let user = seed_user(&server).await;
    let client = reqwest::Client::new();

    let first = client
        .post(server.url("/v1/heartbeat"))
        .json(&signed_heartbeat(&server, user.id))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::OK);

    let second = client
        .post(server.url("/v1/heartbeat"))
        .json(&signed_heartbeat(&server, user.id))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_heartbeat_unknown_user() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/v1/heartbeat"))
        .json(&signed_heartbeat(&server, Uuid::new_v4()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_heartbeat_malformed_body() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/v1/heartbeat"))
        .json(&serde_json::json!({ "user_id": "x" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_sms_webhook_accepts_signed_body() {
    let server = start_server().await;
    let user = seed_user(&server).await;
    let client = reqwest::Client::new();

    let unsigned = format!(
        "uid={};ts={};lat=6.524400;lng=3.379200;acc=200;cell=621,20,12345,678,-85",
        user.id,
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    let signature = server.signer.sign_raw(unsigned.as_bytes());
    let body = format!("{unsigned};sig={signature}");

    let response = client
        .post(server.url("/v1/sms/webhook"))
        .form(&[("Body", body.as_str()), ("From", "+2348000000001")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/xml"
    );
    let text = response.text().await.unwrap();
    assert!(text.contains("<Message>Heartbeat received</Message>"));

    let stored = server.store.latest_heartbeat(user.id).await.unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn test_sms_webhook_parse_failure_still_200() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/v1/sms/webhook"))
        .form(&[("Body", "hello operator")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let text = response.text().await.unwrap();
    assert!(text.contains("could not be parsed"));
}

#[tokio::test]
async fn test_user_status_unknown_then_evaluated() {
    let server = start_server().await;
    let user = seed_user(&server).await;
    let client = reqwest::Client::new();

    let response = client
        .get(server.url(&format!("/v1/user/{}/status", user.id)))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["state"], "UNKNOWN");

    client
        .post(server.url("/v1/heartbeat"))
        .json(&signed_heartbeat(&server, user.id))
        .send()
        .await
        .unwrap();

    // Evaluation is detached from the ingest response; poll briefly.
    let mut state = "UNKNOWN".to_string();
    for _ in 0..50 {
        let body: serde_json::Value = client
            .get(server.url(&format!("/v1/user/{}/status", user.id)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        state = body["state"].as_str().unwrap_or("UNKNOWN").to_string();
        if state != "UNKNOWN" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state, "SAFE");
}

#[tokio::test]
async fn test_status_invalid_uuid() {
    let server = start_server().await;

    let response = reqwest::get(server.url("/v1/user/not-a-uuid/status"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_resolve_unknown_alert_is_404() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url(&format!("/v1/alert/{}/resolve", Uuid::new_v4())))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_blackbox_upload_and_list() {
    let server = start_server().await;
    let user = seed_user(&server).await;
    let client = reqwest::Client::new();

    let now = Utc::now();
    let upload = serde_json::json!({
        "user_id": user.id,
        "start_ts": now - chrono::Duration::minutes(30),
        "end_ts": now,
        "data_points": [
            {
                "timestamp": now - chrono::Duration::minutes(20),
                "lat": 6.5244,
                "lng": 3.3792,
                "accuracy_m": 35,
                "cell_info": { "mcc": 621, "mnc": 20, "cid": 1, "lac": 2, "rssi": -70, "network_type": "4G" }
            },
            {
                "timestamp": now - chrono::Duration::minutes(10),
                "lat": 6.5250,
                "lng": 3.3800,
                "accuracy_m": 40,
                "cell_info": { "mcc": 621, "mnc": 20, "cid": 1, "lac": 2, "rssi": -72, "network_type": "4G" },
                "sensor_data": {
                    "accel_x": 0.1, "accel_y": 0.0, "accel_z": 9.8,
                    "gyro_x": 0.0, "gyro_y": 0.0, "gyro_z": 0.01
                }
            }
        ]
    });

    let response = client
        .post(server.url("/v1/blackbox/upload"))
        .json(&upload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data_points"], 2);

    let response = client
        .get(server.url(&format!("/v1/blackbox/trails/{}", user.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    let trails = body["trails"].as_array().unwrap();
    assert_eq!(trails.len(), 1);
    assert_eq!(trails[0]["data_points"], 2);
    assert!(trails[0]["file_url"]
        .as_str()
        .unwrap()
        .starts_with("data:application/json;base64,"));
}

#[tokio::test]
async fn test_blackbox_upload_unknown_user() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let now = Utc::now();
    let response = client
        .post(server.url("/v1/blackbox/upload"))
        .json(&serde_json::json!({
            "user_id": Uuid::new_v4(),
            "start_ts": now,
            "end_ts": now,
            "data_points": []
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
