//! Integration tests for the capture, store and upload pipeline
//!
//! These tests open a full engine on a temporary directory and deliver to a
//! mock ingest server.

use offsync_core::credentials::store_credentials;
use offsync_core::prefs::Preferences;
use offsync_core::sync::signing::{hmac_sha256_hex, signing_string, INGEST_PATH};
use offsync_core::{Config, EnginePaths, NetworkMonitor, NewSample, SyncEngine};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server_uri: &str) -> Config {
    let mut config = Config::default();
    config.sync.server_url = Some(server_uri.to_string());
    config.sync.timeout_secs = 2;
    config
}

async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn accepting_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest/locations"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

// ============================================
// Offline capture and delivery
// ============================================

#[tokio::test]
async fn test_offline_capture_delivers_once_online() {
    offsync_core::logging::init_test();
    let server = accepting_server().await;
    let dir = TempDir::new().unwrap();
    let paths = EnginePaths::in_dir(dir.path());

    store_credentials(&Preferences::new(&paths.prefs_dir), "device-42", "pairing-token").unwrap();

    let engine =
        SyncEngine::open(&config_for(&server.uri()), &paths, NetworkMonitor::new(false)).unwrap();

    // Captured out of order; delivered oldest first
    for ts in [
        "2024-03-01T08:02:00.000Z",
        "2024-03-01T08:00:00.000Z",
        "2024-03-01T08:01:00.000Z",
    ] {
        engine
            .capture_blocking(NewSample::new(ts, 52.5, 13.4, 5.0).with_provider("gps"))
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.status().unwrap().pending, 3);
    assert!(server.received_requests().await.unwrap().is_empty());

    engine.network().set_online(true);
    assert!(wait_until(|| engine.stats().samples_delivered == 3).await);
    assert_eq!(engine.status().unwrap().pending, 0);

    let requests = server.received_requests().await.unwrap();
    let first = &requests[0];
    let body = String::from_utf8(first.body.clone()).unwrap();
    let items: serde_json::Value = serde_json::from_str(&body).unwrap();
    let order: Vec<&str> = items
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["capturedAt"].as_str().unwrap())
        .collect();
    assert_eq!(
        order,
        vec![
            "2024-03-01T08:00:00.000Z",
            "2024-03-01T08:01:00.000Z",
            "2024-03-01T08:02:00.000Z"
        ]
    );

    let header = |name: &str| first.headers.get(name).unwrap().to_str().unwrap().to_string();
    assert_eq!(header("x-device-id"), "device-42");
    let timestamp: i64 = header("x-timestamp").parse().unwrap();
    let expected = hmac_sha256_hex(
        "pairing-token",
        &signing_string("POST", INGEST_PATH, timestamp, &body),
    )
    .unwrap();
    assert_eq!(header("x-signature"), expected);

    engine.shutdown();
}

#[tokio::test]
async fn test_rejected_batch_is_retried_later() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let engine = SyncEngine::open(
        &config_for(&server.uri()),
        &EnginePaths::in_dir(dir.path()),
        NetworkMonitor::new(false),
    )
    .unwrap();

    engine
        .capture_blocking(NewSample::new("2024-03-01T08:00:00.000Z", 1.0, 2.0, 3.0))
        .unwrap();

    assert!(engine.sync_now().await.is_retry());
    assert_eq!(engine.status().unwrap().pending, 1);

    let (delivered, _) = engine.drain().await;
    assert_eq!(delivered, 1);
    assert_eq!(engine.status().unwrap().pending, 0);
    engine.shutdown();
}

// ============================================
// Durability and encryption
// ============================================

#[tokio::test]
async fn test_pending_samples_survive_restart() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let paths = EnginePaths::in_dir(dir.path());
    let config = config_for(&server.uri());

    {
        let engine = SyncEngine::open(&config, &paths, NetworkMonitor::new(false)).unwrap();
        engine
            .capture_blocking(
                NewSample::new("2024-03-01T08:00:00.000Z", 48.85, 2.35, 12.5)
                    .with_battery(64, true),
            )
            .unwrap();
        assert!(engine.status().unwrap().encrypted);
        engine.shutdown();
    }

    let engine = SyncEngine::open(&config, &paths, NetworkMonitor::new(false)).unwrap();
    let status = engine.status().unwrap();
    assert_eq!(status.pending, 1);
    let latest = status.latest.unwrap();
    assert_eq!(latest.lat, 48.85);
    assert_eq!(latest.battery_pct, Some(64));
    assert_eq!(latest.is_charging, Some(true));
    engine.shutdown();
}

#[tokio::test]
async fn test_database_file_holds_no_plaintext_payload() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let paths = EnginePaths::in_dir(dir.path());

    let engine =
        SyncEngine::open(&config_for(&server.uri()), &paths, NetworkMonitor::new(false)).unwrap();
    engine
        .capture_blocking(
            NewSample::new("2024-03-01T08:00:00.000Z", 1.0, 2.0, 3.0)
                .with_provider("distinctive-provider-marker"),
        )
        .unwrap();
    engine.shutdown();

    let marker = b"distinctive-provider-marker";
    for file in ["samples.db", "samples.db-wal"] {
        let file = dir.path().join(file);
        if let Ok(bytes) = std::fs::read(&file) {
            assert!(
                !bytes.windows(marker.len()).any(|w| w == marker),
                "plaintext payload found in {}",
                file.display()
            );
        }
    }
}

#[tokio::test]
async fn test_unencrypted_storage_when_disabled() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let paths = EnginePaths::in_dir(dir.path());

    let mut config = config_for(&server.uri());
    config.storage.encrypt = false;

    let engine = SyncEngine::open(&config, &paths, NetworkMonitor::new(false)).unwrap();
    assert!(!engine.status().unwrap().encrypted);
    assert!(!paths.secret.exists());
    engine.shutdown();
}

// ============================================
// Retention
// ============================================

#[tokio::test]
async fn test_prune_expired_removes_old_samples() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let engine = SyncEngine::open(
        &config_for(&server.uri()),
        &EnginePaths::in_dir(dir.path()),
        NetworkMonitor::new(false),
    )
    .unwrap();

    let now = chrono::Utc::now();
    let old = offsync_core::format_timestamp(now - chrono::Duration::days(120));
    let fresh = offsync_core::format_timestamp(now - chrono::Duration::days(1));
    engine
        .capture_blocking(NewSample::new(old, 1.0, 2.0, 3.0))
        .unwrap();
    engine
        .capture_blocking(NewSample::new(fresh.clone(), 1.0, 2.0, 3.0))
        .unwrap();

    let report = engine.prune_expired(now).unwrap();
    assert_eq!(report.deleted, 1);

    let status = engine.status().unwrap();
    assert_eq!(status.total, 1);
    assert_eq!(status.latest.unwrap().captured_at, fresh);
    engine.shutdown();
}
