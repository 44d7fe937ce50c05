//! One upload attempt: dequeue, sign, post, mark delivered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config::SyncConfig;
use crate::credentials::CredentialProvider;
use crate::db::Store;
use crate::error::{Error, Result};
use crate::prefs::ServerUrlSetting;

use super::client::{IngestClient, IngestRequest};
use super::observer::{SyncEvent, SyncObserver};
use super::payload::encode_batch;
use super::signing::sign_ingest;

/// Result of [`BatchUploader::run_once`]. Failures never surface as errors;
/// the batch simply stays pending for the next run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Nothing was pending
    Idle,
    /// The server accepted `count` samples. `more_pending` is set when the
    /// batch was full, so another one may be waiting.
    Delivered { count: usize, more_pending: bool },
    /// Try again later
    Retry { reason: String },
}

impl UploadOutcome {
    pub fn is_retry(&self) -> bool {
        matches!(self, UploadOutcome::Retry { .. })
    }
}

/// Drains the pending queue one batch at a time.
pub struct BatchUploader {
    store: Arc<Store>,
    client: IngestClient,
    credentials: Arc<CredentialProvider>,
    server_url: ServerUrlSetting,
    config: SyncConfig,
    observer: Arc<dyn SyncObserver>,
}

impl BatchUploader {
    pub fn new(
        store: Arc<Store>,
        credentials: Arc<CredentialProvider>,
        server_url: ServerUrlSetting,
        config: SyncConfig,
        observer: Arc<dyn SyncObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let client = IngestClient::new(
            Duration::from_secs(config.timeout_secs),
            config.send_token_header,
        )?;
        Ok(Self {
            store,
            client,
            credentials,
            server_url,
            config,
            observer,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Upload the oldest pending batch.
    ///
    /// Samples are marked delivered only after a 2xx response, and only the
    /// ids that were sent. A crash between the response and the mark means
    /// the batch is sent again.
    pub async fn run_once(&self) -> UploadOutcome {
        let batch_size = self.config.batch_size;
        let batch = match self
            .with_store(move |store| store.dequeue_pending(batch_size))
            .await
        {
            Ok(batch) => batch,
            Err(e) => return self.storage_failure("dequeue", e),
        };

        if batch.is_empty() {
            self.observer.on_event(&SyncEvent::Idle);
            return UploadOutcome::Idle;
        }

        let count = batch.len();
        let ids: Vec<i64> = batch.iter().map(|s| s.id).collect();

        let body = match encode_batch(&batch) {
            Ok(body) => body,
            Err(e) => return self.storage_failure("encode", e),
        };

        let base_url = self.server_url.resolve(&self.config);
        let creds = self.credentials.resolve_credentials();

        let signature = match creds.device_token.as_deref() {
            Some(token) => match sign_ingest(token, Utc::now().timestamp_millis(), &body) {
                Ok(signed) => Some(signed),
                Err(e) => {
                    self.observer.on_event(&SyncEvent::SignatureFailed {
                        error: e.to_string(),
                    });
                    None
                }
            },
            None => {
                self.observer.on_event(&SyncEvent::Unsigned);
                None
            }
        };

        tracing::debug!(count, url = %base_url, signed = signature.is_some(), "Uploading batch");
        let started = Instant::now();

        let request = IngestRequest {
            base_url: &base_url,
            body,
            device_id: creds.device_id.as_deref(),
            device_token: creds.device_token.as_deref(),
            signature: signature.as_ref(),
        };

        if let Err(e) = self.client.send(request).await {
            self.observer.on_event(&SyncEvent::BatchFailed {
                count,
                error: e.to_string(),
            });
            return UploadOutcome::Retry {
                reason: e.to_string(),
            };
        }

        let marked = match self
            .with_store(move |store| store.mark_delivered(&ids))
            .await
        {
            Ok(marked) => marked,
            Err(e) => return self.storage_failure("mark_delivered", e),
        };

        self.observer.on_event(&SyncEvent::BatchDelivered {
            count,
            marked,
            duration: started.elapsed(),
        });

        UploadOutcome::Delivered {
            count,
            more_pending: count == batch_size,
        }
    }

    fn storage_failure(&self, operation: &'static str, e: Error) -> UploadOutcome {
        self.observer.on_event(&SyncEvent::StorageFailed {
            operation,
            error: e.to_string(),
        });
        UploadOutcome::Retry {
            reason: e.to_string(),
        }
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{NamespaceSource, DEVICE_ID_KEY, DEVICE_TOKEN_KEY};
    use crate::db::PayloadCipher;
    use crate::prefs::MemoryNamespace;
    use crate::secret::{EncryptionSecret, SECRET_LEN};
    use crate::sync::observer::TracingObserver;
    use crate::sync::signing::{hmac_sha256_hex, signing_string, INGEST_PATH};
    use crate::types::NewSample;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn memory_store() -> Arc<Store> {
        let store = Store::open_in_memory(None).unwrap();
        store.migrate().unwrap();
        Arc::new(store)
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<SyncEvent>>,
    }

    impl SyncObserver for RecordingObserver {
        fn on_event(&self, event: &SyncEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn sample(minute: u32) -> NewSample {
        NewSample::new(
            format!("2024-03-01T08:{:02}:00.000Z", minute),
            10.0 + minute as f64,
            20.0,
            5.0,
        )
    }

    fn credentials(token: Option<&str>) -> Arc<CredentialProvider> {
        let mut ns = MemoryNamespace::new("test").with_entry(DEVICE_ID_KEY, "dev-1");
        if let Some(token) = token {
            ns = ns.with_entry(DEVICE_TOKEN_KEY, token);
        }
        Arc::new(CredentialProvider::new(vec![Box::new(
            NamespaceSource::new(Arc::new(ns)),
        )]))
    }

    fn uploader(
        store: Arc<Store>,
        server_uri: &str,
        batch_size: usize,
        token: Option<&str>,
        observer: Arc<dyn SyncObserver>,
    ) -> BatchUploader {
        let config = SyncConfig {
            server_url: Some(server_uri.to_string()),
            batch_size,
            timeout_secs: 2,
            ..SyncConfig::default()
        };
        let server_url = ServerUrlSetting::new(Arc::new(MemoryNamespace::new("app_prefs")));
        BatchUploader::new(store, credentials(token), server_url, config, observer).unwrap()
    }

    #[tokio::test]
    async fn test_idle_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = memory_store();
        let up = uploader(store, &server.uri(), 50, Some("tok"), Arc::new(TracingObserver::new()));
        assert_eq!(up.run_once().await, UploadOutcome::Idle);
    }

    #[tokio::test]
    async fn test_success_marks_batch_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest/locations"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = memory_store();
        for minute in 0..3 {
            store.insert(&sample(minute)).unwrap();
        }

        let up = uploader(
            Arc::clone(&store),
            &server.uri(),
            50,
            Some("tok"),
            Arc::new(TracingObserver::new()),
        );
        assert_eq!(
            up.run_once().await,
            UploadOutcome::Delivered {
                count: 3,
                more_pending: false
            }
        );
        assert_eq!(store.count_pending().unwrap(), 0);
        assert_eq!(store.count_all().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failure_leaves_batch_pending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let store = memory_store();
        store.insert(&sample(1)).unwrap();
        store.insert(&sample(2)).unwrap();

        let observer = Arc::new(RecordingObserver::default());
        let up = uploader(Arc::clone(&store), &server.uri(), 50, Some("tok"), observer.clone());

        assert!(up.run_once().await.is_retry());
        assert_eq!(store.count_pending().unwrap(), 2);

        let events = observer.events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::BatchFailed { count: 2, .. })));
    }

    #[tokio::test]
    async fn test_unreadable_rows_do_not_stall_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.db");
        {
            let secret = EncryptionSecret::from_bytes([3u8; SECRET_LEN]);
            let sealed = Store::open(&path, Some(PayloadCipher::new(&secret))).unwrap();
            sealed.migrate().unwrap();
            for minute in 0..4 {
                sealed.insert(&sample(minute)).unwrap();
            }
        }

        let store = Store::open(&path, None).unwrap();
        store.migrate().unwrap();
        store.insert(&sample(30)).unwrap();
        let store = Arc::new(store);

        let up = uploader(
            Arc::clone(&store),
            &server.uri(),
            2,
            Some("tok"),
            Arc::new(TracingObserver::new()),
        );
        assert_eq!(
            up.run_once().await,
            UploadOutcome::Delivered {
                count: 1,
                more_pending: false
            }
        );
        assert_eq!(up.run_once().await, UploadOutcome::Idle);
        assert_eq!(store.count_pending().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_full_batch_reports_more_pending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = memory_store();
        for minute in 0..5 {
            store.insert(&sample(minute)).unwrap();
        }

        let up = uploader(
            Arc::clone(&store),
            &server.uri(),
            2,
            None,
            Arc::new(TracingObserver::new()),
        );
        assert_eq!(
            up.run_once().await,
            UploadOutcome::Delivered {
                count: 2,
                more_pending: true
            }
        );
        assert_eq!(store.count_pending().unwrap(), 3);

        up.run_once().await;
        assert_eq!(
            up.run_once().await,
            UploadOutcome::Delivered {
                count: 1,
                more_pending: false
            }
        );
        assert_eq!(up.run_once().await, UploadOutcome::Idle);
    }

    #[tokio::test]
    async fn test_request_is_signed_over_exact_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = memory_store();
        store
            .insert(&sample(7).with_provider("gps").with_battery(80, false))
            .unwrap();

        let up = uploader(
            store,
            &server.uri(),
            50,
            Some("device-secret"),
            Arc::new(TracingObserver::new()),
        );
        up.run_once().await;

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let request = &received[0];

        let header = |name: &str| {
            request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        assert_eq!(header("x-device-id").as_deref(), Some("dev-1"));

        let body = String::from_utf8(request.body.clone()).unwrap();
        let timestamp: i64 = header("x-timestamp").unwrap().parse().unwrap();
        let expected =
            hmac_sha256_hex("device-secret", &signing_string("POST", INGEST_PATH, timestamp, &body))
                .unwrap();
        assert_eq!(header("x-signature").unwrap(), expected);

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value[0]["provider"], "gps");
        assert_eq!(value[0]["batteryPct"], 80);
    }

    #[tokio::test]
    async fn test_missing_token_sends_unsigned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = memory_store();
        store.insert(&sample(1)).unwrap();

        let observer = Arc::new(RecordingObserver::default());
        let up = uploader(Arc::clone(&store), &server.uri(), 50, None, observer.clone());
        assert!(matches!(
            up.run_once().await,
            UploadOutcome::Delivered { count: 1, .. }
        ));

        let received = server.received_requests().await.unwrap();
        assert!(!received[0].headers.contains_key("x-signature"));
        assert!(!received[0].headers.contains_key("x-timestamp"));
        assert!(observer
            .events
            .lock()
            .unwrap()
            .contains(&SyncEvent::Unsigned));
    }

    #[tokio::test]
    async fn test_runtime_url_override_is_used() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest/locations"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = memory_store();
        store.insert(&sample(1)).unwrap();

        let prefs = Arc::new(MemoryNamespace::new("app_prefs"));
        let server_url = ServerUrlSetting::new(prefs);
        server_url.set(&server.uri()).unwrap();

        let config = SyncConfig {
            server_url: Some("http://127.0.0.1:9".to_string()),
            timeout_secs: 2,
            ..SyncConfig::default()
        };
        let up = BatchUploader::new(
            Arc::clone(&store),
            credentials(Some("tok")),
            server_url,
            config,
            Arc::new(TracingObserver::new()),
        )
        .unwrap();

        assert!(matches!(up.run_once().await, UploadOutcome::Delivered { .. }));
        assert_eq!(store.count_pending().unwrap(), 0);
    }
}
