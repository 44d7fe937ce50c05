//! Top-level handle used by capture code, the settings screen and the CLI
//!
//! [`SyncEngine`] owns the store, scheduler and pruner. Capture hands a
//! sample over and returns at once; persistence and upload happen on the
//! tokio runtime the engine was opened on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;

use crate::config::Config;
use crate::credentials::{CredentialProvider, EnvSource};
use crate::db::Store;
use crate::error::{Error, Result};
use crate::prefs::{Preferences, ServerUrlSetting, APP_PREFS_NAMESPACE};
use crate::retention::{PruneReport, Pruner};
use crate::secret::{FileSecretStore, SecretManager};
use crate::sync::{
    BatchUploader, NetworkMonitor, Scheduler, StatsSnapshot, SyncEvent, SyncObserver, SyncStats,
    TracingObserver, UploadOutcome,
};
use crate::types::{NewSample, Sample};

/// On-disk locations used by [`SyncEngine::open`]
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub database: PathBuf,
    pub prefs_dir: PathBuf,
    pub secret: PathBuf,
}

impl EnginePaths {
    /// XDG locations (`~/.local/share/offsync/...`)
    pub fn from_xdg() -> Self {
        Self {
            database: Config::database_path(),
            prefs_dir: Config::prefs_dir(),
            secret: Config::secret_path(),
        }
    }

    /// Everything under one directory
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            database: dir.join("samples.db"),
            prefs_dir: dir.join("prefs"),
            secret: dir.join("secret.key"),
        }
    }
}

/// Snapshot for diagnostics
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub pending: i64,
    pub total: i64,
    pub latest: Option<Sample>,
    pub server_url: String,
    pub server_url_overridden: bool,
    pub encrypted: bool,
    pub periodic_active: bool,
    pub online: bool,
    pub stats: StatsSnapshot,
}

/// Collaborators for [`SyncEngine::new`]
pub struct EngineParts {
    pub store: Arc<Store>,
    pub credentials: Arc<CredentialProvider>,
    pub server_url: ServerUrlSetting,
    pub config: Config,
    pub network: NetworkMonitor,
    pub observer: Arc<dyn SyncObserver>,
    pub runtime: Handle,
}

/// Counts every event before passing it on.
struct CountingObserver {
    stats: SyncStats,
    inner: Arc<dyn SyncObserver>,
}

impl SyncObserver for CountingObserver {
    fn on_event(&self, event: &SyncEvent) {
        self.stats.record(event);
        self.inner.on_event(event);
    }
}

pub struct SyncEngine {
    store: Arc<Store>,
    scheduler: Scheduler,
    pruner: Pruner,
    server_url: ServerUrlSetting,
    config: Config,
    observer: Arc<CountingObserver>,
    runtime: Handle,
}

impl SyncEngine {
    /// Open the engine on disk. Must be called from within a tokio runtime.
    ///
    /// When `storage.encrypt` is set but the secret store cannot be used,
    /// the store opens unencrypted rather than failing.
    pub fn open(config: &Config, paths: &EnginePaths, network: NetworkMonitor) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("sync engine needs a tokio runtime: {}", e)))?;

        let cipher = if config.storage.encrypt {
            SecretManager::new(Box::new(FileSecretStore::new(&paths.secret))).open_store_cipher()
        } else {
            None
        };

        let store = Store::open(&paths.database, cipher)?;
        store.migrate()?;

        let prefs = Preferences::new(&paths.prefs_dir);
        let credentials =
            CredentialProvider::with_default_namespaces(&prefs).prepend(Box::new(EnvSource));
        let server_url = ServerUrlSetting::new(Arc::new(prefs.namespace(APP_PREFS_NAMESPACE)));

        tracing::info!(
            database = %paths.database.display(),
            encrypted = store.is_encrypted(),
            "Sync engine opened"
        );

        Self::new(EngineParts {
            store: Arc::new(store),
            credentials: Arc::new(credentials),
            server_url,
            config: config.clone(),
            network,
            observer: Arc::new(TracingObserver::new()),
            runtime,
        })
    }

    pub fn new(parts: EngineParts) -> Result<Self> {
        let observer = Arc::new(CountingObserver {
            stats: SyncStats::default(),
            inner: parts.observer,
        });

        let uploader = BatchUploader::new(
            Arc::clone(&parts.store),
            parts.credentials,
            parts.server_url.clone(),
            parts.config.sync.clone(),
            Arc::clone(&observer) as Arc<dyn SyncObserver>,
        )?;
        let scheduler = Scheduler::new(
            uploader,
            parts.network,
            Duration::from_secs(parts.config.sync.periodic_interval_secs),
            parts.runtime.clone(),
        );
        let pruner = Pruner::new(Arc::clone(&parts.store), parts.config.retention.clone());

        Ok(Self {
            store: parts.store,
            scheduler,
            pruner,
            server_url: parts.server_url,
            config: parts.config,
            observer,
            runtime: parts.runtime,
        })
    }

    // ============================================
    // Capture
    // ============================================

    /// Accept a sample without waiting for it to be written.
    ///
    /// Only validation errors are returned. A failed write is reported as
    /// [`SyncEvent::CaptureFailed`] and the sample is lost. Either way a
    /// one-off upload is requested and the periodic job ensured.
    pub fn capture(&self, sample: NewSample) -> Result<()> {
        sample.validate()?;

        let store = Arc::clone(&self.store);
        let scheduler = self.scheduler.clone();
        let observer = Arc::clone(&self.observer);
        self.runtime.spawn(async move {
            if let Err(e) = insert_blocking(store, sample).await {
                observer.on_event(&SyncEvent::CaptureFailed {
                    error: e.to_string(),
                });
            }
            scheduler.trigger_opportunistic();
            scheduler.ensure_periodic();
        });
        Ok(())
    }

    /// Validate, persist and schedule, returning the new sample id.
    pub async fn insert_and_schedule(&self, sample: NewSample) -> Result<i64> {
        sample.validate()?;
        let id = insert_blocking(Arc::clone(&self.store), sample).await?;
        self.schedule_after_capture();
        Ok(id)
    }

    /// Like [`insert_and_schedule`](Self::insert_and_schedule) for callers
    /// outside async code. Blocks on SQLite.
    pub fn capture_blocking(&self, sample: NewSample) -> Result<i64> {
        sample.validate()?;
        let id = self.store.insert(&sample)?;
        self.schedule_after_capture();
        Ok(id)
    }

    fn schedule_after_capture(&self) {
        self.scheduler.trigger_opportunistic();
        self.scheduler.ensure_periodic();
    }

    // ============================================
    // Sync
    // ============================================

    /// One upload attempt right now, ignoring the network gate.
    pub async fn sync_now(&self) -> UploadOutcome {
        self.scheduler.uploader().run_once().await
    }

    /// Keep uploading until the queue is empty or an attempt fails.
    pub async fn drain(&self) -> (usize, UploadOutcome) {
        let mut delivered = 0;
        loop {
            match self.sync_now().await {
                UploadOutcome::Delivered {
                    count,
                    more_pending: true,
                } => delivered += count,
                UploadOutcome::Delivered { count, .. } => {
                    delivered += count;
                    return (
                        delivered,
                        UploadOutcome::Delivered {
                            count,
                            more_pending: false,
                        },
                    );
                }
                other => return (delivered, other),
            }
        }
    }

    /// Start background syncing: periodic job plus one immediate attempt.
    pub fn start(&self) {
        self.scheduler.ensure_periodic();
        self.scheduler.trigger_opportunistic();
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        tracing::info!("Sync engine stopped");
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn network(&self) -> &NetworkMonitor {
        self.scheduler.network()
    }

    // ============================================
    // Settings
    // ============================================

    pub fn server_url(&self) -> String {
        self.server_url.resolve(&self.config.sync)
    }

    pub fn set_server_url(&self, url: &str) -> Result<()> {
        self.server_url.set(url)?;
        tracing::info!(url = url.trim(), "Server URL override set");
        Ok(())
    }

    pub fn clear_server_url(&self) -> Result<()> {
        self.server_url.clear()?;
        tracing::info!("Server URL override cleared");
        Ok(())
    }

    // ============================================
    // Retention & diagnostics
    // ============================================

    pub fn pruner(&self) -> &Pruner {
        &self.pruner
    }

    pub fn prune_expired(&self, now: DateTime<Utc>) -> Result<PruneReport> {
        self.pruner.prune_expired(now)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.observer.stats.snapshot()
    }

    pub fn status(&self) -> Result<EngineStatus> {
        Ok(EngineStatus {
            pending: self.store.count_pending()?,
            total: self.store.count_all()?,
            latest: self.store.get_latest()?,
            server_url: self.server_url(),
            server_url_overridden: self.server_url.get()?.is_some(),
            encrypted: self.store.is_encrypted(),
            periodic_active: self.scheduler.is_periodic_active(),
            online: self.network().is_online(),
            stats: self.stats(),
        })
    }
}

async fn insert_blocking(store: Arc<Store>, sample: NewSample) -> Result<i64> {
    tokio::task::spawn_blocking(move || store.insert(&sample))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}
