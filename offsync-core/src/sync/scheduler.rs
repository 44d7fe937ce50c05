//! Deferred upload scheduling
//!
//! Two kinds of work drive the uploader:
//!
//! - **Opportunistic** one-off runs, requested after every capture. Requests
//!   coalesce: while one is queued (waiting for network) further requests
//!   are no-ops. A run that delivers a full batch queues another.
//! - A **periodic** run named [`PERIODIC_TASK_NAME`], installed at most once
//!   and repeating every interval (never less than fifteen minutes).
//!
//! Both wait for [`NetworkMonitor`] to report online before uploading.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;

use crate::config::MIN_PERIODIC_INTERVAL_SECS;

use super::network::NetworkMonitor;
use super::registry::TaskRegistry;
use super::uploader::{BatchUploader, UploadOutcome};

/// Unique name of the periodic job
pub const PERIODIC_TASK_NAME: &str = "offsync_periodic_sync";

/// Schedules uploads on a tokio runtime. Cheap to clone.
///
/// The periodic task keeps the scheduler alive; call [`Scheduler::shutdown`]
/// to stop it.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    uploader: BatchUploader,
    network: NetworkMonitor,
    registry: TaskRegistry,
    one_off_queued: AtomicBool,
    interval: Duration,
    runtime: Handle,
}

impl Scheduler {
    /// Create a scheduler spawning onto `runtime`. `interval` is raised to
    /// the fifteen minute floor if shorter.
    pub fn new(
        uploader: BatchUploader,
        network: NetworkMonitor,
        interval: Duration,
        runtime: Handle,
    ) -> Self {
        let floor = Duration::from_secs(MIN_PERIODIC_INTERVAL_SECS);
        Self {
            inner: Arc::new(Inner {
                uploader,
                network,
                registry: TaskRegistry::new(),
                one_off_queued: AtomicBool::new(false),
                interval: interval.max(floor),
                runtime,
            }),
        }
    }

    pub fn uploader(&self) -> &BatchUploader {
        &self.inner.uploader
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    /// Request a one-off upload once the network is available.
    ///
    /// Returns `false` when a request was already queued and this one was
    /// folded into it.
    pub fn trigger_opportunistic(&self) -> bool {
        Inner::trigger(&self.inner)
    }

    /// Install the periodic job unless it is already running.
    pub fn ensure_periodic(&self) -> bool {
        let inner = Arc::clone(&self.inner);
        let installed = self.inner.registry.insert_if_absent(PERIODIC_TASK_NAME, || {
            self.inner.runtime.spawn(async move { inner.run_periodic().await })
        });
        if installed {
            tracing::info!(
                task = PERIODIC_TASK_NAME,
                interval_secs = self.inner.interval.as_secs(),
                "Periodic sync scheduled"
            );
        }
        installed
    }

    pub fn is_periodic_active(&self) -> bool {
        self.inner.registry.is_active(PERIODIC_TASK_NAME)
    }

    pub fn cancel_periodic(&self) -> bool {
        self.inner.registry.cancel(PERIODIC_TASK_NAME)
    }

    /// Stop all scheduled work. Queued one-off runs are left to finish.
    pub fn shutdown(&self) {
        self.inner.registry.shutdown();
    }
}

impl Inner {
    fn trigger(this: &Arc<Self>) -> bool {
        if this.one_off_queued.swap(true, Ordering::AcqRel) {
            tracing::trace!("One-off sync already queued");
            return false;
        }
        let inner = Arc::clone(this);
        this.runtime.spawn(async move { inner.run_one_off().await });
        true
    }

    async fn run_one_off(self: Arc<Self>) {
        self.network.wait_online().await;
        // Clear before running so captures during the upload queue a new run
        self.one_off_queued.store(false, Ordering::Release);
        let outcome = self.uploader.run_once().await;
        self.follow_up(&outcome);
    }

    async fn run_periodic(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.network.wait_online().await;
            tracing::debug!(task = PERIODIC_TASK_NAME, "Periodic sync run");
            let outcome = self.uploader.run_once().await;
            self.follow_up(&outcome);
        }
    }

    fn follow_up(self: &Arc<Self>, outcome: &UploadOutcome) {
        if let UploadOutcome::Delivered {
            more_pending: true, ..
        } = outcome
        {
            Inner::trigger(self);
        }
    }
}
