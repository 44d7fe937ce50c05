//! Upload lifecycle events
//!
//! Background work has no caller to return errors to, so every failure the
//! capture and upload paths swallow is reported here instead. The default
//! [`TracingObserver`] logs each event and keeps running counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Something that happened on the capture or upload path.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Nothing pending, no request made
    Idle,
    /// A batch was accepted and marked delivered
    BatchDelivered {
        count: usize,
        marked: usize,
        duration: Duration,
    },
    /// The request failed; the batch stays pending
    BatchFailed { count: usize, error: String },
    /// No device token, the batch goes out without signature headers
    Unsigned,
    /// HMAC computation failed, the batch goes out without signature headers
    SignatureFailed { error: String },
    /// A local storage operation failed
    StorageFailed {
        operation: &'static str,
        error: String,
    },
    /// A captured sample could not be persisted and is lost
    CaptureFailed { error: String },
}

/// Receives [`SyncEvent`]s. Called from background tasks.
pub trait SyncObserver: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

/// Point-in-time copy of [`SyncStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub attempts: u64,
    pub batches_delivered: u64,
    pub samples_delivered: u64,
    pub failures: u64,
    pub unsigned_uploads: u64,
    pub storage_failures: u64,
    pub lost_captures: u64,
}

/// Running counters across the life of the process
#[derive(Debug, Default)]
pub struct SyncStats {
    attempts: AtomicU64,
    batches_delivered: AtomicU64,
    samples_delivered: AtomicU64,
    failures: AtomicU64,
    unsigned_uploads: AtomicU64,
    storage_failures: AtomicU64,
    lost_captures: AtomicU64,
}

impl SyncStats {
    pub fn record(&self, event: &SyncEvent) {
        match event {
            SyncEvent::Idle => {}
            SyncEvent::BatchDelivered { marked, .. } => {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                self.batches_delivered.fetch_add(1, Ordering::Relaxed);
                self.samples_delivered
                    .fetch_add(*marked as u64, Ordering::Relaxed);
            }
            SyncEvent::BatchFailed { .. } => {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            SyncEvent::Unsigned | SyncEvent::SignatureFailed { .. } => {
                self.unsigned_uploads.fetch_add(1, Ordering::Relaxed);
            }
            SyncEvent::StorageFailed { .. } => {
                self.storage_failures.fetch_add(1, Ordering::Relaxed);
            }
            SyncEvent::CaptureFailed { .. } => {
                self.lost_captures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            samples_delivered: self.samples_delivered.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            unsigned_uploads: self.unsigned_uploads.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            lost_captures: self.lost_captures.load(Ordering::Relaxed),
        }
    }
}

/// Logs events through `tracing` and counts them.
#[derive(Debug, Default)]
pub struct TracingObserver {
    stats: SyncStats,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl SyncObserver for TracingObserver {
    fn on_event(&self, event: &SyncEvent) {
        self.stats.record(event);
        match event {
            SyncEvent::Idle => tracing::debug!("No pending samples"),
            SyncEvent::BatchDelivered {
                count,
                marked,
                duration,
            } => tracing::info!(
                count,
                marked,
                duration_ms = duration.as_millis() as u64,
                "Batch delivered"
            ),
            SyncEvent::BatchFailed { count, error } => {
                tracing::warn!(count, error = %error, "Batch upload failed, will retry")
            }
            SyncEvent::Unsigned => tracing::debug!("No device token, sending unsigned"),
            SyncEvent::SignatureFailed { error } => {
                tracing::warn!(error = %error, "Signing failed, sending unsigned")
            }
            SyncEvent::StorageFailed { operation, error } => {
                tracing::error!(operation, error = %error, "Sample store operation failed")
            }
            SyncEvent::CaptureFailed { error } => {
                tracing::error!(error = %error, "Captured sample was not persisted")
            }
        }
    }
}
