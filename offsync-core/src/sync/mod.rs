//! Delivery of captured samples to the ingest server
//!
//! [`BatchUploader`] performs one attempt; [`Scheduler`] decides when
//! attempts happen.

pub mod client;
pub mod network;
pub mod observer;
pub mod payload;
pub mod registry;
pub mod scheduler;
pub mod signing;
pub mod uploader;

pub use client::IngestClient;
pub use network::NetworkMonitor;
pub use observer::{StatsSnapshot, SyncEvent, SyncObserver, SyncStats, TracingObserver};
pub use registry::TaskRegistry;
pub use scheduler::{Scheduler, PERIODIC_TASK_NAME};
pub use signing::{sign_ingest, SignedHeaders, INGEST_PATH};
pub use uploader::{BatchUploader, UploadOutcome};
