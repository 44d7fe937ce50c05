//! # offsync-core
//!
//! Core library for offsync - an offline-first location sample sync engine.
//!
//! This library provides:
//! - Durable, optionally encrypted SQLite queue of captured samples
//! - Batched, HMAC-signed uploads to an ingest endpoint
//! - Opportunistic and periodic upload scheduling gated on connectivity
//! - Age-based retention pruning
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Samples move through two states:
//! - **Pending:** persisted locally, waiting for the server to accept them
//! - **Delivered:** acknowledged by a 2xx response, kept until retention prunes them
//!
//! Capture never waits on the network. Uploads are at-least-once: a sample
//! is marked delivered only after the server accepted the batch it was in.
//!
//! ## Example
//!
//! ```rust,no_run
//! use offsync_core::{Config, EnginePaths, NetworkMonitor, NewSample, SyncEngine};
//!
//! # async fn run() -> offsync_core::Result<()> {
//! let config = Config::load()?;
//! let engine = SyncEngine::open(&config, &EnginePaths::from_xdg(), NetworkMonitor::default())?;
//!
//! engine.capture(NewSample::new("2024-03-01T08:00:00.000Z", 52.52, 13.40, 8.0))?;
//! engine.start();
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Store;
pub use engine::{EngineParts, EnginePaths, EngineStatus, SyncEngine};
pub use error::{Error, Result};
pub use retention::{PruneReport, Pruner, RetentionPolicy};
pub use sync::{NetworkMonitor, UploadOutcome};
pub use types::*;

// Public modules
pub mod config;
pub mod credentials;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod prefs;
pub mod retention;
pub mod secret;
pub mod sync;
pub mod types;
