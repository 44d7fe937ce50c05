//! Durable sample store
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - An append/scan queue of samples with a per-row delivery flag
//! - Payload encryption at rest

mod cipher;
pub mod repo;
pub mod schema;

pub use cipher::PayloadCipher;
pub use repo::Store;
