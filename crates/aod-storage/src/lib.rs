//! Persistence and fetch utilities for AOD: content hashing, the job queue, the staging
//! store, the canonical catalog, and a rate-limited HTTP client.
//!
//! Every store is a trait with an in-memory implementation (used by tests and local
//! runs) and a Postgres implementation in [`postgres`].

pub mod catalog;
pub mod fetch;
pub mod hash;
pub mod jobs;
pub mod postgres;
pub mod staging;

pub use catalog::{CatalogStore, MemoryCatalogStore};
pub use fetch::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
pub use hash::{canonical_json_bytes, content_hash, sha256_hex};
pub use jobs::{JobStore, MemoryJobStore};
pub use postgres::PgStore;
pub use staging::{Collector, MemoryStagingStore, StagingStore};

pub const CRATE_NAME: &str = "aod-storage";
