//! SQLite persistence + HTTP fetch utilities for lotsync.

pub mod fetch;
pub mod migrate;
pub mod store;

pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use migrate::{
    applied_migrations, apply_all, apply_migrations, AppliedMigration, Migration, MIGRATIONS,
};
pub use store::{LotStore, StorageError, SyncRunRecord};

pub const CRATE_NAME: &str = "lotsync-storage";
