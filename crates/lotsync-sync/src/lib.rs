//! Sync orchestration: change detection, run lifecycle, live control, and
//! event broadcast.

pub mod config;
pub mod engine;
pub mod events;
pub mod importer;
pub mod live;
pub mod resolver;

pub use config::SyncConfig;
pub use engine::{RunControl, SyncEngine, SyncError, SyncOptions, SyncSummary};
pub use events::EventBus;
pub use importer::{ImportError, JsonImporter, PageFetcher, PageImporter};
pub use live::{ControlError, LiveOptions, LiveState, LiveStatus, LiveSyncController};
pub use resolver::{ResolveAction, ResolveError, ResolveOutcome, UpsertResolver};

pub const CRATE_NAME: &str = "lotsync-sync";
