//! opsmirror - incremental document mirror with disposable named environments
//!
//! Pulls records from remote document databases into a local SQLite mirror,
//! and manages TTL-bounded copies of that mirror for isolated work.

pub mod clock;
pub mod config;
pub mod env;
pub mod error;
#[cfg(feature = "server")]
pub mod server;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use env::{
    CleanupReport, ContextResolver, DeleteOutcome, EnvironmentRecord, EnvironmentRegistry,
    SeedMode, TtlWatcher,
};
pub use error::{ApiError, ConfigError, EnvError, ResolveError, StoreError, SyncError};
pub use store::Store;
pub use sync::{EntityKind, HttpDocumentApi, PageFetcher, SyncOrchestrator, SyncReport};
