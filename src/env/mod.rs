//! Named environments
//!
//! Disposable, TTL-bounded copies of the mirror store. The registry owns
//! their lifecycle, the watcher expires them, and the resolver routes each
//! request to production or to one of them.

pub mod registry;
pub mod resolver;
pub mod seed;
pub mod watcher;

pub use registry::{
    validate_name, CleanupReport, DeleteOutcome, EnvironmentRecord, EnvironmentRegistry,
};
pub use resolver::{ContextResolver, Scope, ScopedStore};
pub use seed::SeedMode;
pub use watcher::{Sweep, TtlWatcher};
