//! Environment Context Resolver
//!
//! Picks the store a unit of work runs against. No environment means
//! production; a named environment that is unknown or expired is an error and
//! never falls back to production.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::registry::EnvironmentRegistry;
use crate::error::{EnvError, ResolveError, StoreError};
use crate::store::Store;

/// A store handle bound to one request
#[derive(Debug, Clone)]
pub struct ScopedStore {
    pub scope: Scope,
    pub store: Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Scope {
    Production,
    Environment(String),
}

pub struct ContextResolver {
    production: Store,
    registry: Arc<EnvironmentRegistry>,
}

impl ContextResolver {
    pub fn new(production: Store, registry: Arc<EnvironmentRegistry>) -> Self {
        Self {
            production,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    /// Blocking: opens the environment's store file.
    pub fn resolve(&self, environment: Option<&str>) -> Result<ScopedStore, ResolveError> {
        let Some(name) = environment else {
            return Ok(ScopedStore {
                scope: Scope::Production,
                store: self.production.clone(),
            });
        };

        let record = self.registry.get(name).map_err(|e| match e {
            EnvError::Store(store) => ResolveError::Store(store),
            _ => ResolveError::UnknownEnvironment(name.to_string()),
        })?;

        // The store can vanish between the lookup and the open if the
        // environment is deleted concurrently.
        let busy_timeout = self.registry.busy_timeout();
        let store = Store::open_existing(&record.backing_store_path, busy_timeout)
            .map_err(|e| match e {
                StoreError::Io { .. } => ResolveError::UnknownEnvironment(name.to_string()),
                other => ResolveError::Store(other),
            })?;
        debug!(
            environment = name,
            path = %record.backing_store_path.display(),
            "resolved environment store"
        );

        Ok(ScopedStore {
            scope: Scope::Environment(record.name),
            store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::env::seed::SeedMode;
    use crate::store::DEFAULT_BUSY_TIMEOUT;
    use chrono::Utc;

    fn setup() -> (tempfile::TempDir, Arc<ManualClock>, ContextResolver) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let production = Store::open(dir.path().join("mirror.db"), DEFAULT_BUSY_TIMEOUT).unwrap();
        let registry = EnvironmentRegistry::open(
            dir.path().join("environments"),
            Some(production.clone()),
            clock.clone(),
            DEFAULT_BUSY_TIMEOUT,
            3600,
        )
        .unwrap();
        (dir, clock, ContextResolver::new(production, Arc::new(registry)))
    }

    #[test]
    fn test_no_environment_is_production() {
        let (_dir, _clock, resolver) = setup();
        let scoped = resolver.resolve(None).unwrap();
        assert_eq!(scoped.scope, Scope::Production);
        assert!(scoped.store.path().ends_with("mirror.db"));
    }

    #[test]
    fn test_named_environment_resolves_to_its_store() {
        let (_dir, _clock, resolver) = setup();
        let record = resolver.registry().create("qa", SeedMode::Empty, 60).unwrap();
        let scoped = resolver.resolve(Some("qa")).unwrap();
        assert_eq!(scoped.scope, Scope::Environment("qa".into()));
        assert_eq!(scoped.store.path(), record.backing_store_path);
    }

    #[test]
    fn test_unknown_or_expired_never_falls_back() {
        let (_dir, clock, resolver) = setup();
        assert!(matches!(
            resolver.resolve(Some("missing")),
            Err(ResolveError::UnknownEnvironment(_))
        ));

        resolver.registry().create("qa", SeedMode::Empty, 5).unwrap();
        clock.advance(chrono::Duration::seconds(6));
        assert!(matches!(
            resolver.resolve(Some("qa")),
            Err(ResolveError::UnknownEnvironment(_))
        ));
    }
}
