use crate::protocol::CatalogEntry;
use crate::retry::RetryPolicy;
use crate::store::{RemoteStore, StoreError};
use kora_core::tags::{TagDefinition, TagId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_CATALOG_REFRESH: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TagResolutionError {
    #[error("tag {0} is no longer registered locally")]
    UnknownLocalTag(TagId),

    #[error("tag '{name}' ({id}) not found in backend catalog")]
    NotFound { id: TagId, name: String },

    #[error("backend catalog unavailable after {attempts} attempts: {source}")]
    CatalogUnavailable {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

/// Cached name → remote id map built from the backend catalog.
///
/// A tag is matched by display name first, then by its local id. Misses do
/// not trigger a refetch; the catalog is reloaded when the cache expires or
/// after [`invalidate`](TagResolver::invalidate).
#[derive(Debug)]
pub struct TagResolver {
    by_name: HashMap<String, i64>,
    fetched_at: Option<Instant>,
    refresh_interval: Duration,
}

impl TagResolver {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            by_name: HashMap::new(),
            fetched_at: None,
            refresh_interval,
        }
    }

    pub fn invalidate(&mut self) {
        self.fetched_at = None;
    }

    pub fn needs_refresh(&self) -> bool {
        match self.fetched_at {
            Some(at) => at.elapsed() >= self.refresh_interval,
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn refresh<S: RemoteStore + ?Sized>(
        &mut self,
        store: &S,
        policy: &RetryPolicy,
    ) -> Result<usize, TagResolutionError> {
        self.refresh_until(store, policy, None)
    }

    /// Like [`refresh`](TagResolver::refresh), but no backoff sleeps past
    /// `deadline`.
    pub fn refresh_until<S: RemoteStore + ?Sized>(
        &mut self,
        store: &S,
        policy: &RetryPolicy,
        deadline: Option<Instant>,
    ) -> Result<usize, TagResolutionError> {
        let (catalog, attempts) = policy
            .run(
                deadline,
                |_| store.fetch_catalog(),
                |attempt, error, delay| {
                    tracing::warn!(
                        attempt,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Catalog fetch failed, retrying"
                    );
                },
            )
            .map_err(|failure| TagResolutionError::CatalogUnavailable {
                attempts: failure.attempts,
                source: failure.error,
            })?;

        self.load(&catalog);
        tracing::debug!(tags = self.by_name.len(), attempts, "Backend catalog loaded");
        Ok(self.by_name.len())
    }

    fn load(&mut self, catalog: &[CatalogEntry]) {
        self.by_name = catalog
            .iter()
            .map(|entry| (entry.name.clone(), entry.id))
            .collect();
        self.fetched_at = Some(Instant::now());
    }

    /// Remote id of `definition`, refreshing the catalog first if it expired.
    ///
    /// A failed refresh keeps serving the previous catalog when there is one.
    pub fn resolve<S: RemoteStore + ?Sized>(
        &mut self,
        store: &S,
        policy: &RetryPolicy,
        definition: &TagDefinition,
    ) -> Result<i64, TagResolutionError> {
        self.resolve_until(store, policy, definition, None)
    }

    /// [`resolve`](TagResolver::resolve) bounded by `deadline`: a catalog
    /// fetch that cannot succeed before it fails as unavailable.
    pub fn resolve_until<S: RemoteStore + ?Sized>(
        &mut self,
        store: &S,
        policy: &RetryPolicy,
        definition: &TagDefinition,
        deadline: Option<Instant>,
    ) -> Result<i64, TagResolutionError> {
        if self.needs_refresh() {
            if let Err(e) = self.refresh_until(store, policy, deadline) {
                if self.by_name.is_empty() {
                    return Err(e);
                }
                tracing::warn!(error = %e, "Using previous backend catalog");
                // Next attempt waits a full interval instead of every reading.
                self.fetched_at = Some(Instant::now());
            }
        }

        self.by_name
            .get(&definition.name)
            .or_else(|| self.by_name.get(definition.id.as_str()))
            .copied()
            .ok_or_else(|| TagResolutionError::NotFound {
                id: definition.id.clone(),
                name: definition.name.clone(),
            })
    }
}

impl Default for TagResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CATALOG_REFRESH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn entry(id: i64, name: &str) -> CatalogEntry {
        CatalogEntry {
            id,
            name: name.to_string(),
            unit: String::new(),
            data_type: None,
            alarm_limit: None,
        }
    }

    fn boiler() -> TagDefinition {
        TagDefinition::new("T01", "Boiler_Temp", "°C", 100.0)
    }

    #[test]
    fn resolves_by_name_and_caches() {
        let store =
            MemoryStore::with_catalog(vec![entry(7, "Boiler_Temp"), entry(8, "Flow_Rate")]);
        let mut resolver = TagResolver::default();
        let policy = RetryPolicy::immediate(3);

        assert_eq!(resolver.resolve(&store, &policy, &boiler()), Ok(7));
        assert_eq!(resolver.resolve(&store, &policy, &boiler()), Ok(7));
        assert_eq!(store.catalog_calls(), 1);
        assert_eq!(resolver.len(), 2);
    }

    #[test]
    fn falls_back_to_local_id() {
        let store = MemoryStore::with_catalog(vec![entry(3, "T01")]);
        let mut resolver = TagResolver::default();
        assert_eq!(
            resolver.resolve(&store, &RetryPolicy::immediate(1), &boiler()),
            Ok(3)
        );
    }

    #[test]
    fn miss_does_not_refetch_until_invalidated() {
        let store = MemoryStore::with_catalog(vec![entry(8, "Flow_Rate")]);
        let mut resolver = TagResolver::default();
        let policy = RetryPolicy::immediate(1);

        for _ in 0..3 {
            assert!(matches!(
                resolver.resolve(&store, &policy, &boiler()),
                Err(TagResolutionError::NotFound { .. })
            ));
        }
        assert_eq!(store.catalog_calls(), 1);

        store.set_catalog(vec![entry(8, "Flow_Rate"), entry(9, "Boiler_Temp")]);
        resolver.invalidate();
        assert_eq!(resolver.resolve(&store, &policy, &boiler()), Ok(9));
        assert_eq!(store.catalog_calls(), 2);
    }

    #[test]
    fn expired_cache_is_refreshed() {
        let store = MemoryStore::with_catalog(vec![entry(7, "Boiler_Temp")]);
        let mut resolver = TagResolver::new(Duration::ZERO);
        let policy = RetryPolicy::immediate(1);
        resolver.resolve(&store, &policy, &boiler()).unwrap();
        resolver.resolve(&store, &policy, &boiler()).unwrap();
        assert_eq!(store.catalog_calls(), 2);
    }

    #[test]
    fn unavailable_catalog_is_a_resolution_error() {
        let store = MemoryStore::with_catalog(vec![entry(7, "Boiler_Temp")]);
        store.fail_catalog(StoreError::Timeout);
        store.fail_catalog(StoreError::Timeout);
        let mut resolver = TagResolver::default();

        let err = resolver
            .resolve(&store, &RetryPolicy::immediate(2), &boiler())
            .unwrap_err();
        assert!(matches!(
            err,
            TagResolutionError::CatalogUnavailable { attempts: 2, .. }
        ));

        // The next call retries the fetch and succeeds.
        assert_eq!(
            resolver.resolve(&store, &RetryPolicy::immediate(2), &boiler()),
            Ok(7)
        );
    }

    #[test]
    fn failed_refresh_keeps_previous_catalog() {
        let store = MemoryStore::with_catalog(vec![entry(7, "Boiler_Temp")]);
        let mut resolver = TagResolver::new(Duration::ZERO);
        let policy = RetryPolicy::immediate(1);
        resolver.resolve(&store, &policy, &boiler()).unwrap();

        store.fail_catalog(StoreError::Status {
            status: 503,
            body: String::new(),
        });
        assert_eq!(resolver.resolve(&store, &policy, &boiler()), Ok(7));
    }

    #[test]
    fn failed_refresh_backs_off_until_next_interval() {
        let store = MemoryStore::with_catalog(vec![entry(7, "Boiler_Temp")]);
        let mut resolver = TagResolver::new(Duration::from_secs(60));
        let policy = RetryPolicy::immediate(1);
        resolver.resolve(&store, &policy, &boiler()).unwrap();

        resolver.invalidate();
        store.fail_catalog(StoreError::Timeout);
        assert_eq!(resolver.resolve(&store, &policy, &boiler()), Ok(7));
        assert_eq!(resolver.resolve(&store, &policy, &boiler()), Ok(7));
        assert_eq!(store.catalog_calls(), 2);
    }
}
