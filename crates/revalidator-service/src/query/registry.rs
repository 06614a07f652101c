use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use super::{KEY_SEPARATOR, Query, QuerySpec, RevalidationOutcome};

/// The type-erased part of a [`Query`] the revalidation worker needs.
pub trait Revalidate: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `key` can be turned back into a payload of this query.
    fn owns_key(&self, key: &str) -> bool;

    /// Refreshes the cached value of `key`.
    fn revalidate<'a>(&'a self, key: &'a str) -> BoxFuture<'a, RevalidationOutcome>;

    fn check_key_roundtrip(&self) -> bool;
}

impl<S: QuerySpec> Revalidate for Query<S> {
    fn name(&self) -> &'static str {
        self.spec().name()
    }

    fn owns_key(&self, key: &str) -> bool {
        self.spec().payload(key).is_some()
    }

    fn revalidate<'a>(&'a self, key: &'a str) -> BoxFuture<'a, RevalidationOutcome> {
        Box::pin(self.revalidate_key(key))
    }

    fn check_key_roundtrip(&self) -> bool {
        Query::check_key_roundtrip(self)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a query named `{0}` is already registered")]
    DuplicateName(&'static str),
}

/// All queries known to a revalidation worker, by name.
#[derive(Debug, Clone, Default)]
pub struct QueryRegistry {
    queries: Arc<BTreeMap<&'static str, Arc<dyn Revalidate>>>,
}

impl QueryRegistry {
    pub fn builder() -> QueryRegistryBuilder {
        QueryRegistryBuilder::default()
    }

    /// Finds the query that owns `key`.
    ///
    /// The query named by the key's namespace is asked first. Keys that are not namespaced are
    /// offered to every registered query in name order.
    pub fn resolve(&self, key: &str) -> Option<&Arc<dyn Revalidate>> {
        if let Some((name, _)) = key.split_once(KEY_SEPARATOR) {
            if let Some(query) = self.queries.get(name) {
                if query.owns_key(key) {
                    return Some(query);
                }
            }
        }

        self.queries.values().find(|query| query.owns_key(key))
    }

    /// Returns the names of all queries whose key derivation does not round-trip.
    pub fn check_roundtrips(&self) -> Vec<&'static str> {
        self.queries
            .values()
            .filter(|query| !query.check_key_roundtrip())
            .map(|query| query.name())
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.queries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct QueryRegistryBuilder {
    queries: BTreeMap<&'static str, Arc<dyn Revalidate>>,
}

impl QueryRegistryBuilder {
    /// Adds `query`, its name must not be taken yet.
    pub fn register<S: QuerySpec>(mut self, query: Query<S>) -> Result<Self, RegistryError> {
        let name = query.spec().name();
        if self.queries.contains_key(name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.queries.insert(name, Arc::new(query));
        Ok(self)
    }

    pub fn build(self) -> QueryRegistry {
        QueryRegistry {
            queries: Arc::new(self.queries),
        }
    }
}
