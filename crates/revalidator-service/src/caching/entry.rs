use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::clock;

/// A value stored in the [`Cache`](super::Cache) together with the time it was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub stored_at: SystemTime,
    /// A human readable hint of what produced this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl<T> CacheEntry<T> {
    pub fn age(&self, now: SystemTime) -> Duration {
        clock::age(now, self.stored_at)
    }
}

/// The borrowed counterpart of [`CacheEntry`] used when writing.
#[derive(Serialize)]
pub(super) struct CacheEntryRef<'a, T> {
    pub value: &'a T,
    pub stored_at: SystemTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<&'a str>,
}

/// How usable a cached value is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Served as is.
    Fresh,
    /// Still served, but a refresh is due.
    Stale,
    /// Must not be served unless the origin fails.
    Expired,
}

impl AsRef<str> for Freshness {
    fn as_ref(&self) -> &str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Expired => "expired",
        }
    }
}

/// Freshness rules of a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    /// Age after which a value should be refreshed.
    pub stale_after: Duration,
    /// Age after which a value must not be served at all.
    ///
    /// `None` means stale values are tolerated indefinitely.
    pub max_age: Option<Duration>,
    /// Whether stale values are served while revalidating in the background.
    pub enable_swr: bool,
}

impl FreshnessPolicy {
    /// Stale after `stale_after`, never expired, revalidated in the background.
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            max_age: None,
            enable_swr: true,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn without_swr(mut self) -> Self {
        self.enable_swr = false;
        self
    }

    /// Classifies a value of the given age.
    pub fn classify(&self, age: Duration) -> Freshness {
        match self.max_age {
            Some(max_age) if age >= max_age => Freshness::Expired,
            _ if age < self.stale_after => Freshness::Fresh,
            _ => Freshness::Stale,
        }
    }

    /// Classifies an optional entry, a missing entry is [`Freshness::Expired`].
    pub fn freshness_of<T>(&self, entry: Option<&CacheEntry<T>>, now: SystemTime) -> Freshness {
        match entry {
            Some(entry) => self.classify(entry.age(now)),
            None => Freshness::Expired,
        }
    }
}
