//! Stale-while-revalidate cached queries in front of a slow origin.
//!
//! A [`QuerySpec`](query::QuerySpec) describes one cacheable origin operation. Turning it into a
//! [`Query`](query::Query) with [`create_query`](query::create_query) yields an accessor that
//! serves cached values, refreshes stale ones through the [`RevalidationQueue`](queue::RevalidationQueue)
//! and falls back to a synchronous origin fetch only when nothing usable is cached.
//! The [`RevalidationWorker`](worker::RevalidationWorker) consumes that queue.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod clock;
pub mod config;
pub mod environment;
pub mod logging;
pub mod query;
pub mod queue;
pub mod reporting;
pub mod utils;
pub mod worker;

#[cfg(any(feature = "test", test))]
pub mod test;
