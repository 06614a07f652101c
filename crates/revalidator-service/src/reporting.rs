//! Reporting of failures the engine recovers from.
//!
//! Cache backend outages, origin failures and invalid origin values never bubble up to callers
//! as long as a fallback exists, so they are surfaced through an [`ErrorReporter`] instead.
//! Each failure category carries a stable fingerprint so that all occurrences of it group into
//! one issue.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use sentry::protocol::Context;
use serde_json::Value;

use crate::query::FetchError;

/// The code path on which a value was refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPath {
    /// A synchronous refresh on behalf of a caller.
    Request,
    /// A background revalidation by a worker.
    Background,
}

/// A structured report about a recovered or fatal failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub message: String,
    pub fingerprint: Vec<String>,
    pub context: BTreeMap<String, Value>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fingerprint: Vec::new(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_fingerprint<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fingerprint = parts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_owned(), value.into());
        self
    }

    /// Records the full source chain of `error` as the `failureReason`.
    pub fn with_error(self, error: &dyn Error) -> Self {
        let mut reason = error.to_string();
        let mut source = error.source();
        while let Some(inner) = source {
            reason.push_str(": ");
            reason.push_str(&inner.to_string());
            source = inner.source();
        }
        self.with_context("failureReason", reason)
    }

    /// A cache backend operation failed and was treated as a miss or a no-op.
    pub fn cache_backend(operation: &str, backend: &str, key: &str, error: &dyn Error) -> Self {
        Self::new(format!("Cache backend {operation} failed"))
            .with_fingerprint(["cache-backend", operation])
            .with_context("key", key)
            .with_context("backend", backend)
            .with_error(error)
    }

    /// The origin could not produce a current value.
    pub fn origin_fetch(query: &str, key: &str, error: &FetchError) -> Self {
        let mut report = Self::new(format!("Fetching current value for {query} failed"))
            .with_fingerprint(["origin-fetch", query])
            .with_context("key", key)
            .with_error(error);
        if let Some(status) = error.status_code() {
            report = report.with_context("statusCode", status);
        }
        report
    }

    /// The origin produced a value that does not match the expected shape.
    ///
    /// The offending value is attached as `invalidCurrentValue` for synchronous refreshes and
    /// as `invalidValue` for background revalidations.
    pub fn invalid_value(
        path: RefreshPath,
        query: &str,
        key: &str,
        raw: &Value,
        error: &serde_json::Error,
    ) -> Self {
        let field = match path {
            RefreshPath::Request => "invalidCurrentValue",
            RefreshPath::Background => "invalidValue",
        };
        Self::new(format!("Invalid current value for {query}"))
            .with_fingerprint(["invalid-value", query])
            .with_context("key", key)
            .with_context(field, raw.clone())
            .with_error(error)
    }

    /// A queued key could not be mapped back to any payload.
    pub fn unknown_key(key: &str) -> Self {
        Self::new("No query can reconstruct a payload from the queued key")
            .with_fingerprint(["unknown-key"])
            .with_context("key", key)
    }

    /// The keys of a query can not be mapped back to their payloads.
    pub fn key_roundtrip(query: &str) -> Self {
        Self::new(format!("Keys of {query} do not round-trip to their payload"))
            .with_fingerprint(["key-roundtrip", query])
            .with_context("query", query)
    }
}

/// A sink for [`ErrorReport`]s.
pub trait ErrorReporter: fmt::Debug + Send + Sync {
    fn report(&self, report: ErrorReport);
}

pub type ReporterRef = Arc<dyn ErrorReporter>;

/// Sends reports to sentry, grouped by their fingerprint.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentryReporter;

impl ErrorReporter for SentryReporter {
    fn report(&self, report: ErrorReport) {
        let ErrorReport {
            message,
            fingerprint,
            context,
        } = report;

        // `warn` only ends up as a sentry log, the event itself is captured below.
        tracing::warn!(?fingerprint, ?context, "{message}");

        let fingerprint: Vec<&str> = fingerprint.iter().map(String::as_str).collect();
        sentry::with_scope(
            |scope| {
                if !fingerprint.is_empty() {
                    scope.set_fingerprint(Some(fingerprint.as_slice()));
                }
                scope.set_context("Revalidation", Context::Other(context.into_iter().collect()));
            },
            || sentry::capture_message(&message, sentry::Level::Error),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_origin_fetch_report_carries_status() {
        let report = ErrorReport::origin_fetch("content", "content:42", &FetchError::Status(503));

        assert_eq!(report.fingerprint, vec!["origin-fetch", "content"]);
        assert_eq!(report.context["key"], "content:42");
        assert_eq!(report.context["statusCode"], 503);
        assert_eq!(
            report.context["failureReason"],
            "origin responded with status 503"
        );
    }

    #[test]
    fn test_timeout_report_has_no_status() {
        let error = FetchError::Timeout(Duration::from_secs(5));
        let report = ErrorReport::origin_fetch("content", "content:42", &error);

        assert!(!report.context.contains_key("statusCode"));
    }

    #[test]
    fn test_invalid_value_report_keeps_raw_value() {
        let raw = serde_json::json!({ "id": "not a number" });
        let error = serde_json::from_value::<u64>(raw.clone()).unwrap_err();
        let report =
            ErrorReport::invalid_value(RefreshPath::Request, "content", "content:42", &raw, &error);

        assert_eq!(report.fingerprint, vec!["invalid-value", "content"]);
        assert_eq!(report.context["invalidCurrentValue"], raw);

        let report = ErrorReport::invalid_value(
            RefreshPath::Background,
            "content",
            "content:42",
            &raw,
            &error,
        );
        assert_eq!(report.context["invalidValue"], raw);
        assert!(!report.context.contains_key("invalidCurrentValue"));
    }

    #[test]
    fn test_sentry_reporter_captures_fingerprint() {
        let events = sentry::test::with_captured_events(|| {
            SentryReporter.report(ErrorReport::unknown_key("mystery:1"));
        });

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(
            event.message.as_deref(),
            Some("No query can reconstruct a payload from the queued key")
        );
        assert_eq!(event.fingerprint.len(), 1);
        assert_eq!(event.fingerprint[0], "unknown-key");
        assert!(event.contexts.contains_key("Revalidation"));
    }
}
