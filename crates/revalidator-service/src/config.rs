use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::CacheConfig;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "revalidator".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Controls the queue of pending revalidations.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// The maximum number of jobs waiting for a worker.
    ///
    /// Stale reads that find the queue full still serve the stale value, they just don't
    /// schedule a revalidation.
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
        }
    }
}

/// Controls the revalidation worker pool.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// The maximum number of revalidations running at the same time.
    pub concurrency: usize,

    /// The time after which a single revalidation is abandoned.
    ///
    /// Origin clients should carry their own timeouts. This is the upper bound for a worker slot.
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            job_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The cache in front of the origin.
    pub cache: CacheConfig,

    /// The queue of pending revalidations.
    pub queue: QueueConfig,

    /// The revalidation worker pool.
    pub worker: WorkerConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::caching::CacheBackendKind;

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();

        assert!(matches!(
            cfg.cache.backend.kind,
            CacheBackendKind::Memory(ref memory) if memory.capacity == 100_000
        ));
        assert_eq!(cfg.cache.operation_timeout, Duration::from_millis(500));
        assert_eq!(cfg.cache.retention, None);
        assert_eq!(cfg.queue.max_queue_size, 10_000);
        assert_eq!(cfg.worker.concurrency, 20);
        assert_eq!(cfg.worker.job_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_sections() {
        // Setting one value of a section keeps the defaults of its siblings.
        let yaml = r#"
            worker:
              job_timeout: 5s
            cache:
              retention: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.worker.job_timeout, Duration::from_secs(5));
        assert_eq!(cfg.worker.concurrency, 20);
        assert_eq!(cfg.cache.retention, Some(Duration::from_secs(3600)));
        assert_eq!(cfg.cache.operation_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_filesystem_backend() {
        let yaml = r#"
            cache:
              backend:
                filesystem:
                  path: /var/cache/revalidator
              operation_timeout: 100ms
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        match cfg.cache.backend.kind {
            CacheBackendKind::Filesystem(fs) => {
                assert_eq!(fs.path, PathBuf::from("/var/cache/revalidator"))
            }
            other => panic!("unexpected backend {other:?}"),
        }
        assert_eq!(cfg.cache.operation_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_memory_backend() {
        let yaml = r#"
            cache:
              backend:
                memory:
                  capacity: 500
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        match cfg.cache.backend.kind {
            CacheBackendKind::Memory(memory) => assert_eq!(memory.capacity, 500),
            other => panic!("unexpected backend {other:?}"),
        }

        // The capacity has a default of its own.
        let yaml = "cache:\n  backend:\n    memory: {}\n";
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert!(matches!(
            cfg.cache.backend.kind,
            CacheBackendKind::Memory(ref memory) if memory.capacity == 100_000
        ));
    }

    #[test]
    fn test_unknown_backend() {
        let yaml = "cache:\n  backend:\n    redis:\n      url: localhost\n";
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_logging() {
        let yaml = r#"
            logging:
              level: debug
              format: json
            unknown_field: true
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);

        let yaml = "logging:\n  level: loud\n";
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_empty_file() {
        assert!(Config::from_reader("  \n".as_bytes()).is_err());
    }
}
