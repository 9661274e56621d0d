use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::{BackingConfig, CacherOptions};
use crate::hash::HashConfig;
use crate::policy::PolicyValue;

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
    /// The default log level, used if `RUST_LOG` is not set.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
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
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "memocache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

impl Metrics {
    /// All tags sent with every metric, including the hostname tag if configured.
    pub fn tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.custom_tags.clone();
        let hostname = self.hostname_tag.clone().and_then(|tag| {
            hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .map(|name| (tag, name))
        });
        tags.extend(hostname);
        tags
    }
}

/// Global defaults of all memoized producers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MemoConfig {
    /// The default time to live of computed results. Results never expire if this is unset.
    pub ttl: Option<PolicyValue>,
    /// The default sliding expiry applied on cache hits.
    pub mru: Option<PolicyValue>,
    /// Maximum duration a pending computation is waited for.
    #[serde(with = "humantime_serde")]
    pub async_timeout: Duration,
    /// Maximum duration of a single backing store operation.
    #[serde(with = "humantime_serde")]
    pub backing_timeout: Duration,
    /// Interval of the background expiry sweep. `null` disables the sweep.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,
    /// Maximum number of entries in each local cache.
    pub local_capacity: u64,
    /// Log how every call was answered.
    pub origin: bool,
    pub hash: HashConfig,
    /// The store shared between processes. Caches are process-local if this is unset.
    pub backing: Option<BackingConfig>,
}

impl Default for MemoConfig {
    fn default() -> Self {
        let cacher = CacherOptions::default();
        MemoConfig {
            ttl: None,
            mru: None,
            async_timeout: cacher.async_timeout,
            backing_timeout: cacher.backing_timeout,
            sweep_interval: Some(Duration::from_secs(60)),
            local_capacity: 10_000,
            origin: false,
            hash: HashConfig::default(),
            backing: None,
        }
    }
}

impl MemoConfig {
    pub fn cacher_options(&self) -> CacherOptions {
        CacherOptions {
            async_timeout: self.async_timeout,
            backing_timeout: self.backing_timeout,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,
    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
    pub memo: MemoConfig,
}

impl Config {
    /// Loads the configuration from a YAML file, or the defaults if no path is given.
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

    use crate::hash::HashAlgorithm;

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
        assert_eq!(cfg.metrics.prefix, "memocache");

        let memo = cfg.memo;
        assert_eq!(memo.ttl, None);
        assert_eq!(memo.async_timeout, Duration::from_secs(60));
        assert_eq!(memo.sweep_interval, Some(Duration::from_secs(60)));
        assert_eq!(memo.hash.algorithm, HashAlgorithm::Sha256);
        assert!(memo.backing.is_none());
    }

    #[test]
    fn test_memo_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
            memo:
              ttl: 1.5h
              mru: 30
              async_timeout: 5s
              sweep_interval: ~
              origin: true
              hash:
                algorithm: basic
              backing:
                filesystem:
                  path: /var/cache/memo
              some_future_option: 1
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let memo = cfg.memo;
        assert_eq!(memo.ttl, Some(PolicyValue::Text("1.5h".into())));
        assert_eq!(memo.mru, Some(PolicyValue::Seconds(30.0)));
        assert_eq!(memo.async_timeout, Duration::from_secs(5));
        // Unset fields keep their defaults.
        assert_eq!(memo.backing_timeout, Duration::from_secs(10));
        assert_eq!(memo.local_capacity, 10_000);
        assert_eq!(memo.sweep_interval, None);
        assert!(memo.origin);
        assert_eq!(memo.hash.algorithm, HashAlgorithm::Basic);
        assert!(!memo.hash.unordered_arrays);
        match memo.backing {
            Some(BackingConfig::Filesystem(fs)) => {
                assert_eq!(fs.path, PathBuf::from("/var/cache/memo"))
            }
            other => panic!("unexpected backing {other:?}"),
        }
    }

    #[test]
    fn test_invalid_config() {
        let err = Config::from_reader("   \n".as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "config file empty");

        let err = Config::from_reader("logging:\n  level: loud".as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "failed to parse config YAML");
    }

    #[test]
    fn test_metrics_tags() {
        let metrics = Metrics {
            custom_tags: [("region".to_owned(), "eu".to_owned())].into(),
            ..Default::default()
        };
        assert_eq!(metrics.tags(), metrics.custom_tags);
    }
}
