use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::monitor::resource::TagFilter;
use crate::monitor::service;
use crate::provider::Tag;

/// Period applied to metrics that do not configure one, in seconds.
pub const DEFAULT_PERIOD_SECONDS: u32 = 300;

/// Query window length used when neither the job nor its metrics set one.
pub const DEFAULT_LENGTH_SECONDS: u64 = 300;

/// Top-level configuration for the exporter.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Region every job is scraped in.
    #[serde(default)]
    pub region: String,

    /// How often a scrape cycle is started. Default: 5m.
    #[serde(default = "default_scrape_interval", with = "humantime_serde")]
    pub scrape_interval: Duration,

    /// Last-good result cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Per-stage fan-out limits.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Retry policy for remote page fetches.
    #[serde(default)]
    pub retry: RetryConfig,

    /// AWS provider configuration.
    #[serde(default)]
    pub aws: AwsConfig,
}

/// Cache of per-job results from the most recent successful scrape.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// How long a job's results stay servable after they were fetched. Default: 30m.
    #[serde(default = "default_cache_expiration", with = "humantime_serde")]
    pub expiration: Duration,

    /// How often expired entries are purged. Default: 10m.
    #[serde(default = "default_cache_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

/// HTTP server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Upper bounds on concurrent tasks per fan-out stage.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConcurrencyConfig {
    /// Jobs scraped in parallel. Default: 8.
    #[serde(default = "default_concurrency")]
    pub jobs: usize,

    /// Metrics processed in parallel across all jobs. Default: 8.
    #[serde(default = "default_concurrency")]
    pub metrics: usize,

    /// Metric-data batches in flight across all metrics. Default: 8.
    #[serde(default = "default_concurrency")]
    pub batches: usize,

    /// Discovery pages processed in parallel. Default: 8.
    #[serde(default = "default_concurrency")]
    pub pages: usize,
}

/// Retry policy for remote page fetches.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    /// Attempts per page, including the first one. Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Sleep before the first retry; doubled after each attempt. Default: 200ms.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
}

/// AWS provider configuration.
#[derive(Debug, Default, Deserialize)]
pub struct AwsConfig {
    /// Account identifier override. When empty the provider resolves it.
    #[serde(default)]
    pub account_id: String,

    /// YAML inventory backing the in-memory provider.
    #[serde(default)]
    pub inventory_file: Option<PathBuf>,

    /// CloudWatch monitor collector configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// CloudWatch monitor collector configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Resource tag names exported as labels, keyed by job type or namespace.
    #[serde(default)]
    pub exported_tags_on_metrics: HashMap<String, Vec<String>>,

    /// Resource families to scrape.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// One resource family to scrape.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct JobConfig {
    /// Optional unique name; defaults to the job type.
    #[serde(default)]
    pub name: Option<String>,

    /// Service alias or namespace (e.g. "ec2" or "AWS/EC2").
    #[serde(rename = "type")]
    pub job_type: String,

    /// Tags a resource must carry; values are regular expressions.
    #[serde(default)]
    pub search_tags: Vec<Tag>,

    /// Constant labels added to every series of this job.
    #[serde(default)]
    pub custom_tags: Vec<Tag>,

    /// When set, only series with exactly these dimension names are kept.
    #[serde(default)]
    pub dimension_name_requirements: Vec<String>,

    #[serde(default)]
    pub metrics: Vec<MetricConfig>,

    /// Query window length in seconds.
    #[serde(default)]
    pub length: u64,

    /// Offset of the query window end from now, in seconds.
    #[serde(default)]
    pub delay: u64,

    /// Default period for metrics of this job, in seconds.
    #[serde(default)]
    pub period: u32,

    /// Fixed rounding period overriding the per-batch minimum period.
    #[serde(default)]
    pub rounding_period: Option<u32>,

    /// Default statistics for metrics of this job.
    #[serde(default)]
    pub statistics: Vec<String>,

    /// Default for attaching the provider sample timestamp.
    #[serde(default)]
    pub add_timestamp: Option<bool>,
}

/// One metric of a job.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MetricConfig {
    pub name: String,

    #[serde(default)]
    pub statistics: Vec<String>,

    #[serde(default)]
    pub period: u32,

    #[serde(default)]
    pub length: u64,

    #[serde(default)]
    pub delay: Option<u64>,

    #[serde(default)]
    pub add_timestamp: Option<bool>,
}

/// A metric with job-level defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMetric {
    pub name: String,
    pub statistics: Vec<String>,
    pub period_seconds: u32,
    pub delay_seconds: u64,
    pub add_timestamp: bool,
}

// --- Default value functions ---

fn default_scrape_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_cache_expiration() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_cache_cleanup_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_health_addr() -> String {
    ":8080".to_string()
}

fn default_concurrency() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(200)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: String::new(),
            scrape_interval: default_scrape_interval(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            retry: RetryConfig::default(),
            aws: AwsConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiration: default_cache_expiration(),
            cleanup_interval: default_cache_cleanup_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            jobs: default_concurrency(),
            metrics: default_concurrency(),
            batches: default_concurrency(),
            pages: default_concurrency(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            bail!("region is required");
        }

        if self.scrape_interval.is_zero() {
            bail!("scrape_interval must be positive");
        }

        if self.cache.cleanup_interval.is_zero() {
            bail!("cache.cleanup_interval must be positive");
        }

        let c = &self.concurrency;
        if c.jobs == 0 || c.metrics == 0 || c.batches == 0 || c.pages == 0 {
            bail!("concurrency limits must be positive");
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be positive");
        }

        let mut job_names = HashSet::new();
        for job in &self.aws.monitor.jobs {
            service::lookup(&job.job_type)?;

            if !job_names.insert(job.name()) {
                bail!(
                    "duplicate job name {:?}; set a unique `name` on jobs sharing a type",
                    job.name()
                );
            }

            if job.metrics.is_empty() {
                bail!("job {} has no metrics", job.name());
            }

            for tag in &job.search_tags {
                TagFilter::compile(tag)?;
            }

            let mut metric_names = HashSet::new();
            for metric in job.resolved_metrics() {
                if metric.name.is_empty() {
                    bail!("job {} has a metric without a name", job.name());
                }
                if metric.statistics.is_empty() {
                    bail!(
                        "metric {} of job {} has no statistics",
                        metric.name,
                        job.name()
                    );
                }
                if !metric_names.insert(metric.name.clone()) {
                    bail!(
                        "metric {} appears more than once in job {}",
                        metric.name,
                        job.name()
                    );
                }
            }

            if job.rounding_period == Some(0) {
                bail!("job {} rounding_period must be positive", job.name());
            }
        }

        Ok(())
    }
}

impl JobConfig {
    /// Unique job name used for logging, caching and self-metrics.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.job_type)
    }

    /// Metrics with job-level defaults applied.
    pub fn resolved_metrics(&self) -> Vec<ResolvedMetric> {
        self.metrics
            .iter()
            .map(|m| {
                let statistics = if m.statistics.is_empty() {
                    self.statistics.clone()
                } else {
                    m.statistics.clone()
                };

                let period_seconds = match (m.period, self.period) {
                    (0, 0) => DEFAULT_PERIOD_SECONDS,
                    (0, job) => job,
                    (metric, _) => metric,
                };

                ResolvedMetric {
                    name: m.name.clone(),
                    statistics,
                    period_seconds,
                    delay_seconds: m.delay.unwrap_or(self.delay),
                    add_timestamp: m.add_timestamp.or(self.add_timestamp).unwrap_or(false),
                }
            })
            .collect()
    }

    /// Query window length: the job length (or the default), widened to the
    /// longest metric length.
    pub fn query_length_seconds(&self) -> u64 {
        let base = if self.length > 0 {
            self.length
        } else {
            DEFAULT_LENGTH_SECONDS
        };

        self.metrics
            .iter()
            .map(|m| m.length)
            .fold(base, u64::max)
    }
}
