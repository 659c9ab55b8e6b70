pub mod candidate;
pub mod catalog;
pub mod dimension;
pub mod discovery;
pub mod fetch;
pub mod job;
pub mod normalize;
pub mod resource;
pub mod service;
pub mod snapshot;
pub mod window;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::GenerationCache;
use crate::config::{ConcurrencyConfig, Config, ResolvedMetric};
use crate::error::{MonitorError, Stage};
use crate::export::health::HealthMetrics;
use crate::provider::CloudApi;
use crate::retry::RetryPolicy;

use self::candidate::{CandidateSeries, CorrelationIds, ScrapeScope};
use self::dimension::DimensionFilterIndex;
use self::fetch::FetchWindow;
use self::job::JobPlan;
use self::snapshot::{MetricDescriptor, Snapshot, SnapshotStore};

/// Fetched candidates of one job.
pub type JobResults = Arc<Vec<CandidateSeries>>;

/// Last-good results keyed by job name.
pub type ResultCache = GenerationCache<JobResults>;

/// Per-stage bounds on concurrent tasks.
pub struct Limits {
    jobs: Arc<Semaphore>,
    metrics: Arc<Semaphore>,
    batches: Arc<Semaphore>,
    pages: Arc<Semaphore>,
}

impl Limits {
    pub fn new(cfg: &ConcurrencyConfig) -> Self {
        Self {
            jobs: Arc::new(Semaphore::new(cfg.jobs.max(1))),
            metrics: Arc::new(Semaphore::new(cfg.metrics.max(1))),
            batches: Arc::new(Semaphore::new(cfg.batches.max(1))),
            pages: Arc::new(Semaphore::new(cfg.pages.max(1))),
        }
    }

    async fn acquire(sem: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
        Arc::clone(sem)
            .acquire_owned()
            .await
            .context("concurrency limiter closed")
    }

    pub async fn acquire_job(&self) -> Result<OwnedSemaphorePermit> {
        Self::acquire(&self.jobs).await
    }

    pub async fn acquire_metric(&self) -> Result<OwnedSemaphorePermit> {
        Self::acquire(&self.metrics).await
    }

    pub async fn acquire_batch(&self) -> Result<OwnedSemaphorePermit> {
        Self::acquire(&self.batches).await
    }

    pub async fn acquire_page(&self) -> Result<OwnedSemaphorePermit> {
        Self::acquire(&self.pages).await
    }
}

/// Outcome of one scrape cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeSummary {
    pub generation: u64,
    /// Whether the cycle's snapshot was installed.
    pub published: bool,
    /// Jobs whose fresh results were unavailable.
    pub failed_jobs: Vec<String>,
    pub metrics: usize,
}

struct Inner<P> {
    api: Arc<P>,
    region: String,
    account_id: String,
    jobs: Vec<Arc<JobPlan>>,
    limits: Limits,
    retry: RetryPolicy,
    cache: Arc<ResultCache>,
    store: Arc<SnapshotStore>,
    generation: AtomicU64,
    health: Option<Arc<HealthMetrics>>,
}

/// Discovers resources, fetches their metric data and publishes normalized
/// snapshots.
pub struct MonitorCollector<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for MonitorCollector<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: CloudApi> MonitorCollector<P> {
    /// Compile the configured jobs and resolve the account identifier.
    pub async fn new(
        api: Arc<P>,
        cfg: &Config,
        cache: Arc<ResultCache>,
        store: Arc<SnapshotStore>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Self> {
        let monitor = &cfg.aws.monitor;
        let jobs = monitor
            .jobs
            .iter()
            .map(|job| JobPlan::compile(job, &monitor.exported_tags_on_metrics).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()
            .context("compiling monitor jobs")?;

        let retry = RetryPolicy::new(&cfg.retry, health.clone());

        let account_id = if cfg.aws.account_id.is_empty() {
            retry
                .run("account_id", || api.account_id())
                .await
                .context("resolving account id")?
        } else {
            cfg.aws.account_id.clone()
        };

        info!(
            region = %cfg.region,
            account_id = %account_id,
            jobs = jobs.len(),
            "monitor collector ready",
        );

        Ok(Self {
            inner: Arc::new(Inner {
                api,
                region: cfg.region.clone(),
                account_id,
                jobs,
                limits: Limits::new(&cfg.concurrency),
                retry,
                cache,
                store,
                generation: AtomicU64::new(0),
                health,
            }),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    /// The most recently published snapshot.
    pub fn pull(&self) -> Arc<Snapshot> {
        self.inner.store.load()
    }

    /// Metric names and label keys of the published snapshot.
    pub fn describe(&self) -> Vec<MetricDescriptor> {
        self.pull().descriptors()
    }

    pub async fn scrape(&self) -> ScrapeSummary {
        self.scrape_at(Utc::now()).await
    }

    /// Run one scrape cycle with `now` as the reference time.
    ///
    /// Jobs run concurrently. A failed job contributes its cached results
    /// from an earlier cycle if they have not expired. Nothing is published
    /// when every job failed.
    pub async fn scrape_at(&self, now: DateTime<Utc>) -> ScrapeSummary {
        let started = Instant::now();
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let ids = Arc::new(CorrelationIds::new());

        let mut tasks = JoinSet::new();
        for plan in &inner.jobs {
            let inner = Arc::clone(inner);
            let plan = Arc::clone(plan);
            let ids = Arc::clone(&ids);

            tasks.spawn(async move {
                let result = match inner.limits.acquire_job().await {
                    Ok(_permit) => run_job(&inner, &plan, &ids, now).await,
                    Err(e) => Err(MonitorError::remote(&plan.name, Stage::Discovery, e)),
                };
                (plan, result)
            });
        }

        let mut outputs: Vec<JobResults> = Vec::with_capacity(inner.jobs.len());
        let mut failed_jobs = Vec::new();
        let mut reported = HashSet::new();

        while let Some(joined) = tasks.join_next().await {
            let (plan, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "job task failed");
                    continue;
                }
            };
            reported.insert(plan.name.clone());

            match result {
                Ok(candidates) => {
                    let results: JobResults = Arc::new(candidates);
                    let stored = inner
                        .cache
                        .store(plan.name.clone(), generation, Arc::clone(&results))
                        .await;
                    if !stored {
                        debug!(job = %plan.name, generation, "newer results already cached");
                    }
                    outputs.push(results);
                }
                Err(e) => {
                    let stage = e.stage().map_or("setup", Stage::as_str);
                    let report = anyhow::Error::from(e);
                    warn!(job = %plan.name, stage, error = %format!("{report:#}"), "job scrape failed");
                    if let Some(health) = &inner.health {
                        health
                            .job_errors_total
                            .with_label_values(&[plan.name.as_str(), stage])
                            .inc();
                    }
                    failed_jobs.push(plan.name.clone());
                }
            }
        }

        for plan in &inner.jobs {
            if !reported.contains(&plan.name) {
                failed_jobs.push(plan.name.clone());
            }
        }

        for name in &failed_jobs {
            if let Some(cached) = inner.cache.get(name).await {
                debug!(job = %name, series = cached.len(), "serving cached job results");
                if let Some(health) = &inner.health {
                    health
                        .job_fallbacks_total
                        .with_label_values(&[name.as_str()])
                        .inc();
                }
                outputs.push(cached);
            }
        }

        failed_jobs.sort();
        let all_failed = !inner.jobs.is_empty() && failed_jobs.len() == inner.jobs.len();
        let metrics = normalize::normalize(outputs.iter().flat_map(|r| r.iter()));
        let metric_count = metrics.len();

        let published = if all_failed && outputs.is_empty() {
            false
        } else {
            inner
                .store
                .publish(Snapshot::new(generation, Utc::now(), metrics))
        };

        let status = if failed_jobs.is_empty() {
            "ok"
        } else if all_failed {
            "failed"
        } else {
            "partial"
        };

        if let Some(health) = &inner.health {
            inner.cache.run_pending_tasks().await;
            health.scrapes_total.with_label_values(&[status]).inc();
            health
                .scrape_duration
                .observe(started.elapsed().as_secs_f64());
            health.cache_entries.set(inner.cache.entry_count() as f64);
            if published {
                health.snapshot_metrics.set(metric_count as f64);
                health.snapshot_generation.set(generation as f64);
            }
        }

        info!(
            generation,
            status,
            published,
            metrics = metric_count,
            failed = failed_jobs.len(),
            elapsed = ?started.elapsed(),
            "scrape complete",
        );

        ScrapeSummary {
            generation,
            published,
            failed_jobs,
            metrics: metric_count,
        }
    }
}

/// Discover, look up, filter and fetch every metric of one job.
async fn run_job<P: CloudApi>(
    inner: &Arc<Inner<P>>,
    plan: &Arc<JobPlan>,
    ids: &Arc<CorrelationIds>,
    now: DateTime<Utc>,
) -> Result<Vec<CandidateSeries>, MonitorError> {
    let resources =
        discovery::discover(&inner.api, plan, &inner.region, &inner.limits, &inner.retry).await?;
    let index = Arc::new(DimensionFilterIndex::build(&resources, &plan.patterns));

    debug!(
        job = %plan.name,
        resources = resources.len(),
        dimensions = index.len(),
        "built dimension index",
    );

    let mut tasks = JoinSet::new();
    for metric in &plan.metrics {
        tasks.spawn(run_metric(
            Arc::clone(inner),
            Arc::clone(plan),
            metric.clone(),
            Arc::clone(&index),
            Arc::clone(ids),
            now,
        ));
    }

    let mut candidates = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let fetched = joined.map_err(|e| MonitorError::cancelled(&plan.name, Stage::Fetch, e))??;
        candidates.extend(fetched);
    }

    if let Some(health) = &inner.health {
        health
            .resources_discovered
            .with_label_values(&[plan.name.as_str()])
            .set(resources.len() as f64);
        health
            .candidate_series
            .with_label_values(&[plan.name.as_str()])
            .set(candidates.len() as f64);
    }

    info!(
        job = %plan.name,
        resources = resources.len(),
        count = candidates.len(),
        "job scrape complete",
    );

    Ok(candidates)
}

async fn run_metric<P: CloudApi>(
    inner: Arc<Inner<P>>,
    plan: Arc<JobPlan>,
    metric: ResolvedMetric,
    index: Arc<DimensionFilterIndex>,
    ids: Arc<CorrelationIds>,
    now: DateTime<Utc>,
) -> Result<Vec<CandidateSeries>, MonitorError> {
    let _permit = inner
        .limits
        .acquire_metric()
        .await
        .map_err(|e| MonitorError::remote(&plan.name, Stage::Catalog, e))?;

    let series = catalog::list_catalog(&inner.api, plan.namespace(), &metric.name, &inner.retry)
        .await
        .map_err(|e| MonitorError::remote(&plan.name, Stage::Catalog, e))?;
    let listed = series.len();

    let retained = if plan.descriptor.discovers_resources() {
        catalog::filter_catalog(series, Arc::clone(&index), plan.dimension_requirements.clone())
            .await
            .map_err(|e| MonitorError::remote(&plan.name, Stage::Catalog, e))?
    } else {
        series
            .into_iter()
            .filter(|s| catalog::retain_unindexed(s, plan.dimension_requirements.as_deref()))
            .collect()
    };

    let scope = ScrapeScope {
        region: &inner.region,
        account_id: &inner.account_id,
        ids: &ids,
    };
    let candidates = candidate::build_candidates(&retained, &index, &metric, &plan, &scope);

    debug!(
        job = %plan.name,
        metric = %metric.name,
        listed,
        retained = retained.len(),
        count = candidates.len(),
        "built candidate series",
    );

    let window = FetchWindow {
        length_seconds: plan.length_seconds,
        delay_seconds: metric.delay_seconds,
        rounding_period: plan.rounding_period,
    };

    fetch::fetch_batched(&inner.api, candidates, window, now, &inner.limits, &inner.retry)
        .await
        .map_err(|e| MonitorError::remote(&plan.name, Stage::Fetch, e))
}
