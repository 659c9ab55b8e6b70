use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

use crate::provider::{CloudApi, MetricDataQuery, MetricDataRequest, MetricDataResult, ScanBy};
use crate::retry::RetryPolicy;

use super::candidate::{CandidateSeries, Datapoint};
use super::window::query_window;
use super::Limits;

/// Provider ceiling on queries per metric-data request.
pub const MAX_QUERIES_PER_REQUEST: usize = 20;

/// Window parameters shared by every batch of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub length_seconds: u64,
    pub delay_seconds: u64,
    /// Fixed rounding period; the batch's minimum period when unset.
    pub rounding_period: Option<u32>,
}

/// Split candidates into consecutive batches of at most `size`.
pub fn partition(candidates: Vec<CandidateSeries>, size: usize) -> Vec<Vec<CandidateSeries>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(candidates.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(candidates.len()));

    for candidate in candidates {
        current.push(candidate);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

/// One multi-series request for a batch. Every query uses the lowest period
/// in the batch.
pub fn build_request(
    batch: &[CandidateSeries],
    window: &FetchWindow,
    now: DateTime<Utc>,
) -> MetricDataRequest {
    let min_period = batch.iter().map(|c| c.period_seconds).min().unwrap_or(0);
    let rounding = window.rounding_period.unwrap_or(min_period);
    let (start, end) = query_window(now, rounding, window.length_seconds, window.delay_seconds);

    let queries = batch
        .iter()
        .map(|c| MetricDataQuery {
            id: c.correlation_id.clone(),
            namespace: c.namespace.clone(),
            metric_name: c.metric_name.clone(),
            dimensions: c.dimensions.clone(),
            period_seconds: min_period,
            statistic: c.statistic.clone(),
        })
        .collect();

    MetricDataRequest {
        queries,
        start,
        end,
        scan_by: ScanBy::TimestampDescending,
    }
}

/// Attach the most recent data point of each result to the candidate with
/// the same correlation id. Candidates without data keep `datapoint: None`.
pub fn attach_results(
    batch: Vec<CandidateSeries>,
    results: &[MetricDataResult],
) -> Vec<CandidateSeries> {
    let mut latest: HashMap<&str, Datapoint> = HashMap::new();

    for result in results {
        if result.values.len() != result.timestamps.len() {
            debug!(
                id = %result.id,
                values = result.values.len(),
                timestamps = result.timestamps.len(),
                "mismatched metric data result, ignoring",
            );
            continue;
        }

        for (&value, &timestamp) in result.values.iter().zip(&result.timestamps) {
            latest
                .entry(result.id.as_str())
                .and_modify(|point| {
                    if timestamp > point.timestamp {
                        *point = Datapoint { value, timestamp };
                    }
                })
                .or_insert(Datapoint { value, timestamp });
        }
    }

    batch
        .into_iter()
        .map(|mut candidate| {
            candidate.datapoint = latest.get(candidate.correlation_id.as_str()).copied();
            candidate
        })
        .collect()
}

async fn fetch_all_pages<P: CloudApi>(
    api: &Arc<P>,
    request: &MetricDataRequest,
    retry: &RetryPolicy,
) -> Result<Vec<MetricDataResult>> {
    let mut results = Vec::new();
    let mut next_token: Option<String> = None;

    loop {
        let page = retry
            .run("get_metric_data", || {
                api.get_metric_data(request, next_token.clone())
            })
            .await?;

        results.extend(page.items);
        next_token = page.next_token;
        if next_token.is_none() {
            break;
        }
    }

    Ok(results)
}

/// Fetch data for every candidate, batch by batch, and return them with
/// their data points attached. Any batch failure fails the whole fetch.
pub async fn fetch_batched<P: CloudApi>(
    api: &Arc<P>,
    candidates: Vec<CandidateSeries>,
    window: FetchWindow,
    now: DateTime<Utc>,
    limits: &Limits,
    retry: &RetryPolicy,
) -> Result<Vec<CandidateSeries>> {
    let total = candidates.len();
    let output: Arc<Mutex<Vec<CandidateSeries>>> = Arc::new(Mutex::new(Vec::with_capacity(total)));
    let mut tasks = JoinSet::new();
    let batches = partition(candidates, MAX_QUERIES_PER_REQUEST);
    let batch_count = batches.len();

    for batch in batches {
        let permit = limits.acquire_batch().await?;
        let request = build_request(&batch, &window, now);
        let api = Arc::clone(api);
        let retry = retry.clone();
        let output = Arc::clone(&output);

        tasks.spawn(async move {
            let _permit = permit;
            let results = fetch_all_pages(&api, &request, &retry).await?;
            let fetched = attach_results(batch, &results);
            output.lock().extend(fetched);
            Ok::<(), anyhow::Error>(())
        });
    }

    while let Some(joined) = tasks.join_next().await {
        joined.context("metric data batch task")??;
    }

    let fetched = std::mem::take(&mut *output.lock());
    debug!(
        candidates = total,
        batches = batch_count,
        with_data = fetched.iter().filter(|c| c.datapoint.is_some()).count(),
        "fetched metric data",
    );

    Ok(fetched)
}
