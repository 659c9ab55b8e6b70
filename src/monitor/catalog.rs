use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::debug;

use crate::provider::{CatalogMetric, CloudApi};
use crate::retry::RetryPolicy;

use super::dimension::DimensionFilterIndex;

/// Series per filtering task.
pub const FILTER_CHUNK_SIZE: usize = 50;

/// Every live series for a namespace and metric name, across all pages.
pub async fn list_catalog<P: CloudApi>(
    api: &Arc<P>,
    namespace: &str,
    metric_name: &str,
    retry: &RetryPolicy,
) -> Result<Vec<CatalogMetric>> {
    let mut series = Vec::new();
    let mut next_token: Option<String> = None;

    loop {
        let page = retry
            .run("list_metrics", || {
                api.list_metrics(namespace, metric_name, next_token.clone())
            })
            .await?;

        series.extend(page.items);
        next_token = page.next_token;
        if next_token.is_none() {
            break;
        }
    }

    debug!(namespace, metric = metric_name, count = series.len(), "listed catalog");
    Ok(series)
}

/// Whether a series should be queried: it must carry at least one dimension
/// resolving in the index, and when requirements are set its dimension
/// names must equal them exactly.
pub fn retain(
    series: &CatalogMetric,
    index: &DimensionFilterIndex,
    requirements: Option<&BTreeSet<String>>,
) -> bool {
    if let Some(required) = requirements {
        let names: BTreeSet<&str> = series.dimensions.iter().map(|d| d.name.as_str()).collect();
        if names.len() != required.len() || !required.iter().all(|r| names.contains(r.as_str())) {
            return false;
        }
    }

    series.dimensions.iter().any(|d| index.resolve(d).is_some())
}

/// Series with only the required dimension names, for families without
/// resource discovery.
pub fn retain_unindexed(series: &CatalogMetric, requirements: Option<&BTreeSet<String>>) -> bool {
    match requirements {
        None => true,
        Some(required) => {
            series.dimensions.len() == required.len()
                && series.dimensions.iter().all(|d| required.contains(&d.name))
        }
    }
}

/// Keep the series passing `retain`, filtering fixed-size chunks
/// concurrently. Output order is not significant.
pub async fn filter_catalog(
    series: Vec<CatalogMetric>,
    index: Arc<DimensionFilterIndex>,
    requirements: Option<Arc<BTreeSet<String>>>,
) -> Result<Vec<CatalogMetric>> {
    if series.len() <= FILTER_CHUNK_SIZE {
        return Ok(series
            .into_iter()
            .filter(|s| retain(s, &index, requirements.as_deref()))
            .collect());
    }

    let mut tasks = JoinSet::new();
    let mut remaining = series;

    while !remaining.is_empty() {
        let rest = remaining.split_off(remaining.len().min(FILTER_CHUNK_SIZE));
        let chunk = std::mem::replace(&mut remaining, rest);
        let index = Arc::clone(&index);
        let requirements = requirements.clone();

        tasks.spawn(async move {
            chunk
                .into_iter()
                .filter(|s| retain(s, &index, requirements.as_deref()))
                .collect::<Vec<_>>()
        });
    }

    let mut kept = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        kept.extend(joined?);
    }

    Ok(kept)
}
