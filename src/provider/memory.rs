use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{
    CatalogMetric, CloudApi, Dimension, MetricDataRequest, MetricDataResult, Page,
    ResourceQuery, ResourceTagMapping, ScanBy,
};

/// Static snapshot of an account: resources, series and their data points.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub account_id: String,

    /// Items per page for every listing. Default: 100.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default)]
    pub resources: Vec<ResourceTagMapping>,

    #[serde(default)]
    pub series: Vec<InventorySeries>,
}

/// A catalog series with the data points it serves.
#[derive(Debug, Clone, Deserialize)]
pub struct InventorySeries {
    pub namespace: String,
    pub metric_name: String,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub datapoints: Vec<InventoryDatapoint>,
}

/// One sample. A point without a statistic answers every statistic.
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryDatapoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub statistic: Option<String>,
}

fn default_page_size() -> usize {
    100
}

/// `CloudApi` backed by an in-memory inventory, with offset-based pagination.
#[derive(Debug, Clone)]
pub struct InMemoryProvider {
    inventory: Inventory,
}

impl InMemoryProvider {
    pub fn new(mut inventory: Inventory) -> Self {
        if inventory.page_size == 0 {
            inventory.page_size = default_page_size();
        }
        Self { inventory }
    }

    /// Load an inventory from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading inventory file {}", path.display()))?;

        Self::from_yaml(&data)
            .with_context(|| format!("parsing inventory file {}", path.display()))
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let inventory: Inventory = serde_yaml::from_str(data)?;
        if inventory.page_size == 0 {
            bail!("inventory page_size must be positive");
        }
        Ok(Self::new(inventory))
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    fn series_for<'a>(
        &'a self,
        namespace: &'a str,
        metric_name: &'a str,
    ) -> impl Iterator<Item = &'a InventorySeries> + 'a {
        self.inventory
            .series
            .iter()
            .filter(move |s| s.namespace == namespace && s.metric_name == metric_name)
    }
}

/// Whether a resource type satisfies a tag-search type filter such as
/// "ec2" or "elasticloadbalancing:loadbalancer".
fn type_matches(resource_type: &str, filter: &str) -> bool {
    match resource_type.strip_prefix(filter) {
        Some("") => true,
        Some(rest) => rest.starts_with(':') || rest.starts_with('/'),
        None => false,
    }
}

fn same_dimensions(a: &[Dimension], b: &[Dimension]) -> bool {
    a.len() == b.len() && a.iter().all(|d| b.contains(d))
}

/// Slice one page out of `items` starting at the offset encoded in `token`.
fn paginate<T: Clone>(items: &[T], page_size: usize, token: Option<String>) -> Result<Page<T>> {
    let offset = match token {
        Some(token) => token
            .parse::<usize>()
            .with_context(|| format!("invalid pagination token {token:?}"))?,
        None => 0,
    };

    if offset > items.len() {
        bail!("pagination token {offset} is past the end of the listing");
    }

    let end = (offset + page_size).min(items.len());
    let next_token = (end < items.len()).then(|| end.to_string());

    Ok(Page {
        items: items[offset..end].to_vec(),
        next_token,
    })
}

impl CloudApi for InMemoryProvider {
    async fn account_id(&self) -> Result<String> {
        if self.inventory.account_id.is_empty() {
            bail!("inventory has no account_id");
        }
        Ok(self.inventory.account_id.clone())
    }

    async fn get_resources(
        &self,
        query: &ResourceQuery,
        next_token: Option<String>,
    ) -> Result<Page<ResourceTagMapping>> {
        let matched: Vec<ResourceTagMapping> = self
            .inventory
            .resources
            .iter()
            .filter(|r| {
                query.resource_type_filters.is_empty()
                    || query
                        .resource_type_filters
                        .iter()
                        .any(|f| type_matches(&r.resource_type, f))
            })
            .filter(|r| {
                query
                    .tag_keys
                    .iter()
                    .all(|key| r.tags.iter().any(|t| &t.key == key))
            })
            .cloned()
            .collect();

        let page_size = if query.per_page == 0 {
            self.inventory.page_size
        } else {
            query.per_page.min(self.inventory.page_size)
        };

        paginate(&matched, page_size, next_token)
    }

    async fn list_metrics(
        &self,
        namespace: &str,
        metric_name: &str,
        next_token: Option<String>,
    ) -> Result<Page<CatalogMetric>> {
        let matched: Vec<CatalogMetric> = self
            .series_for(namespace, metric_name)
            .map(|s| CatalogMetric {
                namespace: s.namespace.clone(),
                metric_name: s.metric_name.clone(),
                dimensions: s.dimensions.clone(),
            })
            .collect();

        paginate(&matched, self.inventory.page_size, next_token)
    }

    async fn get_metric_data(
        &self,
        request: &MetricDataRequest,
        next_token: Option<String>,
    ) -> Result<Page<MetricDataResult>> {
        let mut results = Vec::with_capacity(request.queries.len());

        for query in &request.queries {
            let mut points: Vec<(DateTime<Utc>, f64)> = self
                .series_for(&query.namespace, &query.metric_name)
                .filter(|s| same_dimensions(&s.dimensions, &query.dimensions))
                .flat_map(|s| s.datapoints.iter())
                .filter(|p| {
                    p.statistic
                        .as_deref()
                        .map_or(true, |stat| stat == query.statistic)
                })
                .filter(|p| p.timestamp >= request.start && p.timestamp < request.end)
                .map(|p| (p.timestamp, p.value))
                .collect();

            match request.scan_by {
                ScanBy::TimestampDescending => points.sort_by(|a, b| b.0.cmp(&a.0)),
                ScanBy::TimestampAscending => points.sort_by(|a, b| a.0.cmp(&b.0)),
            }

            let (timestamps, values) = points.into_iter().unzip();
            results.push(MetricDataResult {
                id: query.id.clone(),
                values,
                timestamps,
            });
        }

        paginate(&results, self.inventory.page_size, next_token)
    }
}
