pub mod memory;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;

pub use memory::{InMemoryProvider, Inventory, InventoryDatapoint, InventorySeries};

/// Key/value pair attached to a resource or configured on a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Tag {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Named attribute qualifying a time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

/// A resource returned by the tag-search API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceTagMapping {
    pub arn: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// Tag-search request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceQuery {
    /// Resource types to search, e.g. "ec2:instance".
    pub resource_type_filters: Vec<String>,
    /// Resources must carry every listed tag key.
    pub tag_keys: Vec<String>,
    pub per_page: usize,
}

/// A live series reported by the metric catalog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogMetric {
    pub namespace: String,
    pub metric_name: String,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
}

/// One series in a metric-data request, keyed by a caller-assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDataQuery {
    pub id: String,
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: Vec<Dimension>,
    pub period_seconds: u32,
    pub statistic: String,
}

/// Ordering of the returned data points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanBy {
    #[default]
    TimestampDescending,
    TimestampAscending,
}

/// Multi-series metric-data request over one time window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDataRequest {
    pub queries: Vec<MetricDataQuery>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub scan_by: ScanBy,
}

/// Data points for one query id. Values and timestamps are parallel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricDataResult {
    pub id: String,
    pub values: Vec<f64>,
    pub timestamps: Vec<DateTime<Utc>>,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// Remote capabilities of a cloud provider's monitoring and tagging APIs.
///
/// Every listing is paginated: callers pass the `next_token` of the previous
/// page until it comes back empty.
pub trait CloudApi: Send + Sync + 'static {
    /// Resolve the account the credentials belong to.
    fn account_id(&self) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Search tagged resources.
    fn get_resources(
        &self,
        query: &ResourceQuery,
        next_token: Option<String>,
    ) -> impl std::future::Future<Output = Result<Page<ResourceTagMapping>>> + Send;

    /// List live series for a namespace and metric name.
    fn list_metrics(
        &self,
        namespace: &str,
        metric_name: &str,
        next_token: Option<String>,
    ) -> impl std::future::Future<Output = Result<Page<CatalogMetric>>> + Send;

    /// Query data points for up to one batch of series.
    fn get_metric_data(
        &self,
        request: &MetricDataRequest,
        next_token: Option<String>,
    ) -> impl std::future::Future<Output = Result<Page<MetricDataResult>>> + Send;
}
