use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::ResolvedMetric;
use crate::provider::{CatalogMetric, Dimension, Tag};

use super::dimension::DimensionFilterIndex;
use super::job::JobPlan;

/// Resource identifier for series of families without resource discovery.
pub const GLOBAL_RESOURCE: &str = "global";

/// A single sample attached to a fetched candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Datapoint {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// One (series, statistic) pair queued for a metric-data request.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSeries {
    pub correlation_id: String,
    pub resource_identifier: String,
    pub metric_name: String,
    /// Provider namespace used for queries.
    pub namespace: String,
    /// Configured job type used for the exported name.
    pub job_type: String,
    pub statistic: String,
    pub dimensions: Vec<Dimension>,
    pub region: String,
    pub account_id: String,
    pub period_seconds: u32,
    pub add_timestamp: bool,
    /// Exported resource tags.
    pub tags: Vec<Tag>,
    pub custom_tags: Vec<Tag>,
    pub datapoint: Option<Datapoint>,
}

/// Source of scrape-unique correlation ids ("id_1", "id_2", ...).
#[derive(Debug, Default)]
pub struct CorrelationIds {
    next: AtomicU64,
}

impl CorrelationIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        format!("id_{n}")
    }
}

/// Scrape-wide values stamped on every candidate.
#[derive(Debug)]
pub struct ScrapeScope<'a> {
    pub region: &'a str,
    pub account_id: &'a str,
    pub ids: &'a CorrelationIds,
}

/// Expand retained catalog series into one candidate per statistic.
///
/// For discovered families the owner is the resource linked to the series'
/// first resolving dimension; series without one are skipped. Catalog-only
/// families attribute every series to `GLOBAL_RESOURCE`.
pub fn build_candidates(
    series: &[CatalogMetric],
    index: &DimensionFilterIndex,
    metric: &ResolvedMetric,
    plan: &JobPlan,
    scope: &ScrapeScope<'_>,
) -> Vec<CandidateSeries> {
    let mut candidates = Vec::with_capacity(series.len() * metric.statistics.len());

    for s in series {
        let (resource_identifier, tags) = if plan.descriptor.discovers_resources() {
            let Some(owner) = index.owner(&s.dimensions) else {
                debug!(
                    job = %plan.name,
                    metric = %metric.name,
                    "series has no resolving dimension",
                );
                continue;
            };
            (owner.identifier.clone(), owner.exported_tags(&plan.exported_tags))
        } else {
            let tags = plan
                .exported_tags
                .iter()
                .map(|key| Tag {
                    key: key.clone(),
                    value: String::new(),
                })
                .collect();
            (GLOBAL_RESOURCE.to_string(), tags)
        };

        for statistic in &metric.statistics {
            candidates.push(CandidateSeries {
                correlation_id: scope.ids.next_id(),
                resource_identifier: resource_identifier.clone(),
                metric_name: s.metric_name.clone(),
                namespace: plan.namespace().to_string(),
                job_type: plan.job_type.clone(),
                statistic: statistic.clone(),
                dimensions: s.dimensions.clone(),
                region: scope.region.to_string(),
                account_id: scope.account_id.to_string(),
                period_seconds: metric.period_seconds,
                add_timestamp: metric.add_timestamp,
                tags: tags.clone(),
                custom_tags: plan.custom_tags.clone(),
                datapoint: None,
            });
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::config::{JobConfig, MetricConfig};
    use crate::monitor::resource::DiscoveredResource;

    fn dim(name: &str, value: &str) -> Dimension {
        Dimension {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn tag(key: &str, value: &str) -> Tag {
        Tag {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn plan(job_type: &str) -> JobPlan {
        let job = JobConfig {
            job_type: job_type.to_string(),
            custom_tags: vec![tag("cluster", "blue")],
            metrics: vec![MetricConfig {
                name: "CPUUtilization".to_string(),
                statistics: vec!["Average".to_string(), "Maximum".to_string()],
                period: 60,
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut exported = HashMap::new();
        exported.insert(job_type.to_string(), vec!["Name".to_string(), "team".to_string()]);
        JobPlan::compile(&job, &exported).expect("plan")
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let ids = CorrelationIds::new();
        assert_eq!(ids.next_id(), "id_1");
        assert_eq!(ids.next_id(), "id_2");
    }

    #[test]
    fn test_one_candidate_per_statistic() {
        let plan = plan("ec2");
        let resource = Arc::new(DiscoveredResource {
            identifier: "arn:aws:ec2:eu-west-1:123456789012:instance/i-1".to_string(),
            resource_type: "ec2:instance".to_string(),
            region: "eu-west-1".to_string(),
            tags: vec![tag("Name", "web-1")],
        });
        let index = DimensionFilterIndex::build(&[resource], &plan.patterns);
        let ids = CorrelationIds::new();
        let scope = ScrapeScope {
            region: "eu-west-1",
            account_id: "123456789012",
            ids: &ids,
        };
        let series = vec![
            CatalogMetric {
                namespace: "AWS/EC2".to_string(),
                metric_name: "CPUUtilization".to_string(),
                dimensions: vec![dim("InstanceId", "i-1")],
            },
            CatalogMetric {
                namespace: "AWS/EC2".to_string(),
                metric_name: "CPUUtilization".to_string(),
                dimensions: vec![dim("InstanceId", "i-unknown")],
            },
        ];

        let candidates = build_candidates(&series, &index, &plan.metrics[0], &plan, &scope);
        assert_eq!(candidates.len(), 2);

        let first = &candidates[0];
        assert_eq!(first.correlation_id, "id_1");
        assert_eq!(first.statistic, "Average");
        assert_eq!(first.namespace, "AWS/EC2");
        assert_eq!(first.job_type, "ec2");
        assert_eq!(first.period_seconds, 60);
        assert_eq!(
            first.resource_identifier,
            "arn:aws:ec2:eu-west-1:123456789012:instance/i-1"
        );
        assert_eq!(first.tags, vec![tag("Name", "web-1"), tag("team", "")]);
        assert_eq!(first.custom_tags, vec![tag("cluster", "blue")]);
        assert_eq!(first.dimensions, vec![dim("InstanceId", "i-1")]);
        assert!(first.datapoint.is_none());

        assert_eq!(candidates[1].correlation_id, "id_2");
        assert_eq!(candidates[1].statistic, "Maximum");
    }

    #[test]
    fn test_catalog_only_family_uses_global_identity() {
        let plan = plan("usage");
        let index = DimensionFilterIndex::build(&[], &plan.patterns);
        let ids = CorrelationIds::new();
        let scope = ScrapeScope {
            region: "us-east-1",
            account_id: "123456789012",
            ids: &ids,
        };
        let series = vec![CatalogMetric {
            namespace: "AWS/Usage".to_string(),
            metric_name: "ResourceCount".to_string(),
            dimensions: vec![dim("Service", "EC2"), dim("Type", "Resource")],
        }];

        let candidates = build_candidates(&series, &index, &plan.metrics[0], &plan, &scope);
        assert_eq!(candidates.len(), 2);
        assert!(candidates
            .iter()
            .all(|c| c.resource_identifier == GLOBAL_RESOURCE));
        assert_eq!(candidates[0].tags, vec![tag("Name", ""), tag("team", "")]);
    }
}
