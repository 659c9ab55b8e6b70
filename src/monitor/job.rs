use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::config::{JobConfig, ResolvedMetric};
use crate::error::MonitorError;
use crate::provider::{ResourceQuery, Tag};

use super::resource::TagFilter;
use super::service::{self, DimensionPattern, ServiceDescriptor};

/// Resources requested per tag-search page.
pub const RESOURCES_PER_PAGE: usize = 100;

/// A job with its descriptor resolved and every regex compiled.
#[derive(Debug)]
pub struct JobPlan {
    pub name: String,
    /// Type as configured; prefixes exported metric names.
    pub job_type: String,
    pub descriptor: &'static ServiceDescriptor,
    pub patterns: Vec<DimensionPattern>,
    pub tag_filters: Vec<TagFilter>,
    pub custom_tags: Vec<Tag>,
    /// Resource tag names exported as labels.
    pub exported_tags: Vec<String>,
    pub dimension_requirements: Option<Arc<BTreeSet<String>>>,
    pub metrics: Vec<ResolvedMetric>,
    pub length_seconds: u64,
    pub rounding_period: Option<u32>,
}

impl JobPlan {
    pub fn compile(
        job: &JobConfig,
        exported_tags_on_metrics: &HashMap<String, Vec<String>>,
    ) -> Result<Self, MonitorError> {
        let descriptor = service::lookup(&job.job_type)?;
        let patterns = descriptor.compile_patterns()?;
        let tag_filters = job
            .search_tags
            .iter()
            .map(TagFilter::compile)
            .collect::<Result<Vec<_>, _>>()?;

        let exported_tags = exported_tags_on_metrics
            .get(&job.job_type)
            .or_else(|| exported_tags_on_metrics.get(descriptor.alias))
            .or_else(|| exported_tags_on_metrics.get(descriptor.namespace))
            .cloned()
            .unwrap_or_default();

        let dimension_requirements = (!job.dimension_name_requirements.is_empty()).then(|| {
            Arc::new(
                job.dimension_name_requirements
                    .iter()
                    .cloned()
                    .collect::<BTreeSet<_>>(),
            )
        });

        Ok(Self {
            name: job.name().to_string(),
            job_type: job.job_type.clone(),
            descriptor,
            patterns,
            tag_filters,
            custom_tags: job.custom_tags.clone(),
            exported_tags,
            dimension_requirements,
            metrics: job.resolved_metrics(),
            length_seconds: job.query_length_seconds(),
            rounding_period: job.rounding_period,
        })
    }

    pub fn namespace(&self) -> &'static str {
        self.descriptor.namespace
    }

    /// Tag-search request for this job's resources.
    pub fn resource_query(&self) -> ResourceQuery {
        ResourceQuery {
            resource_type_filters: self
                .descriptor
                .resource_filters
                .iter()
                .map(|f| f.to_string())
                .collect(),
            tag_keys: self.tag_filters.iter().map(|f| f.key.clone()).collect(),
            per_page: RESOURCES_PER_PAGE,
        }
    }
}
