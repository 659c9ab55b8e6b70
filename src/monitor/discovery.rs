use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{MonitorError, Stage};
use crate::provider::CloudApi;
use crate::retry::RetryPolicy;

use super::job::JobPlan;
use super::resource::DiscoveredResource;
use super::Limits;

/// Find the job's resources by tag search and keep those passing every tag
/// filter.
///
/// Pages are fetched sequentially and filtered concurrently. Survivors are
/// returned sorted by identifier. Catalog-only families return nothing.
pub async fn discover<P: CloudApi>(
    api: &Arc<P>,
    plan: &Arc<JobPlan>,
    region: &str,
    limits: &Limits,
    retry: &RetryPolicy,
) -> Result<Vec<Arc<DiscoveredResource>>, MonitorError> {
    if !plan.descriptor.discovers_resources() {
        return Ok(Vec::new());
    }

    let query = plan.resource_query();
    let survivors: Arc<Mutex<Vec<DiscoveredResource>>> = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = JoinSet::new();
    let mut next_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = retry
            .run("get_resources", || {
                api.get_resources(&query, next_token.clone())
            })
            .await
            .map_err(|e| MonitorError::remote(&plan.name, Stage::Discovery, e))?;

        pages += 1;
        debug!(
            job = %plan.name,
            page = pages,
            count = page.items.len(),
            "fetched resource page",
        );

        let permit = limits
            .acquire_page()
            .await
            .map_err(|e| MonitorError::remote(&plan.name, Stage::Discovery, e))?;
        let survivors = Arc::clone(&survivors);
        let plan = Arc::clone(plan);
        let region = region.to_string();
        let items = page.items;

        tasks.spawn(async move {
            let _permit = permit;
            let kept: Vec<DiscoveredResource> = items
                .into_iter()
                .map(|mapping| DiscoveredResource::from_mapping(mapping, &region))
                .filter(|r| r.matches_all(&plan.tag_filters))
                .collect();
            survivors.lock().extend(kept);
        });

        next_token = page.next_token;
        if next_token.is_none() {
            break;
        }
    }

    while let Some(joined) = tasks.join_next().await {
        joined.map_err(|e| MonitorError::cancelled(&plan.name, Stage::Discovery, e))?;
    }

    let mut resources = std::mem::take(&mut *survivors.lock());
    resources.sort_by(|a, b| a.identifier.cmp(&b.identifier));

    debug!(
        job = %plan.name,
        pages,
        count = resources.len(),
        "resource discovery complete",
    );

    Ok(resources.into_iter().map(Arc::new).collect())
}
