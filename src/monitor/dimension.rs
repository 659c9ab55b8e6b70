use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::Dimension;

use super::resource::DiscoveredResource;
use super::service::DimensionPattern;

/// Dimension name to the `(value, resource)` pairs extracted from resource
/// identifiers.
///
/// Every capture-group name of every pattern is a key, even when no resource
/// matched it. Entries keep pattern declaration order, then resource order.
#[derive(Debug, Default)]
pub struct DimensionFilterIndex {
    entries: HashMap<String, Vec<(String, Arc<DiscoveredResource>)>>,
}

impl DimensionFilterIndex {
    pub fn build(resources: &[Arc<DiscoveredResource>], patterns: &[DimensionPattern]) -> Self {
        let mut entries: HashMap<String, Vec<(String, Arc<DiscoveredResource>)>> = HashMap::new();

        for pattern in patterns {
            for name in &pattern.names {
                entries.entry(name.clone()).or_default();
            }

            for resource in resources {
                let Some(caps) = pattern.regex.captures(&resource.identifier) else {
                    continue;
                };

                for name in &pattern.names {
                    if let Some(m) = caps.name(name) {
                        if let Some(list) = entries.get_mut(name) {
                            list.push((m.as_str().to_string(), Arc::clone(resource)));
                        }
                    }
                }
            }
        }

        Self { entries }
    }

    pub fn has_key(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Entries registered under `name`, if it is a key.
    pub fn values(&self, name: &str) -> Option<&[(String, Arc<DiscoveredResource>)]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    /// The resource owning `dimension`: the first entry under its name with an
    /// equal value.
    pub fn resolve(&self, dimension: &Dimension) -> Option<&Arc<DiscoveredResource>> {
        self.entries
            .get(&dimension.name)?
            .iter()
            .find(|(value, _)| value == &dimension.value)
            .map(|(_, resource)| resource)
    }

    /// The owning resource of a series: the one linked to its first
    /// resolving dimension.
    pub fn owner<'a>(&'a self, dimensions: &[Dimension]) -> Option<&'a Arc<DiscoveredResource>> {
        dimensions.iter().find_map(|d| self.resolve(d))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::service;

    fn resource(arn: &str) -> Arc<DiscoveredResource> {
        Arc::new(DiscoveredResource {
            identifier: arn.to_string(),
            resource_type: String::new(),
            region: "eu-west-1".to_string(),
            tags: Vec::new(),
        })
    }

    fn dim(name: &str, value: &str) -> Dimension {
        Dimension {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn patterns(alias: &str) -> Vec<DimensionPattern> {
        service::lookup(alias)
            .expect("service")
            .compile_patterns()
            .expect("patterns")
    }

    #[test]
    fn test_every_group_is_a_key_without_matches() {
        let index = DimensionFilterIndex::build(&[], &patterns("alb"));
        assert!(index.has_key("TargetGroup"));
        assert!(index.has_key("LoadBalancer"));
        assert_eq!(index.values("LoadBalancer").map(<[_]>::len), Some(0));
        assert!(!index.has_key("InstanceId"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_extracts_instance_id() {
        let r = resource("arn:aws:ec2:eu-west-1:123456789012:instance/i-123");
        let index = DimensionFilterIndex::build(&[Arc::clone(&r)], &patterns("ec2"));

        let owner = index.resolve(&dim("InstanceId", "i-123")).expect("resolves");
        assert!(Arc::ptr_eq(owner, &r));
        assert!(index.resolve(&dim("InstanceId", "i-999")).is_none());
        assert!(index.resolve(&dim("ImageId", "i-123")).is_none());
    }

    #[test]
    fn test_load_balancer_patterns() {
        let lb = resource(
            "arn:aws:elasticloadbalancing:eu-west-1:123456789012:loadbalancer/app/web/50dc6c495c0c9188",
        );
        let tg = resource(
            "arn:aws:elasticloadbalancing:eu-west-1:123456789012:targetgroup/web-tg/73e2d6bc24d8a067",
        );
        let index = DimensionFilterIndex::build(&[lb, tg], &patterns("alb"));

        let lbs = index.values("LoadBalancer").expect("key");
        assert_eq!(lbs.len(), 1);
        assert_eq!(lbs[0].0, "app/web/50dc6c495c0c9188");

        let tgs = index.values("TargetGroup").expect("key");
        assert_eq!(tgs.len(), 1);
        assert_eq!(tgs[0].0, "targetgroup/web-tg/73e2d6bc24d8a067");
    }

    #[test]
    fn test_owner_is_first_resolving_dimension() {
        let lb = resource(
            "arn:aws:elasticloadbalancing:eu-west-1:123456789012:loadbalancer/app/web/abc",
        );
        let tg = resource("arn:aws:elasticloadbalancing:eu-west-1:123456789012:targetgroup/tg/def");
        let index =
            DimensionFilterIndex::build(&[Arc::clone(&lb), Arc::clone(&tg)], &patterns("alb"));

        let series = vec![
            dim("AvailabilityZone", "eu-west-1a"),
            dim("TargetGroup", "targetgroup/tg/def"),
            dim("LoadBalancer", "app/web/abc"),
        ];
        let owner = index.owner(&series).expect("owner");
        assert!(Arc::ptr_eq(owner, &tg));

        assert!(index.owner(&[dim("AvailabilityZone", "eu-west-1a")]).is_none());
    }

    #[test]
    fn test_s3_bucket_name() {
        let r = resource("arn:aws:s3:::my-logs");
        let index = DimensionFilterIndex::build(&[r], &patterns("s3"));
        assert!(index.resolve(&dim("BucketName", "my-logs")).is_some());
    }
}
