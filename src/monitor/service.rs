use regex::Regex;

use crate::error::MonitorError;

/// Static metadata for one supported resource family.
#[derive(Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Monitoring namespace, e.g. "AWS/EC2".
    pub namespace: &'static str,
    /// Short job type, e.g. "ec2".
    pub alias: &'static str,
    /// Tag-search resource types. Empty means the family is catalog-only.
    pub resource_filters: &'static [&'static str],
    /// Regexes whose named groups map resource identifiers to dimensions.
    pub dimension_patterns: &'static [&'static str],
}

impl ServiceDescriptor {
    /// Whether resources of this family are discovered by tag search.
    pub fn discovers_resources(&self) -> bool {
        !self.resource_filters.is_empty()
    }

    /// Compile the dimension patterns in declaration order.
    pub fn compile_patterns(&self) -> Result<Vec<DimensionPattern>, MonitorError> {
        self.dimension_patterns
            .iter()
            .map(|pattern| {
                DimensionPattern::compile(pattern).map_err(|source| {
                    MonitorError::InvalidPattern {
                        namespace: self.namespace.to_string(),
                        pattern: pattern.to_string(),
                        source,
                    }
                })
            })
            .collect()
    }
}

/// A compiled dimension pattern and its named capture groups.
#[derive(Debug, Clone)]
pub struct DimensionPattern {
    pub regex: Regex,
    /// Capture-group names in positional order.
    pub names: Vec<String>,
}

impl DimensionPattern {
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(pattern)?;
        let names = regex.capture_names().flatten().map(str::to_string).collect();
        Ok(Self { regex, names })
    }
}

const LOAD_BALANCER_PATTERNS: &[&str] = &[
    ":(?P<TargetGroup>targetgroup/.+)",
    ":loadbalancer/(?P<LoadBalancer>.+)$",
];

/// Every supported family, looked up by alias or namespace.
pub static SUPPORTED_SERVICES: &[ServiceDescriptor] = &[
    ServiceDescriptor {
        namespace: "AWS/ApplicationELB",
        alias: "alb",
        resource_filters: &[
            "elasticloadbalancing:loadbalancer/app",
            "elasticloadbalancing:targetgroup",
        ],
        dimension_patterns: LOAD_BALANCER_PATTERNS,
    },
    ServiceDescriptor {
        namespace: "AWS/EBS",
        alias: "ebs",
        resource_filters: &["ec2:volume"],
        dimension_patterns: &["volume/(?P<VolumeId>[^/]+)"],
    },
    ServiceDescriptor {
        namespace: "AWS/EC2",
        alias: "ec2",
        resource_filters: &["ec2:instance"],
        dimension_patterns: &["instance/(?P<InstanceId>[^/]+)"],
    },
    ServiceDescriptor {
        namespace: "AWS/ELB",
        alias: "elb",
        resource_filters: &["elasticloadbalancing:loadbalancer"],
        dimension_patterns: &[":loadbalancer/(?P<LoadBalancerName>.+)$"],
    },
    ServiceDescriptor {
        namespace: "AWS/NATGateway",
        alias: "ngw",
        resource_filters: &["ec2:natgateway"],
        dimension_patterns: &["natgateway/(?P<NatGatewayId>[^/]+)"],
    },
    ServiceDescriptor {
        namespace: "AWS/NetworkELB",
        alias: "nlb",
        resource_filters: &[
            "elasticloadbalancing:loadbalancer/net",
            "elasticloadbalancing:targetgroup",
        ],
        dimension_patterns: LOAD_BALANCER_PATTERNS,
    },
    ServiceDescriptor {
        namespace: "AWS/Route53",
        alias: "route53",
        resource_filters: &["route53"],
        dimension_patterns: &[":healthcheck/(?P<HealthCheckId>[^/]+)"],
    },
    ServiceDescriptor {
        namespace: "AWS/S3",
        alias: "s3",
        resource_filters: &["s3"],
        dimension_patterns: &["(?P<BucketName>[^:]+)$"],
    },
    ServiceDescriptor {
        namespace: "AWS/Usage",
        alias: "usage",
        resource_filters: &[],
        dimension_patterns: &[],
    },
];

/// First descriptor whose alias or namespace equals `key`.
pub fn lookup(key: &str) -> Result<&'static ServiceDescriptor, MonitorError> {
    SUPPORTED_SERVICES
        .iter()
        .find(|s| s.alias == key || s.namespace == key)
        .ok_or_else(|| MonitorError::UnknownService(key.to_string()))
}
