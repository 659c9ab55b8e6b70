use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::candidate::CandidateSeries;

/// Prefix for job types that do not already start with "aws".
const CUSTOM_NAMESPACE_PREFIX: &str = "cpe_aws_";

/// A flattened sample ready for exposition.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMetric {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

fn camel_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("([a-z0-9])([A-Z])").expect("static regex"))
}

/// Lower-case `text`, replacing every character outside `[a-z0-9_]` with
/// `_`, and `%` with `_percent`.
pub fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => out.push_str("_percent"),
            c if c.is_ascii_alphanumeric() || c == '_' => out.push(c.to_ascii_lowercase()),
            _ => out.push('_'),
        }
    }
    out
}

/// `sanitize` after separating camel-case words, so "CPUUtilization"
/// becomes "cpuutilization" and "NetworkIn" becomes "network_in".
pub fn prom_string(text: &str) -> String {
    sanitize(&camel_boundary().replace_all(text, "${1}_${2}"))
}

/// Exposition name for a job type, metric and statistic. Types given as
/// aliases ("ec2") get the `cpe_aws_` prefix, namespaces ("AWS/EC2") do not.
pub fn metric_name(job_type: &str, metric: &str, statistic: &str) -> String {
    let mut ns = job_type.to_lowercase();
    if !ns.starts_with("aws") {
        ns = format!("{CUSTOM_NAMESPACE_PREFIX}{ns}");
    }

    format!(
        "{}_{}_{}",
        prom_string(&ns),
        prom_string(metric),
        prom_string(statistic)
    )
}

/// Label set for a candidate: identity labels, then dimensions, custom tags
/// and exported resource tags.
pub fn labels_for(candidate: &CandidateSeries) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("name".to_string(), candidate.resource_identifier.clone());
    labels.insert("region".to_string(), candidate.region.clone());
    labels.insert("account_id".to_string(), candidate.account_id.clone());

    for d in &candidate.dimensions {
        labels.insert(format!("dimension_{}", sanitize(&d.name)), d.value.clone());
    }
    for t in &candidate.custom_tags {
        labels.insert(format!("custom_tag_{}", sanitize(&t.key)), t.value.clone());
    }
    for t in &candidate.tags {
        labels.insert(format!("tag_{}", sanitize(&t.key)), t.value.clone());
    }

    labels
}

/// Convert one fetched candidate. Returns `None` when it has no data and
/// timestamps are requested.
pub fn normalize_candidate(candidate: &CandidateSeries) -> Option<NormalizedMetric> {
    let (value, timestamp) = match (candidate.datapoint, candidate.add_timestamp) {
        (Some(point), true) => (point.value, Some(point.timestamp)),
        (Some(point), false) => (point.value, None),
        (None, false) => (f64::NAN, None),
        (None, true) => return None,
    };

    Some(NormalizedMetric {
        name: metric_name(&candidate.job_type, &candidate.metric_name, &candidate.statistic),
        labels: labels_for(candidate),
        value,
        timestamp,
    })
}

/// Give every instance of a metric name the union of label keys seen for
/// that name, backfilling missing keys with "".
pub fn reconcile_label_sets(metrics: &mut [NormalizedMetric]) {
    let mut keys_by_name: HashMap<String, BTreeSet<String>> = HashMap::new();
    for m in metrics.iter() {
        keys_by_name
            .entry(m.name.clone())
            .or_default()
            .extend(m.labels.keys().cloned());
    }

    for m in metrics.iter_mut() {
        if let Some(keys) = keys_by_name.get(&m.name) {
            for key in keys {
                m.labels.entry(key.clone()).or_default();
            }
        }
    }
}

/// Normalize a scrape's candidates into a label-consistent metric set.
pub fn normalize<'a>(
    candidates: impl IntoIterator<Item = &'a CandidateSeries>,
) -> Vec<NormalizedMetric> {
    let mut metrics: Vec<NormalizedMetric> = candidates
        .into_iter()
        .filter_map(normalize_candidate)
        .collect();
    reconcile_label_sets(&mut metrics);
    metrics
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::monitor::candidate::Datapoint;
    use crate::provider::{Dimension, Tag};

    fn candidate(dims: &[(&str, &str)], tags: &[(&str, &str)]) -> CandidateSeries {
        CandidateSeries {
            correlation_id: "id_1".to_string(),
            resource_identifier: "arn:aws:ec2:eu-west-1:123456789012:instance/i-123".to_string(),
            metric_name: "CPUUtilization".to_string(),
            namespace: "AWS/EC2".to_string(),
            job_type: "AWS/EC2".to_string(),
            statistic: "Average".to_string(),
            dimensions: dims
                .iter()
                .map(|(n, v)| Dimension {
                    name: n.to_string(),
                    value: v.to_string(),
                })
                .collect(),
            region: "eu-west-1".to_string(),
            account_id: "123456789012".to_string(),
            period_seconds: 300,
            add_timestamp: false,
            tags: tags
                .iter()
                .map(|(k, v)| Tag {
                    key: k.to_string(),
                    value: v.to_string(),
                })
                .collect(),
            custom_tags: Vec::new(),
            datapoint: None,
        }
    }

    #[test]
    fn test_prom_string() {
        assert_eq!(prom_string("CPUUtilization"), "cpuutilization");
        assert_eq!(prom_string("NetworkIn"), "network_in");
        assert_eq!(prom_string("p99.9"), "p99_9");
        assert_eq!(prom_string("HTTPCode_ELB_5XX_Count"), "httpcode_elb_5_xx_count");
        assert_eq!(prom_string("Free Storage %"), "free_storage__percent");
        assert_eq!(prom_string("a/b-c:d=e@f<g>h,i\\j"), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn test_metric_name() {
        assert_eq!(
            metric_name("AWS/EC2", "CPUUtilization", "Average"),
            "aws_ec2_cpuutilization_average"
        );
        assert_eq!(
            metric_name("AWS/ApplicationELB", "RequestCount", "Sum"),
            "aws_applicationelb_request_count_sum"
        );
        assert_eq!(
            metric_name("Custom/App", "QueueDepth", "Maximum"),
            "cpe_aws_custom_app_queue_depth_maximum"
        );
        assert_eq!(
            metric_name("ec2", "CPUUtilization", "Average"),
            "cpe_aws_ec2_cpuutilization_average"
        );
    }

    #[test]
    fn test_name_follows_job_type_not_namespace() {
        let mut c = candidate(&[("InstanceId", "i-123")], &[]);
        c.job_type = "ec2".to_string();

        let m = normalize_candidate(&c).expect("NaN emitted");
        assert_eq!(m.name, "cpe_aws_ec2_cpuutilization_average");
        assert_eq!(c.namespace, "AWS/EC2");
    }

    #[test]
    fn test_labels_are_lowercased_without_camel_split() {
        let c = candidate(&[("InstanceId", "i-123")], &[("Name", "web"), ("cost-center", "42")]);
        let labels = labels_for(&c);

        assert_eq!(labels["dimension_instanceid"], "i-123");
        assert_eq!(labels["tag_name"], "web");
        assert_eq!(labels["tag_cost_center"], "42");
        assert_eq!(labels["region"], "eu-west-1");
        assert_eq!(labels["account_id"], "123456789012");
        assert_eq!(
            labels["name"],
            "arn:aws:ec2:eu-west-1:123456789012:instance/i-123"
        );
    }

    #[test]
    fn test_value_policy() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 11, 55, 0).unwrap();
        let mut c = candidate(&[("InstanceId", "i-123")], &[]);

        let missing = normalize_candidate(&c).expect("NaN emitted");
        assert!(missing.value.is_nan());
        assert!(missing.timestamp.is_none());

        c.add_timestamp = true;
        assert!(normalize_candidate(&c).is_none());

        c.datapoint = Some(Datapoint {
            value: 42.0,
            timestamp: t0,
        });
        let stamped = normalize_candidate(&c).expect("value emitted");
        assert_eq!(stamped.value, 42.0);
        assert_eq!(stamped.timestamp, Some(t0));

        c.add_timestamp = false;
        let plain = normalize_candidate(&c).expect("value emitted");
        assert_eq!(plain.timestamp, None);
    }

    #[test]
    fn test_reconcile_backfills_empty_values() {
        let mut a = candidate(&[("InstanceId", "i-1")], &[("Name", "web")]);
        a.datapoint = Some(Datapoint {
            value: 1.0,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 11, 55, 0).unwrap(),
        });
        let b = candidate(&[("InstanceId", "i-2"), ("AutoScalingGroupName", "asg")], &[]);
        let mut other = candidate(&[("VolumeId", "vol-1")], &[]);
        other.metric_name = "VolumeReadOps".to_string();

        let metrics = normalize(&[a, b, other]);
        assert_eq!(metrics.len(), 3);

        let cpu: Vec<&NormalizedMetric> = metrics
            .iter()
            .filter(|m| m.name == "aws_ec2_cpuutilization_average")
            .collect();
        let keys0: Vec<&String> = cpu[0].labels.keys().collect();
        let keys1: Vec<&String> = cpu[1].labels.keys().collect();
        assert_eq!(keys0, keys1);
        assert_eq!(cpu[0].labels["dimension_autoscalinggroupname"], "");
        assert_eq!(cpu[1].labels["tag_name"], "");

        let volume = metrics
            .iter()
            .find(|m| m.name == "aws_ec2_volume_read_ops_average")
            .expect("volume metric");
        assert!(!volume.labels.contains_key("tag_name"));
    }
}
