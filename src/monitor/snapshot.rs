use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Gauge, Opts, TextEncoder};
use tracing::warn;

use super::normalize::NormalizedMetric;

const METRIC_HELP: &str = "Metric exported from the cloud provider monitoring API.";

/// Name and label keys of one exposed metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub name: String,
    pub label_names: Vec<String>,
}

/// The normalized output of one completed scrape.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub generation: u64,
    pub completed_at: Option<DateTime<Utc>>,
    pub metrics: Vec<NormalizedMetric>,
}

impl Snapshot {
    pub fn new(generation: u64, completed_at: DateTime<Utc>, metrics: Vec<NormalizedMetric>) -> Self {
        Self {
            generation,
            completed_at: Some(completed_at),
            metrics,
        }
    }

    fn by_name(&self) -> BTreeMap<&str, Vec<&NormalizedMetric>> {
        let mut grouped: BTreeMap<&str, Vec<&NormalizedMetric>> = BTreeMap::new();
        for m in &self.metrics {
            grouped.entry(m.name.as_str()).or_default().push(m);
        }
        grouped
    }

    /// Distinct metric names with their label keys.
    pub fn descriptors(&self) -> Vec<MetricDescriptor> {
        self.by_name()
            .into_iter()
            .map(|(name, instances)| MetricDescriptor {
                name: name.to_string(),
                label_names: instances
                    .first()
                    .map(|m| m.labels.keys().cloned().collect())
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Prometheus families, one per metric name. Instances the client
    /// library rejects are logged and skipped.
    pub fn families(&self) -> Vec<MetricFamily> {
        self.by_name()
            .into_iter()
            .filter_map(|(name, instances)| {
                let mut family: Option<MetricFamily> = None;

                for m in instances {
                    match const_family(m) {
                        Ok(mut built) => match family.as_mut() {
                            None => family = Some(built),
                            Some(existing) => {
                                for metric in built.take_metric() {
                                    existing.mut_metric().push(metric);
                                }
                            }
                        },
                        Err(e) => {
                            warn!(metric = name, error = %e, "skipping unexportable metric");
                        }
                    }
                }

                family
            })
            .collect()
    }

    /// Text exposition of the snapshot.
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.families(), &mut buffer)
            .context("encoding snapshot")?;
        String::from_utf8(buffer).context("snapshot is not valid UTF-8")
    }
}

/// A single-sample gauge family for `m`.
fn const_family(m: &NormalizedMetric) -> Result<MetricFamily> {
    let labels: HashMap<String, String> = m
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let gauge = Gauge::with_opts(Opts::new(m.name.clone(), METRIC_HELP).const_labels(labels))?;
    gauge.set(m.value);

    let mut family = gauge
        .collect()
        .pop()
        .context("gauge produced no metric family")?;

    if let Some(ts) = m.timestamp {
        for metric in family.mut_metric().iter_mut() {
            metric.set_timestamp_ms(ts.timestamp_millis());
        }
    }

    Ok(family)
}

/// Holder of the most recently published snapshot.
///
/// Publication is generation-checked so a slow scrape finishing after a
/// newer one never replaces its result.
pub struct SnapshotStore {
    current: RwLock<Arc<Snapshot>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Install `snapshot` unless a newer or equal generation is already
    /// current. Returns whether it was installed.
    pub fn publish(&self, snapshot: Snapshot) -> bool {
        let mut current = self.current.write();
        if current.completed_at.is_some() && snapshot.generation <= current.generation {
            return false;
        }
        *current = Arc::new(snapshot);
        true
    }

    pub fn load(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn metric(name: &str, labels: &[(&str, &str)], value: f64) -> NormalizedMetric {
        NormalizedMetric {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            value,
            timestamp: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_publish_is_generation_checked() {
        let store = SnapshotStore::new();
        assert_eq!(store.load().generation, 0);
        assert!(store.load().completed_at.is_none());

        assert!(store.publish(Snapshot::new(2, now(), Vec::new())));
        assert!(!store.publish(Snapshot::new(1, now(), Vec::new())));
        assert!(!store.publish(Snapshot::new(2, now(), Vec::new())));
        assert_eq!(store.load().generation, 2);

        assert!(store.publish(Snapshot::new(3, now(), Vec::new())));
        assert_eq!(store.load().generation, 3);
    }

    #[test]
    fn test_first_generation_zero_publishes() {
        let store = SnapshotStore::new();
        assert!(store.publish(Snapshot::new(0, now(), Vec::new())));
        assert!(store.load().completed_at.is_some());
    }

    #[test]
    fn test_descriptors() {
        let snapshot = Snapshot::new(
            1,
            now(),
            vec![
                metric("b_metric", &[("name", "x"), ("region", "r")], 1.0),
                metric("a_metric", &[("name", "y")], 2.0),
                metric("b_metric", &[("name", "z"), ("region", "r")], 3.0),
            ],
        );

        let descriptors = snapshot.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].name, "a_metric");
        assert_eq!(
            descriptors[1].label_names,
            vec!["name".to_string(), "region".to_string()]
        );
    }

    #[test]
    fn test_families_merge_instances_and_stamp_timestamps() {
        let mut stamped = metric("aws_ec2_cpuutilization_average", &[("name", "i-1")], 42.0);
        stamped.timestamp = Some(now());
        let plain = metric("aws_ec2_cpuutilization_average", &[("name", "i-2")], f64::NAN);

        let snapshot = Snapshot::new(1, now(), vec![stamped, plain]);
        let families = snapshot.families();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_metric().len(), 2);

        let text = snapshot.encode_text().expect("encode");
        assert!(text.contains("aws_ec2_cpuutilization_average{name=\"i-1\"} 42 1714564800000"));
        assert!(text.contains("aws_ec2_cpuutilization_average{name=\"i-2\"} NaN"));
    }

    #[test]
    fn test_invalid_label_name_is_skipped() {
        let snapshot = Snapshot::new(
            1,
            now(),
            vec![
                metric("ok_metric", &[("name", "a")], 1.0),
                metric("ok_metric", &[("1bad", "b")], 2.0),
            ],
        );

        let families = snapshot.families();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_metric().len(), 1);
    }
}
