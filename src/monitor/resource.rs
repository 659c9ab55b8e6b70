use regex::Regex;

use crate::error::MonitorError;
use crate::provider::{ResourceTagMapping, Tag};

/// A resource that survived tag filtering in the current scrape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredResource {
    /// Provider ARN.
    pub identifier: String,
    pub resource_type: String,
    pub region: String,
    /// Tags in provider order; keys may repeat.
    pub tags: Vec<Tag>,
}

impl DiscoveredResource {
    pub fn from_mapping(mapping: ResourceTagMapping, region: &str) -> Self {
        Self {
            identifier: mapping.arn,
            resource_type: mapping.resource_type,
            region: region.to_string(),
            tags: mapping.tags,
        }
    }

    /// Whether every filter matches at least one of this resource's tags.
    pub fn matches_all(&self, filters: &[TagFilter]) -> bool {
        filters.iter().all(|f| f.matches(&self.tags))
    }

    /// Value of each requested tag name, taking the first matching tag and
    /// falling back to an empty string.
    pub fn exported_tags(&self, names: &[String]) -> Vec<Tag> {
        names
            .iter()
            .map(|name| Tag {
                key: name.clone(),
                value: self
                    .tags
                    .iter()
                    .find(|t| &t.key == name)
                    .map(|t| t.value.clone())
                    .unwrap_or_default(),
            })
            .collect()
    }
}

/// Required tag: exact key, value matched by regex.
#[derive(Debug, Clone)]
pub struct TagFilter {
    pub key: String,
    pub value: Regex,
}

impl TagFilter {
    pub fn compile(tag: &Tag) -> Result<Self, MonitorError> {
        let value = Regex::new(&tag.value).map_err(|source| MonitorError::InvalidTagFilter {
            key: tag.key.clone(),
            value: tag.value.clone(),
            source,
        })?;

        Ok(Self {
            key: tag.key.clone(),
            value,
        })
    }

    pub fn matches(&self, tags: &[Tag]) -> bool {
        tags.iter()
            .any(|t| t.key == self.key && self.value.is_match(&t.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(key: &str, value: &str) -> Tag {
        Tag {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn resource(tags: Vec<Tag>) -> DiscoveredResource {
        DiscoveredResource {
            identifier: "arn:aws:ec2:eu-west-1:123456789012:instance/i-1".to_string(),
            resource_type: "ec2:instance".to_string(),
            region: "eu-west-1".to_string(),
            tags,
        }
    }

    fn filters(tags: &[Tag]) -> Vec<TagFilter> {
        tags.iter()
            .map(|t| TagFilter::compile(t).expect("valid filter"))
            .collect()
    }

    #[test]
    fn test_all_filters_must_match() {
        let r = resource(vec![tag("env", "prod"), tag("team", "core")]);

        assert!(r.matches_all(&[]));
        assert!(r.matches_all(&filters(&[tag("env", "^prod$")])));
        assert!(r.matches_all(&filters(&[tag("env", "pro"), tag("team", "c.re")])));
        assert!(!r.matches_all(&filters(&[tag("env", "^prod$"), tag("team", "^edge$")])));
        assert!(!r.matches_all(&filters(&[tag("owner", ".*")])));
    }

    #[test]
    fn test_filter_matches_any_tag_with_key() {
        let r = resource(vec![tag("env", "dev"), tag("env", "prod")]);
        assert!(r.matches_all(&filters(&[tag("env", "^prod$")])));
    }

    #[test]
    fn test_filter_key_is_exact() {
        let r = resource(vec![tag("Environment", "prod")]);
        assert!(!r.matches_all(&filters(&[tag("env", "prod")])));
    }

    #[test]
    fn test_invalid_filter_regex() {
        let err = TagFilter::compile(&tag("env", "[prod")).unwrap_err();
        assert!(matches!(err, MonitorError::InvalidTagFilter { ref key, .. } if key == "env"));
    }

    #[test]
    fn test_exported_tags_first_match_or_empty() {
        let r = resource(vec![tag("Name", "web-1"), tag("Name", "web-2")]);
        let exported = r.exported_tags(&["Name".to_string(), "team".to_string()]);
        assert_eq!(exported, vec![tag("Name", "web-1"), tag("team", "")]);
    }

    #[test]
    fn test_from_mapping() {
        let r = DiscoveredResource::from_mapping(
            ResourceTagMapping {
                arn: "arn:aws:s3:::logs".to_string(),
                resource_type: "s3".to_string(),
                tags: vec![tag("env", "prod")],
            },
            "us-east-1",
        );
        assert_eq!(r.identifier, "arn:aws:s3:::logs");
        assert_eq!(r.region, "us-east-1");
    }
}
