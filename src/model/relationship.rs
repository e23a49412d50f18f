//! Relationships - the typed edges of the graph
//!
//! A relationship connects two node identifiers (entity name, `"entity:class"`
//! node id, or class name). Its identity is the tuple
//! `(source^, target^, description, set(refer^))` where `^` is case folding;
//! `refer` is compared set-wise. Adding an identical relationship accumulates
//! its count instead of inserting a second edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A directed, counted edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source: String,
    pub target: String,
    pub description: String,
    /// Number of times this relationship has been observed (always >= 1)
    pub count: u32,
    /// Additional participants; order-insensitive, part of the identity
    #[serde(default)]
    pub refer: Vec<String>,
    /// ISO-8601 times of the events this relationship describes
    #[serde(default)]
    pub semantic_times: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        description: impl Into<String>,
        count: u32,
    ) -> Self {
        let now = Utc::now();
        Relationship {
            source: source.into(),
            target: target.into(),
            description: description.into(),
            count: count.max(1),
            refer: Vec::new(),
            semantic_times: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_refer(mut self, refer: Vec<String>) -> Self {
        self.refer = refer;
        self
    }

    pub fn with_semantic_times(mut self, semantic_times: Vec<String>) -> Self {
        self.semantic_times = semantic_times;
        self
    }

    /// The case-folded refer set used for identity comparison.
    pub fn refer_key(&self) -> BTreeSet<String> {
        self.refer.iter().map(|r| r.to_uppercase()).collect()
    }

    /// Whether this relationship matches the given identity tuple.
    pub fn matches(
        &self,
        source: &str,
        target: &str,
        description: &str,
        refer: &[String],
    ) -> bool {
        self.source.eq_ignore_ascii_case(source)
            && self.target.eq_ignore_ascii_case(target)
            && self.description == description
            && self.refer_key()
                == refer
                    .iter()
                    .map(|r| r.to_uppercase())
                    .collect::<BTreeSet<_>>()
    }

    /// Whether two relationships are the same edge.
    pub fn same_identity(&self, other: &Relationship) -> bool {
        self.matches(&other.source, &other.target, &other.description, &other.refer)
    }

    /// Fold another observation of the same edge into this one.
    pub fn accumulate(&mut self, additional_count: u32, semantic_times: &[String]) {
        self.count = self.count.saturating_add(additional_count).max(1);
        self.semantic_times.extend_from_slice(semantic_times);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_is_at_least_one() {
        let rel = Relationship::new("user", "wechat", "opens", 0);
        assert_eq!(rel.count, 1);
    }

    #[test]
    fn test_identity_is_case_insensitive() {
        let a = Relationship::new("User", "WeChat", "opens", 1);
        let b = Relationship::new("USER", "wechat", "opens", 3);
        assert!(a.same_identity(&b));
    }

    #[test]
    fn test_identity_description_is_case_sensitive() {
        let a = Relationship::new("user", "wechat", "opens", 1);
        let b = Relationship::new("user", "wechat", "Opens", 1);
        assert!(!a.same_identity(&b));
    }

    #[test]
    fn test_refer_is_set_wise() {
        let a = Relationship::new("user", "wechat", "opens", 1)
            .with_refer(vec!["phone".into(), "Wifi".into()]);
        let b = Relationship::new("user", "wechat", "opens", 1)
            .with_refer(vec!["WIFI".into(), "PHONE".into()]);
        assert!(a.same_identity(&b));

        let c = Relationship::new("user", "wechat", "opens", 1)
            .with_refer(vec!["phone".into()]);
        assert!(!a.same_identity(&c));
    }

    #[test]
    fn test_accumulate_adds_counts_and_times() {
        let mut rel = Relationship::new("user", "wechat", "opens", 2)
            .with_semantic_times(vec!["2026-01-01T08:00:00".into()]);
        rel.accumulate(3, &["2026-01-02T09:00:00".to_string()]);
        assert_eq!(rel.count, 5);
        assert_eq!(
            rel.semantic_times,
            vec!["2026-01-01T08:00:00", "2026-01-02T09:00:00"]
        );
    }
}
