//! GraphDelta - the structured change proposal between extract and merge
//!
//! A delta is produced by the extraction phase against a per-task System
//! snapshot and applied to the canonical graph by the merge phase. The
//! `operation` of each record is a tagged sum type so per-variant fields
//! (`merge_target`, `increment_amount`) only exist where they are valid;
//! the serde representation keeps the `operation` tag inline so deltas
//! serialize as the JSON shape the smart-merge prompt works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Operation tag for class records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum ClassOp {
    #[default]
    Add,
    Update,
}

/// Operation tag for entity records. A merge absorbs the incoming name into
/// `merge_target`, the canonical entity name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum EntityOp {
    #[default]
    Add,
    Update,
    Merge {
        merge_target: String,
    },
}

/// Operation tag for relationship records. `increment_count` bumps an
/// existing relationship's count by `increment_amount` instead of inserting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum RelationshipOp {
    #[default]
    Add,
    Update,
    Merge,
    IncrementCount {
        increment_amount: u32,
    },
}

/// A property declaration carried inside a class delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDelta {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub value_required: Option<bool>,
}

/// A class addition or enhancement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDelta {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyDelta>,
    #[serde(flatten)]
    pub operation: ClassOp,
}

/// An entity addition, update, or merge-into-canonical-name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDelta {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    /// class name -> property name -> value
    #[serde(default)]
    pub properties: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(flatten)]
    pub operation: EntityOp,
}

impl EntityDelta {
    /// The name this record resolves to in the canonical graph: the merge
    /// target for merge records, the record's own name otherwise.
    pub fn canonical_name(&self) -> &str {
        match &self.operation {
            EntityOp::Merge { merge_target } => merge_target,
            _ => &self.name,
        }
    }
}

/// A relationship addition, update, merge, or count increment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDelta {
    pub source: String,
    pub target: String,
    pub description: String,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub refer: Vec<String>,
    #[serde(default)]
    pub semantic_times: Vec<String>,
    #[serde(flatten)]
    pub operation: RelationshipOp,
}

fn default_count() -> u32 {
    1
}

/// The complete change proposal produced by one task's extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDelta {
    pub task_id: String,
    #[serde(default)]
    pub classes: Vec<ClassDelta>,
    #[serde(default)]
    pub entities: Vec<EntityDelta>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDelta>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl GraphDelta {
    pub fn new(task_id: impl Into<String>) -> Self {
        GraphDelta {
            task_id: task_id.into(),
            classes: Vec::new(),
            entities: Vec::new(),
            relationships: Vec::new(),
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.entities.is_empty() && self.relationships.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "GraphDelta(task_id={}, {} classes, {} entities, {} relationships)",
            self.task_id,
            self.classes.len(),
            self.entities.len(),
            self.relationships.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_tag_serializes_inline() {
        let delta = RelationshipDelta {
            source: "A".into(),
            target: "B".into(),
            description: "d".into(),
            count: 1,
            refer: Vec::new(),
            semantic_times: Vec::new(),
            operation: RelationshipOp::IncrementCount {
                increment_amount: 2,
            },
        };
        let json = serde_json::to_value(&delta).expect("serializes");
        assert_eq!(json["operation"], "increment_count");
        assert_eq!(json["increment_amount"], 2);
    }

    #[test]
    fn test_entity_merge_round_trip() {
        let delta = EntityDelta {
            name: "WeChat App".into(),
            description: Some("messaging".into()),
            classes: vec!["Platform".into()],
            properties: BTreeMap::new(),
            operation: EntityOp::Merge {
                merge_target: "Wechat".into(),
            },
        };
        let json = serde_json::to_string(&delta).expect("serializes");
        let back: EntityDelta = serde_json::from_str(&json).expect("parses");
        assert_eq!(back, delta);
        assert_eq!(back.canonical_name(), "Wechat");
    }

    #[test]
    fn test_canonical_name_for_add() {
        let delta = EntityDelta {
            name: "Wechat".into(),
            description: None,
            classes: Vec::new(),
            properties: BTreeMap::new(),
            operation: EntityOp::Add,
        };
        assert_eq!(delta.canonical_name(), "Wechat");
    }

    #[test]
    fn test_relationship_delta_defaults() {
        let json = r#"{
            "source": "user",
            "target": "wechat",
            "description": "opens",
            "operation": "add"
        }"#;
        let delta: RelationshipDelta = serde_json::from_str(json).expect("parses");
        assert_eq!(delta.count, 1);
        assert!(delta.refer.is_empty());
        assert!(delta.semantic_times.is_empty());
        assert_eq!(delta.operation, RelationshipOp::Add);
    }

    #[test]
    fn test_delta_is_empty() {
        let mut delta = GraphDelta::new("t1");
        assert!(delta.is_empty());
        delta.entities.push(EntityDelta {
            name: "Wechat".into(),
            description: None,
            classes: Vec::new(),
            properties: BTreeMap::new(),
            operation: EntityOp::Add,
        });
        assert!(!delta.is_empty());
        assert!(delta.summary().contains("1 entities"));
    }

    #[test]
    fn test_delta_json_round_trip() {
        let mut delta = GraphDelta::new("t1");
        delta.classes.push(ClassDelta {
            name: "Platform".into(),
            description: Some("an online platform".into()),
            properties: vec![PropertyDelta {
                name: "founded".into(),
                ..PropertyDelta::default()
            }],
            operation: ClassOp::Update,
        });
        let json = serde_json::to_string(&delta).expect("serializes");
        let back: GraphDelta = serde_json::from_str(&json).expect("parses");
        assert_eq!(back, delta);
    }
}
