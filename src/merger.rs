//! Smart merger
//!
//! Consults the completion service before a delta is applied, so duplicates,
//! name aliases, and value conflicts get resolved against the canonical
//! graph. Runs in three phases so no lock is held across the consult:
//!
//! 1. [`SmartMerger::prepare`] serializes the catalog, every existing
//!    entity, and per-delta-entity fuzzy search results (under a read lock)
//! 2. [`SmartMerger::merge`] consults the completion service and parses the
//!    JSON reply into an optimized delta
//! 3. any failure, a disabled smart merge, or a missing prompt degrades to
//!    the simple merge: the delta passes through unchanged
//!
//! The reply is parsed leniently, field by field, the way the rest of the
//! reply handling works: a malformed record never takes the merge down.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::llm::{vars, CompletionService, PromptTemplate};
use crate::model::{
    ClassDelta, ClassOp, EntityDelta, EntityOp, GraphDelta, PropertyDelta, RelationshipDelta,
    RelationshipOp, Graph, System,
};
use crate::search::{SearchEngine, SearchResult};
use crate::updater::strip_code_fences;

/// How many related hits each delta entity contributes before dedup.
const RELATED_SEARCH_LIMIT: usize = 20;

/// Outcome of one merge consult.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub optimized_delta: GraphDelta,
    pub duplicates_found: u32,
    pub conflicts_resolved: u32,
    pub names_aligned: u32,
    pub descriptions_optimized: u32,
    pub notes: String,
    pub llm_input: Option<Value>,
    pub llm_response: Option<String>,
}

impl MergeResult {
    /// The simple merge: the delta passes through untouched.
    pub fn simple(delta: GraphDelta) -> Self {
        MergeResult {
            optimized_delta: delta,
            duplicates_found: 0,
            conflicts_resolved: 0,
            names_aligned: 0,
            descriptions_optimized: 0,
            notes: "simple merge, no completion-service consult".to_string(),
            llm_input: None,
            llm_response: None,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "MergeResult: {} duplicates, {} conflicts, {} aligned, {} optimized",
            self.duplicates_found,
            self.conflicts_resolved,
            self.names_aligned,
            self.descriptions_optimized
        )
    }
}

/// Everything the consult needs, captured under the state read lock.
#[derive(Debug, Clone)]
pub struct MergeInputs {
    current_system: String,
    entity_count: usize,
    relationship_count: usize,
    existing_entities_full: String,
    delta_related_data: String,
}

/// The merge-phase consult.
pub struct SmartMerger {
    completion: Arc<dyn CompletionService>,
    template: Option<PromptTemplate>,
    enabled: bool,
}

impl SmartMerger {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        template: Option<PromptTemplate>,
        enable_smart_merge: bool,
    ) -> Self {
        let enabled = enable_smart_merge && template.is_some();
        if enable_smart_merge && template.is_none() {
            warn!("smart merge requested but no merge prompt is configured, falling back to simple merge");
        }
        SmartMerger {
            completion,
            template,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Capture the canonical state the consult will reason over. Returns
    /// `None` when smart merge is off, which routes the caller straight to
    /// the simple merge.
    pub fn prepare(&self, system: &System, graph: &Graph, delta: &GraphDelta) -> Option<MergeInputs> {
        if !self.enabled {
            return None;
        }
        Some(MergeInputs {
            current_system: crate::updater::serialize_catalog(system),
            entity_count: graph.entity_count(),
            relationship_count: graph.relationship_count(),
            existing_entities_full: all_entities_detail(graph),
            delta_related_data: related_data_for_delta(graph, system, delta),
        })
    }

    /// Consult the completion service and build the optimized delta. Any
    /// failure degrades to the simple merge.
    pub async fn merge(&self, inputs: Option<MergeInputs>, delta: GraphDelta) -> MergeResult {
        let (Some(inputs), Some(template)) = (inputs, self.template.as_ref()) else {
            debug!("simple merge path");
            return MergeResult::simple(delta);
        };

        let delta_json = match serde_json::to_string_pretty(&delta) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "delta serialization failed, simple merge");
                return MergeResult::simple(delta);
            }
        };

        let llm_input = json!({
            "entity_count": inputs.entity_count,
            "relationship_count": inputs.relationship_count,
            "delta_summary": delta.summary(),
        });

        let response = match self
            .completion
            .complete(
                template,
                &vars([
                    ("current_system", inputs.current_system),
                    ("entity_count", inputs.entity_count.to_string()),
                    ("relationship_count", inputs.relationship_count.to_string()),
                    ("existing_entities_full", inputs.existing_entities_full),
                    ("delta_related_data", inputs.delta_related_data),
                    ("delta", delta_json),
                ]),
                0.3,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "merge consult failed, degrading to simple merge");
                return MergeResult::simple(delta);
            }
        };

        match build_optimized(&delta.task_id, &response) {
            Some(mut result) => {
                result.llm_input = Some(llm_input);
                result.llm_response = Some(response);
                info!(summary = %result.summary(), "smart merge built optimized delta");
                result
            }
            None => {
                warn!("merge reply unparseable, degrading to simple merge");
                let mut result = MergeResult::simple(delta);
                result.llm_response = Some(response);
                result
            }
        }
    }
}

/// JSON of every existing entity: name, description, classes, and per-class
/// property values.
fn all_entities_detail(graph: &Graph) -> String {
    let entities: Vec<Value> = graph
        .entities()
        .map(|entity| {
            let mut properties = serde_json::Map::new();
            for instance in &entity.classes {
                let values: serde_json::Map<String, Value> = instance
                    .properties
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v.as_deref().unwrap_or(""))))
                    .collect();
                if !values.is_empty() {
                    properties.insert(instance.class_name.clone(), Value::Object(values));
                }
            }
            json!({
                "name": entity.name,
                "description": entity.description,
                "classes": entity.class_names(),
                "properties": properties,
            })
        })
        .collect();
    serde_json::to_string_pretty(&entities).unwrap_or_default()
}

/// Fuzzy-search the canonical graph for every delta entity, deduplicate the
/// union by `(result_type, matched_item)` keeping the higher score, and sort
/// by score descending.
fn related_data_for_delta(graph: &Graph, system: &System, delta: &GraphDelta) -> String {
    let engine = SearchEngine::new(graph, system);
    let mut best: BTreeMap<(String, String), SearchResult> = BTreeMap::new();
    for entity_delta in &delta.entities {
        for result in engine.search_keyword(&entity_delta.name, true, Some(RELATED_SEARCH_LIMIT))
        {
            let key = (
                format!("{:?}", result.result_type),
                result.matched_item.clone(),
            );
            match best.get(&key) {
                Some(existing) if existing.score >= result.score => {}
                _ => {
                    best.insert(key, result);
                }
            }
        }
    }
    let mut related: Vec<SearchResult> = best.into_values().collect();
    related.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    debug!(related = related.len(), "related data collected for delta");
    serde_json::to_string_pretty(&related).unwrap_or_default()
}

/// Parse the consult reply into an optimized delta. Returns `None` when the
/// reply is not a JSON object.
fn build_optimized(task_id: &str, response: &str) -> Option<MergeResult> {
    let cleaned = strip_code_fences(response);
    let data: Value = serde_json::from_str(&cleaned).ok()?;
    let obj = data.as_object()?;

    let mut delta = GraphDelta::new(task_id);

    for cls in array(obj, "optimized_classes") {
        let Some(name) = cls["name"].as_str() else {
            warn!("class record without a name, skipping");
            continue;
        };
        let properties = cls["properties"]
            .as_array()
            .map(|props| {
                props
                    .iter()
                    .filter_map(|p| {
                        Some(PropertyDelta {
                            name: p["name"].as_str()?.to_string(),
                            description: p["description"].as_str().map(str::to_string),
                            required: p["required"].as_bool(),
                            value_required: p["value_required"].as_bool(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        delta.classes.push(ClassDelta {
            name: name.to_string(),
            description: cls["description"].as_str().map(str::to_string),
            properties,
            operation: match cls["operation"].as_str() {
                Some("update") => ClassOp::Update,
                _ => ClassOp::Add,
            },
        });
    }

    for ent in array(obj, "optimized_entities") {
        let Some(name) = ent["name"].as_str() else {
            warn!("entity record without a name, skipping");
            continue;
        };
        let operation = match ent["operation"].as_str() {
            Some("merge") => match ent["merge_target"].as_str() {
                Some(target) => EntityOp::Merge {
                    merge_target: target.to_string(),
                },
                None => {
                    warn!(entity = name, "merge record without merge_target, treating as add");
                    EntityOp::Add
                }
            },
            Some("update") => EntityOp::Update,
            _ => EntityOp::Add,
        };
        let classes = ent["classes"]
            .as_array()
            .map(|c| {
                c.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let mut properties = BTreeMap::new();
        if let Some(prop_obj) = ent["properties"].as_object() {
            for (class_name, values) in prop_obj {
                if let Some(values) = values.as_object() {
                    let class_props: BTreeMap<String, String> = values
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect();
                    properties.insert(class_name.clone(), class_props);
                }
            }
        }
        delta.entities.push(EntityDelta {
            name: name.to_string(),
            description: ent["description"].as_str().map(str::to_string),
            classes,
            properties,
            operation,
        });
    }

    for rel in array(obj, "optimized_relationships") {
        let (Some(source), Some(target), Some(description)) = (
            rel["source"].as_str(),
            rel["target"].as_str(),
            rel["description"].as_str(),
        ) else {
            warn!("relationship record missing source/target/description, skipping");
            continue;
        };
        let operation = match rel["operation"].as_str() {
            Some("increment_count") => {
                let amount = rel["increment_amount"].as_u64().unwrap_or(0);
                if amount == 0 {
                    warn!(
                        source, target,
                        "increment_count without a positive increment_amount, downgrading to add"
                    );
                    RelationshipOp::Add
                } else {
                    RelationshipOp::IncrementCount {
                        increment_amount: amount as u32,
                    }
                }
            }
            Some("update") => RelationshipOp::Update,
            Some("merge") => RelationshipOp::Merge,
            _ => RelationshipOp::Add,
        };
        let semantic_times = match &rel["semantic_times"] {
            Value::Array(times) => times
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Value::Null => Vec::new(),
            _ => {
                warn!(source, target, "semantic_times is not a list, using empty");
                Vec::new()
            }
        };
        delta.relationships.push(RelationshipDelta {
            source: source.to_string(),
            target: target.to_string(),
            description: description.to_string(),
            count: rel["count"].as_u64().unwrap_or(1) as u32,
            refer: rel["refer"]
                .as_array()
                .map(|r| {
                    r.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            semantic_times,
            operation,
        });
    }

    let summary = &data["merge_summary"];
    if let Some(summary_obj) = summary.as_object() {
        delta.metadata = summary_obj.clone();
    }
    Some(MergeResult {
        optimized_delta: delta,
        duplicates_found: summary["duplicates_found"].as_u64().unwrap_or(0) as u32,
        conflicts_resolved: summary["conflicts_resolved"].as_u64().unwrap_or(0) as u32,
        names_aligned: summary["names_aligned"].as_u64().unwrap_or(0) as u32,
        descriptions_optimized: summary["descriptions_optimized"].as_u64().unwrap_or(0) as u32,
        notes: summary["notes"].as_str().unwrap_or_default().to_string(),
        llm_input: None,
        llm_response: None,
    })
}

fn array<'v>(obj: &'v serde_json::Map<String, Value>, key: &str) -> Vec<&'v Value> {
    obj.get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter().collect())
        .unwrap_or_default()
}
