//! Graph store - the in-memory typed multigraph
//!
//! Holds entities (keyed by uppercased name), class-instance nodes (keyed by
//! uppercased `"entity:class"` id), the relationship set, and an adjacency
//! map over uppercased node ids. The class-master layer is never stored; it
//! is synthesized from the System on demand, so the catalog stays the single
//! source of truth.
//!
//! The Graph does not own a System. Every operation that needs the catalog
//! takes `&System` explicitly, which keeps the type layer shared between the
//! canonical graph and per-task snapshots without back-references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};
use crate::model::entity::{ClassMasterNode, ClassNode, Entity, ValidationMode};
use crate::model::relationship::Relationship;
use crate::model::system::{ClassDefinition, System};

/// What happened when an entity was added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOutcome {
    Added,
    Updated,
}

/// What happened when a relationship was added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipOutcome {
    Inserted,
    Accumulated,
}

/// Counters reported by [`Graph::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphMergeStats {
    pub entities_added: usize,
    pub entities_updated: usize,
    pub relationships_added: usize,
    pub relationships_updated: usize,
    pub relationships_skipped: usize,
}

/// The in-memory typed multigraph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    entities: HashMap<String, Entity>,
    class_nodes: HashMap<String, ClassNode>,
    relationships: Vec<Relationship>,
    adjacency: HashMap<String, BTreeSet<String>>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    /// Create a graph and inject the System's predefined entities. Injection
    /// failures are warned and skipped; they never abort construction.
    pub fn with_predefined_entities(system: &System) -> Self {
        let mut graph = Graph::new();
        for predefined in &system.predefined_entities {
            let mut entity = Entity::new(&predefined.name, &predefined.description);
            for class_name in &predefined.classes {
                if let Err(e) = entity.add_class(class_name, system) {
                    warn!(entity = %predefined.name, error = %e, "skipping predefined class");
                }
            }
            if let Err(e) = graph.add_entity(entity, system, ValidationMode::Lenient) {
                warn!(entity = %predefined.name, error = %e, "predefined entity injection failed");
            }
        }
        graph
    }

    // -------------------------------------------------------------------
    // Entities
    // -------------------------------------------------------------------

    /// Add an entity, or fold it into the existing entity with the same
    /// (case-insensitive) name: the description is merged, class memberships
    /// unioned, and per-class properties unioned with later writes
    /// overwriting empty earlier values. Class-instance nodes are
    /// materialized for every class the entity carries.
    pub fn add_entity(
        &mut self,
        mut entity: Entity,
        system: &System,
        mode: ValidationMode,
    ) -> GraphResult<EntityOutcome> {
        entity.validate(system, mode)?;
        let key = entity.key();

        if let Some(existing) = self.entities.get_mut(&key) {
            debug!(entity = %entity.name, "updating existing entity");
            existing.update_description(&entity.description);
            for instance in entity.classes {
                if let Some(current) = existing.class_instance_mut(&instance.class_name) {
                    for (prop, value) in instance.properties {
                        current.set_property(&prop, value);
                    }
                } else {
                    match existing.add_class(&instance.class_name, system) {
                        Ok(()) => {
                            if let Some(current) =
                                existing.class_instance_mut(&instance.class_name)
                            {
                                for (prop, value) in instance.properties {
                                    current.set_property(&prop, value);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(
                                entity = %existing.name,
                                class = %instance.class_name,
                                error = %e,
                                "skipping invalid class while merging entity"
                            );
                            continue;
                        }
                    }
                }
            }
            let name = existing.name.clone();
            let class_names: Vec<String> =
                existing.class_names().iter().map(|s| (*s).to_string()).collect();
            for class_name in class_names {
                self.materialize_class_node(&name, &class_name, system);
            }
            Ok(EntityOutcome::Updated)
        } else {
            debug!(entity = %entity.name, classes = ?entity.class_names(), "adding new entity");
            let name = entity.name.clone();
            let class_names: Vec<String> =
                entity.class_names().iter().map(|s| (*s).to_string()).collect();
            self.entities.insert(key, entity);
            for class_name in class_names {
                self.materialize_class_node(&name, &class_name, system);
            }
            Ok(EntityOutcome::Added)
        }
    }

    fn materialize_class_node(&mut self, entity_name: &str, class_name: &str, system: &System) {
        let description = system
            .class(class_name)
            .and_then(|def| def.description.clone())
            .or_else(|| Some(format!("{class_name} facet of {entity_name}")));
        let node = ClassNode::new(entity_name, class_name, description);
        self.class_nodes.insert(node.key(), node);
    }

    pub fn get_entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(&name.to_uppercase())
    }

    pub fn get_entity_mut(&mut self, name: &str) -> Option<&mut Entity> {
        self.entities.get_mut(&name.to_uppercase())
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // -------------------------------------------------------------------
    // Class-instance and class-master nodes
    // -------------------------------------------------------------------

    pub fn class_node(&self, entity_name: &str, class_name: &str) -> Option<&ClassNode> {
        self.class_nodes
            .get(&format!("{entity_name}:{class_name}").to_uppercase())
    }

    pub fn class_node_by_id(&self, node_id: &str) -> Option<&ClassNode> {
        self.class_nodes.get(&node_id.to_uppercase())
    }

    /// Class-instance nodes, optionally restricted to one entity.
    pub fn class_nodes(&self, entity_name: Option<&str>) -> Vec<&ClassNode> {
        match entity_name {
            None => self.class_nodes.values().collect(),
            Some(name) => {
                let key = name.to_uppercase();
                self.class_nodes
                    .values()
                    .filter(|n| n.entity_name.to_uppercase() == key)
                    .collect()
            }
        }
    }

    pub fn class_node_count(&self) -> usize {
        self.class_nodes.len()
    }

    /// Synthesize the class-master node for a class, if it is defined.
    pub fn class_master_node(&self, system: &System, class_name: &str) -> Option<ClassMasterNode> {
        system.class(class_name).map(|def| ClassMasterNode {
            class_name: def.name.clone(),
            description: def.description.clone(),
        })
    }

    /// Synthesize all class-master nodes from the System.
    pub fn class_master_nodes(&self, system: &System) -> Vec<ClassMasterNode> {
        system
            .class_names()
            .iter()
            .filter_map(|name| self.class_master_node(system, name))
            .collect()
    }

    /// Whether the identifier names any node kind: an entity, a
    /// class-instance node, or a class defined in the System.
    pub fn node_exists(&self, node_id: &str, system: &System) -> bool {
        let key = node_id.to_uppercase();
        self.entities.contains_key(&key)
            || self.class_nodes.contains_key(&key)
            || system.has_class(node_id)
    }

    // -------------------------------------------------------------------
    // Relationships
    // -------------------------------------------------------------------

    /// Add a relationship. Both endpoints must exist as some node kind. If a
    /// relationship with the same identity already exists, its count is
    /// incremented by the incoming count and new semantic times appended;
    /// no other identity key accumulates counts.
    pub fn add_relationship(
        &mut self,
        relationship: Relationship,
        system: &System,
    ) -> GraphResult<RelationshipOutcome> {
        if !self.node_exists(&relationship.source, system) {
            return Err(GraphError::MissingEndpoint(relationship.source));
        }
        if !self.node_exists(&relationship.target, system) {
            return Err(GraphError::MissingEndpoint(relationship.target));
        }

        if let Some(existing) = self
            .relationships
            .iter_mut()
            .find(|r| r.same_identity(&relationship))
        {
            debug!(
                source = %relationship.source,
                target = %relationship.target,
                additional = relationship.count,
                count = existing.count,
                "accumulating existing relationship"
            );
            existing.accumulate(relationship.count, &relationship.semantic_times);
            return Ok(RelationshipOutcome::Accumulated);
        }

        debug!(
            source = %relationship.source,
            target = %relationship.target,
            count = relationship.count,
            "adding new relationship"
        );
        let source_key = relationship.source.to_uppercase();
        let target_key = relationship.target.to_uppercase();
        self.adjacency
            .entry(source_key.clone())
            .or_default()
            .insert(target_key.clone());
        self.adjacency.entry(target_key).or_default().insert(source_key);
        self.relationships.push(relationship);
        Ok(RelationshipOutcome::Inserted)
    }

    /// Find the relationship with the given identity and add `amount` to its
    /// count, appending the semantic times. Returns false when no
    /// relationship matches.
    pub fn increment_relationship(
        &mut self,
        source: &str,
        target: &str,
        description: &str,
        refer: &[String],
        amount: u32,
        semantic_times: &[String],
    ) -> bool {
        match self
            .relationships
            .iter_mut()
            .find(|r| r.matches(source, target, description, refer))
        {
            Some(existing) => {
                debug!(
                    source, target, amount,
                    count = existing.count,
                    "increment_count matched existing relationship"
                );
                existing.accumulate(amount, semantic_times);
                true
            }
            None => false,
        }
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    /// Relationships, optionally restricted to those touching one node.
    pub fn get_relationships(&self, node_id: Option<&str>) -> Vec<&Relationship> {
        match node_id {
            None => self.relationships.iter().collect(),
            Some(id) => {
                let key = id.to_uppercase();
                self.relationships
                    .iter()
                    .filter(|r| {
                        r.source.to_uppercase() == key || r.target.to_uppercase() == key
                    })
                    .collect()
            }
        }
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    /// Node ids adjacent to the given node.
    pub fn neighbors(&self, node_id: &str) -> Vec<String> {
        self.adjacency
            .get(&node_id.to_uppercase())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------
    // Merge
    // -------------------------------------------------------------------

    /// Merge another graph into this one. Entities are folded with
    /// [`Graph::add_entity`]; relationships whose endpoints are missing are
    /// skipped with a warning.
    pub fn merge(&mut self, other: Graph, system: &System) -> GraphMergeStats {
        let mut stats = GraphMergeStats::default();
        for entity in other.entities.into_values() {
            match self.add_entity(entity, system, ValidationMode::Lenient) {
                Ok(EntityOutcome::Added) => stats.entities_added += 1,
                Ok(EntityOutcome::Updated) => stats.entities_updated += 1,
                Err(e) => warn!(error = %e, "skipping entity during graph merge"),
            }
        }
        for relationship in other.relationships {
            match self.add_relationship(relationship, system) {
                Ok(RelationshipOutcome::Inserted) => stats.relationships_added += 1,
                Ok(RelationshipOutcome::Accumulated) => stats.relationships_updated += 1,
                Err(e) => {
                    stats.relationships_skipped += 1;
                    debug!(error = %e, "skipping relationship during graph merge");
                }
            }
        }
        stats
    }

    // -------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------

    /// Write a binary snapshot of the System and this graph.
    pub fn save(&self, path: &Path, system: &System) -> GraphResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let snapshot = GraphSnapshot {
            system: Some(system.clone()),
            class_definitions: None,
            entities: self.entities.values().cloned().collect(),
            class_nodes: self.class_nodes.values().cloned().collect(),
            relationships: self
                .relationships
                .iter()
                .map(RelationshipRecord::from_relationship)
                .collect(),
        };
        let bytes = bincode::serialize(&snapshot)?;
        fs::write(path, bytes)?;
        debug!(path = %path.display(), entities = self.entity_count(), "graph snapshot written");
        Ok(())
    }

    /// Load a snapshot, reconstructing the System and the graph.
    pub fn load(path: &Path) -> GraphResult<(System, Graph)> {
        let bytes = fs::read(path)?;
        let snapshot: GraphSnapshot = bincode::deserialize(&bytes)?;
        Ok(Self::from_snapshot(snapshot))
    }

    fn from_snapshot(snapshot: GraphSnapshot) -> (System, Graph) {
        // Newer snapshots carry the full System; older ones only a bare
        // class_definitions map to rebuild it from.
        let system = match snapshot.system {
            Some(system) => system,
            None => match snapshot.class_definitions {
                Some(classes) => {
                    debug!(classes = classes.len(), "rebuilding system from legacy class map");
                    System::from_class_definitions(classes)
                }
                None => System::new(),
            },
        };

        let mut graph = Graph::new();
        for entity in snapshot.entities {
            let name = entity.name.clone();
            let class_names: Vec<String> =
                entity.class_names().iter().map(|s| (*s).to_string()).collect();
            graph.entities.insert(entity.key(), entity);
            for class_name in class_names {
                graph.materialize_class_node(&name, &class_name, &system);
            }
        }
        // Stored class nodes win over the materialized defaults.
        for node in snapshot.class_nodes {
            graph.class_nodes.insert(node.key(), node);
        }
        for record in snapshot.relationships {
            let relationship = record.into_relationship();
            let source_key = relationship.source.to_uppercase();
            let target_key = relationship.target.to_uppercase();
            graph
                .adjacency
                .entry(source_key.clone())
                .or_default()
                .insert(target_key.clone());
            graph
                .adjacency
                .entry(target_key)
                .or_default()
                .insert(source_key);
            graph.relationships.push(relationship);
        }
        (system, graph)
    }
}

/// On-disk relationship record. `count` is optional so snapshots written by
/// builds that still used the legacy `strength` field keep loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RelationshipRecord {
    pub source: String,
    pub target: String,
    pub description: String,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub strength: Option<u32>,
    #[serde(default)]
    pub refer: Vec<String>,
    #[serde(default)]
    pub semantic_times: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RelationshipRecord {
    fn from_relationship(rel: &Relationship) -> Self {
        RelationshipRecord {
            source: rel.source.clone(),
            target: rel.target.clone(),
            description: rel.description.clone(),
            count: Some(rel.count),
            strength: None,
            refer: rel.refer.clone(),
            semantic_times: rel.semantic_times.clone(),
            created_at: Some(rel.created_at),
            updated_at: Some(rel.updated_at),
        }
    }

    fn into_relationship(self) -> Relationship {
        let now = Utc::now();
        Relationship {
            count: self.count.or(self.strength).unwrap_or(1).max(1),
            source: self.source,
            target: self.target,
            description: self.description,
            refer: self.refer,
            semantic_times: self.semantic_times,
            created_at: self.created_at.unwrap_or(now),
            updated_at: self.updated_at.unwrap_or(now),
        }
    }
}

/// On-disk snapshot of a whole database: the System plus the graph content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GraphSnapshot {
    #[serde(default)]
    pub system: Option<System>,
    /// Legacy snapshots carry only the bare class map
    #[serde(default)]
    pub class_definitions: Option<HashMap<String, ClassDefinition>>,
    pub entities: Vec<Entity>,
    pub class_nodes: Vec<ClassNode>,
    pub relationships: Vec<RelationshipRecord>,
}
