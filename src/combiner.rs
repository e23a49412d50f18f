//! Combiner - applies an optimized delta to the canonical state
//!
//! Classes go to the System (additive), entities are rebuilt and folded into
//! the graph, relationships are added with identity-key accumulation.
//! `increment_count` records scan the existing relationships for a
//! case-insensitive identity match: on a hit the count is bumped and the
//! semantic times appended; on a miss a fresh relationship is created whose
//! initial count is the increment amount and the `not_found` counter ticks.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::GraphResult;
use crate::model::{
    ClassDefinition, Entity, EntityOutcome, Graph, GraphDelta, PropertyDefinition, Relationship,
    RelationshipOp, RelationshipOutcome, System, ValidationMode,
};

/// Aggregate counters for one delta application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CombineStats {
    pub entities_added: usize,
    pub entities_updated: usize,
    pub relationships_added: usize,
    pub relationships_updated: usize,
    pub relationships_skipped: usize,
    pub increments_applied: usize,
    pub increments_not_found: usize,
}

/// Applies deltas to the canonical System and Graph.
pub struct Combiner {
    mode: ValidationMode,
}

impl Combiner {
    pub fn new(strict_validation: bool) -> Self {
        Combiner {
            mode: if strict_validation {
                ValidationMode::Strict
            } else {
                ValidationMode::Lenient
            },
        }
    }

    /// Apply every record of the delta.
    pub fn apply(
        &self,
        system: &mut System,
        graph: &mut Graph,
        delta: &GraphDelta,
    ) -> GraphResult<CombineStats> {
        let mut stats = CombineStats::default();

        for class_delta in &delta.classes {
            let mut class_def = ClassDefinition::new(class_delta.name.clone());
            class_def.description = class_delta.description.clone();
            for prop in &class_delta.properties {
                class_def.properties.push(PropertyDefinition {
                    name: prop.name.clone(),
                    description: prop.description.clone(),
                    required: prop.required.unwrap_or(false),
                    value_required: prop.value_required.unwrap_or(false),
                });
            }
            system.add_class_definition(class_def);
        }

        for entity_delta in &delta.entities {
            let mut entity = Entity::new(
                entity_delta.canonical_name(),
                entity_delta.description.clone().unwrap_or_default(),
            );
            for class_name in &entity_delta.classes {
                if let Err(e) = entity.add_class(class_name, system) {
                    warn!(
                        entity = %entity.name,
                        class = %class_name,
                        error = %e,
                        "skipping class while rebuilding entity"
                    );
                    continue;
                }
                if let Some(class_props) = entity_delta.properties.get(class_name) {
                    for (prop_name, value) in class_props {
                        if let Err(e) = entity.set_property(
                            class_name,
                            prop_name,
                            Some(value.clone()),
                            system,
                        ) {
                            warn!(
                                entity = %entity.name,
                                class = %class_name,
                                property = %prop_name,
                                error = %e,
                                "property set failed"
                            );
                        }
                    }
                }
            }
            match graph.add_entity(entity, system, self.mode)? {
                EntityOutcome::Added => stats.entities_added += 1,
                EntityOutcome::Updated => stats.entities_updated += 1,
            }
        }

        for rel_delta in &delta.relationships {
            match &rel_delta.operation {
                RelationshipOp::IncrementCount { increment_amount } => {
                    if graph.increment_relationship(
                        &rel_delta.source,
                        &rel_delta.target,
                        &rel_delta.description,
                        &rel_delta.refer,
                        *increment_amount,
                        &rel_delta.semantic_times,
                    ) {
                        stats.increments_applied += 1;
                    } else {
                        warn!(
                            source = %rel_delta.source,
                            target = %rel_delta.target,
                            description = %rel_delta.description,
                            "increment_count found no matching relationship, inserting fresh"
                        );
                        stats.increments_not_found += 1;
                        let relationship = Relationship::new(
                            &rel_delta.source,
                            &rel_delta.target,
                            &rel_delta.description,
                            *increment_amount,
                        )
                        .with_refer(rel_delta.refer.clone())
                        .with_semantic_times(rel_delta.semantic_times.clone());
                        match graph.add_relationship(relationship, system) {
                            Ok(RelationshipOutcome::Inserted) => stats.relationships_added += 1,
                            Ok(RelationshipOutcome::Accumulated) => {
                                stats.relationships_updated += 1;
                            }
                            Err(e) => {
                                stats.relationships_skipped += 1;
                                warn!(error = %e, "skipping relationship with missing endpoint");
                            }
                        }
                    }
                }
                RelationshipOp::Add | RelationshipOp::Update | RelationshipOp::Merge => {
                    let relationship = Relationship::new(
                        &rel_delta.source,
                        &rel_delta.target,
                        &rel_delta.description,
                        rel_delta.count,
                    )
                    .with_refer(rel_delta.refer.clone())
                    .with_semantic_times(rel_delta.semantic_times.clone());
                    match graph.add_relationship(relationship, system) {
                        Ok(RelationshipOutcome::Inserted) => stats.relationships_added += 1,
                        Ok(RelationshipOutcome::Accumulated) => stats.relationships_updated += 1,
                        Err(e) => {
                            stats.relationships_skipped += 1;
                            warn!(error = %e, "skipping relationship with missing endpoint");
                        }
                    }
                }
            }
        }

        if stats.increments_applied > 0 || stats.increments_not_found > 0 {
            info!(
                applied = stats.increments_applied,
                not_found = stats.increments_not_found,
                "increment_count records processed"
            );
        }
        debug!(?stats, "delta applied");
        Ok(stats)
    }
}
