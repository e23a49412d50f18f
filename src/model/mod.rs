//! Data model: the type catalog, graph content, change deltas, and tasks.

pub mod delta;
pub mod entity;
pub mod graph;
pub mod relationship;
pub mod system;
pub mod task;

pub use delta::{
    ClassDelta, ClassOp, EntityDelta, EntityOp, GraphDelta, PropertyDelta, RelationshipDelta,
    RelationshipOp,
};
pub use entity::{ClassInstance, ClassMasterNode, ClassNode, Entity, ValidationMode};
pub use graph::{EntityOutcome, Graph, GraphMergeStats, RelationshipOutcome};
pub use relationship::Relationship;
pub use system::{
    CatalogChange, ClassDefinition, PredefinedEntity, PropertyDefinition, System,
};
pub use task::{
    generate_task_id, ProgressData, ProgressView, StageRecord, Task, TaskStatus, TaskView,
};
