//! # GraphLoom
//!
//! An incremental typed knowledge graph engine. Free-form text goes in; a
//! canonical graph of classed entities and counted relationships comes out.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! submit(text)
//!     ↓
//! [extract queue] ── N extract workers, each task on its own System snapshot
//!     ↓                 system update → entity/relationship extraction
//! GraphDelta
//!     ↓
//! [merge queue]  ── exactly one merge worker (strictly serial)
//!     ↓                 smart-merge consult → combiner → canonical graph
//! [save queue]   ── saver worker: re-verify task, snapshot graph to disk
//!     ↓
//! progress events (callback + SSE broadcast)
//! ```
//!
//! The extract phase is embarrassingly parallel because every task works on
//! a deep copy of the System taken at submission. The merge phase is
//! serialized by construction: one worker, one write lock, applied in queue
//! order. Auto-save runs on its own queue after the `completed` event, so
//! the snapshot on disk always reflects a fully-applied merge.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use graphloom::{Config, GraphEngine, HttpCompletion, PromptLibrary, System};
//! use std::sync::Arc;
//!
//! let config = Config::load()?;
//! let completion = Arc::new(HttpCompletion::new(base_url, model, api_key));
//! let prompts = PromptLibrary::load(&config.prompts.dir);
//!
//! let engine = GraphEngine::new(config, completion, prompts, None, System::new());
//! engine.start();
//!
//! let task_id = engine.submit_task("the user opens wechat on their phone").await?;
//! ```

// Data model
pub mod model;

// Configuration system
pub mod config;

// Error envelope
pub mod error;

// Completion-service seam (trait + HTTP client + prompt templates)
pub mod llm;

// Pipeline stages
pub mod combiner;
pub mod extractor;
pub mod merger;
pub mod updater;

// Keyword search and one-hop views
pub mod search;

// The coordinator and its workers
pub mod engine;

// HTTP surface
pub mod rest;

// Re-export the public API surface
pub use config::Config;
pub use engine::pipeline::{ProgressCallback, ProgressEvent, ProgressStep};
pub use engine::{GraphEngine, TaskDeltaView, TaskStagesView};
pub use error::{ErrorKind, GraphError, GraphResult};
pub use llm::{CompletionService, HttpCompletion, PromptLibrary, PromptTemplate};
pub use merger::{MergeResult, SmartMerger};
pub use model::{
    ClassDefinition, ClassDelta, ClassInstance, ClassMasterNode, ClassNode, ClassOp, Entity,
    EntityDelta, EntityOp, Graph, GraphDelta, PredefinedEntity, ProgressData, PropertyDefinition,
    PropertyDelta, Relationship, RelationshipDelta, RelationshipOp, System, Task, TaskStatus,
    TaskView, ValidationMode,
};
pub use search::{
    ClassNodeGroup, EntityNodeGroup, NodeDetail, SearchEngine, SearchResult, SearchResultType,
};
