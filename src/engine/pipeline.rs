//! Task pipeline - progress events and the worker loops
//!
//! Three kinds of workers drain three queues:
//!
//! - a pool of extract workers shares the extract queue; each task runs
//!   system-update and extraction against its private System snapshot and
//!   produces a [`GraphDelta`]
//! - exactly one merge worker drains the merge queue, so merges are
//!   serialized by construction and the canonical state is mutated only here
//! - one saver worker drains the auto-save queue; the merge worker emits
//!   `completed` and enqueues the task id, the saver re-verifies the task
//!   status and snapshots the graph, so the snapshot on disk always reflects
//!   a fully-applied merge before `auto_save` is observed
//!
//! Progress events are delivered synchronously to the registered callback
//! and fanned out on a broadcast channel for the SSE stream.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::combiner::Combiner;
use crate::config::{ExtractionConfig, PipelineConfig};
use crate::error::{GraphError, GraphResult};
use crate::extractor::GraphExtractor;
use crate::llm::{CompletionService, PromptLibrary};
use crate::merger::SmartMerger;
use crate::model::{
    ClassDelta, ClassOp, EntityDelta, EntityOp, GraphDelta, PropertyDelta, ProgressData,
    RelationshipDelta, RelationshipOp, StageRecord, System, Task, TaskStatus, Graph,
};
use crate::updater::{SystemUpdate, SystemUpdater};

/// Pipeline steps observable through the progress callback, in per-task
/// order: `task_submitted - started - system_update - extraction -
/// extraction_completed - merging - completed`, with `cancelled`, `failed`,
/// and `merge_failed` as early terminals and `auto_save` / `auto_save_error`
/// trailing a completed merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    TaskSubmitted,
    Started,
    SystemUpdate,
    Extraction,
    ExtractionCompleted,
    Merging,
    Completed,
    Cancelled,
    Failed,
    MergeFailed,
    AutoSave,
    AutoSaveError,
}

impl ProgressStep {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStep::TaskSubmitted => "task_submitted",
            ProgressStep::Started => "started",
            ProgressStep::SystemUpdate => "system_update",
            ProgressStep::Extraction => "extraction",
            ProgressStep::ExtractionCompleted => "extraction_completed",
            ProgressStep::Merging => "merging",
            ProgressStep::Completed => "completed",
            ProgressStep::Cancelled => "cancelled",
            ProgressStep::Failed => "failed",
            ProgressStep::MergeFailed => "merge_failed",
            ProgressStep::AutoSave => "auto_save",
            ProgressStep::AutoSaveError => "auto_save_error",
        }
    }
}

/// One progress notification, as carried on the broadcast stream.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub step: ProgressStep,
    pub message: String,
    pub percentage: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// User-supplied progress callback, invoked synchronously from inside the
/// pipeline: `(task_id, step, data)`.
pub type ProgressCallback = Arc<dyn Fn(&str, ProgressStep, &ProgressData) + Send + Sync>;

/// Fans progress out to the callback and the broadcast stream.
pub(crate) struct ProgressSink {
    pub callback: Option<ProgressCallback>,
    pub events: broadcast::Sender<ProgressEvent>,
}

impl ProgressSink {
    pub fn emit(&self, task: Option<&Task>, task_id: &str, step: ProgressStep, data: ProgressData) {
        if let Some(task) = task {
            task.set_progress(step.as_str(), data.clone());
        }
        if let Some(callback) = &self.callback {
            callback(task_id, step, &data);
        }
        let _ = self.events.send(ProgressEvent {
            task_id: task_id.to_string(),
            step,
            message: data.message,
            percentage: data.percentage,
            result: data.result,
            timestamp: Utc::now(),
        });
    }
}

/// The canonical state: one System and one Graph, mutated only under the
/// write half of the lock (merge worker and explicit management calls).
pub struct Knowledge {
    pub system: System,
    pub graph: Graph,
}

/// State shared by the engine handle and every worker.
pub(crate) struct PipelineShared {
    pub pipeline: PipelineConfig,
    pub extraction: ExtractionConfig,
    pub temperature: f32,
    pub completion: Arc<dyn CompletionService>,
    pub prompts: PromptLibrary,
    pub merger: SmartMerger,
    pub combiner: Combiner,
    pub knowledge: RwLock<Knowledge>,
    pub tasks: DashMap<String, Arc<Task>>,
    pub merge_tx: mpsc::UnboundedSender<Arc<Task>>,
    pub save_tx: mpsc::UnboundedSender<String>,
    pub sink: ProgressSink,
    pub auto_save: AtomicBool,
    pub database_path: parking_lot::RwLock<PathBuf>,
}

impl PipelineShared {
    fn check_cancelled(task: &Task) -> GraphResult<()> {
        if task.cancel_requested() {
            Err(GraphError::Cancelled(task.task_id.clone()))
        } else {
            Ok(())
        }
    }
}

// ----------------------------------------------------------------------
// Extract workers
// ----------------------------------------------------------------------

/// Extract worker loop. The receiver is shared by the pool; whichever
/// worker grabs the lock first takes the next task.
pub(crate) async fn extract_worker(
    shared: Arc<PipelineShared>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Arc<Task>>>>,
    mut shutdown: watch::Receiver<bool>,
    worker_id: usize,
) {
    info!(worker_id, "extract worker started");
    loop {
        let task = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = shutdown.changed() => None,
                task = guard.recv() => task,
            }
        };
        let Some(task) = task else { break };
        debug!(worker_id, task_id = %task.task_id, "extract worker picked up task");
        process_extraction(&shared, &task).await;
    }
    info!(worker_id, "extract worker stopped");
}

async fn process_extraction(shared: &Arc<PipelineShared>, task: &Arc<Task>) {
    task.mark_running();
    shared.sink.emit(
        Some(task.as_ref()),
        &task.task_id,
        ProgressStep::Started,
        ProgressData::new("task started", 5),
    );

    match run_extraction(shared, task).await {
        Ok(delta) => {
            let summary = delta.summary();
            task.complete_extraction(delta);
            shared.sink.emit(
                Some(task.as_ref()),
                &task.task_id,
                ProgressStep::ExtractionCompleted,
                ProgressData::new("extraction finished, waiting for merge", 90)
                    .with_result(json!({ "summary": summary })),
            );
            if shared.merge_tx.send(Arc::clone(task)).is_err() {
                warn!(task_id = %task.task_id, "merge queue closed, task will not merge");
            }
        }
        Err(GraphError::Cancelled(_)) => {
            task.mark_cancelled();
            shared.sink.emit(
                Some(task.as_ref()),
                &task.task_id,
                ProgressStep::Cancelled,
                ProgressData::new("task cancelled", 0),
            );
            info!(task_id = %task.task_id, "task cancelled during extraction");
        }
        Err(e) => {
            task.mark_failed(e.to_string());
            shared.sink.emit(
                Some(task.as_ref()),
                &task.task_id,
                ProgressStep::Failed,
                ProgressData::new(format!("task failed: {e}"), 0),
            );
            error!(task_id = %task.task_id, error = %e, "extraction failed");
        }
    }
}

/// The extract phase of one task, run entirely against the task's private
/// System snapshot. Cancellation is honored at every stage boundary.
async fn run_extraction(shared: &Arc<PipelineShared>, task: &Arc<Task>) -> GraphResult<GraphDelta> {
    PipelineShared::check_cancelled(task)?;

    let mut system = task
        .take_system_snapshot()
        .ok_or_else(|| GraphError::Internal("task has no system snapshot".to_string()))?;

    // Stage 1: system update
    shared.sink.emit(
        Some(task.as_ref()),
        &task.task_id,
        ProgressStep::SystemUpdate,
        ProgressData::new("analyzing text and updating the class catalog", 10),
    );
    let update_input = json!({
        "input_text": task.input_text,
        "existing_classes": system.class_names(),
        "classes_count": system.class_count(),
    });

    let updater = SystemUpdater::new(
        shared.completion.as_ref(),
        shared.prompts.system_update.as_ref(),
    );
    let update = updater.check_and_update(&mut system, &task.input_text).await;

    let update_result = system_update_result(&system, &update);
    task.record_stage(
        "system_update",
        StageRecord {
            input: Some(update_input),
            output: Some(update_result.clone()),
            result: Some(update_result.clone()),
            llm_response: update.raw_response.clone(),
            ..StageRecord::default()
        },
    );
    shared.sink.emit(
        Some(task.as_ref()),
        &task.task_id,
        ProgressStep::SystemUpdate,
        ProgressData::new("class catalog update finished", 30).with_result(update_result),
    );

    let mut delta = GraphDelta::new(task.task_id.clone());
    delta.classes = class_deltas(&system, &update);

    PipelineShared::check_cancelled(task)?;

    // Stage 2: entity and relationship extraction
    shared.sink.emit(
        Some(task.as_ref()),
        &task.task_id,
        ProgressStep::Extraction,
        ProgressData::new("extracting entities and relationships", 50),
    );
    let extraction_input = json!({
        "input_text": task.input_text,
        "available_classes": system.class_names(),
    });

    let extract_template = shared
        .prompts
        .extract_graph
        .as_ref()
        .ok_or_else(|| GraphError::Internal("no extraction prompt configured".to_string()))?;
    let extractor = GraphExtractor::new(
        shared.completion.as_ref(),
        extract_template,
        shared.prompts.check_extraction.as_ref(),
        &shared.extraction,
        shared.temperature,
    );
    let extraction = extractor.extract(&mut system, &task.input_text).await?;

    let extraction_result = extraction_summary(&extraction);
    task.record_stage(
        "extraction",
        StageRecord {
            input: Some(extraction_input),
            output: Some(extraction_result.clone()),
            result: Some(extraction_result.clone()),
            llm_response: Some(extraction.raw_response.clone()),
            ..StageRecord::default()
        },
    );
    shared.sink.emit(
        Some(task.as_ref()),
        &task.task_id,
        ProgressStep::Extraction,
        ProgressData::new("extraction finished", 80).with_result(extraction_result),
    );

    for entity in &extraction.entities {
        let mut properties = std::collections::BTreeMap::new();
        for instance in &entity.classes {
            let values: std::collections::BTreeMap<String, String> = instance
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
                .collect();
            if !values.is_empty() {
                properties.insert(instance.class_name.clone(), values);
            }
        }
        delta.entities.push(EntityDelta {
            name: entity.name.clone(),
            description: Some(entity.description.clone()),
            classes: entity.class_names().iter().map(|s| (*s).to_string()).collect(),
            properties,
            operation: EntityOp::Add,
        });
    }
    for relationship in &extraction.relationships {
        delta.relationships.push(RelationshipDelta {
            source: relationship.source.clone(),
            target: relationship.target.clone(),
            description: relationship.description.clone(),
            count: relationship.count,
            refer: relationship.refer.clone(),
            semantic_times: relationship.semantic_times.clone(),
            operation: RelationshipOp::Add,
        });
    }

    PipelineShared::check_cancelled(task)?;

    delta.metadata = json!({
        "input_text": task.input_text.chars().take(200).collect::<String>(),
        "entities_count": delta.entities.len(),
        "relationships_count": delta.relationships.len(),
        "classes_added": delta
            .classes
            .iter()
            .filter(|c| c.operation == ClassOp::Add)
            .count(),
    })
    .as_object()
    .cloned()
    .unwrap_or_default();

    info!(task_id = %task.task_id, summary = %delta.summary(), "extraction produced delta");
    Ok(delta)
}

fn class_detail(system: &System, names: &[String]) -> Vec<Value> {
    names
        .iter()
        .filter_map(|name| system.class(name))
        .map(|def| {
            json!({
                "name": def.name,
                "description": def.description,
                "properties": def.property_names(),
            })
        })
        .collect()
}

fn system_update_result(system: &System, update: &SystemUpdate) -> Value {
    json!({
        "needed": update.needed,
        "added_classes": update.added_classes,
        "enhanced_classes": update.enhanced_classes,
        "added_classes_detail": class_detail(system, &update.added_classes),
        "enhanced_classes_detail": class_detail(system, &update.enhanced_classes),
        "total_classes_in_system": system.class_count(),
        "details": update.details,
    })
}

fn extraction_summary(extraction: &crate::extractor::Extraction) -> Value {
    let entities: Vec<Value> = extraction
        .entities
        .iter()
        .map(|e| {
            json!({
                "name": e.name,
                "description": e.description,
                "classes": e.class_names(),
            })
        })
        .collect();
    let relationships: Vec<Value> = extraction
        .relationships
        .iter()
        .map(|r| {
            json!({
                "source": r.source,
                "target": r.target,
                "description": r.description,
                "count": r.count,
            })
        })
        .collect();
    json!({
        "entities_count": extraction.entities.len(),
        "relationships_count": extraction.relationships.len(),
        "entities": entities,
        "relationships": relationships,
    })
}

fn class_deltas(system: &System, update: &SystemUpdate) -> Vec<ClassDelta> {
    let mut deltas = Vec::new();
    let mut push = |names: &[String], operation: ClassOp| {
        for name in names {
            let Some(def) = system.class(name) else { continue };
            deltas.push(ClassDelta {
                name: def.name.clone(),
                description: def.description.clone(),
                properties: def
                    .properties
                    .iter()
                    .map(|p| PropertyDelta {
                        name: p.name.clone(),
                        description: p.description.clone(),
                        required: Some(p.required),
                        value_required: Some(p.value_required),
                    })
                    .collect(),
                operation: operation.clone(),
            });
        }
    };
    push(&update.added_classes, ClassOp::Add);
    push(&update.enhanced_classes, ClassOp::Update);
    deltas
}

// ----------------------------------------------------------------------
// Merge worker (single)
// ----------------------------------------------------------------------

/// The single merge worker. Canonical state is mutated only here (and by
/// explicit management calls sharing the same lock), so merges are strictly
/// serialized in queue order.
pub(crate) async fn merge_worker(
    shared: Arc<PipelineShared>,
    mut rx: mpsc::UnboundedReceiver<Arc<Task>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("merge worker started");
    loop {
        let task = tokio::select! {
            _ = shutdown.changed() => None,
            task = rx.recv() => task,
        };
        let Some(task) = task else { break };
        process_merge(&shared, &task).await;
    }
    info!("merge worker stopped");
}

async fn process_merge(shared: &Arc<PipelineShared>, task: &Arc<Task>) {
    shared.sink.emit(
        Some(task.as_ref()),
        &task.task_id,
        ProgressStep::Merging,
        ProgressData::new("merging into the canonical graph", 95),
    );

    match run_merge(shared, task).await {
        Ok(()) => {
            shared.sink.emit(
                Some(task.as_ref()),
                &task.task_id,
                ProgressStep::Completed,
                ProgressData::new("task completed and merged", 100),
            );
            info!(task_id = %task.task_id, "merge completed");
            if shared.auto_save.load(Ordering::SeqCst)
                && shared.save_tx.send(task.task_id.clone()).is_err()
            {
                warn!("auto-save queue closed");
            }
        }
        Err(e) => {
            task.mark_failed(e.to_string());
            shared.sink.emit(
                Some(task.as_ref()),
                &task.task_id,
                ProgressStep::MergeFailed,
                ProgressData::new(format!("merge failed: {e}"), 95),
            );
            error!(task_id = %task.task_id, error = %e, "merge failed");
        }
    }
}

async fn run_merge(shared: &Arc<PipelineShared>, task: &Arc<Task>) -> GraphResult<()> {
    let Some(delta) = task.result_delta() else {
        debug!(task_id = %task.task_id, "task carries no delta, skipping merge");
        return Ok(());
    };
    if delta.is_empty() {
        debug!(task_id = %task.task_id, "delta is empty, skipping merge");
        return Ok(());
    }

    let merge_input = {
        let knowledge = shared.knowledge.read().await;
        json!({
            "delta_summary": delta.summary(),
            "enable_smart_merge": shared.merger.is_enabled(),
            "current_state": {
                "system_classes": knowledge.system.class_count(),
                "graph_entities": knowledge.graph.entity_count(),
                "graph_relationships": knowledge.graph.relationship_count(),
            },
        })
    };

    // Prepare under the read lock, consult lock-free, apply under the write
    // lock. The single merge worker keeps merges serialized regardless.
    let inputs = {
        let knowledge = shared.knowledge.read().await;
        shared.merger.prepare(&knowledge.system, &knowledge.graph, &delta)
    };
    let merge_result = shared.merger.merge(inputs, delta).await;

    let (stats, final_state) = {
        let mut knowledge = shared.knowledge.write().await;
        let Knowledge { system, graph } = &mut *knowledge;
        let stats = shared
            .combiner
            .apply(system, graph, &merge_result.optimized_delta)?;
        let final_state = json!({
            "system_classes": system.class_count(),
            "graph_entities": graph.entity_count(),
            "graph_relationships": graph.relationship_count(),
        });
        (stats, final_state)
    };

    task.record_stage(
        "merging",
        StageRecord {
            input: Some(merge_input),
            output: Some(json!({
                "merge_summary": merge_result.summary(),
                "merge_statistics": {
                    "duplicates_found": merge_result.duplicates_found,
                    "conflicts_resolved": merge_result.conflicts_resolved,
                    "names_aligned": merge_result.names_aligned,
                    "descriptions_optimized": merge_result.descriptions_optimized,
                },
                "merge_notes": merge_result.notes,
                "apply_statistics": stats,
                "final_state": final_state,
            })),
            result: Some(json!({
                "summary": merge_result.summary(),
                "apply_statistics": stats,
            })),
            llm_response: merge_result.llm_response.clone(),
            ..StageRecord::default()
        },
    );
    Ok(())
}

// ----------------------------------------------------------------------
// Saver worker
// ----------------------------------------------------------------------

/// The auto-save worker. Re-verifies that the task really completed before
/// snapshotting, so a merge failure observed after the `completed` event of
/// an earlier task can never publish a half-applied graph.
pub(crate) async fn saver_worker(
    shared: Arc<PipelineShared>,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("auto-save worker started");
    loop {
        let task_id = tokio::select! {
            _ = shutdown.changed() => None,
            task_id = rx.recv() => task_id,
        };
        let Some(task_id) = task_id else { break };
        process_auto_save(&shared, &task_id).await;
    }
    info!("auto-save worker stopped");
}

async fn process_auto_save(shared: &Arc<PipelineShared>, task_id: &str) {
    if !shared.auto_save.load(Ordering::SeqCst) {
        debug!(task_id, "auto-save disabled, skipping");
        return;
    }
    let status = shared.tasks.get(task_id).map(|t| t.status());
    if status != Some(TaskStatus::Completed) {
        warn!(task_id, ?status, "task is not completed, skipping auto-save");
        return;
    }

    let path = shared.database_path.read().clone();
    let result = {
        let knowledge = shared.knowledge.read().await;
        knowledge.graph.save(&path, &knowledge.system)
    };
    match result {
        Ok(()) => {
            let file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            info!(task_id, path = %path.display(), "auto-save finished");
            shared.sink.emit(
                None,
                task_id,
                ProgressStep::AutoSave,
                ProgressData::new("database saved", 100).with_result(json!({
                    "file_path": path.display().to_string(),
                    "file_size": file_size,
                })),
            );
        }
        Err(e) => {
            error!(task_id, error = %e, "auto-save failed");
            shared.sink.emit(
                None,
                task_id,
                ProgressStep::AutoSaveError,
                ProgressData::new(format!("auto-save failed: {e}"), 100),
            );
        }
    }
}
