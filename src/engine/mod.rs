//! GraphEngine - the explicitly-constructed coordinator
//!
//! One engine value owns the whole system: configuration, the completion
//! service, the prompt library, the canonical System + Graph, the task
//! registry, and the three pipeline queues. It is constructed at startup
//! and handed by reference to the request layer; there is no global
//! singleton anywhere.
//!
//! ```text
//! submit -> extract queue -> extract workers (per-task System snapshot)
//!        -> delta -> merge queue -> merge worker (serial) -> canonical graph
//!        -> save queue -> saver worker -> snapshot on disk
//! ```

pub mod pipeline;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::combiner::Combiner;
use crate::config::{Config, DATABASE_EXTENSION};
use crate::error::{GraphError, GraphResult};
use crate::llm::{CompletionService, PromptLibrary};
use crate::merger::SmartMerger;
use crate::model::{
    ClassDefinition, Entity, Graph, GraphDelta, PropertyDefinition, ProgressData, StageRecord,
    System, Task, TaskStatus, TaskView, ValidationMode,
};
use crate::search::{ClassNodeGroup, EntityNodeGroup, NodeDetail, SearchEngine, SearchResult};

use pipeline::{
    extract_worker, merge_worker, saver_worker, Knowledge, PipelineShared, ProgressCallback,
    ProgressEvent, ProgressSink, ProgressStep,
};

/// Capacity of the broadcast ring buffer feeding the SSE stream.
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct PendingReceivers {
    extract_rx: mpsc::UnboundedReceiver<Arc<Task>>,
    merge_rx: mpsc::UnboundedReceiver<Arc<Task>>,
    save_rx: mpsc::UnboundedReceiver<String>,
}

/// The coordinator. See the module docs for the pipeline shape.
pub struct GraphEngine {
    config: Config,
    shared: Arc<PipelineShared>,
    extract_tx: mpsc::UnboundedSender<Arc<Task>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    pending: Mutex<Option<PendingReceivers>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl GraphEngine {
    /// Build an engine around a prepared System. The graph starts from the
    /// System's predefined entities.
    pub fn new(
        config: Config,
        completion: Arc<dyn CompletionService>,
        prompts: PromptLibrary,
        progress_callback: Option<ProgressCallback>,
        system: System,
    ) -> Self {
        let graph = Graph::with_predefined_entities(&system);
        Self::from_parts(config, completion, prompts, progress_callback, system, graph)
    }

    /// Build an engine from a snapshot on disk.
    pub fn load(
        config: Config,
        completion: Arc<dyn CompletionService>,
        prompts: PromptLibrary,
        progress_callback: Option<ProgressCallback>,
        path: &Path,
    ) -> GraphResult<Self> {
        if !path.exists() {
            return Err(GraphError::DatabaseNotFound(path.display().to_string()));
        }
        let (system, graph) = Graph::load(path)?;
        info!(
            path = %path.display(),
            entities = graph.entity_count(),
            relationships = graph.relationship_count(),
            "graph loaded from snapshot"
        );
        Ok(Self::from_parts(
            config,
            completion,
            prompts,
            progress_callback,
            system,
            graph,
        ))
    }

    fn from_parts(
        config: Config,
        completion: Arc<dyn CompletionService>,
        prompts: PromptLibrary,
        progress_callback: Option<ProgressCallback>,
        system: System,
        graph: Graph,
    ) -> Self {
        let (extract_tx, extract_rx) = mpsc::unbounded_channel();
        let (merge_tx, merge_rx) = mpsc::unbounded_channel();
        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let merger = SmartMerger::new(
            Arc::clone(&completion),
            prompts.smart_merge.clone(),
            config.pipeline.enable_smart_merge,
        );
        let shared = Arc::new(PipelineShared {
            pipeline: config.pipeline.clone(),
            extraction: config.extraction.clone(),
            temperature: config.completion.temperature,
            completion,
            prompts,
            merger,
            combiner: Combiner::new(false),
            knowledge: RwLock::new(Knowledge { system, graph }),
            tasks: DashMap::new(),
            merge_tx,
            save_tx,
            sink: ProgressSink {
                callback: progress_callback,
                events,
            },
            auto_save: std::sync::atomic::AtomicBool::new(config.pipeline.auto_save_enabled),
            database_path: parking_lot::RwLock::new(config.default_database_path()),
        });

        GraphEngine {
            config,
            shared,
            extract_tx,
            shutdown_tx,
            shutdown_rx,
            pending: Mutex::new(Some(PendingReceivers {
                extract_rx,
                merge_rx,
                save_rx,
            })),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the extract-worker pool, the single merge worker, and the
    /// saver worker. Idempotent; the second call is a no-op.
    pub fn start(&self) {
        let Some(receivers) = self.pending.lock().take() else {
            warn!("pipeline already started");
            return;
        };
        let worker_count = self.config.pipeline.max_concurrent_tasks.max(1);
        info!(workers = worker_count, "starting pipeline workers");

        let mut handles = Vec::new();
        let extract_rx = Arc::new(tokio::sync::Mutex::new(receivers.extract_rx));
        for worker_id in 0..worker_count {
            handles.push(tokio::spawn(extract_worker(
                Arc::clone(&self.shared),
                Arc::clone(&extract_rx),
                self.shutdown_rx.clone(),
                worker_id,
            )));
        }
        handles.push(tokio::spawn(merge_worker(
            Arc::clone(&self.shared),
            receivers.merge_rx,
            self.shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(saver_worker(
            Arc::clone(&self.shared),
            receivers.save_rx,
            self.shutdown_rx.clone(),
        )));
        *self.workers.lock() = handles;
    }

    /// Stop the workers and, when auto-save is enabled, write a final
    /// snapshot.
    pub async fn stop(&self) {
        info!("stopping pipeline");
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
        if self.auto_save_enabled() {
            if let Err(e) = self.save_database(None).await {
                warn!(error = %e, "final save on shutdown failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Submit a piece of text as a task. Deep-copies the current System as
    /// the task's private snapshot and enqueues for extraction.
    pub async fn submit_task(&self, input_text: &str) -> GraphResult<String> {
        let ceiling = self.shared.pipeline.max_pending_tasks;
        if ceiling > 0 {
            let backlog = self
                .shared
                .tasks
                .iter()
                .filter(|t| !t.status().is_terminal())
                .count();
            if backlog >= ceiling {
                return Err(GraphError::ResourceExhausted(format!(
                    "{backlog} tasks pending or running (ceiling {ceiling})"
                )));
            }
        }

        let system_snapshot = self.shared.knowledge.read().await.system.clone();
        let task = Arc::new(Task::new(input_text, system_snapshot));
        let task_id = task.task_id.clone();
        self.shared.tasks.insert(task_id.clone(), Arc::clone(&task));

        self.shared.sink.emit(
            Some(task.as_ref()),
            &task_id,
            ProgressStep::TaskSubmitted,
            ProgressData::new("task submitted", 0),
        );
        self.extract_tx
            .send(task)
            .map_err(|_| GraphError::Internal("extract queue closed".to_string()))?;
        info!(task_id = %task_id, "task submitted");
        Ok(task_id)
    }

    /// Request cancellation. Returns false when the task already reached a
    /// terminal state; tasks inside the merge phase run to completion.
    pub fn cancel_task(&self, task_id: &str) -> GraphResult<bool> {
        let task = self
            .shared
            .tasks
            .get(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_string()))?;
        Ok(task.request_cancel())
    }

    pub fn task(&self, task_id: &str) -> Option<TaskView> {
        self.shared.tasks.get(task_id).map(|t| t.view())
    }

    pub fn tasks(&self) -> Vec<TaskView> {
        let mut views: Vec<TaskView> = self.shared.tasks.iter().map(|t| t.view()).collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        views
    }

    /// The delta a completed task produced, with summary statistics.
    pub fn task_delta(&self, task_id: &str) -> GraphResult<TaskDeltaView> {
        let task = self
            .shared
            .tasks
            .get(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_string()))?;
        let delta = match (task.status(), task.result_delta()) {
            (TaskStatus::Completed, Some(delta)) => Some(delta),
            _ => None,
        };
        Ok(TaskDeltaView {
            task_id: task_id.to_string(),
            status: task.status(),
            has_delta: delta.is_some(),
            stats: delta.as_ref().map(|d| {
                json!({
                    "classes": d.classes.len(),
                    "entities": d.entities.len(),
                    "relationships": d.relationships.len(),
                })
            }),
            delta,
        })
    }

    /// Per-stage records (inputs, outputs, raw completion replies).
    pub fn task_stages(&self, task_id: &str) -> GraphResult<TaskStagesView> {
        let task = self
            .shared
            .tasks
            .get(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_string()))?;
        Ok(TaskStagesView {
            task: task.view(),
            stages: task.stage_results(),
        })
    }

    /// Subscribe to the live progress event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.sink.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    pub async fn statistics(&self) -> Value {
        let knowledge = self.shared.knowledge.read().await;
        let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            by_status.insert(status.as_str(), 0);
        }
        for task in self.shared.tasks.iter() {
            *by_status.entry(task.status().as_str()).or_insert(0) += 1;
        }
        json!({
            "system": {
                "classes": knowledge.system.class_count(),
                "predefined_entities": knowledge.system.predefined_entities.len(),
            },
            "graph": {
                "entities": knowledge.graph.entity_count(),
                "class_nodes": knowledge.graph.class_node_count(),
                "relationships": knowledge.graph.relationship_count(),
            },
            "tasks": {
                "total": self.shared.tasks.len(),
                "by_status": by_status,
            },
        })
    }

    pub async fn search_keyword(
        &self,
        keyword: &str,
        fuzzy: bool,
        limit: Option<usize>,
    ) -> Vec<SearchResult> {
        let knowledge = self.shared.knowledge.read().await;
        SearchEngine::new(&knowledge.graph, &knowledge.system).search_keyword(keyword, fuzzy, limit)
    }

    pub async fn node_detail(&self, node_id: &str) -> GraphResult<NodeDetail> {
        let knowledge = self.shared.knowledge.read().await;
        SearchEngine::new(&knowledge.graph, &knowledge.system)
            .node_detail(node_id)
            .ok_or_else(|| GraphError::NodeNotFound(node_id.to_string()))
    }

    pub async fn entity_node_group(&self, entity_name: &str) -> GraphResult<EntityNodeGroup> {
        let knowledge = self.shared.knowledge.read().await;
        SearchEngine::new(&knowledge.graph, &knowledge.system)
            .entity_node_group(entity_name)
            .ok_or_else(|| GraphError::EntityNotFound(entity_name.to_string()))
    }

    pub async fn class_node_group(&self, class_name: &str) -> GraphResult<ClassNodeGroup> {
        let knowledge = self.shared.knowledge.read().await;
        SearchEngine::new(&knowledge.graph, &knowledge.system)
            .class_node_group(class_name)
            .ok_or_else(|| GraphError::ClassNotDefined(class_name.to_string()))
    }

    /// The whole graph in a nodes + links shape, including the derived
    /// has_class and instance_of_class edges.
    pub async fn graph_view(&self) -> Value {
        let knowledge = self.shared.knowledge.read().await;
        let graph = &knowledge.graph;
        let system = &knowledge.system;

        let mut nodes = Vec::new();
        let mut links = Vec::new();

        for master in graph.class_master_nodes(system) {
            nodes.push(json!({
                "id": master.class_name,
                "label": master.class_name,
                "group": 0,
                "size": 12,
                "description": master.description,
                "node_type": "class_master",
                "classes": [master.class_name],
            }));
        }

        let mut entities: Vec<&Entity> = graph.entities().collect();
        entities.sort_by(|a, b| a.name.cmp(&b.name));
        for (i, entity) in entities.iter().enumerate() {
            let properties: BTreeMap<&str, BTreeMap<&String, &Option<String>>> = entity
                .classes
                .iter()
                .map(|c| (c.class_name.as_str(), c.properties.iter().collect()))
                .collect();
            nodes.push(json!({
                "id": entity.name,
                "label": entity.name,
                "group": i + 1,
                "size": 15,
                "description": entity.description,
                "node_type": "entity",
                "classes": entity.class_names(),
                "properties": properties,
            }));

            for instance in &entity.classes {
                let node_id = format!("{}:{}", entity.name, instance.class_name);
                let description = graph
                    .class_node(&entity.name, &instance.class_name)
                    .and_then(|n| n.description.clone());
                nodes.push(json!({
                    "id": node_id,
                    "label": node_id,
                    "group": i + 1,
                    "size": 10,
                    "description": description,
                    "node_type": "class_node",
                    "classes": [instance.class_name],
                }));
                links.push(json!({
                    "source": entity.name,
                    "target": node_id,
                    "value": 1,
                    "edge_type": "has_class",
                }));
                links.push(json!({
                    "source": node_id,
                    "target": instance.class_name,
                    "value": 1,
                    "edge_type": "instance_of_class",
                }));
            }
        }

        for rel in graph.relationships() {
            links.push(json!({
                "source": rel.source,
                "target": rel.target,
                "value": (f64::from(rel.count) * 0.5).min(10.0),
                "description": rel.description,
                "edge_type": "relationship",
                "count": rel.count,
                "refer": rel.refer,
                "semantic_times": rel.semantic_times,
            }));
        }

        json!({ "nodes": nodes, "links": links })
    }

    // ------------------------------------------------------------------
    // Entity management
    // ------------------------------------------------------------------

    pub async fn entities(&self) -> Vec<Value> {
        let knowledge = self.shared.knowledge.read().await;
        let mut entities: Vec<&Entity> = knowledge.graph.entities().collect();
        entities.sort_by(|a, b| a.name.cmp(&b.name));
        entities
            .iter()
            .map(|e| {
                json!({
                    "name": e.name,
                    "description": e.description,
                    "classes": e.class_names(),
                    "created_at": e.created_at,
                    "updated_at": e.updated_at,
                })
            })
            .collect()
    }

    pub async fn entity_detail(&self, entity_name: &str) -> GraphResult<Value> {
        let knowledge = self.shared.knowledge.read().await;
        entity_detail(&knowledge.system, &knowledge.graph, entity_name)
    }

    /// Update an entity's description and/or attach more classes.
    pub async fn update_entity(
        &self,
        entity_name: &str,
        description: Option<&str>,
        add_classes: &[String],
    ) -> GraphResult<Value> {
        let mut knowledge = self.shared.knowledge.write().await;
        let Knowledge { system, graph } = &mut *knowledge;
        {
            let entity = graph
                .get_entity_mut(entity_name)
                .ok_or_else(|| GraphError::EntityNotFound(entity_name.to_string()))?;
            if let Some(description) = description {
                entity.update_description(description);
            }
            for class_name in add_classes {
                entity.add_class(class_name, system)?;
            }
        }
        // Re-fold so class nodes materialize for the new classes.
        if !add_classes.is_empty() {
            let entity = graph
                .get_entity(entity_name)
                .ok_or_else(|| GraphError::EntityNotFound(entity_name.to_string()))?
                .clone();
            graph.add_entity(entity, system, ValidationMode::Lenient)?;
        }
        info!(entity = entity_name, "entity updated");
        entity_detail(system, graph, entity_name)
    }

    pub async fn update_entity_property(
        &self,
        entity_name: &str,
        class_name: &str,
        property_name: &str,
        value: &str,
    ) -> GraphResult<Value> {
        let mut knowledge = self.shared.knowledge.write().await;
        let Knowledge { system, graph } = &mut *knowledge;
        let entity = graph
            .get_entity_mut(entity_name)
            .ok_or_else(|| GraphError::EntityNotFound(entity_name.to_string()))?;
        entity.set_property(class_name, property_name, Some(value.to_string()), system)?;
        info!(entity = entity_name, class = class_name, property = property_name, "property updated");
        entity_detail(system, graph, entity_name)
    }

    pub async fn add_class_to_entity(
        &self,
        entity_name: &str,
        class_name: &str,
        properties: &BTreeMap<String, String>,
    ) -> GraphResult<Value> {
        let mut knowledge = self.shared.knowledge.write().await;
        let Knowledge { system, graph } = &mut *knowledge;
        {
            let entity = graph
                .get_entity_mut(entity_name)
                .ok_or_else(|| GraphError::EntityNotFound(entity_name.to_string()))?;
            entity.add_class(class_name, system)?;
            for (prop_name, value) in properties {
                entity.set_property(class_name, prop_name, Some(value.clone()), system)?;
            }
        }
        let entity = graph
            .get_entity(entity_name)
            .ok_or_else(|| GraphError::EntityNotFound(entity_name.to_string()))?
            .clone();
        graph.add_entity(entity, system, ValidationMode::Lenient)?;
        info!(entity = entity_name, class = class_name, "class attached to entity");
        entity_detail(system, graph, entity_name)
    }

    // ------------------------------------------------------------------
    // Class management
    // ------------------------------------------------------------------

    pub async fn classes(&self) -> Vec<Value> {
        let knowledge = self.shared.knowledge.read().await;
        knowledge
            .system
            .class_names()
            .iter()
            .filter_map(|name| knowledge.system.class(name))
            .map(class_view)
            .collect()
    }

    pub async fn class_detail(&self, class_name: &str) -> GraphResult<Value> {
        let knowledge = self.shared.knowledge.read().await;
        knowledge
            .system
            .class(class_name)
            .map(class_view)
            .ok_or_else(|| GraphError::ClassNotDefined(class_name.to_string()))
    }

    pub async fn create_class(
        &self,
        class_name: &str,
        description: Option<&str>,
        properties: Vec<PropertyDefinition>,
    ) -> GraphResult<Value> {
        let mut knowledge = self.shared.knowledge.write().await;
        let mut class_def = ClassDefinition::new(class_name);
        class_def.description = description.map(str::to_string);
        class_def.properties = properties;
        knowledge.system.add_class_definition(class_def);
        info!(class = class_name, "class created or enhanced");
        knowledge
            .system
            .class(class_name)
            .map(class_view)
            .ok_or_else(|| GraphError::ClassNotDefined(class_name.to_string()))
    }

    /// Enhance a class: overwrite the description and/or union in
    /// properties. Only additions, never removals.
    pub async fn update_class(
        &self,
        class_name: &str,
        description: Option<&str>,
        properties: Vec<PropertyDefinition>,
    ) -> GraphResult<Value> {
        let mut knowledge = self.shared.knowledge.write().await;
        if !knowledge.system.has_class(class_name) {
            return Err(GraphError::ClassNotDefined(class_name.to_string()));
        }
        let mut class_def = ClassDefinition::new(class_name);
        class_def.description = description.map(str::to_string);
        class_def.properties = properties;
        knowledge.system.add_class_definition(class_def);
        info!(class = class_name, "class updated");
        knowledge
            .system
            .class(class_name)
            .map(class_view)
            .ok_or_else(|| GraphError::ClassNotDefined(class_name.to_string()))
    }

    pub async fn add_property_to_class(
        &self,
        class_name: &str,
        property: PropertyDefinition,
    ) -> GraphResult<Value> {
        let mut knowledge = self.shared.knowledge.write().await;
        knowledge.system.add_property(class_name, property)?;
        info!(class = class_name, "property added");
        knowledge
            .system
            .class(class_name)
            .map(class_view)
            .ok_or_else(|| GraphError::ClassNotDefined(class_name.to_string()))
    }

    // ------------------------------------------------------------------
    // Database management
    // ------------------------------------------------------------------

    pub fn set_auto_save(&self, enabled: bool) {
        self.shared.auto_save.store(enabled, Ordering::SeqCst);
        info!(enabled, "auto-save toggled");
    }

    pub fn auto_save_enabled(&self) -> bool {
        self.shared.auto_save.load(Ordering::SeqCst)
    }

    fn database_file_path(&self, file_name: &str) -> GraphResult<PathBuf> {
        if file_name.is_empty() || file_name.contains('/') || file_name.contains('\\') {
            return Err(GraphError::InvalidArgument(format!(
                "invalid database file name: {file_name}"
            )));
        }
        Ok(self.config.storage.data_dir.join(file_name))
    }

    /// Save the current graph. `None` targets the database currently in
    /// use (the auto-save target).
    pub async fn save_database(&self, file_name: Option<&str>) -> GraphResult<Value> {
        let path = match file_name {
            Some(name) => self.database_file_path(name)?,
            None => self.shared.database_path.read().clone(),
        };
        {
            let knowledge = self.shared.knowledge.read().await;
            knowledge.graph.save(&path, &knowledge.system)?;
        }
        let file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        info!(path = %path.display(), "database saved");
        Ok(json!({
            "file_path": path.display().to_string(),
            "file_size": file_size,
            "statistics": self.statistics().await,
        }))
    }

    /// Load a snapshot and make it the current database. Replaces the
    /// canonical System and Graph under the write lock, so in-flight merges
    /// serialize around the swap.
    pub async fn load_database(&self, file_name: Option<&str>) -> GraphResult<Value> {
        let path = match file_name {
            Some(name) => self.database_file_path(name)?,
            None => self.shared.database_path.read().clone(),
        };
        if !path.exists() {
            return Err(GraphError::DatabaseNotFound(path.display().to_string()));
        }
        let (system, graph) = Graph::load(&path)?;
        {
            let mut knowledge = self.shared.knowledge.write().await;
            knowledge.system = system;
            knowledge.graph = graph;
        }
        *self.shared.database_path.write() = path.clone();
        let file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        info!(path = %path.display(), "database loaded");
        Ok(json!({
            "file_path": path.display().to_string(),
            "file_size": file_size,
            "statistics": self.statistics().await,
        }))
    }

    /// List snapshot files in the data directory, newest first.
    pub fn list_databases(&self) -> GraphResult<Vec<Value>> {
        let current = self.shared.database_path.read().clone();
        let mut databases = Vec::new();
        let dir = &self.config.storage.data_dir;
        if !dir.exists() {
            return Ok(databases);
        }
        let mut entries: Vec<(std::time::SystemTime, Value)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DATABASE_EXTENSION) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                warn!(path = %path.display(), "cannot stat database file");
                continue;
            };
            let modified = metadata.modified().unwrap_or(std::time::UNIX_EPOCH);
            entries.push((
                modified,
                json!({
                    "file_name": path.file_name().and_then(|n| n.to_str()),
                    "file_path": path.display().to_string(),
                    "file_size": metadata.len(),
                    "modified": chrono::DateTime::<chrono::Utc>::from(modified),
                    "is_current": path == current,
                }),
            ));
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        databases.extend(entries.into_iter().map(|(_, v)| v));
        Ok(databases)
    }

    /// Create a fresh empty database, save it, and switch to it.
    pub async fn create_database(&self, file_name: Option<&str>) -> GraphResult<Value> {
        let path = match file_name {
            Some(name) => self.database_file_path(name)?,
            None => self.config.default_database_path(),
        };
        {
            let mut knowledge = self.shared.knowledge.write().await;
            knowledge.system = System::new();
            knowledge.graph = Graph::new();
            knowledge.graph.save(&path, &knowledge.system)?;
        }
        *self.shared.database_path.write() = path.clone();
        info!(path = %path.display(), "new empty database created");
        Ok(json!({
            "file_path": path.display().to_string(),
            "file_name": path.file_name().and_then(|n| n.to_str()),
            "statistics": self.statistics().await,
        }))
    }

    pub fn delete_database(&self, file_name: &str) -> GraphResult<Value> {
        let path = self.database_file_path(file_name)?;
        if !path.exists() {
            return Err(GraphError::DatabaseNotFound(file_name.to_string()));
        }
        if path == *self.shared.database_path.read() {
            return Err(GraphError::CannotDeleteCurrent(file_name.to_string()));
        }
        std::fs::remove_file(&path)?;
        info!(file = file_name, "database deleted");
        Ok(json!({ "file_name": file_name }))
    }

    pub fn rename_database(&self, old_name: &str, new_name: &str) -> GraphResult<Value> {
        let old_path = self.database_file_path(old_name)?;
        let new_path = self.database_file_path(new_name)?;
        if !old_path.exists() {
            return Err(GraphError::DatabaseNotFound(old_name.to_string()));
        }
        if new_path.exists() {
            return Err(GraphError::DatabaseExists(new_name.to_string()));
        }
        std::fs::rename(&old_path, &new_path)?;
        if old_path == *self.shared.database_path.read() {
            *self.shared.database_path.write() = new_path.clone();
        }
        info!(old = old_name, new = new_name, "database renamed");
        Ok(json!({
            "old_name": old_name,
            "new_name": new_name,
            "new_path": new_path.display().to_string(),
        }))
    }
}

fn class_view(def: &ClassDefinition) -> Value {
    json!({
        "name": def.name,
        "description": def.description,
        "properties": def.properties,
    })
}

fn entity_detail(system: &System, graph: &Graph, entity_name: &str) -> GraphResult<Value> {
    let entity = graph
        .get_entity(entity_name)
        .ok_or_else(|| GraphError::EntityNotFound(entity_name.to_string()))?;

    let classes: Vec<Value> = entity
        .classes
        .iter()
        .map(|instance| {
            let class_def = system.class(&instance.class_name);
            let properties: Vec<Value> = instance
                .properties
                .iter()
                .map(|(prop_name, value)| {
                    let prop_def = class_def.and_then(|def| def.property(prop_name));
                    json!({
                        "name": prop_name,
                        "value": value,
                        "description": prop_def.and_then(|p| p.description.clone()),
                        "required": prop_def.map(|p| p.required).unwrap_or(false),
                        "value_required": prop_def.map(|p| p.value_required).unwrap_or(false),
                    })
                })
                .collect();
            json!({
                "class_name": instance.class_name,
                "description": class_def.and_then(|def| def.description.clone()),
                "properties": properties,
            })
        })
        .collect();

    let relationships: Vec<Value> = graph
        .get_relationships(Some(&entity.name))
        .iter()
        .map(|rel| {
            json!({
                "source": rel.source,
                "target": rel.target,
                "description": rel.description,
                "count": rel.count,
                "refer": rel.refer,
                "semantic_times": rel.semantic_times,
            })
        })
        .collect();

    Ok(json!({
        "name": entity.name,
        "description": entity.description,
        "classes": classes,
        "relationships": relationships,
        "created_at": entity.created_at,
        "updated_at": entity.updated_at,
    }))
}

/// Delta summary returned by the task-delta endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDeltaView {
    pub task_id: String,
    pub status: TaskStatus,
    pub has_delta: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<GraphDelta>,
}

/// Per-stage records returned by the task-stages endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStagesView {
    #[serde(flatten)]
    pub task: TaskView,
    pub stages: BTreeMap<String, StageRecord>,
}
