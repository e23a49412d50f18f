//! REST handlers
//!
//! Thin wrappers over [`GraphEngine`]; every handler takes the engine from
//! the router state, delegates, and maps errors through [`RestError`].

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::stream::Stream;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::engine::GraphEngine;
use crate::model::PropertyDefinition;

use super::dto::*;
use super::error::RestError;

type Engine = State<Arc<GraphEngine>>;
type ApiResult = Result<Json<Value>, RestError>;

fn ok(data: Value) -> ApiResult {
    Ok(Json(json!({ "success": true, "data": data })))
}

// ---------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------

pub async fn submit_task(
    State(engine): Engine,
    Json(request): Json<SubmitTaskRequest>,
) -> ApiResult {
    let task_id = engine.submit_task(&request.input_text).await?;
    ok(json!({ "task_id": task_id }))
}

pub async fn list_tasks(State(engine): Engine) -> ApiResult {
    ok(json!(engine.tasks()))
}

pub async fn get_task(State(engine): Engine, Path(task_id): Path<String>) -> ApiResult {
    match engine.task(&task_id) {
        Some(view) => ok(json!(view)),
        None => Err(RestError::not_found(format!("task not found: {task_id}"))),
    }
}

pub async fn cancel_task(State(engine): Engine, Path(task_id): Path<String>) -> ApiResult {
    let cancelled = engine.cancel_task(&task_id)?;
    ok(json!({ "task_id": task_id, "cancelled": cancelled }))
}

pub async fn get_task_delta(State(engine): Engine, Path(task_id): Path<String>) -> ApiResult {
    ok(json!(engine.task_delta(&task_id)?))
}

pub async fn get_task_stages(State(engine): Engine, Path(task_id): Path<String>) -> ApiResult {
    ok(json!(engine.task_stages(&task_id)?))
}

// ---------------------------------------------------------------------
// Graph, stats, search
// ---------------------------------------------------------------------

pub async fn get_graph(State(engine): Engine) -> ApiResult {
    ok(engine.graph_view().await)
}

pub async fn get_stats(State(engine): Engine) -> ApiResult {
    ok(engine.statistics().await)
}

pub async fn search(State(engine): Engine, Query(params): Query<SearchParams>) -> ApiResult {
    let results = engine
        .search_keyword(&params.keyword, params.fuzzy, Some(params.limit))
        .await;
    ok(json!(results))
}

pub async fn get_node(State(engine): Engine, Path(node_id): Path<String>) -> ApiResult {
    ok(json!(engine.node_detail(&node_id).await?))
}

pub async fn get_entity_group(
    State(engine): Engine,
    Path(entity_name): Path<String>,
) -> ApiResult {
    ok(json!(engine.entity_node_group(&entity_name).await?))
}

pub async fn get_class_group(State(engine): Engine, Path(class_name): Path<String>) -> ApiResult {
    ok(json!(engine.class_node_group(&class_name).await?))
}

// ---------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------

pub async fn list_entities(State(engine): Engine) -> ApiResult {
    ok(json!(engine.entities().await))
}

pub async fn get_entity(State(engine): Engine, Path(entity_name): Path<String>) -> ApiResult {
    ok(engine.entity_detail(&entity_name).await?)
}

pub async fn update_entity(
    State(engine): Engine,
    Path(entity_name): Path<String>,
    Json(request): Json<UpdateEntityRequest>,
) -> ApiResult {
    ok(engine
        .update_entity(
            &entity_name,
            request.description.as_deref(),
            &request.add_classes,
        )
        .await?)
}

pub async fn update_entity_property(
    State(engine): Engine,
    Path(entity_name): Path<String>,
    Json(request): Json<UpdateEntityPropertyRequest>,
) -> ApiResult {
    ok(engine
        .update_entity_property(
            &entity_name,
            &request.class_name,
            &request.property_name,
            &request.value,
        )
        .await?)
}

pub async fn add_class_to_entity(
    State(engine): Engine,
    Path(entity_name): Path<String>,
    Json(request): Json<AddClassToEntityRequest>,
) -> ApiResult {
    ok(engine
        .add_class_to_entity(&entity_name, &request.class_name, &request.properties)
        .await?)
}

// ---------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------

pub async fn list_classes(State(engine): Engine) -> ApiResult {
    ok(json!(engine.classes().await))
}

pub async fn get_class(State(engine): Engine, Path(class_name): Path<String>) -> ApiResult {
    ok(engine.class_detail(&class_name).await?)
}

pub async fn create_class(
    State(engine): Engine,
    Json(request): Json<CreateClassRequest>,
) -> ApiResult {
    ok(engine
        .create_class(
            &request.class_name,
            Some(&request.description),
            request.properties,
        )
        .await?)
}

pub async fn update_class(
    State(engine): Engine,
    Path(class_name): Path<String>,
    Json(request): Json<UpdateClassRequest>,
) -> ApiResult {
    ok(engine
        .update_class(&class_name, request.description.as_deref(), request.properties)
        .await?)
}

pub async fn add_property(
    State(engine): Engine,
    Path(class_name): Path<String>,
    Json(request): Json<AddPropertyRequest>,
) -> ApiResult {
    let property = PropertyDefinition {
        name: request.property_name,
        description: request.description,
        required: request.required,
        value_required: request.value_required,
    };
    ok(engine.add_property_to_class(&class_name, property).await?)
}

// ---------------------------------------------------------------------
// Databases
// ---------------------------------------------------------------------

pub async fn save_database(
    State(engine): Engine,
    Json(request): Json<DatabaseFileRequest>,
) -> ApiResult {
    ok(engine.save_database(request.file_name.as_deref()).await?)
}

pub async fn load_database(
    State(engine): Engine,
    Json(request): Json<DatabaseFileRequest>,
) -> ApiResult {
    ok(engine.load_database(request.file_name.as_deref()).await?)
}

pub async fn list_databases(State(engine): Engine) -> ApiResult {
    ok(json!(engine.list_databases()?))
}

pub async fn create_database(
    State(engine): Engine,
    Json(request): Json<DatabaseFileRequest>,
) -> ApiResult {
    ok(engine.create_database(request.file_name.as_deref()).await?)
}

pub async fn delete_database(
    State(engine): Engine,
    Path(file_name): Path<String>,
) -> ApiResult {
    ok(engine.delete_database(&file_name)?)
}

pub async fn rename_database(
    State(engine): Engine,
    Json(request): Json<RenameDatabaseRequest>,
) -> ApiResult {
    ok(engine.rename_database(&request.old_name, &request.new_name)?)
}

pub async fn set_auto_save(
    State(engine): Engine,
    Json(request): Json<AutoSaveRequest>,
) -> ApiResult {
    engine.set_auto_save(request.enabled);
    ok(json!({ "auto_save_enabled": engine.auto_save_enabled() }))
}

// ---------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------

/// SSE stream replaying pipeline progress events.
pub async fn events(
    State(engine): Engine,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = engine.subscribe_events();
    let stream = BroadcastStream::new(receiver).filter_map(|event| {
        let event = event.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().event("progress").data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
