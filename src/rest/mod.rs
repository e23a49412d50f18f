//! HTTP API Module
//!
//! The thin request surface over one [`GraphEngine`]: task submission and
//! inspection, graph/stats/search reads, entity and class management,
//! database lifecycle, and an SSE endpoint replaying progress events.

pub mod dto;
pub mod error;
pub mod handlers;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::GraphEngine;

/// Build the router around an explicitly-constructed engine.
pub fn router(engine: Arc<GraphEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        // tasks
        .route("/api/tasks", post(handlers::submit_task).get(handlers::list_tasks))
        .route("/api/tasks/:task_id", get(handlers::get_task))
        .route("/api/tasks/:task_id/cancel", post(handlers::cancel_task))
        .route("/api/tasks/:task_id/delta", get(handlers::get_task_delta))
        .route("/api/tasks/:task_id/stages", get(handlers::get_task_stages))
        // graph reads
        .route("/api/graph", get(handlers::get_graph))
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/search", get(handlers::search))
        .route("/api/nodes/:node_id", get(handlers::get_node))
        // entities
        .route("/api/entities", get(handlers::list_entities))
        .route(
            "/api/entities/:entity_name",
            get(handlers::get_entity).put(handlers::update_entity),
        )
        .route(
            "/api/entities/:entity_name/property",
            put(handlers::update_entity_property),
        )
        .route(
            "/api/entities/:entity_name/classes",
            post(handlers::add_class_to_entity),
        )
        .route(
            "/api/entities/:entity_name/group",
            get(handlers::get_entity_group),
        )
        // classes
        .route("/api/classes", get(handlers::list_classes).post(handlers::create_class))
        .route(
            "/api/classes/:class_name",
            get(handlers::get_class).put(handlers::update_class),
        )
        .route(
            "/api/classes/:class_name/properties",
            post(handlers::add_property),
        )
        .route(
            "/api/classes/:class_name/group",
            get(handlers::get_class_group),
        )
        // databases
        .route("/api/database/save", post(handlers::save_database))
        .route("/api/database/load", post(handlers::load_database))
        .route("/api/database/list", get(handlers::list_databases))
        .route("/api/database/create", post(handlers::create_database))
        .route("/api/database/:file_name", delete(handlers::delete_database))
        .route("/api/database/rename", post(handlers::rename_database))
        .route("/api/settings/auto-save", put(handlers::set_auto_save))
        // progress events
        .route("/api/events", get(handlers::events))
        .layer(cors)
        .with_state(engine)
}
