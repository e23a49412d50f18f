//! Task records
//!
//! A task is created on submit with a deep copy of the current System, runs
//! through the extract phase on that private snapshot, and carries its
//! resulting delta into the merge phase. Status advances monotonically;
//! stage results (input, output, summary, raw completion-service reply) are
//! recorded per stage for inspection through the API.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::model::delta::GraphDelta;
use crate::model::system::System;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Everything recorded about one pipeline stage of a task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageRecord {
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_response: Option<String>,
}

/// Payload delivered with every progress notification.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressData {
    pub message: String,
    pub percentage: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ProgressData {
    pub fn new(message: impl Into<String>, percentage: u8) -> Self {
        ProgressData {
            message: message.into(),
            percentage: percentage.min(100),
            result: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

pub fn generate_task_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Default)]
struct TaskState {
    status: TaskStatus,
    system_snapshot: Option<System>,
    result_delta: Option<GraphDelta>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    progress: Option<(String, ProgressData)>,
    stage_results: BTreeMap<String, StageRecord>,
}

/// One submitted unit of work.
pub struct Task {
    pub task_id: String,
    pub input_text: String,
    pub created_at: DateTime<Utc>,
    cancel_requested: AtomicBool,
    state: RwLock<TaskState>,
}

impl Task {
    /// Create a pending task holding its private System snapshot.
    pub fn new(input_text: impl Into<String>, system_snapshot: System) -> Self {
        Task {
            task_id: generate_task_id(),
            input_text: input_text.into(),
            created_at: Utc::now(),
            cancel_requested: AtomicBool::new(false),
            state: RwLock::new(TaskState {
                system_snapshot: Some(system_snapshot),
                ..TaskState::default()
            }),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.state.read().status
    }

    /// Flag the task for cancellation. Returns false once the task has
    /// already reached a terminal state.
    pub fn request_cancel(&self) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        true
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn mark_running(&self) {
        let mut state = self.state.write();
        state.status = TaskStatus::Running;
        state.started_at = Some(Utc::now());
    }

    /// Record the extraction result. The task counts as completed from here
    /// on; a later merge failure demotes it to failed.
    pub fn complete_extraction(&self, delta: GraphDelta) {
        let mut state = self.state.write();
        state.result_delta = Some(delta);
        state.status = TaskStatus::Completed;
        state.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&self, error: impl Into<String>) {
        let mut state = self.state.write();
        state.status = TaskStatus::Failed;
        state.error = Some(error.into());
        state.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&self) {
        let mut state = self.state.write();
        state.status = TaskStatus::Cancelled;
        state.completed_at = Some(Utc::now());
    }

    /// Move the System snapshot out for the extract phase.
    pub fn take_system_snapshot(&self) -> Option<System> {
        self.state.write().system_snapshot.take()
    }

    pub fn result_delta(&self) -> Option<GraphDelta> {
        self.state.read().result_delta.clone()
    }

    pub fn set_progress(&self, step: &str, data: ProgressData) {
        self.state.write().progress = Some((step.to_string(), data));
    }

    pub fn record_stage(&self, stage: &str, mut record: StageRecord) {
        if record.timestamp.is_none() {
            record.timestamp = Some(Utc::now());
        }
        self.state.write().stage_results.insert(stage.to_string(), record);
    }

    pub fn stage_result(&self, stage: &str) -> Option<Value> {
        self.state
            .read()
            .stage_results
            .get(stage)
            .and_then(|r| r.result.clone())
    }

    pub fn stage_results(&self) -> BTreeMap<String, StageRecord> {
        self.state.read().stage_results.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    pub fn duration_secs(&self) -> Option<f64> {
        let state = self.state.read();
        let started = state.started_at?;
        let ended = state.completed_at.unwrap_or_else(Utc::now);
        Some((ended - started).num_milliseconds() as f64 / 1000.0)
    }

    /// Serializable summary of the task (without the System snapshot).
    pub fn view(&self) -> TaskView {
        let state = self.state.read();
        TaskView {
            task_id: self.task_id.clone(),
            status: state.status,
            input_text: self.input_text.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            error: state.error.clone(),
            duration: state_duration(&state),
            progress: state
                .progress
                .as_ref()
                .map(|(step, data)| ProgressView {
                    step: step.clone(),
                    message: data.message.clone(),
                    percentage: data.percentage,
                }),
        }
    }
}

fn state_duration(state: &TaskState) -> Option<f64> {
    let started = state.started_at?;
    let ended = state.completed_at.unwrap_or_else(Utc::now);
    Some((ended - started).num_milliseconds() as f64 / 1000.0)
}

/// Serializable task summary.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    pub input_text: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressView>,
}

/// Latest progress of a task, as carried in the task view.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressView {
    pub step: String,
    pub message: String,
    pub percentage: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_pending_with_snapshot() {
        let task = Task::new("some text", System::new());
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.take_system_snapshot().is_some());
        // Snapshot can only be taken once.
        assert!(task.take_system_snapshot().is_none());
    }

    #[test]
    fn test_status_flow() {
        let task = Task::new("text", System::new());
        task.mark_running();
        assert_eq!(task.status(), TaskStatus::Running);
        task.complete_extraction(GraphDelta::new(task.task_id.clone()));
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(task.result_delta().is_some());
    }

    #[test]
    fn test_cancel_only_before_terminal() {
        let task = Task::new("text", System::new());
        assert!(task.request_cancel());
        assert!(task.cancel_requested());

        let done = Task::new("text", System::new());
        done.mark_failed("boom");
        assert!(!done.request_cancel());
        assert_eq!(done.error().as_deref(), Some("boom"));
    }

    #[test]
    fn test_stage_records() {
        let task = Task::new("text", System::new());
        task.record_stage(
            "extraction",
            StageRecord {
                result: Some(serde_json::json!({"entities_count": 2})),
                llm_response: Some("raw".into()),
                ..StageRecord::default()
            },
        );
        let record = task.stage_results().remove("extraction").expect("recorded");
        assert!(record.timestamp.is_some());
        assert_eq!(record.llm_response.as_deref(), Some("raw"));
        assert_eq!(
            task.stage_result("extraction").expect("result")["entities_count"],
            2
        );
    }

    #[test]
    fn test_view_serializes() {
        let task = Task::new("text", System::new());
        task.mark_running();
        task.set_progress("extraction", ProgressData::new("extracting", 50));
        let view = task.view();
        assert_eq!(view.status, TaskStatus::Running);
        let json = serde_json::to_value(&view).expect("serializes");
        assert_eq!(json["status"], "running");
        assert_eq!(json["progress"]["percentage"], 50);
    }

    #[test]
    fn test_percentage_clamped() {
        let data = ProgressData::new("msg", 250);
        assert_eq!(data.percentage, 100);
    }
}
