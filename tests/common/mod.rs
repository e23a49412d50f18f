//! Shared helpers for the integration tests: a scripted completion service
//! and an engine builder wired to a temporary data directory.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use graphloom::{
    CompletionService, Config, GraphEngine, GraphError, GraphResult, ProgressCallback,
    PromptLibrary, PromptTemplate, System,
};

/// Scripted completion service. The system-update prompt (recognized by its
/// `{system_json}` placeholder) always answers with the sufficiency
/// sentinel; extraction prompts answer with the reply whose needle occurs in
/// the task's input text, after an optional delay.
pub struct ScriptedCompletion {
    replies: Vec<(String, String)>,
    delays: Vec<(String, Duration)>,
    merge_replies: Mutex<std::collections::VecDeque<String>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        ScriptedCompletion {
            replies: Vec::new(),
            delays: Vec::new(),
            merge_replies: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    pub fn reply_for(mut self, needle: &str, reply: &str) -> Self {
        self.replies.push((needle.to_string(), reply.to_string()));
        self
    }

    pub fn delay_for(mut self, needle: &str, delay: Duration) -> Self {
        self.delays.push((needle.to_string(), delay));
        self
    }

    /// Queue a smart-merge reply; replies are consumed in submission order
    /// by the serial merge worker.
    pub fn merge_reply(self, reply: &str) -> Self {
        self.merge_replies
            .lock()
            .expect("merge reply lock")
            .push_back(reply.to_string());
        self
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(
        &self,
        template: &PromptTemplate,
        vars: &HashMap<String, String>,
        _temperature: f32,
    ) -> GraphResult<String> {
        if template.as_str().contains("{system_json}") {
            return Ok("SUFFICIENT".to_string());
        }
        if template.as_str().contains("{delta}") {
            return self
                .merge_replies
                .lock()
                .expect("merge reply lock")
                .pop_front()
                .ok_or_else(|| GraphError::Upstream("no scripted merge reply".into()));
        }
        let input = vars.get("input_text").cloned().unwrap_or_default();
        if let Some((_, delay)) = self.delays.iter().find(|(needle, _)| input.contains(needle)) {
            tokio::time::sleep(*delay).await;
        }
        for (needle, reply) in &self.replies {
            if input.contains(needle) {
                return Ok(reply.clone());
            }
        }
        Err(GraphError::Upstream(format!(
            "no scripted reply for input: {input}"
        )))
    }
}

/// A four-section extraction reply in the default delimiter configuration.
pub fn extraction_reply(entities: &[(&str, &str)], relationships: &[&str]) -> String {
    let entity_records: Vec<String> = entities
        .iter()
        .map(|(name, description)| format!("(\"entity\"|{name}|{description})"))
        .collect();
    let relationship_records: Vec<String> = relationships
        .iter()
        .map(|r| format!("(\"relationship\"|{r})"))
        .collect();
    format!(
        "NO_NEW_PROPERTIES\nSECTION_DELIMITER\n{}\nSECTION_DELIMITER\nNONE\nSECTION_DELIMITER\n{}\nDONE",
        entity_records.join("^"),
        relationship_records.join("^"),
    )
}

pub fn test_prompts() -> PromptLibrary {
    PromptLibrary {
        system_update: Some(PromptTemplate::from_text(
            "catalog: {system_json}\ntext: {text}",
        )),
        extract_graph: Some(PromptTemplate::from_text("extract from: {input_text}")),
        check_extraction: None,
        smart_merge: None,
    }
}

pub fn test_prompts_with_merge() -> PromptLibrary {
    PromptLibrary {
        smart_merge: Some(PromptTemplate::from_text("merge this delta: {delta}")),
        ..test_prompts()
    }
}

pub fn test_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = data_dir.to_path_buf();
    config.extraction.enable_check = false;
    config.pipeline.enable_smart_merge = false;
    config.pipeline.auto_save_enabled = false;
    config
}

/// Progress-event log captured through the synchronous callback.
pub type EventLog = Arc<Mutex<Vec<(String, String)>>>;

pub fn event_recorder() -> (EventLog, ProgressCallback) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let callback: ProgressCallback = Arc::new(move |task_id, step, _data| {
        sink.lock()
            .expect("event log lock")
            .push((task_id.to_string(), step.as_str().to_string()));
    });
    (log, callback)
}

/// Step labels recorded for one task, consecutive duplicates collapsed.
pub fn steps_for(log: &EventLog, task_id: &str) -> Vec<String> {
    let mut steps = Vec::new();
    for (id, step) in log.lock().expect("event log lock").iter() {
        if id == task_id && steps.last() != Some(step) {
            steps.push(step.clone());
        }
    }
    steps
}

/// Poll the event log until the task reaches the given step.
pub async fn wait_for_step(log: &EventLog, task_id: &str, step: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        {
            let events = log.lock().expect("event log lock");
            if events.iter().any(|(id, s)| id == task_id && s == step) {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for task {task_id} to reach step {step}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn build_engine(
    config: Config,
    completion: Arc<dyn CompletionService>,
    callback: ProgressCallback,
) -> GraphEngine {
    let mut system = System::new();
    system.add_class_definition(
        graphloom::ClassDefinition::new("Person").with_description("a human"),
    );
    system.add_class_definition(
        graphloom::ClassDefinition::new("Platform").with_description("an online platform"),
    );
    GraphEngine::new(config, completion, test_prompts(), Some(callback), system)
}
