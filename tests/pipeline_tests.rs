//! End-to-end pipeline scenarios driven through a scripted completion
//! service: concurrent extraction with serial merges, relationship count
//! accumulation across tasks, event ordering, cancellation, auto-save, and
//! snapshot round-trips through a second engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use graphloom::{GraphEngine, Graph, PredefinedEntity, System, TaskStatus};

fn opens_reply() -> String {
    extraction_reply(
        &[
            ("user", "a person using the phone"),
            ("wechat", "an instant messaging app"),
        ],
        &["user|wechat|opens|1|NONE|NONE"],
    )
}

#[tokio::test]
async fn identical_relationships_increment_count_across_tasks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let completion = Arc::new(
        ScriptedCompletion::new()
            .reply_for("first", &opens_reply())
            .reply_for("second", &opens_reply()),
    );
    let (log, callback) = event_recorder();
    let engine = build_engine(test_config(dir.path()), completion, callback);
    engine.start();

    let first = engine.submit_task("first observation").await.expect("submitted");
    wait_for_step(&log, &first, "completed").await;
    let second = engine.submit_task("second observation").await.expect("submitted");
    wait_for_step(&log, &second, "completed").await;

    let stats = engine.statistics().await;
    assert_eq!(stats["graph"]["entities"], 2);
    assert_eq!(stats["graph"]["relationships"], 1);

    let group = engine.entity_node_group("user").await.expect("entity exists");
    assert_eq!(group.one_hop_relationships.len(), 1);
    assert_eq!(group.one_hop_relationships[0].count, 2);

    engine.stop().await;
}

#[tokio::test]
async fn different_refer_produces_two_relationships() {
    let dir = tempfile::tempdir().expect("tempdir");
    let with_refer = extraction_reply(
        &[
            ("user", "a person using the phone"),
            ("wechat", "an instant messaging app"),
        ],
        &["user|wechat|opens|1|phone|NONE"],
    );
    let completion = Arc::new(
        ScriptedCompletion::new()
            .reply_for("plain", &opens_reply())
            .reply_for("referred", &with_refer),
    );
    let (log, callback) = event_recorder();
    let engine = build_engine(test_config(dir.path()), completion, callback);
    engine.start();

    let first = engine.submit_task("plain observation").await.expect("submitted");
    wait_for_step(&log, &first, "completed").await;
    let second = engine.submit_task("referred observation").await.expect("submitted");
    wait_for_step(&log, &second, "completed").await;

    let stats = engine.statistics().await;
    assert_eq!(stats["graph"]["relationships"], 2);

    engine.stop().await;
}

#[tokio::test]
async fn event_order_follows_the_grammar() {
    let dir = tempfile::tempdir().expect("tempdir");
    let completion = Arc::new(ScriptedCompletion::new().reply_for("first", &opens_reply()));
    let (log, callback) = event_recorder();
    let engine = build_engine(test_config(dir.path()), completion, callback);
    engine.start();

    let task_id = engine.submit_task("first observation").await.expect("submitted");
    wait_for_step(&log, &task_id, "completed").await;

    assert_eq!(
        steps_for(&log, &task_id),
        vec![
            "task_submitted",
            "started",
            "system_update",
            "extraction",
            "extraction_completed",
            "merging",
            "completed",
        ]
    );

    engine.stop().await;
}

#[tokio::test]
async fn concurrent_extraction_merges_serially() {
    let dir = tempfile::tempdir().expect("tempdir");
    let alpha = extraction_reply(&[("alpha", "entity alpha")], &[]);
    let beta = extraction_reply(&[("beta", "entity beta")], &[]);
    let gamma = extraction_reply(&[("gamma", "entity gamma")], &[]);
    let completion = Arc::new(
        ScriptedCompletion::new()
            .reply_for("alpha", &alpha)
            .reply_for("beta", &beta)
            .reply_for("gamma", &gamma)
            .delay_for("alpha", Duration::from_millis(300))
            .delay_for("beta", Duration::from_millis(30))
            .delay_for("gamma", Duration::from_millis(30)),
    );
    let (log, callback) = event_recorder();
    let engine = build_engine(test_config(dir.path()), completion, callback);
    engine.start();

    let slow = engine.submit_task("text about alpha").await.expect("submitted");
    let fast1 = engine.submit_task("text about beta").await.expect("submitted");
    let fast2 = engine.submit_task("text about gamma").await.expect("submitted");

    for id in [&slow, &fast1, &fast2] {
        wait_for_step(&log, id, "completed").await;
    }

    // The slow task was submitted first but must not have merged first.
    let order: Vec<String> = log
        .lock()
        .expect("event log lock")
        .iter()
        .filter(|(_, step)| step == "completed")
        .map(|(id, _)| id.clone())
        .collect();
    assert_eq!(order.len(), 3);
    assert_ne!(order[0], slow, "fast extractions should merge first");

    // Merge events form a total order: each merging is immediately followed
    // by the same task's terminal merge event.
    let merge_events: Vec<(String, String)> = log
        .lock()
        .expect("event log lock")
        .iter()
        .filter(|(_, step)| step == "merging" || step == "completed")
        .cloned()
        .collect();
    for pair in merge_events.chunks(2) {
        assert_eq!(pair.len(), 2);
        assert_eq!(pair[0].0, pair[1].0, "merges interleaved: {merge_events:?}");
        assert_eq!(pair[0].1, "merging");
        assert_eq!(pair[1].1, "completed");
    }

    // All three deltas landed regardless of interleaving.
    let stats = engine.statistics().await;
    assert_eq!(stats["graph"]["entities"], 3);

    engine.stop().await;
}

#[tokio::test]
async fn cancellation_before_merge_is_honored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let completion = Arc::new(
        ScriptedCompletion::new()
            .reply_for("slow", &opens_reply())
            .delay_for("slow", Duration::from_millis(400)),
    );
    let (log, callback) = event_recorder();
    let engine = build_engine(test_config(dir.path()), completion, callback);
    engine.start();

    let task_id = engine.submit_task("slow text").await.expect("submitted");
    wait_for_step(&log, &task_id, "started").await;
    assert!(engine.cancel_task(&task_id).expect("task exists"));

    wait_for_step(&log, &task_id, "cancelled").await;
    assert_eq!(
        engine.task(&task_id).expect("task exists").status,
        TaskStatus::Cancelled
    );

    // A cancelled task never reaches the merge phase.
    let steps = steps_for(&log, &task_id);
    assert!(!steps.contains(&"merging".to_string()));
    let stats = engine.statistics().await;
    assert_eq!(stats["graph"]["entities"], 0);

    engine.stop().await;
}

#[tokio::test]
async fn failed_extraction_reports_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    // No scripted reply for this input: the extraction call errors upstream.
    let completion = Arc::new(ScriptedCompletion::new());
    let (log, callback) = event_recorder();
    let engine = build_engine(test_config(dir.path()), completion, callback);
    engine.start();

    let task_id = engine.submit_task("unknown input").await.expect("submitted");
    wait_for_step(&log, &task_id, "failed").await;

    let view = engine.task(&task_id).expect("task exists");
    assert_eq!(view.status, TaskStatus::Failed);
    assert!(view.error.expect("carries message").contains("no scripted reply"));

    engine.stop().await;
}

#[tokio::test]
async fn auto_save_snapshot_reflects_the_merge() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.pipeline.auto_save_enabled = true;
    let db_path = config.default_database_path();

    let completion = Arc::new(ScriptedCompletion::new().reply_for("first", &opens_reply()));
    let (log, callback) = event_recorder();
    let engine = build_engine(config, completion, callback);
    engine.start();

    let task_id = engine.submit_task("first observation").await.expect("submitted");
    wait_for_step(&log, &task_id, "auto_save").await;

    // By the time auto_save is observed, the snapshot on disk reflects the
    // merge of this task.
    let (_, graph) = Graph::load(&db_path).expect("snapshot exists");
    assert!(graph.get_entity("user").is_some());
    assert!(graph.get_entity("wechat").is_some());
    assert_eq!(graph.relationship_count(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn backlog_ceiling_rejects_submits() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.pipeline.max_pending_tasks = 1;
    let completion = Arc::new(
        ScriptedCompletion::new()
            .reply_for("slow", &opens_reply())
            .delay_for("slow", Duration::from_millis(500)),
    );
    let (_log, callback) = event_recorder();
    let engine = build_engine(config, completion, callback);
    engine.start();

    engine.submit_task("slow one").await.expect("first accepted");
    let err = engine
        .submit_task("slow two")
        .await
        .expect_err("ceiling reached");
    assert_eq!(err.kind(), graphloom::ErrorKind::ResourceExhausted);

    engine.stop().await;
}

#[tokio::test]
async fn snapshot_round_trip_with_predefined_entities() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let db_path = config.default_database_path();

    // A system with one predefined entity "Me" of class Person.
    let mut system = System::new();
    system.add_class_definition(graphloom::ClassDefinition::new("Person"));
    system.add_class_definition(graphloom::ClassDefinition::new("Platform"));
    system.add_predefined_entity(PredefinedEntity {
        name: "Me".into(),
        description: "the user".into(),
        classes: vec!["Person".into()],
    });

    let wechat_reply = extraction_reply(&[("Wechat", "an instant messaging app")], &[]);
    let completion = Arc::new(ScriptedCompletion::new().reply_for("wechat", &wechat_reply));
    let (log, callback) = event_recorder();
    let engine = GraphEngine::new(
        config.clone(),
        completion.clone(),
        test_prompts(),
        Some(callback),
        system,
    );
    engine.start();

    let task_id = engine.submit_task("text adding wechat").await.expect("submitted");
    wait_for_step(&log, &task_id, "completed").await;
    engine.save_database(None).await.expect("saved");
    engine.stop().await;

    // Reload in a fresh engine: both entities and the class survive.
    let (_log2, callback2) = event_recorder();
    let reloaded = GraphEngine::load(config, completion, test_prompts(), Some(callback2), &db_path)
        .expect("loads");
    let stats = reloaded.statistics().await;
    assert_eq!(stats["graph"]["entities"], 2);
    assert_eq!(stats["system"]["predefined_entities"], 1);
    assert!(reloaded.entity_detail("Me").await.is_ok());
    assert!(reloaded.entity_detail("Wechat").await.is_ok());
    assert!(reloaded.class_detail("Person").await.is_ok());
}

#[tokio::test]
async fn smart_merge_increment_count_bumps_the_existing_edge() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.pipeline.enable_smart_merge = true;

    // First merge passes the extraction through; second repeats the same
    // relationship, and the consult answers with an increment_count record.
    let pass_through = r#"{
        "optimized_entities": [
            {"name": "user", "description": "a person", "classes": [], "operation": "add"},
            {"name": "wechat", "description": "an app", "classes": [], "operation": "add"}
        ],
        "optimized_relationships": [
            {"source": "user", "target": "wechat", "description": "opens", "count": 3, "operation": "add"}
        ],
        "merge_summary": {"notes": "pass through"}
    }"#;
    let increment = r#"{
        "optimized_relationships": [
            {"source": "user", "target": "wechat", "description": "opens", "operation": "increment_count", "increment_amount": 2}
        ],
        "merge_summary": {"duplicates_found": 1, "notes": "repeat observation"}
    }"#;

    let completion = Arc::new(
        ScriptedCompletion::new()
            .reply_for("first", &opens_reply())
            .reply_for("second", &opens_reply())
            .merge_reply(pass_through)
            .merge_reply(increment),
    );
    let (log, callback) = event_recorder();
    let mut system = System::new();
    system.add_class_definition(graphloom::ClassDefinition::new("Person"));
    system.add_class_definition(graphloom::ClassDefinition::new("Platform"));
    let engine = GraphEngine::new(config, completion, test_prompts_with_merge(), Some(callback), system);
    engine.start();

    let first = engine.submit_task("first observation").await.expect("submitted");
    wait_for_step(&log, &first, "completed").await;
    let second = engine.submit_task("second observation").await.expect("submitted");
    wait_for_step(&log, &second, "completed").await;

    let group = engine.entity_node_group("user").await.expect("entity exists");
    assert_eq!(group.one_hop_relationships.len(), 1);
    assert_eq!(group.one_hop_relationships[0].count, 5);

    // The merge stage recorded the consult statistics.
    let stages = engine.task_stages(&second).expect("task exists");
    let output = stages.stages["merging"].output.as_ref().expect("recorded");
    assert_eq!(output["merge_statistics"]["duplicates_found"], 1);

    engine.stop().await;
}

#[tokio::test]
async fn tasks_are_inspectable_after_completion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let completion = Arc::new(ScriptedCompletion::new().reply_for("first", &opens_reply()));
    let (log, callback) = event_recorder();
    let engine = build_engine(test_config(dir.path()), completion, callback);
    engine.start();

    let task_id = engine.submit_task("first observation").await.expect("submitted");
    wait_for_step(&log, &task_id, "completed").await;

    let delta = engine.task_delta(&task_id).expect("task exists");
    assert!(delta.has_delta);
    let delta_body = delta.delta.expect("delta recorded");
    assert_eq!(delta_body.entities.len(), 2);
    assert_eq!(delta_body.relationships.len(), 1);

    let stages = engine.task_stages(&task_id).expect("task exists");
    assert!(stages.stages.contains_key("system_update"));
    assert!(stages.stages.contains_key("extraction"));
    assert!(stages.stages.contains_key("merging"));
    assert!(stages.stages["extraction"].llm_response.is_some());

    engine.stop().await;
}
