//! Relationship count accumulation through the store and the combiner:
//! identical identities fold into one counted edge, a different refer set
//! is a different edge, and increment_count either bumps a matching edge or
//! inserts a fresh one with the increment as its initial count.

use graphloom::combiner::Combiner;
use graphloom::{
    ClassDefinition, Entity, Graph, GraphDelta, Relationship, RelationshipDelta, RelationshipOp,
    System, ValidationMode,
};

fn setup() -> (System, Graph) {
    let mut system = System::new();
    system.add_class_definition(ClassDefinition::new("Person"));
    system.add_class_definition(ClassDefinition::new("Platform"));

    let mut graph = Graph::new();
    let mut user = Entity::new("user", "a person");
    user.add_class("Person", &system).expect("defined");
    graph
        .add_entity(user, &system, ValidationMode::Strict)
        .expect("valid");
    let mut wechat = Entity::new("wechat", "an app");
    wechat.add_class("Platform", &system).expect("defined");
    graph
        .add_entity(wechat, &system, ValidationMode::Strict)
        .expect("valid");
    (system, graph)
}

#[test]
fn repeated_additions_accumulate_into_one_edge() {
    let (system, mut graph) = setup();

    graph
        .add_relationship(Relationship::new("user", "wechat", "opens", 1), &system)
        .expect("endpoints exist");
    assert_eq!(graph.relationship_count(), 1);
    assert_eq!(graph.relationships()[0].count, 1);

    graph
        .add_relationship(Relationship::new("user", "wechat", "opens", 1), &system)
        .expect("endpoints exist");
    assert_eq!(graph.relationship_count(), 1);
    assert_eq!(graph.relationships()[0].count, 2);

    graph
        .add_relationship(Relationship::new("user", "wechat", "opens", 3), &system)
        .expect("endpoints exist");
    assert_eq!(graph.relationship_count(), 1);
    assert_eq!(graph.relationships()[0].count, 5);
}

#[test]
fn refer_distinguishes_edges() {
    let (system, mut graph) = setup();
    graph
        .add_relationship(Relationship::new("user", "wechat", "opens", 5), &system)
        .expect("endpoints exist");
    graph
        .add_relationship(
            Relationship::new("user", "wechat", "opens", 1).with_refer(vec!["phone".into()]),
            &system,
        )
        .expect("endpoints exist");

    assert_eq!(graph.relationship_count(), 2);
    let fresh = graph
        .relationships()
        .iter()
        .find(|r| !r.refer.is_empty())
        .expect("refer edge present");
    assert_eq!(fresh.count, 1);
}

#[test]
fn combiner_batch_keeps_accumulating() {
    let (mut system, mut graph) = setup();
    graph
        .add_relationship(Relationship::new("user", "wechat", "opens", 5), &system)
        .expect("endpoints exist");

    let combiner = Combiner::new(false);
    let mut delta = GraphDelta::new("batch");
    for count in [1u32, 2] {
        delta.relationships.push(RelationshipDelta {
            source: "user".into(),
            target: "wechat".into(),
            description: "opens".into(),
            count,
            refer: Vec::new(),
            semantic_times: Vec::new(),
            operation: RelationshipOp::Add,
        });
    }
    let stats = combiner
        .apply(&mut system, &mut graph, &delta)
        .expect("applies");
    assert_eq!(stats.relationships_updated, 2);

    let edge = graph
        .relationships()
        .iter()
        .find(|r| r.refer.is_empty())
        .expect("edge present");
    assert_eq!(edge.count, 8);
}

#[test]
fn increment_count_matches_and_misses() {
    let (mut system, mut graph) = setup();
    graph
        .add_relationship(Relationship::new("user", "wechat", "opens", 3), &system)
        .expect("endpoints exist");

    let combiner = Combiner::new(false);

    // Match: same identity tuple, count 3 -> 5.
    let mut matching = GraphDelta::new("inc1");
    matching.relationships.push(RelationshipDelta {
        source: "USER".into(),
        target: "WECHAT".into(),
        description: "opens".into(),
        count: 1,
        refer: Vec::new(),
        semantic_times: Vec::new(),
        operation: RelationshipOp::IncrementCount {
            increment_amount: 2,
        },
    });
    let stats = combiner
        .apply(&mut system, &mut graph, &matching)
        .expect("applies");
    assert_eq!(stats.increments_applied, 1);
    assert_eq!(graph.relationship_count(), 1);
    assert_eq!(graph.relationships()[0].count, 5);

    // Miss: different description, fresh edge with count = increment_amount.
    let mut missing = GraphDelta::new("inc2");
    missing.relationships.push(RelationshipDelta {
        source: "user".into(),
        target: "wechat".into(),
        description: "closes".into(),
        count: 1,
        refer: Vec::new(),
        semantic_times: Vec::new(),
        operation: RelationshipOp::IncrementCount {
            increment_amount: 2,
        },
    });
    let stats = combiner
        .apply(&mut system, &mut graph, &missing)
        .expect("applies");
    assert_eq!(stats.increments_not_found, 1);
    assert_eq!(graph.relationship_count(), 2);
    let fresh = graph
        .relationships()
        .iter()
        .find(|r| r.description == "closes")
        .expect("fresh edge");
    assert_eq!(fresh.count, 2);
}

#[test]
fn semantic_times_concatenate_on_accumulation() {
    let (system, mut graph) = setup();
    graph
        .add_relationship(
            Relationship::new("user", "wechat", "opens", 1)
                .with_semantic_times(vec!["2026-01-01T08:00:00".into()]),
            &system,
        )
        .expect("endpoints exist");
    graph
        .add_relationship(
            Relationship::new("user", "wechat", "opens", 1)
                .with_semantic_times(vec!["2026-01-02T09:00:00".into()]),
            &system,
        )
        .expect("endpoints exist");

    let edge = &graph.relationships()[0];
    assert_eq!(edge.count, 2);
    assert_eq!(
        edge.semantic_times,
        vec!["2026-01-01T08:00:00", "2026-01-02T09:00:00"]
    );
}
