//! Keyword search and one-hop views over the graph
//!
//! The search engine borrows the graph and the System for the duration of a
//! query; nothing is indexed ahead of time. A keyword sweep visits entities,
//! class-instance nodes, class-master views, relationships, and property
//! definitions/values, then applies hierarchical de-duplication: a hit on a
//! node's name suppresses hits that are merely that node's description or
//! property values.

use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::model::{ClassMasterNode, ClassNode, Entity, Graph, Relationship, System};

/// What kind of text a search hit matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchResultType {
    EntityName,
    EntityDescription,
    ClassNode,
    ClassName,
    ClassDescription,
    PropertyName,
    PropertyValue,
    RelationshipDescription,
    RelationshipRefer,
}

/// One search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub result_type: SearchResultType,
    pub matched_text: String,
    /// Identifier of the matched object (entity name, node id,
    /// "source -> target" for relationships, class or property name)
    pub matched_item: String,
    pub context: BTreeMap<String, String>,
    pub score: f32,
}

/// A node plus its one-hop surroundings.
#[derive(Debug, Clone, Serialize)]
pub struct NodeDetail {
    pub node_id: String,
    pub node_type: &'static str,
    pub node_info: serde_json::Value,
    pub one_hop_relationships: Vec<Relationship>,
    pub one_hop_neighbors: Vec<String>,
}

/// An entity, its class-instance nodes, and every one-hop relationship
/// touching any of them.
#[derive(Debug, Clone, Serialize)]
pub struct EntityNodeGroup {
    pub entity: Entity,
    pub class_nodes: Vec<ClassNode>,
    pub one_hop_relationships: Vec<Relationship>,
}

/// A class-master node, every class-instance node of that class, and the
/// one-hop relationships touching any of them.
#[derive(Debug, Clone, Serialize)]
pub struct ClassNodeGroup {
    pub class_master_node: ClassMasterNode,
    pub class_nodes: Vec<ClassNode>,
    pub one_hop_relationships: Vec<Relationship>,
}

/// Borrowing search engine over one graph + catalog pair.
pub struct SearchEngine<'a> {
    graph: &'a Graph,
    system: &'a System,
}

impl<'a> SearchEngine<'a> {
    pub fn new(graph: &'a Graph, system: &'a System) -> Self {
        SearchEngine { graph, system }
    }

    // ------------------------------------------------------------------
    // Keyword search
    // ------------------------------------------------------------------

    /// Sweep everything for a keyword. `fuzzy` means case-insensitive
    /// substring; otherwise case-insensitive equality. Results are
    /// de-duplicated hierarchically, sorted by score, and truncated.
    pub fn search_keyword(
        &self,
        keyword: &str,
        fuzzy: bool,
        limit: Option<usize>,
    ) -> Vec<SearchResult> {
        debug!(keyword, fuzzy, "keyword search");
        let mut results = Vec::new();
        self.search_entities(keyword, fuzzy, &mut results);
        self.search_class_nodes(keyword, fuzzy, &mut results);
        self.search_class_masters(keyword, fuzzy, &mut results);
        self.search_relationships(keyword, fuzzy, &mut results);
        self.search_properties(keyword, fuzzy, &mut results);

        let mut results = deduplicate(results);
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(limit) = limit {
            results.truncate(limit);
        }
        results
    }

    fn search_entities(&self, keyword: &str, fuzzy: bool, results: &mut Vec<SearchResult>) {
        for entity in self.graph.entities() {
            if matches(keyword, &entity.name, fuzzy) {
                results.push(SearchResult {
                    result_type: SearchResultType::EntityName,
                    matched_text: entity.name.clone(),
                    matched_item: entity.name.clone(),
                    context: BTreeMap::from([("entity_name".to_string(), entity.name.clone())]),
                    score: score(keyword, &entity.name, fuzzy),
                });
            }
            if !entity.description.is_empty() && matches(keyword, &entity.description, fuzzy) {
                results.push(SearchResult {
                    result_type: SearchResultType::EntityDescription,
                    matched_text: entity.description.clone(),
                    matched_item: entity.name.clone(),
                    context: BTreeMap::from([
                        ("entity_name".to_string(), entity.name.clone()),
                        ("description".to_string(), entity.description.clone()),
                    ]),
                    score: score(keyword, &entity.description, fuzzy),
                });
            }
        }
    }

    fn search_class_nodes(&self, keyword: &str, fuzzy: bool, results: &mut Vec<SearchResult>) {
        for node in self.graph.class_nodes(None) {
            let node_id = node.node_id();
            if matches(keyword, &node_id, fuzzy) {
                results.push(SearchResult {
                    result_type: SearchResultType::ClassNode,
                    matched_text: node_id.clone(),
                    matched_item: node_id.clone(),
                    context: BTreeMap::from([
                        ("node_id".to_string(), node_id.clone()),
                        ("entity_name".to_string(), node.entity_name.clone()),
                        ("class_name".to_string(), node.class_name.clone()),
                    ]),
                    score: score(keyword, &node_id, fuzzy),
                });
            }
            if let Some(description) = &node.description {
                if matches(keyword, description, fuzzy) {
                    results.push(SearchResult {
                        result_type: SearchResultType::ClassNode,
                        matched_text: description.clone(),
                        matched_item: node_id.clone(),
                        context: BTreeMap::from([
                            ("node_id".to_string(), node_id.clone()),
                            ("description".to_string(), description.clone()),
                        ]),
                        score: score(keyword, description, fuzzy),
                    });
                }
            }
        }
    }

    fn search_class_masters(&self, keyword: &str, fuzzy: bool, results: &mut Vec<SearchResult>) {
        for master in self.graph.class_master_nodes(self.system) {
            if matches(keyword, &master.class_name, fuzzy) {
                results.push(SearchResult {
                    result_type: SearchResultType::ClassName,
                    matched_text: master.class_name.clone(),
                    matched_item: master.class_name.clone(),
                    context: BTreeMap::from([(
                        "class_name".to_string(),
                        master.class_name.clone(),
                    )]),
                    score: score(keyword, &master.class_name, fuzzy),
                });
            }
            if let Some(description) = &master.description {
                if matches(keyword, description, fuzzy) {
                    results.push(SearchResult {
                        result_type: SearchResultType::ClassDescription,
                        matched_text: description.clone(),
                        matched_item: master.class_name.clone(),
                        context: BTreeMap::from([
                            ("class_name".to_string(), master.class_name.clone()),
                            ("description".to_string(), description.clone()),
                        ]),
                        score: score(keyword, description, fuzzy),
                    });
                }
            }
        }
    }

    fn search_relationships(&self, keyword: &str, fuzzy: bool, results: &mut Vec<SearchResult>) {
        for rel in self.graph.relationships() {
            let item = format!("{} -> {}", rel.source, rel.target);
            if matches(keyword, &rel.description, fuzzy) {
                results.push(SearchResult {
                    result_type: SearchResultType::RelationshipDescription,
                    matched_text: rel.description.clone(),
                    matched_item: item.clone(),
                    context: BTreeMap::from([
                        ("source".to_string(), rel.source.clone()),
                        ("target".to_string(), rel.target.clone()),
                        ("description".to_string(), rel.description.clone()),
                    ]),
                    score: score(keyword, &rel.description, fuzzy),
                });
            }
            for refer in &rel.refer {
                if matches(keyword, refer, fuzzy) {
                    results.push(SearchResult {
                        result_type: SearchResultType::RelationshipRefer,
                        matched_text: refer.clone(),
                        matched_item: item.clone(),
                        context: BTreeMap::from([
                            ("source".to_string(), rel.source.clone()),
                            ("target".to_string(), rel.target.clone()),
                            ("refer".to_string(), refer.clone()),
                        ]),
                        score: score(keyword, refer, fuzzy),
                    });
                }
            }
        }
    }

    fn search_properties(&self, keyword: &str, fuzzy: bool, results: &mut Vec<SearchResult>) {
        // Property declarations in the catalog
        for class_name in self.system.class_names() {
            let Some(class_def) = self.system.class(&class_name) else {
                continue;
            };
            for prop in &class_def.properties {
                if matches(keyword, &prop.name, fuzzy) {
                    let mut context = BTreeMap::from([
                        ("class_name".to_string(), class_name.clone()),
                        ("property_name".to_string(), prop.name.clone()),
                    ]);
                    if let Some(description) = &prop.description {
                        context.insert("description".to_string(), description.clone());
                    }
                    results.push(SearchResult {
                        result_type: SearchResultType::PropertyName,
                        matched_text: prop.name.clone(),
                        matched_item: prop.name.clone(),
                        context,
                        score: score(keyword, &prop.name, fuzzy),
                    });
                }
            }
        }

        // Property values on entity instances
        for entity in self.graph.entities() {
            for instance in &entity.classes {
                for (prop_name, value) in &instance.properties {
                    let Some(value) = value.as_deref() else {
                        continue;
                    };
                    if matches(keyword, value, fuzzy) {
                        results.push(SearchResult {
                            result_type: SearchResultType::PropertyValue,
                            matched_text: value.to_string(),
                            matched_item: entity.name.clone(),
                            context: BTreeMap::from([
                                ("entity_name".to_string(), entity.name.clone()),
                                ("class_name".to_string(), instance.class_name.clone()),
                                ("property_name".to_string(), prop_name.clone()),
                                ("property_value".to_string(), value.to_string()),
                            ]),
                            score: score(keyword, value, fuzzy),
                        });
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Node detail and group views
    // ------------------------------------------------------------------

    /// Detail view for any node id: an entity name, a `"entity:class"` node
    /// id, or a class-master name.
    pub fn node_detail(&self, node_id: &str) -> Option<NodeDetail> {
        if node_id.contains(':') {
            return self.class_node_detail(node_id);
        }
        if self.graph.get_entity(node_id).is_some() {
            return self.entity_node_detail(node_id);
        }
        if self.graph.class_master_node(self.system, node_id).is_some() {
            return self.class_master_detail(node_id);
        }
        None
    }

    fn one_hop(&self, node_id: &str) -> (Vec<Relationship>, Vec<String>) {
        let relationships: Vec<Relationship> = self
            .graph
            .get_relationships(Some(node_id))
            .into_iter()
            .cloned()
            .collect();
        let key = node_id.to_uppercase();
        let mut neighbors = HashSet::new();
        for rel in &relationships {
            if rel.source.to_uppercase() == key {
                neighbors.insert(rel.target.clone());
            }
            if rel.target.to_uppercase() == key {
                neighbors.insert(rel.source.clone());
            }
        }
        let mut neighbors: Vec<String> = neighbors.into_iter().collect();
        neighbors.sort();
        (relationships, neighbors)
    }

    fn entity_node_detail(&self, entity_name: &str) -> Option<NodeDetail> {
        let entity = self.graph.get_entity(entity_name)?;
        let (relationships, neighbors) = self.one_hop(entity_name);
        let properties: BTreeMap<&str, BTreeMap<&String, &Option<String>>> = entity
            .classes
            .iter()
            .map(|c| (c.class_name.as_str(), c.properties.iter().collect()))
            .collect();
        Some(NodeDetail {
            node_id: entity.name.clone(),
            node_type: "entity",
            node_info: json!({
                "name": entity.name,
                "description": entity.description,
                "classes": entity.class_names(),
                "properties": properties,
            }),
            one_hop_relationships: relationships,
            one_hop_neighbors: neighbors,
        })
    }

    fn class_node_detail(&self, node_id: &str) -> Option<NodeDetail> {
        let (entity_name, class_name) = node_id.split_once(':')?;
        let node = self.graph.class_node(entity_name, class_name)?;
        let (relationships, neighbors) = self.one_hop(node_id);
        let properties = self
            .graph
            .get_entity(entity_name)
            .and_then(|e| e.class_instance(class_name))
            .map(|c| c.properties.clone())
            .unwrap_or_default();
        Some(NodeDetail {
            node_id: node.node_id(),
            node_type: "class_node",
            node_info: json!({
                "node_id": node.node_id(),
                "entity_name": node.entity_name,
                "class_name": node.class_name,
                "description": node.description,
                "properties": properties,
            }),
            one_hop_relationships: relationships,
            one_hop_neighbors: neighbors,
        })
    }

    fn class_master_detail(&self, class_name: &str) -> Option<NodeDetail> {
        let master = self.graph.class_master_node(self.system, class_name)?;
        let (relationships, neighbors) = self.one_hop(class_name);
        let properties = self
            .system
            .class(class_name)
            .map(|def| def.properties.clone())
            .unwrap_or_default();
        Some(NodeDetail {
            node_id: master.class_name.clone(),
            node_type: "class_master_node",
            node_info: json!({
                "class_name": master.class_name,
                "description": master.description,
                "properties": properties,
            }),
            one_hop_relationships: relationships,
            one_hop_neighbors: neighbors,
        })
    }

    /// The entity, its class-instance nodes, and every relationship touching
    /// any of those identifiers.
    pub fn entity_node_group(&self, entity_name: &str) -> Option<EntityNodeGroup> {
        let entity = self.graph.get_entity(entity_name)?.clone();
        let class_nodes: Vec<ClassNode> = self
            .graph
            .class_nodes(Some(entity_name))
            .into_iter()
            .cloned()
            .collect();

        let mut relationships: Vec<Relationship> = Vec::new();
        let push_unique = |rel: &Relationship, acc: &mut Vec<Relationship>| {
            if !acc.iter().any(|r| r.same_identity(rel)) {
                acc.push(rel.clone());
            }
        };
        for rel in self.graph.get_relationships(Some(entity_name)) {
            push_unique(rel, &mut relationships);
        }
        for node in &class_nodes {
            for rel in self.graph.get_relationships(Some(&node.node_id())) {
                push_unique(rel, &mut relationships);
            }
        }

        Some(EntityNodeGroup {
            entity,
            class_nodes,
            one_hop_relationships: relationships,
        })
    }

    /// The class-master node, all class-instance nodes of the class, and
    /// every relationship touching any of them.
    pub fn class_node_group(&self, class_name: &str) -> Option<ClassNodeGroup> {
        let class_master_node = self.graph.class_master_node(self.system, class_name)?;
        let key = class_name.to_uppercase();
        let class_nodes: Vec<ClassNode> = self
            .graph
            .class_nodes(None)
            .into_iter()
            .filter(|n| n.class_name.to_uppercase() == key)
            .cloned()
            .collect();

        let mut relationships: Vec<Relationship> = Vec::new();
        let push_unique = |rel: &Relationship, acc: &mut Vec<Relationship>| {
            if !acc.iter().any(|r| r.same_identity(rel)) {
                acc.push(rel.clone());
            }
        };
        for rel in self.graph.get_relationships(Some(class_name)) {
            push_unique(rel, &mut relationships);
        }
        for node in &class_nodes {
            for rel in self.graph.get_relationships(Some(&node.node_id())) {
                push_unique(rel, &mut relationships);
            }
        }

        Some(ClassNodeGroup {
            class_master_node,
            class_nodes,
            one_hop_relationships: relationships,
        })
    }
}

fn matches(keyword: &str, text: &str, fuzzy: bool) -> bool {
    if text.is_empty() {
        return false;
    }
    let keyword = keyword.to_lowercase();
    let text = text.to_lowercase();
    if fuzzy {
        text.contains(&keyword)
    } else {
        text == keyword
    }
}

/// Exact match scores 1.0, prefix 0.9, anything else scales with the share
/// of the text the keyword covers, capped at 0.8.
fn score(keyword: &str, text: &str, fuzzy: bool) -> f32 {
    if text.is_empty() {
        return 0.0;
    }
    let keyword = keyword.to_lowercase();
    let text = text.to_lowercase();
    if !fuzzy {
        return if keyword == text { 1.0 } else { 0.0 };
    }
    if keyword == text {
        return 1.0;
    }
    if text.starts_with(&keyword) {
        return 0.9;
    }
    let ratio = keyword.chars().count() as f32 / text.chars().count() as f32;
    (ratio * 2.0).min(0.8)
}

/// Hierarchical de-duplication: hits that are only a description, property
/// value, or refer entry are dropped once the owning node or relationship
/// itself matched.
fn deduplicate(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut found_entities = HashSet::new();
    let mut found_class_nodes = HashSet::new();
    let mut found_class_masters = HashSet::new();
    let mut found_relationships = HashSet::new();

    for result in &results {
        match result.result_type {
            SearchResultType::EntityName => {
                if let Some(name) = result.context.get("entity_name") {
                    found_entities.insert(name.clone());
                }
            }
            SearchResultType::ClassNode => {
                if let Some(node_id) = result.context.get("node_id") {
                    if result.matched_text == *node_id {
                        found_class_nodes.insert(node_id.clone());
                    }
                }
            }
            SearchResultType::ClassName => {
                if let Some(name) = result.context.get("class_name") {
                    found_class_masters.insert(name.clone());
                }
            }
            SearchResultType::RelationshipDescription => {
                if let (Some(source), Some(target)) =
                    (result.context.get("source"), result.context.get("target"))
                {
                    found_relationships.insert((source.clone(), target.clone()));
                }
            }
            _ => {}
        }
    }

    let before = results.len();
    let filtered: Vec<SearchResult> = results
        .into_iter()
        .filter(|result| match result.result_type {
            SearchResultType::EntityDescription | SearchResultType::PropertyValue => result
                .context
                .get("entity_name")
                .map_or(true, |name| !found_entities.contains(name)),
            SearchResultType::ClassNode => match result.context.get("node_id") {
                Some(node_id) if result.matched_text != *node_id => {
                    !found_class_nodes.contains(node_id)
                }
                _ => true,
            },
            SearchResultType::ClassDescription => result
                .context
                .get("class_name")
                .map_or(true, |name| !found_class_masters.contains(name)),
            SearchResultType::RelationshipRefer => {
                match (result.context.get("source"), result.context.get("target")) {
                    (Some(source), Some(target)) => {
                        !found_relationships.contains(&(source.clone(), target.clone()))
                    }
                    _ => true,
                }
            }
            _ => true,
        })
        .collect();

    if filtered.len() < before {
        debug!(removed = before - filtered.len(), "hierarchical de-duplication");
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ClassDefinition, Entity, PropertyDefinition, Relationship, ValidationMode,
    };

    fn setup() -> (System, Graph) {
        let mut system = System::new();
        system.add_class_definition(
            ClassDefinition::new("Platform")
                .with_description("an online platform")
                .with_property(
                    PropertyDefinition::new("founded").with_description("launch year"),
                ),
        );
        system.add_class_definition(ClassDefinition::new("Person"));

        let mut graph = Graph::new();
        let mut wechat = Entity::new("Wechat", "an instant messaging platform");
        wechat.add_class("Platform", &system).expect("defined");
        wechat
            .set_property("Platform", "founded", Some("2011".into()), &system)
            .expect("declared");
        graph
            .add_entity(wechat, &system, ValidationMode::Strict)
            .expect("valid");

        let mut user = Entity::new("User", "a person using wechat daily");
        user.add_class("Person", &system).expect("defined");
        graph
            .add_entity(user, &system, ValidationMode::Strict)
            .expect("valid");

        graph
            .add_relationship(
                Relationship::new("User", "Wechat", "opens wechat", 2)
                    .with_refer(vec!["Phone".into()]),
                &system,
            )
            .expect("endpoints exist");
        (system, graph)
    }

    #[test]
    fn test_exact_and_prefix_scores() {
        assert_eq!(score("wechat", "Wechat", true), 1.0);
        assert_eq!(score("we", "Wechat", true), 0.9);
        let contained = score("chat", "Wechat", true);
        assert!(contained > 0.0 && contained <= 0.8);
        assert_eq!(score("wechat", "Wechat", false), 1.0);
        assert_eq!(score("wech", "Wechat", false), 0.0);
    }

    #[test]
    fn test_strict_match_requires_equality() {
        let (system, graph) = setup();
        let engine = SearchEngine::new(&graph, &system);
        let results = engine.search_keyword("Wechat", false, None);
        assert!(results
            .iter()
            .all(|r| r.matched_text.eq_ignore_ascii_case("wechat")));
        assert!(!results.is_empty());
    }

    #[test]
    fn test_entity_name_hit_suppresses_description_and_values() {
        let (system, graph) = setup();
        let engine = SearchEngine::new(&graph, &system);
        // "wechat" hits the entity name, its description, the class node id,
        // the relationship description, and the user's description.
        let results = engine.search_keyword("wechat", true, None);

        assert!(results
            .iter()
            .any(|r| r.result_type == SearchResultType::EntityName));
        // No description/property-value hit may point at the Wechat entity.
        assert!(!results.iter().any(|r| {
            matches!(
                r.result_type,
                SearchResultType::EntityDescription | SearchResultType::PropertyValue
            ) && r.context.get("entity_name").map(String::as_str) == Some("Wechat")
        }));
        // The User's description hit survives (User's name did not match).
        assert!(results.iter().any(|r| {
            r.result_type == SearchResultType::EntityDescription
                && r.context.get("entity_name").map(String::as_str) == Some("User")
        }));
    }

    #[test]
    fn test_class_name_hit_suppresses_class_description() {
        let (system, graph) = setup();
        let engine = SearchEngine::new(&graph, &system);
        let results = engine.search_keyword("platform", true, None);
        assert!(results
            .iter()
            .any(|r| r.result_type == SearchResultType::ClassName));
        assert!(!results
            .iter()
            .any(|r| r.result_type == SearchResultType::ClassDescription
                && r.context.get("class_name").map(String::as_str) == Some("Platform")));
    }

    #[test]
    fn test_refer_hit_survives_without_relationship_hit() {
        let (system, graph) = setup();
        let engine = SearchEngine::new(&graph, &system);
        let results = engine.search_keyword("phone", true, None);
        assert!(results
            .iter()
            .any(|r| r.result_type == SearchResultType::RelationshipRefer));
    }

    #[test]
    fn test_results_sorted_and_limited() {
        let (system, graph) = setup();
        let engine = SearchEngine::new(&graph, &system);
        let results = engine.search_keyword("wechat", true, Some(2));
        assert!(results.len() <= 2);
        for window in results.windows(2) {
            assert!(window[0].score >= window[1].score);
        }
    }

    #[test]
    fn test_property_name_search() {
        let (system, graph) = setup();
        let engine = SearchEngine::new(&graph, &system);
        let results = engine.search_keyword("founded", true, None);
        assert!(results
            .iter()
            .any(|r| r.result_type == SearchResultType::PropertyName));
    }

    #[test]
    fn test_node_detail_entity() {
        let (system, graph) = setup();
        let engine = SearchEngine::new(&graph, &system);
        let detail = engine.node_detail("wechat").expect("entity exists");
        assert_eq!(detail.node_type, "entity");
        assert_eq!(detail.one_hop_relationships.len(), 1);
        assert_eq!(detail.one_hop_neighbors, vec!["User".to_string()]);
    }

    #[test]
    fn test_node_detail_class_node_and_master() {
        let (system, graph) = setup();
        let engine = SearchEngine::new(&graph, &system);

        let node = engine.node_detail("Wechat:Platform").expect("class node");
        assert_eq!(node.node_type, "class_node");
        assert_eq!(node.node_info["properties"]["founded"], "2011");

        let master = engine.node_detail("Platform").expect("class master");
        assert_eq!(master.node_type, "class_master_node");

        assert!(engine.node_detail("Ghost").is_none());
    }

    #[test]
    fn test_entity_node_group_collects_class_node_relationships() {
        let (system, mut graph) = setup();
        graph
            .add_relationship(
                Relationship::new("Wechat:Platform", "Platform", "instance of", 1),
                &system,
            )
            .expect("endpoints exist");
        let engine = SearchEngine::new(&graph, &system);

        let group = engine.entity_node_group("Wechat").expect("entity exists");
        assert_eq!(group.class_nodes.len(), 1);
        assert_eq!(group.one_hop_relationships.len(), 2);
    }

    #[test]
    fn test_class_node_group() {
        let (system, graph) = setup();
        let engine = SearchEngine::new(&graph, &system);
        let group = engine.class_node_group("platform").expect("class exists");
        assert_eq!(group.class_master_node.class_name, "Platform");
        assert_eq!(group.class_nodes.len(), 1);
        assert!(engine.class_node_group("Ghost").is_none());
    }
}
