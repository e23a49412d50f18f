//! System updater
//!
//! Asks the completion service whether the class catalog is sufficient for a
//! piece of text and, when it is not, applies the returned class/property
//! configuration additively to the working System. Three outcomes:
//!
//! 1. the reply signals sufficiency -> the System is returned unchanged
//! 2. the reply parses as a catalog configuration -> applied additively,
//!    recording which classes were added vs enhanced
//! 3. the reply is neither -> logged and treated as (1)
//!
//! The updater never deletes anything and never fails the task; at worst it
//! reports "no change".

use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::llm::{vars, CompletionService, PromptTemplate};
use crate::model::{CatalogChange, ClassDefinition, PropertyDefinition, System};

/// Sentinel the completion service uses to signal the catalog is adequate.
pub const SUFFICIENT_SENTINEL: &str = "SUFFICIENT";

/// What the updater did to the working System.
#[derive(Debug, Clone, Default)]
pub struct SystemUpdate {
    pub needed: bool,
    pub added_classes: Vec<String>,
    pub enhanced_classes: Vec<String>,
    pub details: String,
    pub raw_response: Option<String>,
}

/// Incoming catalog configuration, as replied by the completion service.
#[derive(Debug, Deserialize)]
struct CatalogConfig {
    #[serde(default)]
    classes: BTreeMap<String, ClassConfig>,
}

#[derive(Debug, Deserialize)]
struct ClassConfig {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    properties: Vec<PropertyConfig>,
}

#[derive(Debug, Deserialize)]
struct PropertyConfig {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    value_required: bool,
}

/// Consults the completion service about catalog sufficiency.
pub struct SystemUpdater<'a> {
    completion: &'a dyn CompletionService,
    template: Option<&'a PromptTemplate>,
}

impl<'a> SystemUpdater<'a> {
    pub fn new(
        completion: &'a dyn CompletionService,
        template: Option<&'a PromptTemplate>,
    ) -> Self {
        SystemUpdater {
            completion,
            template,
        }
    }

    /// Check the catalog against the text and apply any additive changes.
    pub async fn check_and_update(&self, system: &mut System, text: &str) -> SystemUpdate {
        let Some(template) = self.template else {
            debug!("no system-update prompt configured, keeping catalog as is");
            return SystemUpdate {
                details: "no system-update prompt configured".to_string(),
                ..SystemUpdate::default()
            };
        };

        let system_json = serialize_catalog(system);
        let response = match self
            .completion
            .complete(
                template,
                &vars([("system_json", system_json), ("text", text.to_string())]),
                0.3,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "system-update consult failed, keeping catalog as is");
                return SystemUpdate {
                    details: format!("completion service unavailable: {e}"),
                    ..SystemUpdate::default()
                };
            }
        };

        debug!(chars = response.len(), "system-update reply received");

        if response.to_uppercase().contains(SUFFICIENT_SENTINEL) {
            debug!("catalog judged sufficient");
            return SystemUpdate {
                details: "existing catalog is sufficient".to_string(),
                raw_response: Some(response),
                ..SystemUpdate::default()
            };
        }

        let config = match parse_catalog_config(&response) {
            Some(config) if !config.classes.is_empty() => config,
            _ => {
                warn!("system-update reply is neither a sufficiency signal nor a catalog config");
                return SystemUpdate {
                    details: "reply not parseable as a catalog configuration".to_string(),
                    raw_response: Some(response),
                    ..SystemUpdate::default()
                };
            }
        };

        info!(classes = config.classes.len(), "extending catalog from system-update reply");
        let (added, enhanced) = apply_catalog_config(system, config);
        let details = format!(
            "{} classes added, {} classes enhanced",
            added.len(),
            enhanced.len()
        );
        SystemUpdate {
            needed: true,
            added_classes: added,
            enhanced_classes: enhanced,
            details,
            raw_response: Some(response),
        }
    }
}

/// Serialize the catalog as JSON for the prompt.
pub fn serialize_catalog(system: &System) -> String {
    let classes: serde_json::Map<String, serde_json::Value> = system
        .class_names()
        .iter()
        .filter_map(|name| {
            system
                .class(name)
                .map(|def| (def.name.clone(), json!(def)))
        })
        .collect();
    serde_json::to_string_pretty(&json!({ "classes": classes })).unwrap_or_default()
}

/// Strip markdown code fences wrapping a JSON payload.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let re = regex::Regex::new(r"(?s)^```(?:json)?\s*\n(.*?)\n?```\s*$").expect("valid regex");
    match re.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

fn parse_catalog_config(response: &str) -> Option<CatalogConfig> {
    let cleaned = strip_code_fences(response);
    serde_json::from_str(&cleaned).ok()
}

fn apply_catalog_config(system: &mut System, config: CatalogConfig) -> (Vec<String>, Vec<String>) {
    let mut added = Vec::new();
    let mut enhanced = Vec::new();
    for (name, class_config) in config.classes {
        let mut class_def = ClassDefinition::new(name.clone());
        class_def.description = class_config.description;
        for prop in class_config.properties {
            class_def.properties.push(PropertyDefinition {
                name: prop.name,
                description: prop.description,
                required: prop.required,
                value_required: prop.value_required,
            });
        }
        match system.add_class_definition(class_def) {
            CatalogChange::Added => added.push(name),
            CatalogChange::Enhanced => enhanced.push(name),
        }
    }
    (added, enhanced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphResult;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FixedReply(String);

    #[async_trait]
    impl CompletionService for FixedReply {
        async fn complete(
            &self,
            _template: &PromptTemplate,
            _vars: &HashMap<String, String>,
            _temperature: f32,
        ) -> GraphResult<String> {
            Ok(self.0.clone())
        }
    }

    struct FailingService;

    #[async_trait]
    impl CompletionService for FailingService {
        async fn complete(
            &self,
            _template: &PromptTemplate,
            _vars: &HashMap<String, String>,
            _temperature: f32,
        ) -> GraphResult<String> {
            Err(crate::error::GraphError::Upstream("down".into()))
        }
    }

    fn template() -> PromptTemplate {
        PromptTemplate::from_text("catalog: {system_json}\ntext: {text}")
    }

    #[tokio::test]
    async fn test_sufficient_reply_keeps_catalog() {
        let service = FixedReply("The catalog is SUFFICIENT for this text.".into());
        let template = template();
        let updater = SystemUpdater::new(&service, Some(&template));
        let mut system = System::new();
        system.add_class_definition(ClassDefinition::new("Person"));

        let update = updater.check_and_update(&mut system, "some text").await;
        assert!(!update.needed);
        assert_eq!(system.class_count(), 1);
        assert!(update.raw_response.is_some());
    }

    #[tokio::test]
    async fn test_config_reply_extends_catalog() {
        let reply = r#"```json
{
  "classes": {
    "Platform": {
      "description": "an online platform",
      "properties": [
        {"name": "founded", "description": "launch year"}
      ]
    },
    "Person": {
      "description": "a human",
      "properties": []
    }
  }
}
```"#;
        let service = FixedReply(reply.into());
        let template = template();
        let updater = SystemUpdater::new(&service, Some(&template));
        let mut system = System::new();
        system.add_class_definition(ClassDefinition::new("Person"));

        let update = updater.check_and_update(&mut system, "text").await;
        assert!(update.needed);
        assert_eq!(update.added_classes, vec!["Platform".to_string()]);
        assert_eq!(update.enhanced_classes, vec!["Person".to_string()]);
        assert!(system.has_class("Platform"));
        assert!(system
            .class("Platform")
            .expect("added")
            .has_property("founded"));
        assert_eq!(
            system.class("Person").expect("kept").description.as_deref(),
            Some("a human")
        );
    }

    #[tokio::test]
    async fn test_garbage_reply_treated_as_sufficient() {
        let service = FixedReply("I am not sure what you mean.".into());
        let template = template();
        let updater = SystemUpdater::new(&service, Some(&template));
        let mut system = System::new();

        let update = updater.check_and_update(&mut system, "text").await;
        assert!(!update.needed);
        assert_eq!(system.class_count(), 0);
    }

    #[tokio::test]
    async fn test_upstream_failure_never_fails_task() {
        let service = FailingService;
        let template = template();
        let updater = SystemUpdater::new(&service, Some(&template));
        let mut system = System::new();

        let update = updater.check_and_update(&mut system, "text").await;
        assert!(!update.needed);
        assert!(update.details.contains("unavailable"));
    }

    #[tokio::test]
    async fn test_missing_template_is_a_no_op() {
        let service = FixedReply("whatever".into());
        let updater = SystemUpdater::new(&service, None);
        let mut system = System::new();
        let update = updater.check_and_update(&mut system, "text").await;
        assert!(!update.needed);
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }
}
