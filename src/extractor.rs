//! Graph extractor
//!
//! Turns a piece of text into entities and relationships by prompting the
//! completion service once (plus an optional check/optimize pass) and
//! parsing the single reply. The reply is split into four sections on a
//! section delimiter:
//!
//! - Step 0: property suggestions `("new_property"|class|property|description|reason)`,
//!   applied to the working System; sentinel `NO_NEW_PROPERTIES` skips it
//! - Step 1: entities `("entity"|name|description)` (no classes yet)
//! - Step 2: class bindings `("class_property"|entity|class|property|value)`;
//!   a `NONE` property or value attaches the class without setting anything
//! - Step 3: relationships
//!   `("relationship"|source|target|description|count|refer_list|semantic_time)`
//!
//! Parsing is deliberately forgiving: `**` markers around delimiters,
//! comment lines starting with `#`, title lines, and mixed multi-line
//! records are all tolerated. Legacy three-section replies get an empty
//! Step 0 inserted; replies without section delimiters fall back to a
//! prefix scan over all records.

use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::error::GraphResult;
use crate::llm::{vars, CompletionService, PromptTemplate};
use crate::model::{Entity, PropertyDefinition, Relationship, System, ValidationMode};

/// Separator between the four reply sections.
pub const SECTION_DELIMITER: &str = "SECTION_DELIMITER";
/// Step-0 sentinel: no property suggestions.
pub const NO_NEW_PROPERTIES: &str = "NO_NEW_PROPERTIES";
/// Field sentinel: not applicable / not mentioned.
pub const NONE_SENTINEL: &str = "NONE";

const RECORD_PREFIXES: [&str; 4] = [
    "(\"entity\"",
    "(\"class_property\"",
    "(\"relationship\"",
    "(\"new_property\"",
];

/// Output of one extraction run.
#[derive(Debug)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub raw_response: String,
}

/// Prompted entity/relationship extractor.
pub struct GraphExtractor<'a> {
    completion: &'a dyn CompletionService,
    extract_template: &'a PromptTemplate,
    check_template: Option<&'a PromptTemplate>,
    options: &'a ExtractionConfig,
    temperature: f32,
}

impl<'a> GraphExtractor<'a> {
    pub fn new(
        completion: &'a dyn CompletionService,
        extract_template: &'a PromptTemplate,
        check_template: Option<&'a PromptTemplate>,
        options: &'a ExtractionConfig,
        temperature: f32,
    ) -> Self {
        GraphExtractor {
            completion,
            extract_template,
            check_template: if options.enable_check {
                check_template
            } else {
                None
            },
            options,
            temperature,
        }
    }

    /// Run the prompted extraction against the working System.
    ///
    /// Step-0 property suggestions mutate the System before the final
    /// lenient re-validation of every parsed entity.
    pub async fn extract(&self, system: &mut System, text: &str) -> GraphResult<Extraction> {
        let class_names = system.class_names();
        let entity_types = class_names.join(",");
        let classes_info = classes_info(system);
        let base_entities_info = base_entities_info(system);

        debug!(classes = class_names.len(), "calling completion service for extraction");
        let mut response = self
            .completion
            .complete(
                self.extract_template,
                &vars([
                    ("input_text", text.to_string()),
                    ("entity_types", entity_types.clone()),
                    ("tuple_delimiter", self.options.tuple_delimiter.clone()),
                    ("record_delimiter", self.options.record_delimiter.clone()),
                    (
                        "completion_delimiter",
                        self.options.completion_delimiter.clone(),
                    ),
                    ("language", self.options.language.clone()),
                    ("classes_info", classes_info),
                    ("base_entities_info", base_entities_info),
                ]),
                self.temperature,
            )
            .await?;

        if let Some(check_template) = self.check_template {
            debug!("running check pass over the extraction reply");
            response = self
                .completion
                .complete(
                    check_template,
                    &vars([
                        ("input_text", text.to_string()),
                        ("extraction_result", response.clone()),
                        ("entity_types", entity_types),
                    ]),
                    0.3,
                )
                .await?;
        }

        let (entities, relationships) = self.parse_response(system, &response);
        info!(
            entities = entities.len(),
            relationships = relationships.len(),
            "extraction parsed"
        );
        Ok(Extraction {
            entities,
            relationships,
            raw_response: response,
        })
    }

    /// Parse a raw reply into entities and relationships. Public so the
    /// check pass and tests can drive the parser directly.
    pub fn parse_response(
        &self,
        system: &mut System,
        response: &str,
    ) -> (Vec<Entity>, Vec<Relationship>) {
        let cleaned = response
            .replace(&self.options.completion_delimiter, "")
            .replace("**", "");
        let cleaned = cleaned.trim();

        let sections: Vec<&str> = cleaned.split(SECTION_DELIMITER).collect();
        let (step0, step1, step2, step3) = match sections.len() {
            n if n >= 4 => (sections[0], sections[1], sections[2], sections[3]),
            3 => {
                // Legacy three-section reply: no property-suggestion step.
                debug!("three-section reply, inserting empty step 0");
                (NO_NEW_PROPERTIES, sections[0], sections[1], sections[2])
            }
            _ => {
                warn!("reply has no section structure, falling back to prefix scan");
                return self.parse_legacy(system, cleaned);
            }
        };

        self.apply_property_suggestions(system, step0);

        // Step 1: entities (name + description only)
        let mut entities: Vec<Entity> = Vec::new();
        for record in self.split_records(step1) {
            match self.parse_entity_stub(&record) {
                Some(entity) => {
                    debug!(entity = %entity.name, "parsed entity");
                    if !entities.iter().any(|e| e.key() == entity.key()) {
                        entities.push(entity);
                    }
                }
                None => warn!(record = %truncate(&record, 100), "unparseable entity record"),
            }
        }

        // Step 2: class/property bindings
        for record in self.split_records(step2) {
            self.apply_class_property(system, &record, &mut entities);
        }

        // Step 3: relationships
        let mut relationships = Vec::new();
        for record in self.split_records(step3) {
            if let Some(relationship) = self.parse_relationship(&record) {
                debug!(
                    source = %relationship.source,
                    target = %relationship.target,
                    "parsed relationship"
                );
                relationships.push(relationship);
            }
        }

        // Final lenient validation against the (possibly step-0-extended)
        // System; invalid entities are skipped, not fatal.
        let mut validated = Vec::with_capacity(entities.len());
        for mut entity in entities {
            match entity.validate(system, ValidationMode::Lenient) {
                Ok(()) => validated.push(entity),
                Err(e) => warn!(entity = %entity.name, error = %e, "skipping invalid entity"),
            }
        }

        (validated, relationships)
    }

    /// Prefix-scan fallback for replies without section delimiters. Entity
    /// records carry classes inline: `("entity"|name|class1,class2|description)`.
    fn parse_legacy(
        &self,
        system: &mut System,
        response: &str,
    ) -> (Vec<Entity>, Vec<Relationship>) {
        let mut entities = Vec::new();
        let mut relationships = Vec::new();
        for record in self.split_records(response) {
            if record.starts_with("(\"entity\"") {
                if let Some(entity) = self.parse_legacy_entity(system, &record) {
                    entities.push(entity);
                }
            } else if record.starts_with("(\"relationship\"") {
                if let Some(relationship) = self.parse_relationship(&record) {
                    relationships.push(relationship);
                }
            }
        }
        (entities, relationships)
    }

    fn parse_legacy_entity(&self, system: &System, record: &str) -> Option<Entity> {
        let parts = self.split_fields(record);
        if parts.len() < 4 || parts[0] != "entity" {
            return None;
        }
        let mut entity = Entity::new(&parts[1], &parts[3]);
        for class_name in parts[2].split(',').map(str::trim).filter(|c| !c.is_empty()) {
            if let Err(e) = entity.add_class(class_name, system) {
                warn!(entity = %entity.name, class = class_name, error = %e, "skipping class");
            }
        }
        Some(entity)
    }

    /// Apply step-0 property suggestions to the working System.
    fn apply_property_suggestions(&self, system: &mut System, step0: &str) {
        if step0.contains(NO_NEW_PROPERTIES) {
            debug!("no property suggestions");
            return;
        }
        let mut applied = 0usize;
        for record in self.split_records(step0) {
            let Some((class_name, prop_name, prop_desc, reason)) =
                self.parse_property_suggestion(&record)
            else {
                warn!(record = %truncate(&record, 100), "unparseable property suggestion");
                continue;
            };
            let Some(class_def) = system.class(&class_name) else {
                warn!(class = %class_name, property = %prop_name, "suggested class is unknown");
                continue;
            };
            if class_def.has_property(&prop_name) {
                debug!(class = %class_name, property = %prop_name, "property already declared");
                continue;
            }
            // Suggested properties default to optional.
            let property = PropertyDefinition::new(prop_name.clone())
                .with_description(prop_desc);
            if system.add_property(&class_name, property).is_ok() {
                applied += 1;
                info!(class = %class_name, property = %prop_name, reason = %reason, "new property added");
            }
        }
        if applied > 0 {
            info!(count = applied, "step 0 extended the catalog");
        }
    }

    fn parse_property_suggestion(&self, record: &str) -> Option<(String, String, String, String)> {
        let parts = self.split_fields(record);
        if parts.len() < 5 || parts[0] != "new_property" {
            return None;
        }
        Some((
            parts[1].clone(),
            parts[2].clone(),
            parts[3].clone(),
            parts[4].clone(),
        ))
    }

    /// `("entity"|NAME|DESCRIPTION)` - classes come later in step 2.
    fn parse_entity_stub(&self, record: &str) -> Option<Entity> {
        let parts = self.split_fields(record);
        if parts.len() < 3 || parts[0] != "entity" {
            return None;
        }
        Some(Entity::new(&parts[1], &parts[2]))
    }

    /// `("class_property"|ENTITY|CLASS|PROPERTY|VALUE)`; `NONE` in property
    /// or value attaches the class without setting a property.
    fn apply_class_property(&self, system: &System, record: &str, entities: &mut [Entity]) {
        let parts = self.split_fields(record);
        if parts.len() < 5 || parts[0] != "class_property" {
            return;
        }
        let (entity_name, class_name, property_name, property_value) =
            (&parts[1], &parts[2], &parts[3], &parts[4]);

        let key = entity_name.to_uppercase();
        let Some(entity) = entities.iter_mut().find(|e| e.key() == key) else {
            warn!(entity = %entity_name, "class binding references unknown entity");
            return;
        };

        if property_name.to_uppercase() == NONE_SENTINEL
            || property_value.to_uppercase() == NONE_SENTINEL
        {
            if let Err(e) = entity.add_class(class_name, system) {
                warn!(entity = %entity_name, class = %class_name, error = %e, "cannot attach class");
            }
            return;
        }

        if !entity.has_class(class_name) {
            if let Err(e) = entity.add_class(class_name, system) {
                warn!(entity = %entity_name, class = %class_name, error = %e, "cannot attach class");
                return;
            }
        }
        if let Err(e) = entity.set_property(
            class_name,
            property_name,
            Some(property_value.clone()),
            system,
        ) {
            warn!(
                entity = %entity_name,
                class = %class_name,
                property = %property_name,
                error = %e,
                "cannot set property"
            );
        }
    }

    /// `("relationship"|source|target|DESCRIPTION|COUNT|REFER_LIST|SEMANTIC_TIME)`.
    /// `REFER_LIST` is a comma-separated list (Chinese comma tolerated) or
    /// `NONE`; `SEMANTIC_TIME` is ISO-8601 or `NONE`. Both fields are
    /// optional for older reply formats.
    fn parse_relationship(&self, record: &str) -> Option<Relationship> {
        let parts = self.split_fields(record);
        if parts.len() < 5 || parts[0] != "relationship" {
            return None;
        }
        let count: u32 = parts[4].parse().ok()?;

        let mut refer = Vec::new();
        if let Some(refer_str) = parts.get(5) {
            if !refer_str.is_empty() && refer_str.to_uppercase() != NONE_SENTINEL {
                let normalized = refer_str.replace('，', ",");
                refer = normalized
                    .split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect();
            }
        }

        let mut semantic_times = Vec::new();
        if let Some(time_str) = parts.get(6) {
            if !time_str.is_empty() && time_str.to_uppercase() != NONE_SENTINEL {
                semantic_times.push(time_str.clone());
            }
        }

        Some(
            Relationship::new(&parts[1], &parts[2], &parts[3], count)
                .with_refer(refer)
                .with_semantic_times(semantic_times),
        )
    }

    /// Strip the surrounding parentheses/quotes of a record and split it on
    /// the tuple delimiter, trimming quotes around each field.
    fn split_fields(&self, record: &str) -> Vec<String> {
        let trimmed = record
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')');
        trimmed
            .split(&self.options.tuple_delimiter)
            .map(|p| p.trim().trim_matches('"').trim_matches('\'').to_string())
            .collect()
    }

    /// Split a section into records, dropping comment lines, title lines,
    /// and blank records; mixed multi-line records are re-scanned line by
    /// line for anything starting with a known record prefix.
    fn split_records(&self, text: &str) -> Vec<String> {
        let raw: Vec<&str> = if self.options.record_delimiter == "\n" {
            text.lines().collect()
        } else {
            text.split(&self.options.record_delimiter).collect()
        };

        let mut records = Vec::new();
        for chunk in raw {
            let chunk = chunk.trim();
            if chunk.is_empty() || chunk.starts_with('#') {
                continue;
            }

            if RECORD_PREFIXES.iter().any(|p| chunk.contains(p)) {
                if chunk.contains('\n') {
                    // A title or stray text got glued to real records; keep
                    // only the lines that are records.
                    for line in chunk.lines() {
                        let line = line.trim();
                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }
                        if RECORD_PREFIXES.iter().any(|p| line.starts_with(p)) {
                            records.push(line.to_string());
                        }
                    }
                } else {
                    records.push(chunk.to_string());
                }
                continue;
            }

            if is_title_line(chunk) {
                debug!(line = %truncate(chunk, 50), "dropping title line");
                continue;
            }

            records.push(chunk.to_string());
        }
        records
    }
}

fn is_title_line(line: &str) -> bool {
    (line.starts_with("STEP") && line.contains(':'))
        || line == "Entities:"
        || line == "Classes and Properties:"
        || line == "Relationships:"
        || line.starts_with("STEP 0")
        || line.starts_with("STEP 1")
        || line.starts_with("STEP 2")
        || line.starts_with("STEP 3")
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Human-readable catalog summary for the extraction prompt.
pub fn classes_info(system: &System) -> String {
    let mut blocks = Vec::new();
    for name in system.class_names() {
        let Some(class_def) = system.class(&name) else {
            continue;
        };
        let mut lines = Vec::new();
        for prop in &class_def.properties {
            let required = if prop.required { "required" } else { "optional" };
            let value_required = if prop.value_required {
                "value required"
            } else {
                "value optional"
            };
            lines.push(format!(
                "    - {} ({required}, {value_required}): {}",
                prop.name,
                prop.description.as_deref().unwrap_or("no description")
            ));
        }
        let props = if lines.is_empty() {
            "    - no properties".to_string()
        } else {
            lines.join("\n")
        };
        blocks.push(format!(
            "- {}: {}\n{}",
            class_def.name,
            class_def.description.as_deref().unwrap_or("no description"),
            props
        ));
    }
    blocks.join("\n\n")
}

/// Predefined-entity summary for the extraction prompt.
pub fn base_entities_info(system: &System) -> String {
    if system.predefined_entities.is_empty() {
        return "No predefined base entities".to_string();
    }
    let mut lines = vec![
        "The following entities are pre-defined. If the text mentions them, use their pre-defined classes:"
            .to_string(),
    ];
    for entity in &system.predefined_entities {
        let classes = if entity.classes.is_empty() {
            "no classes".to_string()
        } else {
            entity.classes.join(", ")
        };
        lines.push(format!("- \"{}\" [{classes}]", entity.name));
    }
    lines.join("\n")
}
