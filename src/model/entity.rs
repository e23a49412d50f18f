//! Entities and the node types derived from them
//!
//! An entity carries one [`ClassInstance`] per class it belongs to; each
//! instance maps declared property names to optional values. Entities are
//! validated against a [`System`] either strictly (errors) or leniently
//! (warn and skip the offending class or property).
//!
//! Two further node kinds hang off entities:
//! - [`ClassNode`] - the "this entity carries this class" fact, addressed as
//!   `"entity:class"`, stored by the graph
//! - [`ClassMasterNode`] - the class itself, synthesized from the System on
//!   demand and never stored

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{GraphError, GraphResult};
use crate::model::system::System;

/// How validation failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Validation failures are errors
    Strict,
    /// Validation failures are warnings; the offending class or property is
    /// dropped from the entity
    Lenient,
}

/// One class membership of an entity, with its property values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassInstance {
    pub class_name: String,
    /// property name -> value; `None` means "declared but unset"
    #[serde(default)]
    pub properties: BTreeMap<String, Option<String>>,
}

impl ClassInstance {
    pub fn new(class_name: impl Into<String>) -> Self {
        ClassInstance {
            class_name: class_name.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Set a property value. A later write only overwrites an earlier one
    /// when it actually carries a value; empty writes never erase data.
    pub fn set_property(&mut self, name: &str, value: Option<String>) {
        let incoming = value.filter(|v| !v.trim().is_empty());
        match self.properties.get_mut(name) {
            Some(existing) => {
                if incoming.is_some() {
                    *existing = incoming;
                }
            }
            None => {
                self.properties.insert(name.to_string(), incoming);
            }
        }
    }

    pub fn property_value(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(|v| v.as_deref())
    }
}

/// An entity node, identified by its uppercased name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub classes: Vec<ClassInstance>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Entity {
            name: name.into(),
            description: description.into(),
            classes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Identity key (uppercased name).
    pub fn key(&self) -> String {
        self.name.to_uppercase()
    }

    pub fn has_class(&self, class_name: &str) -> bool {
        self.class_instance(class_name).is_some()
    }

    pub fn class_instance(&self, class_name: &str) -> Option<&ClassInstance> {
        let key = class_name.to_uppercase();
        self.classes
            .iter()
            .find(|c| c.class_name.to_uppercase() == key)
    }

    pub fn class_instance_mut(&mut self, class_name: &str) -> Option<&mut ClassInstance> {
        let key = class_name.to_uppercase();
        self.classes
            .iter_mut()
            .find(|c| c.class_name.to_uppercase() == key)
    }

    pub fn class_names(&self) -> Vec<&str> {
        self.classes.iter().map(|c| c.class_name.as_str()).collect()
    }

    /// Attach a class to this entity. The class must exist in the System;
    /// attaching an already-attached class is a no-op.
    pub fn add_class(&mut self, class_name: &str, system: &System) -> GraphResult<()> {
        let class_def = system
            .class(class_name)
            .ok_or_else(|| GraphError::ClassNotDefined(class_name.to_string()))?;
        if !self.has_class(class_name) {
            self.classes.push(ClassInstance::new(class_def.name.clone()));
            self.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Set a property value on one of this entity's class instances. The
    /// class must be attached and the property declared on it.
    pub fn set_property(
        &mut self,
        class_name: &str,
        property_name: &str,
        value: Option<String>,
        system: &System,
    ) -> GraphResult<()> {
        let class_def = system
            .class(class_name)
            .ok_or_else(|| GraphError::ClassNotDefined(class_name.to_string()))?;
        if !class_def.has_property(property_name) {
            return Err(GraphError::PropertyNotDeclared(
                class_def.name.clone(),
                property_name.to_string(),
            ));
        }
        let instance = self
            .class_instance_mut(class_name)
            .ok_or_else(|| GraphError::ClassNotDefined(class_name.to_string()))?;
        instance.set_property(property_name, value);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Replace the description when the incoming one actually says something.
    pub fn update_description(&mut self, description: &str) {
        if !description.trim().is_empty() && description != self.description {
            self.description = description.to_string();
            self.updated_at = Utc::now();
        }
    }

    /// Validate (and in lenient mode repair) this entity against a System.
    ///
    /// - unknown classes: error in strict mode, dropped in lenient mode
    /// - undeclared properties: error in strict mode, dropped in lenient mode
    /// - `required` properties are filled in with an unset value if missing
    /// - `value_required` properties without a non-empty value: error in
    ///   strict mode, warning in lenient mode
    pub fn validate(&mut self, system: &System, mode: ValidationMode) -> GraphResult<()> {
        let mut kept = Vec::with_capacity(self.classes.len());
        for mut instance in std::mem::take(&mut self.classes) {
            let Some(class_def) = system.class(&instance.class_name) else {
                match mode {
                    ValidationMode::Strict => {
                        return Err(GraphError::ClassNotDefined(instance.class_name));
                    }
                    ValidationMode::Lenient => {
                        warn!(
                            entity = %self.name,
                            class = %instance.class_name,
                            "dropping class not defined in the system"
                        );
                        continue;
                    }
                }
            };

            let mut dropped = Vec::new();
            for prop_name in instance.properties.keys().cloned().collect::<Vec<_>>() {
                if !class_def.has_property(&prop_name) {
                    match mode {
                        ValidationMode::Strict => {
                            return Err(GraphError::PropertyNotDeclared(
                                class_def.name.clone(),
                                prop_name,
                            ));
                        }
                        ValidationMode::Lenient => dropped.push(prop_name),
                    }
                }
            }
            for prop_name in dropped {
                warn!(
                    entity = %self.name,
                    class = %class_def.name,
                    property = %prop_name,
                    "dropping property not declared on the class"
                );
                instance.properties.remove(&prop_name);
            }

            for prop_def in &class_def.properties {
                if prop_def.required && !instance.properties.contains_key(&prop_def.name) {
                    instance.properties.insert(prop_def.name.clone(), None);
                }
                if prop_def.value_required
                    && instance.property_value(&prop_def.name).is_none()
                {
                    match mode {
                        ValidationMode::Strict => {
                            return Err(GraphError::PropertyValueRequired(
                                class_def.name.clone(),
                                prop_def.name.clone(),
                            ));
                        }
                        ValidationMode::Lenient => {
                            warn!(
                                entity = %self.name,
                                class = %class_def.name,
                                property = %prop_def.name,
                                "value-required property has no value"
                            );
                        }
                    }
                }
            }

            kept.push(instance);
        }
        self.classes = kept;
        Ok(())
    }
}

/// The "entity carries class" node, addressed as `"entity:class"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassNode {
    pub entity_name: String,
    pub class_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClassNode {
    pub fn new(
        entity_name: impl Into<String>,
        class_name: impl Into<String>,
        description: Option<String>,
    ) -> Self {
        let now = Utc::now();
        ClassNode {
            entity_name: entity_name.into(),
            class_name: class_name.into(),
            description,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node_id(&self) -> String {
        format!("{}:{}", self.entity_name, self.class_name)
    }

    pub fn key(&self) -> String {
        self.node_id().to_uppercase()
    }
}

/// The class itself as a node. Derived from the System, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMasterNode {
    pub class_name: String,
    #[serde(default)]
    pub description: Option<String>,
}
