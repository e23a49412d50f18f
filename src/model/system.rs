//! System - the append-only class catalog
//!
//! The System is the single source of truth for the type layer: class
//! definitions, their property declarations, and the predefined entities
//! instantiated when a graph is created. The catalog is append-only; classes
//! and properties can be added or enhanced, never removed or renamed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{GraphError, GraphResult};

/// Declaration of a property on a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the property must appear on every instance of the class
    #[serde(default)]
    pub required: bool,
    /// Whether an appearing property must carry a non-empty value
    #[serde(default)]
    pub value_required: bool,
}

impl PropertyDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        PropertyDefinition {
            name: name.into(),
            description: None,
            required: false,
            value_required: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn value_required(mut self, value_required: bool) -> Self {
        self.value_required = value_required;
        self
    }
}

/// Definition of a class in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

impl ClassDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        ClassDefinition {
            name: name.into(),
            description: None,
            properties: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_property(mut self, property: PropertyDefinition) -> Self {
        self.properties.push(property);
        self
    }

    /// Look up a property declaration by name.
    pub fn property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.property(name).is_some()
    }

    pub fn property_names(&self) -> Vec<&str> {
        self.properties.iter().map(|p| p.name.as_str()).collect()
    }

    /// Fold another definition of the same class into this one, additively.
    ///
    /// The description is overwritten when the incoming one is supplied.
    /// Unknown properties are appended; known properties get their
    /// description overwritten when supplied and their flags strengthened
    /// (a property never stops being required).
    fn enhance(&mut self, incoming: ClassDefinition) {
        if incoming.description.is_some() {
            self.description = incoming.description;
        }
        for prop in incoming.properties {
            match self.properties.iter_mut().find(|p| p.name == prop.name) {
                Some(existing) => {
                    if prop.description.is_some() {
                        existing.description = prop.description;
                    }
                    existing.required |= prop.required;
                    existing.value_required |= prop.value_required;
                }
                None => self.properties.push(prop),
            }
        }
    }
}

/// An entity seeded into every graph created from this System.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredefinedEntity {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub classes: Vec<String>,
}

/// Outcome of [`System::add_class_definition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogChange {
    Added,
    Enhanced,
}

/// The append-only class catalog plus predefined entities.
///
/// Class names are keyed case-insensitively; the original spelling is kept
/// inside the definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct System {
    classes: BTreeMap<String, ClassDefinition>,
    #[serde(default)]
    pub predefined_entities: Vec<PredefinedEntity>,
}

impl System {
    pub fn new() -> Self {
        System::default()
    }

    fn key(name: &str) -> String {
        name.to_uppercase()
    }

    /// Look up a class definition, case-insensitively.
    pub fn class(&self, name: &str) -> Option<&ClassDefinition> {
        self.classes.get(&Self::key(name))
    }

    pub fn has_class(&self, name: &str) -> bool {
        self.classes.contains_key(&Self::key(name))
    }

    /// Original class names, ordered by their case-folded key.
    pub fn class_names(&self) -> Vec<String> {
        self.classes.values().map(|c| c.name.clone()).collect()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Add a class, or enhance the existing one with the same name.
    ///
    /// Never removes or renames anything; see [`ClassDefinition::enhance`]
    /// for the merge rules.
    pub fn add_class_definition(&mut self, class_def: ClassDefinition) -> CatalogChange {
        let key = Self::key(&class_def.name);
        match self.classes.get_mut(&key) {
            Some(existing) => {
                existing.enhance(class_def);
                CatalogChange::Enhanced
            }
            None => {
                self.classes.insert(key, class_def);
                CatalogChange::Added
            }
        }
    }

    /// Append a property to an existing class.
    ///
    /// A property that already exists is enhanced in place, the same way
    /// [`System::add_class_definition`] treats it.
    pub fn add_property(
        &mut self,
        class_name: &str,
        property: PropertyDefinition,
    ) -> GraphResult<()> {
        let class_def = self
            .classes
            .get_mut(&Self::key(class_name))
            .ok_or_else(|| GraphError::ClassNotDefined(class_name.to_string()))?;
        match class_def.properties.iter_mut().find(|p| p.name == property.name) {
            Some(existing) => {
                if property.description.is_some() {
                    existing.description = property.description;
                }
                existing.required |= property.required;
                existing.value_required |= property.value_required;
            }
            None => class_def.properties.push(property),
        }
        Ok(())
    }

    pub fn add_predefined_entity(&mut self, entity: PredefinedEntity) {
        self.predefined_entities.push(entity);
    }

    /// Rebuild a System from a bare class map (legacy snapshot fallback).
    pub fn from_class_definitions(
        classes: impl IntoIterator<Item = (String, ClassDefinition)>,
    ) -> Self {
        let mut system = System::new();
        for (_, def) in classes {
            system.add_class_definition(def);
        }
        system
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform_class() -> ClassDefinition {
        ClassDefinition::new("Platform")
            .with_description("an online platform")
            .with_property(PropertyDefinition::new("founded").with_description("launch year"))
    }

    #[test]
    fn test_add_and_lookup_case_insensitive() {
        let mut system = System::new();
        assert_eq!(
            system.add_class_definition(platform_class()),
            CatalogChange::Added
        );

        assert!(system.has_class("platform"));
        assert!(system.has_class("PLATFORM"));
        let def = system.class("pLaTfOrM").expect("found");
        assert_eq!(def.name, "Platform");
    }

    #[test]
    fn test_enhance_unions_properties() {
        let mut system = System::new();
        system.add_class_definition(platform_class());

        let update = ClassDefinition::new("Platform")
            .with_description("a platform for online services")
            .with_property(PropertyDefinition::new("headquarters"))
            .with_property(
                PropertyDefinition::new("founded").required(true),
            );
        assert_eq!(system.add_class_definition(update), CatalogChange::Enhanced);

        let def = system.class("Platform").expect("found");
        assert_eq!(
            def.description.as_deref(),
            Some("a platform for online services")
        );
        assert_eq!(def.properties.len(), 2);
        // Flags only strengthen, description of 'founded' survives.
        let founded = def.property("founded").expect("declared");
        assert!(founded.required);
        assert_eq!(founded.description.as_deref(), Some("launch year"));
    }

    #[test]
    fn test_enhance_never_removes() {
        let mut system = System::new();
        system.add_class_definition(platform_class());
        system.add_class_definition(ClassDefinition::new("Platform"));

        let def = system.class("Platform").expect("found");
        assert!(def.has_property("founded"));
        // Missing incoming description leaves the existing one untouched.
        assert_eq!(def.description.as_deref(), Some("an online platform"));
    }

    #[test]
    fn test_add_property() {
        let mut system = System::new();
        system.add_class_definition(platform_class());

        system
            .add_property("platform", PropertyDefinition::new("user_count"))
            .expect("class exists");
        assert!(system.class("Platform").expect("found").has_property("user_count"));

        let err = system
            .add_property("Ghost", PropertyDefinition::new("x"))
            .expect_err("unknown class");
        assert!(matches!(err, GraphError::ClassNotDefined(_)));
    }

    #[test]
    fn test_from_class_definitions() {
        let system = System::from_class_definitions(vec![
            ("PLATFORM".to_string(), platform_class()),
            ("PERSON".to_string(), ClassDefinition::new("Person")),
        ]);
        assert_eq!(system.class_count(), 2);
        assert!(system.has_class("Person"));
        assert!(system.predefined_entities.is_empty());
    }

    #[test]
    fn test_class_names_keep_original_spelling() {
        let mut system = System::new();
        system.add_class_definition(ClassDefinition::new("ShoppingPlatform"));
        system.add_class_definition(ClassDefinition::new("person"));
        assert_eq!(system.class_names(), vec!["person", "ShoppingPlatform"]);
    }
}
