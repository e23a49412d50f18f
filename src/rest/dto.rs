//! Request bodies and query parameters for the REST surface.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::model::PropertyDefinition;

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub input_text: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub keyword: String,
    #[serde(default = "default_fuzzy")]
    pub fuzzy: bool,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_fuzzy() -> bool {
    true
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct CreateClassRequest {
    pub class_name: String,
    pub description: String,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateClassRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct AddPropertyRequest {
    pub property_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub value_required: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEntityRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub add_classes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEntityPropertyRequest {
    pub class_name: String,
    pub property_name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct AddClassToEntityRequest {
    pub class_name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseFileRequest {
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameDatabaseRequest {
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Deserialize)]
pub struct AutoSaveRequest {
    pub enabled: bool,
}
