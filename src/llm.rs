//! Completion-service seam
//!
//! The pipeline consumes a text completion service through one trait: given
//! a prompt template and variable bindings, return a string. The shipped
//! implementation talks to any OpenAI-compatible chat endpoint; tests plug
//! in scripted services.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};

/// A prompt template with `{variable}` placeholders.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    pub fn from_text(text: impl Into<String>) -> Self {
        PromptTemplate { text: text.into() }
    }

    pub fn load(path: &Path) -> GraphResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(PromptTemplate { text })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Substitute `{key}` placeholders. Unknown placeholders are left as-is.
    pub fn render(&self, vars: &HashMap<String, String>) -> String {
        let mut rendered = self.text.clone();
        for (key, value) in vars {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }
        rendered
    }
}

/// The text completion service the pipeline consumes.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Render the template with the bindings and return the service's reply.
    async fn complete(
        &self,
        template: &PromptTemplate,
        vars: &HashMap<String, String>,
        temperature: f32,
    ) -> GraphResult<String>;
}

/// Completion client for OpenAI-compatible chat endpoints.
pub struct HttpCompletion {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpCompletion {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        let base_url: String = base_url.into();
        HttpCompletion {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        }
    }
}

#[async_trait]
impl CompletionService for HttpCompletion {
    async fn complete(
        &self,
        template: &PromptTemplate,
        vars: &HashMap<String, String>,
        temperature: f32,
    ) -> GraphResult<String> {
        let prompt = template.render(vars);
        debug!(chars = prompt.len(), model = %self.model, "calling completion service");

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": temperature,
            }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GraphError::Upstream(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GraphError::Upstream(format!(
                "completion endpoint returned {status}: {body}"
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GraphError::Upstream(e.to_string()))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                GraphError::Parse("completion reply carries no message content".to_string())
            })?;
        debug!(chars = content.len(), "completion service replied");
        Ok(content.to_string())
    }
}

/// The prompt templates the pipeline knows about. Any of them may be absent;
/// a missing check template disables the check pass and a missing
/// smart-merge template forces simple merges.
#[derive(Default, Clone)]
pub struct PromptLibrary {
    pub system_update: Option<PromptTemplate>,
    pub extract_graph: Option<PromptTemplate>,
    pub check_extraction: Option<PromptTemplate>,
    pub smart_merge: Option<PromptTemplate>,
}

impl PromptLibrary {
    pub fn empty() -> Self {
        PromptLibrary::default()
    }

    /// Load templates from a directory, tolerating missing files.
    pub fn load(dir: &Path) -> Self {
        let load_one = |file: &str| {
            let path = dir.join(file);
            match PromptTemplate::load(&path) {
                Ok(template) => Some(template),
                Err(_) => {
                    warn!(path = %path.display(), "prompt template not found");
                    None
                }
            }
        };
        PromptLibrary {
            system_update: load_one("system_update.txt"),
            extract_graph: load_one("extract_graph.txt"),
            check_extraction: load_one("check_extraction.txt"),
            smart_merge: load_one("smart_merge.txt"),
        }
    }
}

/// Convenience constructor for the variable map.
pub fn vars<const N: usize>(pairs: [(&str, String); N]) -> HashMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
