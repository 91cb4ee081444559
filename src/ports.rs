//! Seams between the engine and the outside world: the browser page, the
//! structured-completion LLM, and the scenario normalizer.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::types::{CandidateAction, PageDiagnostics, ProbeKind, ProbeValue, Scenario};

/// Browser control primitives.
#[async_trait]
pub trait PageAutomation: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()>;

    /// `state` is `"load"` or `"domcontentloaded"`.
    async fn wait_for_load(&self, state: &str, timeout: Duration) -> Result<()>;

    async fn current_location(&self) -> Result<String>;

    /// Candidates for a natural-language element description, best first.
    async fn locate(&self, query: &str) -> Result<Vec<CandidateAction>>;

    async fn execute(&self, action: &CandidateAction) -> Result<()>;

    /// Extract data described by `query`, shaped by `schema` when given.
    async fn extract(&self, query: &str, schema: Option<&Value>) -> Result<Value>;

    async fn state_probe(&self, selector: &str, kind: ProbeKind) -> Result<ProbeValue>;

    /// Compact structural snapshot of the current page.
    async fn capture_diagnostic_snapshot(&self) -> Result<String>;

    async fn capture_screenshot(&self, path: &Path) -> Result<()>;

    /// Console and network lines seen since the previous call.
    async fn drain_diagnostics(&self) -> Result<PageDiagnostics> {
        Ok(PageDiagnostics::default())
    }
}

/// The JSON schema a completion must conform to.
#[derive(Debug, Clone)]
pub struct ResultShape {
    pub name: String,
    pub schema: Value,
}

impl ResultShape {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// An LLM that answers a prompt with a value matching a schema.
#[async_trait]
pub trait StructuredCompletion: Send + Sync {
    async fn complete(&self, prompt: &str, shape: &ResultShape) -> Result<Value>;
}

/// Complete and deserialize in one go.
pub async fn complete_as<T: DeserializeOwned>(
    llm: &dyn StructuredCompletion,
    prompt: &str,
    shape: &ResultShape,
) -> Result<T> {
    let value = llm.complete(prompt, shape).await?;
    serde_json::from_value(value.clone()).map_err(|e| {
        anyhow::anyhow!(
            "completion for '{}' does not match its schema: {} ({})",
            shape.name,
            e,
            value
        )
    })
}

/// Turns free text into a structured scenario.
#[async_trait]
pub trait ScenarioNormalizer: Send + Sync {
    async fn normalize(&self, text: &str) -> Result<Scenario>;
}
