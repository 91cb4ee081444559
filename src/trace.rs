use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::ports::PageAutomation;
use crate::redact::redact_trace;
use crate::types::{CandidateAction, PageDiagnostics, ProbeKind, ProbeValue};

/// Wraps a page and records every command issued through it during one step.
pub struct CommandRecorder<'a> {
    inner: &'a dyn PageAutomation,
    records: Mutex<Vec<Value>>,
    /// The locate query whose candidates the next `execute` acts on.
    last_query: Mutex<Option<String>>,
}

impl<'a> CommandRecorder<'a> {
    pub fn new(inner: &'a dyn PageAutomation) -> Self {
        Self {
            inner,
            records: Mutex::new(Vec::new()),
            last_query: Mutex::new(None),
        }
    }

    fn record(&self, entry: Value, outcome: &Result<impl Sized>) {
        let mut entry = entry;
        if let Err(e) = outcome {
            entry["error"] = Value::String(format!("{e:#}"));
        }
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    /// The redacted trace, ready to be persisted.
    pub fn into_trace(self) -> Vec<Value> {
        redact_trace(self.records.into_inner().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl PageAutomation for CommandRecorder<'_> {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        let outcome = self.inner.navigate(url, timeout).await;
        self.record(json!({"command": "navigate", "url": url}), &outcome);
        outcome
    }

    async fn wait_for_load(&self, state: &str, timeout: Duration) -> Result<()> {
        let outcome = self.inner.wait_for_load(state, timeout).await;
        self.record(json!({"command": "wait_for_load", "state": state}), &outcome);
        outcome
    }

    async fn current_location(&self) -> Result<String> {
        self.inner.current_location().await
    }

    async fn locate(&self, query: &str) -> Result<Vec<CandidateAction>> {
        let outcome = self.inner.locate(query).await;
        *self.last_query.lock().unwrap_or_else(|e| e.into_inner()) = Some(query.to_string());
        let found = outcome.as_ref().map(Vec::len).unwrap_or_default();
        self.record(
            json!({"command": "locate", "query": query, "candidates": found}),
            &outcome,
        );
        outcome
    }

    async fn execute(&self, action: &CandidateAction) -> Result<()> {
        let outcome = self.inner.execute(action).await;
        let query = self
            .last_query
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.record(
            json!({
                "command": "execute",
                "method": action.method,
                "target": action.description,
                "selector": action.resolved_selector(),
                "query": query,
                "arguments": action.arguments,
            }),
            &outcome,
        );
        outcome
    }

    async fn extract(&self, query: &str, schema: Option<&Value>) -> Result<Value> {
        let outcome = self.inner.extract(query, schema).await;
        self.record(
            json!({"command": "extract", "query": query, "structured": schema.is_some()}),
            &outcome,
        );
        outcome
    }

    async fn state_probe(&self, selector: &str, kind: ProbeKind) -> Result<ProbeValue> {
        let outcome = self.inner.state_probe(selector, kind).await;
        self.record(
            json!({"command": "state_probe", "selector": selector, "kind": kind}),
            &outcome,
        );
        outcome
    }

    async fn capture_diagnostic_snapshot(&self) -> Result<String> {
        self.inner.capture_diagnostic_snapshot().await
    }

    async fn capture_screenshot(&self, path: &Path) -> Result<()> {
        self.inner.capture_screenshot(path).await
    }

    async fn drain_diagnostics(&self) -> Result<PageDiagnostics> {
        self.inner.drain_diagnostics().await
    }
}
