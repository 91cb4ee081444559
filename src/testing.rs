//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;

use crate::ports::{PageAutomation, ResultShape, StructuredCompletion};
use crate::types::{CandidateAction, PageDiagnostics, ProbeKind, ProbeValue};

#[derive(Default)]
pub struct FakePage {
    /// Where navigation lands instead of the requested URL.
    pub landing: Option<String>,
    pub location: Mutex<String>,
    pub candidates: Mutex<HashMap<String, Vec<CandidateAction>>>,
    pub extractions: Mutex<HashMap<String, Value>>,
    pub default_extraction: Mutex<Option<Value>>,
    pub probes: Mutex<HashMap<(String, ProbeKind), std::result::Result<ProbeValue, String>>>,
    pub executed: Mutex<Vec<CandidateAction>>,
    pub navigations: Mutex<Vec<String>>,
    pub located: Mutex<Vec<String>>,
    pub fail_screenshot: bool,
    pub diagnostics: Mutex<PageDiagnostics>,
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_candidates(self, query: &str, candidates: Vec<CandidateAction>) -> Self {
        self.candidates
            .lock()
            .unwrap()
            .insert(query.to_string(), candidates);
        self
    }

    pub fn with_extraction(self, query: &str, value: Value) -> Self {
        self.extractions
            .lock()
            .unwrap()
            .insert(query.to_string(), value);
        self
    }

    pub fn with_default_extraction(self, value: Value) -> Self {
        *self.default_extraction.lock().unwrap() = Some(value);
        self
    }

    pub fn with_probe(
        self,
        selector: &str,
        kind: ProbeKind,
        outcome: std::result::Result<ProbeValue, String>,
    ) -> Self {
        self.probes
            .lock()
            .unwrap()
            .insert((selector.to_string(), kind), outcome);
        self
    }

    pub fn executed(&self) -> Vec<CandidateAction> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageAutomation for FakePage {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<()> {
        self.navigations.lock().unwrap().push(url.to_string());
        *self.location.lock().unwrap() = self.landing.clone().unwrap_or_else(|| url.to_string());
        Ok(())
    }

    async fn wait_for_load(&self, _state: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn current_location(&self) -> Result<String> {
        Ok(self.location.lock().unwrap().clone())
    }

    async fn locate(&self, query: &str) -> Result<Vec<CandidateAction>> {
        self.located.lock().unwrap().push(query.to_string());
        Ok(self
            .candidates
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .unwrap_or_default())
    }

    async fn execute(&self, action: &CandidateAction) -> Result<()> {
        self.executed.lock().unwrap().push(action.clone());
        Ok(())
    }

    async fn extract(&self, query: &str, _schema: Option<&Value>) -> Result<Value> {
        if let Some(v) = self.extractions.lock().unwrap().get(query) {
            return Ok(v.clone());
        }
        self.default_extraction
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("nothing to extract for '{query}'"))
    }

    async fn state_probe(&self, selector: &str, kind: ProbeKind) -> Result<ProbeValue> {
        match self
            .probes
            .lock()
            .unwrap()
            .get(&(selector.to_string(), kind))
        {
            Some(Ok(v)) => Ok(v.clone()),
            Some(Err(msg)) => bail!("{msg}"),
            None => bail!("no probe scripted for {selector} {kind:?}"),
        }
    }

    async fn capture_diagnostic_snapshot(&self) -> Result<String> {
        Ok("[e0] button \"Submit\"".to_string())
    }

    async fn capture_screenshot(&self, path: &Path) -> Result<()> {
        if self.fail_screenshot {
            bail!("screenshot target closed");
        }
        std::fs::write(path, b"png")?;
        Ok(())
    }

    async fn drain_diagnostics(&self) -> Result<PageDiagnostics> {
        Ok(std::mem::take(&mut *self.diagnostics.lock().unwrap()))
    }
}

/// Replies per shape name, in order; records every prompt it saw.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<HashMap<String, VecDeque<std::result::Result<Value, String>>>>,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, shape: &str, value: Value) -> Self {
        self.push(shape, Ok(value));
        self
    }

    pub fn fail(self, shape: &str, message: &str) -> Self {
        self.push(shape, Err(message.to_string()));
        self
    }

    fn push(&self, shape: &str, reply: std::result::Result<Value, String>) {
        self.replies
            .lock()
            .unwrap()
            .entry(shape.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls_for(&self, shape: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == shape)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl StructuredCompletion for ScriptedLlm {
    async fn complete(&self, prompt: &str, shape: &ResultShape) -> Result<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((shape.name.clone(), prompt.to_string()));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&shape.name)
            .and_then(VecDeque::pop_front);
        match reply {
            Some(Ok(v)) => Ok(v),
            Some(Err(msg)) => bail!("{msg}"),
            None => bail!("no reply scripted for {}", shape.name),
        }
    }
}

pub fn candidate(method: &str, selector: &str) -> CandidateAction {
    CandidateAction::new(method, selector)
}
