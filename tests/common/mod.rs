use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;

use scenario_pilot::ports::{PageAutomation, ResultShape, StructuredCompletion};
use scenario_pilot::types::{CandidateAction, PageDiagnostics, ProbeKind, ProbeValue};

/// A page that answers from fixed tables and remembers what it was asked.
#[derive(Default)]
pub struct ScriptedPage {
    /// Overrides where navigation lands; otherwise the requested URL.
    pub redirect_to: Option<String>,
    pub location: Mutex<String>,
    pub candidates: HashMap<String, Vec<CandidateAction>>,
    pub text: Option<Value>,
    pub fail_screenshot: bool,
    pub console_on_drain: Mutex<Vec<String>>,
    pub executed: Mutex<Vec<CandidateAction>>,
}

#[async_trait]
impl PageAutomation for ScriptedPage {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<()> {
        let landed = self.redirect_to.clone().unwrap_or_else(|| url.to_string());
        *self.location.lock().unwrap() = landed;
        Ok(())
    }

    async fn wait_for_load(&self, _state: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn current_location(&self) -> Result<String> {
        Ok(self.location.lock().unwrap().clone())
    }

    async fn locate(&self, query: &str) -> Result<Vec<CandidateAction>> {
        Ok(self.candidates.get(query).cloned().unwrap_or_default())
    }

    async fn execute(&self, action: &CandidateAction) -> Result<()> {
        self.executed.lock().unwrap().push(action.clone());
        Ok(())
    }

    async fn extract(&self, _query: &str, _schema: Option<&Value>) -> Result<Value> {
        match &self.text {
            Some(v) => Ok(v.clone()),
            None => bail!("extraction unavailable"),
        }
    }

    async fn state_probe(&self, _selector: &str, _kind: ProbeKind) -> Result<ProbeValue> {
        bail!("probes are not scripted")
    }

    async fn capture_diagnostic_snapshot(&self) -> Result<String> {
        Ok("[e0] link \"Sign in\"".to_string())
    }

    async fn capture_screenshot(&self, path: &Path) -> Result<()> {
        if self.fail_screenshot {
            bail!("target closed");
        }
        std::fs::write(path, b"\x89PNG")?;
        Ok(())
    }

    async fn drain_diagnostics(&self) -> Result<PageDiagnostics> {
        Ok(PageDiagnostics {
            console: std::mem::take(&mut *self.console_on_drain.lock().unwrap()),
            network: Vec::new(),
        })
    }
}

/// Pops replies per shape name in order.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<HashMap<String, VecDeque<Value>>>,
    pub prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedLlm {
    pub fn reply(self, shape: &str, value: Value) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(shape.to_string())
            .or_default()
            .push_back(value);
        self
    }

    pub fn count(&self, shape: &str) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == shape)
            .count()
    }
}

#[async_trait]
impl StructuredCompletion for ScriptedLlm {
    async fn complete(&self, prompt: &str, shape: &ResultShape) -> Result<Value> {
        self.prompts
            .lock()
            .unwrap()
            .push((shape.name.clone(), prompt.to_string()));
        match self
            .replies
            .lock()
            .unwrap()
            .get_mut(&shape.name)
            .and_then(VecDeque::pop_front)
        {
            Some(v) => Ok(v),
            None => bail!("no reply scripted for {}", shape.name),
        }
    }
}

pub fn candidate(method: &str, selector: &str, description: &str) -> CandidateAction {
    let mut c = CandidateAction::new(method, selector);
    c.description = description.to_string();
    c
}
