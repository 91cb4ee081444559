use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::types::{DIAGNOSTIC_LOG_CAPACITY, PageDiagnostics, Scenario, StepResult, StepStatus};

/// How the browser for this run is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Headless,
    Headed,
}

/// Bounded, shared, append-only buffer of recent diagnostic lines.
///
/// Clones share the same storage so an event source can keep a handle
/// while the run reads from another.
#[derive(Debug, Clone)]
pub struct LogRing {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    pub fn extend(&self, lines: impl IntoIterator<Item = String>) {
        for line in lines {
            self.push(line);
        }
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Read handles on both diagnostic buffers.
#[derive(Debug, Clone)]
pub struct DiagnosticLogs {
    pub console: LogRing,
    pub network: LogRing,
}

impl DiagnosticLogs {
    pub fn absorb(&self, fresh: PageDiagnostics) {
        self.console.extend(fresh.console);
        self.network.extend(fresh.network);
    }
}

/// Per-run state threaded through the engine.
#[derive(Debug)]
pub struct ExecutionContext {
    mode: RunMode,
    scenario_text: String,
    scenario: Option<Scenario>,
    results: Vec<StepResult>,
    logs: DiagnosticLogs,
}

impl ExecutionContext {
    pub fn new(mode: RunMode, scenario_text: impl Into<String>) -> Self {
        Self {
            mode,
            scenario_text: scenario_text.into(),
            scenario: None,
            results: Vec::new(),
            logs: DiagnosticLogs {
                console: LogRing::new(DIAGNOSTIC_LOG_CAPACITY),
                network: LogRing::new(DIAGNOSTIC_LOG_CAPACITY),
            },
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn scenario_text(&self) -> &str {
        &self.scenario_text
    }

    pub fn scenario(&self) -> Option<&Scenario> {
        self.scenario.as_ref()
    }

    pub fn set_scenario(&mut self, scenario: Scenario) {
        self.scenario = Some(scenario);
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn add_result(&mut self, result: StepResult) {
        self.results.push(result);
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.status == StepStatus::Fail)
    }

    /// Appender for console error/warning lines.
    pub fn console_log(&self) -> &LogRing {
        &self.logs.console
    }

    /// Appender for failed network request lines.
    pub fn network_log(&self) -> &LogRing {
        &self.logs.network
    }

    pub fn diagnostics(&self) -> DiagnosticLogs {
        self.logs.clone()
    }

    /// Prepare for the next scenario on the same browser session.
    pub fn reset_for_new_scenario(&mut self, scenario_text: impl Into<String>) {
        self.scenario_text = scenario_text.into();
        self.scenario = None;
        self.results.clear();
        self.logs.console.clear();
        self.logs.network.clear();
    }
}
