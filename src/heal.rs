//! Bounded LLM-assisted retry around a planning operation.

use std::future::Future;

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::context::DiagnosticLogs;
use crate::error::{StepError, StepOutcome};
use crate::ports::{PageAutomation, ResultShape, StructuredCompletion, complete_as};
use crate::types::{DOM_SNAPSHOT_MAX_CHARS, MAX_HEALING_ATTEMPTS};

pub const HEALING_PLAN_SHAPE: &str = "healing_plan";

#[derive(Debug, Clone, Deserialize)]
pub struct HealingPlan {
    pub cause_analysis: String,
    pub alternative_instruction: String,
}

/// A successful attempt and how it was reached.
#[derive(Debug)]
pub struct Healed<T> {
    pub value: T,
    /// Total attempts, the first one included.
    pub attempts: usize,
    /// The instruction that finally worked.
    pub instruction: String,
}

fn healing_plan_shape() -> ResultShape {
    ResultShape::new(
        HEALING_PLAN_SHAPE,
        json!({
            "type": "object",
            "properties": {
                "cause_analysis": {"type": "string"},
                "alternative_instruction": {"type": "string"}
            },
            "required": ["cause_analysis", "alternative_instruction"],
            "additionalProperties": false
        }),
    )
}

pub struct SelfHealer<'a> {
    page: &'a dyn PageAutomation,
    llm: &'a dyn StructuredCompletion,
    logs: DiagnosticLogs,
    max_healing_attempts: usize,
}

impl<'a> SelfHealer<'a> {
    pub fn new(
        page: &'a dyn PageAutomation,
        llm: &'a dyn StructuredCompletion,
        logs: DiagnosticLogs,
    ) -> Self {
        Self {
            page,
            llm,
            logs,
            max_healing_attempts: MAX_HEALING_ATTEMPTS,
        }
    }

    pub fn with_max_healing_attempts(mut self, max: usize) -> Self {
        self.max_healing_attempts = max;
        self
    }

    /// Run `op` with the original instruction, then with up to
    /// `max_healing_attempts` LLM-suggested alternatives.
    pub async fn run<T, F, Fut>(&self, original: &str, mut op: F) -> StepOutcome<Healed<T>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = StepOutcome<T>>,
    {
        let max_attempts = self.max_healing_attempts + 1;
        let mut instruction = original.to_string();
        let mut last_error: Option<StepError> = None;

        for attempt in 1..=max_attempts {
            match op(instruction.clone()).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, %instruction, "self-healing succeeded");
                    }
                    return Ok(Healed {
                        value,
                        attempts: attempt,
                        instruction,
                    });
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(attempt, %instruction, "attempt failed: {err}");
                    if attempt < max_attempts {
                        match self.request_healing(original, &instruction, &err).await {
                            Ok(plan) => {
                                info!(cause = %plan.cause_analysis, next = %plan.alternative_instruction, "healing plan");
                                if !plan.alternative_instruction.trim().is_empty() {
                                    instruction = plan.alternative_instruction;
                                }
                            }
                            Err(heal_err) => {
                                warn!("healing request failed, retrying as is: {heal_err}");
                            }
                        }
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(StepError::HealingExhausted {
            attempts: max_attempts,
            instruction: original.to_string(),
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn request_healing(
        &self,
        original: &str,
        instruction: &str,
        error: &StepError,
    ) -> StepOutcome<HealingPlan> {
        match self.page.drain_diagnostics().await {
            Ok(fresh) => self.logs.absorb(fresh),
            Err(e) => warn!("could not drain page diagnostics: {e:#}"),
        }
        let snapshot = match self.page.capture_diagnostic_snapshot().await {
            Ok(s) => s.chars().take(DOM_SNAPSHOT_MAX_CHARS).collect(),
            Err(e) => format!("(snapshot unavailable: {e:#})"),
        };
        let console = bullet_lines(&self.logs.console.recent());
        let network = bullet_lines(&self.logs.network.recent());

        let prompt = format!(
            "A browser test step failed. Diagnose why and propose a different \
             instruction that reaches the same goal.\n\n\
             Original step: {original}\n\
             Instruction tried: {instruction}\n\
             Error: {error}\n\n\
             Page structure:\n{snapshot}\n\n\
             Recent console errors/warnings:\n{console}\n\n\
             Recent network errors:\n{network}"
        );
        complete_as(self.llm, &prompt, &healing_plan_shape())
            .await
            .map_err(StepError::collaborator)
    }
}

fn bullet_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        return "(none)".to_string();
    }
    lines
        .iter()
        .map(|l| format!("- {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}
