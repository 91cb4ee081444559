//! Routes each step by keyword and records its outcome.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{error, info, warn};

use crate::context::ExecutionContext;
use crate::error::{StepError, StepOutcome};
use crate::heal::SelfHealer;
use crate::planner::ActionPlanner;
use crate::ports::{PageAutomation, StructuredCompletion};
use crate::trace::CommandRecorder;
use crate::types::{
    LOAD_TIMEOUT, MAX_HEALING_ATTEMPTS, NAVIGATION_TIMEOUT, Scenario, Step, StepResult,
    StepStatus,
};
use crate::verify::Verifier;

static URL_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>`]+"#).expect("valid URL pattern"));

const BLANK_LOCATIONS: &[&str] = &["", "about:blank", "chrome://newtab/", "chrome://newtab", "data:,"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Precondition,
    Action,
    Verification,
    Unknown,
}

/// Classify by keyword substring. A bare "And" is always an assertion; the
/// normalizer must rewrite action continuations to "When".
pub fn classify(keyword: &str) -> StepKind {
    let keyword = keyword.to_lowercase();
    if keyword.contains("given") {
        StepKind::Precondition
    } else if keyword.contains("when") {
        StepKind::Action
    } else if keyword.contains("then") || keyword.contains("and") {
        StepKind::Verification
    } else {
        StepKind::Unknown
    }
}

/// First URL literal in the text, without trailing punctuation.
pub fn find_url(text: &str) -> Option<String> {
    URL_LITERAL.find(text).map(|m| {
        m.as_str()
            .trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']'])
            .to_string()
    })
}

fn is_blank_location(location: &str) -> bool {
    BLANK_LOCATIONS.contains(&location.trim())
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub navigation_timeout: Duration,
    pub load_timeout: Duration,
    pub max_healing_attempts: usize,
    /// Where failure screenshots go; `None` disables them.
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            navigation_timeout: NAVIGATION_TIMEOUT,
            load_timeout: LOAD_TIMEOUT,
            max_healing_attempts: MAX_HEALING_ATTEMPTS,
            screenshot_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    fn from_results(results: &[StepResult]) -> Self {
        let mut summary = RunSummary::default();
        for r in results {
            match r.status {
                StepStatus::Pass => summary.passed += 1,
                StepStatus::Fail => summary.failed += 1,
                StepStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

pub struct StepDispatcher<'a> {
    page: &'a dyn PageAutomation,
    llm: &'a dyn StructuredCompletion,
    settings: RunnerSettings,
}

impl<'a> StepDispatcher<'a> {
    pub fn new(
        page: &'a dyn PageAutomation,
        llm: &'a dyn StructuredCompletion,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            page,
            llm,
            settings,
        }
    }

    /// Run every step in order. The first failure halts the run and the
    /// remaining steps are recorded as skipped.
    pub async fn run_scenario(&self, ctx: &mut ExecutionContext, scenario: Scenario) -> RunSummary {
        let steps = scenario.steps.clone();
        ctx.set_scenario(scenario);

        let mut halted = false;
        for (index, step) in steps.iter().enumerate() {
            if halted {
                ctx.add_result(StepResult::skipped(step.label()));
                continue;
            }
            let result = self.run_step(ctx, index, step).await;
            info!("[{}] {} ({} ms)", result.status, result.step_label, result.duration_ms);
            halted = result.status == StepStatus::Fail;
            ctx.add_result(result);
        }

        RunSummary::from_results(ctx.results())
    }

    pub async fn run_step(&self, ctx: &ExecutionContext, index: usize, step: &Step) -> StepResult {
        let started = Instant::now();
        let recorder = CommandRecorder::new(self.page);

        let outcome = self.dispatch(ctx, step, &recorder).await;

        match self.page.drain_diagnostics().await {
            Ok(fresh) => ctx.diagnostics().absorb(fresh),
            Err(e) => warn!("could not drain page diagnostics: {e:#}"),
        }

        let (status, details, screenshot_path) = match outcome {
            Ok(details) => (StepStatus::Pass, details, None),
            Err(err) => {
                error!(step = %step.label(), "step failed: {err}");
                let mut details = err.to_string();
                let shot = self.capture_failure(index, &mut details).await;
                (StepStatus::Fail, Some(details), shot)
            }
        };

        let trace = recorder.into_trace();
        StepResult {
            step_label: step.label(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            details,
            screenshot_path,
            command_trace: (!trace.is_empty()).then_some(trace),
        }
    }

    async fn dispatch(
        &self,
        ctx: &ExecutionContext,
        step: &Step,
        page: &dyn PageAutomation,
    ) -> StepOutcome<Option<String>> {
        match classify(&step.keyword) {
            StepKind::Precondition => match find_url(&step.text) {
                Some(url) => self.open(page, &url).await.map(Some),
                None => self.act(ctx, step, page).await,
            },
            StepKind::Action => self.act(ctx, step, page).await,
            StepKind::Unknown => {
                warn!(keyword = %step.keyword, "unrecognised keyword, treating as action");
                self.act(ctx, step, page).await
            }
            StepKind::Verification => {
                let verdict = Verifier::new(page, self.llm).verify(step).await?;
                if verdict.passed {
                    Ok(Some(verdict.detail))
                } else {
                    Err(StepError::VerificationFailed(verdict.detail))
                }
            }
        }
    }

    async fn open(&self, page: &dyn PageAutomation, url: &str) -> StepOutcome<String> {
        page.navigate(url, self.settings.navigation_timeout)
            .await
            .map_err(StepError::collaborator)?;
        page.wait_for_load("load", self.settings.load_timeout)
            .await
            .map_err(StepError::collaborator)?;
        let location = page
            .current_location()
            .await
            .map_err(StepError::collaborator)?;

        if is_blank_location(&location) || !location.starts_with(url) {
            return Err(StepError::PreconditionVerificationFailed {
                expected: url.to_string(),
                actual: location,
            });
        }
        Ok(format!("opened {location}"))
    }

    async fn act(
        &self,
        ctx: &ExecutionContext,
        step: &Step,
        page: &dyn PageAutomation,
    ) -> StepOutcome<Option<String>> {
        let planner = ActionPlanner::new(page, self.llm);
        let planner = &planner;
        let table = step.rows();

        let healed = SelfHealer::new(page, self.llm, ctx.diagnostics())
            .with_max_healing_attempts(self.settings.max_healing_attempts)
            .run(&step.text, |instruction| async move {
                let action = planner.plan(&instruction, table).await?;
                page.execute(&action)
                    .await
                    .map_err(StepError::collaborator)?;
                Ok(action)
            })
            .await?;

        let action = healed.value;
        let mut detail = format!("{} {}", action.method, action.description)
            .trim()
            .to_string();
        if healed.attempts > 1 {
            detail.push_str(&format!(
                " (healed after {} attempts: {})",
                healed.attempts, healed.instruction
            ));
        }
        Ok(Some(detail))
    }

    /// Best-effort screenshot; a capture failure is appended to `details`.
    async fn capture_failure(&self, index: usize, details: &mut String) -> Option<String> {
        let dir = self.settings.screenshot_dir.as_ref()?;
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("step-{:02}-{stamp}.png", index + 1));

        let captured = match std::fs::create_dir_all(dir) {
            Ok(()) => self.page.capture_screenshot(&path).await,
            Err(e) => Err(e.into()),
        };
        match captured {
            Ok(()) => Some(path.display().to_string()),
            Err(e) => {
                details.push_str(&format!(" (screenshot failed: {e:#})"));
                None
            }
        }
    }
}
