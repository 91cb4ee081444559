//! Step-execution engine for LLM-driven browser tests.
//!
//! A structured scenario is dispatched step by step: preconditions navigate,
//! actions are planned by the LLM and executed on the page (with bounded
//! self-healing), and assertions are judged by text comparison, element state
//! or table row matching.

pub mod brain;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod dom;
pub mod error;
pub mod hands;
pub mod heal;
pub mod planner;
pub mod ports;
pub mod redact;
pub mod trace;
pub mod types;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{ExecutionContext, RunMode};
pub use dispatcher::{RunSummary, RunnerSettings, StepDispatcher};
pub use error::StepError;
pub use ports::{PageAutomation, ScenarioNormalizer, StructuredCompletion};
pub use types::{Scenario, Step, StepResult, StepStatus};
