use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{StepError, StepOutcome};
use crate::ports::{PageAutomation, ResultShape, StructuredCompletion, complete_as};
use crate::types::{ActionIntent, CandidateAction, DataRow};

pub const ACTION_PLAN_SHAPE: &str = "action_plan";

/// What to look for on the page and what to do with it.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionPlan {
    pub locate_query: String,
    #[serde(default = "unknown_intent")]
    pub intended_action: ActionIntent,
}

fn unknown_intent() -> ActionIntent {
    ActionIntent::Unknown
}

fn action_plan_shape() -> ResultShape {
    ResultShape::new(
        ACTION_PLAN_SHAPE,
        json!({
            "type": "object",
            "properties": {
                "locate_query": {
                    "type": "string",
                    "description": "Short description of the single element to interact with"
                },
                "intended_action": {
                    "type": "string",
                    "enum": ActionIntent::ALL,
                }
            },
            "required": ["locate_query", "intended_action"],
            "additionalProperties": false
        }),
    )
}

/// Turns a step's instruction into exactly one candidate action.
pub struct ActionPlanner<'a> {
    page: &'a dyn PageAutomation,
    llm: &'a dyn StructuredCompletion,
}

impl<'a> ActionPlanner<'a> {
    pub fn new(page: &'a dyn PageAutomation, llm: &'a dyn StructuredCompletion) -> Self {
        Self { page, llm }
    }

    pub async fn plan(
        &self,
        instruction: &str,
        table: Option<&[DataRow]>,
    ) -> StepOutcome<CandidateAction> {
        if let Some(rows) = table {
            self.fill_table(rows).await?;
        }

        let plan = self.request_plan(instruction).await?;
        debug!(
            query = %plan.locate_query,
            intent = %plan.intended_action,
            "action plan"
        );

        let candidates = self
            .page
            .locate(&plan.locate_query)
            .await
            .map_err(StepError::collaborator)?;

        select_candidate(candidates, plan.intended_action, &plan.locate_query)
    }

    /// Fill one field per row, using the first two columns as field and value.
    /// Returns how many rows were filled.
    pub async fn fill_table(&self, rows: &[DataRow]) -> StepOutcome<usize> {
        let mut filled = 0;
        for (index, row) in rows.iter().enumerate() {
            let mut columns = row.columns();
            let pair = match (columns.next(), columns.next()) {
                (Some((_, field)), Some((_, value)))
                    if !field.trim().is_empty() && !value.trim().is_empty() =>
                {
                    (field.trim(), value)
                }
                _ => {
                    warn!("{}, skipping", StepError::MalformedTableRow { row: index + 1 });
                    continue;
                }
            };

            let (field, value) = pair;
            let query = format!("the '{field}' input field");
            let candidates = self
                .page
                .locate(&query)
                .await
                .map_err(StepError::collaborator)?;
            let target = candidates
                .into_iter()
                .next()
                .ok_or(StepError::ElementNotFound { query })?;

            self.page
                .execute(&target.into_fill(value))
                .await
                .map_err(StepError::collaborator)?;
            filled += 1;
        }
        info!(filled, total = rows.len(), "table fill complete");
        Ok(filled)
    }

    async fn request_plan(&self, instruction: &str) -> StepOutcome<ActionPlan> {
        let prompt = format!(
            "You plan one browser interaction for an end-to-end test step.\n\
             Step: {instruction}\n\n\
             Return `locate_query`: a short description of the single element the step \
             acts on (label, role, visible text). Return `intended_action`: the \
             interaction the step asks for, or \"unknown\" if it is unclear."
        );
        complete_as(self.llm, &prompt, &action_plan_shape())
            .await
            .map_err(StepError::collaborator)
    }
}

/// Pick one candidate, filtering by intent only when there is a choice to make.
pub fn select_candidate(
    candidates: Vec<CandidateAction>,
    intent: ActionIntent,
    query: &str,
) -> StepOutcome<CandidateAction> {
    if candidates.len() > 1 && intent != ActionIntent::Unknown {
        let offered = candidates
            .iter()
            .map(|c| c.method.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        return candidates
            .into_iter()
            .find(|c| intent.accepts(&c.method))
            .ok_or(StepError::IntentMismatch { intent, offered });
    }

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| StepError::ElementNotFound {
            query: query.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePage, ScriptedLlm, candidate};

    #[test]
    fn single_candidate_is_returned_regardless_of_intent() {
        let only = candidate("hover", "#menu");
        for intent in [ActionIntent::Click, ActionIntent::Fill, ActionIntent::Unknown] {
            let picked = select_candidate(vec![only.clone()], intent, "menu").unwrap();
            assert_eq!(picked, only);
        }
    }

    #[test]
    fn unknown_intent_skips_filtering() {
        let picked = select_candidate(
            vec![candidate("hover", "#a"), candidate("click", "#b")],
            ActionIntent::Unknown,
            "x",
        )
        .unwrap();
        assert_eq!(picked.selector.as_deref(), Some("#a"));
    }

    #[test]
    fn filtering_keeps_original_order() {
        let picked = select_candidate(
            vec![
                candidate("click", "#a"),
                candidate("type", "#b"),
                candidate("fill", "#c"),
            ],
            ActionIntent::Fill,
            "email",
        )
        .unwrap();
        assert_eq!(picked.selector.as_deref(), Some("#b"));
    }

    #[test]
    fn no_compatible_candidate_is_an_intent_mismatch() {
        let err = select_candidate(
            vec![candidate("click", "#a"), candidate("hover", "#b")],
            ActionIntent::Fill,
            "email",
        )
        .unwrap_err();
        assert!(matches!(err, StepError::IntentMismatch { .. }));
        assert!(err.to_string().contains("click, hover"));
    }

    #[test]
    fn empty_candidates_are_element_not_found() {
        let err = select_candidate(vec![], ActionIntent::Click, "login button").unwrap_err();
        assert!(matches!(err, StepError::ElementNotFound { ref query } if query == "login button"));
    }

    #[tokio::test]
    async fn plan_locates_and_filters() {
        let page = FakePage::new().with_candidates(
            "login button",
            vec![candidate("hover", "#tip"), candidate("click", "#login")],
        );
        let llm = ScriptedLlm::new().reply(
            ACTION_PLAN_SHAPE,
            json!({"locate_query": "login button", "intended_action": "click"}),
        );
        let planner = ActionPlanner::new(&page, &llm);

        let picked = planner.plan("I click the login button", None).await.unwrap();
        assert_eq!(picked.selector.as_deref(), Some("#login"));
        assert!(llm.calls_for(ACTION_PLAN_SHAPE)[0].contains("I click the login button"));
    }

    #[tokio::test]
    async fn table_rows_fill_by_position_and_skip_short_rows() {
        let page = FakePage::new()
            .with_candidates("the 'Email' input field", vec![candidate("click", "#email")])
            .with_candidates("the 'City' input field", vec![candidate("click", "#city")]);
        let llm = ScriptedLlm::new();
        let planner = ActionPlanner::new(&page, &llm);

        let rows = vec![
            DataRow::new().with("field", "Email").with("value", "a@b.c"),
            DataRow::new().with("only", "lonely"),
            DataRow::new().with("Label", "City").with("Input", "Kyoto"),
            DataRow::new().with("field", "Phone").with("value", "  "),
        ];
        let filled = planner.fill_table(&rows).await.unwrap();

        assert_eq!(filled, 2);
        let executed = page.executed();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[0].method, "fill");
        assert_eq!(executed[0].arguments, vec!["a@b.c"]);
        assert_eq!(executed[1].selector.as_deref(), Some("#city"));
        assert_eq!(executed[1].arguments, vec!["Kyoto"]);
    }

    #[tokio::test]
    async fn missing_field_fails_table_fill() {
        let page = FakePage::new();
        let llm = ScriptedLlm::new();
        let planner = ActionPlanner::new(&page, &llm);
        let rows = vec![DataRow::new().with("field", "Email").with("value", "a@b.c")];

        let err = planner.fill_table(&rows).await.unwrap_err();
        assert!(matches!(err, StepError::ElementNotFound { .. }));
    }
}
