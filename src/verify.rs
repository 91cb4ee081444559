//! Assertion steps: tabular row matching, text comparison and element state.

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::error::{StepError, StepOutcome};
use crate::ports::{PageAutomation, ResultShape, StructuredCompletion, complete_as};
use crate::types::{
    AssertionPlan, DataRow, ElementCheck, ProbeKind, ProbeValue, Step, TextOperator,
};

pub const ASSERTION_PLAN_SHAPE: &str = "assertion_plan";

/// Outcome of one assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub detail: String,
}

impl Verdict {
    fn new(passed: bool, detail: impl Into<String>) -> Self {
        Self {
            passed,
            detail: detail.into(),
        }
    }
}

/// The shapes an extraction may come back in.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Plain(String),
    Fields {
        extraction: Option<String>,
        page_text: Option<String>,
    },
    Unrecognized,
}

impl From<Value> for Extracted {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Extracted::Plain(s),
            Value::Object(map) => {
                let text = |keys: &[&str]| {
                    keys.iter()
                        .find_map(|k| map.get(*k).and_then(Value::as_str).map(String::from))
                };
                Extracted::Fields {
                    extraction: text(&["extraction"]),
                    page_text: text(&["page_text", "pageText"]),
                }
            }
            _ => Extracted::Unrecognized,
        }
    }
}

impl Extracted {
    /// The extraction field wins, then the full page text, then nothing.
    pub fn into_text(self) -> String {
        match self {
            Extracted::Plain(s) => s,
            Extracted::Fields {
                extraction: Some(s),
                ..
            } => s,
            Extracted::Fields {
                page_text: Some(s), ..
            } => s,
            Extracted::Fields { .. } | Extracted::Unrecognized => String::new(),
        }
    }
}

fn assertion_plan_shape() -> ResultShape {
    ResultShape::new(
        ASSERTION_PLAN_SHAPE,
        json!({
            "type": "object",
            "properties": {
                "kind": {"type": "string", "enum": ["text", "element_state"]},
                "extract_query": {"type": "string"},
                "expected": {"type": "string"},
                "operator": {"type": "string", "enum": ["contains", "not_contains", "equals"]},
                "locate_query": {"type": "string"},
                "check": {
                    "type": "string",
                    "enum": [
                        "exists", "not_exists", "visible", "hidden", "enabled",
                        "disabled", "checked", "unchecked", "value_equals"
                    ]
                },
                "expected_value": {"type": "string"}
            },
            "required": ["kind"]
        }),
    )
}

/// Schema for extracting rows shaped like the expected table.
pub fn table_schema(keys: &[String]) -> Value {
    let properties: Map<String, Value> = keys
        .iter()
        .map(|k| (k.clone(), json!({"type": "string"})))
        .collect();
    json!({
        "type": "object",
        "properties": {
            "rows": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": properties,
                    "required": keys,
                }
            }
        },
        "required": ["rows"]
    })
}

/// Column names across all rows, first-seen order.
fn header_keys(rows: &[DataRow]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for key in rows.iter().flat_map(DataRow::keys) {
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

fn row_matches(expected: &DataRow, actual: &DataRow) -> bool {
    expected.populated().all(|(column, want)| {
        actual
            .columns()
            .find(|(k, _)| *k == column)
            .is_some_and(|(_, got)| got.contains(want))
    })
}

/// Indices of expected rows with no matching extracted row.
/// Expected rows without a single populated cell are skipped with a warning.
pub fn unmatched_rows(expected: &[DataRow], actual: &[DataRow]) -> Vec<usize> {
    expected
        .iter()
        .enumerate()
        .filter(|(i, row)| {
            let populated = row.populated().next().is_some();
            if !populated {
                warn!("expected row {} has no values, skipping", i + 1);
            }
            populated
        })
        .filter(|(_, row)| !actual.iter().any(|a| row_matches(row, a)))
        .map(|(i, _)| i)
        .collect()
}

fn parse_rows(value: Value) -> StepOutcome<Vec<DataRow>> {
    let rows = match value {
        Value::Object(mut map) => map.remove("rows").unwrap_or(Value::Array(Vec::new())),
        other => other,
    };
    match rows {
        Value::Array(_) => serde_json::from_value(rows).map_err(|e| {
            StepError::Collaborator(format!("extracted rows are not column maps: {e}"))
        }),
        Value::Null => Ok(Vec::new()),
        other => Err(StepError::Collaborator(format!(
            "expected extracted rows, got {other}"
        ))),
    }
}

pub struct Verifier<'a> {
    page: &'a dyn PageAutomation,
    llm: &'a dyn StructuredCompletion,
}

impl<'a> Verifier<'a> {
    pub fn new(page: &'a dyn PageAutomation, llm: &'a dyn StructuredCompletion) -> Self {
        Self { page, llm }
    }

    pub async fn verify(&self, step: &Step) -> StepOutcome<Verdict> {
        match step.rows() {
            Some(rows) => self.verify_table(&step.text, rows).await,
            None => {
                let plan = self.request_plan(&step.text).await?;
                self.evaluate(&plan).await
            }
        }
    }

    pub async fn verify_table(&self, text: &str, expected: &[DataRow]) -> StepOutcome<Verdict> {
        let keys = header_keys(expected);
        let query = format!(
            "{text}\nExtract every matching row with the columns: {}",
            keys.join(", ")
        );
        let raw = self
            .page
            .extract(&query, Some(&table_schema(&keys)))
            .await
            .map_err(StepError::collaborator)?;
        let actual = parse_rows(raw)?;
        if actual.is_empty() {
            return Err(StepError::NoDataExtracted);
        }
        debug!(expected = expected.len(), extracted = actual.len(), "matching table rows");

        let missing = unmatched_rows(expected, &actual);
        if missing.is_empty() {
            return Ok(Verdict::new(
                true,
                format!("all {} expected rows found", expected.len()),
            ));
        }
        let described = missing
            .iter()
            .map(|&i| {
                let cells = expected[i]
                    .populated()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("row {} {{{cells}}}", i + 1)
            })
            .collect::<Vec<_>>()
            .join("; ");
        Ok(Verdict::new(
            false,
            format!(
                "{} of {} expected rows not found among {} extracted: {described}",
                missing.len(),
                expected.len(),
                actual.len()
            ),
        ))
    }

    pub async fn evaluate(&self, plan: &AssertionPlan) -> StepOutcome<Verdict> {
        match plan {
            AssertionPlan::Text {
                extract_query,
                expected,
                operator,
            } => self.check_text(extract_query, expected, *operator).await,
            AssertionPlan::ElementState {
                locate_query,
                check,
                expected_value,
            } => {
                self.check_element(locate_query, *check, expected_value.as_deref())
                    .await
            }
        }
    }

    async fn check_text(
        &self,
        query: &str,
        expected: &str,
        operator: TextOperator,
    ) -> StepOutcome<Verdict> {
        let raw = self
            .page
            .extract(query, None)
            .await
            .map_err(StepError::collaborator)?;
        let actual = Extracted::from(raw).into_text();
        let passed = operator.apply(&actual, expected);
        Ok(Verdict::new(
            passed,
            format!("text {operator:?} '{expected}': extracted '{}'", preview(&actual)),
        ))
    }

    async fn check_element(
        &self,
        query: &str,
        check: ElementCheck,
        expected_value: Option<&str>,
    ) -> StepOutcome<Verdict> {
        let candidates = self
            .page
            .locate(query)
            .await
            .map_err(StepError::collaborator)?;

        let Some(first) = candidates.first() else {
            if check.passes_when_absent() {
                return Ok(Verdict::new(true, format!("'{query}' is absent")));
            }
            if check == ElementCheck::Exists {
                return Ok(Verdict::new(false, format!("'{query}' does not exist")));
            }
            return Err(StepError::ElementNotFound {
                query: query.to_string(),
            });
        };

        let (kind, negate) = match check {
            ElementCheck::Exists => return Ok(Verdict::new(true, format!("'{query}' exists"))),
            ElementCheck::NotExists => {
                return Ok(Verdict::new(false, format!("'{query}' still exists")));
            }
            ElementCheck::Visible => (ProbeKind::Visible, false),
            ElementCheck::Hidden => (ProbeKind::Hidden, false),
            ElementCheck::Enabled => (ProbeKind::Enabled, false),
            ElementCheck::Disabled => (ProbeKind::Disabled, false),
            ElementCheck::Checked => (ProbeKind::Checked, false),
            ElementCheck::Unchecked => (ProbeKind::Checked, true),
            ElementCheck::ValueEquals => (ProbeKind::Value, false),
        };

        if check == ElementCheck::ValueEquals && expected_value.is_none() {
            return Ok(Verdict::new(
                false,
                format!("'{query}' value_equals has no expected value"),
            ));
        }

        let Some(selector) = first.resolved_selector() else {
            return Ok(Verdict::new(
                false,
                format!("'{query}' has no usable selector"),
            ));
        };

        let probed = match self.page.state_probe(&selector, kind).await {
            Ok(value) => value,
            Err(e) => {
                warn!(%selector, ?kind, "state probe failed: {e:#}");
                return Ok(Verdict::new(false, format!("probe {check:?} failed: {e:#}")));
            }
        };

        let passed = match (check, probed) {
            (ElementCheck::ValueEquals, ProbeValue::Text(actual)) => {
                expected_value.is_some_and(|want| actual.trim() == want.trim())
            }
            (ElementCheck::ValueEquals, ProbeValue::Flag(_)) => false,
            (_, ProbeValue::Flag(flag)) => flag != negate,
            (_, ProbeValue::Text(_)) => false,
        };
        Ok(Verdict::new(
            passed,
            format!("'{query}' ({selector}) {check:?}: {passed}"),
        ))
    }

    async fn request_plan(&self, text: &str) -> StepOutcome<AssertionPlan> {
        let prompt = format!(
            "You judge one assertion of an end-to-end browser test.\n\
             Assertion: {text}\n\n\
             If it is about visible text or page content, answer kind \"text\" with \
             `extract_query` (what to read from the page), `expected` (the literal text) \
             and `operator` (contains, not_contains or equals).\n\
             If it is about an element's state, answer kind \"element_state\" with \
             `locate_query` (the element), `check` and, for value_equals, `expected_value`."
        );
        complete_as(self.llm, &prompt, &assertion_plan_shape())
            .await
            .map_err(StepError::collaborator)
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 200;
    if text.chars().count() > MAX {
        let head: String = text.chars().take(MAX).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePage, ScriptedLlm, candidate};

    fn rows(json: Value) -> Vec<DataRow> {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn extraction_normalizer_priority() {
        assert_eq!(Extracted::from(json!("hi")).into_text(), "hi");
        assert_eq!(
            Extracted::from(json!({"extraction": "a", "page_text": "b"})).into_text(),
            "a"
        );
        assert_eq!(Extracted::from(json!({"pageText": "b"})).into_text(), "b");
        assert_eq!(Extracted::from(json!({"other": 1})).into_text(), "");
        assert_eq!(Extracted::from(json!(42)).into_text(), "");
    }

    #[test]
    fn row_matching_is_substring_and_order_independent() {
        let expected = rows(json!([{"Name": "Hanako"}, {"Name": "Taro", "City": "Osaka"}]));
        let actual = rows(json!([
            {"Name": "Yamada Taro", "City": "Osaka-shi"},
            {"Name": "Tanaka Hanako", "City": "Tokyo"}
        ]));
        assert!(unmatched_rows(&expected, &actual).is_empty());
    }

    #[test]
    fn row_matching_is_case_sensitive_and_needs_same_row() {
        let expected = rows(json!([{"Name": "hanako"}, {"Name": "Taro", "City": "Tokyo"}]));
        let actual = rows(json!([
            {"Name": "Tanaka Hanako", "City": "Tokyo"},
            {"Name": "Yamada Taro", "City": "Osaka"}
        ]));
        assert_eq!(unmatched_rows(&expected, &actual), vec![0, 1]);
    }

    #[test]
    fn numeric_cells_are_stringified() {
        let expected = rows(json!([{"Qty": "3"}]));
        let actual = rows(json!([{"Qty": 3}]));
        assert!(unmatched_rows(&expected, &actual).is_empty());
    }

    #[test]
    fn schema_uses_table_headers() {
        let schema = table_schema(&["Name".to_string(), "City".to_string()]);
        let item = &schema["properties"]["rows"]["items"];
        assert!(item["properties"]["Name"].is_object());
        assert_eq!(item["required"], json!(["Name", "City"]));
    }

    #[tokio::test]
    async fn welcome_text_contains() {
        let page = FakePage::new().with_extraction(
            "the greeting",
            json!({"extraction": "Welcome back, Alice! Welcome."}),
        );
        let llm = ScriptedLlm::new().reply(
            ASSERTION_PLAN_SHAPE,
            json!({
                "kind": "text",
                "extract_query": "the greeting",
                "expected": "Welcome",
                "operator": "contains"
            }),
        );
        let verdict = Verifier::new(&page, &llm)
            .verify(&Step::new("Then", "\"Welcome\" is shown"))
            .await
            .unwrap();
        assert!(verdict.passed, "{}", verdict.detail);
    }

    #[tokio::test]
    async fn hanako_table_row_passes() {
        let page =
            FakePage::new().with_default_extraction(json!({"rows": [{"Name": "Tanaka Hanako"}]}));
        let llm = ScriptedLlm::new();
        let step = Step::new("Then", "the member list shows")
            .with_table(vec![DataRow::new().with("Name", "Hanako")]);

        let verdict = Verifier::new(&page, &llm).verify(&step).await.unwrap();
        assert!(verdict.passed);
    }

    #[tokio::test]
    async fn empty_extraction_is_no_data() {
        let page = FakePage::new().with_default_extraction(json!({"rows": []}));
        let llm = ScriptedLlm::new();
        let step = Step::new("Then", "the list shows")
            .with_table(vec![DataRow::new().with("Name", "Hanako")]);

        let err = Verifier::new(&page, &llm).verify(&step).await.unwrap_err();
        assert!(matches!(err, StepError::NoDataExtracted));
    }

    #[tokio::test]
    async fn unmatched_table_row_fails_with_detail() {
        let page = FakePage::new().with_default_extraction(json!([{"Name": "Jiro"}]));
        let llm = ScriptedLlm::new();
        let step = Step::new("Then", "the list shows")
            .with_table(vec![DataRow::new().with("Name", "Hanako")]);

        let verdict = Verifier::new(&page, &llm).verify(&step).await.unwrap();
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("Name=Hanako"));
    }

    #[tokio::test]
    async fn throwing_probe_is_false_not_error() {
        let page = FakePage::new()
            .with_candidates("terms checkbox", vec![candidate("click", "#terms")])
            .with_probe("#terms", ProbeKind::Checked, Err("node detached".into()));
        let llm = ScriptedLlm::new();
        let plan = AssertionPlan::ElementState {
            locate_query: "terms checkbox".into(),
            check: ElementCheck::Checked,
            expected_value: None,
        };

        let verdict = Verifier::new(&page, &llm).evaluate(&plan).await.unwrap();
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("node detached"));
    }

    #[tokio::test]
    async fn absent_elements_by_check() {
        let page = FakePage::new();
        let llm = ScriptedLlm::new();
        let verifier = Verifier::new(&page, &llm);
        let plan = |check| AssertionPlan::ElementState {
            locate_query: "error banner".into(),
            check,
            expected_value: None,
        };

        assert!(verifier.evaluate(&plan(ElementCheck::NotExists)).await.unwrap().passed);
        assert!(verifier.evaluate(&plan(ElementCheck::Hidden)).await.unwrap().passed);
        assert!(!verifier.evaluate(&plan(ElementCheck::Exists)).await.unwrap().passed);
        assert!(matches!(
            verifier.evaluate(&plan(ElementCheck::Visible)).await,
            Err(StepError::ElementNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unchecked_and_value_equals_probe_first_candidate() {
        let mut by_xpath = candidate("fill", "");
        by_xpath.selector = None;
        by_xpath.xpath = Some("//input[@name='qty']".into());
        let page = FakePage::new()
            .with_candidates("newsletter", vec![candidate("click", "#news"), candidate("click", "#x")])
            .with_candidates("quantity", vec![by_xpath])
            .with_probe("#news", ProbeKind::Checked, Ok(ProbeValue::Flag(false)))
            .with_probe(
                "xpath=//input[@name='qty']",
                ProbeKind::Value,
                Ok(ProbeValue::Text(" 2 ".into())),
            );
        let llm = ScriptedLlm::new();
        let verifier = Verifier::new(&page, &llm);

        let unchecked = AssertionPlan::ElementState {
            locate_query: "newsletter".into(),
            check: ElementCheck::Unchecked,
            expected_value: None,
        };
        assert!(verifier.evaluate(&unchecked).await.unwrap().passed);

        let value = AssertionPlan::ElementState {
            locate_query: "quantity".into(),
            check: ElementCheck::ValueEquals,
            expected_value: Some("2".into()),
        };
        assert!(verifier.evaluate(&value).await.unwrap().passed);
    }

    #[test]
    fn rows_without_values_are_skipped() {
        let expected = vec![
            DataRow::new().with("Name", " ").with("City", ""),
            DataRow::new().with("Name", "Hanako"),
        ];
        let actual = rows(json!([{"Name": "Jiro"}]));
        assert_eq!(unmatched_rows(&expected, &actual), vec![1]);
    }

    #[tokio::test]
    async fn not_contains_and_equals_operators() {
        let page = FakePage::new().with_default_extraction(json!("  Order placed  "));
        let llm = ScriptedLlm::new();
        let verifier = Verifier::new(&page, &llm);
        let text = |expected: &str, operator| AssertionPlan::Text {
            extract_query: "the banner".into(),
            expected: expected.into(),
            operator,
        };

        let absent = verifier
            .evaluate(&text("error", TextOperator::NotContains))
            .await
            .unwrap();
        assert!(absent.passed, "{}", absent.detail);
        let present = verifier
            .evaluate(&text("placed", TextOperator::NotContains))
            .await
            .unwrap();
        assert!(!present.passed);
        assert!(verifier
            .evaluate(&text("Order placed", TextOperator::Equals))
            .await
            .unwrap()
            .passed);
    }

    #[tokio::test]
    async fn present_elements_by_check() {
        let page = FakePage::new()
            .with_candidates("save button", vec![candidate("click", "#save")])
            .with_probe("#save", ProbeKind::Visible, Ok(ProbeValue::Flag(true)))
            .with_probe("#save", ProbeKind::Hidden, Ok(ProbeValue::Flag(false)))
            .with_probe("#save", ProbeKind::Enabled, Ok(ProbeValue::Flag(false)))
            .with_probe("#save", ProbeKind::Disabled, Ok(ProbeValue::Flag(true)));
        let llm = ScriptedLlm::new();
        let verifier = Verifier::new(&page, &llm);
        let passes = |check| {
            let plan = AssertionPlan::ElementState {
                locate_query: "save button".into(),
                check,
                expected_value: None,
            };
            let verifier = &verifier;
            async move { verifier.evaluate(&plan).await.unwrap().passed }
        };

        assert!(passes(ElementCheck::Exists).await);
        assert!(!passes(ElementCheck::NotExists).await);
        assert!(passes(ElementCheck::Visible).await);
        assert!(!passes(ElementCheck::Hidden).await);
        assert!(!passes(ElementCheck::Enabled).await);
        assert!(passes(ElementCheck::Disabled).await);
    }

    #[tokio::test]
    async fn value_equals_without_expected_value_fails() {
        let page = FakePage::new()
            .with_candidates("coupon", vec![candidate("fill", "#coupon")])
            .with_probe("#coupon", ProbeKind::Value, Ok(ProbeValue::Text(String::new())));
        let llm = ScriptedLlm::new();
        let plan = AssertionPlan::ElementState {
            locate_query: "coupon".into(),
            check: ElementCheck::ValueEquals,
            expected_value: None,
        };

        let verdict = Verifier::new(&page, &llm).evaluate(&plan).await.unwrap();
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("no expected value"));
    }
}
