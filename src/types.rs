use std::fmt;
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A normalized scenario: a title plus steps in document order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub title: Option<String>,
    pub steps: Vec<Step>,
}

/// One unit of a structured scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub keyword: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<Vec<DataRow>>,
}

impl Step {
    pub fn new(keyword: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            text: text.into(),
            table: None,
        }
    }

    pub fn with_table(mut self, rows: Vec<DataRow>) -> Self {
        self.table = Some(rows);
        self
    }

    /// The table, if present and non-empty.
    pub fn rows(&self) -> Option<&[DataRow]> {
        self.table.as_deref().filter(|rows| !rows.is_empty())
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.keyword.trim(), self.text.trim())
    }
}

/// A data-table row. Columns keep the order they had in the source document,
/// so "first two columns" means the first two the author wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataRow(Vec<(String, String)>);

impl DataRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((column.into(), value.into()));
        self
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Columns with a non-blank value.
    pub fn populated(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns().filter(|(_, v)| !v.trim().is_empty())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for DataRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DataRow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = DataRow;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of column name to cell value")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<DataRow, A::Error> {
                let mut cells = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, serde_json::Value>()? {
                    cells.push((key, cell_to_string(&value)));
                }
                Ok(DataRow(cells))
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

/// Stringify a JSON cell the way table comparison expects.
pub fn cell_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// The action the LLM believes a step asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionIntent {
    Click,
    DoubleClick,
    Fill,
    Press,
    Select,
    Hover,
    Scroll,
    Drag,
    #[serde(other)]
    Unknown,
}

impl ActionIntent {
    pub const ALL: [&'static str; 9] = [
        "click",
        "double_click",
        "fill",
        "press",
        "select",
        "hover",
        "scroll",
        "drag",
        "unknown",
    ];

    /// Method names (lower-case, underscores removed) the intent accepts.
    pub fn accepted_methods(self) -> &'static [&'static str] {
        match self {
            ActionIntent::Click => &["click"],
            ActionIntent::DoubleClick => &["dblclick", "doubleclick"],
            ActionIntent::Fill => &["fill", "type"],
            ActionIntent::Press => &["press", "presskey"],
            ActionIntent::Select => &["select", "selectoption"],
            ActionIntent::Hover => &["hover"],
            ActionIntent::Scroll => &[
                "scroll",
                "scrollto",
                "scrollintoview",
                "mousewheel",
                "mouse.wheel",
                "nextchunk",
                "prevchunk",
            ],
            ActionIntent::Drag => &["drag", "draganddrop"],
            ActionIntent::Unknown => &[],
        }
    }

    pub fn accepts(self, method: &str) -> bool {
        let method = method.to_lowercase().replace(['_', '-'], "");
        self.accepted_methods().contains(&method.as_str())
    }
}

impl fmt::Display for ActionIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idx = *self as usize;
        f.write_str(Self::ALL[idx])
    }
}

/// One actionable element returned by the page, plus how to interact with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAction {
    #[serde(default)]
    pub description: String,
    pub method: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpath: Option<String>,
}

impl CandidateAction {
    pub fn new(method: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            description: String::new(),
            method: method.into(),
            arguments: Vec::new(),
            selector: Some(selector.into()),
            xpath: None,
        }
    }

    /// Turn this candidate into a fill of `value`, keeping its locators.
    pub fn into_fill(mut self, value: impl Into<String>) -> Self {
        self.method = "fill".to_string();
        self.arguments = vec![value.into()];
        self
    }

    /// A concrete selector: the explicit one, else one derived from the XPath.
    pub fn resolved_selector(&self) -> Option<String> {
        self.selector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .or_else(|| {
                self.xpath
                    .as_deref()
                    .map(str::trim)
                    .filter(|x| !x.is_empty())
                    .map(|x| {
                        if x.starts_with("xpath=") {
                            x.to_string()
                        } else {
                            format!("xpath={x}")
                        }
                    })
            })
    }
}

/// How a single verification step is to be judged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssertionPlan {
    Text {
        extract_query: String,
        expected: String,
        operator: TextOperator,
    },
    ElementState {
        locate_query: String,
        check: ElementCheck,
        #[serde(default)]
        expected_value: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOperator {
    Contains,
    NotContains,
    Equals,
}

impl TextOperator {
    pub fn apply(self, actual: &str, expected: &str) -> bool {
        match self {
            TextOperator::Contains => actual.contains(expected),
            TextOperator::NotContains => !actual.contains(expected),
            TextOperator::Equals => actual.trim() == expected.trim(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementCheck {
    Exists,
    NotExists,
    Visible,
    Hidden,
    Enabled,
    Disabled,
    Checked,
    Unchecked,
    ValueEquals,
}

impl ElementCheck {
    /// Whether a missing element satisfies the check.
    pub fn passes_when_absent(self) -> bool {
        matches!(self, ElementCheck::NotExists | ElementCheck::Hidden)
    }
}

/// State queries the page can answer about a single element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Visible,
    Hidden,
    Enabled,
    Disabled,
    Checked,
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeValue {
    Flag(bool),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pass,
    Fail,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepStatus::Pass => "PASS",
            StepStatus::Fail => "FAIL",
            StepStatus::Skipped => "SKIP",
        })
    }
}

/// Outcome of one dispatched step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_label: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_trace: Option<Vec<serde_json::Value>>,
}

impl StepResult {
    pub fn skipped(step_label: String) -> Self {
        Self {
            step_label,
            status: StepStatus::Skipped,
            duration_ms: 0,
            details: None,
            screenshot_path: None,
            command_trace: None,
        }
    }
}

/// Console and network lines the page collected since the last drain.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageDiagnostics {
    #[serde(default)]
    pub console: Vec<String>,
    #[serde(default)]
    pub network: Vec<String>,
}

pub const DIAGNOSTIC_LOG_CAPACITY: usize = 5;
pub const DOM_SNAPSHOT_MAX_CHARS: usize = 4000;
pub const PAGE_TEXT_MAX_CHARS: usize = 12000;
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const LOAD_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_HEALING_ATTEMPTS: usize = 2;
