use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::Config;
use crate::ports::{ResultShape, ScenarioNormalizer, StructuredCompletion, complete_as};
use crate::types::Scenario;

const SYSTEM_PROMPT: &str = r#"You are the planning and judging component of an end-to-end browser test runner.

Rules:
1. Reply with ONE JSON object that matches the requested schema. No markdown, no explanation.
2. Describe page elements by what a user sees: label, role, visible text.
3. Never invent data that is not in the prompt or on the page."#;

const NORMALIZE_PROMPT: &str = r#"Rewrite the test scenario below as Gherkin-style steps.

- keyword is exactly one of "Given" (setup, opening a page), "When" (a user action) or "Then" (an expectation).
- Never use "And" or "But": repeat the keyword of the block it continues.
- Keep URLs, quoted text and values verbatim.
- A step that fills several fields or checks several rows carries a `table`: a list of objects, one per row, keys are column headers.

Scenario:
"#;

/// OpenAI-compatible chat-completions client.
pub struct Brain {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl Brain {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.llm_timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.llm_base_url.clone(),
        })
    }

    async fn chat(&self, prompt: &str, shape: &ResultShape) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": prompt},
                ],
                "temperature": 0.2,
                "response_format": {
                    "type": "json_schema",
                    "json_schema": {
                        "name": shape.name,
                        "schema": shape.schema,
                        "strict": false,
                    }
                },
            }))
            .send()
            .await
            .context("chat completion request")?;

        let status = response.status();
        let json_resp: Value = response
            .json()
            .await
            .context("chat completion response body")?;

        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            warn!(%status, "LLM API error: {err_msg}");
            return Err(anyhow!("LLM API error ({status}): {err_msg}"));
        }

        json_resp["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| anyhow!("No content in LLM response: {json_resp}"))
    }
}

/// Strip markdown fences the model sometimes adds despite instructions.
pub fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[async_trait]
impl StructuredCompletion for Brain {
    async fn complete(&self, prompt: &str, shape: &ResultShape) -> Result<Value> {
        let content = self.chat(prompt, shape).await?;
        debug!(shape = %shape.name, "LLM says: {content}");

        let cleaned = strip_fences(&content);
        serde_json::from_str(cleaned)
            .with_context(|| format!("Failed to parse LLM response for '{}': {cleaned}", shape.name))
    }
}

fn scenario_shape() -> ResultShape {
    ResultShape::new(
        "scenario",
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "keyword": {"type": "string", "enum": ["Given", "When", "Then"]},
                            "text": {"type": "string"},
                            "table": {
                                "type": "array",
                                "items": {"type": "object", "additionalProperties": {"type": "string"}}
                            }
                        },
                        "required": ["keyword", "text"]
                    }
                }
            },
            "required": ["steps"]
        }),
    )
}

#[async_trait]
impl ScenarioNormalizer for Brain {
    async fn normalize(&self, text: &str) -> Result<Scenario> {
        let prompt = format!("{NORMALIZE_PROMPT}{text}");
        let scenario: Scenario = complete_as(self, &prompt, &scenario_shape()).await?;
        if scenario.steps.is_empty() {
            return Err(anyhow!("scenario normalized to zero steps"));
        }
        Ok(scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn scenario_shape_only_allows_resolved_keywords() {
        let shape = scenario_shape();
        let keywords = &shape.schema["properties"]["steps"]["items"]["properties"]["keyword"]["enum"];
        assert_eq!(keywords, &json!(["Given", "When", "Then"]));
    }
}
