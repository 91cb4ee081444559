use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::context::RunMode;
use crate::dispatcher::RunnerSettings;
use crate::types::{LOAD_TIMEOUT, MAX_HEALING_ATTEMPTS, NAVIGATION_TIMEOUT};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub model: String,
    pub llm_base_url: String,
    pub llm_timeout: Duration,
    pub mode: RunMode,
    pub chrome_path: Option<PathBuf>,
    /// Attach to an already running Chrome instead of launching one.
    pub chrome_debug_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub max_healing_attempts: usize,
    pub navigation_timeout: Duration,
    pub load_timeout: Duration,
}

impl Config {
    /// Read configuration from the process environment (after `.env`).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = get("OPENAI_API_KEY")
            .ok_or_else(|| anyhow!("OPENAI_API_KEY not set in environment"))?;

        let secs = |key: &str, default: Duration| -> Result<Duration> {
            match get(key) {
                Some(v) => v
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{key} must be a whole number of seconds")),
                None => Ok(default),
            }
        };

        let headless = match get("PILOT_HEADLESS").as_deref() {
            None => true,
            Some("1" | "true" | "yes" | "on") => true,
            Some("0" | "false" | "no" | "off") => false,
            Some(other) => return Err(anyhow!("PILOT_HEADLESS: unrecognised value '{other}'")),
        };

        let max_healing_attempts = match get("PILOT_MAX_HEALING_ATTEMPTS") {
            Some(v) => v
                .parse()
                .context("PILOT_MAX_HEALING_ATTEMPTS must be a number")?,
            None => MAX_HEALING_ATTEMPTS,
        };

        Ok(Self {
            api_key,
            model: get("PILOT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            llm_base_url: get("PILOT_LLM_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            llm_timeout: secs("PILOT_LLM_TIMEOUT_SECS", Duration::from_secs(60))?,
            mode: if headless {
                RunMode::Headless
            } else {
                RunMode::Headed
            },
            chrome_path: get("CHROME_PATH").map(PathBuf::from),
            chrome_debug_url: get("CHROME_DEBUG_URL"),
            artifacts_dir: get("PILOT_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("artifacts")),
            max_healing_attempts,
            navigation_timeout: secs("PILOT_NAV_TIMEOUT_SECS", NAVIGATION_TIMEOUT)?,
            load_timeout: secs("PILOT_LOAD_TIMEOUT_SECS", LOAD_TIMEOUT)?,
        })
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            navigation_timeout: self.navigation_timeout,
            load_timeout: self.load_timeout,
            max_healing_attempts: self.max_healing_attempts,
            screenshot_dir: Some(self.artifacts_dir.join("screenshots")),
        }
    }
}
