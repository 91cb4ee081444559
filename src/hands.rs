use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, Element, LaunchOptions, Tab};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::RunMode;
use crate::dom;
use crate::ports::{PageAutomation, ResultShape, StructuredCompletion, complete_as};
use crate::types::{CandidateAction, PageDiagnostics, ProbeKind, ProbeValue};

/// How long to let the page settle after an interaction.
const SETTLE: Duration = Duration::from_millis(500);

/// A Chrome tab driven over CDP. Element choice and extraction are
/// delegated to the structured-completion client.
pub struct ChromePage {
    _browser: Browser,
    tab: Arc<Tab>,
    llm: Arc<dyn StructuredCompletion>,
}

impl ChromePage {
    /// Attach to `CHROME_DEBUG_URL` when configured, otherwise launch Chrome.
    pub fn launch(config: &Config, llm: Arc<dyn StructuredCompletion>) -> Result<Self> {
        if let Some(url) = &config.chrome_debug_url {
            info!(%url, "attaching to existing Chrome");
            let browser = Browser::connect(url.clone())
                .with_context(|| format!("could not attach to Chrome at {url}"))?;
            let existing = {
                let tabs = browser.get_tabs();
                let tabs = tabs
                    .lock()
                    .map_err(|_| anyhow!("Chrome tab list lock poisoned"))?;
                tabs.first().cloned()
            };
            let tab = match existing {
                Some(tab) => tab,
                None => browser.new_tab()?,
            };
            return Ok(Self {
                _browser: browser,
                tab,
                llm,
            });
        }

        let headless = config.mode == RunMode::Headless;
        let profile = if headless { None } else { persistent_profile()? };

        let options = LaunchOptions {
            headless,
            path: config.chrome_path.clone(),
            user_data_dir: profile,
            window_size: Some((1366, 900)),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(300),
            ..Default::default()
        };

        info!(headless, "launching Chrome");
        let browser =
            Browser::new(options).map_err(|e| anyhow!("Browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!("Chrome ready");

        Ok(Self {
            _browser: browser,
            tab,
            llm,
        })
    }

    /// Run blocking CDP work off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| anyhow!("browser task panicked: {e}"))?
    }
}

/// Headed runs keep a profile so logins survive between invocations.
fn persistent_profile() -> Result<Option<PathBuf>> {
    let Some(base) = dirs::data_local_dir() else {
        return Ok(None);
    };
    let profile = base.join("scenario-pilot").join("chrome-profile");
    std::fs::create_dir_all(&profile)
        .with_context(|| format!("creating Chrome profile at {}", profile.display()))?;
    Ok(Some(profile))
}

fn find_element<'a>(tab: &'a Tab, selector: &str) -> Result<Element<'a>> {
    match selector.strip_prefix("xpath=") {
        Some(xpath) => tab.find_element_by_xpath(xpath),
        None => tab.find_element(selector),
    }
}

fn eid_selector(element_id: &str) -> String {
    let id = element_id.trim().trim_start_matches('[').trim_end_matches(']');
    format!("[data-eid=\"[{id}]\"]")
}

/// A drop target given either as a snapshot id (`e7`, `[e7]`) or as a selector.
fn drop_target_selector(target: &str) -> String {
    let id = target.trim().trim_start_matches('[').trim_end_matches(']');
    let is_eid = id
        .strip_prefix('e')
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
    if is_eid {
        eid_selector(id)
    } else {
        target.trim().to_string()
    }
}

#[derive(Debug, Deserialize)]
struct ObservedElement {
    element_id: String,
    method: String,
    #[serde(default)]
    arguments: Vec<String>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct Observation {
    #[serde(default)]
    candidates: Vec<ObservedElement>,
}

fn observation_shape() -> ResultShape {
    ResultShape::new(
        "observation",
        json!({
            "type": "object",
            "properties": {
                "candidates": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "element_id": {"type": "string", "description": "The eN id from the element list"},
                            "method": {
                                "type": "string",
                                "enum": ["click", "dblclick", "fill", "type", "press", "selectOption", "hover", "scrollIntoView", "drag"]
                            },
                            "arguments": {"type": "array", "items": {"type": "string"}},
                            "description": {"type": "string"}
                        },
                        "required": ["element_id", "method"]
                    }
                }
            },
            "required": ["candidates"]
        }),
    )
}

fn extraction_shape(schema: Option<&Value>) -> ResultShape {
    match schema {
        Some(schema) => ResultShape::new("extraction", schema.clone()),
        None => ResultShape::new(
            "extraction",
            json!({
                "type": "object",
                "properties": {"extraction": {"type": "string"}},
                "required": ["extraction"]
            }),
        ),
    }
}

#[async_trait]
impl PageAutomation for ChromePage {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.set_default_timeout(timeout);
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            if let Err(e) = dom::install_diagnostics_hook(tab) {
                warn!("diagnostics hook not installed: {e:#}");
            }
            Ok(())
        })
        .await
    }

    async fn wait_for_load(&self, state: &str, timeout: Duration) -> Result<()> {
        let accepted: &'static [&'static str] = match state {
            "domcontentloaded" => &["interactive", "complete"],
            _ => &["complete"],
        };
        let state = state.to_string();
        self.blocking(move |tab| {
            let deadline = Instant::now() + timeout;
            loop {
                let current = dom::ready_state(tab)?;
                if accepted.contains(&current.as_str()) {
                    break;
                }
                if Instant::now() >= deadline {
                    bail!("timed out after {timeout:?} waiting for '{state}' (readyState {current})");
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            dom::install_diagnostics_hook(tab)
        })
        .await
    }

    async fn current_location(&self) -> Result<String> {
        self.blocking(|tab| Ok(tab.get_url())).await
    }

    async fn locate(&self, query: &str) -> Result<Vec<CandidateAction>> {
        let snapshot = self.blocking(dom::capture_dom_snapshot).await?;
        let prompt = format!(
            "Interactive elements on the current page, one per line, with ids like [e0]:\n\
             {snapshot}\n\n\
             Find the elements that match: {query}\n\
             Return them best match first. For each give `element_id`, the `method` \
             to use on it, `arguments` (text to type, key to press, option to select, \
             or for `drag` the element_id of the drop target) \
             and a short `description`. Return an empty list if nothing matches."
        );
        let observation: Observation =
            complete_as(self.llm.as_ref(), &prompt, &observation_shape()).await?;
        debug!(query, found = observation.candidates.len(), "located candidates");

        Ok(observation
            .candidates
            .into_iter()
            .map(|c| CandidateAction {
                description: c.description,
                method: c.method,
                arguments: c.arguments,
                selector: Some(eid_selector(&c.element_id)),
                xpath: None,
            })
            .collect())
    }

    async fn execute(&self, action: &CandidateAction) -> Result<()> {
        let selector = action.resolved_selector();
        let method = action.method.to_lowercase().replace(['_', '-', '.'], "");
        let argument = action.arguments.first().cloned();
        info!(method = %action.method, target = %action.description, "executing");

        self.blocking(move |tab| {
            let selector = selector.as_deref();
            let need = || selector.ok_or_else(|| anyhow!("'{method}' needs a target element"));
            match method.as_str() {
                "click" => {
                    find_element(tab, need()?)?.click()?;
                }
                "dblclick" | "doubleclick" => dom::double_click(tab, need()?)?,
                "fill" | "type" => {
                    let sel = need()?;
                    find_element(tab, sel)?.click()?;
                    dom::clear_value(tab, sel)?;
                    tab.type_str(argument.as_deref().unwrap_or_default())?;
                }
                "press" | "presskey" => {
                    if let Some(sel) = selector {
                        dom::focus(tab, sel)?;
                    }
                    tab.press_key(argument.as_deref().unwrap_or("Enter"))?;
                }
                "select" | "selectoption" => {
                    let choice = argument
                        .as_deref()
                        .ok_or_else(|| anyhow!("select needs an option to choose"))?;
                    dom::select_option(tab, need()?, choice)?;
                }
                "hover" => {
                    find_element(tab, need()?)?.move_mouse_over()?;
                }
                "scroll" | "scrollto" | "scrollintoview" | "mousewheel" | "nextchunk"
                | "prevchunk" => {
                    find_element(tab, need()?)?.scroll_into_view()?;
                }
                "drag" | "draganddrop" => {
                    let target = argument
                        .as_deref()
                        .map(drop_target_selector)
                        .ok_or_else(|| anyhow!("drag needs a drop target"))?;
                    dom::drag_to(tab, need()?, &target)?;
                }
                other => bail!("unsupported action method '{other}'"),
            }
            std::thread::sleep(SETTLE);
            Ok(())
        })
        .await
    }

    async fn extract(&self, query: &str, schema: Option<&Value>) -> Result<Value> {
        let text = self.blocking(dom::page_text).await?;
        let prompt = format!(
            "Visible text of the current page:\n{text}\n\n\
             Extract: {query}\n\
             Copy values exactly as they appear on the page."
        );
        self.llm.complete(&prompt, &extraction_shape(schema)).await
    }

    async fn state_probe(&self, selector: &str, kind: ProbeKind) -> Result<ProbeValue> {
        let sel = selector.to_string();
        let state = self
            .blocking(move |tab| dom::element_state(tab, &sel))
            .await?;
        let Some(state) = state else {
            if kind == ProbeKind::Hidden {
                return Ok(ProbeValue::Flag(true));
            }
            bail!("no element matches {selector}");
        };
        Ok(match kind {
            ProbeKind::Visible => ProbeValue::Flag(state.visible),
            ProbeKind::Hidden => ProbeValue::Flag(!state.visible),
            ProbeKind::Enabled => ProbeValue::Flag(state.enabled),
            ProbeKind::Disabled => ProbeValue::Flag(!state.enabled),
            ProbeKind::Checked => ProbeValue::Flag(state.checked),
            ProbeKind::Value => ProbeValue::Text(state.value),
        })
    }

    async fn capture_diagnostic_snapshot(&self) -> Result<String> {
        self.blocking(dom::capture_dom_snapshot).await
    }

    async fn capture_screenshot(&self, path: &Path) -> Result<()> {
        let png = self
            .blocking(|tab| {
                tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
            })
            .await?;
        std::fs::write(path, png)
            .with_context(|| format!("writing screenshot to {}", path.display()))
    }

    async fn drain_diagnostics(&self) -> Result<PageDiagnostics> {
        self.blocking(dom::drain_diagnostics).await
    }
}
