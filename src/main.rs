use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use scenario_pilot::brain::Brain;
use scenario_pilot::config::Config;
use scenario_pilot::hands::ChromePage;
use scenario_pilot::{
    ExecutionContext, RunMode, Scenario, ScenarioNormalizer, StepDispatcher, StepResult,
    StructuredCompletion,
};

#[derive(Parser)]
#[command(
    name = "scenario-pilot",
    version,
    about = "Run natural-language browser test scenarios"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scenarios one after another on a single browser session
    Run {
        /// Scenario files: `.json` for structured steps, anything else is free text
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Show the browser window
        #[arg(long)]
        headed: bool,
        /// Where failure screenshots are written
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,
    },
    /// Print the structured steps a free-text scenario normalizes to
    Normalize { file: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    init_tracing();

    match run(Cli::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Returns whether every scenario passed.
async fn run(cli: Cli) -> Result<bool> {
    let mut config = Config::from_env()?;

    match cli.command {
        Command::Normalize { file } => {
            let brain = Brain::new(&config)?;
            let text = read_scenario(&file)?;
            let scenario = brain.normalize(&text).await?;
            println!("{}", serde_json::to_string_pretty(&scenario)?);
            Ok(true)
        }
        Command::Run {
            files,
            headed,
            artifacts_dir,
        } => {
            if headed {
                config.mode = RunMode::Headed;
            }
            if let Some(dir) = artifacts_dir {
                config.artifacts_dir = dir;
            }
            run_scenarios(&config, &files).await
        }
    }
}

async fn run_scenarios(config: &Config, files: &[PathBuf]) -> Result<bool> {
    let brain = Arc::new(Brain::new(config)?);

    // Launch in a blocking task (it can take a while)
    let page = {
        let config = config.clone();
        let llm: Arc<dyn StructuredCompletion> = brain.clone();
        tokio::task::spawn_blocking(move || ChromePage::launch(&config, llm))
            .await
            .context("browser launch panicked")??
    };

    let dispatcher = StepDispatcher::new(&page, &*brain, config.runner_settings());
    let mut ctx = ExecutionContext::new(config.mode, "");
    let mut all_passed = true;

    for file in files {
        let text = read_scenario(file)?;
        ctx.reset_for_new_scenario(text.clone());

        let scenario = match load_scenario(file, &text, &*brain).await {
            Ok(s) => s,
            Err(e) => {
                error!(file = %file.display(), "could not load scenario: {e:#}");
                all_passed = false;
                continue;
            }
        };

        let title = scenario
            .title
            .clone()
            .unwrap_or_else(|| file.display().to_string());
        info!(%title, steps = scenario.steps.len(), "running scenario");
        println!("== {title}");

        let summary = dispatcher.run_scenario(&mut ctx, scenario).await;
        for result in ctx.results() {
            print_result(result);
        }
        println!(
            "-- {} passed, {} failed, {} skipped",
            summary.passed, summary.failed, summary.skipped
        );
        all_passed &= summary.success();
    }

    Ok(all_passed)
}

fn read_scenario(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

async fn load_scenario(
    path: &Path,
    text: &str,
    normalizer: &dyn ScenarioNormalizer,
) -> Result<Scenario> {
    if path.extension().is_some_and(|ext| ext == "json") {
        return serde_json::from_str(text)
            .with_context(|| format!("parsing structured scenario {}", path.display()));
    }
    normalizer.normalize(text).await
}

fn print_result(result: &StepResult) {
    println!(
        "[{}] {} ({} ms)",
        result.status, result.step_label, result.duration_ms
    );
    if let Some(details) = &result.details {
        println!("       {details}");
    }
    if let Some(path) = &result.screenshot_path {
        println!("       screenshot: {path}");
    }
}
