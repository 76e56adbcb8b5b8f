mod brain;
mod dom;
mod face;
mod hands;
mod types;

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use publish_agent::{
    AgentConfig, AgentEvent, AgentOrchestrator, JsonRouteStore, ProviderChain, RouteStore, Task,
    VisionDecisionProvider,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent", about = "Learns browser publishing workflows and replays them")]
struct Cli {
    /// Where compiled routes are stored (default: AGENT_ROUTES_DIR or the
    /// user data dir).
    #[arg(long, global = true)]
    routes_dir: Option<PathBuf>,

    /// Launch Chrome without a window.
    #[arg(long, global = true)]
    headless: bool,

    /// Do not attach screenshots to provider prompts.
    #[arg(long, global = true)]
    no_screenshots: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task and print the run report as JSON.
    Run {
        #[arg(long)]
        workflow: String,
        #[arg(long)]
        goal: String,
        /// Task input, repeatable: --var title="Hello"
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Start the web UI.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the stored route for a workflow.
    Show {
        #[arg(long)]
        workflow: String,
    },
    /// Delete the stored route for a workflow.
    Forget {
        #[arg(long)]
        workflow: String,
    },
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    Ok((name.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AgentConfig::from_env();
    if let Some(dir) = cli.routes_dir.clone() {
        config.routes_dir = dir;
    }
    let store = Arc::new(JsonRouteStore::new(config.routes_dir.clone()));
    let flags = BrowserFlags {
        headless: cli.headless,
        screenshots: !cli.no_screenshots,
    };

    match cli.command {
        Command::Show { workflow } => {
            match store.load(&workflow).await? {
                Some(route) => {
                    println!("{}", serde_json::to_string_pretty(&route)?);
                    let vars: Vec<&str> = route.template_vars().into_iter().collect();
                    tracing::info!(
                        "[Agent] '{}' needs --var for: {}",
                        workflow,
                        if vars.is_empty() { "nothing".to_string() } else { vars.join(", ") }
                    );
                }
                None => bail!("no route stored for '{}'", workflow),
            }
            Ok(())
        }
        Command::Forget { workflow } => {
            if store.remove(&workflow).await? {
                tracing::info!("[Agent] Forgot route for '{}'", workflow);
            } else {
                tracing::info!("[Agent] No route stored for '{}'", workflow);
            }
            Ok(())
        }
        Command::Run {
            workflow,
            goal,
            vars,
        } => {
            let (events, _) = broadcast::channel::<AgentEvent>(64);
            let orchestrator = build_orchestrator(&flags, config, store, events).await?;

            let mut task = Task::new(workflow, goal);
            task.variables.extend(vars);

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("[Agent] Interrupted, stopping after the current step");
                    on_ctrl_c.cancel();
                }
            });

            let report = orchestrator.run(&task, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_completed() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Serve { port } => {
            let (events, _) = broadcast::channel::<AgentEvent>(256);
            let orchestrator = build_orchestrator(&flags, config, store, events.clone()).await?;
            let state = Arc::new(face::AppState::new(Arc::new(orchestrator), events));
            face::serve(state, port).await
        }
    }
}

struct BrowserFlags {
    headless: bool,
    screenshots: bool,
}

async fn build_orchestrator(
    flags: &BrowserFlags,
    config: AgentConfig,
    store: Arc<JsonRouteStore>,
    events: broadcast::Sender<AgentEvent>,
) -> Result<AgentOrchestrator> {
    let providers = providers_from_env();
    if providers.is_empty() {
        bail!("no decision provider configured; set OPENAI_API_KEY or DEEPSEEK_API_KEY");
    }
    tracing::info!(
        "[Agent] Providers: {}",
        providers
            .iter()
            .map(|p| p.name().to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    let (headless, screenshots) = (flags.headless, flags.screenshots);
    let sessions = tokio::task::spawn_blocking(move || {
        hands::ChromeSessions::launch(headless, screenshots)
    })
    .await
    .map_err(|e| anyhow!("Browser launch panicked: {}", e))??;

    let chain = ProviderChain::new(providers, &config);
    Ok(AgentOrchestrator::new(Arc::new(sessions), chain, store, config).with_events(events))
}

/// Primary first, then fallbacks, in a fixed order.
fn providers_from_env() -> Vec<Arc<dyn VisionDecisionProvider>> {
    let mut providers: Vec<Arc<dyn VisionDecisionProvider>> = Vec::new();

    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let base = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        providers.push(Arc::new(brain::OpenAiCompatProvider::new(
            "openai", key, base, model, true,
        )));
    }

    if let Ok(key) = std::env::var("DEEPSEEK_API_KEY") {
        let model = std::env::var("DEEPSEEK_MODEL").unwrap_or_else(|_| "deepseek-chat".to_string());
        providers.push(Arc::new(brain::OpenAiCompatProvider::new(
            "deepseek",
            key,
            "https://api.deepseek.com/v1",
            model,
            false,
        )));
    }

    providers
}
