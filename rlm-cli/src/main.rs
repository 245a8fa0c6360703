mod event_log;

use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use rlm_core::*;
use tokio::sync::mpsc;

use event_log::EventLogger;

#[derive(Parser)]
#[command(
    name = "rlm",
    about = "RLM: answer a question about large input by writing and running code",
    after_help = "Examples:\n  echo 'hello' | rlm 'What does this say?'\n  rlm --file doc.txt 'Summarize this'"
)]
struct Args {
    /// The question or task to perform on the input
    query: String,

    /// Read input from a file instead of stdin
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Show progress on stderr
    #[arg(short, long)]
    verbose: bool,

    /// Root model (defaults per provider: claude-opus-4-6, anthropic/claude-opus-4.6 on OpenRouter)
    #[arg(long, env = "RLM_MODEL")]
    model: Option<String>,

    /// Model used by llm_query / llm_query_batched
    #[arg(long, env = "RLM_SUB_MODEL")]
    sub_model: Option<String>,

    /// Round budget before giving up
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Backend provider: anthropic or openrouter
    #[arg(long)]
    provider: Option<ProviderKind>,

    /// Base URL for the provider API
    #[arg(long)]
    base_url: Option<String>,

    /// API key (otherwise ANTHROPIC_API_KEY / OPENROUTER_API_KEY / ~/.rlm/config.json)
    #[arg(long)]
    api_key: Option<String>,

    /// Append every run event as a JSON line to this file
    #[arg(long, value_name = "PATH")]
    events: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries only the answer.
    {
        use tracing_subscriber::EnvFilter;
        let default = if args.verbose { "info" } else { "warn" };
        let filter =
            EnvFilter::try_from_env("RLM_LOG").unwrap_or_else(|_| EnvFilter::new(default));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let input = read_input(args.file.as_deref())?;
    if input.trim().is_empty() {
        bail!("input is empty");
    }
    tracing::info!(
        "input: {} chars, {} lines",
        input.chars().count(),
        input.lines().count()
    );

    let config = RlmConfig::load().unwrap_or_default();
    let provider = Provider::resolve(
        args.provider,
        args.api_key.clone(),
        args.base_url.clone(),
        Some(&config),
        |var| std::env::var(var).ok(),
    )?;

    let root_model = args
        .model
        .clone()
        .or_else(|| config.root_model.clone())
        .unwrap_or_else(|| provider.default_root_model().to_string());
    let sub_model = args
        .sub_model
        .clone()
        .or_else(|| config.sub_model.clone())
        .unwrap_or_else(|| provider.default_sub_model().to_string());
    tracing::info!("root model {root_model}, sub-query model {sub_model}");

    let mut gateway_config = GatewayConfig {
        model: sub_model,
        ..Default::default()
    };
    if let Some(workers) = config.batch_workers {
        gateway_config.batch_workers = workers;
    }
    let backend = Arc::new(HttpBackend::new(provider).context("failed to build HTTP client")?);
    let gateway = Arc::new(Gateway::new(backend, gateway_config));

    let mut agent_config = AgentConfig {
        model: root_model,
        ..Default::default()
    };
    if let Some(n) = args.max_iterations.or(config.max_iterations) {
        agent_config.max_iterations = n;
    }
    if let Some(n) = config.max_output_chars {
        agent_config.max_output_chars = n;
    }
    let agent = Agent::new(gateway, agent_config);

    let answer = match &args.events {
        Some(path) => run_logged(&agent, &args.query, &input, path).await?,
        None => agent.run(&args.query, &input).await?,
    };
    println!("{answer}");
    Ok(())
}

fn read_input(file: Option<&std::path::Path>) -> anyhow::Result<String> {
    if let Some(path) = file {
        if !path.exists() {
            bail!("file not found: {}", path.display());
        }
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()));
    }
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        bail!("no input provided: pipe input or use --file");
    }
    let mut input = String::new();
    stdin
        .read_to_string(&mut input)
        .context("failed to read stdin")?;
    Ok(input)
}

/// Run while draining events into the JSONL log.
async fn run_logged(
    agent: &Agent,
    query: &str,
    input: &str,
    path: &std::path::Path,
) -> anyhow::Result<String> {
    let mut logger = EventLogger::open(path, query, input.chars().count())
        .with_context(|| format!("failed to open event log {}", path.display()))?;
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            logger.log_event(&event);
        }
        logger
    });

    let outcome = agent.run_with_events(query, input, tx).await;
    let logger = writer.await.context("event logger task failed")?;
    logger.finish()?;
    Ok(outcome?.answer)
}
