use anyhow::{Context, Result};
use clap::Parser;
use mcpflow_core::config::{AppConfig, ConfigLoader, ConfigPaths};
use mcpflow_core::session::WorkflowSession;
use mcpflow_core::trace::QueryObserver;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

mod console;

use console::{ConsoleLevel, ConsoleObserver};

const LOG_FILE: &str = "mcpflow.log";

#[derive(Parser, Debug)]
#[clap(
    name = "mcpflow",
    author,
    version = "0.1.0",
    about = "Run LLM workflows backed by MCP tool servers"
)]
struct Cli {
    /// Name of the workflow to run
    #[clap(required_unless_present = "list_workflows")]
    workflow_name: Option<String>,

    #[clap(long, short, help = "Answer a single query and exit")]
    query: Option<String>,

    #[clap(long, help = "Path to the MCP servers file (JSON or YAML)")]
    mcp_config: Option<PathBuf>,

    #[clap(long, help = "Path to the workflows file (JSON or YAML)")]
    workflows_config: Option<PathBuf>,

    #[clap(long, short, help = "List the configured workflows and exit")]
    list_workflows: bool,

    #[clap(long, value_enum, default_value = "user")]
    log_level: ConsoleLevel,

    #[clap(long, help = "Log to stderr instead of mcpflow.log")]
    no_log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let paths = ConfigPaths {
        mcp_servers: cli.mcp_config.clone(),
        workflows: cli.workflows_config.clone(),
    };
    let config = ConfigLoader::load(&paths)
        .await
        .context("Failed to load configuration")?;

    if cli.list_workflows {
        print_workflows(&config);
        return Ok(());
    }

    let workflow_name = cli
        .workflow_name
        .as_deref()
        .context("A workflow name is required")?;
    let observer = ConsoleObserver::new(cli.log_level);

    eprintln!("Starting workflow '{}'...", workflow_name);
    let session = WorkflowSession::connect(workflow_name, &config)
        .await
        .with_context(|| format!("Failed to set up workflow '{}'", workflow_name))?;
    if cli.log_level > ConsoleLevel::Quiet {
        eprintln!(
            "Workflow '{}' ready ({} tools: {})",
            workflow_name,
            session.tool_names().len(),
            session.tool_names().join(", ")
        );
    }

    let result = match &cli.query {
        Some(query) => run_single(&session, query, &observer).await,
        None => run_interactive(&session, &observer).await,
    };
    session.close().await;
    log::info!("Workflow '{}' finished", workflow_name);
    result
}

fn init_logging(cli: &Cli) -> Result<()> {
    if cli.no_log_file {
        env_logger::Builder::new()
            .filter_level(cli.log_level.log_filter())
            .init();
        return Ok(());
    }

    use std::fs::OpenOptions;

    let mut log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE)
        .with_context(|| format!("Failed to open {}", LOG_FILE))?;
    writeln!(
        log_file,
        "\n--- mcpflow session started {} ---",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )?;

    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Debug)
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .init();
    Ok(())
}

fn print_workflows(config: &AppConfig) {
    if config.workflows.is_empty() {
        println!("No workflows configured.");
        return;
    }
    println!("Available workflows:");
    for (name, workflow) in &config.workflows {
        match &workflow.description {
            Some(description) => println!("  {:<24} {}", name, description),
            None => println!("  {:<24} (model: {})", name, workflow.model_name),
        }
    }
}

async fn run_single(session: &WorkflowSession, query: &str, observer: &dyn QueryObserver) -> Result<()> {
    let answer = answer_query(session, query, observer).await?;
    println!("{}", answer);
    Ok(())
}

async fn run_interactive(session: &WorkflowSession, observer: &dyn QueryObserver) -> Result<()> {
    println!("Enter your queries for '{}' (type 'quit' to exit).", session.name());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("\nQuery: ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let query = line.trim();
        if query.eq_ignore_ascii_case("quit") {
            break;
        }
        if query.is_empty() {
            continue;
        }

        match answer_query(session, query, observer).await {
            Ok(answer) => println!("\nAssistant:\n{}", answer),
            Err(e) => eprintln!("Error: {}", e),
        }
    }
    println!("Exiting.");
    Ok(())
}

/// Run one query; Ctrl-C while it runs cancels only this query.
async fn answer_query(session: &WorkflowSession, query: &str, observer: &dyn QueryObserver) -> Result<String> {
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = session.process_query(query, observer, cancel).await;
    interrupt.abort();
    Ok(result?)
}
