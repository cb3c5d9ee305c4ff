mod face;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use face::AgentEvent;
use navigator_agent::browser::{BrowserSession, DEFAULT_DEBUG_PORT, LaunchSettings};
use navigator_agent::llm::{EmbeddingBackend, InferenceBackend, OllamaClient, VisionBackend};
use navigator_agent::{AgentConfig, Brain, MemoryStore, PageHandle};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "agent", version, about = "Local browser-automation agent")]
struct Cli {
    /// Where memory, screenshots and the browser profile live.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// First port tried for the operator console.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Run Chrome without a window.
    #[arg(long)]
    headless: bool,

    /// Debug port of a running Chrome to attach to before launching one
    /// (9222 when omitted).
    #[arg(long)]
    attach: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load .txt/.md documents into knowledge memory and exit.
    Ingest {
        /// Defaults to <data-dir>/library.
        dir: Option<PathBuf>,
    },
    /// Forget every learned page action and exit.
    ClearCache,
    /// Forget every stored knowledge chunk and exit.
    ClearKnowledge,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("navigator_agent=info,agent=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = AgentConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }

    let ollama = Arc::new(OllamaClient::new(&config)?);
    if !ollama.is_available().await {
        warn!(
            "No inference server answering at {}; commands will fall back to reflexes and learned actions",
            config.ollama_host
        );
    }

    let embedder: Arc<dyn EmbeddingBackend> = ollama.clone();
    let memory = Arc::new(MemoryStore::open(&config, embedder));

    match cli.command {
        Some(Command::Ingest { dir }) => {
            let dir = dir.unwrap_or_else(|| config.library_dir());
            let stored = memory.ingest_directory(&dir).await?;
            info!("Stored {} knowledge chunks from {}", stored, dir.display());
            return Ok(());
        }
        Some(Command::ClearCache) => {
            memory.clear_actions()?;
            info!("Action cache cleared");
            return Ok(());
        }
        Some(Command::ClearKnowledge) => {
            memory.clear_knowledge()?;
            info!("Knowledge memory cleared");
            return Ok(());
        }
        None => {}
    }

    // Console first, so the operator sees something while Chrome starts.
    let (mut cmd_rx, event_tx) = face::start_server(cli.port, memory.clone()).await?;

    let settings = LaunchSettings {
        attach_port: cli.attach.or(Some(DEFAULT_DEBUG_PORT)),
        headless: cli.headless,
        profile_dir: config.profile_dir(),
    };
    let launched = tokio::task::spawn_blocking(move || BrowserSession::launch(&settings)).await;
    let session = match launched {
        Ok(Ok(session)) => Some(session),
        Ok(Err(e)) => {
            error!("Browser unavailable: {:#}", e);
            let _ = event_tx.send(AgentEvent::Error {
                message: format!("Browser unavailable: {e:#}"),
            });
            None
        }
        Err(e) => {
            error!("Browser launch panicked: {}", e);
            None
        }
    };
    let page = session
        .as_ref()
        .map(|s| s.page() as Arc<dyn PageHandle>);

    let llm: Arc<dyn InferenceBackend> = ollama.clone();
    let vision: Arc<dyn VisionBackend> = ollama;
    let mut brain = Brain::new(config, page, memory, llm, Some(vision));
    info!("Agent ready. Waiting for commands...");

    while let Some(command) = cmd_rx.recv().await {
        run_command(&mut brain, &command, &event_tx).await;
    }

    drop(session);
    Ok(())
}

async fn run_command(brain: &mut Brain, command: &str, events: &broadcast::Sender<AgentEvent>) {
    let _ = events.send(AgentEvent::Thinking {
        command: command.to_string(),
    });

    let report = brain.handle_command(command).await;
    info!(action = %report.action_taken, "{}", report.response);

    let _ = events.send(AgentEvent::Report(report));
    let _ = events.send(AgentEvent::Ready);
}
