use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use volley::client::OpenAiBatchClient;
use volley::config::OrchestratorConfig;
use volley::describe::PromptDescriptionSource;
use volley::error::Result;
use volley::guard::RunLease;
use volley::orchestrator::{local_status_lines, Orchestrator};
use volley::records::JsonRecordStore;
use volley::registry::RegistryStore;

#[derive(Parser)]
#[command(name = "volley", about = "Batch-submission orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct CommonArgs {
    /// State directory holding the registry, lease, and batch artifacts.
    #[arg(long, env = "VOLLEY_STATE_DIR", default_value = ".volley")]
    state_dir: PathBuf,

    /// Path to the downstream records file.
    #[arg(long, env = "VOLLEY_RECORDS", default_value = "records.json")]
    records: PathBuf,

    /// API key for the submission service. Required for `run`; `status`
    /// falls back to local registry info without it.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Override the service base URL.
    #[arg(long, env = "VOLLEY_BASE_URL")]
    base_url: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one orchestration run: retrieve, send, collect.
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// Items per batch before it is finalized.
        #[arg(long, default_value_t = 20)]
        ceiling: usize,

        /// Minimum accepted description length in characters.
        #[arg(long, default_value_t = 20)]
        min_description: usize,

        /// Model name placed in every request.
        #[arg(long, env = "VOLLEY_MODEL", default_value = "gpt-4o-mini")]
        model: String,

        /// Variant tags to collect after originals.
        #[arg(long = "variant", value_name = "TAG")]
        variants: Vec<String>,

        /// After the run, wait up to this many seconds for in-flight batches.
        #[arg(long, value_name = "SECS")]
        wait: Option<u64>,
    },
    /// Show active batches and their progress.
    Status {
        #[command(flatten)]
        common: CommonArgs,
    },
}

fn build_orchestrator(
    common: &CommonArgs,
    api_key: String,
    config: OrchestratorConfig,
) -> Result<Orchestrator<OpenAiBatchClient>> {
    let store = Arc::new(RegistryStore::open(&common.state_dir)?);
    let records = Arc::new(JsonRecordStore::open(&common.records)?);
    let client = Arc::new(OpenAiBatchClient::new(api_key, common.base_url.clone())?);
    Ok(Orchestrator::new(
        store,
        client,
        records,
        Arc::new(PromptDescriptionSource),
        config,
    ))
}

async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            common,
            ceiling,
            min_description,
            model,
            variants,
            wait,
        } => {
            let api_key = common.api_key.clone().ok_or_else(|| {
                anyhow::anyhow!("an API key is required to run (--api-key or OPENAI_API_KEY)")
            })?;

            // Acquired before anything else touches the state directory.
            let _lease = RunLease::acquire(&common.state_dir)?;

            let config = OrchestratorConfig {
                model,
                batch_ceiling: ceiling,
                min_description_len: min_description,
                variant_tags: variants,
                wait_timeout: wait.map(Duration::from_secs),
                ..OrchestratorConfig::default()
            };
            let orchestrator = build_orchestrator(&common, api_key, config)?;
            let summary = orchestrator.run().await?;
            println!("{summary}");
            Ok(())
        }
        Command::Status { common } => {
            let lines = match common.api_key.clone() {
                Some(api_key) => {
                    let orchestrator =
                        build_orchestrator(&common, api_key, OrchestratorConfig::default())?;
                    orchestrator.status_lines().await?
                }
                None => {
                    let store = RegistryStore::open(&common.state_dir)?;
                    local_status_lines(&store)?
                }
            };
            for line in lines {
                println!("{line}");
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = execute(cli).await {
        tracing::error!(error = %e, "run failed");
        std::process::exit(e.exit_code());
    }
}
