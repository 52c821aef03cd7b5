#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use partwise::batch::{BatchConfig, BatchItem, BatchRunner};
use partwise::gateway::{ChatGateway, NoopUsageSink, ProviderGateway};
use partwise::pipeline::{PipelineConfig, PipelineCoordinator, RunIdentity};
use partwise::roles::RoleSet;
use partwise::store::RunStore;

#[derive(Parser)]
#[command(name = "partwise", version, about = "Multi-role MusicXML score pipeline")]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides this)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Override the planner model id
    #[arg(long, global = true)]
    planner_model: Option<String>,
    /// Override the refiner model id
    #[arg(long, global = true)]
    refiner_model: Option<String>,
    /// Override the organizer model id
    #[arg(long, global = true)]
    organizer_model: Option<String>,
    /// Override the renderer model id
    #[arg(long, global = true)]
    renderer_model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn role_set(&self) -> RoleSet {
        let mut roles = RoleSet::default();
        if let Some(model) = &self.planner_model {
            roles.planner.model = model.clone();
        }
        if let Some(model) = &self.refiner_model {
            roles.refiner.model = model.clone();
        }
        if let Some(model) = &self.organizer_model {
            roles.organizer.model = model.clone();
        }
        if let Some(model) = &self.renderer_model {
            roles.renderer.model = model.clone();
        }
        roles
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one pipeline for a single prompt
    Run {
        /// Prompt text (mutually exclusive with --prompt-file)
        #[arg(long)]
        prompt: Option<String>,
        /// File containing the prompt text
        #[arg(long)]
        prompt_file: Option<PathBuf>,
        /// Category number used in output file names
        #[arg(long, default_value_t = 1)]
        category: u32,
        /// Prompt number used in output file names
        #[arg(long, default_value_t = 1)]
        item: u32,
        /// Trial number used in output file names
        #[arg(long, default_value_t = 1)]
        trial: u32,
        /// Output directory (conversations/ and scores/ created inside)
        #[arg(long, default_value = "output")]
        out: PathBuf,
        /// Use the prompt verbatim instead of calling the planner
        #[arg(long)]
        skip_planner: bool,
        /// Maximum fan-out rounds, including the first
        #[arg(long, default_value_t = 3)]
        max_iterations: usize,
        /// Concurrent renderer calls per round
        #[arg(long, default_value_t = 20)]
        fanout: usize,
    },
    /// Run a batch of prompts from a JSON file
    Batch {
        /// JSON array of {category, item, prompt, trials?}
        #[arg(long)]
        input: PathBuf,
        /// Output directory (conversations/ and scores/ created inside)
        #[arg(long, default_value = "output")]
        out: PathBuf,
        /// Concurrent pipeline runs
        #[arg(long, default_value_t = 5)]
        width: usize,
        /// Use each prompt verbatim instead of calling the planner
        #[arg(long)]
        skip_planner: bool,
        /// Maximum fan-out rounds per run
        #[arg(long, default_value_t = 3)]
        max_iterations: usize,
        /// Concurrent renderer calls per run
        #[arg(long, default_value_t = 20)]
        fanout: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "partwise=debug" } else { "partwise=info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Set the shared cancel flag on the first interrupt. In-flight calls
/// finish; runs stop at the next checkpoint.
fn watch_for_interrupt(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received; finishing in-flight calls, then stopping");
            cancel.store(true, Ordering::SeqCst);
        }
    });
}

fn pipeline_config(
    roles: RoleSet,
    skip_planner: bool,
    max_iterations: usize,
    fanout: usize,
) -> PipelineConfig {
    PipelineConfig {
        roles,
        max_iterations,
        fanout_width: fanout,
        skip_planner,
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = Arc::new(AtomicBool::new(false));
    watch_for_interrupt(cancel.clone());

    let roles = cli.role_set();
    match cli.command {
        Commands::Run {
            prompt,
            prompt_file,
            category,
            item,
            trial,
            out,
            skip_planner,
            max_iterations,
            fanout,
        } => {
            let prompt = match (prompt, prompt_file) {
                (Some(text), None) => text,
                (None, Some(path)) => tokio::fs::read_to_string(path).await?,
                _ => return Err("provide exactly one of --prompt or --prompt-file".into()),
            };

            let store = RunStore::create(&out)?;
            let gateway: Arc<dyn ChatGateway> =
                Arc::new(ProviderGateway::from_env(Arc::new(NoopUsageSink))?);
            let coordinator = PipelineCoordinator::new(
                gateway,
                pipeline_config(roles, skip_planner, max_iterations, fanout),
                store,
                RunIdentity::new(category, item, trial),
            );

            let report = coordinator.run(&prompt, Some(cancel.as_ref())).await?;
            println!("state: {:?}", report.state);
            println!("rounds: {}", report.iterations);
            if let Some(path) = &report.score_path {
                println!("score: {}", path.display());
            }
            println!("transcript: {}", report.transcript_path.display());
        }
        Commands::Batch {
            input,
            out,
            width,
            skip_planner,
            max_iterations,
            fanout,
        } => {
            let text = tokio::fs::read_to_string(&input).await?;
            let items: Vec<BatchItem> = serde_json::from_str(&text)?;
            if items.is_empty() {
                return Err("batch input contains no items".into());
            }

            let store = RunStore::create(&out)?;
            let gateway: Arc<dyn ChatGateway> =
                Arc::new(ProviderGateway::from_env(Arc::new(NoopUsageSink))?);
            let runner = BatchRunner::new(
                gateway,
                BatchConfig {
                    width,
                    pipeline: pipeline_config(roles, skip_planner, max_iterations, fanout),
                },
                store,
            );

            let summary = runner.run(&items, Some(cancel.as_ref())).await;
            println!(
                "completed: {}  incomplete: {}  cancelled: {}  failed: {}  skipped: {}",
                summary.completed,
                summary.incomplete,
                summary.cancelled,
                summary.failed,
                summary.skipped
            );
            if summary.failed > 0 {
                return Err(format!("{} run(s) failed", summary.failed).into());
            }
        }
    }

    Ok(())
}
