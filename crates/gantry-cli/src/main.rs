//! CLI binary for running, validating, and serving Gantry pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use gantry_pipeline::{
    default_registry_with_interviewer, load_graph, validate, AutoApproveInterviewer,
    ConsoleInterviewer, Engine, EngineConfig, EventEmitter, Interviewer, PipelineStatus,
    RetryPolicy, RunContext, Severity, SimulationBackend,
};

#[derive(Parser)]
#[command(name = "gantry", version, about = "DOT-based pipeline runner for AI build workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline from a .dot file
    Run {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,

        /// Retry preset: none, standard, aggressive, linear, patient
        #[arg(long, default_value = "standard")]
        retry: String,

        /// Checkpoint directory (default: <data-dir>/checkpoints)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Directory handed to handlers for artifact output
        #[arg(long)]
        artifact_dir: Option<PathBuf>,

        /// Data directory (default: $XDG_DATA_HOME/gantry)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Resume a checkpointed run by id
        #[arg(long)]
        resume: Option<String>,

        /// Start fresh even when a resumable checkpoint exists
        #[arg(long)]
        fresh: bool,

        /// Answer human gates with their default choice
        #[arg(long)]
        auto_approve: bool,
    },

    /// Validate a pipeline .dot file
    Validate {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,
    },

    /// Show information about a pipeline
    Info {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,
    },

    /// Run the HTTP control plane
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "7878")]
        port: u16,

        /// Data directory (default: $XDG_DATA_HOME/gantry)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Work with specification boards
    Spec {
        #[command(subcommand)]
        command: SpecCommands,

        /// Data directory (default: $XDG_DATA_HOME/gantry)
        #[arg(long, global = true)]
        data_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SpecCommands {
    /// Create a new specification
    New {
        #[arg(long)]
        title: String,
        #[arg(long)]
        one_liner: String,
        #[arg(long)]
        goal: String,
    },

    /// Show a specification board
    Show {
        /// Spec id (ULID)
        spec_id: String,
    },

    /// Add a card to a specification
    AddCard {
        spec_id: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "idea")]
        card_type: String,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        lane: Option<String>,
    },

    /// Undo the last card mutation
    Undo {
        spec_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Run {
            pipeline,
            retry,
            checkpoint_dir,
            artifact_dir,
            data_dir,
            resume,
            fresh,
            auto_approve,
        } => {
            cmd_run(
                &pipeline,
                &retry,
                checkpoint_dir,
                artifact_dir,
                data_dir,
                resume,
                fresh,
                auto_approve,
            )
            .await
        }
        Commands::Validate { pipeline } => cmd_validate(&pipeline),
        Commands::Info { pipeline } => cmd_info(&pipeline),
        Commands::Serve { port, data_dir } => cmd_serve(port, data_dir).await,
        Commands::Spec { command, data_dir } => cmd_spec(command, data_dir).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

/// Resolve the data directory: explicit flag, then `XDG_DATA_HOME`, then
/// `~/.local/share/gantry`.
fn resolve_data_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("gantry");
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".local/share/gantry")
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    path: &Path,
    retry: &str,
    checkpoint_dir: Option<PathBuf>,
    artifact_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    resume: Option<String>,
    fresh: bool,
    auto_approve: bool,
) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(path)?;
    let graph = load_graph(&source)?;

    let policy = RetryPolicy::from_name(retry)
        .ok_or_else(|| anyhow::anyhow!("unknown retry preset '{retry}'"))?;
    let data_dir = resolve_data_dir(data_dir);
    let checkpoint_dir = checkpoint_dir.unwrap_or_else(|| data_dir.join("checkpoints"));

    let config = EngineConfig {
        checkpoint_dir: Some(checkpoint_dir),
        retry: policy,
        ..EngineConfig::default()
    };

    let interviewer: Arc<dyn Interviewer> = if auto_approve {
        Arc::new(AutoApproveInterviewer)
    } else {
        Arc::new(ConsoleInterviewer)
    };
    let registry = default_registry_with_interviewer(Arc::new(SimulationBackend), interviewer);
    let engine = Engine::new(registry, config);

    println!("Running pipeline: {}", graph.name);
    if !graph.goal.is_empty() {
        println!("Goal: {}", graph.goal);
    }

    let report = match resume {
        Some(run_id) if !fresh => {
            println!("Resuming run {run_id}");
            engine.resume(&source, &run_id).await?
        }
        _ => {
            let run = RunContext::new(&source);
            if let Some(dir) = artifact_dir {
                run.context()
                    .set(
                        "artifact_dir",
                        serde_json::json!(dir.to_string_lossy().into_owned()),
                    )
                    .await;
            }
            let emitter = EventEmitter::new(run.run_id().to_string());
            engine.run_graph(&graph, &run, &emitter).await?
        }
    };

    println!("\nRun {} {}", report.run_id, report.status.as_str());
    println!("Completed nodes: {:?}", report.completed_nodes);
    if let Some(ref error) = report.error {
        println!("Error: {error}");
    }

    if report.status != PipelineStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(path)?;
    let mut ast = gantry_dot::parse(&source)?;
    gantry_pipeline::TransformRegistry::with_defaults().apply_all(&mut ast)?;
    let graph = gantry_pipeline::Graph::from_dot(&ast)?;
    let diagnostics = validate(&graph);

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        println!("[{severity}] {}: {}", diag.rule, diag.message);
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(path)?;
    let graph = load_graph(&source)?;

    println!("Pipeline: {}", graph.name);
    if !graph.goal.is_empty() {
        println!("Goal: {}", graph.goal);
    }
    println!("Nodes: {}", graph.node_count());
    println!("Edges: {}", graph.all_edges().len());

    if let Some(start) = graph.start_node() {
        println!("Start: {} ({})", start.id, start.label);
    }
    if let Some(exit) = graph.exit_node() {
        println!("Exit: {} ({})", exit.id, exit.label);
    }

    println!("\nNodes:");
    for node in graph.all_nodes() {
        let node_type = node.node_type.as_deref().unwrap_or("(default)");
        println!(
            "  {} [{}] shape={} type={}",
            node.id, node.label, node.shape, node_type
        );
    }

    Ok(())
}

async fn open_spec_actor(
    data_dir: &Path,
    spec_id: ulid::Ulid,
) -> anyhow::Result<gantry_spec::SpecActor> {
    let dir = data_dir.join("specs").join(spec_id.to_string());
    std::fs::create_dir_all(&dir)?;
    let (state, store) = gantry_spec::recover(&dir, spec_id).await?;
    Ok(gantry_spec::SpecActor::with_store(spec_id, state, store))
}

async fn cmd_spec(command: SpecCommands, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let data_dir = resolve_data_dir(data_dir);

    match command {
        SpecCommands::New {
            title,
            one_liner,
            goal,
        } => {
            let spec_id = ulid::Ulid::new();
            let actor = open_spec_actor(&data_dir, spec_id).await?;
            actor
                .send_command(gantry_spec::Command::CreateSpec {
                    title,
                    one_liner,
                    goal,
                })
                .await?;
            println!("Created spec {spec_id}");
        }

        SpecCommands::Show { spec_id } => {
            let spec_id = ulid::Ulid::from_string(&spec_id)?;
            let actor = open_spec_actor(&data_dir, spec_id).await?;
            actor
                .read_state(|state| {
                    match &state.core {
                        Some(core) => {
                            println!("{} — {}", core.title, core.one_liner);
                            println!("Goal: {}", core.goal);
                        }
                        None => println!("(spec not created yet)"),
                    }
                    for lane in &state.lanes {
                        println!("\n[{lane}]");
                        for card in state.cards_in_lane(lane) {
                            println!("  {} {} ({})", card.card_id, card.title, card.card_type);
                        }
                    }
                    println!("\nEvents: {}", state.last_event_id);
                })
                .await;
        }

        SpecCommands::AddCard {
            spec_id,
            title,
            card_type,
            body,
            lane,
        } => {
            let spec_id = ulid::Ulid::from_string(&spec_id)?;
            let actor = open_spec_actor(&data_dir, spec_id).await?;
            let events = actor
                .send_command(gantry_spec::Command::CreateCard {
                    card_type,
                    title,
                    body,
                    lane,
                    created_by: "cli".into(),
                })
                .await?;
            if let gantry_spec::EventPayload::CardCreated { card } = &events[0].payload {
                println!("Added card {}", card.card_id);
            }
        }

        SpecCommands::Undo { spec_id } => {
            let spec_id = ulid::Ulid::from_string(&spec_id)?;
            let actor = open_spec_actor(&data_dir, spec_id).await?;
            let events = actor.send_command(gantry_spec::Command::Undo).await?;
            println!("Undid event {}", events[0].event_id);
        }
    }

    Ok(())
}

async fn cmd_serve(port: u16, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let data_dir = resolve_data_dir(data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let manager = gantry_server::RunManager::new(
        &data_dir,
        Arc::new(SimulationBackend),
        EngineConfig::default(),
    );
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    println!("Serving on http://{addr} (data dir: {})", data_dir.display());
    gantry_server::serve(manager, addr).await?;
    Ok(())
}
