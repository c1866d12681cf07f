//! fl-server: federated averaging coordinator.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use fedround_coordinator::Federation;
use fedround_core::{init_tracing, load_initial_parameters, snapshot, InitialSource, ModelSpec, ServerConfig};
use tracing::{info, info_span, Instrument};

#[derive(Parser)]
#[command(name = "fl-server")]
#[command(version)]
#[command(about = "Federated averaging round coordinator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator until every round is done
    Serve(ServeArgs),

    /// Write a freshly initialized parameter snapshot
    Init {
        /// Model preset: linear:<features> or cifar-cnn
        #[arg(long)]
        model: ModelSpec,

        /// Snapshot file to write
        #[arg(long, value_name = "PATH")]
        out: PathBuf,

        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Initial parameter snapshot
    #[arg(long, value_name = "PATH")]
    snapshot: Option<PathBuf>,

    /// Model preset; initializes randomly without --snapshot, validates the snapshot with it
    #[arg(long)]
    model: Option<ModelSpec>,

    /// Seed for random initialization
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Number of rounds (overrides the config file and environment)
    #[arg(short, long)]
    rounds: Option<u64>,

    /// Config file layered over the defaults
    #[arg(short, long, env = "FEDROUND_CONFIG_FILE", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Attached to every log line
    #[arg(long, default_value = "default")]
    project_id: String,

    /// Write the final global parameters here after a finished run
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing("fl-server") {
        eprintln!("fl-server: {e:#}");
        return ExitCode::FAILURE;
    }
    let outcome = match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Init { model, out, seed } => init(&model, &out, seed),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fl-server: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(rounds) = args.rounds {
        config.num_rounds = rounds;
        config.validate()?;
    }
    let source = match (args.snapshot, args.model) {
        (Some(path), expected) => InitialSource::Snapshot { path, expected },
        (None, Some(model)) => InitialSource::Random { model, seed: args.seed },
        (None, None) => bail!("either --snapshot or --model is required"),
    };

    let span = info_span!("fl_server", project_id = %args.project_id);
    let addr = SocketAddr::new(args.host, args.port);
    let summary = async {
        let initial = load_initial_parameters(&source)?;
        info!(tensors = initial.len(), elements = initial.num_elements(), digest = %initial.digest(), "initial_parameters_loaded");
        Federation::bind(addr, config, initial).await?.run().await
    }
    .instrument(span)
    .await?;

    for (round, loss) in summary.losses() {
        info!(round, loss, "round_loss");
    }
    if let Some(reason) = summary.abort {
        return Err(anyhow!("{reason}"));
    }
    if let Some(path) = &args.output {
        snapshot::save(path, &summary.final_parameters, Some(summary.round))?;
        info!(path = %path.display(), round = summary.round, "final_snapshot_written");
    }
    Ok(())
}

fn init(model: &ModelSpec, out: &Path, seed: u64) -> Result<()> {
    let params = model.random_parameters(seed)?;
    snapshot::save(out, &params, None)?;
    info!(path = %out.display(), tensors = params.len(), elements = params.num_elements(), "snapshot_written");
    Ok(())
}
