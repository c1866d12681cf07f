//! fl-client: trains one data partition for a federated run.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use fedround_client::{run_client, ClientExit, ClientOptions, PartitionSpec};
use fedround_core::{init_tracing, ClientId, CoordinatorState, Device};
use fedround_resilience::RetryConfig;
use tracing::{info_span, Instrument};

#[derive(Parser)]
#[command(name = "fl-client")]
#[command(version)]
#[command(about = "Federated learning client for one data partition", long_about = None)]
struct Cli {
    /// Coordinator address; http:// is assumed without a scheme
    #[arg(long, env = "FEDROUND_SERVER_ADDRESS", default_value = "127.0.0.1:8080")]
    server_address: String,

    #[arg(long)]
    partition_id: u32,

    #[arg(long, default_value_t = 10)]
    num_partitions: u32,

    /// Defaults to partition-<id>
    #[arg(long)]
    client_id: Option<String>,

    /// Address to serve fit/evaluate requests on
    #[arg(long, default_value = "0.0.0.0:0")]
    listen: SocketAddr,

    /// Host the coordinator uses to reach this client
    #[arg(long, default_value = "127.0.0.1")]
    advertise_host: String,

    /// Samples in this partition before the validation split
    #[arg(long, default_value_t = 500)]
    samples: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// cpu, cuda or cuda:<index>
    #[arg(long, default_value = "cpu")]
    device: Device,

    /// Attached to every log line
    #[arg(long, default_value = "default")]
    project_id: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing("fl-client") {
        eprintln!("fl-client: {e:#}");
        return ExitCode::FAILURE;
    }
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fl-client: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let server = if cli.server_address.contains("://") {
        cli.server_address.clone()
    } else {
        format!("http://{}", cli.server_address)
    };
    let client_id = ClientId::new(cli.client_id.unwrap_or_else(|| format!("partition-{}", cli.partition_id)));
    let span = info_span!("fl_client", project_id = %cli.project_id, client_id = %client_id);
    let opts = ClientOptions {
        server,
        client_id,
        partition: PartitionSpec {
            partition_id: cli.partition_id,
            num_partitions: cli.num_partitions,
            samples: cli.samples,
            seed: cli.seed,
        },
        listen: cli.listen,
        advertise_host: cli.advertise_host,
        device: cli.device,
        retry: RetryConfig { max_retries: 8, base_delay: Duration::from_millis(250), max_delay: Duration::from_secs(5), jitter: 0.25 },
    };
    match run_client(opts).instrument(span).await? {
        ClientExit::Shutdown(notice) if notice.state == CoordinatorState::AbortedFatal => {
            bail!("run aborted: {}", notice.reason)
        }
        ClientExit::Shutdown(_) | ClientExit::Interrupted => Ok(()),
    }
}
