use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use rex_transport::config::{load_nodes, SshConfig, TransportConfig};
use rex_transport::scheduler::{build_command, JobSpec, ReplicaId};
use rex_transport::shutdown::install_shutdown_handler;
use rex_transport::transport::{SshTransport, Transport};
use rex_transport::worker::{LocalConnector, RetryPolicy};

#[derive(Parser, Debug)]
#[command(name = "rex-transport")]
#[command(version)]
#[command(about = "Run replica-exchange jobs on a pool of SSH nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Validate a node file and print the pool
    Nodes {
        /// JSON node file
        file: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Run replicas for a number of cycles against a node pool
    Run(RunArgs),
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// JSON node file
    #[arg(long)]
    nodes: PathBuf,

    /// Number of replicas
    #[arg(long, default_value = "4")]
    replicas: usize,

    /// Number of cycles
    #[arg(long, default_value = "1")]
    cycles: u64,

    /// Executable to run for each replica
    #[arg(long)]
    executable: String,

    /// Local working root; replica `i` works in `<work-dir>/r<i>`
    #[arg(long)]
    work_dir: PathBuf,

    /// Input file name. `{replica}` and `{cycle}` are substituted.
    #[arg(long, default_value = "r{replica}_c{cycle}.inp")]
    input: String,

    /// Output file name. `{replica}` and `{cycle}` are substituted.
    #[arg(long, default_value = "r{replica}_c{cycle}.out")]
    output: String,

    /// Error file name. `{replica}` and `{cycle}` are substituted.
    #[arg(long, default_value = "r{replica}_c{cycle}.err")]
    error: String,

    /// Files staged to the node (comma-separated, substituted)
    #[arg(long, value_delimiter = ',')]
    stage_in: Vec<String>,

    /// Files fetched back from the node (comma-separated, substituted)
    #[arg(long, value_delimiter = ',')]
    stage_out: Vec<String>,

    /// Root of lib/<arch> and bin/<arch> trees to stage
    #[arg(long)]
    exec_dir: Option<PathBuf>,

    /// Run in a per-replica scratch directory on the node
    #[arg(long)]
    remote_scratch: bool,

    /// Run every node on this host instead of over SSH
    #[arg(long)]
    local: bool,

    /// Rescan interval in milliseconds
    #[arg(long, default_value = "100")]
    min_interval_ms: u64,

    /// Time slice per process_job_queue call in milliseconds
    #[arg(long, default_value = "1000")]
    max_interval_ms: u64,

    /// Transfer attempts before the final try
    #[arg(long, default_value = "10")]
    transfer_tries: u32,

    /// Seconds between transfer attempts
    #[arg(long, default_value = "10")]
    transfer_sleep_secs: u64,

    /// SSH port
    #[arg(long)]
    ssh_port: Option<u16>,

    /// SSH identity file
    #[arg(long)]
    identity: Option<PathBuf>,
}

// =============================================================================
// Output Types (for JSON serialization)
// =============================================================================

#[derive(Serialize)]
struct NodeOutput {
    index: usize,
    name: String,
    threads: u32,
    slot: u32,
    arch: String,
    username: Option<String>,
    scratch_root: String,
    command_preview: String,
}

// =============================================================================
// Handlers
// =============================================================================

fn expand(pattern: &str, replica: ReplicaId, cycle: u64) -> String {
    pattern
        .replace("{replica}", &replica.to_string())
        .replace("{cycle}", &cycle.to_string())
}

fn handle_nodes(file: PathBuf, output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let nodes = load_nodes(&file)?;
    let rows: Vec<NodeOutput> = nodes
        .iter()
        .enumerate()
        .map(|(index, node)| NodeOutput {
            index,
            name: node.name.clone(),
            threads: node.threads,
            slot: node.slot,
            arch: node.arch.clone(),
            username: node.username.clone(),
            scratch_root: node.scratch_root.clone(),
            command_preview: build_command(node, "<job>", Some("<dir>")),
        })
        .collect();

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<6} {:<20} {:<8} {:<6} {:<8} COMMAND",
                "INDEX", "NODE", "THREADS", "SLOT", "ARCH"
            );
            println!("{}", "-".repeat(78));
            for row in &rows {
                let arch = if row.arch.is_empty() { "-" } else { &row.arch };
                println!(
                    "{:<6} {:<20} {:<8} {:<6} {:<8} {}",
                    row.index, row.name, row.threads, row.slot, arch, row.command_preview
                );
            }
            println!();
            println!("{} node(s)", rows.len());
        }
    }
    Ok(())
}

fn job_spec(args: &RunArgs, replica: ReplicaId, cycle: u64) -> JobSpec {
    let mut spec = JobSpec::new(&args.executable, args.work_dir.join(format!("r{}", replica)))
        .with_io(
            expand(&args.input, replica, cycle),
            expand(&args.output, replica, cycle),
            expand(&args.error, replica, cycle),
        )
        .with_input_files(
            args.stage_in
                .iter()
                .map(|f| expand(f, replica, cycle))
                .collect(),
        )
        .with_output_files(
            args.stage_out
                .iter()
                .map(|f| expand(f, replica, cycle))
                .collect(),
        )
        .with_cycle(cycle);
    if let Some(ref dir) = args.exec_dir {
        spec = spec.with_exec_directory(dir.clone());
    }
    if args.remote_scratch {
        spec = spec.with_remote_replica_dir(format!("r{}", replica));
    }
    spec
}

async fn run_cycles(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let nodes = load_nodes(&args.nodes)?;
    let config = TransportConfig::default().with_retry(RetryPolicy::new(
        args.transfer_tries,
        Duration::from_secs(args.transfer_sleep_secs),
    ));

    let mut transport = if args.local {
        SshTransport::new(nodes, args.replicas, config, Arc::new(LocalConnector::new()))?
    } else {
        let ssh = SshConfig {
            port: args.ssh_port,
            identity_file: args.identity.clone(),
            ..SshConfig::default()
        };
        SshTransport::with_openssh(nodes, args.replicas, config, ssh)?
    };

    let shutdown = install_shutdown_handler();
    let min_interval = Duration::from_millis(args.min_interval_ms);
    let max_interval = Duration::from_millis(args.max_interval_ms);

    tracing::info!(
        replicas = args.replicas,
        cycles = args.cycles,
        nodes = transport.pool().len(),
        "Starting run"
    );

    'cycles: for cycle in 1..=args.cycles {
        for replica in 0..args.replicas {
            let depth = transport
                .launch_job(replica, job_spec(&args, replica, cycle))
                .await?;
            tracing::debug!(replica, cycle, depth, "Launched");
        }

        loop {
            if shutdown.is_cancelled() {
                tracing::info!(cycle, "Shutdown requested, abandoning run");
                break 'cycles;
            }
            transport.process_job_queue(min_interval, max_interval).await;

            let mut remaining = 0;
            for replica in 0..args.replicas {
                if !transport.is_done(replica, cycle).await {
                    remaining += 1;
                }
            }
            if remaining == 0 {
                break;
            }
            tracing::info!(
                cycle,
                remaining,
                queued = transport.queue_len(),
                busy = transport.busy_nodes().len(),
                "Waiting on replicas"
            );
        }

        tracing::info!(cycle, "Cycle complete");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rex_transport=info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Nodes { file, output } => handle_nodes(file, output)?,
        Commands::Run(run_args) => run_cycles(run_args).await?,
    }

    Ok(())
}
