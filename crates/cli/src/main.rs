use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand, ValueEnum};
use metrics::counter;
use tracing::{error, info};

mod phases;

use phases::{Context, PhaseReport};

#[derive(Parser, Debug)]
#[command(name = "kstagectl", version, about = "Run one phase of a staged cluster deployment")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Deployment state file
    #[arg(long = "state", global = true, env = "KSTAGE_STATE_PATH")]
    state: Option<PathBuf>,

    /// Generated manifest path
    #[arg(long = "artifact", global = true, env = "KSTAGE_ARTIFACT")]
    artifact: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Check that required tools are on PATH
    CheckDeps,
    /// Create the management cluster and wait for its controllers
    Setup,
    /// Resolve configuration, persist it, and regenerate manifests on drift
    Generate {
        /// Regenerate even when the artifact matches
        #[arg(long)]
        force: bool,
    },
    /// Apply generated manifests and wait for the cluster to provision
    Apply,
    /// Wait for the cluster phase without applying
    Verify,
    /// Show what still exists for this deployment
    Status,
    /// Delete the workload cluster and wait until everything is gone
    Teardown,
    /// Delete the management cluster and the state file
    Cleanup,
    /// Print the resolved configuration
    Config,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::CheckDeps => "check-deps",
            Commands::Setup => "setup",
            Commands::Generate { .. } => "generate",
            Commands::Apply => "apply",
            Commands::Verify => "verify",
            Commands::Status => "status",
            Commands::Teardown => "teardown",
            Commands::Cleanup => "cleanup",
            Commands::Config => "config",
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KSTAGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KSTAGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KSTAGE_METRICS_ADDR; expected host:port");
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<PhaseReport> {
    // check-deps must work even when naming inputs are invalid
    let load = || Context::load(cli.state.clone(), cli.artifact.clone());
    match cli.command {
        Commands::CheckDeps => phases::check_deps(),
        Commands::Setup => phases::setup(&load()?).await,
        Commands::Generate { force } => phases::generate(&load()?, force).await,
        Commands::Apply => phases::apply(&load()?).await,
        Commands::Verify => phases::verify(&load()?).await,
        Commands::Status => phases::status(&load()?).await,
        Commands::Teardown => phases::teardown(&load()?).await,
        Commands::Cleanup => phases::cleanup(&load()?).await,
        Commands::Config => phases::config(&load()?),
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let phase = cli.command.name();
    info!(phase, "phase started");

    match run(&cli).await {
        Ok(report) => {
            counter!("phase_ok_total", 1u64, "phase" => phase);
            match cli.output {
                Output::Human => report.print_human(),
                Output::Json => match serde_json::to_string_pretty(&report) {
                    Ok(s) => println!("{}", s),
                    Err(e) => eprintln!("encoding report: {}", e),
                },
            }
        }
        Err(e) => {
            counter!("phase_failed_total", 1u64, "phase" => phase);
            error!(phase, error = %format!("{:#}", e), "phase failed");
            match cli.output {
                Output::Human => eprintln!("{} failed: {:#}", phase, e),
                Output::Json => println!("{}", serde_json::json!({ "phase": phase, "ok": false, "error": format!("{:#}", e) })),
            }
            std::process::exit(1);
        }
    }
}
