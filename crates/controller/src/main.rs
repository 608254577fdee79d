//! DBV control-plane daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dbv_common::config;
use dbv_datastore::DataStore;
use dbv_orchestrator::{InstanceOrchestrator, SimOrchestrator};

/// DBV — distributed block volumes control plane.
///
/// Running without a subcommand defaults to `run`.
#[derive(Parser)]
#[command(name = "dbv-controller", version, about = "DBV control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control-plane daemon.
    Run {
        /// Path to the daemon TOML configuration.
        #[arg(long, default_value = "/etc/dbv/controller.toml")]
        config: PathBuf,
    },
    /// Validate a configuration file and exit.
    CheckConfig {
        #[arg(long, default_value = "/etc/dbv/controller.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run {
        config: PathBuf::from("/etc/dbv/controller.toml"),
    });

    match command {
        Command::Run { config: path } => {
            let cfg = config::load_from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            let ds = DataStore::new();
            // Local runs use the in-memory orchestrator backend; production
            // deployments plug in a real runtime adapter here.
            let orchestrator: Arc<dyn InstanceOrchestrator> = Arc::new(SimOrchestrator::new());
            dbv_controller::daemon::run(cfg, ds, orchestrator).await
        }
        Command::CheckConfig { config: path } => {
            let cfg = config::load_from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            info!(node = cfg.node_id, "configuration is valid");
            Ok(())
        }
    }
}
