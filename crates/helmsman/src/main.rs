use clap::{Args, Parser, Subcommand};
use helmsman_controllers::{ControllerManager, ControllerManagerConfig, MockCloud};
use helmsman_core::{Clock, Namespace, SystemClock};
use helmsman_runtime::ApiClient;
use helmsman_storage::{KVStore, RedbBackend, ResourceStore, DEFAULT_NAMESPACE};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "helmsman", about = "Helmsman controller manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller manager
    Run {
        #[command(flatten)]
        opts: ManagerOpts,
        /// Emit logs as JSON lines
        #[arg(long, env = "HELMSMAN_LOG_JSON")]
        log_json: bool,
    },
    /// Print the effective configuration as YAML
    Config {
        #[command(flatten)]
        opts: ManagerOpts,
    },
}

#[derive(Args)]
struct ManagerOpts {
    /// Path to the redb database file; in-memory when omitted
    #[arg(long, env = "HELMSMAN_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// YAML configuration file
    #[arg(long, env = "HELMSMAN_CONFIG")]
    config: Option<PathBuf>,
    /// Cluster name passed to the cloud provider
    #[arg(long, env = "HELMSMAN_CLUSTER_NAME")]
    cluster_name: Option<String>,
    /// Comma-separated controllers to run; `*` for all, `-name` to disable one
    #[arg(long, value_delimiter = ',')]
    controllers: Option<Vec<String>>,
    #[arg(long)]
    concurrent_statefulset_syncs: Option<usize>,
    #[arg(long)]
    concurrent_node_lifecycle_syncs: Option<usize>,
    #[arg(long)]
    concurrent_ttl_after_finished_syncs: Option<usize>,
    #[arg(long)]
    concurrent_service_syncs: Option<usize>,
    #[arg(long)]
    concurrent_endpoint_syncs: Option<usize>,
}

impl ManagerOpts {
    /// File (or defaults) first, then flags
    fn load_config(&self) -> miette::Result<ControllerManagerConfig> {
        let mut config = match &self.config {
            Some(path) => ControllerManagerConfig::from_file(path)?,
            None => ControllerManagerConfig::default(),
        };
        if let Some(name) = &self.cluster_name {
            config.cluster_name = name.clone();
        }
        if let Some(controllers) = &self.controllers {
            config.controllers = controllers.iter().map(|c| c.trim().to_string()).collect();
        }
        if let Some(n) = self.concurrent_statefulset_syncs {
            config.statefulset.concurrent_syncs = n;
        }
        if let Some(n) = self.concurrent_node_lifecycle_syncs {
            config.node_lifecycle.concurrent_syncs = n;
        }
        if let Some(n) = self.concurrent_ttl_after_finished_syncs {
            config.ttl_after_finished.concurrent_syncs = n;
        }
        if let Some(n) = self.concurrent_service_syncs {
            config.service.concurrent_syncs = n;
        }
        if let Some(n) = self.concurrent_endpoint_syncs {
            config.endpoints.concurrent_syncs = n;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { opts, log_json } => {
            init_tracing(log_json);
            run(opts).await
        }
        Commands::Config { opts } => {
            let config = opts.load_config()?;
            let yaml = helmsman_core::to_yaml(&config)?;
            print!("{}", yaml);
            Ok(())
        }
    }
}

async fn run(opts: ManagerOpts) -> miette::Result<()> {
    let config = opts.load_config()?;
    info!("Starting helmsman controller manager for cluster '{}'", config.cluster_name);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(open_store(opts.data_dir.as_ref(), clock.clone())?);
    bootstrap_default_namespace(&ApiClient::new(store.clone())).await?;

    let manager = ControllerManager::new(config, store, clock).with_cloud(Arc::new(MockCloud::new()));
    let token = CancellationToken::new();
    let handle = tokio::spawn(manager.run(token.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;
            info!("Shutting down gracefully...");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }

    match handle.await {
        Ok(result) => result?,
        Err(e) => error!("Controller manager task failed: {}", e),
    }
    info!("Shutdown complete");
    Ok(())
}

fn open_store(data_dir: Option<&PathBuf>, clock: Arc<dyn Clock>) -> miette::Result<ResourceStore> {
    let kv: Arc<dyn KVStore> = match data_dir {
        Some(path) => Arc::new(
            RedbBackend::new(path)
                .map_err(|e| miette::miette!("Failed to open storage at '{}': {}", path.display(), e))?,
        ),
        None => {
            info!("No --data-dir given; state will not survive a restart");
            Arc::new(
                RedbBackend::in_memory()
                    .map_err(|e| miette::miette!("Failed to open in-memory storage: {}", e))?,
            )
        }
    };
    ResourceStore::new(kv, clock).map_err(|e| miette::miette!("Failed to open resource store: {}", e))
}

/// Create the "default" namespace if it doesn't already exist
async fn bootstrap_default_namespace(client: &ApiClient) -> miette::Result<()> {
    let mut ns = Namespace::default();
    ns.metadata.name = Some(DEFAULT_NAMESPACE.to_string());

    match client.create(&ns).await {
        Ok(_) => info!("Created default namespace"),
        Err(e) if e.is_already_exists() => {}
        Err(e) => {
            return Err(miette::miette!(
                "Failed to bootstrap default namespace: {}",
                e
            ))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "helmsman",
            "config",
            "--cluster-name",
            "edge",
            "--controllers",
            "*,-service",
            "--concurrent-endpoint-syncs",
            "8",
        ]);
        let Commands::Config { opts } = cli.command else {
            panic!("expected the config command");
        };
        let config = opts.load_config().unwrap();
        assert_eq!(config.cluster_name, "edge");
        assert!(!config.is_enabled("service"));
        assert!(config.is_enabled("endpoints"));
        assert_eq!(config.endpoints.concurrent_syncs, 8);
    }

    #[test]
    fn test_rejects_unknown_controller_flag() {
        let cli = Cli::parse_from(["helmsman", "config", "--controllers", "cronjob"]);
        let Commands::Config { opts } = cli.command else {
            panic!("expected the config command");
        };
        assert!(opts.load_config().is_err());
    }
}
