/// fieldctl - disposable Kubernetes clusters on a laptop
///
/// Runs a k3s main cluster inside a Lima VM and layers vcluster virtual
/// clusters on top of it, keeping the local kubeconfig in sync.
mod config;
mod error;
mod k8s;
mod kubeconfig;
mod lifecycle;
mod lima;
mod utils;
mod vcluster;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Settings;
use crate::kubeconfig::KubeconfigStore;
use crate::lifecycle::{MainClusterManager, VirtualClusterManager, VmCreateOptions};
use crate::utils::command::{Executor, SystemExecutor};

#[derive(Parser)]
#[command(name = "fieldctl")]
#[command(about = "Run a main cluster in a Lima VM and virtual clusters on top of it", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file, defaults to ~/.field/config.yaml when it exists
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate example settings file
    Init,

    /// Operate the Lima VM containing the main cluster
    Vm(VmArgs),

    /// Operate virtual clusters inside a main cluster
    Virtual(VirtualArgs),
}

#[derive(Args)]
struct VmArgs {
    #[command(subcommand)]
    command: VmCommands,

    /// Kubeconfig file to update, else $KUBECONFIG, else the default kubeconfig
    #[arg(short, long, global = true)]
    kubeconfig: Option<PathBuf>,
}

#[derive(Subcommand)]
enum VmCommands {
    /// Show the Lima version
    Version,

    /// Start the Lima VM
    Start,

    /// Stop the Lima VM
    Stop,

    /// Show the ssh command to access the VM. Run `eval $(fieldctl vm show-ssh)` to log in
    ShowSsh,

    /// Create the Lima VM
    Create {
        /// CPUs allocated to the VM
        #[arg(long)]
        cpus: Option<u32>,

        /// Disk size in GiB
        #[arg(long)]
        disk: Option<u32>,

        /// Memory in GiB
        #[arg(long)]
        memory: Option<u32>,

        /// Merge the main cluster credentials into the kubeconfig once created
        #[arg(long)]
        connect: bool,
    },

    /// Merge the k3s kubeconfig of the VM into the local kubeconfig
    Connect,

    /// Remove the Lima VM
    Rm {
        /// Seconds to wait for the VM to disappear
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Args)]
struct VirtualArgs {
    #[command(subcommand)]
    command: VirtualCommands,

    /// Context of the main cluster. Without a value, the kubeconfig's current context
    #[arg(long, visible_alias = "ctx", global = true, num_args = 0..=1, default_missing_value = "")]
    main_context: Option<String>,

    /// Kubeconfig file to update, else $KUBECONFIG, else the default kubeconfig
    #[arg(short, long, global = true)]
    kubeconfig: Option<PathBuf>,
}

#[derive(Subcommand)]
enum VirtualCommands {
    /// List virtual clusters
    List,

    /// Show the vcluster version
    Version,

    /// Create a virtual cluster and switch to it
    Create {
        #[arg(short, long)]
        name: String,
    },

    /// Merge the kubeconfig of a virtual cluster and switch to it
    Connect {
        #[arg(short, long)]
        name: String,
    },

    /// Delete a virtual cluster and its namespace
    Delete {
        #[arg(short, long)]
        name: String,

        /// Seconds to wait for the virtual cluster to disappear
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fieldctl={}", cli.log_level.directive()).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let executor: Arc<dyn Executor> = Arc::new(SystemExecutor);
    let result = match cli.command {
        Commands::Init => init_settings(cli.config.as_deref()).await,
        Commands::Vm(args) => run_vm(args, cli.config.as_deref(), executor).await,
        Commands::Virtual(args) => run_virtual(args, cli.config.as_deref(), executor).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Write an example settings file
async fn init_settings(explicit: Option<&Path>) -> Result<()> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(Settings::default_path);
    if path.exists() {
        anyhow::bail!("Settings file already exists: {}", path.display());
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let yaml = serde_yaml::to_string(&Settings::example())?;
    tokio::fs::write(&path, yaml)
        .await
        .context("Failed to write settings file")?;

    info!("Example settings created: {}", path.display());
    info!("");
    info!("Next steps:");
    info!("  1. Adjust the VM sizing and paths to your machine");
    info!("  2. Create the main cluster:");
    info!("     fieldctl vm create --connect");
    Ok(())
}

async fn run_vm(args: VmArgs, settings_path: Option<&Path>, executor: Arc<dyn Executor>) -> Result<()> {
    let settings = Settings::load(settings_path)?;
    let store = KubeconfigStore::from_env(args.kubeconfig.as_deref(), &settings.default_kubeconfig);
    debug!("Using kubeconfig {}", store.path().display());

    let defaults = VmCreateOptions::from_settings(&settings);
    let delete_timeout = settings.delete_timeout_secs;
    let manager = MainClusterManager::new(executor, store, settings);
    manager.check_prerequisites().await?;

    match args.command {
        VmCommands::Version => manager.version().await?,
        VmCommands::Start => {
            manager.start().await?;
            info!("VM started. To merge the kubeconfig run:\n\n  fieldctl vm connect");
        }
        VmCommands::Stop => {
            manager.stop().await?;
            info!("VM stopped");
        }
        VmCommands::ShowSsh => {
            info!("TIP: To access directly run:\n\n    eval $(fieldctl vm show-ssh)\n");
            println!("{}", manager.show_ssh().await?);
        }
        VmCommands::Create {
            cpus,
            disk,
            memory,
            connect,
        } => {
            let options = VmCreateOptions {
                cpus: cpus.unwrap_or(defaults.cpus),
                disk_gib: disk.unwrap_or(defaults.disk_gib),
                memory_gib: memory.unwrap_or(defaults.memory_gib),
                connect,
            };
            manager.create(&options).await?;
            info!(
                "VM created. Now run:\n\n  fieldctl vm connect\t\tto connect to the main cluster\n\n  fieldctl virtual create -n <name>\t\tto create a virtual cluster"
            );
        }
        VmCommands::Connect => {
            manager.connect().await?;
            info!("Connected to the main cluster. Run:\n\n  kubectl config get-contexts\t\tto see the new context");
        }
        VmCommands::Rm { timeout } => {
            manager.remove(timeout.unwrap_or(delete_timeout)).await?;
            info!("VM deleted");
        }
    }

    Ok(())
}

async fn run_virtual(
    args: VirtualArgs,
    settings_path: Option<&Path>,
    executor: Arc<dyn Executor>,
) -> Result<()> {
    let settings = Settings::load(settings_path)?;
    let store = KubeconfigStore::from_env(args.kubeconfig.as_deref(), &settings.default_kubeconfig);
    debug!("Using kubeconfig {}", store.path().display());

    let main_context = resolve_main_context(args.main_context, &store, &settings)?;
    let delete_timeout = settings.delete_timeout_secs;
    let manager = VirtualClusterManager::new(executor, store, main_context, settings.vcluster);
    info!("Using main cluster context {}", manager.main_context());
    manager.check_prerequisites().await?;

    match args.command {
        VirtualCommands::List => manager.list().await?,
        VirtualCommands::Version => manager.version().await?,
        VirtualCommands::Create { name } => {
            manager.create(&name).await?;
            info!("Virtual cluster {} is ready. Current context switched to {}", name, name);
        }
        VirtualCommands::Connect { name } => {
            manager.connect(&name).await?;
            info!("Current context switched to {}", name);
        }
        VirtualCommands::Delete { name, timeout } => {
            manager
                .delete(&name, timeout.unwrap_or(delete_timeout))
                .await?;
            info!(
                "Virtual cluster {} deleted. Current context switched to {}",
                name,
                manager.main_context()
            );
        }
    }

    Ok(())
}

/// The main cluster context: the VM name unless `--main-context` says otherwise
fn resolve_main_context(
    flag: Option<String>,
    store: &KubeconfigStore,
    settings: &Settings,
) -> Result<String> {
    match flag {
        None => Ok(settings.vm_name.clone()),
        Some(context) if !context.is_empty() => Ok(context),
        Some(_) => store.current_context()?.with_context(|| {
            format!(
                "--main-context was given without a value but {} has no current-context",
                store.path().display()
            )
        }),
    }
}
