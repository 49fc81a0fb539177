use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod cluster;
mod commands;
mod config;
mod diagnostics;
mod error;
mod k8s;
mod logging;
mod platform;
mod reconciler;
mod ui;

use cluster::{ClusterConfig, ClusterProvisioner, RUNTIME_PREFIX};
use commands::{CommandRunner, SystemRunner};
use config::{LoggingConfig, Timeouts};
use k8s::K8sClient;
use platform::Platform;
use reconciler::{Reconciler, RunConfig};
use ui::{OutputLine, OutputType};

#[derive(Parser)]
#[command(name = "k3pilot")]
#[command(version)]
#[command(about = "Local k3d clusters with GitOps app-of-apps bootstrap")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster lifecycle operations
    #[command(subcommand)]
    Cluster(ClusterCommands),

    /// Ensure a cluster exists and drive the application rollout
    Bootstrap {
        /// Cluster name
        #[arg(long, default_value = "dev")]
        cluster: String,

        /// Validate and plan only; touch nothing
        #[arg(long)]
        dry_run: bool,

        /// Suppress the spinner
        #[arg(long)]
        silent: bool,

        /// Periodic progress and resource detail
        #[arg(short, long)]
        verbose: bool,

        /// Skip the applications-CRD gate
        #[arg(long)]
        skip_crd_wait: bool,

        /// Overall rollout budget
        #[arg(long, default_value_t = 60)]
        timeout_minutes: u64,
    },
}

#[derive(Subcommand)]
enum ClusterCommands {
    /// Create a cluster
    Create {
        name: String,

        /// Cluster type; only local-k3s has a provisioner
        #[arg(long = "type", default_value = "local-k3s")]
        cluster_type: String,

        /// Total node count (one server, the rest agents)
        #[arg(long, default_value_t = 1)]
        nodes: u32,

        /// Kubernetes version (picks the runtime default when unset)
        #[arg(long)]
        k8s_version: Option<String>,

        /// Probe for free host ports instead of the fixed defaults
        #[arg(long)]
        dynamic_ports: bool,
    },

    /// Delete a cluster
    Delete {
        name: String,

        /// Sweep containers directly if the runtime CLI fails
        #[arg(long)]
        force: bool,
    },

    /// Start a previously created cluster
    Start { name: String },

    /// List clusters
    List,

    /// Show one cluster's status
    Status { name: String },

    /// Print a cluster's raw kubeconfig
    Kubeconfig { name: String },
}

fn print_line(line: &OutputLine) {
    let stamp = line.timestamp.format("%H:%M:%S");
    match line.output_type {
        OutputType::Info => println!("[{}] {}", stamp, line.content),
        OutputType::Success => println!("[{}] \x1b[32m{}\x1b[0m", stamp, line.content),
        OutputType::Warning => println!("[{}] \x1b[33m{}\x1b[0m", stamp, line.content),
        OutputType::Error => eprintln!("[{}] \x1b[31m{}\x1b[0m", stamp, line.content),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cluster_name = match &cli.command {
        Commands::Cluster(ClusterCommands::Create { name, .. })
        | Commands::Cluster(ClusterCommands::Delete { name, .. })
        | Commands::Cluster(ClusterCommands::Start { name })
        | Commands::Cluster(ClusterCommands::Status { name })
        | Commands::Cluster(ClusterCommands::Kubeconfig { name }) => name.clone(),
        Commands::Cluster(ClusterCommands::List) => "all".to_string(),
        Commands::Bootstrap { cluster, .. } => cluster.clone(),
    };
    if let Err(e) = logging::init_logging(&LoggingConfig::default(), &cluster_name) {
        eprintln!("logging disabled: {:#}", e);
    }

    let platform = Platform::detect();
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(platform));
    let provisioner = ClusterProvisioner::new(Arc::clone(&runner), platform);

    let (output_tx, mut output_rx) = mpsc::channel::<OutputLine>(256);
    let printer = tokio::spawn(async move {
        while let Some(line) = output_rx.recv().await {
            print_line(&line);
        }
    });

    let result = run_command(cli, provisioner, runner, platform, output_tx).await;

    let _ = printer.await;
    result
}

async fn run_command(
    cli: Cli,
    provisioner: ClusterProvisioner,
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
    output_tx: mpsc::Sender<OutputLine>,
) -> Result<()> {
    match cli.command {
        Commands::Cluster(ClusterCommands::Create {
            name,
            cluster_type,
            nodes,
            k8s_version,
            dynamic_ports,
        }) => {
            let mut config = ClusterConfig::new(name, nodes);
            config.kind = cluster::ClusterType::parse(&cluster_type)?;
            config.k8s_version = k8s_version;
            provisioner
                .with_dynamic_ports(dynamic_ports)
                .create_cluster(&config, &output_tx, &CancellationToken::new())
                .await
                .context("cluster creation failed")?;
            Ok(())
        }

        Commands::Cluster(ClusterCommands::Delete { name, force }) => {
            provisioner
                .delete_cluster(&name, force, &output_tx)
                .await
                .context("cluster deletion failed")?;
            Ok(())
        }

        Commands::Cluster(ClusterCommands::Start { name }) => {
            provisioner
                .start_cluster(&name, &output_tx)
                .await
                .context("cluster start failed")?;
            Ok(())
        }

        Commands::Cluster(ClusterCommands::List) => {
            let clusters = provisioner.list_clusters().await?;
            if clusters.is_empty() {
                println!("No clusters");
                return Ok(());
            }
            println!("{:<20} {:<10} {:<8} {:<8} CREATED", "NAME", "TYPE", "STATUS", "NODES");
            for c in clusters {
                println!(
                    "{:<20} {:<10} {:<8} {:<8} {}",
                    c.name,
                    c.kind.as_str(),
                    c.status,
                    c.node_count,
                    c.created_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            Ok(())
        }

        Commands::Cluster(ClusterCommands::Status { name }) => {
            match provisioner.cluster_status(&name).await? {
                Some(c) => {
                    println!("{}: {} ({} nodes)", c.name, c.status, c.node_count);
                    for node in &c.nodes {
                        println!("  {:<30} {:<14} {}", node.name, node.role, node.state.status);
                    }
                }
                None => println!("Cluster {} not found", name),
            }
            Ok(())
        }

        Commands::Cluster(ClusterCommands::Kubeconfig { name }) => {
            print!("{}", provisioner.fetch_kubeconfig(&name).await?);
            Ok(())
        }

        Commands::Bootstrap {
            cluster,
            dry_run,
            silent,
            verbose,
            skip_crd_wait,
            timeout_minutes,
        } => {
            let cancel = CancellationToken::new();

            for binary in ["docker", "k3d", "kubectl"] {
                if !platform.is_windows() && !platform::binary_on_path(binary) {
                    ui::emit(
                        &output_tx,
                        OutputLine::warning(format!("{} not found on PATH", binary)),
                    )
                    .await;
                }
            }

            let context = format!("{}-{}", RUNTIME_PREFIX, cluster);

            // A dry run plans only: no cluster, no API calls
            let client = if dry_run {
                K8sClient::cli_only(
                    Arc::clone(&runner),
                    platform,
                    Some(context),
                    Timeouts::default(),
                )
            } else {
                // Bring the cluster up first when it is missing
                let rest_config = match provisioner.cluster_status(&cluster).await? {
                    Some(info) if info.is_running() => {
                        provisioner.get_rest_config(&cluster).await?
                    }
                    _ => {
                        let config = ClusterConfig::new(cluster.clone(), 1);
                        provisioner
                            .create_cluster(&config, &output_tx, &cancel)
                            .await
                            .context("cluster creation failed")?
                    }
                };

                let client = K8sClient::new(
                    rest_config,
                    Arc::clone(&runner),
                    platform,
                    Some(context),
                    Timeouts::default(),
                );
                client.wait_for_node_ready().await?;
                client
            };

            let mut run_config = RunConfig::new(cluster);
            run_config.dry_run = dry_run;
            run_config.silent = silent;
            run_config.verbose = verbose;
            run_config.skip_crd_wait = skip_crd_wait;
            run_config.total_timeout = Duration::from_secs(timeout_minutes * 60);

            let reconciler = Reconciler::new(
                client,
                runner,
                run_config,
                Timeouts::default(),
                output_tx,
            );
            reconciler.run(cancel).await.context("rollout failed")?;
            Ok(())
        }
    }
}
