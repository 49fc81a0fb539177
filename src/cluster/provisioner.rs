//! Cluster lifecycle driving the runtime CLI.
//!
//! Creation is an ordered sequence of remediation and invocation steps;
//! only validation, the CLI create itself and the final reachability probe
//! are fatal. Everything else logs and continues so a degraded host still
//! gets a cluster.

use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::config::{ClusterConfig, ClusterType, RUNTIME_PREFIX};
use super::docker::DockerManager;
use super::info::{parse_cluster_list, ClusterInfo};
use super::kubeconfig;
use super::ports::PortAllocation;
use super::runtime_config::SimpleConfig;
use crate::commands::{CommandRunner, CommandSpec};
use crate::config::Timeouts;
use crate::error::{Error, Result};
use crate::k8s;
use crate::platform::{net, wsl, Platform};
use crate::ui::{emit, OutputLine};

pub struct ClusterProvisioner {
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
    timeouts: Timeouts,
    dynamic_ports: bool,
}

impl ClusterProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, platform: Platform) -> Self {
        Self {
            runner,
            platform,
            timeouts: Timeouts::default(),
            dynamic_ports: false,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Probe for free ports instead of using the fixed defaults.
    pub fn with_dynamic_ports(mut self, dynamic: bool) -> Self {
        self.dynamic_ports = dynamic;
        self
    }

    /// Create a cluster and return a probed REST config for it.
    pub async fn create_cluster(
        &self,
        config: &ClusterConfig,
        output_tx: &mpsc::Sender<OutputLine>,
        cancel: &CancellationToken,
    ) -> Result<kube::Config> {
        // 1. Validation is the only gate before we touch the host.
        config.validate()?;

        emit(
            output_tx,
            OutputLine::info(format!("Creating cluster {}...", config.name)),
        )
        .await;

        // 2. Inotify headroom for many-pod clusters.
        if let Err(e) = net::raise_inotify_limits(self.runner.as_ref()).await {
            tracing::warn!(error = %e, "Raising inotify limits failed");
        }

        // 3. + 4. Subsystem remediation and TLS SAN discovery.
        let tls_san = self.prepare_windows_host(output_tx).await;

        // 5. Emit the runtime config document.
        let ports = if self.dynamic_ports {
            super::ports::select_ports(self.runner.as_ref()).await?
        } else {
            PortAllocation::default()
        };
        let doc = SimpleConfig::build(config, self.platform, &ports, tls_san);
        let config_path = std::env::temp_dir().join(format!("k3pilot-{}.yaml", config.name));
        tokio::fs::write(&config_path, doc.to_yaml()?).await?;

        // 6. Kube directory and stale locks.
        if let Err(e) = kubeconfig::prepare_kube_dir(self.runner.as_ref(), self.platform).await {
            tracing::warn!(error = %e, "Preparing ~/.kube failed");
        }

        // 7. Path translation and runtime responsiveness.
        let cli_config_path = if self.platform.is_windows() {
            wsl::translate_path(&config_path.to_string_lossy())
        } else {
            config_path.to_string_lossy().to_string()
        };
        self.verify_runtime_responsive(output_tx).await;

        // 8. The create invocation itself.
        emit(output_tx, OutputLine::info("Invoking cluster runtime...")).await;
        let create_result = self
            .run_k3d(
                &[
                    "cluster",
                    "create",
                    "--config",
                    &cli_config_path,
                    "--timeout",
                    "300s",
                    "--kubeconfig-update-default",
                    "--kubeconfig-switch-context",
                ],
                self.timeouts.cluster_create,
                Some(cancel.clone()),
            )
            .await;
        let _ = tokio::fs::remove_file(&config_path).await;
        let created = create_result?;
        if !created.success() {
            emit(
                output_tx,
                OutputLine::error(format!("Cluster creation failed: {}", created.detail())),
            )
            .await;
            return Err(Error::RuntimeCli {
                operation: "cluster create".to_string(),
                detail: created.detail(),
            });
        }

        // 9. Node-level repair once containers exist.
        if self.platform.is_windows() {
            self.repair_cluster_nodes(&config.name, output_tx).await;
        }

        // 10. Kubeconfig ownership and locks.
        let subsystem_user = if self.platform.is_windows() {
            Some(wsl::default_user(None).await)
        } else {
            None
        };
        if let Err(e) = kubeconfig::fix_permissions(
            self.runner.as_ref(),
            self.platform,
            subsystem_user.as_deref(),
        )
        .await
        {
            tracing::warn!(error = %e, "Fixing kubeconfig permissions failed");
        }

        // 11. Subsystem-side server rewrite.
        if self.platform.is_windows() {
            if let Err(e) = kubeconfig::rewrite_subsystem_kubeconfig(self.runner.as_ref()).await {
                tracing::warn!(error = %e, "Subsystem kubeconfig rewrite failed");
            }
        }

        // 12. REST config, probed.
        let rest_config = self.build_rest_config(&config.name, tls_san).await?;
        k8s::probe_rest_config(&rest_config, &self.timeouts).await?;

        emit(
            output_tx,
            OutputLine::success(format!("Cluster {} is reachable", config.name)),
        )
        .await;

        Ok(rest_config)
    }

    /// REST config for an existing cluster, probed.
    pub async fn get_rest_config(&self, cluster_name: &str) -> Result<kube::Config> {
        let tls_san = if self.platform.is_windows() {
            wsl::subsystem_ip(self.runner.as_ref()).await.ok()
        } else {
            None
        };
        let rest_config = self.build_rest_config(cluster_name, tls_san).await?;
        k8s::probe_rest_config(&rest_config, &self.timeouts).await?;
        Ok(rest_config)
    }

    async fn build_rest_config(
        &self,
        cluster_name: &str,
        subsystem_ip: Option<Ipv4Addr>,
    ) -> Result<kube::Config> {
        let kubeconfig =
            k8s::load_kubeconfig(self.runner.as_ref(), self.platform, cluster_name).await?;
        let context = format!("{}-{}", RUNTIME_PREFIX, cluster_name);

        // Native clients on the Windows host reach the API through the
        // subsystem address; elsewhere the kubeconfig is already right.
        let rewrite_host = if self.platform.is_windows() {
            subsystem_ip.map(|ip| ip.to_string())
        } else {
            // The subsystem has no host-side file worth switching
            if let Err(e) = kubeconfig::persist_current_context(&context).await {
                tracing::debug!(error = %e, "Persisting current context failed");
            }
            None
        };

        k8s::rest_config_from_kubeconfig(kubeconfig, Some(&context), rewrite_host.as_deref()).await
    }

    /// Steps 3 and 4 of creation: DNS, forwarding, pause pre-pull, and the
    /// subsystem address for the API certificate. All best-effort.
    async fn prepare_windows_host(
        &self,
        output_tx: &mpsc::Sender<OutputLine>,
    ) -> Option<Ipv4Addr> {
        if !self.platform.is_windows() {
            return None;
        }

        emit(output_tx, OutputLine::info("Preparing subsystem networking...")).await;

        if let Err(e) = net::configure_subsystem_dns(self.runner.as_ref()).await {
            tracing::warn!(error = %e, "Subsystem DNS remediation failed");
        }
        if let Err(e) = net::configure_docker_dns(self.runner.as_ref()).await {
            tracing::warn!(error = %e, "Container runtime DNS remediation failed");
        }
        if let Err(e) = self
            .runner
            .run(
                CommandSpec::new("docker", &["pull", net::PAUSE_IMAGE])
                    .with_timeout(std::time::Duration::from_secs(120)),
            )
            .await
        {
            tracing::warn!(error = %e, "Pause image pre-pull failed");
        }
        if let Err(e) = net::enable_ip_forwarding(self.runner.as_ref()).await {
            tracing::warn!(error = %e, "Enabling IP forwarding failed");
        }

        match wsl::subsystem_ip(self.runner.as_ref()).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                tracing::warn!(error = %e, "Subsystem IP discovery failed");
                None
            }
        }
    }

    /// Step 9: node DNS and pause-image import, after the nodes exist.
    async fn repair_cluster_nodes(&self, cluster_name: &str, output_tx: &mpsc::Sender<OutputLine>) {
        let nodes = match self.cluster_status(cluster_name).await {
            Ok(Some(info)) => info.k3s_nodes(),
            _ => Vec::new(),
        };
        if nodes.is_empty() {
            tracing::warn!(cluster = %cluster_name, "No nodes found for post-create repair");
            return;
        }

        emit(output_tx, OutputLine::info("Repairing node networking...")).await;
        if let Err(e) = net::fix_node_dns(self.runner.as_ref(), &nodes).await {
            tracing::warn!(error = %e, "Node DNS repair failed");
        }
        if let Err(e) = net::preload_pause_image(self.runner.as_ref(), &nodes).await {
            tracing::warn!(error = %e, "Pause image import failed");
        }
    }

    /// Step 7: is the container runtime answering at all?
    async fn verify_runtime_responsive(&self, output_tx: &mpsc::Sender<OutputLine>) {
        let responsive = if self.platform.is_windows() {
            self.runner
                .run(
                    CommandSpec::new("docker", &["version", "--format", "{{.Server.Version}}"])
                        .with_timeout(std::time::Duration::from_secs(20)),
                )
                .await
                .map(|out| out.success())
                .unwrap_or(false)
        } else {
            match DockerManager::new() {
                Ok(docker) => docker.is_accessible().await,
                Err(_) => false,
            }
        };

        if !responsive {
            emit(
                output_tx,
                OutputLine::warning("Container runtime is not responding; creation may fail"),
            )
            .await;
        }
    }

    /// Delete a cluster. On Windows, or under `force`, a failed CLI delete
    /// falls back to removing the cluster's containers and network
    /// directly.
    pub async fn delete_cluster(
        &self,
        name: &str,
        force: bool,
        output_tx: &mpsc::Sender<OutputLine>,
    ) -> Result<()> {
        emit(output_tx, OutputLine::info(format!("Deleting cluster {}...", name))).await;

        let result = self
            .run_k3d(
                &["cluster", "delete", name],
                self.timeouts.cluster_delete,
                None,
            )
            .await;

        let cli_failed = match &result {
            Ok(out) => !out.success(),
            Err(_) => true,
        };

        if !cli_failed {
            emit(output_tx, OutputLine::success(format!("Cluster {} deleted", name))).await;
            return Ok(());
        }

        let detail = match result {
            Ok(out) => out.detail(),
            Err(e) => e.to_string(),
        };

        if !(self.platform.is_windows() || force) {
            return Err(Error::RuntimeCli {
                operation: "cluster delete".to_string(),
                detail,
            });
        }

        emit(
            output_tx,
            OutputLine::warning("Runtime CLI delete failed, sweeping containers directly"),
        )
        .await;

        let prefix = format!("{}-{}-", RUNTIME_PREFIX, name);
        let network = format!("{}-{}", RUNTIME_PREFIX, name);

        if self.platform.is_windows() {
            self.sweep_via_cli(&prefix, &network).await?;
        } else {
            let docker = DockerManager::new()?;
            docker.sweep_cluster(&prefix, &network).await?;
        }

        emit(output_tx, OutputLine::success(format!("Cluster {} deleted", name))).await;
        Ok(())
    }

    async fn sweep_via_cli(&self, prefix: &str, network: &str) -> Result<()> {
        let filter = format!("name={}", prefix);
        let listing = self
            .runner
            .run(
                CommandSpec::new(
                    "docker",
                    &["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"],
                )
                .with_timeout(self.timeouts.cluster_list),
            )
            .await?;

        for container in listing.stdout.split_whitespace() {
            if !container.starts_with(prefix) {
                continue;
            }
            let out = self
                .runner
                .run(
                    CommandSpec::new("docker", &["rm", "-f", container])
                        .with_timeout(self.timeouts.cluster_list),
                )
                .await?;
            if !out.success() {
                tracing::warn!(container = %container, detail = %out.detail(), "Container removal failed");
            }
        }

        let _ = self
            .runner
            .run(
                CommandSpec::new("docker", &["network", "rm", network])
                    .with_timeout(self.timeouts.cluster_list),
            )
            .await;
        Ok(())
    }

    /// Start a previously created cluster.
    pub async fn start_cluster(&self, name: &str, output_tx: &mpsc::Sender<OutputLine>) -> Result<()> {
        emit(output_tx, OutputLine::info(format!("Starting cluster {}...", name))).await;
        let out = self
            .run_k3d(
                &["cluster", "start", name],
                self.timeouts.cluster_create,
                None,
            )
            .await?;
        if !out.success() {
            return Err(Error::RuntimeCli {
                operation: "cluster start".to_string(),
                detail: out.detail(),
            });
        }
        emit(output_tx, OutputLine::success(format!("Cluster {} started", name))).await;
        Ok(())
    }

    /// All clusters known to the runtime.
    pub async fn list_clusters(&self) -> Result<Vec<ClusterInfo>> {
        let out = self
            .run_k3d(
                &["cluster", "list", "-o", "json"],
                self.timeouts.cluster_list,
                None,
            )
            .await?;
        if !out.success() {
            return Err(Error::RuntimeCli {
                operation: "cluster list".to_string(),
                detail: out.detail(),
            });
        }
        Ok(parse_cluster_list(&out.stdout)?
            .into_iter()
            .map(ClusterInfo::from_runtime)
            .collect())
    }

    /// One cluster's derived status, or None when it does not exist.
    pub async fn cluster_status(&self, name: &str) -> Result<Option<ClusterInfo>> {
        Ok(self
            .list_clusters()
            .await?
            .into_iter()
            .find(|c| c.name == name))
    }

    /// Detect the type of an existing cluster.
    #[allow(dead_code)]
    pub async fn detect_type(&self, name: &str) -> Result<Option<ClusterType>> {
        Ok(self.cluster_status(name).await?.map(|c| c.kind))
    }

    /// Raw kubeconfig for a cluster, straight from the runtime CLI.
    pub async fn fetch_kubeconfig(&self, name: &str) -> Result<String> {
        let out = self
            .run_k3d(
                &["kubeconfig", "get", name],
                self.timeouts.cluster_list,
                None,
            )
            .await?;
        if !out.success() {
            return Err(Error::RuntimeCli {
                operation: "kubeconfig get".to_string(),
                detail: out.detail(),
            });
        }
        Ok(out.stdout)
    }

    async fn run_k3d(
        &self,
        args: &[&str],
        timeout: std::time::Duration,
        cancel: Option<CancellationToken>,
    ) -> Result<crate::commands::CommandOutput> {
        let mut spec = CommandSpec::new("k3d", args).with_timeout(timeout);
        if let Some(token) = cancel {
            spec = spec.with_cancel(token);
        }
        Ok(self.runner.run(spec).await?)
    }
}
