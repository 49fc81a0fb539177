//! Direct container-runtime access.
//!
//! Used on Linux/macOS where the daemon socket is local: runtime
//! responsiveness checks, the forced delete fallback, and log collection
//! for diagnostics. On Windows the daemon lives inside the subsystem, so
//! the equivalent operations go through the wrapped CLI instead.

#![allow(deprecated)]

use anyhow::Context;
use bollard::query_parameters::{ListContainersOptions, LogsOptions, RemoveContainerOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Thin wrapper over the daemon API.
pub struct DockerManager {
    client: Docker,
}

impl DockerManager {
    pub fn new() -> Result<Self> {
        Self::with_socket(PathBuf::from(DOCKER_SOCKET))
    }

    pub fn with_socket(socket_path: PathBuf) -> Result<Self> {
        let client = Docker::connect_with_unix(
            &socket_path.to_string_lossy(),
            120,
            bollard::API_DEFAULT_VERSION,
        )
        .with_context(|| format!("connecting to Docker at {:?}", socket_path))
        .map_err(|e| Error::Other(format!("{:#}", e)))?;

        Ok(Self { client })
    }

    /// Check if the daemon answers.
    pub async fn is_accessible(&self) -> bool {
        self.client.ping().await.is_ok()
    }

    /// List containers (running or not) whose name starts with `prefix`.
    pub async fn list_containers_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::Other(format!("listing containers: {}", e)))?;

        // The name filter is a substring match; enforce the prefix here
        let names: Vec<String> = containers
            .into_iter()
            .filter_map(|c| c.names)
            .flatten()
            .map(|n| n.trim_start_matches('/').to_string())
            .filter(|n| n.starts_with(prefix))
            .collect();

        Ok(names)
    }

    /// Force-remove a container.
    pub async fn remove_container(&self, name: &str) -> Result<()> {
        self.client
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::Other(format!("removing container {}: {}", name, e)))
    }

    /// Remove every container with the given name prefix, then the cluster
    /// network. This is the delete fallback when the runtime CLI cannot
    /// clean up itself.
    pub async fn sweep_cluster(&self, container_prefix: &str, network: &str) -> Result<()> {
        let containers = self.list_containers_by_prefix(container_prefix).await?;
        for container in &containers {
            if let Err(e) = self.remove_container(container).await {
                tracing::warn!(container = %container, error = %e, "Container removal failed");
            }
        }

        // The network may already be gone with its last container
        let _ = self.client.remove_network(network).await;
        Ok(())
    }

    /// Tail of a container's combined output.
    pub async fn container_logs_tail(&self, name: &str, lines: usize) -> Result<String> {
        let mut stream = self.client.logs(
            name,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                tail: lines.to_string(),
                ..Default::default()
            }),
        );

        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => collected.push_str(&output.to_string()),
                Err(e) => {
                    return Err(Error::Other(format!("reading logs of {}: {}", name, e)));
                }
            }
        }
        Ok(collected)
    }
}
