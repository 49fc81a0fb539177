//! The cluster runtime's declarative config document.
//!
//! Field names and structure must round-trip through the runtime CLI
//! unchanged, so everything here serializes to the exact `v1alpha5` /
//! `Simple` schema.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use super::config::ClusterConfig;
use super::ports::PortAllocation;
use crate::error::{Error, Result};
use crate::platform::Platform;

pub const CONFIG_API_VERSION: &str = "k3d.io/v1alpha5";
pub const CONFIG_KIND: &str = "Simple";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleConfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    pub metadata: Metadata,

    pub servers: u32,
    pub agents: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(rename = "kubeAPI")]
    pub kube_api: KubeApi,

    pub options: Options,

    pub ports: Vec<PortMapping>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registries: Option<Registries>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeApi {
    pub host: String,

    #[serde(rename = "hostIP")]
    pub host_ip: String,

    #[serde(rename = "hostPort")]
    pub host_port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub k3s: K3sOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct K3sOptions {
    #[serde(rename = "extraArgs")]
    pub extra_args: Vec<ExtraArg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraArg {
    pub arg: String,

    #[serde(rename = "nodeFilters")]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub port: String,

    #[serde(rename = "nodeFilters")]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registries {
    /// YAML literal with registry mirrors.
    pub config: String,
}

impl SimpleConfig {
    /// Build the document for a validated cluster config.
    ///
    /// The API listens on loopback except on Windows, where the subsystem
    /// boundary requires binding all interfaces; the extra TLS SAN makes
    /// the subsystem address validate against the serving certificate.
    pub fn build(
        config: &ClusterConfig,
        platform: Platform,
        ports: &PortAllocation,
        tls_san: Option<Ipv4Addr>,
    ) -> Self {
        let api_host = if platform.is_windows() {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        };

        let mut extra_args = vec![
            ExtraArg {
                arg: "--disable=traefik".to_string(),
                node_filters: vec!["server:*".to_string()],
            },
            ExtraArg {
                arg: "--kubelet-arg=eviction-hard=imagefs.available<1%,nodefs.available<1%"
                    .to_string(),
                node_filters: vec!["all".to_string()],
            },
            ExtraArg {
                arg: "--kubelet-arg=eviction-minimum-reclaim=imagefs.available=1%,nodefs.available=1%"
                    .to_string(),
                node_filters: vec!["all".to_string()],
            },
        ];

        if let Some(ip) = tls_san {
            extra_args.push(ExtraArg {
                arg: format!("--tls-san={}", ip),
                node_filters: vec!["server:*".to_string()],
            });
        }

        let registries = if platform.is_windows() {
            Some(Registries {
                config: concat!(
                    "mirrors:\n",
                    "  \"docker.io\":\n",
                    "    endpoint:\n",
                    "      - https://registry-1.docker.io\n",
                )
                .to_string(),
            })
        } else {
            None
        };

        Self {
            api_version: CONFIG_API_VERSION.to_string(),
            kind: CONFIG_KIND.to_string(),
            metadata: Metadata {
                name: config.name.clone(),
            },
            servers: config.servers(),
            agents: config.agents(),
            image: config.image(),
            kube_api: KubeApi {
                host: api_host.to_string(),
                host_ip: api_host.to_string(),
                host_port: ports.api.to_string(),
            },
            options: Options {
                k3s: K3sOptions { extra_args },
            },
            ports: vec![
                PortMapping {
                    port: format!("{}:80", ports.http),
                    node_filters: vec!["loadbalancer".to_string()],
                },
                PortMapping {
                    port: format!("{}:443", ports.https),
                    node_filters: vec!["loadbalancer".to_string()],
                },
            ],
            registries,
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yml::to_string(self).map_err(|e| Error::Other(format!("serializing config: {}", e)))
    }
}
