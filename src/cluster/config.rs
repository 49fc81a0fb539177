//! Cluster configuration and validation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name prefix the cluster runtime puts on everything it creates
/// (containers, networks, kube contexts).
pub const RUNTIME_PREFIX: &str = "k3d";

/// Cluster names become container and network name components, so they
/// follow the runtime's naming rules.
static NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("invalid NAME_REGEX pattern"));

/// Supported cluster types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterType {
    #[serde(rename = "local-k3s")]
    LocalK3s,
}

impl ClusterType {
    /// Parse a type string, rejecting anything without a provisioner.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "local-k3s" => Ok(ClusterType::LocalK3s),
            other => Err(Error::ProviderNotFound(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::LocalK3s => "local-k3s",
        }
    }
}

/// Declarative cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ClusterType,

    #[serde(default = "default_node_count")]
    pub node_count: u32,

    /// Kubernetes version; picks the runtime's default image when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_version: Option<String>,
}

fn default_node_count() -> u32 {
    1
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>, node_count: u32) -> Self {
        Self {
            name: name.into(),
            kind: ClusterType::LocalK3s,
            node_count,
            k8s_version: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("cluster name must not be empty".into()));
        }
        if !NAME_REGEX.is_match(&self.name) {
            return Err(Error::InvalidConfig(format!(
                "cluster name {:?} must match {}",
                self.name,
                NAME_REGEX.as_str()
            )));
        }
        if self.node_count < 1 {
            return Err(Error::InvalidConfig(format!(
                "node_count must be at least 1, got {}",
                self.node_count
            )));
        }
        Ok(())
    }

    /// One server; everything beyond the first node is an agent.
    pub fn servers(&self) -> u32 {
        1
    }

    pub fn agents(&self) -> u32 {
        self.node_count.saturating_sub(1)
    }

    /// Kube context written by the runtime CLI.
    pub fn context_name(&self) -> String {
        format!("{}-{}", RUNTIME_PREFIX, self.name)
    }

    /// Prefix shared by every node container of this cluster.
    pub fn container_prefix(&self) -> String {
        format!("{}-{}-", RUNTIME_PREFIX, self.name)
    }

    /// Docker network created for the cluster.
    pub fn network_name(&self) -> String {
        format!("{}-{}", RUNTIME_PREFIX, self.name)
    }

    /// Node image pinned to the requested Kubernetes version, if any.
    pub fn image(&self) -> Option<String> {
        self.k8s_version
            .as_ref()
            .map(|v| format!("rancher/k3s:{}", v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = ClusterConfig::new("dev", 1);
        config.validate().unwrap();
        assert_eq!(config.servers(), 1);
        assert_eq!(config.agents(), 0);
        assert_eq!(config.context_name(), "k3d-dev");
        assert_eq!(config.container_prefix(), "k3d-dev-");
        assert_eq!(config.network_name(), "k3d-dev");
    }

    #[test]
    fn test_multi_node_split() {
        let config = ClusterConfig::new("dev", 3);
        assert_eq!(config.servers(), 1);
        assert_eq!(config.agents(), 2);
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let config = ClusterConfig::new("dev", 0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_name_rules() {
        assert!(ClusterConfig::new("", 1).validate().is_err());
        assert!(ClusterConfig::new("Dev", 1).validate().is_err());
        assert!(ClusterConfig::new("-dev", 1).validate().is_err());
        assert!(ClusterConfig::new("my_cluster", 1).validate().is_err());
        assert!(ClusterConfig::new("dev-2", 1).validate().is_ok());
    }

    #[test]
    fn test_type_parse() {
        assert_eq!(ClusterType::parse("local-k3s").unwrap(), ClusterType::LocalK3s);
        let err = ClusterType::parse("eks").unwrap_err();
        assert!(matches!(err, Error::ProviderNotFound(_)));
    }

    #[test]
    fn test_image_follows_version() {
        let mut config = ClusterConfig::new("dev", 1);
        assert_eq!(config.image(), None);
        config.k8s_version = Some("v1.31.4-k3s1".into());
        assert_eq!(config.image().unwrap(), "rancher/k3s:v1.31.4-k3s1");
    }
}
