//! Cluster provisioning on top of the k3d runtime CLI.

pub mod config;
pub mod docker;
pub mod info;
pub mod kubeconfig;
pub mod ports;
pub mod provisioner;
pub mod runtime_config;

pub use config::{ClusterConfig, ClusterType, RUNTIME_PREFIX};
pub use info::ClusterInfo;
pub use provisioner::ClusterProvisioner;
