//! Kubernetes client facade.
//!
//! Wraps the native client with a kubectl-JSON fallback: on Windows the
//! native HTTP path into the subsystem is less reliable than the wrapped
//! CLI, and a failed native constructor must not take the whole run down.

pub mod apps;
mod client;

pub use apps::{AppStatus, HealthStatus, SyncStatus};
pub use client::{
    is_pod_ready, is_transient_api_error, load_kubeconfig, probe_rest_config,
    rest_config_from_kubeconfig, K8sClient,
};
