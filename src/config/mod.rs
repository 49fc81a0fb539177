//! Centralized timeout configuration
//!
//! All timing-related constants used by the provisioner and the reconciler
//! live here, so the wall-clock budget of a bootstrap run is readable in
//! one place.

use serde::Deserialize;
use std::time::Duration;

/// Wall-clock budgets for every bounded operation.
///
/// Every value is overridable by the caller's cancellation token firing
/// earlier.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Runtime CLI `cluster create`
    pub cluster_create: Duration,

    /// Runtime CLI `cluster delete`
    pub cluster_delete: Duration,

    /// Runtime CLI `cluster list` and other read-only invocations
    pub cluster_list: Duration,

    /// Per-attempt TCP connect to the API endpoint
    pub tcp_connect: Duration,

    /// API TCP probe: retries and delay between them
    pub tcp_probe_retries: u32,
    pub tcp_probe_delay: Duration,

    /// Node-ready poll: retries and delay
    pub node_ready_retries: u32,
    pub node_ready_delay: Duration,

    /// Applications CRD wait: retries and delay
    pub crd_wait_retries: u32,
    pub crd_wait_delay: Duration,

    /// CD-controller pod-exists wait: retries and delay
    pub pod_exists_retries: u32,
    pub pod_exists_delay: Duration,

    /// CD-controller pod-ready wait
    pub pod_ready: Duration,

    /// Reconciler bootstrap window and its probe cadence
    pub reconciler_bootstrap: Duration,
    pub bootstrap_probe_interval: Duration,

    /// Reconciler overall cap
    pub reconciler_total: Duration,

    /// Repo-server recovery: retries and delay
    pub repo_recovery_retries: u32,
    pub repo_recovery_delay: Duration,

    /// Connectivity probe cadence (healthy / degraded) and per-probe cap
    pub connectivity_interval: Duration,
    pub connectivity_degraded_interval: Duration,
    pub connectivity_check_timeout: Duration,

    /// Application poll cadence
    pub app_poll_interval: Duration,

    /// Minimum spacing between repo-server recoveries; also the warm-up
    /// before the first recovery is allowed
    pub repo_diagnostic_interval: Duration,

    /// Verbose resource-status log cadence
    pub resource_log_interval: Duration,

    /// Stuck-application diagnostics: activation threshold, per-app report
    /// cadence, deep-dump cadence
    pub stuck_after: Duration,
    pub stuck_report_interval: Duration,
    pub stuck_dump_interval: Duration,

    /// Workload scan: activation threshold and cadence
    pub workload_scan_after: Duration,
    pub workload_scan_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            cluster_create: Duration::from_secs(300),
            cluster_delete: Duration::from_secs(120),
            cluster_list: Duration::from_secs(30),

            tcp_connect: Duration::from_secs(2),
            tcp_probe_retries: 10,
            tcp_probe_delay: Duration::from_secs(1),

            node_ready_retries: 15,
            node_ready_delay: Duration::from_secs(2),

            crd_wait_retries: 100,
            crd_wait_delay: Duration::from_secs(3),

            pod_exists_retries: 40,
            pod_exists_delay: Duration::from_secs(3),

            pod_ready: Duration::from_secs(300),

            reconciler_bootstrap: Duration::from_secs(30),
            bootstrap_probe_interval: Duration::from_secs(5),
            reconciler_total: Duration::from_secs(60 * 60),

            repo_recovery_retries: 20,
            repo_recovery_delay: Duration::from_secs(3),

            connectivity_interval: Duration::from_secs(10),
            connectivity_degraded_interval: Duration::from_secs(2),
            connectivity_check_timeout: Duration::from_secs(10),

            app_poll_interval: Duration::from_secs(2),

            repo_diagnostic_interval: Duration::from_secs(120),

            resource_log_interval: Duration::from_secs(300),

            stuck_after: Duration::from_secs(300),
            stuck_report_interval: Duration::from_secs(60),
            stuck_dump_interval: Duration::from_secs(120),

            workload_scan_after: Duration::from_secs(420),
            workload_scan_interval: Duration::from_secs(300),
        }
    }
}

impl Timeouts {
    /// Compressed intervals for tests
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            cluster_create: Duration::from_secs(5),
            cluster_delete: Duration::from_secs(5),
            cluster_list: Duration::from_secs(2),
            tcp_connect: Duration::from_millis(200),
            tcp_probe_retries: 3,
            tcp_probe_delay: Duration::from_millis(20),
            node_ready_retries: 3,
            node_ready_delay: Duration::from_millis(20),
            crd_wait_retries: 3,
            crd_wait_delay: Duration::from_millis(20),
            pod_exists_retries: 3,
            pod_exists_delay: Duration::from_millis(20),
            pod_ready: Duration::from_secs(1),
            reconciler_bootstrap: Duration::from_millis(200),
            bootstrap_probe_interval: Duration::from_millis(50),
            reconciler_total: Duration::from_secs(5),
            repo_recovery_retries: 3,
            repo_recovery_delay: Duration::from_millis(20),
            connectivity_interval: Duration::from_millis(100),
            connectivity_degraded_interval: Duration::from_millis(40),
            connectivity_check_timeout: Duration::from_secs(1),
            app_poll_interval: Duration::from_millis(50),
            repo_diagnostic_interval: Duration::from_millis(200),
            resource_log_interval: Duration::from_millis(200),
            stuck_after: Duration::from_millis(500),
            stuck_report_interval: Duration::from_millis(100),
            stuck_dump_interval: Duration::from_millis(200),
            workload_scan_after: Duration::from_millis(700),
            workload_scan_interval: Duration::from_millis(300),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Enable file logging
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,

    /// Log file path; supports a {cluster_name} placeholder
    #[serde(default = "default_log_file")]
    pub file: String,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_logging_enabled() -> bool {
    true
}

fn default_log_file() -> String {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".k3pilot")
        .join("{cluster_name}.log")
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            file: default_log_file(),
            level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout_table() {
        let t = Timeouts::default();
        assert_eq!(t.cluster_create, Duration::from_secs(300));
        assert_eq!(t.cluster_delete, Duration::from_secs(120));
        assert_eq!(t.tcp_probe_retries, 10);
        assert_eq!(t.node_ready_retries, 15);
        assert_eq!(t.crd_wait_retries, 100);
        assert_eq!(t.pod_exists_retries, 40);
        assert_eq!(t.reconciler_total, Duration::from_secs(3600));
        assert_eq!(t.repo_recovery_retries, 20);
    }

    #[test]
    fn test_log_file_placeholder() {
        let config = LoggingConfig::default();
        assert!(config.file.contains("{cluster_name}"));
    }
}
