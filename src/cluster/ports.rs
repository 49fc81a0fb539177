//! Host port selection for dynamic allocation.
//!
//! The fixed defaults (6550 / 8080 / 8443) serve most invocations; dynamic
//! allocation probes candidate sets so a second cluster can coexist with
//! the first.

use std::collections::HashSet;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::commands::{CommandRunner, CommandSpec};
use crate::cluster::info;
use crate::error::{Error, Result};

/// The three host ports a cluster occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocation {
    pub api: u16,
    pub http: u16,
    pub https: u16,
}

impl Default for PortAllocation {
    fn default() -> Self {
        Self {
            api: 6550,
            http: 8080,
            https: 8443,
        }
    }
}

/// Preferred candidate set.
const PRIMARY: PortAllocation = PortAllocation {
    api: 6550,
    http: 80,
    https: 443,
};

/// First fallback, and the base of the linear scan.
const ALTERNATE: PortAllocation = PortAllocation {
    api: 6551,
    http: 8080,
    https: 8443,
};

const SCAN_RANGE: u16 = 1000;

/// Select a free port triple: the primary set, then the alternate set,
/// then linearly upward from the alternate.
pub async fn select_ports(runner: &dyn CommandRunner) -> Result<PortAllocation> {
    let claimed = claimed_ports(runner).await;

    if allocation_available(&PRIMARY, &claimed).await {
        return Ok(PRIMARY);
    }

    for offset in 0..SCAN_RANGE {
        let candidate = PortAllocation {
            api: ALTERNATE.api.saturating_add(offset),
            http: ALTERNATE.http.saturating_add(offset),
            https: ALTERNATE.https.saturating_add(offset),
        };
        if allocation_available(&candidate, &claimed).await {
            return Ok(candidate);
        }
    }

    Err(Error::Other(format!(
        "no free port triple within {} offsets of {}/{}/{}",
        SCAN_RANGE, ALTERNATE.api, ALTERNATE.http, ALTERNATE.https
    )))
}

async fn allocation_available(ports: &PortAllocation, claimed: &HashSet<u16>) -> bool {
    for port in [ports.api, ports.http, ports.https] {
        if !port_available(port, claimed).await {
            return false;
        }
    }
    true
}

/// A port is free when no existing cluster claims it and a local listen
/// succeeds.
pub async fn port_available(port: u16, claimed: &HashSet<u16>) -> bool {
    if claimed.contains(&port) {
        return false;
    }
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

/// Ports claimed by existing clusters per the runtime CLI listing.
async fn claimed_ports(runner: &dyn CommandRunner) -> HashSet<u16> {
    let output = runner
        .run(
            CommandSpec::new("k3d", &["cluster", "list", "-o", "json"])
                .with_timeout(Duration::from_secs(30)),
        )
        .await;

    match output {
        Ok(out) if out.success() => serde_json::from_str(&out.stdout)
            .map(|v| info::host_ports_in_use(&v))
            .unwrap_or_default(),
        _ => HashSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::MockRunner;

    #[tokio::test]
    async fn test_claimed_port_is_unavailable() {
        let mut claimed = HashSet::new();
        claimed.insert(6550);
        assert!(!port_available(6550, &claimed).await);
    }

    #[tokio::test]
    async fn test_listened_port_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_available(port, &HashSet::new()).await);
    }

    #[tokio::test]
    async fn test_select_skips_claimed_primary() {
        let mock = MockRunner::new();
        // Existing cluster occupies the primary API port
        mock.ok(
            "cluster list -o json",
            r#"[{"nodes":[{"portMappings":{"6443/tcp":[{"HostPort":"6550"}]}}]}]"#,
        );

        let ports = select_ports(&mock).await.unwrap();
        assert_ne!(ports.api, 6550);
        // Lands on the alternate set (or beyond, if the host has listeners)
        assert!(ports.api >= 6551);
    }
}
