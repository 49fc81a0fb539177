//! Parsing of the runtime CLI's JSON output.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use super::config::ClusterType;
use crate::error::{Error, Result};

/// One cluster as reported by `cluster list -o json`.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeCluster {
    pub name: String,

    #[serde(default, rename = "serversCount")]
    pub servers_count: u32,

    #[serde(default, rename = "serversRunning")]
    pub servers_running: u32,

    #[serde(default)]
    pub nodes: Vec<RuntimeNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeNode {
    pub name: String,

    #[serde(default)]
    pub role: String,

    #[serde(default, rename = "State")]
    pub state: NodeState,

    #[serde(default)]
    pub created: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeState {
    #[serde(default, rename = "Running")]
    pub running: bool,

    #[serde(default, rename = "Status")]
    pub status: String,
}

/// Derived cluster summary.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub name: String,
    pub kind: ClusterType,
    /// `running/total` fraction of server nodes.
    pub status: String,
    pub node_count: usize,
    pub created_at: Option<DateTime<Utc>>,
    pub nodes: Vec<RuntimeNode>,
}

impl ClusterInfo {
    pub fn from_runtime(cluster: RuntimeCluster) -> Self {
        let servers: Vec<&RuntimeNode> = cluster
            .nodes
            .iter()
            .filter(|n| n.role == "server")
            .collect();
        let agents = cluster.nodes.iter().filter(|n| n.role == "agent").count();

        let (running, total) = if servers.is_empty() {
            (cluster.servers_running, cluster.servers_count)
        } else {
            (
                servers.iter().filter(|n| n.state.running).count() as u32,
                servers.len() as u32,
            )
        };

        // Cluster age is the age of its oldest server
        let created_at = servers
            .iter()
            .filter_map(|n| n.created.as_deref())
            .filter_map(parse_created)
            .min();

        let node_count = if servers.is_empty() && agents == 0 {
            cluster.servers_count as usize
        } else {
            servers.len() + agents
        };

        Self {
            name: cluster.name,
            kind: ClusterType::LocalK3s,
            status: format!("{}/{}", running, total),
            node_count,
            created_at,
            nodes: cluster.nodes,
        }
    }

    pub fn is_running(&self) -> bool {
        match self.status.split_once('/') {
            Some((running, total)) => running == total && running != "0",
            None => false,
        }
    }

    /// Names of the server-role node containers.
    #[allow(dead_code)]
    pub fn server_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.role == "server")
            .map(|n| n.name.clone())
            .collect()
    }

    /// Names of all k3s node containers (servers and agents).
    pub fn k3s_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.role == "server" || n.role == "agent")
            .map(|n| n.name.clone())
            .collect()
    }
}

fn parse_created(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

/// Parse `cluster list -o json` output. An empty array is an empty list.
pub fn parse_cluster_list(json: &str) -> Result<Vec<RuntimeCluster>> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed)
        .map_err(|e| Error::RuntimeCli {
            operation: "cluster list".to_string(),
            detail: format!("unparseable JSON: {}", e),
        })
}

/// Host ports already claimed by existing clusters, scraped from the raw
/// listing (port mappings appear at varying depths per runtime version).
pub fn host_ports_in_use(raw: &Value) -> HashSet<u16> {
    let mut ports = HashSet::new();
    collect_host_ports(raw, &mut ports);
    ports
}

fn collect_host_ports(value: &Value, ports: &mut HashSet<u16>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "HostPort" {
                    if let Some(port) = child.as_str().and_then(|s| s.parse::<u16>().ok()) {
                        ports.insert(port);
                    }
                }
                collect_host_ports(child, ports);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_host_ports(item, ports);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"[
      {
        "name": "dev",
        "serversCount": 1,
        "serversRunning": 1,
        "nodes": [
          {
            "name": "k3d-dev-server-0",
            "role": "server",
            "State": {"Running": true, "Status": "running"},
            "created": "2024-05-01T10:00:00Z"
          },
          {
            "name": "k3d-dev-agent-0",
            "role": "agent",
            "State": {"Running": true, "Status": "running"},
            "created": "2024-05-01T10:00:05Z"
          },
          {
            "name": "k3d-dev-serverlb",
            "role": "loadbalancer",
            "State": {"Running": true, "Status": "running"},
            "created": "2024-05-01T10:00:10Z"
          }
        ]
      }
    ]"#;

    #[test]
    fn test_parse_listing() {
        let clusters = parse_cluster_list(LISTING).unwrap();
        assert_eq!(clusters.len(), 1);

        let info = ClusterInfo::from_runtime(clusters.into_iter().next().unwrap());
        assert_eq!(info.name, "dev");
        assert_eq!(info.status, "1/1");
        assert!(info.is_running());
        // Load balancer is not a k3s node
        assert_eq!(info.node_count, 2);
        assert_eq!(info.server_nodes(), vec!["k3d-dev-server-0"]);
        assert_eq!(
            info.k3s_nodes(),
            vec!["k3d-dev-server-0", "k3d-dev-agent-0"]
        );
    }

    #[test]
    fn test_created_at_is_earliest_server() {
        let json = r#"[{"name":"ha","nodes":[
            {"name":"s1","role":"server","State":{"Running":true},"created":"2024-05-01T10:00:30Z"},
            {"name":"s0","role":"server","State":{"Running":false},"created":"2024-05-01T10:00:00Z"},
            {"name":"a0","role":"agent","State":{"Running":true},"created":"2024-05-01T09:00:00Z"}
        ]}]"#;
        let clusters = parse_cluster_list(json).unwrap();
        let info = ClusterInfo::from_runtime(clusters.into_iter().next().unwrap());
        assert_eq!(
            info.created_at.unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
        assert_eq!(info.status, "1/2");
        assert!(!info.is_running());
    }

    #[test]
    fn test_empty_listing() {
        assert!(parse_cluster_list("[]").unwrap().is_empty());
        assert!(parse_cluster_list("").unwrap().is_empty());
        assert!(parse_cluster_list("  \n").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_listing() {
        let err = parse_cluster_list("{not json").unwrap_err();
        assert!(matches!(err, Error::RuntimeCli { .. }));
    }

    #[test]
    fn test_host_ports_in_use() {
        let raw: Value = serde_json::from_str(
            r#"[{"nodes":[{"portMappings":{"6443/tcp":[{"HostIp":"0.0.0.0","HostPort":"6550"}],
                "80/tcp":[{"HostPort":"8080"}]}}]}]"#,
        )
        .unwrap();
        let ports = host_ports_in_use(&raw);
        assert!(ports.contains(&6550));
        assert!(ports.contains(&8080));
        assert_eq!(ports.len(), 2);
    }
}
