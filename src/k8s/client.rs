//! REST config construction and typed cluster access.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Event, Node, PersistentVolumeClaim, Pod};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, ListParams, LogParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::sleep;

use crate::commands::{CommandRunner, CommandSpec};
use crate::config::Timeouts;
use crate::error::{Error, Result};
use crate::platform::{net, Platform};

/// API errors that mean "not yet" rather than "never".
const TRANSIENT_API_MARKERS: &[&str] = &[
    "connection refused",
    "i/o timeout",
    "no such host",
    "connection reset",
    "Service Unavailable",
    "server is currently unable",
];

pub fn is_transient_api_error(message: &str) -> bool {
    TRANSIENT_API_MARKERS.iter().any(|m| message.contains(m))
}

/// Load the kubeconfig: from the runtime CLI's stdout on Windows (host
/// filesystem path semantics do not survive the subsystem boundary), from
/// disk elsewhere.
pub async fn load_kubeconfig(
    runner: &dyn CommandRunner,
    platform: Platform,
    cluster_name: &str,
) -> Result<Kubeconfig> {
    if platform.is_windows() {
        let out = runner
            .run(
                CommandSpec::new("k3d", &["kubeconfig", "get", cluster_name])
                    .with_timeout(std::time::Duration::from_secs(30)),
            )
            .await?;
        if !out.success() {
            return Err(Error::RuntimeCli {
                operation: "kubeconfig get".to_string(),
                detail: out.detail(),
            });
        }
        return Kubeconfig::from_yaml(&out.stdout)
            .map_err(|e| Error::Other(format!("parsing kubeconfig: {}", e)));
    }

    let path = crate::cluster::kubeconfig::kubeconfig_path();
    Kubeconfig::read_from(&path)
        .map_err(|e| Error::Other(format!("reading kubeconfig {}: {}", path.display(), e)))
}

/// Build a REST config for a local cluster.
///
/// TLS verification is disabled because the connect host (loopback or the
/// subsystem address) may not be in the serving certificate's SAN set;
/// client-certificate credentials stay intact because only the CA data is
/// cleared, not the auth info.
pub async fn rest_config_from_kubeconfig(
    mut kubeconfig: Kubeconfig,
    context: Option<&str>,
    rewrite_host: Option<&str>,
) -> Result<Config> {
    if let Some(host) = rewrite_host {
        for named in &mut kubeconfig.clusters {
            if let Some(cluster) = named.cluster.as_mut() {
                if let Some(server) = cluster.server.as_mut() {
                    *server = rewrite_server_host(server, host);
                }
            }
        }
    }

    let options = KubeConfigOptions {
        context: context.map(String::from),
        ..Default::default()
    };
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| Error::Other(format!("building REST config: {}", e)))?;

    config.accept_invalid_certs = true;
    config.root_cert = None;

    Ok(config)
}

/// Swap the host of an API server URL, preserving scheme and port.
fn rewrite_server_host(server: &str, host: &str) -> String {
    let (scheme, rest) = match server.split_once("://") {
        Some((s, r)) => (s, r),
        None => return server.to_string(),
    };
    let port = rest
        .rsplit_once(':')
        .and_then(|(_, p)| p.parse::<u16>().ok());
    match port {
        Some(p) => format!("{}://{}:{}", scheme, host, p),
        None => format!("{}://{}", scheme, host),
    }
}

/// TCP-probe the REST config's endpoint.
pub async fn probe_rest_config(config: &Config, timeouts: &Timeouts) -> Result<()> {
    let host = config
        .cluster_url
        .host()
        .ok_or_else(|| Error::ClusterUnreachable("REST config has no host".into()))?
        .to_string();
    let port = config.cluster_url.port_u16().unwrap_or(443);

    net::probe_tcp(
        &host,
        port,
        timeouts.tcp_probe_retries,
        timeouts.tcp_probe_delay,
        timeouts.tcp_connect,
    )
    .await
}

/// Pod readiness: completed init jobs count as ready; otherwise the pod
/// must be running with condition `Ready=True`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");
    if phase == "Succeeded" {
        return true;
    }
    if phase != "Running" {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

/// Typed cluster access with a CLI fallback.
pub struct K8sClient {
    client: Option<Client>,
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
    /// kube context for CLI invocations, e.g. `k3d-dev`.
    context: Option<String>,
    timeouts: Timeouts,
}

impl K8sClient {
    /// Build from a REST config. A native construction failure is recorded,
    /// not fatal: every read switches to the CLI fallback.
    pub fn new(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        platform: Platform,
        context: Option<String>,
        timeouts: Timeouts,
    ) -> Self {
        let client = match Client::try_from(config) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(error = %e, "Native client construction failed, using CLI fallback");
                None
            }
        };

        Self {
            client,
            runner,
            platform,
            context,
            timeouts,
        }
    }

    /// Wrap an existing native client (scripted services in tests).
    #[cfg(test)]
    pub(crate) fn with_native(
        client: Client,
        runner: Arc<dyn CommandRunner>,
        platform: Platform,
        context: Option<String>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            client: Some(client),
            runner,
            platform,
            context,
            timeouts,
        }
    }

    /// CLI-only client (also used when the caller never built a REST config).
    pub fn cli_only(
        runner: Arc<dyn CommandRunner>,
        platform: Platform,
        context: Option<String>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            client: None,
            runner,
            platform,
            context,
            timeouts,
        }
    }

    /// The CLI fallback is selected on Windows (the wrapped CLI's path into
    /// the subsystem is the reliable one there) or when there is no native
    /// client.
    pub(crate) fn use_cli(&self) -> bool {
        self.platform.is_windows() || self.client.is_none()
    }

    pub(crate) fn native(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::Other("no native client available".into()))
    }

    pub(crate) fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub(crate) fn platform(&self) -> Platform {
        self.platform
    }

    /// kubectl argument prefix: `[--context <ctx>]` plus the given tail.
    pub(crate) fn kubectl_args(&self, tail: &[&str]) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ctx) = &self.context {
            args.push("--context".to_string());
            args.push(ctx.clone());
        }
        args.extend(tail.iter().map(|s| s.to_string()));
        args
    }

    pub(crate) async fn kubectl(&self, tail: &[&str]) -> Result<crate::commands::CommandOutput> {
        let args = self.kubectl_args(tail);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(self
            .runner
            .run(
                CommandSpec::new("kubectl", &arg_refs)
                    .with_timeout(self.timeouts.cluster_list),
            )
            .await?)
    }

    /// Wait until at least one node reports `Ready=True`.
    pub async fn wait_for_node_ready(&self) -> Result<()> {
        let mut last_error = String::new();
        for _ in 0..self.timeouts.node_ready_retries {
            match self.any_node_ready().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    let message = e.to_string();
                    if !is_transient_api_error(&message) {
                        return Err(e);
                    }
                    last_error = message;
                }
            }
            sleep(self.timeouts.node_ready_delay).await;
        }
        Err(Error::ClusterUnreachable(format!(
            "no node became Ready (last error: {})",
            if last_error.is_empty() {
                "none"
            } else {
                last_error.as_str()
            }
        )))
    }

    async fn any_node_ready(&self) -> Result<bool> {
        if self.use_cli() {
            let out = self.kubectl(&["get", "nodes", "-o", "json"]).await?;
            if !out.success() {
                return Err(Error::ClusterUnreachable(out.detail()));
            }
            let value: Value = serde_json::from_str(&out.stdout)
                .map_err(|e| Error::Other(format!("parsing node list: {}", e)))?;
            let nodes: Vec<Node> =
                serde_json::from_value(value.get("items").cloned().unwrap_or(Value::Array(vec![])))
                    .map_err(|e| Error::Other(format!("parsing nodes: {}", e)))?;
            return Ok(nodes.iter().any(node_is_ready));
        }

        let nodes: Api<Node> = Api::all(self.native()?.clone());
        let list = nodes.list(&ListParams::default()).await?;
        Ok(list.items.iter().any(node_is_ready))
    }

    /// List pods in a namespace, optionally filtered by label selector.
    pub async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<Pod>> {
        if self.use_cli() {
            let mut tail = vec!["-n", namespace, "get", "pods", "-o", "json"];
            if let Some(sel) = selector {
                tail.push("-l");
                tail.push(sel);
            }
            let out = self.kubectl(&tail).await?;
            if !out.success() {
                return Err(Error::Other(out.detail()));
            }
            let value: Value = serde_json::from_str(&out.stdout)
                .map_err(|e| Error::Other(format!("parsing pod list: {}", e)))?;
            let pods: Vec<Pod> =
                serde_json::from_value(value.get("items").cloned().unwrap_or(Value::Array(vec![])))
                    .map_err(|e| Error::Other(format!("parsing pods: {}", e)))?;
            return Ok(pods);
        }

        let pods: Api<Pod> = Api::namespaced(self.native()?.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(sel) = selector {
            params = params.labels(sel);
        }
        Ok(pods.list(&params).await?.items)
    }

    /// Whether a named CRD exists.
    pub async fn crd_exists(&self, name: &str) -> Result<bool> {
        if self.use_cli() {
            let out = self.kubectl(&["get", "crd", name, "-o", "name"]).await?;
            if out.success() {
                return Ok(true);
            }
            if out.stderr.contains("NotFound") || out.stderr.contains("not found") {
                return Ok(false);
            }
            return Err(Error::Other(out.detail()));
        }

        let crds: Api<CustomResourceDefinition> = Api::all(self.native()?.clone());
        match crds.get(name).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete pods by label without waiting for them to terminate.
    pub async fn delete_pods_by_label(&self, namespace: &str, selector: &str) -> Result<()> {
        if self.use_cli() {
            let out = self
                .kubectl(&[
                    "-n", namespace, "delete", "pods", "-l", selector, "--wait=false",
                ])
                .await?;
            if !out.success() {
                return Err(Error::Other(out.detail()));
            }
            return Ok(());
        }

        let pods: Api<Pod> = Api::namespaced(self.native()?.clone(), namespace);
        pods.delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(selector),
        )
        .await?;
        Ok(())
    }

    /// Tail of one pod's logs across the given container (or the default).
    pub async fn pod_logs_tail(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        lines: i64,
    ) -> Result<String> {
        if self.use_cli() {
            let tail_arg = format!("--tail={}", lines);
            let mut tail: Vec<&str> =
                vec!["-n", namespace, "logs", pod, tail_arg.as_str(), "--all-containers=true"];
            if let Some(c) = container {
                tail = vec!["-n", namespace, "logs", pod, tail_arg.as_str(), "-c", c];
            }
            let out = self.kubectl(&tail).await?;
            if !out.success() {
                return Err(Error::Other(out.detail()));
            }
            return Ok(out.stdout);
        }

        let pods: Api<Pod> = Api::namespaced(self.native()?.clone(), namespace);
        let mut params = LogParams {
            tail_lines: Some(lines),
            ..Default::default()
        };
        if let Some(c) = container {
            params.container = Some(c.to_string());
        }
        Ok(pods.logs(pod, &params).await?)
    }

    /// Events scoped to one pod, most recent last.
    pub async fn pod_events(&self, namespace: &str, pod: &str) -> Result<Vec<Event>> {
        if self.use_cli() {
            let field = format!("involvedObject.name={}", pod);
            let out = self
                .kubectl(&[
                    "-n",
                    namespace,
                    "get",
                    "events",
                    "--field-selector",
                    &field,
                    "-o",
                    "json",
                ])
                .await?;
            if !out.success() {
                return Err(Error::Other(out.detail()));
            }
            let value: Value = serde_json::from_str(&out.stdout)
                .map_err(|e| Error::Other(format!("parsing events: {}", e)))?;
            let mut events: Vec<Event> =
                serde_json::from_value(value.get("items").cloned().unwrap_or(Value::Array(vec![])))
                    .map_err(|e| Error::Other(format!("parsing events: {}", e)))?;
            sort_events(&mut events);
            return Ok(events);
        }

        let events: Api<Event> = Api::namespaced(self.native()?.clone(), namespace);
        let params = ListParams::default().fields(&format!("involvedObject.name={}", pod));
        let mut items = events.list(&params).await?.items;
        sort_events(&mut items);
        Ok(items)
    }

    pub async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        if self.use_cli() {
            return self.list_via_cli(namespace, "deployments").await;
        }
        let api: Api<Deployment> = Api::namespaced(self.native()?.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    pub async fn list_statefulsets(&self, namespace: &str) -> Result<Vec<StatefulSet>> {
        if self.use_cli() {
            return self.list_via_cli(namespace, "statefulsets").await;
        }
        let api: Api<StatefulSet> = Api::namespaced(self.native()?.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    pub async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        if self.use_cli() {
            return self.list_via_cli(namespace, "pvc").await;
        }
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.native()?.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_via_cli<T: serde::de::DeserializeOwned>(
        &self,
        namespace: &str,
        resource: &str,
    ) -> Result<Vec<T>> {
        let out = self
            .kubectl(&["-n", namespace, "get", resource, "-o", "json"])
            .await?;
        if !out.success() {
            return Err(Error::Other(out.detail()));
        }
        let value: Value = serde_json::from_str(&out.stdout)
            .map_err(|e| Error::Other(format!("parsing {} list: {}", resource, e)))?;
        serde_json::from_value(value.get("items").cloned().unwrap_or(Value::Array(vec![])))
            .map_err(|e| Error::Other(format!("parsing {}: {}", resource, e)))
    }
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| {
        let at = a.last_timestamp.as_ref().map(|t| t.0);
        let bt = b.last_timestamp.as_ref().map(|t| t.0);
        at.cmp(&bt)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::MockRunner;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn pod_with(phase: &str, ready: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: ready.map(|status| {
                    vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: status.to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_ready_rules() {
        assert!(is_pod_ready(&pod_with("Succeeded", None)));
        assert!(is_pod_ready(&pod_with("Running", Some("True"))));
        assert!(!is_pod_ready(&pod_with("Running", Some("False"))));
        assert!(!is_pod_ready(&pod_with("Running", None)));
        assert!(!is_pod_ready(&pod_with("Pending", Some("True"))));
        assert!(!is_pod_ready(&pod_with("Failed", None)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_api_error("dial tcp: connection refused"));
        assert!(is_transient_api_error("i/o timeout"));
        assert!(is_transient_api_error("the server is currently unable to handle the request"));
        assert!(!is_transient_api_error("Unauthorized"));
        assert!(!is_transient_api_error("applications.argoproj.io not found"));
    }

    #[test]
    fn test_rewrite_server_host() {
        assert_eq!(
            rewrite_server_host("https://0.0.0.0:6550", "172.20.240.10"),
            "https://172.20.240.10:6550"
        );
        assert_eq!(
            rewrite_server_host("https://example", "127.0.0.1"),
            "https://127.0.0.1"
        );
    }

    fn cli_client(mock: Arc<MockRunner>) -> K8sClient {
        K8sClient::cli_only(
            mock,
            Platform::Linux,
            Some("k3d-dev".to_string()),
            Timeouts::fast(),
        )
    }

    #[tokio::test]
    async fn test_cli_pods_parse() {
        let mock = Arc::new(MockRunner::new());
        mock.ok(
            "get pods",
            r#"{"items":[{"metadata":{"name":"argocd-server-0"},
                "status":{"phase":"Running","conditions":[{"type":"Ready","status":"True"}]}}]}"#,
        );
        let client = cli_client(Arc::clone(&mock));

        let pods = client.list_pods("argocd", None).await.unwrap();
        assert_eq!(pods.len(), 1);
        assert!(is_pod_ready(&pods[0]));

        // Context flag is threaded into the invocation
        assert_eq!(mock.count_calls("--context k3d-dev"), 1);
    }

    #[tokio::test]
    async fn test_cli_crd_not_found() {
        let mock = Arc::new(MockRunner::new());
        mock.fail(
            "get crd",
            1,
            "Error from server (NotFound): customresourcedefinitions.apiextensions.k8s.io \"applications.argoproj.io\" not found",
        );
        let client = cli_client(mock);
        assert!(!client.crd_exists("applications.argoproj.io").await.unwrap());
    }

    #[tokio::test]
    async fn test_cli_node_ready() {
        let mock = Arc::new(MockRunner::new());
        mock.ok(
            "get nodes",
            r#"{"items":[{"metadata":{"name":"n0"},
                "status":{"conditions":[{"type":"Ready","status":"True"}]}}]}"#,
        );
        let client = cli_client(mock);
        client.wait_for_node_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_node_ready_exhausts_on_refused() {
        let mock = Arc::new(MockRunner::new());
        mock.fail("get nodes", 1, "The connection to the server was refused - connection refused");
        let client = cli_client(mock);
        let err = client.wait_for_node_ready().await.unwrap_err();
        assert!(matches!(err, Error::ClusterUnreachable(_)));
    }
}
