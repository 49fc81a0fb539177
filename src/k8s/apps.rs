//! CD-platform Application resources.
//!
//! All coupling to the CD controller (API group, namespaces, labels, the
//! refresh annotation) is concentrated here; the reconciler only sees
//! `AppStatus` values.

use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use serde_json::{json, Value};
use std::fmt;

use super::client::K8sClient;
use crate::error::{Error, Result};

/// Namespace the CD platform is installed into.
pub const CD_NAMESPACE: &str = "argocd";

pub const CD_GROUP: &str = "argoproj.io";
pub const CD_VERSION: &str = "v1alpha1";
pub const APP_KIND: &str = "Application";

/// CRD gating the whole rollout.
pub const APP_CRD_NAME: &str = "applications.argoproj.io";

/// The root of the app-of-apps hierarchy.
pub const ROOT_APP: &str = "app-of-apps";

/// Label carried by every pod of the CD platform.
pub const CD_POD_SELECTOR: &str = "app.kubernetes.io/part-of=argocd";

/// Label of the manifest-generation sub-service.
pub const REPO_SERVER_SELECTOR: &str = "app.kubernetes.io/name=argocd-repo-server";

/// Annotation that forces the controller to re-evaluate an application.
pub const REFRESH_ANNOTATION: &str = "argocd.argoproj.io/refresh";

/// Application health, normalising unknown and empty input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Missing,
    Unknown,
}

impl HealthStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Healthy" => HealthStatus::Healthy,
            "Progressing" => HealthStatus::Progressing,
            "Degraded" => HealthStatus::Degraded,
            "Missing" => HealthStatus::Missing,
            _ => HealthStatus::Unknown,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Progressing => "Progressing",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::Missing => "Missing",
            HealthStatus::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// Application sync state, normalising unknown and empty input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    Unknown,
}

impl SyncStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Synced" => SyncStatus::Synced,
            "OutOfSync" => SyncStatus::OutOfSync,
            _ => SyncStatus::Unknown,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Synced => "Synced",
            SyncStatus::OutOfSync => "OutOfSync",
            SyncStatus::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// One application as observed in a single poll. Never written back.
#[derive(Debug, Clone)]
pub struct AppStatus {
    pub name: String,
    pub health: HealthStatus,
    pub sync: SyncStatus,
    pub repo_url: String,
    pub path: String,
    pub target_revision: String,
    pub destination_namespace: String,
    pub condition_type: String,
    pub condition_message: String,
    pub operation_phase: String,
    pub operation_message: String,
    pub health_message: String,
    pub reconciled_at: String,
}

impl AppStatus {
    /// Parse from a full application object (native or CLI JSON are the
    /// same shape).
    pub fn from_json(obj: &Value) -> Self {
        let name = obj
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let spec = obj.get("spec").cloned().unwrap_or(Value::Null);
        let status = obj.get("status").cloned().unwrap_or(Value::Null);

        let str_at = |v: &Value, pointer: &str| {
            v.pointer(pointer)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        // First condition carries the most recent controller complaint
        let (condition_type, condition_message) = status
            .pointer("/conditions/0")
            .map(|c| {
                (
                    c.get("type")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    c.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                )
            })
            .unwrap_or_default();

        Self {
            name,
            health: HealthStatus::parse(&str_at(&status, "/health/status")),
            sync: SyncStatus::parse(&str_at(&status, "/sync/status")),
            repo_url: str_at(&spec, "/source/repoURL"),
            path: str_at(&spec, "/source/path"),
            target_revision: str_at(&spec, "/source/targetRevision"),
            destination_namespace: str_at(&spec, "/destination/namespace"),
            condition_type,
            condition_message,
            operation_phase: str_at(&status, "/operationState/phase"),
            operation_message: str_at(&status, "/operationState/message"),
            health_message: str_at(&status, "/health/message"),
            reconciled_at: str_at(&status, "/reconciledAt"),
        }
    }

    /// Ready means Healthy and Synced at the same time.
    pub fn is_ready(&self) -> bool {
        self.health == HealthStatus::Healthy && self.sync == SyncStatus::Synced
    }

    /// Short tag for progress lines, e.g. `guestbook (Progressing/OutOfSync)`.
    pub fn short_status(&self) -> String {
        format!("{}/{}", self.health, self.sync)
    }

    /// Whether health or sync is unknown (stuck-diagnostics trigger).
    pub fn is_unknown(&self) -> bool {
        self.health == HealthStatus::Unknown || self.sync == SyncStatus::Unknown
    }
}

/// Count `kind: Application` entries in an application's status.resources.
pub fn count_child_applications(app: &Value) -> usize {
    app.pointer("/status/resources")
        .and_then(Value::as_array)
        .map(|resources| {
            resources
                .iter()
                .filter(|r| r.get("kind").and_then(Value::as_str) == Some(APP_KIND))
                .count()
        })
        .unwrap_or(0)
}

fn application_api(client: &kube::Client, namespace: &str) -> Api<DynamicObject> {
    let gvk = GroupVersionKind::gvk(CD_GROUP, CD_VERSION, APP_KIND);
    let ar = ApiResource::from_gvk(&gvk);
    Api::namespaced_with(client.clone(), namespace, &ar)
}

impl K8sClient {
    /// All applications in the namespace as raw JSON objects.
    pub async fn list_applications_json(&self, namespace: &str) -> Result<Vec<Value>> {
        if self.use_cli() {
            let out = self
                .kubectl(&["-n", namespace, "get", "applications.argoproj.io", "-o", "json"])
                .await?;
            if !out.success() {
                return Err(Error::Other(out.detail()));
            }
            let value: Value = serde_json::from_str(&out.stdout)
                .map_err(|e| Error::Other(format!("parsing application list: {}", e)))?;
            return Ok(value
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default());
        }

        let api = application_api(self.native()?, namespace);
        let list = api.list(&ListParams::default()).await?;
        list.items
            .iter()
            .map(|obj| {
                serde_json::to_value(obj)
                    .map_err(|e| Error::Other(format!("serializing application: {}", e)))
            })
            .collect()
    }

    /// All applications as typed records.
    pub async fn list_applications(&self, namespace: &str) -> Result<Vec<AppStatus>> {
        Ok(self
            .list_applications_json(namespace)
            .await?
            .iter()
            .map(AppStatus::from_json)
            .collect())
    }

    /// One application as raw JSON, or None when it does not exist.
    pub async fn get_application_json(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        if self.use_cli() {
            let out = self
                .kubectl(&[
                    "-n", namespace, "get", "applications.argoproj.io", name, "-o", "json",
                ])
                .await?;
            if !out.success() {
                if out.stderr.contains("NotFound") || out.stderr.contains("not found") {
                    return Ok(None);
                }
                return Err(Error::Other(out.detail()));
            }
            let value: Value = serde_json::from_str(&out.stdout)
                .map_err(|e| Error::Other(format!("parsing application: {}", e)))?;
            return Ok(Some(value));
        }

        let api = application_api(self.native()?, namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(serde_json::to_value(&obj).map_err(|e| {
                Error::Other(format!("serializing application: {}", e))
            })?)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Count the children the root app-of-apps is expected to produce,
    /// via the jsonpath shortcut where quoting is safe and full JSON
    /// elsewhere.
    pub async fn count_root_children_cli(&self, namespace: &str) -> Result<usize> {
        // jsonpath quoting is brittle through the subsystem wrapper
        if self.platform().is_windows() {
            return Ok(self
                .get_application_json(namespace, ROOT_APP)
                .await?
                .map(|app| count_child_applications(&app))
                .unwrap_or(0));
        }

        let jsonpath = format!(
            "jsonpath={{.status.resources[?(@.kind==\"{}\")].name}}",
            APP_KIND
        );
        let out = self
            .kubectl(&[
                "-n", namespace, "get", "application", ROOT_APP, "-o", &jsonpath,
            ])
            .await?;
        if !out.success() {
            return Err(Error::Other(out.detail()));
        }
        Ok(out.stdout.split_whitespace().count())
    }

    /// Merge-patch an annotation onto an application.
    pub async fn annotate_application(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        if self.use_cli() {
            let pair = format!("{}={}", key, value);
            let out = self
                .kubectl(&[
                    "-n",
                    namespace,
                    "annotate",
                    "applications.argoproj.io",
                    name,
                    &pair,
                    "--overwrite",
                ])
                .await?;
            if !out.success() {
                return Err(Error::Other(out.detail()));
            }
            return Ok(());
        }

        let api = application_api(self.native()?, namespace);
        let patch = json!({
            "metadata": {
                "annotations": { key: value }
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_json(name: &str, health: &str, sync: &str, condition: Option<&str>) -> Value {
        let mut obj = json!({
            "metadata": {"name": name},
            "spec": {
                "source": {
                    "repoURL": "https://git.example.com/platform.git",
                    "path": format!("apps/{}", name),
                    "targetRevision": "main"
                },
                "destination": {"namespace": name}
            },
            "status": {
                "health": {"status": health},
                "sync": {"status": sync},
                "reconciledAt": "2024-05-01T10:00:00Z"
            }
        });
        if let Some(message) = condition {
            obj["status"]["conditions"] = json!([{
                "type": "ComparisonError",
                "message": message
            }]);
        }
        obj
    }

    #[test]
    fn test_status_parsing() {
        let app = AppStatus::from_json(&app_json("guestbook", "Healthy", "Synced", None));
        assert_eq!(app.name, "guestbook");
        assert_eq!(app.health, HealthStatus::Healthy);
        assert_eq!(app.sync, SyncStatus::Synced);
        assert!(app.is_ready());
        assert_eq!(app.repo_url, "https://git.example.com/platform.git");
        assert_eq!(app.path, "apps/guestbook");
        assert_eq!(app.target_revision, "main");
        assert_eq!(app.destination_namespace, "guestbook");
        assert_eq!(app.reconciled_at, "2024-05-01T10:00:00Z");
    }

    #[test]
    fn test_empty_fields_normalise_to_unknown() {
        let app = AppStatus::from_json(&json!({"metadata": {"name": "bare"}}));
        assert_eq!(app.health, HealthStatus::Unknown);
        assert_eq!(app.sync, SyncStatus::Unknown);
        assert!(!app.is_ready());
        assert!(app.is_unknown());
        assert_eq!(app.short_status(), "Unknown/Unknown");
    }

    #[test]
    fn test_health_sync_domains() {
        for raw in ["Healthy", "Progressing", "Degraded", "Missing", "", "bogus"] {
            let parsed = HealthStatus::parse(raw);
            assert!(matches!(
                parsed,
                HealthStatus::Healthy
                    | HealthStatus::Progressing
                    | HealthStatus::Degraded
                    | HealthStatus::Missing
                    | HealthStatus::Unknown
            ));
        }
        assert_eq!(SyncStatus::parse(""), SyncStatus::Unknown);
        assert_eq!(SyncStatus::parse("OutOfSync"), SyncStatus::OutOfSync);
    }

    #[test]
    fn test_condition_extraction() {
        let app = AppStatus::from_json(&app_json(
            "broken",
            "Unknown",
            "Unknown",
            Some("failed to generate manifest: EOF"),
        ));
        assert_eq!(app.condition_type, "ComparisonError");
        assert!(app.condition_message.contains("EOF"));
    }

    mod native {
        use super::super::*;
        use crate::commands::testing::MockRunner;
        use crate::config::Timeouts;
        use crate::platform::Platform;
        use http::{Request, Response};
        use kube::client::Body;
        use kube::Client;
        use std::sync::Arc;
        use tower_test::mock;

        fn native_client(
            mock_service: mock::Mock<Request<Body>, Response<Body>>,
        ) -> K8sClient {
            K8sClient::with_native(
                Client::new(mock_service, CD_NAMESPACE),
                Arc::new(MockRunner::new()),
                Platform::Linux,
                None,
                Timeouts::fast(),
            )
        }

        #[tokio::test]
        async fn test_root_children_counted_from_status_resources() {
            let (mock_service, mut handle) =
                mock::pair::<Request<Body>, Response<Body>>();

            let responder = tokio::spawn(async move {
                let (request, send) = handle.next_request().await.expect("no API call");
                assert_eq!(request.method(), http::Method::GET);
                assert_eq!(
                    request.uri().path(),
                    "/apis/argoproj.io/v1alpha1/namespaces/argocd/applications/app-of-apps"
                );
                let body = serde_json::json!({
                    "apiVersion": "argoproj.io/v1alpha1",
                    "kind": "Application",
                    "metadata": {"name": "app-of-apps", "namespace": "argocd"},
                    "status": {"resources": [
                        {"kind": "Application", "name": "infra"},
                        {"kind": "Application", "name": "platform"},
                        {"kind": "Application", "name": "apps"},
                        {"kind": "AppProject", "name": "default"}
                    ]}
                });
                send.send_response(
                    Response::builder()
                        .status(200)
                        .header("content-type", "application/json")
                        .body(Body::from(serde_json::to_vec(&body).unwrap()))
                        .unwrap(),
                );
            });

            let client = native_client(mock_service);
            let app = client
                .get_application_json(CD_NAMESPACE, ROOT_APP)
                .await
                .unwrap()
                .expect("root application exists");
            assert_eq!(count_child_applications(&app), 3);

            responder.await.unwrap();
        }

        #[tokio::test]
        async fn test_native_list_yields_typed_records() {
            let (mock_service, mut handle) =
                mock::pair::<Request<Body>, Response<Body>>();

            let responder = tokio::spawn(async move {
                let (request, send) = handle.next_request().await.expect("no API call");
                assert_eq!(
                    request.uri().path(),
                    "/apis/argoproj.io/v1alpha1/namespaces/argocd/applications"
                );
                let body = serde_json::json!({
                    "apiVersion": "argoproj.io/v1alpha1",
                    "kind": "ApplicationList",
                    "metadata": {"resourceVersion": "1"},
                    "items": [{
                        "apiVersion": "argoproj.io/v1alpha1",
                        "kind": "Application",
                        "metadata": {"name": "guestbook", "namespace": "argocd"},
                        "status": {
                            "health": {"status": "Progressing"},
                            "sync": {"status": "OutOfSync"}
                        }
                    }]
                });
                send.send_response(
                    Response::builder()
                        .status(200)
                        .header("content-type", "application/json")
                        .body(Body::from(serde_json::to_vec(&body).unwrap()))
                        .unwrap(),
                );
            });

            let client = native_client(mock_service);
            let apps = client.list_applications(CD_NAMESPACE).await.unwrap();
            assert_eq!(apps.len(), 1);
            assert_eq!(apps[0].name, "guestbook");
            assert_eq!(apps[0].health, HealthStatus::Progressing);
            assert_eq!(apps[0].sync, SyncStatus::OutOfSync);
            assert!(!apps[0].is_ready());

            responder.await.unwrap();
        }

        #[tokio::test]
        async fn test_native_404_is_none() {
            let (mock_service, mut handle) =
                mock::pair::<Request<Body>, Response<Body>>();

            let responder = tokio::spawn(async move {
                let (_, send) = handle.next_request().await.expect("no API call");
                let body = serde_json::json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "status": "Failure",
                    "message": "applications.argoproj.io \"app-of-apps\" not found",
                    "reason": "NotFound",
                    "code": 404
                });
                send.send_response(
                    Response::builder()
                        .status(404)
                        .header("content-type", "application/json")
                        .body(Body::from(serde_json::to_vec(&body).unwrap()))
                        .unwrap(),
                );
            });

            let client = native_client(mock_service);
            let app = client
                .get_application_json(CD_NAMESPACE, ROOT_APP)
                .await
                .unwrap();
            assert!(app.is_none());

            responder.await.unwrap();
        }
    }

    #[test]
    fn test_count_child_applications() {
        let root = json!({
            "status": {
                "resources": [
                    {"kind": "Application", "name": "a"},
                    {"kind": "Application", "name": "b"},
                    {"kind": "AppProject", "name": "default"},
                    {"kind": "Application", "name": "c"}
                ]
            }
        });
        assert_eq!(count_child_applications(&root), 3);
        assert_eq!(count_child_applications(&json!({})), 0);
        assert_eq!(count_child_applications(&json!({"status": {"resources": []}})), 0);
    }
}
