//! Diagnostics for applications stuck in Unknown health or sync.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::commands::{CommandRunner, CommandSpec};
use crate::k8s::apps::{AppStatus, CD_NAMESPACE, REPO_SERVER_SELECTOR};
use crate::k8s::{is_pod_ready, K8sClient};
use crate::ui::{emit, emit_block, OutputLine, OutputType};

static ERROR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)error|failed|fatal|panic").expect("invalid ERROR_LINE pattern"));

static GIT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)git|clone|fetch").expect("invalid GIT_LINE pattern"));

const CONTROLLER_SELECTOR: &str = "app.kubernetes.io/name=argocd-application-controller";

/// Lines that look like controller errors.
pub fn error_like_lines(log: &str) -> Vec<&str> {
    log.lines().filter(|l| ERROR_LINE.is_match(l)).collect()
}

/// Lines related to git operations.
pub fn git_related_lines(log: &str) -> Vec<&str> {
    log.lines().filter(|l| GIT_LINE.is_match(l)).collect()
}

/// Emit the per-application fields already present in the poll response.
pub async fn report_stuck_fields(apps: &[AppStatus], output_tx: &mpsc::Sender<OutputLine>) {
    for app in apps.iter().filter(|a| a.is_unknown()) {
        emit(
            output_tx,
            OutputLine::warning(format!(
                "{} stuck at {} (reconciled {})",
                app.name,
                app.short_status(),
                if app.reconciled_at.is_empty() {
                    "never"
                } else {
                    app.reconciled_at.as_str()
                },
            )),
        )
        .await;
        if !app.condition_message.is_empty() {
            emit(
                output_tx,
                OutputLine::warning(format!(
                    "  condition {}: {}",
                    app.condition_type, app.condition_message
                )),
            )
            .await;
        }
        if !app.operation_phase.is_empty() {
            emit(
                output_tx,
                OutputLine::warning(format!(
                    "  operation {}: {}",
                    app.operation_phase, app.operation_message
                )),
            )
            .await;
        }
        if !app.health_message.is_empty() {
            emit(
                output_tx,
                OutputLine::warning(format!("  health: {}", app.health_message)),
            )
            .await;
        }
        if !app.repo_url.is_empty() {
            emit(
                output_tx,
                OutputLine::warning(format!(
                    "  source: {} path={} rev={}",
                    app.repo_url, app.path, app.target_revision
                )),
            )
            .await;
        }
    }
}

/// The deep dump: controller pod status, filtered logs from the controller
/// and the repo-server, and an in-cluster connectivity test.
pub async fn deep_dump(
    client: &K8sClient,
    runner: &dyn CommandRunner,
    context: Option<&str>,
    output_tx: &mpsc::Sender<OutputLine>,
) {
    emit(
        output_tx,
        OutputLine::info("Collecting CD-controller diagnostics..."),
    )
    .await;

    match client.list_pods(CD_NAMESPACE, Some(CONTROLLER_SELECTOR)).await {
        Ok(pods) => {
            for pod in &pods {
                let name = pod.metadata.name.as_deref().unwrap_or("?");
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .unwrap_or("Unknown");
                emit(
                    output_tx,
                    OutputLine::info(format!(
                        "controller pod {}: {} (ready: {})",
                        name,
                        phase,
                        is_pod_ready(pod)
                    )),
                )
                .await;

                if let Ok(log) = client.pod_logs_tail(CD_NAMESPACE, name, None, 100).await {
                    for line in error_like_lines(&log).iter().rev().take(10).rev() {
                        emit(output_tx, OutputLine::warning(format!("  {}", line))).await;
                    }
                }
            }
        }
        Err(e) => {
            emit(
                output_tx,
                OutputLine::warning(format!("controller pods: (unavailable: {})", e)),
            )
            .await
        }
    }

    if let Ok(pods) = client.list_pods(CD_NAMESPACE, Some(REPO_SERVER_SELECTOR)).await {
        for pod in &pods {
            let name = pod.metadata.name.as_deref().unwrap_or("?");
            if let Ok(log) = client.pod_logs_tail(CD_NAMESPACE, name, None, 100).await {
                let lines = git_related_lines(&log);
                if !lines.is_empty() {
                    emit(
                        output_tx,
                        OutputLine::info(format!("repo-server {} git activity:", name)),
                    )
                    .await;
                    for line in lines.iter().rev().take(10).rev() {
                        emit(output_tx, OutputLine::info(format!("  {}", line))).await;
                    }
                }
            }
        }
    }

    net_test(runner, context, output_tx).await;
}

/// One-shot ephemeral pod testing cluster-to-internet reachability.
async fn net_test(
    runner: &dyn CommandRunner,
    context: Option<&str>,
    output_tx: &mpsc::Sender<OutputLine>,
) {
    let pod_name = format!("net-test-{}", chrono::Utc::now().timestamp());
    let mut args: Vec<String> = Vec::new();
    if let Some(ctx) = context {
        args.push("--context".to_string());
        args.push(ctx.to_string());
    }
    args.extend(
        [
            "run",
            pod_name.as_str(),
            "--rm",
            "--restart=Never",
            "--image=busybox",
            "--",
            "wget",
            "-q",
            "-T",
            "10",
            "-O",
            "-",
            "https://github.com",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    match runner
        .run(CommandSpec::new("kubectl", &arg_refs).with_timeout(Duration::from_secs(60)))
        .await
    {
        Ok(out) if out.success() => {
            emit(
                output_tx,
                OutputLine::info("cluster-to-internet connectivity: ok"),
            )
            .await
        }
        Ok(out) => {
            emit(
                output_tx,
                OutputLine::warning(format!(
                    "cluster-to-internet connectivity failed: {}",
                    out.detail()
                )),
            )
            .await
        }
        Err(e) => {
            emit(
                output_tx,
                OutputLine::warning(format!("cluster-to-internet test failed to run: {}", e)),
            )
            .await
        }
    }
}

/// Problems in a namespace's workload pods.
#[derive(Debug, Default)]
pub struct PodProblems {
    pub not_running: Vec<String>,
    pub restarted: Vec<(String, i32)>,
    pub init_pending: Vec<String>,
}

/// Classify non-Running pods, restart loops, and pods held by their init
/// containers.
pub fn classify_pod_problems(pods: &[Pod]) -> PodProblems {
    let mut problems = PodProblems::default();

    for pod in pods {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let status = match &pod.status {
            Some(s) => s,
            None => continue,
        };
        let phase = status.phase.as_deref().unwrap_or("");

        if phase != "Running" && phase != "Succeeded" {
            problems.not_running.push(name.clone());
        }

        let restarts: i32 = status
            .container_statuses
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|cs| cs.restart_count)
            .sum();
        if restarts > 0 {
            problems.restarted.push((name.clone(), restarts));
        }

        let init_pending = status
            .init_container_statuses
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .any(|cs| {
                cs.state
                    .as_ref()
                    .map(|s| s.waiting.is_some() || s.running.is_some())
                    .unwrap_or(false)
            });
        if init_pending {
            problems.init_pending.push(name);
        }
    }

    problems
}

/// A workload whose observed pods fall short of its declared replicas.
#[derive(Debug, PartialEq)]
pub struct MissingWorkload {
    pub kind: &'static str,
    pub name: String,
    pub expected: i32,
    pub observed: usize,
}

/// Reconcile declared replica counts against observed pods by owner-name
/// prefix.
pub fn missing_replicas(
    deployments: &[Deployment],
    statefulsets: &[StatefulSet],
    pods: &[Pod],
) -> Vec<MissingWorkload> {
    let pod_names: Vec<&str> = pods
        .iter()
        .filter_map(|p| p.metadata.name.as_deref())
        .collect();

    let mut missing = Vec::new();

    for deploy in deployments {
        let name = match deploy.metadata.name.as_deref() {
            Some(n) => n,
            None => continue,
        };
        let expected = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let observed = pod_names
            .iter()
            .filter(|p| p.starts_with(&format!("{}-", name)))
            .count();
        if (observed as i32) < expected {
            missing.push(MissingWorkload {
                kind: "Deployment",
                name: name.to_string(),
                expected,
                observed,
            });
        }
    }

    for sts in statefulsets {
        let name = match sts.metadata.name.as_deref() {
            Some(n) => n,
            None => continue,
        };
        let expected = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let observed = pod_names
            .iter()
            .filter(|p| p.starts_with(&format!("{}-", name)))
            .count();
        if (observed as i32) < expected {
            missing.push(MissingWorkload {
                kind: "StatefulSet",
                name: name.to_string(),
                expected,
                observed,
            });
        }
    }

    missing
}

/// PVCs belonging to a stateful set that are not Bound.
pub fn unbound_pvcs_for<'a>(
    sts_name: &str,
    pvcs: &'a [PersistentVolumeClaim],
) -> Vec<(&'a str, &'a str)> {
    pvcs.iter()
        .filter_map(|pvc| {
            let name = pvc.metadata.name.as_deref()?;
            if !name.contains(sts_name) {
                return None;
            }
            let phase = pvc
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or("Unknown");
            if phase == "Bound" {
                None
            } else {
                Some((name, phase))
            }
        })
        .collect()
}

/// Scan each stuck application's destination namespace for workload-level
/// problems and emit a concise summary.
pub async fn workload_scan(
    client: &K8sClient,
    apps: &[AppStatus],
    output_tx: &mpsc::Sender<OutputLine>,
) {
    let namespaces: BTreeSet<&str> = apps
        .iter()
        .filter(|a| a.is_unknown())
        .map(|a| a.destination_namespace.as_str())
        .filter(|ns| !ns.is_empty())
        .collect();

    for ns in namespaces {
        let pods = match client.list_pods(ns, None).await {
            Ok(p) => p,
            Err(e) => {
                emit(
                    output_tx,
                    OutputLine::warning(format!("namespace {}: pods unavailable ({})", ns, e)),
                )
                .await;
                continue;
            }
        };
        let deployments = client.list_deployments(ns).await.unwrap_or_default();
        let statefulsets = client.list_statefulsets(ns).await.unwrap_or_default();
        let pvcs = client.list_pvcs(ns).await.unwrap_or_default();

        let problems = classify_pod_problems(&pods);
        let missing = missing_replicas(&deployments, &statefulsets, &pods);

        if problems.not_running.is_empty()
            && problems.restarted.is_empty()
            && problems.init_pending.is_empty()
            && missing.is_empty()
        {
            continue;
        }

        let mut summary = format!("namespace {}:\n", ns);
        if !problems.not_running.is_empty() {
            summary.push_str(&format!(
                "  not running: {}\n",
                problems.not_running.join(", ")
            ));
        }
        if !problems.restarted.is_empty() {
            let list: Vec<String> = problems
                .restarted
                .iter()
                .map(|(n, c)| format!("{} ({}x)", n, c))
                .collect();
            summary.push_str(&format!("  restarting: {}\n", list.join(", ")));
        }
        if !problems.init_pending.is_empty() {
            summary.push_str(&format!(
                "  waiting on init: {}\n",
                problems.init_pending.join(", ")
            ));
        }
        for m in &missing {
            summary.push_str(&format!(
                "  {} {} has {}/{} pods\n",
                m.kind, m.name, m.observed, m.expected
            ));
            if m.kind == "StatefulSet" {
                for (pvc, phase) in unbound_pvcs_for(&m.name, &pvcs) {
                    summary.push_str(&format!("    pvc {} is {}\n", pvc, phase));
                }
            }
        }

        emit_block(output_tx, &summary, OutputType::Warning).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, StatefulSetSpec};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus,
        PersistentVolumeClaimStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn named(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: named(name),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_log_filters() {
        let log = "time=1 level=info msg=\"reconciled\"\n\
                   time=2 level=error msg=\"rpc failed\"\n\
                   time=3 msg=\"cloning repo\"\n\
                   time=4 msg=\"fetch origin\"";
        assert_eq!(error_like_lines(log).len(), 2);
        assert_eq!(git_related_lines(log).len(), 2);
    }

    #[test]
    fn test_classify_pod_problems() {
        let mut crash = pod("worker-1", "Running");
        crash.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            name: "main".to_string(),
            restart_count: 3,
            ..Default::default()
        }]);

        let mut init = pod("db-0", "Pending");
        init.status.as_mut().unwrap().init_container_statuses = Some(vec![ContainerStatus {
            name: "init-schema".to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting::default()),
                ..Default::default()
            }),
            ..Default::default()
        }]);

        let pods = vec![pod("ok-1", "Running"), crash, init, pod("job-1", "Succeeded")];
        let problems = classify_pod_problems(&pods);

        assert_eq!(problems.not_running, vec!["db-0"]);
        assert_eq!(problems.restarted, vec![("worker-1".to_string(), 3)]);
        assert_eq!(problems.init_pending, vec!["db-0"]);
    }

    #[test]
    fn test_missing_replicas() {
        let deploy = Deployment {
            metadata: named("web"),
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        let sts = StatefulSet {
            metadata: named("db"),
            spec: Some(StatefulSetSpec {
                replicas: Some(3),
                ..Default::default()
            }),
            ..Default::default()
        };
        let pods = vec![
            pod("web-7f9-a", "Running"),
            pod("web-7f9-b", "Running"),
            pod("db-0", "Running"),
        ];

        let missing = missing_replicas(&[deploy], &[sts], &pods);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].kind, "StatefulSet");
        assert_eq!(missing[0].name, "db");
        assert_eq!(missing[0].expected, 3);
        assert_eq!(missing[0].observed, 1);
    }

    #[test]
    fn test_unbound_pvcs() {
        let pvc = |name: &str, phase: &str| PersistentVolumeClaim {
            metadata: named(name),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let pvcs = vec![
            pvc("data-db-0", "Bound"),
            pvc("data-db-1", "Pending"),
            pvc("cache-web-0", "Pending"),
        ];
        let unbound = unbound_pvcs_for("db", &pvcs);
        assert_eq!(unbound, vec![("data-db-1", "Pending")]);
    }
}
