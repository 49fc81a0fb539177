//! Reactive diagnostics collection.
//!
//! Invoked by the provisioner and the reconciler when the cluster is
//! unreachable or the CD platform does not come up. Every command is
//! best-effort; missing output renders as a short placeholder.

use std::time::Duration;
use tokio::sync::mpsc;

use crate::cluster::docker::DockerManager;
use crate::cluster::RUNTIME_PREFIX;
use crate::commands::{CommandRunner, CommandSpec};
use crate::k8s::apps::CD_NAMESPACE;
use crate::k8s::{is_pod_ready, K8sClient};
use crate::platform::{net, Platform};
use crate::ui::{emit, emit_block, OutputLine, OutputType};

const COLLECT_TIMEOUT: Duration = Duration::from_secs(20);
const PLACEHOLDER: &str = "(unavailable)";

/// Run one collection command and emit its output under a header.
async fn collect(
    runner: &dyn CommandRunner,
    header: &str,
    program: &str,
    args: &[&str],
    output_tx: &mpsc::Sender<OutputLine>,
) {
    emit(output_tx, OutputLine::info(format!("--- {} ---", header))).await;
    match runner
        .run(CommandSpec::new(program, args).with_timeout(COLLECT_TIMEOUT))
        .await
    {
        Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
            emit_block(output_tx, out.stdout.trim_end(), OutputType::Info).await;
        }
        Ok(out) => {
            let detail = out.detail();
            if detail.is_empty() {
                emit(output_tx, OutputLine::warning(PLACEHOLDER)).await;
            } else {
                emit(output_tx, OutputLine::warning(detail)).await;
            }
        }
        Err(e) => {
            emit(
                output_tx,
                OutputLine::warning(format!("{} ({})", PLACEHOLDER, e)),
            )
            .await;
        }
    }
}

/// Disk usage of the root filesystem without shelling out.
fn disk_usage_line() -> Option<String> {
    #[cfg(unix)]
    {
        let stat = nix::sys::statvfs::statvfs("/").ok()?;
        let block = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * block;
        let avail = stat.blocks_available() as u64 * block;
        let used = total.saturating_sub(avail);
        let gib = |b: u64| b as f64 / (1024.0 * 1024.0 * 1024.0);
        return Some(format!(
            "/ {:.1} GiB used of {:.1} GiB ({:.0}% free)",
            gib(used),
            gib(total),
            if total > 0 {
                avail as f64 / total as f64 * 100.0
            } else {
                0.0
            }
        ));
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Everything worth knowing when the cluster stops answering.
pub async fn report_cluster_unreachable(
    runner: &dyn CommandRunner,
    platform: Platform,
    cluster_name: &str,
    api_port: u16,
    output_tx: &mpsc::Sender<OutputLine>,
) {
    emit(
        output_tx,
        OutputLine::error(format!(
            "Cluster {} is unreachable; collecting host diagnostics",
            cluster_name
        )),
    )
    .await;

    collect(runner, "memory", "free", &["-m"], output_tx).await;

    emit(output_tx, OutputLine::info("--- disk ---")).await;
    match disk_usage_line() {
        Some(line) => emit(output_tx, OutputLine::info(line)).await,
        None => collect(runner, "disk (df)", "df", &["-h"], output_tx).await,
    }

    collect(
        runner,
        "container resource usage",
        "docker",
        &[
            "stats",
            "--no-stream",
            "--format",
            "table {{.Name}}\t{{.CPUPerc}}\t{{.MemUsage}}",
        ],
        output_tx,
    )
    .await;

    collect(runner, "container runtime info", "docker", &["info"], output_tx).await;

    collect(
        runner,
        "recent OOM events",
        "bash",
        &["-c", "dmesg 2>/dev/null | grep -i 'out of memory' | tail -n 10"],
        output_tx,
    )
    .await;

    collect(runner, "containers", "docker", &["ps", "-a"], output_tx).await;

    collect(
        runner,
        "runtime clusters",
        "k3d",
        &["cluster", "list", "-o", "json"],
        output_tx,
    )
    .await;

    emit(output_tx, OutputLine::info("--- API port probe ---")).await;
    match net::probe_tcp(
        "127.0.0.1",
        api_port,
        1,
        Duration::from_millis(100),
        Duration::from_secs(2),
    )
    .await
    {
        Ok(()) => {
            emit(
                output_tx,
                OutputLine::info(format!("127.0.0.1:{} accepts connections", api_port)),
            )
            .await
        }
        Err(_) => {
            emit(
                output_tx,
                OutputLine::warning(format!("127.0.0.1:{} refuses connections", api_port)),
            )
            .await
        }
    }

    // Server container logs: daemon API where it is local, CLI otherwise
    let server_container = format!("{}-{}-server-0", RUNTIME_PREFIX, cluster_name);
    emit(
        output_tx,
        OutputLine::info(format!("--- {} logs ---", server_container)),
    )
    .await;
    if platform.is_windows() {
        collect(
            runner,
            "server logs",
            "docker",
            &["logs", "--tail", "50", &server_container],
            output_tx,
        )
        .await;
    } else {
        match DockerManager::new() {
            Ok(docker) => match docker.container_logs_tail(&server_container, 50).await {
                Ok(logs) if !logs.trim().is_empty() => {
                    emit_block(output_tx, logs.trim_end(), OutputType::Info).await
                }
                _ => emit(output_tx, OutputLine::warning(PLACEHOLDER)).await,
            },
            Err(_) => emit(output_tx, OutputLine::warning(PLACEHOLDER)).await,
        }
    }
}

/// Diagnostics for CD-controller pods that never became ready.
pub async fn report_cd_pods_unready(
    client: &K8sClient,
    runner: &dyn CommandRunner,
    output_tx: &mpsc::Sender<OutputLine>,
) {
    emit(
        output_tx,
        OutputLine::error("CD platform did not become ready; collecting diagnostics"),
    )
    .await;

    collect(
        runner,
        "helm release",
        "helm",
        &["status", "argocd", "-n", CD_NAMESPACE],
        output_tx,
    )
    .await;

    collect(
        runner,
        "deployments",
        "kubectl",
        &["-n", CD_NAMESPACE, "get", "deployments"],
        output_tx,
    )
    .await;

    collect(
        runner,
        "pods",
        "kubectl",
        &["-n", CD_NAMESPACE, "get", "pods", "-o", "wide"],
        output_tx,
    )
    .await;

    let pods = match client.list_pods(CD_NAMESPACE, None).await {
        Ok(pods) => pods,
        Err(e) => {
            emit(
                output_tx,
                OutputLine::warning(format!("pod details: {} ({})", PLACEHOLDER, e)),
            )
            .await;
            return;
        }
    };

    for pod in pods.iter().filter(|p| !is_pod_ready(p)) {
        let name = pod.metadata.name.as_deref().unwrap_or("?");
        let status = pod.status.as_ref();

        let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("Unknown");
        emit(
            output_tx,
            OutputLine::warning(format!("pod {} is {}", name, phase)),
        )
        .await;

        if let Some(conditions) = status.and_then(|s| s.conditions.as_ref()) {
            for cond in conditions {
                if cond.status != "True" {
                    emit(
                        output_tx,
                        OutputLine::warning(format!(
                            "  condition {}={} ({})",
                            cond.type_,
                            cond.status,
                            cond.reason.as_deref().unwrap_or("-")
                        )),
                    )
                    .await;
                }
            }
        }

        if let Some(containers) = status.and_then(|s| s.container_statuses.as_ref()) {
            for cs in containers {
                let state = cs
                    .state
                    .as_ref()
                    .map(|s| {
                        if let Some(w) = &s.waiting {
                            format!("waiting ({})", w.reason.as_deref().unwrap_or("-"))
                        } else if let Some(t) = &s.terminated {
                            format!("terminated (exit {})", t.exit_code)
                        } else {
                            "running".to_string()
                        }
                    })
                    .unwrap_or_else(|| "unknown".to_string());
                emit(
                    output_tx,
                    OutputLine::warning(format!(
                        "  container {}: {} restarts, {}",
                        cs.name, cs.restart_count, state
                    )),
                )
                .await;
            }
        }

        if let Ok(events) = client.pod_events(CD_NAMESPACE, name).await {
            for event in events.iter().rev().take(5).rev() {
                emit(
                    output_tx,
                    OutputLine::info(format!(
                        "  event {}: {}",
                        event.reason.as_deref().unwrap_or("-"),
                        event.message.as_deref().unwrap_or("-")
                    )),
                )
                .await;
            }
        }

        if let Ok(logs) = client.pod_logs_tail(CD_NAMESPACE, name, None, 10).await {
            if !logs.trim().is_empty() {
                emit_block(output_tx, logs.trim_end(), OutputType::Info).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::MockRunner;
    use crate::config::Timeouts;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cluster_unreachable_is_best_effort() {
        let mock = MockRunner::new();
        mock.fail("docker info", 1, "Cannot connect to the Docker daemon");

        let (tx, mut rx) = mpsc::channel(1024);
        report_cluster_unreachable(&mock, Platform::Windows, "dev", 6550, &tx).await;
        drop(tx);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line.content);
        }
        // A failed collector renders its stderr, not a crash
        assert!(lines.iter().any(|l| l.contains("Cannot connect")));
        // The probe section always renders
        assert!(lines.iter().any(|l| l.contains("API port probe")));
        // Windows goes through the CLI for server logs
        assert_eq!(mock.count_calls("docker logs --tail 50 k3d-dev-server-0"), 1);
    }

    #[tokio::test]
    async fn test_cd_unready_report_covers_problem_pods() {
        let mock = Arc::new(MockRunner::new());
        mock.ok(
            "get pods -o json",
            r#"{"items":[
                {"metadata":{"name":"argocd-repo-server-x"},
                 "status":{"phase":"Pending",
                   "conditions":[{"type":"PodScheduled","status":"False","reason":"Unschedulable"}],
                   "containerStatuses":[{"name":"repo-server","restartCount":2,"ready":false,
                     "image":"x","imageID":"x",
                     "state":{"waiting":{"reason":"ImagePullBackOff"}}}]}}
            ]}"#,
        );
        mock.ok("get events", r#"{"items":[{"metadata":{"name":"e1"},"reason":"FailedScheduling","message":"0/1 nodes available"}]}"#);

        let client = K8sClient::cli_only(
            Arc::clone(&mock) as Arc<dyn crate::commands::CommandRunner>,
            Platform::Linux,
            None,
            Timeouts::fast(),
        );

        let (tx, mut rx) = mpsc::channel(1024);
        report_cd_pods_unready(&client, mock.as_ref(), &tx).await;
        drop(tx);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line.content);
        }
        assert!(lines.iter().any(|l| l.contains("argocd-repo-server-x is Pending")));
        assert!(lines.iter().any(|l| l.contains("2 restarts")));
        assert!(lines.iter().any(|l| l.contains("FailedScheduling")));
    }
}
