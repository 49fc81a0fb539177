//! Network probing and host remediation.
//!
//! The remediation functions are best-effort and idempotent: each one
//! returns success when its effect is already in place, and callers log
//! and continue on failure.

use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;

use crate::commands::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};

/// DNS servers written into the subsystem, the container runtime and the
/// cluster nodes.
pub const DNS_SERVERS: &[&str] = &["8.8.8.8", "1.1.1.1", "8.8.4.4"];

/// Pause sandbox image preloaded into cluster nodes.
pub const PAUSE_IMAGE: &str = "rancher/mirrored-pause:3.6";

const REMEDIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Probe `host:port` until one TCP connect succeeds.
///
/// Each attempt is bounded by `connect_timeout`; `max_retries` is the total
/// attempt count, so zero fails immediately.
pub async fn probe_tcp(
    host: &str,
    port: u16,
    max_retries: u32,
    delay: Duration,
    connect_timeout: Duration,
) -> Result<()> {
    for attempt in 0..max_retries {
        match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => {
                tracing::debug!(host, port, attempt, error = %e, "TCP probe attempt failed")
            }
            Err(_) => tracing::debug!(host, port, attempt, "TCP probe attempt timed out"),
        }
        if attempt + 1 < max_retries {
            sleep(delay).await;
        }
    }
    Err(Error::ClusterUnreachable(format!(
        "{}:{} not reachable after {} attempts",
        host, port, max_retries
    )))
}

/// The resolv.conf document the remediation writes.
pub fn resolv_conf_content() -> String {
    let mut content = String::new();
    for server in DNS_SERVERS {
        content.push_str("nameserver ");
        content.push_str(server);
        content.push('\n');
    }
    content
}

/// Write the fixed DNS list into the subsystem's `/etc/resolv.conf` and
/// stop WSL from regenerating it.
pub async fn configure_subsystem_dns(runner: &dyn CommandRunner) -> Result<()> {
    let wanted = resolv_conf_content();

    let current = runner
        .run(
            CommandSpec::new("bash", &["-c", "cat /etc/resolv.conf 2>/dev/null"])
                .with_timeout(REMEDIATION_TIMEOUT),
        )
        .await?;

    if current.stdout.trim() != wanted.trim() {
        let script = format!("printf '{}' > /etc/resolv.conf", wanted.replace('\n', "\\n"));
        let out = runner
            .run(CommandSpec::new("bash", &["-c", &script]).with_timeout(REMEDIATION_TIMEOUT))
            .await?;
        if !out.success() {
            return Err(Error::Other(format!(
                "writing resolv.conf failed: {}",
                out.detail()
            )));
        }
    }

    // Stop wsl from regenerating the file on next boot
    let check = runner
        .run(
            CommandSpec::new(
                "bash",
                &["-c", "grep -qs generateResolvConf /etc/wsl.conf && echo present"],
            )
            .with_timeout(REMEDIATION_TIMEOUT),
        )
        .await?;
    if !check.stdout.contains("present") {
        let out = runner
            .run(
                CommandSpec::new(
                    "bash",
                    &[
                        "-c",
                        "printf '[network]\\ngenerateResolvConf = false\\n' >> /etc/wsl.conf",
                    ],
                )
                .with_timeout(REMEDIATION_TIMEOUT),
            )
            .await?;
        if !out.success() {
            return Err(Error::Other(format!(
                "updating wsl.conf failed: {}",
                out.detail()
            )));
        }
    }

    Ok(())
}

/// Add the DNS key to the daemon config if absent. Returns whether the
/// document changed. Unrelated keys are preserved.
pub fn ensure_daemon_dns(config: &mut Value) -> bool {
    if !config.is_object() {
        *config = Value::Object(serde_json::Map::new());
    }
    let map = config.as_object_mut().expect("object ensured above");
    if map.contains_key("dns") {
        return false;
    }
    map.insert(
        "dns".to_string(),
        Value::Array(DNS_SERVERS.iter().map(|s| Value::String(s.to_string())).collect()),
    );
    true
}

/// Ensure the container runtime's daemon config carries the DNS list,
/// restarting the runtime only when the config actually changed.
pub async fn configure_docker_dns(runner: &dyn CommandRunner) -> Result<()> {
    let current = runner
        .run(
            CommandSpec::new("bash", &["-c", "cat /etc/docker/daemon.json 2>/dev/null"])
                .with_timeout(REMEDIATION_TIMEOUT),
        )
        .await?;

    let mut config: Value = if current.stdout.trim().is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(&current.stdout).unwrap_or(Value::Object(serde_json::Map::new()))
    };

    if !ensure_daemon_dns(&mut config) {
        return Ok(());
    }

    let rendered = serde_json::to_string_pretty(&config)
        .map_err(|e| Error::Other(format!("serializing daemon.json: {}", e)))?;
    let script = format!(
        "mkdir -p /etc/docker && cat > /etc/docker/daemon.json <<'EOF'\n{}\nEOF",
        rendered
    );
    let out = runner
        .run(CommandSpec::new("bash", &["-c", &script]).with_timeout(REMEDIATION_TIMEOUT))
        .await?;
    if !out.success() {
        return Err(Error::Other(format!(
            "writing daemon.json failed: {}",
            out.detail()
        )));
    }

    let restart = runner
        .run(
            CommandSpec::new("bash", &["-c", "service docker restart"])
                .with_timeout(Duration::from_secs(60)),
        )
        .await?;
    if !restart.success() {
        return Err(Error::Other(format!(
            "restarting container runtime failed: {}",
            restart.detail()
        )));
    }

    Ok(())
}

/// Enable IPv4 forwarding in the subsystem.
pub async fn enable_ip_forwarding(runner: &dyn CommandRunner) -> Result<()> {
    let out = runner
        .run(
            CommandSpec::new("bash", &["-c", "sysctl -w net.ipv4.ip_forward=1"])
                .with_timeout(REMEDIATION_TIMEOUT),
        )
        .await?;
    if out.success() {
        Ok(())
    } else {
        Err(Error::Other(format!(
            "enabling ip_forward failed: {}",
            out.detail()
        )))
    }
}

/// Raise inotify limits so many-pod clusters do not exhaust watches.
pub async fn raise_inotify_limits(runner: &dyn CommandRunner) -> Result<()> {
    for setting in [
        "fs.inotify.max_user_watches=524288",
        "fs.inotify.max_user_instances=512",
    ] {
        let script = format!("sysctl -w {}", setting);
        let out = runner
            .run(CommandSpec::new("bash", &["-c", &script]).with_timeout(REMEDIATION_TIMEOUT))
            .await?;
        if !out.success() {
            return Err(Error::Other(format!(
                "sysctl {} failed: {}",
                setting,
                out.detail()
            )));
        }
    }
    Ok(())
}

/// Overwrite `/etc/resolv.conf` inside each cluster node container.
///
/// The container runtime inside the nodes is left running; restarting it
/// breaks the overlay network.
pub async fn fix_node_dns(runner: &dyn CommandRunner, nodes: &[String]) -> Result<()> {
    let content = resolv_conf_content().replace('\n', "\\n");
    for node in nodes {
        let script = format!("printf '{}' > /etc/resolv.conf", content);
        let out = runner
            .run(
                CommandSpec::new("docker", &["exec", node, "sh", "-c", &script])
                    .with_timeout(REMEDIATION_TIMEOUT),
            )
            .await?;
        if !out.success() {
            tracing::warn!(node = %node, detail = %out.detail(), "Node DNS repair failed");
        }
    }
    Ok(())
}

/// Pre-pull the pause sandbox image on the host runtime and import it
/// directly into each node's container-runtime image store.
pub async fn preload_pause_image(runner: &dyn CommandRunner, nodes: &[String]) -> Result<()> {
    let pull = runner
        .run(
            CommandSpec::new("docker", &["pull", PAUSE_IMAGE])
                .with_timeout(Duration::from_secs(120)),
        )
        .await?;
    if !pull.success() {
        return Err(Error::Other(format!(
            "pulling {} failed: {}",
            PAUSE_IMAGE,
            pull.detail()
        )));
    }

    let archive = "/tmp/k3pilot-pause.tar";
    let save = runner
        .run(
            CommandSpec::new("docker", &["save", "-o", archive, PAUSE_IMAGE])
                .with_timeout(Duration::from_secs(60)),
        )
        .await?;
    if !save.success() {
        return Err(Error::Other(format!(
            "saving {} failed: {}",
            PAUSE_IMAGE,
            save.detail()
        )));
    }

    for node in nodes {
        let copy = runner
            .run(
                CommandSpec::new("docker", &["cp", archive, &format!("{}:/tmp/pause.tar", node)])
                    .with_timeout(Duration::from_secs(60)),
            )
            .await?;
        if !copy.success() {
            tracing::warn!(node = %node, detail = %copy.detail(), "Copying pause image failed");
            continue;
        }
        let import = runner
            .run(
                CommandSpec::new(
                    "docker",
                    &[
                        "exec", node, "ctr", "--namespace", "k8s.io", "images", "import",
                        "/tmp/pause.tar",
                    ],
                )
                .with_timeout(Duration::from_secs(60)),
            )
            .await?;
        if !import.success() {
            tracing::warn!(node = %node, detail = %import.detail(), "Importing pause image failed");
        }
    }

    let _ = runner
        .run(CommandSpec::new("bash", &["-c", &format!("rm -f {}", archive)]))
        .await;

    Ok(())
}
