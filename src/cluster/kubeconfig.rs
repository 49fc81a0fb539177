//! Kubeconfig reconciliation after cluster creation.
//!
//! The runtime CLI writes the kubeconfig itself; this module fixes what it
//! leaves behind: stale lock files, ownership under elevation, and (on
//! Windows) API server addresses that are only valid inside the subsystem.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

use crate::commands::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use crate::platform::Platform;

static SERVER_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(\s*server:\s*https?://)([^:/\s]+)(:\d+)?")
        .expect("invalid SERVER_LINE pattern")
});

const FILE_OP_TIMEOUT: Duration = Duration::from_secs(15);

/// Kubeconfig location: `$KUBECONFIG` if set, else `~/.kube/config`.
pub fn kubeconfig_path() -> PathBuf {
    if let Ok(path) = std::env::var("KUBECONFIG") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kube")
        .join("config")
}

/// Rewrite every `server:` URL to loopback, keeping the port.
/// Running it twice is a no-op.
pub fn rewrite_servers_to_loopback(content: &str) -> String {
    SERVER_LINE
        .replace_all(content, |caps: &regex::Captures| {
            let port = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            format!("{}127.0.0.1{}", &caps[1], port)
        })
        .to_string()
}

/// Ensure `~/.kube` exists (in the subsystem user's home on Windows) and
/// drop stale lock files left by interrupted CLI runs.
pub async fn prepare_kube_dir(runner: &dyn CommandRunner, platform: Platform) -> Result<()> {
    if platform.is_windows() {
        let out = runner
            .run(
                CommandSpec::new("bash", &["-c", "mkdir -p ~/.kube && rm -f ~/.kube/config.lock"])
                    .with_timeout(FILE_OP_TIMEOUT),
            )
            .await?;
        if !out.success() {
            return Err(Error::Other(format!(
                "preparing ~/.kube failed: {}",
                out.detail()
            )));
        }
        return Ok(());
    }

    let dir = kubeconfig_path()
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&dir).await?;
    clear_lock_files(&dir).await;
    Ok(())
}

/// Remove `*.lock` companions next to the kubeconfig. Best-effort.
pub async fn clear_lock_files(dir: &PathBuf) {
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".lock") {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}

/// Fix kubeconfig ownership and permissions after the runtime CLI wrote it.
///
/// Under elevation on Windows the file lands owned by root inside the
/// subsystem; hand it back to the subsystem user. Everywhere the file gets
/// 0600 and the directory 0755.
pub async fn fix_permissions(
    runner: &dyn CommandRunner,
    platform: Platform,
    subsystem_user: Option<&str>,
) -> Result<()> {
    if platform.is_windows() {
        let user = subsystem_user.unwrap_or("root");
        let script = format!(
            "chown -R {user}:{user} /home/{user}/.kube 2>/dev/null; \
             chmod 700 /home/{user}/.kube 2>/dev/null; \
             chmod 600 /home/{user}/.kube/config 2>/dev/null; \
             rm -f /home/{user}/.kube/config.lock",
            user = user
        );
        let out = runner
            .run(
                CommandSpec::new("wsl", &["-u", "root", "--", "bash", "-c", &script])
                    .with_timeout(FILE_OP_TIMEOUT),
            )
            .await?;
        if !out.success() {
            return Err(Error::Other(format!(
                "fixing kubeconfig ownership failed: {}",
                out.detail()
            )));
        }
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let path = kubeconfig_path();
        if let Ok(metadata) = tokio::fs::metadata(&path).await {
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            let _ = tokio::fs::set_permissions(&path, perms).await;
        }
        if let Some(dir) = path.parent() {
            if let Ok(metadata) = tokio::fs::metadata(dir).await {
                let mut perms = metadata.permissions();
                perms.set_mode(0o755);
                let _ = tokio::fs::set_permissions(dir, perms).await;
            }
            clear_lock_files(&dir.to_path_buf()).await;
        }
    }

    Ok(())
}

/// Point the on-disk kubeconfig's current-context at the cluster.
///
/// The runtime CLI normally switches the context itself; replaying the
/// switch covers kubeconfigs it did not touch. No-op when already set.
pub async fn persist_current_context(context: &str) -> Result<()> {
    let path = kubeconfig_path();
    let raw = tokio::fs::read_to_string(&path).await?;
    let mut doc: serde_yml::Value = serde_yml::from_str(&raw)
        .map_err(|e| Error::Other(format!("parsing kubeconfig: {}", e)))?;

    if doc.get("current-context").and_then(|v| v.as_str()) == Some(context) {
        return Ok(());
    }

    if let serde_yml::Value::Mapping(map) = &mut doc {
        map.insert(
            serde_yml::Value::String("current-context".to_string()),
            serde_yml::Value::String(context.to_string()),
        );
    }

    let rendered = serde_yml::to_string(&doc)
        .map_err(|e| Error::Other(format!("serializing kubeconfig: {}", e)))?;
    tokio::fs::write(&path, rendered).await?;
    Ok(())
}

/// Rewrite every server URL in the subsystem's kubeconfig to loopback.
///
/// The subsystem shares the loopback namespace with the container runtime,
/// so `127.0.0.1:<apiPort>` is always the right address from inside it.
pub async fn rewrite_subsystem_kubeconfig(runner: &dyn CommandRunner) -> Result<()> {
    let current = runner
        .run(
            CommandSpec::new("bash", &["-c", "cat ~/.kube/config"])
                .with_timeout(FILE_OP_TIMEOUT),
        )
        .await?;
    if !current.success() {
        return Err(Error::Other(format!(
            "reading subsystem kubeconfig failed: {}",
            current.detail()
        )));
    }

    let rewritten = rewrite_servers_to_loopback(&current.stdout);
    if rewritten == current.stdout {
        return Ok(());
    }

    let script = format!(
        "cat > ~/.kube/config <<'EOF'\n{}\nEOF",
        rewritten.trim_end()
    );
    let out = runner
        .run(CommandSpec::new("bash", &["-c", &script]).with_timeout(FILE_OP_TIMEOUT))
        .await?;
    if !out.success() {
        return Err(Error::Other(format!(
            "writing subsystem kubeconfig failed: {}",
            out.detail()
        )));
    }
    Ok(())
}

/// Serializes tests that touch the KUBECONFIG environment variable.
#[cfg(test)]
pub(crate) fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = "\
apiVersion: v1
clusters:
- cluster:
    server: https://host.docker.internal:6550
  name: k3d-dev
- cluster:
    server: https://172.20.240.10:6550
  name: k3d-other
contexts: []
";

    #[test]
    fn test_rewrite_to_loopback() {
        let rewritten = rewrite_servers_to_loopback(KUBECONFIG);
        assert!(rewritten.contains("server: https://127.0.0.1:6550"));
        assert!(!rewritten.contains("host.docker.internal"));
        assert!(!rewritten.contains("172.20.240.10"));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let once = rewrite_servers_to_loopback(KUBECONFIG);
        let twice = rewrite_servers_to_loopback(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rewrite_preserves_port() {
        let content = "    server: https://0.0.0.0:6551\n";
        assert_eq!(
            rewrite_servers_to_loopback(content),
            "    server: https://127.0.0.1:6551\n"
        );
    }

    #[tokio::test]
    async fn test_clear_lock_files() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("config.lock");
        let keep = dir.path().join("config");
        tokio::fs::write(&lock, "").await.unwrap();
        tokio::fs::write(&keep, "x").await.unwrap();

        clear_lock_files(&dir.path().to_path_buf()).await;

        assert!(!lock.exists());
        assert!(keep.exists());
    }

    #[tokio::test]
    async fn test_persist_current_context() {
        let _guard = env_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        tokio::fs::write(
            &path,
            "apiVersion: v1\nkind: Config\ncurrent-context: old\nclusters: []\n",
        )
        .await
        .unwrap();
        std::env::set_var("KUBECONFIG", &path);

        persist_current_context("k3d-dev").await.unwrap();
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("current-context: k3d-dev"));

        // Second call leaves the file alone
        persist_current_context("k3d-dev").await.unwrap();
        std::env::remove_var("KUBECONFIG");
    }

    #[test]
    fn test_kubeconfig_path_env_override() {
        let _guard = env_lock();
        std::env::set_var("KUBECONFIG", "/tmp/custom-kubeconfig");
        assert_eq!(kubeconfig_path(), PathBuf::from("/tmp/custom-kubeconfig"));
        std::env::remove_var("KUBECONFIG");
        assert!(kubeconfig_path().ends_with(".kube/config"));
    }
}
