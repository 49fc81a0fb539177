//! Windows Subsystem for Linux interaction.
//!
//! The container runtime and the cluster runtime both live inside WSL on a
//! Windows host. This module discovers the subsystem user, translates host
//! paths into subsystem paths, and finds the subsystem's IPv4 address.

use once_cell::sync::OnceCell;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::commands::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};

static WSL_USER: OnceCell<String> = OnceCell::new();

/// Default (non-root) user of the subsystem, cached per process.
///
/// `wsl` itself is never wrapped, so this shells out directly. Falls back
/// to root when discovery fails.
pub async fn default_user(distro: Option<&str>) -> String {
    if let Some(user) = WSL_USER.get() {
        return user.clone();
    }

    let mut cmd = Command::new("wsl");
    if let Some(d) = distro {
        cmd.args(["-d", d]);
    }
    cmd.arg("whoami")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null());

    let user = match tokio::time::timeout(Duration::from_secs(10), cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let raw = String::from_utf8_lossy(&output.stdout);
            let cleaned: String = raw.chars().filter(|c| *c != '\0').collect();
            let name = cleaned.trim().to_string();
            if name.is_empty() {
                "root".to_string()
            } else {
                name
            }
        }
        _ => "root".to_string(),
    };

    WSL_USER.get_or_init(|| user).clone()
}

/// Translate a Windows host path into its subsystem form
/// (`C:\dir\file` → `/mnt/c/dir/file`).
///
/// Short (8.3) path segments are expanded through the platform first. A
/// path already in subsystem form is returned unchanged.
pub fn translate_path(path: &str) -> String {
    // Already a subsystem path
    if path.starts_with('/') {
        return path.to_string();
    }

    let expanded = expand_short_path(path);

    let mut chars = expanded.chars();
    let drive = chars.next();
    let colon = chars.next();
    if let (Some(drive), Some(':')) = (drive, colon) {
        if drive.is_ascii_alphabetic() {
            let rest: String = chars.collect::<String>().replace('\\', "/");
            let rest = rest.trim_start_matches('/');
            return format!("/mnt/{}/{}", drive.to_ascii_lowercase(), rest);
        }
    }

    expanded.replace('\\', "/")
}

/// Expand 8.3-style short segments (`PROGRA~1`) through the platform API.
/// Best-effort: a path that cannot be resolved is returned as-is.
fn expand_short_path(path: &str) -> String {
    if !path.contains('~') {
        return path.to_string();
    }
    match std::fs::canonicalize(Path::new(path)) {
        Ok(full) => {
            let s = full.to_string_lossy().to_string();
            // canonicalize on Windows yields an extended-length prefix
            s.strip_prefix(r"\\?\").map(str::to_string).unwrap_or(s)
        }
        Err(_) => path.to_string(),
    }
}

/// IPv4 address of the subsystem's primary interface.
///
/// `hostname -I` output can carry interface prefixes, CIDR suffixes and
/// shell-concatenation artefacts depending on the distro; only a clean
/// IPv4 literal is accepted.
pub async fn subsystem_ip(runner: &dyn CommandRunner) -> Result<Ipv4Addr> {
    let output = runner
        .run(
            CommandSpec::new("bash", &["-c", "hostname -I"])
                .with_timeout(Duration::from_secs(10)),
        )
        .await?;

    if !output.success() {
        return Err(Error::Other(format!(
            "subsystem IP discovery failed: {}",
            output.detail()
        )));
    }

    parse_first_ipv4(&output.stdout).ok_or_else(|| {
        Error::Other(format!(
            "no IPv4 address in subsystem output: {:?}",
            output.stdout.trim()
        ))
    })
}

/// Extract the first plausible IPv4 literal from command output.
pub fn parse_first_ipv4(raw: &str) -> Option<Ipv4Addr> {
    for token in raw.split_whitespace() {
        let mut candidate = token;
        // CIDR suffix
        if let Some(idx) = candidate.find('/') {
            candidate = &candidate[..idx];
        }
        // Interface prefix like "eth0:" (an IPv6 literal will simply fail
        // the parse below)
        if let Some(idx) = candidate.rfind(':') {
            candidate = &candidate[idx + 1..];
        }
        let candidate: String = candidate
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if let Ok(ip) = candidate.parse::<Ipv4Addr>() {
            if !ip.is_loopback() && !ip.is_unspecified() {
                return Some(ip);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_windows_path() {
        assert_eq!(
            translate_path(r"C:\Users\dev\config.yaml"),
            "/mnt/c/Users/dev/config.yaml"
        );
        assert_eq!(translate_path(r"D:\tmp"), "/mnt/d/tmp");
    }

    #[test]
    fn test_translate_is_idempotent() {
        let translated = translate_path(r"C:\Users\dev\config.yaml");
        assert_eq!(translate_path(&translated), translated);
        assert_eq!(translate_path("/mnt/c/tmp"), "/mnt/c/tmp");
    }

    #[test]
    fn test_parse_first_ipv4() {
        assert_eq!(
            parse_first_ipv4("172.20.240.10 \n"),
            Some(Ipv4Addr::new(172, 20, 240, 10))
        );
        // CIDR suffix
        assert_eq!(
            parse_first_ipv4("172.20.240.10/20"),
            Some(Ipv4Addr::new(172, 20, 240, 10))
        );
        // Interface prefix
        assert_eq!(
            parse_first_ipv4("eth0:172.20.240.10"),
            Some(Ipv4Addr::new(172, 20, 240, 10))
        );
        // Multiple addresses: first valid wins
        assert_eq!(
            parse_first_ipv4("172.20.240.10 10.0.0.4"),
            Some(Ipv4Addr::new(172, 20, 240, 10))
        );
    }

    #[test]
    fn test_parse_rejects_noise() {
        assert_eq!(parse_first_ipv4(""), None);
        assert_eq!(parse_first_ipv4("fe80::1"), None);
        assert_eq!(parse_first_ipv4("127.0.0.1"), None);
        assert_eq!(parse_first_ipv4("0.0.0.0"), None);
        assert_eq!(parse_first_ipv4("not-an-ip"), None);
    }

    #[test]
    fn test_parse_strips_shell_artefacts() {
        assert_eq!(
            parse_first_ipv4("'172.20.240.10'"),
            Some(Ipv4Addr::new(172, 20, 240, 10))
        );
    }
}
