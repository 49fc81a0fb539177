//! Windows subsystem wrapping rules.
//!
//! On a Windows host the container runtime and the cluster runtime live
//! inside WSL, so invocations of their CLIs must be rewritten as
//! `wsl -d <distro> -u <user> bash -c "<command>"`. The whitelist is
//! static; everything else runs directly.

use crate::platform::Platform;

/// Binaries whose home is the Linux subsystem on a Windows host.
const SUBSYSTEM_BINARIES: &[&str] = &["docker", "k3d", "kubectl", "helm", "bash", "sh"];

/// Substrings that identify the subsystem itself as unhealthy (as opposed
/// to the wrapped command failing).
const SUBSYSTEM_FAILURE_MARKERS: &[&str] = &[
    "Wsl/Service",
    "WSL_E_",
    "The Windows Subsystem for Linux instance has terminated",
    "WSL (",
];

/// Whether this program must be routed through the subsystem on `platform`.
pub fn needs_subsystem_wrap(platform: Platform, program: &str) -> bool {
    platform.is_windows() && SUBSYSTEM_BINARIES.contains(&program)
}

/// Single-quote a string for `bash -c`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Rewrite `program args...` into a `wsl` invocation running the original
/// command under bash in the subsystem.
pub fn wrap_for_subsystem(
    program: &str,
    args: &[String],
    distro: Option<&str>,
    user: &str,
) -> (String, Vec<String>) {
    let mut quoted = vec![shell_quote(program)];
    quoted.extend(args.iter().map(|a| shell_quote(a)));
    let command_line = quoted.join(" ");

    let mut wsl_args = Vec::new();
    if let Some(d) = distro {
        wsl_args.push("-d".to_string());
        wsl_args.push(d.to_string());
    }
    wsl_args.push("-u".to_string());
    wsl_args.push(user.to_string());
    wsl_args.push("bash".to_string());
    wsl_args.push("-c".to_string());
    wsl_args.push(command_line);

    ("wsl".to_string(), wsl_args)
}

/// Whether command output indicates the subsystem itself failed.
pub fn is_subsystem_failure(stderr: &str) -> bool {
    SUBSYSTEM_FAILURE_MARKERS.iter().any(|m| stderr.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist_only_on_windows() {
        assert!(needs_subsystem_wrap(Platform::Windows, "docker"));
        assert!(needs_subsystem_wrap(Platform::Windows, "k3d"));
        assert!(needs_subsystem_wrap(Platform::Windows, "kubectl"));
        assert!(!needs_subsystem_wrap(Platform::Windows, "wsl"));
        assert!(!needs_subsystem_wrap(Platform::Windows, "notepad"));
        assert!(!needs_subsystem_wrap(Platform::Linux, "docker"));
        assert!(!needs_subsystem_wrap(Platform::Darwin, "k3d"));
    }

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("cluster"), "cluster");
        assert_eq!(shell_quote("--timeout=300s"), "--timeout=300s");
        assert_eq!(shell_quote("/mnt/c/tmp/config.yaml"), "/mnt/c/tmp/config.yaml");
    }

    #[test]
    fn test_shell_quote_special() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf)"), "'$(rm -rf)'");
    }

    #[test]
    fn test_wrap_for_subsystem() {
        let (program, args) = wrap_for_subsystem(
            "k3d",
            &["cluster".to_string(), "list".to_string(), "-o".to_string(), "json".to_string()],
            Some("Ubuntu"),
            "dev",
        );
        assert_eq!(program, "wsl");
        assert_eq!(
            args,
            vec!["-d", "Ubuntu", "-u", "dev", "bash", "-c", "k3d cluster list -o json"]
        );
    }

    #[test]
    fn test_wrap_without_distro_omits_flag() {
        let (_, args) = wrap_for_subsystem("docker", &["ps".to_string()], None, "root");
        assert!(!args.contains(&"-d".to_string()));
        assert_eq!(args[0], "-u");
    }

    #[test]
    fn test_wrap_quotes_embedded_spaces() {
        let (_, args) = wrap_for_subsystem(
            "bash",
            &["-c".to_string(), "echo hello world".to_string()],
            None,
            "root",
        );
        let cmdline = args.last().unwrap();
        assert_eq!(cmdline, "bash -c 'echo hello world'");
    }

    #[test]
    fn test_subsystem_failure_markers() {
        assert!(is_subsystem_failure(
            "Wsl/Service/CreateInstance/CreateVm/E_FAIL"
        ));
        assert!(is_subsystem_failure(
            "The Windows Subsystem for Linux instance has terminated."
        ));
        assert!(!is_subsystem_failure("connection refused"));
        assert!(!is_subsystem_failure(""));
    }
}
