//! Launch requirement checks — can each configured command actually run here?
//!
//! Also produces a starter configuration for the `init` command, picking the
//! container runtime that is installed.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use super::config::{ServerSpec, ServerSpecs};

// ─── Executable Lookup ───────────────────────────────────────────────────────

/// Resolve `command` the way process spawning would.
///
/// Bare names are searched for in `path_override` (a spec's own `PATH`) or
/// the inherited `PATH`; commands with a path separator are checked in place.
pub fn find_executable(command: &str, path_override: Option<&str>) -> Option<PathBuf> {
    let found = match path_override {
        Some(paths) => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            which::which_in(command, Some(paths), cwd)
        }
        None => which::which(command),
    };

    match found {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::trace!(command, error = %e, "executable lookup failed");
            None
        }
    }
}

fn on_path(command: &str) -> bool {
    which::which(command).is_ok()
}

// ─── Requirement Checks ──────────────────────────────────────────────────────

/// Human-readable problems that would stop `spec` from launching.
pub fn missing_requirements(spec: &ServerSpec) -> Vec<String> {
    let path_override = spec
        .env
        .as_ref()
        .and_then(|env| env.get("PATH"))
        .map(String::as_str);

    let mut missing = Vec::new();
    if find_executable(&spec.command, path_override).is_none() {
        missing.push(format!("Command '{}' not found in PATH", spec.command));
    }

    let command = Path::new(&spec.command)
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or(&spec.command);

    match command {
        "npx" if !on_path("node") => {
            missing.push("Node.js not installed (required for npx)".to_string());
        }
        "uvx" if !on_path("uv") => {
            missing.push("uv not installed (required for uvx)".to_string());
        }
        "docker" if !on_path("docker") && on_path("podman") => {
            missing.push(
                "Docker not found, but podman is available. Consider changing command to 'podman'"
                    .to_string(),
            );
        }
        "podman" if !on_path("podman") && on_path("docker") => {
            missing.push(
                "Podman not found, but docker is available. Consider changing command to 'docker'"
                    .to_string(),
            );
        }
        _ => {}
    }

    missing
}

/// Problems per server, for servers that have any.
pub fn check_requirements(specs: &ServerSpecs) -> BTreeMap<String, Vec<String>> {
    specs
        .iter()
        .filter_map(|spec| {
            let missing = missing_requirements(spec);
            if missing.is_empty() {
                None
            } else {
                tracing::debug!(server = %spec.name, problems = ?missing, "server requirements missing");
                Some((spec.name.clone(), missing))
            }
        })
        .collect()
}

// ─── Starter Config ──────────────────────────────────────────────────────────

/// Detect the available container runtime, preferring docker.
pub fn detect_container_runtime() -> &'static str {
    if on_path("docker") {
        "docker"
    } else if on_path("podman") {
        "podman"
    } else {
        "docker"
    }
}

/// Platform-correct npx command.
///
/// Windows requires `npx.cmd` because `npx` is a batch script.
fn default_npx_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "npx.cmd"
    } else {
        "npx"
    }
}

/// A sample `mcpServers` document with commonly used public servers.
pub fn starter_config() -> serde_json::Value {
    serde_json::json!({
        "mcpServers": {
            "fetch": {
                "type": "stdio",
                "command": "uvx",
                "args": ["mcp-server-fetch"]
            },
            "playwright": {
                "type": "stdio",
                "command": detect_container_runtime(),
                "args": ["run", "-i", "--rm", "mcp/playwright"]
            },
            "sequential-thinking": {
                "type": "stdio",
                "command": default_npx_command(),
                "args": ["-y", "@modelcontextprotocol/server-sequential-thinking"]
            }
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::{parse_servers_config, ConfigFormat};

    #[cfg(unix)]
    #[test]
    fn test_find_shell_on_path() {
        assert!(find_executable("sh", None).is_some());
    }

    #[test]
    fn test_missing_command_not_found() {
        assert!(find_executable("definitely-not-a-real-command-xyz", None).is_none());
        assert!(find_executable("/nonexistent/bin/server", None).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_path_override_is_used() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let bin = tmp.path().join("my-server");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dir = tmp.path().to_string_lossy().into_owned();
        let found = find_executable("my-server", Some(dir.as_str())).unwrap();
        assert_eq!(found.file_name(), bin.file_name());
        assert!(find_executable("my-server", None).is_none());
        assert!(find_executable("my-server", Some("/nonexistent")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_file_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("data.txt");
        std::fs::write(&file, "not a program").unwrap();
        assert!(find_executable(file.to_str().unwrap(), None).is_none());
    }

    #[test]
    fn test_missing_requirements_reports_command() {
        let spec = ServerSpec::stdio("b", "/nonexistent", Vec::<String>::new()).unwrap();
        let missing = missing_requirements(&spec);
        assert_eq!(missing.len(), 1);
        assert!(missing[0].contains("/nonexistent"));
    }

    #[test]
    fn test_check_requirements_only_lists_problems() {
        let ok = ServerSpec::stdio("ok", "sh", Vec::<String>::new()).unwrap();
        let bad = ServerSpec::stdio("bad", "definitely-not-a-real-command-xyz", Vec::<String>::new())
            .unwrap();
        let specs = ServerSpecs::from_specs(vec![ok, bad]).unwrap();

        let report = check_requirements(&specs);
        assert!(report.contains_key("bad"));
        if cfg!(unix) {
            assert!(!report.contains_key("ok"));
        }
    }

    #[test]
    fn test_starter_config_parses() {
        let raw = serde_json::to_string(&starter_config()).unwrap();
        let specs = parse_servers_config(&raw, ConfigFormat::Json).unwrap();
        assert_eq!(specs.names(), vec!["fetch", "playwright", "sequential-thinking"]);
        assert!(specs.skipped().is_empty());
    }

    #[test]
    fn test_detect_container_runtime_is_known() {
        assert!(["docker", "podman"].contains(&detect_container_runtime()));
    }
}
