//! Server launch specifications and the configuration loader.
//!
//! Reads an `mcpServers` document (JSON or YAML), validates each entry,
//! resolves `${VAR}` references inside its string fields, and exposes the
//! result by name.
//! A malformed entry is logged and skipped; a malformed document is an error.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use super::errors::McpError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// How the client talks to a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Newline-delimited JSON-RPC over the child's stdin/stdout.
    Stdio,
}

impl TransportKind {
    /// Parse the `type` field of a server entry.
    pub fn parse(raw: &str) -> Result<Self, McpError> {
        match raw {
            "stdio" => Ok(Self::Stdio),
            other => Err(McpError::ConfigError {
                reason: format!("unsupported server type: '{other}'"),
            }),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
        }
    }
}

/// Immutable launch description for one tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSpec {
    pub name: String,
    pub transport: TransportKind,
    pub command: String,
    pub args: Vec<String>,
    /// Overrides merged over the inherited environment. `None` inherits only.
    pub env: Option<BTreeMap<String, String>>,
    /// Working directory for the child process.
    pub cwd: Option<PathBuf>,
}

impl ServerSpec {
    /// Build and validate a stdio server spec.
    pub fn stdio<I, S>(name: &str, command: &str, args: I) -> Result<Self, McpError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = Self {
            name: name.to_string(),
            transport: TransportKind::Stdio,
            command: command.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            env: None,
            cwd: None,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Add an environment override.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Check the invariants every spec must hold.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.name.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: "server name must not be empty".into(),
            });
        }
        if self.command.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("server '{}': command is required", self.name),
            });
        }
        Ok(())
    }
}

/// A server entry that was dropped during loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub name: String,
    pub reason: String,
}

/// Validated server specs keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ServerSpecs {
    specs: BTreeMap<String, Arc<ServerSpec>>,
    skipped: Vec<SkippedEntry>,
}

impl ServerSpecs {
    /// Collect already-built specs. Duplicate names are a configuration error.
    pub fn from_specs<I>(specs: I) -> Result<Self, McpError>
    where
        I: IntoIterator<Item = ServerSpec>,
    {
        let mut out = Self::default();
        for spec in specs {
            spec.validate()?;
            out.insert(spec)?;
        }
        Ok(out)
    }

    fn insert(&mut self, spec: ServerSpec) -> Result<(), McpError> {
        if self.specs.contains_key(&spec.name) {
            return Err(McpError::ConfigError {
                reason: format!("duplicate server name: '{}'", spec.name),
            });
        }
        self.specs.insert(spec.name.clone(), Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServerSpec>> {
        self.specs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Server names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.specs.keys().map(|k| k.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServerSpec>> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Entries that were present in the source but failed validation.
    pub fn skipped(&self) -> &[SkippedEntry] {
        &self.skipped
    }
}

/// Document syntax of a configuration source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Pick the format from the file extension (`.yaml`/`.yml` → YAML, else JSON).
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Self::Yaml
            }
            _ => Self::Json,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load server specs from a configuration file.
pub fn load_servers_config(path: &Path) -> Result<ServerSpecs, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let specs = parse_servers_config(&raw, ConfigFormat::from_path(path))?;
    tracing::info!(
        path = %path.display(),
        loaded = specs.len(),
        skipped = specs.skipped().len(),
        "loaded server config"
    );
    Ok(specs)
}

/// Parse server specs from a configuration document.
pub fn parse_servers_config(raw: &str, format: ConfigFormat) -> Result<ServerSpecs, McpError> {
    let root: RawRoot = match format {
        ConfigFormat::Json => serde_json::from_str(raw).map_err(|e| {
            McpError::ConfigError {
                reason: format!("failed to parse config: {e}"),
            }
        })?,
        ConfigFormat::Yaml => serde_yaml::from_str(raw).map_err(|e| {
            McpError::ConfigError {
                reason: format!("failed to parse config: {e}"),
            }
        })?,
    };

    let entries = root.servers.ok_or(McpError::ConfigError {
        reason: "invalid configuration format: missing 'mcpServers' key".into(),
    })?;

    let mut seen = HashSet::new();
    let mut specs = ServerSpecs::default();

    for (name, value) in entries.0 {
        if !seen.insert(name.clone()) {
            return Err(McpError::ConfigError {
                reason: format!("duplicate server name: '{name}'"),
            });
        }

        match spec_from_entry(&name, value) {
            Ok(spec) => {
                tracing::debug!(server = %name, command = %spec.command, "loaded server spec");
                specs.insert(spec)?;
            }
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "skipping invalid server entry");
                specs.skipped.push(SkippedEntry {
                    name,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(specs)
}

/// Raw shape of one `mcpServers` entry before validation.
#[derive(Debug, Deserialize)]
struct RawServerEntry {
    #[serde(rename = "type", default = "default_transport")]
    kind: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    cwd: Option<String>,
}

fn default_transport() -> String {
    "stdio".to_string()
}

fn spec_from_entry(name: &str, value: serde_json::Value) -> Result<ServerSpec, McpError> {
    let entry: RawServerEntry =
        serde_json::from_value(value).map_err(|e| McpError::ConfigError {
            reason: format!("server '{name}': malformed entry: {e}"),
        })?;

    // References are resolved per field, after parsing, so a value can never
    // change the shape of the document.
    let spec = ServerSpec {
        name: name.to_string(),
        transport: TransportKind::parse(&entry.kind)?,
        command: expand_home(&expand_env_refs(&entry.command)),
        args: entry.args.iter().map(|arg| expand_env_refs(arg)).collect(),
        env: entry.env.map(|env| {
            env.into_iter()
                .map(|(key, value)| (key, expand_env_refs(&value)))
                .collect()
        }),
        cwd: entry
            .cwd
            .map(|cwd| PathBuf::from(expand_home(&expand_env_refs(&cwd)))),
    };
    spec.validate()?;
    Ok(spec)
}

#[derive(Debug, Deserialize)]
struct RawRoot {
    #[serde(default, rename = "mcpServers", alias = "servers")]
    servers: Option<OrderedEntries>,
}

/// Map entries in document order, duplicates included.
#[derive(Debug)]
struct OrderedEntries(Vec<(String, serde_json::Value)>);

impl<'de> Deserialize<'de> for OrderedEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = OrderedEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of server name to server entry")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, value)) = map.next_entry::<String, serde_json::Value>()? {
                    entries.push((name, value));
                }
                Ok(OrderedEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

// ─── Environment References ──────────────────────────────────────────────────

/// Substitute `${VAR}` and `${VAR:-fallback}` in one config string.
///
/// Unset variables without a fallback become empty. An unterminated `${` is
/// kept as literal text.
fn expand_env_refs(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let body = &rest[start + 2..];
        let Some(end) = body.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        out.push_str(&lookup_env_ref(&body[..end]));
        rest = &body[end + 1..];
    }

    out.push_str(rest);
    out
}

fn lookup_env_ref(reference: &str) -> String {
    let (var, fallback) = match reference.split_once(":-") {
        Some((var, fallback)) => (var, Some(fallback)),
        None => (reference, None),
    };

    match (std::env::var(var), fallback) {
        (Ok(value), _) => value,
        (Err(_), Some(fallback)) => fallback.to_string(),
        (Err(_), None) => {
            tracing::debug!(var, "unset variable in server config, using empty string");
            String::new()
        }
    }
}

/// Expand `~` or a leading `~/` to the user's home directory.
fn expand_home(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return path.to_string(),
    };
    match dirs::home_dir() {
        Some(home) => format!("{}{rest}", home.display()),
        None => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
