//! Aggregated tool catalog.
//!
//! Merges the tools of every connected server into one addressable set.
//! Each tool is reachable by its qualified name (`server.tool`); a bare name
//! resolves only when exactly one connected server exposes it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use serde_json::{Map, Value};

use super::errors::McpError;
use super::types::McpToolDefinition;

/// Minimum similarity for a name to be offered as a suggestion.
const SUGGESTION_FLOOR: f64 = 0.3;

/// Suggestions attached to an `UnknownTool` error.
const MAX_SUGGESTIONS: usize = 3;

// ─── Tool ────────────────────────────────────────────────────────────────────

/// A callable operation discovered on one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tool {
    /// Name as advertised by the server; unique only within that server.
    pub name: String,
    /// `server.name`, unique across the catalog.
    pub qualified_name: String,
    pub server_name: String,
    pub description: String,
    pub input_schema: Option<Value>,
}

/// Arguments checked against a tool's input schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    /// An object that satisfied the advertised schema.
    Structured(Map<String, Value>),
    /// Passed through untouched because the tool has no schema.
    Raw(Value),
}

impl ToolArguments {
    /// Wire form of the arguments. A raw `null` is sent as an empty object.
    pub fn into_value(self) -> Value {
        match self {
            Self::Structured(map) => Value::Object(map),
            Self::Raw(Value::Null) => Value::Object(Map::new()),
            Self::Raw(value) => value,
        }
    }
}

impl Tool {
    pub fn from_definition(server: &str, def: McpToolDefinition) -> Self {
        Self {
            qualified_name: qualify(server, &def.name),
            name: def.name,
            server_name: server.to_string(),
            description: def.description.unwrap_or_default(),
            input_schema: def.input_schema,
        }
    }

    /// Check `arguments` against the input schema.
    ///
    /// With a schema, arguments must be an object (or `null`, meaning none),
    /// carry every `required` key, match the top-level `properties` types and
    /// respect `additionalProperties: false`. Without one they pass through raw.
    pub fn validate_arguments(&self, arguments: Value) -> Result<ToolArguments, McpError> {
        let Some(schema) = &self.input_schema else {
            return Ok(ToolArguments::Raw(arguments));
        };

        let map = match arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(self.invalid(format!(
                    "expected an object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(field) {
                    return Err(self.invalid(format!("missing required field: '{field}'")));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

        for (key, value) in &map {
            match properties.and_then(|p| p.get(key)) {
                Some(property) => {
                    if let Some(expected) = property.get("type") {
                        if !type_matches(expected, value) {
                            return Err(self.invalid(format!(
                                "field '{key}' should be {}, got {}",
                                describe_type(expected),
                                json_type_name(value)
                            )));
                        }
                    }
                }
                None if closed => {
                    return Err(self.invalid(format!("unexpected field: '{key}'")));
                }
                None => {}
            }
        }

        Ok(ToolArguments::Structured(map))
    }

    fn invalid(&self, reason: String) -> McpError {
        McpError::InvalidArguments {
            tool: self.qualified_name.clone(),
            reason,
        }
    }
}

fn qualify(server: &str, tool: &str) -> String {
    format!("{server}.{tool}")
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(ty) => single_type_matches(ty, value),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|ty| single_type_matches(ty, value)),
        _ => true,
    }
}

fn single_type_matches(ty: &str, value: &Value) -> bool {
    match ty {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        // Unknown type keywords are not ours to enforce.
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        Value::String(ty) => ty.clone(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

/// Tools from all connected servers, ordered by (server, tool name).
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<(String, String), Tool>,
    by_qualified: HashMap<String, (String, String)>,
    by_bare: HashMap<String, BTreeSet<(String, String)>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one server's tools.
    ///
    /// A tool repeated within the server, or whose qualified name is already
    /// taken, is skipped with a warning.
    pub fn add_all(&mut self, server: &str, tools: Vec<Tool>) {
        for mut tool in tools {
            tool.server_name = server.to_string();
            tool.qualified_name = qualify(server, &tool.name);

            let key = (server.to_string(), tool.name.clone());
            if self.tools.contains_key(&key) {
                tracing::warn!(server, tool = %tool.name, "server advertised tool twice, keeping the first");
                continue;
            }
            if self.by_qualified.contains_key(&tool.qualified_name) {
                tracing::warn!(
                    server,
                    tool = %tool.qualified_name,
                    "qualified tool name already taken by another server, skipping"
                );
                continue;
            }

            self.by_qualified
                .insert(tool.qualified_name.clone(), key.clone());
            self.by_bare
                .entry(tool.name.clone())
                .or_default()
                .insert(key.clone());
            self.tools.insert(key, tool);
        }
    }

    pub fn lookup_by_qualified_name(&self, qualified: &str) -> Option<&Tool> {
        self.by_qualified
            .get(qualified)
            .and_then(|key| self.tools.get(key))
    }

    /// Look up a bare tool name.
    ///
    /// Returns `AmbiguousTool` when more than one server exposes `name`.
    pub fn lookup_by_bare_name(&self, name: &str) -> Result<Option<&Tool>, McpError> {
        let Some(owners) = self.by_bare.get(name) else {
            return Ok(None);
        };

        if owners.len() > 1 {
            return Err(McpError::AmbiguousTool {
                name: name.to_string(),
                candidates: owners
                    .iter()
                    .filter_map(|key| self.tools.get(key))
                    .map(|t| t.qualified_name.clone())
                    .collect(),
            });
        }

        Ok(owners.iter().next().and_then(|key| self.tools.get(key)))
    }

    /// Qualified name first, then bare name.
    pub fn resolve(&self, name: &str) -> Result<&Tool, McpError> {
        if let Some(tool) = self.lookup_by_qualified_name(name) {
            return Ok(tool);
        }
        match self.lookup_by_bare_name(name)? {
            Some(tool) => Ok(tool),
            None => Err(McpError::UnknownTool {
                name: name.to_string(),
                suggestions: self.find_similar(name, MAX_SUGGESTIONS),
            }),
        }
    }

    /// Name of the server that would serve `name`.
    pub fn owner_of(&self, name: &str) -> Result<&str, McpError> {
        self.resolve(name).map(|t| t.server_name.as_str())
    }

    /// All tools, ordered by (server, tool name).
    pub fn list_all(&self) -> Vec<&Tool> {
        self.tools.values().collect()
    }

    pub fn tools_for_server(&self, server: &str) -> Vec<&Tool> {
        self.tools
            .values()
            .filter(|t| t.server_name == server)
            .collect()
    }

    /// Servers contributing at least one tool, sorted.
    pub fn server_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|(s, _)| s.as_str()).collect();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Qualified names of tools whose name is close to `name`, best first.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let query = name.rsplit('.').next().unwrap_or(name);

        let mut scored: Vec<(&str, f64)> = self
            .tools
            .values()
            .map(|t| (t.qualified_name.as_str(), similarity(query, &t.name)))
            .filter(|(_, score)| *score > SUGGESTION_FLOOR)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name.to_string()).collect()
    }
}

// ─── String Similarity ───────────────────────────────────────────────────────

/// Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let n = b.len();

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity in `[0.0, 1.0]`.
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
