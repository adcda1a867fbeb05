//! Context registry: the immutable, validated view of `contexts.yaml`.
//!
//! Each context binds a server template to an effective environment:
//! `defaults` first, then the context's own `env` (context entries win).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use super::errors::ContextError;
use crate::config::{ConfigError, ProxyConfig};

// ─── Types ───────────────────────────────────────────────────────────────────

/// How to launch one kind of backend server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerTemplate {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl ServerTemplate {
    /// The command line as a single display string.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A named environment bound to a server template.
#[derive(Debug, Clone)]
pub struct Context {
    pub name: String,
    pub template: Arc<ServerTemplate>,
    /// Effective environment: defaults overlaid with `overrides`.
    pub env: BTreeMap<String, String>,
    /// Only the entries declared on the context itself.
    pub overrides: BTreeMap<String, String>,
    pub description: Option<String>,
}

/// Read-only set of contexts, built once at startup. Each context holds
/// the server template it resolves to.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: BTreeMap<String, Arc<Context>>,
    default_context: Option<String>,
}

// ─── Construction ────────────────────────────────────────────────────────────

impl ContextRegistry {
    /// Validate a parsed configuration and build the registry.
    ///
    /// Fails if a context names an undefined server, if an env value is not a
    /// scalar, or if `current_context` is not itself a defined context.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ConfigError> {
        let mut templates = BTreeMap::new();
        for (name, server) in &config.servers {
            if server.command.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    reason: format!("server '{name}' has an empty command"),
                });
            }
            templates.insert(
                name.clone(),
                Arc::new(ServerTemplate {
                    name: name.clone(),
                    command: server.command.clone(),
                    args: server.args.clone(),
                    cwd: server.cwd.as_ref().map(PathBuf::from),
                }),
            );
        }

        let defaults = scalar_env("defaults", &config.defaults)?;

        let mut contexts = BTreeMap::new();
        for (name, ctx) in &config.contexts {
            let template = templates.get(&ctx.server).cloned().ok_or_else(|| {
                ConfigError::Invalid {
                    reason: format!(
                        "context '{name}' references undefined server '{}'",
                        ctx.server
                    ),
                }
            })?;

            let overrides = scalar_env(&format!("context '{name}'"), &ctx.env)?;
            let mut env = defaults.clone();
            env.extend(overrides.clone());

            contexts.insert(
                name.clone(),
                Arc::new(Context {
                    name: name.clone(),
                    template,
                    env,
                    overrides,
                    description: ctx.description.clone(),
                }),
            );
        }

        if let Some(default) = &config.current_context {
            if !contexts.contains_key(default) {
                return Err(ConfigError::Invalid {
                    reason: format!("current_context '{default}' is not a defined context"),
                });
            }
        }

        Ok(Self {
            contexts,
            default_context: config.current_context.clone(),
        })
    }
}

/// Convert raw YAML env values to strings, rejecting non-scalars.
fn scalar_env(
    scope: &str,
    raw: &BTreeMap<String, serde_yaml::Value>,
) -> Result<BTreeMap<String, String>, ConfigError> {
    raw.iter()
        .map(|(key, value)| {
            let value = match value {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(ConfigError::Invalid {
                        reason: format!(
                            "{scope}: env value for '{key}' must be a scalar string, got {}",
                            yaml_kind(other)
                        ),
                    })
                }
            };
            Ok((key.clone(), value))
        })
        .collect()
}

fn yaml_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "bool",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "a sequence",
        serde_yaml::Value::Mapping(_) => "a mapping",
        serde_yaml::Value::Tagged(_) => "a tagged value",
    }
}

// ─── Lookup ──────────────────────────────────────────────────────────────────

impl ContextRegistry {
    /// Look up a context by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<Context>, ContextError> {
        self.contexts
            .get(name)
            .cloned()
            .ok_or_else(|| ContextError::NotFound {
                name: name.to_string(),
                available: self.names(),
            })
    }

    /// All contexts, ordered by name.
    pub fn list(&self) -> Vec<Arc<Context>> {
        self.contexts.values().cloned().collect()
    }

    /// Context names, ordered.
    pub fn names(&self) -> Vec<String> {
        self.contexts.keys().cloned().collect()
    }

    /// The context declared as current in the configuration.
    pub fn default_context(&self) -> Option<&str> {
        self.default_context.as_deref()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
