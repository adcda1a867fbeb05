//! `contexts.yaml` discovery, interpolation and parsing.
//!
//! Search order for the config file:
//! 1. An explicit path (must exist).
//! 2. `CTXRELAY_CONFIG` (must exist when set).
//! 3. `./contexts.yaml`
//! 4. `<platform config dir>/ctxrelay/contexts.yaml`
//! 5. `~/.config/ctxrelay/contexts.yaml`
//!
//! When nothing is found an empty configuration is used.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::ConfigError;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "CTXRELAY_CONFIG";

/// Default config file name.
pub const CONFIG_FILE_NAME: &str = "contexts.yaml";

const APP_DIR: &str = "ctxrelay";

// ─── Public Types ────────────────────────────────────────────────────────────

/// A backend server template: how to launch one kind of MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the worker process.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// A named context binding a server template to environment overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    pub server: String,
    /// Raw values; the registry accepts scalars only.
    #[serde(default)]
    pub env: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Process pool tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of live worker processes.
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
    /// Per-request timeout for relayed calls.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Budget for the `initialize` handshake of a fresh worker.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// How long `acquire` waits for a slot when every worker is busy.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Grace period between closing stdin and killing a worker.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_max_processes() -> usize {
    5
}
fn default_call_timeout_secs() -> u64 {
    120
}
fn default_handshake_timeout_secs() -> u64 {
    30
}
fn default_acquire_timeout_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_processes: default_max_processes(),
            call_timeout_secs: default_call_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Root of `contexts.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    /// Environment applied to every context before its own overrides.
    #[serde(default)]
    pub defaults: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub contexts: BTreeMap<String, ContextConfig>,
    /// Context selected at startup.
    #[serde(default)]
    pub current_context: Option<String>,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl ProxyConfig {
    /// Parse a YAML document, interpolating `${VAR}` references first.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        if interpolated.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file, honoring an explicit path and `CTXRELAY_CONFIG`.
///
/// Returns `Ok(None)` when no file exists in any default location.
pub fn find_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    let from_env = std::env::var_os(CONFIG_ENV_VAR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);

    let mut search = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        search.push(dir.join(APP_DIR).join(CONFIG_FILE_NAME));
    }
    if let Some(home) = dirs::home_dir() {
        search.push(home.join(".config").join(APP_DIR).join(CONFIG_FILE_NAME));
    }

    resolve_config_path(explicit, from_env.as_deref(), &search)
}

fn resolve_config_path(
    explicit: Option<&Path>,
    from_env: Option<&Path>,
    search: &[PathBuf],
) -> Result<Option<PathBuf>, ConfigError> {
    // A path someone asked for by name has to exist.
    if let Some(path) = explicit.or(from_env) {
        if path.is_file() {
            return Ok(Some(path.to_path_buf()));
        }
        return Err(ConfigError::NotFound {
            path: path.display().to_string(),
        });
    }

    Ok(search.iter().find(|p| p.is_file()).cloned())
}

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    ProxyConfig::from_yaml(&raw)
}

/// Discover and load the configuration.
///
/// Returns the parsed config together with the file it came from, if any.
pub fn load(explicit: Option<&Path>) -> Result<(ProxyConfig, Option<PathBuf>), ConfigError> {
    match find_config_path(explicit)? {
        Some(path) => {
            let config = load_config(&path)?;
            tracing::info!(
                path = %path.display(),
                contexts = config.contexts.len(),
                servers = config.servers.len(),
                "loaded configuration"
            );
            Ok((config, Some(path)))
        }
        None => {
            tracing::warn!("no contexts.yaml found, starting with an empty configuration");
            Ok((ProxyConfig::default(), None))
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
defaults:
  AWS_PROFILE: shared
servers:
  eks:
    command: uvx
    args: ["awslabs.eks-mcp-server@latest"]
contexts:
  staging:
    server: eks
    env:
      AWS_REGION: eu-west-3
    description: Staging cluster
  prod:
    server: eks
    env:
      AWS_REGION: eu-west-1
current_context: staging
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = ProxyConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.servers["eks"].command, "uvx");
        assert_eq!(config.servers["eks"].args, vec!["awslabs.eks-mcp-server@latest"]);
        assert_eq!(config.contexts.len(), 2);
        assert_eq!(config.current_context.as_deref(), Some("staging"));
        assert_eq!(
            config.contexts["staging"].description.as_deref(),
            Some("Staging cluster")
        );
        // Pool section absent → defaults.
        assert_eq!(config.pool.max_processes, 5);
        assert_eq!(config.pool.call_timeout_secs, 120);
        assert_eq!(config.pool.shutdown_grace_secs, 5);
    }

    #[test]
    fn test_pool_overrides() {
        let yaml = "pool:\n  max_processes: 2\n  call_timeout_secs: 7\n";
        let config = ProxyConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.pool.max_processes, 2);
        assert_eq!(config.pool.call_timeout_secs, 7);
        assert_eq!(config.pool.acquire_timeout_secs, 30);
    }

    #[test]
    fn test_empty_document_is_empty_config() {
        let config = ProxyConfig::from_yaml("   \n").unwrap();
        assert!(config.contexts.is_empty());
        assert!(config.current_context.is_none());
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = ProxyConfig::from_yaml("contexts: [unterminated").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_context_without_server_is_parse_error() {
        let err = ProxyConfig::from_yaml("contexts:\n  dev:\n    env: {}\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__CTXRELAY_TEST_UNSET__");
        let result = interpolate_env_vars("${__CTXRELAY_TEST_UNSET__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__CTXRELAY_TEST_PROFILE__", "ops");
        let config = ProxyConfig::from_yaml(
            "defaults:\n  AWS_PROFILE: ${__CTXRELAY_TEST_PROFILE__:-default}\n",
        )
        .unwrap();
        std::env::remove_var("__CTXRELAY_TEST_PROFILE__");
        assert_eq!(
            config.defaults["AWS_PROFILE"],
            serde_yaml::Value::String("ops".into())
        );
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with $HOME but no braces";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/kube");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/kube"));
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let err = resolve_config_path(Some(Path::new("/nonexistent/contexts.yaml")), None, &[])
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_explicit_path_wins_over_env_and_search() {
        let tmp = TempDir::new().unwrap();
        let explicit = tmp.path().join("explicit.yaml");
        let from_env = tmp.path().join("env.yaml");
        std::fs::write(&explicit, "").unwrap();
        std::fs::write(&from_env, "").unwrap();

        let found = resolve_config_path(Some(&explicit), Some(&from_env), &[]).unwrap();
        assert_eq!(found, Some(explicit));
    }

    #[test]
    fn test_search_order_picks_first_existing() {
        let tmp = TempDir::new().unwrap();
        let first = tmp.path().join("a").join(CONFIG_FILE_NAME);
        let second = tmp.path().join("b").join(CONFIG_FILE_NAME);
        std::fs::create_dir_all(second.parent().unwrap()).unwrap();
        std::fs::write(&second, "").unwrap();

        let found = resolve_config_path(None, None, &[first, second.clone()]).unwrap();
        assert_eq!(found, Some(second));
    }

    #[test]
    fn test_nothing_found_is_none() {
        let tmp = TempDir::new().unwrap();
        let found =
            resolve_config_path(None, None, &[tmp.path().join(CONFIG_FILE_NAME)]).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_load_config_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, SAMPLE).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.contexts["prod"].server, "eks");
    }
}
