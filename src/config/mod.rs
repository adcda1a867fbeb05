//! Configuration loading for ctxrelay.
//!
//! Reads `contexts.yaml`, resolves environment variables and hands the raw
//! structure to the context registry, which validates it.

pub mod errors;
pub mod loader;

pub use errors::ConfigError;
pub use loader::{
    find_config_path, load, load_config, ContextConfig, PoolConfig, ProxyConfig, ServerConfig,
    CONFIG_ENV_VAR, CONFIG_FILE_NAME,
};
