//! Resolution of the generation-service API key.
//!
//! The key can be supplied three ways, checked in this order:
//!
//! 1. inline in the config (`apiKey`), handy for local runs
//! 2. a file path (`apiKeyFile`), e.g. a mounted container secret
//! 3. an environment variable name (`apiKeyEnvVar`)
//!
//! Empty strings count as "not provided" so a template config with blank
//! fields falls through to the next source.

use secrecy::SecretString;

use crate::config::AgentConfig;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source configured (set a value, a file, or an env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret file '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Secret file '{path}' is empty")]
    EmptyFile { path: String },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

fn provided(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Resolves a secret from the first non-empty source.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString, SecretError> {
    if let Some(value) = provided(direct) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = provided(file_path) {
        let expanded = expand_home(path);
        let content = std::fs::read_to_string(&expanded).map_err(|source| {
            SecretError::FileRead {
                path: expanded.clone(),
                source,
            }
        })?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SecretError::EmptyFile { path: expanded });
        }
        return Ok(SecretString::from(trimmed.to_string()));
    }

    if let Some(name) = provided(env_var) {
        return match std::env::var(name) {
            Ok(value) => Ok(SecretString::from(value.trim().to_string())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

/// Resolves the agent API key. A service without auth is allowed, so a
/// config with no source at all yields `None`.
pub fn resolve_agent_key(config: &AgentConfig) -> Result<Option<SecretString>, SecretError> {
    match resolve_secret(
        config.api_key.as_deref(),
        config.api_key_file.as_deref(),
        config.api_key_env_var.as_deref(),
    ) {
        Ok(secret) => Ok(Some(secret)),
        Err(SecretError::NoSourceProvided) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Expands a leading `~` or `~/` to the current user's home directory.
fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            let home = home.to_string_lossy();
            return path.replacen('~', &home, 1);
        }
    }
    path.to_string()
}
