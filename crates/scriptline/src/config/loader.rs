use std::path::Path;

use crate::config::schema::AppConfig;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<AppConfig, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: AppConfig = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Loads the file named by `SCRIPTLINE_CONFIG`, or the defaults when the
/// variable is unset.
pub fn load_config_from_env() -> Result<AppConfig, ConfigError> {
    match std::env::var_os("SCRIPTLINE_CONFIG") {
        Some(path) if !path.is_empty() => load_config(path),
        _ => {
            let config = AppConfig::default();
            validate_config(&config)?;
            Ok(config)
        }
    }
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let gate = &config.gate;
    if gate.min_band >= gate.max_band {
        return Err(ConfigError::Validation {
            message: format!(
                "gate.minBand ({}) must be below gate.maxBand ({})",
                gate.min_band, gate.max_band
            ),
        });
    }

    if config.pipeline.stage_timeout_secs == 0 || config.agent.request_timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "Timeouts must be positive".to_string(),
        });
    }

    if config.scheduler.enabled && config.scheduler.interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "scheduler.intervalSecs must be positive".to_string(),
        });
    }

    Ok(())
}
