use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScriptlineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Engine error: {0}")]
    Engine(#[from] crate::pipeline::EngineError),

    #[error("Budget error: {0}")]
    Budget(#[from] crate::budget::BudgetError),

    #[error("Admission error: {0}")]
    Admission(#[from] crate::worker::AdmissionError),

    #[error("Threshold error: {0}")]
    Threshold(#[from] crate::gate::ThresholdError),

    #[error("Agent error: {0}")]
    Agent(#[from] crate::agents::AgentError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Invalid settings field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Invalid keyword '{keyword}': {reason}")]
    InvalidKeyword { keyword: String, reason: String },

    #[error("Stored settings for user '{user_id}' are unreadable: {source}")]
    Corrupt {
        user_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

pub type Result<T> = std::result::Result<T, ScriptlineError>;
