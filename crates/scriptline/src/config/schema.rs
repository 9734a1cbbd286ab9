use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            database: DatabaseConfig::default(),
            server: ServerConfig::default(),
            agent: AgentConfig::default(),
            pipeline: PipelineConfig::default(),
            scheduler: SchedulerConfig::default(),
            gate: GateConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Falls back to `~/.scriptline/data/scriptline.db` when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .clone()
            .or_else(crate::db::default_database_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: Vec::new(),
        }
    }
}

/// Connection settings for the text-generation service that backs the
/// agent stages. The API key may come from any one of three sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_agent_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default)]
    pub api_key_env_var: Option<String>,
}

fn default_agent_endpoint() -> String {
    "http://127.0.0.1:9090".to_string()
}

fn default_request_timeout() -> u64 {
    90
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: default_agent_endpoint(),
            request_timeout_secs: default_request_timeout(),
            api_key: None,
            api_key_file: None,
            api_key_env_var: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_max_items_per_trigger")]
    pub max_items_per_trigger: usize,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Cost charged for a stage when the agent does not report one,
    /// keyed by stage slug (`scout`, `writer`, ...).
    #[serde(default = "default_stage_costs")]
    pub stage_costs_cents: BTreeMap<String, u64>,
}

fn default_stage_timeout() -> u64 {
    120
}

fn default_max_items_per_trigger() -> usize {
    3
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_stage_costs() -> BTreeMap<String, u64> {
    [
        ("scout", 1),
        ("scorer", 2),
        ("analyst", 4),
        ("architect", 4),
        ("writer", 10),
        ("qc", 3),
        ("optimizer", 4),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout(),
            max_items_per_trigger: default_max_items_per_trigger(),
            event_channel_capacity: default_event_channel_capacity(),
            stage_costs_cents: default_stage_costs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Users to run admission for on each tick. Empty means every user
    /// whose settings enable the pipeline.
    #[serde(default)]
    pub users: Vec<String>,
}

fn default_interval() -> u64 {
    900
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval(),
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateConfig {
    #[serde(default = "default_min_band")]
    pub min_band: f64,
    #[serde(default = "default_max_band")]
    pub max_band: f64,
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_margin")]
    pub margin: f64,
}

fn default_min_band() -> f64 {
    40.0
}

fn default_max_band() -> f64 {
    90.0
}

fn default_confidence_floor() -> f64 {
    0.6
}

fn default_learning_rate() -> f64 {
    0.2
}

fn default_margin() -> f64 {
    2.0
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_band: default_min_band(),
            max_band: default_max_band(),
            confidence_floor: default_confidence_floor(),
            learning_rate: default_learning_rate(),
            margin: default_margin(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::Pretty,
        }
    }
}
