pub mod agents;
pub mod broadcast;
pub mod budget;
pub mod config;
pub mod db;
pub mod error;
pub mod gate;
pub mod item;
pub mod ledger;
pub mod logging;
pub mod pipeline;
pub mod secrets;
pub mod settings;
pub mod sources;
pub mod worker;

pub use agents::{AgentError, ContentAgent, HttpContentAgent};
pub use broadcast::{EventBus, EventSubscription, EventType, PipelineEvent};
pub use budget::{BudgetGuard, DenialReason};
pub use config::{load_config, load_config_from_env, AppConfig};
pub use db::Database;
pub use error::{ConfigError, Result, ScriptlineError, SettingsError};
pub use gate::{GateDecision, GateThresholds, Verdict};
pub use item::{Item, ItemStatus, ItemStore, SourceType};
pub use ledger::{IdempotencyKey, IdempotencyLedger};
pub use pipeline::{EngineError, PipelineEngine, StageId, StageRegistry};
pub use secrets::{resolve_secret, SecretError};
pub use settings::{ItemSettings, Settings, SettingsStore};
pub use sources::{Candidate, CandidateSource, StaticCandidateSource};
pub use worker::{AdmissionError, Orchestrator, TriggerOutcome, TriggerScheduler};
