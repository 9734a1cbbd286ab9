use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use scriptline::agents::{AgentError, ContentAgent, HttpContentAgent};
use scriptline::broadcast::EventBus;
use scriptline::budget::BudgetGuard;
use scriptline::config::AppConfig;
use scriptline::db::{Database, DatabaseError};
use scriptline::gate::GateThresholds;
use scriptline::item::ItemStore;
use scriptline::ledger::IdempotencyLedger;
use scriptline::pipeline::{PipelineEngine, StageRegistry};
use scriptline::secrets::{resolve_agent_key, SecretError};
use scriptline::settings::SettingsStore;
use scriptline::sources::StaticCandidateSource;
use scriptline::worker::Orchestrator;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] scriptline::ConfigError),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("Agent client error: {0}")]
    Agent(#[from] AgentError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("No database path configured and no home directory found")]
    NoDatabasePath,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state accessible by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Feeds the orchestrator; filled through `POST /candidates`.
    pub candidates: StaticCandidateSource,
    /// Wakes the scheduler loop; sent on shutdown so it exits without
    /// waiting out its interval.
    pub scheduler_trigger: broadcast::Sender<()>,
}

impl AppState {
    /// Wires the engine and its stores over one database.
    pub fn new(config: &AppConfig, db: Database, agent: Arc<dyn ContentAgent>) -> Self {
        let thresholds = GateThresholds::new(db.clone(), config.gate.clone());
        let stages = StageRegistry::standard(
            agent,
            IdempotencyLedger::new(db.clone()),
            thresholds.clone(),
            &config.pipeline.stage_costs_cents,
        );
        let engine = PipelineEngine::new(
            ItemStore::new(db.clone()),
            EventBus::new(db.clone(), config.pipeline.event_channel_capacity),
            BudgetGuard::new(db.clone()),
            SettingsStore::new(db),
            thresholds,
            stages,
            &config.pipeline,
        );
        let candidates = StaticCandidateSource::new();
        let orchestrator = Orchestrator::new(
            engine,
            Arc::new(candidates.clone()),
            config.pipeline.max_items_per_trigger,
        );
        let (scheduler_trigger, _) = broadcast::channel(4);

        Self {
            orchestrator,
            candidates,
            scheduler_trigger,
        }
    }

    /// Production constructor: opens the database and the HTTP agent client.
    pub fn from_config(config: AppConfig) -> Result<Self, ServerError> {
        let path = config
            .database
            .resolved_path()
            .ok_or(ServerError::NoDatabasePath)?;
        let db = Database::open(&path)?;
        let api_key = resolve_agent_key(&config.agent)?;
        let agent = HttpContentAgent::new(&config.agent, api_key)?;
        Ok(Self::new(&config, db, Arc::new(agent)))
    }

    pub fn engine(&self) -> &PipelineEngine {
        self.orchestrator.engine()
    }
}
