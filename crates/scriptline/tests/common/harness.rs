//! Test harness for isolated pipeline runs.
//!
//! The `TestHarness` struct wires the production stage line-up against a
//! temporary on-disk database and a `ScriptedAgent`, so tests exercise the
//! real ledger, budget, gate and item store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use scriptline::agents::{AgentRequest, AgentResponse};
use scriptline::config::{GateConfig, PipelineConfig};
use scriptline::item::NewItem;
use scriptline::{
    AgentError, BudgetGuard, Candidate, ContentAgent, Database, EventBus, GateThresholds,
    IdempotencyLedger, Item, ItemSettings, ItemStore, Orchestrator, PipelineEngine, Settings, SettingsStore,
    SourceType, StageId, StageRegistry, StaticCandidateSource,
};

/// Content agent with scripted outputs and a per-stage call counter.
pub struct ScriptedAgent {
    score: Mutex<f64>,
    failing: Mutex<Option<StageId>>,
    unfit: Mutex<Option<StageId>>,
    delay: Mutex<Duration>,
    calls: Mutex<HashMap<StageId, usize>>,
}

impl ScriptedAgent {
    pub fn new(score: f64) -> Self {
        Self {
            score: Mutex::new(score),
            failing: Mutex::new(None),
            unfit: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Makes `stage` fail with a 503 until cleared with `None`.
    pub fn fail_at(&self, stage: Option<StageId>) {
        *self.failing.lock().unwrap() = stage;
    }

    /// Makes `stage` answer (and bill) an "unfit" verdict.
    pub fn unfit_at(&self, stage: Option<StageId>) {
        *self.unfit.lock().unwrap() = stage;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self, stage: StageId) -> usize {
        self.calls.lock().unwrap().get(&stage).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ContentAgent for ScriptedAgent {
    async fn run(&self, stage: StageId, _request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        *self.calls.lock().unwrap().entry(stage).or_insert(0) += 1;

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if *self.failing.lock().unwrap() == Some(stage) {
            return Err(AgentError::Http {
                status: 503,
                body: "upstream unavailable".to_string(),
            });
        }
        if *self.unfit.lock().unwrap() == Some(stage) {
            return Ok(AgentResponse {
                data: json!({"unfit": true, "reason": "Too thin to script"}),
                cost_cents: Some(1),
            });
        }

        let data = match stage {
            StageId::Scorer => json!({"score": *self.score.lock().unwrap(), "confidence": 0.9}),
            StageId::Architect => json!({"headline": "Chip rules tighten"}),
            StageId::Writer => json!({"script": "Here is what changed this week."}),
            _ => json!({"ok": true}),
        };
        Ok(AgentResponse {
            data,
            cost_cents: Some(1),
        })
    }
}

/// Test harness providing an isolated engine, orchestrator and database.
pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub db: Database,
    pub agent: Arc<ScriptedAgent>,
    pub source: StaticCandidateSource,
    pub engine: PipelineEngine,
    pub orchestrator: Orchestrator,
}

impl TestHarness {
    /// A harness whose Scorer reports `score`.
    pub fn new(score: f64) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("scriptline.db");
        let agent = Arc::new(ScriptedAgent::new(score));
        Self::build(temp_dir, db_path, agent)
    }

    fn build(temp_dir: TempDir, db_path: PathBuf, agent: Arc<ScriptedAgent>) -> Self {
        let db = Database::open(&db_path).expect("Failed to open database");
        let config = PipelineConfig {
            stage_timeout_secs: 10,
            ..PipelineConfig::default()
        };
        let thresholds = GateThresholds::new(db.clone(), GateConfig::default());
        let stages = StageRegistry::standard(
            Arc::clone(&agent) as Arc<dyn ContentAgent>,
            IdempotencyLedger::new(db.clone()),
            thresholds.clone(),
            &config.stage_costs_cents,
        );
        let engine = PipelineEngine::new(
            ItemStore::new(db.clone()),
            EventBus::new(db.clone(), config.event_channel_capacity),
            BudgetGuard::new(db.clone()),
            SettingsStore::new(db.clone()),
            thresholds,
            stages,
            &config,
        );
        let source = StaticCandidateSource::new();
        let orchestrator = Orchestrator::new(
            engine.clone(),
            Arc::new(source.clone()),
            config.max_items_per_trigger,
        );
        Self {
            temp_dir,
            db_path,
            db,
            agent,
            source,
            engine,
            orchestrator,
        }
    }

    /// Simulates a process restart: a fresh engine and orchestrator over
    /// the same database file and agent.
    pub fn restart(self) -> Self {
        let Self {
            temp_dir,
            db_path,
            agent,
            ..
        } = self;
        Self::build(temp_dir, db_path, agent)
    }

    pub fn put_settings(&self, user_id: &str, settings: &Settings) {
        self.engine
            .settings()
            .put(user_id, settings)
            .expect("Failed to store settings");
    }

    pub fn push_candidate(&self, user_id: &str, candidate: Candidate) {
        self.source.push(user_id, candidate);
    }

    /// Creates a processing item at stage 1, bypassing admission. The item
    /// carries the user's current settings, as admission would stamp them.
    pub fn admit(&self, user_id: &str, source_ref: &str) -> Item {
        let settings = self
            .engine
            .settings()
            .get(user_id)
            .expect("Failed to load settings");
        let item = Item::new(
            NewItem {
                user_id: user_id.to_string(),
                source_type: SourceType::News,
                source_ref: source_ref.to_string(),
                title: format!("Story {}", source_ref),
                content: "Regulators announced new rules for chip exports.".to_string(),
                settings: ItemSettings::from(&settings),
            },
            chrono::Utc::now(),
        );
        self.engine.items().create(&item).expect("Failed to create item");
        self.item(&item.id)
    }

    pub fn item(&self, id: &str) -> Item {
        self.engine
            .items()
            .get(id)
            .expect("Failed to load item")
            .expect("Item not found")
    }
}
