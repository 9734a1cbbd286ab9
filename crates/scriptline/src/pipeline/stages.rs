//! Stage implementations and the registry the engine resolves them from.
//!
//! Stages 1–7 call the content agent through the idempotency ledger.
//! The gate decides locally from upstream scores; delivery assembles the
//! deliverable from upstream outputs. Neither makes a billed call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::agents::{AgentRequest, AgentResponse, ContentAgent};
use crate::gate::{decide, GateThresholds};
use crate::ledger::{IdempotencyKey, IdempotencyLedger};

use super::error::StageError;
use super::stage::{Stage, StageId, StageInput, StageOutput, StageResult};

/// Stages whose outputs carry the item's running score, latest first.
const SCORE_SOURCES: [StageId; 3] = [StageId::Optimizer, StageId::Qc, StageId::Scorer];

/// Stages whose outputs carry the script text, latest first.
const SCRIPT_SOURCES: [StageId; 3] = [StageId::Optimizer, StageId::Qc, StageId::Writer];

// ─── Agent-backed stages ────────────────────────────────────────────────────

pub struct AgentStage {
    id: StageId,
    agent: Arc<dyn ContentAgent>,
    ledger: IdempotencyLedger,
    /// Charged when the agent does not report a cost.
    default_cost_cents: u64,
}

impl AgentStage {
    pub fn new(
        id: StageId,
        agent: Arc<dyn ContentAgent>,
        ledger: IdempotencyLedger,
        default_cost_cents: u64,
    ) -> Self {
        Self {
            id,
            agent,
            ledger,
            default_cost_cents,
        }
    }
}

#[async_trait]
impl Stage for AgentStage {
    fn id(&self) -> StageId {
        self.id
    }

    async fn execute(&self, input: &StageInput<'_>) -> Result<StageResult, StageError> {
        let item = input.item;
        let request = AgentRequest {
            item_id: item.id.clone(),
            stage: self.id,
            source_type: item.source_type,
            title: item.title.clone(),
            content: item.content.clone(),
            upstream: input.context.upstream_of(self.id),
            style: input.settings.style_preferences.clone(),
        };
        let key = IdempotencyKey::derive(&item.id, self.id, &request)?;

        let outcome = self
            .ledger
            .get_or_create(&key, || async {
                let mut response = self.agent.run(self.id, &request).await?;
                response.cost_cents.get_or_insert(self.default_cost_cents);
                Ok::<AgentResponse, StageError>(response)
            })
            .await?;

        let response = outcome.value;
        let cost_cents = if outcome.created {
            response.cost_cents.unwrap_or(self.default_cost_cents)
        } else {
            0
        };
        if response.data.get("unfit").and_then(|v| v.as_bool()) == Some(true) {
            let reason = response
                .data
                .get("reason")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} judged the item unfit", self.id.name()));
            return Ok(StageResult::Failure { reason, cost_cents });
        }

        Ok(StageResult::Success(StageOutput {
            data: response.data,
            cost_cents,
            fresh: outcome.created,
        }))
    }
}

// ─── Gate ───────────────────────────────────────────────────────────────────

pub struct GateStage {
    thresholds: GateThresholds,
}

impl GateStage {
    pub fn new(thresholds: GateThresholds) -> Self {
        Self { thresholds }
    }
}

#[async_trait]
impl Stage for GateStage {
    fn id(&self) -> StageId {
        StageId::Gate
    }

    async fn execute(&self, input: &StageInput<'_>) -> Result<StageResult, StageError> {
        let final_score = input
            .context
            .latest_number(&SCORE_SOURCES, "score")
            .ok_or_else(|| StageError::MissingInput {
                stage: StageId::Scorer.name(),
                what: "score".to_string(),
            })?;
        let confidence = input
            .context
            .latest_number(&SCORE_SOURCES, "confidence")
            .unwrap_or(0.0);

        let threshold = self
            .thresholds
            .effective(&input.item.user_id, input.settings.min_score_threshold)?;
        let decision = decide(
            final_score,
            confidence,
            threshold,
            self.thresholds.config().confidence_floor,
            Utc::now(),
        );
        Ok(StageResult::GateDecision(decision))
    }
}

// ─── Delivery ───────────────────────────────────────────────────────────────

pub struct DeliveryStage;

#[async_trait]
impl Stage for DeliveryStage {
    fn id(&self) -> StageId {
        StageId::Delivery
    }

    async fn execute(&self, input: &StageInput<'_>) -> Result<StageResult, StageError> {
        let item = input.item;
        let script = input
            .context
            .latest_str(&SCRIPT_SOURCES, "script")
            .ok_or_else(|| StageError::MissingInput {
                stage: StageId::Writer.name(),
                what: "script".to_string(),
            })?;
        let decision = item.gate_decision().ok_or_else(|| StageError::MissingInput {
            stage: StageId::Gate.name(),
            what: "gate decision".to_string(),
        })?;
        if !decision.is_approved() {
            return Err(StageError::Invalid(
                "delivery reached with a rejected gate decision".to_string(),
            ));
        }

        let headline = input
            .context
            .latest_str(&[StageId::Optimizer, StageId::Architect], "headline")
            .unwrap_or(item.title.as_str());

        Ok(StageResult::Success(StageOutput::local(json!({
            "title": headline,
            "script": script,
            "sourceType": item.source_type,
            "sourceRef": item.source_ref,
            "finalScore": decision.final_score,
            "lowConfidence": decision.low_confidence,
            "style": input.settings.style_preferences,
        }))))
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Resolves the implementation for each stage number.
#[derive(Clone)]
pub struct StageRegistry {
    stages: HashMap<StageId, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            stages: HashMap::new(),
        }
    }

    /// The production line-up: agent stages 1–7, gate, delivery.
    pub fn standard(
        agent: Arc<dyn ContentAgent>,
        ledger: IdempotencyLedger,
        thresholds: GateThresholds,
        stage_costs_cents: &BTreeMap<String, u64>,
    ) -> Self {
        let mut registry = Self::empty();
        for id in StageId::ALL {
            let stage: Arc<dyn Stage> = match id {
                StageId::Gate => Arc::new(GateStage::new(thresholds.clone())),
                StageId::Delivery => Arc::new(DeliveryStage),
                _ => Arc::new(AgentStage::new(
                    id,
                    Arc::clone(&agent),
                    ledger.clone(),
                    stage_costs_cents.get(id.slug()).copied().unwrap_or(0),
                )),
            };
            registry.stages.insert(id, stage);
        }
        registry
    }

    /// Replaces (or adds) the implementation for `stage.id()`.
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(stage.id(), stage);
        self
    }

    pub fn get(&self, id: StageId) -> Option<Arc<dyn Stage>> {
        self.stages.get(&id).cloned()
    }

    pub fn is_complete(&self) -> bool {
        StageId::ALL.iter().all(|id| self.stages.contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentError;
    use crate::config::GateConfig;
    use crate::db::Database;
    use crate::gate::{GateDecision, Verdict};
    use crate::item::test_support::news_item;
    use crate::pipeline::context::ItemContext;
    use crate::settings::ItemSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedAgent {
        calls: AtomicUsize,
        data: serde_json::Value,
        cost: Option<u64>,
    }

    #[async_trait]
    impl ContentAgent for FixedAgent {
        async fn run(
            &self,
            _stage: StageId,
            _request: &AgentRequest,
        ) -> Result<AgentResponse, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AgentResponse {
                data: self.data.clone(),
                cost_cents: self.cost,
            })
        }
    }

    fn agent(data: serde_json::Value, cost: Option<u64>) -> Arc<FixedAgent> {
        Arc::new(FixedAgent {
            calls: AtomicUsize::new(0),
            data,
            cost,
        })
    }

    #[tokio::test]
    async fn test_agent_stage_bills_once_per_input() {
        let db = Database::open_in_memory().unwrap();
        let agent = agent(json!({"score": 70}), None);
        let stage = AgentStage::new(
            StageId::Scorer,
            agent.clone(),
            IdempotencyLedger::new(db),
            3,
        );
        let item = news_item("u1", "r");
        let ctx = ItemContext::new();
        let settings = ItemSettings::default();
        let input = StageInput {
            item: &item,
            context: &ctx,
            settings: &settings,
        };

        let first = stage.execute(&input).await.unwrap();
        let second = stage.execute(&input).await.unwrap();
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);

        match (first, second) {
            (StageResult::Success(a), StageResult::Success(b)) => {
                assert!(a.fresh);
                assert_eq!(a.cost_cents, 3);
                assert!(!b.fresh);
                assert_eq!(b.cost_cents, 0);
                assert_eq!(a.data, b.data);
            }
            other => panic!("unexpected results: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_stage_unfit_is_failure() {
        let db = Database::open_in_memory().unwrap();
        let stage = AgentStage::new(
            StageId::Qc,
            agent(json!({"unfit": true, "reason": "Factual errors"}), Some(1)),
            IdempotencyLedger::new(db),
            0,
        );
        let item = news_item("u1", "r");
        let ctx = ItemContext::new();
        let settings = ItemSettings::default();
        let result = stage
            .execute(&StageInput {
                item: &item,
                context: &ctx,
                settings: &settings,
            })
            .await
            .unwrap();
        assert!(matches!(result, StageResult::Failure { reason, cost_cents: 1 } if reason == "Factual errors"));
    }

    #[tokio::test]
    async fn test_gate_uses_latest_score() {
        let db = Database::open_in_memory().unwrap();
        let gate = GateStage::new(GateThresholds::new(db, GateConfig::default()));
        let item = news_item("u1", "r");
        let mut ctx = ItemContext::new();
        ctx.insert(StageId::Scorer, json!({"score": 90}));
        ctx.insert(StageId::Optimizer, json!({"score": 62, "confidence": 0.9}));
        let settings = ItemSettings {
            min_score_threshold: 65.0,
            ..ItemSettings::default()
        };

        let result = gate
            .execute(&StageInput {
                item: &item,
                context: &ctx,
                settings: &settings,
            })
            .await
            .unwrap();
        match result {
            StageResult::GateDecision(d) => {
                assert_eq!(d.verdict, Verdict::Reject);
                assert_eq!(d.final_score, 62.0);
                assert!(d.reason.contains("62") && d.reason.contains("65"));
            }
            other => panic!("expected gate decision, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gate_without_score_errors() {
        let db = Database::open_in_memory().unwrap();
        let gate = GateStage::new(GateThresholds::new(db, GateConfig::default()));
        let item = news_item("u1", "r");
        let ctx = ItemContext::new();
        let settings = ItemSettings::default();
        let err = gate
            .execute(&StageInput {
                item: &item,
                context: &ctx,
                settings: &settings,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::MissingInput { .. }));
    }

    #[tokio::test]
    async fn test_delivery_assembles_deliverable() {
        let mut item = news_item("u1", "https://x/1");
        let decision = GateDecision {
            verdict: Verdict::Approve,
            final_score: 81.0,
            confidence: 0.8,
            reason: "ok".to_string(),
            threshold: 65.0,
            low_confidence: false,
            decided_at: Utc::now(),
        };
        item.context.insert(StageId::Writer, json!({"script": "draft"}));
        item.context
            .insert(StageId::Optimizer, json!({"script": "final", "headline": "H"}));
        item.context
            .insert(StageId::Gate, serde_json::to_value(&decision).unwrap());
        let settings = ItemSettings::default();

        let result = DeliveryStage
            .execute(&StageInput {
                item: &item,
                context: &item.context,
                settings: &settings,
            })
            .await
            .unwrap();
        match result {
            StageResult::Success(out) => {
                assert_eq!(out.data["script"], json!("final"));
                assert_eq!(out.data["title"], json!("H"));
                assert_eq!(out.data["finalScore"], json!(81.0));
                assert_eq!(out.cost_cents, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_standard_registry_is_complete() {
        let db = Database::open_in_memory().unwrap();
        let registry = StageRegistry::standard(
            agent(json!({}), None),
            IdempotencyLedger::new(db.clone()),
            GateThresholds::new(db, GateConfig::default()),
            &BTreeMap::new(),
        );
        assert!(registry.is_complete());
        assert_eq!(registry.get(StageId::Gate).unwrap().id(), StageId::Gate);
        assert!(!StageRegistry::empty().is_complete());
    }
}
