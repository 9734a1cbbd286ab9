//! Drives one item through the nine stages.
//!
//! Every mutation is read-modify-write against the item store's version
//! column: a save that loses the race surfaces as
//! [`EngineError::Conflict`] and the in-memory copy is discarded.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::broadcast::{EventBus, EventType, NewEvent};
use crate::budget::BudgetGuard;
use crate::config::PipelineConfig;
use crate::db::DatabaseError;
use crate::gate::{GateDecision, GateThresholds};
use crate::item::{Feedback, FailureKind, Item, ItemStatus, ItemStore, StageAttempt};
use crate::settings::SettingsStore;

use super::error::{EngineError, StageError};
use super::stage::{StageId, StageInput, StageResult};
use super::stages::StageRegistry;

pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// What a single `advance` did to the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A stage completed and the item moved on.
    Advanced,
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

impl Step {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Step::Advanced)
    }
}

#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub step: Step,
    pub item: Item,
}

#[derive(Debug, Clone)]
pub struct FeedbackOutcome {
    pub item: Item,
    /// Effective gate threshold after applying the verdict.
    pub threshold: f64,
}

/// Share of distinct stages completed, 0..=100.
fn percent(item: &Item) -> f64 {
    item.completed_stages().len() as f64 / StageId::COUNT as f64 * 100.0
}

fn failure_kind_of(error: &StageError) -> FailureKind {
    match error {
        StageError::Timeout { .. } | StageError::Agent(crate::agents::AgentError::Timeout) => {
            FailureKind::Timeout
        }
        _ => FailureKind::Error,
    }
}

#[derive(Clone)]
pub struct PipelineEngine {
    items: ItemStore,
    events: EventBus,
    budget: BudgetGuard,
    settings: SettingsStore,
    thresholds: GateThresholds,
    stages: StageRegistry,
    stage_timeout: Duration,
}

impl PipelineEngine {
    pub fn new(
        items: ItemStore,
        events: EventBus,
        budget: BudgetGuard,
        settings: SettingsStore,
        thresholds: GateThresholds,
        stages: StageRegistry,
        config: &PipelineConfig,
    ) -> Self {
        if !stages.is_complete() {
            warn!("Stage registry is missing stages; items reaching them will fail");
        }
        Self {
            items,
            events,
            budget,
            settings,
            thresholds,
            stages,
            stage_timeout: Duration::from_secs(config.stage_timeout_secs),
        }
    }

    pub fn items(&self) -> &ItemStore {
        &self.items
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn budget(&self) -> &BudgetGuard {
        &self.budget
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn thresholds(&self) -> &GateThresholds {
        &self.thresholds
    }

    fn load(&self, item_id: &str) -> Result<Item, EngineError> {
        self.items
            .get(item_id)?
            .ok_or_else(|| EngineError::NotFound(item_id.to_string()))
    }

    fn emit(
        &self,
        event_type: EventType,
        item: &Item,
        stage: Option<StageId>,
        message: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.events.emit(NewEvent::new(
            event_type,
            &item.user_id,
            &item.id,
            stage,
            message,
            percent(item),
        ))?;
        Ok(())
    }

    /// Runs the item's current stage once and persists the result.
    pub async fn advance(&self, item_id: &str) -> Result<ItemOutcome, EngineError> {
        let mut item = self.load(item_id)?;
        if item.status != ItemStatus::Processing {
            return Err(EngineError::InvalidState {
                item_id: item.id,
                status: item.status,
                expected: "processing",
            });
        }

        if item.cancel_requested {
            return self.finish_cancelled(item);
        }

        let stage = item
            .stage()
            .ok_or_else(|| EngineError::NoStage(item.id.clone()))?;
        let implementation = self
            .stages
            .get(stage)
            .ok_or_else(|| EngineError::NoStage(item.id.clone()))?;

        self.emit(
            EventType::StageStarted,
            &item,
            Some(stage),
            format!("Starting {}", stage.name()),
        )?;

        let span = info_span!("stage", item_id = %item.id, stage = stage.slug());
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = {
            let input = StageInput {
                item: &item,
                context: &item.context,
                settings: &item.settings,
            };
            match tokio::time::timeout(self.stage_timeout, implementation.execute(&input))
                .instrument(span.clone())
                .await
            {
                Ok(result) => result,
                Err(_) => Err(StageError::Timeout {
                    secs: self.stage_timeout.as_secs(),
                }),
            }
        };
        let finished_at = Utc::now();
        let duration_ms = clock.elapsed().as_millis() as u64;
        let _entered = span.enter();

        let mut attempt = StageAttempt {
            stage,
            started_at,
            finished_at: Some(finished_at),
            completed: false,
            duration_ms,
            error: None,
            cost_cents: 0,
        };
        item.updated_at = finished_at;

        match result {
            Ok(StageResult::Success(output)) => {
                if output.fresh {
                    attempt.cost_cents = self.charge(&item, output.cost_cents);
                }
                attempt.completed = true;
                item.stage_history.push(attempt);
                item.context.insert(stage, output.data);
                self.complete_stage(item, stage)
            }
            Ok(StageResult::GateDecision(decision)) => self.apply_gate(item, attempt, decision),
            Ok(StageResult::Failure { reason, cost_cents }) => {
                attempt.cost_cents = self.charge(&item, cost_cents);
                self.fail(item, attempt, stage, FailureKind::Error, reason)
            }
            Err(error) => {
                warn!("Stage {} failed: {}", stage, error);
                self.fail(item, attempt, stage, failure_kind_of(&error), error.to_string())
            }
        }
    }

    /// Books spend for a billed call. Runs before the item is saved: the
    /// money is gone even if the save then loses a version race.
    fn charge(&self, item: &Item, cost_cents: u64) -> u64 {
        if cost_cents == 0 {
            return 0;
        }
        if let Err(e) = self.budget.record_spend(&item.user_id, cost_cents) {
            warn!("Failed to record spend of {}c: {}", cost_cents, e);
        }
        cost_cents
    }

    fn complete_stage(&self, mut item: Item, stage: StageId) -> Result<ItemOutcome, EngineError> {
        let step = match stage.next() {
            Some(next) => {
                item.current_stage = next.number();
                Step::Advanced
            }
            None => {
                item.current_stage = StageId::COUNT + 1;
                item.status = ItemStatus::Completed;
                item.completed_at = Some(item.updated_at);
                Step::Completed
            }
        };
        self.items.save(&mut item)?;

        self.emit(
            EventType::StageCompleted,
            &item,
            Some(stage),
            format!("{} completed", stage.name()),
        )?;
        if step == Step::Completed {
            info!("Item completed");
            self.emit(EventType::ItemCompleted, &item, None, "Script delivered")?;
        } else {
            debug!("Advanced to stage {}", item.current_stage);
        }
        Ok(ItemOutcome { step, item })
    }

    fn apply_gate(
        &self,
        mut item: Item,
        mut attempt: StageAttempt,
        decision: GateDecision,
    ) -> Result<ItemOutcome, EngineError> {
        let value = serde_json::to_value(&decision)
            .map_err(|source| DatabaseError::Json {
                column: "context",
                source,
            })?;
        item.context.insert(StageId::Gate, value);

        if decision.is_approved() {
            if decision.low_confidence {
                info!(
                    score = decision.final_score,
                    confidence = decision.confidence,
                    "Approved with low confidence"
                );
            }
            attempt.completed = true;
            item.stage_history.push(attempt);
            return self.complete_stage(item, StageId::Gate);
        }

        info!(
            score = decision.final_score,
            threshold = decision.threshold,
            "Gate rejected item"
        );
        let outcome = self.fail(
            item,
            attempt,
            StageId::Gate,
            FailureKind::Rejected,
            decision.reason,
        )?;
        Ok(ItemOutcome {
            step: Step::Rejected,
            item: outcome.item,
        })
    }

    fn fail(
        &self,
        mut item: Item,
        mut attempt: StageAttempt,
        stage: StageId,
        kind: FailureKind,
        message: String,
    ) -> Result<ItemOutcome, EngineError> {
        attempt.error = Some(message.clone());
        item.stage_history.push(attempt);
        item.status = ItemStatus::Failed;
        item.error_stage = Some(stage.number());
        item.error_message = Some(message.clone());
        item.failure_kind = Some(kind);
        self.items.save(&mut item)?;

        self.emit(EventType::StageFailed, &item, Some(stage), message.clone())?;
        self.emit(EventType::ItemFailed, &item, Some(stage), message)?;
        Ok(ItemOutcome {
            step: Step::Failed,
            item,
        })
    }

    fn finish_cancelled(&self, mut item: Item) -> Result<ItemOutcome, EngineError> {
        info!(item_id = %item.id, "Honouring cancel request");
        item.status = ItemStatus::Cancelled;
        item.error_stage = Some(item.current_stage);
        item.error_message = Some(CANCELLED_MESSAGE.to_string());
        item.updated_at = Utc::now();
        self.items.save_clearing_cancel(&mut item)?;
        self.emit(EventType::ItemFailed, &item, item.stage(), CANCELLED_MESSAGE)?;
        Ok(ItemOutcome {
            step: Step::Cancelled,
            item,
        })
    }

    /// Advances until the item reaches a terminal state.
    pub async fn run_item(&self, item_id: &str) -> Result<ItemOutcome, EngineError> {
        let span = info_span!("item", item_id = %item_id);
        async {
            loop {
                let outcome = self.advance(item_id).await?;
                if outcome.step.is_terminal() {
                    return Ok(outcome);
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Puts a failed item back into processing at the stage that failed.
    /// The caller decides when to run it.
    pub fn retry(&self, item_id: &str) -> Result<Item, EngineError> {
        let mut item = self.load(item_id)?;
        if item.status != ItemStatus::Failed {
            return Err(EngineError::InvalidState {
                item_id: item.id,
                status: item.status,
                expected: "failed",
            });
        }
        if !item.is_retryable() {
            return Err(EngineError::NotRetryable(item.id));
        }

        let stage = item.error_stage.unwrap_or(item.current_stage);
        item.status = ItemStatus::Processing;
        item.current_stage = stage;
        item.retry_count += 1;
        item.error_stage = None;
        item.error_message = None;
        item.failure_kind = None;
        item.completed_at = None;
        item.updated_at = Utc::now();
        self.items.save_clearing_cancel(&mut item)?;

        info!(item_id = %item.id, stage, retry_count = item.retry_count, "Item queued for retry");
        self.emit(
            EventType::ItemStarted,
            &item,
            item.stage(),
            format!("Retry {} from stage {}", item.retry_count, stage),
        )?;
        Ok(item)
    }

    /// Requests cancellation; honoured at the next stage boundary.
    pub fn cancel(&self, item_id: &str) -> Result<Item, EngineError> {
        let item = self.load(item_id)?;
        if item.status == ItemStatus::Processing && self.items.request_cancel(item_id)? {
            info!(item_id, "Cancel requested");
            return self.load(item_id);
        }
        // Either it was never processing or it finished in between.
        let item = if item.status == ItemStatus::Processing {
            self.load(item_id)?
        } else {
            item
        };
        Err(EngineError::InvalidState {
            item_id: item.id,
            status: item.status,
            expected: "processing",
        })
    }

    /// Records a human verdict on a delivered item, once, and feeds it to
    /// the adaptive threshold.
    pub fn record_feedback(
        &self,
        item_id: &str,
        approved: bool,
    ) -> Result<FeedbackOutcome, EngineError> {
        let mut item = self.load(item_id)?;
        if item.status != ItemStatus::Completed {
            return Err(EngineError::InvalidState {
                item_id: item.id,
                status: item.status,
                expected: "completed",
            });
        }
        if item.feedback.is_some() {
            return Err(EngineError::FeedbackAlreadyRecorded(item.id));
        }
        let decision = item.gate_decision().ok_or_else(|| EngineError::InvalidState {
            item_id: item.id.clone(),
            status: item.status,
            expected: "a gate decision",
        })?;

        let now = Utc::now();
        item.feedback = Some(Feedback {
            approved,
            recorded_at: now,
        });
        item.updated_at = now;
        // The versioned save is what makes feedback count once.
        self.items.save(&mut item)?;

        let settings = self.settings.get(&item.user_id)?;
        let threshold = self.thresholds.record_feedback(
            &item.user_id,
            settings.min_score_threshold,
            decision.final_score,
            approved,
        )?;
        info!(item_id, approved, threshold, "Feedback recorded");
        Ok(FeedbackOutcome { item, threshold })
    }
}
