//! Admission cycle and the per-user background worker.
//!
//! A user has at most one worker at a time. A trigger that finds one
//! running is refused with `already_processing`; the running worker keeps
//! draining the user's `processing` items, including ones put back by a
//! retry while it was busy.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broadcast::{EventType, NewEvent};
use crate::budget::{BudgetError, DenialReason};
use crate::db::DatabaseError;
use crate::error::SettingsError;
use crate::item::{Item, ItemStore};
use crate::pipeline::{EngineError, PipelineEngine, StageId, Step};
use crate::settings::ItemSettings;
use crate::sources::{CandidateSource, EligibilityFilter, SourceError};

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Admission denied: {0}")]
    Denied(DenialReason),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("Candidate source error: {0}")]
    Source(#[from] SourceError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl AdmissionError {
    pub fn denial(&self) -> Option<DenialReason> {
        match self {
            AdmissionError::Denied(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// What a trigger started. Processing happens in the background.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerOutcome {
    /// Items left `processing` by an earlier run, picked up again.
    pub resumed: Vec<String>,
    pub admitted: Vec<String>,
    /// Candidates skipped as ineligible or already seen.
    pub skipped: usize,
    /// Set when admission stopped early on a limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied: Option<DenialReason>,
}

/// Users with a live worker.
#[derive(Clone, Default)]
struct ActiveUsers {
    users: Arc<Mutex<HashSet<String>>>,
}

impl ActiveUsers {
    fn claim(&self, user_id: &str) -> Option<UserClaim> {
        let mut users = self.users.lock().ok()?;
        if !users.insert(user_id.to_string()) {
            return None;
        }
        Some(UserClaim {
            active: self.clone(),
            user_id: user_id.to_string(),
            released: false,
        })
    }

    fn contains(&self, user_id: &str) -> bool {
        self.users
            .lock()
            .map(|users| users.contains(user_id))
            .unwrap_or(false)
    }
}

/// Holds a user's worker slot. Dropping it frees the slot.
struct UserClaim {
    active: ActiveUsers,
    user_id: String,
    released: bool,
}

impl UserClaim {
    /// Frees the slot only if `idle` still holds while no one else can
    /// claim it. Returns false when there is more work.
    fn release_if(&mut self, idle: impl FnOnce() -> bool) -> bool {
        let Ok(mut users) = self.active.users.lock() else {
            return true;
        };
        if !idle() {
            return false;
        }
        users.remove(&self.user_id);
        self.released = true;
        true
    }
}

impl Drop for UserClaim {
    fn drop(&mut self) {
        if !self.released {
            if let Ok(mut users) = self.active.users.lock() {
                users.remove(&self.user_id);
            }
        }
    }
}

/// Next `processing` item not yet attempted at its current retry count.
fn next_pending(
    items: &ItemStore,
    user_id: &str,
    attempted: &HashMap<String, u32>,
) -> Result<Option<Item>, EngineError> {
    Ok(items
        .find_processing(user_id)?
        .into_iter()
        .find(|item| attempted.get(&item.id) != Some(&item.retry_count)))
}

#[derive(Clone)]
pub struct Orchestrator {
    engine: PipelineEngine,
    source: Arc<dyn CandidateSource>,
    max_items_per_trigger: usize,
    active: ActiveUsers,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        engine: PipelineEngine,
        source: Arc<dyn CandidateSource>,
        max_items_per_trigger: usize,
    ) -> Self {
        Self {
            engine,
            source,
            max_items_per_trigger,
            active: ActiveUsers::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn engine(&self) -> &PipelineEngine {
        &self.engine
    }

    pub fn is_processing(&self, user_id: &str) -> bool {
        self.active.contains(user_id)
    }

    /// Resumes leftovers, admits up to N new items and starts the user's
    /// worker. Returns as soon as the worker is running.
    pub async fn trigger(&self, user_id: &str) -> Result<TriggerOutcome, AdmissionError> {
        let (outcome, _handle) = self.start(user_id).await?;
        Ok(outcome)
    }

    /// Like [`trigger`](Self::trigger) but waits for the worker to finish.
    pub async fn trigger_and_wait(&self, user_id: &str) -> Result<TriggerOutcome, AdmissionError> {
        let (outcome, handle) = self.start(user_id).await?;
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Worker for user {} panicked: {}", user_id, e);
            }
        }
        Ok(outcome)
    }

    async fn start(
        &self,
        user_id: &str,
    ) -> Result<(TriggerOutcome, Option<JoinHandle<()>>), AdmissionError> {
        let claim = self
            .active
            .claim(user_id)
            .ok_or(AdmissionError::Denied(DenialReason::AlreadyProcessing))?;

        let settings = self.engine.settings().get(user_id)?;
        if !settings.enabled {
            return Err(AdmissionError::Denied(DenialReason::PipelineDisabled));
        }

        let mut outcome = TriggerOutcome {
            resumed: self
                .engine
                .items()
                .find_processing(user_id)
                .map_err(EngineError::from)?
                .into_iter()
                .map(|item| item.id)
                .collect(),
            ..TriggerOutcome::default()
        };

        let decision = self.engine.budget().can_admit(user_id, &settings)?;
        if let Some(reason) = decision.reason {
            if outcome.resumed.is_empty() {
                return Err(AdmissionError::Denied(reason));
            }
            outcome.denied = Some(reason);
        } else {
            self.admit(user_id, &settings, &mut outcome).await?;
        }

        if outcome.resumed.is_empty() && outcome.admitted.is_empty() {
            if let Some(reason) = outcome.denied {
                return Err(AdmissionError::Denied(reason));
            }
            debug!(user_id, skipped = outcome.skipped, "Nothing to process");
            return Ok((outcome, None));
        }

        info!(
            user_id,
            resumed = outcome.resumed.len(),
            admitted = outcome.admitted.len(),
            "Starting worker"
        );
        Ok((outcome, Some(self.spawn_worker(claim))))
    }

    async fn admit(
        &self,
        user_id: &str,
        settings: &crate::settings::Settings,
        outcome: &mut TriggerOutcome,
    ) -> Result<(), AdmissionError> {
        let filter = EligibilityFilter::from_settings(settings)?;
        let snapshot = ItemSettings::from(settings);
        let candidates = self.source.candidates(user_id).await?;
        let now = Utc::now();

        for candidate in candidates {
            if outcome.admitted.len() >= self.max_items_per_trigger {
                break;
            }
            if let Err(reason) = filter.check(&candidate, now) {
                debug!(source_ref = %candidate.source_ref, %reason, "Skipping candidate");
                outcome.skipped += 1;
                continue;
            }
            if self
                .engine
                .items()
                .source_ref_exists(user_id, &candidate.source_ref)
                .map_err(EngineError::from)?
            {
                outcome.skipped += 1;
                continue;
            }

            let decision = self.engine.budget().record_admission(user_id, settings)?;
            if let Some(reason) = decision.reason {
                info!(user_id, reason = reason.code(), "Admission stopped");
                outcome.denied = Some(reason);
                break;
            }

            let item = Item::new(candidate.into_new_item(user_id, snapshot.clone()), now);
            self.engine
                .items()
                .create(&item)
                .map_err(EngineError::from)?;
            self.engine.events().emit(NewEvent::new(
                EventType::ItemStarted,
                user_id,
                &item.id,
                Some(StageId::Scout),
                format!("Admitted: {}", item.title),
                0.0,
            ))?;
            outcome.admitted.push(item.id);
        }
        Ok(())
    }

    fn spawn_worker(&self, mut claim: UserClaim) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let user_id = claim.user_id.clone();
        let span = info_span!("worker", user_id = %user_id);

        tokio::spawn(
            async move {
                let mut attempted: HashMap<String, u32> = HashMap::new();
                loop {
                    if shutdown.load(Ordering::Acquire) {
                        info!("Worker stopping on shutdown");
                        break;
                    }
                    let next = match next_pending(engine.items(), &user_id, &attempted) {
                        Ok(next) => next,
                        Err(e) => {
                            error!("Failed to load pending items: {}", e);
                            break;
                        }
                    };
                    let Some(item) = next else {
                        let released = claim.release_if(|| {
                            matches!(next_pending(engine.items(), &user_id, &attempted), Ok(None))
                        });
                        if released {
                            break;
                        }
                        continue;
                    };

                    attempted.insert(item.id.clone(), item.retry_count);
                    match engine.run_item(&item.id).await {
                        Ok(outcome) if outcome.step == Step::Completed => {
                            info!(item_id = %item.id, "Item delivered")
                        }
                        Ok(outcome) => {
                            info!(item_id = %item.id, step = ?outcome.step, "Item finished")
                        }
                        Err(e) if e.is_conflict() => {
                            warn!(item_id = %item.id, "Lost a concurrent update: {}", e)
                        }
                        Err(e) => error!(item_id = %item.id, "Item run failed: {}", e),
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Puts a failed item back into processing and makes sure a worker
    /// picks it up.
    pub fn retry(&self, item_id: &str) -> Result<Item, EngineError> {
        let item = self.engine.retry(item_id)?;
        if let Some(claim) = self.active.claim(&item.user_id) {
            self.spawn_worker(claim);
        }
        Ok(item)
    }

    /// Stops workers at their next item boundary.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
