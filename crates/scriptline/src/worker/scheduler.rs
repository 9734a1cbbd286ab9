use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::budget::DenialReason;

use super::admission::{AdmissionError, Orchestrator};

/// Periodically runs an admission cycle for each user.
pub struct TriggerScheduler {
    orchestrator: Orchestrator,
    interval: Duration,
    /// Fixed user list; empty means every user with `enabled` settings.
    users: Vec<String>,
    shutdown: Arc<AtomicBool>,
}

impl TriggerScheduler {
    pub fn new(orchestrator: Orchestrator, interval: Duration, users: Vec<String>) -> Self {
        Self {
            orchestrator,
            interval,
            users,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the loop on the current runtime. A message on `trigger_rx`
    /// runs a cycle immediately.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;
        let users = self.users.clone();

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            interval_timer.tick().await; // skip immediate first tick

            loop {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                tokio::select! {
                    _ = interval_timer.tick() => {},
                    Ok(()) = trigger_rx.recv() => {
                        tracing::info!("Manual admission cycle triggered");
                    },
                }

                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                run_cycle(&orchestrator, &users).await;
            }
            tracing::info!("Trigger scheduler stopped");
        })
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

async fn run_cycle(orchestrator: &Orchestrator, users: &[String]) {
    let users = if users.is_empty() {
        match orchestrator.engine().settings().enabled_users() {
            Ok(users) => users,
            Err(e) => {
                tracing::error!("Failed to list enabled users: {}", e);
                return;
            }
        }
    } else {
        users.to_vec()
    };

    for user_id in users {
        match orchestrator.trigger(&user_id).await {
            Ok(outcome) if !outcome.admitted.is_empty() || !outcome.resumed.is_empty() => {
                tracing::info!(
                    user_id = %user_id,
                    admitted = outcome.admitted.len(),
                    resumed = outcome.resumed.len(),
                    "Scheduled cycle started work"
                );
            }
            Ok(_) => {}
            Err(AdmissionError::Denied(
                reason @ (DenialReason::AlreadyProcessing | DenialReason::PipelineDisabled),
            )) => {
                tracing::debug!(user_id = %user_id, reason = reason.code(), "Skipped");
            }
            Err(AdmissionError::Denied(reason)) => {
                tracing::info!(user_id = %user_id, reason = reason.code(), "Admission denied");
            }
            Err(e) => tracing::error!(user_id = %user_id, "Scheduled cycle failed: {}", e),
        }
    }
}
