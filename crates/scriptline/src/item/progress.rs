//! Progress view derived from an item's history.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pipeline::stage::StageId;

use super::{Item, ItemStatus};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageProgress {
    pub stage: StageId,
    pub name: &'static str,
    pub state: StageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemProgress {
    pub item_id: String,
    pub status: ItemStatus,
    pub current_stage: u8,
    pub stage_name: &'static str,
    /// Completed stages over the total, 0..=100.
    pub progress_percent: f64,
    pub elapsed_ms: u64,
    /// Remaining stages times this item's mean completed-stage duration.
    /// Unknown until one stage has completed.
    pub estimated_remaining_ms: Option<u64>,
    pub stages: Vec<StageProgress>,
}

impl ItemProgress {
    pub fn from_item(item: &Item, now: DateTime<Utc>) -> Self {
        let completed = item.completed_stages();
        let total = u64::from(StageId::COUNT);
        let done = completed.len() as u64;

        // Latest successful duration per completed stage.
        let durations: Vec<(StageId, u64)> = completed
            .iter()
            .filter_map(|stage| {
                item.stage_history
                    .iter()
                    .rev()
                    .find(|a| a.stage == *stage && a.completed)
                    .map(|a| (*stage, a.duration_ms))
            })
            .collect();

        let estimated_remaining_ms = match item.status {
            ItemStatus::Completed => Some(0),
            ItemStatus::Processing if !durations.is_empty() => {
                let sum: u64 = durations.iter().map(|(_, d)| *d).sum();
                let avg = sum / durations.len() as u64;
                Some(total.saturating_sub(done) * avg)
            }
            _ => None,
        };

        let end = item.completed_at.unwrap_or(now);
        let elapsed_ms = (end - item.started_at).num_milliseconds().max(0) as u64;

        let stages = StageId::ALL
            .iter()
            .map(|stage| {
                let duration_ms = durations
                    .iter()
                    .find(|(s, _)| s == stage)
                    .map(|(_, d)| *d);
                let state = if duration_ms.is_some() {
                    StageState::Completed
                } else if stage.number() == item.current_stage {
                    match item.status {
                        ItemStatus::Processing => StageState::Running,
                        ItemStatus::Failed => StageState::Failed,
                        _ => StageState::Pending,
                    }
                } else {
                    StageState::Pending
                };
                StageProgress {
                    stage: *stage,
                    name: stage.name(),
                    state,
                    duration_ms,
                }
            })
            .collect();

        let stage_name = item.stage().map(StageId::name).unwrap_or("Done");

        Self {
            item_id: item.id.clone(),
            status: item.status,
            current_stage: item.current_stage,
            stage_name,
            progress_percent: done as f64 / total as f64 * 100.0,
            elapsed_ms,
            estimated_remaining_ms,
            stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::test_support::{attempt, news_item};
    use chrono::Duration;

    #[test]
    fn test_fresh_item() {
        let item = news_item("u1", "r");
        let progress = ItemProgress::from_item(&item, item.started_at);
        assert_eq!(progress.progress_percent, 0.0);
        assert_eq!(progress.estimated_remaining_ms, None);
        assert_eq!(progress.stage_name, "Scout");
        assert_eq!(progress.stages[0].state, StageState::Running);
        assert!(progress.stages[1..]
            .iter()
            .all(|s| s.state == StageState::Pending));
    }

    #[test]
    fn test_estimate_uses_mean_of_completed_stages() {
        let mut item = news_item("u1", "r");
        item.stage_history.push(attempt(StageId::Scout, true, 1_000));
        item.stage_history.push(attempt(StageId::Scorer, true, 3_000));
        item.stage_history.push(attempt(StageId::Analyst, true, 2_000));
        item.current_stage = 4;

        let progress = ItemProgress::from_item(&item, item.started_at + Duration::seconds(6));
        assert!((progress.progress_percent - 100.0 / 3.0).abs() < 1e-9);
        // 6 remaining stages * 2000ms mean.
        assert_eq!(progress.estimated_remaining_ms, Some(12_000));
        assert_eq!(progress.elapsed_ms, 6_000);
        assert_eq!(progress.stage_name, "Architect");
        assert_eq!(progress.stages[3].state, StageState::Running);
    }

    #[test]
    fn test_failed_attempts_do_not_count() {
        let mut item = news_item("u1", "r");
        item.stage_history.push(attempt(StageId::Scout, true, 500));
        item.stage_history.push(attempt(StageId::Scorer, false, 9_000));
        item.current_stage = 2;
        item.status = ItemStatus::Failed;

        let progress = ItemProgress::from_item(&item, Utc::now());
        assert!((progress.progress_percent - 100.0 / 9.0).abs() < 1e-9);
        assert_eq!(progress.stages[1].state, StageState::Failed);
        assert_eq!(progress.estimated_remaining_ms, None);
    }

    #[test]
    fn test_completed_item() {
        let mut item = news_item("u1", "r");
        for stage in StageId::ALL {
            item.stage_history.push(attempt(stage, true, 100));
        }
        item.current_stage = 10;
        item.status = ItemStatus::Completed;
        item.completed_at = Some(item.started_at + Duration::seconds(1));

        let progress = ItemProgress::from_item(&item, Utc::now());
        assert_eq!(progress.progress_percent, 100.0);
        assert_eq!(progress.estimated_remaining_ms, Some(0));
        assert_eq!(progress.elapsed_ms, 1_000);
        assert_eq!(progress.stage_name, "Done");
    }
}
