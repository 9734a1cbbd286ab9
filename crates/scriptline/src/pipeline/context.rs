use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::stage::StageId;

/// Accumulated stage outputs for one item, keyed by stage slug.
///
/// Persisted with the item so a resumed or retried run sees exactly what
/// earlier stages produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemContext {
    outputs: BTreeMap<String, serde_json::Value>,
}

impl ItemContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stage: StageId) -> Option<&serde_json::Value> {
        self.outputs.get(stage.slug())
    }

    pub fn insert(&mut self, stage: StageId, output: serde_json::Value) {
        self.outputs.insert(stage.slug().to_string(), output);
    }

    /// Outputs of every stage before `stage`, in stage order.
    pub fn upstream_of(&self, stage: StageId) -> BTreeMap<u8, serde_json::Value> {
        StageId::ALL
            .iter()
            .take_while(|s| **s < stage)
            .filter_map(|s| self.get(*s).map(|v| (s.number(), v.clone())))
            .collect()
    }

    /// A numeric field from the latest stage (in the given order) that has it.
    pub fn latest_number(&self, stages: &[StageId], field: &str) -> Option<f64> {
        stages
            .iter()
            .filter_map(|s| self.get(*s))
            .find_map(|v| v.get(field).and_then(|f| f.as_f64()))
    }

    /// A string field from the latest stage (in the given order) that has it.
    pub fn latest_str(&self, stages: &[StageId], field: &str) -> Option<&str> {
        stages
            .iter()
            .filter_map(|s| self.get(*s))
            .find_map(|v| v.get(field).and_then(|f| f.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}
