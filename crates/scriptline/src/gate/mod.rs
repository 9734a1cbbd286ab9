//! Gate stage decision and the adaptive threshold behind it.

pub mod decision;
pub mod threshold;

pub use decision::{decide, GateDecision, Verdict};
pub use threshold::{GateThresholds, ThresholdError};
