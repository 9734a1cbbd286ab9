//! Shared test utilities for scriptline integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a full engine and orchestrator over a temp database
//! - `ScriptedAgent`, a content agent that counts its calls per stage
//! - Builders for settings and candidates

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{ScriptedAgent, TestHarness};
