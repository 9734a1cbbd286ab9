pub mod context;
pub mod engine;
pub mod error;
pub mod stage;
pub mod stages;

pub use context::ItemContext;
pub use engine::{FeedbackOutcome, ItemOutcome, PipelineEngine, Step, CANCELLED_MESSAGE};
pub use error::{EngineError, StageError};
pub use stage::{Stage, StageId, StageInput, StageOutput, StageResult};
pub use stages::{AgentStage, DeliveryStage, GateStage, StageRegistry};
