pub mod bridge;
pub mod instrument;
pub mod orchestrator;
pub mod status;
pub mod types;

pub use bridge::StepResultBridge;
pub use instrument::{InstrumentedProgram, STEP_RESULT_PREFIX, TEST_COMPLETE_PREFIX, instrument};
pub use orchestrator::{Orchestrator, RunHandle};
pub use status::{NodeStatus, RunOutcome, StatusBoard};
pub use types::{
    CompletionEvent, EngineError, EngineResult, RunEvent, RunSession, StepEdge, StepEvent,
    StepIndex, StepKind, StepNode, StepStatus,
};
