//! flowtest - Browser test execution engine with step-level evidence.
//!
//! This crate provides:
//! - Script instrumentation: rewrites a generated test script into a
//!   standalone, self-instrumented Node program
//! - Process orchestration for at most one active run at a time
//! - A streaming bridge that recovers a step-by-step pass/fail timeline
//!   from the child's stdout
//! - A per-node status machine for the ordered step graph
//! - Filesystem evidence storage (screenshots and session JSON logs)
//!
//! # Example
//!
//! ```rust,no_run
//! use flowtest::{Orchestrator, RunSession, RunEvent};
//!
//! # async fn run() -> flowtest::EngineResult<()> {
//! let session: RunSession = serde_json::from_str(r#"{
//!     "sessionId": "1700000000000",
//!     "url": "https://example.com",
//!     "code": "test('t', async ({ page }) => { await page.click('#go'); });",
//!     "nodes": [{ "id": "1", "kind": "action", "label": "Click go" }]
//! }"#).unwrap();
//!
//! let orchestrator = Orchestrator::from_env();
//! let mut handle = orchestrator.start(session).await?;
//! while let Some(event) = handle.events.recv().await {
//!     println!("{}", serde_json::to_string(&event).unwrap());
//!     if matches!(event, RunEvent::Complete { .. }) {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod evidence;

// Re-export engine types
pub use engine::{
    EngineError, EngineResult, InstrumentedProgram, NodeStatus, Orchestrator, RunEvent, RunHandle,
    RunOutcome, RunSession, StatusBoard, StepEdge, StepEvent, StepIndex, StepKind, StepNode,
    StepResultBridge, StepStatus, instrument,
};

// Re-export evidence storage
pub use evidence::{EvidenceStore, SessionRecord, StepRecord, open_containing};
