//! Types for test runs and the step-result wire protocol.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Kind of a step node: a page action or an assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Action,
    Assertion,
}

/// One visualized unit of the test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepNode {
    /// Stable id produced upstream; identity for status tracking
    pub id: String,

    /// Action or assertion
    pub kind: StepKind,

    /// Human-readable label shown by the visualization
    pub label: String,

    /// CSS selector the step targets, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

/// Display/sequencing edge between two step nodes.
///
/// Carried for downstream consumers only; the engine executes the linear
/// script, never the edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

/// The unit of one execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSession {
    /// Session id, used to key the evidence directory
    pub session_id: String,

    /// Target URL the script runs against
    pub url: String,

    /// Raw script text as authored by the upstream generator
    pub code: String,

    /// Ordered step nodes the run is correlated to
    pub nodes: Vec<StepNode>,
}

/// Step index as reported by the child process.
///
/// `"CURRENT"` means the step in flight when a fatal exception occurred;
/// the exact index is unknown to the child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepIndex {
    Number(usize),
    Sentinel(String),
}

impl StepIndex {
    /// Whether this is the `"CURRENT"` sentinel
    pub fn is_current(&self) -> bool {
        matches!(self, StepIndex::Sentinel(s) if s == "CURRENT")
    }
}

/// Pass/fail status carried on a step event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
}

/// One step-result line emitted by the running child process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    pub step_index: StepIndex,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
}

/// Payload of the child's completion line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub success: bool,
}

/// Events delivered to the UI/visualization collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RunEvent {
    /// A step finished (or failed); `step_index` is the external 1-based
    /// node index, never the reserved navigation index 0
    #[serde(rename = "step-result")]
    #[serde(rename_all = "camelCase")]
    StepResult {
        step_index: usize,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screenshot_path: Option<PathBuf>,
    },

    /// Terminal event; exactly one is delivered per run
    #[serde(rename = "complete")]
    #[serde(rename_all = "camelCase")]
    Complete {
        success: bool,
        /// User-initiated abort (neither pass nor fail)
        aborted: bool,
        total_passed: usize,
    },
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error types for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The instrumenter could not safely rewrite the script
    #[error("transform error: {0}")]
    Transform(String),

    /// The test process could not be created
    #[error("failed to spawn test process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Evidence directory or log file could not be written
    #[error("evidence error: {0}")]
    Evidence(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn step_event_parses_numeric_index() {
        let event: StepEvent =
            serde_json::from_str(r#"{ "stepIndex": 3, "status": "passed" }"#).unwrap();
        assert_eq!(event.step_index, StepIndex::Number(3));
        assert_eq!(event.status, StepStatus::Passed);
        assert_eq!(event.error, None);
    }

    #[test]
    fn step_event_parses_current_sentinel() {
        let event: StepEvent = serde_json::from_str(
            r#"{ "stepIndex": "CURRENT", "status": "failed", "error": "element not visible", "screenshotPath": "/tmp/e/step-CURRENT-1.png" }"#,
        )
        .unwrap();
        assert!(event.step_index.is_current());
        assert_eq!(event.status, StepStatus::Failed);
        assert_eq!(event.error.as_deref(), Some("element not visible"));
        assert!(event.screenshot_path.is_some());
    }

    #[test]
    fn run_session_round_trips_camel_case() {
        let json = r##"{
            "sessionId": "1700000000000",
            "url": "https://example.com",
            "code": "test('t', async ({ page }) => {});",
            "nodes": [
                { "id": "1", "kind": "action", "label": "Click login" },
                { "id": "2", "kind": "assertion", "label": "Dashboard visible", "selector": "#dash" }
            ]
        }"##;
        let session: RunSession = serde_json::from_str(json).unwrap();
        assert_eq!(session.nodes.len(), 2);
        assert_eq!(session.nodes[0].kind, StepKind::Action);
        assert_eq!(session.nodes[1].selector.as_deref(), Some("#dash"));

        let back = serde_json::to_value(&session).unwrap();
        assert_eq!(back["sessionId"], "1700000000000");
        assert_eq!(back["nodes"][1]["selector"], "#dash");
    }

    #[test]
    fn run_event_serializes_with_event_tag() {
        let event = RunEvent::Complete {
            success: true,
            aborted: false,
            total_passed: 3,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "complete");
        assert_eq!(value["totalPassed"], 3);

        let step = RunEvent::StepResult {
            step_index: 2,
            status: StepStatus::Failed,
            error: Some("timeout".to_string()),
            screenshot_path: None,
        };
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["event"], "step-result");
        assert_eq!(value["stepIndex"], 2);
        assert_eq!(value["status"], "failed");
    }
}
