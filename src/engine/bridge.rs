//! Streaming parser over the child process's stdout.
//!
//! The running script is a black box: the only structural feedback channel
//! is one printed line per completed (or failed) step. The bridge
//! recognizes two line shapes by fixed prefixes, updates the status board,
//! and forwards structured [`RunEvent`]s. It must survive malformed lines
//! and guarantee that every run ends in exactly one terminal `Complete`
//! event, even when the process dies without reporting.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::instrument::{STEP_RESULT_PREFIX, TEST_COMPLETE_PREFIX};
use crate::engine::status::{NodeStatus, StatusBoard};
use crate::engine::types::{CompletionEvent, RunEvent, StepEvent, StepIndex, StepStatus};

/// Bridge between the child's line protocol and host-side run events.
///
/// External node indices are 1-based; index 0 is the reserved navigation
/// step and is never surfaced.
pub struct StepResultBridge {
    board: Arc<Mutex<StatusBoard>>,
    tx: mpsc::UnboundedSender<RunEvent>,
    /// Next external node index expected to pass
    next_index: usize,
    terminal_sent: bool,
}

impl StepResultBridge {
    /// Create a bridge over a shared status board
    pub fn new(board: Arc<Mutex<StatusBoard>>, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self {
            board,
            tx,
            next_index: 1,
            terminal_sent: false,
        }
    }

    /// Whether a terminal `Complete` event has been emitted
    pub fn is_terminal(&self) -> bool {
        self.terminal_sent
    }

    /// Consume one stdout line from the child
    pub fn handle_line(&mut self, line: &str) {
        if let Some(at) = line.find(STEP_RESULT_PREFIX) {
            let payload = &line[at + STEP_RESULT_PREFIX.len()..];
            match serde_json::from_str::<StepEvent>(payload.trim()) {
                Ok(event) => self.handle_step_event(event),
                Err(e) => warn!(error = %e, line, "malformed step-result line ignored"),
            }
        } else if let Some(at) = line.find(TEST_COMPLETE_PREFIX) {
            let payload = &line[at + TEST_COMPLETE_PREFIX.len()..];
            match serde_json::from_str::<CompletionEvent>(payload.trim()) {
                Ok(event) => self.handle_completion(event),
                Err(e) => warn!(error = %e, line, "malformed completion line ignored"),
            }
        }
    }

    /// Called once the child process is gone. Surfaces a terminal failure
    /// if the run never produced a completion line, so no run is left in
    /// permanent `running` limbo.
    pub fn finish(&mut self, aborted: bool) {
        if self.terminal_sent {
            return;
        }
        let total_passed = self.board().total_passed();
        debug!(aborted, total_passed, "process ended without a completion line");
        self.send_complete(false, aborted, total_passed);
    }

    fn handle_step_event(&mut self, event: StepEvent) {
        match (&event.step_index, event.status) {
            (StepIndex::Number(0), StepStatus::Passed) => {
                // Reserved navigation step; not correlated to any node
                debug!("initial navigation confirmed");
            }
            (StepIndex::Number(_), StepStatus::Passed) => self.on_step_passed(),
            (StepIndex::Number(idx), StepStatus::Failed) => {
                self.on_step_failed(*idx, event.error, event.screenshot_path)
            }
            (StepIndex::Sentinel(s), StepStatus::Failed) if s == "CURRENT" => {
                self.on_current_failed(event.error, event.screenshot_path)
            }
            (index, status) => {
                warn!(?index, ?status, "unrecognized step event ignored");
            }
        }
    }

    /// A body statement completed. The child only reports completed work,
    /// so the next node is optimistically marked `running` here to give the
    /// visualization immediate feedback (host-side state, not a wire event).
    fn on_step_passed(&mut self) {
        let ext = self.next_index;
        let (node_id, next_id) = {
            let board = self.board();
            (
                board.node_at(ext).map(|n| n.id.clone()),
                board.node_at(ext + 1).map(|n| n.id.clone()),
            )
        };
        let Some(node_id) = node_id else {
            debug!(index = ext, "passed event beyond node graph ignored");
            return;
        };

        {
            let mut board = self.board();
            board.mark(&node_id, NodeStatus::Passed);
            if let Some(next_id) = &next_id {
                board.mark(next_id, NodeStatus::Running);
            }
        }
        self.next_index += 1;

        self.send(RunEvent::StepResult {
            step_index: ext,
            status: StepStatus::Passed,
            error: None,
            screenshot_path: None,
        });
    }

    /// A specific numbered statement failed: terminal for the run
    fn on_step_failed(
        &mut self,
        index: usize,
        error: Option<String>,
        screenshot: Option<std::path::PathBuf>,
    ) {
        let node_id = self.board().node_at(index).map(|n| n.id.clone());
        if let Some(id) = &node_id {
            let mut board = self.board();
            board.mark(id, NodeStatus::Failed);
            if let Some(err) = &error {
                board.set_error(id, err.clone());
            }
            if let Some(path) = &screenshot {
                board.set_screenshot(id, path.clone());
            }
        }

        if node_id.is_some() {
            self.send(RunEvent::StepResult {
                step_index: index,
                status: StepStatus::Failed,
                error: error.clone(),
                screenshot_path: screenshot,
            });
        }
        let total_passed = self.board().total_passed();
        self.send_complete(false, false, total_passed);
    }

    /// The process died mid-statement and cannot know which logical node it
    /// was on. Best-effort: fail the first node still `running` or
    /// `pending` in declared order. With branching or looping scripts this
    /// pick can be wrong; the ambiguity is a known limitation of the
    /// positional wire contract.
    fn on_current_failed(
        &mut self,
        error: Option<String>,
        screenshot: Option<std::path::PathBuf>,
    ) {
        let target = {
            let mut board = self.board();
            let target = board.first_unresolved().map(|n| n.id.clone());
            if let Some(id) = &target {
                board.mark(id, NodeStatus::Failed);
                if let Some(err) = &error {
                    board.set_error(id, err.clone());
                }
                if let Some(path) = &screenshot {
                    board.set_screenshot(id, path.clone());
                }
            }
            target
        };

        if let Some(id) = target {
            let index = {
                let board = self.board();
                board.nodes().iter().position(|n| n.id == id).map(|p| p + 1)
            };
            if let Some(index) = index {
                self.send(RunEvent::StepResult {
                    step_index: index,
                    status: StepStatus::Failed,
                    error: error.clone(),
                    screenshot_path: screenshot,
                });
            }
        } else {
            debug!("CURRENT failure with no unresolved node");
        }

        let total_passed = self.board().total_passed();
        self.send_complete(false, false, total_passed);
    }

    fn handle_completion(&mut self, event: CompletionEvent) {
        let total_passed = self.board().total_passed();
        self.send_complete(event.success, false, total_passed);
    }

    fn send_complete(&mut self, success: bool, aborted: bool, total_passed: usize) {
        if self.terminal_sent {
            debug!("duplicate terminal event suppressed");
            return;
        }
        self.terminal_sent = true;
        self.send(RunEvent::Complete {
            success,
            aborted,
            total_passed,
        });
    }

    fn send(&self, event: RunEvent) {
        if self.tx.send(event).is_err() {
            debug!("run event receiver dropped");
        }
    }

    fn board(&self) -> MutexGuard<'_, StatusBoard> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{StepKind, StepNode};
    use pretty_assertions::assert_eq;

    fn nodes(n: usize) -> Vec<StepNode> {
        (1..=n)
            .map(|i| StepNode {
                id: i.to_string(),
                kind: StepKind::Action,
                label: format!("step {i}"),
                selector: None,
            })
            .collect()
    }

    fn bridge(
        n: usize,
    ) -> (
        StepResultBridge,
        Arc<Mutex<StatusBoard>>,
        mpsc::UnboundedReceiver<RunEvent>,
    ) {
        let board = Arc::new(Mutex::new(StatusBoard::new(nodes(n))));
        // The orchestrator marks node 1 running before the first line arrives
        board.lock().unwrap().mark("1", NodeStatus::Running);
        let (tx, rx) = mpsc::unbounded_channel();
        (StepResultBridge::new(Arc::clone(&board), tx), board, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn all_passing_run_produces_indices_then_complete() {
        let (mut bridge, board, mut rx) = bridge(3);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":0,"status":"passed"}"#);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":1,"status":"passed"}"#);

        // Optimistic look-ahead: node 2 is running before its own event
        assert_eq!(board.lock().unwrap().status("2"), Some(NodeStatus::Running));

        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":2,"status":"passed"}"#);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":3,"status":"passed"}"#);
        bridge.handle_line(r#"TEST_COMPLETE: {"success":true}"#);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 4);
        for (i, event) in events.iter().take(3).enumerate() {
            match event {
                RunEvent::StepResult {
                    step_index, status, ..
                } => {
                    assert_eq!(*step_index, i + 1);
                    assert_eq!(*status, StepStatus::Passed);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(matches!(
            events[3],
            RunEvent::Complete {
                success: true,
                aborted: false,
                total_passed: 3
            }
        ));
    }

    #[test]
    fn current_failure_hits_first_unresolved_node() {
        let (mut bridge, board, mut rx) = bridge(3);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":0,"status":"passed"}"#);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":1,"status":"passed"}"#);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":2,"status":"passed"}"#);
        bridge.handle_line(
            r#"STEP_RESULT: {"stepIndex":"CURRENT","status":"failed","error":"boom","screenshotPath":"/tmp/e/s.png"}"#,
        );

        {
            let board = board.lock().unwrap();
            assert_eq!(board.status("3"), Some(NodeStatus::Failed));
            assert_eq!(board.error("3"), Some("boom"));
            assert!(board.screenshot("3").is_some());
        }

        let events = drain(&mut rx);
        // 2 passed, 1 failed, 1 complete
        assert_eq!(events.len(), 4);
        assert!(matches!(
            events[2],
            RunEvent::StepResult {
                step_index: 3,
                status: StepStatus::Failed,
                ..
            }
        ));
        assert!(matches!(
            events[3],
            RunEvent::Complete {
                success: false,
                aborted: false,
                total_passed: 2
            }
        ));

        // Process exit afterwards must not produce a second terminal event
        bridge.finish(false);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn numeric_failure_is_terminal() {
        let (mut bridge, _board, mut rx) = bridge(3);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":0,"status":"passed"}"#);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":1,"status":"passed"}"#);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":2,"status":"failed","error":"timeout"}"#);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[1],
            RunEvent::StepResult {
                step_index: 2,
                status: StepStatus::Failed,
                ..
            }
        ));
        assert!(matches!(events[2], RunEvent::Complete { success: false, .. }));
    }

    #[test]
    fn malformed_lines_are_ignored() {
        let (mut bridge, _board, mut rx) = bridge(2);
        bridge.handle_line("STEP_RESULT: {not json at all");
        bridge.handle_line("unrelated noise on stdout");
        bridge.handle_line(r#"TEST_COMPLETE: {"success":"#);
        assert!(drain(&mut rx).is_empty());

        // Parser keeps working afterwards
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":1,"status":"passed"}"#);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn exit_without_completion_surfaces_failure() {
        let (mut bridge, _board, mut rx) = bridge(3);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":0,"status":"passed"}"#);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":1,"status":"passed"}"#);
        bridge.finish(false);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            RunEvent::Complete {
                success: false,
                aborted: false,
                total_passed: 1
            }
        ));
    }

    #[test]
    fn abort_completes_as_aborted_not_failed() {
        let (mut bridge, _board, mut rx) = bridge(2);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":0,"status":"passed"}"#);
        bridge.finish(true);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            RunEvent::Complete {
                success: false,
                aborted: true,
                ..
            }
        ));
    }

    #[test]
    fn passed_events_beyond_graph_are_ignored() {
        let (mut bridge, _board, mut rx) = bridge(1);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":1,"status":"passed"}"#);
        bridge.handle_line(r#"STEP_RESULT: {"stepIndex":2,"status":"passed"}"#);
        bridge.handle_line(r#"TEST_COMPLETE: {"success":true}"#);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            RunEvent::Complete {
                success: true,
                total_passed: 1,
                ..
            }
        ));
    }
}
