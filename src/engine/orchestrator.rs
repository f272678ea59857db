//! Process orchestration for test runs.
//!
//! Owns the lifecycle of at most one active external run: instrument the
//! script, persist it to a transient file, spawn it under the Node runtime,
//! stream its stdout through the [`StepResultBridge`], and clean up on
//! every exit path. Cancellation is immediate and forceful; the instrumented
//! program's own `finally` block attempts release of the browser connection.
//!
//! The "current run" slot is exclusive: `start` always runs the
//! abort-and-cleanup sequence before installing new state, so no interleaved
//! events from two runs are ever delivered.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::bridge::StepResultBridge;
use crate::engine::instrument;
use crate::engine::status::{NodeStatus, StatusBoard};
use crate::engine::types::{EngineError, EngineResult, RunEvent, RunSession};
use crate::evidence::{EvidenceStore, SessionRecord};

/// State retained for the single active run
struct ActiveRun {
    script_path: PathBuf,
    kill: Arc<Notify>,
    aborted: Arc<AtomicBool>,
}

/// Handle returned to the caller of [`Orchestrator::start`]
#[derive(Debug)]
pub struct RunHandle {
    /// Discrete run events, terminated by exactly one `Complete`
    pub events: mpsc::UnboundedReceiver<RunEvent>,
    /// Live view of per-node statuses for this run
    pub board: Arc<Mutex<StatusBoard>>,
}

impl RunHandle {
    /// Snapshot of `(node id, status)` pairs in declared order
    pub fn snapshot(&self) -> Vec<(String, NodeStatus)> {
        let board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        board
            .nodes()
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    board.status(&n.id).unwrap_or(NodeStatus::Pending),
                )
            })
            .collect()
    }
}

/// Orchestrator for external test processes.
///
/// All run state lives inside the instance; `start` and `abort` are its
/// only mutators.
pub struct Orchestrator {
    config: Config,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl Orchestrator {
    /// Create an orchestrator with an explicit configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Create an orchestrator configured from the environment
    pub fn from_env() -> Self {
        Self::new(Config::from_env())
    }

    /// Start a run for `session`, aborting any prior run first.
    ///
    /// Instruments the script, writes it to a transient file in the
    /// configured script directory (the working directory by default, so
    /// the Node runtime resolves `playwright-core` from the application's
    /// own `node_modules`), spawns it, and wires stdout into the bridge
    /// before the process can emit anything observable.
    ///
    /// A transformation failure returns an error without spawning; a spawn
    /// failure cleans up the transient file and returns an error. Neither
    /// installs run state.
    pub async fn start(&self, session: RunSession) -> EngineResult<RunHandle> {
        // Single-active-run invariant: unconditional, idempotent
        self.abort();

        let evidence = EvidenceStore::new(&self.config.evidence.base_dir);
        let evidence_dir = evidence.ensure_session_dir(&session.session_id)?;

        let program = instrument::instrument(
            &session.code,
            &session.url,
            &evidence_dir,
            &self.config.engine,
        )?;
        debug!(steps = program.step_count, "script instrumented");

        let script_path = PathBuf::from(&self.config.engine.script_dir).join(format!(
            "flowtest-run-{}.mjs",
            Utc::now().timestamp_millis()
        ));
        tokio::fs::write(&script_path, &program.text).await?;

        let mut child = match Command::new(&self.config.engine.node_bin)
            .arg(&script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                remove_script(&script_path);
                return Err(EngineError::Spawn(e));
            }
        };
        info!(
            session = %session.session_id,
            pid = child.id(),
            script = %script_path.display(),
            "test process started"
        );

        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Spawn(std::io::Error::other("child stdout not captured"))
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        // Reset to all-pending happens here, synchronously, before the
        // first optimistic mark and before any child output is read.
        let mut board = StatusBoard::new(session.nodes.clone());
        board.reset();
        if let Some(first) = board.nodes().first().map(|n| n.id.clone()) {
            board.mark(&first, NodeStatus::Running);
        }
        let board = Arc::new(Mutex::new(board));

        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = StepResultBridge::new(Arc::clone(&board), tx);

        let kill = Arc::new(Notify::new());
        let aborted = Arc::new(AtomicBool::new(false));
        *self.active_slot() = Some(ActiveRun {
            script_path: script_path.clone(),
            kill: Arc::clone(&kill),
            aborted: Arc::clone(&aborted),
        });

        tokio::spawn(monitor_run(MonitorArgs {
            child,
            stdout,
            bridge,
            kill,
            aborted,
            script_path,
            active: Arc::clone(&self.active),
            watchdog: Duration::from_secs(self.config.engine.run_timeout_secs),
            evidence,
            session,
            board: Arc::clone(&board),
        }));

        Ok(RunHandle { events: rx, board })
    }

    /// Forcibly terminate the active run, if any. No-op otherwise.
    ///
    /// The kill is immediate: no graceful shutdown negotiation with the
    /// child. The transient script file is deleted best-effort here and
    /// again by the monitor once the process is reaped.
    pub fn abort(&self) {
        let Some(run) = self.active_slot().take() else {
            return;
        };
        info!("aborting active test run");
        run.aborted.store(true, Ordering::SeqCst);
        run.kill.notify_one();
        remove_script(&run.script_path);
    }

    /// Whether a run is currently active
    pub fn is_running(&self) -> bool {
        self.active_slot().is_some()
    }

    fn active_slot(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct MonitorArgs {
    child: Child,
    stdout: tokio::process::ChildStdout,
    bridge: StepResultBridge,
    kill: Arc<Notify>,
    aborted: Arc<AtomicBool>,
    script_path: PathBuf,
    active: Arc<Mutex<Option<ActiveRun>>>,
    watchdog: Duration,
    evidence: EvidenceStore,
    session: RunSession,
    board: Arc<Mutex<StatusBoard>>,
}

/// Drive one run to completion: stream stdout lines into the bridge and
/// race process end against an abort notification and the watchdog.
async fn monitor_run(args: MonitorArgs) {
    let MonitorArgs {
        mut child,
        stdout,
        mut bridge,
        kill,
        aborted,
        script_path,
        active,
        watchdog,
        evidence,
        session,
        board,
    } = args;

    let mut lines = BufReader::new(stdout).lines();
    let deadline = tokio::time::sleep(watchdog);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => bridge.handle_line(&line),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "error reading test process stdout");
                    break;
                }
            },
            _ = kill.notified() => {
                debug!("kill requested for test process");
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to kill test process");
                }
                break;
            }
            _ = &mut deadline => {
                warn!(timeout_secs = watchdog.as_secs(), "run watchdog expired; killing test process");
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to kill test process");
                }
                break;
            }
        }
    }

    match child.wait().await {
        Ok(status) => info!(code = ?status.code(), "test process exited"),
        Err(e) => warn!(error = %e, "failed to reap test process"),
    }

    remove_script(&script_path);

    // Clear the slot unless a newer run already replaced it
    {
        let mut slot = active.lock().unwrap_or_else(PoisonError::into_inner);
        if slot
            .as_ref()
            .map(|r| r.script_path == script_path)
            .unwrap_or(false)
        {
            *slot = None;
        }
    }

    // Guarantees a terminal event when no completion line was seen;
    // a watchdog kill surfaces as failure, a user abort as aborted.
    bridge.finish(aborted.load(Ordering::SeqCst));

    let record = {
        let board = board.lock().unwrap_or_else(PoisonError::into_inner);
        SessionRecord::from_run(&session, &board)
    };
    if let Err(e) = evidence.write_session_log(&record) {
        warn!(error = %e, session = %session.session_id, "failed to write session log");
    }
}

/// Forward the child's stderr into the host log
async fn forward_stderr<R: AsyncRead + Unpin>(stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(target: "flowtest::child", "{line}");
    }
}

/// Delete a transient script file if it still exists.
/// Deletion failures are logged, never fatal.
fn remove_script(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(error = %e, script = %path.display(), "failed to delete transient script file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_without_active_run_is_a_noop() {
        let orchestrator = Orchestrator::new(Config::defaults());
        assert!(!orchestrator.is_running());
        orchestrator.abort();
        orchestrator.abort();
        assert!(!orchestrator.is_running());
    }
}
