//! Evidence storage for test runs.
//!
//! Filesystem sink keyed by session id:
//! - One lazily-created directory per session under a configurable base
//! - Timestamp-named failure screenshots
//! - A session log serializing the full run plus outcome as JSON, consumed
//!   later by report generation
//!
//! Lifecycle is independent of any single run: directories accumulate until
//! the explicit housekeeping helpers are called. Retention policy beyond
//! that is deliberately left to an external collaborator.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::engine::status::{NodeStatus, StatusBoard};
use crate::engine::types::{RunSession, StepKind};

/// Evidence store rooted at a base directory
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    base_dir: PathBuf,
}

/// One step entry in a serialized session record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// 1-based external step index
    pub index: usize,
    pub label: String,
    pub kind: StepKind,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
}

/// Full run plus outcome, written to the session log for later reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub url: String,
    pub date: String,
    pub code: String,
    pub steps: Vec<StepRecord>,
    pub total_passed: usize,
    pub total_failed: usize,
}

impl SessionRecord {
    /// Build a record from a run session and its final status board
    pub fn from_run(session: &RunSession, board: &StatusBoard) -> Self {
        let steps = session
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| StepRecord {
                index: i + 1,
                label: node.label.clone(),
                kind: node.kind,
                status: board.status(&node.id).unwrap_or(NodeStatus::Pending),
                error: board.error(&node.id).map(String::from),
                screenshot_path: board.screenshot(&node.id).cloned(),
            })
            .collect();

        Self {
            session_id: session.session_id.clone(),
            url: session.url.clone(),
            date: Utc::now().to_rfc3339(),
            code: session.code.clone(),
            steps,
            total_passed: board.total_passed(),
            total_failed: board.total_failed(),
        }
    }
}

impl EvidenceStore {
    /// Create a store rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Create a store rooted at the configured evidence directory
    pub fn from_config() -> Self {
        Self::new(&config::get().evidence.base_dir)
    }

    /// Base directory of this store
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory for a session id, created lazily
    pub fn ensure_session_dir(&self, session_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.base_dir.join(sanitize_name(session_id));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Timestamp-named screenshot path inside a session directory.
    /// Does not create the file; the child process writes it.
    pub fn screenshot_path(&self, session_id: &str, tag: &str) -> PathBuf {
        let filename = format!(
            "step-{}-{}.png",
            sanitize_name(tag),
            Utc::now().timestamp_millis()
        );
        self.base_dir.join(sanitize_name(session_id)).join(filename)
    }

    /// Write screenshot bytes to a path, creating parent directories
    pub fn write_screenshot(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)
    }

    /// Serialize a session record to `session-{id}.json` in the session
    /// directory; returns the log path
    pub fn write_session_log(&self, record: &SessionRecord) -> std::io::Result<PathBuf> {
        let dir = self.ensure_session_dir(&record.session_id)?;
        let path = dir.join(format!("session-{}.json", sanitize_name(&record.session_id)));
        fs::write(&path, serde_json::to_string_pretty(record)?)?;
        Ok(path)
    }

    /// List all session directories, sorted
    pub fn list_sessions(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut sessions = Vec::new();
        if self.base_dir.exists() {
            for entry in fs::read_dir(&self.base_dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    sessions.push(path);
                }
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    /// Remove session directories older than `max_age`; returns the count
    pub fn cleanup_old_sessions(&self, max_age: std::time::Duration) -> std::io::Result<usize> {
        let now = SystemTime::now();
        let mut cleaned = 0;

        for path in self.list_sessions()? {
            let Ok(metadata) = fs::metadata(&path) else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if let Ok(age) = now.duration_since(modified) {
                if age >= max_age && fs::remove_dir_all(&path).is_ok() {
                    cleaned += 1;
                }
            }
        }

        Ok(cleaned)
    }
}

/// Open the directory containing `path` (or `path` itself if it is a
/// directory) in the OS file manager. Side-effecting external action.
pub fn open_containing(path: &Path) -> std::io::Result<()> {
    let target = if path.is_dir() {
        path
    } else {
        path.parent().unwrap_or(path)
    };
    Command::new(os_opener()).arg(target).spawn()?;
    Ok(())
}

fn os_opener() -> &'static str {
    if cfg!(target_os = "macos") {
        "open"
    } else if cfg!(target_os = "windows") {
        "explorer"
    } else {
        "xdg-open"
    }
}

/// Sanitize a name for use in filenames
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
