//! Configuration management with environment variable support.
//!
//! Centralized configuration for the flowtest engine:
//! - Environment variables for all configurable values
//! - Sensible defaults matching the well-known remote-debugging setup
//! - Plain struct construction for programmatic configuration
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `FLOWTEST_CDP_PORT` | Remote-debugging port of the shared browser | `9222` |
//! | `FLOWTEST_NODE_BIN` | Node runtime used to execute instrumented scripts | `node` |
//! | `FLOWTEST_SCRIPT_DIR` | Directory transient script files are written to | `.` |
//! | `FLOWTEST_RUN_TIMEOUT` | Watchdog timeout for a run, in seconds | `300` |
//! | `FLOWTEST_EVIDENCE_DIR` | Base directory for evidence sessions | `./flowtest-evidence` |
//! | `FLOWTEST_UI_MARKERS` | Comma-separated URL fragments identifying the host UI | `localhost:5173,dist/index.html` |

use std::env;
use std::sync::OnceLock;

// ============================================================================
// Default Values
// ============================================================================

/// Default remote-debugging (CDP) port
pub const DEFAULT_CDP_PORT: u16 = 9222;

/// Default Node runtime binary
pub const DEFAULT_NODE_BIN: &str = "node";

/// Default directory for transient script files.
///
/// The working directory, NOT the OS temp dir: Node resolves
/// `playwright-core` relative to the script file, and the automation
/// library is installed under the application's own `node_modules`.
pub const DEFAULT_SCRIPT_DIR: &str = ".";

/// Default watchdog timeout for one run (seconds)
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300;

/// Default evidence base directory
pub const DEFAULT_EVIDENCE_DIR: &str = "./flowtest-evidence";

/// Default URL fragments identifying the host application's own UI pages.
/// Pages matching any of these are never selected as the automation target.
pub const DEFAULT_UI_MARKERS: &str = "localhost:5173,dist/index.html";

// ============================================================================
// Environment Variable Names
// ============================================================================

/// Environment variable for the remote-debugging port
pub const ENV_CDP_PORT: &str = "FLOWTEST_CDP_PORT";

/// Environment variable for the Node runtime binary
pub const ENV_NODE_BIN: &str = "FLOWTEST_NODE_BIN";

/// Environment variable for the transient script directory
pub const ENV_SCRIPT_DIR: &str = "FLOWTEST_SCRIPT_DIR";

/// Environment variable for the run watchdog timeout (seconds)
pub const ENV_RUN_TIMEOUT: &str = "FLOWTEST_RUN_TIMEOUT";

/// Environment variable for the evidence base directory
pub const ENV_EVIDENCE_DIR: &str = "FLOWTEST_EVIDENCE_DIR";

/// Environment variable for host-UI URL markers
pub const ENV_UI_MARKERS: &str = "FLOWTEST_UI_MARKERS";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration for the flowtest engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine/run settings
    pub engine: EngineSettings,
    /// Evidence storage settings
    pub evidence: EvidenceSettings,
}

/// Run-related settings
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Remote-debugging port the child connects to
    pub cdp_port: u16,
    /// Node runtime binary used to spawn instrumented scripts
    pub node_bin: String,
    /// Directory transient script files are written to
    pub script_dir: String,
    /// Watchdog timeout for one run (seconds)
    pub run_timeout_secs: u64,
    /// URL fragments identifying the host application's own UI
    pub ui_markers: Vec<String>,
}

/// Evidence-related settings
#[derive(Debug, Clone)]
pub struct EvidenceSettings {
    /// Base directory for evidence sessions
    pub base_dir: String,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            engine: EngineSettings::from_env(),
            evidence: EvidenceSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            engine: EngineSettings::defaults(),
            evidence: EvidenceSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl EngineSettings {
    /// Create engine settings from environment variables
    pub fn from_env() -> Self {
        Self {
            cdp_port: env::var(ENV_CDP_PORT)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CDP_PORT),
            node_bin: env::var(ENV_NODE_BIN).unwrap_or_else(|_| DEFAULT_NODE_BIN.to_string()),
            script_dir: env::var(ENV_SCRIPT_DIR)
                .unwrap_or_else(|_| DEFAULT_SCRIPT_DIR.to_string()),
            run_timeout_secs: env::var(ENV_RUN_TIMEOUT)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RUN_TIMEOUT_SECS),
            ui_markers: env::var(ENV_UI_MARKERS)
                .map(|s| parse_ui_markers(&s))
                .unwrap_or_else(|_| parse_ui_markers(DEFAULT_UI_MARKERS)),
        }
    }

    /// Create engine settings with defaults
    pub fn defaults() -> Self {
        Self {
            cdp_port: DEFAULT_CDP_PORT,
            node_bin: DEFAULT_NODE_BIN.to_string(),
            script_dir: DEFAULT_SCRIPT_DIR.to_string(),
            run_timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
            ui_markers: parse_ui_markers(DEFAULT_UI_MARKERS),
        }
    }
}

impl EvidenceSettings {
    /// Create evidence settings from environment variables
    pub fn from_env() -> Self {
        Self {
            base_dir: env::var(ENV_EVIDENCE_DIR)
                .unwrap_or_else(|_| DEFAULT_EVIDENCE_DIR.to_string()),
        }
    }

    /// Create evidence settings with defaults
    pub fn defaults() -> Self {
        Self {
            base_dir: DEFAULT_EVIDENCE_DIR.to_string(),
        }
    }
}

/// Parse a comma-separated list of host-UI URL markers
fn parse_ui_markers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
