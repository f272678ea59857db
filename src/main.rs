use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;

use flowtest::config;
use flowtest::engine::instrument::instrument;
use flowtest::engine::orchestrator::Orchestrator;
use flowtest::engine::types::{RunEvent, RunSession, StepStatus};
use flowtest::evidence::{EvidenceStore, open_containing};

/// flowtest - Browser test execution engine with step-level evidence
#[derive(Parser, Debug)]
#[command(
    name = "flowtest",
    about = "Run generated browser test scripts against a live browser over a remote-debugging port",
    after_help = "ENVIRONMENT VARIABLES:\n\
        FLOWTEST_CDP_PORT       Remote-debugging port of the shared browser\n\
        FLOWTEST_NODE_BIN       Node runtime used for instrumented scripts\n\
        FLOWTEST_SCRIPT_DIR     Directory transient script files are written to\n\
        FLOWTEST_RUN_TIMEOUT    Watchdog timeout for a run (seconds)\n\
        FLOWTEST_EVIDENCE_DIR   Base directory for evidence sessions\n\
        FLOWTEST_UI_MARKERS     URL fragments identifying the host UI pages"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a run session and stream step results
    Run {
        /// Path to a run session JSON file ({sessionId, url, code, nodes})
        #[arg(short, long)]
        session: PathBuf,

        /// Emit events as JSON lines instead of human-readable text
        #[arg(long)]
        json: bool,
    },

    /// Instrument a script and print the standalone program without running it
    Instrument {
        /// Path to the raw script file
        #[arg(short, long)]
        input: PathBuf,

        /// Target URL the driver navigates to
        #[arg(short, long)]
        url: String,

        /// Session id used for the evidence directory
        #[arg(long, default_value = "preview")]
        session_id: String,
    },

    /// List evidence sessions, or open one in the OS file manager
    Sessions {
        /// Open this session's directory instead of listing
        #[arg(long)]
        open: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Some(Commands::Run { session, json }) => {
            let raw = std::fs::read_to_string(&session)?;
            let session: RunSession = serde_json::from_str(&raw)?;
            if !json {
                println!(
                    "Running session {} against {} ({} steps)",
                    session.session_id,
                    session.url,
                    session.nodes.len()
                );
            }

            let orchestrator = Orchestrator::from_env();
            let mut handle = orchestrator.start(session).await?;

            let mut run_failed = false;
            loop {
                tokio::select! {
                    event = handle.events.recv() => {
                        let Some(event) = event else { break };
                        if json {
                            println!("{}", serde_json::to_string(&event)?);
                        } else {
                            print_event(&event);
                        }
                        if let RunEvent::Complete { success, .. } = event {
                            run_failed = !success;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("Interrupt received, aborting run...");
                        orchestrator.abort();
                    }
                }
            }

            if run_failed {
                std::process::exit(1);
            }
        }

        Some(Commands::Instrument {
            input,
            url,
            session_id,
        }) => {
            let code = std::fs::read_to_string(&input)?;
            let store = EvidenceStore::from_config();
            let evidence_dir = store.ensure_session_dir(&session_id)?;
            let program = instrument(&code, &url, &evidence_dir, &config::get().engine)?;
            eprintln!("Instrumented {} step(s)", program.step_count);
            println!("{}", program.text);
        }

        Some(Commands::Sessions { open }) => {
            let store = EvidenceStore::from_config();
            if let Some(session_id) = open {
                let dir = store.ensure_session_dir(&session_id)?;
                open_containing(&dir)?;
                println!("Opened {}", dir.display());
            } else {
                let sessions = store.list_sessions()?;
                if sessions.is_empty() {
                    println!("No evidence sessions under {}", store.base_dir().display());
                }
                for path in sessions {
                    println!("{}", path.display());
                }
            }
        }

        None => {
            println!("flowtest - Browser test execution engine with step-level evidence");
            println!();
            println!("Usage: flowtest <COMMAND>");
            println!();
            println!("Commands:");
            println!("  run         Execute a run session and stream step results");
            println!("  instrument  Print the standalone instrumented program");
            println!("  sessions    List or open evidence sessions");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::StepResult {
            step_index,
            status,
            error,
            screenshot_path,
        } => {
            let mark = match status {
                StepStatus::Passed => "PASS",
                StepStatus::Failed => "FAIL",
            };
            print!("  Step {step_index}: {mark}");
            if let Some(err) = error {
                print!(" ({err})");
            }
            println!();
            if let Some(path) = screenshot_path {
                println!("    Screenshot: {}", path.display());
            }
        }
        RunEvent::Complete {
            success,
            aborted,
            total_passed,
        } => {
            if *aborted {
                println!("Run aborted ({total_passed} step(s) passed)");
            } else if *success {
                println!("Run passed: {total_passed} step(s)");
            } else {
                println!("Run failed ({total_passed} step(s) passed)");
            }
        }
    }
}
