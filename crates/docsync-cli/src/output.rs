//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use docsync_core::{SyncEngineStatus, SyncStatus};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print the outcome of a sync run
    pub fn print_sync_status(&self, status: &SyncEngineStatus) {
        match self.format {
            OutputFormat::Human => {
                println!("Sync: {:?}", status.step);
                println!("  local:    {}", status.local);
                for (i, remote) in status.remotes.iter().enumerate() {
                    println!("  remote {}: {}", i + 1, remote);
                }
                if status.retrying {
                    println!("  (a remote is unreachable, retrying)");
                }
            }
            OutputFormat::Json => match serde_json::to_string_pretty(status) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Failed to serialize status: {}", e),
            },
            OutputFormat::Quiet => {
                println!("{}", step_label(&status.local));
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn step_label(status: &SyncStatus) -> String {
    status.step.as_str().replace(' ', "_")
}

/// Truncate a string to max length, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
