use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// One pipeline event in the human-readable execution log
#[derive(Debug, Clone)]
pub struct ExecutionTrace {
    pub timestamp: String,
    pub change_id: String,
    pub phase: String,
    pub status: String,
    pub details: String,
    pub error_details: Option<String>,
}

impl ExecutionTrace {
    pub fn new(change_id: &str, phase: &str, status: &str, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            change_id: change_id.to_string(),
            phase: phase.to_string(),
            status: status.to_string(),
            details: details.into(),
            error_details: None,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error_details = Some(error.to_string());
        self
    }
}

/// Append-only log file
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    path: PathBuf,
}

impl ExecutionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn record(&self, trace: &ExecutionTrace) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        let short_id: String = trace.change_id.chars().take(8).collect();
        writeln!(
            f,
            "{} [{}] {} - {} - {}",
            trace.timestamp, short_id, trace.phase, trace.status, trace.details
        )?;

        if let Some(error) = &trace.error_details {
            writeln!(f, "  Error: {}", error)?;
        }

        writeln!(f, "---")?;
        Ok(())
    }
}
