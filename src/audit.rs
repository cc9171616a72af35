/// Audit logging for runs against the NAT table
///
/// Each run appends one JSON line naming its trace id, so the comments found
/// on rules in the live table can be matched to the run that wrote them.
use crate::core::driver::RunReport;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ConfigureFirewall,
    SimulateFirewall,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Trace id tagged onto every rule of the run
    pub trace_id: String,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        trace_id: impl Into<String>,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            trace_id: trace_id.into(),
            success,
            details,
            error,
        }
    }

    /// Describes a completed run.
    pub fn from_report(report: &RunReport, net_ns: Option<&str>) -> Self {
        let event_type = if report.simulated {
            EventType::SimulateFirewall
        } else {
            EventType::ConfigureFirewall
        };

        Self::new(
            event_type,
            report.trace_id.as_str(),
            true,
            serde_json::json!({
                "net_ns": net_ns,
                "cleanup_count": report.transaction.cleanup.len(),
                "install_count": report.transaction.install.len(),
                "dispatched": report.dispatched,
                "ignored_failures": report.ignored_failures,
                "before_checksum": report.before.as_ref().map(|s| s.checksum()),
                "after_checksum": report.after.as_ref().map(|s| s.checksum()),
            }),
            None,
        )
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// Lines that do not parse are skipped and do not count towards `count`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect();

        Ok(events)
    }

    /// Returns the path to the audit log file
    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}

/// Records an event, logging instead of failing when the log is unwritable.
pub async fn record(log: Option<&AuditLog>, event: &AuditEvent) {
    if let Some(audit) = log
        && let Err(e) = audit.log(event).await
    {
        tracing::warn!("Failed to write audit log {:?}: {}", audit.path(), e);
    }
}
