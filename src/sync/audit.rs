use crate::sync::paths::ArchivePaths;
use crate::sync::util::now_utc;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub phase: String,
    pub status: String,
    pub message: String,
}

pub fn append_event(paths: &ArchivePaths, phase: &str, status: &str, message: &str) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;
    let event = AuditEvent {
        at: now_utc(),
        phase: phase.to_string(),
        status: status.to_string(),
        message: message.to_string(),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = paths.audit_log();
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Best-effort variant for pipelines whose outcome must not depend on the
/// audit log being writable.
pub fn record(paths: &ArchivePaths, phase: &str, status: &str, message: &str) {
    if let Err(err) = append_event(paths, phase, status, message) {
        tracing::debug!(error = %err, phase, "audit append failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_append_as_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = ArchivePaths::rooted(dir.path());
        append_event(&paths, "sync", "ok", "c_1_2 appended=3").expect("first");
        append_event(&paths, "members", "error", "server 9").expect("second");

        let raw = fs::read_to_string(paths.audit_log()).expect("read log");
        let events: Vec<AuditEvent> = raw
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase, "sync");
        assert_eq!(events[1].status, "error");
    }
}
