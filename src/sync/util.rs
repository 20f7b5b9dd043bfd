use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Current time truncated to whole seconds, the precision every on-disk
/// timestamp uses.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Truncate `input` to at most `max_chars` Unicode characters, stripping
/// control characters other than newlines.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    input
        .chars()
        .filter(|c| *c == '\n' || !c.is_control())
        .take(max_chars)
        .collect()
}

/// Collapse any run of whitespace (including newlines) into a single space.
pub fn single_line(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Write `bytes` to a hidden temp file next to `target`, fsync it and return
/// the handle without persisting it.
pub fn stage_file(target: &Path, bytes: &[u8]) -> std::io::Result<NamedTempFile> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

/// Replace `target` with `bytes` via temp file + rename.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = stage_file(target, bytes)
        .with_context(|| format!("failed to stage {}", target.display()))?;
    tmp.persist(target)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to replace {}", target.display()))?;
    Ok(())
}
