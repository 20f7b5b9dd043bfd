use crate::error::SyncError;
use crate::sync::model::Platform;
use crate::sync::paths::ArchivePaths;
use crate::sync::util::write_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const SNAPSHOTS_DIR: &str = "snapshots";
const CHURN_LEDGER: &str = "churned.jsonl";
const SNAPSHOT_STAMP: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub member_id: String,
    pub display_name: String,
    pub joined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSnapshot {
    pub server_key: String,
    pub captured_at: DateTime<Utc>,
    /// Sorted by `member_id`, unique.
    pub members: Vec<MemberRecord>,
}

impl MemberSnapshot {
    pub fn new(server_key: &str, captured_at: DateTime<Utc>, members: Vec<MemberRecord>) -> Self {
        let by_id: BTreeMap<String, MemberRecord> = members
            .into_iter()
            .map(|m| (m.member_id.clone(), m))
            .collect();
        Self {
            server_key: server_key.to_string(),
            captured_at,
            members: by_id.into_values().collect(),
        }
    }

    pub fn get(&self, member_id: &str) -> Option<&MemberRecord> {
        self.members
            .binary_search_by(|m| m.member_id.as_str().cmp(member_id))
            .ok()
            .map(|idx| &self.members[idx])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemberDiff {
    pub joined: Vec<MemberRecord>,
    pub left: Vec<MemberRecord>,
    pub unchanged: Vec<MemberRecord>,
}

/// Compare two snapshots by member id. `unchanged` carries the current
/// record so renames show up with their latest name.
pub fn diff(previous: &MemberSnapshot, current: &MemberSnapshot) -> MemberDiff {
    let mut out = MemberDiff::default();
    for member in &current.members {
        if previous.get(&member.member_id).is_some() {
            out.unchanged.push(member.clone());
        } else {
            out.joined.push(member.clone());
        }
    }
    out.left = previous
        .members
        .iter()
        .filter(|m| current.get(&m.member_id).is_none())
        .cloned()
        .collect();
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChurnRecord {
    pub member_id: String,
    pub display_name: String,
    pub detected_at: DateTime<Utc>,
    pub tenure_days: Option<i64>,
    pub roles: Vec<String>,
}

impl ChurnRecord {
    pub fn from_departure(member: &MemberRecord, detected_at: DateTime<Utc>) -> Self {
        Self {
            member_id: member.member_id.clone(),
            display_name: member.display_name.clone(),
            detected_at,
            tenure_days: member
                .joined_at
                .map(|joined| (detected_at - joined).num_days().max(0)),
            roles: member.roles.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrendPoint {
    pub captured_at: DateTime<Utc>,
    pub member_count: usize,
}

/// Snapshot chain and churn ledger for one server.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    server_key: String,
}

impl SnapshotStore {
    pub fn open(paths: &ArchivePaths, platform: Platform, server_id: &str) -> Self {
        Self {
            root: paths.members_dir(platform, server_id),
            server_key: server_id.to_string(),
        }
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR)
    }

    pub fn churn_ledger(&self) -> PathBuf {
        self.root.join(CHURN_LEDGER)
    }

    pub fn save(&self, snapshot: &MemberSnapshot) -> Result<PathBuf> {
        let file = self.snapshots_dir().join(format!(
            "{}.json",
            snapshot.captured_at.format(SNAPSHOT_STAMP)
        ));
        let data = serde_json::to_string_pretty(snapshot)?;
        write_atomic(&file, format!("{data}\n").as_bytes())?;
        Ok(file)
    }

    /// Snapshot files, oldest first. File names sort chronologically.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let dir = self.snapshots_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn load(&self, path: &std::path::Path) -> Result<MemberSnapshot> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let corrupt = |reason: String| SyncError::CorruptState {
            path: path.to_path_buf(),
            reason,
        };
        let snapshot: MemberSnapshot =
            serde_json::from_str(&raw).map_err(|err| corrupt(err.to_string()))?;
        if snapshot.server_key != self.server_key {
            return Err(corrupt(format!(
                "snapshot belongs to server {} not {}",
                snapshot.server_key, self.server_key
            ))
            .into());
        }
        Ok(snapshot)
    }

    /// The two most recent snapshots as `(previous, latest)`.
    pub fn latest_two(&self) -> Result<(Option<MemberSnapshot>, Option<MemberSnapshot>)> {
        let files = self.list()?;
        let mut recent = files.iter().rev().take(2);
        let latest = recent.next().map(|p| self.load(p)).transpose()?;
        let previous = recent.next().map(|p| self.load(p)).transpose()?;
        Ok((previous, latest))
    }

    pub fn trend(&self) -> Result<Vec<TrendPoint>> {
        self.list()?
            .iter()
            .map(|path| {
                let snapshot = self.load(path)?;
                Ok(TrendPoint {
                    captured_at: snapshot.captured_at,
                    member_count: snapshot.members.len(),
                })
            })
            .collect()
    }

    pub fn append_churn(&self, records: &[ChurnRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let path = self.churn_ledger();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes())?;
        Ok(())
    }

    pub fn read_churn(&self) -> Result<Vec<ChurnRecord>> {
        let path = self.churn_ledger();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut out = Vec::new();
        for line in raw.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record: ChurnRecord = serde_json::from_str(trimmed)
                .with_context(|| format!("failed to parse churn line in {}", path.display()))?;
            out.push(record);
        }
        Ok(out)
    }
}
