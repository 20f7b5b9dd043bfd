use crate::error::SyncError;
use crate::sync::model::Platform;
use crate::sync::paths::ArchivePaths;
use crate::sync::util::{now_utc, truncate_chars, write_atomic};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub const MAX_OBSERVATIONS: usize = 50;
pub const MAX_OBSERVATION_CHARS: usize = 500;
pub const MAX_KEYWORDS: usize = 10;
pub const MAX_NOTES_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationSource {
    Chat,
    #[default]
    Manual,
    System,
}

impl std::str::FromStr for ObservationSource {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "manual" => Ok(Self::Manual),
            "system" => Ok(Self::System),
            other => Err(SyncError::InvalidInput(format!(
                "unknown observation source `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub at: DateTime<Utc>,
    pub source: ObservationSource,
    pub content: String,
}

/// Long-lived notes about one member. Written by explicit operations only;
/// the sync pipeline reads it for engagement reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub member_id: String,
    pub platform: Platform,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub observations: Vec<Observation>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemberProfile {
    pub fn new(platform: Platform, member_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            member_id: member_id.to_string(),
            platform,
            display_name: None,
            observations: Vec::new(),
            keywords: Vec::new(),
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_observation(&mut self, source: ObservationSource, content: &str, at: DateTime<Utc>) {
        self.observations.push(Observation {
            at,
            source,
            content: truncate_chars(content.trim(), MAX_OBSERVATION_CHARS),
        });
        let excess = self.observations.len().saturating_sub(MAX_OBSERVATIONS);
        self.observations.drain(..excess);
        self.updated_at = at;
    }

    /// Replace keywords, dropping blanks and duplicates and keeping the last
    /// ten.
    pub fn set_keywords(&mut self, keywords: &[String], at: DateTime<Utc>) {
        let mut out: Vec<String> = Vec::new();
        for keyword in keywords {
            let keyword = keyword.trim().to_lowercase();
            if keyword.is_empty() {
                continue;
            }
            out.retain(|k| *k != keyword);
            out.push(keyword);
        }
        let excess = out.len().saturating_sub(MAX_KEYWORDS);
        out.drain(..excess);
        self.keywords = out;
        self.updated_at = at;
    }

    pub fn set_notes(&mut self, notes: &str, at: DateTime<Utc>) {
        let notes = truncate_chars(notes.trim(), MAX_NOTES_CHARS);
        self.notes = if notes.is_empty() { None } else { Some(notes) };
        self.updated_at = at;
    }
}

fn validate_member_id(member_id: &str) -> Result<(), SyncError> {
    let ok = !member_id.is_empty()
        && member_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(SyncError::InvalidInput(format!("invalid member id `{member_id}`")))
    }
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
    platform: Platform,
}

impl ProfileStore {
    pub fn open(paths: &ArchivePaths, platform: Platform) -> Self {
        Self {
            dir: paths.profiles_dir(platform),
            platform,
        }
    }

    fn file(&self, member_id: &str) -> PathBuf {
        self.dir.join(format!("{member_id}.json"))
    }

    pub fn exists(&self, member_id: &str) -> bool {
        validate_member_id(member_id).is_ok() && self.file(member_id).is_file()
    }

    pub fn get(&self, member_id: &str) -> Result<Option<MemberProfile>> {
        validate_member_id(member_id)?;
        let file = self.file(member_id);
        if !file.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let profile = serde_json::from_str(&raw).map_err(|err| SyncError::CorruptState {
            path: file.clone(),
            reason: err.to_string(),
        })?;
        Ok(Some(profile))
    }

    pub fn save(&self, profile: &MemberProfile) -> Result<PathBuf> {
        validate_member_id(&profile.member_id)?;
        let file = self.file(&profile.member_id);
        let data = serde_json::to_string_pretty(profile)?;
        write_atomic(&file, format!("{data}\n").as_bytes())?;
        Ok(file)
    }

    fn update(&self, member_id: &str, apply: impl FnOnce(&mut MemberProfile)) -> Result<MemberProfile> {
        let mut profile = match self.get(member_id)? {
            Some(profile) => profile,
            None => MemberProfile::new(self.platform, member_id, now_utc()),
        };
        apply(&mut profile);
        self.save(&profile)?;
        Ok(profile)
    }

    pub fn add_observation(
        &self,
        member_id: &str,
        source: ObservationSource,
        content: &str,
    ) -> Result<MemberProfile> {
        if content.trim().is_empty() {
            return Err(SyncError::InvalidInput("observation text is empty".into()).into());
        }
        self.update(member_id, |p| p.add_observation(source, content, now_utc()))
    }

    pub fn set_keywords(&self, member_id: &str, keywords: &[String]) -> Result<MemberProfile> {
        self.update(member_id, |p| p.set_keywords(keywords, now_utc()))
    }

    pub fn set_notes(&self, member_id: &str, notes: &str) -> Result<MemberProfile> {
        self.update(member_id, |p| p.set_notes(notes, now_utc()))
    }

    /// Member ids with a stored profile, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
