use crate::sync::cursor::CursorStore;
use crate::sync::markdown;
use crate::sync::model::{ConversationKey, MessageId, Platform};
use crate::sync::paths::{ARCHIVE_FILE, ArchivePaths, CURSOR_FILE};
use crate::sync::util::{now_utc, sha256_hex, write_atomic};
use crate::sync::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub platform: Platform,
    pub conversation_key: ConversationKey,
    pub display_name: String,
    pub scope: Option<String>,
    pub message_count: usize,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Relative to the data root.
    pub archive_path: String,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_id: Option<MessageId>,
    pub sha256: Option<String>,
}

/// Derived index over every archived conversation. Always rebuildable from
/// the archives and cursors; never read back as a source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub generated_at: DateTime<Utc>,
    pub total_conversations: usize,
    pub total_messages: usize,
    /// Keyed by `{platform}/{conversation_key}`.
    pub conversations: BTreeMap<String, ManifestEntry>,
}

fn conversation_keys(paths: &ArchivePaths, platform: Platform) -> Result<Vec<ConversationKey>> {
    let dir = paths.platform_dir(platform);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut keys = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Ok(key) = ConversationKey::parse(&name) else {
            continue;
        };
        let has_state = entry.path().join(ARCHIVE_FILE).exists()
            || entry.path().join(CURSOR_FILE).exists();
        if has_state {
            keys.push(key);
        }
    }
    keys.sort();
    Ok(keys)
}

fn entry_for(paths: &ArchivePaths, platform: Platform, key: &ConversationKey) -> Result<ManifestEntry> {
    let store = CursorStore::open(paths, platform, key);
    let cursor = match store.get() {
        Ok(cursor) => cursor,
        Err(err) => {
            warn::emit(
                WarnEvent::new("CURSOR_UNREADABLE", "manifest", key.as_str())
                    .reason("ignored_for_manifest")
                    .err(&err.to_string()),
            );
            None
        }
    };

    let archive_file = store.archive_path();
    let (parsed, sha256) = match fs::read(archive_file) {
        Ok(bytes) => (Some(markdown::parse_bytes(&bytes)), Some(sha256_hex(&bytes))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (None, None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", archive_file.display()));
        }
    };

    let messages = parsed.as_ref().map(|p| p.messages.as_slice()).unwrap_or_default();
    let header = parsed.as_ref().and_then(|p| p.header.as_ref());
    let display_name = header
        .map(|h| h.title.clone())
        .or_else(|| cursor.as_ref().map(|c| c.display_name.clone()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| key.to_string());
    let scope = header
        .and_then(|h| h.scope.clone())
        .or_else(|| cursor.as_ref().and_then(|c| c.scope.clone()));
    let relative = archive_file
        .strip_prefix(&paths.data_root)
        .unwrap_or(archive_file)
        .display()
        .to_string();

    Ok(ManifestEntry {
        platform,
        conversation_key: key.clone(),
        display_name,
        scope,
        message_count: messages.len(),
        last_synced_at: cursor.as_ref().map(|c| c.last_synced_at),
        archive_path: relative,
        first_message_at: messages.first().map(|m| m.timestamp),
        last_message_at: messages.last().map(|m| m.timestamp),
        last_message_id: messages.iter().map(|m| m.id).max(),
        sha256,
    })
}

/// Scan every conversation directory. Reads only.
pub fn rebuild(paths: &ArchivePaths) -> Result<Manifest> {
    let mut conversations = BTreeMap::new();
    for platform in Platform::ALL {
        for key in conversation_keys(paths, platform)? {
            let entry = entry_for(paths, platform, &key)?;
            conversations.insert(format!("{platform}/{key}"), entry);
        }
    }
    Ok(Manifest {
        generated_at: now_utc(),
        total_conversations: conversations.len(),
        total_messages: conversations.values().map(|e| e.message_count).sum(),
        conversations,
    })
}

pub fn write(paths: &ArchivePaths, manifest: &Manifest) -> Result<PathBuf> {
    let file = paths.manifest_file();
    let data = serde_json::to_string_pretty(manifest)?;
    write_atomic(&file, format!("{data}\n").as_bytes())?;
    Ok(file)
}

pub fn refresh(paths: &ArchivePaths) -> Result<Manifest> {
    let manifest = rebuild(paths)?;
    write(paths, &manifest)?;
    Ok(manifest)
}
