use crate::error::SyncError;
use crate::sync::markdown::{self, ArchiveDocument, ParsedArchive};
use crate::sync::model::{ConversationKey, MessageId, Platform, SyncMode};
use crate::sync::paths::{ARCHIVE_FILE, ArchivePaths, CURSOR_FILE};
use crate::sync::util::stage_file;
use crate::sync::warn::{self, WarnEvent};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::PathBuf;

pub const CURSOR_SCHEMA_VERSION: u32 = 1;

/// Durable sync state of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationCursor {
    pub schema_version: u32,
    pub conversation_key: ConversationKey,
    pub last_message_id: Option<MessageId>,
    pub last_synced_at: DateTime<Utc>,
    pub mode: SyncMode,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub oldest_message_id: Option<MessageId>,
    #[serde(default)]
    pub first_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ConversationCursor {
    /// Cursor describing `doc` after a merge.
    ///
    /// Incremental runs never move `last_message_id` backwards. A full run
    /// takes the archive's newest id, which cannot regress either because
    /// merges never drop records.
    pub fn after_merge(
        previous: Option<&ConversationCursor>,
        doc: &ArchiveDocument,
        batch_newest: Option<MessageId>,
        mode: SyncMode,
        synced_at: DateTime<Utc>,
    ) -> Self {
        let last_message_id = match mode {
            SyncMode::Incremental => previous
                .and_then(|c| c.last_message_id)
                .max(batch_newest)
                .max(doc.max_id()),
            SyncMode::Full => doc.max_id().max(batch_newest),
        };
        Self {
            schema_version: CURSOR_SCHEMA_VERSION,
            conversation_key: doc.header.conversation.clone(),
            last_message_id,
            last_synced_at: synced_at,
            mode,
            display_name: doc.header.title.clone(),
            scope: doc.header.scope.clone(),
            message_count: doc.messages.len(),
            oldest_message_id: doc.min_id(),
            first_message_at: doc.messages.first().map(|m| m.timestamp),
            last_message_at: doc.messages.last().map(|m| m.timestamp),
        }
    }
}

/// Exclusive writer lock on one conversation directory. Released on drop.
#[derive(Debug)]
pub struct ConversationLock {
    file: File,
    path: PathBuf,
}

impl Drop for ConversationLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), error = %err, "unlock failed");
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Temp artifacts of an interrupted commit that were discarded.
    pub discarded: usize,
}

/// Cursor and archive files of one conversation.
#[derive(Debug, Clone)]
pub struct CursorStore {
    key: ConversationKey,
    dir: PathBuf,
    archive: PathBuf,
    cursor: PathBuf,
    lock: PathBuf,
}

impl CursorStore {
    pub fn open(paths: &ArchivePaths, platform: Platform, key: &ConversationKey) -> Self {
        Self {
            key: key.clone(),
            dir: paths.conversation_dir(platform, key),
            archive: paths.archive_file(platform, key),
            cursor: paths.cursor_file(platform, key),
            lock: paths.lock_file(platform, key),
        }
    }

    pub fn archive_path(&self) -> &PathBuf {
        &self.archive
    }

    pub fn cursor_path(&self) -> &PathBuf {
        &self.cursor
    }

    pub fn lock(&self) -> Result<ConversationLock, SyncError> {
        fs::create_dir_all(&self.dir)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(ConversationLock {
                file,
                path: self.lock.clone(),
            }),
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(SyncError::Locked(self.lock.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Discard temp artifacts left by an interrupted commit. The cursor on
    /// disk then trails the archive at worst, so the next fetch re-delivers
    /// the unconfirmed page and dedup absorbs it.
    pub fn recover(&self) -> Result<RecoveryReport, SyncError> {
        let mut report = RecoveryReport::default();
        if !self.dir.exists() {
            return Ok(report);
        }
        let prefixes = [format!(".{ARCHIVE_FILE}."), format!(".{CURSOR_FILE}.")];
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let torn = name.ends_with(".tmp") && prefixes.iter().any(|p| name.starts_with(p));
            if !torn {
                continue;
            }
            fs::remove_file(entry.path())?;
            report.discarded += 1;
            warn::emit(
                WarnEvent::new("TORN_COMMIT", "merge", self.key.as_str())
                    .reason("discarded_temp_artifact")
                    .err(name),
            );
        }
        Ok(report)
    }

    pub fn get(&self) -> Result<Option<ConversationCursor>, SyncError> {
        let raw = match fs::read_to_string(&self.cursor) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let cursor: ConversationCursor =
            serde_json::from_str(&raw).map_err(|err| SyncError::CorruptState {
                path: self.cursor.clone(),
                reason: err.to_string(),
            })?;
        if cursor.conversation_key != self.key {
            return Err(SyncError::CorruptState {
                path: self.cursor.clone(),
                reason: format!(
                    "cursor belongs to {} not {}",
                    cursor.conversation_key, self.key
                ),
            });
        }
        Ok(Some(cursor))
    }

    /// Read the archive back. Unreadable blocks, invalid UTF-8 included, are
    /// carried as preserved spans instead of failing the load.
    pub fn load_archive(&self) -> Result<Option<ParsedArchive>, SyncError> {
        let raw = match fs::read(&self.archive) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let parsed = markdown::parse_bytes(&raw);
        if parsed.skipped > 0 {
            let skipped = format!("skipped={}", parsed.skipped);
            warn::emit(
                WarnEvent::new("ARCHIVE_BLOCKS_SKIPPED", "merge", self.key.as_str())
                    .reason("malformed_block")
                    .err(&skipped),
            );
        }
        Ok(Some(parsed))
    }

    /// Make the archive and cursor durable together. Both are staged and
    /// fsynced first; the archive is swapped in before the cursor so a crash
    /// in between leaves a cursor that trails the archive, never one ahead of
    /// it.
    pub fn commit(
        &self,
        archive: Option<&str>,
        cursor: &ConversationCursor,
    ) -> Result<(), SyncError> {
        let cursor_json = format!("{}\n", serde_json::to_string_pretty(cursor)?);
        let staged_archive = archive
            .map(|rendered| stage_file(&self.archive, rendered.as_bytes()))
            .transpose()?;
        let staged_cursor = stage_file(&self.cursor, cursor_json.as_bytes())?;

        if let Some(staged) = staged_archive {
            staged.persist(&self.archive).map_err(|err| err.error)?;
        }
        staged_cursor.persist(&self.cursor).map_err(|err| err.error)?;
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// Drop the cursor so the next sync starts over. The archive is kept and
    /// dedup protects it from the re-fetch.
    pub fn reset(&self) -> Result<bool, SyncError> {
        match fs::remove_file(&self.cursor) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
