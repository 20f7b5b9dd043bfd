//! Orchestration of one sync run: per-conversation fetch, merge and commit,
//! bounded fan-out across conversations, member snapshots and sends.

use crate::error::{PlatformError, SyncError};
use crate::platform::{PlatformClient, Session};
use crate::sync::audit;
use crate::sync::config::{CommsyncConfig, SyncSettings};
use crate::sync::cursor::{ConversationCursor, ConversationLock, CursorStore};
use crate::sync::fetch::{FetchAdapter, FetchPlan, FetchStream, FetchedRecord};
use crate::sync::governor::{GovernorPolicy, RateGovernor};
use crate::sync::manifest;
use crate::sync::markdown::{self, ArchiveDocument, ArchiveHeader};
use crate::sync::members::{self, ChurnRecord, MemberDiff, MemberSnapshot, SnapshotStore};
use crate::sync::merge::{MergeOutcome, merge_into};
use crate::sync::model::{
    ArchivedMessage, ConversationKey, ConversationRef, MessageId, Platform, SyncMode, id_segment,
};
use crate::sync::paths::ArchivePaths;
use crate::sync::util::now_utc;
use crate::sync::warn::{self, WarnEvent};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Cooperative cancellation shared by every task of a run. Checked between
/// pages, so committed state always lands on a page boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStage {
    Auth,
    Fetch,
    Merge,
}

impl SyncStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Fetch => "fetch",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Ignore the cursor and re-walk the window. Dedup keeps the archive
    /// append-only.
    pub full: bool,
    /// Date window in days. Defaults to the configured window for first
    /// syncs; unbounded for full syncs. With a cursor, a window reaching
    /// past the oldest archived message is backfilled.
    pub days: Option<u32>,
    /// Cap on records fetched per conversation.
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationReport {
    pub platform: Platform,
    pub conversation_key: ConversationKey,
    pub display_name: String,
    pub mode: SyncMode,
    pub pages: usize,
    pub appended: usize,
    pub updated: usize,
    pub total: usize,
    pub cursor_before: Option<MessageId>,
    pub cursor_after: Option<MessageId>,
    /// The cursor file was unreadable and the cursor was rebuilt from the
    /// archive.
    pub rederived_cursor: bool,
    /// Temp files of an interrupted commit that were discarded on open.
    pub discarded_artifacts: usize,
    pub cancelled: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("{conversation} failed during {stage}: {source}")]
pub struct ConversationFailure {
    pub conversation: String,
    pub stage: SyncStage,
    #[source]
    pub source: SyncError,
}

#[derive(Debug, Default)]
pub struct SyncRunReport {
    pub completed: Vec<ConversationReport>,
    pub failed: Vec<ConversationFailure>,
    pub cancelled: bool,
    pub manifest: Option<PathBuf>,
}

impl SyncRunReport {
    pub fn appended(&self) -> usize {
        self.completed.iter().map(|c| c.appended).sum()
    }

    /// 0 when every conversation completed, otherwise the exit code of the
    /// first failure in key order.
    pub fn exit_code(&self) -> i32 {
        self.failed.first().map_or(0, |f| f.source.exit_code())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberSyncReport {
    pub server_id: String,
    pub snapshot_path: PathBuf,
    pub captured_at: DateTime<Utc>,
    pub member_count: usize,
    pub previous_captured_at: Option<DateTime<Utc>>,
    /// `None` on the first capture of a server.
    pub diff: Option<MemberDiff>,
    pub churn_recorded: usize,
}

struct Prepared {
    store: CursorStore,
    lock: ConversationLock,
    cursor: Option<ConversationCursor>,
    doc: ArchiveDocument,
    archive_exists: bool,
    rederived: bool,
    discarded: usize,
}

/// Lock the conversation, clean up after a torn commit and load its state.
fn prepare(
    paths: &ArchivePaths,
    conversation: &ConversationRef,
    key: ConversationKey,
) -> Result<Prepared, SyncError> {
    let store = CursorStore::open(paths, conversation.platform, &key);
    let lock = store.lock()?;
    let recovery = store.recover()?;

    let parsed = store.load_archive()?;
    let archive_exists = parsed.is_some();
    let (header, messages, preserved) = match parsed {
        Some(parsed) => (
            parsed.header.filter(|h| h.conversation == key),
            parsed.messages,
            parsed.preserved,
        ),
        None => (None, Vec::new(), Vec::new()),
    };
    let header = header.unwrap_or_else(|| ArchiveHeader {
        title: conversation.display_title(),
        conversation: key.clone(),
        platform: conversation.platform,
        scope: conversation.scope.clone(),
    });
    let doc = ArchiveDocument {
        header,
        messages,
        preserved,
    };

    let (cursor, rederived) = match store.get() {
        Ok(cursor) => (cursor, false),
        Err(SyncError::CorruptState { reason, .. }) => {
            warn::emit(
                WarnEvent::new("CURSOR_CORRUPT", "merge", key.as_str())
                    .reason("rederived_from_archive")
                    .err(&reason),
            );
            let derived =
                ConversationCursor::after_merge(None, &doc, None, SyncMode::Incremental, now_utc());
            (derived.last_message_id.is_some().then_some(derived), true)
        }
        Err(err) => return Err(err),
    };

    Ok(Prepared {
        store,
        lock,
        cursor,
        doc,
        archive_exists,
        rederived,
        discarded: recovery.discarded,
    })
}

/// Merge one batch and commit archive and cursor together when anything
/// moved. Returns the document and the cursor now on disk.
fn merge_and_commit(
    store: &CursorStore,
    mut doc: ArchiveDocument,
    previous: Option<ConversationCursor>,
    incoming: Vec<ArchivedMessage>,
    mode: SyncMode,
) -> Result<(ArchiveDocument, Option<ConversationCursor>, MergeOutcome, bool), SyncError> {
    let outcome = merge_into(&mut doc, incoming);
    let next = ConversationCursor::after_merge(
        previous.as_ref(),
        &doc,
        outcome.newest_id,
        mode,
        now_utc(),
    );
    let cursor_moved = previous.as_ref().map(|c| c.last_message_id) != Some(next.last_message_id);
    if !outcome.changed() && !cursor_moved {
        return Ok((doc, previous, outcome, false));
    }
    let rendered = outcome.changed().then(|| markdown::render(&doc));
    store.commit(rendered.as_deref(), &next)?;
    Ok((doc, Some(next), outcome, rendered.is_some()))
}

/// Decide where a conversation's fetch starts. An incremental run with a
/// cursor resumes strictly after it; without one it takes the date window.
/// An explicit `--days` window that reaches past the oldest archived message
/// backfills that stretch first.
fn plan_fetch(
    settings: &SyncSettings,
    options: &SyncOptions,
    cursor: Option<&ConversationCursor>,
    now: DateTime<Utc>,
) -> (SyncMode, FetchPlan) {
    let window = |days: u32| now - Duration::days(i64::from(days));
    let base = FetchPlan {
        limit: options.limit,
        page_size: settings.page_size,
        ..FetchPlan::default()
    };
    if options.full {
        let plan = FetchPlan {
            since: options.days.map(window),
            ..base
        };
        return (SyncMode::Full, plan);
    }
    let plan = match cursor.and_then(|c| c.last_message_id.map(|after| (c, after))) {
        Some((cursor, after)) => {
            let since = options.days.map(window);
            let backfill_below = match (since, cursor.first_message_at, cursor.oldest_message_id) {
                (Some(since), Some(first), Some(oldest)) if since < first => Some(oldest),
                _ => None,
            };
            FetchPlan {
                after: Some(after),
                since: backfill_below.and(since),
                backfill_below,
                ..base
            }
        }
        None => FetchPlan {
            since: Some(window(options.days.unwrap_or(settings.default_days))),
            ..base
        },
    };
    (SyncMode::Incremental, plan)
}

async fn run_blocking<T, F>(task: F) -> Result<T, SyncError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| SyncError::Internal(format!("blocking task failed: {err}")))?
}

/// Drives sync for one platform credential.
#[derive(Clone)]
pub struct SyncEngine {
    client: Arc<dyn PlatformClient>,
    paths: ArchivePaths,
    config: CommsyncConfig,
    provider: Arc<RateGovernor>,
    cancel: CancelFlag,
}

impl SyncEngine {
    pub fn new(client: Arc<dyn PlatformClient>, paths: ArchivePaths, config: CommsyncConfig) -> Self {
        let provider = RateGovernor::provider(GovernorPolicy::from(&config.governor));
        Self {
            client,
            paths,
            config,
            provider,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn paths(&self) -> &ArchivePaths {
        &self.paths
    }

    pub fn platform(&self) -> Platform {
        self.client.platform()
    }

    fn task_governor(&self) -> RateGovernor {
        RateGovernor::child(&self.provider)
    }

    pub async fn authenticate(&self) -> Result<Session, SyncError> {
        let client = self.client.as_ref();
        let result = self
            .task_governor()
            .execute("auth", || client.authenticate())
            .await;
        match &result {
            Ok(session) => tracing::info!(
                platform = %self.platform(),
                user = %session.display_name,
                "authenticated"
            ),
            Err(err) => audit::record(
                &self.paths,
                "auth",
                "error",
                &format!("platform={} err={err}", self.platform()),
            ),
        }
        result
    }

    /// Conversations of a server or group, topics and threads included.
    pub async fn discover(
        &self,
        session: &Session,
        scope: &str,
    ) -> Result<Vec<ConversationRef>, SyncError> {
        let client = self.client.as_ref();
        let mut conversations = self
            .task_governor()
            .execute(scope, || client.list_conversations(session, scope))
            .await?;
        conversations.sort_by(|a, b| a.channel_id.cmp(&b.channel_id).then(a.topic_id.cmp(&b.topic_id)));
        Ok(conversations)
    }

    /// Sync one conversation to completion, cancellation or first
    /// unrecoverable failure. Every committed page is durable on its own.
    pub async fn sync_conversation(
        &self,
        session: &Session,
        conversation: ConversationRef,
        options: &SyncOptions,
    ) -> Result<ConversationReport, ConversationFailure> {
        let label = conversation
            .key()
            .map(|k| k.to_string())
            .unwrap_or_else(|_| conversation.channel_id.clone());
        let result = self.run_conversation(session, conversation, options, &label).await;
        match &result {
            Ok(report) => audit::record(
                &self.paths,
                "sync",
                if report.cancelled { "cancelled" } else { "ok" },
                &format!(
                    "platform={} conversation={} appended={} updated={} total={}",
                    report.platform, label, report.appended, report.updated, report.total
                ),
            ),
            Err(failure) => audit::record(
                &self.paths,
                "sync",
                "error",
                &format!(
                    "conversation={} stage={} code={} err={}",
                    label,
                    failure.stage,
                    failure.source.code().as_str(),
                    failure.source
                ),
            ),
        }
        result
    }

    async fn run_conversation(
        &self,
        session: &Session,
        conversation: ConversationRef,
        options: &SyncOptions,
        label: &str,
    ) -> Result<ConversationReport, ConversationFailure> {
        let fail = |stage: SyncStage, source: SyncError| ConversationFailure {
            conversation: label.to_string(),
            stage,
            source,
        };
        let key = conversation.key().map_err(|e| fail(SyncStage::Fetch, e))?;

        let paths = self.paths.clone();
        let target = conversation.clone();
        let prepare_key = key.clone();
        let Prepared {
            store,
            lock,
            mut cursor,
            mut doc,
            mut archive_exists,
            rederived,
            discarded,
        } = run_blocking(move || prepare(&paths, &target, prepare_key))
            .await
            .map_err(|e| fail(SyncStage::Merge, e))?;

        let cursor_before = cursor.as_ref().and_then(|c| c.last_message_id);
        let (mode, plan) = plan_fetch(&self.config.sync, options, cursor.as_ref(), now_utc());
        let backfill_below = plan.backfill_below;
        let adapter = FetchAdapter::select(&conversation, self.config.sync.dm_limit);
        let mut stream = FetchStream::new(adapter, conversation.clone(), label, plan);
        let governor = self.task_governor();

        let mut report = ConversationReport {
            platform: conversation.platform,
            conversation_key: key.clone(),
            display_name: doc.header.title.clone(),
            mode,
            pages: 0,
            appended: 0,
            updated: 0,
            total: doc.messages.len(),
            cursor_before,
            cursor_after: cursor_before,
            rederived_cursor: rederived,
            discarded_artifacts: discarded,
            cancelled: false,
        };
        tracing::debug!(
            conversation = label,
            mode = mode.as_str(),
            after = ?cursor_before,
            backfill_below = ?backfill_below,
            "sync start"
        );

        loop {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let batch = match stream
                .next_batch(self.client.as_ref(), session, &governor)
                .await
            {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(err @ SyncError::Auth(_)) => return Err(fail(SyncStage::Auth, err)),
                Err(err) => return Err(fail(SyncStage::Fetch, err)),
            };
            report.pages += 1;
            let incoming: Vec<ArchivedMessage> =
                batch.into_iter().map(FetchedRecord::normalize).collect();

            let page_store = store.clone();
            let previous = cursor.take();
            let (merged, committed, outcome, wrote_archive) =
                run_blocking(move || merge_and_commit(&page_store, doc, previous, incoming, mode))
                    .await
                    .map_err(|e| fail(SyncStage::Merge, e))?;
            doc = merged;
            cursor = committed;
            archive_exists |= wrote_archive;
            report.appended += outcome.appended;
            report.updated += outcome.updated;
            tracing::debug!(
                conversation = label,
                page = report.pages,
                appended = outcome.appended,
                updated = outcome.updated,
                "page committed"
            );
        }

        if !report.cancelled {
            let finished = ConversationCursor::after_merge(cursor.as_ref(), &doc, None, mode, now_utc());
            let rendered = (!archive_exists).then(|| markdown::render(&doc));
            let final_store = store.clone();
            cursor = Some(
                run_blocking(move || {
                    final_store.commit(rendered.as_deref(), &finished)?;
                    Ok(finished)
                })
                .await
                .map_err(|e| fail(SyncStage::Merge, e))?,
            );
        }
        drop(lock);

        report.total = doc.messages.len();
        report.cursor_after = cursor.as_ref().and_then(|c| c.last_message_id);
        tracing::info!(
            conversation = label,
            appended = report.appended,
            updated = report.updated,
            total = report.total,
            cancelled = report.cancelled,
            "conversation synced"
        );
        Ok(report)
    }

    /// Sync many conversations with bounded concurrency. One conversation
    /// failing never stops the others. The manifest is rebuilt afterwards.
    pub async fn sync_all(
        &self,
        session: &Session,
        conversations: Vec<ConversationRef>,
        options: &SyncOptions,
    ) -> SyncRunReport {
        let semaphore = Arc::new(Semaphore::new(self.config.sync.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for conversation in conversations {
            if self.cancel.is_cancelled() {
                break;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let engine = self.clone();
            let session = session.clone();
            let options = options.clone();
            tasks.spawn(async move {
                let _permit = permit;
                engine.sync_conversation(&session, conversation, &options).await
            });
        }

        let mut report = SyncRunReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(done)) => report.completed.push(done),
                Ok(Err(failure)) => report.failed.push(failure),
                Err(err) => report.failed.push(ConversationFailure {
                    conversation: "unknown".to_string(),
                    stage: SyncStage::Merge,
                    source: SyncError::Internal(err.to_string()),
                }),
            }
        }
        report
            .completed
            .sort_by(|a, b| a.conversation_key.cmp(&b.conversation_key));
        report.failed.sort_by(|a, b| a.conversation.cmp(&b.conversation));
        report.cancelled = self.cancel.is_cancelled();

        let paths = self.paths.clone();
        match tokio::task::spawn_blocking(move || manifest::refresh(&paths).map(|_| paths.manifest_file())).await {
            Ok(Ok(file)) => report.manifest = Some(file),
            Ok(Err(err)) => warn::emit(
                WarnEvent::new("MANIFEST_REFRESH_FAILED", "manifest", "all").err(&err.to_string()),
            ),
            Err(err) => warn::emit(
                WarnEvent::new("MANIFEST_REFRESH_FAILED", "manifest", "all").err(&err.to_string()),
            ),
        }
        audit::record(
            &self.paths,
            "sync-run",
            if report.failed.is_empty() { "ok" } else { "partial" },
            &format!(
                "platform={} completed={} failed={} appended={} cancelled={}",
                self.platform(),
                report.completed.len(),
                report.failed.len(),
                report.appended(),
                report.cancelled
            ),
        );
        report
    }

    /// Capture the member list of a server, diff it against the previous
    /// capture and append departures to the churn ledger.
    pub async fn sync_members(&self, session: &Session, server_id: &str) -> Result<MemberSyncReport> {
        let server_id = id_segment(server_id)?.to_string();
        let client = self.client.as_ref();
        let server = server_id.as_str();
        let governor = self.task_governor();
        let roles = governor
            .execute(server, || client.role_names(session, server))
            .await?;

        // One governed call per page, so a retry repeats only that page.
        let mut records = Vec::new();
        let mut after: Option<String> = None;
        let mut pages = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                return Err(anyhow!(
                    "member capture of {server} cancelled after {pages} pages; no snapshot written"
                ));
            }
            let page = governor
                .execute(server, || client.fetch_member_page(session, server, after.as_deref()))
                .await?;
            pages += 1;
            records.extend(page.members);
            match page.next {
                Some(next) if after.as_deref() != Some(next.as_str()) => after = Some(next),
                _ => break,
            }
        }
        for record in &mut records {
            for role in &mut record.roles {
                if let Some(name) = roles.get(role.as_str()) {
                    *role = name.clone();
                }
            }
        }
        tracing::debug!(server, pages, members = records.len(), "member list fetched");

        let paths = self.paths.clone();
        let platform = self.platform();
        let report = tokio::task::spawn_blocking(move || {
            record_snapshot(&paths, platform, &server_id, records, now_utc())
        })
        .await
        .context("member snapshot task failed")??;

        audit::record(
            &self.paths,
            "members",
            "ok",
            &format!(
                "server={} members={} joined={} left={}",
                report.server_id,
                report.member_count,
                report.diff.as_ref().map_or(0, |d| d.joined.len()),
                report.diff.as_ref().map_or(0, |d| d.left.len()),
            ),
        );
        Ok(report)
    }

    /// Post a message. Transient failures are not retried: the provider may
    /// already have accepted the first attempt.
    pub async fn send(
        &self,
        session: &Session,
        conversation: &ConversationRef,
        body: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, SyncError> {
        if body.trim().is_empty() {
            return Err(SyncError::InvalidInput("message body is empty".into()));
        }
        let client = self.client.as_ref();
        let label = conversation
            .key()
            .map(|k| k.to_string())
            .unwrap_or_else(|_| conversation.channel_id.clone());
        let sent = self
            .task_governor()
            .execute(&label, || async move {
                client
                    .send_message(session, conversation, body, reply_to)
                    .await
                    .map_err(|err| match err {
                        PlatformError::Transient(message) => {
                            PlatformError::Protocol(format!("send outcome unknown: {message}"))
                        }
                        other => other,
                    })
            })
            .await;
        let (status, detail) = match &sent {
            Ok(id) => ("ok", format!("conversation={label} message={id}")),
            Err(err) => ("error", format!("conversation={label} err={err}")),
        };
        audit::record(&self.paths, "send", status, &detail);
        sent
    }
}

fn record_snapshot(
    paths: &ArchivePaths,
    platform: Platform,
    server_id: &str,
    records: Vec<members::MemberRecord>,
    captured_at: DateTime<Utc>,
) -> Result<MemberSyncReport> {
    let store = SnapshotStore::open(paths, platform, server_id);
    let (_, previous) = store.latest_two()?;
    // Snapshot files are keyed by second; two captures in the same second
    // must not overwrite each other.
    let captured_at = previous
        .as_ref()
        .map_or(captured_at, |p| captured_at.max(p.captured_at + Duration::seconds(1)));
    let current = MemberSnapshot::new(server_id, captured_at, records);
    let snapshot_path = store.save(&current)?;

    let diff = previous.as_ref().map(|prev| members::diff(prev, &current));
    let departures: Vec<ChurnRecord> = diff
        .as_ref()
        .map(|d| {
            d.left
                .iter()
                .map(|m| ChurnRecord::from_departure(m, captured_at))
                .collect()
        })
        .unwrap_or_default();
    store.append_churn(&departures)?;

    Ok(MemberSyncReport {
        server_id: server_id.to_string(),
        snapshot_path,
        captured_at,
        member_count: current.members.len(),
        previous_captured_at: previous.map(|p| p.captured_at),
        diff,
        churn_recorded: departures.len(),
    })
}
