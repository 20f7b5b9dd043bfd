#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use commsync::error::PlatformError;
use commsync::platform::{MemberPage, PageRequest, PlatformClient, Session};
use commsync::sync::config::CommsyncConfig;
use commsync::sync::engine::{CancelFlag, SyncEngine};
use commsync::sync::fetch::FetchedRecord;
use commsync::sync::members::MemberRecord;
use commsync::sync::model::{ConversationRef, MessageId, Platform, Reaction};
use commsync::sync::paths::ArchivePaths;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

#[derive(Default)]
struct State {
    conversations: HashMap<String, Vec<ConversationRef>>,
    messages: HashMap<String, Vec<FetchedRecord>>,
    members: HashMap<String, Vec<MemberRecord>>,
    roles: HashMap<String, HashMap<String, String>>,
    member_failures: HashMap<Option<String>, VecDeque<PlatformError>>,
    member_calls: Vec<Option<String>>,
    failures: HashMap<String, VecDeque<PlatformError>>,
    calls: Vec<(String, Instant)>,
    sent: Vec<(String, String, Option<MessageId>)>,
    cancel_after: Option<(usize, CancelFlag)>,
}

/// Members served per scripted member page.
pub const MEMBER_PAGE: usize = 2;

/// In-memory platform that pages like the real providers: Discord pages
/// come back newest first, Telegram pages ascending.
pub struct ScriptedClient {
    platform: Platform,
    state: Mutex<State>,
}

impl ScriptedClient {
    pub fn new(platform: Platform) -> Arc<Self> {
        Arc::new(Self {
            platform,
            state: Mutex::new(State::default()),
        })
    }

    pub fn add_conversation(&self, scope: &str, conversation: ConversationRef) {
        let mut state = self.state.lock().expect("state");
        state
            .conversations
            .entry(scope.to_string())
            .or_default()
            .push(conversation);
    }

    /// Add or replace records of the conversation paged at `remote_id`.
    pub fn put_messages(&self, remote_id: &str, records: Vec<FetchedRecord>) {
        let mut state = self.state.lock().expect("state");
        let stored = state.messages.entry(remote_id.to_string()).or_default();
        for record in records {
            stored.retain(|r| r.id != record.id);
            stored.push(record);
        }
        stored.sort_by_key(|r| r.id);
    }

    pub fn set_members(&self, server_id: &str, members: Vec<MemberRecord>) {
        let mut state = self.state.lock().expect("state");
        state.members.insert(server_id.to_string(), members);
    }

    pub fn set_roles(&self, server_id: &str, roles: &[(&str, &str)]) {
        let mut state = self.state.lock().expect("state");
        let named = roles
            .iter()
            .map(|(id, name)| (id.to_string(), name.to_string()))
            .collect();
        state.roles.insert(server_id.to_string(), named);
    }

    /// Fail the next member page requested with cursor `after`.
    pub fn fail_member_page(&self, after: Option<&str>, errors: Vec<PlatformError>) {
        let mut state = self.state.lock().expect("state");
        state
            .member_failures
            .entry(after.map(str::to_string))
            .or_default()
            .extend(errors);
    }

    /// Cursor of every member page request, in order.
    pub fn member_calls(&self) -> Vec<Option<String>> {
        self.state.lock().expect("state").member_calls.clone()
    }

    /// Fail the next page requests for `remote_id` with `errors`, in order.
    pub fn fail_next(&self, remote_id: &str, errors: Vec<PlatformError>) {
        let mut state = self.state.lock().expect("state");
        state
            .failures
            .entry(remote_id.to_string())
            .or_default()
            .extend(errors);
    }

    /// Raise `flag` once `pages` page requests have been served.
    pub fn cancel_after(&self, pages: usize, flag: CancelFlag) {
        self.state.lock().expect("state").cancel_after = Some((pages, flag));
    }

    pub fn calls_for(&self, remote_id: &str) -> Vec<Instant> {
        let state = self.state.lock().expect("state");
        state
            .calls
            .iter()
            .filter(|(id, _)| id == remote_id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn sent(&self) -> Vec<(String, String, Option<MessageId>)> {
        self.state.lock().expect("state").sent.clone()
    }

    fn page(&self, stored: &[FetchedRecord], request: &PageRequest) -> Vec<FetchedRecord> {
        let limit = request.limit as usize;
        match self.platform {
            Platform::Discord => {
                let mut page: Vec<FetchedRecord> = match (request.after, request.before) {
                    (Some(after), _) => stored
                        .iter()
                        .filter(|r| r.id > after)
                        .take(limit)
                        .cloned()
                        .collect(),
                    (None, before) => {
                        let older: Vec<&FetchedRecord> = stored
                            .iter()
                            .filter(|r| before.is_none_or(|b| r.id < b))
                            .collect();
                        let skip = older.len().saturating_sub(limit);
                        older.into_iter().skip(skip).cloned().collect()
                    }
                };
                page.reverse();
                page
            }
            Platform::Telegram => stored
                .iter()
                .filter(|r| request.after.is_none_or(|a| r.id > a))
                .filter(|r| request.before.is_none_or(|b| r.id < b))
                .filter(|r| request.since.is_none_or(|s| r.timestamp >= s))
                .take(limit)
                .cloned()
                .collect(),
        }
    }
}

#[async_trait]
impl PlatformClient for ScriptedClient {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn authenticate(&self) -> Result<Session, PlatformError> {
        Ok(Session {
            user_id: "1000".to_string(),
            display_name: "archivist".to_string(),
        })
    }

    async fn list_conversations(
        &self,
        _session: &Session,
        scope: &str,
    ) -> Result<Vec<ConversationRef>, PlatformError> {
        let state = self.state.lock().expect("state");
        state
            .conversations
            .get(scope)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("scope {scope}")))
    }

    async fn fetch_page(
        &self,
        _session: &Session,
        conversation: &ConversationRef,
        request: &PageRequest,
    ) -> Result<Vec<FetchedRecord>, PlatformError> {
        let remote_id = conversation.remote_id().to_string();
        let mut state = self.state.lock().expect("state");
        state.calls.push((remote_id.clone(), Instant::now()));
        if let Some((pages, flag)) = &state.cancel_after {
            if state.calls.len() >= *pages {
                flag.cancel();
            }
        }
        if let Some(err) = state.failures.get_mut(&remote_id).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        let stored = state.messages.get(&remote_id).cloned().unwrap_or_default();
        drop(state);
        Ok(self.page(&stored, request))
    }

    async fn role_names(
        &self,
        _session: &Session,
        server_id: &str,
    ) -> Result<HashMap<String, String>, PlatformError> {
        let state = self.state.lock().expect("state");
        Ok(state.roles.get(server_id).cloned().unwrap_or_default())
    }

    async fn fetch_member_page(
        &self,
        _session: &Session,
        server_id: &str,
        after: Option<&str>,
    ) -> Result<MemberPage, PlatformError> {
        let mut state = self.state.lock().expect("state");
        let cursor = after.map(str::to_string);
        state.member_calls.push(cursor.clone());
        if let Some(err) = state
            .member_failures
            .get_mut(&cursor)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        let all = state
            .members
            .get(server_id)
            .ok_or_else(|| PlatformError::NotFound(format!("server {server_id}")))?;
        let start = match after {
            Some(after) => all
                .iter()
                .position(|m| m.member_id == after)
                .map_or(all.len(), |i| i + 1),
            None => 0,
        };
        let members: Vec<MemberRecord> = all.iter().skip(start).take(MEMBER_PAGE).cloned().collect();
        let next = (members.len() == MEMBER_PAGE)
            .then(|| members.last().map(|m| m.member_id.clone()))
            .flatten();
        Ok(MemberPage { members, next })
    }

    async fn send_message(
        &self,
        _session: &Session,
        conversation: &ConversationRef,
        body: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, PlatformError> {
        let remote_id = conversation.remote_id().to_string();
        let mut state = self.state.lock().expect("state");
        if let Some(err) = state.failures.get_mut(&remote_id).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        state.sent.push((remote_id, body.to_string(), reply_to));
        Ok(MessageId(9_000 + state.sent.len() as u64))
    }
}

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 10, minute, 0)
        .single()
        .expect("timestamp")
}

pub fn record(id: u64, minute: u32, body: &str) -> FetchedRecord {
    FetchedRecord {
        id: MessageId(id),
        author_id: "11".to_string(),
        author_name: "alice".to_string(),
        timestamp: at(minute),
        body: body.to_string(),
        reply_to: None,
        reply_author: None,
        attachments: Vec::new(),
        reactions: Vec::new(),
    }
}

/// Record stamped `days` before now, for window and backfill scenarios.
pub fn days_ago(id: u64, days: i64, body: &str) -> FetchedRecord {
    FetchedRecord {
        timestamp: Utc::now() - chrono::Duration::days(days),
        ..record(id, 0, body)
    }
}

pub fn reacted(mut record: FetchedRecord, emoji: &str, count: u32) -> FetchedRecord {
    record.reactions = vec![Reaction {
        emoji: emoji.to_string(),
        count,
    }];
    record
}

pub fn member(id: &str) -> MemberRecord {
    MemberRecord {
        member_id: id.to_string(),
        display_name: format!("user{id}"),
        joined_at: Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single().expect("ts")),
        roles: Vec::new(),
        is_bot: false,
    }
}

/// Config with fast spacing so tests that are not about pacing stay quick.
pub fn fast_config() -> CommsyncConfig {
    let mut config = CommsyncConfig::default();
    config.governor.min_interval_ms = 1;
    config.governor.max_attempts = 3;
    config.governor.transient_base_delay_ms = 1;
    config.governor.transient_max_delay_ms = 5;
    config
}

pub fn engine(client: &Arc<ScriptedClient>, root: &std::path::Path, config: CommsyncConfig) -> SyncEngine {
    let client: Arc<dyn PlatformClient> = client.clone();
    SyncEngine::new(client, ArchivePaths::rooted(root), config)
}
