//! Boundary to remote chat platforms.
//!
//! The sync core only depends on [`PlatformClient`]; each platform provides
//! one implementation.

pub mod discord;

use crate::error::PlatformError;
use crate::sync::fetch::FetchedRecord;
use crate::sync::members::MemberRecord;
use crate::sync::model::{ConversationRef, MessageId, Platform};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Scope that lists the caller's direct-message conversations instead of a
/// server's or group's.
pub const DIRECT_SCOPE: &str = "@me";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub display_name: String,
}

/// One page request. `after` and `before` are exclusive id bounds; `since`
/// is an inclusive lower time bound that clients may use to seed the first
/// page of a date-windowed sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub after: Option<MessageId>,
    pub before: Option<MessageId>,
    pub since: Option<DateTime<Utc>>,
    pub limit: u32,
}

/// One page of a server's member list. `roles` on each record hold the
/// provider's role ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberPage {
    pub members: Vec<MemberRecord>,
    /// Cursor for the following page; `None` once the list is exhausted.
    pub next: Option<String>,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn platform(&self) -> Platform;

    async fn authenticate(&self) -> Result<Session, PlatformError>;

    /// Conversations under a server or group, including threads and topics
    /// as separate entries.
    async fn list_conversations(
        &self,
        session: &Session,
        scope: &str,
    ) -> Result<Vec<ConversationRef>, PlatformError>;

    /// Records in the provider's native page order; the fetch adapter puts
    /// them in chronological order.
    async fn fetch_page(
        &self,
        session: &Session,
        conversation: &ConversationRef,
        request: &PageRequest,
    ) -> Result<Vec<FetchedRecord>, PlatformError>;

    /// Role id to role name. Platforms without server roles keep the
    /// empty default and member role ids pass through unchanged.
    async fn role_names(
        &self,
        _session: &Session,
        _server_id: &str,
    ) -> Result<HashMap<String, String>, PlatformError> {
        Ok(HashMap::new())
    }

    async fn fetch_member_page(
        &self,
        session: &Session,
        server_id: &str,
        after: Option<&str>,
    ) -> Result<MemberPage, PlatformError>;

    async fn send_message(
        &self,
        session: &Session,
        conversation: &ConversationRef,
        body: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, PlatformError>;
}
