use crate::error::SyncError;
use crate::platform::{PageRequest, PlatformClient, Session};
use crate::sync::governor::RateGovernor;
use crate::sync::model::{
    ArchivedMessage, Attachment, Author, ConversationKind, ConversationRef, MessageId, Platform,
    Reaction, ReplyRef,
};
use crate::sync::util::single_line;
use chrono::{DateTime, SubsecRound, Utc};

const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

/// Lowest snowflake a message created at `at` can carry.
pub fn snowflake_floor(at: DateTime<Utc>) -> MessageId {
    let ms = (at.timestamp_millis() - DISCORD_EPOCH_MS).max(0) as u64;
    MessageId(ms << 22)
}

/// Platform-agnostic record as delivered by a client, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRecord {
    pub id: MessageId,
    pub author_id: String,
    pub author_name: String,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub reply_to: Option<MessageId>,
    pub reply_author: Option<String>,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<Reaction>,
}

fn clean_token(raw: &str, fallback: &str) -> String {
    let token: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '(' | ')' | '[' | ']' | '|'))
        .collect();
    if token.is_empty() {
        fallback.to_string()
    } else {
        token
    }
}

fn clean_name(raw: &str, fallback: &str) -> String {
    let name = single_line(raw);
    if name.is_empty() {
        fallback.to_string()
    } else {
        name
    }
}

fn normalize_body(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim_end()
        .to_string()
}

fn normalize_reactions(raw: Vec<Reaction>) -> Vec<Reaction> {
    let mut out: Vec<Reaction> = Vec::with_capacity(raw.len());
    for reaction in raw {
        let emoji: String = reaction
            .emoji
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '|')
            .collect();
        if emoji.is_empty() {
            continue;
        }
        match out.iter_mut().find(|r| r.emoji == emoji) {
            Some(existing) => existing.count = reaction.count,
            None => out.push(Reaction {
                emoji,
                count: reaction.count,
            }),
        }
    }
    out.retain(|r| r.count > 0);
    out
}

impl FetchedRecord {
    /// Reduce the record to the shape the archive can represent exactly.
    pub fn normalize(self) -> ArchivedMessage {
        let reply_author = self
            .reply_author
            .map(|name| single_line(&name))
            .filter(|name| !name.is_empty());
        ArchivedMessage {
            id: self.id,
            author: Author {
                id: clean_token(&self.author_id, "unknown"),
                name: clean_name(&self.author_name, "unknown"),
            },
            timestamp: self.timestamp.trunc_subsecs(0),
            body: normalize_body(&self.body),
            reply_to: self.reply_to.map(|message_id| ReplyRef {
                message_id,
                author: reply_author,
            }),
            attachments: self
                .attachments
                .into_iter()
                .map(|a| Attachment {
                    name: clean_name(&a.name, "attachment"),
                    size: a.size,
                    url: a.url.split_whitespace().collect(),
                })
                .collect(),
            reactions: normalize_reactions(self.reactions),
        }
    }
}

/// Paging strategy for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAdapter {
    /// Snowflake-ordered; pages arrive newest first and are reversed.
    DiscordChannel,
    /// Message-id ordered, ascending pages, date window via `since`.
    TelegramChat,
    /// Privacy-scoped: the first sync only takes the `cap` most recent
    /// messages, paging backwards.
    DirectMessages { cap: u32 },
}

impl FetchAdapter {
    pub fn select(conversation: &ConversationRef, dm_cap: u32) -> Self {
        match (conversation.kind, conversation.platform) {
            (ConversationKind::Direct, _) => Self::DirectMessages { cap: dm_cap },
            (_, Platform::Discord) => Self::DiscordChannel,
            (_, Platform::Telegram) => Self::TelegramChat,
        }
    }
}

/// Where a fetch starts and how much it may take.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchPlan {
    /// Exclusive lower id bound, normally the committed cursor.
    pub after: Option<MessageId>,
    /// Inclusive lower time bound for date-windowed syncs.
    pub since: Option<DateTime<Utc>>,
    /// Total cap on records yielded.
    pub limit: Option<u32>,
    pub page_size: u32,
    /// Backfill the window below this id (the oldest archived message)
    /// before resuming after `after`.
    pub backfill_below: Option<MessageId>,
}

/// Pull-based stream of chronological batches for one conversation.
#[derive(Debug)]
pub struct FetchStream {
    adapter: FetchAdapter,
    conversation: ConversationRef,
    label: String,
    after: Option<MessageId>,
    since: Option<DateTime<Utc>>,
    /// Exclusive upper id bound while backfilling.
    until: Option<MessageId>,
    /// Where forward paging resumes once the backfill is exhausted.
    resume_after: Option<MessageId>,
    remaining: Option<u32>,
    page_size: u32,
    done: bool,
}

impl FetchStream {
    pub fn new(adapter: FetchAdapter, conversation: ConversationRef, label: &str, plan: FetchPlan) -> Self {
        // Direct messages never reach back past their first capped capture.
        let backfill = match adapter {
            FetchAdapter::DirectMessages { .. } => None,
            _ => plan.backfill_below.filter(|_| plan.after.is_some() && plan.since.is_some()),
        };
        let start = if backfill.is_some() { None } else { plan.after };
        let after = match (adapter, start, plan.since) {
            (_, Some(after), _) => Some(after),
            (FetchAdapter::DiscordChannel, None, Some(since)) => Some(snowflake_floor(since)),
            (FetchAdapter::DiscordChannel, None, None) => Some(MessageId(0)),
            _ => None,
        };
        Self {
            adapter,
            conversation,
            label: label.to_string(),
            after,
            since: plan.since,
            until: backfill,
            resume_after: backfill.and(plan.after),
            remaining: plan.limit,
            page_size: plan.page_size.clamp(1, 100),
            done: plan.limit == Some(0),
        }
    }

    /// Whether the stream is still filling history below the archive.
    pub fn backfilling(&self) -> bool {
        self.until.is_some()
    }

    fn request_limit(&self) -> u32 {
        match self.remaining {
            Some(remaining) => remaining.min(self.page_size),
            None => self.page_size,
        }
    }

    fn keep(&self, record: &FetchedRecord) -> bool {
        let after_ok = self.after.is_none_or(|after| record.id > after);
        let until_ok = self.until.is_none_or(|until| record.id < until);
        let since_ok = self.since.is_none_or(|since| record.timestamp >= since);
        after_ok && until_ok && since_ok
    }

    fn take_capped(&mut self, mut batch: Vec<FetchedRecord>) -> Vec<FetchedRecord> {
        if let Some(remaining) = self.remaining {
            batch.truncate(remaining as usize);
            let left = remaining - batch.len() as u32;
            self.remaining = Some(left);
            if left == 0 {
                self.done = true;
            }
        }
        batch
    }

    /// Next batch in ascending id order, or `None` once the conversation is
    /// exhausted. Batches may overlap previously delivered records.
    pub async fn next_batch(
        &mut self,
        client: &dyn PlatformClient,
        session: &Session,
        governor: &RateGovernor,
    ) -> Result<Option<Vec<FetchedRecord>>, SyncError> {
        if self.done {
            return Ok(None);
        }
        match self.adapter {
            FetchAdapter::DirectMessages { cap } if self.after.is_none() => {
                self.done = true;
                let cap = self.remaining.map_or(cap, |limit| limit.min(cap));
                let batch = self.backfill_recent(client, session, governor, cap).await?;
                Ok(Some(batch))
            }
            _ => loop {
                let batch = self.forward_page(client, session, governor).await?;
                // A backfill that ends on an empty page hands over to the
                // forward phase within the same call.
                match batch {
                    Some(batch) if batch.is_empty() && !self.done => continue,
                    other => return Ok(other),
                }
            },
        }
    }

    async fn forward_page(
        &mut self,
        client: &dyn PlatformClient,
        session: &Session,
        governor: &RateGovernor,
    ) -> Result<Option<Vec<FetchedRecord>>, SyncError> {
        let request = PageRequest {
            after: self.after,
            before: self.until,
            since: self.since,
            limit: self.request_limit(),
        };
        let conversation = &self.conversation;
        let req = &request;
        let mut page = governor
            .execute(&self.label, || client.fetch_page(session, conversation, req))
            .await?;
        let delivered = page.len();
        let reached_archive = self
            .until
            .is_some_and(|until| page.iter().any(|r| r.id >= until));

        match self.adapter {
            FetchAdapter::DiscordChannel => page.reverse(),
            _ => page.sort_by_key(|r| r.id),
        }
        page.retain(|r| self.keep(r));
        page.sort_by_key(|r| r.id);
        page.dedup_by_key(|r| r.id);

        let newest = page.last().map(|r| r.id);
        if let Some(newest) = newest {
            self.after = Some(newest);
        }
        let exhausted = delivered < request.limit as usize || newest.is_none() || reached_archive;
        if exhausted {
            match self.resume_after.take() {
                Some(resume) => {
                    tracing::debug!(conversation = %self.label, resume = %resume, "backfill complete");
                    self.until = None;
                    self.since = None;
                    self.after = Some(resume);
                }
                None => self.done = true,
            }
        }
        let batch = self.take_capped(page);
        if batch.is_empty() && self.done {
            return Ok(None);
        }
        Ok(Some(batch))
    }

    async fn backfill_recent(
        &mut self,
        client: &dyn PlatformClient,
        session: &Session,
        governor: &RateGovernor,
        cap: u32,
    ) -> Result<Vec<FetchedRecord>, SyncError> {
        let mut collected: Vec<FetchedRecord> = Vec::new();
        let mut before: Option<MessageId> = None;
        let conversation = &self.conversation;

        while (collected.len() as u32) < cap {
            let limit = (cap - collected.len() as u32).min(self.page_size);
            let request = PageRequest {
                after: None,
                before,
                since: None,
                limit,
            };
            let req = &request;
            let page = governor
                .execute(&self.label, || client.fetch_page(session, conversation, req))
                .await?;
            let delivered = page.len();
            let oldest = page.iter().map(|r| r.id).min();
            let reached_window = page
                .iter()
                .any(|r| self.since.is_some_and(|since| r.timestamp < since));
            collected.extend(page.into_iter().filter(|r| {
                before.is_none_or(|b| r.id < b) && self.since.is_none_or(|s| r.timestamp >= s)
            }));
            match oldest {
                Some(oldest) if before.is_none_or(|b| oldest < b) => before = Some(oldest),
                _ => break,
            }
            if delivered < limit as usize || reached_window {
                break;
            }
        }

        collected.sort_by_key(|r| r.id);
        collected.dedup_by_key(|r| r.id);
        let excess = collected.len().saturating_sub(cap as usize);
        collected.drain(..excess);
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(collected.len() as u32);
        }
        Ok(collected)
    }
}
