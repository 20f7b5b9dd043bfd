//! Discord REST (v10) client.

use super::{DIRECT_SCOPE, MemberPage, PageRequest, PlatformClient, Session};
use crate::error::{PlatformError, SyncError};
use crate::sync::fetch::FetchedRecord;
use crate::sync::members::MemberRecord;
use crate::sync::model::{Attachment, ConversationRef, MessageId, Platform, Reaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const MEMBER_PAGE: u32 = 1000;

#[derive(Clone)]
pub enum DiscordToken {
    Bot(String),
    User(String),
}

impl std::fmt::Debug for DiscordToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bot(_) => f.write_str("Bot(***)"),
            Self::User(_) => f.write_str("User(***)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub api_base: String,
    pub token: DiscordToken,
}

impl DiscordConfig {
    /// Bot token wins when both are set.
    pub fn from_env() -> Result<Self, SyncError> {
        let non_empty = |var: &str| {
            env::var(var)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let token = match (non_empty("DISCORD_BOT_TOKEN"), non_empty("DISCORD_USER_TOKEN")) {
            (Some(bot), _) => DiscordToken::Bot(bot),
            (None, Some(user)) => DiscordToken::User(user),
            (None, None) => {
                return Err(SyncError::Auth(
                    "no Discord credential; set DISCORD_BOT_TOKEN or DISCORD_USER_TOKEN".into(),
                ));
            }
        };
        Ok(Self {
            api_base: non_empty("COMMSYNC_DISCORD_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            token,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawUser {
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    bot: bool,
}

impl RawUser {
    fn display(&self) -> String {
        self.global_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.username.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    position: Option<i64>,
    #[serde(default)]
    recipients: Vec<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawThreadList {
    #[serde(default)]
    threads: Vec<RawChannel>,
}

#[derive(Debug, Deserialize)]
struct RawReference {
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAttachment {
    #[serde(default)]
    filename: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct RawEmoji {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReaction {
    #[serde(default)]
    count: u32,
    emoji: RawEmoji,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: String,
    author: RawUser,
    #[serde(default)]
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    message_reference: Option<RawReference>,
    #[serde(default)]
    referenced_message: Option<Box<RawMessage>>,
    #[serde(default)]
    attachments: Vec<RawAttachment>,
    #[serde(default)]
    reactions: Vec<RawReaction>,
}

#[derive(Debug, Deserialize)]
struct RawMember {
    user: RawUser,
    #[serde(default)]
    nick: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    joined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawRole {
    id: String,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawRateLimit {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

fn parse_id(raw: &str) -> Result<MessageId, PlatformError> {
    raw.parse::<u64>()
        .map(MessageId)
        .map_err(|_| PlatformError::Protocol(format!("non-numeric id `{raw}`")))
}

/// Map a non-success HTTP status onto the platform error taxonomy.
fn classify_status(status: u16, retry_header: Option<f64>, body: &str, what: &str) -> PlatformError {
    match status {
        429 => {
            let hint: RawRateLimit = serde_json::from_str(body).unwrap_or_default();
            let secs = hint.retry_after.or(retry_header).unwrap_or(1.0).max(0.0);
            PlatformError::RateLimited {
                retry_after: Duration::from_secs_f64(secs),
                global: hint.global,
            }
        }
        401 => PlatformError::Auth(format!("{what}: HTTP 401")),
        403 | 404 => PlatformError::NotFound(format!("{what}: HTTP {status}")),
        408 | 500..=599 => PlatformError::Transient(format!("{what}: HTTP {status}")),
        _ => PlatformError::Protocol(format!("{what}: HTTP {status}")),
    }
}

fn classify_transport(err: reqwest::Error, what: &str) -> PlatformError {
    if err.is_decode() {
        PlatformError::Protocol(format!("{what}: {err}"))
    } else {
        PlatformError::Transient(format!("{what}: {err}"))
    }
}

fn emoji_label(emoji: &RawEmoji) -> String {
    let name = emoji.name.clone().unwrap_or_default();
    match &emoji.id {
        Some(id) => format!("<:{name}:{id}>"),
        None => name,
    }
}

fn to_record(raw: RawMessage) -> Result<FetchedRecord, PlatformError> {
    let reply_to = raw
        .message_reference
        .as_ref()
        .and_then(|r| r.message_id.as_deref())
        .map(parse_id)
        .transpose()?;
    let reply_author = raw.referenced_message.as_ref().map(|m| m.author.display());
    Ok(FetchedRecord {
        id: parse_id(&raw.id)?,
        author_name: raw.author.display(),
        author_id: raw.author.id,
        timestamp: raw.timestamp,
        body: raw.content,
        reply_to,
        reply_author,
        attachments: raw
            .attachments
            .into_iter()
            .map(|a| Attachment {
                name: a.filename,
                size: a.size,
                url: a.url,
            })
            .collect(),
        reactions: raw
            .reactions
            .iter()
            .map(|r| Reaction {
                emoji: emoji_label(&r.emoji),
                count: r.count,
            })
            .collect(),
    })
}

/// Text and announcement channels of a server, then its active threads as
/// separate conversations.
fn server_conversations(
    server_id: &str,
    mut channels: Vec<RawChannel>,
    threads: Vec<RawChannel>,
) -> Vec<ConversationRef> {
    channels.retain(|c| matches!(c.kind, 0 | 5));
    channels.sort_by_key(|c| c.position.unwrap_or(i64::MAX));
    let mut out: Vec<ConversationRef> = channels
        .iter()
        .map(|c| {
            ConversationRef::channel(
                Platform::Discord,
                Some(server_id),
                &c.id,
                c.name.as_deref().unwrap_or(&c.id),
            )
        })
        .collect();
    for thread in threads.iter().filter(|t| matches!(t.kind, 10..=12)) {
        let Some(parent) = thread.parent_id.as_deref() else {
            continue;
        };
        out.push(ConversationRef::topic(
            Platform::Discord,
            Some(server_id),
            parent,
            &thread.id,
            thread.name.as_deref().unwrap_or(&thread.id),
        ));
    }
    out
}

/// A short page ends the list; a full one continues after its last user.
fn member_page(page: Vec<RawMember>, limit: usize) -> MemberPage {
    let next = (page.len() >= limit)
        .then(|| page.last().map(|m| m.user.id.clone()))
        .flatten();
    let members = page
        .into_iter()
        .map(|m| MemberRecord {
            display_name: m
                .nick
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| m.user.display()),
            member_id: m.user.id,
            joined_at: m.joined_at,
            roles: m.roles,
            is_bot: m.user.bot,
        })
        .collect();
    MemberPage { members, next }
}

fn direct_conversations(channels: Vec<RawChannel>) -> Vec<ConversationRef> {
    channels
        .into_iter()
        .filter(|c| matches!(c.kind, 1 | 3))
        .map(|c| {
            let name = c.name.clone().unwrap_or_else(|| {
                c.recipients
                    .iter()
                    .map(RawUser::display)
                    .collect::<Vec<_>>()
                    .join(", ")
            });
            ConversationRef::direct(Platform::Discord, &c.id, &name)
        })
        .collect()
}

#[derive(Clone)]
pub struct DiscordClient {
    http: Client,
    config: DiscordConfig,
}

impl DiscordClient {
    pub fn new(config: DiscordConfig) -> Result<Self, SyncError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| SyncError::Internal(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn auth(&self, req: RequestBuilder) -> RequestBuilder {
        let value = match &self.config.token {
            DiscordToken::Bot(token) => format!("Bot {token}"),
            DiscordToken::User(token) => token.clone(),
        };
        req.header(AUTHORIZATION, value).header(
            USER_AGENT,
            concat!("DiscordBot (commsync, ", env!("CARGO_PKG_VERSION"), ")"),
        )
    }

    async fn call<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> Result<T, PlatformError> {
        let resp = self
            .auth(req)
            .send()
            .await
            .map_err(|err| classify_transport(err, what))?;
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|err| PlatformError::Protocol(format!("{what}: {err}")));
        }
        let retry_header = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok());
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), retry_header, &body, what))
    }
}

#[async_trait]
impl PlatformClient for DiscordClient {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    async fn authenticate(&self) -> Result<Session, PlatformError> {
        let me: RawUser = self
            .call(self.http.get(self.url("/users/@me")), "GET /users/@me")
            .await?;
        Ok(Session {
            display_name: me.display(),
            user_id: me.id,
        })
    }

    async fn list_conversations(
        &self,
        _session: &Session,
        scope: &str,
    ) -> Result<Vec<ConversationRef>, PlatformError> {
        if scope == DIRECT_SCOPE {
            let channels: Vec<RawChannel> = self
                .call(self.http.get(self.url("/users/@me/channels")), "GET dm channels")
                .await?;
            return Ok(direct_conversations(channels));
        }
        let channels: Vec<RawChannel> = self
            .call(
                self.http.get(self.url(&format!("/guilds/{scope}/channels"))),
                "GET channels",
            )
            .await?;
        let threads = match self
            .call::<RawThreadList>(
                self.http.get(self.url(&format!("/guilds/{scope}/threads/active"))),
                "GET active threads",
            )
            .await
        {
            Ok(list) => list.threads,
            Err(PlatformError::NotFound(detail)) => {
                tracing::debug!(server = scope, detail = %detail, "active threads unavailable");
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        Ok(server_conversations(scope, channels, threads))
    }

    async fn fetch_page(
        &self,
        _session: &Session,
        conversation: &ConversationRef,
        request: &PageRequest,
    ) -> Result<Vec<FetchedRecord>, PlatformError> {
        let mut query: Vec<(&str, String)> = vec![("limit", request.limit.clamp(1, 100).to_string())];
        // The API honours one anchor per request; with `after` set the
        // upper bound is enforced by the fetch stream.
        match (request.after, request.before) {
            (Some(after), _) => query.push(("after", after.to_string())),
            (None, Some(before)) => query.push(("before", before.to_string())),
            (None, None) => {}
        }
        let path = format!("/channels/{}/messages", conversation.remote_id());
        let raw: Vec<RawMessage> = self
            .call(self.http.get(self.url(&path)).query(&query), "GET messages")
            .await?;
        raw.into_iter().map(to_record).collect()
    }

    async fn role_names(
        &self,
        _session: &Session,
        server_id: &str,
    ) -> Result<HashMap<String, String>, PlatformError> {
        let roles: Vec<RawRole> = self
            .call(
                self.http.get(self.url(&format!("/guilds/{server_id}/roles"))),
                "GET roles",
            )
            .await?;
        Ok(roles.into_iter().map(|r| (r.id, r.name)).collect())
    }

    async fn fetch_member_page(
        &self,
        _session: &Session,
        server_id: &str,
        after: Option<&str>,
    ) -> Result<MemberPage, PlatformError> {
        let after = after.unwrap_or("0");
        let page: Vec<RawMember> = self
            .call(
                self.http
                    .get(self.url(&format!("/guilds/{server_id}/members")))
                    .query(&[("limit", MEMBER_PAGE.to_string()), ("after", after.to_string())]),
                "GET members",
            )
            .await?;
        Ok(member_page(page, MEMBER_PAGE as usize))
    }

    async fn send_message(
        &self,
        _session: &Session,
        conversation: &ConversationRef,
        body: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, PlatformError> {
        let mut payload = serde_json::json!({ "content": body });
        if let Some(reply) = reply_to {
            payload["message_reference"] = serde_json::json!({ "message_id": reply.to_string() });
        }
        let path = format!("/channels/{}/messages", conversation.remote_id());
        let sent: RawMessage = self
            .call(self.http.post(self.url(&path)).json(&payload), "POST message")
            .await?;
        parse_id(&sent.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_body_wins_over_header() {
        let err = classify_status(429, Some(9.0), r#"{"retry_after": 2.5, "global": true}"#, "GET");
        match err {
            PlatformError::RateLimited {
                retry_after,
                global,
            } => {
                assert_eq!(retry_after, Duration::from_millis(2500));
                assert!(global);
            }
            other => panic!("unexpected {other:?}"),
        }
        let err = classify_status(429, Some(4.0), "", "GET");
        assert!(matches!(
            err,
            PlatformError::RateLimited { retry_after, global: false } if retry_after == Duration::from_secs(4)
        ));
    }

    #[test]
    fn full_member_page_points_at_its_last_user() {
        let raw: Vec<RawMember> = serde_json::from_str(
            r#"[
                {"user": {"id": "5", "username": "eve"}, "nick": " ", "roles": ["r1"]},
                {"user": {"id": "9", "username": "bot", "bot": true}, "nick": "Helper"}
            ]"#,
        )
        .expect("parse");
        let page = member_page(raw, 2);
        assert_eq!(page.next.as_deref(), Some("9"));
        assert_eq!(page.members[0].display_name, "eve");
        assert_eq!(page.members[0].roles, vec!["r1".to_string()]);
        assert_eq!(page.members[1].display_name, "Helper");
        assert!(page.members[1].is_bot);

        let raw: Vec<RawMember> =
            serde_json::from_str(r#"[{"user": {"id": "12", "username": "z"}}]"#).expect("parse");
        assert_eq!(member_page(raw, 2).next, None);
    }

    #[test]
    fn statuses_map_to_taxonomy() {
        assert!(matches!(classify_status(401, None, "", "x"), PlatformError::Auth(_)));
        assert!(matches!(classify_status(403, None, "", "x"), PlatformError::NotFound(_)));
        assert!(matches!(classify_status(404, None, "", "x"), PlatformError::NotFound(_)));
        assert!(matches!(classify_status(502, None, "", "x"), PlatformError::Transient(_)));
        assert!(matches!(classify_status(400, None, "", "x"), PlatformError::Protocol(_)));
    }

    #[test]
    fn messages_convert_with_reply_and_custom_emoji() {
        let raw: RawMessage = serde_json::from_str(
            r#"{
                "id": "1200",
                "author": {"id": "7", "username": "alice", "global_name": "Alice"},
                "content": "hello",
                "timestamp": "2026-01-05T09:00:00.123000+00:00",
                "message_reference": {"message_id": "1100"},
                "referenced_message": {
                    "id": "1100",
                    "author": {"id": "8", "username": "bob"},
                    "timestamp": "2026-01-05T08:00:00+00:00"
                },
                "attachments": [{"filename": "a.png", "size": 10, "url": "https://cdn/a.png"}],
                "reactions": [{"count": 2, "emoji": {"id": "55", "name": "party"}}]
            }"#,
        )
        .expect("parse");
        let record = to_record(raw).expect("record");
        assert_eq!(record.id, MessageId(1200));
        assert_eq!(record.author_name, "Alice");
        assert_eq!(record.reply_to, Some(MessageId(1100)));
        assert_eq!(record.reply_author.as_deref(), Some("bob"));
        assert_eq!(record.attachments[0].name, "a.png");
        assert_eq!(record.reactions[0].emoji, "<:party:55>");
    }

    #[test]
    fn server_listing_keeps_text_channels_and_threads() {
        let channel = |id: &str, kind: u8, parent: Option<&str>, position: i64| RawChannel {
            id: id.to_string(),
            kind,
            name: Some(format!("n{id}")),
            parent_id: parent.map(str::to_string),
            position: Some(position),
            recipients: Vec::new(),
        };
        let convs = server_conversations(
            "1",
            vec![channel("30", 0, None, 2), channel("20", 2, None, 0), channel("10", 5, None, 1)],
            vec![channel("99", 11, Some("30"), 0)],
        );
        let keys: Vec<String> = convs
            .iter()
            .map(|c| c.key().expect("key").to_string())
            .collect();
        assert_eq!(keys, vec!["c_1_10", "c_1_30", "t_30_99"]);
        assert_eq!(convs[2].remote_id(), "99");
    }
}
