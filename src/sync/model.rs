use crate::error::SyncError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Platform-native message ordinal (Discord snowflake, Telegram message id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(MessageId)
            .map_err(|_| SyncError::InvalidInput(format!("invalid message id `{s}`")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Discord,
    Telegram,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Discord, Platform::Telegram];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discord => "discord",
            Self::Telegram => "telegram",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discord" => Ok(Self::Discord),
            "telegram" => Ok(Self::Telegram),
            other => Err(SyncError::InvalidInput(format!("unknown platform `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Channel,
    Topic,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Incremental,
    Full,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Full => "full",
        }
    }
}

/// Stable, path-safe identifier of a syncable conversation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationKey(String);

fn is_key_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}

/// Validate a platform id used as a single path or key segment.
pub fn id_segment(raw: &str) -> Result<&str, SyncError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(is_key_char) || trimmed.contains('_') {
        return Err(SyncError::InvalidInput(format!("invalid id segment `{raw}`")));
    }
    Ok(trimmed)
}

impl ConversationKey {
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let valid_prefix = ["c_", "t_", "dm_"].iter().any(|p| raw.starts_with(p));
        if !valid_prefix || !raw.chars().all(is_key_char) || raw.ends_with('_') {
            return Err(SyncError::InvalidInput(format!(
                "invalid conversation key `{raw}`"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn channel(scope: Option<&str>, channel_id: &str) -> Result<Self, SyncError> {
        let channel = id_segment(channel_id)?;
        match scope {
            Some(scope) => Ok(Self(format!("c_{}_{channel}", id_segment(scope)?))),
            None => Ok(Self(format!("c_{channel}"))),
        }
    }

    pub fn topic(channel_id: &str, topic_id: &str) -> Result<Self, SyncError> {
        Ok(Self(format!(
            "t_{}_{}",
            id_segment(channel_id)?,
            id_segment(topic_id)?
        )))
    }

    pub fn direct(channel_id: &str) -> Result<Self, SyncError> {
        Ok(Self(format!("dm_{}", id_segment(channel_id)?)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ConversationKey {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ConversationKey> for String {
    fn from(value: ConversationKey) -> Self {
        value.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A syncable unit. Topics and threads are their own conversations with their
/// own cursor, never attributes of the parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRef {
    pub platform: Platform,
    pub kind: ConversationKind,
    /// Server (Discord) or group (Telegram) the conversation belongs to.
    pub scope: Option<String>,
    pub channel_id: String,
    pub topic_id: Option<String>,
    pub name: String,
}

impl ConversationRef {
    pub fn channel(platform: Platform, scope: Option<&str>, channel_id: &str, name: &str) -> Self {
        Self {
            platform,
            kind: ConversationKind::Channel,
            scope: scope.map(str::to_string),
            channel_id: channel_id.to_string(),
            topic_id: None,
            name: name.to_string(),
        }
    }

    pub fn topic(
        platform: Platform,
        scope: Option<&str>,
        channel_id: &str,
        topic_id: &str,
        name: &str,
    ) -> Self {
        Self {
            platform,
            kind: ConversationKind::Topic,
            scope: scope.map(str::to_string),
            channel_id: channel_id.to_string(),
            topic_id: Some(topic_id.to_string()),
            name: name.to_string(),
        }
    }

    pub fn direct(platform: Platform, channel_id: &str, name: &str) -> Self {
        Self {
            platform,
            kind: ConversationKind::Direct,
            scope: None,
            channel_id: channel_id.to_string(),
            topic_id: None,
            name: name.to_string(),
        }
    }

    pub fn key(&self) -> Result<ConversationKey, SyncError> {
        match self.kind {
            ConversationKind::Channel => {
                ConversationKey::channel(self.scope.as_deref(), &self.channel_id)
            }
            ConversationKind::Topic => {
                let topic = self.topic_id.as_deref().ok_or_else(|| {
                    SyncError::InvalidInput(format!("topic conversation {} has no topic id", self.channel_id))
                })?;
                ConversationKey::topic(&self.channel_id, topic)
            }
            ConversationKind::Direct => ConversationKey::direct(&self.channel_id),
        }
    }

    /// Id the remote API addresses for paging: the thread for topics on
    /// Discord, the channel otherwise.
    pub fn remote_id(&self) -> &str {
        match (self.platform, self.kind, self.topic_id.as_deref()) {
            (Platform::Discord, ConversationKind::Topic, Some(thread)) => thread,
            _ => &self.channel_id,
        }
    }

    pub fn display_title(&self) -> String {
        match self.kind {
            ConversationKind::Channel if self.platform == Platform::Discord => {
                format!("#{}", self.name)
            }
            ConversationKind::Direct => format!("DM: {}", self.name),
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub count: u32,
}

/// Weak back-reference to the message being replied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub message_id: MessageId,
    pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedMessage {
    pub id: MessageId,
    pub author: Author,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub reply_to: Option<ReplyRef>,
    pub attachments: Vec<Attachment>,
    /// Ordered by first-seen emoji.
    pub reactions: Vec<Reaction>,
}

impl ArchivedMessage {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    /// Archive ordering: timestamp ascending, id as tie-breaker.
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.timestamp, self.id)
    }
}
