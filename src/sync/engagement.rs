use crate::sync::cursor::CursorStore;
use crate::sync::members::MemberSnapshot;
use crate::sync::model::{ConversationKey, Platform};
use crate::sync::paths::ArchivePaths;
use crate::sync::profile::ProfileStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementTier {
    Champion,
    Active,
    Occasional,
    Lurker,
    Silent,
}

impl EngagementTier {
    pub const ALL: [EngagementTier; 5] = [
        Self::Champion,
        Self::Active,
        Self::Occasional,
        Self::Lurker,
        Self::Silent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Champion => "champion",
            Self::Active => "active",
            Self::Occasional => "occasional",
            Self::Lurker => "lurker",
            Self::Silent => "silent",
        }
    }
}

pub fn tier_for(message_count: usize, is_moderator: bool) -> EngagementTier {
    if is_moderator || message_count >= 100 {
        EngagementTier::Champion
    } else if message_count >= 21 {
        EngagementTier::Active
    } else if message_count >= 5 {
        EngagementTier::Occasional
    } else if message_count >= 1 {
        EngagementTier::Lurker
    } else {
        EngagementTier::Silent
    }
}

pub fn is_moderator(roles: &[String], moderator_keywords: &[String]) -> bool {
    roles.iter().any(|role| {
        let role = role.to_lowercase();
        moderator_keywords
            .iter()
            .any(|kw| !kw.is_empty() && role.contains(&kw.to_lowercase()))
    })
}

/// Messages per author id across every archived conversation of `scope`,
/// counting only messages at or after `since`. Read fresh on every call.
pub fn count_messages(
    paths: &ArchivePaths,
    platform: Platform,
    scope: &str,
    since: DateTime<Utc>,
) -> Result<BTreeMap<String, usize>> {
    let mut counts = BTreeMap::new();
    let dir = paths.platform_dir(platform);
    if !dir.exists() {
        return Ok(counts);
    }
    for entry in fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        let Some(key) = entry
            .file_name()
            .to_str()
            .and_then(|name| ConversationKey::parse(name).ok())
        else {
            continue;
        };
        let store = CursorStore::open(paths, platform, &key);
        let Some(parsed) = store.load_archive()? else {
            continue;
        };
        let in_scope = parsed
            .header
            .as_ref()
            .and_then(|h| h.scope.as_deref())
            .is_some_and(|s| s == scope);
        if !in_scope {
            continue;
        }
        for msg in parsed.messages.iter().filter(|m| m.timestamp >= since) {
            *counts.entry(msg.author.id.clone()).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberEngagement {
    pub member_id: String,
    pub display_name: String,
    pub message_count: usize,
    pub is_moderator: bool,
    pub tier: EngagementTier,
    pub has_profile: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngagementReport {
    pub server_id: String,
    pub window_days: u32,
    pub since: DateTime<Utc>,
    pub snapshot_captured_at: DateTime<Utc>,
    pub total_members: usize,
    pub tier_counts: BTreeMap<EngagementTier, usize>,
    pub members: Vec<MemberEngagement>,
}

/// Tier every human member of `snapshot` by their archived activity over the
/// last `window_days` days.
pub fn build_report(
    paths: &ArchivePaths,
    platform: Platform,
    snapshot: &MemberSnapshot,
    moderator_keywords: &[String],
    window_days: u32,
    now: DateTime<Utc>,
) -> Result<EngagementReport> {
    let since = now - Duration::days(i64::from(window_days));
    let counts = count_messages(paths, platform, &snapshot.server_key, since)?;
    let profiles = ProfileStore::open(paths, platform);

    let mut tier_counts: BTreeMap<EngagementTier, usize> =
        EngagementTier::ALL.iter().map(|t| (*t, 0)).collect();
    let mut members = Vec::new();
    for member in snapshot.members.iter().filter(|m| !m.is_bot) {
        let message_count = counts.get(&member.member_id).copied().unwrap_or(0);
        let is_moderator = is_moderator(&member.roles, moderator_keywords);
        let tier = tier_for(message_count, is_moderator);
        *tier_counts.entry(tier).or_insert(0) += 1;
        members.push(MemberEngagement {
            member_id: member.member_id.clone(),
            display_name: member.display_name.clone(),
            message_count,
            is_moderator,
            tier,
            has_profile: profiles.exists(&member.member_id),
        });
    }
    members.sort_by(|a, b| {
        a.tier
            .cmp(&b.tier)
            .then(b.message_count.cmp(&a.message_count))
            .then(a.member_id.cmp(&b.member_id))
    });

    Ok(EngagementReport {
        server_id: snapshot.server_key.clone(),
        window_days,
        since,
        snapshot_captured_at: snapshot.captured_at,
        total_members: members.len(),
        tier_counts,
        members,
    })
}
