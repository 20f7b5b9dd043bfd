use anyhow::Result;
use serde_json::json;

use crate::commands::CommandReport;
use crate::error::SyncError;
use crate::platform::{DIRECT_SCOPE, Session};
use crate::sync::engine::{SyncEngine, SyncOptions};
use crate::sync::model::{ConversationKind, ConversationRef};

#[derive(Debug, Clone, Default)]
pub struct SyncCommandOptions {
    /// Server (Discord) or group (Telegram) to sync.
    pub server: Option<String>,
    /// Restrict to these channel ids. Empty means every text channel.
    pub channels: Vec<String>,
    /// Restrict to these thread or topic ids.
    pub topics: Vec<String>,
    /// Direct-message conversations to sync.
    pub dms: Vec<String>,
    pub sync: SyncOptions,
}

fn wanted(conversation: &ConversationRef, opts: &SyncCommandOptions) -> bool {
    if opts.channels.is_empty() && opts.topics.is_empty() {
        return true;
    }
    match (conversation.kind, conversation.topic_id.as_deref()) {
        (ConversationKind::Topic, Some(topic)) => {
            opts.topics.iter().any(|t| t == topic)
                || (opts.topics.is_empty() && opts.channels.contains(&conversation.channel_id))
        }
        _ => opts.channels.contains(&conversation.channel_id),
    }
}

async fn select_targets(
    engine: &SyncEngine,
    session: &Session,
    opts: &SyncCommandOptions,
) -> Result<Vec<ConversationRef>, SyncError> {
    let mut targets = Vec::new();
    if let Some(server) = &opts.server {
        let discovered = engine.discover(session, server).await?;
        targets.extend(discovered.into_iter().filter(|c| wanted(c, opts)));
        for id in &opts.channels {
            if !targets.iter().any(|c| &c.channel_id == id) {
                return Err(SyncError::NotFound(format!("channel {id} in {server}")));
            }
        }
        for id in &opts.topics {
            if !targets.iter().any(|c| c.topic_id.as_ref() == Some(id)) {
                return Err(SyncError::NotFound(format!("topic {id} in {server}")));
            }
        }
    }
    if !opts.dms.is_empty() {
        let known = engine.discover(session, DIRECT_SCOPE).await?;
        for id in &opts.dms {
            let conversation = known
                .iter()
                .find(|c| &c.channel_id == id)
                .cloned()
                .unwrap_or_else(|| ConversationRef::direct(engine.platform(), id, id));
            targets.push(conversation);
        }
    }
    Ok(targets)
}

pub async fn run(engine: &SyncEngine, opts: &SyncCommandOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("sync");
    if opts.server.is_none() && opts.dms.is_empty() {
        return Err(SyncError::InvalidInput("pass --server/--group or --dm".into()).into());
    }

    let session = engine.authenticate().await?;
    let targets = select_targets(engine, &session, opts).await?;
    report.detail(format!(
        "platform={} user={} conversations={}",
        engine.platform(),
        session.display_name,
        targets.len()
    ));

    let run = engine.sync_all(&session, targets, &opts.sync).await;
    for done in &run.completed {
        report.detail(format!(
            "{} ({}): +{} appended, {} updated, {} total{}",
            done.conversation_key,
            done.display_name,
            done.appended,
            done.updated,
            done.total,
            if done.cancelled { ", cancelled" } else { "" }
        ));
    }
    for failure in &run.failed {
        report.issue(format!(
            "{} [{}] {}: {}",
            failure.conversation,
            failure.stage,
            failure.source.code().as_str(),
            failure.source
        ));
    }
    if let Some(manifest) = &run.manifest {
        report.detail(format!("manifest={}", manifest.display()));
    }
    if run.cancelled {
        report.issue("cancelled; every committed page is kept");
    }
    if !run.failed.is_empty() {
        report.exit_code = run.exit_code();
    }

    let failed: Vec<_> = run
        .failed
        .iter()
        .map(|f| {
            json!({
                "conversation": f.conversation,
                "stage": f.stage,
                "code": f.source.code().as_str(),
                "error": f.source.to_string(),
            })
        })
        .collect();
    report.with_data(&json!({
        "completed": run.completed,
        "failed": failed,
        "cancelled": run.cancelled,
        "manifest": run.manifest,
    }))?;
    Ok(report)
}
