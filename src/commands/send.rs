use anyhow::Result;

use crate::commands::CommandReport;
use crate::sync::engine::SyncEngine;
use crate::sync::model::{ConversationRef, MessageId};

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub server: Option<String>,
    pub channel: String,
    pub topic: Option<String>,
    pub reply_to: Option<MessageId>,
    pub message: String,
}

fn target(engine: &SyncEngine, opts: &SendOptions) -> ConversationRef {
    let platform = engine.platform();
    match &opts.topic {
        Some(topic) => ConversationRef::topic(
            platform,
            opts.server.as_deref(),
            &opts.channel,
            topic,
            topic,
        ),
        None => ConversationRef::channel(platform, opts.server.as_deref(), &opts.channel, &opts.channel),
    }
}

/// Post one message. The archive picks it up on the next sync like any
/// other message.
pub async fn run(engine: &SyncEngine, opts: &SendOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("send");
    let conversation = target(engine, opts);
    conversation.key()?;

    let session = engine.authenticate().await?;
    let id = engine
        .send(&session, &conversation, &opts.message, opts.reply_to)
        .await?;
    report.detail(format!("sent message {id} to {}", conversation.remote_id()));
    report.with_data(&serde_json::json!({ "message_id": id }))?;
    Ok(report)
}
