use anyhow::Result;
use serde_json::json;

use crate::commands::CommandReport;
use crate::error::SyncError;
use crate::sync::cursor::CursorStore;
use crate::sync::markdown::{self, ArchiveDocument, ArchiveHeader};
use crate::sync::model::{ConversationKey, Platform};
use crate::sync::paths::resolve_paths;
use crate::sync::query::ArchiveQuery;

#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub platform: Platform,
    pub key: String,
    pub query: ArchiveQuery,
}

/// Print archived messages of one conversation, optionally filtered.
/// Read-only: neither the archive nor the cursor is touched.
pub fn run(opts: &ReadOptions) -> Result<CommandReport> {
    let key = ConversationKey::parse(&opts.key)?;
    let paths = resolve_paths()?;
    let store = CursorStore::open(&paths, opts.platform, &key);
    let Some(parsed) = store.load_archive()? else {
        return Err(SyncError::NotFound(format!(
            "no archive for {}/{key}; run `sync` first",
            opts.platform
        ))
        .into());
    };

    let mut report = CommandReport::new("read");
    let total = parsed.messages.len();
    let selected: Vec<_> = opts.query.apply(&parsed.messages).into_iter().cloned().collect();
    report.detail(format!("conversation={key} matched={} total={total}", selected.len()));
    if parsed.skipped > 0 {
        report.detail(format!("unreadable_blocks={}", parsed.skipped));
    }

    let header = parsed.header.unwrap_or_else(|| ArchiveHeader {
        title: key.to_string(),
        conversation: key.clone(),
        platform: opts.platform,
        scope: None,
    });
    let doc = ArchiveDocument {
        header,
        messages: selected,
        preserved: Vec::new(),
    };
    report.text = Some(markdown::render(&doc));
    report.with_data(&json!({
        "conversation": key,
        "matched": doc.messages.len(),
        "total": total,
        "messages": doc.messages,
    }))?;
    Ok(report)
}
