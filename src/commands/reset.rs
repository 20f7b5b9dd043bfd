use anyhow::Result;

use crate::commands::CommandReport;
use crate::sync::cursor::CursorStore;
use crate::sync::model::{ConversationKey, Platform};
use crate::sync::paths::resolve_paths;

#[derive(Debug, Clone)]
pub struct ResetOptions {
    pub platform: Platform,
    pub key: String,
}

/// Forget a conversation's cursor. The archive stays; the next sync
/// re-walks the window and dedup skips what is already archived.
pub fn run(opts: &ResetOptions) -> Result<CommandReport> {
    let key = ConversationKey::parse(&opts.key)?;
    let paths = resolve_paths()?;
    let store = CursorStore::open(&paths, opts.platform, &key);
    let mut report = CommandReport::new("reset");

    if !store.cursor_path().exists() {
        report.detail(format!("no cursor for {}/{key}", opts.platform));
        return Ok(report);
    }
    let _lock = store.lock()?;
    if store.reset()? {
        report.detail(format!("removed cursor {}", store.cursor_path().display()));
    }
    if store.archive_path().exists() {
        report.detail(format!("archive kept at {}", store.archive_path().display()));
    }
    Ok(report)
}
