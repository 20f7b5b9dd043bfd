use anyhow::Result;

use crate::commands::CommandReport;
use crate::sync::manifest;
use crate::sync::paths::resolve_paths;

#[derive(Debug, Clone, Default)]
pub struct ManifestOptions {
    /// List every conversation, not only totals.
    pub print: bool,
}

pub fn run(opts: &ManifestOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("manifest");

    let manifest = manifest::refresh(&paths)?;
    report.detail(format!("manifest={}", paths.manifest_file().display()));
    report.detail(format!(
        "conversations={} messages={}",
        manifest.total_conversations, manifest.total_messages
    ));
    if opts.print {
        for (key, entry) in &manifest.conversations {
            let last = entry
                .last_message_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            report.detail(format!(
                "{key} {} messages={} last={last}",
                entry.display_name, entry.message_count
            ));
        }
    }
    report.with_data(&manifest)?;
    Ok(report)
}
