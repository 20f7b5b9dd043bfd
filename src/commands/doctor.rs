use anyhow::Result;
use std::env;
use std::fs;

use crate::commands::CommandReport;
use crate::sync::config::{load_config, resolve_config_path};
use crate::sync::manifest;
use crate::sync::paths::resolve_paths;

include!(concat!(env!("OUT_DIR"), "/commsync_config_keys.rs"));

/// Sections and `section.key` entries of a config file that no config
/// field reads. They are ignored on load, so a typo silently keeps the
/// default.
fn unknown_config_keys(table: &toml::Table) -> Vec<String> {
    let mut unknown = Vec::new();
    for (section, value) in table {
        let prefix = format!("{section}.");
        if !CONFIG_KEYS.iter().any(|k| k.starts_with(&prefix)) {
            unknown.push(section.clone());
            continue;
        }
        if let Some(entries) = value.as_table() {
            for key in entries.keys() {
                let full = format!("{section}.{key}");
                if !CONFIG_KEYS.contains(&full.as_str()) {
                    unknown.push(full);
                }
            }
        }
    }
    unknown
}

/// Read-only health check of paths, configuration, credentials and the
/// archive tree.
pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("doctor");
    let paths = resolve_paths()?;

    report.detail(format!("build={}", env!("BUILD_UUID")));
    report.detail(format!("commsync_home={}", paths.home.display()));
    for (name, path) in [("data_root", &paths.data_root), ("logs_dir", &paths.logs_dir)] {
        if path.exists() {
            report.detail(format!("path.{name}=ok ({})", path.display()));
        } else {
            report.detail(format!("path.{name}=not_created ({})", path.display()));
        }
    }

    match load_config() {
        Ok(cfg) => report.detail(format!(
            "config=ok page_size={} concurrency={} default_days={} min_interval_ms={}",
            cfg.sync.page_size,
            cfg.sync.concurrency,
            cfg.sync.default_days,
            cfg.governor.min_interval_ms
        )),
        Err(err) => report.issue(format!("config=invalid ({err})")),
    }
    if let Some(path) = resolve_config_path().filter(|p| p.exists()) {
        let table = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| raw.parse::<toml::Table>().ok());
        for key in table.as_ref().map(unknown_config_keys).unwrap_or_default() {
            report.issue(format!("config.unknown_key={key}"));
        }
    }

    for (key, overrides) in ENV_KEYS {
        if env::var_os(key).is_none() {
            continue;
        }
        match overrides {
            Some(target) => report.detail(format!("env.{key}=set ({target})")),
            None => report.detail(format!("env.{key}=set")),
        }
    }

    let has = |var: &str| env::var(var).is_ok_and(|v| !v.trim().is_empty());
    match (has("DISCORD_BOT_TOKEN"), has("DISCORD_USER_TOKEN")) {
        (true, _) => report.detail("discord.credential=bot"),
        (false, true) => report.detail("discord.credential=user"),
        (false, false) => {
            report.issue("discord.credential=missing (set DISCORD_BOT_TOKEN or DISCORD_USER_TOKEN)")
        }
    }

    if paths.data_root.exists() {
        match manifest::rebuild(&paths) {
            Ok(index) => report.detail(format!(
                "archive.conversations={} archive.messages={}",
                index.total_conversations, index.total_messages
            )),
            Err(err) => report.issue(format!("archive=unreadable ({err:#})")),
        }
    }

    Ok(report)
}
