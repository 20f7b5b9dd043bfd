use anyhow::Result;

use crate::commands::CommandReport;
use crate::error::SyncError;
use crate::sync::config::load_config;
use crate::sync::engagement::{self, EngagementTier};
use crate::sync::members::SnapshotStore;
use crate::sync::model::{Platform, id_segment};
use crate::sync::paths::resolve_paths;
use crate::sync::util::now_utc;

#[derive(Debug, Clone)]
pub struct EngagementOptions {
    pub platform: Platform,
    pub server: String,
    pub days: Option<u32>,
}

pub fn run(opts: &EngagementOptions) -> Result<CommandReport> {
    let server = id_segment(&opts.server)?;
    let paths = resolve_paths()?;
    let config = load_config()?;
    let mut report = CommandReport::new("engagement");

    let store = SnapshotStore::open(&paths, opts.platform, server);
    let (_, latest) = store.latest_two()?;
    let snapshot = latest.ok_or_else(|| {
        SyncError::NotFound(format!(
            "no member snapshot for server {server}; run `members sync` first"
        ))
    })?;

    let window = opts.days.unwrap_or(config.engagement.window_days);
    let out = engagement::build_report(
        &paths,
        opts.platform,
        &snapshot,
        &config.engagement.moderator_roles,
        window,
        now_utc(),
    )?;

    report.detail(format!(
        "server={} members={} window_days={} snapshot={}",
        out.server_id,
        out.total_members,
        out.window_days,
        out.snapshot_captured_at.to_rfc3339()
    ));
    for tier in EngagementTier::ALL {
        let count = out.tier_counts.get(&tier).copied().unwrap_or(0);
        report.detail(format!("{}={count}", tier.as_str()));
    }
    let without_profile = out
        .members
        .iter()
        .filter(|m| m.tier <= EngagementTier::Active && !m.has_profile)
        .count();
    if without_profile > 0 {
        report.detail(format!("engaged_without_profile={without_profile}"));
    }
    report.with_data(&out)?;
    Ok(report)
}
