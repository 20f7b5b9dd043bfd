use anyhow::Result;

use crate::commands::CommandReport;
use crate::error::SyncError;
use crate::sync::engine::SyncEngine;
use crate::sync::members::{self, SnapshotStore};
use crate::sync::model::{Platform, id_segment};
use crate::sync::paths::resolve_paths;

pub async fn sync(engine: &SyncEngine, server: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("members-sync");
    let session = engine.authenticate().await?;
    let outcome = engine.sync_members(&session, server).await?;

    report.detail(format!("server={} members={}", outcome.server_id, outcome.member_count));
    report.detail(format!("snapshot={}", outcome.snapshot_path.display()));
    match &outcome.diff {
        Some(diff) => {
            report.detail(format!(
                "joined={} left={} unchanged={}",
                diff.joined.len(),
                diff.left.len(),
                diff.unchanged.len()
            ));
            for member in &diff.left {
                report.detail(format!("left: {} ({})", member.display_name, member.member_id));
            }
        }
        None => report.detail("first snapshot; nothing to diff"),
    }
    report.with_data(&outcome)?;
    Ok(report)
}

pub fn diff(platform: Platform, server: &str) -> Result<CommandReport> {
    let server = id_segment(server)?;
    let paths = resolve_paths()?;
    let store = SnapshotStore::open(&paths, platform, server);
    let mut report = CommandReport::new("members-diff");

    let (previous, latest) = store.latest_two()?;
    let latest = latest.ok_or_else(|| {
        SyncError::NotFound(format!(
            "no member snapshot for server {server}; run `members sync` first"
        ))
    })?;
    let Some(previous) = previous else {
        report.detail(format!(
            "only one snapshot ({}); nothing to diff",
            latest.captured_at.to_rfc3339()
        ));
        return Ok(report);
    };

    let diff = members::diff(&previous, &latest);
    report.detail(format!(
        "{} -> {}: joined={} left={} unchanged={}",
        previous.captured_at.to_rfc3339(),
        latest.captured_at.to_rfc3339(),
        diff.joined.len(),
        diff.left.len(),
        diff.unchanged.len()
    ));
    for member in &diff.joined {
        report.detail(format!("joined: {} ({})", member.display_name, member.member_id));
    }
    for member in &diff.left {
        report.detail(format!("left: {} ({})", member.display_name, member.member_id));
    }
    report.with_data(&diff)?;
    Ok(report)
}

pub fn trend(platform: Platform, server: &str) -> Result<CommandReport> {
    let server = id_segment(server)?;
    let paths = resolve_paths()?;
    let store = SnapshotStore::open(&paths, platform, server);
    let mut report = CommandReport::new("members-trend");

    let points = store.trend()?;
    if points.is_empty() {
        report.issue(format!("no member snapshots for server {server}"));
    }
    for point in &points {
        report.detail(format!("{} {}", point.captured_at.to_rfc3339(), point.member_count));
    }
    let churned = store.read_churn()?;
    report.detail(format!("churned_total={}", churned.len()));
    report.with_data(&serde_json::json!({ "trend": points, "churned": churned }))?;
    Ok(report)
}
