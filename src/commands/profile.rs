use anyhow::Result;

use crate::commands::CommandReport;
use crate::sync::model::Platform;
use crate::sync::paths::resolve_paths;
use crate::sync::profile::{MemberProfile, ObservationSource, ProfileStore};

#[derive(Debug, Clone)]
pub enum ProfileAction {
    Show,
    Observe {
        source: ObservationSource,
        text: String,
    },
    Keywords(Vec<String>),
    Notes(String),
}

#[derive(Debug, Clone)]
pub struct ProfileOptions {
    pub platform: Platform,
    pub member: String,
    pub action: ProfileAction,
}

fn describe(report: &mut CommandReport, profile: &MemberProfile) {
    report.detail(format!(
        "member={} name={} updated={}",
        profile.member_id,
        profile.display_name.as_deref().unwrap_or("-"),
        profile.updated_at.to_rfc3339()
    ));
    report.detail(format!("observations={}", profile.observations.len()));
    if !profile.keywords.is_empty() {
        report.detail(format!("keywords={}", profile.keywords.join(",")));
    }
    if let Some(notes) = &profile.notes {
        report.detail(format!("notes={notes}"));
    }
}

pub fn run(opts: &ProfileOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let store = ProfileStore::open(&paths, opts.platform);
    let mut report = CommandReport::new("profile");

    let member = opts.member.as_str();
    let profile = match &opts.action {
        ProfileAction::Show => match store.get(member)? {
            Some(profile) => profile,
            None => {
                report.issue(format!("no profile for member {member}"));
                report.exit_code = 2;
                return Ok(report);
            }
        },
        ProfileAction::Observe { source, text } => store.add_observation(member, *source, text)?,
        ProfileAction::Keywords(keywords) => store.set_keywords(member, keywords)?,
        ProfileAction::Notes(notes) => store.set_notes(member, notes)?,
    };
    describe(&mut report, &profile);
    report.with_data(&profile)?;
    Ok(report)
}

pub fn list(platform: Platform) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let store = ProfileStore::open(&paths, platform);
    let mut report = CommandReport::new("profile-list");

    let ids = store.list()?;
    report.detail(format!("profiles={}", ids.len()));
    for id in &ids {
        report.detail(id.clone());
    }
    report.with_data(&ids)?;
    Ok(report)
}
