use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::future::Future;

use commsync::commands::doctor;
use commsync::commands::engagement::{self, EngagementOptions};
use commsync::commands::manifest::{self, ManifestOptions};
use commsync::commands::members;
use commsync::commands::profile::{self, ProfileAction, ProfileOptions};
use commsync::commands::read::{self, ReadOptions};
use commsync::commands::reset::{self, ResetOptions};
use commsync::commands::send::{self, SendOptions};
use commsync::commands::sync::{self, SyncCommandOptions};
use commsync::commands::{CommandReport, open_engine};
use commsync::sync::engine::{CancelFlag, SyncEngine, SyncOptions};
use commsync::sync::model::{MessageId, Platform};
use commsync::sync::profile::ObservationSource;
use commsync::sync::query::ArchiveQuery;
use chrono::NaiveDate;

use crate::logging;

#[derive(Debug, Parser)]
#[command(
    name = "commsync",
    version,
    about = "Incremental Discord/Telegram sync into an append-only Markdown archive"
)]
struct Cli {
    /// Print the command report as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch new messages and append them to the archive.
    Sync(SyncArgs),
    /// Member snapshots, diffs and trends.
    Members {
        #[command(subcommand)]
        action: MembersCommand,
    },
    /// Rebuild manifest.json from the archive tree.
    Manifest {
        #[arg(long)]
        print: bool,
    },
    /// Tier members by archived activity.
    Engagement {
        #[command(flatten)]
        target: ServerArgs,
        #[arg(long)]
        days: Option<u32>,
    },
    /// Long-lived member notes.
    Profile {
        #[command(subcommand)]
        action: ProfileCommand,
    },
    /// Print archived messages of one conversation.
    Read(ReadArgs),
    /// Post a message.
    Send(SendArgs),
    /// Forget a conversation's cursor; the archive is kept.
    Reset {
        #[arg(long)]
        platform: Platform,
        #[arg(long)]
        key: String,
    },
    /// Check paths, configuration and credentials.
    Doctor,
}

#[derive(Debug, Args)]
struct ServerArgs {
    #[arg(long, default_value = "discord")]
    platform: Platform,
    #[arg(long, visible_alias = "group")]
    server: String,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, default_value = "discord")]
    platform: Platform,
    #[arg(long, visible_alias = "group")]
    server: Option<String>,
    #[arg(long = "channel")]
    channels: Vec<String>,
    #[arg(long = "topic")]
    topics: Vec<String>,
    #[arg(long = "dm")]
    dms: Vec<String>,
    #[arg(long)]
    days: Option<u32>,
    #[arg(long)]
    full: bool,
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum MembersCommand {
    /// Capture a snapshot and diff it against the previous one.
    Sync(ServerArgs),
    /// Diff the two latest snapshots.
    Diff(ServerArgs),
    /// Member counts over every retained snapshot.
    Trend(ServerArgs),
}

#[derive(Debug, Args)]
struct MemberArgs {
    #[arg(long, default_value = "discord")]
    platform: Platform,
    #[arg(long)]
    member: String,
}

#[derive(Debug, Subcommand)]
enum ProfileCommand {
    Show(MemberArgs),
    List {
        #[arg(long, default_value = "discord")]
        platform: Platform,
    },
    Observe {
        #[command(flatten)]
        target: MemberArgs,
        #[arg(long, default_value = "manual")]
        source: ObservationSource,
        text: String,
    },
    Keywords {
        #[command(flatten)]
        target: MemberArgs,
        #[arg(required = true)]
        keywords: Vec<String>,
    },
    Notes {
        #[command(flatten)]
        target: MemberArgs,
        text: String,
    },
}

#[derive(Debug, Args)]
struct ReadArgs {
    #[arg(long, default_value = "discord")]
    platform: Platform,
    /// Conversation key, e.g. `c_{server}_{channel}`.
    #[arg(long)]
    key: String,
    /// Only the newest N matches.
    #[arg(long)]
    last: Option<usize>,
    #[arg(long)]
    search: Option<String>,
    /// First day to include (YYYY-MM-DD).
    #[arg(long = "from")]
    from: Option<NaiveDate>,
    /// Last day to include (YYYY-MM-DD).
    #[arg(long = "to")]
    to: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct SendArgs {
    #[arg(long, default_value = "discord")]
    platform: Platform,
    #[arg(long, visible_alias = "group")]
    server: Option<String>,
    #[arg(long)]
    channel: String,
    #[arg(long)]
    topic: Option<String>,
    #[arg(long)]
    reply_to: Option<MessageId>,
    #[arg(long)]
    message: String,
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

/// Run an engine-backed command. Ctrl-C trips the cancel flag; in-flight
/// pages finish and commit before the run stops.
fn with_engine<F, Fut>(platform: Platform, command: F) -> Result<CommandReport>
where
    F: FnOnce(SyncEngine) -> Fut,
    Fut: Future<Output = Result<CommandReport>>,
{
    let cancel = CancelFlag::default();
    let engine = open_engine(platform, cancel.clone())?;
    let rt = runtime()?;
    rt.block_on(async move {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; stopping after in-flight pages");
                cancel.cancel();
            }
        });
        command(engine).await
    })
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let status = if report.ok { "ok" } else { "issues" };
    println!("{}: {status}", report.command);
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("  ! {issue}");
    }
    if let Some(text) = &report.text {
        print!("\n{text}");
    }
    Ok(())
}

fn dispatch(command: Command) -> Result<CommandReport> {
    match command {
        Command::Sync(args) => {
            let opts = SyncCommandOptions {
                server: args.server,
                channels: args.channels,
                topics: args.topics,
                dms: args.dms,
                sync: SyncOptions {
                    full: args.full,
                    days: args.days,
                    limit: args.limit,
                },
            };
            with_engine(args.platform, |engine| async move {
                sync::run(&engine, &opts).await
            })
        }
        Command::Members { action } => match action {
            MembersCommand::Sync(target) => with_engine(target.platform, |engine| async move {
                members::sync(&engine, &target.server).await
            }),
            MembersCommand::Diff(target) => members::diff(target.platform, &target.server),
            MembersCommand::Trend(target) => members::trend(target.platform, &target.server),
        },
        Command::Manifest { print } => manifest::run(&ManifestOptions { print }),
        Command::Engagement { target, days } => engagement::run(&EngagementOptions {
            platform: target.platform,
            server: target.server,
            days,
        }),
        Command::Profile { action } => {
            let (target, action) = match action {
                ProfileCommand::List { platform } => return profile::list(platform),
                ProfileCommand::Show(target) => (target, ProfileAction::Show),
                ProfileCommand::Observe {
                    target,
                    source,
                    text,
                } => (target, ProfileAction::Observe { source, text }),
                ProfileCommand::Keywords { target, keywords } => {
                    (target, ProfileAction::Keywords(keywords))
                }
                ProfileCommand::Notes { target, text } => (target, ProfileAction::Notes(text)),
            };
            profile::run(&ProfileOptions {
                platform: target.platform,
                member: target.member,
                action,
            })
        }
        Command::Read(args) => read::run(&ReadOptions {
            platform: args.platform,
            key: args.key,
            query: ArchiveQuery {
                search: args.search,
                from: args.from,
                to: args.to,
                last: args.last,
            },
        }),
        Command::Send(args) => {
            let opts = SendOptions {
                server: args.server,
                channel: args.channel,
                topic: args.topic,
                reply_to: args.reply_to,
                message: args.message,
            };
            with_engine(args.platform, |engine| async move {
                send::run(&engine, &opts).await
            })
        }
        Command::Reset { platform, key } => reset::run(&ResetOptions { platform, key }),
        Command::Doctor => doctor::run(),
    }
}

/// Parse arguments, run the command and print its report. Returns the
/// process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let report = dispatch(cli.command)?;
    print_report(&report, cli.json)?;
    Ok(report.exit_code)
}
