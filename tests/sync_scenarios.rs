mod common;

use commsync::commands::sync::{self as sync_command, SyncCommandOptions};
use commsync::error::{PlatformError, SyncError, exit_code_for};
use commsync::sync::cursor::CursorStore;
use commsync::sync::engine::{CancelFlag, SyncOptions, SyncStage};
use commsync::sync::members::SnapshotStore;
use commsync::sync::model::{ConversationRef, MessageId, Platform};
use common::{ScriptedClient, days_ago, engine, fast_config, member, reacted, record};
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

fn general() -> ConversationRef {
    ConversationRef::channel(Platform::Discord, Some("1"), "10", "general")
}

fn full() -> SyncOptions {
    SyncOptions {
        full: true,
        ..SyncOptions::default()
    }
}

fn seeded() -> std::sync::Arc<ScriptedClient> {
    let client = ScriptedClient::new(Platform::Discord);
    client.add_conversation("1", general());
    client.put_messages(
        "10",
        vec![
            record(101, 0, "hello"),
            record(102, 1, "second"),
            record(103, 2, "third"),
        ],
    );
    client
}

#[tokio::test]
async fn first_sync_groups_messages_under_one_day_and_stores_cursor() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");

    let report = engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect("sync");
    assert_eq!(report.appended, 3);
    assert_eq!(report.total, 3);
    assert_eq!(report.cursor_before, None);
    assert_eq!(report.cursor_after, Some(MessageId(103)));

    let key = general().key().expect("key");
    let archive = fs::read_to_string(engine.paths().archive_file(Platform::Discord, &key))
        .expect("archive");
    assert_eq!(archive.matches("\n## 2026-01-05\n").count(), 1);
    assert!(archive.starts_with("# #general\n"));
    let hello = archive.find("[#101]").expect("101");
    let third = archive.find("[#103]").expect("103");
    assert!(hello < third);

    let cursor = CursorStore::open(engine.paths(), Platform::Discord, &key)
        .get()
        .expect("read cursor")
        .expect("cursor");
    assert_eq!(cursor.last_message_id, Some(MessageId(103)));
    assert_eq!(cursor.message_count, 3);
}

#[tokio::test]
async fn resync_appends_new_message_and_refreshes_reactions_only() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");
    engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect("first sync");

    client.put_messages(
        "10",
        vec![
            reacted(record(102, 1, "second, edited later"), "👍", 2),
            record(104, 3, "fourth"),
        ],
    );
    let report = engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect("second sync");
    assert_eq!(report.appended, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.total, 4);
    assert_eq!(report.cursor_after, Some(MessageId(104)));

    let key = general().key().expect("key");
    let archive = fs::read_to_string(engine.paths().archive_file(Platform::Discord, &key))
        .expect("archive");
    assert!(archive.contains("[#102]\nsecond\nReactions: 👍 2\n"));
    assert!(!archive.contains("edited later"));
    assert_eq!(archive.matches("### ").count(), 4);
}

#[tokio::test]
async fn incremental_resync_without_news_leaves_archive_untouched() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");
    engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect("first sync");

    let key = general().key().expect("key");
    let archive_file = engine.paths().archive_file(Platform::Discord, &key);
    let before = fs::read(&archive_file).expect("archive");

    for _ in 0..2 {
        let report = engine
            .sync_conversation(&session, general(), &SyncOptions::default())
            .await
            .expect("resync");
        assert_eq!(report.appended, 0);
        assert_eq!(report.cursor_before, Some(MessageId(103)));
        assert_eq!(report.cursor_after, Some(MessageId(103)));
    }
    let report = engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect("full resync");
    assert_eq!(report.appended + report.updated, 0);
    assert_eq!(fs::read(&archive_file).expect("archive"), before);
}

#[tokio::test]
async fn incremental_sync_only_takes_messages_after_cursor() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");
    engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect("first sync");

    client.put_messages("10", vec![record(104, 3, "fourth"), record(105, 4, "fifth")]);
    let report = engine
        .sync_conversation(&session, general(), &SyncOptions::default())
        .await
        .expect("incremental");
    assert_eq!(report.appended, 2);
    assert_eq!(report.total, 5);
    assert_eq!(report.cursor_after, Some(MessageId(105)));
}

#[tokio::test]
async fn short_full_resync_never_moves_cursor_back() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");
    engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect("first sync");

    let capped = SyncOptions {
        full: true,
        limit: Some(1),
        ..SyncOptions::default()
    };
    let report = engine
        .sync_conversation(&session, general(), &capped)
        .await
        .expect("capped");
    assert_eq!(report.appended, 0);
    assert_eq!(report.cursor_after, Some(MessageId(103)));
}

#[tokio::test(start_paused = true)]
async fn provider_wait_hint_delays_the_retry() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    client.fail_next(
        "10",
        vec![PlatformError::RateLimited {
            retry_after: Duration::from_secs(2),
            global: false,
        }],
    );
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");

    let report = engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect("sync after wait");
    assert_eq!(report.appended, 3);

    let calls = client.calls_for("10");
    assert_eq!(calls.len(), 2);
    assert!(calls[1] - calls[0] >= Duration::from_secs(2));
}

#[tokio::test]
async fn one_failing_conversation_does_not_stop_the_others() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let missing = ConversationRef::channel(Platform::Discord, Some("1"), "20", "gone");
    let throttled = ConversationRef::channel(Platform::Discord, Some("1"), "30", "busy");
    client.fail_next("20", vec![PlatformError::NotFound("channel 20".into())]);
    let limited = || PlatformError::RateLimited {
        retry_after: Duration::from_millis(5),
        global: false,
    };
    client.fail_next("30", vec![limited(), limited(), limited()]);

    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");
    let run = engine
        .sync_all(&session, vec![throttled, general(), missing], &full())
        .await;

    assert_eq!(run.completed.len(), 1);
    assert_eq!(run.completed[0].conversation_key.as_str(), "c_1_10");
    assert_eq!(run.failed.len(), 2);
    assert_eq!(run.failed[0].conversation, "c_1_20");
    assert_eq!(run.failed[0].stage, SyncStage::Fetch);
    assert!(matches!(run.failed[0].source, SyncError::NotFound(_)));
    assert!(matches!(
        run.failed[1].source,
        SyncError::RateLimited { attempts: 3, .. }
    ));
    assert_eq!(run.exit_code(), 2);

    let manifest = run.manifest.expect("manifest written");
    let raw = fs::read_to_string(manifest).expect("manifest");
    assert!(raw.contains("c_1_10"));
}

#[tokio::test]
async fn revoked_credential_is_reported_as_auth_stage() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    client.fail_next("10", vec![PlatformError::Auth("token revoked".into())]);
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");

    let failure = engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect_err("auth failure");
    assert_eq!(failure.stage, SyncStage::Auth);
    assert_eq!(failure.source.exit_code(), 1);
    assert_eq!(client.calls_for("10").len(), 1);
}

#[tokio::test]
async fn interrupted_commit_leftovers_are_discarded() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");
    engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect("first sync");

    let key = general().key().expect("key");
    let dir = engine.paths().conversation_dir(Platform::Discord, &key);
    let torn = dir.join(".messages.md.a1b2c3.tmp");
    fs::write(&torn, "half a page").expect("torn file");

    client.put_messages("10", vec![record(104, 3, "fourth")]);
    let report = engine
        .sync_conversation(&session, general(), &SyncOptions::default())
        .await
        .expect("sync");
    assert_eq!(report.discarded_artifacts, 1);
    assert!(!torn.exists());
    assert_eq!(report.appended, 1);
    assert_eq!(report.total, 4);
}

#[tokio::test]
async fn unreadable_cursor_is_rebuilt_from_archive() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");
    engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect("first sync");

    let key = general().key().expect("key");
    fs::write(
        engine.paths().cursor_file(Platform::Discord, &key),
        "{\"schema_version\": ",
    )
    .expect("corrupt cursor");
    client.put_messages("10", vec![record(104, 3, "fourth")]);

    let report = engine
        .sync_conversation(&session, general(), &SyncOptions::default())
        .await
        .expect("sync");
    assert!(report.rederived_cursor);
    assert_eq!(report.cursor_before, Some(MessageId(103)));
    assert_eq!(report.appended, 1);
    assert_eq!(report.total, 4);

    let cursor = CursorStore::open(engine.paths(), Platform::Discord, &key)
        .get()
        .expect("cursor readable again")
        .expect("cursor");
    assert_eq!(cursor.last_message_id, Some(MessageId(104)));
}

#[tokio::test]
async fn held_lock_fails_the_conversation_without_touching_it() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");

    let key = general().key().expect("key");
    let store = CursorStore::open(engine.paths(), Platform::Discord, &key);
    let _held = store.lock().expect("lock");

    let failure = engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect_err("locked");
    assert_eq!(failure.stage, SyncStage::Merge);
    assert!(matches!(failure.source, SyncError::Locked(_)));
    assert!(client.calls_for("10").is_empty());
    assert!(!store.archive_path().exists());
}

#[tokio::test]
async fn first_direct_message_sync_takes_only_most_recent() {
    let tmp = tempdir().expect("tempdir");
    let client = ScriptedClient::new(Platform::Discord);
    let dm = ConversationRef::direct(Platform::Discord, "55", "bob");
    client.put_messages(
        "55",
        (1..=5).map(|i| record(i, i as u32, "dm")).collect(),
    );
    let mut config = fast_config();
    config.sync.dm_limit = 2;
    let engine = engine(&client, tmp.path(), config);
    let session = engine.authenticate().await.expect("auth");

    let report = engine
        .sync_conversation(&session, dm.clone(), &full())
        .await
        .expect("dm sync");
    assert_eq!(report.total, 2);
    assert_eq!(report.cursor_after, Some(MessageId(5)));

    let key = dm.key().expect("key");
    let archive = fs::read_to_string(engine.paths().archive_file(Platform::Discord, &key))
        .expect("archive");
    assert!(archive.starts_with("# DM: bob\n"));
    assert!(!archive.contains("[#3]"));
    assert!(archive.contains("[#4]"));

    client.put_messages("55", vec![record(6, 10, "later")]);
    let report = engine
        .sync_conversation(&session, dm, &SyncOptions::default())
        .await
        .expect("dm resync");
    assert_eq!(report.appended, 1);
    assert_eq!(report.total, 3);
}

#[tokio::test]
async fn threads_sync_into_their_own_archive() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let thread = ConversationRef::topic(Platform::Discord, Some("1"), "10", "99", "q&a");
    client.put_messages("99", vec![record(201, 5, "in the thread")]);
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");

    let run = engine
        .sync_all(&session, vec![general(), thread.clone()], &full())
        .await;
    assert!(run.failed.is_empty());
    let keys: Vec<&str> = run
        .completed
        .iter()
        .map(|c| c.conversation_key.as_str())
        .collect();
    assert_eq!(keys, vec!["c_1_10", "t_10_99"]);

    let key = thread.key().expect("key");
    let archive = fs::read_to_string(engine.paths().archive_file(Platform::Discord, &key))
        .expect("thread archive");
    assert!(archive.contains("in the thread"));
    assert!(!archive.contains("hello"));
}

#[tokio::test]
async fn telegram_group_pages_forward_from_cursor() {
    let tmp = tempdir().expect("tempdir");
    let client = ScriptedClient::new(Platform::Telegram);
    let group = ConversationRef::channel(Platform::Telegram, Some("-100"), "-100", "Builders");
    client.put_messages("-100", (1..=5).map(|i| record(i, i as u32, "tg")).collect());
    let mut config = fast_config();
    config.sync.page_size = 2;
    let engine = engine(&client, tmp.path(), config);
    let session = engine.authenticate().await.expect("auth");

    let report = engine
        .sync_conversation(&session, group.clone(), &full())
        .await
        .expect("sync");
    assert_eq!(report.total, 5);
    assert_eq!(report.pages, 3);
    assert_eq!(report.cursor_after, Some(MessageId(5)));

    client.put_messages("-100", vec![record(6, 30, "tg")]);
    let report = engine
        .sync_conversation(&session, group, &SyncOptions::default())
        .await
        .expect("resync");
    assert_eq!(report.appended, 1);
    assert_eq!(report.cursor_after, Some(MessageId(6)));
}

#[tokio::test]
async fn cancellation_keeps_committed_pages_and_resume_finishes() {
    let tmp = tempdir().expect("tempdir");
    let client = ScriptedClient::new(Platform::Discord);
    client.put_messages("10", (101..=105).map(|i| record(i, (i - 100) as u32, "m")).collect());
    let mut config = fast_config();
    config.sync.page_size = 2;

    let flag = CancelFlag::default();
    client.cancel_after(1, flag.clone());
    let cancelled = engine(&client, tmp.path(), config.clone()).with_cancel(flag);
    let session = cancelled.authenticate().await.expect("auth");
    let report = cancelled
        .sync_conversation(&session, general(), &full())
        .await
        .expect("cancelled sync");
    assert!(report.cancelled);
    assert_eq!(report.pages, 1);
    assert_eq!(report.appended, 2);

    let key = general().key().expect("key");
    let store = CursorStore::open(cancelled.paths(), Platform::Discord, &key);
    let cursor = store.get().expect("cursor").expect("committed");
    assert_eq!(cursor.last_message_id, Some(MessageId(102)));

    let resumed = engine(&client, tmp.path(), config);
    let report = resumed
        .sync_conversation(&session, general(), &SyncOptions::default())
        .await
        .expect("resume");
    assert!(!report.cancelled);
    assert_eq!(report.appended, 3);
    assert_eq!(report.total, 5);
}

#[tokio::test]
async fn member_captures_record_joins_departures_and_churn() {
    let tmp = tempdir().expect("tempdir");
    let client = ScriptedClient::new(Platform::Discord);
    client.set_members("1", vec![member("1"), member("2"), member("3")]);
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");

    let first = engine.sync_members(&session, "1").await.expect("first capture");
    assert_eq!(first.member_count, 3);
    assert!(first.diff.is_none());

    client.set_members("1", vec![member("2"), member("3"), member("4")]);
    let second = engine.sync_members(&session, "1").await.expect("second capture");
    let diff = second.diff.expect("diff");
    let joined: Vec<&str> = diff.joined.iter().map(|m| m.member_id.as_str()).collect();
    let left: Vec<&str> = diff.left.iter().map(|m| m.member_id.as_str()).collect();
    assert_eq!(joined, vec!["4"]);
    assert_eq!(left, vec!["1"]);
    assert_eq!(diff.unchanged.len(), 2);
    assert_eq!(second.churn_recorded, 1);
    assert!(second.captured_at > first.captured_at);

    let store = SnapshotStore::open(engine.paths(), Platform::Discord, "1");
    assert_eq!(store.list().expect("snapshots").len(), 2);
    let churn = store.read_churn().expect("churn");
    assert_eq!(churn.len(), 1);
    assert_eq!(churn[0].member_id, "1");
}

#[tokio::test]
async fn send_is_not_retried_on_ambiguous_failure() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");

    let id = engine
        .send(&session, &general(), "hello there", Some(MessageId(101)))
        .await
        .expect("send");
    assert_eq!(id, MessageId(9_001));
    assert_eq!(client.sent().len(), 1);

    client.fail_next("10", vec![PlatformError::Transient("reset by peer".into())]);
    let err = engine
        .send(&session, &general(), "again", None)
        .await
        .expect_err("ambiguous");
    assert!(matches!(err, SyncError::Protocol(_)));
    assert_eq!(client.sent().len(), 1);

    let err = engine
        .send(&session, &general(), "   ", None)
        .await
        .expect_err("empty");
    assert!(matches!(err, SyncError::InvalidInput(_)));
}

#[tokio::test]
async fn hand_edited_block_survives_an_incremental_rewrite() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");
    engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect("first sync");

    let key = general().key().expect("key");
    let archive_file = engine.paths().archive_file(Platform::Discord, &key);
    let mut archive = fs::read_to_string(&archive_file).expect("archive");
    archive.push_str("### 10:30 - @bob edited by hand [#150]\nIMPORTANT HAND NOTE\n\n");
    fs::write(&archive_file, archive).expect("hand edit");

    client.put_messages("10", vec![record(104, 3, "fourth")]);
    let report = engine
        .sync_conversation(&session, general(), &SyncOptions::default())
        .await
        .expect("resync");
    assert_eq!(report.appended, 1);
    assert_eq!(report.total, 4);

    let archive = fs::read_to_string(&archive_file).expect("archive");
    let note = archive.find("IMPORTANT HAND NOTE").expect("hand note kept");
    let third = archive.find("[#103]").expect("103");
    let fourth = archive.find("[#104]").expect("104");
    assert!(third < note && note < fourth);
    assert_eq!(archive.matches("IMPORTANT HAND NOTE").count(), 1);
}

#[tokio::test]
async fn invalid_utf8_block_does_not_wedge_the_conversation() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");
    engine
        .sync_conversation(&session, general(), &full())
        .await
        .expect("first sync");

    let key = general().key().expect("key");
    let archive_file = engine.paths().archive_file(Platform::Discord, &key);
    let mut raw = fs::read(&archive_file).expect("archive");
    raw.extend_from_slice(b"### 10:31:00 - @bob (12) [#160]\nbad \xff byte\n\n");
    fs::write(&archive_file, raw).expect("corrupt");

    client.put_messages("10", vec![record(104, 3, "fourth")]);
    let report = engine
        .sync_conversation(&session, general(), &SyncOptions::default())
        .await
        .expect("resync despite the bad byte");
    assert_eq!(report.appended, 1);

    let archive = fs::read_to_string(&archive_file).expect("archive is utf-8 again");
    assert!(archive.contains("bad \u{FFFD} byte"));
    assert!(archive.contains("[#104]"));
    assert!(archive.contains("[#101]"));
}

#[tokio::test]
async fn unknown_topic_is_reported_as_not_found() {
    let tmp = tempdir().expect("tempdir");
    let client = seeded();
    let thread = ConversationRef::topic(Platform::Discord, Some("1"), "10", "99", "q&a");
    client.add_conversation("1", thread);
    client.put_messages("99", vec![record(201, 5, "in the thread")]);
    let engine = engine(&client, tmp.path(), fast_config());

    let opts = SyncCommandOptions {
        server: Some("1".to_string()),
        topics: vec!["404".to_string()],
        ..SyncCommandOptions::default()
    };
    let err = sync_command::run(&engine, &opts).await.expect_err("unknown topic");
    assert_eq!(exit_code_for(&err), 2);
    assert!(err.to_string().contains("topic 404"));
    assert!(!tmp.path().join("data").join("discord").exists());

    let opts = SyncCommandOptions {
        topics: vec!["99".to_string()],
        ..opts
    };
    let report = sync_command::run(&engine, &opts).await.expect("known topic");
    assert!(report.ok);
    assert!(report.details.iter().any(|d| d.contains("conversations=1")));
    assert!(report.details.iter().any(|d| d.starts_with("t_10_99")));
}

#[tokio::test]
async fn wider_window_backfills_history_below_the_archive() {
    let tmp = tempdir().expect("tempdir");
    let client = ScriptedClient::new(Platform::Telegram);
    let group = ConversationRef::channel(Platform::Telegram, Some("-100"), "-100", "Builders");
    client.put_messages(
        "-100",
        vec![
            days_ago(1, 80, "oldest"),
            days_ago(2, 60, "older"),
            days_ago(3, 40, "old"),
            days_ago(4, 20, "recent"),
            days_ago(5, 10, "newer"),
            days_ago(6, 5, "newest"),
        ],
    );
    let mut config = fast_config();
    config.sync.page_size = 2;
    let engine = engine(&client, tmp.path(), config);
    let session = engine.authenticate().await.expect("auth");

    let report = engine
        .sync_conversation(&session, group.clone(), &SyncOptions::default())
        .await
        .expect("first sync");
    assert_eq!(report.total, 3);

    client.put_messages("-100", vec![days_ago(7, 1, "today")]);
    let wider = SyncOptions {
        days: Some(90),
        ..SyncOptions::default()
    };
    let report = engine
        .sync_conversation(&session, group.clone(), &wider)
        .await
        .expect("backfill");
    assert_eq!(report.appended, 4);
    assert_eq!(report.total, 7);
    assert_eq!(report.cursor_after, Some(MessageId(7)));

    let key = group.key().expect("key");
    let archive = fs::read_to_string(engine.paths().archive_file(Platform::Telegram, &key))
        .expect("archive");
    let first = archive.find("[#1]").expect("1");
    let fourth = archive.find("[#4]").expect("4");
    let seventh = archive.find("[#7]").expect("7");
    assert!(first < fourth && fourth < seventh);
    let cursor = CursorStore::open(engine.paths(), Platform::Telegram, &key)
        .get()
        .expect("read cursor")
        .expect("cursor");
    assert_eq!(cursor.oldest_message_id, Some(MessageId(1)));
    assert_eq!(cursor.message_count, 7);

    let report = engine
        .sync_conversation(&session, group, &wider)
        .await
        .expect("repeat");
    assert_eq!(report.appended, 0);
    assert_eq!(report.total, 7);
}

#[tokio::test]
async fn rate_limited_member_page_is_retried_alone() {
    let tmp = tempdir().expect("tempdir");
    let client = ScriptedClient::new(Platform::Discord);
    let mut moderator = member("1");
    moderator.roles = vec!["r1".to_string(), "r9".to_string()];
    client.set_members(
        "1",
        vec![moderator, member("2"), member("3"), member("4"), member("5")],
    );
    client.set_roles("1", &[("r1", "Moderator")]);
    client.fail_member_page(
        Some("2"),
        vec![PlatformError::RateLimited {
            retry_after: Duration::from_millis(5),
            global: false,
        }],
    );
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");

    let report = engine.sync_members(&session, "1").await.expect("capture");
    assert_eq!(report.member_count, 5);
    assert_eq!(
        client.member_calls(),
        vec![None, Some("2".to_string()), Some("2".to_string()), Some("4".to_string())]
    );

    let store = SnapshotStore::open(engine.paths(), Platform::Discord, "1");
    let latest = store.list().expect("snapshots");
    assert_eq!(latest.len(), 1);
    let snapshot = store.load(&latest[0]).expect("snapshot");
    assert_eq!(snapshot.members[0].roles, vec!["Moderator".to_string(), "r9".to_string()]);
}

#[tokio::test]
async fn exhausted_member_page_writes_no_snapshot() {
    let tmp = tempdir().expect("tempdir");
    let client = ScriptedClient::new(Platform::Discord);
    client.set_members("1", vec![member("1"), member("2"), member("3")]);
    client.fail_member_page(
        Some("2"),
        (0..3).map(|_| PlatformError::Transient("reset".into())).collect(),
    );
    let engine = engine(&client, tmp.path(), fast_config());
    let session = engine.authenticate().await.expect("auth");

    let err = engine.sync_members(&session, "1").await.expect_err("exhausted");
    assert_eq!(commsync::error::exit_code_for(&err), 1);
    assert_eq!(client.member_calls().len(), 4);
    let store = SnapshotStore::open(engine.paths(), Platform::Discord, "1");
    assert!(store.list().expect("snapshots").is_empty());
}
