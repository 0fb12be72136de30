use std::sync::Arc;
use std::time::Duration;

use integration_tests::support::{
    init_logging,
    refused_port,
    reporter_snapshot,
    FakeDaemon,
    InstantClock,
    LoopbackTransport,
    RecordingConsumer,
    RecordingReporter,
    Workspace,
};
use mrc_connect::settings::TomlSettings;
use mrc_connect::{AutoConnect, CallOutcome, ConfigOrigin, ConnectError, ConnectOptions, Unreachable};
use serde_json::json;

fn embedded() -> ConnectOptions {
    ConnectOptions::default()
}

fn external_only() -> ConnectOptions {
    ConnectOptions { embedded: false, ..ConnectOptions::default() }
}

#[tokio::test]
async fn detected_conf_connects_and_serves_calls() {
    init_logging();
    let daemon = FakeDaemon::spawn("alice", "s3cret", 0).await;
    let workspace = Workspace::new().with_params();
    workspace.write_conf(&daemon.conf_text("alice", "s3cret"));
    let (reporter, reports) = RecordingReporter::new();
    let (consumer, consumed) = RecordingConsumer::new();

    let outcome = AutoConnect::builder(workspace.paths())
        .options(embedded())
        .clock(Arc::new(InstantClock::default()))
        .reporter(Arc::new(reporter))
        .consumer(Arc::new(consumer))
        .build()
        .expect("controller")
        .run()
        .await;
    let session = outcome.into_result().expect("connected");

    assert_eq!(session.config().origin(), ConfigOrigin::DetectedFile);
    match session.request("getblockcount", json!([])).await {
        CallOutcome::Success(result) => assert_eq!(result, json!(42)),
        other => panic!("unexpected outcome {other:?}"),
    }

    let state = daemon.snapshot();
    assert_eq!(state.methods, vec!["getinfo".to_string(), "getblockcount".to_string()]);
    assert_eq!(state.rejected, 0);

    let reports = reporter_snapshot(&reports);
    assert!(reports.fatal.is_empty());
    assert_eq!(reports.dismissed, 1);
    let consumed = consumed.lock().expect("consumer state poisoned");
    assert_eq!(consumed.sessions.len(), 1);
    assert!(consumed.sessions[0].is_some());
}

#[tokio::test]
async fn wrong_password_is_reported_once() {
    init_logging();
    let daemon = FakeDaemon::spawn("alice", "s3cret", 0).await;
    let workspace = Workspace::new().with_params();
    workspace.write_conf(&daemon.conf_text("alice", "wrong"));
    let (reporter, reports) = RecordingReporter::new();
    let (consumer, consumed) = RecordingConsumer::new();

    let err = AutoConnect::builder(workspace.paths())
        .clock(Arc::new(InstantClock::default()))
        .reporter(Arc::new(reporter))
        .consumer(Arc::new(consumer))
        .build()
        .expect("controller")
        .run()
        .await
        .into_result()
        .expect_err("must be rejected");

    assert!(matches!(err, ConnectError::AuthRejected));
    assert_eq!(daemon.snapshot().rejected, 1);
    let reports = reporter_snapshot(&reports);
    assert_eq!(reports.fatal.len(), 1);
    assert!(reports.fatal[0].contains("username / password"));
    let consumed = consumed.lock().expect("consumer state poisoned");
    assert!(consumed.sessions.iter().all(Option::is_none));
    assert_eq!(consumed.daemon_handed_over, vec![false]);
}

#[tokio::test]
async fn warming_daemon_is_polled_until_ready() {
    init_logging();
    let daemon = FakeDaemon::spawn("alice", "s3cret", 3).await;
    let workspace = Workspace::new().with_params();
    workspace.write_conf(&daemon.conf_text("alice", "s3cret"));
    let clock = InstantClock::default();
    let (reporter, reports) = RecordingReporter::new();

    AutoConnect::builder(workspace.paths())
        .clock(Arc::new(clock.clone()))
        .reporter(Arc::new(reporter))
        .build()
        .expect("controller")
        .run()
        .await
        .into_result()
        .expect("connected");

    assert_eq!(daemon.snapshot().methods.len(), 4);
    assert_eq!(clock.sleeps(), vec![Duration::from_millis(1000); 3]);
    let details = reporter_snapshot(&reports).progress.into_iter().map(|(_, detail)| detail).collect::<Vec<_>>();
    assert_eq!(details, vec!["Loading block index", "Loading block index.", "Loading block index.."]);
}

#[tokio::test]
async fn warmup_cap_gives_up_with_the_daemon_message() {
    init_logging();
    let daemon = FakeDaemon::spawn("alice", "s3cret", 10).await;
    let workspace = Workspace::new().with_params();
    workspace.write_conf(&daemon.conf_text("alice", "s3cret"));
    let options = ConnectOptions { max_warmup_polls: Some(2), ..embedded() };

    let err = AutoConnect::builder(workspace.paths())
        .options(options)
        .clock(Arc::new(InstantClock::default()))
        .build()
        .expect("controller")
        .run()
        .await
        .into_result()
        .expect_err("capped");

    assert!(matches!(err, ConnectError::DaemonInitializing(ref m) if m == "Loading block index..."));
    assert_eq!(daemon.snapshot().methods.len(), 3);
}

#[tokio::test]
async fn refused_with_embedded_disabled_does_not_retry() {
    init_logging();
    let port = refused_port().await;
    let workspace = Workspace::new().with_params();
    workspace.write_conf(&format!("rpcuser=alice\nrpcpassword=s3cret\nrpcport={port}\n"));
    let clock = InstantClock::default();

    let err = AutoConnect::builder(workspace.paths())
        .options(external_only())
        .clock(Arc::new(clock.clone()))
        .build()
        .expect("controller")
        .run()
        .await
        .into_result()
        .expect_err("unreachable");

    assert!(matches!(err, ConnectError::DaemonUnreachable(Unreachable::EmbeddedDisabled)));
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn missing_daemon_binary_ends_in_unstartable() {
    init_logging();
    let port = refused_port().await;
    let workspace = Workspace::new().with_params();
    workspace.write_conf(&format!("rpcuser=alice\nrpcpassword=s3cret\nrpcport={port}\n"));
    let clock = InstantClock::default();
    let (reporter, reports) = RecordingReporter::new();

    let err = AutoConnect::builder(workspace.paths())
        .clock(Arc::new(clock.clone()))
        .reporter(Arc::new(reporter))
        .build()
        .expect("controller")
        .run()
        .await
        .into_result()
        .expect_err("unstartable");

    assert!(matches!(err, ConnectError::DaemonUnstartable { background: false, .. }));
    assert_eq!(clock.sleeps(), vec![Duration::from_millis(2000)]);
    let reports = reporter_snapshot(&reports);
    assert_eq!(reports.progress[0].0, "Starting embedded moonroomcashd");
    assert!(reports.fatal[0].contains("Can't find moonroomcashd"));
}

#[tokio::test]
async fn manual_settings_are_used_without_a_conf_file() {
    init_logging();
    let daemon = FakeDaemon::spawn("bob", "hunter2", 0).await;
    let workspace = Workspace::new().with_params();
    let settings = TomlSettings::parse(&format!(
        "[connection]\nhost = \"127.0.0.1\"\nport = \"{}\"\nrpcuser = \"bob\"\nrpcpassword = \"hunter2\"\n",
        daemon.port()
    ))
    .expect("settings");

    let session = AutoConnect::builder(workspace.paths())
        .options(external_only())
        .settings(Arc::new(settings))
        .clock(Arc::new(InstantClock::default()))
        .build()
        .expect("controller")
        .run()
        .await
        .into_result()
        .expect("connected");

    assert_eq!(session.config().origin(), ConfigOrigin::UserSettings);
    assert!(!workspace.conf_file().exists());
}

#[tokio::test]
async fn generated_conf_is_written_before_probing() {
    init_logging();
    let workspace = Workspace::new().with_params();
    std::fs::remove_dir_all(workspace.root.path().join("data")).expect("remove data dir");
    let transport = LoopbackTransport::default();

    let session = AutoConnect::builder(workspace.paths())
        .options(embedded())
        .transport(Arc::new(transport.clone()))
        .clock(Arc::new(InstantClock::default()))
        .build()
        .expect("controller")
        .run()
        .await
        .into_result()
        .expect("connected");

    let conf = std::fs::read_to_string(workspace.conf_file()).expect("generated conf");
    assert!(conf.contains("server=1"));
    assert!(conf.contains("rpcuser=mrc-qt-wallet"));
    let password = conf.lines().find_map(|l| l.strip_prefix("rpcpassword=")).expect("password line");
    assert_eq!(password.len(), 10);

    assert_eq!(session.config().origin(), ConfigOrigin::Generated);
    assert_eq!(session.config().rpc_password(), password);
    let seen = transport.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, session.endpoint().auth_header());
}

#[tokio::test]
async fn shut_down_session_discards_results() {
    init_logging();
    let daemon = FakeDaemon::spawn("alice", "s3cret", 0).await;
    let workspace = Workspace::new().with_params();
    workspace.write_conf(&daemon.conf_text("alice", "s3cret"));

    let session = AutoConnect::builder(workspace.paths())
        .clock(Arc::new(InstantClock::default()))
        .build()
        .expect("controller")
        .run()
        .await
        .into_result()
        .expect("connected");

    session.shutdown();
    assert!(matches!(session.request("getinfo", json!([])).await, CallOutcome::Discarded));
    assert_eq!(daemon.snapshot().methods.len(), 1);
}
