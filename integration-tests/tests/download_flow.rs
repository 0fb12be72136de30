use std::sync::Arc;

use integration_tests::support::{init_logging, reporter_snapshot, FakeDaemon, InstantClock, ParamHost, RecordingReporter, Workspace};
use mrc_connect::{AutoConnect, ConnectError, ConnectOptions, DownloadPipeline, ParamFile, ParamFileSet, TaskState};

const PROVING: &[u8] = b"proving key bytes";
const VERIFYING: &[u8] = b"verifying key bytes";
const EXTRA: &[u8] = b"extra";

#[tokio::test]
async fn only_missing_files_are_fetched_in_order() {
    init_logging();
    let host = ParamHost::spawn(&[("a.key", PROVING), ("b.key", VERIFYING), ("c.key", EXTRA)]).await;
    let workspace = Workspace::new();
    std::fs::write(workspace.params_dir().join("b.key"), b"already here").expect("seed b");
    let (reporter, reports) = RecordingReporter::new();
    let pipeline = DownloadPipeline::new(Arc::new(reporter)).expect("pipeline");
    let urls = ["a.key", "b.key", "c.key"].map(|name| host.url(name));
    let mut finished = 0;

    let summary = pipeline.run(&urls, &workspace.params_dir(), || finished += 1).await.expect("downloads");

    assert_eq!(host.hits(), vec!["a.key".to_string(), "c.key".to_string()]);
    assert_eq!(summary.fetched, vec!["a.key".to_string(), "c.key".to_string()]);
    assert_eq!(summary.skipped, vec!["b.key".to_string()]);
    let states = summary.tasks.iter().map(|task| (task.final_name(), task.state())).collect::<Vec<_>>();
    assert_eq!(states, vec![("a.key", TaskState::Done), ("b.key", TaskState::Done), ("c.key", TaskState::Done)]);
    assert_eq!(finished, 1);
    assert_eq!(workspace.read(&workspace.params_dir().join("a.key")), PROVING);
    assert_eq!(workspace.read(&workspace.params_dir().join("b.key")), b"already here");
    assert!(!workspace.params_dir().join("c.key.part").exists());

    let reports = reporter_snapshot(&reports);
    assert!(reports.progress.iter().any(|(primary, _)| primary == "Downloading a.key ( +1 more remaining )"));
    assert_eq!(reports.progress.last().map(|(primary, _)| primary.as_str()), Some("All Downloads Finished Successfully!"));
}

#[tokio::test]
async fn failed_item_stops_the_queue() {
    init_logging();
    let host = ParamHost::spawn(&[("a.key", PROVING), ("c.key", EXTRA)]).await;
    let workspace = Workspace::new();
    let (reporter, reports) = RecordingReporter::new();
    let pipeline = DownloadPipeline::new(Arc::new(reporter)).expect("pipeline");
    let urls = ["a.key", "b.key", "c.key"].map(|name| host.url(name));
    let mut finished = 0;

    let err = pipeline.run(&urls, &workspace.params_dir(), || finished += 1).await.expect_err("b.key is missing upstream");

    assert_eq!(err.file(), "b.key");
    assert_eq!(host.hits(), vec!["a.key".to_string(), "b.key".to_string()]);
    assert_eq!(finished, 0);
    assert!(workspace.params_dir().join("a.key").exists());
    assert!(!workspace.params_dir().join("b.key").exists());
    assert!(!workspace.params_dir().join("b.key.part").exists());
    assert!(!workspace.params_dir().join("c.key").exists());
    assert!(reporter_snapshot(&reports).progress.iter().all(|(primary, _)| primary != "All Downloads Finished Successfully!"));
}

#[tokio::test]
async fn redirects_are_followed() {
    init_logging();
    let host = ParamHost::spawn(&[("a.key", PROVING)]).await;
    let workspace = Workspace::new();
    let pipeline = DownloadPipeline::new(Arc::new(RecordingReporter::default())).expect("pipeline");

    pipeline.run(&[host.moved_url("a.key")], &workspace.params_dir(), || {}).await.expect("downloads");

    assert_eq!(workspace.read(&workspace.params_dir().join("a.key")), PROVING);
}

#[tokio::test]
async fn missing_params_dir_is_created() {
    init_logging();
    let host = ParamHost::spawn(&[("a.key", PROVING)]).await;
    let workspace = Workspace::new();
    let nested = workspace.params_dir().join("nested").join("deeper");
    let pipeline = DownloadPipeline::new(Arc::new(RecordingReporter::default())).expect("pipeline");

    pipeline.run(&[host.url("a.key")], &nested, || {}).await.expect("downloads");

    assert!(nested.join("a.key").is_file());
}

#[tokio::test]
async fn autoconnect_downloads_params_before_connecting() {
    init_logging();
    let host = ParamHost::spawn(&[("sprout-proving.key", PROVING), ("sprout-verifying.key", VERIFYING)]).await;
    let daemon = FakeDaemon::spawn("alice", "s3cret", 0).await;
    let workspace = Workspace::new();
    workspace.write_conf(&daemon.conf_text("alice", "s3cret"));
    let options = ConnectOptions { params: ParamFileSet::sprout(&host.base_url()), ..ConnectOptions::default() };

    AutoConnect::builder(workspace.paths())
        .options(options)
        .clock(Arc::new(InstantClock::default()))
        .build()
        .expect("controller")
        .run()
        .await
        .into_result()
        .expect("connected");

    assert_eq!(host.hits(), vec!["sprout-proving.key".to_string(), "sprout-verifying.key".to_string()]);
    assert_eq!(workspace.read(&workspace.params_dir().join("sprout-verifying.key")), VERIFYING);
    assert_eq!(daemon.snapshot().methods, vec!["getinfo".to_string()]);
}

#[tokio::test]
async fn autoconnect_stops_when_a_download_fails() {
    init_logging();
    let host = ParamHost::spawn(&[("sprout-proving.key", PROVING)]).await;
    let daemon = FakeDaemon::spawn("alice", "s3cret", 0).await;
    let workspace = Workspace::new();
    workspace.write_conf(&daemon.conf_text("alice", "s3cret"));
    let params = ParamFileSet::new(vec![
        ParamFile::new("sprout-proving.key", host.url("sprout-proving.key")),
        ParamFile::new("sprout-verifying.key", host.url("sprout-verifying.key")),
    ]);
    let (reporter, reports) = RecordingReporter::new();

    let err = AutoConnect::builder(workspace.paths())
        .options(ConnectOptions { params, ..ConnectOptions::default() })
        .clock(Arc::new(InstantClock::default()))
        .reporter(Arc::new(reporter))
        .build()
        .expect("controller")
        .run()
        .await
        .into_result()
        .expect_err("download must fail");

    assert!(matches!(err, ConnectError::DownloadFailed { ref file, .. } if file == "sprout-verifying.key"));
    assert!(daemon.snapshot().methods.is_empty());
    assert_eq!(reporter_snapshot(&reports).fatal.len(), 1);
}
