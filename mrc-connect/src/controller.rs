//! The autoconnect state machine: ensure parameter files, find or create a
//! daemon config, probe the daemon, start the embedded one when it refuses,
//! poll through its warmup and hand the live session to the consumer.
//!
//! Every transition goes through [`AutoConnect::step`], which dispatches on the
//! current [`ConnectState`]. Delays go through the injected [`Clock`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use log::{debug, info, warn};
use serde_json::json;

use crate::config::{ConfigLocator, ConfigOrigin, DaemonConfig};
use crate::daemon::{DaemonLauncher, DaemonProcessManager, StartOutcome};
use crate::download::DownloadPipeline;
use crate::error::{ConnectError, Unreachable};
use crate::params::{ParamFile, ParamFileSet};
use crate::paths::Paths;
use crate::report::{Clock, LogReporter, Reporter, RpcConsumer, TokioClock};
use crate::rpc::{CallOutcome, FailureKind, HttpTransport, RpcFailure, RpcSession, RpcTransport, TransportOptions, LIVENESS_METHOD};
use crate::settings::SettingsStore;

/// Delay between polls while the daemon reports it is still loading.
pub const WARMUP_POLL_DELAY: Duration = Duration::from_millis(1000);
/// Delay after the embedded daemon was (or already was) started.
pub const STARTED_DELAY: Duration = Duration::from_millis(1000);
/// Delay when a `daemon=1` daemon could not be started by us.
pub const BACKGROUND_DAEMON_DELAY: Duration = Duration::from_millis(5000);
/// Last-chance delay when starting the daemon failed.
pub const FAILED_START_DELAY: Duration = Duration::from_millis(2000);

const STARTING_STATUS: &str = "Starting embedded moonroomcashd";
const BACKGROUND_STATUS: &str = "moonroomcashd is set to run as daemon";
const WAITING_STATUS: &str = "Waiting for moonroomcashd";
const WARMUP_STATUS: &str = "Your moonroomcashd is starting up. Please wait.";

/// Knobs for one autoconnect run.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// May this process start `moonroomcashd` itself.
    pub embedded: bool,
    pub params: ParamFileSet,
    /// Cap on repeated polls of one attempt: warmup replies end in
    /// [`ConnectError::DaemonInitializing`], refusals from a started daemon that
    /// is still alive end in [`ConnectError::DaemonUnstartable`]. `None` polls
    /// for as long as the daemon keeps loading.
    pub max_warmup_polls: Option<u32>,
    pub transport: TransportOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { embedded: true, params: ParamFileSet::default(), max_warmup_polls: None, transport: TransportOptions::default() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectState {
    CheckingParams,
    DownloadingParams,
    LocatingConfig,
    ProbingConnection,
    StartingDaemon,
    WaitingForDaemon,
    ManualFallback,
    Connected,
    Fatal,
}

impl ConnectState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectState::Connected | ConnectState::Fatal)
    }
}

/// How a run ended. A connected session has already been handed to the consumer.
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected(RpcSession),
    Failed(ConnectError),
}

impl ConnectOutcome {
    pub fn into_result(self) -> Result<RpcSession, ConnectError> {
        match self {
            ConnectOutcome::Connected(session) => Ok(session),
            ConnectOutcome::Failed(err) => Err(err),
        }
    }
}

/// The config under probe and its session. A run builds exactly one; its
/// session is shut down when the run fails.
struct ConnectAttempt {
    session: RpcSession,
    may_start_daemon: bool,
    daemon_start_attempted: bool,
    warmup_polls: u32,
}

impl ConnectAttempt {
    fn config(&self) -> &DaemonConfig {
        self.session.config()
    }
}

/// Why a liveness probe failed, from the controller's point of view.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ProbeFailure {
    Refused,
    AuthRejected,
    Initializing(String),
    Malformed(String),
    Unclassified(String),
}

impl ProbeFailure {
    fn classify(failure: &RpcFailure) -> Self {
        match failure.kind {
            FailureKind::ConnectionRefused => ProbeFailure::Refused,
            FailureKind::AuthenticationRequired => ProbeFailure::AuthRejected,
            FailureKind::InternalServerError => match failure.error_message() {
                Some(message) => ProbeFailure::Initializing(message.to_string()),
                None => ProbeFailure::Unclassified(failure.message.clone()),
            },
            FailureKind::MalformedResponse => ProbeFailure::Malformed(failure.message.clone()),
            FailureKind::Other => {
                ProbeFailure::Unclassified(failure.error_message().map(str::to_string).unwrap_or_else(|| failure.message.clone()))
            }
        }
    }
}

/// `message` with its trailing dots replaced by `dots` of our own.
fn animate_ellipsis(message: &str, dots: usize) -> String {
    format!("{}{}", message.trim_end_matches('.'), ".".repeat(dots % 4))
}

pub struct AutoConnectBuilder {
    paths: Paths,
    options: ConnectOptions,
    settings: Option<Arc<dyn SettingsStore>>,
    transport: Option<Arc<dyn RpcTransport>>,
    launcher: Option<Arc<dyn DaemonLauncher>>,
    clock: Option<Arc<dyn Clock>>,
    reporter: Option<Arc<dyn Reporter>>,
    consumer: Option<Arc<dyn RpcConsumer>>,
}

impl AutoConnectBuilder {
    pub fn options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn RpcTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn DaemonLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn consumer(mut self, consumer: Arc<dyn RpcConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Fill unset collaborators with the real ones: HTTP transport, a process
    /// manager over the daemon directory, tokio timers and log output.
    pub fn build(self) -> Result<AutoConnect, ConnectError> {
        let transport: Arc<dyn RpcTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.options.transport)?),
        };
        let launcher =
            self.launcher.unwrap_or_else(|| Arc::new(DaemonProcessManager::new(self.paths.daemon_dir())) as Arc<dyn DaemonLauncher>);
        let reporter = self.reporter.unwrap_or_else(|| Arc::new(LogReporter) as Arc<dyn Reporter>);
        let downloader = DownloadPipeline::new(Arc::clone(&reporter))?;

        Ok(AutoConnect {
            locator: ConfigLocator::new(self.paths.conf_file()),
            paths: self.paths,
            options: self.options,
            settings: self.settings.unwrap_or_else(|| Arc::new(HashMap::<String, String>::new()) as Arc<dyn SettingsStore>),
            transport,
            launcher,
            clock: self.clock.unwrap_or_else(|| Arc::new(TokioClock) as Arc<dyn Clock>),
            reporter,
            consumer: self.consumer,
            downloader,
            state: ConnectState::CheckingParams,
            attempt: None,
            pending_download: Vec::new(),
            downloaded: false,
            synthesized: false,
            pending_delay: WARMUP_POLL_DELAY,
        })
    }
}

/// Drives one bootstrap from parameter check to a connected session or a
/// single fatal report. Consumed by [`AutoConnect::run`].
pub struct AutoConnect {
    paths: Paths,
    options: ConnectOptions,
    locator: ConfigLocator,
    settings: Arc<dyn SettingsStore>,
    transport: Arc<dyn RpcTransport>,
    launcher: Arc<dyn DaemonLauncher>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn Reporter>,
    consumer: Option<Arc<dyn RpcConsumer>>,
    downloader: DownloadPipeline,
    state: ConnectState,
    attempt: Option<ConnectAttempt>,
    pending_download: Vec<ParamFile>,
    downloaded: bool,
    synthesized: bool,
    pending_delay: Duration,
}

impl AutoConnect {
    pub fn builder(paths: Paths) -> AutoConnectBuilder {
        AutoConnectBuilder {
            paths,
            options: ConnectOptions::default(),
            settings: None,
            transport: None,
            launcher: None,
            clock: None,
            reporter: None,
            consumer: None,
        }
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Run until connected or failed. The outcome has already been delivered
    /// to the consumer and reporter when this returns.
    pub async fn run(mut self) -> ConnectOutcome {
        loop {
            match self.step().await {
                Ok(ConnectState::Connected) => match self.finish_connected() {
                    Ok(session) => return ConnectOutcome::Connected(session),
                    Err(err) => return ConnectOutcome::Failed(self.finish_fatal(err)),
                },
                Ok(_) => {}
                Err(err) => return ConnectOutcome::Failed(self.finish_fatal(err)),
            }
        }
    }

    /// Perform the work of the current state and move to the next one.
    async fn step(&mut self) -> Result<ConnectState, ConnectError> {
        debug!("autoconnect: {:?}", self.state);
        let next = match self.state {
            ConnectState::CheckingParams => self.check_params(),
            ConnectState::DownloadingParams => self.download_params().await,
            ConnectState::LocatingConfig => self.locate_config(),
            ConnectState::ProbingConnection => self.probe().await,
            ConnectState::StartingDaemon => self.start_daemon(),
            ConnectState::WaitingForDaemon => self.wait().await,
            ConnectState::ManualFallback => self.manual_fallback(),
            ConnectState::Connected | ConnectState::Fatal => Ok(self.state),
        }?;
        self.state = next;
        Ok(next)
    }

    fn check_params(&mut self) -> Result<ConnectState, ConnectError> {
        let missing = self.options.params.missing(self.paths.params_dir());
        if missing.is_empty() {
            return Ok(ConnectState::LocatingConfig);
        }

        let names = missing.iter().map(ParamFile::name).join(", ");
        if self.downloaded {
            warn!("still missing after download: {names}");
            return Err(ConnectError::ParamsMissing { missing: missing.iter().map(|f| f.name().to_string()).collect() });
        }

        info!("Missing params {names} in {}", self.paths.params_dir().display());
        self.pending_download = missing;
        Ok(ConnectState::DownloadingParams)
    }

    async fn download_params(&mut self) -> Result<ConnectState, ConnectError> {
        let urls = self.pending_download.drain(..).map(|f| f.url().to_string()).collect::<Vec<_>>();
        let summary = self
            .downloader
            .run(&urls, self.paths.params_dir(), || info!("Parameter files are in place, resuming autoconnect"))
            .await
            .map_err(|e| {
                let reason = std::error::Error::source(&e).map_or_else(|| e.to_string(), ToString::to_string);
                ConnectError::DownloadFailed { file: e.file().to_string(), reason }
            })?;
        debug!("downloaded {:?}, skipped {:?}", summary.fetched, summary.skipped);

        self.downloaded = true;
        Ok(ConnectState::CheckingParams)
    }

    fn locate_config(&mut self) -> Result<ConnectState, ConnectError> {
        match self.locator.locate() {
            Some(config) => {
                let config = if self.synthesized { config.generated().unwrap_or(config) } else { config };
                let may_start = self.options.embedded;
                self.begin_attempt(config, may_start)?;
                Ok(ConnectState::ProbingConnection)
            }
            None if !self.options.embedded => {
                info!("No moonroomcash.conf and the embedded daemon is disabled, using connection settings");
                Ok(ConnectState::ManualFallback)
            }
            None if self.synthesized => Err(ConnectError::ConfigUnwritable { path: self.locator.conf_path().to_path_buf() }),
            None => {
                self.locator.synthesize();
                self.synthesized = true;
                Ok(ConnectState::LocatingConfig)
            }
        }
    }

    fn manual_fallback(&mut self) -> Result<ConnectState, ConnectError> {
        let config = ConfigLocator::load_from_settings(self.settings.as_ref()).ok_or(ConnectError::ConfigNotFound)?;
        self.begin_attempt(config, false)?;
        Ok(ConnectState::ProbingConnection)
    }

    fn begin_attempt(&mut self, config: DaemonConfig, may_start_daemon: bool) -> Result<(), ConnectError> {
        info!("Attempting autoconnect to {}:{} ({:?})", config.host(), config.port(), config.origin());
        let session = RpcSession::new(config, Arc::clone(&self.transport))?;
        self.attempt = Some(ConnectAttempt { session, may_start_daemon, daemon_start_attempted: false, warmup_polls: 0 });
        Ok(())
    }

    fn attempt_mut(&mut self) -> Result<&mut ConnectAttempt, ConnectError> {
        self.attempt.as_mut().ok_or_else(|| ConnectError::Unclassified("no connection attempt in progress".to_string()))
    }

    async fn probe(&mut self) -> Result<ConnectState, ConnectError> {
        let session = self.attempt_mut()?.session.clone();

        let failure = match session.request(LIVENESS_METHOD, json!([])).await {
            CallOutcome::Success(_) => {
                info!("Connection to {} is online", session.endpoint().url());
                return Ok(ConnectState::Connected);
            }
            CallOutcome::Failure(failure) => ProbeFailure::classify(&failure),
            CallOutcome::Discarded => {
                return Err(ConnectError::Unclassified("connection attempt was shut down".to_string()));
            }
        };
        debug!("probe failed: {failure:?}");

        match failure {
            ProbeFailure::Refused => self.on_refused(),
            ProbeFailure::AuthRejected => Err(ConnectError::AuthRejected),
            ProbeFailure::Initializing(message) => self.on_initializing(message),
            ProbeFailure::Malformed(message) => Err(ConnectError::MalformedResponse(message)),
            ProbeFailure::Unclassified(message) => Err(ConnectError::Unclassified(message)),
        }
    }

    fn on_refused(&mut self) -> Result<ConnectState, ConnectError> {
        let max_polls = self.options.max_warmup_polls;
        let attempt = self.attempt_mut()?;
        let (may_start, start_attempted) = (attempt.may_start_daemon, attempt.daemon_start_attempted);
        let (origin, background) = (attempt.config().origin(), attempt.config().is_daemon_background());
        let polls_left = !max_polls.is_some_and(|max| attempt.warmup_polls >= max);

        if !may_start {
            let reason =
                if origin == ConfigOrigin::UserSettings { Unreachable::ManualSettings } else { Unreachable::EmbeddedDisabled };
            return Err(ConnectError::DaemonUnreachable(reason));
        }

        if !start_attempted {
            return Ok(ConnectState::StartingDaemon);
        }

        if self.launcher.is_running() && polls_left {
            self.attempt_mut()?.warmup_polls += 1;
            self.reporter.progress(STARTING_STATUS, WAITING_STATUS);
            self.pending_delay = STARTED_DELAY;
            return Ok(ConnectState::WaitingForDaemon);
        }

        Err(ConnectError::DaemonUnstartable { background, diagnostics: self.launcher.diagnostics() })
    }

    fn on_initializing(&mut self, message: String) -> Result<ConnectState, ConnectError> {
        let max_polls = self.options.max_warmup_polls;
        let attempt = self.attempt_mut()?;
        if max_polls.is_some_and(|max| attempt.warmup_polls >= max) {
            return Err(ConnectError::DaemonInitializing(message));
        }

        let dots = attempt.warmup_polls as usize;
        attempt.warmup_polls += 1;
        debug!("moonroomcashd is warming up: {message}");
        self.reporter.progress(WARMUP_STATUS, &animate_ellipsis(&message, dots));
        self.pending_delay = WARMUP_POLL_DELAY;
        Ok(ConnectState::WaitingForDaemon)
    }

    fn start_daemon(&mut self) -> Result<ConnectState, ConnectError> {
        let attempt = self.attempt_mut()?;
        attempt.daemon_start_attempted = true;
        let background = attempt.config().is_daemon_background();

        self.reporter.progress(STARTING_STATUS, "");
        self.pending_delay = match self.launcher.ensure_started() {
            StartOutcome::JustStarted | StartOutcome::AlreadyRunning => {
                info!("Embedded moonroomcashd started up, trying autoconnect in 1 sec");
                STARTED_DELAY
            }
            StartOutcome::FailedToStart if background => {
                info!("moonroomcashd is configured with daemon=1, waiting for it to come up");
                self.reporter.progress(BACKGROUND_STATUS, WAITING_STATUS);
                BACKGROUND_DAEMON_DELAY
            }
            StartOutcome::FailedToStart => {
                warn!("Unknown problem while trying to start moonroomcashd");
                FAILED_START_DELAY
            }
        };
        Ok(ConnectState::WaitingForDaemon)
    }

    async fn wait(&mut self) -> Result<ConnectState, ConnectError> {
        self.clock.sleep(self.pending_delay).await;
        Ok(ConnectState::ProbingConnection)
    }

    fn finish_connected(&mut self) -> Result<RpcSession, ConnectError> {
        let attempt = self.attempt_mut()?;
        let session = attempt.session.clone();
        self.reporter.dismiss();
        if let Some(consumer) = &self.consumer {
            let daemon = self.launcher.is_running().then(|| Arc::clone(&self.launcher));
            consumer.set_daemon_process(daemon);
            consumer.set_session(Some(session.clone()));
        }
        Ok(session)
    }

    fn finish_fatal(&mut self, err: ConnectError) -> ConnectError {
        warn!("autoconnect failed in {:?}: {err}", self.state);
        self.state = ConnectState::Fatal;
        if let Some(attempt) = self.attempt.take() {
            attempt.session.shutdown();
        }
        if let Some(consumer) = &self.consumer {
            consumer.set_daemon_process(None);
            consumer.set_session(None);
        }
        self.reporter.fatal(&err.to_string());
        self.reporter.dismiss();
        err
    }
}
