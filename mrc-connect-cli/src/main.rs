use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use mrc_connect::{
    AutoConnect, CallOutcome, ConnectOptions, DaemonLauncher, DaemonProcessManager, ParamFileSet, Paths, Reporter, RpcConsumer, RpcSession, TomlSettings,
    TransportOptions,
};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "mrc-connect", about = "Bootstrap moonroomcashd and call it over JSON-RPC")]
pub struct Cli {
    /// Never start the embedded moonroomcashd.
    #[arg(long, default_value_t = false)]
    pub no_embedded: bool,
    #[arg(long)]
    pub conf: Option<PathBuf>,
    #[arg(long)]
    pub params_dir: Option<PathBuf>,
    /// Directory holding the moonroomcashd binary.
    #[arg(long)]
    pub daemon_dir: Option<PathBuf>,
    /// TOML file with a `[connection]` table for manual host/port/credentials.
    #[arg(long)]
    pub settings: Option<PathBuf>,
    #[arg(long)]
    pub params_url: Option<String>,
    #[arg(long)]
    pub max_warmup_polls: Option<u32>,
    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value = "getinfo")]
    pub method: String,
    /// JSON array of call parameters.
    #[arg(long, default_value = "[]")]
    pub params: String,
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn merge_into_paths(&self, mut paths: Paths) -> Paths {
        if let Some(v) = &self.conf {
            paths = paths.with_conf_file(v);
        }
        if let Some(v) = &self.params_dir {
            paths = paths.with_params_dir(v);
        }
        if let Some(v) = &self.daemon_dir {
            paths = paths.with_daemon_dir(v);
        }
        paths
    }

    pub fn connect_options(&self) -> ConnectOptions {
        let params = match &self.params_url {
            Some(base) => ParamFileSet::sprout(base),
            None => ParamFileSet::default(),
        };
        ConnectOptions {
            embedded: !self.no_embedded,
            params,
            max_warmup_polls: self.max_warmup_polls,
            transport: TransportOptions {
                request_timeout: Some(Duration::from_secs(self.request_timeout_secs)),
                ..TransportOptions::default()
            },
        }
    }

    fn settings_path(&self) -> Option<PathBuf> {
        self.settings.clone().or_else(|| dirs::config_dir().map(|dir| dir.join("moonroomcash").join("settings.toml")))
    }
}

/// Writes bootstrap status to stderr so stdout carries only the call result.
struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn progress(&self, primary: &str, detail: &str) {
        if detail.is_empty() {
            eprintln!("{primary}");
        } else {
            eprintln!("{primary} {detail}");
        }
    }

    fn fatal(&self, message: &str) {
        eprintln!("\n{message}\n");
    }
}

struct LoggingConsumer;

impl RpcConsumer for LoggingConsumer {
    fn set_session(&self, session: Option<RpcSession>) {
        match session {
            Some(session) => info!("Connected to {}", session.endpoint().url()),
            None => info!("No daemon connection"),
        }
    }

    fn set_daemon_process(&self, daemon: Option<Arc<dyn DaemonLauncher>>) {
        if daemon.is_some() {
            info!("Using the embedded moonroomcashd");
        }
    }
}

async fn call(session: &RpcSession, method: &str, params: Value) -> ExitCode {
    match session.request(method, params).await {
        CallOutcome::Success(result) => {
            match serde_json::to_string_pretty(&result) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{result}"),
            }
            ExitCode::SUCCESS
        }
        CallOutcome::Failure(failure) => {
            eprintln!("{method} failed: {}", failure.error_message().unwrap_or(failure.message.as_str()));
            ExitCode::FAILURE
        }
        CallOutcome::Discarded => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level.as_str())).init();

    let params: Value = match serde_json::from_str(&cli.params) {
        Ok(Value::Array(items)) => Value::Array(items),
        Ok(other) => Value::Array(vec![other]),
        Err(e) => {
            eprintln!("--params is not valid JSON: {e}");
            return ExitCode::FAILURE;
        }
    };

    let paths = match Paths::platform_default() {
        Ok(paths) => cli.merge_into_paths(paths),
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let settings = match cli.settings_path().map(|path| TomlSettings::load(&path)).transpose() {
        Ok(settings) => settings.unwrap_or_default(),
        Err(e) => {
            warn!("Ignoring connection settings: {e}");
            TomlSettings::default()
        }
    };

    let launcher = Arc::new(DaemonProcessManager::new(paths.daemon_dir()));
    let controller = match AutoConnect::builder(paths)
        .options(cli.connect_options())
        .settings(Arc::new(settings))
        .launcher(launcher.clone())
        .reporter(Arc::new(ConsoleReporter))
        .consumer(Arc::new(LoggingConsumer))
        .build()
    {
        Ok(controller) => controller,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = tokio::select! {
        outcome = controller.run() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, exiting...");
            launcher.kill();
            return ExitCode::from(130);
        }
    };

    match outcome.into_result() {
        Ok(session) => call(&session, &cli.method, params).await,
        Err(_) => ExitCode::FAILURE,
    }
}
