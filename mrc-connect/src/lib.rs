//! Bootstrap for a desktop Moonroomcash wallet: make sure the proving
//! parameters are on disk, find or write `moonroomcash.conf`, start the
//! embedded `moonroomcashd` when nothing answers, wait out its warmup and hand
//! an authenticated JSON-RPC session to the rest of the application.

pub mod config;
pub mod controller;
pub mod daemon;
pub mod download;
pub mod error;
pub mod params;
pub mod paths;
pub mod report;
pub mod rpc;
pub mod settings;

pub use config::{ConfigLocator, ConfigOrigin, DaemonConfig};
pub use controller::{AutoConnect, AutoConnectBuilder, ConnectOptions, ConnectOutcome, ConnectState};
pub use daemon::{DaemonLauncher, DaemonProcessManager, StartOutcome};
pub use download::{DownloadPipeline, DownloadSummary, DownloadTask, TaskState};
pub use error::{ConnectError, Unreachable};
pub use params::{ParamFile, ParamFileSet};
pub use paths::Paths;
pub use report::{Clock, LogReporter, Reporter, RpcConsumer, TokioClock};
pub use rpc::{CallOutcome, HttpTransport, RpcFailure, RpcSession, RpcTransport, TransportOptions};
pub use settings::{SettingsStore, TomlSettings};
