use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use mrc_connect::rpc::{Endpoint, TransportFailure};
use mrc_connect::{Clock, DaemonLauncher, Paths, Reporter, RpcConsumer, RpcSession, RpcTransport};
use serde_json::{json, Value};
use tokio::net::TcpListener;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    addr
}

/// A loopback port with nothing listening on it.
pub async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    listener.local_addr().expect("local addr").port()
}

#[derive(Clone, Debug, Default)]
pub struct DaemonState {
    pub expected_auth: String,
    pub warmup_remaining: u32,
    pub warmup_message: String,
    pub methods: Vec<String>,
    pub rejected: u32,
}

/// An RPC server that answers like a daemon: Basic auth, a number of
/// `-28` warmup replies, then real results.
pub struct FakeDaemon {
    pub addr: SocketAddr,
    state: Arc<Mutex<DaemonState>>,
}

impl FakeDaemon {
    pub async fn spawn(user: &str, password: &str, warmup_polls: u32) -> Self {
        let state = Arc::new(Mutex::new(DaemonState {
            expected_auth: format!("Basic {}", STANDARD.encode(format!("{user}:{password}"))),
            warmup_remaining: warmup_polls,
            warmup_message: "Loading block index...".to_string(),
            ..DaemonState::default()
        }));
        let router = Router::new().route("/", post(rpc)).with_state(Arc::clone(&state));
        let addr = serve(router).await;
        Self { addr, state }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn snapshot(&self) -> DaemonState {
        self.state.lock().expect("daemon state poisoned").clone()
    }

    /// Config text pointing at this daemon.
    pub fn conf_text(&self, user: &str, password: &str) -> String {
        format!("server=1\nrpcuser={user}\nrpcpassword={password}\nrpcport={}\n", self.port())
    }
}

async fn rpc(State(state): State<Arc<Mutex<DaemonState>>>, headers: HeaderMap, body: String) -> Response {
    let mut guard = state.lock().expect("daemon state poisoned");
    let authorized = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) == Some(guard.expected_auth.as_str());
    if !authorized {
        guard.rejected += 1;
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let request: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or_default().to_string();
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    guard.methods.push(method.clone());

    if guard.warmup_remaining > 0 {
        guard.warmup_remaining -= 1;
        let reply = json!({"result": null, "error": {"code": -28, "message": guard.warmup_message}, "id": id});
        return (StatusCode::INTERNAL_SERVER_ERROR, reply.to_string()).into_response();
    }

    let result = match method.as_str() {
        "getinfo" => json!({"version": 2010050, "blocks": 42, "connections": 8}),
        "getblockcount" => json!(42),
        _ => {
            let reply = json!({"result": null, "error": {"code": -32601, "message": "Method not found"}, "id": id});
            return (StatusCode::NOT_FOUND, reply.to_string()).into_response();
        }
    };
    (StatusCode::OK, json!({"result": result, "error": null, "id": id}).to_string()).into_response()
}

#[derive(Clone, Debug, Default)]
pub struct HostState {
    pub files: HashMap<String, Vec<u8>>,
    pub hits: Vec<String>,
}

/// Static file host for parameter downloads. `/files/{name}` serves, and
/// `/moved/{name}` redirects there.
pub struct ParamHost {
    pub addr: SocketAddr,
    state: Arc<Mutex<HostState>>,
}

impl ParamHost {
    pub async fn spawn(files: &[(&str, &[u8])]) -> Self {
        let files = files.iter().map(|(name, bytes)| (name.to_string(), bytes.to_vec())).collect();
        let state = Arc::new(Mutex::new(HostState { files, hits: Vec::new() }));
        let router = Router::new()
            .route("/files/{name}", get(serve_file))
            .route("/moved/{name}", get(|UrlPath(name): UrlPath<String>| async move { Redirect::temporary(&format!("/files/{name}")) }))
            .with_state(Arc::clone(&state));
        let addr = serve(router).await;
        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/files/", self.addr)
    }

    pub fn url(&self, name: &str) -> String {
        format!("http://{}/files/{name}", self.addr)
    }

    pub fn moved_url(&self, name: &str) -> String {
        format!("http://{}/moved/{name}", self.addr)
    }

    pub fn hits(&self) -> Vec<String> {
        self.state.lock().expect("host state poisoned").hits.clone()
    }
}

async fn serve_file(State(state): State<Arc<Mutex<HostState>>>, UrlPath(name): UrlPath<String>) -> Response {
    let mut guard = state.lock().expect("host state poisoned");
    guard.hits.push(name.clone());
    match guard.files.get(&name) {
        Some(bytes) => (StatusCode::OK, Bytes::from(bytes.clone())).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReporterState {
    pub progress: Vec<(String, String)>,
    pub fatal: Vec<String>,
    pub dismissed: u32,
}

#[derive(Clone, Default)]
pub struct RecordingReporter {
    state: Arc<Mutex<ReporterState>>,
}

impl RecordingReporter {
    pub fn new() -> (Self, Arc<Mutex<ReporterState>>) {
        let state = Arc::new(Mutex::new(ReporterState::default()));
        (Self { state: Arc::clone(&state) }, state)
    }
}

impl Reporter for RecordingReporter {
    fn progress(&self, primary: &str, detail: &str) {
        let mut guard = self.state.lock().expect("reporter state poisoned");
        guard.progress.push((primary.to_string(), detail.to_string()));
    }

    fn fatal(&self, message: &str) {
        let mut guard = self.state.lock().expect("reporter state poisoned");
        guard.fatal.push(message.to_string());
    }

    fn dismiss(&self) {
        self.state.lock().expect("reporter state poisoned").dismissed += 1;
    }
}

pub fn reporter_snapshot(state: &Arc<Mutex<ReporterState>>) -> ReporterState {
    state.lock().expect("reporter state poisoned").clone()
}

#[derive(Default)]
pub struct ConsumerState {
    pub sessions: Vec<Option<RpcSession>>,
    pub daemon_handed_over: Vec<bool>,
}

#[derive(Clone, Default)]
pub struct RecordingConsumer {
    state: Arc<Mutex<ConsumerState>>,
}

impl RecordingConsumer {
    pub fn new() -> (Self, Arc<Mutex<ConsumerState>>) {
        let state = Arc::new(Mutex::new(ConsumerState::default()));
        (Self { state: Arc::clone(&state) }, state)
    }
}

impl RpcConsumer for RecordingConsumer {
    fn set_session(&self, session: Option<RpcSession>) {
        self.state.lock().expect("consumer state poisoned").sessions.push(session);
    }

    fn set_daemon_process(&self, daemon: Option<Arc<dyn DaemonLauncher>>) {
        self.state.lock().expect("consumer state poisoned").daemon_handed_over.push(daemon.is_some());
    }
}

/// Records requested delays and returns at once.
#[derive(Clone, Default)]
pub struct InstantClock {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl InstantClock {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("clock state poisoned").clone()
    }
}

#[async_trait]
impl Clock for InstantClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("clock state poisoned").push(duration);
        tokio::task::yield_now().await;
    }
}

/// Answers every request as an online daemon without touching the network,
/// keeping the endpoint URL and auth header of each call.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    seen: Arc<Mutex<Vec<(String, String)>>>,
}

impl LoopbackTransport {
    pub fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().expect("transport state poisoned").clone()
    }
}

#[async_trait]
impl RpcTransport for LoopbackTransport {
    async fn post(&self, endpoint: &Endpoint, _body: String) -> Result<Vec<u8>, TransportFailure> {
        let mut guard = self.seen.lock().expect("transport state poisoned");
        guard.push((endpoint.url().to_string(), endpoint.auth_header().to_string()));
        Ok(json!({"result": {"version": 2010050}, "error": null, "id": "1"}).to_string().into_bytes())
    }
}

/// A data dir, params dir holding placeholder keys, and an empty daemon dir.
pub struct Workspace {
    pub root: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        for dir in ["data", "params", "bin"] {
            std::fs::create_dir_all(root.path().join(dir)).expect("workspace dir");
        }
        Self { root }
    }

    pub fn with_params(self) -> Self {
        for name in ["sprout-proving.key", "sprout-verifying.key"] {
            std::fs::write(self.params_dir().join(name), b"placeholder").expect("param file");
        }
        self
    }

    pub fn conf_file(&self) -> PathBuf {
        self.root.path().join("data").join("moonroomcash.conf")
    }

    pub fn params_dir(&self) -> PathBuf {
        self.root.path().join("params")
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.path().join("bin")
    }

    pub fn write_conf(&self, text: &str) {
        std::fs::write(self.conf_file(), text).expect("write conf");
    }

    pub fn paths(&self) -> Paths {
        Paths::new(self.conf_file(), self.params_dir(), self.daemon_dir())
    }

    pub fn read(&self, path: &Path) -> Vec<u8> {
        std::fs::read(path).expect("read file")
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}
