//! JSON-RPC 1.0 session over HTTP with basic auth. The session reports raw
//! transport failures; deciding what a failure means is left to the caller.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, warn};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;

use crate::config::DaemonConfig;
use crate::error::ConnectError;
use crate::report::Reporter;

/// The RPC used purely to test reachability and readiness.
pub const LIVENESS_METHOD: &str = "getinfo";

const CALL_ERROR_PREFIX: &str = "There was an error sending the transaction. The error was: \n\n";

/// HTTP client settings for talking to the daemon.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(5), request_timeout: Some(Duration::from_secs(30)) }
    }
}

/// Base URL plus the pre-built `Authorization` header, derived once per config.
#[derive(Clone)]
pub struct Endpoint {
    url: String,
    auth_header: String,
}

impl Endpoint {
    pub fn from_config(config: &DaemonConfig) -> Result<Self, ConnectError> {
        let host = config.host().trim();
        if host.is_empty() {
            return Err(ConnectError::InvalidEndpoint("host is empty".to_string()));
        }
        let port: u16 = config
            .port()
            .trim()
            .parse()
            .map_err(|_| ConnectError::InvalidEndpoint(format!("port '{}' is not a number", config.port())))?;
        let url = if host.contains(':') { format!("http://[{host}]:{port}/") } else { format!("http://{host}:{port}/") };
        let credentials = format!("{}:{}", config.rpc_user(), config.rpc_password());
        let auth_header = format!("Basic {}", STANDARD.encode(credentials));
        Ok(Self { url, auth_header })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn auth_header(&self) -> &str {
        &self.auth_header
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("url", &self.url).finish_non_exhaustive()
    }
}

/// Transport-level failure codes, the only input to error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    ConnectionRefused,
    AuthenticationRequired,
    InternalServerError,
    MalformedResponse,
    Other,
}

#[derive(Clone, Debug)]
pub struct TransportFailure {
    pub kind: FailureKind,
    pub message: String,
    pub body: Vec<u8>,
}

impl TransportFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), body: Vec::new() }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Posts a serialized request to the daemon and returns the raw response body.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn post(&self, endpoint: &Endpoint, body: String) -> Result<Vec<u8>, TransportFailure>;
}

/// reqwest-backed transport.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(options: &TransportOptions) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder().connect_timeout(options.connect_timeout);
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self { client: builder.build()? })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn post(&self, endpoint: &Endpoint, body: String) -> Result<Vec<u8>, TransportFailure> {
        let response = self
            .client
            .post(endpoint.url())
            .header(AUTHORIZATION, endpoint.auth_header())
            .header(CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_connect() && !e.is_timeout() { FailureKind::ConnectionRefused } else { FailureKind::Other };
                TransportFailure::new(kind, e.to_string())
            })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| TransportFailure::new(FailureKind::Other, e.to_string()))?;
        if status.is_success() {
            return Ok(bytes.to_vec());
        }

        let kind = match status {
            StatusCode::UNAUTHORIZED => FailureKind::AuthenticationRequired,
            StatusCode::INTERNAL_SERVER_ERROR => FailureKind::InternalServerError,
            _ => FailureKind::Other,
        };
        Err(TransportFailure::new(kind, format!("HTTP status {status}")).with_body(bytes.to_vec()))
    }
}

/// A failed call as seen by the caller: the transport code plus the parsed
/// response body, `None` when the body was absent or not JSON.
#[derive(Clone, Debug)]
pub struct RpcFailure {
    pub kind: FailureKind,
    pub message: String,
    pub body: Option<Value>,
}

impl RpcFailure {
    /// `error.message` from the response body, when the daemon sent one.
    pub fn error_message(&self) -> Option<&str> {
        self.body.as_ref()?.get("error")?.get("message")?.as_str()
    }
}

#[derive(Clone, Debug)]
pub enum CallOutcome {
    Success(Value),
    Failure(RpcFailure),
    /// The session was shut down; the result must not be acted on.
    Discarded,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    params: &'a Value,
}

struct SessionInner {
    config: DaemonConfig,
    endpoint: Endpoint,
    transport: Arc<dyn RpcTransport>,
    shutting_down: AtomicBool,
    alert_shown: AtomicBool,
    next_id: AtomicU64,
}

/// A JSON-RPC session against one daemon config. Clones share the same
/// shutdown flag.
#[derive(Clone)]
pub struct RpcSession {
    inner: Arc<SessionInner>,
}

impl RpcSession {
    pub fn new(config: DaemonConfig, transport: Arc<dyn RpcTransport>) -> Result<Self, ConnectError> {
        let endpoint = Endpoint::from_config(&config)?;
        debug!("new rpc session for {}", endpoint.url());
        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                endpoint,
                transport,
                shutting_down: AtomicBool::new(false),
                alert_shown: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.inner.config
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Stop every in-flight and future call from reporting back. One-way.
    pub fn shutdown(&self) {
        if !self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("rpc session for {} shut down", self.inner.endpoint.url());
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn request(&self, method: &str, params: Value) -> CallOutcome {
        if self.is_shutting_down() {
            return CallOutcome::Discarded;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = JsonRpcRequest { jsonrpc: "1.0", id: id.to_string(), method, params: &params };
        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(e) => {
                return CallOutcome::Failure(RpcFailure {
                    kind: FailureKind::Other,
                    message: format!("could not serialize {method} request: {e}"),
                    body: None,
                })
            }
        };

        let reply = self.inner.transport.post(&self.inner.endpoint, body).await;
        if self.is_shutting_down() {
            debug!("dropping {method} response, session is shutting down");
            return CallOutcome::Discarded;
        }

        match reply {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(mut parsed) => CallOutcome::Success(parsed.get_mut("result").map(Value::take).unwrap_or(Value::Null)),
                Err(e) => {
                    warn!("{method} returned a body that is not JSON: {e}");
                    CallOutcome::Failure(RpcFailure {
                        kind: FailureKind::MalformedResponse,
                        message: format!("Unknown error: {e}"),
                        body: None,
                    })
                }
            },
            Err(failure) => CallOutcome::Failure(RpcFailure {
                kind: failure.kind,
                body: serde_json::from_slice::<Value>(&failure.body).ok(),
                message: failure.message,
            }),
        }
    }

    /// Callback form of [`RpcSession::request`]. Neither callback runs once
    /// the session has been shut down, even if the call was already in flight.
    pub async fn call<S, F>(&self, method: &str, params: Value, on_success: S, on_failure: F)
    where
        S: FnOnce(Value),
        F: FnOnce(RpcFailure),
    {
        match self.request(method, params).await {
            CallOutcome::Success(result) => on_success(result),
            CallOutcome::Failure(failure) => on_failure(failure),
            CallOutcome::Discarded => {}
        }
    }

    /// Like [`RpcSession::call`], but a failure is raised through `alerts`:
    /// the daemon's `error.message` when the reply carries one, otherwise the
    /// transport error. While one alert is up, further failures on this
    /// session are logged and dropped.
    pub async fn call_with_default_error_handling<S>(&self, method: &str, params: Value, on_success: S, alerts: &dyn Reporter)
    where
        S: FnOnce(Value),
    {
        match self.request(method, params).await {
            CallOutcome::Success(result) => on_success(result),
            CallOutcome::Failure(failure) => {
                let error = failure.error_message().unwrap_or(failure.message.as_str());
                self.alert_once(method, error, alerts);
            }
            CallOutcome::Discarded => {}
        }
    }

    /// Like [`RpcSession::call`] with failures only logged.
    pub async fn call_ignore_error<S>(&self, method: &str, params: Value, on_success: S)
    where
        S: FnOnce(Value),
    {
        match self.request(method, params).await {
            CallOutcome::Success(result) => on_success(result),
            CallOutcome::Failure(failure) => debug!("ignoring {method} failure: {}", failure.message),
            CallOutcome::Discarded => {}
        }
    }

    fn alert_once(&self, method: &str, error: &str, alerts: &dyn Reporter) {
        if error.is_empty() {
            return;
        }
        if self.inner.alert_shown.swap(true, Ordering::SeqCst) {
            debug!("{method} failed while an alert is up: {error}");
            return;
        }
        alerts.fatal(&format!("{CALL_ERROR_PREFIX}{error}"));
        self.inner.alert_shown.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSession")
            .field("endpoint", &self.inner.endpoint)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
