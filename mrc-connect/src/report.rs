//! Collaborators the bootstrap reports to: the status dialog, the RPC
//! consumer that takes over the session, and the clock used for backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info};

use crate::daemon::DaemonLauncher;
use crate::rpc::RpcSession;

/// Status sink. `progress` renders transient state, `fatal` is the single
/// blocking alert that ends an attempt chain.
pub trait Reporter: Send + Sync {
    fn progress(&self, primary: &str, detail: &str);
    fn fatal(&self, message: &str);
    /// Hide the bootstrap dialog, if one is shown.
    fn dismiss(&self) {}
}

/// Receives the outcome of a connection attempt.
pub trait RpcConsumer: Send + Sync {
    fn set_session(&self, session: Option<RpcSession>);
    fn set_daemon_process(&self, daemon: Option<Arc<dyn DaemonLauncher>>);
}

/// Timer source for retry delays, injected so tests never wait.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Reporter that only writes to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn progress(&self, primary: &str, detail: &str) {
        if detail.is_empty() {
            info!("{primary}");
        } else {
            info!("{primary} ({detail})");
        }
    }

    fn fatal(&self, message: &str) {
        error!("{message}");
    }
}
