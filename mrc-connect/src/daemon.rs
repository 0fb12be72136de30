//! Lifecycle of the embedded `moonroomcashd` child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

#[cfg(target_os = "linux")]
const DAEMON_CANDIDATES: &[&str] = &["mqw-moonroomcashd", "moonroomcashd"];
#[cfg(windows)]
const DAEMON_CANDIDATES: &[&str] = &["moonroomcashd.exe"];
#[cfg(not(any(target_os = "linux", windows)))]
const DAEMON_CANDIDATES: &[&str] = &["moonroomcashd"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning,
    JustStarted,
    FailedToStart,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Exited,
}

/// Starts the daemon on demand. Implementations must never spawn a second
/// instance while one they launched is alive.
pub trait DaemonLauncher: Send + Sync {
    fn ensure_started(&self) -> StartOutcome;
    fn is_running(&self) -> bool;
    /// Captured stderr, or the reason the last start failed.
    fn diagnostics(&self) -> Option<String>;
    fn kill(&self);
}

struct Launched {
    child: Child,
    program: PathBuf,
}

/// Owns at most one daemon child for the lifetime of the application.
pub struct DaemonProcessManager {
    search_dir: PathBuf,
    launched: Mutex<Option<Launched>>,
    stderr: Arc<Mutex<String>>,
    last_error: Mutex<Option<String>>,
}

impl DaemonProcessManager {
    pub fn new(search_dir: impl Into<PathBuf>) -> Self {
        Self {
            search_dir: search_dir.into(),
            launched: Mutex::new(None),
            stderr: Arc::new(Mutex::new(String::new())),
            last_error: Mutex::new(None),
        }
    }

    pub fn search_dir(&self) -> &Path {
        &self.search_dir
    }

    /// First existing candidate, preferring the bundled name.
    pub fn locate_binary(&self) -> Option<PathBuf> {
        DAEMON_CANDIDATES.iter().map(|name| self.search_dir.join(name)).find(|path| path.is_file())
    }

    pub fn state(&self) -> ProcessState {
        let mut launched = lock(&self.launched);
        match launched.as_mut() {
            None => ProcessState::NotStarted,
            Some(l) => match l.child.try_wait() {
                Ok(None) => ProcessState::Running,
                Ok(Some(_)) | Err(_) => ProcessState::Exited,
            },
        }
    }

    pub fn captured_stderr(&self) -> String {
        lock(&self.stderr).clone()
    }

    fn fail(&self, reason: String) -> StartOutcome {
        warn!("{reason}");
        *lock(&self.last_error) = Some(reason);
        StartOutcome::FailedToStart
    }

    fn spawn(&self, program: &Path) -> std::io::Result<Child> {
        let mut command = Command::new(program);
        command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped());
        #[cfg(windows)]
        command.current_dir(&self.search_dir);
        command.spawn()
    }
}

impl DaemonLauncher for DaemonProcessManager {
    fn ensure_started(&self) -> StartOutcome {
        let mut launched = lock(&self.launched);

        if let Some(existing) = launched.as_mut() {
            return match existing.child.try_wait() {
                Ok(None) => StartOutcome::AlreadyRunning,
                Ok(Some(status)) => {
                    let output = lock(&self.stderr).clone();
                    if !output.is_empty() {
                        error!("moonroomcashd said: {output}");
                    }
                    warn!("{} exited with {status}", existing.program.display());
                    StartOutcome::FailedToStart
                }
                Err(e) => self.fail(format!("Could not query moonroomcashd state: {e}")),
            };
        }

        info!("Trying to start embedded moonroomcashd");
        let Some(program) = self.locate_binary() else {
            return self.fail(format!("Can't find moonroomcashd in {}", self.search_dir.display()));
        };

        let mut child = match self.spawn(&program) {
            Ok(child) => child,
            Err(e) => return self.fail(format!("Couldn't start {}: {e}", program.display())),
        };

        if let Some(mut stderr) = child.stderr.take() {
            let sink = Arc::clone(&self.stderr);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]);
                            warn!("moonroomcashd stderr: {}", chunk.trim_end());
                            lock(&sink).push_str(&chunk);
                        }
                        Err(e) => {
                            warn!("stopped reading moonroomcashd stderr: {e}");
                            break;
                        }
                    }
                }
            });
        }

        info!("Started {}", program.display());
        *launched = Some(Launched { child, program });
        StartOutcome::JustStarted
    }

    fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    fn diagnostics(&self) -> Option<String> {
        let output = self.captured_stderr();
        if !output.trim().is_empty() {
            return Some(output);
        }
        lock(&self.last_error).clone()
    }

    fn kill(&self) {
        if let Some(l) = lock(&self.launched).as_mut() {
            if let Err(e) = l.child.start_kill() {
                warn!("could not kill {}: {e}", l.program.display());
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::OnceLock;
    use std::time::Duration;

    async fn test_guard() -> tokio::sync::MutexGuard<'static, ()> {
        static GUARD: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| tokio::sync::Mutex::new(())).lock().await
    }

    fn write_script(dir: &Path, body: &str) {
        let path = dir.join("moonroomcashd");
        fs::write(&path, format!("#!/bin/sh\necho run >> \"$(dirname \"$0\")/runs\"\n{body}\n")).expect("write script");
        let mut perm = fs::metadata(&path).expect("metadata").permissions();
        perm.set_mode(0o755);
        fs::set_permissions(&path, perm).expect("chmod");
    }

    fn runs(dir: &Path) -> usize {
        fs::read_to_string(dir.join("runs")).map(|s| s.lines().count()).unwrap_or(0)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn missing_binary_fails_with_diagnostic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = DaemonProcessManager::new(dir.path());
        assert_eq!(manager.ensure_started(), StartOutcome::FailedToStart);
        assert_eq!(manager.state(), ProcessState::NotStarted);
        assert!(manager.diagnostics().expect("diagnostic").contains("Can't find moonroomcashd"));
    }

    #[tokio::test]
    async fn running_daemon_is_never_spawned_twice() {
        let _guard = test_guard().await;
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(dir.path(), "exec sleep 30");
        let manager = DaemonProcessManager::new(dir.path());

        assert_eq!(manager.ensure_started(), StartOutcome::JustStarted);
        assert_eq!(manager.ensure_started(), StartOutcome::AlreadyRunning);
        assert!(manager.is_running());
        wait_until(|| runs(dir.path()) == 1).await;

        manager.kill();
        wait_until(|| !manager.is_running()).await;
        assert_eq!(runs(dir.path()), 1);
    }

    #[tokio::test]
    async fn exited_daemon_reports_captured_stderr() {
        let _guard = test_guard().await;
        let dir = tempfile::tempdir().expect("tempdir");
        write_script(dir.path(), "echo 'Cannot obtain a lock on data directory' >&2\nexit 1");
        let manager = DaemonProcessManager::new(dir.path());

        assert_eq!(manager.ensure_started(), StartOutcome::JustStarted);
        wait_until(|| manager.state() == ProcessState::Exited).await;
        wait_until(|| manager.captured_stderr().contains("Cannot obtain a lock")).await;

        assert_eq!(manager.ensure_started(), StartOutcome::FailedToStart);
        assert!(manager.diagnostics().expect("stderr").contains("Cannot obtain a lock on data directory"));
        assert_eq!(runs(dir.path()), 1);
    }
}
