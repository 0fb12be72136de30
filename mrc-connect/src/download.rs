//! Sequential fetch of missing parameter files. Each transfer streams into
//! `<name>.part` and is renamed only once it completed without error; the
//! first failure abandons the rest of the queue.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::{Client, Url};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::error::DownloadError;
use crate::report::Reporter;

const PART_SUFFIX: &str = ".part";
const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    InFlight,
    Done,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadTask {
    url: String,
    destination_dir: PathBuf,
    final_name: String,
    state: TaskState,
}

impl DownloadTask {
    pub fn new(url: &str, destination_dir: &Path) -> Result<Self, DownloadError> {
        let final_name = file_name_of(url).ok_or_else(|| DownloadError::InvalidUrl { url: url.to_string() })?;
        Ok(Self { url: url.to_string(), destination_dir: destination_dir.to_path_buf(), final_name, state: TaskState::Queued })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn final_name(&self) -> &str {
        &self.final_name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    fn advance(&mut self, next: TaskState) {
        debug!("{}: {:?} -> {:?}", self.final_name, self.state, next);
        self.state = next;
    }

    pub fn final_path(&self) -> PathBuf {
        self.destination_dir.join(&self.final_name)
    }

    pub fn part_path(&self) -> PathBuf {
        self.destination_dir.join(format!("{}{PART_SUFFIX}", self.final_name))
    }
}

/// Last path segment of `url`, if it names a file.
pub fn file_name_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed.path_segments()?.last()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Bytes moved so far in one transfer.
#[derive(Clone, Copy, Debug)]
pub struct TransferProgress {
    pub done: u64,
    pub total: u64,
    pub elapsed: Duration,
}

impl TransferProgress {
    /// Bytes per second, averaged since the transfer started.
    pub fn throughput(&self) -> f64 {
        let elapsed_ms = self.elapsed.as_millis().max(1) as f64;
        self.done as f64 / elapsed_ms * 1000.0
    }

    pub fn detail(&self) -> String {
        format!("{}MB of {}MB at {}", self.done / 1024 / 1024, self.total / 1024 / 1024, format_speed(self.throughput()))
    }
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec < KIB {
        format!("{bytes_per_sec:.2}bytes/s")
    } else if bytes_per_sec < MIB {
        format!("{:.2}kB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.2}MB/s", bytes_per_sec / MIB)
    }
}

/// What a completed pipeline run did. `tasks` keeps queue order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub fetched: Vec<String>,
    pub skipped: Vec<String>,
    pub tasks: Vec<DownloadTask>,
}

pub struct DownloadPipeline {
    client: Client,
    reporter: Arc<dyn Reporter>,
}

impl DownloadPipeline {
    pub fn new(reporter: Arc<dyn Reporter>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().redirect(reqwest::redirect::Policy::limited(10)).build()?;
        Ok(Self::with_client(client, reporter))
    }

    pub fn with_client(client: Client, reporter: Arc<dyn Reporter>) -> Self {
        Self { client, reporter }
    }

    /// Fetch every URL in order into `dest_dir`, skipping files already there.
    /// `on_all_done` runs exactly once, and only if every item succeeded.
    pub async fn run<F>(&self, urls: &[String], dest_dir: &Path, on_all_done: F) -> Result<DownloadSummary, DownloadError>
    where
        F: FnOnce(),
    {
        info!("Adding params to download queue");
        let mut queue = urls.iter().map(|url| DownloadTask::new(url, dest_dir)).collect::<Result<VecDeque<_>, _>>()?;

        if !dest_dir.is_dir() {
            info!("Creating params location at {}", dest_dir.display());
            fs::create_dir_all(dest_dir).await.map_err(|source| DownloadError::Io { file: dest_dir.display().to_string(), source })?;
        }

        let mut summary = DownloadSummary::default();
        while let Some(mut task) = queue.pop_front() {
            if task.final_path().exists() {
                info!("{} already exists, skipping", task.final_name());
                task.advance(TaskState::Done);
                summary.skipped.push(task.final_name.clone());
                summary.tasks.push(task);
                continue;
            }

            task.advance(TaskState::InFlight);
            match self.fetch(&task, queue.len()).await {
                Ok(()) => {
                    task.advance(TaskState::Done);
                    info!("Finished downloading {}", task.final_name());
                    summary.fetched.push(task.final_name.clone());
                    summary.tasks.push(task);
                }
                Err(e) => {
                    task.advance(TaskState::Failed);
                    warn!("Downloading {} failed: {e}", task.final_name());
                    if let Err(cleanup) = fs::remove_file(task.part_path()).await {
                        debug!("no partial file removed for {}: {cleanup}", task.final_name());
                    }
                    return Err(e);
                }
            }
        }

        info!("All Downloads done");
        self.reporter.progress("All Downloads Finished Successfully!", "");
        on_all_done();
        Ok(summary)
    }

    async fn fetch(&self, task: &DownloadTask, remaining: usize) -> Result<(), DownloadError> {
        let name = task.final_name().to_string();
        let transfer_err = |source| DownloadError::Transfer { file: name.clone(), source };
        let io_err = |source| DownloadError::Io { file: name.clone(), source };

        let primary = if remaining > 0 {
            format!("Downloading {name} ( +{remaining} more remaining )")
        } else {
            format!("Downloading {name}")
        };

        info!("Downloading {} to {}", task.url(), task.part_path().display());
        let mut output = File::create(task.part_path()).await.map_err(io_err)?;
        let started = Instant::now();
        let mut response = self.client.get(task.url()).send().await.and_then(|r| r.error_for_status()).map_err(transfer_err)?;
        let total = response.content_length();

        let mut done = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(transfer_err)? {
            output.write_all(&chunk).await.map_err(io_err)?;
            done += chunk.len() as u64;
            let progress = TransferProgress { done, total: total.unwrap_or(done), elapsed: started.elapsed() };
            self.reporter.progress(&primary, &progress.detail());
        }

        output.flush().await.map_err(io_err)?;
        drop(output);
        fs::rename(task.part_path(), task.final_path()).await.map_err(io_err)?;
        Ok(())
    }
}
