//! Batch activation and download of assets with bounded concurrency.
//!
//! Every asset runs as its own future on the caller's task. A semaphore with
//! `concurrency` permits gates entry into the activating/downloading phase,
//! so at most that many assets talk to the service at once while the rest
//! wait their turn. One asset failing never stops its siblings.

mod sink;
mod task;

pub use sink::{MemorySink, SinkTarget};
pub use task::{DownloadTask, TaskFailure, TaskOutcome, TaskResult, TaskState};

use crate::activation::ActivationPoller;
use crate::api::{AssetApi, PageSource};
use crate::config::{secs, Config};
use crate::error::{ApiError, ErrorKind, FetchError};
use crate::model::AssetRef;
use crate::pagination::PageIterator;
use crate::retry::RetryPolicy;
use bytes::Bytes;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Assets allowed in the activating or downloading phase at once.
    pub concurrency: usize,
    /// Longest wait for an asset body to start or to yield its next chunk.
    #[serde(with = "secs")]
    pub chunk_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            chunk_timeout: Duration::from_secs(60),
        }
    }
}

/// Aggregated outcome of a batch. Every asset lands in exactly one of the
/// three collections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Bytes written per asset.
    #[serde(with = "entries")]
    pub succeeded: BTreeMap<AssetRef, u64>,
    #[serde(with = "entries")]
    pub failed: BTreeMap<AssetRef, TaskFailure>,
    pub cancelled: BTreeSet<AssetRef>,
    /// Set when the asset listing broke off after its first page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_error: Option<String>,
}

impl BatchReport {
    pub fn record(self: &mut Self, outcome: TaskOutcome) {
        match outcome.result {
            TaskResult::Succeeded { bytes, .. } => {
                self.succeeded.insert(outcome.asset, bytes);
            }
            TaskResult::Failed(failure) => {
                self.failed.insert(outcome.asset, failure);
            }
            TaskResult::Cancelled => {
                self.cancelled.insert(outcome.asset);
            }
        }
    }

    pub fn total(self: &Self) -> usize {
        self.succeeded.len() + self.failed.len() + self.cancelled.len()
    }

    pub fn is_complete(self: &Self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty() && self.listing_error.is_none()
    }

    pub fn read<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        let report: Self = serde_json::from_str(&content)?;
        Ok(report)
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Maps keyed by `AssetRef` as a list of `[key, value]` pairs, since JSON
/// object keys must be strings.
mod entries {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let pairs = Vec::<(K, V)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

enum Read {
    Cancelled,
    TimedOut,
    Next(Option<Result<Bytes, ApiError>>),
}

pub struct Downloader<'a, A: AssetApi> {
    api: &'a A,
    poller: ActivationPoller<'a, A>,
    retry: RetryPolicy,
    config: DownloadConfig,
    events: Option<mpsc::UnboundedSender<TaskOutcome>>,
}

impl<'a, A: AssetApi> Downloader<'a, A> {
    pub fn new(api: &'a A, config: &Config) -> Self {
        Self {
            api,
            poller: ActivationPoller::new(api, config.activation.clone(), config.retry.clone()),
            retry: config.retry.clone(),
            config: config.download.clone(),
            events: None,
        }
    }

    /// Also send every outcome to `events` as soon as it is known.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<TaskOutcome>) -> Self {
        self.events = Some(events);
        self
    }

    /// Activate and download every asset, writing each to the sink chosen by
    /// `resolve_sink`. Duplicate assets are downloaded once.
    pub async fn download<F>(
        self: &Self,
        assets: Vec<AssetRef>,
        resolve_sink: F,
        cancel: &CancellationToken,
    ) -> BatchReport
    where
        F: Fn(&AssetRef) -> SinkTarget,
    {
        let semaphore = Semaphore::new(self.config.concurrency.max(1));
        let mut seen = HashSet::new();
        let mut running: FuturesUnordered<_> = assets
            .into_iter()
            .filter(|asset| seen.insert(asset.clone()))
            .map(|asset| {
                let sink = resolve_sink(&asset);
                self.run_task(DownloadTask::new(asset, sink), &semaphore, cancel)
            })
            .collect();
        tracing::info!(
            assets = running.len(),
            concurrency = self.config.concurrency,
            "Starting batch"
        );

        let mut report = BatchReport::default();
        while let Some(outcome) = running.next().await {
            if let Some(events) = &self.events {
                let _ = events.send(outcome.clone());
            }
            report.record(outcome);
        }
        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            "Batch finished"
        );
        report
    }

    /// Enumerate assets from a paged listing, then download them.
    ///
    /// Failing to fetch the very first page is an error. A failure further
    /// along keeps what was listed so far and is noted in the report.
    pub async fn download_listing<T, S, M, F>(
        self: &Self,
        mut pages: PageIterator<'_, T, S>,
        select: M,
        resolve_sink: F,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, FetchError>
    where
        S: PageSource<T>,
        M: Fn(&T) -> Vec<AssetRef>,
        F: Fn(&AssetRef) -> SinkTarget,
    {
        let mut assets = Vec::new();
        let mut listing_error = None;
        while !cancel.is_cancelled() {
            match pages.next().await {
                None => break,
                Some(Ok(item)) => assets.extend(select(&item)),
                Some(Err(err)) if pages.pages_fetched() == 0 => return Err(err),
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "Listing broke off, downloading what was found");
                    listing_error = Some(err.to_string());
                    break;
                }
            }
        }
        tracing::info!(
            assets = assets.len(),
            pages = pages.pages_fetched(),
            "Listing enumerated"
        );

        let mut report = self.download(assets, resolve_sink, cancel).await;
        report.listing_error = listing_error;
        Ok(report)
    }

    async fn run_task(
        self: &Self,
        mut task: DownloadTask,
        semaphore: &Semaphore,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return task.cancel(),
            permit = semaphore.acquire() => permit,
        };
        let Ok(_permit) = permit else {
            return task.cancel();
        };
        if cancel.is_cancelled() {
            return task.cancel();
        }

        task.attempts = 1;
        task.advance(TaskState::Activating);
        let timeout = self.poller.config().timeout;
        let location = match self
            .poller
            .activate_and_wait(&task.asset, timeout, cancel)
            .await
        {
            Ok(location) => location,
            Err(err) => {
                tracing::debug!(asset = %task.asset, error = %err, "Activation ended without a location");
                return task.fail(err.kind());
            }
        };

        task.advance(TaskState::Downloading);
        loop {
            let kind = match self.transfer(&location, &task.sink, cancel).await {
                Ok(bytes) => return task.succeed(bytes),
                Err(kind) => kind,
            };
            task.last_error = Some(kind);

            let decision = self.retry.decide(task.attempts, kind);
            if !decision.retry {
                return task.fail(kind);
            }
            tracing::warn!(
                asset = %task.asset,
                error = %kind,
                attempt = task.attempts,
                wait_ms = decision.wait.as_millis() as u64,
                "Transfer failed, restarting from the beginning"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return task.cancel(),
                _ = tokio::time::sleep(decision.wait) => {}
            }
            task.attempts += 1;
        }
    }

    /// Stream one asset body into its sink. Opening the stream and every
    /// chunk read are bounded by `chunk_timeout` and raced against `cancel`;
    /// a partial write is discarded on any failure.
    async fn transfer(
        self: &Self,
        location: &Url,
        sink: &SinkTarget,
        cancel: &CancellationToken,
    ) -> Result<u64, ErrorKind> {
        if cancel.is_cancelled() {
            return Err(ErrorKind::Cancelled);
        }
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
            opened = tokio::time::timeout(
                self.config.chunk_timeout,
                self.api.open_byte_stream(location),
            ) => opened,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tracing::debug!(location = %location, error = %err, "Unable to open byte stream");
                return Err(err.kind);
            }
            Err(_) => {
                tracing::debug!(location = %location, "No response to byte stream request");
                return Err(ErrorKind::Timeout);
            }
        };
        let mut writer = sink.open().await.map_err(|err| {
            tracing::warn!(error = %err, "Unable to open sink");
            ErrorKind::SinkWrite
        })?;

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => Read::Cancelled,
                next = tokio::time::timeout(self.config.chunk_timeout, stream.next()) => match next {
                    Ok(next) => Read::Next(next),
                    Err(_) => Read::TimedOut,
                },
            };
            let chunk = match read {
                Read::Next(Some(Ok(chunk))) => chunk,
                Read::Next(None) => break,
                Read::Next(Some(Err(err))) => {
                    writer.discard().await;
                    return Err(err.kind);
                }
                Read::TimedOut => {
                    writer.discard().await;
                    return Err(ErrorKind::Timeout);
                }
                Read::Cancelled => {
                    writer.discard().await;
                    return Err(ErrorKind::Cancelled);
                }
            };
            if let Err(err) = writer.write(&chunk).await {
                tracing::warn!(error = %err, "Unable to write to sink");
                writer.discard().await;
                return Err(ErrorKind::SinkWrite);
            }
        }

        writer.finish().await.map_err(|err| {
            tracing::warn!(error = %err, "Unable to finish sink");
            ErrorKind::SinkWrite
        })
    }
}
