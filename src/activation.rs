//! Per-asset activation: trigger, then poll until the server reports the asset
//! ready, failed, or the deadline passes.

use crate::api::AssetApi;
use crate::config::secs;
use crate::error::{ApiError, ErrorKind};
use crate::model::{AssetRef, AssetState, AssetStatus};
use crate::retry::RetryPolicy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    #[serde(with = "secs")]
    pub initial_interval: Duration,
    #[serde(with = "secs")]
    pub max_interval: Duration,
    /// Deadline for a single asset to become active.
    #[serde(with = "secs")]
    pub timeout: Duration,
    /// Spread each poll interval by ±10% so assets do not poll in lockstep.
    pub jitter: bool,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(15 * 60),
            jitter: true,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivationError {
    #[error("activation of {asset} failed on the server")]
    Failed { asset: String },
    #[error("activation of {asset} did not complete within {timeout:?}")]
    TimedOut { asset: String, timeout: Duration },
    #[error("asset {asset} is active but has no download location")]
    MissingLocation { asset: String },
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ActivationError {
    pub fn kind(self: &Self) -> ErrorKind {
        match self {
            Self::Failed { .. } => ErrorKind::ActivationFailed,
            Self::TimedOut { .. } => ErrorKind::ActivationTimeout,
            Self::MissingLocation { .. } => ErrorKind::InvalidResponse,
            Self::Api(err) => err.kind,
        }
    }
}

pub struct ActivationPoller<'a, A: AssetApi> {
    api: &'a A,
    config: ActivationConfig,
    retry: RetryPolicy,
}

impl<'a, A: AssetApi> ActivationPoller<'a, A> {
    pub fn new(api: &'a A, config: ActivationConfig, retry: RetryPolicy) -> Self {
        Self { api, config, retry }
    }

    pub fn config(self: &Self) -> &ActivationConfig {
        &self.config
    }

    /// Trigger activation unless the server already has the asset active or
    /// activating. Returns the status observed before any trigger.
    pub async fn activate(
        self: &Self,
        asset: &AssetRef,
        cancel: &CancellationToken,
    ) -> Result<AssetStatus, ActivationError> {
        let status = self.fetch_status(asset, cancel).await?;
        match status.state {
            AssetState::Inactive => {
                self.retry
                    .run(cancel, || self.api.trigger_activation(asset))
                    .await?;
                tracing::debug!(asset = %asset, "Activation triggered");
            }
            AssetState::Failed => {
                return Err(ActivationError::Failed {
                    asset: asset.id.clone(),
                })
            }
            AssetState::Activating | AssetState::Active => {
                tracing::debug!(asset = %asset, state = ?status.state, "Activation already under way");
            }
        }
        Ok(status)
    }

    /// Poll until the asset is active and return its download location.
    pub async fn await_active(
        self: &Self,
        asset: &AssetRef,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Url, ActivationError> {
        self.await_until(asset, Instant::now() + timeout, timeout, cancel)
            .await
    }

    /// `activate` followed by `await_active`, skipping the polling entirely
    /// when the asset is already active. `timeout` covers both.
    pub async fn activate_and_wait(
        self: &Self,
        asset: &AssetRef,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Url, ActivationError> {
        let deadline = Instant::now() + timeout;
        let status = match tokio::time::timeout_at(deadline, self.activate(asset, cancel)).await {
            Ok(status) => status?,
            Err(_) => return Err(self.timed_out(asset, timeout)),
        };
        if status.state == AssetState::Active {
            return self.location(asset, status);
        }
        self.await_until(asset, deadline, timeout, cancel).await
    }

    /// Every poll, retries included, is cut off at `deadline`.
    async fn await_until(
        self: &Self,
        asset: &AssetRef,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Url, ActivationError> {
        let mut interval = self.config.initial_interval;
        loop {
            let status =
                match tokio::time::timeout_at(deadline, self.fetch_status(asset, cancel)).await {
                    Ok(status) => status?,
                    Err(_) => return Err(self.timed_out(asset, timeout)),
                };
            match status.state {
                AssetState::Active => return self.location(asset, status),
                AssetState::Failed => {
                    tracing::warn!(asset = %asset, "Server reported activation failure");
                    return Err(ActivationError::Failed {
                        asset: asset.id.clone(),
                    });
                }
                AssetState::Inactive | AssetState::Activating => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(asset, timeout));
            }
            let wait = self.jittered(interval).min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::cancelled().into()),
                _ = tokio::time::sleep(wait) => {}
            }
            interval = (interval * 2).min(self.config.max_interval);
        }
    }

    fn timed_out(self: &Self, asset: &AssetRef, timeout: Duration) -> ActivationError {
        tracing::warn!(asset = %asset, timeout_s = timeout.as_secs_f64(), "Activation timed out");
        ActivationError::TimedOut {
            asset: asset.id.clone(),
            timeout,
        }
    }

    async fn fetch_status(
        self: &Self,
        asset: &AssetRef,
        cancel: &CancellationToken,
    ) -> Result<AssetStatus, ApiError> {
        self.retry
            .run(cancel, || self.api.fetch_asset_status(asset))
            .await
    }

    fn location(self: &Self, asset: &AssetRef, status: AssetStatus) -> Result<Url, ActivationError> {
        status.location.ok_or_else(|| ActivationError::MissingLocation {
            asset: asset.id.clone(),
        })
    }

    fn jittered(self: &Self, interval: Duration) -> Duration {
        if self.config.jitter {
            interval.mul_f64(rand::thread_rng().gen_range(0.9..=1.1))
        } else {
            interval
        }
    }
}
