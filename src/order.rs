//! Server-side orders: create, wait for the order to settle, then download
//! whatever assets it produced.

use crate::api::{AssetApi, OrderApi};
use crate::config::{secs, Config};
use crate::downloader::{BatchReport, Downloader, SinkTarget, TaskOutcome};
use crate::error::ApiError;
use crate::model::{AssetRef, Order, OrderRequest, OrderState};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    /// Overall deadline for the order to reach a terminal state.
    #[serde(with = "secs")]
    pub timeout: Duration,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Error, Debug)]
pub enum OrderError {
    #[error("unable to create order: {0}")]
    Create(#[source] ApiError),
    #[error("unable to poll order {order_id}: {source}")]
    Poll {
        order_id: String,
        #[source]
        source: ApiError,
    },
}

/// How the wait for the order ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderOutcome {
    /// The order reached a terminal state; see `Order::state`.
    Completed,
    TimedOut,
    Cancelled,
}

/// Order-level result kept apart from the per-asset results, so a `partial`
/// order is distinguishable from assets that failed to download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReport {
    /// Last observed order.
    pub order: Order,
    pub outcome: OrderOutcome,
    pub downloads: BatchReport,
}

impl OrderReport {
    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

pub struct OrderOrchestrator<'a, C: OrderApi + AssetApi> {
    client: &'a C,
    retry: RetryPolicy,
    config: OrderConfig,
    downloader: Downloader<'a, C>,
}

impl<'a, C: OrderApi + AssetApi> OrderOrchestrator<'a, C> {
    pub fn new(client: &'a C, config: &Config) -> Self {
        Self {
            client,
            retry: config.retry.clone(),
            config: config.order.clone(),
            downloader: Downloader::new(client, config),
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<TaskOutcome>) -> Self {
        self.downloader = self.downloader.with_events(events);
        self
    }

    pub async fn run<F>(
        self: &Self,
        request: &OrderRequest,
        resolve_sink: F,
        cancel: &CancellationToken,
    ) -> Result<OrderReport, OrderError>
    where
        F: Fn(&AssetRef) -> SinkTarget,
    {
        let request = OrderRequest {
            item_ids: request.item_ids(),
            ..request.clone()
        };
        let order = self
            .retry
            .run(cancel, || self.client.create_order(&request))
            .await
            .map_err(OrderError::Create)?;
        tracing::info!(order_id = %order.id, state = %order.state, name = %request.name, "Order created");

        let (order, outcome) = self.wait_for_order(order, cancel).await?;
        let downloads = match outcome {
            OrderOutcome::Completed if order.state.has_results() => {
                if order.state == OrderState::Partial {
                    tracing::warn!(
                        order_id = %order.id,
                        assets = order.assets.len(),
                        "Order completed partially, downloading the assets it produced"
                    );
                }
                self.downloader
                    .download(order.assets.clone(), resolve_sink, cancel)
                    .await
            }
            OrderOutcome::Completed => {
                tracing::warn!(order_id = %order.id, state = %order.state, "Order produced no assets");
                BatchReport::default()
            }
            OrderOutcome::TimedOut | OrderOutcome::Cancelled => BatchReport::default(),
        };

        Ok(OrderReport {
            order,
            outcome,
            downloads,
        })
    }

    /// Poll on the retry policy's backoff curve until the order is terminal,
    /// the order deadline passes, or `cancel` fires. Retried polls are cut
    /// off at the deadline too.
    async fn wait_for_order(
        self: &Self,
        mut order: Order,
        cancel: &CancellationToken,
    ) -> Result<(Order, OrderOutcome), OrderError> {
        let deadline = Instant::now() + self.config.timeout;
        let order_id = order.id.clone();
        let mut polls = 0;
        while !order.state.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    order_id = %order_id,
                    state = %order.state,
                    timeout_s = self.config.timeout.as_secs_f64(),
                    "Order timed out"
                );
                return Ok((order, OrderOutcome::TimedOut));
            }
            let wait = self.retry.backoff(polls).min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok((order, OrderOutcome::Cancelled)),
                _ = tokio::time::sleep(wait) => {}
            }

            let polled = self
                .retry
                .run(cancel, || self.client.fetch_order(&order_id));
            let Ok(polled) = tokio::time::timeout_at(deadline, polled).await else {
                tracing::warn!(order_id = %order_id, state = %order.state, "Order timed out while polling");
                return Ok((order, OrderOutcome::TimedOut));
            };
            match polled {
                Ok(next) => order = next,
                Err(err) if err.is_cancelled() => return Ok((order, OrderOutcome::Cancelled)),
                Err(source) => {
                    return Err(OrderError::Poll {
                        order_id: order_id.clone(),
                        source,
                    })
                }
            }
            polls += 1;
            tracing::debug!(order_id = %order_id, state = %order.state, polls, "Order polled");
        }
        tracing::info!(order_id = %order_id, state = %order.state, "Order settled");
        Ok((order, OrderOutcome::Completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationConfig;
    use crate::downloader::MemorySink;
    use crate::error::ErrorKind;
    use crate::model::AssetState;
    use crate::test_support::{payload, FakeApi, ORDER_ID};

    fn test_config(timeout: Duration) -> Config {
        let mut config = Config::default();
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        config.activation = ActivationConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
            jitter: false,
        };
        config.order.timeout = timeout;
        config
    }

    fn request() -> OrderRequest {
        OrderRequest {
            name: "coastline".to_string(),
            item_ids: (0..4).map(|i| format!("scene-{i}")).collect(),
            asset_types: vec!["visual".to_string()],
        }
    }

    fn sink(_: &AssetRef) -> SinkTarget {
        SinkTarget::Memory(MemorySink::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_order_downloads_what_it_produced() {
        // four items requested, the order only produced three of them
        let produced: Vec<AssetRef> = (0..3)
            .map(|i| AssetRef::new(&format!("scene-{i}"), "visual"))
            .collect();
        let api = FakeApi::new()
            .with_order(
                &[OrderState::Queued, OrderState::Running, OrderState::Partial],
                produced.clone(),
            )
            .with_asset(&produced[0], &[AssetState::Active], &payload(12))
            .with_asset(
                &produced[1],
                &[AssetState::Activating, AssetState::Failed],
                b"",
            )
            .with_asset(
                &produced[2],
                &[AssetState::Inactive, AssetState::Active],
                &payload(12),
            );
        let config = test_config(Duration::from_secs(60));

        let report = OrderOrchestrator::new(&api, &config)
            .run(&request(), sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, OrderOutcome::Completed);
        assert_eq!(report.order.id, ORDER_ID);
        assert_eq!(report.order.state, OrderState::Partial);
        assert_eq!(report.downloads.total(), 3);
        assert_eq!(report.downloads.succeeded.len(), 2);
        assert_eq!(
            report.downloads.failed[&produced[1]].kind,
            ErrorKind::ActivationFailed
        );
        assert_eq!(api.orders_created(), 1);
        assert_eq!(api.order_polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_order_skips_downloads() {
        let asset = AssetRef::new("scene-0", "visual");
        let api = FakeApi::new()
            .with_order(&[OrderState::Queued, OrderState::Failed], vec![asset.clone()])
            .with_asset(&asset, &[AssetState::Active], b"data");
        let config = test_config(Duration::from_secs(60));

        let report = OrderOrchestrator::new(&api, &config)
            .run(&request(), sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, OrderOutcome::Completed);
        assert_eq!(report.order.state, OrderState::Failed);
        assert_eq!(report.downloads.total(), 0);
        assert_eq!(api.total_status_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_deadline() {
        let api = FakeApi::new().with_order(&[OrderState::Queued], Vec::new());
        let config = test_config(Duration::from_secs(5));

        let started = Instant::now();
        let report = OrderOrchestrator::new(&api, &config)
            .run(&request(), sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, OrderOutcome::TimedOut);
        assert_eq!(report.order.state, OrderState::Queued);
        assert_eq!(report.downloads.total(), 0);
        // polls at 0.5s, 1.5s, 3.5s and the last at the 5s deadline
        assert_eq!(api.order_polls(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_order_polls_end_at_the_deadline() {
        let api = FakeApi::new()
            .with_order(&[OrderState::Queued], Vec::new())
            .with_order_errors(100);
        let mut config = test_config(Duration::from_secs(5));
        config.retry.max_attempts = 5;

        // polls start at 0.5s and retry after 1, 2 and 4s, past the 5s deadline
        let started = Instant::now();
        let report = OrderOrchestrator::new(&api, &config)
            .run(&request(), sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, OrderOutcome::TimedOut);
        assert_eq!(report.order.state, OrderState::Queued);
        assert_eq!(api.order_polls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_item_ids_are_sent_once() {
        let api = FakeApi::new().with_order(&[OrderState::Failed], Vec::new());
        let config = test_config(Duration::from_secs(60));
        let request = OrderRequest {
            item_ids: vec![
                "scene-1".to_string(),
                "scene-0".to_string(),
                "scene-1".to_string(),
            ],
            ..request()
        };

        OrderOrchestrator::new(&api, &config)
            .run(&request, sink, &CancellationToken::new())
            .await
            .unwrap();

        let sent = api.order_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].item_ids, ["scene-1", "scene-0"]);
        assert_eq!(sent[0].name, request.name);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_order() {
        let api = FakeApi::new().with_order(&[OrderState::Queued], Vec::new());
        let config = test_config(Duration::from_secs(60));
        let orchestrator = OrderOrchestrator::new(&api, &config);
        let cancel = CancellationToken::new();
        let request = request();

        let (report, _) = tokio::join!(orchestrator.run(&request, sink, &cancel), async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            cancel.cancel();
        });
        let report = report.unwrap();

        assert_eq!(report.outcome, OrderOutcome::Cancelled);
        assert_eq!(report.downloads.total(), 0);
        assert_eq!(api.order_polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_are_forwarded_to_events() {
        let asset = AssetRef::new("scene-0", "visual");
        let api = FakeApi::new()
            .with_order(&[OrderState::Success], vec![asset.clone()])
            .with_asset(&asset, &[AssetState::Active], b"data");
        let config = test_config(Duration::from_secs(60));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let report = OrderOrchestrator::new(&api, &config)
            .with_events(tx)
            .run(&request(), sink, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.downloads.is_complete());
        assert_eq!(api.order_polls(), 0);
        assert_eq!(rx.try_recv().unwrap().asset, asset);
        assert!(rx.try_recv().is_err());
    }
}
