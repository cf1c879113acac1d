//! Scripted in-memory service shared by the poller, downloader and order tests.

use crate::api::{AssetApi, ByteStream, OrderApi};
use crate::error::{ApiError, ErrorKind};
use crate::model::{AssetRef, AssetState, AssetStatus, Order, OrderRequest, OrderState};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

pub(crate) const ORDER_ID: &str = "order-1";

struct FakeAsset {
    /// Consumed one per status poll; the last entry repeats.
    statuses: VecDeque<AssetState>,
    payload: Vec<u8>,
    /// Streams that break after their first chunk.
    broken_streams: u32,
    /// Status polls answered with a 503.
    status_errors: u32,
}

/// Tracks how many assets are between their first status poll (or stream
/// open) and the end of their byte stream or a `failed` status.
#[derive(Default)]
struct InFlight {
    assets: Mutex<HashSet<AssetRef>>,
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    fn enter(self: &Self, asset: &AssetRef) {
        if self.assets.lock().unwrap().insert(asset.clone()) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
        }
    }

    fn leave(self: &Self, asset: &AssetRef) {
        if self.assets.lock().unwrap().remove(asset) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct InFlightGuard {
    in_flight: Arc<InFlight>,
    asset: AssetRef,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.leave(&self.asset);
    }
}

#[derive(Default)]
struct Calls {
    status_polls: HashMap<AssetRef, u32>,
    triggers: HashMap<AssetRef, u32>,
    opens: HashMap<AssetRef, u32>,
    orders_created: u32,
    order_requests: Vec<OrderRequest>,
    order_polls: u32,
}

pub(crate) struct FakeApi {
    assets: Mutex<HashMap<AssetRef, FakeAsset>>,
    calls: Mutex<Calls>,
    in_flight: Arc<InFlight>,
    order_states: Mutex<VecDeque<OrderState>>,
    order_assets: Vec<AssetRef>,
    /// Order polls answered with a 503.
    order_errors: Mutex<u32>,
    poll_delay: Duration,
    chunk_delay: Duration,
    chunk_size: usize,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            assets: Mutex::new(HashMap::new()),
            calls: Mutex::new(Calls::default()),
            in_flight: Arc::new(InFlight::default()),
            order_states: Mutex::new(VecDeque::new()),
            order_assets: Vec::new(),
            order_errors: Mutex::new(0),
            poll_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            chunk_size: 4,
        }
    }

    pub fn with_asset(self, asset: &AssetRef, statuses: &[AssetState], payload: &[u8]) -> Self {
        self.assets.lock().unwrap().insert(
            asset.clone(),
            FakeAsset {
                statuses: statuses.iter().copied().collect(),
                payload: payload.to_vec(),
                broken_streams: 0,
                status_errors: 0,
            },
        );
        self
    }

    pub fn with_broken_streams(self, asset: &AssetRef, count: u32) -> Self {
        if let Some(fake) = self.assets.lock().unwrap().get_mut(asset) {
            fake.broken_streams = count;
        }
        self
    }

    pub fn with_status_errors(self, asset: &AssetRef, count: u32) -> Self {
        if let Some(fake) = self.assets.lock().unwrap().get_mut(asset) {
            fake.status_errors = count;
        }
        self
    }

    pub fn with_order(mut self, states: &[OrderState], assets: Vec<AssetRef>) -> Self {
        *self.order_states.lock().unwrap() = states.iter().copied().collect();
        self.order_assets = assets;
        self
    }

    pub fn with_order_errors(self, count: u32) -> Self {
        *self.order_errors.lock().unwrap() = count;
        self
    }

    pub fn with_delays(mut self, poll_delay: Duration, chunk_delay: Duration) -> Self {
        self.poll_delay = poll_delay;
        self.chunk_delay = chunk_delay;
        self
    }

    pub fn location_for(asset: &AssetRef) -> Url {
        Url::parse(&format!(
            "https://downloads.test/{}/{}",
            asset.item_id, asset.asset_type
        ))
        .unwrap()
    }

    pub fn status_polls(self: &Self, asset: &AssetRef) -> u32 {
        *self.calls.lock().unwrap().status_polls.get(asset).unwrap_or(&0)
    }

    pub fn total_status_polls(self: &Self) -> u32 {
        self.calls.lock().unwrap().status_polls.values().sum()
    }

    pub fn triggers(self: &Self, asset: &AssetRef) -> u32 {
        *self.calls.lock().unwrap().triggers.get(asset).unwrap_or(&0)
    }

    pub fn opens(self: &Self, asset: &AssetRef) -> u32 {
        *self.calls.lock().unwrap().opens.get(asset).unwrap_or(&0)
    }

    pub fn orders_created(self: &Self) -> u32 {
        self.calls.lock().unwrap().orders_created
    }

    pub fn order_requests(self: &Self) -> Vec<OrderRequest> {
        self.calls.lock().unwrap().order_requests.clone()
    }

    pub fn order_polls(self: &Self) -> u32 {
        self.calls.lock().unwrap().order_polls
    }

    pub fn max_in_flight(self: &Self) -> usize {
        self.in_flight.max.load(Ordering::SeqCst)
    }

    pub fn in_flight(self: &Self) -> usize {
        self.in_flight.current.load(Ordering::SeqCst)
    }

    fn next_order_state(self: &Self) -> OrderState {
        let mut states = self.order_states.lock().unwrap();
        if states.len() > 1 {
            states.pop_front().unwrap()
        } else {
            states.front().copied().unwrap_or(OrderState::Queued)
        }
    }

    fn order(self: &Self, state: OrderState) -> Order {
        let assets = if state.has_results() {
            self.order_assets.clone()
        } else {
            Vec::new()
        };
        Order {
            id: ORDER_ID.to_string(),
            state,
            assets,
        }
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError::new(ErrorKind::ClientError { status: 404 }, what, "not found").with_status(404)
}

fn unavailable(what: &str) -> ApiError {
    ApiError::new(ErrorKind::ServerError { status: 503 }, what, "unavailable").with_status(503)
}

impl AssetApi for FakeApi {
    async fn trigger_activation(self: &Self, asset: &AssetRef) -> Result<(), ApiError> {
        *self
            .calls
            .lock()
            .unwrap()
            .triggers
            .entry(asset.clone())
            .or_default() += 1;
        Ok(())
    }

    async fn fetch_asset_status(self: &Self, asset: &AssetRef) -> Result<AssetStatus, ApiError> {
        if !self.poll_delay.is_zero() {
            tokio::time::sleep(self.poll_delay).await;
        }
        self.in_flight.enter(asset);
        *self
            .calls
            .lock()
            .unwrap()
            .status_polls
            .entry(asset.clone())
            .or_default() += 1;

        let state = {
            let mut assets = self.assets.lock().unwrap();
            let fake = assets.get_mut(asset).ok_or_else(|| not_found(&asset.id))?;
            if fake.status_errors > 0 {
                fake.status_errors -= 1;
                return Err(unavailable(&asset.id));
            }
            if fake.statuses.len() > 1 {
                fake.statuses.pop_front().unwrap()
            } else {
                fake.statuses.front().copied().unwrap_or(AssetState::Inactive)
            }
        };
        match state {
            AssetState::Active => Ok(AssetStatus::active(Self::location_for(asset))),
            AssetState::Failed => {
                self.in_flight.leave(asset);
                Ok(AssetStatus::new(state))
            }
            _ => Ok(AssetStatus::new(state)),
        }
    }

    async fn open_byte_stream(self: &Self, location: &Url) -> Result<ByteStream, ApiError> {
        let (asset, payload, broken) = {
            let mut assets = self.assets.lock().unwrap();
            let (asset, fake) = assets
                .iter_mut()
                .find(|(asset, _)| Self::location_for(asset) == *location)
                .ok_or_else(|| not_found(location.as_str()))?;
            let broken = fake.broken_streams > 0;
            if broken {
                fake.broken_streams -= 1;
            }
            (asset.clone(), fake.payload.clone(), broken)
        };
        *self
            .calls
            .lock()
            .unwrap()
            .opens
            .entry(asset.clone())
            .or_default() += 1;
        self.in_flight.enter(&asset);

        let mut chunks: Vec<Result<Bytes, ApiError>> = payload
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if broken {
            chunks.truncate(1);
            chunks.push(Err(ApiError::new(
                ErrorKind::TransientNetwork,
                location.as_str(),
                "connection reset",
            )));
        }

        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            asset,
        };
        let delay = self.chunk_delay;
        let stream = futures_util::stream::unfold(
            (chunks.into_iter(), guard),
            move |(mut chunks, guard)| async move {
                let chunk = chunks.next()?;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some((chunk, (chunks, guard)))
            },
        );
        Ok(Box::pin(stream))
    }
}

impl OrderApi for FakeApi {
    async fn create_order(self: &Self, request: &OrderRequest) -> Result<Order, ApiError> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.orders_created += 1;
            calls.order_requests.push(request.clone());
        }
        Ok(self.order(self.next_order_state()))
    }

    async fn fetch_order(self: &Self, order_id: &str) -> Result<Order, ApiError> {
        if order_id != ORDER_ID {
            return Err(not_found(order_id));
        }
        self.calls.lock().unwrap().order_polls += 1;
        {
            let mut errors = self.order_errors.lock().unwrap();
            if *errors > 0 {
                *errors -= 1;
                return Err(unavailable(order_id));
            }
        }
        Ok(self.order(self.next_order_state()))
    }
}

/// Deterministic payload of `len` bytes.
pub(crate) fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
