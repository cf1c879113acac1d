//! Collaborator interfaces the orchestrator is written against, and the
//! reqwest-backed implementation in [`http`].
use crate::error::ApiError;
use crate::model::{AssetRef, AssetStatus, Order, OrderRequest, Page};
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use url::Url;

pub mod http;

pub use http::HttpClient;

/// Chunked body of an asset download.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>;

pub trait PageSource<T> {
    async fn fetch_page(self: &Self, url: &Url) -> Result<Page<T>, ApiError>;
}

pub trait AssetApi {
    async fn trigger_activation(self: &Self, asset: &AssetRef) -> Result<(), ApiError>;

    async fn fetch_asset_status(self: &Self, asset: &AssetRef) -> Result<AssetStatus, ApiError>;

    async fn open_byte_stream(self: &Self, location: &Url) -> Result<ByteStream, ApiError>;
}

pub trait OrderApi {
    async fn create_order(self: &Self, request: &OrderRequest) -> Result<Order, ApiError>;

    async fn fetch_order(self: &Self, order_id: &str) -> Result<Order, ApiError>;
}
