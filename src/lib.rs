#![allow(async_fn_in_trait)]
pub mod activation;
pub mod api;
pub mod catalog;
pub mod config;
pub mod downloader;
pub mod error;
pub mod model;
pub mod order;
pub mod pagination;
pub mod retry;

#[cfg(test)]
mod test_support;

pub use activation::{ActivationConfig, ActivationError, ActivationPoller};
pub use api::{AssetApi, ByteStream, HttpClient, OrderApi, PageSource};
pub use config::{ApiConfig, Config, ConfigError};
pub use downloader::{BatchReport, DownloadConfig, Downloader, MemorySink, SinkTarget};
pub use error::{ApiError, ErrorKind, FetchError};
pub use model::{AssetRef, AssetState, AssetStatus, Order, OrderRequest, OrderState, Page};
pub use order::{OrderConfig, OrderError, OrderOrchestrator, OrderOutcome, OrderReport};
pub use pagination::PageIterator;
pub use retry::{BackoffDecision, RetryPolicy};
