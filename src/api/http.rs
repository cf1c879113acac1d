use super::{AssetApi, ByteStream, OrderApi, PageSource};
use crate::config::{ApiConfig, ConfigError};
use crate::error::{ApiError, ErrorKind};
use crate::model::{AssetRef, AssetStatus, Order, OrderRequest, Page};
use futures_util::StreamExt;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const API_KEY_HEADER: &str = "api-key";
const MAX_ERROR_MESSAGE: usize = 512;

/// Talks to the catalog/order service over HTTP.
///
/// Every JSON call carries the configured request timeout. Asset byte streams
/// do not, since a large asset can legitimately take longer than any single
/// request; the downloader bounds each chunk read instead.
pub struct HttpClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    request_timeout: Duration,
}

impl HttpClient {
    /// Build a client, reading the api key from the environment variable
    /// named in `config`.
    pub fn from_config(config: &ApiConfig) -> Result<Self, ConfigError> {
        Self::with_api_key(config, config.api_key())
    }

    pub fn with_api_key(config: &ApiConfig, api_key: Option<String>) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key,
            request_timeout: config.request_timeout,
        })
    }

    fn endpoint(self: &Self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ApiError::new(
                    ErrorKind::InvalidRequest,
                    self.base_url.as_str(),
                    "base url cannot carry a path",
                )
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// The api key only goes to the service itself, never to a download
    /// location hosted elsewhere.
    fn authorize(self: &Self, request: RequestBuilder, url: &Url) -> RequestBuilder {
        match &self.api_key {
            Some(key) if url.origin() == self.base_url.origin() => {
                request.header(API_KEY_HEADER, key)
            }
            _ => request,
        }
    }

    async fn send(self: &Self, request: RequestBuilder, url: &Url) -> Result<Response, ApiError> {
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&e, url))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response, url).await)
        }
    }

    async fn get_json<T: DeserializeOwned>(self: &Self, url: &Url) -> Result<T, ApiError> {
        let request = self
            .authorize(self.client.get(url.clone()), url)
            .timeout(self.request_timeout);
        let response = self.send(request, url).await?;
        decode(response, url).await
    }
}

impl<T: DeserializeOwned> PageSource<T> for HttpClient {
    async fn fetch_page(self: &Self, url: &Url) -> Result<Page<T>, ApiError> {
        let page: WirePage<T> = self.get_json(url).await?;
        page.into_page(url)
    }
}

impl AssetApi for HttpClient {
    async fn trigger_activation(self: &Self, asset: &AssetRef) -> Result<(), ApiError> {
        let url = self.endpoint(&[
            "items",
            asset.item_id.as_str(),
            "assets",
            asset.asset_type.as_str(),
            "activate",
        ])?;
        let request = self
            .authorize(self.client.post(url.clone()), &url)
            .timeout(self.request_timeout);
        self.send(request, &url).await?;
        Ok(())
    }

    async fn fetch_asset_status(self: &Self, asset: &AssetRef) -> Result<AssetStatus, ApiError> {
        let url = self.endpoint(&[
            "items",
            asset.item_id.as_str(),
            "assets",
            asset.asset_type.as_str(),
        ])?;
        self.get_json(&url).await
    }

    async fn open_byte_stream(self: &Self, location: &Url) -> Result<ByteStream, ApiError> {
        let request = self.authorize(self.client.get(location.clone()), location);
        let response = self.send(request, location).await?;
        let url = location.clone();
        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| transport_error(&e, &url)));
        Ok(Box::pin(stream))
    }
}

impl OrderApi for HttpClient {
    async fn create_order(self: &Self, request: &OrderRequest) -> Result<Order, ApiError> {
        let url = self.endpoint(&["orders"])?;
        let builder = self
            .authorize(self.client.post(url.clone()), &url)
            .json(request)
            .timeout(self.request_timeout);
        let response = self.send(builder, &url).await?;
        decode(response, &url).await
    }

    async fn fetch_order(self: &Self, order_id: &str) -> Result<Order, ApiError> {
        let url = self.endpoint(&["orders", order_id])?;
        self.get_json(&url).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response, url: &Url) -> Result<T, ApiError> {
    let body = response
        .bytes()
        .await
        .map_err(|e| transport_error(&e, url))?;
    serde_json::from_slice(&body)
        .map_err(|e| ApiError::new(ErrorKind::InvalidResponse, url.as_str(), e.to_string()))
}

fn transport_error(err: &reqwest::Error, url: &Url) -> ApiError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_builder() {
        ErrorKind::InvalidRequest
    } else if err.is_decode() {
        ErrorKind::InvalidResponse
    } else {
        ErrorKind::TransientNetwork
    };
    let error = ApiError::new(kind, url.as_str(), err.to_string());
    match err.status() {
        Some(status) => error.with_status(status.as_u16()),
        None => error,
    }
}

async fn error_from_response(response: Response, url: &Url) -> ApiError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    ApiError::new(
        ErrorKind::from_status(status, retry_after),
        url.as_str(),
        error_message(&body),
    )
    .with_status(status)
}

/// Pull the message out of `{"error": {"status": .., "message": ..}}`, falling
/// back to the (truncated) raw body.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<WireError>(body) {
        Ok(wire) => wire.error.message,
        Err(_) => body.chars().take(MAX_ERROR_MESSAGE).collect(),
    }
}

#[derive(Deserialize)]
struct WireError {
    error: WireErrorDetail,
}

#[derive(Deserialize)]
struct WireErrorDetail {
    message: String,
}

/// A results page. Items arrive as `items` or GeoJSON-style `features`; the
/// next link either as a `rel = "next"` entry of `links` or as `_links._next`.
#[derive(Deserialize)]
struct WirePage<T> {
    #[serde(alias = "features")]
    items: Vec<T>,
    #[serde(default)]
    links: Vec<WireLink>,
    #[serde(rename = "_links", default)]
    legacy_links: Option<WireLegacyLinks>,
}

#[derive(Deserialize)]
struct WireLink {
    rel: String,
    href: String,
}

#[derive(Deserialize)]
struct WireLegacyLinks {
    #[serde(rename = "_next", default)]
    next: Option<String>,
}

impl<T> WirePage<T> {
    fn into_page(self, url: &Url) -> Result<Page<T>, ApiError> {
        let href = self
            .links
            .into_iter()
            .find(|link| link.rel == "next")
            .map(|link| link.href)
            .or(self.legacy_links.and_then(|links| links.next))
            .filter(|href| !href.is_empty());
        let next = href
            .map(|href| url.join(&href))
            .transpose()
            .map_err(|e| {
                ApiError::new(
                    ErrorKind::InvalidResponse,
                    url.as_str(),
                    format!("invalid next link: {e}"),
                )
            })?;
        Ok(Page {
            items: self.items,
            next,
        })
    }
}
