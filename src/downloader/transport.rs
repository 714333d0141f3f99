/*
 * modelboost - Adaptive model delivery for the temple virtual tour.
 * Copyright (C) 2025  modelboost contributors
 */

//! HTTP transport seam. The engine and the cache proxy only ever talk to
//! `dyn Transport`, so they can be driven by reqwest or by a test double.

use super::DownloadConfig;
use crate::error::{DeliveryError, DeliveryResult};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{header, Client};
use std::pin::Pin;
use std::time::Duration;

/// Body of a response, delivered as it arrives
pub type ByteStream = Pin<Box<dyn Stream<Item = DeliveryResult<Vec<u8>>> + Send>>;

/// Inclusive byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// HTTP Range header value
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Metadata from a HEAD request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceInfo {
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
}

pub struct FetchResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// Largest buffer reserved up front from an advertised length
pub(crate) const PREALLOC_LIMIT: u64 = 8 * 1024 * 1024;

/// Initial capacity for a body of `advertised` bytes. The header is not
/// trusted beyond `PREALLOC_LIMIT`; the buffer grows as data arrives.
pub(crate) fn initial_capacity(advertised: u64) -> usize {
    advertised.min(PREALLOC_LIMIT) as usize
}

impl FetchResponse {
    /// Drain the body into one buffer
    pub async fn collect(mut self) -> DeliveryResult<Vec<u8>> {
        let mut data = Vec::with_capacity(initial_capacity(self.content_length.unwrap_or(0)));
        while let Some(segment) = self.body.next().await {
            data.extend_from_slice(&segment?);
        }
        Ok(data)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Metadata-only request
    async fn head(&self, url: &str) -> DeliveryResult<ResourceInfo>;

    /// GET, optionally range-qualified. Non-success statuses are errors.
    async fn get(&self, url: &str, range: Option<ByteRange>) -> DeliveryResult<FetchResponse>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &DownloadConfig) -> DeliveryResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.max_concurrent_streams.max(1))
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .tcp_nodelay(true)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| DeliveryError::Config {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }
}

fn header_u64(headers: &header::HeaderMap, name: header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn head(&self, url: &str) -> DeliveryResult<ResourceInfo> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| DeliveryError::network(url, e.to_string()))?;

        if !response.status().is_success() {
            return Err(DeliveryError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        // HEAD bodies are empty, so read the header rather than the size hint
        let content_length = header_u64(response.headers(), header::CONTENT_LENGTH);
        let accept_ranges = response
            .headers()
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("bytes"))
            .unwrap_or(false);

        Ok(ResourceInfo {
            content_length,
            accept_ranges,
        })
    }

    async fn get(&self, url: &str, range: Option<ByteRange>) -> DeliveryResult<FetchResponse> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(header::RANGE, range.header_value());
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::network(url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_length = header_u64(response.headers(), header::CONTENT_LENGTH);
        let owned_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| DeliveryError::network(owned_url.clone(), e.to_string()))
            })
            .boxed();

        Ok(FetchResponse {
            status: status.as_u16(),
            content_length,
            body,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_byte_range_header() {
        let r = ByteRange { start: 0, end: 1023 };
        assert_eq!(r.len(), 1024);
        assert_eq!(r.header_value(), "bytes=0-1023");
    }

    #[tokio::test]
    async fn test_memory_transport_range_and_collect() {
        let transport = MemoryTransport::new();
        transport.insert("mem://a", MemoryResource::new(payload(5000)));

        let response = transport
            .get("mem://a", Some(ByteRange { start: 100, end: 199 }))
            .await
            .unwrap();
        assert_eq!(response.status, 206);
        let body = response.collect().await.unwrap();
        assert_eq!(body, payload(5000)[100..200].to_vec());

        let missing = transport.get("mem://missing", None).await;
        assert!(matches!(
            missing,
            Err(DeliveryError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_collect_ignores_oversized_length() {
        let transport = MemoryTransport::new();
        let mut resource = MemoryResource::new(payload(10));
        resource.advertised_length = Some(Some(u64::MAX / 2));
        transport.insert("mem://liar", resource);

        let response = transport.get("mem://liar", None).await.unwrap();
        assert_eq!(response.content_length, Some(u64::MAX / 2));
        assert_eq!(response.collect().await.unwrap(), payload(10));
        assert_eq!(initial_capacity(u64::MAX), PREALLOC_LIMIT as usize);
        assert_eq!(initial_capacity(100), 100);
    }
}
