/*
 * modelboost - Adaptive model delivery for the temple virtual tour.
 * Copyright (C) 2025  modelboost contributors
 */

//! Core download engine with chunked parallel downloads.

use super::{
    limiter::ConcurrencyLimiter,
    progress::{ProgressSender, ProgressTracker},
    retry::RetryPolicy,
    segment::{plan_chunks, ChunkProgress, ChunkRange},
    transport::{initial_capacity, ResourceInfo, Transport},
    DownloadConfig,
};
use crate::error::{DeliveryError, DeliveryResult};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, Instrument};

/// Downloads one resource into memory, in parallel chunks when the server
/// allows it.
#[derive(Clone)]
pub struct ModelDownloader {
    transport: Arc<dyn Transport>,
    config: DownloadConfig,
    retry: RetryPolicy,
}

impl ModelDownloader {
    pub fn new(transport: Arc<dyn Transport>, config: DownloadConfig) -> Self {
        Self {
            transport,
            config,
            retry: RetryPolicy::none(),
        }
    }

    /// Retry policy applied to establishing each request
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Download `url`, choosing the chunked path when ranges are supported
    pub async fn download(
        &self,
        url: &str,
        progress: Option<ProgressSender>,
    ) -> DeliveryResult<Vec<u8>> {
        let span = crate::span_download!(url);
        async move {
            let start_time = Instant::now();

            let size = if self.config.max_concurrent_streams > 1 {
                self.probe(url)
                    .await
                    .filter(|info| info.accept_ranges)
                    .and_then(|info| info.content_length)
                    .filter(|size| *size > 0)
            } else {
                None
            };
            let chunked = size.is_some();

            let data = match size {
                Some(size) => self.fetch_chunks(url, size, progress).await?,
                // Without a known length progress falls back to byte counts
                None => self.download_streaming(url, progress).await?,
            };

            let elapsed = start_time.elapsed();
            info!(
                bytes = data.len(),
                chunked,
                elapsed_ms = elapsed.as_millis() as u64,
                "download complete"
            );
            Ok(data)
        }
        .instrument(span)
        .await
    }

    /// HEAD metadata for `url`. Failures count as "nothing known".
    pub async fn probe(&self, url: &str) -> Option<ResourceInfo> {
        match self.transport.head(url).await {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(error = %e, "range probe failed, assuming no range support");
                None
            }
        }
    }

    /// Whether the server advertises byte ranges
    pub async fn probe_range_support(&self, url: &str) -> bool {
        self.probe(url).await.is_some_and(|info| info.accept_ranges)
    }

    /// Parallel download of fixed-size ranges, reassembled by index
    pub async fn download_chunked(
        &self,
        url: &str,
        progress: Option<ProgressSender>,
    ) -> DeliveryResult<Vec<u8>> {
        let info = self.transport.head(url).await?;
        let size = info
            .content_length
            .filter(|s| *s > 0)
            .ok_or_else(|| DeliveryError::UnknownSize {
                url: url.to_string(),
            })?;
        self.fetch_chunks(url, size, progress).await
    }

    async fn fetch_chunks(
        &self,
        url: &str,
        size: u64,
        progress: Option<ProgressSender>,
    ) -> DeliveryResult<Vec<u8>> {
        let plan = plan_chunks(size, self.config.chunk_size);
        debug!(
            size,
            chunks = plan.len(),
            streams = self.config.max_concurrent_streams,
            "starting chunked download"
        );

        let tracker = Arc::new(ProgressTracker::new(
            size,
            plan.iter().map(ChunkProgress::from).collect(),
            progress,
        ));
        let limiter = ConcurrencyLimiter::new(self.config.max_concurrent_streams);

        let mut join_set: JoinSet<DeliveryResult<(usize, Vec<u8>)>> = JoinSet::new();

        for chunk in plan.iter().copied() {
            let transport = self.transport.clone();
            let limiter = limiter.clone();
            let tracker = tracker.clone();
            let retry = self.retry.clone();
            let stall_timeout = self.config.stall_timeout;
            let url = url.to_string();

            join_set.spawn(async move {
                let chunk_error = |message: String| DeliveryError::ChunkFailed {
                    url: url.clone(),
                    index: chunk.id,
                    message,
                };

                let _permit = limiter
                    .acquire()
                    .await
                    .map_err(|e| chunk_error(e.to_string()))?;
                debug!(chunk = chunk.id, active = limiter.active(), "chunk started");

                let data = download_chunk(
                    transport.as_ref(),
                    &url,
                    chunk,
                    &tracker,
                    &retry,
                    stall_timeout,
                )
                .await
                .map_err(|e| chunk_error(e.to_string()))?;

                Ok((chunk.id, data))
            });
        }

        let mut parts: Vec<Option<Vec<u8>>> = vec![None; plan.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok((id, data))) => parts[id] = Some(data),
                Ok(Err(e)) => {
                    // Remaining chunk tasks are aborted when join_set drops
                    return Err(e);
                }
                Err(e) => {
                    return Err(DeliveryError::network(url, format!("chunk task died: {}", e)));
                }
            }
        }

        debug!(pool = limiter.size(), peak = limiter.peak(), "all chunks received");

        // Every part was checked against its planned size, so `size` bytes are in hand
        let mut result = Vec::with_capacity(size as usize);
        for (index, part) in parts.into_iter().enumerate() {
            let part = part.ok_or(DeliveryError::MissingChunk { index })?;
            result.extend_from_slice(&part);
        }

        Ok(result)
    }

    /// Single-request download reporting progress per received segment
    pub async fn download_streaming(
        &self,
        url: &str,
        progress: Option<ProgressSender>,
    ) -> DeliveryResult<Vec<u8>> {
        let transport = self.transport.as_ref();
        let response = self
            .retry
            .run("stream", move |_| transport.get(url, None))
            .await?;

        let total = response.content_length.unwrap_or(0);
        let tracker = ProgressTracker::new(
            total,
            vec![ChunkProgress {
                id: 0,
                start: 0,
                end: total.saturating_sub(1),
                loaded: 0,
                completed: false,
            }],
            progress,
        );

        let mut stream = response.body;
        let mut data = Vec::with_capacity(initial_capacity(total));

        loop {
            match timeout(self.config.stall_timeout, stream.next()).await {
                Ok(Some(Ok(segment))) => {
                    if total > 0 && (data.len() + segment.len()) as u64 > total {
                        return Err(DeliveryError::network(
                            url,
                            format!("server sent more than the advertised {} bytes", total),
                        ));
                    }
                    data.extend_from_slice(&segment);
                    tracker.record(0, segment.len() as u64);
                }
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => break,
                Err(_) => return Err(DeliveryError::network(url, "download stalled")),
            }
        }

        if total > 0 && data.len() as u64 != total {
            return Err(DeliveryError::network(
                url,
                format!("short body: got {} of {} bytes", data.len(), total),
            ));
        }

        tracker.complete(0);
        Ok(data)
    }
}

/// Fetch one chunk; the body must match the planned range exactly
async fn download_chunk(
    transport: &dyn Transport,
    url: &str,
    chunk: ChunkRange,
    tracker: &ProgressTracker,
    retry: &RetryPolicy,
    stall_timeout: Duration,
) -> DeliveryResult<Vec<u8>> {
    let range = chunk.range();
    let response = retry
        .run("chunk", move |_| transport.get(url, Some(range)))
        .await?;

    let expected = chunk.size();
    let mut stream = response.body;
    let mut data = Vec::with_capacity(expected as usize);

    loop {
        match timeout(stall_timeout, stream.next()).await {
            Ok(Some(Ok(segment))) => {
                if (data.len() + segment.len()) as u64 > expected {
                    return Err(DeliveryError::network(
                        url,
                        format!("server sent more than the {} bytes requested", expected),
                    ));
                }
                data.extend_from_slice(&segment);
                tracker.record(chunk.id, segment.len() as u64);
            }
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => break,
            Err(_) => return Err(DeliveryError::network(url, "download stalled")),
        }
    }

    if data.len() as u64 != expected {
        return Err(DeliveryError::network(
            url,
            format!("short chunk: got {} of {} bytes", data.len(), expected),
        ));
    }

    tracker.complete(chunk.id);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::super::progress;
    use super::super::transport::testing::{payload, MemoryResource, MemoryTransport};
    use super::super::transport::HttpTransport;
    use super::*;
    use super::super::progress::DownloadProgress;

    const URL: &str = "mem://models/temple_low.glb";

    fn downloader(transport: Arc<MemoryTransport>, streams: usize, chunk_size: u64) -> ModelDownloader {
        ModelDownloader::new(
            transport,
            DownloadConfig {
                max_concurrent_streams: streams,
                chunk_size,
                ..DownloadConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_chunked_matches_original() {
        let data = payload(100_003);
        for chunk_size in [1_000u64, 4_096, 33_334, 100_003, 250_000] {
            let transport = Arc::new(MemoryTransport::new());
            transport.insert(URL, MemoryResource::new(data.clone()));

            let result = downloader(transport.clone(), 4, chunk_size)
                .download(URL, None)
                .await
                .unwrap();
            assert_eq!(result, data, "chunk size {}", chunk_size);
            assert_eq!(
                transport.get_count(URL) as u64,
                100_003u64.div_ceil(chunk_size)
            );
        }
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_bounded() {
        let data = payload(50_000);
        let transport = Arc::new(MemoryTransport::new());
        let mut resource = MemoryResource::new(data.clone());
        resource.segment_size = 700;
        transport.insert(URL, resource);

        let (tx, stream) = progress::channel();
        let result = downloader(transport, 3, 8_000)
            .download(URL, Some(tx))
            .await
            .unwrap();
        assert_eq!(result.len(), data.len());

        let events: Vec<DownloadProgress> = stream.collect().await;
        assert!(!events.is_empty());
        assert!(events.windows(2).all(|w| w[0].loaded <= w[1].loaded));
        assert!(events.iter().all(|e| e.total == 50_000 && e.loaded <= e.total));

        let last = events.last().unwrap();
        assert_eq!(last.loaded, 50_000);
        assert_eq!(last.chunks.len(), 7);
        assert_eq!(last.completed_chunks(), 7);
    }

    #[tokio::test]
    async fn test_no_range_support_uses_streaming() {
        let data = payload(64_000);

        let ranged = Arc::new(MemoryTransport::new());
        ranged.insert(URL, MemoryResource::new(data.clone()));
        let chunked_result = downloader(ranged, 4, 10_000)
            .download(URL, None)
            .await
            .unwrap();

        let plain = Arc::new(MemoryTransport::new());
        plain.insert(URL, MemoryResource::new(data.clone()).without_ranges());
        let (tx, stream) = progress::channel();
        let streamed_result = downloader(plain.clone(), 4, 10_000)
            .download(URL, Some(tx))
            .await
            .unwrap();

        assert_eq!(plain.get_count(URL), 1);
        assert_eq!(streamed_result, chunked_result);
        assert_eq!(streamed_result, data);

        let events: Vec<DownloadProgress> = stream.collect().await;
        assert!(events.iter().all(|e| e.chunks.len() == 1));
        assert_eq!(events.last().unwrap().loaded, 64_000);
    }

    #[tokio::test]
    async fn test_single_stream_skips_probe() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert(URL, MemoryResource::new(payload(20_000)));

        let result = downloader(transport.clone(), 1, 1_000)
            .download(URL, None)
            .await
            .unwrap();
        assert_eq!(result.len(), 20_000);
        assert_eq!(transport.head_count(), 0);
        assert_eq!(transport.get_count(URL), 1);
    }

    #[tokio::test]
    async fn test_failed_chunk_fails_download() {
        let transport = Arc::new(MemoryTransport::new());
        let mut resource = MemoryResource::new(payload(50_000));
        // second of five chunks
        resource.fail_range_start = Some(10_000);
        transport.insert(URL, resource);

        let err = downloader(transport, 5, 10_000)
            .download(URL, None)
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::ChunkFailed { index: 1, .. }));
        assert_eq!(err.chunk_index(), Some(1));
    }

    #[tokio::test]
    async fn test_retry_policy_recovers_request() {
        let transport = Arc::new(MemoryTransport::new());
        let mut resource = MemoryResource::new(payload(30_000));
        resource.failures_before_success = 1;
        transport.insert(URL, resource);

        let result = downloader(transport, 1, 10_000)
            .with_retry(RetryPolicy::exponential(2, Duration::from_millis(1)))
            .download(URL, None)
            .await
            .unwrap();
        assert_eq!(result, payload(30_000));
    }

    #[tokio::test]
    async fn test_unknown_size_is_rejected_for_chunks() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert(URL, MemoryResource::new(Vec::new()));

        let err = downloader(transport, 4, 1_000)
            .download_chunked(URL, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::UnknownSize { .. }));
    }

    #[tokio::test]
    async fn test_ranges_without_length_stream_instead() {
        let data = payload(1_000);
        let transport = Arc::new(MemoryTransport::new());
        let mut resource = MemoryResource::new(data.clone());
        resource.advertised_length = Some(None);
        transport.insert(URL, resource);

        let (tx, stream) = progress::channel();
        let result = downloader(transport.clone(), 4, 100)
            .download(URL, Some(tx))
            .await
            .unwrap();
        assert_eq!(result, data);
        assert_eq!(transport.head_count(), 1);
        assert_eq!(transport.get_count(URL), 1);

        let events: Vec<DownloadProgress> = stream.collect().await;
        assert!(events.iter().all(|e| e.total == 0 && e.ratio().is_none()));
        assert_eq!(events.last().unwrap().loaded, 1_000);
    }

    #[tokio::test]
    async fn test_chunked_path_sends_one_head() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert(URL, MemoryResource::new(payload(5_000)));

        downloader(transport.clone(), 2, 1_000)
            .download(URL, None)
            .await
            .unwrap();
        assert_eq!(transport.head_count(), 1);
        assert_eq!(transport.get_count(URL), 5);
    }

    #[tokio::test]
    async fn test_oversized_length_is_not_preallocated() {
        let transport = Arc::new(MemoryTransport::new());
        let mut resource = MemoryResource::new(payload(10));
        resource.advertised_length = Some(Some(u64::MAX / 2));
        transport.insert(URL, resource);

        let err = downloader(transport, 1, 1_000)
            .download(URL, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Network { .. }));
    }

    #[tokio::test]
    async fn test_body_longer_than_length_is_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let mut resource = MemoryResource::new(payload(5_000));
        resource.advertised_length = Some(Some(4_000));
        transport.insert(URL, resource);

        let (tx, stream) = progress::channel();
        let err = downloader(transport, 1, 1_000)
            .download(URL, Some(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Network { .. }));

        let events: Vec<DownloadProgress> = stream.collect().await;
        assert!(events.iter().all(|e| e.loaded <= e.total));
    }

    #[tokio::test]
    async fn test_probe_failure_means_no_ranges() {
        let transport = Arc::new(MemoryTransport::new());
        let d = downloader(transport, 4, 1_000);
        assert_eq!(d.probe("mem://missing.glb").await, None);
        assert!(!d.probe_range_support("mem://missing.glb").await);

        let unreachable = ModelDownloader::new(
            Arc::new(HttpTransport::new(&DownloadConfig::default()).unwrap()),
            DownloadConfig::default(),
        );
        assert_eq!(
            unreachable
                .probe("http://127.0.0.1:1/models/temple_tiny.glb")
                .await,
            None
        );
    }

    mod http {
        use super::*;
        use hyper::service::{make_service_fn, service_fn};
        use hyper::{Body, Method, Request, Response, Server, StatusCode};
        use std::convert::Infallible;
        use std::net::SocketAddr;

        fn respond(data: &[u8], ranges: bool, req: &Request<Body>) -> Response<Body> {
            let range = req
                .headers()
                .get("range")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("bytes="))
                .and_then(|v| v.split_once('-'))
                .and_then(|(s, e)| Some((s.parse::<usize>().ok()?, e.parse::<usize>().ok()?)));

            let mut builder = Response::builder();
            if ranges {
                builder = builder.header("accept-ranges", "bytes");
            }

            match range {
                Some((start, end)) if ranges && req.method() == Method::GET => {
                    let end = end.min(data.len() - 1);
                    builder
                        .status(StatusCode::PARTIAL_CONTENT)
                        .header(
                            "content-range",
                            format!("bytes {}-{}/{}", start, end, data.len()),
                        )
                        .body(Body::from(data[start..=end].to_vec()))
                        .unwrap()
                }
                _ => builder
                    .header("content-length", data.len())
                    .body(Body::from(data.to_vec()))
                    .unwrap(),
            }
        }

        async fn serve(data: Vec<u8>, ranges: bool) -> SocketAddr {
            let data = Arc::new(data);
            let make = make_service_fn(move |_| {
                let data = data.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                        let data = data.clone();
                        async move { Ok::<_, Infallible>(respond(&data, ranges, &req)) }
                    }))
                }
            });

            let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make);
            let addr = server.local_addr();
            tokio::spawn(server);
            addr
        }

        fn http_downloader(streams: usize) -> ModelDownloader {
            let config = DownloadConfig {
                max_concurrent_streams: streams,
                chunk_size: 16 * 1024,
                ..DownloadConfig::default()
            };
            ModelDownloader::new(Arc::new(HttpTransport::new(&config).unwrap()), config)
        }

        #[tokio::test]
        async fn test_http_chunked_and_streaming_agree() {
            let data = payload(100_000);

            let ranged = serve(data.clone(), true).await;
            let url = format!("http://{}/models/temple_tiny.glb", ranged);
            let d = http_downloader(4);
            assert!(d.probe(&url).await.unwrap().accept_ranges);
            assert_eq!(d.download(&url, None).await.unwrap(), data);

            let plain = serve(data.clone(), false).await;
            let url = format!("http://{}/models/temple_tiny.glb", plain);
            assert!(!d.probe(&url).await.unwrap().accept_ranges);
            assert_eq!(d.download(&url, None).await.unwrap(), data);
        }
    }
}
