/*
 * modelboost - Adaptive model delivery for the temple virtual tour.
 * Copyright (C) 2025  modelboost contributors
 */

//! Background preloading of the quality tiers that were not loaded first.

use crate::assets::{AssetCatalog, AssetVariant};
use crate::cache::ContentCache;
use crate::downloader::ModelDownloader;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// What a preload pass did, per URL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadReport {
    pub fetched: Vec<String>,
    /// Already cached, no request made
    pub skipped: Vec<String>,
    /// URL and error message
    pub failed: Vec<(String, String)>,
}

/// Fetches the remaining variants one at a time, smallest first
pub struct PreloadOrchestrator {
    downloader: ModelDownloader,
    cache: Arc<ContentCache>,
    variants: Vec<AssetVariant>,
    delay: Duration,
}

impl PreloadOrchestrator {
    pub fn new(
        downloader: ModelDownloader,
        cache: Arc<ContentCache>,
        catalog: &AssetCatalog,
        delay: Duration,
    ) -> Self {
        Self {
            downloader,
            cache,
            variants: catalog.variants().to_vec(),
            delay,
        }
    }

    /// Variants other than `current_url`, ascending by size
    pub fn queue(&self, current_url: &str) -> Vec<&AssetVariant> {
        let mut queue: Vec<&AssetVariant> = self
            .variants
            .iter()
            .filter(|v| v.url != current_url)
            .collect();
        queue.sort_by_key(|v| v.approx_bytes);
        queue
    }

    pub async fn run(&self, current_url: &str) -> PreloadReport {
        let mut report = PreloadReport::default();

        for variant in self.queue(current_url) {
            if self.cache.contains(&variant.url).await {
                report.skipped.push(variant.url.clone());
                continue;
            }

            info!(url = %variant.url, quality = variant.label, "preloading in background");
            match self.downloader.download(&variant.url, None).await {
                Ok(data) => {
                    self.cache.set(&variant.url, &data).await;
                    info!(url = %variant.url, "preloaded");
                    report.fetched.push(variant.url.clone());
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => {
                    warn!(url = %variant.url, error = %e, "failed to preload");
                    report.failed.push((variant.url.clone(), e.to_string()));
                }
            }
        }

        report
    }

    /// Run on a detached task so the caller is never blocked
    pub fn spawn(self, current_url: String) -> JoinHandle<PreloadReport> {
        tokio::spawn(async move { self.run(&current_url).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::VariantId;
    use crate::cache::{CachePolicy, StorageQuota};
    use crate::downloader::transport::testing::{payload, MemoryResource, MemoryTransport};
    use crate::downloader::DownloadConfig;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        transport: Arc<MemoryTransport>,
        cache: Arc<ContentCache>,
        catalog: AssetCatalog,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let cache = ContentCache::open(
            dir.path(),
            "model-cache-v1",
            CachePolicy {
                quota: StorageQuota::Fixed(1 << 30),
                ..CachePolicy::default()
            },
        )
        .await
        .unwrap();
        let catalog = AssetCatalog::new("http://tour.test").unwrap();
        let transport = Arc::new(MemoryTransport::new());
        for (i, v) in catalog.variants().iter().enumerate() {
            transport.insert(&v.url, MemoryResource::new(payload(1000 * (i + 1))));
        }
        Fixture {
            _dir: dir,
            transport,
            cache: Arc::new(cache),
            catalog,
        }
    }

    fn orchestrator(f: &Fixture) -> PreloadOrchestrator {
        let downloader = ModelDownloader::new(
            f.transport.clone(),
            DownloadConfig {
                max_concurrent_streams: 2,
                chunk_size: 512,
                ..DownloadConfig::default()
            },
        );
        PreloadOrchestrator::new(downloader, f.cache.clone(), &f.catalog, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_only_missing_variant() {
        let f = fixture().await;
        for id in [VariantId::Tiny, VariantId::Low, VariantId::Compressed] {
            f.cache.set(&f.catalog.get(id).url, b"cached").await;
        }

        let current = f.catalog.get(VariantId::Low).url.clone();
        let report = orchestrator(&f).run(&current).await;

        let original = &f.catalog.get(VariantId::Original).url;
        assert_eq!(report.fetched, vec![original.clone()]);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(f.transport.total_gets(), f.transport.get_count(original));
        assert_eq!(f.cache.get(original).await, Some(payload(4000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_smallest_first_and_failures_do_not_stop() {
        let f = fixture().await;
        let low = f.catalog.get(VariantId::Low).url.clone();
        f.transport.remove(&low);

        let current = f.catalog.get(VariantId::Compressed).url.clone();
        let report = orchestrator(&f).spawn(current).await.unwrap();

        assert_eq!(
            report.fetched,
            vec![
                f.catalog.get(VariantId::Tiny).url.clone(),
                f.catalog.get(VariantId::Original).url.clone(),
            ]
        );
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, low);
        assert!(!f.cache.contains(&low).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pauses_only_after_successful_fetches() {
        let f = fixture().await;
        f.transport.remove(&f.catalog.get(VariantId::Low).url);

        let started = tokio::time::Instant::now();
        let current = f.catalog.get(VariantId::Compressed).url.clone();
        let report = orchestrator(&f).run(&current).await;

        assert_eq!(report.fetched.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_variants_cost_no_delay() {
        let f = fixture().await;
        for v in f.catalog.variants() {
            f.cache.set(&v.url, b"cached").await;
        }

        let started = tokio::time::Instant::now();
        let report = orchestrator(&f).run(&f.catalog.smallest().url).await;

        assert_eq!(report.skipped.len(), 3);
        assert!(report.fetched.is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_queue_excludes_current() {
        let f = fixture().await;
        let o = orchestrator(&f);
        let current = &f.catalog.get(VariantId::Tiny).url;
        let ids: Vec<_> = o.queue(current).iter().map(|v| v.id).collect();
        assert_eq!(
            ids,
            vec![VariantId::Low, VariantId::Compressed, VariantId::Original]
        );
    }
}
