/*
 * modelboost - Adaptive model delivery for the temple virtual tour.
 * Copyright (C) 2025  modelboost contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Persistent content cache keyed by URL, with quota-aware eviction of the
//! oldest entries.
//!
//! Each entry is a body file plus a JSON sidecar carrying the write time,
//! both named after the SHA-256 of the URL. There is no shared index, so
//! several handles (the foreground loader and the cache proxy) can use the
//! same store; concurrent writers to one URL are last-write-wins.

use crate::downloader::format_bytes;
use crate::error::{DeliveryError, DeliveryResult};
use chrono::{DateTime, Utc};
use console::style;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, info, warn};

const BODY_EXT: &str = "bin";
const META_EXT: &str = "json";

/// Where the storage quota comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageQuota {
    /// Fixed number of bytes
    Fixed(u64),
    /// Current usage plus free space on the disk holding the cache
    Disk,
}

/// Eviction policy parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachePolicy {
    pub quota: StorageQuota,
    /// Fraction of the quota the cache may fill
    pub high_water: f64,
    /// Most entries removed by one eviction pass, as a fraction of all entries
    pub evict_fraction: f64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            quota: StorageQuota::Disk,
            high_water: 0.8,
            evict_fraction: 0.25,
        }
    }
}

/// Cache entry metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub cached_at: DateTime<Utc>,
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        (self.cache_hits as f64 / total as f64) * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaEstimate {
    pub usage: u64,
    pub quota: u64,
}

/// Result of an eviction or clear
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanResult {
    pub removed_count: usize,
    pub removed_bytes: u64,
}

/// Named on-disk cache store
#[derive(Debug)]
pub struct ContentCache {
    dir: PathBuf,
    name: String,
    policy: CachePolicy,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContentCache {
    /// Open (creating if needed) the store `<root>/<name>`
    pub async fn open(root: &Path, name: &str, policy: CachePolicy) -> DeliveryResult<Self> {
        let dir = root.join(name);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| DeliveryError::filesystem(dir.display().to_string(), e))?;

        Ok(Self {
            dir,
            name: name.to_string(),
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    fn body_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", Self::key(url), BODY_EXT))
    }

    fn meta_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", Self::key(url), META_EXT))
    }

    /// Cached bytes for `url`. Any storage problem reads as a miss.
    pub async fn get(&self, url: &str) -> Option<Vec<u8>> {
        match self.read(url).await {
            Ok(Some(data)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(data)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                debug!(url, error = %e, "cache read failed, treating as miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn read(&self, url: &str) -> DeliveryResult<Option<Vec<u8>>> {
        let Some(entry) = self.entry(url).await? else {
            return Ok(None);
        };
        if entry.url != url {
            return Ok(None);
        }

        let body_path = self.body_path(url);
        let data = match fs::read(&body_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DeliveryError::filesystem(body_path.display().to_string(), e)),
        };

        // Body replaced by a concurrent writer whose metadata has not landed yet
        if data.len() as u64 != entry.size_bytes {
            return Ok(None);
        }
        Ok(Some(data))
    }

    /// Metadata for `url`, if cached
    pub async fn entry(&self, url: &str) -> DeliveryResult<Option<CacheEntry>> {
        read_meta(&self.meta_path(url)).await
    }

    pub async fn contains(&self, url: &str) -> bool {
        matches!(self.entry(url).await, Ok(Some(entry)) if entry.url == url)
    }

    /// Store `data` for `url`. Best-effort: failures are logged, never
    /// returned.
    pub async fn set(&self, url: &str, data: &[u8]) {
        if let Err(e) = self.try_set(url, data).await {
            warn!(url, error = %e, "failed to cache model");
        }
    }

    /// Store with errors reported
    pub async fn try_set(&self, url: &str, data: &[u8]) -> DeliveryResult<()> {
        self.ensure_space(data.len() as u64).await?;

        let entry = CacheEntry {
            url: url.to_string(),
            size_bytes: data.len() as u64,
            content_type: content_type_for(url).to_string(),
            cached_at: Utc::now(),
        };
        let meta = serde_json::to_vec_pretty(&entry).map_err(|e| DeliveryError::cache(e.to_string()))?;

        let body_path = self.body_path(url);
        write_atomic(&body_path, data).await?;
        if let Err(e) = write_atomic(&self.meta_path(url), &meta).await {
            // A body without metadata is invisible to listing and eviction
            let _ = fs::remove_file(&body_path).await;
            return Err(e);
        }

        debug!(url, bytes = data.len(), "cached");
        Ok(())
    }

    /// Explicit invalidation. Returns whether an entry existed.
    pub async fn remove(&self, url: &str) -> bool {
        let existed = self.contains(url).await;
        let _ = fs::remove_file(self.meta_path(url)).await;
        let _ = fs::remove_file(self.body_path(url)).await;
        existed
    }

    /// All readable entries
    pub async fn entries(&self) -> DeliveryResult<Vec<CacheEntry>> {
        let mut dir = fs::read_dir(&self.dir)
            .await
            .map_err(|e| DeliveryError::filesystem(self.dir.display().to_string(), e))?;

        let mut entries = Vec::new();
        loop {
            let next = dir
                .next_entry()
                .await
                .map_err(|e| DeliveryError::filesystem(self.dir.display().to_string(), e))?;
            let Some(item) = next else { break };

            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            match read_meta(&path).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable entry"),
            }
        }

        Ok(entries)
    }

    /// Usage and quota as seen by the eviction policy
    pub async fn estimate(&self) -> DeliveryResult<QuotaEstimate> {
        let usage = self.entries().await?.iter().map(|e| e.size_bytes).sum();
        let quota = match self.policy.quota {
            StorageQuota::Fixed(bytes) => bytes,
            StorageQuota::Disk => usage + disk_available(&self.dir),
        };
        Ok(QuotaEstimate { usage, quota })
    }

    /// Make room for `required` more bytes if the store would pass its high
    /// water mark. Oldest entries go first; one pass removes at most
    /// `evict_fraction` of the entries.
    pub async fn ensure_space(&self, required: u64) -> DeliveryResult<CleanResult> {
        let QuotaEstimate { usage, quota } = self.estimate().await?;
        let threshold = (quota as f64 * self.policy.high_water) as u64;

        if usage + required <= threshold {
            return Ok(CleanResult::default());
        }

        let mut entries = self.entries().await?;
        entries.sort_by(|a, b| a.cached_at.cmp(&b.cached_at).then_with(|| a.url.cmp(&b.url)));

        let max_remove = ((entries.len() as f64 * self.policy.evict_fraction).ceil() as usize).max(1);
        let mut usage = usage;
        let mut result = CleanResult::default();

        for entry in entries.iter().take(max_remove) {
            if usage + required <= threshold {
                break;
            }
            self.remove(&entry.url).await;
            usage = usage.saturating_sub(entry.size_bytes);
            result.removed_count += 1;
            result.removed_bytes += entry.size_bytes;
        }

        info!(
            removed = result.removed_count,
            freed = %format_bytes(result.removed_bytes),
            "evicted oldest cache entries"
        );
        Ok(result)
    }

    /// Clear entire cache, including bodies and temp files left behind by
    /// interrupted writes
    pub async fn clear(&self) -> DeliveryResult<CleanResult> {
        let entries = self.entries().await?;
        let mut result = CleanResult::default();
        for entry in entries {
            if self.remove(&entry.url).await {
                result.removed_count += 1;
                result.removed_bytes += entry.size_bytes;
            }
        }
        result.removed_bytes += self.sweep_orphans().await?;
        Ok(result)
    }

    /// Delete temp files and bodies that have no metadata sidecar. Returns
    /// the bytes freed.
    async fn sweep_orphans(&self) -> DeliveryResult<u64> {
        let mut dir = fs::read_dir(&self.dir)
            .await
            .map_err(|e| DeliveryError::filesystem(self.dir.display().to_string(), e))?;

        let mut freed = 0;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| DeliveryError::filesystem(self.dir.display().to_string(), e))?
        {
            let path = item.path();
            let orphan = match path.extension().and_then(|e| e.to_str()) {
                Some(ext) if ext.starts_with("tmp-") => true,
                Some(BODY_EXT) => !path.with_extension(META_EXT).exists(),
                _ => false,
            };
            if !orphan {
                continue;
            }
            let size = item.metadata().await.map(|m| m.len()).unwrap_or(0);
            if fs::remove_file(&path).await.is_ok() {
                debug!(path = %path.display(), "removed orphaned cache file");
                freed += size;
            }
        }
        Ok(freed)
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries().await.unwrap_or_default();
        CacheStats {
            total_entries: entries.len(),
            total_size_bytes: entries.iter().map(|e| e.size_bytes).sum(),
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            oldest_entry: entries.iter().map(|e| e.cached_at).min(),
            newest_entry: entries.iter().map(|e| e.cached_at).max(),
        }
    }
}

async fn read_meta(path: &Path) -> DeliveryResult<Option<CacheEntry>> {
    match fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| DeliveryError::cache(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DeliveryError::filesystem(path.display().to_string(), e)),
    }
}

/// Write to a temp file next to `path`, then rename over it
async fn write_atomic(path: &Path, data: &[u8]) -> DeliveryResult<()> {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let tmp = path.with_extension(format!("tmp-{}-{}", std::process::id(), nanos));

    fs::write(&tmp, data)
        .await
        .map_err(|e| DeliveryError::filesystem(tmp.display().to_string(), e))?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(DeliveryError::filesystem(path.display().to_string(), e));
    }
    Ok(())
}

/// Free bytes on the disk whose mount point is the longest prefix of `dir`
fn disk_available(dir: &Path) -> u64 {
    let dir = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
        .unwrap_or(0)
}

fn content_type_for(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('.').next() {
        Some("glb") => "model/gltf-binary",
        Some("wasm") => "application/wasm",
        Some("js") => "text/javascript",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// Display cache statistics
pub fn display_cache_stats(name: &str, stats: &CacheStats) {
    println!();
    println!(
        "{} {}",
        style("::").cyan().bold(),
        style(format!("Model Cache '{}'", name)).white().bold()
    );

    println!("   Entries: {}", stats.total_entries);
    println!("   Total Size: {}", format_bytes(stats.total_size_bytes));
    println!("   Cache Hits: {}", stats.cache_hits);
    println!("   Cache Misses: {}", stats.cache_misses);
    println!("   Hit Rate: {:.1}%", stats.hit_rate());

    if let Some(oldest) = stats.oldest_entry {
        println!("   Oldest Entry: {}", oldest.format("%Y-%m-%d %H:%M"));
    }
    if let Some(newest) = stats.newest_entry {
        println!("   Newest Entry: {}", newest.format("%Y-%m-%d %H:%M"));
    }
}
