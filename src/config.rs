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

//! Configuration management with validation and defaults.

use crate::cache::{CachePolicy, StorageQuota};
use crate::downloader::{DownloadConfig, RetryPolicy};
use crate::error::{DeliveryError, DeliveryResult};
use crate::quality::{NetworkInfo, DEFAULT_MOBILE_PATTERN};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for modelboost
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub download: DownloadSection,
    pub cache: CacheSection,
    pub quality: QualitySection,
    pub preload: PreloadSection,
    pub proxy: ProxySection,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download: DownloadSection::default(),
            cache: CacheSection::default(),
            quality: QualitySection::default(),
            preload: PreloadSection::default(),
            proxy: ProxySection::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Download engine configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DownloadSection {
    /// Byte-range chunk size
    pub chunk_size: u64,

    /// Parallel chunk streams (0 = adapt to the connection)
    pub max_concurrent_streams: usize,

    pub connect_timeout_secs: u64,

    pub request_timeout_secs: u64,

    /// Abort a body that delivers nothing for this long
    pub stall_timeout_secs: u64,

    pub user_agent: Option<String>,
}

impl Default for DownloadSection {
    fn default() -> Self {
        let defaults = DownloadConfig::default();
        Self {
            chunk_size: defaults.chunk_size,
            max_concurrent_streams: 0,
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
            request_timeout_secs: defaults.request_timeout.as_secs(),
            stall_timeout_secs: defaults.stall_timeout.as_secs(),
            user_agent: None,
        }
    }
}

/// Content cache configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Directory holding every named cache
    pub root: PathBuf,

    pub name: String,

    /// Storage quota in MB (0 = derive from free disk space)
    pub quota_mb: u64,

    pub high_water: f64,

    pub evict_fraction: f64,
}

impl Default for CacheSection {
    fn default() -> Self {
        let policy = CachePolicy::default();
        Self {
            root: dirs::cache_dir()
                .map(|d| d.join("modelboost"))
                .unwrap_or_else(|| PathBuf::from("/tmp/modelboost")),
            name: "model-cache-v1".to_string(),
            quota_mb: 0,
            high_water: policy.high_water,
            evict_fraction: policy.evict_fraction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QualitySection {
    /// Site the model paths are resolved against
    pub base_url: String,

    /// Case-insensitive user-agent pattern that marks a mobile client
    pub mobile_pattern: String,
}

impl Default for QualitySection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            mobile_pattern: DEFAULT_MOBILE_PATTERN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PreloadSection {
    pub enabled: bool,

    /// Pause after each preloaded variant
    pub delay_ms: u64,
}

impl Default for PreloadSection {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub max_retries: u32,

    /// First backoff delay; doubles on each retry
    pub initial_backoff_ms: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (empty = stderr only)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. /etc/modelboost/modelboost.toml (system-wide)
    /// 2. ~/.config/modelboost/config.toml (user)
    /// 3. Environment variables (MODELBOOST_*)
    ///
    /// Logging is configured from the result, so problems with the files are
    /// returned as notes for the caller to log once a subscriber exists.
    pub fn load() -> (Self, Vec<String>) {
        let mut notes = Vec::new();
        let mut config = Config::default();

        config = config.merge_file(Path::new("/etc/modelboost/modelboost.toml"), &mut notes);

        if let Some(config_dir) = dirs::config_dir() {
            config = config.merge_file(
                &config_dir.join("modelboost").join("config.toml"),
                &mut notes,
            );
        }

        (config.apply_overrides(|key| std::env::var(key).ok()), notes)
    }

    /// Merge a TOML file over this config. Missing files are skipped;
    /// unreadable or malformed ones are skipped with a note.
    pub fn merge_file(self, path: &Path, notes: &mut Vec<String>) -> Self {
        if !path.exists() {
            return self;
        }
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                notes.push(format!("unreadable config file {}: {}", path.display(), e));
                return self;
            }
        };
        match toml::from_str::<Config>(&content) {
            Ok(parsed) => self.merge(parsed),
            Err(e) => {
                notes.push(format!(
                    "ignoring malformed config file {}: {}",
                    path.display(),
                    e
                ));
                self
            }
        }
    }

    /// Merge another config into this one (other takes precedence for non-default values)
    fn merge(mut self, other: Config) -> Self {
        let default = Config::default();

        let d = &default.download;
        if other.download.chunk_size != d.chunk_size {
            self.download.chunk_size = other.download.chunk_size;
        }
        if other.download.max_concurrent_streams != d.max_concurrent_streams {
            self.download.max_concurrent_streams = other.download.max_concurrent_streams;
        }
        if other.download.connect_timeout_secs != d.connect_timeout_secs {
            self.download.connect_timeout_secs = other.download.connect_timeout_secs;
        }
        if other.download.request_timeout_secs != d.request_timeout_secs {
            self.download.request_timeout_secs = other.download.request_timeout_secs;
        }
        if other.download.stall_timeout_secs != d.stall_timeout_secs {
            self.download.stall_timeout_secs = other.download.stall_timeout_secs;
        }
        if other.download.user_agent.is_some() {
            self.download.user_agent = other.download.user_agent;
        }

        let c = &default.cache;
        if other.cache.root != c.root {
            self.cache.root = other.cache.root;
        }
        if other.cache.name != c.name {
            self.cache.name = other.cache.name;
        }
        if other.cache.quota_mb != c.quota_mb {
            self.cache.quota_mb = other.cache.quota_mb;
        }
        if other.cache.high_water != c.high_water {
            self.cache.high_water = other.cache.high_water;
        }
        if other.cache.evict_fraction != c.evict_fraction {
            self.cache.evict_fraction = other.cache.evict_fraction;
        }

        if other.quality.base_url != default.quality.base_url {
            self.quality.base_url = other.quality.base_url;
        }
        if other.quality.mobile_pattern != default.quality.mobile_pattern {
            self.quality.mobile_pattern = other.quality.mobile_pattern;
        }

        if other.preload != default.preload {
            self.preload = other.preload;
        }
        if other.proxy != default.proxy {
            self.proxy = other.proxy;
        }

        if other.logging.level != default.logging.level {
            self.logging.level = other.logging.level;
        }
        if other.logging.file.is_some() {
            self.logging.file = other.logging.file;
        }

        self
    }

    /// Apply MODELBOOST_* overrides from `lookup`
    fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("MODELBOOST_BASE_URL") {
            self.quality.base_url = val;
        }

        if let Some(val) = lookup("MODELBOOST_STREAMS") {
            if let Ok(n) = val.parse() {
                self.download.max_concurrent_streams = n;
            }
        }

        if let Some(val) = lookup("MODELBOOST_CHUNK_SIZE") {
            if let Ok(n) = val.parse() {
                self.download.chunk_size = n;
            }
        }

        if let Some(val) = lookup("MODELBOOST_CACHE_DIR") {
            self.cache.root = PathBuf::from(val);
        }

        if let Some(val) = lookup("MODELBOOST_LOG_LEVEL") {
            self.logging.level = val;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> DeliveryResult<()> {
        let invalid = |message: &str| {
            Err(DeliveryError::Config {
                message: message.to_string(),
            })
        };

        if self.download.chunk_size == 0 {
            return invalid("chunk_size must be at least 1 byte");
        }
        if self.download.max_concurrent_streams > 64 {
            return invalid("max_concurrent_streams must be at most 64");
        }
        if !(self.cache.high_water > 0.0 && self.cache.high_water <= 1.0) {
            return invalid("high_water must be in (0, 1]");
        }
        if !(self.cache.evict_fraction > 0.0 && self.cache.evict_fraction <= 1.0) {
            return invalid("evict_fraction must be in (0, 1]");
        }
        if url::Url::parse(&self.quality.base_url).is_err() {
            return invalid("base_url must be an absolute URL");
        }
        Ok(())
    }

    /// Engine settings; a stream count of 0 adapts to `network`
    pub fn download_config(&self, network: &NetworkInfo) -> DownloadConfig {
        let mut config = DownloadConfig::for_network(network);
        if self.download.max_concurrent_streams > 0 {
            config.max_concurrent_streams = self.download.max_concurrent_streams;
        }
        config.chunk_size = self.download.chunk_size;
        config.connect_timeout = Duration::from_secs(self.download.connect_timeout_secs);
        config.request_timeout = Duration::from_secs(self.download.request_timeout_secs);
        config.stall_timeout = Duration::from_secs(self.download.stall_timeout_secs);
        if let Some(agent) = &self.download.user_agent {
            config.user_agent = agent.clone();
        }
        config
    }

    pub fn cache_policy(&self) -> CachePolicy {
        let quota = if self.cache.quota_mb == 0 {
            StorageQuota::Disk
        } else {
            StorageQuota::Fixed(self.cache.quota_mb * 1024 * 1024)
        };
        CachePolicy {
            quota,
            high_water: self.cache.high_water,
            evict_fraction: self.cache.evict_fraction,
        }
    }

    pub fn proxy_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.proxy.max_retries,
            Duration::from_millis(self.proxy.initial_backoff_ms),
        )
    }

    pub fn preload_delay(&self) -> Duration {
        Duration::from_millis(self.preload.delay_ms)
    }
}
