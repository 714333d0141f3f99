/*
 * modelboost - Adaptive model delivery for the temple virtual tour.
 * Copyright (C) 2025  modelboost contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Model download engine: range probing, chunked parallel downloads under a
//! concurrency limiter, and a streaming fallback.

mod engine;
pub mod limiter;
pub mod progress;
pub mod retry;
mod segment;
pub mod transport;

pub use engine::ModelDownloader;
pub use retry::RetryPolicy;
pub use transport::{HttpTransport, Transport};

use crate::quality::NetworkInfo;
use std::time::Duration;

/// Configuration for the download engine
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Chunks in flight at once; 1 forces the streaming path
    pub max_concurrent_streams: usize,
    /// Size of each byte-range chunk
    pub chunk_size: u64,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout
    pub request_timeout: Duration,
    /// Give up on a body that delivers nothing for this long
    pub stall_timeout: Duration,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 2,
            chunk_size: 5 * 1024 * 1024, // 5 MiB
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            stall_timeout: Duration::from_secs(30),
            user_agent: concat!("modelboost/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DownloadConfig {
    /// Defaults with the stream count adapted to the connection class
    pub fn for_network(network: &NetworkInfo) -> Self {
        Self {
            max_concurrent_streams: network.default_streams(),
            ..Self::default()
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
