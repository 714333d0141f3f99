/*
 * modelboost - Adaptive model delivery for the temple virtual tour.
 * Copyright (C) 2025  modelboost contributors
 */

//! Download progress snapshots, delivered as a stream of events.

use super::segment::ChunkProgress;
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// State of one in-flight download
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    /// Bytes received so far
    pub loaded: u64,
    /// Total expected bytes, 0 if unknown
    pub total: u64,
    pub chunks: Vec<ChunkProgress>,
}

impl DownloadProgress {
    pub fn ratio(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.loaded as f64 / self.total as f64)
        }
    }

    pub fn completed_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.completed).count()
    }

    /// One-line status, falling back to raw bytes when the total is unknown
    pub fn describe(&self) -> String {
        let chunks_info = if self.chunks.len() > 1 {
            format!(" ({}/{} chunks)", self.completed_chunks(), self.chunks.len())
        } else {
            String::new()
        };

        match self.ratio() {
            Some(ratio) => format!("Downloading {:.1}%{}", ratio * 100.0, chunks_info),
            None => format!(
                "Downloading… {} MB{}",
                (self.loaded as f64 / 1024.0 / 1024.0).round() as u64,
                chunks_info
            ),
        }
    }
}

/// Producer side of a progress stream
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<DownloadProgress>,
}

/// Consumer side: a `Stream<Item = DownloadProgress>`
pub type ProgressStream = UnboundedReceiverStream<DownloadProgress>;

/// Create a connected sender/stream pair
pub fn channel() -> (ProgressSender, ProgressStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, UnboundedReceiverStream::new(rx))
}

impl ProgressSender {
    fn send(&self, progress: DownloadProgress) {
        // A consumer that stopped listening does not affect the download
        let _ = self.tx.send(progress);
    }
}

/// Shared per-download progress state. Updates and sends happen under one
/// lock, so consumers always see a non-decreasing `loaded`.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    state: Mutex<DownloadProgress>,
    sink: Option<ProgressSender>,
}

impl ProgressTracker {
    pub fn new(total: u64, chunks: Vec<ChunkProgress>, sink: Option<ProgressSender>) -> Self {
        Self {
            state: Mutex::new(DownloadProgress {
                loaded: 0,
                total,
                chunks,
            }),
            sink,
        }
    }

    /// Account for `bytes` more received on chunk `id`
    pub fn record(&self, id: usize, bytes: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(chunk) = state.chunks.get_mut(id) {
            chunk.loaded += bytes;
        }
        state.loaded = state.chunks.iter().map(|c| c.loaded).sum();
        self.emit(&state);
    }

    pub fn complete(&self, id: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(chunk) = state.chunks.get_mut(id) {
            chunk.completed = true;
        }
        self.emit(&state);
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> DownloadProgress {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn emit(&self, state: &DownloadProgress) {
        if let Some(sink) = &self.sink {
            sink.send(state.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn chunk(id: usize, start: u64, end: u64) -> ChunkProgress {
        ChunkProgress {
            id,
            start,
            end,
            loaded: 0,
            completed: false,
        }
    }

    #[test]
    fn test_describe() {
        let mut p = DownloadProgress {
            loaded: 512,
            total: 1024,
            chunks: vec![chunk(0, 0, 511), chunk(1, 512, 1023)],
        };
        p.chunks[0].completed = true;
        assert_eq!(p.describe(), "Downloading 50.0% (1/2 chunks)");

        let unknown = DownloadProgress {
            loaded: 3 * 1024 * 1024,
            total: 0,
            chunks: vec![chunk(0, 0, 0)],
        };
        assert_eq!(unknown.ratio(), None);
        assert_eq!(unknown.describe(), "Downloading… 3 MB");
    }

    #[tokio::test]
    async fn test_tracker_sums_chunks() {
        let (tx, stream) = channel();
        let tracker = ProgressTracker::new(
            300,
            vec![chunk(0, 0, 99), chunk(1, 100, 199), chunk(2, 200, 299)],
            Some(tx),
        );

        tracker.record(2, 50);
        tracker.record(0, 100);
        tracker.complete(0);
        tracker.record(1, 30);
        drop(tracker);

        let events: Vec<DownloadProgress> = stream.collect().await;
        let loaded: Vec<u64> = events.iter().map(|e| e.loaded).collect();
        assert_eq!(loaded, vec![50, 150, 150, 180]);
        assert_eq!(events.last().unwrap().completed_chunks(), 1);
    }

    #[test]
    fn test_dropped_consumer_is_ignored() {
        let (tx, stream) = channel();
        drop(stream);
        let tracker = ProgressTracker::new(10, vec![chunk(0, 0, 9)], Some(tx));
        tracker.record(0, 10);
        assert_eq!(tracker.snapshot().loaded, 10);
    }
}
