/*
 * modelboost - Adaptive model delivery for the temple virtual tour.
 * Copyright (C) 2025  modelboost contributors
 */

//! Background cache proxy.
//!
//! Runs on its own task and is reached only through [`ProxyHandle`]
//! messages. Cached assets are served immediately and refreshed behind the
//! caller's back; misses go to the network with retries, and a failed model
//! request falls back to the smallest cached model.

use crate::assets::AssetCatalog;
use crate::cache::ContentCache;
use crate::downloader::{RetryPolicy, Transport};
use crate::error::{DeliveryError, DeliveryResult};
use crate::preload::PreloadReport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

/// Path fragments the proxy intercepts
const INTERCEPTED: [&str; 3] = ["/models/", "/draco/", "/basis/"];
/// Requests under this prefix may fall back to the smallest model
const MODEL_PREFIX: &str = "/models/temple_";

/// Messages the page posts to the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyMessage {
    /// Fetch and cache each URL not already cached. A missing list means
    /// every model; an empty one means nothing.
    PreloadModels {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        models: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    /// Smallest cached model served in place of the one requested
    Fallback,
    /// Not an asset path; fetched without caching
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub url: String,
    pub body: Vec<u8>,
    pub source: ResponseSource,
}

/// Outcome of caching the always-available set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub cached: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct CacheProxy {
    transport: Arc<dyn Transport>,
    cache: Arc<ContentCache>,
    catalog: AssetCatalog,
    retry: RetryPolicy,
}

fn path_of(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

impl CacheProxy {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<ContentCache>,
        catalog: AssetCatalog,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            cache,
            catalog,
            retry,
        }
    }

    /// Whether requests for `url` go through the cache
    pub fn intercepts(url: &str) -> bool {
        let path = path_of(url);
        INTERCEPTED.iter().any(|p| path.contains(p))
    }

    fn is_model(url: &str) -> bool {
        path_of(url).contains(MODEL_PREFIX)
    }

    async fn fetch_once(&self, url: &str) -> DeliveryResult<Vec<u8>> {
        self.transport.get(url, None).await?.collect().await
    }

    async fn fetch_with_retry(&self, url: &str) -> DeliveryResult<Vec<u8>> {
        self.retry
            .run("proxy", |_| self.fetch_once(url))
            .await
    }

    /// Cache the smallest model and the decoder files
    pub async fn install(&self) -> InstallReport {
        let mut report = InstallReport::default();
        for url in self.catalog.always_available() {
            match self.fetch_once(&url).await {
                Ok(body) => {
                    self.cache.set(&url, &body).await;
                    report.cached.push(url);
                }
                Err(e) => {
                    warn!(url, error = %e, "install: failed to cache");
                    report.failed.push((url, e.to_string()));
                }
            }
        }
        info!(
            cached = report.cached.len(),
            failed = report.failed.len(),
            "cache proxy installed"
        );
        report
    }

    /// Answer one intercepted request
    pub async fn handle_request(&self, url: &str) -> DeliveryResult<ProxyResponse> {
        if !Self::intercepts(url) {
            let body = self.fetch_once(url).await?;
            return Ok(ProxyResponse {
                url: url.to_string(),
                body,
                source: ResponseSource::Passthrough,
            });
        }

        if let Some(body) = self.cache.get(url).await {
            self.refresh_in_background(url);
            return Ok(ProxyResponse {
                url: url.to_string(),
                body,
                source: ResponseSource::Cache,
            });
        }

        match self.fetch_with_retry(url).await {
            Ok(body) => {
                self.cache.set(url, &body).await;
                Ok(ProxyResponse {
                    url: url.to_string(),
                    body,
                    source: ResponseSource::Network,
                })
            }
            Err(e) => {
                if Self::is_model(url) {
                    let smallest = &self.catalog.smallest().url;
                    if let Some(body) = self.cache.get(smallest).await {
                        warn!(url, fallback = %smallest, error = %e, "serving smallest cached model");
                        return Ok(ProxyResponse {
                            url: smallest.clone(),
                            body,
                            source: ResponseSource::Fallback,
                        });
                    }
                }
                Err(e)
            }
        }
    }

    /// Re-fetch a cached asset; failures are ignored
    fn refresh_in_background(&self, url: &str) {
        let transport = self.transport.clone();
        let cache = self.cache.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            match transport.get(&url, None).await {
                Ok(response) => match response.collect().await {
                    Ok(body) => cache.set(&url, &body).await,
                    Err(e) => debug!(url, error = %e, "background refresh failed"),
                },
                Err(e) => debug!(url, error = %e, "background refresh failed"),
            }
        });
    }

    /// Fetch and cache each URL that is not cached yet, in order
    pub async fn preload(&self, urls: &[String]) -> PreloadReport {
        let mut report = PreloadReport::default();
        for url in urls {
            if self.cache.contains(url).await {
                report.skipped.push(url.clone());
                continue;
            }
            match self.fetch_once(url).await {
                Ok(body) => {
                    self.cache.set(url, &body).await;
                    report.fetched.push(url.clone());
                }
                Err(e) => {
                    warn!(url, error = %e, "failed to preload");
                    report.failed.push((url.clone(), e.to_string()));
                }
            }
        }
        report
    }

    pub async fn handle_message(&self, message: ProxyMessage) -> PreloadReport {
        match message {
            ProxyMessage::PreloadModels { models } => {
                let urls: Vec<String> = match models {
                    Some(models) => models
                        .iter()
                        .map(|m| self.catalog.resolve(m).unwrap_or_else(|_| m.clone()))
                        .collect(),
                    None => self
                        .catalog
                        .variants()
                        .iter()
                        .map(|v| v.url.clone())
                        .collect(),
                };
                self.preload(&urls).await
            }
        }
    }

    /// Move the proxy onto its own task
    pub fn spawn(self) -> ProxyHandle {
        let (tx, mut rx) = mpsc::channel::<Command>(64);
        let proxy = Arc::new(self);

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let proxy = proxy.clone();
                // Each event gets its own task, as fetch events would
                tokio::spawn(async move {
                    match command {
                        Command::Install { reply } => {
                            let _ = reply.send(proxy.install().await);
                        }
                        Command::Fetch { url, reply } => {
                            let _ = reply.send(proxy.handle_request(&url).await);
                        }
                        Command::Message { message, reply } => {
                            let report = proxy.handle_message(message).await;
                            if let Some(reply) = reply {
                                let _ = reply.send(report);
                            }
                        }
                    }
                });
            }
            debug!("cache proxy stopped");
        });

        ProxyHandle { tx }
    }
}

enum Command {
    Install {
        reply: oneshot::Sender<InstallReport>,
    },
    Fetch {
        url: String,
        reply: oneshot::Sender<DeliveryResult<ProxyResponse>>,
    },
    Message {
        message: ProxyMessage,
        reply: Option<oneshot::Sender<PreloadReport>>,
    },
}

/// Page-side handle to a running proxy
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Install { .. } => write!(f, "Install"),
            Command::Fetch { url, .. } => write!(f, "Fetch({})", url),
            Command::Message { message, .. } => write!(f, "Message({:?})", message),
        }
    }
}

fn gone() -> DeliveryError {
    DeliveryError::Proxy {
        message: "cache proxy is not running".to_string(),
    }
}

impl ProxyHandle {
    async fn send(&self, command: Command) -> DeliveryResult<()> {
        self.tx.send(command).await.map_err(|_| gone())
    }

    pub async fn install(&self) -> DeliveryResult<InstallReport> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Install { reply }).await?;
        rx.await.map_err(|_| gone())
    }

    pub async fn fetch(&self, url: &str) -> DeliveryResult<ProxyResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Fetch {
            url: url.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| gone())?
    }

    /// Fire-and-forget, like `postMessage`
    pub async fn post_message(&self, message: ProxyMessage) -> DeliveryResult<()> {
        self.send(Command::Message {
            message,
            reply: None,
        })
        .await
    }

    /// Post a JSON message such as `{"type":"PRELOAD_MODELS","models":[...]}`
    pub async fn post_json(&self, json: &str) -> DeliveryResult<()> {
        let message: ProxyMessage = serde_json::from_str(json).map_err(|e| DeliveryError::Proxy {
            message: format!("malformed message: {}", e),
        })?;
        self.post_message(message).await
    }

    /// Post a preload message and wait for it to finish
    pub async fn preload(&self, models: Option<Vec<String>>) -> DeliveryResult<PreloadReport> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Message {
            message: ProxyMessage::PreloadModels { models },
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| gone())
    }
}
