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

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use console::style;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod logging;
mod assets;
mod cache;
mod config;
mod downloader;
mod error;
mod preload;
mod proxy;
mod quality;

use assets::AssetCatalog;
use cache::ContentCache;
use config::Config;
use downloader::{format_bytes, HttpTransport, ModelDownloader, Transport};
use preload::PreloadOrchestrator;
use proxy::{CacheProxy, ResponseSource};
use quality::{ClientSignals, EffectiveType, NetworkInfo, QualityOverride, QualitySelector};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Copyright (C) 2025  modelboost contributors\n",
    "License GPLv3+: GNU GPL version 3 or later <https://gnu.org/licenses/gpl.html>\n\n",
    "This is free software; you are free to change and redistribute it.\n",
    "There is NO WARRANTY, to the extent permitted by law."
);

#[derive(Parser)]
#[command(name = "modelboost")]
#[command(version = VERSION)]
#[command(long_version = LONG_VERSION)]
#[command(about = "Adaptive 3D model delivery for the temple virtual tour.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, help = "Site base URL (overrides config)")]
    base_url: Option<String>,

    #[arg(short, long, global = true, help = "Log level (trace, debug, info, warn, error)")]
    log_level: Option<String>,
}

/// Client signals as the page would observe them
#[derive(clap::Args, Debug, Clone, Default)]
struct SignalArgs {
    #[arg(long, help = "Page URL; its ?model= parameter overrides selection")]
    page_url: Option<String>,

    #[arg(long, help = "Data saver is on")]
    save_data: bool,

    #[arg(long, default_value = "", help = "Client user agent")]
    user_agent: String,

    #[arg(long, help = "Effective connection type (slow-2g, 2g, 3g, 4g)")]
    effective_type: Option<EffectiveType>,

    #[arg(long, help = "Measured downlink in Mbps")]
    downlink: Option<f64>,
}

impl SignalArgs {
    fn signals(&self) -> Result<ClientSignals> {
        let manual_override = match &self.page_url {
            Some(raw) => {
                let url = url::Url::parse(raw).with_context(|| format!("invalid page URL '{}'", raw))?;
                QualityOverride::from_page_url(&url)
            }
            None => None,
        };
        Ok(ClientSignals {
            manual_override,
            save_data: self.save_data,
            user_agent: self.user_agent.clone(),
            network: NetworkInfo::from_parts(self.effective_type, self.downlink),
        })
    }
}

#[derive(Subcommand)]
enum Command {
    /// Pick a variant, download it with progress and cache it
    Load {
        #[command(flatten)]
        signals: SignalArgs,

        #[arg(short, long, help = "Write the model to this file")]
        output: Option<PathBuf>,

        #[arg(long, help = "Preload the remaining variants afterwards")]
        preload: bool,
    },
    /// Print which variant would be loaded first and why
    Select {
        #[command(flatten)]
        signals: SignalArgs,

        #[arg(long, help = "Ask the server whether it supports byte ranges")]
        probe: bool,
    },
    /// Inspect or manage the model cache
    Cache {
        #[arg(long)]
        list: bool,
        #[arg(long)]
        stats: bool,
        #[arg(long)]
        clear: bool,
        #[arg(long, value_name = "URL")]
        remove: Option<String>,
    },
    /// Drive the background cache proxy
    Proxy {
        #[arg(long, help = "Cache the smallest model and decoder files")]
        install: bool,
        #[arg(long, num_args = 0.., value_name = "URL", help = "Preload models (none = all)")]
        preload: Option<Vec<String>>,
        #[arg(long, num_args = 1.., value_name = "PATH", help = "Request assets through the proxy")]
        fetch: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, notes) = Config::load();
    if let Some(base_url) = &cli.base_url {
        config.quality.base_url = base_url.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    logging::init_with_file(&config.logging.level, config.logging.file.as_deref());
    for note in &notes {
        tracing::warn!("{}", note);
    }
    config.validate().context("invalid configuration")?;

    let catalog = AssetCatalog::new(&config.quality.base_url)
        .with_context(|| format!("invalid base URL '{}'", config.quality.base_url))?;

    match cli.command {
        Command::Load {
            signals,
            output,
            preload,
        } => {
            if let Err(e) = run_load(&config, catalog, &signals, output, preload).await {
                eprintln!("{} Error loading model: {:#}", style("error:").red().bold(), e);
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Select { signals, probe } => run_select(&config, catalog, &signals, probe).await,
        Command::Cache {
            list,
            stats,
            clear,
            remove,
        } => run_cache(&config, list, stats, clear, remove).await,
        Command::Proxy {
            install,
            preload,
            fetch,
        } => run_proxy(&config, catalog, install, preload, fetch).await,
    }
}

async fn open_cache(config: &Config) -> Result<Arc<ContentCache>> {
    let cache = ContentCache::open(&config.cache.root, &config.cache.name, config.cache_policy())
        .await
        .context("failed to open model cache")?;
    Ok(Arc::new(cache))
}

async fn run_select(
    config: &Config,
    catalog: AssetCatalog,
    args: &SignalArgs,
    probe: bool,
) -> Result<()> {
    let selector = QualitySelector::new(catalog, &config.quality.mobile_pattern)?;
    let signals = args.signals()?;
    let (id, reason) = selector.decide(&signals);
    let variant = selector.catalog().get(id);

    println!(
        "{} {} ({}, ~{})",
        style("::").cyan().bold(),
        style(variant.label).bold(),
        variant.id,
        format_bytes(variant.approx_bytes)
    );
    println!("   url: {}", variant.url);
    println!("   reason: {:?}", reason);
    let download_config = config.download_config(&signals.network);
    println!("   streams: {}", download_config.max_concurrent_streams);

    if probe {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&download_config)?);
        let downloader = ModelDownloader::new(transport, download_config);
        let ranges = downloader.probe_range_support(&variant.url).await;
        println!(
            "   byte ranges: {}",
            if ranges {
                style("supported").green()
            } else {
                style("not supported").yellow()
            }
        );
    }
    Ok(())
}

async fn run_load(
    config: &Config,
    catalog: AssetCatalog,
    args: &SignalArgs,
    output: Option<PathBuf>,
    preload: bool,
) -> Result<()> {
    let selector = QualitySelector::new(catalog.clone(), &config.quality.mobile_pattern)?;
    let signals = args.signals()?;
    let variant = selector.select(&signals).clone();
    let cache = open_cache(config).await?;

    let download_config = config.download_config(&signals.network);
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&download_config)?);
    let downloader = ModelDownloader::new(transport, download_config);

    println!(
        "{} loading {} ({}, {} streams)",
        style("::").cyan().bold(),
        style(variant.label).bold(),
        variant.url,
        downloader.config().max_concurrent_streams
    );

    let data = match cache.get(&variant.url).await {
        Some(data) => {
            println!("{}", style(":: served from cache").green());
            data
        }
        None => {
            let data = download_with_bar(&downloader, &variant.url).await?;
            cache.set(&variant.url, &data).await;
            data
        }
    };

    println!(
        "{} loaded {} ({})",
        style("::").green().bold(),
        variant.label,
        format_bytes(data.len() as u64)
    );

    // The tour renders without a skybox, so a failure here is not fatal
    if let Some(skybox) = catalog.skybox_url() {
        if !cache.contains(&skybox).await {
            match downloader.download(&skybox, None).await {
                Ok(image) => cache.set(&skybox, &image).await,
                Err(e) => tracing::warn!(url = %skybox, error = %e, "skybox unavailable"),
            }
        }
    }

    if let Some(path) = output {
        tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("   written to {}", path.display());
    }

    if preload && config.preload.enabled {
        println!("{}", style(":: preloading remaining variants...").bold());
        let orchestrator =
            PreloadOrchestrator::new(downloader, cache, &catalog, config.preload_delay());
        let report = orchestrator.spawn(variant.url.clone()).await?;
        for url in &report.fetched {
            println!("   {} {}", style("cached").green(), url);
        }
        for url in &report.skipped {
            println!("   {} {}", style("present").dim(), url);
        }
        for (url, error) in &report.failed {
            println!("   {} {}: {}", style("failed").red(), url, error);
        }
    }

    Ok(())
}

async fn download_with_bar(downloader: &ModelDownloader, url: &str) -> Result<Vec<u8>> {
    let (sender, mut stream) = downloader::progress::channel();

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("=> "),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let bar = pb.clone();
    let reporter = tokio::spawn(async move {
        while let Some(progress) = stream.next().await {
            if progress.total > 0 {
                bar.set_length(progress.total);
            }
            bar.set_position(progress.loaded);
            bar.set_message(progress.describe());
        }
    });

    let result = downloader.download(url, Some(sender)).await;
    let _ = reporter.await;

    match result {
        Ok(data) => {
            pb.finish_and_clear();
            Ok(data)
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            Err(anyhow!(e))
        }
    }
}

async fn run_cache(
    config: &Config,
    list: bool,
    stats: bool,
    clear: bool,
    remove: Option<String>,
) -> Result<()> {
    let cache = open_cache(config).await?;

    if let Some(url) = remove {
        if cache.remove(&url).await {
            println!("{} removed {}", style("::").green().bold(), url);
        } else {
            println!("{} not cached: {}", style("::").yellow().bold(), url);
        }
    }

    if clear {
        let result = cache.clear().await?;
        println!(
            "{} cleared {} entries ({})",
            style("::").green().bold(),
            result.removed_count,
            format_bytes(result.removed_bytes)
        );
    }

    if list {
        let entries = cache.entries().await?;
        if entries.is_empty() {
            println!("cache is empty.");
        } else {
            let mut t = Table::new();
            t.load_preset(UTF8_FULL);
            t.set_header(vec!["URL", "Size", "Type", "Cached"]);
            for entry in &entries {
                t.add_row(vec![
                    entry.url.clone(),
                    format_bytes(entry.size_bytes),
                    entry.content_type.clone(),
                    entry.cached_at.format("%Y-%m-%d %H:%M").to_string(),
                ]);
            }
            println!("{}", t);
        }
    }

    if stats || !(list || clear) {
        let estimate = cache.estimate().await?;
        cache::display_cache_stats(cache.name(), &cache.stats().await);
        println!("   Location: {}", cache.dir().display());
        println!(
            "   Quota: {} of {}",
            format_bytes(estimate.usage),
            format_bytes(estimate.quota)
        );
    }

    Ok(())
}

async fn run_proxy(
    config: &Config,
    catalog: AssetCatalog,
    install: bool,
    preload: Option<Vec<String>>,
    fetch: Vec<String>,
) -> Result<()> {
    let cache = open_cache(config).await?;
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(&config.download_config(&NetworkInfo::Unknown))?);
    let handle = CacheProxy::new(transport, cache, catalog.clone(), config.proxy_retry()).spawn();

    if install {
        let report = handle.install().await?;
        println!(
            "{} proxy installed: {} cached, {} failed",
            style("::").cyan().bold(),
            report.cached.len(),
            report.failed.len()
        );
        for (url, error) in &report.failed {
            println!("   {} {}: {}", style("failed").red(), url, error);
        }
    }

    if let Some(models) = preload {
        // a bare --preload means every model
        let models = (!models.is_empty()).then_some(models);
        let report = handle.preload(models).await?;
        println!(
            "{} preload: {} fetched, {} already cached, {} failed",
            style("::").cyan().bold(),
            report.fetched.len(),
            report.skipped.len(),
            report.failed.len()
        );
    }

    for path in fetch {
        let url = catalog.resolve(&path)?;
        match handle.fetch(&url).await {
            Ok(response) => {
                let source = match response.source {
                    ResponseSource::Cache => style("cache").green(),
                    ResponseSource::Network => style("network").cyan(),
                    ResponseSource::Fallback => style("fallback").yellow(),
                    ResponseSource::Passthrough => style("passthrough").dim(),
                };
                let label = catalog
                    .by_url(&response.url)
                    .map(|v| format!(" {}", v.label))
                    .unwrap_or_default();
                println!(
                    "   {}{} {} [{}]",
                    response.url,
                    label,
                    format_bytes(response.body.len() as u64),
                    source
                );
            }
            Err(e) => println!("   {} {}: {}", style("failed").red(), url, e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assets::VariantId;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_signal_args_read_override() {
        let args = SignalArgs {
            page_url: Some("https://tour.example/?model=original".to_string()),
            effective_type: Some(EffectiveType::TwoG),
            ..SignalArgs::default()
        };
        let signals = args.signals().unwrap();
        assert_eq!(
            signals.manual_override,
            Some(QualityOverride(VariantId::Original))
        );
        assert!(matches!(signals.network, NetworkInfo::Known { .. }));
    }

    #[test]
    fn test_parse_load() {
        let cli = Cli::parse_from([
            "modelboost",
            "load",
            "--effective-type",
            "4g",
            "--downlink",
            "25",
            "--preload",
        ]);
        match cli.command {
            Command::Load {
                signals, preload, ..
            } => {
                assert!(preload);
                assert_eq!(signals.effective_type, Some(EffectiveType::FourG));
                assert_eq!(signals.downlink, Some(25.0));
            }
            _ => panic!("expected load"),
        }
    }
}
