//! Pretrained CLI - resolve, download and manage cached pretrained artifacts.
//!
//! Resolved paths and listings go to stdout; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pretrained_core::config::default_settings_path;
use pretrained_core::{
    CancellationToken, PredefinedPipeline, PretrainedApi, PretrainedApiBuilder, ResolveRequest,
    Settings, StaticRegistryIndex,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pretrained")]
#[command(about = "Resolve and cache pretrained models and pipelines")]
struct Args {
    /// Registry index URL (http(s):// or file://)
    #[arg(long, global = true)]
    registry_url: Option<String>,

    /// Cache root directory
    #[arg(long, global = true)]
    cache_root: Option<PathBuf>,

    /// JSON settings file (default: <config dir>/pretrained/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a model and print its local path
    Model {
        name: String,
        #[arg(default_value = "en")]
        language: String,
        /// Version to fetch (default: latest)
        #[arg(long)]
        version: Option<String>,
        /// Only accept artifacts loadable by this reader
        #[arg(long)]
        reader: Option<String>,
    },
    /// Resolve a pipeline and print its local path
    Pipeline {
        name: String,
        #[arg(default_value = "en")]
        language: String,
        /// Version to fetch (default: latest)
        #[arg(long)]
        version: Option<String>,
    },
    /// Show or change the cache root
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List cached artifacts
    List {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove one cached artifact
    Evict {
        name: String,
        language: String,
        version: String,
    },
    /// Evict least recently used artifacts until the cache fits
    Prune {
        /// Cache size limit in bytes
        max_bytes: u64,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the cache root
    Get,
    /// Save a cache root to the settings file
    Set { path: PathBuf },
}

fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn settings_path(args: &Args) -> Option<PathBuf> {
    args.settings.clone().or_else(default_settings_path)
}

fn load_settings(args: &Args, path: Option<&Path>) -> Result<Settings> {
    let mut settings = match path {
        Some(path) => Settings::load_or_default(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    }
    .with_env_overrides();

    if let Some(url) = &args.registry_url {
        settings.registry_url = Some(url.clone());
    }
    if let Some(root) = &args.cache_root {
        settings.cache_root = Some(root.clone());
    }
    Ok(settings)
}

/// Log download progress until the sender side closes.
fn spawn_progress_logger() -> mpsc::Sender<pretrained_core::DownloadState> {
    let (tx, mut rx) = mpsc::channel::<pretrained_core::DownloadState>(16);
    tokio::spawn(async move {
        while let Some(state) = rx.recv().await {
            match state.fraction() {
                Some(fraction) => info!(
                    "{}: {:.1}% ({} bytes, attempt {})",
                    state.key,
                    fraction * 100.0,
                    state.bytes_received,
                    state.attempt
                ),
                None => info!(
                    "{}: {} bytes (attempt {})",
                    state.key, state.bytes_received, state.attempt
                ),
            }
        }
    });
    tx
}

async fn build_api(settings: Settings) -> Result<PretrainedApi> {
    let api = PretrainedApiBuilder::from_settings(settings)
        .progress(spawn_progress_logger())
        .build()
        .await
        .context("initializing pretrained API")?;
    Ok(api)
}

/// API for cache maintenance, which works without a registry.
async fn build_maintenance_api(settings: Settings) -> Result<PretrainedApi> {
    let has_registry = settings.registry_url.is_some();
    let mut builder = PretrainedApiBuilder::from_settings(settings);
    if !has_registry {
        builder = builder.registry_index(Arc::new(StaticRegistryIndex::new(Vec::new())));
    }
    builder.build().await.context("opening artifact cache")
}

/// Resolve `request`, cancelling it on Ctrl-C. Returns the local path.
async fn resolve_interruptible(api: &PretrainedApi, request: ResolveRequest) -> Result<PathBuf> {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });

    let result = api.resolve_with_report(request, Some(&cancel)).await.into_result();
    interrupt.abort();
    Ok(result?.local_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.json_logs);

    let settings_file = settings_path(&args);
    let settings = load_settings(&args, settings_file.as_deref())?;
    debug!("Settings: {:?}", settings);

    match args.command {
        Command::Model {
            name,
            language,
            version,
            reader,
        } => {
            let api = build_api(settings).await?;
            let mut request = ResolveRequest::model(name, language, version.as_deref());
            if let Some(reader) = reader {
                request = request.with_reader(reader);
            }
            let path = resolve_interruptible(&api, request).await?;
            println!("{}", path.display());
        }
        Command::Pipeline {
            name,
            language,
            version,
        } => {
            let api = build_api(settings).await?;
            let request = match (name.parse::<PredefinedPipeline>(), &version) {
                (Ok(pipeline), None) if language == pipeline.language() => {
                    debug!("Resolving predefined pipeline {}", pipeline);
                    ResolveRequest::pipeline(pipeline.name(), pipeline.language(), None)
                }
                _ => ResolveRequest::pipeline(name, language, version.as_deref()),
            };
            let path = resolve_interruptible(&api, request).await?;
            println!("{}", path.display());
        }
        Command::Config { action } => match action {
            ConfigAction::Get => println!("{}", settings.resolved_cache_root().display()),
            ConfigAction::Set { path } => {
                let settings_file = settings_file
                    .context("no settings file location; pass --settings")?;
                let root = if path.is_absolute() {
                    path
                } else {
                    std::env::current_dir()?.join(path)
                };
                Settings::persist_cache_root(&settings_file, &root).with_context(|| {
                    format!("saving cache root {} to {}", root.display(), settings_file.display())
                })?;
                println!("{}", root.display());
            }
        },
        Command::List { json } => {
            let api = build_maintenance_api(settings).await?;
            let records = api.list_cached().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in &records {
                    println!(
                        "{:<8} {:<40} {:>12}  {}",
                        record.kind.as_str(),
                        record.key.to_string(),
                        record.size_bytes,
                        record.last_used_at.to_rfc3339()
                    );
                }
            }
        }
        Command::Evict {
            name,
            language,
            version,
        } => {
            let api = build_maintenance_api(settings).await?;
            if !api.evict(&name, &language, &version).await? {
                info!("{}/{}/{} was not cached", name, language, version);
            }
        }
        Command::Prune { max_bytes } => {
            let api = build_maintenance_api(settings).await?;
            for key in api.prune(max_bytes).await? {
                println!("{}", key);
            }
        }
    }

    Ok(())
}
