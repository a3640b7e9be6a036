//! photosyncd — local sync client for a remote photo library.
//!
//! Talks the service's private binary protocol: a device credential is
//! exchanged for short-lived bearer tokens, library state is pulled through
//! a paged, state-token-driven RPC into a local SQLite index, and item
//! bytes are streamed through a download multiplexer that shares one
//! backing transfer between concurrent readers.

#![warn(clippy::all)]

mod cli;
mod config;
mod index;
mod mapper;
mod mux;
mod naming;
mod protocol;
mod retry;
mod shutdown;
mod sync;
mod wire;

use std::io::Write as _;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::Config;
use index::{LocalIndex, MediaItem, SqliteIndex};
use mux::DownloadMultiplexer;
use protocol::{ProtocolClient, Transport};
use sync::SyncEngine;

struct App {
    client: Arc<ProtocolClient>,
    index: Arc<SqliteIndex>,
    engine: SyncEngine,
    config: Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let config = Config::from_cli(&cli)?;
    tracing::debug!(?config, "starting photosyncd");

    let transport: Arc<dyn Transport> = Arc::new(reqwest::Client::builder().build()?);
    let client = Arc::new(ProtocolClient::new(transport, config.credential()));
    let index = Arc::new(SqliteIndex::open(&config.db_path).await?);
    let engine = SyncEngine::new(client.clone(), index.clone());

    let app = App {
        client,
        index,
        engine,
        config,
    };

    let shutdown = shutdown::cancel_on_signal();

    match cli.command {
        Command::Sync { watch } => run_sync(&app, watch, &shutdown).await,
        Command::Status { json } => run_status(&app, json).await,
        Command::Lookup { name } => run_lookup(&app, &name, &shutdown).await,
        Command::Download { name, output } => run_download(&app, &name, output, &shutdown).await,
        Command::Upload { path } => run_upload(&app, &path, &shutdown).await,
        Command::Trash { names } => run_trash(&app, &names, &shutdown).await,
    }
}

async fn run_sync(app: &App, watch: Option<u64>, shutdown: &CancellationToken) -> anyhow::Result<()> {
    loop {
        app.engine.refresh_now(shutdown).await?;
        let stats = app.index.stats().await?;
        tracing::info!(
            total = stats.total,
            photos = stats.photos,
            videos = stats.videos,
            trashed = stats.trashed,
            "index up to date"
        );

        let Some(interval) = watch else { return Ok(()) };
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown requested, exiting");
                return Ok(());
            }
        }
    }
}

async fn run_status(app: &App, json: bool) -> anyhow::Result<()> {
    let stats = app.index.stats().await?;
    let cursor = app.index.cursor().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Index: {}", app.config.db_path.display());
    println!();
    println!("Items:");
    println!("  Total:   {}", stats.total);
    println!("  Photos:  {}", stats.photos);
    println!("  Videos:  {}", stats.videos);
    println!("  Trashed: {}", stats.trashed);
    println!();
    if !cursor.init_complete {
        println!("Initial enumeration has not completed; run `photosyncd sync`.");
    } else if cursor.last_sync > 0 {
        if let Some(at) = chrono::DateTime::from_timestamp(cursor.last_sync, 0) {
            println!("Last sync: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }
    Ok(())
}

async fn run_lookup(app: &App, name: &str, shutdown: &CancellationToken) -> anyhow::Result<()> {
    app.engine.ensure_fresh(shutdown).await?;

    let items = app.index.get_by_file_name(name).await?;
    if items.is_empty() {
        anyhow::bail!("no item named '{name}'");
    }
    let display = naming::assign_display_names(&items);
    for item in &items {
        println!(
            "{}  {}  {}  {} bytes",
            item.media_key,
            display[&item.media_key],
            item.kind.as_str(),
            item.size_bytes
        );
    }
    Ok(())
}

/// Resolve a display name (plain, or suffixed when it collides) to one item.
async fn resolve_by_name(app: &App, name: &str) -> anyhow::Result<MediaItem> {
    let items = app.index.list_recent(None).await?;
    let display = naming::assign_display_names(&items);
    items
        .into_iter()
        .find(|item| display[&item.media_key] == name)
        .ok_or_else(|| anyhow::anyhow!("no item named '{name}'"))
}

async fn run_download(
    app: &App,
    name: &str,
    output: Option<String>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    app.engine.ensure_fresh(shutdown).await?;
    let item = resolve_by_name(app, name).await?;

    let mux = DownloadMultiplexer::new(
        app.client.clone(),
        app.config.scratch_dir.clone(),
        shutdown.clone(),
    );
    let mut reader = mux.open(&item.media_key)?;
    let bytes = reader.read_to_end().await?;

    match output {
        Some(path) => {
            std::fs::write(&path, &bytes)?;
            tracing::info!(path, bytes = bytes.len(), "download complete");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

async fn run_upload(app: &App, path: &str, shutdown: &CancellationToken) -> anyhow::Result<()> {
    let data = std::fs::read(path)?;
    let file_name = std::path::Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("cannot derive a file name from '{path}'"))?
        .to_string();
    let timestamp = std::fs::metadata(path)?
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_else(|| chrono::Utc::now().timestamp());

    let media_key = app
        .client
        .upload_media(data.into(), &file_name, timestamp, shutdown)
        .await?;
    println!("{media_key}");

    app.engine.mark_dirty();
    app.engine.ensure_fresh(shutdown).await?;
    Ok(())
}

async fn run_trash(app: &App, names: &[String], shutdown: &CancellationToken) -> anyhow::Result<()> {
    app.engine.ensure_fresh(shutdown).await?;

    let mut dedup_keys = Vec::with_capacity(names.len());
    for name in names {
        let item = resolve_by_name(app, name).await?;
        if item.dedup_key.is_empty() {
            anyhow::bail!("'{name}' has no dedup key and cannot be trashed");
        }
        dedup_keys.push(item.dedup_key);
    }

    app.client.trash_items(&dedup_keys, shutdown).await?;
    tracing::info!(count = dedup_keys.len(), "items moved to trash");

    app.engine.mark_dirty();
    app.engine.ensure_fresh(shutdown).await?;
    Ok(())
}
