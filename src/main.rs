use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use homedir::my_home;

mod cli;
mod config;
mod lock;
mod semantic;
#[cfg(test)]
mod tests;
mod web;

use config::Config;
use lock::FileLock;
use semantic::{SearchEngine, SnapshotStore};

fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("ROOMSEARCH_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("Could not determine home directory")?
        .context("Home directory path is empty")?;
    Ok(home.join(".local/share/roomsearch"))
}

fn open_engine(config: &Config) -> anyhow::Result<Arc<SearchEngine>> {
    let embedder = semantic::embeddings::from_config(&config.embedding, config.base_path())?;
    let store = SnapshotStore::new(config.base_path().to_path_buf());
    let engine = SearchEngine::open(embedder, store, config.search.clone())?;
    Ok(Arc::new(engine))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    #[cfg(feature = "markdown-docs")]
    if let cli::Command::MarkdownDocs {} = args.command {
        clap_markdown::print_help_markdown::<cli::Args>();
        return Ok(());
    }

    let base_path = base_path()?;
    std::fs::create_dir_all(&base_path)
        .with_context(|| format!("Failed to create {}", base_path.display()))?;
    let _lock = FileLock::try_acquire(&base_path)
        .with_context(|| format!("Failed to lock {}", base_path.display()))?;
    let config = Config::load_with(&base_path)?;

    let engine = open_engine(&config)?;

    match args.command {
        #[cfg(feature = "markdown-docs")]
        cli::Command::MarkdownDocs {} => Ok(()),

        cli::Command::Serve { addr } => {
            let addr = addr.unwrap_or_else(|| config.server.addr.clone());
            web::start_daemon(engine, &addr)
        }

        cli::Command::Add { room_id, room_name } => {
            let entry = engine.add_room(&room_id, &room_name)?;
            print_json(&entry)
        }

        cli::Command::Delete { room_id } => {
            let entry = engine.delete_room(&room_id)?;
            print_json(&entry)
        }

        cli::Command::Search { query, k } => {
            let hits = engine.search(&query, k)?;
            print_json(&hits)
        }

        cli::Command::Rooms {} => print_json(&engine.rooms()?),

        cli::Command::Stats {} => print_json(&engine.stats()?),
    }
}
