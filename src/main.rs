use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

mod cli;
mod config;
mod lock;
mod semantic;
#[cfg(test)]
mod tests;
mod web;

use config::Config;
use lock::IndexLock;
use semantic::{EmbeddingModel, ReviewIndex};

const BASE_PATH_ENV: &str = "REVIEW_INDEX_BASE_PATH";
const DEFAULT_BASE_PATH: &str = "./data";

fn base_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(BASE_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_PATH))
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    let base_path = base_path(args.base_path);
    let config = Config::load_with(&base_path)?;
    init_logging(config.debug);

    if let cli::Command::Clear { yes: false } = args.command {
        bail!("refusing to clear the index without --yes");
    }

    // readers never write the snapshot, so they can run next to the server
    let _lock = if args.command.mutates_index() {
        let lock = IndexLock::try_acquire(config.base_path())
            .with_context(|| format!("failed to lock {}", config.base_path().display()))?;
        Some(lock)
    } else {
        None
    };

    let embedder = EmbeddingModel::new(
        &config.index.model,
        config.base_path().to_path_buf(),
        Some(Duration::from_secs(config.index.download_timeout_secs)),
    )
    .context("failed to load embedding model")?;
    let mut index = ReviewIndex::open(Box::new(embedder), &config.index_path());

    match args.command {
        cli::Command::Serve {} => {
            web::start_server(index, config)?;
        }

        cli::Command::Add { ids, texts } => {
            let added = index.add(&ids, &texts)?;
            print_json(&serde_json::json!({ "added": added }))?;
        }

        cli::Command::Search { query, k, filter } => {
            let filter = (!filter.is_empty()).then_some(filter.as_slice());
            let hits = index.search(&query, k, filter)?;
            print_json(&hits)?;
        }

        cli::Command::Remove { id } => {
            let removed = index.remove(id)?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }

        cli::Command::Stats {} => {
            print_json(&index.stats())?;
        }

        cli::Command::Clear { .. } => {
            index.clear()?;
            print_json(&serde_json::json!({ "cleared": true }))?;
        }

        cli::Command::Embed { text } => {
            let embedding = index.review_embedding(&text)?;
            print_json(&embedding)?;
        }
    }

    Ok(())
}
