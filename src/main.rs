use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod eid;
mod embedding;
mod feed;
mod hub;
mod lock;
mod pipeline;
mod storage;
mod store;
#[cfg(test)]
mod tests;
mod thumbnail;
mod web;

use app::App;
use config::Config;
use embedding::EmbeddingEngine;
use feed::FeedQuery;
use lock::FileLock;
use pipeline::NoopSink;

/// How many leading components `embed` prints
const EMBED_PREVIEW: usize = 8;

fn init_logging() -> anyhow::Result<()> {
    // try_init also bridges the `log` macros into tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .map_err(|err| anyhow!("failed to set tracing subscriber: {err}"))
}

fn open_local(config: Config) -> anyhow::Result<App> {
    let engine = Arc::new(EmbeddingEngine::from_config(
        &config.embedding,
        &config.models_dir(),
    )?);
    App::open(config, engine, Arc::new(NoopSink))
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    init_logging()?;

    let config = Config::load_with(config::base_path()?)?;

    match args.command {
        cli::Command::Serve => {
            let _lock = FileLock::try_acquire(config.base_path())?;
            web::start_daemon(config)?;
        }

        cli::Command::Embed { text } => {
            let engine = EmbeddingEngine::from_config(&config.embedding, &config.models_dir())?;
            let vector = engine.embed(&text)?;
            engine.close();

            let preview = vector
                .iter()
                .take(EMBED_PREVIEW)
                .map(|value| format!("{value:.4}"))
                .collect::<Vec<_>>()
                .join(", ");

            println!("dimensions: {}", vector.len());
            println!("norm: {:.6}", embedding::l2_norm(&vector));
            println!("head: [{preview}, ...]");
        }

        cli::Command::Feed {
            filter,
            cursor,
            limit,
        } => {
            let _lock = FileLock::try_acquire(config.base_path())?;
            let app = open_local(config)?;

            let page = app.feed.query(FeedQuery {
                filter,
                cursor,
                limit,
            });
            app.shutdown();

            println!("{}", serde_json::to_string_pretty(&page?)?);
        }

        cli::Command::Recover => {
            let _lock = FileLock::try_acquire(config.base_path())?;
            let app = open_local(config)?;

            let queued = app.pipeline.recover_all()?;
            log::info!("recovered {queued} pending items, waiting for them to finish");

            // shutdown drains the queue before joining the workers
            app.shutdown();
        }
    }

    Ok(())
}
