use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::{mpsc::Receiver, Arc, Mutex},
    time::Instant,
};

use anyhow::Context;

use super::{CompletedItem, PipelineContext};
use crate::store::{Item, ItemStatus};

/// One unit of ingestion work.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub item_id: u64,
    pub source_path: PathBuf,
    pub title: String,
    pub tags: Vec<String>,
}

impl From<&Item> for Job {
    fn from(item: &Item) -> Self {
        Self {
            item_id: item.id,
            source_path: PathBuf::from(&item.storage_path),
            title: item.title.clone(),
            tags: item.tags.clone(),
        }
    }
}

pub fn thumbnail_name(item_id: u64) -> String {
    format!("thumb_{item_id}.webp")
}

pub(super) fn run(idx: usize, receiver: Arc<Mutex<Receiver<Job>>>, ctx: PipelineContext) {
    log::debug!("worker {idx} waiting for jobs");

    loop {
        let job = match receiver.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };

        // queue closed and drained
        let Ok(job) = job else {
            break;
        };

        let item_id = job.item_id;
        let now = Instant::now();

        let result = catch_unwind(AssertUnwindSafe(|| process(&ctx, &job)))
            .unwrap_or_else(|_| Err(anyhow::anyhow!("worker panicked")));

        match result {
            Ok(completed) => {
                log::info!(
                    "worker {idx}: item {item_id} ready in {}ms",
                    now.elapsed().as_millis()
                );
                ctx.sink.item_completed(&completed);
            }
            Err(err) => {
                log::error!("worker {idx}: item {item_id} failed: {err:#}");
                if let Err(err) = ctx.store.update_status(item_id, ItemStatus::Failed) {
                    log::error!("worker {idx}: couldnt mark item {item_id} failed: {err:#}");
                }
            }
        }
    }

    log::debug!("worker {idx} exiting");
}

fn process(ctx: &PipelineContext, job: &Job) -> anyhow::Result<CompletedItem> {
    ctx.store
        .update_status(job.item_id, ItemStatus::Processing)
        .context("status update")?;

    let source = std::fs::read(&job.source_path)
        .with_context(|| format!("thumbnail: reading {:?}", job.source_path))?;
    let thumbnail = ctx.thumbnailer.generate(&source).context("thumbnail")?;

    // written before the record update and kept if that update fails
    let name = thumbnail_name(job.item_id);
    ctx.thumbnails
        .write(&name, &thumbnail)
        .context("thumbnail: writing file")?;
    let thumbnail_url = format!("/thumbnails/{name}");

    let embedding = ctx.engine.embed_tags(&job.tags).context("embedding")?;

    ctx.store
        .update_result(job.item_id, &thumbnail_url, embedding)
        .context("store update")?;

    Ok(CompletedItem {
        id: job.item_id,
        title: job.title.clone(),
        tags: job.tags.clone(),
        thumbnail_url,
    })
}
