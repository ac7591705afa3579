//! Bounded job queue and fixed worker pool driving uploads to `ready`.
//!
//! `enqueue` never blocks: when the queue is full the job is dropped and the
//! item stays `pending` until the next recovery scan. `enqueue_blocking` waits
//! for room instead. Workers run each job to completion; `shutdown` closes the
//! queue, lets the workers drain it and waits for them.

mod worker;

use std::{
    sync::{
        mpsc::{self, SyncSender, TrySendError},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use anyhow::anyhow;

use crate::{
    config::PipelineConfig, embedding::EmbeddingEngine, storage::StorageManager,
    store::RecordStore, thumbnail::ThumbnailGenerator,
};

pub use worker::Job;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("job queue is full, item {0} stays pending")]
    CapacityExceeded(u64),

    #[error("pipeline is shut down")]
    Closed,
}

/// Published once per successfully processed item.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedItem {
    pub id: u64,
    pub title: String,
    pub tags: Vec<String>,
    pub thumbnail_url: String,
}

/// Receiver of completion events, called on the worker thread after the
/// result is persisted.
pub trait CompletionSink: Send + Sync {
    fn item_completed(&self, item: &CompletedItem);
}

/// Sink for runs without live clients.
pub struct NoopSink;

impl CompletionSink for NoopSink {
    fn item_completed(&self, _item: &CompletedItem) {}
}

/// Collaborators shared by all workers.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn RecordStore>,
    pub thumbnailer: Arc<dyn ThumbnailGenerator>,
    /// Where thumbnail files are written
    pub thumbnails: Arc<dyn StorageManager>,
    pub engine: Arc<EmbeddingEngine>,
    pub sink: Arc<dyn CompletionSink>,
}

pub struct Pipeline {
    sender: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn RecordStore>,
}

impl Pipeline {
    pub fn start(config: &PipelineConfig, ctx: PipelineContext) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<Job>(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..config.workers)
            .map(|idx| {
                let receiver = receiver.clone();
                let ctx = ctx.clone();
                std::thread::spawn(move || worker::run(idx, receiver, ctx))
            })
            .collect::<Vec<_>>();

        log::info!(
            "pipeline started with {} workers, queue capacity {}",
            config.workers,
            config.queue_capacity
        );

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            store: ctx.store,
        }
    }

    /// Queue a job without blocking.
    pub fn enqueue(&self, job: Job) -> Result<(), PipelineError> {
        let sender = self.sender.lock().map_err(|_| PipelineError::Closed)?;
        let sender = sender.as_ref().ok_or(PipelineError::Closed)?;

        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                log::warn!("job queue full, dropping job for item {}", job.item_id);
                Err(PipelineError::CapacityExceeded(job.item_id))
            }
            Err(TrySendError::Disconnected(_)) => Err(PipelineError::Closed),
        }
    }

    /// Queue a job, waiting for room when the queue is full.
    pub fn enqueue_blocking(&self, job: Job) -> Result<(), PipelineError> {
        // cloned so a waiting caller doesnt hold up shutdown
        let sender = {
            let sender = self.sender.lock().map_err(|_| PipelineError::Closed)?;
            sender.as_ref().ok_or(PipelineError::Closed)?.clone()
        };

        sender.send(job).map_err(|_| PipelineError::Closed)
    }

    /// Re-enqueue every `pending` item, waiting for queue room instead of
    /// leaving overflow behind. For one-shot runs that exist to clear the
    /// backlog.
    pub fn recover_all(&self) -> anyhow::Result<usize> {
        let pending = self.store.scan_pending()?;
        let total = pending.len();

        for item in pending {
            self.enqueue_blocking(Job::from(&item))
                .map_err(|err| anyhow!(err))?;
        }

        log::info!("recovery queued all {total} pending items");
        Ok(total)
    }

    /// Re-enqueue every `pending` item. Returns how many were queued; the
    /// rest stay `pending` when the queue fills up.
    pub fn recover(&self) -> anyhow::Result<usize> {
        let pending = self.store.scan_pending()?;
        let total = pending.len();

        let mut queued = 0;
        for item in pending {
            match self.enqueue(Job::from(&item)) {
                Ok(()) => queued += 1,
                Err(PipelineError::CapacityExceeded(_)) => continue,
                Err(err) => return Err(anyhow!(err)),
            }
        }

        log::info!("recovery re-enqueued {queued} of {total} pending items");
        Ok(queued)
    }

    /// Stop accepting jobs, drain the queue and wait for every worker.
    /// Later calls return immediately.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }

        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        if workers.is_empty() {
            return;
        }

        log::info!("pipeline draining, waiting for {} workers", workers.len());
        for handle in workers {
            if let Err(err) = handle.join() {
                log::error!("pipeline worker panicked: {err:?}");
            }
        }
        log::info!("pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        embedding::HashedBackend,
        storage::BackendLocal,
        store::{BackendCsv, ItemStatus, NewItem},
    };
    use std::{
        sync::mpsc::{Receiver, Sender},
        time::Duration,
    };

    /// Signals when a job starts, then waits for permission to continue.
    struct GatedThumbnailer {
        started: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
    }

    impl ThumbnailGenerator for GatedThumbnailer {
        fn generate(&self, _source: &[u8]) -> anyhow::Result<Vec<u8>> {
            self.started.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            Ok(b"thumb".to_vec())
        }
    }

    #[test]
    fn test_enqueue_drops_when_full() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(BackendCsv::load(tmp.path().join("db"), 8).unwrap());
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();

        let ctx = PipelineContext {
            store: store.clone(),
            thumbnailer: Arc::new(GatedThumbnailer {
                started: Mutex::new(started_tx),
                release: Mutex::new(release_rx),
            }),
            thumbnails: Arc::new(BackendLocal::new(tmp.path().join("thumbs")).unwrap()),
            engine: Arc::new(EmbeddingEngine::new(Box::new(HashedBackend::new(8)), 16)),
            sink: Arc::new(NoopSink),
        };
        let pipeline = Pipeline::start(
            &PipelineConfig {
                workers: 1,
                queue_capacity: 2,
            },
            ctx,
        );

        let source = tmp.path().join("source.png");
        std::fs::write(&source, b"raw").unwrap();

        let mut ids = vec![];
        for i in 0..4 {
            let item = store
                .insert(
                    NewItem {
                        title: format!("item {i}"),
                        checksum: format!("c{i}"),
                        storage_path: source.to_string_lossy().to_string(),
                        tags: vec!["cat".to_string()],
                        ..Default::default()
                    },
                    vec![0.0; 8],
                )
                .unwrap();
            ids.push(item.id);
        }

        let job = |id: u64| Job {
            item_id: id,
            source_path: source.clone(),
            title: format!("item {id}"),
            tags: vec!["cat".to_string()],
        };

        // the single worker takes the first job and parks
        pipeline.enqueue(job(ids[0])).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pipeline.enqueue(job(ids[1])).unwrap();
        pipeline.enqueue(job(ids[2])).unwrap();
        assert!(matches!(
            pipeline.enqueue(job(ids[3])),
            Err(PipelineError::CapacityExceeded(id)) if id == ids[3]
        ));

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        pipeline.shutdown();

        for id in &ids[..3] {
            assert_eq!(store.get(*id).unwrap().unwrap().status, ItemStatus::Ready);
        }
        assert_eq!(
            store.get(ids[3]).unwrap().unwrap().status,
            ItemStatus::Pending
        );
        assert!(matches!(
            pipeline.enqueue(job(ids[3])),
            Err(PipelineError::Closed)
        ));
        assert!(matches!(
            pipeline.enqueue_blocking(job(ids[3])),
            Err(PipelineError::Closed)
        ));
    }
}
