//! Wiring of the store, embedding engine, pipeline and services.

pub mod errors;
pub mod ingest;

use std::sync::Arc;

use anyhow::Context;

pub use errors::AppError;
pub use ingest::{IngestService, ItemView, Upload, UploadResponse};

use crate::{
    config::Config,
    embedding::EmbeddingEngine,
    feed::FeedService,
    pipeline::{CompletionSink, Pipeline, PipelineContext},
    storage::BackendLocal,
    store::{BackendCsv, RecordStore},
    thumbnail::ImageThumbnailer,
};

pub struct App {
    pub config: Config,
    pub store: Arc<dyn RecordStore>,
    pub engine: Arc<EmbeddingEngine>,
    pub pipeline: Arc<Pipeline>,
    pub ingest: Arc<IngestService>,
    pub feed: Arc<FeedService>,
}

impl App {
    /// Open the record store under the config's base path and start the
    /// pipeline. Completed items are reported to `sink`.
    pub fn open(
        config: Config,
        engine: Arc<EmbeddingEngine>,
        sink: Arc<dyn CompletionSink>,
    ) -> anyhow::Result<Self> {
        let store: Arc<dyn RecordStore> = Arc::new(
            BackendCsv::load(config.base_path(), engine.dimensions())
                .context("failed to open record store")?,
        );
        let uploads = Arc::new(BackendLocal::new(config.uploads_dir())?);
        let thumbnails = Arc::new(BackendLocal::new(config.thumbnails_dir())?);

        let pipeline = Arc::new(Pipeline::start(
            &config.pipeline,
            PipelineContext {
                store: store.clone(),
                thumbnailer: Arc::new(ImageThumbnailer::from_config(&config.thumbnail)),
                thumbnails,
                engine: engine.clone(),
                sink,
            },
        ));

        let ingest = Arc::new(IngestService::new(
            store.clone(),
            uploads,
            pipeline.clone(),
            config.upload.clone(),
            engine.dimensions(),
        ));

        let feed = Arc::new(FeedService::new(
            store.clone(),
            engine.clone(),
            config.feed.clone(),
        ));

        Ok(Self {
            config,
            store,
            engine,
            pipeline,
            ingest,
            feed,
        })
    }

    /// Re-enqueue pending items, then seed an empty store.
    pub fn startup(&self) -> anyhow::Result<()> {
        self.pipeline.recover()?;
        self.ingest
            .seed(&self.config.seeds, self.config.base_path())?;
        Ok(())
    }

    /// Drain the pipeline, then release the engine. Idempotent.
    pub fn shutdown(&self) {
        self.pipeline.shutdown();
        self.engine.close();
    }
}
