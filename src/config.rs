use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::storage::{self, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

const PIPELINE_WORKERS: usize = 3;
const PIPELINE_QUEUE_CAPACITY: usize = 100;

const THUMBNAIL_SIZE: u32 = 512;
const THUMBNAIL_QUALITY: u8 = 80;

/// Default embedding model (384-dim sentence transformer)
const DEFAULT_MODEL_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";
const EMBEDDING_MAX_TOKENS: usize = 128;
const EMBEDDING_DIMENSIONS: usize = 384;

const FEED_DEFAULT_LIMIT: usize = 20;
const FEED_MAX_LIMIT: usize = 50;
/// Minimum cosine similarity for an item to appear in a filtered feed
const FEED_SIMILARITY_THRESHOLD: f32 = 0.3;

const HUB_SUBSCRIBER_BUFFER: usize = 256;
const HUB_INTAKE_CAPACITY: usize = 64;

/// 50 MB
const UPLOAD_MAX_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Number of worker threads pulling from the job queue
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Jobs beyond this many queued are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: PIPELINE_WORKERS,
            queue_capacity: PIPELINE_QUEUE_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ThumbnailConfig {
    /// Edge length of the square thumbnail in pixels
    #[serde(default = "default_thumbnail_size")]
    pub size: u32,

    /// WebP quality (1-100)
    #[serde(default = "default_thumbnail_quality")]
    pub quality: u8,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            size: THUMBNAIL_SIZE,
            quality: THUMBNAIL_QUALITY,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackendKind {
    /// BERT sentence transformer run through candle
    #[default]
    Bert,
    /// Deterministic hash-derived token vectors, no model download
    Hashed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackendKind,

    /// HuggingFace repository of the BERT model
    #[serde(default = "default_model_repo")]
    pub model_repo: String,

    /// Fixed token sequence length; longer input is truncated
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackendKind::default(),
            model_repo: DEFAULT_MODEL_REPO.to_string(),
            max_tokens: EMBEDDING_MAX_TOKENS,
            dimensions: EMBEDDING_DIMENSIONS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_feed_limit")]
    pub default_limit: usize,

    #[serde(default = "default_feed_max_limit")]
    pub max_limit: usize,

    /// Items at or below this cosine similarity are excluded from filtered feeds
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

impl FeedConfig {
    /// Clamp a caller-supplied page size to `[1, max_limit]`.
    pub fn limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_limit: FEED_DEFAULT_LIMIT,
            max_limit: FEED_MAX_LIMIT,
            similarity_threshold: FEED_SIMILARITY_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    /// Outbound messages buffered per live connection before it is evicted
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: HUB_SUBSCRIBER_BUFFER,
            intake_capacity: HUB_INTAKE_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UploadConfig {
    #[serde(default = "default_upload_max_bytes")]
    pub max_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: UPLOAD_MAX_BYTES,
        }
    }
}

/// Image inserted on startup when the store is empty.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SeedImage {
    pub path: PathBuf,
    pub title: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub thumbnail: ThumbnailConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub seeds: Vec<SeedImage>,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            pipeline: PipelineConfig::default(),
            thumbnail: ThumbnailConfig::default(),
            embedding: EmbeddingConfig::default(),
            feed: FeedConfig::default(),
            hub: HubConfig::default(),
            upload: UploadConfig::default(),
            seeds: Vec::new(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_workers() -> usize {
    PIPELINE_WORKERS
}

fn default_queue_capacity() -> usize {
    PIPELINE_QUEUE_CAPACITY
}

fn default_thumbnail_size() -> u32 {
    THUMBNAIL_SIZE
}

fn default_thumbnail_quality() -> u8 {
    THUMBNAIL_QUALITY
}

fn default_model_repo() -> String {
    DEFAULT_MODEL_REPO.to_string()
}

fn default_max_tokens() -> usize {
    EMBEDDING_MAX_TOKENS
}

fn default_dimensions() -> usize {
    EMBEDDING_DIMENSIONS
}

fn default_feed_limit() -> usize {
    FEED_DEFAULT_LIMIT
}

fn default_feed_max_limit() -> usize {
    FEED_MAX_LIMIT
}

fn default_similarity_threshold() -> f32 {
    FEED_SIMILARITY_THRESHOLD
}

fn default_subscriber_buffer() -> usize {
    HUB_SUBSCRIBER_BUFFER
}

fn default_intake_capacity() -> usize {
    HUB_INTAKE_CAPACITY
}

fn default_upload_max_bytes() -> usize {
    UPLOAD_MAX_BYTES
}

/// Data directory: `PIXFEED_BASE_PATH`, else `~/.local/share/pixfeed`.
pub fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("PIXFEED_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("couldnt find home dir")?
        .context("couldnt find home dir")?;

    Ok(home.join(".local/share/pixfeed"))
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be greater than 0");
        }
        if self.pipeline.queue_capacity == 0 {
            bail!("pipeline.queue_capacity must be greater than 0");
        }

        if self.thumbnail.size < 16 {
            bail!(
                "thumbnail.size must be at least 16, got {}",
                self.thumbnail.size
            );
        }
        if !(1..=100).contains(&self.thumbnail.quality) {
            bail!(
                "thumbnail.quality must be between 1 and 100, got {}",
                self.thumbnail.quality
            );
        }

        if self.embedding.max_tokens == 0 || self.embedding.dimensions == 0 {
            bail!("embedding.max_tokens and embedding.dimensions must be greater than 0");
        }
        if self.embedding.dimensions > u16::MAX as usize {
            bail!(
                "embedding.dimensions must be at most {}, got {}",
                u16::MAX,
                self.embedding.dimensions
            );
        }

        let feed = &self.feed;
        if feed.default_limit == 0 || feed.max_limit == 0 {
            bail!("feed limits must be greater than 0");
        }
        if feed.default_limit > feed.max_limit {
            bail!(
                "feed.default_limit ({}) exceeds feed.max_limit ({})",
                feed.default_limit,
                feed.max_limit
            );
        }
        if !(-1.0..=1.0).contains(&feed.similarity_threshold) {
            bail!(
                "feed.similarity_threshold must be between -1.0 and 1.0, got {}",
                feed.similarity_threshold
            );
        }

        if self.hub.subscriber_buffer == 0 || self.hub.intake_capacity == 0 {
            bail!("hub buffers must be greater than 0");
        }

        for (idx, seed) in self.seeds.iter().enumerate() {
            if seed.title.is_empty() || seed.tags.is_empty() {
                bail!("seed #{} needs a title and at least one tag", idx + 1);
            }
        }

        Ok(())
    }

    pub fn load_with(base_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base_path = base_path.as_ref();
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(
                CONFIG_FILE,
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.base_path.join("uploads")
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.base_path.join("thumbnails")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.base_path.join("models")
    }
}
