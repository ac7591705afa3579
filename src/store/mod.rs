//! Durable item records and the query primitives the pipeline and feed use.

mod backend;
mod vectors;

use std::{cmp::Ordering, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use backend::BackendCsv;
pub use vectors::{VectorStorage, VectorStorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Ready => "ready",
            ItemStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ItemStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "processing" => Ok(ItemStatus::Processing),
            "ready" => Ok(ItemStatus::Ready),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(anyhow::anyhow!("unknown item status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,

    pub title: String,
    pub tags: Vec<String>,

    pub filename: String,
    pub size: u64,
    pub mime: String,
    /// SHA-256 of the uploaded bytes, hex encoded
    pub checksum: String,
    pub storage_path: String,
    pub image_url: String,

    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub thumbnail_path: Option<String>,

    pub status: ItemStatus,
    pub created_at: DateTime<Utc>,
}

impl Item {
    pub fn recent_key(&self) -> RecentKey {
        RecentKey {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewItem {
    pub title: String,
    pub tags: Vec<String>,
    pub filename: String,
    pub size: u64,
    pub mime: String,
    pub checksum: String,
    pub storage_path: String,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredItem {
    pub item: Item,
    pub score: f32,
}

impl ScoredItem {
    pub fn similar_key(&self) -> SimilarKey {
        SimilarKey {
            score: self.score,
            id: self.item.id,
        }
    }
}

/// Position in a recency-ordered listing: (created_at desc, id desc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentKey {
    pub created_at: DateTime<Utc>,
    pub id: u64,
}

impl PartialOrd for RecentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Position in a similarity-ordered listing: (score desc, id desc).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarKey {
    pub score: f32,
    pub id: u64,
}

pub trait RecordStore: Send + Sync {
    /// Add a `pending` item carrying the placeholder embedding.
    fn insert(&self, item: NewItem, placeholder_embedding: Vec<f32>) -> anyhow::Result<Item>;
    fn update_status(&self, id: u64, status: ItemStatus) -> anyhow::Result<()>;
    /// Set thumbnail, embedding and `ready` in one persisted write.
    fn update_result(&self, id: u64, thumbnail_ref: &str, embedding: Vec<f32>)
        -> anyhow::Result<()>;
    /// `ready` items strictly after `before`, newest first.
    fn query_recent(&self, limit: usize, before: Option<&RecentKey>) -> anyhow::Result<Vec<Item>>;
    /// `ready` items with cosine similarity above `threshold`, strictly after
    /// `after`, best match first.
    fn query_similar(
        &self,
        vector: &[f32],
        threshold: f32,
        limit: usize,
        after: Option<&SimilarKey>,
    ) -> anyhow::Result<Vec<ScoredItem>>;
    fn scan_pending(&self) -> anyhow::Result<Vec<Item>>;
    fn get(&self, id: u64) -> anyhow::Result<Option<Item>>;
    fn find_by_checksum(&self, checksum: &str) -> anyhow::Result<Option<Item>>;
    fn count(&self) -> anyhow::Result<usize>;
}
