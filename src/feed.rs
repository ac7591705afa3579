//! Paginated feed of `ready` items.
//!
//! Without a filter the feed is newest first. With a filter the text is
//! embedded and items are ranked by cosine similarity, keeping only those
//! above the configured threshold.
//!
//! Cursors are opaque to clients. Each one encodes the sort key of the last
//! item on the page it came from: (created_at, id) in recent mode and
//! (similarity, id) in filtered mode, so walking the pages never skips or
//! repeats an item as long as the underlying data does not change.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::FeedConfig,
    embedding::{EmbeddingEngine, EmbeddingError},
    store::{Item, RecentKey, RecordStore, SimilarKey},
};

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("couldnt embed filter: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("feed query failed: {0:#}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
enum Cursor {
    Recent { created_at: DateTime<Utc>, id: u64 },
    // f32 bits keep the score exact across the round trip
    Similar { score_bits: u32, id: u64 },
}

impl Cursor {
    fn encode(&self) -> Result<String, FeedError> {
        let json = serde_json::to_vec(self).map_err(|err| FeedError::Store(err.into()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    fn decode(value: &str) -> Result<Self, FeedError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|err| FeedError::InvalidCursor(err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| FeedError::InvalidCursor(err.to_string()))
    }
}

impl From<RecentKey> for Cursor {
    fn from(key: RecentKey) -> Self {
        Cursor::Recent {
            created_at: key.created_at,
            id: key.id,
        }
    }
}

impl From<SimilarKey> for Cursor {
    fn from(key: SimilarKey) -> Self {
        Cursor::Similar {
            score_bits: key.score.to_bits(),
            id: key.id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeedQuery {
    pub filter: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedItem {
    pub id: u64,
    pub title: String,
    pub tags: Vec<String>,
    pub image_url: String,
    pub thumbnail_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl FeedItem {
    fn new(item: Item, score: Option<f32>) -> Self {
        Self {
            id: item.id,
            title: item.title,
            tags: item.tags,
            image_url: item.image_url,
            thumbnail_url: item.thumbnail_path.unwrap_or_default(),
            created_at: item.created_at,
            score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    /// Present only when the page is full
    pub next_cursor: Option<String>,
    pub filter: String,
}

pub struct FeedService {
    store: Arc<dyn RecordStore>,
    engine: Arc<EmbeddingEngine>,
    config: FeedConfig,
}

impl FeedService {
    pub fn new(store: Arc<dyn RecordStore>, engine: Arc<EmbeddingEngine>, config: FeedConfig) -> Self {
        Self {
            store,
            engine,
            config,
        }
    }

    /// Blocks on the embedding engine in filtered mode.
    pub fn query(&self, query: FeedQuery) -> Result<FeedPage, FeedError> {
        let limit = self.config.limit(query.limit);
        let filter = query
            .filter
            .map(|filter| filter.trim().to_string())
            .unwrap_or_default();
        let cursor = query
            .cursor
            .filter(|cursor| !cursor.is_empty())
            .map(|cursor| Cursor::decode(&cursor))
            .transpose()?;

        let (items, last) = if filter.is_empty() {
            self.recent(limit, cursor)?
        } else {
            self.similar(&filter, limit, cursor)?
        };

        let next_cursor = match last {
            Some(last) if items.len() == limit => Some(last.encode()?),
            _ => None,
        };

        Ok(FeedPage {
            items,
            next_cursor,
            filter,
        })
    }

    fn recent(
        &self,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<(Vec<FeedItem>, Option<Cursor>), FeedError> {
        let before = match cursor {
            None => None,
            Some(Cursor::Recent { created_at, id }) => Some(RecentKey { created_at, id }),
            Some(Cursor::Similar { .. }) => {
                return Err(FeedError::InvalidCursor(
                    "similarity cursor used without a filter".to_string(),
                ))
            }
        };

        let items = self.store.query_recent(limit, before.as_ref())?;
        let last = items.last().map(|item| Cursor::from(item.recent_key()));

        Ok((
            items
                .into_iter()
                .map(|item| FeedItem::new(item, None))
                .collect(),
            last,
        ))
    }

    fn similar(
        &self,
        filter: &str,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<(Vec<FeedItem>, Option<Cursor>), FeedError> {
        let after = match cursor {
            None => None,
            Some(Cursor::Similar { score_bits, id }) => Some(SimilarKey {
                score: f32::from_bits(score_bits),
                id,
            }),
            Some(Cursor::Recent { .. }) => {
                return Err(FeedError::InvalidCursor(
                    "recency cursor used with a filter".to_string(),
                ))
            }
        };

        let vector = self.engine.embed(filter)?;
        let scored = self.store.query_similar(
            &vector,
            self.config.similarity_threshold,
            limit,
            after.as_ref(),
        )?;
        let last = scored.last().map(|scored| Cursor::from(scored.similar_key()));

        Ok((
            scored
                .into_iter()
                .map(|scored| FeedItem::new(scored.item, Some(scored.score)))
                .collect(),
            last,
        ))
    }
}
