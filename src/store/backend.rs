use std::{
    cmp::Ordering,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Instant,
};

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use csv::StringRecord;

use super::{
    vectors::VectorStorage, Item, ItemStatus, NewItem, RecentKey, RecordStore, ScoredItem,
    SimilarKey,
};
use crate::embedding::cosine_similarity;

const ITEMS_FILE: &str = "items.csv";
const VECTORS_FILE: &str = "vectors.bin";

const CSV_HEADERS: [&str; 12] = [
    "id",
    "title",
    "tags",
    "filename",
    "size",
    "mime",
    "checksum",
    "storage_path",
    "image_url",
    "thumbnail_path",
    "status",
    "created_at",
];

/// Item rows in `items.csv`, embeddings in `vectors.bin`.
///
/// Everything lives in memory behind one lock and each mutation is persisted
/// before the lock is released.
#[derive(Debug)]
pub struct BackendCsv {
    list: RwLock<Vec<Item>>,
    items_path: PathBuf,
    vectors: VectorStorage,
    dimensions: usize,
}

fn field<'a>(record: &'a StringRecord, idx: usize, name: &str) -> anyhow::Result<&'a str> {
    record
        .get(idx)
        .ok_or_else(|| anyhow!("couldnt get record {name}"))
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_record(record: &StringRecord) -> anyhow::Result<Item> {
    let id = field(record, 0, "id")?.parse::<u64>()?;
    let tags: Vec<String> =
        serde_json::from_str(field(record, 2, "tags")?).context("malformed tags")?;
    let created_at = DateTime::parse_from_rfc3339(field(record, 11, "created_at")?)
        .context("malformed created_at")?
        .with_timezone(&Utc);

    Ok(Item {
        id,
        title: field(record, 1, "title")?.to_string(),
        tags,
        filename: field(record, 3, "filename")?.to_string(),
        size: field(record, 4, "size")?.parse::<u64>()?,
        mime: field(record, 5, "mime")?.to_string(),
        checksum: field(record, 6, "checksum")?.to_string(),
        storage_path: field(record, 7, "storage_path")?.to_string(),
        image_url: field(record, 8, "image_url")?.to_string(),
        embedding: Vec::new(),
        thumbnail_path: optional(field(record, 9, "thumbnail_path")?),
        status: field(record, 10, "status")?.parse()?,
        created_at,
    })
}

/// Strict "comes after" in (score desc, id desc) order.
fn is_after(score: f32, id: u64, key: &SimilarKey) -> bool {
    score < key.score || (score == key.score && id < key.id)
}

impl BackendCsv {
    pub fn load(dir: impl AsRef<Path>, dimensions: usize) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let items_path = dir.join(ITEMS_FILE);
        if let Err(err) = std::fs::metadata(&items_path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new database at {:?}", items_path);
                    let mut csv_wrt = csv::Writer::from_path(&items_path)?;
                    csv_wrt.write_record(CSV_HEADERS)?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(&items_path)?;

        let mut items = vec![];
        for record in csv_reader.records() {
            items.push(parse_record(&record?)?);
        }

        let vectors = VectorStorage::new(dir.join(VECTORS_FILE));
        let mut stored = if vectors.exists() {
            vectors
                .load(dimensions)
                .with_context(|| format!("failed to load {:?}", vectors.path()))?
        } else {
            Default::default()
        };

        for item in items.iter_mut() {
            item.embedding = stored
                .remove(&item.id)
                .unwrap_or_else(|| vec![0.0; dimensions]);
        }

        log::debug!(
            "took {}ms to read {} items",
            now.elapsed().as_micros() as f64 / 1000.0,
            items.len()
        );

        Ok(Self {
            list: RwLock::new(items),
            items_path,
            vectors,
            dimensions,
        })
    }

    fn read(&self) -> anyhow::Result<RwLockReadGuard<'_, Vec<Item>>> {
        self.list
            .read()
            .map_err(|_| anyhow!("record store lock poisoned"))
    }

    fn write(&self) -> anyhow::Result<RwLockWriteGuard<'_, Vec<Item>>> {
        self.list
            .write()
            .map_err(|_| anyhow!("record store lock poisoned"))
    }

    fn save_items(&self, items: &[Item]) -> anyhow::Result<()> {
        let temp_path = self.items_path.with_extension("csv-tmp");

        let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
        csv_wrt.write_record(CSV_HEADERS)?;
        for item in items {
            csv_wrt.write_record([
                &item.id.to_string(),
                &item.title,
                &serde_json::to_string(&item.tags)?,
                &item.filename,
                &item.size.to_string(),
                &item.mime,
                &item.checksum,
                &item.storage_path,
                &item.image_url,
                &item.thumbnail_path.clone().unwrap_or_default(),
                &item.status.to_string(),
                &item
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Nanos, true),
            ])?;
        }
        csv_wrt.flush()?;
        drop(csv_wrt);

        std::fs::rename(&temp_path, &self.items_path)?;
        Ok(())
    }

    fn save_vectors(&self, items: &[Item]) -> anyhow::Result<()> {
        let entries = items
            .iter()
            .map(|item| (item.id, item.embedding.as_slice()))
            .collect::<Vec<_>>();
        self.vectors.save(self.dimensions, entries.into_iter())?;
        Ok(())
    }

    fn position(items: &[Item], id: u64) -> anyhow::Result<usize> {
        items
            .iter()
            .position(|item| item.id == id)
            .ok_or_else(|| anyhow!("item {} not found", id))
    }
}

impl RecordStore for BackendCsv {
    fn insert(&self, new_item: NewItem, placeholder_embedding: Vec<f32>) -> anyhow::Result<Item> {
        if placeholder_embedding.len() != self.dimensions {
            bail!(
                "placeholder embedding has {} dimensions, expected {}",
                placeholder_embedding.len(),
                self.dimensions
            );
        }

        let mut items = self.write()?;

        let id = items.last().map(|last| last.id + 1).unwrap_or(1);

        // creation times never go backwards, even if the wall clock does
        let mut created_at = Utc::now();
        if let Some(last) = items.last() {
            created_at = created_at.max(last.created_at + chrono::Duration::nanoseconds(1));
        }
        let item = Item {
            id,
            title: new_item.title,
            tags: new_item.tags,
            filename: new_item.filename,
            size: new_item.size,
            mime: new_item.mime,
            checksum: new_item.checksum,
            storage_path: new_item.storage_path,
            image_url: new_item.image_url,
            embedding: placeholder_embedding,
            thumbnail_path: None,
            status: ItemStatus::Pending,
            created_at,
        };

        items.push(item.clone());
        if let Err(err) = self.save_items(&items) {
            items.pop();
            return Err(err.context("failed to persist new item"));
        }

        Ok(item)
    }

    fn update_status(&self, id: u64, status: ItemStatus) -> anyhow::Result<()> {
        let mut items = self.write()?;
        let idx = Self::position(&items, id)?;

        let previous = items[idx].status;
        items[idx].status = status;

        if let Err(err) = self.save_items(&items) {
            items[idx].status = previous;
            return Err(err);
        }

        Ok(())
    }

    fn update_result(
        &self,
        id: u64,
        thumbnail_ref: &str,
        embedding: Vec<f32>,
    ) -> anyhow::Result<()> {
        if embedding.len() != self.dimensions {
            bail!(
                "embedding has {} dimensions, expected {}",
                embedding.len(),
                self.dimensions
            );
        }

        let mut items = self.write()?;
        let idx = Self::position(&items, id)?;

        let previous = items[idx].clone();
        items[idx].thumbnail_path = Some(thumbnail_ref.to_string());
        items[idx].embedding = embedding;
        items[idx].status = ItemStatus::Ready;

        // vectors first: a crash in between leaves the row unfinished, never
        // `ready` with a stale embedding
        let result = self
            .save_vectors(&items)
            .and_then(|_| self.save_items(&items));

        if let Err(err) = result {
            items[idx] = previous;
            return Err(err);
        }

        Ok(())
    }

    fn query_recent(&self, limit: usize, before: Option<&RecentKey>) -> anyhow::Result<Vec<Item>> {
        let items = self.read()?;

        let mut output = items
            .iter()
            .filter(|item| item.status == ItemStatus::Ready)
            .filter(|item| before.map_or(true, |key| item.recent_key() < *key))
            .collect::<Vec<_>>();

        output.sort_by(|a, b| b.recent_key().cmp(&a.recent_key()));

        Ok(output.into_iter().take(limit).cloned().collect())
    }

    fn query_similar(
        &self,
        vector: &[f32],
        threshold: f32,
        limit: usize,
        after: Option<&SimilarKey>,
    ) -> anyhow::Result<Vec<ScoredItem>> {
        if vector.len() != self.dimensions {
            bail!(
                "query vector has {} dimensions, expected {}",
                vector.len(),
                self.dimensions
            );
        }

        let items = self.read()?;

        let mut scored = items
            .iter()
            .filter(|item| item.status == ItemStatus::Ready)
            .filter_map(|item| {
                let score = cosine_similarity(vector, &item.embedding);
                (score > threshold).then_some((score, item))
            })
            .filter(|(score, item)| after.map_or(true, |key| is_after(*score, item.id, key)))
            .collect::<Vec<_>>();

        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.id.cmp(&a.id))
        });

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, item)| ScoredItem {
                item: item.clone(),
                score,
            })
            .collect())
    }

    fn scan_pending(&self) -> anyhow::Result<Vec<Item>> {
        let items = self.read()?;
        Ok(items
            .iter()
            .filter(|item| item.status == ItemStatus::Pending)
            .cloned()
            .collect())
    }

    fn get(&self, id: u64) -> anyhow::Result<Option<Item>> {
        let items = self.read()?;
        Ok(items.iter().find(|item| item.id == id).cloned())
    }

    fn find_by_checksum(&self, checksum: &str) -> anyhow::Result<Option<Item>> {
        let items = self.read()?;
        Ok(items.iter().find(|item| item.checksum == checksum).cloned())
    }

    fn count(&self) -> anyhow::Result<usize> {
        Ok(self.read()?.len())
    }
}
