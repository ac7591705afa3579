use std::{
    collections::HashSet,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::errors::AppError;
use crate::{
    config::{SeedImage, UploadConfig},
    pipeline::{Job, Pipeline},
    storage::StorageManager,
    store::{Item, ItemStatus, NewItem, RecordStore},
};

const ALLOWED_MIME: [&str; 4] = ["image/jpeg", "image/png", "image/webp", "image/gif"];

#[derive(Clone, Default)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub title: String,
    pub tags: Vec<String>,
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Upload {{ bytes: [{} bytes], filename: {:?}, title: {:?}, tags: {:?} }}",
            self.bytes.len(),
            self.filename,
            self.title,
            self.tags
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadResponse {
    pub id: u64,
    pub title: String,
    pub tags: Vec<String>,
    pub image_url: String,
    pub status: String,
}

/// Public view of one item, whatever its status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemView {
    pub id: u64,
    pub title: String,
    pub tags: Vec<String>,
    pub image_url: String,
    pub thumbnail_url: Option<String>,
    pub status: ItemStatus,
    pub created_at: DateTime<Utc>,
}

impl From<Item> for ItemView {
    fn from(item: Item) -> Self {
        Self {
            id: item.id,
            title: item.title,
            tags: item.tags,
            image_url: item.image_url,
            thumbnail_url: item.thumbnail_path,
            status: item.status,
            created_at: item.created_at,
        }
    }
}

/// Trimmed, non-empty, first occurrence wins.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Sniff the content type and accept only the supported image formats.
pub fn detect_mime(bytes: &[u8]) -> Option<&'static str> {
    infer::get(bytes)
        .map(|kind| kind.mime_type())
        .filter(|mime| ALLOWED_MIME.contains(mime))
}

fn basename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "upload".to_string())
}

/// Accepts uploads, records them as `pending` and hands them to the pipeline.
pub struct IngestService {
    store: Arc<dyn RecordStore>,
    uploads: Arc<dyn StorageManager>,
    pipeline: Arc<Pipeline>,
    config: UploadConfig,
    dimensions: usize,
    // serializes the duplicate check with the insert
    intake: Mutex<()>,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        uploads: Arc<dyn StorageManager>,
        pipeline: Arc<Pipeline>,
        config: UploadConfig,
        dimensions: usize,
    ) -> Self {
        Self {
            store,
            uploads,
            pipeline,
            config,
            dimensions,
            intake: Mutex::new(()),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.config.max_bytes
    }

    pub fn upload(&self, upload: Upload) -> Result<UploadResponse, AppError> {
        let title = upload.title.trim().to_string();
        if title.is_empty() {
            return Err(AppError::InvalidInput("title is required".to_string()));
        }

        let tags = normalize_tags(upload.tags);
        if tags.is_empty() {
            return Err(AppError::InvalidInput(
                "at least one tag is required".to_string(),
            ));
        }

        if upload.bytes.is_empty() {
            return Err(AppError::InvalidInput("image is required".to_string()));
        }
        if upload.bytes.len() > self.config.max_bytes {
            return Err(AppError::InvalidInput(format!(
                "image exceeds {} bytes",
                self.config.max_bytes
            )));
        }

        let mime = detect_mime(&upload.bytes)
            .ok_or_else(|| AppError::InvalidInput("unsupported image format".to_string()))?;
        let checksum = checksum(&upload.bytes);

        let guard = self
            .intake
            .lock()
            .map_err(|_| AppError::Other(anyhow!("ingest lock poisoned")))?;

        if let Some(existing) = self.store.find_by_checksum(&checksum)? {
            return Err(AppError::AlreadyExists(existing.id));
        }

        let filename = basename(&upload.filename);
        let stored_name = format!(
            "{}_{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            filename
        );
        self.uploads.write(&stored_name, &upload.bytes)?;

        let new_item = NewItem {
            title,
            tags,
            filename,
            size: upload.bytes.len() as u64,
            mime: mime.to_string(),
            checksum,
            storage_path: self
                .uploads
                .path_of(&stored_name)
                .to_string_lossy()
                .to_string(),
            image_url: format!("/uploads/{stored_name}"),
        };

        let item = match self.store.insert(new_item, vec![0.0; self.dimensions]) {
            Ok(item) => item,
            Err(err) => {
                if let Err(rm_err) = self.uploads.delete(&stored_name) {
                    log::warn!("couldnt remove {stored_name} after failed insert: {rm_err}");
                }
                return Err(err.into());
            }
        };

        drop(guard);

        match self.pipeline.enqueue(Job::from(&item)) {
            Ok(()) => log::debug!("queued item {}", item.id),
            // item stays pending and is picked up by the next recovery scan
            Err(err) => log::warn!("item {} not queued: {err}", item.id),
        }

        Ok(UploadResponse {
            id: item.id,
            title: item.title,
            tags: item.tags,
            image_url: item.image_url,
            status: "processing".to_string(),
        })
    }

    pub fn item(&self, id: u64) -> Result<ItemView, AppError> {
        self.store
            .get(id)?
            .map(ItemView::from)
            .ok_or(AppError::NotFound)
    }

    /// Upload the configured seed images when the store is empty. Paths are
    /// resolved against `base_path` unless absolute. Returns how many were
    /// added.
    pub fn seed(&self, seeds: &[SeedImage], base_path: &Path) -> anyhow::Result<usize> {
        if seeds.is_empty() || self.store.count()? > 0 {
            return Ok(0);
        }

        log::info!("seeding {} initial images", seeds.len());

        let mut seeded = 0;
        for seed in seeds {
            let path = base_path.join(&seed.path);

            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    log::warn!("failed to seed {:?}: {err}", path);
                    continue;
                }
            };

            let upload = Upload {
                bytes,
                filename: seed.path.to_string_lossy().to_string(),
                title: seed.title.clone(),
                tags: seed.tags.clone(),
            };

            match self.upload(upload) {
                Ok(response) => {
                    log::info!("seeded: {} (id {})", response.title, response.id);
                    seeded += 1;
                }
                Err(err) => log::warn!("failed to seed {:?}: {err}", path),
            }
        }

        Ok(seeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_tags() {
        let tags = vec![
            " cat ".to_string(),
            "".to_string(),
            "cute".to_string(),
            "cat".to_string(),
            "   ".to_string(),
        ];
        assert_eq!(normalize_tags(tags), vec!["cat", "cute"]);
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_detect_mime() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(detect_mime(&png), Some("image/png"));
        assert_eq!(detect_mime(b"GIF89a......"), Some("image/gif"));
        assert_eq!(detect_mime(b"%PDF-1.7 hello"), None);
        assert_eq!(detect_mime(b"plain text"), None);
    }

    #[test]
    fn test_basename_strips_directories() {
        assert_eq!(basename("../../etc/passwd"), "passwd");
        assert_eq!(basename("seeds/cat.png"), "cat.png");
        assert_eq!(basename(""), "upload");
    }
}
