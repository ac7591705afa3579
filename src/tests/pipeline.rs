use std::sync::Arc;

use super::{axis_engine, is_webp, png_bytes, RecordingSink, AXES};
use crate::{
    config::PipelineConfig,
    embedding::l2_norm,
    pipeline::{Job, Pipeline, PipelineContext},
    storage::BackendLocal,
    store::{
        BackendCsv, Item, ItemStatus, NewItem, RecentKey, RecordStore, ScoredItem, SimilarKey,
    },
    thumbnail::ImageThumbnailer,
};

struct Fixture {
    store: Arc<BackendCsv>,
    sink: Arc<RecordingSink>,
    pipeline: Pipeline,
    tmp: tempfile::TempDir,
}

fn fixture() -> Fixture {
    fixture_with(2, 16, |store| store)
}

/// Fixture whose pipeline sees the csv store through `wrap`.
fn fixture_with(
    workers: usize,
    queue_capacity: usize,
    wrap: impl FnOnce(Arc<dyn RecordStore>) -> Arc<dyn RecordStore>,
) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(BackendCsv::load(tmp.path().join("db"), AXES.len()).unwrap());
    let sink = Arc::new(RecordingSink::default());
    let shared: Arc<dyn RecordStore> = store.clone();

    let pipeline = Pipeline::start(
        &PipelineConfig {
            workers,
            queue_capacity,
        },
        PipelineContext {
            store: wrap(shared),
            thumbnailer: Arc::new(ImageThumbnailer::new(32, 80)),
            thumbnails: Arc::new(BackendLocal::new(tmp.path().join("thumbnails")).unwrap()),
            engine: axis_engine(),
            sink: sink.clone(),
        },
    );

    Fixture {
        store,
        sink,
        pipeline,
        tmp,
    }
}

/// Store that loses every result write.
struct ResultWriteFails(Arc<dyn RecordStore>);

impl RecordStore for ResultWriteFails {
    fn insert(&self, item: NewItem, placeholder_embedding: Vec<f32>) -> anyhow::Result<Item> {
        self.0.insert(item, placeholder_embedding)
    }

    fn update_status(&self, id: u64, status: ItemStatus) -> anyhow::Result<()> {
        self.0.update_status(id, status)
    }

    fn update_result(
        &self,
        _id: u64,
        _thumbnail_ref: &str,
        _embedding: Vec<f32>,
    ) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }

    fn query_recent(&self, limit: usize, before: Option<&RecentKey>) -> anyhow::Result<Vec<Item>> {
        self.0.query_recent(limit, before)
    }

    fn query_similar(
        &self,
        vector: &[f32],
        threshold: f32,
        limit: usize,
        after: Option<&SimilarKey>,
    ) -> anyhow::Result<Vec<ScoredItem>> {
        self.0.query_similar(vector, threshold, limit, after)
    }

    fn scan_pending(&self) -> anyhow::Result<Vec<Item>> {
        self.0.scan_pending()
    }

    fn get(&self, id: u64) -> anyhow::Result<Option<Item>> {
        self.0.get(id)
    }

    fn find_by_checksum(&self, checksum: &str) -> anyhow::Result<Option<Item>> {
        self.0.find_by_checksum(checksum)
    }

    fn count(&self) -> anyhow::Result<usize> {
        self.0.count()
    }
}

fn insert_pending(fx: &Fixture, name: &str, source: &[u8], tags: &[&str]) -> Item {
    let path = fx.tmp.path().join(name);
    std::fs::write(&path, source).unwrap();

    fx.store
        .insert(
            NewItem {
                title: name.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                checksum: format!("sum-{name}"),
                storage_path: path.to_string_lossy().to_string(),
                image_url: format!("/uploads/{name}"),
                ..Default::default()
            },
            vec![0.0; AXES.len()],
        )
        .unwrap()
}

#[test]
pub fn test_item_becomes_ready() {
    let fx = fixture();
    let item = insert_pending(&fx, "cat.png", &png_bytes(80, 40, 10), &["cat", "dog"]);
    assert_eq!(item.status, ItemStatus::Pending);

    fx.pipeline.enqueue(Job::from(&item)).unwrap();
    fx.pipeline.shutdown();

    let item = fx.store.get(item.id).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Ready);

    let thumbnail_url = format!("/thumbnails/thumb_{}.webp", item.id);
    assert_eq!(item.thumbnail_path.as_deref(), Some(thumbnail_url.as_str()));

    let thumb = std::fs::read(
        fx.tmp
            .path()
            .join(format!("thumbnails/thumb_{}.webp", item.id)),
    )
    .unwrap();
    assert!(is_webp(&thumb));

    assert_eq!(item.embedding.len(), AXES.len());
    assert!((l2_norm(&item.embedding) - 1.0).abs() < 1e-5);
    // "cat dog" pools to the midpoint of both axes
    assert!((item.embedding[0] - item.embedding[1]).abs() < 1e-6);

    let completed = fx.sink.completed.lock().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, item.id);
    assert_eq!(completed[0].thumbnail_url, thumbnail_url);
    assert_eq!(completed[0].tags, vec!["cat", "dog"]);
}

#[test]
pub fn test_failed_item_is_not_announced() {
    let fx = fixture();
    let item = insert_pending(&fx, "broken.png", b"definitely not an image", &["cat"]);

    fx.pipeline.enqueue(Job::from(&item)).unwrap();
    fx.pipeline.shutdown();

    let item = fx.store.get(item.id).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.thumbnail_path, None);
    assert!(fx.sink.completed.lock().unwrap().is_empty());
}

#[test]
pub fn test_missing_source_fails_item() {
    let fx = fixture();
    let item = insert_pending(&fx, "gone.png", &png_bytes(8, 8, 1), &["cat"]);
    std::fs::remove_file(&item.storage_path).unwrap();

    fx.pipeline.enqueue(Job::from(&item)).unwrap();
    fx.pipeline.shutdown();

    assert_eq!(
        fx.store.get(item.id).unwrap().unwrap().status,
        ItemStatus::Failed
    );
}

#[test]
pub fn test_unembeddable_tags_fail_item() {
    let fx = fixture();
    // no known words, so nothing survives tokenization
    let item = insert_pending(&fx, "odd.png", &png_bytes(20, 20, 3), &["zebra"]);

    fx.pipeline.enqueue(Job::from(&item)).unwrap();
    fx.pipeline.shutdown();

    assert_eq!(
        fx.store.get(item.id).unwrap().unwrap().status,
        ItemStatus::Failed
    );
    assert!(fx.sink.completed.lock().unwrap().is_empty());
}

#[test]
pub fn test_recover_processes_pending_items() {
    let fx = fixture();
    let items = (0..3)
        .map(|i| insert_pending(&fx, &format!("p{i}.png"), &png_bytes(16, 16, i), &["bird"]))
        .collect::<Vec<_>>();

    assert_eq!(fx.pipeline.recover().unwrap(), 3);
    fx.pipeline.shutdown();

    for item in items {
        assert_eq!(
            fx.store.get(item.id).unwrap().unwrap().status,
            ItemStatus::Ready
        );
    }
    assert!(fx.store.scan_pending().unwrap().is_empty());
    assert_eq!(fx.sink.completed.lock().unwrap().len(), 3);
}

#[test]
pub fn test_ready_items_survive_reload() {
    let fx = fixture();
    let item = insert_pending(&fx, "keep.png", &png_bytes(24, 48, 99), &["fish"]);

    fx.pipeline.enqueue(Job::from(&item)).unwrap();
    fx.pipeline.shutdown();

    let reloaded = BackendCsv::load(fx.tmp.path().join("db"), AXES.len()).unwrap();
    let item = reloaded.get(item.id).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Ready);
    assert_eq!(item.embedding, vec![0.0, 0.0, 0.0, 1.0]);
}

#[test]
pub fn test_result_write_failure_fails_item() {
    let fx = fixture_with(1, 4, |store| -> Arc<dyn RecordStore> {
        Arc::new(ResultWriteFails(store))
    });
    let item = insert_pending(&fx, "full.png", &png_bytes(30, 30, 5), &["dog"]);

    fx.pipeline.enqueue(Job::from(&item)).unwrap();
    fx.pipeline.shutdown();

    let stored = fx.store.get(item.id).unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Failed);
    assert_eq!(stored.thumbnail_path, None);
    assert!(fx.sink.completed.lock().unwrap().is_empty());

    // the thumbnail was written before the store refused the result
    let thumb = fx
        .tmp
        .path()
        .join(format!("thumbnails/thumb_{}.webp", item.id));
    assert!(is_webp(&std::fs::read(thumb).unwrap()));
}

#[test]
pub fn test_recover_all_clears_backlog_beyond_capacity() {
    let fx = fixture_with(1, 2, |store| store);
    let items = (0..6)
        .map(|i| insert_pending(&fx, &format!("b{i}.png"), &png_bytes(12, 12, i), &["fish"]))
        .collect::<Vec<_>>();

    assert_eq!(fx.pipeline.recover_all().unwrap(), 6);
    fx.pipeline.shutdown();

    for item in &items {
        assert_eq!(
            fx.store.get(item.id).unwrap().unwrap().status,
            ItemStatus::Ready
        );
    }
    assert!(fx.store.scan_pending().unwrap().is_empty());
    assert_eq!(fx.sink.completed.lock().unwrap().len(), 6);
}
