mod pipeline;

use std::{
    io::Cursor,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{
    embedding::{EmbeddingEngine, EmbeddingError, InferenceBackend},
    pipeline::{CompletedItem, CompletionSink},
    store::{Item, ItemStatus, NewItem, RecordStore},
};

/// RIFF container carrying a WebP payload.
pub fn is_webp(data: &[u8]) -> bool {
    data.len() >= 12 && data[0..4] == *b"RIFF" && data[8..12] == *b"WEBP"
}

/// Words this backend knows, each mapped to its own axis.
pub const AXES: [&str; 4] = ["cat", "dog", "bird", "fish"];

/// Tiny backend where every known word is a one-hot token vector, so the
/// embedding of a text is the normalized mix of its words' axes.
pub struct AxisBackend;

impl InferenceBackend for AxisBackend {
    fn dimensions(&self) -> usize {
        AXES.len()
    }

    fn tokenize(
        &self,
        text: &str,
        ids: &mut [u32],
        mask: &mut [u32],
    ) -> Result<usize, EmbeddingError> {
        let mut count = 0;
        for word in text.split_whitespace() {
            if count == ids.len() {
                break;
            }
            if let Some(axis) = AXES.iter().position(|known| *known == word) {
                ids[count] = axis as u32 + 1;
                mask[count] = 1;
                count += 1;
            }
        }
        Ok(count)
    }

    fn forward(
        &mut self,
        ids: &[u32],
        _mask: &[u32],
        hidden: &mut [f32],
    ) -> Result<(), EmbeddingError> {
        hidden.fill(0.0);
        for (pos, id) in ids.iter().enumerate() {
            if *id > 0 {
                hidden[pos * AXES.len() + (*id as usize - 1)] = 1.0;
            }
        }
        Ok(())
    }
}

pub fn axis_engine() -> Arc<EmbeddingEngine> {
    Arc::new(EmbeddingEngine::new(Box::new(AxisBackend), 16))
}

/// Unit vector whose cosine similarity with the "cat" axis is `similarity`.
pub fn with_cat_similarity(similarity: f32) -> Vec<f32> {
    vec![similarity, (1.0 - similarity * similarity).sqrt(), 0.0, 0.0]
}

/// A real PNG; different shades give different checksums.
pub fn png_bytes(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([shade, 128, 255 - shade]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("failed to encode png");
    out.into_inner()
}

/// Insert an item and move it straight to `ready` with the given embedding.
pub fn insert_ready(store: &dyn RecordStore, title: &str, embedding: Vec<f32>) -> Item {
    let dims = embedding.len();
    let item = store
        .insert(
            NewItem {
                title: title.to_string(),
                tags: vec!["cat".to_string()],
                checksum: format!("sum-{title}"),
                image_url: format!("/uploads/{title}.png"),
                ..Default::default()
            },
            vec![0.0; dims],
        )
        .unwrap();
    store
        .update_result(item.id, &format!("/thumbnails/thumb_{}.webp", item.id), embedding)
        .unwrap();
    store.get(item.id).unwrap().unwrap()
}

/// Poll the store until the item reaches `status` or the deadline passes.
pub fn wait_for_status(store: &dyn RecordStore, id: u64, status: ItemStatus) -> Item {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let item = store.get(id).unwrap().expect("item disappeared");
        if item.status == status {
            return item;
        }
        assert!(
            Instant::now() < deadline,
            "item {id} stuck in {} waiting for {status}",
            item.status
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub completed: Mutex<Vec<CompletedItem>>,
}

impl CompletionSink for RecordingSink {
    fn item_completed(&self, item: &CompletedItem) {
        self.completed.lock().unwrap().push(item.clone());
    }
}
