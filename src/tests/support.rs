//! Shared fixtures: an isolated item store and a deterministic embedder.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;

use crate::{
    embeddings::{prepare_input, EmbeddingError, TextEmbedder},
    ids::ItemId,
    items::{BackendJson, Embedding, Item, ItemCreate, ItemStore, ITEMS_FILE},
    storage::{self, StorageManager},
};

pub const TEST_MODEL: &str = "test-bow";
pub const TEST_DIMENSIONS: usize = 16;

/// Counts blob writes, for asserting how often the item file is rewritten.
pub struct CountingStorage {
    inner: storage::BackendLocal,
    writes: AtomicUsize,
}

impl CountingStorage {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.writes.store(0, Ordering::SeqCst);
    }
}

impl StorageManager for CountingStorage {
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(ident, data)
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        self.inner.read(ident)
    }

    fn exists(&self, ident: &str) -> bool {
        self.inner.exists(ident)
    }
}

/// Like [`create_store`], with a handle on the write counter.
pub fn create_counting_store() -> (Arc<BackendJson>, Arc<CountingStorage>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let counting = Arc::new(CountingStorage {
        inner: storage::BackendLocal::new(tmp.path()).expect("failed to create storage"),
        writes: AtomicUsize::new(0),
    });
    let store =
        BackendJson::load(counting.clone(), ITEMS_FILE).expect("failed to load item store");

    (Arc::new(store), counting, tmp)
}

/// Creates an item store in a fresh temp directory.
pub fn create_store() -> (Arc<BackendJson>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let storage_mgr =
        Arc::new(storage::BackendLocal::new(tmp.path()).expect("failed to create storage"));
    let store = BackendJson::load(storage_mgr, ITEMS_FILE).expect("failed to load item store");

    (Arc::new(store), tmp)
}

pub fn add_item(store: &BackendJson, title: &str, description: &str) -> Item {
    store
        .create(ItemCreate {
            title: title.to_string(),
            description: description.to_string(),
            ..Default::default()
        })
        .unwrap()
}

/// Inserts an item carrying a ready-made vector.
pub fn insert_with_vector(store: &BackendJson, id: &str, vector: Vec<f32>, model: &str) -> Item {
    let item = Item {
        id: ItemId::from(id),
        title: format!("item {id}"),
        description: String::new(),
        kind: None,
        category: None,
        location: None,
        owner: None,
        created_at: Utc::now(),
        embedding: Some(Embedding {
            vector,
            model: model.to_string(),
            embedded_at: Utc::now(),
        }),
    };
    store.insert(item.clone()).unwrap();
    item
}

/// Bag-of-words embedder: each lowercase word bumps one hashed bucket.
///
/// Texts containing a failure marker get a provider error instead.
pub struct FakeEmbedder {
    dimensions: usize,
    returned_dimensions: usize,
    failures: Vec<(String, bool)>,
    flaky: AtomicUsize,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            dimensions: TEST_DIMENSIONS,
            returned_dimensions: TEST_DIMENSIONS,
            failures: Vec::new(),
            flaky: AtomicUsize::new(0),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Texts containing `marker` fail every time.
    pub fn failing_on(mut self, marker: &str, retryable: bool) -> Self {
        self.failures.push((marker.to_string(), retryable));
        self
    }

    /// The first `n` calls fail with a retryable error.
    pub fn flaky(self, n: usize) -> Self {
        self.flaky.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Claims `TEST_DIMENSIONS` but returns vectors of another length.
    pub fn returning_dimensions(mut self, dimensions: usize) -> Self {
        self.returned_dimensions = dimensions;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Vector `embed` would produce for `text`, without counting a call.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        bag_of_words(text, self.returned_dimensions)
    }
}

impl TextEmbedder for FakeEmbedder {
    fn model(&self) -> &str {
        TEST_MODEL
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = prepare_input(text, 8000)?;

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        for (marker, retryable) in &self.failures {
            if text.contains(marker.as_str()) {
                return Err(EmbeddingError::Provider {
                    retryable: *retryable,
                    message: format!("refusing {marker:?}"),
                });
            }
        }

        let flaky = self
            .flaky
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if flaky.is_ok() {
            return Err(EmbeddingError::retryable("503 service unavailable"));
        }

        Ok(bag_of_words(text, self.returned_dimensions))
    }
}

fn bag_of_words(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimensions];
    for word in text.to_lowercase().split_whitespace() {
        let bucket = word
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        vector[bucket % dimensions] += 1.0;
    }
    vector
}
