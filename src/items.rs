use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Instant,
};

use crate::{ids::ItemId, storage::StorageManager};

/// Default page size used when scanning the whole corpus.
pub const DEFAULT_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Lost,
    Found,
}

/// Vector attached to an item together with the model that produced it.
///
/// Vector, model tag and timestamp only ever travel as one value, so they
/// are set (or absent) together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model: String,
    pub embedded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ItemKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
}

/// Per-item embedding state, derived from text and vector presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemState {
    /// Neither description nor title; never gets a vector.
    NoText,
    /// Has text, waiting for a vector.
    PendingText,
    Embedded,
    /// Embedded by a model other than the configured one.
    Stale,
}

impl Item {
    /// Text used to represent the item: description, falling back to title.
    pub fn derived_text(&self) -> Option<&str> {
        let description = self.description.trim();
        if !description.is_empty() {
            return Some(description);
        }

        let title = self.title.trim();
        if !title.is_empty() {
            return Some(title);
        }

        None
    }

    pub fn vector(&self) -> Option<&[f32]> {
        self.embedding.as_ref().map(|e| e.vector.as_slice())
    }

    pub fn state(&self, configured_model: &str) -> ItemState {
        match (&self.embedding, self.derived_text()) {
            (Some(embedding), _) if embedding.model != configured_model => ItemState::Stale,
            (Some(_), _) => ItemState::Embedded,
            (None, Some(_)) => ItemState::PendingText,
            (None, None) => ItemState::NoText,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCreate {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ItemKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Partial update. Only the `Some` fields are written; item text is never
/// edited after posting.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub embedding: Option<Embedding>,
}

impl ItemPatch {
    pub fn embedding(embedding: Embedding) -> Self {
        Self {
            embedding: Some(embedding),
            ..Default::default()
        }
    }

    fn apply(self, item: &mut Item) {
        if let Some(embedding) = self.embedding {
            item.embedding = Some(embedding);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemFilter {
    #[default]
    All,
    WithVector,
    WithoutVector,
}

impl ItemFilter {
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            ItemFilter::All => true,
            ItemFilter::WithVector => item.embedding.is_some(),
            ItemFilter::WithoutVector => item.embedding.is_none(),
        }
    }
}

/// Cursor-based page request; items come back in ascending id order.
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Exclusive lower bound.
    pub after: Option<ItemId>,
    pub limit: usize,
}

impl PageRequest {
    #[cfg(test)]
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ItemPage {
    pub items: Vec<Item>,
    /// Cursor for the following page, `None` once the scan is exhausted.
    pub next: Option<ItemId>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("item {0} not found")]
    NotFound(ItemId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

pub trait ItemStore: Send + Sync {
    fn get(&self, id: &ItemId) -> Result<Option<Item>, StoreError>;
    /// Atomically applies `patch` to one item and persists it.
    fn update(&self, id: &ItemId, patch: ItemPatch) -> Result<Item, StoreError>;
    /// Applies `patch` like `update` but leaves persisting to the next
    /// [`ItemStore::flush`]. Readers see the change right away.
    fn update_deferred(&self, id: &ItemId, patch: ItemPatch) -> Result<Item, StoreError>;
    /// Persists deferred updates; a no-op when none are pending.
    fn flush(&self) -> Result<(), StoreError>;
    fn query(&self, filter: &ItemFilter, page: &PageRequest) -> Result<ItemPage, StoreError>;
    fn create(&self, item: ItemCreate) -> Result<Item, StoreError>;
    /// Removes an item, returning it if it existed.
    fn delete(&self, id: &ItemId) -> Result<Option<Item>, StoreError>;
}

/// Lazily walks every item matching `filter`, one page at a time.
///
/// Each call starts from the beginning, so a scan is restartable; concurrent
/// writes may or may not be observed.
pub fn scan<'a>(store: &'a dyn ItemStore, filter: ItemFilter, page_size: usize) -> ItemScan<'a> {
    ItemScan {
        store,
        filter,
        page_size: page_size.max(1),
        buffered: Vec::new().into_iter(),
        cursor: None,
        done: false,
    }
}

pub struct ItemScan<'a> {
    store: &'a dyn ItemStore,
    filter: ItemFilter,
    page_size: usize,
    buffered: std::vec::IntoIter<Item>,
    cursor: Option<ItemId>,
    done: bool,
}

impl ItemScan<'_> {
    /// Fetches the next page, returning `None` once exhausted.
    pub fn next_page(&mut self) -> Option<Result<Vec<Item>, StoreError>> {
        if self.done {
            return None;
        }

        let request = PageRequest {
            after: self.cursor.take(),
            limit: self.page_size,
        };
        match self.store.query(&self.filter, &request) {
            Ok(page) => {
                self.done = page.next.is_none();
                self.cursor = page.next;
                Some(Ok(page.items))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl Iterator for ItemScan<'_> {
    type Item = Result<Item, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffered.next() {
                return Some(Ok(item));
            }

            match self.next_page()? {
                Ok(items) => self.buffered = items.into_iter(),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Item store persisted as a single JSON document.
///
/// The whole corpus lives in memory. `insert`, `update`, `create` and
/// `delete` are written through before they return and roll the in-memory
/// change back when the write fails. `update_deferred` only marks the store
/// dirty, so a batch of vector writes costs one file write on `flush`.
///
/// File writes are serialised by `write_lock`, taken before the item lock, so
/// an older snapshot never lands on disk after a newer one.
#[derive(Clone)]
pub struct BackendJson {
    items: Arc<RwLock<BTreeMap<ItemId, Item>>>,
    storage: Arc<dyn StorageManager>,
    ident: String,
    write_lock: Arc<Mutex<()>>,
    dirty: Arc<AtomicBool>,
}

pub const ITEMS_FILE: &str = "items.json";

impl BackendJson {
    pub fn load(storage: Arc<dyn StorageManager>, ident: &str) -> Result<Self, StoreError> {
        let now = Instant::now();

        let items: Vec<Item> = if storage.exists(ident) {
            serde_json::from_slice(&storage.read(ident)?)?
        } else {
            log::info!("Creating new item store at {ident}");
            storage.write(ident, b"[]")?;
            vec![]
        };

        log::debug!(
            "took {}ms to read {} items",
            now.elapsed().as_micros() as f64 / 1000.0,
            items.len()
        );

        let items = items
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect::<BTreeMap<_, _>>();

        Ok(BackendJson {
            items: Arc::new(RwLock::new(items)),
            storage,
            ident: ident.to_string(),
            write_lock: Arc::new(Mutex::new(())),
            dirty: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    fn write_items(&self, items: &BTreeMap<ItemId, Item>) -> Result<(), StoreError> {
        let now = Instant::now();
        let list = items.values().collect::<Vec<_>>();
        let data = serde_json::to_vec(&list)?;
        self.storage.write(&self.ident, &data)?;

        log::trace!(
            "wrote {} items ({} bytes) in {}ms",
            list.len(),
            data.len(),
            now.elapsed().as_millis()
        );
        Ok(())
    }

    /// Runs one write-through mutation under both locks.
    ///
    /// `mutate` returns the value to hand back and an undo closure used when
    /// the file write fails.
    fn write_through<T, M>(&self, mutate: M) -> Result<T, StoreError>
    where
        M: FnOnce(&mut BTreeMap<ItemId, Item>) -> Result<(T, Undo), StoreError>,
    {
        let _write = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut items = self.items.write().map_err(|_| StoreError::Poisoned)?;

        let (value, undo) = mutate(&mut *items)?;

        if let Err(err) = self.write_items(&items) {
            undo(&mut *items);
            return Err(err);
        }

        // the snapshot just written covers every deferred update too
        self.dirty.store(false, Ordering::Release);
        Ok(value)
    }

    /// Inserts a fully formed item, used by tests and imports.
    pub fn insert(&self, item: Item) -> Result<(), StoreError> {
        self.write_through(|items| {
            let id = item.id.clone();
            let previous = items.insert(id.clone(), item);
            let undo: Undo = Box::new(move |items: &mut BTreeMap<ItemId, Item>| {
                match previous {
                    Some(previous) => items.insert(id, previous),
                    None => items.remove(&id),
                };
            });
            Ok(((), undo))
        })
    }
}

type Undo = Box<dyn FnOnce(&mut BTreeMap<ItemId, Item>)>;

impl ItemStore for BackendJson {
    fn get(&self, id: &ItemId) -> Result<Option<Item>, StoreError> {
        let items = self.items.read().map_err(|_| StoreError::Poisoned)?;
        Ok(items.get(id).cloned())
    }

    fn update(&self, id: &ItemId, patch: ItemPatch) -> Result<Item, StoreError> {
        self.write_through(|items| {
            let item = items
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            let previous = item.clone();
            patch.apply(item);
            let updated = item.clone();

            let id = id.clone();
            let undo: Undo = Box::new(move |items: &mut BTreeMap<ItemId, Item>| {
                items.insert(id, previous);
            });
            Ok((updated, undo))
        })
    }

    fn update_deferred(&self, id: &ItemId, patch: ItemPatch) -> Result<Item, StoreError> {
        let mut items = self.items.write().map_err(|_| StoreError::Poisoned)?;

        let item = items
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        patch.apply(item);
        let updated = item.clone();

        // set under the item lock so a concurrent flush cannot miss it
        self.dirty.store(true, Ordering::Release);
        Ok(updated)
    }

    fn flush(&self) -> Result<(), StoreError> {
        let _write = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let result = {
            // readers keep going while the snapshot is serialised and written
            let items = self.items.read().map_err(|_| StoreError::Poisoned)?;
            self.write_items(&items)
        };

        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    fn query(&self, filter: &ItemFilter, page: &PageRequest) -> Result<ItemPage, StoreError> {
        let items = self.items.read().map_err(|_| StoreError::Poisoned)?;

        let lower = match &page.after {
            Some(after) => Bound::Excluded(after.clone()),
            None => Bound::Unbounded,
        };

        let limit = page.limit.max(1);
        let mut matched = items
            .range((lower, Bound::Unbounded))
            .map(|(_, item)| item)
            .filter(|item| filter.matches(item));

        let page_items: Vec<Item> = matched.by_ref().take(limit).cloned().collect();
        let has_more = matched.next().is_some();

        let next = if has_more {
            page_items.last().map(|item| item.id.clone())
        } else {
            None
        };

        Ok(ItemPage {
            items: page_items,
            next,
        })
    }

    fn create(&self, item_create: ItemCreate) -> Result<Item, StoreError> {
        let item = Item {
            id: ItemId::generate(),
            title: item_create.title,
            description: item_create.description,
            kind: item_create.kind,
            category: item_create.category,
            location: item_create.location,
            owner: item_create.owner,
            created_at: Utc::now(),
            embedding: None,
        };

        self.insert(item.clone())?;

        Ok(item)
    }

    fn delete(&self, id: &ItemId) -> Result<Option<Item>, StoreError> {
        if self.get(id)?.is_none() {
            return Ok(None);
        }

        self.write_through(|items| {
            let removed = items.remove(id);
            let restore = removed.clone();
            let id = id.clone();
            let undo: Undo = Box::new(move |items: &mut BTreeMap<ItemId, Item>| {
                if let Some(previous) = restore {
                    items.insert(id, previous);
                }
            });
            Ok((removed, undo))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendLocal;

    fn item(id: &str, title: &str, description: &str) -> Item {
        Item {
            id: id.into(),
            title: title.to_string(),
            description: description.to_string(),
            kind: None,
            category: None,
            location: None,
            owner: None,
            created_at: Utc::now(),
            embedding: None,
        }
    }

    fn embedding(vector: Vec<f32>) -> Embedding {
        Embedding {
            vector,
            model: "test-model".to_string(),
            embedded_at: Utc::now(),
        }
    }

    fn store() -> (BackendJson, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(BackendLocal::new(tmp.path()).unwrap());
        (BackendJson::load(storage, ITEMS_FILE).unwrap(), tmp)
    }

    #[test]
    fn test_derived_text_prefers_description() {
        assert_eq!(item("1", "Wallet", "Brown leather").derived_text(), Some("Brown leather"));
        assert_eq!(item("1", "Wallet", "   ").derived_text(), Some("Wallet"));
        assert_eq!(item("1", "  Wallet ", "").derived_text(), Some("Wallet"));
        assert_eq!(item("1", "", "").derived_text(), None);
        assert_eq!(item("1", " \n", "\t").derived_text(), None);
    }

    #[test]
    fn test_state() {
        let mut it = item("1", "Keys", "");
        assert_eq!(it.state("test-model"), ItemState::PendingText);

        it.embedding = Some(embedding(vec![1.0]));
        assert_eq!(it.state("test-model"), ItemState::Embedded);
        assert_eq!(it.state("other-model"), ItemState::Stale);

        assert_eq!(item("2", "", "").state("test-model"), ItemState::NoText);
    }

    #[test]
    fn test_create_get_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(BackendLocal::new(tmp.path()).unwrap());
        let store = BackendJson::load(storage.clone(), ITEMS_FILE).unwrap();

        let created = store
            .create(ItemCreate {
                title: "Umbrella".to_string(),
                description: "Black, folding".to_string(),
                kind: Some(ItemKind::Found),
                ..Default::default()
            })
            .unwrap();

        let fetched = store.get(&created.id).unwrap().unwrap();
        assert_eq!(fetched, created);

        let reloaded = BackendJson::load(storage, ITEMS_FILE).unwrap();
        assert_eq!(reloaded.get(&created.id).unwrap(), Some(created));
    }

    #[test]
    fn test_update_writes_only_named_fields() {
        let (store, _tmp) = store();
        store.insert(item("a", "Phone", "Cracked screen")).unwrap();

        let updated = store
            .update(&"a".into(), ItemPatch::embedding(embedding(vec![0.5, 0.5])))
            .unwrap();

        assert_eq!(updated.title, "Phone");
        assert_eq!(updated.description, "Cracked screen");
        assert_eq!(updated.vector(), Some(&[0.5f32, 0.5][..]));
    }

    #[test]
    fn test_update_missing_item() {
        let (store, _tmp) = store();
        let result = store.update(&"ghost".into(), ItemPatch::default());
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_query_pages_in_id_order() {
        let (store, _tmp) = store();
        for id in ["e", "a", "c", "b", "d"] {
            store.insert(item(id, "t", "")).unwrap();
        }

        let first = store.query(&ItemFilter::All, &PageRequest::first(2)).unwrap();
        let ids: Vec<&str> = first.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(first.next.as_deref(), Some("b"));

        let second = store
            .query(
                &ItemFilter::All,
                &PageRequest {
                    after: first.next,
                    limit: 2,
                },
            )
            .unwrap();
        let ids: Vec<&str> = second.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d"]);

        let third = store
            .query(
                &ItemFilter::All,
                &PageRequest {
                    after: second.next,
                    limit: 2,
                },
            )
            .unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.next.is_none());
    }

    #[test]
    fn test_query_filters_by_vector_presence() {
        let (store, _tmp) = store();
        store.insert(item("a", "t", "")).unwrap();
        let mut with = item("b", "t", "");
        with.embedding = Some(embedding(vec![1.0]));
        store.insert(with).unwrap();

        let page = store
            .query(&ItemFilter::WithVector, &PageRequest::first(10))
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id.as_str(), "b");

        let page = store
            .query(&ItemFilter::WithoutVector, &PageRequest::first(10))
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id.as_str(), "a");
    }

    #[test]
    fn test_scan_walks_all_pages_and_restarts() {
        let (store, _tmp) = store();
        for i in 0..7 {
            store.insert(item(&format!("item-{i}"), "t", "")).unwrap();
        }

        let ids: Vec<ItemId> = scan(&store, ItemFilter::All, 3)
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(ids.len(), 7);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let again = scan(&store, ItemFilter::All, 3).count();
        assert_eq!(again, 7);
    }

    #[test]
    fn test_delete() {
        let (store, _tmp) = store();
        store.insert(item("a", "t", "")).unwrap();

        let removed = store.delete(&"a".into()).unwrap();
        assert_eq!(removed.map(|i| i.id), Some("a".into()));
        assert!(store.get(&"a".into()).unwrap().is_none());

        assert!(store.delete(&"a".into()).unwrap().is_none());
    }

    #[test]
    fn test_deferred_update_reaches_disk_on_flush() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(BackendLocal::new(tmp.path()).unwrap());
        let store = BackendJson::load(storage.clone(), ITEMS_FILE).unwrap();
        store.insert(item("a", "Scarf", "red wool")).unwrap();

        let updated = store
            .update_deferred(&"a".into(), ItemPatch::embedding(embedding(vec![1.0, 0.0])))
            .unwrap();
        assert!(updated.embedding.is_some());
        assert!(store.get(&"a".into()).unwrap().unwrap().embedding.is_some());

        let on_disk = BackendJson::load(storage.clone(), ITEMS_FILE).unwrap();
        assert!(on_disk.get(&"a".into()).unwrap().unwrap().embedding.is_none());

        store.flush().unwrap();
        let on_disk = BackendJson::load(storage, ITEMS_FILE).unwrap();
        assert_eq!(
            on_disk.get(&"a".into()).unwrap().unwrap().vector(),
            Some(&[1.0f32, 0.0][..])
        );
    }

    #[test]
    fn test_write_through_also_persists_deferred_updates() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(BackendLocal::new(tmp.path()).unwrap());
        let store = BackendJson::load(storage.clone(), ITEMS_FILE).unwrap();
        store.insert(item("a", "Scarf", "")).unwrap();
        store.insert(item("b", "Gloves", "")).unwrap();

        store
            .update_deferred(&"a".into(), ItemPatch::embedding(embedding(vec![1.0])))
            .unwrap();
        store
            .update(&"b".into(), ItemPatch::embedding(embedding(vec![2.0])))
            .unwrap();

        let on_disk = BackendJson::load(storage, ITEMS_FILE).unwrap();
        assert!(on_disk.get(&"a".into()).unwrap().unwrap().embedding.is_some());
        assert!(on_disk.get(&"b".into()).unwrap().unwrap().embedding.is_some());
        assert!(!store.dirty.load(Ordering::Acquire));
    }

    #[test]
    fn test_deferred_update_missing_item() {
        let (store, _tmp) = store();
        let result = store.update_deferred(&"ghost".into(), ItemPatch::default());
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(!store.dirty.load(Ordering::Acquire));
    }
}
