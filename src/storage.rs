//! Async access to the item store.
//!
//! redb is synchronous, so every call is moved to the blocking thread pool
//! and bounded by the configured storage timeout. A timed-out or panicked
//! call surfaces as [`Error::Storage`].
//!
//! Item writes carry a [`CommitGate`]: a write whose caller timed out is
//! aborted before it commits, and a write already committing is waited
//! for, so "timed out" always means "nothing was written".

use std::{sync::Arc, time::Duration};

use crate::{
    config_db::ConfigDb,
    doc_id::DocumentId,
    document::DocumentRecord,
    embedding::MultiVector,
    error::{Error, Result},
    item::{Collection, ItemId, SourceRef},
    item_store::{CommitGate, ItemStore, NewItem, StorageStats, StoredItem},
};

#[derive(Debug, Clone)]
pub struct Storage {
    items: Arc<ItemStore>,
    config_db: Arc<ConfigDb>,
    timeout: Duration,
}

impl Storage {
    pub fn new(items: Arc<ItemStore>, config_db: Arc<ConfigDb>, timeout: Duration) -> Self {
        Self {
            items,
            config_db,
            timeout,
        }
    }

    pub fn config_db(&self) -> &Arc<ConfigDb> {
        &self.config_db
    }

    pub fn item_store(&self) -> &Arc<ItemStore> {
        &self.items
    }

    async fn blocking<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&ItemStore, &ConfigDb) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let items = Arc::clone(&self.items);
        let config_db = Arc::clone(&self.config_db);
        let task = tokio::task::spawn_blocking(move || f(&items, &config_db));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::Storage(format!("{op} task failed: {e}"))),
            Err(_) => {
                tracing::warn!(op, timeout = ?self.timeout, "storage call timed out");
                Err(Error::Storage(format!(
                    "{op} timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }

    /// Like [`Storage::blocking`], for item writes that must not land
    /// after their caller gave up.
    async fn write<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&ItemStore, &ConfigDb, &CommitGate) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let items = Arc::clone(&self.items);
        let config_db = Arc::clone(&self.config_db);
        let gate = Arc::new(CommitGate::default());
        let task_gate = Arc::clone(&gate);
        let mut task =
            tokio::task::spawn_blocking(move || f(&items, &config_db, &task_gate));

        let joined = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) if gate.abandon() => {
                tracing::warn!(op, timeout = ?self.timeout, "storage write timed out, abandoned");
                return Err(Error::Storage(format!(
                    "{op} timed out after {:?}",
                    self.timeout
                )));
            }
            Err(_) => {
                tracing::debug!(op, "storage write past its timeout is committing");
                task.await
            }
        };
        joined.map_err(|e| Error::Storage(format!("{op} task failed: {e}")))?
    }

    /// Store one item for a registered document.
    pub async fn add_item(
        &self,
        collection: Collection,
        doc_id: DocumentId,
        representative: Vec<f32>,
        sequence: MultiVector,
        source_ref: SourceRef,
    ) -> Result<ItemId> {
        self.write("add_item", move |items, config_db, gate| {
            ensure_registered(config_db, doc_id)?;
            items.add_item_gated(
                collection,
                doc_id,
                &representative,
                sequence,
                source_ref,
                gate,
            )
        })
        .await
    }

    /// Store a batch of items for a registered document atomically.
    pub async fn add_items(
        &self,
        collection: Collection,
        doc_id: DocumentId,
        new_items: Vec<NewItem>,
    ) -> Result<Vec<ItemId>> {
        self.write("add_items", move |items, config_db, gate| {
            ensure_registered(config_db, doc_id)?;
            items.add_items_gated(collection, doc_id, new_items, gate)
        })
        .await
    }

    pub async fn query_by_vector(
        &self,
        collection: Collection,
        query: Vec<f32>,
        top_n: usize,
    ) -> Result<Vec<(ItemId, f32)>> {
        self.blocking("query_by_vector", move |items, _| {
            items.query_by_vector(collection, &query, top_n)
        })
        .await
    }

    pub async fn get_full_sequence(&self, item_id: ItemId) -> Result<MultiVector> {
        self.blocking("get_full_sequence", move |items, _| {
            items.get_full_sequence(item_id)
        })
        .await
    }

    pub async fn load_items(&self, item_ids: Vec<ItemId>) -> Result<Vec<Option<StoredItem>>> {
        self.blocking("load_items", move |items, _| items.load_items(&item_ids))
            .await
    }

    /// Remove every item of a document. Idempotent.
    pub async fn delete_by_doc_id(&self, doc_id: DocumentId) -> Result<usize> {
        self.write("delete_by_doc_id", move |items, _, gate| {
            items.delete_by_doc_id_gated(doc_id, gate)
        })
        .await
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats> {
        self.blocking("get_storage_stats", |items, _| items.stats())
            .await
    }

    // -- Document registry --

    pub async fn put_record(&self, record: DocumentRecord) -> Result<()> {
        self.blocking("put_record", move |_, config_db| {
            config_db.put_document(&record)
        })
        .await
    }

    pub async fn get_record(&self, doc_id: DocumentId) -> Result<Option<DocumentRecord>> {
        self.blocking("get_record", move |_, config_db| {
            config_db.get_document(doc_id)
        })
        .await
    }

    pub async fn remove_record(&self, doc_id: DocumentId) -> Result<bool> {
        self.blocking("remove_record", move |_, config_db| {
            config_db.remove_document(doc_id)
        })
        .await
    }

    pub async fn list_records(&self) -> Result<Vec<DocumentRecord>> {
        self.blocking("list_records", |_, config_db| config_db.list_documents())
            .await
    }
}

fn ensure_registered(config_db: &ConfigDb, doc_id: DocumentId) -> Result<()> {
    if !config_db.has_document(doc_id)? {
        return Err(Error::Validation(format!(
            "document {doc_id} is not registered"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{FormatClass, Stage};

    fn test_storage() -> (tempfile::TempDir, Storage) {
        let tmp = tempfile::tempdir().unwrap();
        let items = ItemStore::open(&tmp.path().join("items.redb")).unwrap();
        let config_db = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
        let storage = Storage::new(
            Arc::new(items),
            Arc::new(config_db),
            Duration::from_secs(5),
        );
        (tmp, storage)
    }

    fn register(storage: &Storage, name: &str) -> DocumentId {
        let now = chrono::Utc::now();
        let record = DocumentRecord {
            doc_id: DocumentId::new(name),
            filename: name.to_string(),
            format_class: FormatClass::VisualOnly,
            date_added: now,
            page_count: 1,
            chunk_count: 0,
            stage: Stage::Storing,
            partial: false,
            failure_reason: None,
            updated_at: now,
        };
        storage.config_db().put_document(&record).unwrap();
        record.doc_id
    }

    #[tokio::test]
    async fn add_item_requires_registered_document() {
        let (_tmp, storage) = test_storage();
        let seq = MultiVector::from_tokens(vec![vec![1.0, 0.0]]).unwrap();
        let err = storage
            .add_item(
                Collection::Visual,
                DocumentId::new("ghost.pdf"),
                vec![1.0, 0.0],
                seq,
                SourceRef::page(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn add_query_fetch_delete() {
        let (_tmp, storage) = test_storage();
        let doc = register(&storage, "a.pdf");
        let seq = MultiVector::from_tokens(vec![vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();

        let id = storage
            .add_item(
                Collection::Visual,
                doc,
                vec![0.0, 1.0],
                seq.clone(),
                SourceRef::page(1),
            )
            .await
            .unwrap();

        let hits = storage
            .query_by_vector(Collection::Visual, vec![0.0, 1.0], 10)
            .await
            .unwrap();
        assert_eq!(hits, vec![(id, 1.0)]);
        assert_eq!(storage.get_full_sequence(id).await.unwrap(), seq);

        assert_eq!(storage.delete_by_doc_id(doc).await.unwrap(), 1);
        assert_eq!(storage.delete_by_doc_id(doc).await.unwrap(), 0);
        assert!(matches!(
            storage.get_full_sequence(id).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stats_count_per_collection() {
        let (_tmp, storage) = test_storage();
        let doc = register(&storage, "a.pdf");
        storage
            .add_items(
                Collection::Text,
                doc,
                vec![NewItem {
                    sequence: MultiVector::from_tokens(vec![vec![1.0; 8]; 4]).unwrap(),
                    source_ref: SourceRef::chunk(0, 0, 12),
                }],
            )
            .await
            .unwrap();

        let stats = storage.get_storage_stats().await.unwrap();
        assert_eq!(stats.collection(Collection::Text).items, 1);
        assert_eq!(stats.collection(Collection::Visual).items, 0);
        assert!(stats.compression_ratio.is_some());
    }

    #[tokio::test]
    async fn zero_timeout_surfaces_as_storage_error() {
        let (_tmp, storage) = test_storage();
        let storage = Storage {
            timeout: Duration::ZERO,
            ..storage
        };
        let result = storage
            .blocking("slow", |_, _| {
                std::thread::sleep(Duration::from_millis(50));
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn timed_out_write_never_commits() {
        let (_tmp, storage) = test_storage();
        let doc = register(&storage, "a.pdf");
        let storage = Storage {
            timeout: Duration::from_millis(20),
            ..storage
        };

        let (tx, rx) = std::sync::mpsc::channel();
        let result = storage
            .write("slow add", move |items, _, gate| {
                std::thread::sleep(Duration::from_millis(100));
                let outcome = items.add_items_gated(
                    Collection::Visual,
                    doc,
                    vec![NewItem {
                        sequence: MultiVector::from_tokens(vec![vec![1.0, 0.0]]).unwrap(),
                        source_ref: SourceRef::page(1),
                    }],
                    gate,
                );
                tx.send(outcome.is_ok()).unwrap();
                outcome
            })
            .await;
        assert!(matches!(result, Err(Error::Storage(_))));

        let committed = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert!(!committed);
        assert!(storage.item_store().items_for_doc(doc).unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_that_started_committing_is_awaited() {
        let (_tmp, storage) = test_storage();
        let storage = Storage {
            timeout: Duration::from_millis(20),
            ..storage
        };

        let result = storage
            .write("committing", |_, _, gate| {
                assert!(gate.begin_commit());
                std::thread::sleep(Duration::from_millis(100));
                Ok(7)
            })
            .await;
        assert_eq!(result.unwrap(), 7);
    }
}
