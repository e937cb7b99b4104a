//! Per-document ingestion.
//!
//! Every document walks `Queued → Parsing → Embedding → Storing →
//! Completed`, or ends in `Failed`. Each transition is persisted in the
//! document registry and broadcast as a [`StatusEvent`].
//!
//! Concurrency:
//! - a worker semaphore bounds how many documents are processed at once
//! - a per-document lock serializes jobs (and deletes) for the same doc ID
//! - the visual and text branches of a document embed concurrently, but
//!   all inference goes through the shared [`EnginePool`]
//! - cancellation is cooperative and checked between stages

use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex as StdMutex,
        PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{Mutex, OwnedMutexGuard, Semaphore, broadcast},
    task::JoinHandle,
};

use crate::{
    config::EngineConfig,
    doc_id::DocumentId,
    document::{DocumentRecord, ParsedChunk, ParsedDocument, ParsedPage, Stage},
    embedding::EnginePool,
    error::{Error, Result},
    item::Collection,
    item_store::NewItem,
    storage::Storage,
};

const EVENT_CAPACITY: usize = 256;
const DEFAULT_EMBED_BATCH: usize = 8;

/// A status change or progress update for one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub doc_id: DocumentId,
    pub stage: Stage,
    /// Fraction of items embedded, only set during `Embedding`.
    pub progress: Option<f32>,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
}

/// What a successful ingestion stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub doc_id: DocumentId,
    pub visual_items: usize,
    pub text_items: usize,
}

/// A handle to a submitted ingestion job.
#[derive(Debug)]
pub struct JobHandle {
    doc_id: DocumentId,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<Result<IngestReport>>,
}

impl JobHandle {
    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    /// Ask the job to stop at its next stage boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub async fn wait(self) -> Result<IngestReport> {
        let doc_id = self.doc_id;
        self.task.await.map_err(|e| Error::JobFailed {
            doc_id,
            reason: e.to_string(),
        })?
    }
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
    batch_size: usize,
}

struct Inner {
    storage: Storage,
    engines: Arc<EnginePool>,
    events: broadcast::Sender<StatusEvent>,
    workers: Arc<Semaphore>,
    doc_locks: StdMutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
    /// Cancellation flag per document, shared by all of its active jobs.
    cancel_flags: StdMutex<HashMap<DocumentId, (Arc<AtomicBool>, usize)>>,
}

impl Coordinator {
    pub fn new(storage: Storage, engines: Arc<EnginePool>, config: &EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                storage,
                engines,
                events,
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
                doc_locks: StdMutex::new(HashMap::new()),
                cancel_flags: StdMutex::new(HashMap::new()),
            }),
            batch_size: DEFAULT_EMBED_BATCH,
        }
    }

    /// Number of items sent to the engine per inference call.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// Register a document and start processing it in the background.
    ///
    /// Fails immediately if the document has neither pages nor chunks.
    pub async fn submit(&self, doc: ParsedDocument) -> Result<JobHandle> {
        let doc_id = doc.doc_id();
        let queued = DocumentRecord::queued(&doc)?;

        let record = match self.inner.storage.get_record(doc_id).await? {
            // An earlier job still owns the record; it is reset under
            // the document lock once that job is done.
            Some(existing) if !existing.stage.is_terminal() => None,
            Some(existing) => Some(DocumentRecord {
                date_added: existing.date_added,
                ..queued
            }),
            None => Some(queued),
        };
        if let Some(record) = record {
            self.inner.storage.put_record(record).await?;
        }
        self.emit(doc_id, Stage::Queued, None, None);
        tracing::info!(doc = %doc_id, file = %doc.metadata.filename, "document queued");

        let cancel = self.acquire_cancel_flag(doc_id);
        let this = self.clone();
        let flag = Arc::clone(&cancel);
        let task = tokio::spawn(async move {
            let job = tokio::spawn({
                let this = this.clone();
                let flag = Arc::clone(&flag);
                async move { this.run_job(doc, &flag).await }
            });
            let result = match job.await {
                Ok(result) => result,
                Err(e) => Err(this.abort_job(doc_id, e.to_string()).await),
            };
            this.release_cancel_flag(doc_id, &flag);
            result
        });

        Ok(JobHandle {
            doc_id,
            cancel,
            task,
        })
    }

    /// Ingest one document and wait for the outcome.
    pub async fn ingest(&self, doc: ParsedDocument) -> Result<IngestReport> {
        self.submit(doc).await?.wait().await
    }

    /// Ingest many documents on the worker pool. One document failing
    /// does not stop the others; outcomes are returned in input order.
    pub async fn ingest_batch(
        &self,
        docs: Vec<ParsedDocument>,
    ) -> Vec<(DocumentId, Result<IngestReport>)> {
        let mut pending = Vec::with_capacity(docs.len());
        for doc in docs {
            let doc_id = doc.doc_id();
            pending.push((doc_id, self.submit(doc).await));
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for (doc_id, submitted) in pending {
            let outcome = match submitted {
                Ok(handle) => handle.wait().await,
                Err(e) => Err(e),
            };
            if let Err(e) = &outcome {
                tracing::warn!(doc = %doc_id, error = %e, "document failed");
            }
            outcomes.push((doc_id, outcome));
        }
        outcomes
    }

    /// Cancel any in-flight job for the document, then remove its items
    /// and its registry entry. Returns whether the document was known.
    pub async fn delete_document(&self, doc_id: DocumentId) -> Result<bool> {
        if let Some((flag, _)) = self.lock_cancel_flags().remove(&doc_id) {
            flag.store(true, Ordering::SeqCst);
        }

        let _guard = self.lock_document(doc_id).await;

        let removed_items = self.inner.storage.delete_by_doc_id(doc_id).await?;
        let existed = self.inner.storage.remove_record(doc_id).await?;
        if existed || removed_items > 0 {
            tracing::info!(doc = %doc_id, items = removed_items, "document deleted");
        }
        Ok(existed)
    }

    fn emit(
        &self,
        doc_id: DocumentId,
        stage: Stage,
        progress: Option<f32>,
        message: Option<String>,
    ) {
        // No subscribers is fine.
        let _ = self.inner.events.send(StatusEvent {
            doc_id,
            stage,
            progress,
            timestamp: Utc::now(),
            message,
        });
    }

    fn doc_lock(&self, doc_id: DocumentId) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .doc_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(doc_id).or_default())
    }

    async fn lock_document(&self, doc_id: DocumentId) -> DocGuard {
        let guard = self.doc_lock(doc_id).lock_owned().await;
        DocGuard {
            inner: Arc::clone(&self.inner),
            doc_id,
            guard: Some(guard),
        }
    }

    fn lock_cancel_flags(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<DocumentId, (Arc<AtomicBool>, usize)>> {
        self.inner
            .cancel_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire_cancel_flag(&self, doc_id: DocumentId) -> Arc<AtomicBool> {
        let mut flags = self.lock_cancel_flags();
        let entry = flags
            .entry(doc_id)
            .or_insert_with(|| (Arc::new(AtomicBool::new(false)), 0));
        entry.1 += 1;
        Arc::clone(&entry.0)
    }

    fn release_cancel_flag(&self, doc_id: DocumentId, flag: &Arc<AtomicBool>) {
        let mut flags = self.lock_cancel_flags();
        // A delete may already have replaced the entry.
        if let Some(entry) = flags
            .get_mut(&doc_id)
            .filter(|entry| Arc::ptr_eq(&entry.0, flag))
        {
            entry.1 = entry.1.saturating_sub(1);
            if entry.1 == 0 {
                flags.remove(&doc_id);
            }
        }
    }

    async fn run_job(&self, doc: ParsedDocument, cancel: &AtomicBool) -> Result<IngestReport> {
        let doc_id = doc.doc_id();
        let _permit = Arc::clone(&self.inner.workers)
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled(doc_id))?;
        let _guard = self.lock_document(doc_id).await;

        let mut record = match self.inner.storage.get_record(doc_id).await? {
            Some(record) => record,
            // Deleted while waiting for a worker.
            None if cancel.load(Ordering::SeqCst) => {
                self.emit(doc_id, Stage::Failed, None, Some("cancelled".into()));
                return Err(Error::Cancelled(doc_id));
            }
            None => {
                let record = DocumentRecord::queued(&doc)?;
                self.inner.storage.put_record(record.clone()).await?;
                record
            }
        };

        if record.stage.is_terminal() {
            self.advance(&mut record, Stage::Queued).await?;
        } else if record.stage != Stage::Queued {
            tracing::warn!(
                doc = %doc_id,
                stage = %record.stage,
                "resetting document left mid-pipeline"
            );
            record.stage = Stage::Queued;
        }
        record.partial = false;
        record.failure_reason = None;

        match self.process(&doc, &mut record, cancel).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.fail(&mut record, &e).await;
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        doc: &ParsedDocument,
        record: &mut DocumentRecord,
        cancel: &AtomicBool,
    ) -> Result<IngestReport> {
        let doc_id = record.doc_id;
        let storage = &self.inner.storage;

        check_cancel(doc_id, cancel)?;
        record.format_class = doc.format_class()?;
        record.page_count = doc.pages.len() as u32;
        record.chunk_count = doc.text_chunks.len() as u32;
        self.advance(record, Stage::Parsing).await?;

        // Re-ingestion replaces whatever the document stored before.
        let removed = storage.delete_by_doc_id(doc_id).await?;
        if removed > 0 {
            tracing::debug!(doc = %doc_id, items = removed, "removed previous items");
        }

        check_cancel(doc_id, cancel)?;
        self.advance(record, Stage::Embedding).await?;

        let progress = Progress::new(doc.pages.len() + doc.text_chunks.len());
        let (visual, text) = tokio::join!(
            self.embed_pages(doc_id, &doc.pages, &progress),
            self.embed_chunks(doc_id, &doc.text_chunks, &progress),
        );

        check_cancel(doc_id, cancel)?;
        self.advance(record, Stage::Storing).await?;

        let mut report = IngestReport {
            doc_id,
            visual_items: 0,
            text_items: 0,
        };
        let mut failures = Vec::new();
        for (collection, embedded) in [(Collection::Visual, visual), (Collection::Text, text)] {
            let stored = match embedded {
                Ok(items) if items.is_empty() => continue,
                Ok(items) => storage.add_items(collection, doc_id, items).await,
                Err(e) => Err(e),
            };
            match stored {
                Ok(ids) => match collection {
                    Collection::Visual => report.visual_items = ids.len(),
                    Collection::Text => report.text_items = ids.len(),
                },
                Err(e) => {
                    tracing::warn!(doc = %doc_id, branch = %collection, error = %e, "branch failed");
                    failures.push((collection, e));
                }
            }
        }

        let stored_any = report.visual_items + report.text_items > 0;
        match failures.into_iter().next() {
            None => {
                self.advance(record, Stage::Completed).await?;
                tracing::info!(
                    doc = %doc_id,
                    visual = report.visual_items,
                    text = report.text_items,
                    "document completed"
                );
                Ok(report)
            }
            Some((failed, e)) if stored_any => Err(Error::PartialFailure {
                doc_id,
                stored: failed.other().as_str(),
                failed: failed.as_str(),
                reason: e.to_string(),
            }),
            Some((_, e)) => Err(e),
        }
    }

    async fn embed_pages(
        &self,
        doc_id: DocumentId,
        pages: &[ParsedPage],
        progress: &Progress,
    ) -> Result<Vec<NewItem>> {
        let mut items = Vec::with_capacity(pages.len());
        for batch in pages.chunks(self.batch_size) {
            let images = batch.iter().map(|p| p.image.clone()).collect();
            let sequences = self.inner.engines.embed_images(images).await?;
            items.extend(batch.iter().zip(sequences).map(|(page, sequence)| NewItem {
                sequence,
                source_ref: page.source_ref(),
            }));
            self.emit(doc_id, Stage::Embedding, Some(progress.advance(batch.len())), None);
        }
        Ok(items)
    }

    async fn embed_chunks(
        &self,
        doc_id: DocumentId,
        chunks: &[ParsedChunk],
        progress: &Progress,
    ) -> Result<Vec<NewItem>> {
        let mut items = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts = batch.iter().map(|c| c.text.clone()).collect();
            let sequences = self.inner.engines.embed_texts(texts).await?;
            items.extend(batch.iter().zip(sequences).map(|(chunk, sequence)| NewItem {
                sequence,
                source_ref: chunk.source_ref(),
            }));
            self.emit(doc_id, Stage::Embedding, Some(progress.advance(batch.len())), None);
        }
        Ok(items)
    }

    async fn advance(&self, record: &mut DocumentRecord, stage: Stage) -> Result<()> {
        if !record.stage.can_transition_to(stage) {
            return Err(Error::Validation(format!(
                "illegal stage transition {} -> {stage}",
                record.stage
            )));
        }
        record.stage = stage;
        record.updated_at = Utc::now();
        self.inner.storage.put_record(record.clone()).await?;
        tracing::debug!(doc = %record.doc_id, stage = %stage, "stage changed");
        self.emit(record.doc_id, stage, None, None);
        Ok(())
    }

    /// A job task died (panicked or was aborted) without recording its
    /// outcome. Mark the document failed so it does not stay mid-pipeline.
    async fn abort_job(&self, doc_id: DocumentId, reason: String) -> Error {
        let error = Error::JobFailed { doc_id, reason };
        tracing::error!(doc = %doc_id, error = %error, "ingestion job died");

        let _guard = self.lock_document(doc_id).await;
        match self.inner.storage.get_record(doc_id).await {
            Ok(Some(mut record)) if !record.stage.is_terminal() => {
                self.fail(&mut record, &error).await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(doc = %doc_id, error = %e, "failed to load record of dead job");
            }
        }
        error
    }

    /// Record a failure. Errors while persisting it are logged, since the
    /// original error is what the caller needs to see.
    async fn fail(&self, record: &mut DocumentRecord, error: &Error) {
        record.stage = Stage::Failed;
        record.partial = matches!(error, Error::PartialFailure { .. });
        record.failure_reason = Some(error.to_string());
        record.updated_at = Utc::now();

        if let Err(e) = self.inner.storage.put_record(record.clone()).await {
            tracing::warn!(doc = %record.doc_id, error = %e, "failed to persist failure");
        }
        tracing::warn!(doc = %record.doc_id, error = %error, "document failed");
        self.emit(
            record.doc_id,
            Stage::Failed,
            None,
            Some(error.to_string()),
        );
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("engines", &self.inner.engines)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

/// Exclusive hold on one document. Dropping it releases the lock and
/// forgets the lock entry once no other job holds or awaits it.
struct DocGuard {
    inner: Arc<Inner>,
    doc_id: DocumentId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DocGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self
            .inner
            .doc_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.doc_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.doc_id);
        }
    }
}

fn check_cancel(doc_id: DocumentId, cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        return Err(Error::Cancelled(doc_id));
    }
    Ok(())
}

/// Embedding progress shared by both branches of a document.
struct Progress {
    done: AtomicUsize,
    total: usize,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self {
            done: AtomicUsize::new(0),
            total,
        }
    }

    fn advance(&self, n: usize) -> f32 {
        let done = self.done.fetch_add(n, Ordering::SeqCst) + n;
        done as f32 / self.total.max(1) as f32
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config_db::ConfigDb,
        document::{PageImage, ParsedMetadata},
        item_store::ItemStore,
        test_support::StubEngine,
    };

    struct Fixture {
        _tmp: tempfile::TempDir,
        coordinator: Coordinator,
        stub: StubEngine,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let items = ItemStore::open(&tmp.path().join("items.redb")).unwrap();
        let config_db = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
        let storage = Storage::new(
            Arc::new(items),
            Arc::new(config_db),
            Duration::from_secs(5),
        );
        let stub = StubEngine::new(4);
        let pool = Arc::new(EnginePool::single(stub.clone()));
        let coordinator =
            Coordinator::new(storage, pool, &EngineConfig::default()).with_batch_size(2);
        Fixture {
            _tmp: tmp,
            coordinator,
            stub,
        }
    }

    fn doc(name: &str, pages: usize, chunks: usize) -> ParsedDocument {
        ParsedDocument {
            pages: (0..pages)
                .map(|i| ParsedPage {
                    page_number: i as u32 + 1,
                    image: PageImage {
                        mime_type: "image/png".into(),
                        width: 100,
                        height: 140,
                        bytes: format!("{name} page {i}").into_bytes(),
                    },
                })
                .collect(),
            text_chunks: (0..chunks)
                .map(|i| ParsedChunk {
                    chunk_index: i as u32,
                    text: format!("{name} chunk {i}"),
                    start: i * 20,
                    end: i * 20 + 15,
                    page_number: Some(1),
                })
                .collect(),
            metadata: ParsedMetadata {
                filename: name.into(),
                source_name: None,
            },
        }
    }

    #[tokio::test]
    async fn ingest_walks_every_stage() {
        let fx = fixture();
        let mut events = fx.coordinator.subscribe();

        let report = fx.coordinator.ingest(doc("a.pdf", 3, 2)).await.unwrap();
        assert_eq!(report.visual_items, 3);
        assert_eq!(report.text_items, 2);

        let mut stages = Vec::new();
        let mut last_progress = 0.0;
        while let Ok(event) = events.try_recv() {
            if let Some(p) = event.progress {
                last_progress = p;
            } else {
                stages.push(event.stage);
            }
        }
        assert_eq!(
            stages,
            vec![
                Stage::Queued,
                Stage::Parsing,
                Stage::Embedding,
                Stage::Storing,
                Stage::Completed
            ]
        );
        assert!((last_progress - 1.0).abs() < 1e-6);

        let record = fx
            .coordinator
            .storage()
            .get_record(report.doc_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.stage, Stage::Completed);
        assert_eq!(record.page_count, 3);
        assert_eq!(record.chunk_count, 2);
        assert!(!record.partial);
    }

    #[tokio::test]
    async fn empty_document_is_rejected() {
        let fx = fixture();
        assert!(matches!(
            fx.coordinator.ingest(doc("empty.pdf", 0, 0)).await,
            Err(Error::Validation(_))
        ));
        assert!(
            fx.coordinator
                .storage()
                .list_records()
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn failed_branch_marks_document_partial() {
        let fx = fixture();
        fx.stub.fail_images(true);

        let err = fx.coordinator.ingest(doc("a.pdf", 2, 2)).await.unwrap_err();
        match &err {
            Error::PartialFailure { stored, failed, .. } => {
                assert_eq!(*stored, "text");
                assert_eq!(*failed, "visual");
            }
            other => panic!("expected partial failure, got {other:?}"),
        }

        let doc_id = DocumentId::new("a.pdf");
        let record = fx
            .coordinator
            .storage()
            .get_record(doc_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.stage, Stage::Failed);
        assert!(record.partial);
        assert!(record.failure_reason.is_some());

        let stats = fx.coordinator.storage().get_storage_stats().await.unwrap();
        assert_eq!(stats.text.items, 2);
        assert_eq!(stats.visual.items, 0);
    }

    #[tokio::test]
    async fn failed_text_branch_keeps_pages_searchable() {
        let fx = fixture();
        fx.stub.fail_texts(true);

        let err = fx.coordinator.ingest(doc("a.pdf", 3, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::PartialFailure { stored: "visual", failed: "text", .. }
        ));

        let hits = fx
            .coordinator
            .storage()
            .query_by_vector(Collection::Visual, vec![0.5; 4], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn single_branch_failure_is_not_partial() {
        let fx = fixture();
        fx.stub.fail_images(true);

        let err = fx.coordinator.ingest(doc("a.pdf", 2, 0)).await.unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));

        let record = fx
            .coordinator
            .storage()
            .get_record(DocumentId::new("a.pdf"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.stage, Stage::Failed);
        assert!(!record.partial);
    }

    #[tokio::test]
    async fn reingestion_replaces_items() {
        let fx = fixture();
        fx.coordinator.ingest(doc("a.pdf", 2, 1)).await.unwrap();
        fx.coordinator.ingest(doc("a.pdf", 2, 1)).await.unwrap();

        let stats = fx.coordinator.storage().get_storage_stats().await.unwrap();
        assert_eq!(stats.visual.items, 2);
        assert_eq!(stats.text.items, 1);
        assert_eq!(fx.coordinator.storage().list_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_failure_does_not_abort_others() {
        let fx = fixture();
        let outcomes = fx
            .coordinator
            .ingest_batch(vec![doc("a.pdf", 1, 0), doc("empty.pdf", 0, 0), doc("c.txt", 0, 3)])
            .await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].1.is_ok());
        assert!(outcomes[1].1.is_err());
        assert_eq!(outcomes[2].1.as_ref().unwrap().text_items, 3);
    }

    #[tokio::test]
    async fn delete_document_cascades() {
        let fx = fixture();
        let report = fx.coordinator.ingest(doc("a.pdf", 2, 2)).await.unwrap();

        assert!(fx.coordinator.delete_document(report.doc_id).await.unwrap());
        assert!(!fx.coordinator.delete_document(report.doc_id).await.unwrap());

        let stats = fx.coordinator.storage().get_storage_stats().await.unwrap();
        assert_eq!(stats.total_items(), 0);
        assert!(
            fx.coordinator
                .storage()
                .get_record(report.doc_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn cancelled_job_stops_between_stages() {
        let fx = fixture();
        // Hold the document lock so the job parks before Parsing.
        let doc_id = DocumentId::new("a.pdf");
        let lock = fx.coordinator.doc_lock(doc_id);
        let guard = lock.lock().await;

        let handle = fx.coordinator.submit(doc("a.pdf", 1, 1)).await.unwrap();
        handle.cancel();
        drop(guard);

        assert!(matches!(handle.wait().await, Err(Error::Cancelled(id)) if id == doc_id));
        let record = fx
            .coordinator
            .storage()
            .get_record(doc_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.stage, Stage::Failed);
        assert_eq!(
            fx.coordinator
                .storage()
                .get_storage_stats()
                .await
                .unwrap()
                .total_items(),
            0
        );
    }

    #[tokio::test]
    async fn document_locks_are_forgotten_when_idle() {
        let fx = fixture();
        let report = fx.coordinator.ingest(doc("a.pdf", 1, 1)).await.unwrap();
        fx.coordinator.ingest(doc("b.pdf", 1, 0)).await.unwrap();
        fx.coordinator.delete_document(report.doc_id).await.unwrap();

        assert!(fx.coordinator.inner.doc_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_job_leaves_document_failed() {
        let fx = fixture();
        let parsed = doc("a.pdf", 1, 1);
        let doc_id = parsed.doc_id();
        let mut record = DocumentRecord::queued(&parsed).unwrap();
        record.stage = Stage::Embedding;
        fx.coordinator.storage().put_record(record).await.unwrap();
        let mut events = fx.coordinator.subscribe();

        let err = fx
            .coordinator
            .abort_job(doc_id, "task panicked".into())
            .await;
        assert!(matches!(err, Error::JobFailed { doc_id: id, .. } if id == doc_id));

        let record = fx
            .coordinator
            .storage()
            .get_record(doc_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.stage, Stage::Failed);
        assert!(record.failure_reason.unwrap().contains("task panicked"));
        assert_eq!(events.try_recv().unwrap().stage, Stage::Failed);
        assert!(fx.coordinator.inner.doc_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panicked_job_task_reports_job_failed() {
        let doc_id = DocumentId::new("a.pdf");
        let handle = JobHandle {
            doc_id,
            cancel: Arc::new(AtomicBool::new(false)),
            task: tokio::spawn(async { panic!("job exploded") }),
        };
        assert!(matches!(
            handle.wait().await,
            Err(Error::JobFailed { doc_id: id, .. }) if id == doc_id
        ));
    }
}
