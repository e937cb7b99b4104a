use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU8, Ordering},
    },
};

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;
use redb::{
    Database,
    MultimapTableDefinition,
    ReadableDatabase,
    ReadableMultimapTable,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
    WriteTransaction,
};
use serde::Serialize;

use crate::{
    codec,
    doc_id::DocumentId,
    embedding::MultiVector,
    error::{Error, Result},
    item::{Collection, ItemId, SourceRef},
};

const VISUAL_ITEMS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("visual_items");
const TEXT_ITEMS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("text_items");
const VISUAL_BY_DOC: MultimapTableDefinition<u64, u64> =
    MultimapTableDefinition::new("visual_items_by_doc");
const TEXT_BY_DOC: MultimapTableDefinition<u64, u64> =
    MultimapTableDefinition::new("text_items_by_doc");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_ITEM_ID: &str = "next_item_id";

fn items_table(collection: Collection) -> TableDefinition<'static, u64, &'static [u8]> {
    match collection {
        Collection::Visual => VISUAL_ITEMS,
        Collection::Text => TEXT_ITEMS,
    }
}

fn by_doc_table(collection: Collection) -> MultimapTableDefinition<'static, u64, u64> {
    match collection {
        Collection::Visual => VISUAL_BY_DOC,
        Collection::Text => TEXT_BY_DOC,
    }
}

fn dimension_key(collection: Collection) -> &'static str {
    match collection {
        Collection::Visual => "dimension:visual",
        Collection::Text => "dimension:text",
    }
}

/// Fixed-size prefix of every item record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RecordHeader {
    doc_id: u64,
    dimension: u32,
    source_ref_len: u32,
}

const RECORD_HEADER_SIZE: usize = std::mem::size_of::<RecordHeader>();

/// Decides, exactly once, whether a write transaction commits or is
/// abandoned by a caller that stopped waiting for it.
///
/// The writer calls [`CommitGate::begin_commit`] right before committing;
/// a timed-out caller calls [`CommitGate::abandon`]. Whichever comes first
/// wins, so a caller told "timed out" never sees the write land later.
#[derive(Debug, Default)]
pub struct CommitGate(AtomicU8);

const GATE_OPEN: u8 = 0;
const GATE_COMMITTING: u8 = 1;
const GATE_ABANDONED: u8 = 2;

impl CommitGate {
    /// Claim the right to commit. False if the write was abandoned.
    pub fn begin_commit(&self) -> bool {
        self.0
            .compare_exchange(GATE_OPEN, GATE_COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Abandon the write. False if it is already committing.
    pub fn abandon(&self) -> bool {
        self.0
            .compare_exchange(GATE_OPEN, GATE_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn commit_gated(txn: WriteTransaction, gate: &CommitGate) -> Result<()> {
    if !gate.begin_commit() {
        txn.abort()?;
        return Err(Error::Storage(
            "write abandoned after its caller timed out".to_string(),
        ));
    }
    txn.commit()?;
    Ok(())
}

/// Persists items keyed by `(collection, item_id)`.
///
/// Binary format per item record:
/// - [`RecordHeader`] (16 bytes): owning doc ID, dimension D, length of
///   the source reference
/// - source reference as JSON
/// - D * 4 bytes: representative vector (f32, native endian)
/// - the compressed full sequence (see [`codec`])
///
/// A per-collection multimap from doc ID to item IDs makes cascading
/// deletes cheap. Representative vectors are also held in memory per
/// collection; Stage 1 scans those without touching the database.
pub struct ItemStore {
    db: Database,
    indexes: [RwLock<CollectionIndex>; 2],
}

#[derive(Debug, Default)]
struct CollectionIndex {
    dimension: Option<usize>,
    /// Representative vector per item.
    vectors: BTreeMap<ItemId, Vec<f32>>,
}

/// A fully decoded item, as needed for Stage 2.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    pub item_id: ItemId,
    pub collection: Collection,
    pub doc_id: DocumentId,
    pub source_ref: SourceRef,
    pub sequence: MultiVector,
}

/// An item to be written. The representative vector is derived from the
/// sequence on write.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub sequence: MultiVector,
    pub source_ref: SourceRef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionStats {
    pub items: u64,
    pub dimension: Option<usize>,
    /// Bytes of the uncompressed f32 sequences.
    pub raw_bytes: u64,
    /// Bytes of the compressed blobs.
    pub compressed_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStats {
    pub visual: CollectionStats,
    pub text: CollectionStats,
    /// Total raw bytes divided by total compressed bytes; `None` when
    /// nothing is stored.
    pub compression_ratio: Option<f64>,
}

impl StorageStats {
    pub fn collection(&self, collection: Collection) -> &CollectionStats {
        match collection {
            Collection::Visual => &self.visual,
            Collection::Text => &self.text,
        }
    }

    pub fn total_items(&self) -> u64 {
        self.visual.items + self.text.items
    }
}

impl ItemStore {
    /// Open or create an item database at the given path, loading every
    /// representative vector into the in-memory index.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        for collection in Collection::ALL {
            txn.open_table(items_table(collection))?;
            txn.open_multimap_table(by_doc_table(collection))?;
        }
        txn.open_table(META)?;
        txn.commit()?;

        let store = Self {
            db,
            indexes: Default::default(),
        };
        store.load_indexes()?;
        Ok(store)
    }

    fn load_indexes(&self) -> Result<()> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META)?;
        for collection in Collection::ALL {
            let table = txn.open_table(items_table(collection))?;
            let mut index = CollectionIndex {
                dimension: meta
                    .get(dimension_key(collection))?
                    .map(|v| v.value() as usize),
                vectors: BTreeMap::new(),
            };
            for entry in table.iter()? {
                let (k, v) = entry?;
                let item_id = k.value();
                let record = Record::parse(item_id, v.value())?;
                index.vectors.insert(item_id, record.representative);
            }
            tracing::debug!(
                collection = %collection,
                items = index.vectors.len(),
                "loaded representative index"
            );
            *self.write_index(collection)? = index;
        }
        Ok(())
    }

    fn read_index(
        &self,
        collection: Collection,
    ) -> Result<RwLockReadGuard<'_, CollectionIndex>> {
        self.indexes[collection.slot()]
            .read()
            .map_err(|_| Error::Storage("representative index lock poisoned".into()))
    }

    fn write_index(
        &self,
        collection: Collection,
    ) -> Result<RwLockWriteGuard<'_, CollectionIndex>> {
        self.indexes[collection.slot()]
            .write()
            .map_err(|_| Error::Storage("representative index lock poisoned".into()))
    }

    /// The pinned dimension of a collection, if anything was ever stored.
    pub fn dimension(&self, collection: Collection) -> Result<Option<usize>> {
        Ok(self.read_index(collection)?.dimension)
    }

    /// Store a single item. The representative vector must be the one
    /// derived from `sequence`.
    pub fn add_item(
        &self,
        collection: Collection,
        doc_id: DocumentId,
        representative: &[f32],
        sequence: MultiVector,
        source_ref: SourceRef,
    ) -> Result<ItemId> {
        self.add_item_gated(
            collection,
            doc_id,
            representative,
            sequence,
            source_ref,
            &CommitGate::default(),
        )
    }

    pub fn add_item_gated(
        &self,
        collection: Collection,
        doc_id: DocumentId,
        representative: &[f32],
        sequence: MultiVector,
        source_ref: SourceRef,
        gate: &CommitGate,
    ) -> Result<ItemId> {
        if representative.len() != sequence.dimension() {
            return Err(Error::Validation(format!(
                "representative vector has {} dims, sequence has {}",
                representative.len(),
                sequence.dimension()
            )));
        }
        if representative != sequence.representative() {
            return Err(Error::Validation(
                "representative vector is not the first token of the sequence"
                    .to_string(),
            ));
        }
        let ids = self.add_items_gated(
            collection,
            doc_id,
            vec![NewItem {
                sequence,
                source_ref,
            }],
            gate,
        )?;
        Ok(ids[0])
    }

    /// Store a batch of items for one document in a single transaction.
    /// Either every item is written or none is.
    pub fn add_items(
        &self,
        collection: Collection,
        doc_id: DocumentId,
        items: Vec<NewItem>,
    ) -> Result<Vec<ItemId>> {
        self.add_items_gated(collection, doc_id, items, &CommitGate::default())
    }

    /// [`ItemStore::add_items`], committing only if `gate` allows it.
    pub fn add_items_gated(
        &self,
        collection: Collection,
        doc_id: DocumentId,
        items: Vec<NewItem>,
        gate: &CommitGate,
    ) -> Result<Vec<ItemId>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        // Encode (and compress) outside the write transaction.
        let dimension = items[0].sequence.dimension();
        let mut encoded = Vec::with_capacity(items.len());
        for item in &items {
            if item.source_ref.collection() != collection {
                return Err(Error::Validation(format!(
                    "{} cannot be stored in the {collection} collection",
                    item.source_ref
                )));
            }
            if item.sequence.dimension() != dimension {
                return Err(Error::Validation(format!(
                    "batch mixes dimensions {dimension} and {}",
                    item.sequence.dimension()
                )));
            }
            encoded.push(Record::encode(doc_id, &item.sequence, &item.source_ref)?);
        }

        let txn = self.db.begin_write()?;
        let ids = {
            let mut meta = txn.open_table(META)?;
            let pinned = meta.get(dimension_key(collection))?.map(|v| v.value());
            match pinned {
                Some(pinned) if pinned as usize != dimension => {
                    return Err(Error::Validation(format!(
                        "{collection} collection holds {pinned}-dim vectors, got {dimension}"
                    )));
                }
                Some(_) => {}
                None => {
                    meta.insert(dimension_key(collection), dimension as u64)?;
                }
            }

            let first = meta.get(NEXT_ITEM_ID)?.map(|v| v.value()).unwrap_or(1);
            let count = encoded.len() as u64;
            meta.insert(NEXT_ITEM_ID, first + count)?;

            let mut table = txn.open_table(items_table(collection))?;
            let mut by_doc = txn.open_multimap_table(by_doc_table(collection))?;
            let ids: Vec<ItemId> = (first..first + count).collect();
            for (item_id, bytes) in ids.iter().zip(&encoded) {
                table.insert(*item_id, bytes.as_slice())?;
                by_doc.insert(doc_id.numeric(), *item_id)?;
            }
            ids
        };
        commit_gated(txn, gate)?;

        let mut index = self.write_index(collection)?;
        index.dimension.get_or_insert(dimension);
        for (item_id, item) in ids.iter().zip(items) {
            index
                .vectors
                .insert(*item_id, item.sequence.representative().to_vec());
        }

        Ok(ids)
    }

    /// Nearest representative vectors by dot product, best first. Ties are
    /// ordered by ascending item ID. Returns at most `top_n` entries; an
    /// empty collection yields an empty list.
    pub fn query_by_vector(
        &self,
        collection: Collection,
        query: &[f32],
        top_n: usize,
    ) -> Result<Vec<(ItemId, f32)>> {
        let index = self.read_index(collection)?;
        let Some(dimension) = index.dimension else {
            return Ok(Vec::new());
        };
        if index.vectors.is_empty() || top_n == 0 {
            return Ok(Vec::new());
        }
        if query.len() != dimension {
            return Err(Error::Validation(format!(
                "query vector has {} dims, {collection} collection holds {dimension}",
                query.len()
            )));
        }

        let mut scored: Vec<(ItemId, f32)> = index
            .vectors
            .par_iter()
            .map(|(item_id, vector)| (*item_id, dot(query, vector)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(top_n);
        Ok(scored)
    }

    /// Decompress and return an item's full sequence.
    pub fn get_full_sequence(&self, item_id: ItemId) -> Result<MultiVector> {
        self.get_item(item_id)?
            .map(|item| item.sequence)
            .ok_or_else(|| Error::NotFound {
                kind: "item",
                name: item_id.to_string(),
            })
    }

    /// Load one item from whichever collection holds it.
    pub fn get_item(&self, item_id: ItemId) -> Result<Option<StoredItem>> {
        Ok(self.load_items(&[item_id])?.pop().flatten())
    }

    /// Load multiple items in a single read transaction, preserving input
    /// order. Unknown IDs yield `None`; a damaged record is an error.
    pub fn load_items(&self, item_ids: &[ItemId]) -> Result<Vec<Option<StoredItem>>> {
        if item_ids.is_empty() {
            return Ok(Vec::new());
        }

        let txn = self.db.begin_read()?;
        let visual = txn.open_table(VISUAL_ITEMS)?;
        let text = txn.open_table(TEXT_ITEMS)?;

        let mut raw = Vec::with_capacity(item_ids.len());
        for &item_id in item_ids {
            let found = if let Some(guard) = visual.get(item_id)? {
                Some((Collection::Visual, guard.value().to_vec()))
            } else {
                text.get(item_id)?
                    .map(|guard| (Collection::Text, guard.value().to_vec()))
            };
            raw.push((item_id, found));
        }

        // Decompression is the expensive part; do it in parallel.
        raw.into_par_iter()
            .map(|(item_id, found)| {
                let Some((collection, bytes)) = found else {
                    return Ok(None);
                };
                let record = Record::parse(item_id, &bytes)?;
                if codec::dimension(record.blob) != Some(record.representative.len()) {
                    return Err(Error::Corruption {
                        item_id,
                        reason: "blob dimension disagrees with record header".to_string(),
                    });
                }
                let sequence = codec::decompress(record.blob).map_err(|e| {
                    Error::Corruption {
                        item_id,
                        reason: e.to_string(),
                    }
                })?;
                if sequence.representative() != record.representative.as_slice() {
                    return Err(Error::Corruption {
                        item_id,
                        reason: "representative vector disagrees with sequence"
                            .to_string(),
                    });
                }
                Ok(Some(StoredItem {
                    item_id,
                    collection,
                    doc_id: record.doc_id,
                    source_ref: record.source_ref,
                    sequence,
                }))
            })
            .collect()
    }

    /// All item IDs a document owns, per collection.
    pub fn items_for_doc(&self, doc_id: DocumentId) -> Result<Vec<(Collection, ItemId)>> {
        let txn = self.db.begin_read()?;
        let mut result = Vec::new();
        for collection in Collection::ALL {
            let by_doc = txn.open_multimap_table(by_doc_table(collection))?;
            for entry in by_doc.get(doc_id.numeric())? {
                result.push((collection, entry?.value()));
            }
        }
        Ok(result)
    }

    /// Remove every item a document owns, in both collections. Returns the
    /// number of items removed; removing an unknown document is a no-op.
    pub fn delete_by_doc_id(&self, doc_id: DocumentId) -> Result<usize> {
        self.delete_by_doc_id_gated(doc_id, &CommitGate::default())
    }

    /// [`ItemStore::delete_by_doc_id`], committing only if `gate` allows it.
    pub fn delete_by_doc_id_gated(&self, doc_id: DocumentId, gate: &CommitGate) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let removed = Self::delete_in_txn(&txn, doc_id)?;
        commit_gated(txn, gate)?;

        // Only the committed IDs leave the index; items a later write added
        // for the same document stay.
        let mut total = 0;
        for (collection, ids) in removed {
            let mut index = self.write_index(collection)?;
            for id in &ids {
                index.vectors.remove(id);
            }
            total += ids.len();
        }
        if total > 0 {
            tracing::debug!(doc = %doc_id, items = total, "deleted document items");
        }
        Ok(total)
    }

    fn delete_in_txn(
        txn: &WriteTransaction,
        doc_id: DocumentId,
    ) -> Result<Vec<(Collection, Vec<ItemId>)>> {
        let mut removed = Vec::new();
        for collection in Collection::ALL {
            let mut by_doc = txn.open_multimap_table(by_doc_table(collection))?;
            let mut ids = Vec::new();
            for entry in by_doc.remove_all(doc_id.numeric())? {
                ids.push(entry?.value());
            }
            let mut table = txn.open_table(items_table(collection))?;
            for id in &ids {
                table.remove(*id)?;
            }
            removed.push((collection, ids));
        }
        Ok(removed)
    }

    /// Per-collection counts and compression totals.
    pub fn stats(&self) -> Result<StorageStats> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META)?;
        let mut stats = StorageStats::default();

        for collection in Collection::ALL {
            let table = txn.open_table(items_table(collection))?;
            let mut cs = CollectionStats {
                items: table.len()?,
                dimension: meta
                    .get(dimension_key(collection))?
                    .map(|v| v.value() as usize),
                ..Default::default()
            };
            for entry in table.iter()? {
                let (k, v) = entry?;
                let record = Record::parse(k.value(), v.value())?;
                cs.compressed_bytes += record.blob.len() as u64;
                cs.raw_bytes += codec::raw_len(record.blob).unwrap_or(0) as u64;
            }
            match collection {
                Collection::Visual => stats.visual = cs,
                Collection::Text => stats.text = cs,
            }
        }

        let raw = stats.visual.raw_bytes + stats.text.raw_bytes;
        let compressed = stats.visual.compressed_bytes + stats.text.compressed_bytes;
        stats.compression_ratio =
            (compressed > 0).then(|| raw as f64 / compressed as f64);
        Ok(stats)
    }
}

impl std::fmt::Debug for ItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemStore").finish_non_exhaustive()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// A parsed item record borrowing its blob from the stored bytes.
struct Record<'a> {
    doc_id: DocumentId,
    source_ref: SourceRef,
    representative: Vec<f32>,
    blob: &'a [u8],
}

impl<'a> Record<'a> {
    fn encode(
        doc_id: DocumentId,
        sequence: &MultiVector,
        source_ref: &SourceRef,
    ) -> Result<Vec<u8>> {
        let source_json = serde_json::to_vec(source_ref).map_err(|e| {
            Error::Storage(format!("failed to encode source reference: {e}"))
        })?;
        let blob = codec::compress(sequence)?;
        let representative: &[u8] = bytemuck::cast_slice(sequence.representative());

        let header = RecordHeader {
            doc_id: doc_id.numeric(),
            dimension: sequence.dimension() as u32,
            source_ref_len: source_json.len() as u32,
        };

        let mut out = Vec::with_capacity(
            RECORD_HEADER_SIZE + source_json.len() + representative.len() + blob.len(),
        );
        out.extend_from_slice(bytemuck::bytes_of(&header));
        out.extend_from_slice(&source_json);
        out.extend_from_slice(representative);
        out.extend_from_slice(&blob);
        Ok(out)
    }

    fn parse(item_id: ItemId, bytes: &'a [u8]) -> Result<Self> {
        let corrupt = |reason: String| Error::Corruption { item_id, reason };

        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(corrupt(format!("record is only {} bytes", bytes.len())));
        }
        let header: RecordHeader =
            bytemuck::pod_read_unaligned(&bytes[..RECORD_HEADER_SIZE]);

        let vector_end = (header.dimension as usize)
            .checked_mul(4)
            .and_then(|n| n.checked_add(header.source_ref_len as usize))
            .and_then(|n| n.checked_add(RECORD_HEADER_SIZE))
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| corrupt("record shorter than its header claims".into()))?;
        let source_end = RECORD_HEADER_SIZE + header.source_ref_len as usize;

        let source_ref = serde_json::from_slice(&bytes[RECORD_HEADER_SIZE..source_end])
            .map_err(|e| corrupt(format!("bad source reference: {e}")))?;
        let representative = bytes[source_end..vector_end]
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();

        Ok(Self {
            doc_id: DocumentId::from_raw(header.doc_id),
            source_ref,
            representative,
            blob: &bytes[vector_end..],
        })
    }
}
