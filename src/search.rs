use std::sync::Arc;

use serde::Serialize;

use crate::{
    config::{EngineConfig, Precision},
    doc_id::DocumentId,
    embedding::{EnginePool, MultiVector},
    error::{Error, Result},
    item::{Collection, ItemId, SourceRef},
    reranker::RankedItem,
    storage::Storage,
};

/// Which collections a query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    #[default]
    Hybrid,
    VisualOnly,
    TextOnly,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    pub top_k: usize,
    /// Drop results whose final score is below this.
    pub min_score: Option<f32>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, mode: SearchMode, top_k: usize) -> Self {
        Self {
            query: query.into(),
            mode,
            top_k,
            min_score: None,
        }
    }
}

/// A final search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub rank: usize,
    pub doc_id: DocumentId,
    pub item_id: ItemId,
    pub collection: Collection,
    pub source_ref: SourceRef,
    /// Stage 1 score against the representative vector.
    pub approx_score: f32,
    /// Stage 2 MaxSim score; results are ordered by this.
    pub score: f32,
}

/// A Stage 1 hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub item_id: ItemId,
    pub collection: Collection,
    pub approx_score: f32,
}

/// Two-stage retrieval: approximate search over representative vectors,
/// then MaxSim re-ranking of the surviving candidates.
#[derive(Debug, Clone)]
pub struct SearchEngine {
    storage: Storage,
    engines: Arc<EnginePool>,
    candidate_limit: usize,
    precision: Precision,
}

impl SearchEngine {
    pub fn new(storage: Storage, engines: Arc<EnginePool>, config: &EngineConfig) -> Self {
        Self {
            storage,
            engines,
            candidate_limit: config.candidate_limit,
            precision: config.precision,
        }
    }

    pub fn candidate_limit(&self) -> usize {
        self.candidate_limit
    }

    /// Execute the full search pipeline.
    ///
    /// 1. Embed the query
    /// 2. Stage 1: nearest representative vectors, up to N per collection;
    ///    in hybrid mode the two lists are merged and capped at N
    /// 3. Stage 2: MaxSim over each candidate's full sequence
    /// 4. Filter by `min_score`
    /// 5. Limit to `min(top_k, N)` results
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        if request.top_k == 0 {
            return Err(Error::Validation("top_k must be at least 1".to_string()));
        }

        let query = self.embed_query(&request.query).await?;
        let candidates = self
            .stage_one(query.representative(), request.mode)
            .await?;
        tracing::debug!(
            mode = ?request.mode,
            candidates = candidates.len(),
            "stage 1 complete"
        );
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let results = self.stage_two(query, candidates).await?;

        let limit = request.top_k.min(self.candidate_limit);
        Ok(results
            .into_iter()
            .filter(|r| request.min_score.is_none_or(|min| r.score >= min))
            .take(limit)
            .enumerate()
            .map(|(i, mut r)| {
                r.rank = i + 1;
                r
            })
            .collect())
    }

    async fn embed_query(&self, query: &str) -> Result<MultiVector> {
        self.engines.embed_query(query).await.map_err(|e| match e {
            Error::Validation(_) => e,
            other => Error::QueryEmbedding(other.to_string()),
        })
    }

    /// Approximate retrieval. Results are ordered by approximate score
    /// descending, ties by ascending item ID, and never exceed N.
    pub async fn stage_one(
        &self,
        representative: &[f32],
        mode: SearchMode,
    ) -> Result<Vec<Candidate>> {
        let mut merged = match mode {
            SearchMode::Hybrid => {
                let (visual, text) = tokio::join!(
                    self.query_collection(Collection::Visual, representative),
                    self.query_collection(Collection::Text, representative),
                );
                let mut merged = visual?;
                merged.extend(text?);
                merged
            }
            SearchMode::VisualOnly => {
                self.query_collection(Collection::Visual, representative)
                    .await?
            }
            SearchMode::TextOnly => {
                self.query_collection(Collection::Text, representative)
                    .await?
            }
        };

        merged.sort_by(|a, b| {
            b.approx_score
                .partial_cmp(&a.approx_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.item_id.cmp(&b.item_id))
        });
        merged.truncate(self.candidate_limit);
        Ok(merged)
    }

    async fn query_collection(
        &self,
        collection: Collection,
        representative: &[f32],
    ) -> Result<Vec<Candidate>> {
        let hits = self
            .storage
            .query_by_vector(collection, representative.to_vec(), self.candidate_limit)
            .await
            .map_err(|e| match e {
                Error::Storage(_) => e,
                other => Error::Storage(format!(
                    "stage 1 over the {collection} collection failed: {other}"
                )),
            })?;
        Ok(hits
            .into_iter()
            .map(|(item_id, approx_score)| Candidate {
                item_id,
                collection,
                approx_score,
            })
            .collect())
    }

    /// Fetch full sequences and re-rank them with the engine's
    /// late-interaction score. Candidates deleted since Stage 1 are
    /// skipped.
    async fn stage_two(
        &self,
        query: MultiVector,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<SearchResult>> {
        let ids: Vec<ItemId> = candidates.iter().map(|c| c.item_id).collect();
        let loaded = self.storage.load_items(ids).await?;

        let mut by_id = std::collections::HashMap::with_capacity(loaded.len());
        let mut sequences = Vec::with_capacity(loaded.len());
        for (candidate, item) in candidates.into_iter().zip(loaded) {
            let Some(item) = item else {
                tracing::debug!(item_id = candidate.item_id, "candidate vanished before stage 2");
                continue;
            };
            sequences.push((item.item_id, item.sequence));
            by_id.insert(item.item_id, (candidate, item.doc_id, item.source_ref));
        }

        let ranked = self
            .engines
            .rerank(query, sequences, self.precision)
            .await?;

        Ok(ranked
            .into_iter()
            .filter_map(|RankedItem { item_id, score }| {
                by_id.remove(&item_id).map(|(candidate, doc_id, source_ref)| {
                    SearchResult {
                        rank: 0, // Set later
                        doc_id,
                        item_id,
                        collection: candidate.collection,
                        source_ref,
                        approx_score: candidate.approx_score,
                        score,
                    }
                })
            })
            .collect())
    }
}

/// Format results for human-readable terminal output.
pub fn format_human(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for r in results {
        println!(
            "{:>3}. [{:.3}] {} {} {}",
            r.rank, r.score, r.doc_id, r.collection, r.source_ref
        );
    }
    println!("\n{} result(s)", results.len());
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    query: &'a str,
    mode: SearchMode,
    result_count: usize,
    results: &'a [SearchResult],
}

/// Format results as JSON output.
pub fn format_json(results: &[SearchResult], query: &str, mode: SearchMode) -> Result<()> {
    let output = JsonOutput {
        query,
        mode,
        result_count: results.len(),
        results,
    };
    let json = serde_json::to_string(&output)
        .map_err(|e| Error::Validation(format!("failed to encode results: {e}")))?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config_db::ConfigDb,
        document::{DocumentRecord, FormatClass, Stage},
        item_store::{ItemStore, NewItem},
        test_support::StubEngine,
    };

    struct Fixture {
        _tmp: tempfile::TempDir,
        storage: Storage,
        stub: StubEngine,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let items = ItemStore::open(&tmp.path().join("items.redb")).unwrap();
            let config_db = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
            let storage = Storage::new(
                Arc::new(items),
                Arc::new(config_db),
                Duration::from_secs(5),
            );
            Self {
                _tmp: tmp,
                storage,
                stub: StubEngine::new(2),
            }
        }

        fn engine(&self, candidate_limit: usize) -> SearchEngine {
            let config = EngineConfig {
                candidate_limit,
                ..Default::default()
            };
            SearchEngine::new(
                self.storage.clone(),
                Arc::new(EnginePool::single(self.stub.clone())),
                &config,
            )
        }

        async fn put(
            &self,
            name: &str,
            collection: Collection,
            tokens: Vec<Vec<Vec<f32>>>,
        ) -> Vec<ItemId> {
            let now = chrono::Utc::now();
            let doc_id = DocumentId::new(name);
            self.storage
                .config_db()
                .put_document(&DocumentRecord {
                    doc_id,
                    filename: name.into(),
                    format_class: FormatClass::Hybrid,
                    date_added: now,
                    page_count: 0,
                    chunk_count: 0,
                    stage: Stage::Storing,
                    partial: false,
                    failure_reason: None,
                    updated_at: now,
                })
                .unwrap();
            let items = tokens
                .into_iter()
                .enumerate()
                .map(|(i, t)| NewItem {
                    sequence: MultiVector::from_tokens(t).unwrap(),
                    source_ref: match collection {
                        Collection::Visual => SourceRef::page(i as u32 + 1),
                        Collection::Text => SourceRef::chunk(i as u32, i * 10, i * 10 + 9),
                    },
                })
                .collect();
            self.storage
                .add_items(collection, doc_id, items)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn empty_store_returns_nothing() {
        let fx = Fixture::new();
        fx.stub.set_query("anything", vec![vec![1.0, 0.0]]);
        let results = fx
            .engine(100)
            .search(&SearchRequest::new("anything", SearchMode::Hybrid, 5))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn stage_two_reorders_stage_one() {
        let fx = Fixture::new();
        // Item 1 looks best by its first token, item 2 wins on MaxSim.
        let ids = fx
            .put(
                "a.pdf",
                Collection::Visual,
                vec![
                    vec![vec![1.0, 0.0], vec![0.0, 0.0]],
                    vec![vec![0.9, 0.1], vec![0.0, 1.0]],
                ],
            )
            .await;
        fx.stub.set_query("q", vec![vec![1.0, 0.0], vec![0.0, 1.0]]);

        let results = fx
            .engine(100)
            .search(&SearchRequest::new("q", SearchMode::VisualOnly, 5))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].item_id, ids[1]);
        assert_eq!(results[0].rank, 1);
        assert!((results[0].score - 1.9).abs() < 1e-5);
        assert!(results[1].approx_score > results[0].approx_score);
    }

    #[tokio::test]
    async fn stage_two_scores_with_the_engine() {
        let fx = Fixture::new();
        let ids = fx
            .put(
                "a.pdf",
                Collection::Visual,
                vec![vec![vec![1.0, 0.0]], vec![vec![0.0, 1.0]]],
            )
            .await;
        fx.stub.set_query("q", vec![vec![1.0, 0.0]]);
        fx.stub.set_score(Some(0.5));

        let results = fx
            .engine(100)
            .search(&SearchRequest::new("q", SearchMode::VisualOnly, 5))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.score == 0.5));
        // Equal engine scores fall back to item ID order.
        assert_eq!(results[0].item_id, ids[0]);
        assert_eq!(results[1].item_id, ids[1]);
        assert!(results[1].approx_score < 0.5);
    }

    #[tokio::test]
    async fn stage_one_caps_hybrid_merge_at_candidate_limit() {
        let fx = Fixture::new();
        fx.put(
            "v.pdf",
            Collection::Visual,
            vec![vec![vec![1.0, 0.0]], vec![vec![0.2, 0.0]], vec![vec![0.6, 0.0]]],
        )
        .await;
        fx.put(
            "t.txt",
            Collection::Text,
            vec![vec![vec![0.8, 0.0]], vec![vec![0.1, 0.0]]],
        )
        .await;

        let candidates = fx
            .engine(3)
            .stage_one(&[1.0, 0.0], SearchMode::Hybrid)
            .await
            .unwrap();
        let scores: Vec<f32> = candidates.iter().map(|c| c.approx_score).collect();
        assert_eq!(scores, vec![1.0, 0.8, 0.6]);
        assert_eq!(candidates[1].collection, Collection::Text);
    }

    #[tokio::test]
    async fn top_k_is_clamped_to_candidate_limit() {
        let fx = Fixture::new();
        fx.put(
            "a.pdf",
            Collection::Visual,
            (0..6).map(|i| vec![vec![1.0, i as f32 / 10.0]]).collect(),
        )
        .await;
        fx.stub.set_query("q", vec![vec![1.0, 0.0]]);

        let results = fx
            .engine(4)
            .search(&SearchRequest::new("q", SearchMode::VisualOnly, 50))
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
    }

    #[tokio::test]
    async fn min_score_filters_results() {
        let fx = Fixture::new();
        fx.put(
            "a.pdf",
            Collection::Text,
            vec![vec![vec![1.0, 0.0]], vec![vec![0.0, 1.0]]],
        )
        .await;
        fx.stub.set_query("q", vec![vec![1.0, 0.0]]);

        let mut request = SearchRequest::new("q", SearchMode::TextOnly, 10);
        request.min_score = Some(0.5);
        let results = fx.engine(100).search(&request).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn query_embedding_failure_is_reported() {
        let fx = Fixture::new();
        fx.stub.fail_queries(true);
        let err = fx
            .engine(100)
            .search(&SearchRequest::new("q", SearchMode::Hybrid, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueryEmbedding(_)));
    }

    #[tokio::test]
    async fn stage_one_dimension_mismatch_is_a_storage_error() {
        let fx = Fixture::new();
        fx.put("a.pdf", Collection::Visual, vec![vec![vec![1.0, 0.0, 0.0]]])
            .await;
        fx.stub.set_query("q", vec![vec![1.0, 0.0]]);
        let err = fx
            .engine(100)
            .search(&SearchRequest::new("q", SearchMode::VisualOnly, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn zero_top_k_is_rejected() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.engine(100)
                .search(&SearchRequest::new("q", SearchMode::Hybrid, 0))
                .await,
            Err(Error::Validation(_))
        ));
    }
}
