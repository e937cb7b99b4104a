//! Multi-vector embeddings and the embedding engine seam.
//!
//! [`EmbeddingEngine`] is the narrow interface over an external
//! late-interaction model. Engines are stateful and expensive, so callers
//! never touch them directly: they go through an [`EnginePool`], which
//! holds one handle per accelerator and runs inference on the blocking
//! thread pool, one call per handle at a time.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
};

use candle_core::{Device, Tensor};
use tokio::sync::Semaphore;

use crate::{
    config::Precision,
    document::PageImage,
    error::{Error, Result},
    item::ItemId,
    reranker::{self, RankedItem},
};

/// An ordered sequence of token embeddings, all of the same dimension.
///
/// Stored flat in row-major order: `data[token * dimension + d]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiVector {
    num_tokens: usize,
    dimension: usize,
    data: Vec<f32>,
}

impl MultiVector {
    /// Build from flat row-major data. Rejects empty sequences and data
    /// whose length is not `num_tokens * dimension`.
    pub fn new(num_tokens: usize, dimension: usize, data: Vec<f32>) -> Result<Self> {
        if num_tokens == 0 || dimension == 0 {
            return Err(Error::Validation(format!(
                "multi-vector must have at least one token and one dimension \
                 (got {num_tokens} tokens of dimension {dimension})"
            )));
        }
        if data.len() != num_tokens * dimension {
            return Err(Error::Validation(format!(
                "multi-vector data length {} does not equal {num_tokens} tokens * {dimension} dims",
                data.len()
            )));
        }
        Ok(Self {
            num_tokens,
            dimension,
            data,
        })
    }

    /// Build from one `Vec` per token. Every token must have the same
    /// dimension.
    pub fn from_tokens(tokens: Vec<Vec<f32>>) -> Result<Self> {
        let num_tokens = tokens.len();
        let dimension = tokens.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = tokens.iter().position(|t| t.len() != dimension) {
            return Err(Error::Validation(format!(
                "token {bad} has dimension {} but token 0 has {dimension}",
                tokens[bad].len()
            )));
        }
        let data = tokens.into_iter().flatten().collect();
        Self::new(num_tokens, dimension, data)
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// The embedding vector for a specific token.
    pub fn token(&self, index: usize) -> &[f32] {
        let start = index * self.dimension;
        &self.data[start..start + self.dimension]
    }

    pub fn tokens(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimension)
    }

    /// The single vector that stands in for the whole sequence in the
    /// approximate index: the first token. Queries and items both go
    /// through this method so the two sides always agree.
    pub fn representative(&self) -> &[f32] {
        self.token(0)
    }

    /// Convert into a 2D tensor `[tokens, dimension]` on `device`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_slice(&self.data, (self.num_tokens, self.dimension), device)
            .map_err(map_candle_err)
    }

    /// Convert a 2D tensor `[tokens, dimension]` into a multi-vector.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let (num_tokens, dimension) = tensor.dims2().map_err(|e| {
            Error::Embedding(format!("unexpected embedding tensor shape: {e}"))
        })?;
        let data = tensor
            .flatten_all()
            .and_then(|t| t.to_dtype(candle_core::DType::F32))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(map_candle_err)?;
        Self::new(num_tokens, dimension, data)
    }
}

pub(crate) fn map_candle_err(e: candle_core::Error) -> Error {
    Error::Embedding(format!("tensor computation error: {e}"))
}

/// The contract every embedding backend fulfils.
///
/// Implementations may keep mutable state (lazy model loading, caches),
/// hence `&mut self`. They are driven from blocking threads, so they must
/// be `Send`.
pub trait EmbeddingEngine: Send {
    /// Identifier of the underlying model, for logs and status output.
    fn model_id(&self) -> &str;

    /// Encode rendered page images, one multi-vector per image.
    fn embed_images(&mut self, images: &[PageImage]) -> Result<Vec<MultiVector>>;

    /// Encode text passages, one multi-vector per passage.
    fn embed_texts(&mut self, texts: &[String]) -> Result<Vec<MultiVector>>;

    /// Encode a search query.
    fn embed_query(&mut self, query: &str) -> Result<MultiVector>;

    /// Late-interaction score of `candidate` against `query`, used by
    /// Stage 2. Defaults to summed MaxSim over dot products.
    fn score_multi_vector(
        &self,
        query: &MultiVector,
        candidate: &MultiVector,
        precision: Precision,
    ) -> Result<f32> {
        reranker::maxsim(query, candidate, precision)
    }
}

/// A bounded pool of embedding engine handles.
///
/// The semaphore is sized to the number of handles, and a handle goes
/// back on the free list before its permit is released, so a caller that
/// holds a permit always finds a free handle.
pub struct EnginePool {
    free: Arc<StdMutex<Vec<Box<dyn EmbeddingEngine>>>>,
    permits: Arc<Semaphore>,
    model_id: String,
    size: usize,
}

impl EnginePool {
    /// Build a pool from one handle per accelerator.
    pub fn new(handles: Vec<Box<dyn EmbeddingEngine>>) -> Result<Self> {
        let Some(first) = handles.first() else {
            return Err(Error::Config(
                "embedding pool needs at least one engine handle".to_string(),
            ));
        };
        let model_id = first.model_id().to_string();
        let size = handles.len();
        Ok(Self {
            free: Arc::new(StdMutex::new(handles)),
            permits: Arc::new(Semaphore::new(size)),
            model_id,
            size,
        })
    }

    /// A pool around a single engine (single-device deployments).
    pub fn single(engine: impl EmbeddingEngine + 'static) -> Self {
        let model_id = engine.model_id().to_string();
        Self {
            free: Arc::new(StdMutex::new(vec![Box::new(engine)])),
            permits: Arc::new(Semaphore::new(1)),
            model_id,
            size: 1,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` against an exclusively checked-out engine handle on the
    /// blocking thread pool.
    ///
    /// The blocking task owns both the handle and the permit and returns
    /// them itself, so dropping the returned future (a caller timeout, a
    /// disconnected client) never loses a handle. A panicking engine is
    /// caught and reported as [`Error::Embedding`]; its handle goes back
    /// to the pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn EmbeddingEngine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Embedding("embedding pool is shut down".to_string()))?;

        let mut handle = lock_free(&self.free).pop().ok_or_else(|| {
            Error::Embedding("no embedding engine handle available".to_string())
        })?;

        let free = Arc::clone(&self.free);
        let joined = tokio::task::spawn_blocking(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(handle.as_mut())));
            lock_free(&free).push(handle);
            drop(permit);
            outcome
        })
        .await;

        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => {
                let reason = panic_message(payload.as_ref());
                tracing::warn!(%reason, "embedding engine panicked");
                Err(Error::Embedding(format!("inference panicked: {reason}")))
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding task did not complete");
                Err(Error::Embedding(format!("inference task failed: {e}")))
            }
        }
    }

    /// Stage 2 scoring: score every candidate against `query` with the
    /// engine's [`EmbeddingEngine::score_multi_vector`] and rank them.
    pub async fn rerank(
        &self,
        query: MultiVector,
        candidates: Vec<(ItemId, MultiVector)>,
        precision: Precision,
    ) -> Result<Vec<RankedItem>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        self.run(move |engine| {
            reranker::rerank(&query, &candidates, |candidate| {
                engine.score_multi_vector(&query, candidate, precision)
            })
        })
        .await
    }

    pub async fn embed_images(&self, images: Vec<PageImage>) -> Result<Vec<MultiVector>> {
        if images.is_empty() {
            return Err(Error::Validation("no images to embed".to_string()));
        }
        let expected = images.len();
        let out = self.run(move |engine| engine.embed_images(&images)).await?;
        check_batch_len(expected, out)
    }

    pub async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<MultiVector>> {
        if texts.is_empty() {
            return Err(Error::Validation("no texts to embed".to_string()));
        }
        let expected = texts.len();
        let out = self.run(move |engine| engine.embed_texts(&texts)).await?;
        check_batch_len(expected, out)
    }

    pub async fn embed_query(&self, query: &str) -> Result<MultiVector> {
        if query.trim().is_empty() {
            return Err(Error::Validation("query is empty".to_string()));
        }
        let query = query.to_string();
        self.run(move |engine| engine.embed_query(&query)).await
    }
}

fn lock_free(
    free: &StdMutex<Vec<Box<dyn EmbeddingEngine>>>,
) -> MutexGuard<'_, Vec<Box<dyn EmbeddingEngine>>> {
    // The list is only pushed to and popped from, so a poisoned lock
    // still holds a consistent vector.
    free.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn check_batch_len(expected: usize, out: Vec<MultiVector>) -> Result<Vec<MultiVector>> {
    if out.len() != expected {
        return Err(Error::Embedding(format!(
            "engine returned {} embeddings for {expected} inputs",
            out.len()
        )));
    }
    Ok(out)
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("model_id", &self.model_id)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
