use candle_core::Tensor;
use pylate_rs::ColBERT;

use crate::{
    config::DeviceChoice,
    document::PageImage,
    embedding::{EmbeddingEngine, MultiVector, map_candle_err},
    error::{Error, Result},
};

/// Manages the ColBERT model lifecycle, supporting lazy loading on first use.
pub struct ModelManager {
    model: Option<ColBERT>,
    model_id: String,
    device: DeviceChoice,
}

impl ModelManager {
    /// Creates a `ModelManager` for `model_id`. The model is not loaded
    /// until the first embedding call.
    pub fn new(model_id: impl Into<String>, device: DeviceChoice) -> Self {
        Self {
            model: None,
            model_id: model_id.into(),
            device,
        }
    }

    /// Returns `true` if the model has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Ensures the model is loaded, downloading from HuggingFace Hub if needed.
    fn ensure_loaded(&mut self) -> Result<&mut ColBERT> {
        if self.model.is_none() {
            let device = self.device.resolve();
            tracing::info!(model = %self.model_id, ?device, "loading ColBERT model");
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(device)
                .try_into()
                .map_err(|e| {
                    Error::Embedding(format!(
                        "failed to load model '{}': {e}",
                        self.model_id
                    ))
                })?;
            self.model = Some(colbert);
        }

        self.model
            .as_mut()
            .ok_or_else(|| Error::Embedding("model failed to load".to_string()))
    }

    /// Encodes texts into a `[batch, tokens, dim]` tensor.
    fn encode(&mut self, texts: &[String], is_query: bool) -> Result<Tensor> {
        let model = self.ensure_loaded()?;
        model
            .encode(texts, is_query)
            .map_err(|e| Error::Embedding(format!("encoding failed: {e}")))
    }
}

impl EmbeddingEngine for ModelManager {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    /// ColBERT text checkpoints have no vision tower.
    fn embed_images(&mut self, images: &[PageImage]) -> Result<Vec<MultiVector>> {
        Err(Error::Embedding(format!(
            "model '{}' cannot embed images ({} requested)",
            self.model_id,
            images.len()
        )))
    }

    fn embed_texts(&mut self, texts: &[String]) -> Result<Vec<MultiVector>> {
        let embeddings = self.encode(texts, false)?;

        // embeddings shape: [batch_size, num_tokens, dimension]
        let (batch_size, _, _) = embeddings.dims3().map_err(|e| {
            Error::Embedding(format!("unexpected embedding tensor shape: {e}"))
        })?;

        (0..batch_size)
            .map(|i| {
                let doc = embeddings.get(i).map_err(map_candle_err)?;
                MultiVector::from_tensor(&doc)
            })
            .collect()
    }

    fn embed_query(&mut self, query: &str) -> Result<MultiVector> {
        let embeddings = self.encode(&[query.to_string()], true)?;
        // Squeeze the batch dimension: [1, Q, D] -> [Q, D]
        let squeezed = embeddings.squeeze(0).map_err(map_candle_err)?;
        MultiVector::from_tensor(&squeezed)
    }
}
