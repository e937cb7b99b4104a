use candle_core::{DType, Device, Tensor};

use crate::{
    config::Precision,
    embedding::{MultiVector, map_candle_err},
    error::{Error, Result},
    item::ItemId,
};

/// A candidate with its late-interaction score.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedItem {
    pub item_id: ItemId,
    pub score: f32,
}

/// Score every candidate against the query with `score` and sort.
///
/// Dimensions are checked before scoring. The result is ordered by score
/// descending; equal scores are ordered by ascending item ID so the
/// ranking is deterministic. Any scoring failure fails the whole call.
pub fn rerank<F>(
    query: &MultiVector,
    candidates: &[(ItemId, MultiVector)],
    score: F,
) -> Result<Vec<RankedItem>>
where
    F: Fn(&MultiVector) -> Result<f32>,
{
    let mut ranked: Vec<RankedItem> = candidates
        .iter()
        .map(|(item_id, sequence)| {
            check_dims(query, sequence)?;
            Ok(RankedItem {
                item_id: *item_id,
                score: score(sequence)?,
            })
        })
        .collect::<Result<_>>()?;

    sort_ranked(&mut ranked);
    Ok(ranked)
}

/// Order by score descending, then item ID ascending.
pub fn sort_ranked(ranked: &mut [RankedItem]) {
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.item_id.cmp(&b.item_id))
    });
}

/// Compute the MaxSim score between a query and a candidate sequence.
///
/// MaxSim = sum over query tokens of max(query_token . doc_token for all
/// doc tokens). Embeddings from the model are L2-normalised, so the dot
/// product equals cosine similarity and each per-token term is at most 1.
pub fn maxsim(
    query: &MultiVector,
    candidate: &MultiVector,
    precision: Precision,
) -> Result<f32> {
    check_dims(query, candidate)?;
    let q = query.to_tensor(&Device::Cpu)?;
    let d = candidate.to_tensor(&Device::Cpu)?;
    maxsim_tensor(&q, &d, precision)
}

fn check_dims(query: &MultiVector, candidate: &MultiVector) -> Result<()> {
    if query.dimension() != candidate.dimension() {
        return Err(Error::Validation(format!(
            "query dimension {} does not match candidate dimension {}",
            query.dimension(),
            candidate.dimension()
        )));
    }
    Ok(())
}

/// query: [Q, D], doc: [T, D].
fn maxsim_tensor(
    query: &Tensor,
    doc: &Tensor,
    precision: Precision,
) -> Result<f32> {
    let (query, doc) = match precision {
        Precision::Full => (query.clone(), doc.clone()),
        Precision::Half => (
            query.to_dtype(DType::F16).map_err(map_candle_err)?,
            doc.to_dtype(DType::F16).map_err(map_candle_err)?,
        ),
    };

    // Similarity matrix [Q, T] = query @ doc^T
    let sim_matrix = query
        .matmul(&doc.t().map_err(map_candle_err)?)
        .map_err(map_candle_err)?;

    // Best document token per query token, summed.
    let row_maxes = sim_matrix
        .max(1)
        .and_then(|t| t.to_dtype(DType::F32))
        .map_err(map_candle_err)?;

    row_maxes
        .sum_all()
        .and_then(|t| t.to_scalar::<f32>())
        .map_err(map_candle_err)
}
